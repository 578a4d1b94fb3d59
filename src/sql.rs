use std::ops::ControlFlow;

use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan, visit_expressions_mut,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_IN_CLAUSE_IDS;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSchedule {
        id: Ulid,
        name: Option<String>,
        days: Option<i64>,
        slots: Option<i64>,
    },
    DeleteSchedule {
        id: Ulid,
    },
    InsertResource {
        kind: ResourceKind,
        id: Ulid,
        name: Option<String>,
    },
    DeleteResource {
        kind: ResourceKind,
        id: Ulid,
    },
    /// `INSERT INTO timetables`: replace a schedule's timetable with raw
    /// generation-service output. With `RETURNING`, the commit summary comes
    /// back as a row of `created_count` and `sections`.
    CommitTimetable {
        schedule_id: Ulid,
        allocation: String,
        returning: bool,
    },
    /// `DELETE FROM timetables`.
    RevertTimetable {
        schedule_id: Ulid,
    },
    SelectSchedules,
    SelectResources {
        kind: ResourceKind,
    },
    SelectTimetableEntries {
        schedule_id: Ulid,
    },
    SelectAvailability {
        schedule_id: Ulid,
        key: ResourceKey,
        /// `(day, slot)` when the query pins a single cell.
        cell: Option<(u32, u32)>,
    },
    SelectGenerationRequest {
        schedule_id: Ulid,
        faculty_ids: Option<Vec<Ulid>>,
        room_ids: Option<Vec<Ulid>>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    parse_sql_with_params(sql, &[])
}

/// Parse `sql`, binding `$n` placeholders to `params[n - 1]` (text format,
/// `None` = NULL). Binding happens on the syntax tree, so parameter text is
/// never re-lexed as SQL.
pub fn parse_sql_with_params(sql: &str, params: &[Option<String>]) -> Result<Command, SqlError> {
    let mut stmts = parse_statements(sql)?;
    let mut stmt = stmts.swap_remove(0);
    bind_params(&mut stmt, params)?;
    to_command(&stmt)
}

/// Every `;`-separated statement of a simple-protocol query, in order.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    parse_statements(sql)?.iter().map(to_command).collect()
}

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts)
}

fn to_command(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn bind_params(stmt: &mut Statement, params: &[Option<String>]) -> Result<(), SqlError> {
    let flow = visit_expressions_mut(stmt, |expr| {
        if let Expr::Value(ValueWithSpan { value: Value::Placeholder(p), .. }) = expr {
            let bound = p
                .strip_prefix('$')
                .and_then(|n| n.parse::<usize>().ok())
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| params.get(i));
            let Some(bound) = bound else {
                return ControlFlow::Break(p.clone());
            };
            let value = match bound {
                Some(text) => Value::SingleQuotedString(text.clone()),
                None => Value::Null,
            };
            *expr = Expr::Value(value.with_empty_span());
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(p) => Err(SqlError::Parse(format!("unbound parameter {p}"))),
        ControlFlow::Continue(()) => Ok(()),
    }
}

fn resource_table(table: &str) -> Option<ResourceKind> {
    match table {
        "faculty" => Some(ResourceKind::Faculty),
        "rooms" => Some(ResourceKind::Room),
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, columns): (&'static str, &[&str]) = match table.as_str() {
        "schedules" => ("schedules", &["id", "name", "days", "slots"]),
        "faculty" => ("faculty", &["id", "name"]),
        "rooms" => ("rooms", &["id", "name"]),
        "timetables" => ("timetables", &["schedule_id", "allocation"]),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = InsertRow::new(insert, table, columns)?;
    if insert.returning.is_some() && table != "timetables" {
        return Err(SqlError::Unsupported(format!("RETURNING on {table}")));
    }

    match table {
        "schedules" => Ok(Command::InsertSchedule {
            id: parse_ulid(row.required("id")?)?,
            name: row.get("name").map(parse_string_or_null).transpose()?.flatten(),
            days: row.get("days").map(parse_i64_or_null).transpose()?.flatten(),
            slots: row.get("slots").map(parse_i64_or_null).transpose()?.flatten(),
        }),
        "timetables" => Ok(Command::CommitTimetable {
            schedule_id: parse_ulid(row.required("schedule_id")?)?,
            allocation: parse_string(row.required("allocation")?)?,
            returning: insert.returning.is_some(),
        }),
        _ => Ok(Command::InsertResource {
            kind: if table == "faculty" { ResourceKind::Faculty } else { ResourceKind::Room },
            id: parse_ulid(row.required("id")?)?,
            name: row.get("name").map(parse_string_or_null).transpose()?.flatten(),
        }),
    }
}

/// A single VALUES row keyed by column name. Without an explicit column
/// list, values bind to the table's columns positionally.
struct InsertRow<'a> {
    table: &'static str,
    fields: Vec<(String, &'a Expr)>,
}

impl<'a> InsertRow<'a> {
    fn new(insert: &'a ast::Insert, table: &'static str, known: &[&str]) -> Result<Self, SqlError> {
        let values = single_values_row(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            known.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !known.contains(&c.as_str())) {
            return Err(SqlError::Parse(format!("unknown column {unknown} for {table}")));
        }
        Ok(Self {
            table,
            fields: columns.into_iter().zip(values.iter()).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.fields
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| *e)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or_else(|| {
            SqlError::Parse(format!("{}: missing value for {column}", self.table))
        })
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "schedules" => Ok(Command::DeleteSchedule {
            id: where_eq_ulid(&delete.selection, "id")?,
        }),
        "timetables" | "timetable_entries" => Ok(Command::RevertTimetable {
            schedule_id: where_eq_ulid(&delete.selection, "schedule_id")?,
        }),
        other => {
            let kind = resource_table(other).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
            Ok(Command::DeleteResource {
                kind,
                id: where_eq_ulid(&delete.selection, "id")?,
            })
        }
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "schedules" => Ok(Command::SelectSchedules),
        "faculty" => Ok(Command::SelectResources { kind: ResourceKind::Faculty }),
        "rooms" => Ok(Command::SelectResources { kind: ResourceKind::Room }),
        "timetable_entries" | "timetables" => Ok(Command::SelectTimetableEntries {
            schedule_id: filters.schedule_id()?,
        }),
        "availability" => {
            let schedule_id = filters.schedule_id()?;
            let key = match (single(&filters.faculty_ids)?, single(&filters.room_ids)?) {
                (Some(id), None) => ResourceKey::faculty(id),
                (None, Some(id)) => ResourceKey::room(id),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Parse(
                        "availability: filter on faculty_id or room_id, not both".into(),
                    ));
                }
                (None, None) => return Err(SqlError::MissingFilter("faculty_id or room_id")),
            };
            let cell = match (filters.day, filters.slot) {
                (Some(day), Some(slot)) => Some((day, slot)),
                (None, None) => None,
                (Some(_), None) => return Err(SqlError::MissingFilter("slot")),
                (None, Some(_)) => return Err(SqlError::MissingFilter("day")),
            };
            Ok(Command::SelectAvailability { schedule_id, key, cell })
        }
        "generation_request" => Ok(Command::SelectGenerationRequest {
            schedule_id: filters.schedule_id()?,
            faculty_ids: filters.faculty_ids,
            room_ids: filters.room_ids,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    schedule_id: Option<Ulid>,
    faculty_ids: Option<Vec<Ulid>>,
    room_ids: Option<Vec<Ulid>>,
    day: Option<u32>,
    slot: Option<u32>,
}

impl Filters {
    fn schedule_id(&self) -> Result<Ulid, SqlError> {
        self.schedule_id.ok_or(SqlError::MissingFilter("schedule_id"))
    }
}

fn single(ids: &Option<Vec<Ulid>>) -> Result<Option<Ulid>, SqlError> {
    match ids.as_deref() {
        None => Ok(None),
        Some([id]) => Ok(Some(*id)),
        Some(_) => Err(SqlError::Parse("expected a single id".into())),
    }
}

/// Walk an AND-chain of `col = value` and `col IN (...)` predicates.
fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_filters(left, filters)?;
            collect_filters(right, filters)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            match expr_column_name(left).as_deref() {
                Some("schedule_id") => filters.schedule_id = Some(parse_ulid(right)?),
                Some("faculty_id") => filters.faculty_ids = Some(vec![parse_ulid(right)?]),
                Some("room_id") => filters.room_ids = Some(vec![parse_ulid(right)?]),
                Some("day") => filters.day = Some(parse_u32(right)?),
                Some("slot") => filters.slot = Some(parse_u32(right)?),
                Some(other) => return Err(SqlError::Unsupported(format!("filter on {other}"))),
                None => return Err(SqlError::Unsupported(format!("predicate {expr}"))),
            }
            Ok(())
        }
        Expr::InList { expr: column, list, negated: false } => {
            if list.len() > MAX_IN_CLAUSE_IDS {
                return Err(SqlError::Parse(format!(
                    "IN list of {} ids exceeds {MAX_IN_CLAUSE_IDS}",
                    list.len()
                )));
            }
            let ids = list.iter().map(parse_ulid).collect::<Result<Vec<_>, _>>()?;
            match expr_column_name(column).as_deref() {
                Some("faculty_id") => filters.faculty_ids = Some(ids),
                Some("room_id") => filters.room_ids = Some(ids),
                _ => return Err(SqlError::Unsupported(format!("predicate {expr}"))),
            }
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn single_values_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn where_eq_ulid(selection: &Option<Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right })
            if expr_column_name(left).as_deref() == Some(column) =>
        {
            parse_ulid(right)
        }
        _ => Err(SqlError::MissingFilter(column)),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// Text of a string literal in any of the quoting styles clients use for
/// JSON payloads.
fn string_literal(value: &Value) -> Option<String> {
    match value {
        Value::SingleQuotedString(s)
        | Value::EscapedStringLiteral(s)
        | Value::DoubleQuotedString(s) => Some(s.clone()),
        Value::DollarQuotedString(d) => Some(d.value.clone()),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    let value = extract_value(expr).ok_or_else(|| SqlError::Parse(format!("expected value, got {expr}")))?;
    string_literal(value).ok_or_else(|| SqlError::Parse(format!("expected string, got {value}")))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = match extract_value(expr) {
        Some(Value::Number(s, _)) => s.clone(),
        Some(v) => string_literal(v)
            .ok_or_else(|| SqlError::Parse(format!("expected string, got {v}")))?,
        None => return Err(SqlError::Parse(format!("expected value, got {expr}"))),
    };
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(v) => Err(SqlError::Parse(format!("expected number, got {v}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_i64(expr).map(Some),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const S: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const F: &str = "01BX5ZZKBKACTAV9WEVGEMMVRY";
    const R: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn insert_schedule_positional() {
        let cmd = parse_sql(&format!("INSERT INTO schedules VALUES ('{S}', 'Fall', 5, 8)")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertSchedule {
                id: ulid(S),
                name: Some("Fall".into()),
                days: Some(5),
                slots: Some(8),
            }
        );
    }

    #[test]
    fn insert_schedule_named_columns_and_nulls() {
        let sql = format!("INSERT INTO schedules (slots, id, days) VALUES (6, '{S}', NULL)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertSchedule { id: ulid(S), name: None, days: None, slots: Some(6) }
        );
    }

    #[test]
    fn insert_schedule_unknown_column_rejected() {
        let sql = format!("INSERT INTO schedules (id, weeks) VALUES ('{S}', 3)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn insert_faculty_and_room() {
        assert_eq!(
            parse_sql(&format!("INSERT INTO faculty (id, name) VALUES ('{F}', 'Dr. A')")).unwrap(),
            Command::InsertResource {
                kind: ResourceKind::Faculty,
                id: ulid(F),
                name: Some("Dr. A".into()),
            }
        );
        assert_eq!(
            parse_sql(&format!("INSERT INTO rooms (id) VALUES ('{R}')")).unwrap(),
            Command::InsertResource { kind: ResourceKind::Room, id: ulid(R), name: None }
        );
    }

    #[test]
    fn delete_entities() {
        assert_eq!(
            parse_sql(&format!("DELETE FROM schedules WHERE id = '{S}'")).unwrap(),
            Command::DeleteSchedule { id: ulid(S) }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM rooms WHERE id = '{R}'")).unwrap(),
            Command::DeleteResource { kind: ResourceKind::Room, id: ulid(R) }
        );
    }

    #[test]
    fn commit_timetable_with_quoted_json() {
        let sql = format!(
            r#"INSERT INTO timetables (schedule_id, allocation) VALUES ('{S}', '{{"timetables": {{"S1": {{"days": [["it''s"]]}}}}}}')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::CommitTimetable { schedule_id, allocation, returning } => {
                assert_eq!(schedule_id, ulid(S));
                assert!(!returning);
                assert_eq!(allocation, r#"{"timetables": {"S1": {"days": [["it's"]]}}}"#);
            }
            other => panic!("expected CommitTimetable, got {other:?}"),
        }
    }

    #[test]
    fn commit_timetable_with_dollar_quoting() {
        let sql = format!(r#"INSERT INTO timetables VALUES ('{S}', $${{"timetables": {{}}}}$$)"#);
        match parse_sql(&sql).unwrap() {
            Command::CommitTimetable { allocation, .. } => {
                assert_eq!(allocation, r#"{"timetables": {}}"#);
            }
            other => panic!("expected CommitTimetable, got {other:?}"),
        }
    }

    #[test]
    fn commit_timetable_returning_summary() {
        let sql = format!(
            "INSERT INTO timetables VALUES ('{S}', '{{}}') RETURNING created_count, sections"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::CommitTimetable { returning: true, .. }
        ));

        let sql = format!("INSERT INTO faculty (id) VALUES ('{F}') RETURNING id");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn revert_timetable() {
        assert_eq!(
            parse_sql(&format!("DELETE FROM timetables WHERE schedule_id = '{S}'")).unwrap(),
            Command::RevertTimetable { schedule_id: ulid(S) }
        );
        assert!(matches!(
            parse_sql(&format!("DELETE FROM timetables WHERE id = '{S}'")),
            Err(SqlError::MissingFilter("schedule_id"))
        ));
    }

    #[test]
    fn select_listings() {
        assert_eq!(parse_sql("SELECT * FROM schedules").unwrap(), Command::SelectSchedules);
        assert_eq!(
            parse_sql("SELECT * FROM faculty").unwrap(),
            Command::SelectResources { kind: ResourceKind::Faculty }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM timetable_entries WHERE schedule_id = '{S}'")).unwrap(),
            Command::SelectTimetableEntries { schedule_id: ulid(S) }
        );
    }

    #[test]
    fn select_availability_grid_and_cell() {
        assert_eq!(
            parse_sql(&format!(
                "SELECT * FROM availability WHERE schedule_id = '{S}' AND faculty_id = '{F}'"
            ))
            .unwrap(),
            Command::SelectAvailability {
                schedule_id: ulid(S),
                key: ResourceKey::faculty(ulid(F)),
                cell: None,
            }
        );
        assert_eq!(
            parse_sql(&format!(
                "SELECT * FROM availability WHERE schedule_id = '{S}' AND room_id = '{R}' AND day = 1 AND slot = 4"
            ))
            .unwrap(),
            Command::SelectAvailability {
                schedule_id: ulid(S),
                key: ResourceKey::room(ulid(R)),
                cell: Some((1, 4)),
            }
        );
    }

    #[test]
    fn select_availability_needs_resource_and_full_cell() {
        assert!(matches!(
            parse_sql(&format!("SELECT * FROM availability WHERE schedule_id = '{S}'")),
            Err(SqlError::MissingFilter(_))
        ));
        assert!(matches!(
            parse_sql(&format!(
                "SELECT * FROM availability WHERE schedule_id = '{S}' AND room_id = '{R}' AND day = 1"
            )),
            Err(SqlError::MissingFilter("slot"))
        ));
    }

    #[test]
    fn select_generation_request_with_in_list() {
        let sql = format!(
            "SELECT * FROM generation_request WHERE schedule_id = '{S}' AND faculty_id IN ('{F}', '{R}')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectGenerationRequest {
                schedule_id: ulid(S),
                faculty_ids: Some(vec![ulid(F), ulid(R)]),
                room_ids: None,
            }
        );
    }

    #[test]
    fn params_bound_on_syntax_tree() {
        let payload = r#"{"note": "costs $1 and it's fine"}"#;
        let cmd = parse_sql_with_params(
            "INSERT INTO timetables (schedule_id, allocation) VALUES ($1, $2)",
            &[Some(S.to_string()), Some(payload.to_string())],
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::CommitTimetable {
                schedule_id: ulid(S),
                allocation: payload.to_string(),
                returning: false,
            }
        );
    }

    #[test]
    fn null_param_binds_null() {
        let cmd = parse_sql_with_params(
            "INSERT INTO schedules (id, name, days, slots) VALUES ($1, $2, $3, $4)",
            &[Some(S.to_string()), None, Some("5".into()), None],
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::InsertSchedule { id: ulid(S), name: None, days: Some(5), slots: None }
        );
    }

    #[test]
    fn unbound_param_rejected() {
        assert!(matches!(
            parse_sql_with_params("DELETE FROM schedules WHERE id = $2", &[Some(S.into())]),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn unknown_table_and_empty() {
        assert!(matches!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(parse_sql("").is_err());
    }

    #[test]
    fn batch_keeps_statement_order() {
        let cmds = parse_batch(&format!(
            "INSERT INTO schedules (id) VALUES ('{S}'); SELECT * FROM schedules;"
        ))
        .unwrap();
        assert_eq!(cmds.len(), 2);
        assert!(matches!(cmds[0], Command::InsertSchedule { .. }));
        assert_eq!(cmds[1], Command::SelectSchedules);
    }
}
