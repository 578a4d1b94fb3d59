use std::fmt::{Debug, Display};
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::GridlockAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct GridlockHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<GridlockQueryParser>,
}

impl GridlockHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(GridlockQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Run one command and record its latency and outcome.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertSchedule { id, name, days, slots } => {
                engine
                    .create_schedule(id, name, days, slots)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(1)))
            }
            Command::DeleteSchedule { id } => {
                engine.delete_schedule(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertResource { kind, id, name } => {
                engine.create_resource(kind, id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(1)))
            }
            Command::DeleteResource { kind, id } => {
                engine.delete_resource(kind, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::CommitTimetable { schedule_id, allocation, returning } => {
                let summary = engine
                    .commit_timetable(schedule_id, &allocation)
                    .await
                    .map_err(engine_err)?;
                if !returning {
                    return Ok(Response::Execution(
                        Tag::new("INSERT").with_oid(0).with_rows(summary.created),
                    ));
                }
                let schema = Arc::new(commit_summary_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(summary.created as i64))?;
                encoder.encode_field(&pg_array(&summary.sections))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::RevertTimetable { schedule_id } => {
                let summary = engine.revert_timetable(schedule_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(summary.deleted)))
            }
            Command::SelectSchedules => {
                let schema = Arc::new(schedules_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_schedules()
                    .await
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&s.days)?;
                        encoder.encode_field(&s.slots)?;
                        encoder.encode_field(&(s.entry_count as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectResources { kind } => {
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_resources(kind)
                    .await
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.key.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&pg_array(&r.availability))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectTimetableEntries { schedule_id } => {
                let entries = engine
                    .list_timetable_entries(schedule_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(entries_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.schedule_id.to_string())?;
                        encoder.encode_field(&e.section_id)?;
                        encoder.encode_field(&e.course_id)?;
                        encoder.encode_field(&pg_array(&e.faculty_ids))?;
                        encoder.encode_field(&pg_array(&e.room_ids))?;
                        encoder.encode_field(&(e.day as i64))?;
                        encoder.encode_field(&(e.slot as i64))?;
                        encoder.encode_field(&(e.duration as i64))?;
                        encoder.encode_field(&e.kind.label().to_string())?;
                        encoder.encode_field(&e.slot_index.map(i64::from))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAvailability { schedule_id, key, cell } => {
                let cells = match cell {
                    Some((day, slot)) => {
                        let free = engine
                            .is_free(key, schedule_id, day, slot)
                            .await
                            .map_err(engine_err)?;
                        vec![SlotAvailability { day, slot, free }]
                    }
                    None => engine
                        .slot_availability(key, schedule_id)
                        .await
                        .map_err(engine_err)?,
                };
                let schema = Arc::new(availability_schema());
                let kind = key.kind.label().to_string();
                let id = key.id.to_string();
                let rows: Vec<PgWireResult<_>> = cells
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&kind)?;
                        encoder.encode_field(&id)?;
                        encoder.encode_field(&(c.day as i64))?;
                        encoder.encode_field(&(c.slot as i64))?;
                        encoder.encode_field(&c.free)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectGenerationRequest {
                schedule_id,
                faculty_ids,
                room_ids,
            } => {
                let request = engine
                    .generation_request(schedule_id, faculty_ids, room_ids)
                    .await
                    .map_err(engine_err)?;
                let json = request
                    .to_json()
                    .map_err(|e| user_error("XX000", format!("encoding request: {e}")))?;
                let schema = Arc::new(generation_request_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&json)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn schedules_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("days", Type::INT8),
        text_field("slots", Type::INT8),
        text_field("entry_count", Type::INT8),
    ]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("availability", Type::VARCHAR),
    ]
}

fn entries_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("schedule_id", Type::VARCHAR),
        text_field("section_id", Type::VARCHAR),
        text_field("course_id", Type::VARCHAR),
        text_field("faculty_ids", Type::VARCHAR),
        text_field("room_ids", Type::VARCHAR),
        text_field("day", Type::INT8),
        text_field("slot", Type::INT8),
        text_field("duration", Type::INT8),
        text_field("type", Type::VARCHAR),
        text_field("slot_index", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("kind", Type::VARCHAR),
        text_field("resource_id", Type::VARCHAR),
        text_field("day", Type::INT8),
        text_field("slot", Type::INT8),
        text_field("free", Type::BOOL),
    ]
}

fn commit_summary_schema() -> Vec<FieldInfo> {
    vec![
        text_field("created_count", Type::INT8),
        text_field("sections", Type::VARCHAR),
    ]
}

fn generation_request_schema() -> Vec<FieldInfo> {
    vec![text_field("request", Type::VARCHAR)]
}

/// Postgres array literal, e.g. `{0,1,1}`.
fn pg_array<T: Display>(items: &[T]) -> String {
    let inner: Vec<String> = items.iter().map(|i| i.to_string()).collect();
    format!("{{{}}}", inner.join(","))
}

/// Table a SELECT reads from, lowercased. Only used to describe result
/// columns before parameters are bound.
fn select_table(sql: &str) -> Option<String> {
    let mut tokens = sql.split_whitespace();
    if !tokens.next()?.eq_ignore_ascii_case("select") {
        return None;
    }
    tokens.by_ref().find(|t| t.eq_ignore_ascii_case("from"))?;
    let table = tokens
        .next()?
        .trim_matches(|c: char| c == '"' || c == ';')
        .to_ascii_lowercase();
    Some(table)
}

/// `INSERT INTO timetables ... RETURNING ...`, which answers with a row.
fn is_returning_commit(sql: &str) -> bool {
    let mut tokens = sql.split_whitespace();
    let insert_into = tokens.next().is_some_and(|t| t.eq_ignore_ascii_case("insert"))
        && tokens.next().is_some_and(|t| t.eq_ignore_ascii_case("into"));
    let into_timetables = tokens.next().is_some_and(|t| {
        t.trim_matches('"')
            .split('(')
            .next()
            .is_some_and(|name| name.eq_ignore_ascii_case("timetables"))
    });
    insert_into
        && into_timetables
        && sql.split_whitespace().any(|t| t.eq_ignore_ascii_case("returning"))
}

fn result_schema(sql: &str) -> Vec<FieldInfo> {
    if is_returning_commit(sql) {
        return commit_summary_schema();
    }
    match select_table(sql).as_deref() {
        Some("schedules") => schedules_schema(),
        Some("faculty") | Some("rooms") => resources_schema(),
        Some("timetable_entries") | Some("timetables") => entries_schema(),
        Some("availability") => availability_schema(),
        Some("generation_request") => generation_request_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for GridlockHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmds = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            responses.push(self.run(&engine, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct GridlockQueryParser;

#[async_trait]
impl QueryParser for GridlockQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for GridlockHandler {
    type Statement = String;
    type QueryParser = GridlockQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let params: Vec<Option<String>> = portal
            .parameters
            .iter()
            .map(|p| p.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()))
            .collect();
        let cmd = sql::parse_sql_with_params(&portal.statement.statement, &params)
            .map_err(sql_err)?;
        self.run(&engine, cmd).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement. Dollar-quoted bodies (`$$`,
/// `$tag$`) are skipped so JSON payloads containing `$1` do not count.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'\'' {
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start {
                    if let Ok(n) = sql[start..end].parse::<usize>() {
                        max = max.max(n);
                    }
                    i = end;
                    continue;
                }
                // Dollar-quote tag: `$` ident* `$`, then skip to the closing tag.
                while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
                    end += 1;
                }
                if end < bytes.len() && bytes[end] == b'$' {
                    let tag = &sql[i..=end];
                    match sql[end + 1..].find(tag) {
                        Some(pos) => i = end + 1 + pos + tag.len(),
                        None => i = bytes.len(),
                    }
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    max
}

// ── Factory ──────────────────────────────────────────────────────

pub struct GridlockFactory {
    handler: Arc<GridlockHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<GridlockAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl GridlockFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = GridlockAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(GridlockHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for GridlockFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = GridlockFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine failure. Validation failures, missing entities
/// and storage failures get distinct classes.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidAllocation(_) => "22023",
        EngineError::Configuration(_) => "F0000",
        EngineError::NotFound(_) => "P0002",
        EngineError::Persistence(_) => "58030",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InUse(_) => "23503",
        EngineError::LimitExceeded(_) => "54000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
