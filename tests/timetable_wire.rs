use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use gridlock::tenant::TenantManager;
use gridlock::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("gridlock_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "gridlock".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("gridlock")
        .password("gridlock");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn command_count(messages: &[SimpleQueryMessage]) -> Option<u64> {
    messages.iter().find_map(|m| match m {
        SimpleQueryMessage::CommandComplete(n) => Some(*n),
        _ => None,
    })
}

/// One schedule (default grid), one faculty member, one room.
async fn seed(client: &Client) -> (Ulid, Ulid, Ulid) {
    let (sid, f, r) = (Ulid::new(), Ulid::new(), Ulid::new());
    client
        .batch_execute(&format!(
            "INSERT INTO schedules (id, name) VALUES ('{sid}', 'Fall');
             INSERT INTO faculty (id, name) VALUES ('{f}', 'Dr. A');
             INSERT INTO rooms (id, name) VALUES ('{r}', 'R101');"
        ))
        .await
        .unwrap();
    (sid, f, r)
}

fn single_cell(f: Ulid, r: Ulid) -> String {
    format!(
        r#"{{"timetables":{{"S1":{{"sectionName":"S1","days":[[{{"courseid":"C1","facultyid":"{f}","roomid":"{r}","type":"theory"}}]]}}}}}}"#
    )
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|e| e.code().code().to_string())
        .unwrap_or_default()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn commit_then_query_over_simple_protocol() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "campus").await;
    let (sid, f, r) = seed(&client).await;

    let messages = client
        .simple_query(&format!(
            "INSERT INTO timetables (schedule_id, allocation) VALUES ('{sid}', $${}$$)",
            single_cell(f, r)
        ))
        .await
        .unwrap();
    assert_eq!(command_count(&messages), Some(1));

    let entries = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM timetable_entries WHERE schedule_id = '{sid}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].get("section_id"), Some("S1"));
    assert_eq!(entries[0].get("course_id"), Some("C1"));
    assert_eq!(entries[0].get("day"), Some("0"));
    assert_eq!(entries[0].get("slot"), Some("0"));
    assert_eq!(entries[0].get("type"), Some("theory"));

    let cell = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE schedule_id = '{sid}' AND faculty_id = '{f}' AND day = 0 AND slot = 0"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(cell.len(), 1);
    assert_eq!(cell[0].get("free"), Some("f"));

    let grid = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE schedule_id = '{sid}' AND room_id = '{r}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(grid.len(), 40);
    assert_eq!(grid.iter().filter(|row| row.get("free") == Some("f")).count(), 1);

    let faculty = rows(client.simple_query("SELECT * FROM faculty").await.unwrap());
    assert_eq!(faculty.len(), 1);
    let bits = faculty[0].get("availability").unwrap();
    assert!(bits.starts_with("{1,0"));
}

#[tokio::test]
async fn commit_returning_reports_sections() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "campus").await;
    let (sid, f, r) = seed(&client).await;

    let summary = rows(
        client
            .simple_query(&format!(
                "INSERT INTO timetables (schedule_id, allocation) VALUES ('{sid}', $${}$$) RETURNING created_count, sections",
                single_cell(f, r)
            ))
            .await
            .unwrap(),
    );
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].get("created_count"), Some("1"));
    assert_eq!(summary[0].get("sections"), Some("{S1}"));

    // Without RETURNING the same commit answers with a command tag only.
    let messages = client
        .simple_query(&format!(
            "INSERT INTO timetables VALUES ('{sid}', $${}$$)",
            single_cell(f, r)
        ))
        .await
        .unwrap();
    assert_eq!(command_count(&messages), Some(1));
    assert!(rows(messages).is_empty());
}

#[tokio::test]
async fn commit_and_revert_with_bound_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "campus").await;
    let (sid, f, r) = seed(&client).await;

    // Payload text is bound as a value, never re-parsed as SQL.
    let raw = format!(
        r#"{{"timetables":{{"S1":{{"days":[[{{"courseid":"C'1 $1","facultyid":"{f}","roomid":"{r}"}},null,"BREAK",{{"courseid":"C2","facultyid":"{f}"}}]]}}}}}}"#
    );
    let created = client
        .execute(
            "INSERT INTO timetables (schedule_id, allocation) VALUES ($1, $2)",
            &[&sid.to_string(), &raw],
        )
        .await
        .unwrap();
    assert_eq!(created, 2);

    let entries = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM timetable_entries WHERE schedule_id = '{sid}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(entries[0].get("course_id"), Some("C'1 $1"));

    let deleted = client
        .execute("DELETE FROM timetables WHERE schedule_id = $1", &[&sid.to_string()])
        .await
        .unwrap();
    assert_eq!(deleted, 2);

    let faculty = rows(client.simple_query("SELECT * FROM faculty").await.unwrap());
    assert!(!faculty[0].get("availability").unwrap().contains('1'));
}

#[tokio::test]
async fn errors_carry_distinct_sqlstates() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "campus").await;
    let (sid, f, _r) = seed(&client).await;

    let insert = "INSERT INTO timetables (schedule_id, allocation) VALUES ($1, $2)";

    let err = client
        .execute(insert, &[&sid.to_string(), &r#"{"foo":"bar"}"#])
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    let err = client
        .execute(insert, &[&Ulid::new().to_string(), &single_cell(f, Ulid::new())])
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");

    let err = client
        .batch_execute(&format!("INSERT INTO faculty (id) VALUES ('{f}')"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23505");

    let err = client.batch_execute("SELEKT nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");

    let bad_grid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO schedules (id, days, slots) VALUES ('{bad_grid}', 0, 8)"
        ))
        .await
        .unwrap();
    let err = client
        .execute(insert, &[&bad_grid.to_string(), &single_cell(f, Ulid::new())])
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "F0000");
}

#[tokio::test]
async fn referenced_faculty_cannot_be_deleted() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "campus").await;
    let (sid, f, r) = seed(&client).await;

    client
        .execute(
            "INSERT INTO timetables (schedule_id, allocation) VALUES ($1, $2)",
            &[&sid.to_string(), &single_cell(f, r)],
        )
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!("DELETE FROM faculty WHERE id = '{f}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23503");

    client
        .batch_execute(&format!(
            "DELETE FROM timetables WHERE schedule_id = '{sid}';
             DELETE FROM faculty WHERE id = '{f}';"
        ))
        .await
        .unwrap();
    let faculty = rows(client.simple_query("SELECT * FROM faculty").await.unwrap());
    assert!(faculty.is_empty());
}

#[tokio::test]
async fn generation_request_is_json() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "campus").await;
    let (sid, f, r) = seed(&client).await;

    client
        .execute(
            "INSERT INTO timetables (schedule_id, allocation) VALUES ($1, $2)",
            &[&sid.to_string(), &single_cell(f, r)],
        )
        .await
        .unwrap();

    let result = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM generation_request WHERE schedule_id = '{sid}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(result.len(), 1);
    let request: serde_json::Value =
        serde_json::from_str(result[0].get("request").unwrap()).unwrap();
    assert_eq!(request["days"], 5);
    assert_eq!(request["slots"], 8);
    assert_eq!(request["faculty"][0]["availability"][0], 1);
    assert_eq!(request["timetables"]["S1"]["days"][0][0]["courseid"], "C1");
}

#[tokio::test]
async fn tenants_are_separate_databases() {
    let (addr, _tm) = start_test_server().await;
    let a = connect(addr, "campus_a").await;
    let b = connect(addr, "campus_b").await;

    seed(&a).await;
    let schedules = rows(b.simple_query("SELECT * FROM schedules").await.unwrap());
    assert!(schedules.is_empty());
    let schedules = rows(a.simple_query("SELECT * FROM schedules").await.unwrap());
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].get("name"), Some("Fall"));
}
