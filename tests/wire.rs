use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use roombook::auth::ActorDirectory;
use roombook::engine::{now_ms, Engine};
use roombook::model::OverlapPolicy;
use roombook::wire::{self, RoombookFactory};

const HOUR: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roombook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine =
        Arc::new(Engine::new(dir.join("roombook.wal"), OverlapPolicy::Inclusive).unwrap());
    let actors = ActorDirectory::from_lists("admin", "mallory");
    let factory = Arc::new(RoombookFactory::new(engine, actors, "roombook".into()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("roombook")
        .user(user)
        .password("roombook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn error_code(client: &Client, sql: &str) -> SqlState {
    let err = client
        .batch_execute(sql)
        .await
        .expect_err("statement should fail");
    err.code().cloned().expect("server error with SQLSTATE")
}

async fn create_room(admin: &Client, name: &str) -> Ulid {
    let rid = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO rooms (id, name) VALUES ('{rid}', '{name}')"
        ))
        .await
        .unwrap();
    rid
}

fn insert_booking(id: Ulid, rid: Ulid, start: i64, end: i64) -> String {
    format!(r#"INSERT INTO bookings (id, room_id, start, "end") VALUES ('{id}', '{rid}', {start}, {end})"#)
}

/// Top of the hour, a day from now.
fn tomorrow() -> i64 {
    let now = now_ms();
    now - now % HOUR + 24 * HOUR
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_and_list_own_bookings() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let alice = connect(addr, "alice").await;
    let rid = create_room(&admin, "Alpha").await;

    let rooms = rows(&alice, "SELECT * FROM rooms").await;
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].get("name"), Some("Alpha"));

    let t = tomorrow();
    let bid = Ulid::new();
    alice
        .batch_execute(&insert_booking(bid, rid, t, t + HOUR))
        .await
        .unwrap();

    let mine = rows(&alice, "SELECT * FROM bookings WHERE owner_id = 'alice'").await;
    assert_eq!(mine.len(), 1);
    let id = bid.to_string();
    let start = t.to_string();
    let room = rid.to_string();
    assert_eq!(mine[0].get("id"), Some(id.as_str()));
    assert_eq!(mine[0].get("room_id"), Some(room.as_str()));
    assert_eq!(mine[0].get("start"), Some(start.as_str()));
    assert_eq!(mine[0].get("owner_id"), Some("alice"));

    let upcoming = rows(&alice, &format!("SELECT * FROM bookings WHERE room_id = '{rid}'")).await;
    assert_eq!(upcoming.len(), 1);
}

#[tokio::test]
async fn overlapping_booking_is_an_exclusion_violation() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let alice = connect(addr, "alice").await;
    let rid = create_room(&admin, "Alpha").await;

    let t = tomorrow();
    alice
        .batch_execute(&insert_booking(Ulid::new(), rid, t, t + HOUR))
        .await
        .unwrap();

    let code = error_code(&alice, &insert_booking(Ulid::new(), rid, t + HOUR, t + 2 * HOUR)).await;
    assert_eq!(code, SqlState::EXCLUSION_VIOLATION);

    let conflicts = rows(
        &alice,
        &format!(
            r#"SELECT * FROM conflicts WHERE room_id = '{rid}' AND start = {} AND "end" = {}"#,
            t + HOUR,
            t + 2 * HOUR
        ),
    )
    .await;
    assert_eq!(conflicts.len(), 1);
}

#[tokio::test]
async fn invalid_requests_map_to_sqlstates() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let rid = create_room(&admin, "Alpha").await;
    let t = tomorrow();

    // Inverted interval.
    let code = error_code(&admin, &insert_booking(Ulid::new(), rid, t + HOUR, t)).await;
    assert_eq!(code, SqlState::INVALID_PARAMETER_VALUE);

    // Start in the past.
    let past = now_ms() - 60_000;
    let code = error_code(&admin, &insert_booking(Ulid::new(), rid, past, t)).await;
    assert_eq!(code, SqlState::INVALID_PARAMETER_VALUE);

    // Unknown room.
    let code = error_code(&admin, &insert_booking(Ulid::new(), Ulid::new(), t, t + HOUR)).await;
    assert_eq!(code, SqlState::NO_DATA_FOUND);

    // Unknown column.
    let code = error_code(
        &admin,
        &format!(r#"INSERT INTO bookings (room_id, start, "end", color) VALUES ('{rid}', {t}, {}, 'red')"#, t + HOUR),
    )
    .await;
    assert_eq!(code, SqlState::INVALID_PARAMETER_VALUE);

    // Duplicate room name.
    let code = error_code(&admin, "INSERT INTO rooms (name) VALUES ('Alpha')").await;
    assert_eq!(code, SqlState::UNIQUE_VIOLATION);

    // Not SQL we understand.
    let code = error_code(&admin, "SELEKT 1").await;
    assert_eq!(code, SqlState::SYNTAX_ERROR);
}

#[tokio::test]
async fn only_owner_or_superuser_touches_a_booking() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let alice = connect(addr, "alice").await;
    let bob = connect(addr, "bob").await;
    let rid = create_room(&admin, "Alpha").await;

    let code = error_code(&alice, "INSERT INTO rooms (name) VALUES ('Beta')").await;
    assert_eq!(code, SqlState::INSUFFICIENT_PRIVILEGE);

    let t = tomorrow();
    let bid = Ulid::new();
    alice
        .batch_execute(&insert_booking(bid, rid, t, t + HOUR))
        .await
        .unwrap();

    let code = error_code(&bob, &format!("DELETE FROM bookings WHERE id = '{bid}'")).await;
    assert_eq!(code, SqlState::INSUFFICIENT_PRIVILEGE);
    let code = error_code(
        &bob,
        &format!(r#"UPDATE bookings SET "end" = {} WHERE id = '{bid}'"#, t + 2 * HOUR),
    )
    .await;
    assert_eq!(code, SqlState::INSUFFICIENT_PRIVILEGE);
    let code = error_code(&bob, "SELECT * FROM bookings").await;
    assert_eq!(code, SqlState::INSUFFICIENT_PRIVILEGE);
    let code = error_code(&bob, "SELECT * FROM bookings WHERE owner_id = 'alice'").await;
    assert_eq!(code, SqlState::INSUFFICIENT_PRIVILEGE);

    alice
        .batch_execute(&format!(
            r#"UPDATE bookings SET "end" = {} WHERE id = '{bid}'"#,
            t + 2 * HOUR
        ))
        .await
        .unwrap();
    assert_eq!(rows(&admin, "SELECT * FROM bookings").await.len(), 1);

    admin
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{bid}'"))
        .await
        .unwrap();
    let code = error_code(&alice, &format!("DELETE FROM bookings WHERE id = '{bid}'")).await;
    assert_eq!(code, SqlState::NO_DATA_FOUND);
}

#[tokio::test]
async fn disabled_user_cannot_book() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let mallory = connect(addr, "mallory").await;
    let rid = create_room(&admin, "Alpha").await;

    let t = tomorrow();
    let code = error_code(&mallory, &insert_booking(Ulid::new(), rid, t, t + HOUR)).await;
    assert_eq!(code, SqlState::INSUFFICIENT_PRIVILEGE);
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let alice = connect(addr, "alice").await;
    let rid = create_room(&admin, "Alpha").await;

    let t = tomorrow();
    let bid = Ulid::new().to_string();
    let affected = alice
        .execute(
            r#"INSERT INTO bookings (id, room_id, start, "end") VALUES ($1, $2, $3, $4)"#,
            &[
                &bid,
                &rid.to_string(),
                &t.to_string(),
                &(t + HOUR).to_string(),
            ],
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);

    let found = rows(&alice, &format!("SELECT * FROM bookings WHERE id = '{bid}'")).await;
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn deleting_a_room_drops_its_bookings() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let rid = create_room(&admin, "Alpha").await;

    let t = tomorrow();
    for i in 0..3 {
        admin
            .batch_execute(&insert_booking(Ulid::new(), rid, t + 2 * i * HOUR, t + (2 * i + 1) * HOUR))
            .await
            .unwrap();
    }
    assert_eq!(rows(&admin, "SELECT * FROM bookings").await.len(), 3);

    admin
        .batch_execute(&format!("DELETE FROM rooms WHERE id = '{rid}'"))
        .await
        .unwrap();
    assert!(rows(&admin, "SELECT * FROM bookings").await.is_empty());
    assert!(rows(&admin, "SELECT * FROM rooms").await.is_empty());
    let code = error_code(&admin, &format!("SELECT * FROM bookings WHERE room_id = '{rid}'")).await;
    assert_eq!(code, SqlState::NO_DATA_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_commit_one_of_overlapping_bookings() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let rid = create_room(&admin, "Alpha").await;
    let t = tomorrow();

    let mut handles = Vec::new();
    for i in 0..8 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr, &format!("user{i}")).await;
            let start = t + i * 60_000;
            client
                .batch_execute(&insert_booking(Ulid::new(), rid, start, start + HOUR))
                .await
        }));
    }

    let mut committed = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => committed += 1,
            Err(e) => assert_eq!(e.code(), Some(&SqlState::EXCLUSION_VIOLATION)),
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(rows(&admin, "SELECT * FROM bookings").await.len(), 1);
}

#[tokio::test]
async fn room_description_round_trips_bound_text_and_clears() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;

    let rid = Ulid::new().to_string();
    let description = "costs $1 per hour".to_string();
    admin
        .execute(
            "INSERT INTO rooms (id, name, description) VALUES ($1, $2, $3)",
            &[&rid, &"Blue".to_string(), &description],
        )
        .await
        .unwrap();
    let found = rows(&admin, "SELECT * FROM rooms").await;
    assert_eq!(found[0].get("id"), Some(rid.as_str()));
    assert_eq!(found[0].get("description"), Some(description.as_str()));

    admin
        .batch_execute(&format!("UPDATE rooms SET description = NULL WHERE id = '{rid}'"))
        .await
        .unwrap();
    let found = rows(&admin, "SELECT * FROM rooms").await;
    assert_eq!(found[0].get("name"), Some("Blue"));
    assert_eq!(found[0].get("description"), None);
}
