use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use spabook::engine::Engine;
use spabook::notify::NotifyHub;
use spabook::wire::{self, SpabookFactory};

const ADMIN_PASSWORD: &str = "back-office";
const BOOKING_PASSWORD: &str = "wizard";

/// 2025-01-06 is a Monday.
const MONDAY: &str = "2025-01-06";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("spabook_int_test_{}", Ulid::new()));
    let engine = Arc::new(Engine::new(dir.join("spabook.wal"), Arc::new(NotifyHub::new())).unwrap());
    let factory = SpabookFactory::new(engine, ADMIN_PASSWORD.into(), BOOKING_PASSWORD.into());

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

async fn try_connect(addr: SocketAddr, user: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("spa")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn admin(addr: SocketAddr) -> Client {
    try_connect(addr, "admin", ADMIN_PASSWORD).await.unwrap()
}

async fn booking(addr: SocketAddr) -> Client {
    try_connect(addr, "booking", BOOKING_PASSWORD).await.unwrap()
}

async fn select(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// SQLSTATE of a failed statement.
async fn error_code(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

/// Seed a 60 minute facial and Monday 09:00-17:00 opening hours.
async fn seed(client: &Client) -> Ulid {
    let service = Ulid::new();
    client
        .simple_query(&format!(
            "INSERT INTO services (id, name, duration, price, category) VALUES ('{service}', 'Hydrafacial', 60, 95.50, 'facial')"
        ))
        .await
        .unwrap();
    client
        .simple_query(&format!(
            "INSERT INTO weekly_availability (id, day_of_week, start_time, end_time) VALUES ('{}', 1, '09:00', '17:00')",
            Ulid::new()
        ))
        .await
        .unwrap();
    service
}

fn self_service_booking(service: Ulid, start: &str, email: &str) -> String {
    format!(
        "INSERT INTO appointments (id, service_id, date, start_time, email, name, phone) \
         VALUES ('{}', '{service}', '{MONDAY}', '{start}', '{email}', 'Guest', '+385 91 555 0100')",
        Ulid::new()
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_password_is_rejected() {
    let addr = start_test_server().await;
    assert!(try_connect(addr, "admin", BOOKING_PASSWORD).await.is_err());
    assert!(try_connect(addr, "booking", ADMIN_PASSWORD).await.is_err());
}

#[tokio::test]
async fn public_booking_flow() {
    let addr = start_test_server().await;
    let service = seed(&admin(addr).await).await;
    let wizard = booking(addr).await;

    let slots = select(
        &wizard,
        &format!("SELECT * FROM slots WHERE date = '{MONDAY}' AND service_id = '{service}'"),
    )
    .await;
    assert_eq!(slots.len(), 15);
    assert_eq!(slots[0].get("start_time"), Some("09:00"));
    assert_eq!(slots[0].get("end_time"), Some("10:00"));
    assert_eq!(slots[14].get("start_time"), Some("16:00"));

    wizard
        .simple_query(&self_service_booking(service, "10:00", "Ana@Example.com"))
        .await
        .unwrap();

    // Someone else picked the same slot from a stale list.
    let code = error_code(&wizard, &self_service_booking(service, "10:30", "bo@example.com")).await;
    assert_eq!(code, "23P01");
    // Adjacent is fine.
    wizard
        .simple_query(&self_service_booking(service, "11:00", "bo@example.com"))
        .await
        .unwrap();

    let back_office = admin(addr).await;
    let appointments = select(&back_office, "SELECT * FROM appointments WHERE status = 'pending'").await;
    assert_eq!(appointments.len(), 2);
    assert_eq!(appointments[0].get("start_time"), Some("10:00"));
    assert_eq!(appointments[0].get("end_time"), Some("11:00"));

    let clients = select(&back_office, "SELECT * FROM clients").await;
    assert_eq!(clients.len(), 2);
    assert!(clients.iter().any(|c| c.get("email") == Some("ana@example.com")));
    assert!(clients.iter().all(|c| c.get("appointment_count") == Some("1")));
}

#[tokio::test]
async fn booking_role_is_restricted() {
    let addr = start_test_server().await;
    let back_office = admin(addr).await;
    let service = seed(&back_office).await;
    let client_id = Ulid::new();
    back_office
        .simple_query(&format!(
            "INSERT INTO clients (id, email) VALUES ('{client_id}', 'vip@example.com')"
        ))
        .await
        .unwrap();

    let wizard = booking(addr).await;
    assert_eq!(error_code(&wizard, "SELECT * FROM clients").await, "42501");
    assert_eq!(error_code(&wizard, "SELECT * FROM appointments").await, "42501");
    assert_eq!(error_code(&wizard, "SELECT * FROM stats").await, "42501");
    assert_eq!(
        error_code(&wizard, &format!("DELETE FROM services WHERE id = '{service}'")).await,
        "42501"
    );
    let admin_path = format!(
        "INSERT INTO appointments (id, service_id, date, start_time, client_id) VALUES ('{}', '{service}', '{MONDAY}', '09:00', '{client_id}')",
        Ulid::new()
    );
    assert_eq!(error_code(&wizard, &admin_path).await, "42501");

    // A status smuggled into a self-service booking is ignored.
    wizard
        .simple_query(&format!(
            "INSERT INTO appointments (id, service_id, date, start_time, email, name, phone, status) VALUES ('{}', '{service}', '{MONDAY}', '13:00', 'eve@example.com', 'Eve', '+385 91 555 0101', 'confirmed')",
            Ulid::new()
        ))
        .await
        .unwrap();
    let rows = select(&back_office, "SELECT * FROM appointments").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("pending"));
}

#[tokio::test]
async fn public_catalog_hides_inactive_services() {
    let addr = start_test_server().await;
    let back_office = admin(addr).await;
    let active = seed(&back_office).await;
    let retired = Ulid::new();
    back_office
        .simple_query(&format!(
            "INSERT INTO services (id, name, duration, price, category, active) VALUES ('{retired}', 'Mud wrap', 90, 120, 'body', false)"
        ))
        .await
        .unwrap();

    assert_eq!(select(&back_office, "SELECT * FROM services").await.len(), 2);

    let wizard = booking(addr).await;
    let services = select(&wizard, "SELECT * FROM services").await;
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].get("id"), Some(active.to_string().as_str()));
    assert_eq!(services[0].get("price_cents"), Some("9550"));

    let code = error_code(
        &wizard,
        &format!("SELECT * FROM slots WHERE date = '{MONDAY}' AND service_id = '{retired}'"),
    )
    .await;
    assert_eq!(code, "55000");
    let code = error_code(&wizard, &self_service_booking(retired, "09:00", "x@example.com")).await;
    assert_eq!(code, "55000");
}

#[tokio::test]
async fn admin_manages_appointment_lifecycle() {
    let addr = start_test_server().await;
    let back_office = admin(addr).await;
    let service = seed(&back_office).await;
    let client_id = Ulid::new();
    back_office
        .simple_query(&format!(
            "INSERT INTO clients (id, email, name) VALUES ('{client_id}', 'mia@example.com', 'Mia')"
        ))
        .await
        .unwrap();

    let first = Ulid::new();
    let second = Ulid::new();
    for (id, start) in [(first, "09:00"), (second, "11:00")] {
        back_office
            .simple_query(&format!(
                "INSERT INTO appointments (id, service_id, date, start_time, client_id, status) VALUES ('{id}', '{service}', '{MONDAY}', '{start}', '{client_id}', 'confirmed')"
            ))
            .await
            .unwrap();
    }

    // Moving onto the other booking is refused, a free slot is fine.
    let code = error_code(
        &back_office,
        &format!("UPDATE appointments SET start_time = '10:30' WHERE id = '{first}'"),
    )
    .await;
    assert_eq!(code, "23P01");
    back_office
        .simple_query(&format!("UPDATE appointments SET start_time = '14:00' WHERE id = '{first}'"))
        .await
        .unwrap();

    back_office
        .simple_query(&format!("UPDATE appointments SET status = 'completed' WHERE id = '{first}'"))
        .await
        .unwrap();
    let code = error_code(
        &back_office,
        &format!("UPDATE appointments SET status = 'pending' WHERE id = '{first}'"),
    )
    .await;
    assert_eq!(code, "55000");

    // The client is referenced, so it stays until its bookings are gone.
    let delete_client = format!("DELETE FROM clients WHERE id = '{client_id}'");
    assert_eq!(error_code(&back_office, &delete_client).await, "23503");

    let rows = select(
        &back_office,
        &format!("SELECT * FROM appointments WHERE client_id = '{client_id}'"),
    )
    .await;
    let starts: Vec<_> = rows.iter().map(|r| r.get("start_time").unwrap().to_string()).collect();
    assert_eq!(starts, vec!["11:00", "14:00"]);

    let stats = select(&back_office, "SELECT * FROM stats").await;
    assert_eq!(stats[0].get("total_appointments"), Some("2"));
    assert_eq!(stats[0].get("pending_appointments"), Some("0"));
    assert_eq!(stats[0].get("active_services"), Some("1"));

    for id in [first, second] {
        back_office
            .simple_query(&format!("DELETE FROM appointments WHERE id = '{id}'"))
            .await
            .unwrap();
    }
    back_office.simple_query(&delete_client).await.unwrap();
    assert!(select(&back_office, "SELECT * FROM clients").await.is_empty());
}

#[tokio::test]
async fn blocked_date_empties_slots() {
    let addr = start_test_server().await;
    let back_office = admin(addr).await;
    let service = seed(&back_office).await;
    let slots_sql = format!("SELECT * FROM slots WHERE date = '{MONDAY}' AND service_id = '{service}'");

    let blocked = Ulid::new();
    back_office
        .simple_query(&format!(
            "INSERT INTO blocked_dates (id, date, reason) VALUES ('{blocked}', '{MONDAY}', 'Holiday')"
        ))
        .await
        .unwrap();
    let code = error_code(
        &back_office,
        &format!("INSERT INTO blocked_dates VALUES ('{}', '{MONDAY}', NULL)", Ulid::new()),
    )
    .await;
    assert_eq!(code, "23505");

    let wizard = booking(addr).await;
    assert!(select(&wizard, &slots_sql).await.is_empty());
    let blocked_rows = select(&wizard, "SELECT * FROM blocked_dates").await;
    assert_eq!(blocked_rows[0].get("reason"), Some("Holiday"));

    back_office
        .simple_query(&format!("DELETE FROM blocked_dates WHERE id = '{blocked}'"))
        .await
        .unwrap();
    assert_eq!(select(&wizard, &slots_sql).await.len(), 15);
}

#[tokio::test]
async fn service_reorder_and_validation() {
    let addr = start_test_server().await;
    let back_office = admin(addr).await;
    let first = seed(&back_office).await;
    let second = Ulid::new();
    back_office
        .simple_query(&format!(
            "INSERT INTO services VALUES ('{second}', 'Peel', NULL, 30, '40', 'facial', true)"
        ))
        .await
        .unwrap();

    back_office
        .simple_query(&format!("UPDATE services SET move = 'up' WHERE id = '{second}'"))
        .await
        .unwrap();
    let ids: Vec<_> = select(&back_office, "SELECT * FROM services")
        .await
        .iter()
        .map(|r| r.get("id").unwrap().to_string())
        .collect();
    assert_eq!(ids, vec![second.to_string(), first.to_string()]);

    let code = error_code(
        &back_office,
        &format!("UPDATE services SET move = 'up' WHERE id = '{second}'"),
    )
    .await;
    assert_eq!(code, "54000");

    let code = error_code(
        &back_office,
        &format!("UPDATE services SET duration = 0 WHERE id = '{first}'"),
    )
    .await;
    assert_eq!(code, "22023");

    assert_eq!(error_code(&back_office, "SELECT * FROM nowhere").await, "42601");
    assert_eq!(error_code(&back_office, "SELECT * FROM slots").await, "42601");
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let addr = start_test_server().await;
    let back_office = admin(addr).await;
    let service = seed(&back_office).await;
    let service_str = service.to_string();

    let wizard = booking(addr).await;
    let rows = wizard
        .query(
            "SELECT * FROM slots WHERE date = $1 AND service_id = $2",
            &[&MONDAY, &service_str.as_str()],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 15);
    let first: String = rows[0].get("start_time");
    assert_eq!(first, "09:00");

    let id = Ulid::new().to_string();
    let inserted = wizard
        .execute(
            "INSERT INTO appointments (id, service_id, date, start_time, email, name, phone, notes) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[&id.as_str(), &service_str.as_str(), &MONDAY, &"15:00", &"li@example.com", &"Li", &"+385 91 555 0102", &"It's my first visit"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let services = back_office.query("SELECT * FROM services", &[]).await.unwrap();
    let price: i64 = services[0].get("price_cents");
    let duration: i32 = services[0].get("duration");
    let active: bool = services[0].get("active");
    assert_eq!((price, duration, active), (9550, 60, true));

    let appointments = back_office
        .query("SELECT * FROM appointments WHERE id = $1", &[&id.as_str()])
        .await;
    // `id` is not a filter column on appointments.
    assert!(appointments.is_err());

    let appointments = back_office
        .query("SELECT * FROM appointments WHERE date = $1", &[&MONDAY])
        .await
        .unwrap();
    assert_eq!(appointments.len(), 1);
    let notes: Option<String> = appointments[0].get("notes");
    assert_eq!(notes.as_deref(), Some("It's my first visit"));
}

#[tokio::test]
async fn bound_values_containing_placeholders_are_kept_verbatim() {
    let addr = start_test_server().await;
    let back_office = admin(addr).await;
    let service = seed(&back_office).await;
    let service_str = service.to_string();

    let wizard = booking(addr).await;
    let id = Ulid::new().to_string();
    let inserted = wizard
        .execute(
            "INSERT INTO appointments (id, service_id, date, start_time, email, name, phone, notes) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[&id.as_str(), &service_str.as_str(), &MONDAY, &"10:00", &"dora@example.com", &"Dora $7", &"+385 91 555 0103", &"I have a $5 voucher, call $7"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let rows = select(&back_office, &format!("SELECT * FROM appointments WHERE date = '{MONDAY}'")).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("notes"), Some("I have a $5 voucher, call $7"));
    let clients = select(&back_office, "SELECT * FROM clients").await;
    assert_eq!(clients[0].get("name"), Some("Dora $7"));
}

#[tokio::test]
async fn self_service_booking_needs_contact_details() {
    let addr = start_test_server().await;
    let service = seed(&admin(addr).await).await;
    let wizard = booking(addr).await;

    let without_phone = format!(
        "INSERT INTO appointments (id, service_id, date, start_time, email, name) VALUES ('{}', '{service}', '{MONDAY}', '09:00', 'ivo@example.com', 'Ivo')",
        Ulid::new()
    );
    assert_eq!(error_code(&wizard, &without_phone).await, "22023");

    let without_name = format!(
        "INSERT INTO appointments (id, service_id, date, start_time, email, phone) VALUES ('{}', '{service}', '{MONDAY}', '09:00', 'ivo@example.com', '+385 91 555 0104')",
        Ulid::new()
    );
    assert_eq!(error_code(&wizard, &without_name).await, "22023");
}
