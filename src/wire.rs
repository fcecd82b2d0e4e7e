use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type, METADATA_USER};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::auth::{Role, SpabookAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, PERMISSION_DENIED_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

// ── Result schemas ───────────────────────────────────────────────

type Columns = &'static [(&'static str, Type)];

const SERVICE_FIELDS: Columns = &[
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("name_en", Type::VARCHAR),
    ("duration", Type::INT4),
    ("price_cents", Type::INT8),
    ("category", Type::VARCHAR),
    ("active", Type::BOOL),
    ("sort_order", Type::INT4),
];

const WEEKLY_FIELDS: Columns = &[
    ("id", Type::VARCHAR),
    ("day_of_week", Type::INT4),
    ("start_time", Type::VARCHAR),
    ("end_time", Type::VARCHAR),
    ("active", Type::BOOL),
];

const BLOCKED_FIELDS: Columns = &[
    ("id", Type::VARCHAR),
    ("date", Type::VARCHAR),
    ("reason", Type::VARCHAR),
];

const CLIENT_FIELDS: Columns = &[
    ("id", Type::VARCHAR),
    ("email", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("phone", Type::VARCHAR),
    ("appointment_count", Type::INT8),
];

const APPOINTMENT_FIELDS: Columns = &[
    ("id", Type::VARCHAR),
    ("client_id", Type::VARCHAR),
    ("service_id", Type::VARCHAR),
    ("date", Type::VARCHAR),
    ("start_time", Type::VARCHAR),
    ("end_time", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("notes", Type::VARCHAR),
];

const SLOT_FIELDS: Columns = &[("start_time", Type::VARCHAR), ("end_time", Type::VARCHAR)];

const STATS_FIELDS: Columns = &[
    ("pending_appointments", Type::INT8),
    ("today_appointments", Type::INT8),
    ("total_appointments", Type::INT8),
    ("active_services", Type::INT8),
];

fn schema(columns: Columns, format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

/// Columns a statement returns, judged from the table after FROM. Used to
/// describe prepared statements before their parameters are bound.
fn result_columns(sql: &str) -> Option<Columns> {
    let mut words = sql.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("select") {
        return None;
    }
    words.find(|w| w.eq_ignore_ascii_case("from"))?;
    let table = words.next()?.trim_end_matches(';').to_lowercase();
    match table.as_str() {
        "services" => Some(SERVICE_FIELDS),
        "weekly_availability" => Some(WEEKLY_FIELDS),
        "blocked_dates" => Some(BLOCKED_FIELDS),
        "clients" => Some(CLIENT_FIELDS),
        "appointments" => Some(APPOINTMENT_FIELDS),
        "slots" => Some(SLOT_FIELDS),
        "stats" => Some(STATS_FIELDS),
        _ => None,
    }
}

fn rows<T>(
    columns: Columns,
    format: &Format,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema(columns, format));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_service(encoder: &mut DataRowEncoder, s: &Service) -> PgWireResult<()> {
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.name)?;
    encoder.encode_field(&s.name_en)?;
    encoder.encode_field(&(s.duration_min as i32))?;
    encoder.encode_field(&(s.price_cents as i64))?;
    encoder.encode_field(&s.category.as_str().to_string())?;
    encoder.encode_field(&s.active)?;
    encoder.encode_field(&(s.sort_order as i32))
}

fn encode_weekly(encoder: &mut DataRowEncoder, w: &WeeklyAvailability) -> PgWireResult<()> {
    encoder.encode_field(&w.id.to_string())?;
    encoder.encode_field(&(w.day_of_week as i32))?;
    encoder.encode_field(&w.start.to_string())?;
    encoder.encode_field(&w.end.to_string())?;
    encoder.encode_field(&w.active)
}

fn encode_blocked(encoder: &mut DataRowEncoder, b: &BlockedDate) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.date.to_string())?;
    encoder.encode_field(&b.reason)
}

fn encode_client(encoder: &mut DataRowEncoder, c: &crate::model::ClientInfo) -> PgWireResult<()> {
    encoder.encode_field(&c.client.id.to_string())?;
    encoder.encode_field(&c.client.email)?;
    encoder.encode_field(&c.client.name)?;
    encoder.encode_field(&c.client.phone)?;
    encoder.encode_field(&(c.appointment_count as i64))
}

fn encode_appointment(encoder: &mut DataRowEncoder, a: &Appointment) -> PgWireResult<()> {
    encoder.encode_field(&a.id.to_string())?;
    encoder.encode_field(&a.client_id.to_string())?;
    encoder.encode_field(&a.service_id.to_string())?;
    encoder.encode_field(&a.date.to_string())?;
    encoder.encode_field(&a.span.start.to_string())?;
    encoder.encode_field(&a.span.end.to_string())?;
    encoder.encode_field(&a.status.as_str().to_string())?;
    encoder.encode_field(&a.notes)
}

fn encode_slot(encoder: &mut DataRowEncoder, slot: &Span) -> PgWireResult<()> {
    encoder.encode_field(&slot.start.to_string())?;
    encoder.encode_field(&slot.end.to_string())
}

fn encode_stats(encoder: &mut DataRowEncoder, s: &Stats) -> PgWireResult<()> {
    encoder.encode_field(&(s.pending_appointments as i64))?;
    encoder.encode_field(&(s.today_appointments as i64))?;
    encoder.encode_field(&(s.total_appointments as i64))?;
    encoder.encode_field(&(s.active_services as i64))
}

fn executed(tag: &str) -> Response {
    Response::Execution(Tag::new(tag).with_rows(1))
}

// ── Roles ────────────────────────────────────────────────────────

fn role_of<C: ClientInfo>(client: &C) -> Role {
    Role::for_user(client.metadata().get(METADATA_USER).map(String::as_str))
}

/// Narrow a command to what `role` may run. The booking role only sees the
/// public catalog and books by email as a pending request.
fn authorize(role: Role, cmd: Command) -> PgWireResult<Command> {
    if role == Role::Admin {
        return Ok(cmd);
    }
    match cmd {
        Command::SelectServices { .. } => Ok(Command::SelectServices { active_only: true }),
        Command::SelectWeekly { .. } => Ok(Command::SelectWeekly { active_only: true }),
        Command::SelectBlockedDates | Command::SelectSlots { .. } => Ok(cmd),
        Command::InsertAppointment(mut new) if matches!(new.client, ClientRef::Identify { .. }) => {
            new.status = None;
            new.end = None;
            Ok(Command::InsertAppointment(new))
        }
        other => {
            let label = observability::command_label(&other);
            warn!("booking role attempted {label}");
            metrics::counter!(PERMISSION_DENIED_TOTAL, "command" => label).increment(1);
            Err(user_error("42501", format!("permission denied for {label}")))
        }
    }
}

// ── Handler ──────────────────────────────────────────────────────

pub struct SpabookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SpabookQueryParser>,
}

impl SpabookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SpabookQueryParser),
        }
    }

    /// Parse, authorize and run one statement, recording query metrics.
    async fn run(&self, role: Role, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(SqlError::Empty) => return Ok(Response::EmptyQuery),
            Err(e) => return Err(sql_err(e)),
        };
        let cmd = authorize(role, cmd)?;
        let label = observability::command_label(&cmd);
        debug!("{label} ({role:?})");

        let started = Instant::now();
        let result = self.execute_command(role, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, role: Role, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertService(new) => {
                engine.create_service(new).await.map_err(engine_err)?;
                Ok(executed("INSERT"))
            }
            Command::UpdateService { id, patch } => {
                engine.update_service(id, patch).await.map_err(engine_err)?;
                Ok(executed("UPDATE"))
            }
            Command::MoveService { id, direction } => {
                engine.move_service(id, direction).await.map_err(engine_err)?;
                Ok(executed("UPDATE"))
            }
            Command::DeleteService { id } => {
                engine.delete_service(id).await.map_err(engine_err)?;
                Ok(executed("DELETE"))
            }
            Command::SelectServices { active_only } => {
                let services = engine.list_services(active_only);
                Ok(rows(SERVICE_FIELDS, format, &services, encode_service))
            }

            Command::InsertWeekly {
                id,
                day_of_week,
                start,
                end,
                active,
            } => {
                engine
                    .add_weekly_availability(id, day_of_week, start, end, active)
                    .await
                    .map_err(engine_err)?;
                Ok(executed("INSERT"))
            }
            Command::UpdateWeekly { id, patch } => {
                engine
                    .update_weekly_availability(id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(executed("UPDATE"))
            }
            Command::DeleteWeekly { id } => {
                engine.remove_weekly_availability(id).await.map_err(engine_err)?;
                Ok(executed("DELETE"))
            }
            Command::SelectWeekly { active_only } => {
                let weekly = engine.list_weekly_availability(active_only);
                Ok(rows(WEEKLY_FIELDS, format, &weekly, encode_weekly))
            }

            Command::InsertBlockedDate { id, date, reason } => {
                engine.block_date(id, date, reason).await.map_err(engine_err)?;
                Ok(executed("INSERT"))
            }
            Command::DeleteBlockedDate { id } => {
                engine.unblock_date(id).await.map_err(engine_err)?;
                Ok(executed("DELETE"))
            }
            Command::SelectBlockedDates => {
                let blocked = engine.list_blocked_dates();
                Ok(rows(BLOCKED_FIELDS, format, &blocked, encode_blocked))
            }

            Command::InsertClient {
                id,
                email,
                name,
                phone,
            } => {
                engine
                    .create_client(id, &email, name, phone)
                    .await
                    .map_err(engine_err)?;
                Ok(executed("INSERT"))
            }
            Command::UpdateClient { id, name, phone } => {
                engine.update_client(id, name, phone).await.map_err(engine_err)?;
                Ok(executed("UPDATE"))
            }
            Command::DeleteClient { id } => {
                engine.delete_client(id).await.map_err(engine_err)?;
                Ok(executed("DELETE"))
            }
            Command::SelectClients => {
                let clients = engine.list_clients().await;
                Ok(rows(CLIENT_FIELDS, format, &clients, encode_client))
            }

            Command::InsertAppointment(new) => {
                engine.create_appointment(new).await.map_err(engine_err)?;
                Ok(executed("INSERT"))
            }
            Command::UpdateAppointment { id, patch } => {
                engine.update_appointment(id, patch).await.map_err(engine_err)?;
                Ok(executed("UPDATE"))
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id).await.map_err(engine_err)?;
                Ok(executed("DELETE"))
            }
            Command::SelectAppointments(filter) => {
                let appointments = engine.list_appointments(&filter).await;
                Ok(rows(APPOINTMENT_FIELDS, format, &appointments, encode_appointment))
            }

            Command::SelectSlots { date, service_id } => {
                let service = engine
                    .get_service(&service_id)
                    .ok_or(EngineError::NotFound(service_id))
                    .map_err(engine_err)?;
                if role == Role::Public && !service.active {
                    return Err(engine_err(EngineError::ServiceInactive(service_id)));
                }
                let slots: Vec<Span> = engine
                    .available_slots(date, service_id)
                    .map_err(engine_err)?
                    .into_iter()
                    .filter_map(|start| {
                        let end = start.checked_add_minutes(service.duration_min)?;
                        Some(Span::new(start, end))
                    })
                    .collect();
                Ok(rows(SLOT_FIELDS, format, &slots, encode_slot))
            }
            Command::SelectStats => {
                let today = chrono::Local::now().date_naive();
                let stats = engine.stats(today).await;
                Ok(rows(STATS_FIELDS, format, &[stats], encode_stats))
            }
        }
    }
}

#[async_trait]
impl SimpleQueryHandler for SpabookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let role = role_of(client);
        let response = self.run(role, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SpabookQueryParser;

#[async_trait]
impl QueryParser for SpabookQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        let Some(cols) = result_columns(stmt) else {
            return Ok(vec![]);
        };
        Ok(match column_format {
            Some(format) => schema(cols, format),
            None => schema(cols, &Format::UnifiedText),
        })
    }
}

#[async_trait]
impl ExtendedQueryHandler for SpabookHandler {
    type Statement = String;
    type QueryParser = SpabookQueryParser;

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
        let role = role_of(client);
        let sql = substitute_params(portal);
        self.run(role, &sql, &portal.result_column_format).await
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
        let fields = result_columns(&target.statement)
            .map_or_else(Vec::new, |cols| schema(cols, &Format::UnifiedText));
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        let fields = result_columns(&target.statement.statement)
            .map_or_else(Vec::new, |cols| schema(cols, &target.result_column_format));
        Ok(DescribePortalResponse::new(fields))
    }
}

/// Byte ranges and indexes of `$N` placeholders outside quoted literals and
/// quoted identifiers.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                // A doubled quote inside the literal is an escape, which this
                // loop handles as closing and immediately reopening.
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// One left-to-right pass, so a value that itself contains `$N` is never
/// rewritten. Placeholders without a bound value are left untouched.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                result.push('\'');
                result.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SpabookFactory {
    handler: Arc<SpabookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SpabookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SpabookFactory {
    pub fn new(engine: Arc<Engine>, admin_password: String, booking_password: String) -> Self {
        let auth_source = SpabookAuthSource::new(admin_password, booking_password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SpabookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SpabookFactory {
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
    factory: SpabookFactory,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotUnavailable(_) => "23P01",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InUse(_) => "23503",
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidRange(_) | EngineError::Validation(_) => "22023",
        EngineError::IllegalTransition { .. }
        | EngineError::NotActive(_)
        | EngineError::ServiceInactive(_) => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(msg) = &e {
        tracing::error!("WAL failure: {msg}");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
