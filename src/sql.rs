use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertService(NewService),
    UpdateService { id: Ulid, patch: ServicePatch },
    MoveService { id: Ulid, direction: MoveDirection },
    DeleteService { id: Ulid },
    SelectServices { active_only: bool },

    InsertWeekly {
        id: Ulid,
        day_of_week: u8,
        start: TimeOfDay,
        end: TimeOfDay,
        active: bool,
    },
    UpdateWeekly { id: Ulid, patch: WeeklyPatch },
    DeleteWeekly { id: Ulid },
    SelectWeekly { active_only: bool },

    InsertBlockedDate {
        id: Ulid,
        date: NaiveDate,
        reason: Option<String>,
    },
    DeleteBlockedDate { id: Ulid },
    SelectBlockedDates,

    InsertClient {
        id: Ulid,
        email: String,
        name: Option<String>,
        phone: Option<String>,
    },
    UpdateClient {
        id: Ulid,
        name: Option<String>,
        phone: Option<String>,
    },
    DeleteClient { id: Ulid },
    SelectClients,

    InsertAppointment(NewAppointment),
    UpdateAppointment { id: Ulid, patch: AppointmentPatch },
    DeleteAppointment { id: Ulid },
    SelectAppointments(AppointmentFilter),

    SelectSlots { date: NaiveDate, service_id: Ulid },
    SelectStats,
}

// Positional INSERT order per table.
const SERVICE_COLUMNS: &[&str] = &["id", "name", "name_en", "duration", "price", "category", "active"];
const WEEKLY_COLUMNS: &[&str] = &["id", "day_of_week", "start_time", "end_time", "active"];
const BLOCKED_COLUMNS: &[&str] = &["id", "date", "reason"];
const CLIENT_COLUMNS: &[&str] = &["id", "email", "name", "phone"];
const APPOINTMENT_COLUMNS: &[&str] = &[
    "id",
    "service_id",
    "date",
    "start_time",
    "end_time",
    "client_id",
    "email",
    "name",
    "phone",
    "notes",
    "status",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() || trimmed == ";" {
        return Err(SqlError::Empty);
    }
    if trimmed
        .split_whitespace()
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("update"))
    {
        return parse_update(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn new(insert: &ast::Insert, table: &'static str, canonical: &[&str]) -> Result<Self, SqlError> {
        let exprs = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            if exprs.len() > canonical.len() {
                return Err(SqlError::WrongArity(table, canonical.len(), exprs.len()));
            }
            canonical.iter().map(|c| c.to_string()).collect()
        } else {
            if insert.columns.len() != exprs.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), exprs.len()));
            }
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };

        let mut values = HashMap::new();
        for (col, expr) in columns.into_iter().zip(exprs) {
            if !canonical.contains(&col.as_str()) {
                return Err(SqlError::UnknownColumn(table, col));
            }
            values.insert(col, expr);
        }
        Ok(Self { table, values })
    }

    /// A present, non-NULL value.
    fn get(&self, col: &str) -> Option<&Expr> {
        self.values.get(col).filter(|e| !is_null(e))
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_string).transpose()
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "services" => {
            let row = Row::new(insert, "services", SERVICE_COLUMNS)?;
            Ok(Command::InsertService(NewService {
                id: parse_ulid(row.require("id")?)?,
                name: parse_string(row.require("name")?)?,
                name_en: row.string("name_en")?,
                duration_min: parse_u32(row.require("duration")?)?,
                price_cents: parse_price(row.require("price")?)?,
                category: row
                    .get("category")
                    .map(parse_category)
                    .transpose()?
                    .unwrap_or(ServiceCategory::Facial),
                active: row.get("active").map(parse_bool).transpose()?.unwrap_or(true),
            }))
        }
        "weekly_availability" => {
            let row = Row::new(insert, "weekly_availability", WEEKLY_COLUMNS)?;
            Ok(Command::InsertWeekly {
                id: parse_ulid(row.require("id")?)?,
                day_of_week: parse_day_of_week(row.require("day_of_week")?)?,
                start: parse_time(row.require("start_time")?)?,
                end: parse_time(row.require("end_time")?)?,
                active: row.get("active").map(parse_bool).transpose()?.unwrap_or(true),
            })
        }
        "blocked_dates" => {
            let row = Row::new(insert, "blocked_dates", BLOCKED_COLUMNS)?;
            Ok(Command::InsertBlockedDate {
                id: parse_ulid(row.require("id")?)?,
                date: parse_date(row.require("date")?)?,
                reason: row.string("reason")?,
            })
        }
        "clients" => {
            let row = Row::new(insert, "clients", CLIENT_COLUMNS)?;
            Ok(Command::InsertClient {
                id: parse_ulid(row.require("id")?)?,
                email: parse_string(row.require("email")?)?,
                name: row.string("name")?,
                phone: row.string("phone")?,
            })
        }
        "appointments" => {
            let row = Row::new(insert, "appointments", APPOINTMENT_COLUMNS)?;
            let client = match row.get("client_id") {
                Some(expr) => ClientRef::Existing(parse_ulid(expr)?),
                None => ClientRef::Identify {
                    email: parse_string(
                        row.get("email")
                            .ok_or(SqlError::MissingColumn("appointments", "client_id or email"))?,
                    )?,
                    name: row.string("name")?,
                    phone: row.string("phone")?,
                },
            };
            Ok(Command::InsertAppointment(NewAppointment {
                id: parse_ulid(row.require("id")?)?,
                service_id: parse_ulid(row.require("service_id")?)?,
                date: parse_date(row.require("date")?)?,
                start: parse_time(row.require("start_time")?)?,
                end: row.get("end_time").map(parse_time).transpose()?,
                client,
                notes: row.string("notes")?,
                status: row.get("status").map(parse_status).transpose()?,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

/// `UPDATE <table> SET col = expr[, ...] WHERE id = expr`, parsed with the
/// statement-level parser primitives.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let parse_err = |e: sqlparser::parser::ParserError| SqlError::Parse(e.to_string());
    let mut parser = Parser::new(&dialect).try_with_sql(sql).map_err(parse_err)?;

    if !parser.parse_keyword(Keyword::UPDATE) {
        return Err(SqlError::Parse("expected UPDATE".into()));
    }
    let name = parser.parse_object_name(false).map_err(parse_err)?;
    let table = object_name_last(&name).ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    if !parser.parse_keyword(Keyword::SET) {
        return Err(SqlError::Parse("expected SET".into()));
    }
    let assignments = parser
        .parse_comma_separated(|p| p.parse_assignment())
        .map_err(parse_err)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr().map_err(parse_err)?)
    } else {
        None
    };
    let _ = parser.consume_token(&Token::SemiColon);
    if parser.peek_token().token != Token::EOF {
        return Err(SqlError::Unsupported(format!(
            "trailing input in UPDATE: {}",
            parser.peek_token().token
        )));
    }

    let id = extract_where_id(&selection)?;
    let mut set = HashMap::new();
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.insert(col, assignment.value);
    }

    let allowed: &[&str] = match table.as_str() {
        "services" => &["name", "name_en", "duration", "price", "category", "active", "move"],
        "weekly_availability" => &["day_of_week", "start_time", "end_time", "active"],
        "clients" => &["name", "phone"],
        "appointments" => &["status", "start_time", "end_time"],
        _ => return Err(SqlError::UnknownTable(table)),
    };
    if let Some(col) = set.keys().find(|c| !allowed.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(static_table(&table), col.clone()));
    }
    let get = |col: &str| set.get(col).filter(|e| !is_null(e));

    match table.as_str() {
        "services" => {
            if let Some(expr) = set.get("move") {
                if set.len() > 1 {
                    return Err(SqlError::Unsupported("move cannot be combined with other columns".into()));
                }
                let direction = match parse_string(expr)?.to_lowercase().as_str() {
                    "up" => MoveDirection::Up,
                    "down" => MoveDirection::Down,
                    other => return Err(SqlError::Parse(format!("bad move direction: {other}"))),
                };
                return Ok(Command::MoveService { id, direction });
            }
            let patch = ServicePatch {
                name: get("name").map(parse_string).transpose()?,
                name_en: set
                    .get("name_en")
                    .map(|e| if is_null(e) { Ok(None) } else { parse_string(e).map(Some) })
                    .transpose()?,
                duration_min: get("duration").map(parse_u32).transpose()?,
                price_cents: get("price").map(parse_price).transpose()?,
                category: get("category").map(parse_category).transpose()?,
                active: get("active").map(parse_bool).transpose()?,
            };
            Ok(Command::UpdateService { id, patch })
        }
        "weekly_availability" => Ok(Command::UpdateWeekly {
            id,
            patch: WeeklyPatch {
                day_of_week: get("day_of_week").map(parse_day_of_week).transpose()?,
                start: get("start_time").map(parse_time).transpose()?,
                end: get("end_time").map(parse_time).transpose()?,
                active: get("active").map(parse_bool).transpose()?,
            },
        }),
        "clients" => Ok(Command::UpdateClient {
            id,
            name: get("name").map(parse_string).transpose()?,
            phone: get("phone").map(parse_string).transpose()?,
        }),
        // end_time is accepted but always recomputed from the service duration.
        _ => Ok(Command::UpdateAppointment {
            id,
            patch: AppointmentPatch {
                status: get("status").map(parse_status).transpose()?,
                start: get("start_time").map(parse_time).transpose()?,
            },
        }),
    }
}

fn static_table(table: &str) -> &'static str {
    match table {
        "services" => "services",
        "weekly_availability" => "weekly_availability",
        "blocked_dates" => "blocked_dates",
        "clients" => "clients",
        "appointments" => "appointments",
        _ => "?",
    }
}

// ── DELETE / SELECT ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "services" => Ok(Command::DeleteService { id }),
        "weekly_availability" => Ok(Command::DeleteWeekly { id }),
        "blocked_dates" => Ok(Command::DeleteBlockedDate { id }),
        "clients" => Ok(Command::DeleteClient { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
        _ => Err(SqlError::UnknownTable(table)),
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

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let allowed: &[&str] = match table.as_str() {
        "services" | "weekly_availability" => &["active"],
        "appointments" => &["date", "status", "client_id"],
        "slots" => &["date", "service_id"],
        "blocked_dates" | "clients" | "stats" => &[],
        _ => return Err(SqlError::UnknownTable(table)),
    };
    if let Some(col) = filters.keys().find(|c| !allowed.contains(&c.as_str())) {
        return Err(SqlError::Unsupported(format!("filter on {table}.{col}")));
    }
    let active_only = filters.get("active").map(parse_bool).transpose()?.unwrap_or(false);

    match table.as_str() {
        "services" => Ok(Command::SelectServices { active_only }),
        "weekly_availability" => Ok(Command::SelectWeekly { active_only }),
        "blocked_dates" => Ok(Command::SelectBlockedDates),
        "clients" => Ok(Command::SelectClients),
        "stats" => Ok(Command::SelectStats),
        "appointments" => Ok(Command::SelectAppointments(AppointmentFilter {
            date: filters.get("date").map(parse_date).transpose()?,
            status: filters.get("status").map(parse_status).transpose()?,
            client_id: filters.get("client_id").map(parse_ulid).transpose()?,
        })),
        _ => Ok(Command::SelectSlots {
            date: parse_date(filters.get("date").ok_or(SqlError::MissingFilter("date"))?)?,
            service_id: parse_ulid(filters.get("service_id").ok_or(SqlError::MissingFilter("service_id"))?)?,
        }),
    }
}

/// Flatten `a = x AND b = y AND ...` into a column map.
fn collect_eq_filters(expr: &Expr, out: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.insert(col, (**right).clone());
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── AST helpers ───────────────────────────────────────────────

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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let mut filters = HashMap::new();
    collect_eq_filters(selection.as_ref().ok_or(SqlError::MissingFilter("id"))?, &mut filters)?;
    match filters.get("id") {
        Some(expr) if filters.len() == 1 => parse_ulid(expr),
        _ => Err(SqlError::MissingFilter("id")),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

// ── Value parsers ─────────────────────────────────────────────

/// Text of a string or numeric literal. Casts like `'2025-01-06'::date` are unwrapped.
fn literal_text(expr: &Expr) -> Result<String, SqlError> {
    if let Expr::Cast { expr, .. } = expr {
        return literal_text(expr);
    }
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected literal, got {other}"))),
        None => Err(SqlError::Parse(format!("expected literal, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("expected non-negative integer, got {s}")))
}

fn parse_day_of_week(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_u32(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("day_of_week {v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(true),
            "false" | "f" | "0" | "no" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("bad date {s:?} (expected YYYY-MM-DD)")))
}

fn parse_time(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = literal_text(expr)?;
    s.parse().map_err(|e: ParseTimeError| SqlError::Parse(e.to_string()))
}

fn parse_status(expr: &Expr) -> Result<AppointmentStatus, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_category(expr: &Expr) -> Result<ServiceCategory, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_price(expr: &Expr) -> Result<u32, SqlError> {
    parse_price_cents(&literal_text(expr)?)
}

/// Decimal currency amount to cents: `75`, `75.5` and `75.50` are all accepted.
pub fn parse_price_cents(s: &str) -> Result<u32, SqlError> {
    let bad = || SqlError::Parse(format!("bad price: {s}"));
    let s = s.trim();
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(bad());
    }
    if frac.len() > 2 || !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let whole: u32 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| bad())? };
    let frac: u32 = match frac.len() {
        0 => 0,
        1 => frac.parse::<u32>().map_err(|_| bad())? * 10,
        _ => frac.parse().map_err(|_| bad())?,
    };
    whole
        .checked_mul(100)
        .and_then(|c| c.checked_add(frac))
        .ok_or_else(bad)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column {t}.{c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
