use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSlot {
        slot: TimeSlot,
    },
    UpdateSlot {
        id: Ulid,
        coach_id: Ulid,
        patch: SlotPatch,
    },
    DeleteSlot {
        id: Ulid,
        coach_id: Ulid,
    },
    SelectSlots {
        coach_id: Ulid,
    },
    SelectAvailability {
        coach_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    },
    InsertSession {
        client_id: Ulid,
        req: BookingRequest,
    },
    UpdateSession {
        id: Ulid,
        actor_id: Ulid,
        patch: SessionPatch,
    },
    SelectSessions {
        actor_id: Ulid,
        id: Option<Ulid>,
        filter: SessionFilter,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        // (id, coach_id, day_of_week, specific_date, start_time, end_time
        //  [, duration, medium, note])
        "slots" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("slots", 6, values.len()));
            }
            let day_of_week = parse_u8_or_null(&values[2])?;
            let specific_date = parse_date_or_null(&values[3])?;
            let day = match (day_of_week, specific_date) {
                (Some(dow), None) => DayKey::Week(dow),
                (None, Some(date)) => DayKey::Date(date),
                _ => {
                    return Err(SqlError::Parse(
                        "exactly one of day_of_week and specific_date must be non-NULL".into(),
                    ));
                }
            };
            let window = Window {
                start: parse_time(&values[4])?,
                end: parse_time(&values[5])?,
            };
            let duration_min = if values.len() >= 7 {
                parse_u32(&values[6])?
            } else {
                window.duration_min()
            };
            let medium = if values.len() >= 8 {
                parse_medium(&values[7])?
            } else {
                Medium::Both
            };
            let note = if values.len() >= 9 {
                parse_str_or_null(&values[8])?
            } else {
                None
            };
            Ok(Command::InsertSlot {
                slot: TimeSlot {
                    id: parse_ulid(&values[0])?,
                    coach_id: parse_ulid(&values[1])?,
                    day,
                    window,
                    duration_min,
                    medium,
                    available: true,
                    note,
                },
            })
        }
        // (id, coach_id, client_id, scheduled_date, start_time, end_time
        //  [, medium, title, notes, slot_id])
        "sessions" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("sessions", 6, values.len()));
            }
            let medium = if values.len() >= 7 {
                match parse_str_or_null(&values[6])? {
                    Some(s) => Some(s.parse::<Medium>().map_err(SqlError::Parse)?),
                    None => None,
                }
            } else {
                None
            };
            let title = if values.len() >= 8 {
                parse_str_or_null(&values[7])?
            } else {
                None
            };
            let notes = if values.len() >= 9 {
                parse_str_or_null(&values[8])?
            } else {
                None
            };
            let slot_id = if values.len() >= 10 {
                parse_ulid_or_null(&values[9])?
            } else {
                None
            };
            Ok(Command::InsertSession {
                client_id: parse_ulid(&values[2])?,
                req: BookingRequest {
                    id: parse_ulid(&values[0])?,
                    coach_id: parse_ulid(&values[1])?,
                    scheduled_date: parse_date(&values[3])?,
                    window: Window {
                        start: parse_time(&values[4])?,
                        end: parse_time(&values[5])?,
                    },
                    medium,
                    title,
                    notes,
                    slot_id,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let filters = collect_filters(selection)?;

    match table.as_str() {
        "slots" => {
            let id = filters.eq_ulid("id")?;
            let coach_id = filters.eq_ulid("coach_id")?;
            let mut patch = SlotPatch::default();
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "start_time" => patch.start = Some(parse_time(&a.value)?),
                    "end_time" => patch.end = Some(parse_time(&a.value)?),
                    "is_available" => patch.available = Some(parse_bool(&a.value)?),
                    "duration" => patch.duration_min = Some(parse_u32(&a.value)?),
                    "medium" => patch.medium = Some(parse_medium(&a.value)?),
                    "note" => patch.note = parse_str_or_null(&a.value)?,
                    col => return Err(SqlError::UnknownColumn(col.to_string())),
                }
            }
            Ok(Command::UpdateSlot { id, coach_id, patch })
        }
        "sessions" => {
            let id = filters.eq_ulid("id")?;
            let actor_id = filters.eq_ulid("actor_id")?;
            let mut patch = SessionPatch::default();
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "status" => {
                        let s = parse_str(&a.value)?;
                        patch.status = Some(s.parse::<SessionStatus>().map_err(SqlError::Parse)?);
                    }
                    "title" => patch.title = parse_str_or_null(&a.value)?,
                    "notes" => patch.notes = parse_str_or_null(&a.value)?,
                    "coach_notes" => patch.coach_notes = parse_str_or_null(&a.value)?,
                    "client_notes" => patch.client_notes = parse_str_or_null(&a.value)?,
                    "meeting_link" => patch.meeting_link = parse_str_or_null(&a.value)?,
                    "location" => patch.location = parse_str_or_null(&a.value)?,
                    "cancel_reason" => patch.cancel_reason = parse_str_or_null(&a.value)?,
                    col => return Err(SqlError::UnknownColumn(col.to_string())),
                }
            }
            Ok(Command::UpdateSession { id, actor_id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_filters(&delete.selection)?;

    match table.as_str() {
        "slots" => Ok(Command::DeleteSlot {
            id: filters.eq_ulid("id")?,
            coach_id: filters.eq_ulid("coach_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = collect_filters(&select.selection)?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            coach_id: filters.eq_ulid("coach_id")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            coach_id: filters.eq_ulid("coach_id")?,
            from: filters.gte_date("date")?,
            to: filters.lte_date("date")?,
        }),
        "sessions" => {
            let actor_id = filters.eq_ulid("actor_id")?;
            let id = filters.opt_eq_ulid("id")?;
            let status = match filters.opt_eq_str("status")? {
                Some(s) => Some(s.parse::<SessionStatus>().map_err(SqlError::Parse)?),
                None => None,
            };
            let date = filters.opt_eq_date("date")?;
            let upcoming = filters.opt_eq_bool("upcoming")?.unwrap_or(false);
            Ok(Command::SelectSessions {
                actor_id,
                id,
                filter: SessionFilter {
                    status,
                    date,
                    upcoming,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clause walker ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    GtEq,
    LtEq,
}

/// Conjunctive WHERE filters, flattened. Unsupported operators are rejected
/// rather than silently dropped — a filter we ignore would widen the result.
struct Filters<'a>(Vec<(String, FilterOp, &'a Expr)>);

fn collect_filters(selection: &Option<Expr>) -> Result<Filters<'_>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk_filters(expr, &mut out)?;
    }
    Ok(Filters(out))
}

fn walk_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, FilterOp, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => {
            let filter_op = match op {
                ast::BinaryOperator::And => {
                    walk_filters(left, out)?;
                    walk_filters(right, out)?;
                    return Ok(());
                }
                ast::BinaryOperator::Eq => FilterOp::Eq,
                ast::BinaryOperator::GtEq => FilterOp::GtEq,
                ast::BinaryOperator::LtEq => FilterOp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse("expected column on left of filter".into()))?;
            out.push((col, filter_op, right));
            Ok(())
        }
        Expr::Nested(inner) => walk_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

impl<'a> Filters<'a> {
    fn find(&self, col: &str, op: FilterOp) -> Option<&'a Expr> {
        self.0
            .iter()
            .find(|(c, o, _)| c == col && *o == op)
            .map(|(_, _, e)| *e)
    }

    fn eq_ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.opt_eq_ulid(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn opt_eq_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.find(col, FilterOp::Eq).map(parse_ulid).transpose()
    }

    fn opt_eq_str(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.find(col, FilterOp::Eq).map(parse_str).transpose()
    }

    fn opt_eq_date(&self, col: &str) -> Result<Option<NaiveDate>, SqlError> {
        self.find(col, FilterOp::Eq).map(parse_date).transpose()
    }

    fn opt_eq_bool(&self, col: &str) -> Result<Option<bool>, SqlError> {
        self.find(col, FilterOp::Eq).map(parse_bool).transpose()
    }

    fn gte_date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        self.find(col, FilterOp::GtEq)
            .map(parse_date)
            .transpose()?
            .ok_or(SqlError::MissingFilter(col))
    }

    fn lte_date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        self.find(col, FilterOp::LtEq)
            .map(parse_date)
            .transpose()?
            .ok_or(SqlError::MissingFilter(col))
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

// ── Value parsers ─────────────────────────────────────────────

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_str(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_str_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_str(expr).map(Some),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_str(expr)?;
    s.parse()
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_date(expr).map(Some),
    }
}

fn parse_time(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = parse_str(expr)?;
    s.parse()
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

fn parse_medium(expr: &Expr) -> Result<Medium, SqlError> {
    parse_str(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad number: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u8_or_null(expr: &Expr) -> Result<Option<u8>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => {
            let v = parse_i64(expr)?;
            u8::try_from(v)
                .map(Some)
                .map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
        }
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
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
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
