use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use futures::stream;
use futures::Sink;
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

use crate::auth::CoachdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct CoachdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<CoachdQueryParser>,
}

impl CoachdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(CoachdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = crate::observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.dispatch(engine, cmd).await;
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        metrics::counter!(
            crate::observability::QUERIES_TOTAL,
            "command" => label,
            "status" => if result.is_ok() { "ok" } else { "error" }
        )
        .increment(1);
        result
    }

    async fn dispatch(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let now = Local::now().naive_local();
        match cmd {
            Command::InsertSlot { slot } => {
                engine.create_slot(slot).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateSlot {
                id,
                coach_id,
                patch,
            } => {
                engine
                    .update_slot(coach_id, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteSlot { id, coach_id } => {
                engine
                    .delete_slot(coach_id, id, now.date())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectSlots { coach_id } => {
                let slots = engine.list_slots(coach_id).await;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .iter()
                    .map(|slot| encode_slot(&schema, slot))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAvailability { coach_id, from, to } => {
                let days = engine
                    .get_availability(coach_id, from, to)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut rows: Vec<PgWireResult<_>> = Vec::new();
                for day in &days {
                    for slot in &day.slots {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        let r = encoder
                            .encode_field(&day.date.to_string())
                            .and_then(|()| encoder.encode_field(&slot.slot_id.to_string()))
                            .and_then(|()| encoder.encode_field(&slot.window.start.to_string()))
                            .and_then(|()| encoder.encode_field(&slot.window.end.to_string()))
                            .and_then(|()| encoder.encode_field(&(slot.duration_min as i64)))
                            .and_then(|()| encoder.encode_field(&slot.medium.to_string()))
                            .and_then(|()| encoder.encode_field(&slot.is_booked));
                        rows.push(r.map(|()| encoder.take_row()));
                    }
                }
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::InsertSession { client_id, req } => {
                engine
                    .book_session(client_id, req)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateSession {
                id,
                actor_id,
                patch,
            } => {
                engine
                    .update_session(actor_id, id, patch, now)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectSessions {
                actor_id,
                id,
                filter,
            } => {
                let sessions = match id {
                    Some(id) => vec![engine.get_session(actor_id, id).await.map_err(engine_err)?],
                    None => engine.list_sessions(actor_id, filter, now.date()).await,
                };
                let schema = Arc::new(sessions_schema());
                let rows: Vec<PgWireResult<_>> = sessions
                    .iter()
                    .map(|s| encode_session(&schema, s))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

// ── Row schemas (all text format) ────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("coach_id", Type::VARCHAR),
        text_field("day_of_week", Type::INT2),
        text_field("specific_date", Type::VARCHAR),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("duration", Type::INT8),
        text_field("medium", Type::VARCHAR),
        text_field("is_available", Type::BOOL),
        text_field("note", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("date", Type::VARCHAR),
        text_field("slot_id", Type::VARCHAR),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("duration", Type::INT8),
        text_field("medium", Type::VARCHAR),
        text_field("is_booked", Type::BOOL),
    ]
}

fn sessions_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("coach_id", Type::VARCHAR),
        text_field("client_id", Type::VARCHAR),
        text_field("slot_id", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("duration", Type::INT8),
        text_field("medium", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("title", Type::VARCHAR),
        text_field("notes", Type::VARCHAR),
        text_field("coach_notes", Type::VARCHAR),
        text_field("client_notes", Type::VARCHAR),
        text_field("meeting_link", Type::VARCHAR),
        text_field("location", Type::VARCHAR),
        text_field("canceled_by", Type::VARCHAR),
        text_field("cancel_reason", Type::VARCHAR),
    ]
}

fn encode_slot(
    schema: &Arc<Vec<FieldInfo>>,
    slot: &TimeSlot,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let (day_of_week, specific_date) = match slot.day {
        DayKey::Week(dow) => (Some(dow as i16), None),
        DayKey::Date(d) => (None, Some(d.to_string())),
    };
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&slot.id.to_string())?;
    encoder.encode_field(&slot.coach_id.to_string())?;
    encoder.encode_field(&day_of_week)?;
    encoder.encode_field(&specific_date)?;
    encoder.encode_field(&slot.window.start.to_string())?;
    encoder.encode_field(&slot.window.end.to_string())?;
    encoder.encode_field(&(slot.duration_min as i64))?;
    encoder.encode_field(&slot.medium.to_string())?;
    encoder.encode_field(&slot.available)?;
    encoder.encode_field(&slot.note)?;
    Ok(encoder.take_row())
}

fn encode_session(
    schema: &Arc<Vec<FieldInfo>>,
    s: &Session,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.coach_id.to_string())?;
    encoder.encode_field(&s.client_id.to_string())?;
    encoder.encode_field(&s.slot_id.map(|id| id.to_string()))?;
    encoder.encode_field(&s.date.to_string())?;
    encoder.encode_field(&s.window.start.to_string())?;
    encoder.encode_field(&s.window.end.to_string())?;
    encoder.encode_field(&(s.duration_min as i64))?;
    encoder.encode_field(&s.medium.to_string())?;
    encoder.encode_field(&s.status.to_string())?;
    encoder.encode_field(&s.title)?;
    encoder.encode_field(&s.notes)?;
    encoder.encode_field(&s.coach_notes)?;
    encoder.encode_field(&s.client_notes)?;
    encoder.encode_field(&s.meeting_link)?;
    encoder.encode_field(&s.location)?;
    encoder.encode_field(&s.canceled_by.map(|r| r.to_string()))?;
    encoder.encode_field(&s.cancel_reason)?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for CoachdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CoachdQueryParser;

fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("SESSIONS") {
        sessions_schema()
    } else if upper.contains("SLOTS") {
        slots_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl QueryParser for CoachdQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CoachdHandler {
    type Statement = String;
    type QueryParser = CoachdQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
        Ok(responses.remove(0))
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory / connection entry point ─────────────────────────────

pub struct CoachdFactory {
    handler: Arc<CoachdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CoachdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CoachdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = CoachdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CoachdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CoachdFactory {
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

/// Serve one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let factory = Arc::new(CoachdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await?;
    Ok(())
}

/// Map engine errors onto SQLSTATE codes clients can branch on.
fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::Overlap(_) | EngineError::SlotTaken | EngineError::Conflict(_) => "23505",
        _ => "P0001",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
