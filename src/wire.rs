use std::fmt::Debug;
use std::io;
use std::ops::Range;
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
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::{ActorDirectory, RoombookAuthSource};
use crate::engine::{now_ms, Engine, EngineError, ValidationError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingFilter, Command};

pub struct RoombookHandler {
    engine: Arc<Engine>,
    actors: ActorDirectory,
    query_parser: Arc<RoombookQueryParser>,
}

impl RoombookHandler {
    pub fn new(engine: Arc<Engine>, actors: ActorDirectory) -> Self {
        Self {
            engine,
            actors,
            query_parser: Arc::new(RoombookQueryParser),
        }
    }

    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> Actor {
        let login = client
            .metadata()
            .get("user")
            .map(String::as_str)
            .unwrap_or_default();
        self.actors.resolve(login)
    }

    async fn execute<C: ClientInfo>(&self, client: &C, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let actor = self.resolve_actor(client);
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(actor, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(&self, actor: Actor, cmd: Command) -> Result<Response, EngineError> {
        if cmd.is_mutation() {
            // Detached so a dropped client cannot stop a commit between the
            // WAL append and the in-memory apply.
            let engine = self.engine.clone();
            let tag = tokio::spawn(async move { apply_mutation(&engine, &actor, cmd).await })
                .await
                .map_err(|e| EngineError::WalError(format!("mutation task failed: {e}")))??;
            return Ok(Response::Execution(tag));
        }

        match cmd {
            Command::SelectRooms { id } => {
                let rooms = match id {
                    Some(id) => self.engine.get_room(&id).await.into_iter().collect(),
                    None => self.engine.list_rooms().await,
                };
                Ok(rooms_response(rooms))
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::All => {
                        require_superuser(&actor)?;
                        self.engine.list_bookings().await
                    }
                    BookingFilter::Owner(owner) => {
                        if owner != actor.id {
                            require_superuser(&actor)?;
                        }
                        self.engine.list_bookings_by_owner(&owner).await
                    }
                    BookingFilter::Room(room_id) => {
                        self.engine
                            .list_future_bookings_for_room(room_id, now_ms())
                            .await?
                    }
                    BookingFilter::Id(id) => match self.engine.get_booking(id).await {
                        Some(booking) => {
                            authorize_booking(&actor, &booking)?;
                            vec![booking]
                        }
                        None => Vec::new(),
                    },
                };
                Ok(bookings_response(bookings))
            }
            Command::SelectConflicts {
                room_id,
                start,
                end,
                exclude,
            } => {
                let candidate = Interval::new(start, end)
                    .ok_or(ValidationError::InvertedInterval { start, end })?;
                let overlaps = self
                    .engine
                    .find_overlaps(room_id, candidate, exclude)
                    .await?;
                Ok(bookings_response(overlaps))
            }
            other => unreachable!("{other:?} is a mutation"),
        }
    }
}

async fn apply_mutation(engine: &Engine, actor: &Actor, cmd: Command) -> Result<Tag, EngineError> {
    if !actor.is_active {
        return Err(EngineError::Forbidden("inactive user"));
    }
    match cmd {
        Command::InsertRoom {
            id,
            name,
            description,
        } => {
            require_superuser(actor)?;
            engine
                .create_room(id.unwrap_or_else(Ulid::new), &name, description)
                .await?;
            Ok(Tag::new("INSERT").with_rows(1))
        }
        Command::UpdateRoom {
            id,
            name,
            description,
        } => {
            require_superuser(actor)?;
            engine.update_room(id, name.as_deref(), description).await?;
            Ok(Tag::new("UPDATE").with_rows(1))
        }
        Command::DeleteRoom { id } => {
            require_superuser(actor)?;
            engine.delete_room(id).await?;
            Ok(Tag::new("DELETE").with_rows(1))
        }
        Command::InsertBooking { id, room_id, raw } => {
            let booking = engine.create_booking(id, room_id, raw, Some(actor)).await?;
            debug!("{} booked {}", actor.id, booking.id);
            Ok(Tag::new("INSERT").with_rows(1))
        }
        Command::UpdateBooking { id, raw } => {
            owned_booking(engine, actor, id).await?;
            engine.update_booking(id, raw).await?;
            Ok(Tag::new("UPDATE").with_rows(1))
        }
        Command::DeleteBooking { id } => {
            owned_booking(engine, actor, id).await?;
            engine.cancel_booking(id).await?;
            Ok(Tag::new("DELETE").with_rows(1))
        }
        other => unreachable!("{other:?} is not a mutation"),
    }
}

async fn owned_booking(engine: &Engine, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
    let booking = engine.get_booking(id).await.ok_or(EngineError::NotFound(id))?;
    authorize_booking(actor, &booking)?;
    Ok(booking)
}

fn authorize_booking(actor: &Actor, booking: &Booking) -> Result<(), EngineError> {
    if actor.is_superuser || booking.owner_id.as_deref() == Some(actor.id.as_str()) {
        Ok(())
    } else {
        Err(EngineError::Forbidden("booking belongs to another user"))
    }
}

fn require_superuser(actor: &Actor) -> Result<(), EngineError> {
    if actor.is_superuser {
        Ok(())
    } else {
        Err(EngineError::Forbidden("superuser required"))
    }
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new(
            "description".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("room_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("start".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("end".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("owner_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn rooms_response(rooms: Vec<RoomInfo>) -> Response {
    let schema = Arc::new(rooms_schema());
    let rows: Vec<PgWireResult<_>> = rooms
        .into_iter()
        .map(|room| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&room.id.to_string())?;
            encoder.encode_field(&room.name)?;
            encoder.encode_field(&room.description)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn bookings_response(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.room_id.to_string())?;
            encoder.encode_field(&b.interval.start)?;
            encoder.encode_field(&b.interval.end)?;
            encoder.encode_field(&b.owner_id)?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns for a statement, by the table it selects from.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("FROM ROOMS") {
        rooms_schema()
    } else if upper.contains("FROM BOOKINGS") || upper.contains("FROM CONFLICTS") {
        bookings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for RoombookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.execute(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoombookQueryParser;

#[async_trait]
impl QueryParser for RoombookQueryParser {
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
impl ExtendedQueryHandler for RoombookHandler {
    type Statement = String;
    type QueryParser = RoombookQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.execute(client, &sql).await
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

/// Byte ranges and indexes of `$N` placeholders outside quoted literals
/// and identifiers.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves us inside.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            None => i += 1,
        }
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace `$1, $2, ...` with the bound values as quoted text literals, in
/// one left-to-right pass. Substituted text is never rescanned.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|idx| params.get(idx)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoombookFactory {
    handler: Arc<RoombookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<RoombookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl RoombookFactory {
    pub fn new(engine: Arc<Engine>, actors: ActorDirectory, password: String) -> Self {
        Self {
            handler: Arc::new(RoombookHandler::new(engine, actors)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                RoombookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoombookFactory {
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
    factory: Arc<RoombookFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) | EngineError::NameTaken(_) => "23505",
        EngineError::Conflict(_) | EngineError::Concurrency { .. } => "23P01",
        EngineError::Forbidden(_) => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    };
    if matches!(e, EngineError::WalError(_)) {
        warn!("{e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
