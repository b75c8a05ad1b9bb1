//! The session: handshake, prepared-statement cache, and the
//! execute/prepare/register surface over one connection.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::errors::{ConnectError, RequestError};
use crate::frame::request::{self, startup, Query, QueryParameters};
use crate::frame::response::error::DbError;
use crate::frame::response::result::{ColumnSpec, PreparedMetadata, ResultMetadata};
use crate::frame::response::{self, Response};
use crate::frame::server_event_type::EventType;
use crate::frame::types::Consistency;
use crate::frame::value::CqlValue;
use crate::frame::{self, Compression};
use crate::network::connection::{Connection, ConnectionConfig, ConnectionState, TaskResponse};
use crate::network::EventStream;
use crate::serialize::bind_values;

use super::query_result::QueryResult;

/// Configuration of a session and its single connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Value sent as `CQL_VERSION` in STARTUP.
    pub cql_version: String,
    /// Compression to request. Dropped (with a warning) when the server
    /// does not advertise the algorithm.
    pub compression: Option<Compression>,
    pub max_frame_size: usize,
    /// Bound on opening the TCP connection.
    pub connect_timeout: Duration,
    /// Bound on the whole OPTIONS/STARTUP handshake.
    pub handshake_timeout: Duration,
    /// Consistency used when the caller does not pass one.
    pub default_consistency: Consistency,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cql_version: startup::DEFAULT_CQL_VERSION.to_owned(),
            compression: None,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            default_consistency: Consistency::One,
        }
    }
}

/// A server-side prepared statement with the metadata needed to bind and
/// decode it. Valid for the lifetime of the connection that prepared it.
#[derive(Debug)]
pub struct PreparedStatement {
    id: Bytes,
    statement: String,
    prepared_metadata: PreparedMetadata,
    result_metadata: ResultMetadata,
}

impl PreparedStatement {
    /// The opaque server-assigned id.
    pub fn id(&self) -> &Bytes {
        &self.id
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// Column specs of the bind parameters, used to typecheck values.
    pub fn bind_specs(&self) -> &[ColumnSpec] {
        &self.prepared_metadata.col_specs
    }

    pub fn result_specs(&self) -> &[ColumnSpec] {
        &self.result_metadata.col_specs
    }
}

/// A ready session over one connection.
///
/// `execute` sends bare statements as QUERY; parameterised statements
/// take the prepared path, with a per-connection cache keyed by
/// statement text so repeated executions prepare only once.
#[derive(Debug)]
pub struct Session {
    connection: Arc<Connection>,
    prepared_cache: DashMap<String, Arc<PreparedStatement>>,
    default_consistency: Consistency,
}

impl Session {
    /// Connects over TCP and performs the handshake.
    pub async fn connect(addr: SocketAddr, config: SessionConfig) -> Result<Self, ConnectError> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectError::ConnectTimeout(config.connect_timeout))??;
        stream.set_nodelay(true)?;
        Self::connect_over(stream, config).await
    }

    /// Performs the handshake over an already-established transport
    /// (e.g. a TLS stream); the engine treats it as an opaque duplex
    /// byte pipe.
    pub async fn connect_over(
        transport: impl AsyncRead + AsyncWrite + Send + 'static,
        config: SessionConfig,
    ) -> Result<Self, ConnectError> {
        let connection = Connection::new(
            transport,
            ConnectionConfig {
                compression: config.compression,
                max_frame_size: config.max_frame_size,
            },
        );

        let handshake_timeout = config.handshake_timeout;
        let handshake = Self::handshake(&connection, &config);
        match tokio::time::timeout(handshake_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(connect_error)) => {
                connection.close();
                return Err(connect_error);
            }
            Err(_elapsed) => {
                connection.close();
                return Err(RequestError::HandshakeTimeout(handshake_timeout).into());
            }
        }

        Ok(Session {
            connection: Arc::new(connection),
            prepared_cache: DashMap::new(),
            default_consistency: config.default_consistency,
        })
    }

    /// OPTIONS (when compression is requested) followed by STARTUP.
    /// Handshake frames are never compressed.
    async fn handshake(connection: &Connection, config: &SessionConfig) -> Result<(), ConnectError> {
        if let Some(requested) = config.compression {
            let supported = Self::fetch_supported(connection).await?;
            let advertised = supported.compression_algorithms();
            if !advertised.iter().any(|name| name == requested.as_startup_name()) {
                warn!(
                    requested = requested.as_startup_name(),
                    ?advertised,
                    "server does not advertise the requested compression, proceeding uncompressed"
                );
                connection.disable_compression();
            }
        }

        let mut options: HashMap<Cow<'_, str>, Cow<'_, str>> = HashMap::new();
        options.insert(
            Cow::Borrowed(startup::CQL_VERSION),
            Cow::Borrowed(config.cql_version.as_str()),
        );
        if let Some(compression) = connection.negotiated_compression() {
            options.insert(
                Cow::Borrowed(startup::COMPRESSION),
                Cow::Borrowed(compression.as_startup_name()),
            );
        }

        connection.set_state(ConnectionState::StartupSent);
        let task_response = connection
            .send_request(&request::Startup { options }, false)
            .await?;

        match task_response.response {
            Response::Ready => {
                debug!("connection is ready");
                connection.set_state(ConnectionState::Ready);
                Ok(())
            }
            Response::Authenticate(authenticate) => {
                connection.set_state(ConnectionState::AuthRequired);
                Err(ConnectError::AuthenticationRequired {
                    authenticator: authenticate.authenticator_name,
                })
            }
            Response::Error(error) => {
                Err(RequestError::ServerError(error.error, error.reason).into())
            }
            other => Err(ConnectError::UnexpectedResponse {
                request: "STARTUP",
                response: other.kind_name(),
            }),
        }
    }

    async fn fetch_supported(
        connection: &Connection,
    ) -> Result<response::Supported, ConnectError> {
        let task_response = connection.send_request(&request::Options, false).await?;
        match task_response.response {
            Response::Supported(supported) => Ok(supported),
            Response::Error(error) => {
                Err(RequestError::ServerError(error.error, error.reason).into())
            }
            other => Err(ConnectError::UnexpectedResponse {
                request: "OPTIONS",
                response: other.kind_name(),
            }),
        }
    }

    /// Executes a statement at the session's default consistency.
    pub async fn execute(
        &self,
        statement: &str,
        values: &[Option<CqlValue>],
    ) -> Result<QueryResult, RequestError> {
        self.execute_with_consistency(statement, values, self.default_consistency)
            .await
    }

    /// Executes a statement.
    ///
    /// Without values the statement goes out as QUERY. With values it is
    /// bound against the prepared bind specs (preparing and caching on
    /// first use) and goes out as EXECUTE; a binding mismatch fails
    /// before any frame is written.
    pub async fn execute_with_consistency(
        &self,
        statement: &str,
        values: &[Option<CqlValue>],
        consistency: Consistency,
    ) -> Result<QueryResult, RequestError> {
        if values.is_empty() {
            let query = Query {
                contents: Cow::Borrowed(statement),
                parameters: QueryParameters {
                    consistency,
                    ..Default::default()
                },
            };
            let task_response = self.connection.send_request(&query, self.compress()).await?;
            return self.finish_execution("QUERY", statement, task_response);
        }

        let prepared = self.get_or_prepare(statement).await?;
        let serialized_values = bind_values(values, prepared.bind_specs())?;
        let execute = request::Execute {
            id: prepared.id.clone(),
            parameters: QueryParameters {
                consistency,
                values: Cow::Owned(serialized_values),
                ..Default::default()
            },
        };
        let task_response = self
            .connection
            .send_request(&execute, self.compress())
            .await?;
        self.finish_execution("EXECUTE", statement, task_response)
    }

    /// Prepares a statement and caches the handle under its text.
    pub async fn prepare(&self, statement: &str) -> Result<Arc<PreparedStatement>, RequestError> {
        let prepare = request::Prepare {
            query: Cow::Borrowed(statement),
        };
        let task_response = self
            .connection
            .send_request(&prepare, self.compress())
            .await?;

        match task_response.response {
            Response::Result(response::result::Result::Prepared(prepared)) => {
                let prepared = Arc::new(PreparedStatement {
                    id: prepared.id,
                    statement: statement.to_owned(),
                    prepared_metadata: prepared.prepared_metadata,
                    result_metadata: prepared.result_metadata,
                });
                self.prepared_cache
                    .insert(statement.to_owned(), prepared.clone());
                Ok(prepared)
            }
            Response::Error(error) => Err(RequestError::ServerError(error.error, error.reason)),
            other => Err(RequestError::UnexpectedResponse {
                request: "PREPARE",
                response: other.kind_name(),
            }),
        }
    }

    /// Subscribes to the given event categories: sends REGISTER and
    /// returns the stream the dispatcher will push matching events into.
    pub async fn register(&self, event_types: &[EventType]) -> Result<EventStream, RequestError> {
        // Subscribe locally first, so an event raced right behind the
        // READY cannot fall into a gap.
        let event_stream = self.connection.subscribe_to_events(event_types);

        let register = request::Register {
            event_types: event_types.to_vec(),
        };
        let task_response = self
            .connection
            .send_request(&register, self.compress())
            .await?;
        match task_response.response {
            Response::Ready => Ok(event_stream),
            Response::Error(error) => Err(RequestError::ServerError(error.error, error.reason)),
            other => Err(RequestError::UnexpectedResponse {
                request: "REGISTER",
                response: other.kind_name(),
            }),
        }
    }

    /// Closes the connection. Every in-flight request is completed with
    /// the connection-closed kind.
    pub fn close(&self) {
        self.connection.close();
    }

    async fn get_or_prepare(&self, statement: &str) -> Result<Arc<PreparedStatement>, RequestError> {
        if let Some(prepared) = self.prepared_cache.get(statement) {
            return Ok(Arc::clone(&prepared));
        }
        self.prepare(statement).await
    }

    fn finish_execution(
        &self,
        request: &'static str,
        statement: &str,
        task_response: TaskResponse,
    ) -> Result<QueryResult, RequestError> {
        match task_response.response {
            Response::Result(result) => Ok(QueryResult::from_result(
                result,
                task_response.warnings,
                task_response.tracing_id,
            )),
            Response::Error(error) => {
                if let DbError::Unprepared { .. } = error.error {
                    // The server lost the statement (e.g. it restarted);
                    // evict so the next execution re-prepares.
                    debug!(statement, "evicting unprepared statement from cache");
                    self.prepared_cache.remove(statement);
                }
                Err(RequestError::ServerError(error.error, error.reason))
            }
            other => Err(RequestError::UnexpectedResponse {
                request,
                response: other.kind_name(),
            }),
        }
    }

    fn compress(&self) -> bool {
        self.connection.negotiated_compression().is_some()
    }
}
