//! End-to-end scenarios against a mock server speaking raw protocol
//! v4 bytes over an in-memory duplex transport.

use std::time::Duration;

use assert_matches::assert_matches;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::client::{Session, SessionConfig};
use crate::errors::{ConnectError, RequestError};
use crate::frame::request::{Request, RequestOpcode};
use crate::frame::response::error::DbError;
use crate::frame::response::event::{SchemaChangeEvent, SchemaChangeType};
use crate::frame::response::ResponseOpcode;
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use crate::frame::value::CqlValue;
use crate::frame::{self, Compression};
use crate::Event;

fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The server end of the duplex transport, reading request frames and
/// writing hand-built response frames.
struct MockServer {
    stream: DuplexStream,
    compression: Option<Compression>,
}

struct RequestFrame {
    flags: u8,
    stream: i16,
    opcode: RequestOpcode,
    body: Vec<u8>,
}

impl RequestFrame {
    fn parse(&self) -> Request<'_> {
        Request::deserialize(&mut &self.body[..], self.opcode).unwrap()
    }
}

impl MockServer {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            compression: None,
        }
    }

    async fn read_request(&mut self) -> RequestFrame {
        let mut header = [0u8; 9];
        self.stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x04, "request version byte");

        let flags = header[1];
        let stream = i16::from_be_bytes([header[2], header[3]]);
        let opcode = RequestOpcode::try_from(header[4]).unwrap();
        let length = u32::from_be_bytes(header[5..9].try_into().unwrap()) as usize;

        let mut body = vec![0u8; length];
        self.stream.read_exact(&mut body).await.unwrap();

        if flags & 0x01 != 0 {
            let compression = self.compression.expect("compressed frame, none negotiated");
            body = frame::decompress(&body, compression).unwrap();
        }

        RequestFrame {
            flags,
            stream,
            opcode,
            body,
        }
    }

    async fn send_frame(&mut self, stream: i16, opcode: ResponseOpcode, body: &[u8]) {
        self.send_raw_frame(0x84, 0x00, stream, opcode as u8, body)
            .await;
    }

    async fn send_raw_frame(&mut self, version: u8, flags: u8, stream: i16, opcode: u8, body: &[u8]) {
        let mut data = vec![version, flags];
        data.extend_from_slice(&stream.to_be_bytes());
        data.push(opcode);
        data.extend_from_slice(&(body.len() as u32).to_be_bytes());
        data.extend_from_slice(body);
        self.stream.write_all(&data).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    async fn send_ready(&mut self, stream: i16) {
        self.send_frame(stream, ResponseOpcode::Ready, &[]).await;
    }

    async fn send_void_result(&mut self, stream: i16) {
        let mut body = Vec::new();
        types::write_int(0x0001, &mut body);
        self.send_frame(stream, ResponseOpcode::Result, &body).await;
    }

    async fn send_error(&mut self, stream: i16, code: i32, reason: &str) {
        let mut body = Vec::new();
        types::write_int(code, &mut body);
        types::write_string(reason, &mut body).unwrap();
        self.send_frame(stream, ResponseOpcode::Error, &body).await;
    }

    /// Answers the STARTUP frame, asserting it goes out plain on
    /// stream 0, and leaves the connection ready.
    async fn handle_startup(&mut self) {
        let request = self.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Startup);
        assert_eq!(request.stream, 0, "handshake must use stream 0");
        assert_eq!(request.flags, 0, "STARTUP must not be compressed");
        self.send_ready(request.stream).await;
    }

    /// Answers OPTIONS with a SUPPORTED advertising the given
    /// compression algorithms.
    async fn handle_options(&mut self, algorithms: &[&str]) {
        let request = self.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Options);
        let mut options = std::collections::HashMap::new();
        options.insert(
            "COMPRESSION".to_owned(),
            algorithms.iter().map(|s| s.to_string()).collect(),
        );
        options.insert("CQL_VERSION".to_owned(), vec!["3.4.4".to_owned()]);
        let mut body = Vec::new();
        types::write_string_multimap(&options, &mut body).unwrap();
        self.send_frame(request.stream, ResponseOpcode::Supported, &body)
            .await;
    }
}

/// Connects a session to a fresh mock server, driving the plain
/// (uncompressed) handshake.
async fn connect_pair(config: SessionConfig) -> (Session, MockServer) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let mut server = MockServer::new(server_io);

    let connect = Session::connect_over(client_io, config);
    let serve = async {
        server.handle_startup().await;
        server
    };

    let (session, server) = tokio::join!(connect, serve);
    (session.unwrap(), server)
}

/// Scenario S1: STARTUP is a one-entry string map on stream 0; READY
/// makes the session usable.
#[tokio::test]
async fn startup_ready_handshake() {
    setup_tracing();
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let mut server = MockServer::new(server_io);

    let connect = Session::connect_over(client_io, SessionConfig::default());
    let serve = async {
        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Startup);
        assert_eq!(request.stream, 0);
        assert_eq!(request.flags, 0);
        // The body is the literal 22-byte map {"CQL_VERSION": "3.4.4"}.
        assert_eq!(request.body.len(), 0x16);
        let startup = match request.parse() {
            Request::Startup(startup) => startup,
            other => panic!("expected STARTUP, got {:?}", other),
        };
        assert_eq!(startup.options.len(), 1);
        assert_eq!(startup.options.get("CQL_VERSION").unwrap(), "3.4.4");
        server.send_ready(request.stream).await;
        server
    };

    let (session, _server) = tokio::join!(connect, serve);
    session.unwrap();
}

/// Scenario S2: a bare statement goes out as QUERY with no flags and a
/// Void RESULT resolves it on the same stream.
#[tokio::test]
async fn bare_statement_is_a_query() {
    setup_tracing();
    let (session, mut server) = connect_pair(SessionConfig::default()).await;

    let execute = session.execute("USE system", &[]);
    let serve = async {
        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Query);
        let query = match request.parse() {
            Request::Query(query) => query,
            other => panic!("expected QUERY, got {:?}", other),
        };
        assert_eq!(query.contents, "USE system");
        assert_eq!(query.parameters.consistency, crate::Consistency::One);
        assert!(query.parameters.values.is_empty());
        server.send_void_result(request.stream).await;
        request.stream
    };

    let (result, _stream) = tokio::join!(execute, serve);
    let result = result.unwrap();
    assert!(result.rows().is_none());
}

/// Scenario S3 + property 8: the first parameterised execution prepares
/// and executes; the second executes without another PREPARE, and the
/// bound int 42 is the canonical five-byte cell.
#[tokio::test]
async fn prepared_statement_caching_and_binding() {
    setup_tracing();
    let (session, mut server) = connect_pair(SessionConfig::default()).await;

    let statement = "SELECT * FROM t WHERE k=?";
    let prepared_id = [0xAB_u8; 16];

    let serve = async {
        // First execution: PREPARE...
        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Prepare);
        assert_matches!(request.parse(), Request::Prepare(ref p) if p.query == statement);

        let mut body = Vec::new();
        types::write_int(0x0004, &mut body);
        types::write_short_bytes(&prepared_id, &mut body).unwrap();
        // Bind metadata: one int column `k` of table ks.t, no pk info.
        types::write_int(0x0001, &mut body);
        types::write_int(1, &mut body);
        types::write_int(0, &mut body);
        types::write_string("ks", &mut body).unwrap();
        types::write_string("t", &mut body).unwrap();
        types::write_string("k", &mut body).unwrap();
        types::write_short(0x0009, &mut body);
        // Result metadata: none.
        types::write_int(0x0004, &mut body);
        types::write_int(0, &mut body);
        server
            .send_frame(request.stream, ResponseOpcode::Result, &body)
            .await;

        // ...then EXECUTE with the id and the bound 42.
        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Execute);
        let execute = match request.parse() {
            Request::Execute(execute) => execute,
            other => panic!("expected EXECUTE, got {:?}", other),
        };
        assert_eq!(&execute.id[..], &prepared_id);
        let values: Vec<_> = execute.parameters.values.iter().collect();
        assert_eq!(values, vec![types::RawValue::Value(&[0, 0, 0, 42])]);
        server.send_void_result(request.stream).await;

        // Second execution: EXECUTE straight away, no PREPARE.
        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Execute);
        server.send_void_result(request.stream).await;
        server
    };

    let client = async {
        session
            .execute(statement, &[Some(CqlValue::Int(42))])
            .await
            .unwrap();
        session
            .execute(statement, &[Some(CqlValue::Int(42))])
            .await
            .unwrap();
    };

    tokio::join!(client, serve);
}

/// Binding mismatches fail before any frame reaches the wire.
#[tokio::test]
async fn bad_binding_never_reaches_the_wire() {
    setup_tracing();
    let (session, mut server) = connect_pair(SessionConfig::default()).await;

    let statement = "SELECT * FROM t WHERE k=?";

    let serve = async {
        // Only a PREPARE is ever seen; the malformed EXECUTE is caught
        // client-side.
        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Prepare);
        let mut body = Vec::new();
        types::write_int(0x0004, &mut body);
        types::write_short_bytes(&[0x01; 16], &mut body).unwrap();
        types::write_int(0x0001, &mut body);
        types::write_int(1, &mut body);
        types::write_int(0, &mut body);
        types::write_string("ks", &mut body).unwrap();
        types::write_string("t", &mut body).unwrap();
        types::write_string("k", &mut body).unwrap();
        types::write_short(0x0009, &mut body);
        types::write_int(0x0004, &mut body);
        types::write_int(0, &mut body);
        server
            .send_frame(request.stream, ResponseOpcode::Result, &body)
            .await;
        server
    };

    let client = async {
        // Wrong arity.
        let err = session
            .execute(statement, &[Some(CqlValue::Int(1)), Some(CqlValue::Int(2))])
            .await
            .unwrap_err();
        assert_matches!(err, RequestError::BadParameter(_));

        // Wrong type.
        let err = session
            .execute(statement, &[Some(CqlValue::Text("42".into()))])
            .await
            .unwrap_err();
        assert_matches!(err, RequestError::BadParameter(_));
    };

    tokio::join!(client, serve);
}

/// Scenario S4: a server ERROR resolves only its own stream's waiter;
/// the connection keeps serving requests.
#[tokio::test]
async fn server_error_does_not_kill_the_connection() {
    setup_tracing();
    let (session, mut server) = connect_pair(SessionConfig::default()).await;

    let serve = async {
        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Query);
        server
            .send_error(request.stream, 0x2200, "unconfigured table ghosts")
            .await;

        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Query);
        server.send_void_result(request.stream).await;
        server
    };

    let client = async {
        let err = session
            .execute("SELECT * FROM ghosts", &[])
            .await
            .unwrap_err();
        assert_matches!(
            err,
            RequestError::ServerError(DbError::Invalid, ref reason)
                if reason == "unconfigured table ghosts"
        );
        assert!(!err.is_fatal());

        session.execute("SELECT * FROM real_table", &[]).await.unwrap();
    };

    tokio::join!(client, serve);
}

/// Scenario S5: REGISTER answers READY on its own stream, and a later
/// EVENT frame on stream −1 reaches the subscriber, never a waiter.
#[tokio::test]
async fn register_and_receive_event() {
    setup_tracing();
    let (session, mut server) = connect_pair(SessionConfig::default()).await;

    let serve = async {
        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Register);
        assert_matches!(
            request.parse(),
            Request::Register(ref r) if r.event_types == vec![EventType::SchemaChange]
        );
        server.send_ready(request.stream).await;

        // A schema-change event pushed later, on the event stream.
        let mut body = Vec::new();
        types::write_string("SCHEMA_CHANGE", &mut body).unwrap();
        types::write_string("CREATED", &mut body).unwrap();
        types::write_string("KEYSPACE", &mut body).unwrap();
        types::write_string("ks", &mut body).unwrap();
        server.send_frame(-1, ResponseOpcode::Event, &body).await;
        server
    };

    let client = async {
        let mut events = session.register(&[EventType::SchemaChange]).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_matches!(
            event,
            Event::SchemaChange(SchemaChangeEvent::KeyspaceChange {
                change_type: SchemaChangeType::Created,
                ref keyspace_name,
            }) if keyspace_name == "ks"
        );
    };

    tokio::join!(client, serve);
}

/// Scenario S6: a v3 frame is a protocol violation and fails every
/// outstanding waiter.
#[tokio::test]
async fn malformed_frame_fails_outstanding_waiters() {
    setup_tracing();
    let (session, mut server) = connect_pair(SessionConfig::default()).await;

    let serve = async {
        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Query);
        // A v3 response frame: version byte 0x83.
        server.send_raw_frame(0x83, 0x00, request.stream, 0x02, &[]).await;
        server
    };

    let client = async {
        let err = session.execute("SELECT 1", &[]).await.unwrap_err();
        assert_matches!(err, RequestError::ProtocolViolation(_));
        assert!(err.is_fatal());

        // The connection is now terminally closed: later submissions
        // fail immediately with the same kind.
        let err = session.execute("SELECT 2", &[]).await.unwrap_err();
        assert_matches!(err, RequestError::ProtocolViolation(_));
    };

    tokio::join!(client, serve);
}

/// Property 5, outbound half: with no negotiated compression no request
/// carries flag bit 0; inbound half: a compressed response is a fatal
/// protocol violation.
#[tokio::test]
async fn compression_flag_without_negotiation() {
    setup_tracing();
    let (session, mut server) = connect_pair(SessionConfig::default()).await;

    let serve = async {
        let request = server.read_request().await;
        assert_eq!(request.flags & 0x01, 0, "no negotiation, no compression flag");
        // An illegally-compressed READY-shaped result.
        let mut body = Vec::new();
        types::write_int(0x0001, &mut body);
        server
            .send_raw_frame(0x84, 0x01, request.stream, ResponseOpcode::Result as u8, &body)
            .await;
        server
    };

    let client = async {
        let err = session.execute("SELECT 1", &[]).await.unwrap_err();
        assert_matches!(err, RequestError::ProtocolViolation(_));
    };

    tokio::join!(client, serve);
}

/// Property 7: closing with waiters in flight completes each of them
/// with the connection-closed kind, exactly once.
#[tokio::test]
async fn close_fans_out_to_all_waiters() {
    setup_tracing();
    let (session, mut server) = connect_pair(SessionConfig::default()).await;

    let serve = async {
        for _ in 0..3 {
            let request = server.read_request().await;
            assert_eq!(request.opcode, RequestOpcode::Query);
            // Never respond.
        }
        server
    };

    let client = async {
        let pending_a = session.execute("SELECT a", &[]);
        let pending_b = session.execute("SELECT b", &[]);
        let pending_c = session.execute("SELECT c", &[]);

        let close_after_writes = async {
            // Give the writer a chance to put all three on the wire.
            tokio::time::sleep(Duration::from_millis(50)).await;
            session.close();
        };

        let (a, b, c, ()) = tokio::join!(pending_a, pending_b, pending_c, close_after_writes);
        for result in [a, b, c] {
            assert_matches!(result.unwrap_err(), RequestError::ConnectionClosed(_));
        }
    };

    let (_server, ()) = tokio::join!(serve, client);
}

/// A cancelled caller leaves its stream id allocated until the response
/// arrives; the late response is dropped silently and the id is only
/// then reused.
#[tokio::test]
async fn cancelled_request_orphans_its_stream_id() {
    setup_tracing();
    let (session, mut server) = connect_pair(SessionConfig::default()).await;

    let serve = async {
        let first = server.read_request().await;
        assert_eq!(first.stream, 1); // 0 went to STARTUP and was freed.
        // No response yet: the caller gives up first.

        let second = server.read_request().await;
        // Stream 1 is still allocated to the orphan, so the second
        // request gets a fresh id.
        assert_eq!(second.stream, 2);

        // Late response to the orphan, then the real one.
        server.send_void_result(first.stream).await;
        server.send_void_result(second.stream).await;
        server
    };

    let client = async {
        let gave_up =
            tokio::time::timeout(Duration::from_millis(50), session.execute("SELECT slow", &[]))
                .await;
        assert!(gave_up.is_err(), "the caller timed out and dropped its future");

        session.execute("SELECT quick", &[]).await.unwrap();
    };

    tokio::join!(client, serve);
}

/// Compression negotiation: OPTIONS → SUPPORTED advertising lz4, then
/// STARTUP carries COMPRESSION and later frames are lz4-compressed both
/// ways.
#[tokio::test]
async fn lz4_is_negotiated_and_used_after_startup() {
    setup_tracing();
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let mut server = MockServer::new(server_io);

    let config = SessionConfig {
        compression: Some(Compression::Lz4),
        ..Default::default()
    };
    let connect = Session::connect_over(client_io, config);

    let serve = async {
        server.handle_options(&["lz4", "snappy"]).await;

        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Startup);
        assert_eq!(request.flags & 0x01, 0, "STARTUP goes out plain");
        let startup = match request.parse() {
            Request::Startup(startup) => startup,
            other => panic!("expected STARTUP, got {:?}", other),
        };
        assert_eq!(startup.options.get("COMPRESSION").unwrap(), "lz4");
        server.send_ready(request.stream).await;
        server.compression = Some(Compression::Lz4);
        server
    };

    let (session, mut server) = tokio::join!(connect, serve);
    let session = session.unwrap();

    let serve = async {
        let request = server.read_request().await;
        assert_eq!(request.flags & 0x01, 0x01, "post-handshake frames are compressed");
        assert_matches!(request.parse(), Request::Query(ref q) if q.contents == "SELECT 1");

        // Respond with a compressed Void result.
        let mut body = Vec::new();
        types::write_int(0x0001, &mut body);
        let mut compressed = Vec::new();
        frame::compress_append(&body, Compression::Lz4, &mut compressed).unwrap();
        server
            .send_raw_frame(0x84, 0x01, request.stream, ResponseOpcode::Result as u8, &compressed)
            .await;
    };

    let client = async {
        session.execute("SELECT 1", &[]).await.unwrap();
    };

    tokio::join!(client, serve);
}

/// A requested algorithm the server does not advertise is dropped:
/// STARTUP omits COMPRESSION and frames go out plain.
#[tokio::test]
async fn unadvertised_compression_degrades_to_plain() {
    setup_tracing();
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let mut server = MockServer::new(server_io);

    let config = SessionConfig {
        compression: Some(Compression::Snappy),
        ..Default::default()
    };
    let connect = Session::connect_over(client_io, config);

    let serve = async {
        server.handle_options(&["lz4"]).await;

        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Startup);
        let startup = match request.parse() {
            Request::Startup(startup) => startup,
            other => panic!("expected STARTUP, got {:?}", other),
        };
        assert!(!startup.options.contains_key("COMPRESSION"));
        server.send_ready(request.stream).await;
        server
    };

    let (session, mut server) = tokio::join!(connect, serve);
    let session = session.unwrap();

    let serve = async {
        let request = server.read_request().await;
        assert_eq!(request.flags & 0x01, 0);
        server.send_void_result(request.stream).await;
    };
    let client = async {
        session.execute("SELECT 1", &[]).await.unwrap();
    };
    tokio::join!(client, serve);
}

/// An AUTHENTICATE answer to STARTUP fails the connect: this engine
/// detects the demand and reports it, it does not negotiate.
#[tokio::test]
async fn authenticate_fails_the_handshake() {
    setup_tracing();
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let mut server = MockServer::new(server_io);

    let connect = Session::connect_over(client_io, SessionConfig::default());
    let serve = async {
        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Startup);
        let mut body = Vec::new();
        types::write_string("org.apache.cassandra.auth.PasswordAuthenticator", &mut body).unwrap();
        server
            .send_frame(request.stream, ResponseOpcode::Authenticate, &body)
            .await;
        server
    };

    let (result, _server) = tokio::join!(connect, serve);
    assert_matches!(
        result.unwrap_err(),
        ConnectError::AuthenticationRequired { ref authenticator }
            if authenticator == "org.apache.cassandra.auth.PasswordAuthenticator"
    );
}

/// The handshake is bounded: a mute server produces a handshake-timeout
/// failure.
#[tokio::test]
async fn mute_server_times_the_handshake_out() {
    setup_tracing();
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let mut server = MockServer::new(server_io);

    let config = SessionConfig {
        handshake_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let connect = Session::connect_over(client_io, config);

    let serve = async {
        let request = server.read_request().await;
        assert_eq!(request.opcode, RequestOpcode::Startup);
        // Say nothing; keep the transport open long enough for the
        // timeout to be the one that fires.
        tokio::time::sleep(Duration::from_millis(400)).await;
        server
    };

    let (result, _server) = tokio::join!(connect, serve);
    assert_matches!(
        result.unwrap_err(),
        ConnectError::Request(RequestError::HandshakeTimeout(_))
    );
}

/// Stream ids are recycled FIFO: after a response frees id 0, the next
/// request takes the next fresh id rather than reusing 0 immediately.
#[tokio::test]
async fn stream_ids_are_not_reused_eagerly() {
    setup_tracing();
    let (session, mut server) = connect_pair(SessionConfig::default()).await;

    let serve = async {
        let first = server.read_request().await;
        assert_eq!(first.stream, 1); // 0 went to STARTUP and was freed.
        server.send_void_result(first.stream).await;

        let second = server.read_request().await;
        assert_eq!(second.stream, 2);
        server.send_void_result(second.stream).await;
        server
    };

    let client = async {
        session.execute("SELECT a", &[]).await.unwrap();
        session.execute("SELECT b", &[]).await.unwrap();
    };

    tokio::join!(client, serve);
}
