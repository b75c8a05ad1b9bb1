//! The dispatcher: one duplex transport, many in-flight requests.
//!
//! A connection owns a router task made of three cooperating futures:
//! a reader (routes responses to waiters, fans events out to
//! subscribers), a writer (allocates stream ids and serialises frame
//! writes), and an orphaner (frees waiters whose callers gave up).
//! Requests are submitted over a channel; each submission gets a oneshot
//! on which the caller awaits its decoded response.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::errors::{BrokenConnectionError, BrokenConnectionErrorKind, RequestError};
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::response::{Event, Response, ResponseOpcode};
use crate::frame::server_event_type::EventType;
use crate::frame::{self, Compression, SerializedRequest};

const SUBMIT_QUEUE_DEPTH: usize = 1024;
const READ_BUFFER_SIZE: usize = 8192;
const WRITE_BUFFER_SIZE: usize = 8192;

/// Per-connection configuration consumed by the dispatcher.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Algorithm negotiated for this connection, if any. Only frames sent
    /// after the handshake may carry the compression flag.
    pub compression: Option<Compression>,
    /// Cap on a single inbound frame body.
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Lifecycle of a connection. `Closed` keeps the cause so late
/// submissions fail with the same kind the waiters got.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    Connecting,
    StartupSent,
    Ready,
    /// The server demanded authentication; terminal in this engine.
    AuthRequired,
    Closed(BrokenConnectionError),
}

type RequestId = u64;

/// A decoded response delivered to a waiter.
#[derive(Debug)]
pub struct TaskResponse {
    pub response: Response,
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
}

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, BrokenConnectionError>>,
    request_id: RequestId,
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

type EventSubscribers = HashMap<EventType, Vec<mpsc::UnboundedSender<Event>>>;

/// A consumer of server-pushed events for the categories it was
/// registered with. Backed by an unbounded channel: events are never
/// dropped while the receiver lives.
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// The next event, in server emission order. `None` once the
    /// connection is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug)]
pub(crate) struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,

    // Every submission gets a unique request id, so that a cancelled
    // caller can be matched back to its stream id by the orphaner.
    request_id_generator: AtomicU64,
    // Unbounded: orphan notifications are pushed from Drop, which cannot
    // await.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,

    state: StdMutex<ConnectionState>,
    // The algorithm in force. Starts as the configured one and may be
    // withdrawn during the handshake when the server does not advertise
    // it; both the reader and the submit path consult it live.
    compression: StdMutex<Option<Compression>>,
    event_subscribers: StdMutex<EventSubscribers>,
    close_requested: Notify,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.lock().unwrap().clone()
    }

    fn compression(&self) -> Option<Compression> {
        *self.compression.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut guard = self.state.lock().unwrap();
        // A closed connection stays closed.
        if !matches!(*guard, ConnectionState::Closed(_)) {
            *guard = state;
        }
    }

    fn fail_if_terminal(&self) -> Result<(), RequestError> {
        match &*self.state.lock().unwrap() {
            ConnectionState::Closed(cause) => Err(cause.clone().into_request_error()),
            ConnectionState::AuthRequired => Err(RequestError::Unsupported(
                "authentication is required by the server and not implemented",
            )),
            _ => Ok(()),
        }
    }

    async fn send_request(
        &self,
        serialized_request: SerializedRequest,
    ) -> Result<TaskResponse, RequestError> {
        self.fail_if_terminal()?;

        let request_id = self.allocate_request_id();
        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            request_id,
        };

        // Dropping the notifier before `disable` tells the orphaner that
        // this caller is gone; the stream id stays allocated until the
        // server responds, then is silently freed.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| {
                BrokenConnectionError::from(BrokenConnectionErrorKind::WorkerTerminated)
                    .into_request_error()
            })?;

        let task_response = receiver.await.map_err(|_| {
            BrokenConnectionError::from(BrokenConnectionErrorKind::WorkerTerminated)
                .into_request_error()
        })?;
        notifier.disable();

        task_response.map_err(BrokenConnectionError::into_request_error)
    }

    fn add_event_subscriber(
        &self,
        event_types: &[EventType],
        sender: mpsc::UnboundedSender<Event>,
    ) {
        let mut subscribers = self.event_subscribers.lock().unwrap();
        for event_type in event_types {
            subscribers
                .entry(*event_type)
                .or_default()
                .push(sender.clone());
        }
    }

    fn request_close(&self) {
        self.close_requested.notify_one();
    }
}

// Notifies the orphaner when a submitted request's caller stops waiting.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(request_id: RequestId, sender: &'a mpsc::UnboundedSender<RequestId>) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender: sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

/// A single connection to a single endpoint: owns the transport and the
/// router task multiplexing requests over it.
#[derive(Debug)]
pub struct Connection {
    _worker_handle: RemoteHandle<()>,

    router_handle: Arc<RouterHandle>,
}

impl Connection {
    /// Starts a dispatcher over an established transport. The transport
    /// is any ordered, reliable byte stream; whether it is TCP or
    /// TLS-wrapped is the caller's business.
    pub fn new(
        transport: impl AsyncRead + AsyncWrite + Send + 'static,
        config: ConnectionConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(SUBMIT_QUEUE_DEPTH);
        let (orphan_notification_sender, orphan_notification_receiver) = mpsc::unbounded_channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
            state: StdMutex::new(ConnectionState::Connecting),
            compression: StdMutex::new(config.compression),
            event_subscribers: StdMutex::new(HashMap::new()),
            close_requested: Notify::new(),
        });

        let (task, _worker_handle) = Self::router(
            config,
            transport,
            receiver,
            orphan_notification_receiver,
            router_handle.clone(),
        )
        .remote_handle();
        tokio::task::spawn(task);

        Connection {
            _worker_handle,
            router_handle,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.router_handle.state()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.router_handle.set_state(state);
    }

    /// The compression algorithm currently in force, if any.
    pub fn negotiated_compression(&self) -> Option<Compression> {
        self.router_handle.compression()
    }

    /// Withdraws compression for this connection, before STARTUP is
    /// sent. Subsequent frames go out plain, and an inbound compressed
    /// frame becomes a protocol violation.
    pub fn disable_compression(&self) {
        *self.router_handle.compression.lock().unwrap() = None;
    }

    /// Submits a request and awaits its decoded response.
    ///
    /// `compress` must stay false for handshake frames: the compression
    /// flag is only legal once STARTUP negotiated an algorithm.
    pub async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
    ) -> Result<TaskResponse, RequestError> {
        let compression = if compress {
            self.router_handle.compression()
        } else {
            None
        };
        let serialized_request =
            SerializedRequest::make(request, compression).map_err(map_make_error)?;

        if !matches!(self.state(), ConnectionState::Ready)
            && !is_handshake_opcode(serialized_request.opcode())
        {
            self.router_handle.fail_if_terminal()?;
            return Err(RequestError::Unsupported(
                "requests are only accepted once the handshake completed",
            ));
        }

        self.router_handle.send_request(serialized_request).await
    }

    /// Registers a local subscriber for the given event categories.
    /// Subscription is local bookkeeping; the server only pushes events
    /// after a REGISTER request.
    pub fn subscribe_to_events(&self, event_types: &[EventType]) -> EventStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.router_handle.add_event_subscriber(event_types, sender);
        EventStream { receiver }
    }

    /// Closes the connection: the router fails every outstanding waiter
    /// with the connection-closed kind and stops.
    pub fn close(&self) {
        self.router_handle.request_close();
    }

    async fn router(
        config: ConnectionConfig,
        transport: impl AsyncRead + AsyncWrite,
        task_receiver: mpsc::Receiver<Task>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        router_handle: Arc<RouterHandle>,
    ) {
        let (read_half, write_half) = split(transport);

        // Shared between the reader and writer futures, which run on the
        // same task. The mutex is never held across an await point, so
        // it never contends; it exists because a RefCell would make the
        // future !Sync.
        let handler_map = StdMutex::new(ResponseHandlerMap::new());
        // Wakes a writer parked on stream-id-pool exhaustion.
        let stream_freed = Notify::new();

        let r = Self::reader(
            BufReader::with_capacity(READ_BUFFER_SIZE, read_half),
            &handler_map,
            &router_handle,
            &config,
            &stream_freed,
        );
        let w = Self::writer(
            BufWriter::with_capacity(WRITE_BUFFER_SIZE, write_half),
            &handler_map,
            task_receiver,
            &stream_freed,
        );
        let o = Self::orphaner(&handler_map, orphan_notification_receiver);

        let result = tokio::select! {
            result = async { futures::try_join!(r, w, o) } => result.map(|_| ()),
            _ = router_handle.close_requested.notified() => {
                Err(BrokenConnectionErrorKind::ClosedByClient.into())
            }
        };

        let error: BrokenConnectionError = match result {
            Ok(()) => return,
            Err(error) => error,
        };
        debug!(%error, "connection broken, failing outstanding requests");

        // Fail every outstanding waiter with the same cause, exactly
        // once, and park the connection in its terminal state.
        let handlers = handler_map.into_inner().unwrap().into_handlers();
        for (_, handler) in handlers {
            let _ = handler.response_sender.send(Err(error.clone()));
        }
        *router_handle.state.lock().unwrap() = ConnectionState::Closed(error);
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        router_handle: &RouterHandle,
        config: &ConnectionConfig,
        stream_freed: &Notify,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) =
                frame::read_response_frame(&mut read_half, config.max_frame_size)
                    .await
                    .map_err(BrokenConnectionErrorKind::Frame)?;

            let body_with_ext = frame::parse_response_body_extensions(
                params.flags,
                router_handle.compression(),
                body,
            )
            .map_err(BrokenConnectionErrorKind::Frame)?;

            for warning in &body_with_ext.warnings {
                warn!(warning = warning.as_str(), "server sent a warning");
            }

            match params.stream.cmp(&-1) {
                std::cmp::Ordering::Less => {
                    // Only -1 is assigned by the protocol; other negative
                    // streams are ignored.
                    debug!(stream = params.stream, "ignoring frame on negative stream");
                    continue;
                }
                std::cmp::Ordering::Equal => {
                    Self::handle_event(opcode, &body_with_ext.body, router_handle)?;
                    continue;
                }
                std::cmp::Ordering::Greater => {}
            }

            let mut body_slice = &body_with_ext.body[..];
            let response = Response::deserialize(opcode, &mut body_slice)
                .map_err(BrokenConnectionErrorKind::ResponseDecode)?;
            if !body_slice.is_empty() {
                // Tolerated, but worth noticing: the server sent more
                // than the message grammar accounts for.
                warn!(
                    opcode = ?opcode,
                    trailing = body_slice.len(),
                    "trailing bytes after response body"
                );
            }

            let lookup_result = {
                // No other holder can be mid-lock: see the comment at the
                // mutex.
                let mut handler_map_guard = handler_map.try_lock().unwrap();
                handler_map_guard.lookup(params.stream)
            };
            stream_freed.notify_one();

            match lookup_result {
                HandlerLookupResult::Handler(handler) => {
                    trace!(stream = params.stream, opcode = ?opcode, "routing response");
                    let _ = handler.response_sender.send(Ok(TaskResponse {
                        response,
                        tracing_id: body_with_ext.trace_id,
                        warnings: body_with_ext.warnings,
                    }));
                }
                HandlerLookupResult::Orphaned => {
                    // The caller stopped waiting; the response is dropped
                    // and the stream id has just been freed.
                    trace!(stream = params.stream, "dropping response to orphaned stream");
                }
                HandlerLookupResult::Missing => {
                    return Err(BrokenConnectionErrorKind::UnknownStreamId(params.stream).into());
                }
            }
        }
    }

    fn handle_event(
        opcode: ResponseOpcode,
        body: &[u8],
        router_handle: &RouterHandle,
    ) -> Result<(), BrokenConnectionError> {
        if opcode != ResponseOpcode::Event {
            return Err(BrokenConnectionErrorKind::NonEventFrameOnEventStream(opcode).into());
        }
        let mut body_slice = body;
        let event = Event::deserialize(&mut body_slice)
            .map_err(BrokenConnectionErrorKind::ResponseDecode)?;
        if !body_slice.is_empty() {
            warn!(trailing = body_slice.len(), "trailing bytes after event body");
        }

        let event_type = event.event_type();
        let mut subscribers = router_handle.event_subscribers.lock().unwrap();
        match subscribers.get_mut(&event_type) {
            Some(senders) => {
                // Closed receivers are pruned as they are found.
                senders.retain(|sender| sender.send(event.clone()).is_ok());
            }
            None => {
                debug!(event = %event_type, "event with no subscribers, dropping");
            }
        }
        Ok(())
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut task_receiver: mpsc::Receiver<Task>,
        stream_freed: &Notify,
    ) -> Result<(), BrokenConnectionError> {
        // When the connection is dropped the channel closes and this
        // future finishes, stopping the router.
        while let Some(task) = task_receiver.recv().await {
            let mut task = task;
            loop {
                let Task {
                    mut serialized_request,
                    mut response_handler,
                } = task;

                // Allocate a stream id, parking until the reader frees
                // one when all 32768 are in flight.
                let stream_id = loop {
                    let allocation = {
                        let mut handler_map_guard = handler_map.try_lock().unwrap();
                        handler_map_guard.allocate(response_handler)
                    };
                    match allocation {
                        Ok(stream_id) => break stream_id,
                        Err(returned_handler) => {
                            trace!("stream id pool exhausted, parking writer");
                            response_handler = returned_handler;
                            stream_freed.notified().await;
                        }
                    }
                };

                serialized_request.set_stream(stream_id);
                write_half
                    .write_all(serialized_request.get_data())
                    .await
                    .map_err(BrokenConnectionErrorKind::Write)?;

                // Coalesce whatever is already queued into one flush.
                match task_receiver.try_recv() {
                    Ok(next) => task = next,
                    Err(_) => break,
                }
            }
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::Write)?;
        }
        Ok(())
    }

    // Frees the handler of every request whose caller dropped its future.
    // The stream id itself stays allocated until the server's response
    // arrives (the server cannot be told to abort).
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        while let Some(request_id) = orphan_receiver.recv().await {
            trace!(request_id, "orphaning stream id of a cancelled request");
            let mut handler_map_guard = handler_map.try_lock().unwrap();
            handler_map_guard.orphan(request_id);
        }
        Ok(())
    }
}

fn is_handshake_opcode(opcode: u8) -> bool {
    opcode == RequestOpcode::Startup as u8 || opcode == RequestOpcode::Options as u8
}

fn map_make_error(err: crate::frame::frame_errors::FrameError) -> RequestError {
    use crate::frame::frame_errors::FrameError;
    match err {
        FrameError::RequestSerialization(e) => {
            RequestError::BadParameter(crate::errors::BadParameterError::RequestSerialization(e))
        }
        other => BrokenConnectionError::from(BrokenConnectionErrorKind::Frame(other))
            .into_request_error(),
    }
}

enum HandlerLookupResult {
    Handler(ResponseHandler),
    Orphaned,
    Missing,
}

struct ResponseHandlerMap {
    stream_pool: StreamIdPool,
    handlers: HashMap<i16, ResponseHandler>,
    request_to_stream: HashMap<RequestId, i16>,
    orphaned: std::collections::HashSet<i16>,
}

impl ResponseHandlerMap {
    fn new() -> Self {
        Self {
            stream_pool: StreamIdPool::new(),
            handlers: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphaned: std::collections::HashSet::new(),
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        match self.stream_pool.allocate() {
            Some(stream_id) => {
                self.request_to_stream
                    .insert(response_handler.request_id, stream_id);
                let previous = self.handlers.insert(stream_id, response_handler);
                debug_assert!(previous.is_none());
                Ok(stream_id)
            }
            None => Err(response_handler),
        }
    }

    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.remove(&request_id) {
            debug!(stream_id, request_id, "orphaning stream id");
            self.orphaned.insert(stream_id);
            self.handlers.remove(&stream_id);
        }
    }

    fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        if self.orphaned.remove(&stream_id) {
            // The handler is long gone; only now can the id be reused.
            self.stream_pool.free(stream_id);
            return HandlerLookupResult::Orphaned;
        }

        match self.handlers.remove(&stream_id) {
            Some(handler) => {
                // Drop the reverse mapping so a late orphan notification
                // cannot re-orphan a reused stream id.
                self.request_to_stream.remove(&handler.request_id);
                self.stream_pool.free(stream_id);
                HandlerLookupResult::Handler(handler)
            }
            None => HandlerLookupResult::Missing,
        }
    }

    // Used once, after the connection breaks, to fail every waiter.
    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

/// The free pool of stream ids 0..=32767.
///
/// Ids are reused FIFO: a freed id goes to the back of the queue, which
/// maximises the time until its reuse and keeps log correlation sane.
struct StreamIdPool {
    free: VecDeque<i16>,
}

impl StreamIdPool {
    fn new() -> Self {
        Self {
            free: (0..=i16::MAX).collect(),
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        self.free.pop_front()
    }

    fn free(&mut self, stream_id: i16) {
        self.free.push_back(stream_id);
    }
}
