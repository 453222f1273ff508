/// Server dispatcher for routing calls and managing subscription lifecycles
mod cancel;
mod lifecycle;
mod router;

pub use router::{CallContext, Router, RouterBuilder};

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cancel::CancelMap;
use lifecycle::SubscriptionTable;
use router::BoxedStreamHandler;

use crate::protocol::{
    // ---
    CallOutcome,
    CallRequest,
    CallResponse,
    CancelNotice,
    Channels,
    EventKind,
    SubscriptionEvent,
    SubscriptionStart,
    SubscriptionStop,
};

use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    protocol,
    ConnectionId,
    Error,
    Invocation,
    Payload,
    Result,
    RpcConfig,
    SubscriptionId,
    TransportPtr,
};

/// Server dispatcher.
///
/// Routes incoming calls through the [`Router`], threads a cooperative
/// cancellation token into every handler, and owns the per-connection
/// subscription lifecycle. One dispatcher serves any number of connections;
/// attach each connection's transport with [`attach`](Self::attach).
///
/// Cheap to clone (internally `Arc`-backed).
///
/// # Example
///
/// ```no_run
/// use mux_rpc::{create_memory_link, CallContext, ConnectionId, Router, RpcConfig, RpcServer};
///
/// # async fn example() -> mux_rpc::Result<()> {
/// let router = Router::builder()
///     .query("ping", |_ctx: CallContext, _input: ()| async move { Ok("pong") })
///     .build();
///
/// let (_ui_side, host_side) = create_memory_link("ui", "host").await?;
/// let server = RpcServer::new(router, RpcConfig::default());
/// server.attach(host_side, ConnectionId(1)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    // ---
    router: Router,
    channels: Channels,
    calls: CancelMap,
    subscriptions: SubscriptionTable,
}

impl RpcServer {
    // ---
    /// Create a dispatcher over a built router.
    pub fn new(router: Router, config: RpcConfig) -> Self {
        // ---
        Self {
            inner: Arc::new(ServerInner {
                router,
                channels: config.channels(),
                calls: CancelMap::new(),
                subscriptions: SubscriptionTable::new(),
            }),
        }
    }

    /// Wire one connection's receive side and spawn its dispatch loop.
    ///
    /// The loop runs until the transport's inboxes close; it then sweeps
    /// every subscription still owned by the connection and exits.
    ///
    /// # Errors
    ///
    /// Returns `Error::Channel` if any receive-side registration fails
    /// (e.g. a second dispatcher attached to the same channels).
    pub async fn attach(
        &self,
        transport: TransportPtr,
        connection: ConnectionId,
    ) -> Result<JoinHandle<()>> {
        // ---
        let channels = &self.inner.channels;

        let mut calls = transport.serve(&channels.call).await?;
        let mut cancels = transport.listen(&channels.cancel).await?;
        let mut starts = transport.listen(&channels.sub_start).await?;
        let mut stops = transport.listen(&channels.sub_stop).await?;

        log_info!("attached {connection} via {}", transport.endpoint_id());

        let inner = self.inner.clone();

        Ok(tokio::spawn(async move {
            // ---
            loop {
                tokio::select! {
                    invocation = calls.inbox.recv() => match invocation {
                        Some(invocation) => inner.dispatch_call(connection, invocation),
                        None => break,
                    },
                    message = cancels.inbox.recv() => match message {
                        Some(message) => inner.handle_cancel(connection, &message),
                        None => break,
                    },
                    message = starts.inbox.recv() => match message {
                        Some(message) => {
                            inner.handle_subscription_start(transport.clone(), connection, &message)
                        }
                        None => break,
                    },
                    message = stops.inbox.recv() => match message {
                        Some(message) => inner.handle_subscription_stop(connection, &message),
                        None => break,
                    },
                }
            }

            // Connection gone; sweep whatever it still owns.
            inner.teardown(connection);
        }))
    }

    /// Release every subscription owned by a connection.
    ///
    /// Safe to call at any time, including while subscriptions are
    /// mid-emission; their pumps observe the release and detach without
    /// writing to the connection again.
    pub fn teardown(&self, connection: ConnectionId) {
        self.inner.teardown(connection);
    }
}

impl ServerInner {
    // ---
    /// Route one incoming call; the handler runs on its own task.
    fn dispatch_call(self: &Arc<Self>, connection: ConnectionId, invocation: Invocation) {
        // ---
        let request: CallRequest = match protocol::from_wire(&invocation.message) {
            Ok(request) => request,
            Err(err) => {
                // No id to correlate a failure outcome with; dropping the
                // reply slot surfaces a channel error to this caller only.
                log_warn!("discarding malformed call request: {err}");
                return;
            }
        };

        log_debug!("{connection} call {} ({:?})", request.path, request.kind);

        let cancel = self.calls.register(connection, request.id.clone());
        let ctx = CallContext::new(connection, cancel);
        let handler = self.router.unary(&request.path);

        let inner = self.clone();
        tokio::spawn(async move {
            // ---
            let outcome = match handler {
                None => CallOutcome::Failure {
                    description: Error::NotFound(request.path.clone()).to_string(),
                },
                Some(handler) => match handler(ctx, request.payload).await {
                    Ok(payload) => CallOutcome::Success { payload },
                    // Descriptions only; the error value never crosses the
                    // channel.
                    Err(err) => CallOutcome::Failure {
                        description: err.to_string(),
                    },
                },
            };

            // The token entry goes away whether or not it was cancelled.
            inner.calls.complete(connection, &request.id);

            let response = CallResponse {
                id: request.id,
                outcome,
            };

            match protocol::to_wire(&response) {
                Ok(message) => {
                    // A dropped reply slot means the caller is gone.
                    let _ = invocation.reply.send(message);
                }
                Err(err) => {
                    log_warn!("response for {} not encoded: {err}", response.id);
                }
            }
        });
    }

    /// Mark an in-flight call cancelled; unknown ids are a no-op.
    fn handle_cancel(&self, connection: ConnectionId, message: &Bytes) {
        // ---
        match protocol::from_wire::<CancelNotice>(message) {
            Ok(notice) => {
                if self.calls.cancel(connection, &notice.id) {
                    log_debug!("{connection} cancelled call {}", notice.id);
                } else {
                    log_debug!("cancel notice for settled call {}; ignoring", notice.id);
                }
            }
            Err(err) => log_warn!("discarding malformed cancel notice: {err}"),
        }
    }

    /// Start a subscription.
    ///
    /// The release token is registered before anything suspends, so a stop
    /// notice arriving right behind the start always finds the entry.
    fn handle_subscription_start(
        self: &Arc<Self>,
        transport: TransportPtr,
        connection: ConnectionId,
        message: &Bytes,
    ) {
        // ---
        let start: SubscriptionStart = match protocol::from_wire(message) {
            Ok(start) => start,
            Err(err) => {
                log_warn!("discarding malformed subscription start: {err}");
                return;
            }
        };

        log_info!("{connection} starting subscription {} on {}", start.id, start.path);

        let release = CancellationToken::new();
        if !self
            .subscriptions
            .insert(connection, start.id.clone(), release.clone())
        {
            // A live entry already owns this id; starting it again would
            // duplicate release ownership.
            log_warn!("{connection} already has subscription {}; ignoring start", start.id);
            return;
        }

        let handler = self.router.stream(&start.path);

        let inner = self.clone();
        tokio::spawn(async move {
            inner
                .run_subscription(transport, connection, start, handler, release)
                .await;
        });
    }

    /// Resolve the stream source and pump it until a terminal condition.
    async fn run_subscription(
        self: &Arc<Self>,
        transport: TransportPtr,
        connection: ConnectionId,
        start: SubscriptionStart,
        handler: Option<BoxedStreamHandler>,
        release: CancellationToken,
    ) {
        // ---
        let id = start.id;

        let handler = match handler {
            Some(handler) => handler,
            None => {
                let description = Error::NotFound(start.path).to_string();
                self.fail_subscription(&transport, connection, &id, description)
                    .await;
                return;
            }
        };

        let ctx = CallContext::new(connection, release.clone());

        // Resolving the source races against stop and teardown; a release
        // during resolution just drops the half-built source.
        let source = tokio::select! {
            _ = release.cancelled() => {
                log_debug!("subscription {id} released before its source resolved");
                return;
            }
            resolved = handler(ctx, start.payload) => match resolved {
                Ok(source) => source,
                Err(err) => {
                    self.fail_subscription(&transport, connection, &id, err.to_string())
                        .await;
                    return;
                }
            },
        };

        self.pump(transport, connection, id, source, release).await;
    }

    /// Forward source items as events until release, error, or completion.
    async fn pump(
        &self,
        transport: TransportPtr,
        connection: ConnectionId,
        id: SubscriptionId,
        mut source: mpsc::Receiver<Result<Payload>>,
        release: CancellationToken,
    ) {
        // ---
        loop {
            tokio::select! {
                _ = release.cancelled() => {
                    // Stopped or torn down; the releasing side already took
                    // the table entry. Detach without a terminal event.
                    log_debug!("subscription {id} released");
                    break;
                }
                item = source.recv() => match item {
                    Some(Ok(payload)) => {
                        if let Err(err) = self
                            .emit(&transport, &id, EventKind::Data { payload })
                            .await
                        {
                            // Fatal only to this subscription.
                            log_warn!("event for {id} not delivered: {err}; releasing");
                            let _ = self.subscriptions.release(connection, &id);
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        // No stop notice will follow a terminal event; drop
                        // the release entry ourselves before emitting.
                        let _ = self.subscriptions.release(connection, &id);
                        let kind = EventKind::Error {
                            description: err.to_string(),
                        };
                        if let Err(_err) = self.emit(&transport, &id, kind).await {
                            log_debug!("error event for {id} not delivered: {_err}");
                        }
                        break;
                    }
                    None => {
                        let _ = self.subscriptions.release(connection, &id);
                        if let Err(_err) = self.emit(&transport, &id, EventKind::Complete).await {
                            log_debug!("complete event for {id} not delivered: {_err}");
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Terminal error path for a subscription that never produced a source.
    async fn fail_subscription(
        &self,
        transport: &TransportPtr,
        connection: ConnectionId,
        id: &SubscriptionId,
        description: String,
    ) {
        // ---
        // A miss here means stop or teardown already took the entry.
        let _ = self.subscriptions.release(connection, id);

        if let Err(_err) = self
            .emit(transport, id, EventKind::Error { description })
            .await
        {
            log_debug!("error event for {id} not delivered: {_err}");
        }
    }

    /// Send one subscription event to the caller side.
    async fn emit(&self, transport: &TransportPtr, id: &SubscriptionId, kind: EventKind) -> Result<()> {
        // ---
        let event = SubscriptionEvent {
            id: id.clone(),
            kind,
        };
        let message = protocol::to_wire(&event)?;
        transport.notify(&self.channels.sub_event, message).await
    }

    /// Invoke the release for one subscription; unknown ids are a no-op.
    fn handle_subscription_stop(&self, connection: ConnectionId, message: &Bytes) {
        // ---
        match protocol::from_wire::<SubscriptionStop>(message) {
            Ok(stop) => {
                log_info!("{connection} stopping subscription {}", stop.id);
                match self.subscriptions.release(connection, &stop.id) {
                    Some(release) => release.cancel(),
                    None => {
                        log_debug!("stop for unknown subscription {}; ignoring", stop.id);
                    }
                }
            }
            Err(err) => log_warn!("discarding malformed subscription stop: {err}"),
        }
    }

    /// Sweep a connection's subscriptions.
    fn teardown(&self, connection: ConnectionId) {
        // ---
        let released = self.subscriptions.teardown(connection);
        if released > 0 {
            log_info!("{connection} torn down; released {released} subscription(s)");
        } else {
            log_debug!("{connection} torn down; no live subscriptions");
        }
    }
}
