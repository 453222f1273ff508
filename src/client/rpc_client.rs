// src/client/rpc_client.rs

//! Client multiplexer implementation.
//!
//! This module contains the core [`RpcClient`] type which turns the single
//! duplex channel into many independent logical calls and subscriptions.
//!
//! # Architecture
//!
//! Each call generates a unique correlation ID and registers a oneshot
//! channel in the pending map before the request is sent. The transport's
//! `invoke` primitive is driven on its own task so that a cancellation
//! signal can preempt the reply; whichever side consumes the pending entry
//! first wins, and the loser's message is discarded by id-lookup miss.
//!
//! Subscriptions share one transport listener, installed once when the
//! client is built. Incoming events are demultiplexed by subscription id to
//! the single observer registered for that id.
//!
//! # Concurrency
//!
//! Multiple calls and subscriptions can be in flight simultaneously. The
//! registries are protected by mutexes but lock contention is minimal since
//! operations are just HashMap insert/remove, never held across an await.

use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    // ---
    CallKind,
    CallOutcome,
    CallRequest,
    CallResponse,
    CancelNotice,
    Channels,
    SubscriptionStart,
    SubscriptionStop,
};

use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_warn,
    protocol,
    CorrelationId,
    Error,
    Payload,
    Result,
    RpcConfig,
    SubscriptionId,
    TransportPtr,
};

use super::pending::PendingCalls;
use super::subscriptions::{ClientSubscription, SubscriptionRegistry};

/// Running client multiplexer instance.
///
/// Cheap to clone (internally `Arc`-backed).
///
/// # Example
///
/// ```no_run
/// use mux_rpc::{create_memory_link, RpcClient, RpcConfig};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize)]
/// struct UserQuery { id: u32 }
///
/// #[derive(Deserialize)]
/// struct User { id: u32, name: String }
///
/// # async fn example() -> mux_rpc::Result<()> {
/// let (ui_side, _host_side) = create_memory_link("ui", "host").await?;
/// let client = RpcClient::with_transport(ui_side, RpcConfig::default()).await?;
///
/// let user: User = client.query("getUser", &UserQuery { id: 1 }).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    transport: TransportPtr,
    channels: Channels,
    pending: Mutex<PendingCalls>,
    subscriptions: Mutex<SubscriptionRegistry>,

    /// Shared event-listener task, installed once per client.
    ///
    /// We keep it so the task isn't immediately dropped, and so it can be
    /// extended later (shutdown, join-on-close, etc.).
    _event_task: JoinHandle<()>,
}

impl RpcClient {
    // ---
    /// Create a client over an established transport.
    ///
    /// Installs the process-wide subscription-event listener for this
    /// client's channel set and spawns its receive loop.
    ///
    /// # Errors
    ///
    /// Returns `Error::Channel` if the transport refuses the event-listener
    /// registration.
    pub async fn with_transport(transport: TransportPtr, config: RpcConfig) -> Result<Self> {
        // ---
        let channels = config.channels();

        let mut events = transport.listen(&channels.sub_event).await?;

        // The receive loop holds only a weak handle so dropping the last
        // clone of the client shuts it down.
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            // ---
            let weak = weak.clone();

            let event_task = tokio::spawn(async move {
                // ---
                loop {
                    match events.inbox.recv().await {
                        Some(bytes) => {
                            if let Some(inner) = weak.upgrade() {
                                let client = RpcClient { inner };
                                client.handle_event(&bytes);
                            } else {
                                // Inner was dropped, exit loop
                                break;
                            }
                        }
                        None => {
                            // Transport closed or listener dropped.
                            log_debug!("transport closed, stopping event listener");
                            break;
                        }
                    }
                }
            });

            Inner {
                // ---
                transport,
                channels,
                pending: Mutex::new(PendingCalls::new()),
                subscriptions: Mutex::new(SubscriptionRegistry::new()),
                _event_task: event_task,
            }
        });

        Ok(Self { inner })
    }

    /// Issue a read call.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `Error::Serialization` - input or response payload conversion failed
    /// - `Error::Handler` - the remote side reported a failure outcome
    /// - `Error::Channel` - the transport could not complete the exchange
    pub async fn query<Req, Resp>(&self, path: &str, input: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.call_typed(path, CallKind::Query, input, None).await
    }

    /// Issue a state-changing call.
    pub async fn mutation<Req, Resp>(&self, path: &str, input: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.call_typed(path, CallKind::Mutation, input, None).await
    }

    /// Issue a read call with a cooperative cancellation signal.
    ///
    /// Cancelling yields `Error::Cancelled` immediately and sends an
    /// advisory cancel notice to the handler side; a response that arrives
    /// afterwards is discarded. Timeouts are not built in — compose one by
    /// firing the token from a timer.
    pub async fn query_with_cancel<Req, Resp>(
        &self,
        path: &str,
        input: &Req,
        cancel: CancellationToken,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.call_typed(path, CallKind::Query, input, Some(cancel))
            .await
    }

    /// Issue a state-changing call with a cooperative cancellation signal.
    pub async fn mutation_with_cancel<Req, Resp>(
        &self,
        path: &str,
        input: &Req,
        cancel: CancellationToken,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.call_typed(path, CallKind::Mutation, input, Some(cancel))
            .await
    }

    async fn call_typed<Req, Resp>(
        &self,
        path: &str,
        kind: CallKind,
        input: &Req,
        cancel: Option<CancellationToken>,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        // ---
        let payload = Payload::encode(input)?;
        let reply = self.call_raw(path, kind, payload, cancel).await?;

        // Typed callers see an absent reply as JSON null.
        reply.decode_or_null()
    }

    /// Issue a call at the wire-payload level.
    ///
    /// This is the full form of the call operation: explicit payload
    /// presence and an optional cancellation token. Exactly one of a settled
    /// outcome or `Error::Cancelled` is ever returned for a given call.
    pub async fn call_raw(
        &self,
        path: &str,
        kind: CallKind,
        payload: Payload,
        cancel: Option<CancellationToken>,
    ) -> Result<Payload> {
        // ---
        let id = CorrelationId::generate();

        let request = CallRequest {
            id: id.clone(),
            path: path.to_string(),
            payload,
            kind,
        };
        let message = protocol::to_wire(&request)?;

        let mut rx = {
            let mut pending = lock_ignore_poison(&self.inner.pending);
            pending.register(id.clone())
        };

        // Drive the invoke on its own task so cancellation can preempt the
        // reply without abandoning the correlation entry.
        let inner = self.inner.clone();
        let call_id = id.clone();
        tokio::spawn(async move {
            let raw = inner.transport.invoke(&inner.channels.call, message).await;
            inner.settle(&call_id, raw);
        });

        let settled = match cancel {
            None => rx.await,
            Some(token) => {
                tokio::select! {
                    settled = &mut rx => settled,
                    _ = token.cancelled() => {
                        // First consumer of the pending entry wins.
                        let was_pending = {
                            let mut pending = lock_ignore_poison(&self.inner.pending);
                            pending.remove(&id)
                        };

                        if was_pending {
                            self.send_cancel_notice(&id).await;
                            return Err(Error::Cancelled);
                        }

                        // The response won the race; take it instead.
                        rx.await
                    }
                }
            }
        };

        settled.map_err(|_| Error::channel("client dropped while call was in flight"))?
    }

    /// Open a subscription.
    ///
    /// The observer is registered before the start notice is sent, so no
    /// event can arrive unroutable. Events are delivered in issuance order;
    /// see [`ClientSubscription::next`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Channel` if the start notice could not be delivered
    /// (the observer is rolled back).
    pub async fn subscribe<Req, Item>(
        &self,
        path: &str,
        input: &Req,
    ) -> Result<ClientSubscription<Item>>
    where
        Req: Serialize,
        Item: DeserializeOwned,
    {
        let payload = Payload::encode(input)?;
        self.subscribe_raw(path, payload).await
    }

    /// Open a subscription at the wire-payload level.
    pub async fn subscribe_raw<Item: DeserializeOwned>(
        &self,
        path: &str,
        payload: Payload,
    ) -> Result<ClientSubscription<Item>> {
        // ---
        let id = SubscriptionId::generate();

        let start = SubscriptionStart {
            id: id.clone(),
            path: path.to_string(),
            payload,
        };
        let message = protocol::to_wire(&start)?;

        let events = {
            let mut subscriptions = lock_ignore_poison(&self.inner.subscriptions);
            subscriptions.register(id.clone())
        };

        if let Err(err) = self
            .inner
            .transport
            .notify(&self.inner.channels.sub_start, message)
            .await
        {
            // The subscription never existed remotely; roll back.
            let mut subscriptions = lock_ignore_poison(&self.inner.subscriptions);
            subscriptions.remove(&id);
            return Err(err);
        }

        Ok(ClientSubscription::new(self.clone(), id, events))
    }

    /// Detach the observer for a subscription id.
    pub(super) fn detach_observer(&self, id: &SubscriptionId) -> bool {
        // ---
        let mut subscriptions = lock_ignore_poison(&self.inner.subscriptions);
        subscriptions.remove(id)
    }

    /// Best-effort stop notice; failures are logged, not surfaced.
    pub(super) async fn send_stop(&self, id: &SubscriptionId) {
        // ---
        let stop = SubscriptionStop { id: id.clone() };

        match protocol::to_wire(&stop) {
            Ok(message) => {
                if let Err(_err) = self
                    .inner
                    .transport
                    .notify(&self.inner.channels.sub_stop, message)
                    .await
                {
                    log_debug!("stop notice for {id} not delivered: {_err}");
                }
            }
            Err(_err) => {
                log_debug!("stop notice for {id} not encoded: {_err}");
            }
        }
    }

    /// Fire-and-forget variant of [`send_stop`](Self::send_stop) for drop
    /// paths that cannot await.
    pub(super) fn spawn_stop(&self, id: SubscriptionId) {
        // ---
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let client = self.clone();
            handle.spawn(async move {
                client.send_stop(&id).await;
            });
        }
    }

    /// Best-effort cancel notice; the caller has already failed locally.
    async fn send_cancel_notice(&self, id: &CorrelationId) {
        // ---
        let notice = CancelNotice { id: id.clone() };

        match protocol::to_wire(&notice) {
            Ok(message) => {
                if let Err(_err) = self
                    .inner
                    .transport
                    .notify(&self.inner.channels.cancel, message)
                    .await
                {
                    log_debug!("cancel notice for {id} not delivered: {_err}");
                }
            }
            Err(_err) => {
                log_debug!("cancel notice for {id} not encoded: {_err}");
            }
        }
    }

    /// Internal hook used by the shared listener to dispatch one event.
    fn handle_event(&self, bytes: &Bytes) {
        // ---
        match protocol::from_wire(bytes) {
            Ok(event) => {
                let mut subscriptions = lock_ignore_poison(&self.inner.subscriptions);
                subscriptions.dispatch(event);
            }
            Err(err) => {
                log_warn!("discarding malformed subscription event: {err}");
            }
        }
    }
}

impl Inner {
    // ---
    /// Resolve the pending entry for a finished invoke.
    ///
    /// A lookup miss means the call was already cancelled; the late outcome
    /// is discarded without side effects.
    fn settle(&self, call_id: &CorrelationId, raw: Result<Bytes>) {
        // ---
        let outcome: Result<Payload> = match raw {
            Ok(bytes) => match protocol::from_wire::<CallResponse>(&bytes) {
                Ok(response) if response.id != *call_id => {
                    log_warn!(
                        "correlation mismatch: sent {call_id}, received {}",
                        response.id
                    );
                    Err(Error::channel("correlation id mismatch in response"))
                }
                Ok(response) => match response.outcome {
                    CallOutcome::Success { payload } => Ok(payload),
                    CallOutcome::Failure { description } => Err(Error::Handler(description)),
                },
                Err(err) => Err(Error::channel(format!("malformed response: {err}"))),
            },
            Err(err) => Err(err),
        };

        let delivered = {
            let mut pending = lock_ignore_poison(&self.pending);
            pending.complete(call_id, outcome)
        };

        if !delivered {
            log_debug!("response arrived after call {call_id} was cancelled; discarding");
        }
    }
}
