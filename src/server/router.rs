//! Handler registry for the dispatcher.
//!
//! Paths resolve through an explicit table built once at startup, so an
//! unknown path fails predictably instead of faulting at invocation time.
//! Typed handlers are erased to wire-payload functions at registration
//! (decode input, invoke, encode output), which keeps the dispatcher free of
//! any knowledge of handler types.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::correlation::ConnectionId;
use crate::envelope::Payload;
use crate::Result;

/// Buffer between a handler's stream source and the dispatcher's pump.
const SOURCE_BUFFER: usize = 16;

/// Per-invocation context threaded into every handler.
///
/// Carries the identity of the connection the request arrived on and a
/// cooperative cancellation token. For unary calls the token fires when the
/// caller sends a cancel notice; for subscriptions it fires when the
/// subscription is released (stop, teardown, or connection loss).
/// Cancellation is advisory: a handler that never checks the token simply
/// runs to completion.
#[derive(Clone)]
pub struct CallContext {
    // ---
    connection: ConnectionId,
    cancel: CancellationToken,
}

impl CallContext {
    // ---
    pub(crate) fn new(connection: ConnectionId, cancel: CancellationToken) -> Self {
        Self { connection, cancel }
    }

    /// The connection this invocation arrived on.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// The cooperative cancellation token for this invocation.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Type-erased unary handler: wire payload in, wire payload out.
pub(crate) type BoxedUnaryHandler =
    Arc<dyn Fn(CallContext, Payload) -> BoxFuture<Result<Payload>> + Send + Sync>;

/// Type-erased stream handler: resolves to a source of pre-encoded events.
pub(crate) type BoxedStreamHandler = Arc<
    dyn Fn(CallContext, Payload) -> BoxFuture<Result<mpsc::Receiver<Result<Payload>>>>
        + Send
        + Sync,
>;

/// Wrap a typed unary handler into a type-erased one.
fn wrap_unary<F, Fut, Req, Resp>(handler: F) -> BoxedUnaryHandler
where
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    // ---
    Arc::new(move |ctx: CallContext, payload: Payload| {
        // ---
        // An absent payload decodes as JSON null, so `Req = Option<_>`
        // models optional input.
        let fut: BoxFuture<Result<Payload>> = match payload.decode_or_null::<Req>() {
            Ok(input) => {
                let fut = handler(ctx, input);
                Box::pin(async move {
                    let resp = fut.await?;
                    Payload::encode(&resp)
                })
            }
            Err(err) => Box::pin(async move { Err(err) }),
        };

        fut
    })
}

/// Wrap a wire-level unary handler.
fn wrap_raw<F, Fut>(handler: F) -> BoxedUnaryHandler
where
    F: Fn(CallContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    // ---
    Arc::new(move |ctx: CallContext, payload: Payload| {
        let fut: BoxFuture<Result<Payload>> = Box::pin(handler(ctx, payload));
        fut
    })
}

/// Wrap a typed stream handler into a type-erased one.
///
/// The handler's items are encoded right next to the source; the dispatcher
/// only ever moves wire payloads. Dropping the erased receiver releases the
/// pump, which drops the handler's source in turn so producers observe the
/// detach.
fn wrap_stream<F, Fut, Req, Item>(handler: F) -> BoxedStreamHandler
where
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<mpsc::Receiver<Result<Item>>>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Item: Serialize + Send + 'static,
{
    // ---
    Arc::new(move |ctx: CallContext, payload: Payload| {
        // ---
        let fut: BoxFuture<Result<mpsc::Receiver<Result<Payload>>>> =
            match payload.decode_or_null::<Req>() {
                Ok(input) => {
                    let source_fut = handler(ctx, input);

                    Box::pin(async move {
                        let mut source = source_fut.await?;
                        let (tx, rx) = mpsc::channel(SOURCE_BUFFER);

                        tokio::spawn(async move {
                            // ---
                            while let Some(item) = source.recv().await {
                                let mapped = item.and_then(|value| Payload::encode(&value));
                                if tx.send(mapped).await.is_err() {
                                    // Released downstream; stop encoding.
                                    break;
                                }
                            }
                        });

                        Ok(rx)
                    })
                }
                Err(err) => Box::pin(async move { Err(err) }),
            };

        fut
    })
}

/// Immutable path → handler table.
///
/// Built once via [`RouterBuilder`]; the dispatcher resolves every incoming
/// path against it.
pub struct Router {
    // ---
    unary: HashMap<String, BoxedUnaryHandler>,
    streams: HashMap<String, BoxedStreamHandler>,
}

impl Router {
    // ---
    /// Start building a router.
    pub fn builder() -> RouterBuilder {
        RouterBuilder {
            router: Router {
                unary: HashMap::new(),
                streams: HashMap::new(),
            },
        }
    }

    pub(crate) fn unary(&self, path: &str) -> Option<BoxedUnaryHandler> {
        self.unary.get(path).cloned()
    }

    pub(crate) fn stream(&self, path: &str) -> Option<BoxedStreamHandler> {
        self.streams.get(path).cloned()
    }
}

/// Builder for [`Router`].
///
/// Registering two handlers under one path is a startup-time
/// misconfiguration and panics with the offending path.
///
/// # Example
///
/// ```
/// use mux_rpc::{CallContext, Router};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize)]
/// struct AddInput { a: i32, b: i32 }
///
/// #[derive(Serialize)]
/// struct AddOutput { sum: i32 }
///
/// let router = Router::builder()
///     .query("add", |_ctx: CallContext, input: AddInput| async move {
///         Ok(AddOutput { sum: input.a + input.b })
///     })
///     .build();
/// ```
pub struct RouterBuilder {
    // ---
    router: Router,
}

impl RouterBuilder {
    // ---
    /// Register a read handler.
    pub fn query<F, Fut, Req, Resp>(self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.insert_unary(path.into(), wrap_unary(handler))
    }

    /// Register a state-changing handler.
    ///
    /// Both call kinds travel the same request/response path; the two
    /// registration methods exist to keep routers self-describing.
    pub fn mutation<F, Fut, Req, Resp>(self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.insert_unary(path.into(), wrap_unary(handler))
    }

    /// Register a unary handler at the wire-payload level.
    ///
    /// The only registration form whose response payload can be absent on
    /// the wire rather than a serialized value.
    pub fn query_raw<F, Fut>(self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.insert_unary(path.into(), wrap_raw(handler))
    }

    /// Register a streaming handler.
    ///
    /// The handler resolves to an `mpsc::Receiver` of items: `Ok` items
    /// become data events, the first `Err` is the terminal error event, and
    /// closing the channel completes the subscription.
    pub fn subscription<F, Fut, Req, Item>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<mpsc::Receiver<Result<Item>>>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Item: Serialize + Send + 'static,
    {
        // ---
        let path = path.into();
        self.assert_free(&path);
        self.router.streams.insert(path, wrap_stream(handler));
        self
    }

    /// Finish the router.
    pub fn build(self) -> Router {
        self.router
    }

    fn insert_unary(mut self, path: String, handler: BoxedUnaryHandler) -> Self {
        // ---
        self.assert_free(&path);
        self.router.unary.insert(path, handler);
        self
    }

    fn assert_free(&self, path: &str) {
        // ---
        if self.router.unary.contains_key(path) || self.router.streams.contains_key(path) {
            panic!("duplicate handler registration for path: {path}");
        }
    }
}
