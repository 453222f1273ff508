/// Client multiplexer: issue calls, open subscriptions, cancel, unsubscribe
mod pending;
mod rpc_client;
mod subscriptions;

pub use rpc_client::RpcClient;
pub use subscriptions::ClientSubscription;
