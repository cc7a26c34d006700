//! Type→handler packet dispatch.
//!
//! [`PacketDispatcher`] maps a [`PacketType`] to a type-erased async handler.
//! Each registration closes over the deserializer for its payload type: at
//! dispatch time the envelope's type tag is peeked, the matching shim decodes
//! the full envelope and invokes the typed handler. Unknown types are not
//! errors; deserialization failures are logged and the packet dropped without
//! touching the connection.
//!
//! Registration and lookup are concurrency-safe, but handlers run
//! sequentially on the poll loop that calls [`dispatch`](PacketDispatcher::dispatch).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::protocol::{PacketEnvelope, PacketType};
use crate::serializer;
use crate::transport::{Channel, Connection};

// ── Context & outcome ───────────────────────────────────────────────

/// Which side of the protocol the dispatching runtime is.
///
/// Lets a shared handler body reject packets arriving at the wrong endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Client,
    Server,
}

/// Per-dispatch context handed to every handler.
#[derive(Clone)]
pub struct HandlerContext {
    /// The connection the packet arrived on.
    pub connection: Arc<dyn Connection>,
    /// The channel it was delivered on.
    pub channel: Channel,
    /// The role of this endpoint.
    pub role: EndpointRole,
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("connection", &self.connection.id())
            .field("channel", &self.channel)
            .field("role", &self.role)
            .finish()
    }
}

/// What happened to a dispatched packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler was invoked.
    Handled,
    /// No handler is registered for the packet's type (not an error).
    UnknownType,
    /// A handler exists but the payload failed to decode; the packet was
    /// dropped and the connection left alone.
    DeserializationFailed,
}

impl DispatchOutcome {
    /// True iff a handler was invoked.
    pub fn handled(self) -> bool {
        matches!(self, Self::Handled)
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────

type HandlerFuture = Pin<Box<dyn Future<Output = DispatchOutcome> + Send>>;
type ErasedHandler = Arc<dyn Fn(HandlerContext, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Registry of type-erased packet handlers.
#[derive(Default)]
pub struct PacketDispatcher {
    handlers: RwLock<HashMap<PacketType, ErasedHandler>>,
}

impl PacketDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `packet_type`, replacing any prior entry.
    ///
    /// The stored shim decodes incoming bytes into `PacketEnvelope<T>` before
    /// invoking `handler`.
    pub fn register_handler<T, F, Fut>(&self, packet_type: PacketType, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(HandlerContext, PacketEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let shim: ErasedHandler = Arc::new(move |ctx: HandlerContext, bytes: Vec<u8>| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                match serializer::decode::<T>(&bytes) {
                    Ok(envelope) => {
                        handler(ctx, envelope).await;
                        DispatchOutcome::Handled
                    }
                    Err(error) => {
                        warn!(?packet_type, %error, "dropping undecodable packet");
                        DispatchOutcome::DeserializationFailed
                    }
                }
            })
        });
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(packet_type, shim);
        }
    }

    /// Remove the handler for `packet_type`. Returns whether one existed.
    pub fn try_unregister_handler(&self, packet_type: PacketType) -> bool {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.remove(&packet_type).is_some(),
            Err(_) => false,
        }
    }

    /// Peek the payload's type tag, look up its handler and invoke it.
    ///
    /// The registry lock is released before the handler runs, so handlers may
    /// re-register freely.
    pub async fn dispatch(&self, payload: &[u8], ctx: HandlerContext) -> DispatchOutcome {
        let Some(packet_type) = serializer::peek_type(payload) else {
            return DispatchOutcome::UnknownType;
        };
        let handler = match self.handlers.read() {
            Ok(handlers) => handlers.get(&packet_type).cloned(),
            Err(_) => None,
        };
        match handler {
            Some(handler) => handler(ctx, payload.to_vec()).await,
            None => DispatchOutcome::UnknownType,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::protocol::Heartbeat;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct NullConnection;

    impl Connection for NullConnection {
        fn id(&self) -> u64 {
            7
        }
        fn remote_addr(&self) -> SocketAddr {
            "127.0.0.1:0".parse().unwrap()
        }
        fn send(&self, _payload: &[u8], _channel: Channel) -> Result<(), TransportError> {
            Ok(())
        }
        fn disconnect(&self, _reason: Option<&[u8]>) {}
        fn is_open(&self) -> bool {
            true
        }
    }

    fn ctx() -> HandlerContext {
        HandlerContext {
            connection: Arc::new(NullConnection),
            channel: Channel::ReliableOrdered,
            role: EndpointRole::Server,
        }
    }

    fn heartbeat_bytes() -> Vec<u8> {
        serializer::encode(&PacketEnvelope::new(
            PacketType::Heartbeat,
            Heartbeat {
                client_time_millis: 1,
            },
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn dispatch_invokes_registered_handler() {
        let dispatcher = PacketDispatcher::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_in = Arc::clone(&hits);
        dispatcher.register_handler::<Heartbeat, _, _>(PacketType::Heartbeat, move |_ctx, _env| {
            let hits = Arc::clone(&hits_in);
            async move {
                hits.fetch_add(1, Ordering::Relaxed);
            }
        });

        let outcome = dispatcher.dispatch(&heartbeat_bytes(), ctx()).await;
        assert!(outcome.handled());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unknown_type_is_not_an_error() {
        let dispatcher = PacketDispatcher::new();
        let outcome = dispatcher.dispatch(&heartbeat_bytes(), ctx()).await;
        assert_eq!(outcome, DispatchOutcome::UnknownType);
    }

    #[tokio::test]
    async fn reregistration_replaces_prior_handler() {
        let dispatcher = PacketDispatcher::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&first);
        dispatcher.register_handler::<Heartbeat, _, _>(PacketType::Heartbeat, move |_c, _e| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
        let counter = Arc::clone(&second);
        dispatcher.register_handler::<Heartbeat, _, _>(PacketType::Heartbeat, move |_c, _e| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        dispatcher.dispatch(&heartbeat_bytes(), ctx()).await;
        assert_eq!(first.load(Ordering::Relaxed), 0);
        assert_eq!(second.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped() {
        let dispatcher = PacketDispatcher::new();
        dispatcher
            .register_handler::<Heartbeat, _, _>(PacketType::Heartbeat, |_c, _e| async {});
        let bytes = br#"{"type":"Heartbeat","version":"x","payload":{"clientTimeMillis":"nope"}}"#;
        let outcome = dispatcher.dispatch(bytes, ctx()).await;
        assert_eq!(outcome, DispatchOutcome::DeserializationFailed);
    }

    #[test]
    fn unregister_reports_presence() {
        let dispatcher = PacketDispatcher::new();
        dispatcher
            .register_handler::<Heartbeat, _, _>(PacketType::Heartbeat, |_c, _e| async {});
        assert!(dispatcher.try_unregister_handler(PacketType::Heartbeat));
        assert!(!dispatcher.try_unregister_handler(PacketType::Heartbeat));
    }
}
