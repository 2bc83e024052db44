//! In-memory transport for in-process clusters (tests)
//!
//! Routes calls straight to registered handlers. Deregistering an
//! address simulates a crash: the node becomes unreachable in both
//! directions, since its own outbound calls also fail once its origin
//! address is gone from the registry.

use crate::common::{Error, Result};
use crate::net::message::PeerMessage;
use crate::net::transport::{PeerHandler, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Clone, Default)]
pub struct MemNet {
    inner: Arc<RwLock<HashMap<String, Arc<dyn PeerHandler>>>>,
}

impl MemNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: &str, handler: Arc<dyn PeerHandler>) {
        self.inner
            .write()
            .unwrap()
            .insert(addr.to_string(), handler);
    }

    /// Simulate a crash or partition of the node at `addr`.
    pub fn deregister(&self, addr: &str) {
        self.inner.write().unwrap().remove(addr);
    }

    pub fn is_registered(&self, addr: &str) -> bool {
        self.inner.read().unwrap().contains_key(addr)
    }

    /// A transport whose outbound calls fail while `origin` is
    /// deregistered.
    pub fn transport(&self, origin: &str) -> MemTransport {
        MemTransport {
            net: self.clone(),
            origin: origin.to_string(),
        }
    }
}

pub struct MemTransport {
    net: MemNet,
    origin: String,
}

#[async_trait]
impl Transport for MemTransport {
    async fn call(&self, addr: &str, msg: PeerMessage) -> Result<PeerMessage> {
        let handler = {
            let registry = self.net.inner.read().unwrap();
            if !registry.contains_key(&self.origin) {
                return Err(Error::NodeUnreachable(format!(
                    "origin {} is isolated",
                    self.origin
                )));
            }
            registry.get(addr).cloned()
        };
        match handler {
            Some(handler) => Ok(handler.handle(msg).await),
            None => Err(Error::NodeUnreachable(addr.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unit;

    #[async_trait]
    impl PeerHandler for Unit {
        async fn handle(&self, _msg: PeerMessage) -> PeerMessage {
            PeerMessage::LeaveAck
        }
    }

    #[tokio::test]
    async fn test_register_call_deregister() {
        let net = MemNet::new();
        net.register("mem://a", Arc::new(Unit));
        net.register("mem://b", Arc::new(Unit));

        let transport = net.transport("mem://a");
        assert!(transport
            .call("mem://b", PeerMessage::MetaRead)
            .await
            .is_ok());

        net.deregister("mem://b");
        assert!(matches!(
            transport.call("mem://b", PeerMessage::MetaRead).await,
            Err(Error::NodeUnreachable(_))
        ));

        // isolating the origin cuts outbound traffic too
        net.register("mem://b", Arc::new(Unit));
        net.deregister("mem://a");
        assert!(matches!(
            transport.call("mem://b", PeerMessage::MetaRead).await,
            Err(Error::NodeUnreachable(_))
        ));
    }
}
