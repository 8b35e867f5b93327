//! Defines an in-memory network for tests and the integration harness

use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{Sink, Stream};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{error::MixNetworkError, phonebook::Psn};

use super::{MixNetwork, NetworkOutbound};

/// Error message emitted when the routing table lock is poisoned
const ERR_POISONED: &str = "mock routing table poisoned";

/// The routing table shared by every node of a mock network
#[derive(Clone, Default)]
pub struct MockNetworkHub {
    /// The inbound channel of each connected node
    routes: Arc<Mutex<FxHashMap<Psn, UnboundedSender<NetworkOutbound>>>>,
}

impl MockNetworkHub {
    /// Create a hub with no nodes attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node, replacing any earlier connection for the same persona
    pub fn connect(&self, psn: Psn) -> Result<MockNetwork, MixNetworkError> {
        let (send, recv) = unbounded_channel();
        self.routes
            .lock()
            .map_err(|_| MixNetworkError::SendError(ERR_POISONED.to_string()))?
            .insert(psn.clone(), send);

        Ok(MockNetwork { psn, hub: self.clone(), recv })
    }

    /// Route an envelope to its recipient's inbound channel
    fn route(&self, envelope: NetworkOutbound) -> Result<(), MixNetworkError> {
        let routes =
            self.routes.lock().map_err(|_| MixNetworkError::SendError(ERR_POISONED.to_string()))?;
        let send = routes
            .get(&envelope.recipient)
            .ok_or_else(|| MixNetworkError::UnknownPeer(envelope.recipient.to_string()))?;

        send.send(envelope).map_err(|e| MixNetworkError::SendError(e.to_string()))
    }

    /// Detach a node so that envelopes addressed to it fail
    fn disconnect(&self, psn: &Psn) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.remove(psn);
        }
    }
}

/// One node's connection to a mock network
pub struct MockNetwork {
    /// The local persona
    psn: Psn,
    /// The hub outbound envelopes are routed through
    hub: MockNetworkHub,
    /// The node's inbound channel
    recv: UnboundedReceiver<NetworkOutbound>,
}

#[async_trait]
impl MixNetwork for MockNetwork {
    fn local_psn(&self) -> &Psn {
        &self.psn
    }

    async fn close(&mut self) -> Result<(), MixNetworkError> {
        self.hub.disconnect(&self.psn);
        self.recv.close();
        Ok(())
    }
}

impl Stream for MockNetwork {
    type Item = Result<NetworkOutbound, MixNetworkError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.recv.poll_recv(cx).map(|envelope| envelope.map(Ok))
    }
}

impl Sink<NetworkOutbound> for MockNetwork {
    type Error = MixNetworkError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: NetworkOutbound) -> Result<(), Self::Error> {
        self.hub.route(item)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod test {
    use futures::{SinkExt, StreamExt};

    use super::MockNetworkHub;
    use crate::{
        error::MixNetworkError,
        network::{MixNetwork, NetworkOutbound},
        phonebook::Psn,
    };

    /// Tests routing between two attached nodes and to a missing one
    #[tokio::test]
    async fn test_hub_routing() {
        let hub = MockNetworkHub::new();
        let mut alice = hub.connect(Psn::from("alice")).unwrap();
        let mut bob = hub.connect(Psn::from("bob")).unwrap();

        let envelope = NetworkOutbound {
            sender: Psn::from("alice"),
            recipient: Psn::from("bob"),
            sealed: vec![1, 2, 3],
        };
        alice.send(envelope.clone()).await.unwrap();
        assert_eq!(bob.next().await.unwrap().unwrap(), envelope);

        let stray = NetworkOutbound { recipient: Psn::from("carol"), ..envelope.clone() };
        let err = alice.send(stray).await.unwrap_err();
        assert!(matches!(err, MixNetworkError::UnknownPeer(_)));

        // A closed node is unreachable
        MixNetwork::close(&mut bob).await.unwrap();
        assert!(alice.send(envelope).await.is_err());
    }
}
