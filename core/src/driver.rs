//! Defines the async driver that sits between a node's transport and its
//! protocol state
//!
//! The driver owns the node; every inbound envelope and application command
//! is processed on its single task, so the node state is never shared

use futures::{SinkExt, StreamExt};
use kanal::{AsyncReceiver as KanalReceiver, AsyncSender as KanalSender};
use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    sync::{
        broadcast::{self, Receiver as BroadcastReceiver, Sender as BroadcastSender},
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::log;

use crate::{
    config::NodeConfig,
    crypto::{auth_decrypt, auth_encrypt},
    error::{MixError, MixNetworkError},
    guid::Guid,
    network::{MixNetwork, NetworkOutbound},
    node::{MixNode, Outbox},
    phonebook::Psn,
};

/// Error message emitted when a stream closes early
const ERR_STREAM_FINISHED_EARLY: &str = "stream finished early";
/// Error message emitted when the driver is gone
const ERR_DRIVER_STOPPED: &str = "node driver stopped";

/// A request from the application to its node
#[derive(Debug)]
pub enum NodeCommand {
    /// Send a message to another client
    SendMessage {
        /// The recipient client
        recipient: Psn,
        /// The message body
        message: Vec<u8>,
        /// Receives the contribution ids or the failure
        response: oneshot::Sender<Result<Vec<Guid>, MixError>>,
    },
}

// ----------
// | Driver |
// ----------

/// Moves envelopes between the transport and a node
pub struct NodeDriver<N: MixNetwork> {
    /// The protocol state
    node: MixNode,
    /// The transport
    network: N,
    /// Commands from the application
    commands: KanalReceiver<NodeCommand>,
    /// Messages delivered to the application
    deliveries: UnboundedSender<Vec<u8>>,
    /// The broadcast channel on which shutdown signals are sent
    shutdown: BroadcastReceiver<()>,
    /// The randomness used for sharing, sealing and root finding
    rng: StdRng,
}

impl<N: MixNetwork> NodeDriver<N> {
    /// Create a driver for a node
    pub fn new(
        node: MixNode,
        network: N,
        commands: KanalReceiver<NodeCommand>,
        deliveries: UnboundedSender<Vec<u8>>,
        shutdown: BroadcastReceiver<()>,
    ) -> Self {
        Self { node, network, commands, deliveries, shutdown, rng: StdRng::from_entropy() }
    }

    /// Run until shutdown, the transport fails or the handle is dropped
    pub async fn run(mut self) {
        let psn = self.node.config().psn().clone();
        loop {
            let mut outbox = Outbox::default();
            tokio::select! {
                envelope = self.network.next() => match envelope {
                    Some(Ok(envelope)) => self.handle_envelope(envelope, &mut outbox),
                    Some(Err(e)) => {
                        log::error!("{psn}: error reading from the network: {e}");
                        break;
                    },
                    None => {
                        log::error!("{psn}: {ERR_STREAM_FINISHED_EARLY}");
                        break;
                    },
                },
                command = self.commands.recv() => match command {
                    Ok(command) => self.handle_command(command, &mut outbox),
                    Err(_) => {
                        log::info!("{psn}: node handle dropped");
                        break;
                    },
                },
                _ = self.shutdown.recv() => {
                    log::info!("{psn}: received shutdown signal");
                    break;
                },
            }

            if let Err(e) = self.flush(outbox).await {
                log::error!("{psn}: error writing to the network: {e}");
                break;
            }
        }

        if let Err(e) = MixNetwork::close(&mut self.network).await {
            log::warn!("{psn}: error closing the network: {e}");
        }
    }

    /// Open an envelope and pass its packet to the node
    ///
    /// Failures are confined to the one packet
    fn handle_envelope(&mut self, envelope: NetworkOutbound, outbox: &mut Outbox) {
        let config = self.node.config();
        if &envelope.recipient != config.psn() {
            log::warn!("{}: dropping envelope for {}", config.psn(), envelope.recipient);
            return;
        }

        let Some(sender) = config.phonebook().get(&envelope.sender) else {
            log::warn!("{}: dropping envelope from unknown {}", config.psn(), envelope.sender);
            return;
        };

        let bytes = match auth_decrypt(config.keypair(), &sender.public_key, &envelope.sealed) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("{}: dropping envelope from {}: {e}", config.psn(), envelope.sender);
                return;
            },
        };

        if let Err(e) = self.node.handle_packet(&envelope.sender, &bytes, outbox, &mut self.rng) {
            let psn = self.node.config().psn();
            if e.is_corruption() {
                log::error!("{psn}: packet from {} dropped: {e}", envelope.sender);
            } else {
                log::warn!("{psn}: packet from {} dropped: {e}", envelope.sender);
            }
        }
    }

    /// Execute an application command
    fn handle_command(&mut self, command: NodeCommand, outbox: &mut Outbox) {
        match command {
            NodeCommand::SendMessage { recipient, message, response } => {
                let res = self.node.submit_message(&recipient, &message, outbox, &mut self.rng);
                if response.send(res).is_err() {
                    log::debug!("send response dropped by the application");
                }
            },
        }
    }

    /// Seal and send every queued packet, then hand off delivered messages
    async fn flush(&mut self, outbox: Outbox) -> Result<(), MixNetworkError> {
        let config = self.node.config();
        let mut envelopes = Vec::with_capacity(outbox.packets.len());
        for (recipient, packet) in outbox.packets {
            let Some(info) = config.phonebook().get(&recipient) else {
                log::warn!("{}: no route to {recipient}", config.psn());
                continue;
            };

            let sealed =
                auth_encrypt(config.keypair(), &info.public_key, &packet.encode(), &mut self.rng);
            match sealed {
                Ok(sealed) => envelopes.push(NetworkOutbound {
                    sender: config.psn().clone(),
                    recipient,
                    sealed,
                }),
                Err(e) => log::error!("{}: failed to seal for {recipient}: {e}", config.psn()),
            }
        }

        for envelope in envelopes {
            match self.network.send(envelope).await {
                // An unreachable peer loses the packet but not the node
                Err(MixNetworkError::UnknownPeer(peer)) => {
                    log::warn!("{}: peer {peer} unreachable", self.node.config().psn())
                },
                res => res?,
            }
        }

        for message in outbox.delivered {
            if self.deliveries.send(message).is_err() {
                log::debug!("delivery receiver dropped");
            }
        }

        Ok(())
    }
}

// ----------
// | Handle |
// ----------

/// The application's side of a running node
pub struct NodeHandle {
    /// The node's persona
    psn: Psn,
    /// Commands to the driver
    commands: KanalSender<NodeCommand>,
    /// Messages delivered by the driver
    deliveries: UnboundedReceiver<Vec<u8>>,
    /// Signals the driver to stop
    shutdown: BroadcastSender<()>,
    /// The driver task
    task: JoinHandle<()>,
}

impl NodeHandle {
    /// The node's persona
    pub fn psn(&self) -> &Psn {
        &self.psn
    }

    /// Ask a client node to send a message, returning its contribution ids
    pub async fn send_message(
        &self,
        recipient: &Psn,
        message: Vec<u8>,
    ) -> Result<Vec<Guid>, MixError> {
        let (response, recv) = oneshot::channel();
        let command = NodeCommand::SendMessage { recipient: recipient.clone(), message, response };
        self.commands
            .send(command)
            .await
            .map_err(|e| MixNetworkError::SendError(e.to_string()))?;

        recv.await.map_err(|_| MixNetworkError::RecvError(ERR_DRIVER_STOPPED.to_string()))?
    }

    /// Wait for the next message delivered to this node
    ///
    /// Returns `None` once the driver has stopped
    pub async fn next_delivery(&mut self) -> Option<Vec<u8>> {
        self.deliveries.recv().await
    }

    /// Stop the driver and wait for it to exit
    pub async fn shutdown(self) {
        // The driver may already have stopped on its own
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            log::error!("{}: driver task failed: {e}", self.psn);
        }
    }
}

/// Start a node on the given transport
pub fn spawn_node<N: MixNetwork + 'static>(config: NodeConfig, network: N) -> NodeHandle {
    let psn = config.psn().clone();
    let (command_send, command_recv) = kanal::unbounded_async();
    let (delivery_send, delivery_recv) = unbounded_channel();
    let (shutdown_send, shutdown_recv) = broadcast::channel(1);

    let driver = NodeDriver::new(
        MixNode::new(config),
        network,
        command_recv,
        delivery_send,
        shutdown_recv,
    );
    let task = tokio::spawn(driver.run());

    NodeHandle {
        psn,
        commands: command_send,
        deliveries: delivery_recv,
        shutdown: shutdown_send,
        task,
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::time::timeout;

    use super::spawn_node;
    use crate::{
        network::{MockNetworkHub, NetworkOutbound},
        phonebook::Psn,
        test_helpers::{large_params, mock_deployment},
    };

    /// How long a test waits on a delivery
    const DELIVERY_TIMEOUT: Duration = Duration::from_secs(120);

    /// Tests a message crossing a deployment of spawned nodes
    #[tokio::test(flavor = "multi_thread")]
    async fn test_spawned_round() {
        let deployment = mock_deployment(large_params(1), 1, 3, 1, 2);
        let hub = MockNetworkHub::new();

        let mut handles = Vec::new();
        for local in deployment.locals.iter() {
            let network = hub.connect(local.psn.clone()).unwrap();
            handles.push(spawn_node(deployment.node_config(local.psn.as_str()), network));
        }

        let position = |psn: &str| handles.iter().position(|h| h.psn() == &Psn::from(psn));
        let sender_idx = position("client-0").unwrap();
        let recipient_idx = position("client-1").unwrap();

        let cids = handles[sender_idx]
            .send_message(&Psn::from("client-1"), b"ping".to_vec())
            .await
            .unwrap();
        assert_eq!(cids.len(), 1);

        let delivered = timeout(DELIVERY_TIMEOUT, handles[recipient_idx].next_delivery())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, b"ping".to_vec());

        for handle in handles {
            handle.shutdown().await;
        }
    }

    /// Tests that forged and misaddressed envelopes are dropped without
    /// stopping the node
    #[tokio::test]
    async fn test_forged_envelopes_dropped() {
        let deployment = mock_deployment(large_params(1), 1, 2, 1, 2);
        let hub = MockNetworkHub::new();
        let mut attacker = hub.connect(Psn::from("attacker")).unwrap();

        let network = hub.connect(Psn::from("mb-0")).unwrap();
        let handle = spawn_node(deployment.node_config("mb-0"), network);

        let forged = NetworkOutbound {
            sender: Psn::from("client-0"),
            recipient: Psn::from("mb-0"),
            sealed: vec![0; 64],
        };
        attacker.send(forged.clone()).await.unwrap();
        attacker.send(NetworkOutbound { sender: Psn::from("attacker"), ..forged }).await.unwrap();

        // Nothing comes back, and the node still answers commands
        assert!(timeout(Duration::from_millis(200), attacker.next()).await.is_err());
        assert!(handle.send_message(&Psn::from("client-1"), b"x".to_vec()).await.is_err());
        handle.shutdown().await;
    }
}
