//! The `network` module defines the transport abstraction nodes exchange
//! sealed packets over
#[cfg(any(feature = "test_helpers", test))]
mod mock;

use async_trait::async_trait;
use futures::{Sink, Stream};
#[cfg(any(feature = "test_helpers", test))]
pub use mock::{MockNetwork, MockNetworkHub};
use serde::{Deserialize, Serialize};

use crate::{error::MixNetworkError, phonebook::Psn};

// ---------
// | Trait |
// ---------

/// A sealed packet in transit between two nodes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOutbound {
    /// The node that sealed the packet
    pub sender: Psn,
    /// The node the packet is addressed to
    pub recipient: Psn,
    /// The encoded packet, authenticated-encrypted from sender to recipient
    #[serde(with = "hex::serde")]
    pub sealed: Vec<u8>,
}

/// The `MixNetwork` trait defines the connection between a node and the rest
/// of the overlay
///
/// Envelopes are addressed by persona; the transport neither inspects nor
/// authenticates their contents
#[async_trait]
pub trait MixNetwork:
    Send
    + Stream<Item = Result<NetworkOutbound, MixNetworkError>>
    + Sink<NetworkOutbound, Error = MixNetworkError>
    + Unpin
{
    /// The persona of the local node
    fn local_psn(&self) -> &Psn;
    /// Closes the connection to the overlay
    async fn close(&mut self) -> Result<(), MixNetworkError>;
}
