//! Defines a running mock deployment and assertion helpers for integration
//! tests

use std::{collections::HashMap, fmt::Debug, time::Duration};

use carma_mix::{
    config::MixParams,
    driver::{spawn_node, NodeHandle},
    guid::Guid,
    network::MockNetworkHub,
    phonebook::Psn,
    test_helpers::{mock_deployment, MockDeployment},
};
use futures::future::join_all;
use tokio::{runtime::Handle, time::timeout};

// -----------
// | Cluster |
// -----------

/// A deployment whose every node runs on its own driver task
pub(crate) struct MixCluster {
    /// The generated deployment
    pub deployment: MockDeployment,
    /// The running nodes by persona
    handles: HashMap<Psn, NodeHandle>,
}

impl MixCluster {
    /// Spawn every node of a `mock_deployment` over one mock network
    pub fn start(
        params: MixParams,
        n_groups: u32,
        group_size: usize,
        n_mbs: usize,
        n_clients: usize,
    ) -> Result<Self, String> {
        let deployment = mock_deployment(params, n_groups, group_size, n_mbs, n_clients);
        let hub = MockNetworkHub::new();

        // Spawning requires a runtime context
        let _guard = Handle::current().enter();
        let mut handles = HashMap::new();
        for local in deployment.locals.iter() {
            let network = hub.connect(local.psn.clone()).map_err(|e| e.to_string())?;
            let handle = spawn_node(deployment.node_config(local.psn.as_str()), network);
            handles.insert(local.psn.clone(), handle);
        }

        Ok(Self { deployment, handles })
    }

    /// The handle of a node
    fn handle(&mut self, psn: &str) -> Result<&mut NodeHandle, String> {
        self.handles.get_mut(&Psn::from(psn)).ok_or_else(|| format!("no node named {psn}"))
    }

    /// Send a message between two clients, returning its contribution ids
    pub fn send(&mut self, from: &str, to: &str, message: &[u8]) -> Result<Vec<Guid>, String> {
        let handle = self.handle(from)?;
        Handle::current()
            .block_on(handle.send_message(&Psn::from(to), message.to_vec()))
            .map_err(|e| e.to_string())
    }

    /// Wait for the next message delivered to a client
    pub fn expect_delivery(&mut self, psn: &str, wait: Duration) -> Result<Vec<u8>, String> {
        let handle = self.handle(psn)?;
        match Handle::current().block_on(timeout(wait, handle.next_delivery())) {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(format!("{psn} stopped before a delivery")),
            Err(_) => Err(format!("{psn} received nothing within {wait:?}")),
        }
    }

    /// Check that a client receives nothing further within `wait`
    pub fn expect_silence(&mut self, psn: &str, wait: Duration) -> Result<(), String> {
        let handle = self.handle(psn)?;
        match Handle::current().block_on(timeout(wait, handle.next_delivery())) {
            Ok(Some(message)) => {
                Err(format!("{psn} received an unexpected {} byte message", message.len()))
            },
            _ => Ok(()),
        }
    }

    /// Stop every node
    pub fn shutdown(self) {
        Handle::current().block_on(join_all(self.handles.into_values().map(|h| h.shutdown())));
    }
}

// --------------
// | Assertions |
// --------------

/// Compares two values, returning a result that can be propagated up an
/// integration test stack in the case that they differ
pub(crate) fn assert_eq_result<T: PartialEq + Debug>(a: T, b: T) -> Result<(), String> {
    if a == b {
        Ok(())
    } else {
        Err(format!("{a:?} != {b:?}"))
    }
}

/// Assert that a batch of messages matches another up to ordering
pub(crate) fn assert_same_messages(
    mut a: Vec<Vec<u8>>,
    mut b: Vec<Vec<u8>>,
) -> Result<(), String> {
    if a.len() != b.len() {
        return Err(format!("Lengths differ: {} != {}", a.len(), b.len()));
    }

    a.sort();
    b.sort();
    assert_eq_result(a, b)
}
