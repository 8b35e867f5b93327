//! Integration tests for full mixing rounds over a mock deployment

use std::time::Duration;

use carma_mix::test_helpers::large_params;
use itertools::Itertools;
use rand::{thread_rng, RngCore};

use crate::{
    helpers::{assert_eq_result, assert_same_messages, MixCluster},
    IntegrationTest, IntegrationTestArgs,
};

/// How long a test listens for a duplicate delivery
const SILENCE_WINDOW: Duration = Duration::from_secs(2);

/// Generate a random message of the given length
fn random_message(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    thread_rng().fill_bytes(&mut buf);
    buf
}

// ---------
// | Tests |
// ---------

/// Tests a single message through a committee whose followers relay to the
/// leader
fn test_relay_round(test_args: &IntegrationTestArgs) -> Result<(), String> {
    let mut cluster = MixCluster::start(large_params(1), 1, 3, 1, 2)?;
    let message = b"hello through the mix".to_vec();

    let cids = cluster.send("client-0", "client-1", &message)?;
    assert_eq_result(cids.len(), 1)?;

    let res = cluster.expect_delivery("client-1", test_args.delivery_timeout);
    cluster.shutdown();
    assert_eq_result(res?, message)
}
inventory::submit!(IntegrationTest {
    name: "mixing::test_relay_round",
    test_fn: test_relay_round,
});

/// Tests a round in which every member broadcasts its power sums
fn test_broadcast_round(test_args: &IntegrationTestArgs) -> Result<(), String> {
    let mut params = large_params(2);
    params.leader_relay_only = false;
    let mut cluster = MixCluster::start(params, 1, 4, 2, 4)?;

    // Two clients fill one batch, each recipient gets exactly one message
    let first = b"first".to_vec();
    let second = b"second".to_vec();
    cluster.send("client-0", "client-2", &first)?;
    cluster.send("client-1", "client-3", &second)?;

    let res = (|| {
        assert_eq_result(cluster.expect_delivery("client-2", test_args.delivery_timeout)?, first)?;
        assert_eq_result(cluster.expect_delivery("client-3", test_args.delivery_timeout)?, second)?;

        // Every member routes every root, the mailboxes deliver once
        cluster.expect_silence("client-2", SILENCE_WINDOW)?;
        cluster.expect_silence("client-3", SILENCE_WINDOW)
    })();

    cluster.shutdown();
    res
}
inventory::submit!(IntegrationTest {
    name: "mixing::test_broadcast_round",
    test_fn: test_broadcast_round,
});

/// Tests a message long enough to be split across several contributions
fn test_chunked_message(test_args: &IntegrationTestArgs) -> Result<(), String> {
    let mut cluster = MixCluster::start(large_params(3), 1, 3, 1, 2)?;
    // Three chunks fill exactly one batch
    let message = random_message(100);

    let cids = cluster.send("client-0", "client-1", &message)?;
    if cids.len() != 3 {
        cluster.shutdown();
        return Err(format!("expected three chunks, got {}", cids.len()));
    }

    let res = cluster.expect_delivery("client-1", test_args.delivery_timeout);
    cluster.shutdown();
    assert_eq_result(res?, message)
}
inventory::submit!(IntegrationTest {
    name: "mixing::test_chunked_message",
    test_fn: test_chunked_message,
});

/// Tests several rounds carried by more than one committee
fn test_many_rounds(test_args: &IntegrationTestArgs) -> Result<(), String> {
    const N_MESSAGES: usize = 6;
    let mut cluster = MixCluster::start(large_params(1), 2, 3, 2, 2)?;

    // Each message is its own round on whichever committee the sender picks
    let messages = (0..N_MESSAGES).map(|i| format!("message {i}").into_bytes()).collect_vec();
    for message in messages.iter() {
        cluster.send("client-0", "client-1", message)?;
    }

    let res = (|| {
        let mut received = Vec::with_capacity(N_MESSAGES);
        for _ in 0..N_MESSAGES {
            received.push(cluster.expect_delivery("client-1", test_args.delivery_timeout)?);
        }

        assert_same_messages(received, messages.clone())?;
        cluster.expect_silence("client-1", SILENCE_WINDOW)
    })();

    cluster.shutdown();
    res
}
inventory::submit!(IntegrationTest {
    name: "mixing::test_many_rounds",
    test_fn: test_many_rounds,
});
