//! The directory of known nodes: roles, keys, committee membership and
//! mailbox assignments
//!
//! Everything derived from the entries (groups, hash index) is computed once
//! when the phonebook is built and never mutated afterwards

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
};

use digest::Digest;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha3::Sha3_256;
use x25519_dalek::PublicKey;

use crate::{crypto::KeyBytes, error::MixError, LEADER_ORDER};

/// The number of bytes in a persona hash
pub const PSN_HASH_BYTES: usize = 32;

// ------------
// | Personas |
// ------------

/// The name of a node in the overlay
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Psn(String);

impl Psn {
    /// Construct a persona from its name
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    /// The name as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The SHA3-256 hash of the name
    pub fn hash(&self) -> PsnHash {
        let digest = Sha3_256::digest(self.0.as_bytes());
        let mut bytes = [0u8; PSN_HASH_BYTES];
        bytes.copy_from_slice(&digest);
        PsnHash(bytes)
    }
}

impl Display for Psn {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Psn {
    fn from(name: &str) -> Self {
        Psn::new(name)
    }
}

/// The hash of a persona, used to name a destination inside encrypted
/// payloads
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PsnHash(pub [u8; PSN_HASH_BYTES]);

impl Display for PsnHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ---------
// | Roles |
// ---------

/// The role a node plays in the overlay
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// An end user sending and receiving messages
    Client,
    /// A server with no current duty
    IdleServer,
    /// A mailbox server, the entry and exit hop of a mixing round
    MbServer,
    /// A committee member other than the leader
    McFollower,
    /// The committee member that batches contributions into rounds
    McLeader,
    /// A reserve server
    RsServer,
}

impl Role {
    /// Whether the role belongs to a mixing committee
    pub fn is_mc(&self) -> bool {
        matches!(self, Role::McLeader | Role::McFollower)
    }
}

// -----------
// | Entries |
// -----------

/// A phonebook entry as it appears in configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhonebookEntry {
    /// The node's persona
    pub psn: Psn,
    /// The node's role
    pub role: Role,
    /// The node's public key
    pub public_key: KeyBytes,
    /// The committee the node belongs to, committee members only
    #[serde(default)]
    pub group: Option<u32>,
    /// The node's position within its committee, the leader holds zero
    #[serde(default)]
    pub order: Option<usize>,
    /// The mailbox servers serving a client
    #[serde(default)]
    pub mailboxes: Vec<Psn>,
}

/// The public half of a committee's shared group key
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McGroupKey {
    /// The committee number
    pub group: u32,
    /// The committee's group public key
    pub public_key: KeyBytes,
}

/// A validated view of a node
#[derive(Clone, Debug)]
pub struct NodeInfo {
    /// The node's persona
    pub psn: Psn,
    /// The node's role
    pub role: Role,
    /// The node's public key
    pub public_key: PublicKey,
    /// The committee the node belongs to
    pub group: Option<u32>,
    /// The node's position within its committee
    pub order: Option<usize>,
    /// The mailbox servers serving a client
    pub mailboxes: Vec<Psn>,
}

impl NodeInfo {
    /// Whether `mailbox` serves this node
    pub fn has_mailbox(&self, mailbox: &Psn) -> bool {
        self.mailboxes.contains(mailbox)
    }
}

/// A mixing committee
#[derive(Clone, Debug)]
pub struct McGroup {
    /// The committee number
    pub number: u32,
    /// The members indexed by their order, the leader first
    pub members: Vec<Psn>,
    /// The committee's group public key
    pub public_key: PublicKey,
}

impl McGroup {
    /// The committee leader
    pub fn leader(&self) -> &Psn {
        &self.members[0]
    }

    /// The number of members
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

// -------------
// | Phonebook |
// -------------

/// The immutable directory of all nodes in a deployment
#[derive(Clone, Debug)]
pub struct Phonebook {
    /// Nodes by persona
    entries: BTreeMap<Psn, NodeInfo>,
    /// Personas by hash
    by_hash: FxHashMap<PsnHash, Psn>,
    /// Committees by number
    groups: BTreeMap<u32, McGroup>,
}

impl Phonebook {
    /// Validate the configured entries and precompute the derived indices
    pub fn new(
        entries: Vec<PhonebookEntry>,
        group_keys: Vec<McGroupKey>,
    ) -> Result<Self, MixError> {
        let mut nodes = BTreeMap::new();
        let mut by_hash = FxHashMap::default();
        for entry in entries {
            let info = NodeInfo {
                psn: entry.psn.clone(),
                role: entry.role,
                public_key: entry.public_key.into(),
                group: entry.group,
                order: entry.order,
                mailboxes: entry.mailboxes,
            };

            by_hash.insert(entry.psn.hash(), entry.psn.clone());
            if nodes.insert(entry.psn.clone(), info).is_some() {
                return Err(MixError::Config(format!("duplicate phonebook entry {}", entry.psn)));
            }
        }

        let groups = Self::build_groups(&nodes, group_keys)?;
        Self::check_mailboxes(&nodes)?;

        Ok(Self { entries: nodes, by_hash, groups })
    }

    /// Assemble the committees from the members' group and order fields
    fn build_groups(
        nodes: &BTreeMap<Psn, NodeInfo>,
        group_keys: Vec<McGroupKey>,
    ) -> Result<BTreeMap<u32, McGroup>, MixError> {
        let mut slots: BTreeMap<u32, BTreeMap<usize, Psn>> = BTreeMap::new();
        for info in nodes.values().filter(|n| n.role.is_mc()) {
            let (Some(group), Some(order)) = (info.group, info.order) else {
                return Err(MixError::Config(format!(
                    "committee member {} lacks a group or order",
                    info.psn
                )));
            };

            if (order == LEADER_ORDER) != (info.role == Role::McLeader) {
                return Err(MixError::Config(format!(
                    "{} has order {order} but role {:?}",
                    info.psn, info.role
                )));
            }

            if slots.entry(group).or_default().insert(order, info.psn.clone()).is_some() {
                return Err(MixError::Config(format!("duplicate order {order} in group {group}")));
            }
        }

        let mut keys: BTreeMap<u32, PublicKey> =
            group_keys.into_iter().map(|k| (k.group, k.public_key.into())).collect();

        let mut groups = BTreeMap::new();
        for (number, members) in slots {
            // Orders must be exactly 0..n
            if members.keys().copied().ne(0..members.len()) {
                return Err(MixError::Config(format!("group {number} has gaps in its orders")));
            }

            let public_key = keys
                .remove(&number)
                .ok_or_else(|| MixError::Config(format!("group {number} has no group key")))?;
            let members = members.into_values().collect();
            groups.insert(number, McGroup { number, members, public_key });
        }

        if let Some(number) = keys.keys().next() {
            return Err(MixError::Config(format!("group key for unknown group {number}")));
        }

        Ok(groups)
    }

    /// Every client's mailboxes must be mailbox servers
    fn check_mailboxes(nodes: &BTreeMap<Psn, NodeInfo>) -> Result<(), MixError> {
        for info in nodes.values().filter(|n| n.role == Role::Client) {
            for mailbox in info.mailboxes.iter() {
                match nodes.get(mailbox) {
                    Some(mb) if mb.role == Role::MbServer => {},
                    _ => {
                        return Err(MixError::Config(format!(
                            "client {} lists {mailbox}, which is not a mailbox server",
                            info.psn
                        )))
                    },
                }
            }
        }

        Ok(())
    }

    /// Look up a node by persona
    pub fn get(&self, psn: &Psn) -> Option<&NodeInfo> {
        self.entries.get(psn)
    }

    /// Look up a node by the hash of its persona
    pub fn get_by_hash(&self, hash: &PsnHash) -> Option<&NodeInfo> {
        self.by_hash.get(hash).and_then(|psn| self.entries.get(psn))
    }

    /// Look up a committee by number
    pub fn group(&self, number: u32) -> Option<&McGroup> {
        self.groups.get(&number)
    }

    /// All committees in ascending number
    pub fn groups(&self) -> impl Iterator<Item = &McGroup> {
        self.groups.values()
    }

    /// All nodes in persona order
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.entries.values()
    }
}

#[cfg(test)]
mod test {
    use rand::thread_rng;

    use super::{McGroupKey, Phonebook, PhonebookEntry, Psn, Role};
    use crate::crypto::{KeyBytes, Keypair};

    /// Build an entry with a random key
    fn entry(name: &str, role: Role, group: Option<u32>, order: Option<usize>) -> PhonebookEntry {
        let mut rng = thread_rng();
        PhonebookEntry {
            psn: Psn::from(name),
            role,
            public_key: KeyBytes::from(*Keypair::random(&mut rng).public()),
            group,
            order,
            mailboxes: vec![],
        }
    }

    /// A group key for the given group
    fn group_key(group: u32) -> McGroupKey {
        let mut rng = thread_rng();
        McGroupKey { group, public_key: KeyBytes::from(*Keypair::random(&mut rng).public()) }
    }

    /// Tests that committees are assembled by order and lookups work
    #[test]
    fn test_groups_and_lookup() {
        let mut client = entry("client-0", Role::Client, None, None);
        client.mailboxes = vec![Psn::from("mb-0")];
        let entries = vec![
            entry("mc-b", Role::McFollower, Some(1), Some(2)),
            entry("mc-a", Role::McLeader, Some(1), Some(0)),
            entry("mc-c", Role::McFollower, Some(1), Some(1)),
            entry("mb-0", Role::MbServer, None, None),
            client,
        ];

        let book = Phonebook::new(entries, vec![group_key(1)]).unwrap();
        let group = book.group(1).unwrap();
        assert_eq!(group.leader(), &Psn::from("mc-a"));
        assert_eq!(group.members[2], Psn::from("mc-b"));

        let mb = book.get_by_hash(&Psn::from("mb-0").hash()).unwrap();
        assert_eq!(mb.role, Role::MbServer);
        assert!(book.get(&Psn::from("client-0")).unwrap().has_mailbox(&Psn::from("mb-0")));
        assert!(book.get_by_hash(&Psn::from("nobody").hash()).is_none());
    }

    /// Tests the configuration failures
    #[test]
    fn test_invalid_phonebooks() {
        // Follower in the leader slot
        let entries = vec![entry("mc-a", Role::McFollower, Some(1), Some(0))];
        assert!(Phonebook::new(entries, vec![group_key(1)]).is_err());

        // Gap in the orders
        let entries = vec![
            entry("mc-a", Role::McLeader, Some(1), Some(0)),
            entry("mc-b", Role::McFollower, Some(1), Some(2)),
        ];
        assert!(Phonebook::new(entries, vec![group_key(1)]).is_err());

        // Missing group key
        let entries = vec![entry("mc-a", Role::McLeader, Some(1), Some(0))];
        assert!(Phonebook::new(entries, vec![]).is_err());

        // Client pointing at a non-mailbox
        let mut client = entry("client-0", Role::Client, None, None);
        client.mailboxes = vec![Psn::from("idle")];
        let entries = vec![client, entry("idle", Role::IdleServer, None, None)];
        assert!(Phonebook::new(entries, vec![]).is_err());

        // Duplicate persona
        let entries = vec![
            entry("mb-0", Role::MbServer, None, None),
            entry("mb-0", Role::MbServer, None, None),
        ];
        assert!(Phonebook::new(entries, vec![]).is_err());
    }
}
