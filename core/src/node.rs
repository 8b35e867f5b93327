//! The protocol logic of a single node, independent of any transport
//!
//! A `MixNode` consumes packets and emits packets and delivered messages
//! through a `MixCtx`; what it does with a packet depends only on its role in
//! the phonebook and the packet's authenticated sender

use std::collections::BTreeMap;

use itertools::Itertools;
use rand::{seq::SliceRandom, CryptoRng, RngCore};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::log;

use crate::{
    algebra::Scalar,
    config::NodeConfig,
    crypto::{anon_decrypt, anon_encrypt},
    error::MixError,
    guid::Guid,
    packets::{
        ClientMbPacket, MbClientPacket, MbMcUpPacket, McLeaderInitPacket, McMbDownPacket,
        McVPacket, MixPacket,
    },
    payload::{
        chunk_capacity, split_message, ChunkJoiner, MailboxCommand, MailboxInstruction,
        MessageChunk, RootPayload,
    },
    phonebook::{McGroup, NodeInfo, Psn, Role},
    session::ServerSession,
    sharing::share_powers,
};

// -----------
// | Context |
// -----------

/// The side effects available to protocol logic
pub trait MixCtx {
    /// Queue a packet for another node
    fn send(&mut self, to: &Psn, packet: MixPacket);
    /// Hand a reassembled message to the local application
    fn deliver(&mut self, message: Vec<u8>);
}

/// A context that collects side effects for the caller to flush
#[derive(Debug, Default)]
pub struct Outbox {
    /// Outbound packets with their recipients, in emission order
    pub packets: Vec<(Psn, MixPacket)>,
    /// Delivered messages, in completion order
    pub delivered: Vec<Vec<u8>>,
}

impl MixCtx for Outbox {
    fn send(&mut self, to: &Psn, packet: MixPacket) {
        self.packets.push((to.clone(), packet));
    }

    fn deliver(&mut self, message: Vec<u8>) {
        self.delivered.push(message);
    }
}

// --------
// | Node |
// --------

/// The state of one node of the overlay
#[derive(Debug)]
pub struct MixNode {
    /// The node's validated configuration
    config: NodeConfig,
    /// Live sessions by round id
    sessions: FxHashMap<Guid, ServerSession>,
    /// Contributions not yet claimed by a session, ordered by id
    loose_ups: BTreeMap<Guid, MbMcUpPacket>,
    /// Contributions a session is waiting on, mapped to that session
    wanted_ups: FxHashMap<Guid, Guid>,
    /// Contributions already claimed by some session
    claimed_cids: FxHashSet<Guid>,
    /// Rounds that finished or were abandoned
    retired: FxHashSet<Guid>,
    /// Contributions a mailbox has already shared
    seen_cids: FxHashSet<Guid>,
    /// Outputs a mailbox has already forwarded
    seen_oids: FxHashSet<Guid>,
    /// A client's partially received messages
    joiner: ChunkJoiner,
}

impl MixNode {
    /// Create a node with empty state
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            sessions: FxHashMap::default(),
            loose_ups: BTreeMap::new(),
            wanted_ups: FxHashMap::default(),
            claimed_cids: FxHashSet::default(),
            retired: FxHashSet::default(),
            seen_cids: FxHashSet::default(),
            seen_oids: FxHashSet::default(),
            joiner: ChunkJoiner::new(),
        }
    }

    /// The node's configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The number of live sessions
    pub fn n_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// The number of unclaimed contributions
    pub fn n_loose_ups(&self) -> usize {
        self.loose_ups.len()
    }

    /// The number of contributions sessions are waiting on
    pub fn n_wanted_ups(&self) -> usize {
        self.wanted_ups.len()
    }

    /// Whether the given round has finished or been abandoned here
    pub fn is_retired(&self, mpcid: &Guid) -> bool {
        self.retired.contains(mpcid)
    }

    /// Decode and handle a packet received from `from`
    pub fn handle_packet<C: MixCtx, R: RngCore + CryptoRng>(
        &mut self,
        from: &Psn,
        bytes: &[u8],
        ctx: &mut C,
        rng: &mut R,
    ) -> Result<(), MixError> {
        let packet = MixPacket::decode(self.config.field(), bytes)?;
        self.handle(from, packet, ctx, rng)
    }

    /// Handle a decoded packet received from `from`
    pub fn handle<C: MixCtx, R: RngCore + CryptoRng>(
        &mut self,
        from: &Psn,
        packet: MixPacket,
        ctx: &mut C,
        rng: &mut R,
    ) -> Result<(), MixError> {
        let sender = self
            .config
            .phonebook()
            .get(from)
            .cloned()
            .ok_or_else(|| MixError::UnexpectedPacket(format!("unknown sender {from}")))?;

        match self.config.role() {
            Role::McLeader | Role::McFollower => self.handle_mc(&sender, packet, ctx, rng),
            Role::MbServer => self.handle_mb(&sender, packet, ctx, rng),
            Role::Client => self.handle_client(&sender, packet, ctx),
            Role::IdleServer | Role::RsServer => Err(unexpected(&sender, &packet)),
        }
    }

    // ----------------------
    // | Committee Handlers |
    // ----------------------

    /// Dispatch a packet received by a committee member
    fn handle_mc<C: MixCtx, R: RngCore + CryptoRng>(
        &mut self,
        sender: &NodeInfo,
        packet: MixPacket,
        ctx: &mut C,
        rng: &mut R,
    ) -> Result<(), MixError> {
        match packet {
            MixPacket::MbMcUp(up) if sender.role == Role::MbServer => {
                self.handle_up(up, ctx, rng)
            },
            MixPacket::McLeaderInit(init) => self.handle_init(sender, init, ctx, rng),
            MixPacket::McV(v) => self.handle_v(sender, v, ctx, rng),
            packet => Err(unexpected(sender, &packet)),
        }
    }

    /// A mailbox's shares of one contribution
    fn handle_up<C: MixCtx, R: RngCore + CryptoRng>(
        &mut self,
        up: MbMcUpPacket,
        ctx: &mut C,
        rng: &mut R,
    ) -> Result<(), MixError> {
        let mixsize = self.config.params().mixsize;
        if up.z.len() != mixsize {
            return Err(MixError::Corruption(format!(
                "up packet for {} carries {} shares, expected {mixsize}",
                up.cid,
                up.z.len()
            )));
        }

        if let Some(mpcid) = self.wanted_ups.remove(&up.cid) {
            let Some(session) = self.sessions.get_mut(&mpcid) else {
                return Ok(());
            };

            session.set_up(up)?;
            return self.tick_session(mpcid, ctx, rng);
        }

        if self.claimed_cids.contains(&up.cid) || self.loose_ups.contains_key(&up.cid) {
            log::debug!("dropping duplicate contribution {}", up.cid);
            return Ok(());
        }

        self.loose_ups.insert(up.cid, up);
        if self.config.role() == Role::McLeader {
            self.start_sessions(ctx, rng)?;
        }

        Ok(())
    }

    /// Batch loose contributions into new rounds, lowest ids first
    fn start_sessions<C: MixCtx, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut C,
        rng: &mut R,
    ) -> Result<(), MixError> {
        let mixsize = self.config.params().mixsize;
        while self.loose_ups.len() >= mixsize {
            let ups = (0..mixsize).filter_map(|_| self.loose_ups.pop_first()).collect_vec();
            let mpcid = Guid::random(rng);
            let init = McLeaderInitPacket {
                mpcid,
                cids: ups.iter().map(|(cid, _)| *cid).collect(),
            };

            let group = self.config.my_group()?;
            for follower in group.members.iter().skip(1) {
                ctx.send(follower, MixPacket::McLeaderInit(init.clone()));
            }

            log::info!("leader starting session {mpcid} over {mixsize} contributions");
            let mut session = ServerSession::new(mpcid, mixsize, group.size());
            session.set_init(init)?;
            for (cid, up) in ups {
                self.claimed_cids.insert(cid);
                session.set_up(up)?;
            }

            self.sessions.insert(mpcid, session);
            self.tick_session(mpcid, ctx, rng)?;
        }

        Ok(())
    }

    /// The leader's announcement of a round
    fn handle_init<C: MixCtx, R: RngCore + CryptoRng>(
        &mut self,
        sender: &NodeInfo,
        init: McLeaderInitPacket,
        ctx: &mut C,
        rng: &mut R,
    ) -> Result<(), MixError> {
        let group = self.config.my_group()?;
        if self.config.role() == Role::McLeader || &sender.psn != group.leader() {
            return Err(MixError::UnexpectedPacket(format!(
                "init for {} from {}, who does not lead this group",
                init.mpcid, sender.psn
            )));
        }

        let mpcid = init.mpcid;
        if self.retired.contains(&mpcid) {
            log::debug!("dropping init for retired session {mpcid}");
            return Ok(());
        }

        let cids = init.cids.clone();
        let session = self.get_or_deduce_session(mpcid)?;
        let repeated = session.init().is_some();
        if let Err(e) = session.set_init(init) {
            self.retire(mpcid);
            return Err(e);
        }

        // A repeated init has already claimed its contributions
        if repeated {
            return Ok(());
        }

        if let Some(cid) = cids.iter().find(|cid| self.claimed_cids.contains(cid)) {
            let err = MixError::Corruption(format!(
                "init for {mpcid} names {cid}, already claimed by another session"
            ));
            self.retire(mpcid);
            return Err(err);
        }

        for cid in cids {
            if let Some(up) = self.loose_ups.remove(&cid) {
                if let Some(session) = self.sessions.get_mut(&mpcid) {
                    session.set_up(up)?;
                }
            } else {
                self.wanted_ups.insert(cid, mpcid);
            }
            self.claimed_cids.insert(cid);
        }

        self.tick_session(mpcid, ctx, rng)
    }

    /// Another member's summed shares
    fn handle_v<C: MixCtx, R: RngCore + CryptoRng>(
        &mut self,
        sender: &NodeInfo,
        v: McVPacket,
        ctx: &mut C,
        rng: &mut R,
    ) -> Result<(), MixError> {
        let group = self.config.my_group()?;
        let order = match (sender.group, sender.order) {
            (Some(g), Some(order)) if sender.role.is_mc() && g == group.number => order,
            _ => {
                return Err(MixError::UnexpectedPacket(format!(
                    "v packet from {}, who is not in group {}",
                    sender.psn, group.number
                )))
            },
        };

        // Relaying followers never reconstruct
        if self.config.params().leader_relay_only && self.config.role() != Role::McLeader {
            return Err(MixError::UnexpectedPacket(format!(
                "v packet from {} at a relaying follower",
                sender.psn
            )));
        }

        let mpcid = v.mpcid;
        if self.retired.contains(&mpcid) {
            log::debug!("dropping v packet for retired session {mpcid}");
            return Ok(());
        }

        self.get_or_deduce_session(mpcid)?.set_v(order, v)?;
        self.tick_session(mpcid, ctx, rng)
    }

    /// The session for `mpcid`, created empty if this is the first packet
    /// naming it
    fn get_or_deduce_session(&mut self, mpcid: Guid) -> Result<&mut ServerSession, MixError> {
        let mixsize = self.config.params().mixsize;
        let group_size = self.config.my_group()?.size();
        Ok(self
            .sessions
            .entry(mpcid)
            .or_insert_with(|| ServerSession::new(mpcid, mixsize, group_size)))
    }

    /// Tick a session, dropping it once it finishes or fails
    fn tick_session<C: MixCtx, R: RngCore + CryptoRng>(
        &mut self,
        mpcid: Guid,
        ctx: &mut C,
        rng: &mut R,
    ) -> Result<(), MixError> {
        let Some(session) = self.sessions.get_mut(&mpcid) else {
            return Ok(());
        };

        match session.tick(&self.config, ctx, rng) {
            Ok(false) => Ok(()),
            Ok(true) => {
                log::debug!("session {mpcid} finished");
                self.retire(mpcid);
                Ok(())
            },
            Err(e) => {
                log::error!("abandoning session {mpcid}: {e}");
                self.retire(mpcid);
                Err(e)
            },
        }
    }

    /// Forget a session and remember that it is gone
    fn retire(&mut self, mpcid: Guid) {
        self.sessions.remove(&mpcid);
        self.wanted_ups.retain(|_, waiting| *waiting != mpcid);
        self.retired.insert(mpcid);
    }

    // --------------------
    // | Mailbox Handlers |
    // --------------------

    /// Dispatch a packet received by a mailbox server
    fn handle_mb<C: MixCtx, R: RngCore + CryptoRng>(
        &mut self,
        sender: &NodeInfo,
        packet: MixPacket,
        ctx: &mut C,
        rng: &mut R,
    ) -> Result<(), MixError> {
        match packet {
            MixPacket::ClientMb(contribution) if sender.role == Role::Client => {
                self.handle_contribution(sender, contribution, ctx, rng)
            },
            MixPacket::McMbDown(down) if sender.role.is_mc() => self.handle_down(down, ctx),
            packet => Err(unexpected(sender, &packet)),
        }
    }

    /// Share a client's contribution across its chosen committee
    fn handle_contribution<C: MixCtx, R: RngCore + CryptoRng>(
        &mut self,
        sender: &NodeInfo,
        contribution: ClientMbPacket,
        ctx: &mut C,
        rng: &mut R,
    ) -> Result<(), MixError> {
        if !sender.has_mailbox(self.config.psn()) {
            return Err(MixError::UnexpectedPacket(format!(
                "{} is not served by this mailbox",
                sender.psn
            )));
        }

        if !self.seen_cids.insert(contribution.cid) {
            log::debug!("dropping duplicate contribution {}", contribution.cid);
            return Ok(());
        }

        let params = self.config.params();
        let mc_group = contribution.mc_group;
        let group = self.config.phonebook().group(mc_group).ok_or_else(|| {
            MixError::Corruption(format!("contribution names unknown group {mc_group}"))
        })?;

        // Member j receives its shares of x^1..=x^mixsize
        let per_member = share_powers(
            &contribution.x,
            params.mixsize,
            group.size(),
            params.threshold,
            rng,
        )?;
        for (member, z) in group.members.iter().zip(per_member) {
            ctx.send(member, MixPacket::MbMcUp(MbMcUpPacket { cid: contribution.cid, z }));
        }

        Ok(())
    }

    /// Forward a recovered message to the client it is addressed to
    fn handle_down<C: MixCtx>(
        &mut self,
        down: McMbDownPacket,
        ctx: &mut C,
    ) -> Result<(), MixError> {
        if !self.seen_oids.insert(down.oid) {
            log::debug!("dropping duplicate output {}", down.oid);
            return Ok(());
        }

        let instruction = anon_decrypt(self.config.keypair(), &down.b)
            .and_then(|plaintext| MailboxInstruction::from_bytes(&plaintext))
            .map_err(|e| MixError::Corruption(format!("unreadable instruction: {e}")))?;

        match instruction.command {
            MailboxCommand::MailDelivery => {
                let client = self
                    .config
                    .phonebook()
                    .get(&instruction.psn)
                    .filter(|c| c.role == Role::Client && c.has_mailbox(self.config.psn()))
                    .ok_or_else(|| {
                        MixError::Corruption(format!(
                            "delivery to {}, who is not served by this mailbox",
                            instruction.psn
                        ))
                    })?;

                let packet = MbClientPacket { oid: down.oid, a: down.a };
                ctx.send(&client.psn, MixPacket::MbClient(packet));
            },
        }

        Ok(())
    }

    // -------------------
    // | Client Handlers |
    // -------------------

    /// Dispatch a packet received by a client
    fn handle_client<C: MixCtx>(
        &mut self,
        sender: &NodeInfo,
        packet: MixPacket,
        ctx: &mut C,
    ) -> Result<(), MixError> {
        match packet {
            MixPacket::MbClient(mail) if self.config.info().has_mailbox(&sender.psn) => {
                let plaintext = anon_decrypt(self.config.keypair(), &mail.a)?;
                let chunk = MessageChunk::from_bytes(&plaintext)?;
                if let Some(message) = self.joiner.push(chunk)? {
                    log::info!("delivering a {} byte message", message.len());
                    ctx.deliver(message);
                }

                Ok(())
            },
            packet => Err(unexpected(sender, &packet)),
        }
    }

    /// Send a message to another client through the overlay
    ///
    /// Returns the contribution ids of the message's chunks
    pub fn submit_message<C: MixCtx, R: RngCore + CryptoRng>(
        &mut self,
        recipient: &Psn,
        message: &[u8],
        ctx: &mut C,
        rng: &mut R,
    ) -> Result<Vec<Guid>, MixError> {
        if self.config.role() != Role::Client {
            return Err(MixError::Config(format!("{} is not a client", self.config.psn())));
        }

        let phonebook = self.config.phonebook().clone();
        let recipient = phonebook
            .get(recipient)
            .filter(|r| r.role == Role::Client)
            .ok_or_else(|| MixError::Config(format!("{recipient} is not a known client")))?;

        let own_mailbox = choose(&self.config.info().mailboxes, rng)?.clone();
        let recipient_mailbox = choose(&recipient.mailboxes, rng)?;
        let recipient_mailbox = phonebook
            .get(recipient_mailbox)
            .ok_or_else(|| MixError::Config(format!("unknown mailbox {recipient_mailbox}")))?;
        let groups = phonebook.groups().collect_vec();
        let group = *choose(&groups, rng)?;

        let capacity =
            chunk_capacity(self.config.params().prime_space(), recipient.psn.as_str().len())?;
        let chunks = split_message(message, capacity, rng)?;

        let mut cids = Vec::with_capacity(chunks.len());
        for chunk in chunks.iter() {
            let x =
                encode_contribution(&self.config, recipient, recipient_mailbox, group, chunk, rng)?;
            let cid = Guid::random(rng);
            ctx.send(
                &own_mailbox,
                MixPacket::ClientMb(ClientMbPacket { cid, x, mc_group: group.number }),
            );
            cids.push(cid);
        }

        log::info!(
            "submitted {} chunks for {} via {own_mailbox} and group {}",
            cids.len(),
            recipient.psn,
            group.number
        );
        Ok(cids)
    }
}

// -----------
// | Helpers |
// -----------

/// Encrypt a chunk into a contribution routed to `recipient` through
/// `mailbox` by `group`
pub fn encode_contribution<R: RngCore + CryptoRng>(
    config: &NodeConfig,
    recipient: &NodeInfo,
    mailbox: &NodeInfo,
    group: &McGroup,
    chunk: &MessageChunk,
    rng: &mut R,
) -> Result<Scalar, MixError> {
    let instruction =
        MailboxInstruction { command: MailboxCommand::MailDelivery, psn: recipient.psn.clone() };

    let payload = RootPayload {
        a: anon_encrypt(&recipient.public_key, &chunk.to_bytes(), rng)?,
        b: anon_encrypt(&mailbox.public_key, &instruction.to_bytes(), rng)?,
        c: anon_encrypt(&group.public_key, &mailbox.psn.hash().0, rng)?,
    };
    payload.to_scalar(config.field(), config.params().prime_space())
}

/// Pick a random element, failing on an empty slice
fn choose<'a, T, R: RngCore>(items: &'a [T], rng: &mut R) -> Result<&'a T, MixError> {
    items.choose(rng).ok_or_else(|| MixError::Config("nothing to choose from".to_string()))
}

/// The error for a packet the local role does not accept from its sender
fn unexpected(sender: &NodeInfo, packet: &MixPacket) -> MixError {
    MixError::UnexpectedPacket(format!(
        "{} packet from {} ({:?})",
        packet.kind(),
        sender.psn,
        sender.role
    ))
}
