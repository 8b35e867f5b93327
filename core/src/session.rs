//! The per-round state machine run by every committee member
//!
//! A session advances through four states:
//!   - `T0WaitInit`: waiting for the leader to name the round's contributions
//!   - `T1WaitMbMcUp`: waiting for this member's shares of each contribution
//!   - `T2WaitVPacket`: waiting for enough summed shares to reconstruct
//!   - `T3End`: finished, the caller drops the session
//!
//! Missing packets never produce an error; `tick` simply reports that the
//! session cannot advance yet

use itertools::Itertools;
use rand::{CryptoRng, RngCore};
use tracing::log;

use crate::{
    algebra::{graeffe::find_roots, newton::newton_to_polynomial, Scalar},
    config::NodeConfig,
    crypto::anon_decrypt,
    error::MixError,
    guid::Guid,
    node::MixCtx,
    packets::{MbMcUpPacket, McLeaderInitPacket, McMbDownPacket, McVPacket, MixPacket},
    payload::RootPayload,
    phonebook::{Psn, PsnHash, Role, PSN_HASH_BYTES},
    sharing::reconstruct_indexed,
    LEADER_ORDER,
};

/// The states of a mixing session
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the leader's init packet
    T0WaitInit,
    /// Waiting for the shares of every contribution
    T1WaitMbMcUp,
    /// Waiting for `threshold + 1` summed share vectors
    T2WaitVPacket,
    /// Done
    T3End,
}

/// One mixing round as seen by one committee member
#[derive(Clone, Debug)]
pub struct ServerSession {
    /// The round id
    mpcid: Guid,
    /// The current state
    state: SessionState,
    /// The leader's init packet
    init: Option<McLeaderInitPacket>,
    /// This member's shares of each contribution, by position in the init
    ups: Vec<Option<MbMcUpPacket>>,
    /// The summed shares of each member, by committee order
    v_packets: Vec<Option<McVPacket>>,
    /// The recovered roots in ascending order
    roots: Vec<Scalar>,
}

impl ServerSession {
    /// Create an empty session for a round of `mixsize` contributions mixed
    /// by a committee of `group_size` members
    pub fn new(mpcid: Guid, mixsize: usize, group_size: usize) -> Self {
        Self {
            mpcid,
            state: SessionState::T0WaitInit,
            init: None,
            ups: vec![None; mixsize],
            v_packets: vec![None; group_size],
            roots: Vec::new(),
        }
    }

    /// The round id
    pub fn mpcid(&self) -> Guid {
        self.mpcid
    }

    /// The current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The init packet, once received
    pub fn init(&self) -> Option<&McLeaderInitPacket> {
        self.init.as_ref()
    }

    /// The roots recovered in `T2`, in ascending order
    pub fn roots(&self) -> &[Scalar] {
        &self.roots
    }

    // -----------
    // | Setters |
    // -----------

    /// Record the leader's init packet
    pub fn set_init(&mut self, init: McLeaderInitPacket) -> Result<(), MixError> {
        if init.mpcid != self.mpcid {
            return Err(MixError::Corruption(format!(
                "init for {} delivered to session {}",
                init.mpcid, self.mpcid
            )));
        }

        if init.cids.len() != self.ups.len() {
            return Err(MixError::Corruption(format!(
                "init names {} contributions, expected {}",
                init.cids.len(),
                self.ups.len()
            )));
        }

        if !init.cids.iter().tuple_windows().all(|(a, b)| a < b) {
            return Err(MixError::Corruption("init contributions are not sorted".to_string()));
        }

        match &self.init {
            Some(existing) if existing != &init => {
                Err(MixError::Corruption(format!("conflicting init for {}", self.mpcid)))
            },
            _ => {
                self.init = Some(init);
                Ok(())
            },
        }
    }

    /// Record this member's shares of a contribution named in the init
    pub fn set_up(&mut self, up: MbMcUpPacket) -> Result<(), MixError> {
        if up.z.len() != self.ups.len() {
            return Err(MixError::Corruption(format!(
                "up packet for {} carries {} shares, expected {}",
                up.cid,
                up.z.len(),
                self.ups.len()
            )));
        }

        let position = self
            .init
            .as_ref()
            .and_then(|init| init.cids.iter().position(|cid| cid == &up.cid))
            .ok_or_else(|| {
                MixError::Corruption(format!("{} is not part of session {}", up.cid, self.mpcid))
            })?;

        self.ups[position] = Some(up);
        Ok(())
    }

    /// Record the summed shares of the member at `order`
    pub fn set_v(&mut self, order: usize, v: McVPacket) -> Result<(), MixError> {
        if v.v.len() != self.ups.len() {
            return Err(MixError::Corruption(format!(
                "v packet carries {} sums, expected {}",
                v.v.len(),
                self.ups.len()
            )));
        }

        let slot = self
            .v_packets
            .get_mut(order)
            .ok_or_else(|| MixError::Corruption(format!("no committee member of order {order}")))?;
        *slot = Some(v);
        Ok(())
    }

    // -----------------
    // | State Machine |
    // -----------------

    /// Advance the session as far as the received packets allow
    ///
    /// Returns `true` once the session has finished and may be dropped
    pub fn tick<C: MixCtx, R: RngCore + CryptoRng>(
        &mut self,
        config: &NodeConfig,
        ctx: &mut C,
        rng: &mut R,
    ) -> Result<bool, MixError> {
        loop {
            let next = match self.state {
                SessionState::T0WaitInit => self.init.as_ref().map(|_| SessionState::T1WaitMbMcUp),
                SessionState::T1WaitMbMcUp => self.tick_t1(config, ctx)?,
                SessionState::T2WaitVPacket => self.tick_t2(config, ctx, rng)?,
                SessionState::T3End => return Ok(true),
            };

            match next {
                Some(state) => {
                    log::debug!("session {}: {:?} -> {:?}", self.mpcid, self.state, state);
                    self.state = state;
                },
                None => return Ok(false),
            }
        }
    }

    /// Sum this member's shares and distribute the result
    fn tick_t1<C: MixCtx>(
        &mut self,
        config: &NodeConfig,
        ctx: &mut C,
    ) -> Result<Option<SessionState>, MixError> {
        let Some(ups) = self.ups.iter().map(|up| up.as_ref()).collect::<Option<Vec<_>>>() else {
            return Ok(None);
        };

        // v[k] = Σ_i z_i[k], a share of the (k + 1)-th power sum
        let field = config.field();
        let mut sums = vec![field.zero(); self.ups.len()];
        for up in ups {
            for (sum, z) in sums.iter_mut().zip(up.z.iter()) {
                *sum += z;
            }
        }

        let order = config.my_order()?;
        let group = config.my_group()?;
        let v = McVPacket { mpcid: self.mpcid, v: sums };
        self.set_v(order, v.clone())?;

        if config.params().leader_relay_only {
            if order == LEADER_ORDER {
                return Ok(Some(SessionState::T2WaitVPacket));
            }

            ctx.send(group.leader(), MixPacket::McV(v));
            return Ok(Some(SessionState::T3End));
        }

        for (member_order, member) in group.members.iter().enumerate() {
            if member_order != order {
                ctx.send(member, MixPacket::McV(v.clone()));
            }
        }
        Ok(Some(SessionState::T2WaitVPacket))
    }

    /// Reconstruct the power sums, recover the contributions and route them
    fn tick_t2<C: MixCtx, R: RngCore + CryptoRng>(
        &mut self,
        config: &NodeConfig,
        ctx: &mut C,
        rng: &mut R,
    ) -> Result<Option<SessionState>, MixError> {
        let params = config.params();
        let needed = params.threshold + 1;
        let chosen = self
            .v_packets
            .iter()
            .enumerate()
            .filter_map(|(order, v)| v.as_ref().map(|v| (order, v)))
            .take(needed)
            .collect_vec();
        if chosen.len() < needed {
            return Ok(None);
        }

        let mixsize = params.mixsize;
        let newton_sums = (0..mixsize)
            .map(|k| {
                let shares = chosen.iter().map(|(order, v)| (*order, v.v[k].clone())).collect_vec();
                reconstruct_indexed(&shares)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let poly = newton_to_polynomial(config.field(), &newton_sums, mixsize)?;
        let mut roots =
            find_roots(&poly, config.zeta(), params.two_exponent, params.odd_factor, rng)?;
        if roots.len() != mixsize {
            return Err(MixError::Corruption(format!(
                "recovered {} roots from a round of {mixsize}",
                roots.len()
            )));
        }
        roots.sort();

        // Build every outbound packet before sending any
        let downs = roots
            .iter()
            .enumerate()
            .map(|(i, root)| self.route_root(config, i, root))
            .collect::<Result<Vec<_>, _>>()?;
        for (mailbox, down) in downs {
            ctx.send(&mailbox, MixPacket::McMbDown(down));
        }

        log::info!("session {} recovered {mixsize} contributions", self.mpcid);
        self.roots = roots;
        Ok(Some(SessionState::T3End))
    }

    /// Decode the `i`-th root and address it to its destination mailbox
    fn route_root(
        &self,
        config: &NodeConfig,
        i: usize,
        root: &Scalar,
    ) -> Result<(Psn, McMbDownPacket), MixError> {
        let group_keypair = config
            .group_keypair()
            .ok_or_else(|| MixError::Config("committee member without a group key".to_string()))?;

        let payload = RootPayload::from_scalar(root, config.params().prime_space())
            .map_err(|e| MixError::Corruption(format!("root {i} is not a payload: {e}")))?;
        let hash_bytes = anon_decrypt(group_keypair, &payload.c)
            .map_err(|e| MixError::Corruption(format!("root {i} has an unreadable route: {e}")))?;

        let hash: [u8; PSN_HASH_BYTES] = hash_bytes.as_slice().try_into().map_err(|_| {
            MixError::Corruption(format!("root {i} routes to a {} byte hash", hash_bytes.len()))
        })?;
        let mailbox = config
            .phonebook()
            .get_by_hash(&PsnHash(hash))
            .filter(|node| node.role == Role::MbServer)
            .ok_or_else(|| {
                MixError::Corruption(format!("root {i} routes to {}, not a mailbox", PsnHash(hash)))
            })?;

        let oid = self.mpcid + (i as u64 + 1);
        Ok((mailbox.psn.clone(), McMbDownPacket { oid, a: payload.a, b: payload.b }))
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;
    use rand::thread_rng;

    use super::{ServerSession, SessionState};
    use crate::{
        config::NodeConfig,
        guid::Guid,
        node::Outbox,
        packets::{MbMcUpPacket, McLeaderInitPacket, McVPacket, MixPacket},
        phonebook::Psn,
        test_helpers::{large_params, mock_contribution, mock_deployment, MockDeployment},
    };

    /// The committee size used in these tests
    const GROUP_SIZE: usize = 4;
    /// The threshold used in these tests
    const THRESHOLD: usize = 2;
    /// The mixsize used in these tests
    const MIXSIZE: usize = 3;

    /// A deployment with a single committee
    fn deployment(relay_only: bool) -> MockDeployment {
        let mut params = large_params(MIXSIZE);
        params.threshold = THRESHOLD;
        params.leader_relay_only = relay_only;
        mock_deployment(params, 1, GROUP_SIZE, 2, 2)
    }

    /// The configs of the committee members in order
    fn members(deployment: &MockDeployment) -> Vec<NodeConfig> {
        (0..GROUP_SIZE).map(|j| deployment.node_config(&format!("mc-0-{j}"))).collect()
    }

    /// Build `MIXSIZE` contributions, returning the init and the up packets
    /// indexed by member then contribution
    fn round(deployment: &MockDeployment) -> (McLeaderInitPacket, Vec<Vec<MbMcUpPacket>>) {
        let mut rng = thread_rng();
        let mut ups = vec![Vec::new(); GROUP_SIZE];
        let mut cids = Vec::new();
        for i in 0..MIXSIZE {
            let (cid, per_member) = mock_contribution(deployment, i % 2, &mut rng);
            cids.push(cid);
            for (j, up) in per_member.into_iter().enumerate() {
                ups[j].push(up);
            }
        }

        cids.sort();
        (McLeaderInitPacket { mpcid: Guid::random(&mut rng), cids }, ups)
    }

    /// Feed a member's init and ups into a fresh session
    fn primed_session(init: &McLeaderInitPacket, ups: &[MbMcUpPacket]) -> ServerSession {
        let mut session = ServerSession::new(init.mpcid, MIXSIZE, GROUP_SIZE);
        session.set_init(init.clone()).unwrap();
        for up in ups.iter() {
            session.set_up(up.clone()).unwrap();
        }
        session
    }

    /// Tests the T0 and T1 boundaries: nothing moves until the last up
    #[test]
    fn test_t1_boundary() {
        let mut rng = thread_rng();
        let deployment = deployment(true);
        let configs = members(&deployment);
        let (init, ups) = round(&deployment);

        let follower = &configs[1];
        let mut session = ServerSession::new(init.mpcid, MIXSIZE, GROUP_SIZE);
        let mut outbox = Outbox::default();
        assert!(!session.tick(follower, &mut outbox, &mut rng).unwrap());
        assert_eq!(session.state(), SessionState::T0WaitInit);

        session.set_init(init.clone()).unwrap();
        for up in ups[1][..MIXSIZE - 1].iter() {
            session.set_up(up.clone()).unwrap();
            assert!(!session.tick(follower, &mut outbox, &mut rng).unwrap());
            assert_eq!(session.state(), SessionState::T1WaitMbMcUp);
        }
        assert!(outbox.packets.is_empty());

        // The last contribution moves a relaying follower straight to the end
        session.set_up(ups[1][MIXSIZE - 1].clone()).unwrap();
        assert!(session.tick(follower, &mut outbox, &mut rng).unwrap());
        assert_eq!(session.state(), SessionState::T3End);
        assert_eq!(outbox.packets.len(), 1);
        assert_eq!(outbox.packets[0].0, Psn::from("mc-0-0"));
    }

    /// Tests that the leader leaves T1 on exactly the last contribution and
    /// then waits for the followers' sums
    #[test]
    fn test_leader_t1_boundary() {
        let mut rng = thread_rng();
        let deployment = deployment(true);
        let configs = members(&deployment);
        let (init, ups) = round(&deployment);

        let leader = &configs[0];
        let mut session = ServerSession::new(init.mpcid, MIXSIZE, GROUP_SIZE);
        let mut outbox = Outbox::default();
        session.set_init(init.clone()).unwrap();
        for up in ups[0][..MIXSIZE - 1].iter() {
            session.set_up(up.clone()).unwrap();
            assert!(!session.tick(leader, &mut outbox, &mut rng).unwrap());
            assert_eq!(session.state(), SessionState::T1WaitMbMcUp);
        }

        session.set_up(ups[0][MIXSIZE - 1].clone()).unwrap();
        assert!(!session.tick(leader, &mut outbox, &mut rng).unwrap());
        assert_eq!(session.state(), SessionState::T2WaitVPacket);

        // Only its own sums are present, short of the threshold
        assert!(!session.tick(leader, &mut outbox, &mut rng).unwrap());
        assert_eq!(session.state(), SessionState::T2WaitVPacket);
        assert!(outbox.packets.is_empty());
        assert!(session.roots().is_empty());
    }

    /// Tests a full round in relay mode: the leader alone reconstructs
    #[test]
    fn test_relay_round() {
        let mut rng = thread_rng();
        let deployment = deployment(true);
        let configs = members(&deployment);
        let (init, ups) = round(&deployment);

        let mut leader = primed_session(&init, &ups[0]);
        let mut outbox = Outbox::default();
        assert!(!leader.tick(&configs[0], &mut outbox, &mut rng).unwrap());
        assert_eq!(leader.state(), SessionState::T2WaitVPacket);

        // Followers relay their sums to the leader
        let mut relayed = Vec::new();
        for j in 1..GROUP_SIZE {
            let mut session = primed_session(&init, &ups[j]);
            let mut follower_box = Outbox::default();
            assert!(session.tick(&configs[j], &mut follower_box, &mut rng).unwrap());
            match follower_box.packets.pop() {
                Some((_, MixPacket::McV(v))) => relayed.push((j, v)),
                other => panic!("unexpected follower output {other:?}"),
            }
        }

        // Threshold + 1 = 3 slots: the leader's own plus two relays
        leader.set_v(relayed[0].0, relayed[0].1.clone()).unwrap();
        assert!(!leader.tick(&configs[0], &mut outbox, &mut rng).unwrap());
        leader.set_v(relayed[1].0, relayed[1].1.clone()).unwrap();
        assert!(leader.tick(&configs[0], &mut outbox, &mut rng).unwrap());

        assert_eq!(leader.roots().len(), MIXSIZE);
        assert!(leader.roots().iter().tuple_windows().all(|(a, b)| a < b));

        let oids = outbox
            .packets
            .iter()
            .map(|(to, packet)| match packet {
                MixPacket::McMbDown(down) => {
                    assert!(to.as_str().starts_with("mb-"));
                    down.oid
                },
                other => panic!("unexpected leader output {other:?}"),
            })
            .collect_vec();
        let expected = (1..=MIXSIZE as u64).map(|i| init.mpcid + i).collect_vec();
        assert_eq!(oids, expected);
    }

    /// Tests that different reconstruction subsets recover identical roots
    #[test]
    fn test_subset_determinism() {
        let mut rng = thread_rng();
        let deployment = deployment(false);
        let configs = members(&deployment);
        let (init, ups) = round(&deployment);

        // Every member broadcasts its sums to the others
        let mut sessions = (0..GROUP_SIZE).map(|j| primed_session(&init, &ups[j])).collect_vec();
        let mut broadcasts = Vec::new();
        for (j, session) in sessions.iter_mut().enumerate() {
            let mut outbox = Outbox::default();
            assert!(!session.tick(&configs[j], &mut outbox, &mut rng).unwrap());
            assert_eq!(outbox.packets.len(), GROUP_SIZE - 1);
            match &outbox.packets[0].1 {
                MixPacket::McV(v) => broadcasts.push(v.clone()),
                other => panic!("unexpected broadcast {other:?}"),
            }
        }

        // Member 1 completes with {0, 1, 2}; member 3 with {1, 2, 3} after
        // only hearing from members 1 and 2
        sessions[1].set_v(0, broadcasts[0].clone()).unwrap();
        sessions[1].set_v(2, broadcasts[2].clone()).unwrap();
        sessions[3].set_v(1, broadcasts[1].clone()).unwrap();
        sessions[3].set_v(2, broadcasts[2].clone()).unwrap();

        let mut outbox = Outbox::default();
        assert!(sessions[1].tick(&configs[1], &mut outbox, &mut rng).unwrap());
        assert!(sessions[3].tick(&configs[3], &mut outbox, &mut rng).unwrap());
        assert_eq!(sessions[1].roots(), sessions[3].roots());

        // Both members emit the same downstream packets
        let (first, second) = outbox.packets.split_at(MIXSIZE);
        assert_eq!(first, second);
    }

    /// Tests the malformed inputs a session rejects
    #[test]
    fn test_corrupt_inputs() {
        let deployment = deployment(true);
        let (init, ups) = round(&deployment);
        let mut session = ServerSession::new(init.mpcid, MIXSIZE, GROUP_SIZE);

        // Up before init names it
        assert!(session.set_up(ups[0][0].clone()).unwrap_err().is_corruption());

        // Wrong count, unsorted, conflicting init
        let mut short = init.clone();
        short.cids.pop();
        assert!(session.set_init(short).is_err());
        let mut unsorted = init.clone();
        unsorted.cids.reverse();
        assert!(session.set_init(unsorted).is_err());

        session.set_init(init.clone()).unwrap();
        session.set_init(init.clone()).unwrap();
        let mut conflicting = init.clone();
        conflicting.cids[0] = Guid::default();
        assert!(session.set_init(conflicting).is_err());

        // Short share vector, unknown order
        let mut short_up = ups[0][0].clone();
        short_up.z.pop();
        assert!(session.set_up(short_up).is_err());
        let stray = McVPacket { mpcid: init.mpcid, v: ups[0][0].z.clone() };
        assert!(session.set_v(GROUP_SIZE, stray).is_err());
    }

    /// Tests that a tampered share vector is detected as corruption when the
    /// reconstructed polynomial does not split
    #[test]
    fn test_corrupt_reconstruction() {
        let mut rng = thread_rng();
        let deployment = deployment(false);
        let configs = members(&deployment);
        let (init, ups) = round(&deployment);

        let mut sessions = (0..3).map(|j| primed_session(&init, &ups[j])).collect_vec();
        let mut broadcasts = Vec::new();
        for (j, session) in sessions.iter_mut().enumerate() {
            session.tick(&configs[j], &mut Outbox::default(), &mut rng).unwrap();
            broadcasts.push(session.v_packets[j].clone().unwrap());
        }

        // Shift one of member 2's sums
        let mut tampered = broadcasts[2].clone();
        tampered.v[0] += configs[0].field().one();
        sessions[0].set_v(1, broadcasts[1].clone()).unwrap();
        sessions[0].set_v(2, tampered).unwrap();

        let err = sessions[0].tick(&configs[0], &mut Outbox::default(), &mut rng).unwrap_err();
        assert!(err.is_corruption(), "unexpected error {err}");
    }
}
