#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

//! Defines a covert mixing overlay in which committees of servers jointly
//! shuffle client contributions: contributions are secret shared as power
//! sums, the committee reconstructs the sums, turns them into a polynomial
//! and recovers the contributions as its roots with a tangent Graeffe root
//! finder, so that no single server links a sender to a recipient

pub mod algebra;
pub mod config;
pub mod crypto;
pub mod driver;
pub mod error;
pub mod guid;
pub mod network;
pub mod node;
pub mod packets;
pub mod payload;
pub mod phonebook;
pub mod session;
pub mod sharing;

// -------------
// | Constants |
// -------------

/// The order of a committee's leader
pub const LEADER_ORDER: usize = 0;
/// The decimal form of the default deployment prime `2^2045 * 203 + 1`
pub const DEFAULT_PRIME: &str = "820044029059516810255639995975000030996269105244030407315307515223438124148772731414878985817393929141101218258393162244663283813443707122787861866806125184186008513195262775828161267916137422209949962573995714545023602548056476312606641643838832825691009263495421240463272238247854544893416642127769733532618576209762834188924881235209075950931975466896405422223724318605524789639977180471562811793928494336920818944355969630449058160489654264824243826935794663492388314249537062821775861456320882333043093017984163710101792180684457340444718951097131972389418904186618201217874956394600660760411479785380637254352897";
/// The power of two in the default prime's multiplicative group order
pub const DEFAULT_TWO_EXPONENT: u32 = 2045;
/// The odd cofactor of the default prime's multiplicative group order
pub const DEFAULT_ODD_FACTOR: u64 = 203;
/// A generator of the default prime's multiplicative group
pub const DEFAULT_ZETA: u64 = 3;

#[cfg(any(test, feature = "test_helpers"))]
pub mod test_helpers {
    //! Defines test helpers for use in unit and integration tests, as well as
    //! benchmarks
    use std::{collections::BTreeSet, sync::Arc};

    use num_bigint::BigUint;
    use rand::{thread_rng, CryptoRng, RngCore};

    use crate::{
        algebra::{PrimeField, Scalar},
        config::{DeploymentConfig, LocalConfig, MixParams, NodeConfig},
        crypto::{KeyBytes, Keypair},
        guid::Guid,
        node::encode_contribution,
        packets::MbMcUpPacket,
        payload::MessageChunk,
        phonebook::{McGroupKey, Phonebook, PhonebookEntry, Psn, Role},
        sharing::share_powers,
        DEFAULT_ODD_FACTOR, DEFAULT_PRIME, DEFAULT_TWO_EXPONENT, DEFAULT_ZETA, LEADER_ORDER,
    };

    /// The toy prime `2^5 * 3 + 1`
    pub const TOY_PRIME: u64 = 97;
    /// A generator mod the toy prime
    pub const TOY_ZETA: u64 = 5;

    // ----------
    // | Fields |
    // ----------

    /// The field of the toy prime
    pub fn toy_field() -> PrimeField {
        PrimeField::from_u64(TOY_PRIME).unwrap()
    }

    /// The field of the default deployment prime
    pub fn large_field() -> PrimeField {
        large_params(1).field().unwrap()
    }

    /// Parameters over the toy prime, too small to carry a payload but
    /// enough to exercise the algebra
    pub fn toy_params() -> MixParams {
        MixParams {
            prime: BigUint::from(TOY_PRIME),
            zeta: BigUint::from(TOY_ZETA),
            mixsize: 2,
            threshold: 1,
            two_exponent: 5,
            odd_factor: 3,
            leader_relay_only: true,
        }
    }

    /// Parameters over the default prime with the given mixsize
    pub fn large_params(mixsize: usize) -> MixParams {
        MixParams {
            prime: BigUint::parse_bytes(DEFAULT_PRIME.as_bytes(), 10).unwrap(),
            zeta: BigUint::from(DEFAULT_ZETA),
            mixsize,
            threshold: 1,
            two_exponent: DEFAULT_TWO_EXPONENT,
            odd_factor: DEFAULT_ODD_FACTOR,
            leader_relay_only: true,
        }
    }

    /// Sample `k` distinct field elements
    pub fn random_distinct_scalars<R: RngCore + CryptoRng>(
        field: &PrimeField,
        k: usize,
        rng: &mut R,
    ) -> Vec<Scalar> {
        let mut seen = BTreeSet::new();
        while seen.len() < k {
            seen.insert(field.random(rng));
        }

        seen.into_iter().collect()
    }

    // ---------------
    // | Deployments |
    // ---------------

    /// A generated deployment with the local secrets of every node
    #[derive(Clone, Debug)]
    pub struct MockDeployment {
        /// The shared deployment document
        pub config: DeploymentConfig,
        /// The local document of every node
        pub locals: Vec<LocalConfig>,
        /// The phonebook built from the document
        pub phonebook: Arc<Phonebook>,
    }

    impl MockDeployment {
        /// The validated configuration of the named node
        pub fn node_config(&self, psn: &str) -> NodeConfig {
            let local = self.locals.iter().find(|l| l.psn.as_str() == psn).unwrap().clone();
            NodeConfig::new(self.config.params.clone(), self.phonebook.clone(), local).unwrap()
        }

        /// The personas of every client
        pub fn clients(&self) -> Vec<Psn> {
            self.config
                .phonebook
                .iter()
                .filter(|e| e.role == Role::Client)
                .map(|e| e.psn.clone())
                .collect()
        }
    }

    /// Generate a deployment of `n_groups` committees of `group_size`
    /// members named `mc-{group}-{order}`, mailboxes `mb-{i}`, clients
    /// `client-{i}` served by `mb-{i % n_mbs}` and one idle server `idle-0`
    pub fn mock_deployment(
        params: MixParams,
        n_groups: u32,
        group_size: usize,
        n_mbs: usize,
        n_clients: usize,
    ) -> MockDeployment {
        let mut rng = thread_rng();
        let mut entries = Vec::new();
        let mut locals = Vec::new();
        let mut mc_groups = Vec::new();

        let mut add = |psn: Psn, role, group, order, mailboxes, group_secret| {
            let keypair = Keypair::random(&mut rng);
            entries.push(PhonebookEntry {
                psn: psn.clone(),
                role,
                public_key: KeyBytes::from(*keypair.public()),
                group,
                order,
                mailboxes,
            });
            locals.push(LocalConfig {
                psn,
                secret_key: keypair.secret_bytes(),
                group_secret_key: group_secret,
            });
        };

        for group in 0..n_groups {
            let group_keypair = Keypair::random(&mut thread_rng());
            mc_groups.push(McGroupKey {
                group,
                public_key: KeyBytes::from(*group_keypair.public()),
            });

            for order in 0..group_size {
                let role = if order == LEADER_ORDER { Role::McLeader } else { Role::McFollower };
                let psn = Psn::new(format!("mc-{group}-{order}"));
                let group_secret = Some(group_keypair.secret_bytes());
                add(psn, role, Some(group), Some(order), vec![], group_secret);
            }
        }

        for i in 0..n_mbs {
            add(Psn::new(format!("mb-{i}")), Role::MbServer, None, None, vec![], None);
        }

        for i in 0..n_clients {
            let mailboxes = vec![Psn::new(format!("mb-{}", i % n_mbs))];
            add(Psn::new(format!("client-{i}")), Role::Client, None, None, mailboxes, None);
        }
        add(Psn::from("idle-0"), Role::IdleServer, None, None, vec![], None);

        let config = DeploymentConfig { params, phonebook: entries, mc_groups };
        let phonebook =
            Phonebook::new(config.phonebook.clone(), config.mc_groups.clone()).unwrap();
        MockDeployment { config, locals, phonebook: Arc::new(phonebook) }
    }

    /// Build one contribution from `client-{client}` to the next client,
    /// mixed by group zero, returning its id and each member's up packet
    pub fn mock_contribution<R: RngCore + CryptoRng>(
        deployment: &MockDeployment,
        client: usize,
        rng: &mut R,
    ) -> (Guid, Vec<MbMcUpPacket>) {
        let clients = deployment.clients();
        let sender = &clients[client];
        let recipient = &clients[(client + 1) % clients.len()];

        let config = deployment.node_config(sender.as_str());
        let phonebook = config.phonebook().clone();
        let recipient = phonebook.get(recipient).unwrap();
        let mailbox = phonebook.get(&recipient.mailboxes[0]).unwrap();
        let group = phonebook.group(0).unwrap();

        let chunk = MessageChunk {
            group: Guid::random(rng),
            index: 0,
            count: 1,
            data: format!("from {sender}").into_bytes(),
        };
        let x = encode_contribution(&config, recipient, mailbox, group, &chunk, rng).unwrap();

        let params = config.params();
        let cid = Guid::random(rng);
        let per_member =
            share_powers(&x, params.mixsize, group.size(), params.threshold, rng).unwrap();
        let ups = per_member.into_iter().map(|z| MbMcUpPacket { cid, z }).collect();
        (cid, ups)
    }
}
