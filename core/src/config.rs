//! Deployment and per-node configuration
//!
//! A deployment is described by one shared document (the field parameters, the
//! phonebook and the committee group keys) plus a small local document per
//! node holding its persona and secrets. Both are JSON

use std::sync::Arc;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};

use crate::{
    algebra::{PrimeField, Scalar},
    crypto::{KeyBytes, Keypair},
    error::MixError,
    payload::MIN_ROOT_PAYLOAD_BYTES,
    phonebook::{McGroup, McGroupKey, NodeInfo, Phonebook, PhonebookEntry, Psn, Role},
};

// -----------------
// | Mixing Params |
// -----------------

/// The field and round parameters shared by every node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixParams {
    /// The prime modulus `P = 2^two_exponent * odd_factor + 1`
    #[serde(with = "decimal")]
    pub prime: BigUint,
    /// A generator of the multiplicative group mod `P`
    #[serde(with = "decimal")]
    pub zeta: BigUint,
    /// The number of contributions batched into one round
    pub mixsize: usize,
    /// The number of committee members that may be absent from a round
    pub threshold: usize,
    /// The power of two in `P - 1`
    pub two_exponent: u32,
    /// The odd cofactor of `P - 1`
    pub odd_factor: u64,
    /// Whether followers send their reveal only to the leader
    #[serde(default = "default_leader_relay_only")]
    pub leader_relay_only: bool,
}

/// Followers relay through the leader unless configured otherwise
fn default_leader_relay_only() -> bool {
    true
}

impl MixParams {
    /// Check the parameters for internal consistency
    pub fn validate(&self) -> Result<(), MixError> {
        if self.two_exponent < 2 {
            return Err(MixError::Config(format!(
                "two exponent {} must be at least 2",
                self.two_exponent
            )));
        }

        if self.odd_factor % 2 == 0 {
            return Err(MixError::Config(format!("odd factor {} is even", self.odd_factor)));
        }

        let expected = (BigUint::one() << self.two_exponent) * self.odd_factor + 1u8;
        if expected != self.prime {
            return Err(MixError::Config(
                "prime does not equal 2^two_exponent * odd_factor + 1".to_string(),
            ));
        }

        if self.mixsize == 0 {
            return Err(MixError::Config("mixsize must be positive".to_string()));
        }

        // The root scan can only separate fewer than `odd_factor` roots reliably
        if self.odd_factor <= self.mixsize as u64 {
            return Err(MixError::Config(format!(
                "odd factor {} must exceed the mixsize {}",
                self.odd_factor, self.mixsize
            )));
        }

        self.check_generator()?;

        if self.prime_space() < MIN_ROOT_PAYLOAD_BYTES {
            return Err(MixError::Config(format!(
                "a {} bit prime leaves {} payload bytes, at least {MIN_ROOT_PAYLOAD_BYTES} needed",
                self.prime.bits(),
                self.prime_space()
            )));
        }

        Ok(())
    }

    /// `zeta` generates `Z_P^*` iff `zeta^((P-1)/q) != 1` for every prime `q`
    /// dividing `P - 1`
    fn check_generator(&self) -> Result<(), MixError> {
        if self.zeta.is_zero() || self.zeta >= self.prime {
            return Err(MixError::Config("zeta is not a field element".to_string()));
        }

        let order = &self.prime - 1u8;
        let one = BigUint::one();
        let mut prime_factors = vec![2u64];
        prime_factors.extend(odd_prime_factors(self.odd_factor));
        for q in prime_factors {
            if self.zeta.modpow(&(&order / q), &self.prime) == one {
                return Err(MixError::Config(format!(
                    "zeta is not a generator, its order divides (P - 1) / {q}"
                )));
            }
        }

        Ok(())
    }

    /// Build the field the parameters describe
    pub fn field(&self) -> Result<PrimeField, MixError> {
        PrimeField::new(self.prime.clone())
    }

    /// The generator as an element of the field
    pub fn zeta_scalar(&self) -> Result<Scalar, MixError> {
        Ok(self.field()?.from_biguint(&self.zeta))
    }

    /// The number of payload bytes that always encode an integer below `P`
    pub fn prime_space(&self) -> usize {
        (self.prime.bits() as usize - 1) / 8
    }

    /// The number of bytes needed to hold any field element
    pub fn prime_size(&self) -> usize {
        (self.prime.bits() as usize + 7) / 8
    }
}

/// The distinct prime factors of an odd number, by trial division
fn odd_prime_factors(mut n: u64) -> Vec<u64> {
    let mut factors = Vec::new();
    let mut q = 3u64;
    while q.saturating_mul(q) <= n {
        if n % q == 0 {
            factors.push(q);
            while n % q == 0 {
                n /= q;
            }
        }
        q += 2;
    }

    if n > 1 {
        factors.push(n);
    }
    factors
}

/// Serialize big integers as decimal strings
mod decimal {
    use num_bigint::BigUint;
    use serde::{de::Error as DeError, Deserialize, Deserializer, Serializer};

    /// Write the integer in base ten
    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    /// Parse a base ten integer
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(deserializer)?;
        BigUint::parse_bytes(s.trim().as_bytes(), 10)
            .ok_or_else(|| DeError::custom(format!("invalid decimal integer {s}")))
    }
}

// -------------
// | Documents |
// -------------

/// The document shared by every node of a deployment
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// The field and round parameters
    pub params: MixParams,
    /// Every node of the deployment
    pub phonebook: Vec<PhonebookEntry>,
    /// The public group key of each committee
    #[serde(default)]
    pub mc_groups: Vec<McGroupKey>,
}

impl DeploymentConfig {
    /// Parse a deployment document
    pub fn from_json(json: &str) -> Result<Self, MixError> {
        serde_json::from_str(json).map_err(|e| MixError::Config(e.to_string()))
    }
}

/// The secrets and identity of a single node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalConfig {
    /// The node's persona
    pub psn: Psn,
    /// The node's x25519 secret key
    pub secret_key: KeyBytes,
    /// The committee group secret, committee members only
    #[serde(default)]
    pub group_secret_key: Option<KeyBytes>,
}

impl LocalConfig {
    /// Parse a local document
    pub fn from_json(json: &str) -> Result<Self, MixError> {
        serde_json::from_str(json).map_err(|e| MixError::Config(e.to_string()))
    }
}

// ---------------
// | Node Config |
// ---------------

/// The validated configuration a node runs with
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// The round parameters
    params: MixParams,
    /// The field built from the parameters
    field: PrimeField,
    /// The generator as a field element
    zeta: Scalar,
    /// The deployment phonebook, shared between nodes in a process
    phonebook: Arc<Phonebook>,
    /// This node's persona
    psn: Psn,
    /// This node's phonebook entry
    info: NodeInfo,
    /// This node's keypair
    keypair: Keypair,
    /// The committee keypair, committee members only
    group_keypair: Option<Keypair>,
}

impl NodeConfig {
    /// Validate and assemble a node's configuration
    pub fn new(
        params: MixParams,
        phonebook: Arc<Phonebook>,
        local: LocalConfig,
    ) -> Result<Self, MixError> {
        params.validate()?;
        let field = params.field()?;
        let zeta = field.from_biguint(&params.zeta);

        let info = phonebook
            .get(&local.psn)
            .cloned()
            .ok_or_else(|| MixError::Config(format!("{} is not in the phonebook", local.psn)))?;

        let keypair = Keypair::from_secret(local.secret_key);
        if keypair.public() != &info.public_key {
            return Err(MixError::Config(format!(
                "secret key of {} does not match its phonebook entry",
                local.psn
            )));
        }

        for group in phonebook.groups() {
            if group.size() <= params.threshold {
                return Err(MixError::Config(format!(
                    "group {} has {} members, threshold {} needs more",
                    group.number,
                    group.size(),
                    params.threshold
                )));
            }
        }

        let group_keypair = if info.role.is_mc() {
            let secret = local.group_secret_key.ok_or_else(|| {
                MixError::Config(format!("committee member {} lacks a group secret", local.psn))
            })?;
            let group_keypair = Keypair::from_secret(secret);

            let group = info.group.and_then(|g| phonebook.group(g)).ok_or_else(|| {
                MixError::Config(format!("{} belongs to no known group", local.psn))
            })?;
            if group_keypair.public() != &group.public_key {
                return Err(MixError::Config(format!(
                    "group secret of {} does not match group {}",
                    local.psn, group.number
                )));
            }

            Some(group_keypair)
        } else {
            None
        };

        Ok(Self { params, field, zeta, phonebook, psn: local.psn, info, keypair, group_keypair })
    }

    /// Build a node's configuration from the shared and local documents
    pub fn from_json(deployment: &str, local: &str) -> Result<Self, MixError> {
        let deployment = DeploymentConfig::from_json(deployment)?;
        let local = LocalConfig::from_json(local)?;
        let phonebook = Phonebook::new(deployment.phonebook, deployment.mc_groups)?;

        Self::new(deployment.params, Arc::new(phonebook), local)
    }

    /// The round parameters
    pub fn params(&self) -> &MixParams {
        &self.params
    }

    /// The field
    pub fn field(&self) -> &PrimeField {
        &self.field
    }

    /// The generator of the field's multiplicative group
    pub fn zeta(&self) -> &Scalar {
        &self.zeta
    }

    /// The deployment phonebook
    pub fn phonebook(&self) -> &Arc<Phonebook> {
        &self.phonebook
    }

    /// This node's persona
    pub fn psn(&self) -> &Psn {
        &self.psn
    }

    /// This node's keypair
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// The committee keypair, if this node sits on a committee
    pub fn group_keypair(&self) -> Option<&Keypair> {
        self.group_keypair.as_ref()
    }

    /// This node's phonebook entry
    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    /// This node's role
    pub fn role(&self) -> Role {
        self.info().role
    }

    /// The committee this node sits on
    pub fn my_group(&self) -> Result<&McGroup, MixError> {
        self.info()
            .group
            .and_then(|g| self.phonebook.group(g))
            .ok_or_else(|| MixError::Config(format!("{} is not a committee member", self.psn)))
    }

    /// This node's position within its committee
    pub fn my_order(&self) -> Result<usize, MixError> {
        self.info()
            .order
            .ok_or_else(|| MixError::Config(format!("{} has no committee order", self.psn)))
    }
}
