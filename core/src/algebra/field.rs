//! Defines the runtime prime field and the scalar type that forms the basis of
//! the mixing algebra
//!
//! The modulus of a deployment is only known once its parameters are loaded,
//! so every scalar carries a cheap handle to its field. Mixing scalars of two
//! different fields is a programmer error and panics

use std::{
    cmp::Ordering,
    fmt::{Display, Formatter, Result as FmtResult},
    ops::{Add, AddAssign, Mul, MulAssign, Neg, Sub, SubAssign},
    sync::Arc,
};

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::{CryptoRng, RngCore};

use crate::{
    algebra::macros::{impl_assign_variant, impl_borrow_variants},
    error::MixError,
};

// --------------------
// | Field Definition |
// --------------------

/// The shared description of a prime field
#[derive(Debug)]
struct FieldInner {
    /// The prime modulus
    modulus: BigUint,
    /// The number of bytes needed to hold any element of the field
    n_bytes: usize,
}

/// A prime field `Z_P` whose modulus is fixed at runtime
#[derive(Clone, Debug)]
pub struct PrimeField {
    /// The shared field description
    inner: Arc<FieldInner>,
}

impl PrimeField {
    /// Construct a field from its modulus
    ///
    /// The modulus is expected to be prime, only its shape is checked here
    pub fn new(modulus: BigUint) -> Result<Self, MixError> {
        if modulus < BigUint::from(3u8) || !modulus.bit(0) {
            return Err(MixError::Config(format!("invalid field modulus {modulus}")));
        }

        // Emulate a ceiling division to get the byte width of the modulus
        let n_bytes = (modulus.bits() as usize + 7) / 8;
        Ok(Self { inner: Arc::new(FieldInner { modulus, n_bytes }) })
    }

    /// Construct a field from a modulus small enough for a `u64`
    pub fn from_u64(modulus: u64) -> Result<Self, MixError> {
        Self::new(BigUint::from(modulus))
    }

    /// The modulus of the field
    pub fn modulus(&self) -> &BigUint {
        &self.inner.modulus
    }

    /// The number of bits in the modulus
    pub fn bit_length(&self) -> usize {
        self.inner.modulus.bits() as usize
    }

    /// The number of bytes used to encode a field element on the wire
    pub fn n_bytes(&self) -> usize {
        self.inner.n_bytes
    }

    /// The additive identity
    pub fn zero(&self) -> Scalar {
        Scalar { value: BigUint::zero(), field: self.clone() }
    }

    /// The multiplicative identity
    pub fn one(&self) -> Scalar {
        Scalar { value: BigUint::one(), field: self.clone() }
    }

    /// Reduce a `u64` into the field
    pub fn scalar(&self, value: u64) -> Scalar {
        self.from_biguint(&BigUint::from(value))
    }

    /// Reduce an arbitrary integer into the field
    pub fn from_biguint(&self, value: &BigUint) -> Scalar {
        Scalar { value: value % self.modulus(), field: self.clone() }
    }

    /// Sample a uniformly random field element
    pub fn random<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Scalar {
        Scalar { value: rng.gen_biguint_below(self.modulus()), field: self.clone() }
    }

    /// Sample a uniformly random non-zero field element
    pub fn random_nonzero<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Scalar {
        let value = rng.gen_biguint_range(&BigUint::one(), self.modulus());
        Scalar { value, field: self.clone() }
    }

    /// Parse a big endian encoding, rejecting values outside of `[0, P)`
    pub fn from_be_bytes(&self, bytes: &[u8]) -> Result<Scalar, MixError> {
        let value = BigUint::from_bytes_be(bytes);
        if &value >= self.modulus() {
            return Err(MixError::Serialization(
                "encoded value is not a reduced field element".to_string(),
            ));
        }

        Ok(Scalar { value, field: self.clone() })
    }

    /// Parse a big endian encoding and reduce it modulo the field's modulus
    pub fn from_be_bytes_mod_order(&self, bytes: &[u8]) -> Scalar {
        self.from_biguint(&BigUint::from_bytes_be(bytes))
    }

    /// Panic if the two fields differ
    #[inline]
    pub(crate) fn assert_same(&self, other: &PrimeField) {
        assert!(self == other, "attempted to combine elements of different fields");
    }
}

impl PartialEq for PrimeField {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.modulus == other.inner.modulus
    }
}

impl Eq for PrimeField {}

// ---------------------
// | Scalar Definition |
// ---------------------

/// An element of a `PrimeField`, always reduced into `[0, P)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scalar {
    /// The reduced value
    value: BigUint,
    /// The field the value lives in
    field: PrimeField,
}

impl Scalar {
    /// The field this scalar belongs to
    pub fn field(&self) -> &PrimeField {
        &self.field
    }

    /// The canonical representative of the scalar
    pub fn value(&self) -> &BigUint {
        &self.value
    }

    /// Convert the underlying value to a `BigUint`
    pub fn to_biguint(&self) -> BigUint {
        self.value.clone()
    }

    /// Whether the scalar is the additive identity
    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    /// Whether the scalar is the multiplicative identity
    pub fn is_one(&self) -> bool {
        self.value.is_one()
    }

    /// Raise the scalar to an arbitrary exponent
    pub fn pow(&self, exp: &BigUint) -> Self {
        Self { value: self.value.modpow(exp, self.field.modulus()), field: self.field.clone() }
    }

    /// Raise the scalar to a `u64` exponent
    pub fn pow_u64(&self, exp: u64) -> Self {
        self.pow(&BigUint::from(exp))
    }

    /// Compute the multiplicative inverse of the scalar in its field
    pub fn inverse(&self) -> Result<Self, MixError> {
        if self.is_zero() {
            return Err(MixError::Arithmetic("inverse of zero".to_string()));
        }

        // Fermat inversion, the modulus is prime
        let exp = self.field.modulus() - 2u8;
        Ok(self.pow(&exp))
    }

    /// Convert to big endian bytes
    ///
    /// Pad to the maximum amount of bytes needed so that the resulting bytes
    /// are of predictable length
    pub fn to_bytes_be(&self) -> Vec<u8> {
        self.to_bytes_be_padded(self.field.n_bytes())
    }

    /// Convert to big endian bytes left padded to `width` bytes
    ///
    /// Panics if the value does not fit in `width` bytes
    pub fn to_bytes_be_padded(&self, width: usize) -> Vec<u8> {
        let mut bytes = if self.is_zero() { Vec::new() } else { self.value.to_bytes_be() };
        assert!(bytes.len() <= width, "scalar does not fit in {width} bytes");

        let mut padding = vec![0u8; width - bytes.len()];
        padding.append(&mut bytes);
        padding
    }
}

impl Display for Scalar {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.value)
    }
}

impl PartialOrd for Scalar {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Scalars order by their canonical representative, which is the order all
/// committee members agree on when sorting recovered roots
impl Ord for Scalar {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| self.field.modulus().cmp(other.field.modulus()))
    }
}

// --------------
// | Arithmetic |
// --------------

// === Addition === //

impl Add<&Scalar> for &Scalar {
    type Output = Scalar;

    fn add(self, rhs: &Scalar) -> Self::Output {
        self.field.assert_same(&rhs.field);
        let mut value = &self.value + &rhs.value;
        if &value >= self.field.modulus() {
            value -= self.field.modulus();
        }

        Scalar { value, field: self.field.clone() }
    }
}
impl_borrow_variants!(Scalar, Add, add, +, Scalar);
impl_assign_variant!(Scalar, AddAssign, add_assign, +, Scalar);

// === Subtraction === //

impl Sub<&Scalar> for &Scalar {
    type Output = Scalar;

    fn sub(self, rhs: &Scalar) -> Self::Output {
        self.field.assert_same(&rhs.field);
        let value = if self.value >= rhs.value {
            &self.value - &rhs.value
        } else {
            self.field.modulus() - (&rhs.value - &self.value)
        };

        Scalar { value, field: self.field.clone() }
    }
}
impl_borrow_variants!(Scalar, Sub, sub, -, Scalar);
impl_assign_variant!(Scalar, SubAssign, sub_assign, -, Scalar);

// === Negation === //

impl Neg for &Scalar {
    type Output = Scalar;

    fn neg(self) -> Self::Output {
        let value =
            if self.is_zero() { BigUint::zero() } else { self.field.modulus() - &self.value };
        Scalar { value, field: self.field.clone() }
    }
}
impl_borrow_variants!(Scalar, Neg, neg, -);

// === Multiplication === //

impl Mul<&Scalar> for &Scalar {
    type Output = Scalar;

    fn mul(self, rhs: &Scalar) -> Self::Output {
        self.field.assert_same(&rhs.field);
        let value = (&self.value * &rhs.value) % self.field.modulus();
        Scalar { value, field: self.field.clone() }
    }
}
impl_borrow_variants!(Scalar, Mul, mul, *, Scalar);
impl_assign_variant!(Scalar, MulAssign, mul_assign, *, Scalar);
