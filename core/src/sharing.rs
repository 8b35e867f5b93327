//! Shamir secret sharing over the mixing field
//!
//! Shares are evaluations of a random polynomial at the points `1..=n`; the
//! scheme is linear, so summing shares taken at the same point yields a share
//! of the summed secrets

use itertools::Itertools;
use rand::{CryptoRng, RngCore};

use crate::{
    algebra::{DensePoly, Scalar},
    error::MixError,
};

/// Share a secret among `n` parties such that any `threshold + 1` shares
/// recover it
///
/// Share `i` of the returned vector is the evaluation at the point `i + 1`
pub fn share<R: RngCore + CryptoRng>(
    secret: &Scalar,
    n: usize,
    threshold: usize,
    rng: &mut R,
) -> Result<Vec<Scalar>, MixError> {
    if threshold >= n {
        return Err(MixError::Config(format!(
            "threshold {threshold} requires more than {n} shares"
        )));
    }

    let field = secret.field();
    let mut coeffs = Vec::with_capacity(threshold + 1);
    coeffs.push(secret.clone());
    for _ in 1..threshold {
        coeffs.push(field.random(rng));
    }
    if threshold > 0 {
        coeffs.push(field.random_nonzero(rng));
    }

    let poly = DensePoly::new(field, coeffs);
    Ok((1..=n).map(|x| poly.eval(&field.scalar(x as u64))).collect_vec())
}

/// Share the powers `x^1..=x^mixsize` among `n` parties
///
/// Entry `j` of the result is party `j`'s vector of shares, one per power
pub fn share_powers<R: RngCore + CryptoRng>(
    x: &Scalar,
    mixsize: usize,
    n: usize,
    threshold: usize,
    rng: &mut R,
) -> Result<Vec<Vec<Scalar>>, MixError> {
    let mut per_party = vec![Vec::with_capacity(mixsize); n];
    let mut power = x.clone();
    for _ in 0..mixsize {
        let shares = share(&power, n, threshold, rng)?;
        for (party, s) in per_party.iter_mut().zip(shares) {
            party.push(s);
        }

        power = &power * x;
    }

    Ok(per_party)
}

/// Recover a secret from `(point, share)` pairs by Lagrange interpolation at
/// zero
///
/// Exactly the given shares are used, so the caller supplies
/// `threshold + 1` of them
pub fn reconstruct(shares: &[(Scalar, Scalar)]) -> Result<Scalar, MixError> {
    let (first_point, _) = shares
        .first()
        .ok_or_else(|| MixError::Arithmetic("no shares to reconstruct from".to_string()))?;
    let field = first_point.field();

    let mut secret = field.zero();
    for (i, (x_i, y_i)) in shares.iter().enumerate() {
        // l_i(0) = Π_{j != i} x_j / (x_j - x_i)
        let mut numerator = field.one();
        let mut denominator = field.one();
        for (j, (x_j, _)) in shares.iter().enumerate() {
            if i == j {
                continue;
            }

            numerator *= x_j;
            denominator *= x_j - x_i;
        }

        let basis = numerator
            * denominator
                .inverse()
                .map_err(|_| MixError::Arithmetic("duplicate share points".to_string()))?;
        secret += y_i * basis;
    }

    Ok(secret)
}

/// Reconstruct from shares indexed by committee position, position `i`
/// holding the evaluation at `i + 1`
pub fn reconstruct_indexed(shares: &[(usize, Scalar)]) -> Result<Scalar, MixError> {
    let pairs = shares
        .iter()
        .map(|(idx, share)| (share.field().scalar(*idx as u64 + 1), share.clone()))
        .collect_vec();
    reconstruct(&pairs)
}
