//! Root finding over `Z_P` with the tangent Graeffe transform
//!
//! For a prime `P = 2^m * M + 1` and a generator `zeta` of `Z_P^*`, raising
//! every root of `f` to the power `ρ = 2^(m-2)` lands it in the subgroup of
//! order `4M` generated by `z = zeta^ρ`. The transform computes the polynomial
//! with those powered roots together with its tangent, after which a scan over
//! the `4M` subgroup elements recovers the original roots.

use itertools::Itertools;
use num_bigint::BigUint;
use rand::{CryptoRng, RngCore};
use tracing::log;

use crate::{
    algebra::{
        field::{PrimeField, Scalar},
        poly::DensePoly,
    },
    error::MixError,
};

/// The number of consecutive rounds that may recover no new root before the
/// input is declared malformed
///
/// A squarefree polynomial that splits over the field loses a root to a
/// collision in the scan with small probability, so an honest input almost
/// never needs more than a couple of rounds
pub const MAX_FRUITLESS_ROUNDS: usize = 32;

/// Compute the Taylor expansion of `f` around `-tau` and its tangent
///
/// Returns `(h, hbar)` where `h(x) = f(x - tau)`, i.e. `h[i] = f^(i)(-tau) /
/// i!`, and `hbar = h'`
pub fn initial_linear_expansion(
    f: &DensePoly,
    tau: &Scalar,
) -> Result<(DensePoly, DensePoly), MixError> {
    let field = f.field();
    let degree = f.degree();
    let tau_neg = -tau;

    let mut h = vec![f.eval(&tau_neg)];
    let mut hbar = Vec::with_capacity(degree);

    let mut factorial = field.one();
    let mut derived = f.diff();
    for i in 1..=degree {
        // `factorial` holds (i - 1)! on entry
        let taylor_eval = derived.eval(&tau_neg);
        hbar.push(&taylor_eval * factorial.inverse()?);

        factorial = factorial * field.scalar(i as u64);
        h.push(&taylor_eval * factorial.inverse()?);

        derived = derived.diff();
    }

    Ok((DensePoly::new(field, h), DensePoly::new(field, hbar)))
}

/// Square the roots of `h` while carrying the tangent `hbar` along
///
/// With `a = h(x) h(-x)` and `b = h(x) hbar(-x) + hbar(x) h(-x)`, both even,
/// the new pair keeps the even coefficients of `a` and `b`. The degrees of
/// `h` and `hbar` are preserved
pub fn update_linear_expansion(
    h: &DensePoly,
    hbar: &DensePoly,
    degree: usize,
) -> (DensePoly, DensePoly) {
    let field = h.field();
    let h_neg = h.reflect();
    let hbar_neg = hbar.reflect();

    let a = h * &h_neg;
    let b = h * &hbar_neg + hbar * &h_neg;

    let new_h = (0..=degree).map(|i| a.coeff(2 * i)).collect();
    let new_hbar = (0..degree).map(|i| b.coeff(2 * i)).collect();
    (DensePoly::new(field, new_h), DensePoly::new(field, new_hbar))
}

/// Run the full transform: the initial expansion followed by `log2(rho)`
/// squarings
pub fn tangent_graeffe_transform(
    f: &DensePoly,
    log_rho: u32,
    tau: &Scalar,
) -> Result<(DensePoly, DensePoly), MixError> {
    let (mut h, mut hbar) = initial_linear_expansion(f, tau)?;
    for _ in 0..log_rho {
        (h, hbar) = update_linear_expansion(&h, &hbar, f.degree());
    }

    Ok((h, hbar))
}

/// Find all roots of `f`
///
/// `f` is expected to be squarefree and to split completely over the field,
/// `zeta` must generate `Z_P^*` where `P = 2^two_exponent * odd_factor + 1`.
/// The roots are returned in the order they are recovered; a polynomial that
/// does not yield all of its roots within the retry budget is reported as
/// corruption
pub fn find_roots<R: RngCore + CryptoRng>(
    f: &DensePoly,
    zeta: &Scalar,
    two_exponent: u32,
    odd_factor: u64,
    rng: &mut R,
) -> Result<Vec<Scalar>, MixError> {
    let field = f.field().clone();
    if two_exponent < 2 {
        return Err(MixError::Config(format!("two exponent {two_exponent} is below 2")));
    }

    let log_rho = two_exponent - 2;
    let rho = BigUint::from(1u8) << log_rho;
    let rho_scalar = field.from_biguint(&rho);
    let z = zeta.pow(&rho);
    let chi = odd_factor
        .checked_mul(4)
        .ok_or_else(|| MixError::Config("odd factor too large".to_string()))?;

    let mut roots = Vec::with_capacity(f.degree());
    let mut residual = f.clone();
    let mut fruitless_rounds = 0;
    while residual.degree() > 0 {
        if residual.degree() == 1 {
            roots.push(linear_root(&residual)?);
            break;
        }

        let found = graeffe_round(&residual, &field, &z, &rho_scalar, log_rho, chi, rng)?;
        if found.is_empty() {
            fruitless_rounds += 1;
            if fruitless_rounds >= MAX_FRUITLESS_ROUNDS {
                return Err(MixError::Corruption(format!(
                    "no roots recovered after {fruitless_rounds} rounds, {} remain",
                    residual.degree()
                )));
            }

            log::debug!("graeffe round recovered no roots, retrying with a new shift");
            continue;
        }

        // Divide out the recovered factor and continue on the cofactor
        fruitless_rounds = 0;
        let factor = DensePoly::build_from_roots(&field, &found);
        residual = residual.divides(&factor)?.ok_or_else(|| {
            MixError::Corruption("recovered roots do not divide the polynomial".to_string())
        })?;
        roots.extend(found);
    }

    // A repeated root means the input was not squarefree
    let mut sorted = roots.iter().collect_vec();
    sorted.sort();
    if sorted.windows(2).any(|w| w[0] == w[1]) {
        return Err(MixError::Corruption("polynomial has a repeated root".to_string()));
    }

    Ok(roots)
}

/// The unique root of a degree one polynomial
fn linear_root(f: &DensePoly) -> Result<Scalar, MixError> {
    let c0 = f.coeff(0);
    let c1 = f.coeff(1);
    Ok(-(c0 * c1.inverse()?))
}

/// One randomized pass of the transform and scan over a polynomial of degree
/// at least two
fn graeffe_round<R: RngCore + CryptoRng>(
    f: &DensePoly,
    field: &PrimeField,
    z: &Scalar,
    rho: &Scalar,
    log_rho: u32,
    chi: u64,
    rng: &mut R,
) -> Result<Vec<Scalar>, MixError> {
    let tau = field.random(rng);
    let (h, hbar) = tangent_graeffe_transform(f, log_rho, &tau)?;
    let h_prime = h.diff();

    let mut found = Vec::new();
    let mut y = field.one();
    for _ in 0..chi {
        if h.eval(&y).is_zero() {
            let tangent = hbar.eval(&y);
            if !tangent.is_zero() {
                let beta = rho * &y * h_prime.eval(&y) * tangent.inverse()?;
                found.push(beta - &tau);
            }
        }

        y = y * z;
    }

    // The scan only visits non-zero points, the root shifted onto zero is
    // checked directly
    let tau_neg = -&tau;
    if f.eval(&tau_neg).is_zero() {
        found.push(tau_neg);
    }

    Ok(found)
}

#[cfg(test)]
mod test {
    use itertools::Itertools;
    use rand::thread_rng;

    use super::{find_roots, initial_linear_expansion, tangent_graeffe_transform};
    use crate::{
        algebra::poly::DensePoly,
        error::MixError,
        test_helpers::{
            large_field, large_params, random_distinct_scalars, toy_field, toy_params,
        },
    };

    /// Tests that the initial expansion is the shifted polynomial and its
    /// derivative
    #[test]
    fn test_initial_expansion() {
        let mut rng = thread_rng();
        let field = large_field();
        let roots = random_distinct_scalars(&field, 4, &mut rng);
        let f = DensePoly::build_from_roots(&field, &roots);
        let tau = field.random(&mut rng);

        let (h, hbar) = initial_linear_expansion(&f, &tau).unwrap();
        assert_eq!(hbar, h.diff());

        // h(x) = f(x - tau), so h(r + tau) = 0
        for r in roots.iter() {
            assert!(h.eval(&(r + &tau)).is_zero());
        }
    }

    /// Tests that the transform raises each shifted root to the power rho
    #[test]
    fn test_transform_powers_roots() {
        let field = toy_field();
        let roots = vec![field.scalar(10), field.scalar(20), field.scalar(33)];
        let f = DensePoly::build_from_roots(&field, &roots);
        let tau = field.scalar(4);

        // rho = 8 for P = 97
        let (h, _) = tangent_graeffe_transform(&f, 3, &tau).unwrap();
        for r in roots.iter() {
            let powered = (r + &tau).pow_u64(8);
            assert!(h.eval(&powered).is_zero());
        }
    }

    /// Tests the worked example over the toy prime
    #[test]
    fn test_toy_quadratic() {
        let mut rng = thread_rng();
        let params = toy_params();
        let field = params.field().unwrap();

        // x^2 + 67x + 6 has roots {10, 20} mod 97
        let f = DensePoly::from_u64s(&field, &[6, 67, 1]);
        let roots = find_roots(
            &f,
            &params.zeta_scalar().unwrap(),
            params.two_exponent,
            params.odd_factor,
            &mut rng,
        )
        .unwrap();

        let sorted = roots.into_iter().sorted().collect_vec();
        assert_eq!(sorted, vec![field.scalar(10), field.scalar(20)]);
    }

    /// Tests the base cases of the root finder
    #[test]
    fn test_low_degree() {
        let mut rng = thread_rng();
        let params = toy_params();
        let field = params.field().unwrap();
        let zeta = params.zeta_scalar().unwrap();

        let constant = DensePoly::from_u64s(&field, &[5]);
        assert!(find_roots(&constant, &zeta, 5, 3, &mut rng).unwrap().is_empty());

        // 3x + 6 = 0 -> x = -2
        let linear = DensePoly::from_u64s(&field, &[6, 3]);
        assert_eq!(find_roots(&linear, &zeta, 5, 3, &mut rng).unwrap(), vec![field.scalar(95)]);
    }

    /// Tests completeness over every subset size of the toy field's scan bound
    #[test]
    fn test_toy_completeness() {
        let mut rng = thread_rng();
        let params = toy_params();
        let field = params.field().unwrap();

        for k in 2..=params.odd_factor as usize {
            for _ in 0..20 {
                let roots = random_distinct_scalars(&field, k, &mut rng);
                let f = DensePoly::build_from_roots(&field, &roots);
                let found = find_roots(
                    &f,
                    &params.zeta_scalar().unwrap(),
                    params.two_exponent,
                    params.odd_factor,
                    &mut rng,
                )
                .unwrap();

                assert_eq!(
                    found.into_iter().sorted().collect_vec(),
                    roots.into_iter().sorted().collect_vec()
                );
            }
        }
    }

    /// Tests completeness over the large prime
    #[test]
    fn test_large_completeness() {
        let mut rng = thread_rng();
        let params = large_params(5);
        let field = params.field().unwrap();
        let roots = random_distinct_scalars(&field, 5, &mut rng);
        let f = DensePoly::build_from_roots(&field, &roots);

        let found = find_roots(
            &f,
            &params.zeta_scalar().unwrap(),
            params.two_exponent,
            params.odd_factor,
            &mut rng,
        )
        .unwrap();

        assert_eq!(
            found.into_iter().sorted().collect_vec(),
            roots.into_iter().sorted().collect_vec()
        );
    }

    /// Tests that a polynomial with a repeated root is rejected
    #[test]
    fn test_repeated_root_is_corruption() {
        let mut rng = thread_rng();
        let params = toy_params();
        let field = params.field().unwrap();

        // (x - 7)^2 (x - 11): the double root never separates in the scan
        let f = DensePoly::build_from_roots(
            &field,
            &[field.scalar(7), field.scalar(7), field.scalar(11)],
        );
        let zeta = params.zeta_scalar().unwrap();
        let res = find_roots(&f, &zeta, params.two_exponent, params.odd_factor, &mut rng);

        assert!(matches!(res, Err(MixError::Corruption(_))));
    }

    /// Tests that an irreducible quadratic is reported as corruption
    #[test]
    fn test_irreducible_is_corruption() {
        let mut rng = thread_rng();
        let params = toy_params();
        let field = params.field().unwrap();

        // 5 is a generator, hence a non-residue, so x^2 - 5 has no roots
        let f = DensePoly::from_u64s(&field, &[92, 0, 1]);
        let zeta = params.zeta_scalar().unwrap();
        let res = find_roots(&f, &zeta, params.two_exponent, params.odd_factor, &mut rng);

        assert!(matches!(res, Err(MixError::Corruption(_))));
    }
}
