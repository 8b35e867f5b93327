//! Conversions between power sums of a set of values and the monic polynomial
//! vanishing on that set, via Newton's identities

use crate::{
    algebra::{
        field::{PrimeField, Scalar},
        poly::DensePoly,
    },
    error::MixError,
};

/// Compute the monic polynomial of the given degree whose roots have the
/// power sums `newton_sums[k - 1] = Σ r^k`
///
/// Coefficients are derived from the top down, coefficient `i` requiring the
/// inverse of `degree - i`
pub fn newton_to_polynomial(
    field: &PrimeField,
    newton_sums: &[Scalar],
    degree: usize,
) -> Result<DensePoly, MixError> {
    if newton_sums.len() < degree {
        return Err(MixError::Arithmetic(format!(
            "{} power sums cannot determine a degree {degree} polynomial",
            newton_sums.len()
        )));
    }

    let mut out = vec![field.zero(); degree + 1];
    out[degree] = field.one();
    if degree == 0 {
        return Ok(DensePoly::new(field, out));
    }

    out[degree - 1] = -&newton_sums[0];
    for i in (0..degree - 1).rev() {
        let k = degree - i;
        let mut acc = newton_sums[k - 1].clone();
        for j in 0..k - 1 {
            acc += &out[i + j + 1] * &newton_sums[j];
        }

        let k_inv = field.scalar(k as u64).inverse()?;
        out[i] = -(acc * k_inv);
    }

    Ok(DensePoly::new(field, out))
}

/// Compute the power sums `Σ v^k` for `k = 1..=degree`
pub fn values_to_newton(field: &PrimeField, values: &[Scalar], degree: usize) -> Vec<Scalar> {
    let mut powers = values.to_vec();
    let mut out = Vec::with_capacity(degree);
    for k in 0..degree {
        if k > 0 {
            for (power, value) in powers.iter_mut().zip(values.iter()) {
                *power *= value;
            }
        }

        let mut sum = field.zero();
        for power in powers.iter() {
            sum += power;
        }
        out.push(sum);
    }

    out
}

#[cfg(test)]
mod test {
    use rand::thread_rng;

    use super::{newton_to_polynomial, values_to_newton};
    use crate::{
        algebra::poly::DensePoly,
        test_helpers::{large_field, random_distinct_scalars, toy_field},
    };

    /// Tests the worked example over the toy prime
    #[test]
    fn test_toy_example() {
        let field = toy_field();
        let values = vec![field.scalar(10), field.scalar(20)];

        let sums = values_to_newton(&field, &values, 2);
        assert_eq!(sums, vec![field.scalar(30), field.scalar(15)]);

        let poly = newton_to_polynomial(&field, &sums, 2).unwrap();
        assert_eq!(poly, DensePoly::from_u64s(&field, &[6, 67, 1]));
    }

    /// Tests that the conversion round trips against the product of linear
    /// factors
    #[test]
    fn test_matches_build_from_roots() {
        let mut rng = thread_rng();
        let field = large_field();

        for degree in 1..8 {
            let values = random_distinct_scalars(&field, degree, &mut rng);
            let sums = values_to_newton(&field, &values, degree);
            let poly = newton_to_polynomial(&field, &sums, degree).unwrap();

            assert_eq!(poly, DensePoly::build_from_roots(&field, &values));
        }
    }

    /// Tests the degenerate inputs
    #[test]
    fn test_degenerate() {
        let field = toy_field();
        assert_eq!(
            newton_to_polynomial(&field, &[], 0).unwrap(),
            DensePoly::from_u64s(&field, &[1])
        );
        assert!(newton_to_polynomial(&field, &[field.one()], 2).is_err());
        assert!(values_to_newton(&field, &[], 3).iter().all(|s| s.is_zero()));
    }
}
