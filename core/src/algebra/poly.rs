//! Dense univariate polynomials over a runtime prime field

use std::ops::{Add, Mul};

use itertools::Itertools;

use crate::{
    algebra::{
        field::{PrimeField, Scalar},
        macros::impl_borrow_variants,
    },
    error::MixError,
};

/// A polynomial stored as its coefficients, index `i` holding the coefficient
/// of `x^i`
///
/// The representation is kept normalized: the last coefficient is non-zero
/// unless the polynomial is the constant zero, which is stored as `[0]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DensePoly {
    /// The field the coefficients live in
    field: PrimeField,
    /// The coefficients, lowest degree first
    coeffs: Vec<Scalar>,
}

impl DensePoly {
    /// Construct a polynomial from its coefficients, lowest degree first
    pub fn new(field: &PrimeField, coeffs: Vec<Scalar>) -> Self {
        for c in coeffs.iter() {
            assert!(c.field() == field, "coefficient from a different field");
        }

        let mut poly = Self { field: field.clone(), coeffs };
        poly.normalize();
        poly
    }

    /// The zero polynomial
    pub fn zero(field: &PrimeField) -> Self {
        Self { field: field.clone(), coeffs: vec![field.zero()] }
    }

    /// A constant polynomial
    pub fn constant(value: Scalar) -> Self {
        let field = value.field().clone();
        Self::new(&field, vec![value])
    }

    /// Construct a polynomial from small integer coefficients
    pub fn from_u64s(field: &PrimeField, coeffs: &[u64]) -> Self {
        Self::new(field, coeffs.iter().map(|c| field.scalar(*c)).collect())
    }

    /// The field of the coefficients
    pub fn field(&self) -> &PrimeField {
        &self.field
    }

    /// The coefficients of the polynomial, lowest degree first
    pub fn coeffs(&self) -> &[Scalar] {
        &self.coeffs
    }

    /// The degree of the polynomial, zero for constants including zero
    pub fn degree(&self) -> usize {
        self.coeffs.len() - 1
    }

    /// Whether this is the zero polynomial
    pub fn is_zero(&self) -> bool {
        self.coeffs.len() == 1 && self.coeffs[0].is_zero()
    }

    /// The coefficient of `x^i`, zero past the degree
    pub fn coeff(&self, i: usize) -> Scalar {
        self.coeffs.get(i).cloned().unwrap_or_else(|| self.field.zero())
    }

    /// The coefficient of the highest degree term
    pub fn leading_coeff(&self) -> &Scalar {
        &self.coeffs[self.coeffs.len() - 1]
    }

    /// Set the coefficient of `x^i`, growing the polynomial as needed
    pub fn set_coeff(&mut self, i: usize, value: Scalar) {
        assert!(value.field() == &self.field, "coefficient from a different field");
        if i >= self.coeffs.len() {
            self.coeffs.resize(i + 1, self.field.zero());
        }

        self.coeffs[i] = value;
        self.normalize();
    }

    /// Strip trailing zero coefficients, keeping at least the constant term
    pub fn normalize(&mut self) {
        while self.coeffs.len() > 1 && self.leading_coeff().is_zero() {
            self.coeffs.pop();
        }

        if self.coeffs.is_empty() {
            self.coeffs.push(self.field.zero());
        }
    }

    /// The formal derivative
    pub fn diff(&self) -> Self {
        if self.degree() == 0 {
            return Self::zero(&self.field);
        }

        let coeffs = self
            .coeffs
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, c)| c * self.field.scalar(i as u64))
            .collect_vec();
        Self::new(&self.field, coeffs)
    }

    /// Evaluate the polynomial at `x` via Horner's rule
    pub fn eval(&self, x: &Scalar) -> Scalar {
        let mut acc = self.field.zero();
        for c in self.coeffs.iter().rev() {
            acc = &acc * x + c;
        }

        acc
    }

    /// The polynomial `f(-x)`, negating the odd coefficients
    pub fn reflect(&self) -> Self {
        let coeffs = self
            .coeffs
            .iter()
            .enumerate()
            .map(|(i, c)| if i % 2 == 0 { c.clone() } else { -c })
            .collect_vec();
        Self::new(&self.field, coeffs)
    }

    /// Multiply every coefficient by a scalar
    pub fn scale(&self, value: &Scalar) -> Self {
        let coeffs = self.coeffs.iter().map(|c| c * value).collect_vec();
        Self::new(&self.field, coeffs)
    }

    /// Exact division
    ///
    /// Returns the quotient if `divisor` divides `self` with zero remainder,
    /// `None` if the degree of the divisor is too large or the remainder is
    /// non-zero
    pub fn divides(&self, divisor: &DensePoly) -> Result<Option<DensePoly>, MixError> {
        self.field.assert_same(&divisor.field);
        if divisor.is_zero() {
            return Err(MixError::Arithmetic("division by the zero polynomial".to_string()));
        }

        let deg_a = self.degree();
        let deg_b = divisor.degree();
        if deg_a < deg_b {
            return Ok(None);
        }

        let lead = divisor.leading_coeff();
        let lead_inv = if lead.is_one() { lead.clone() } else { lead.inverse()? };

        let mut remainder = self.coeffs.clone();
        let mut quotient = vec![self.field.zero(); deg_a - deg_b + 1];
        for i in (0..=deg_a - deg_b).rev() {
            let q = &remainder[i + deg_b] * &lead_inv;
            for (j, b) in divisor.coeffs.iter().enumerate() {
                remainder[i + j] -= b * &q;
            }

            quotient[i] = q;
        }

        if remainder.iter().take(deg_b).any(|r| !r.is_zero()) {
            return Ok(None);
        }

        Ok(Some(Self::new(&self.field, quotient)))
    }

    /// Build the monic polynomial `∏ (x - r)` over the given roots
    ///
    /// No roots gives the constant one
    pub fn build_from_roots(field: &PrimeField, roots: &[Scalar]) -> Self {
        let mut coeffs = Vec::with_capacity(roots.len() + 1);
        coeffs.push(field.one());

        for root in roots.iter() {
            // Multiply the running product by (x - root) in place
            coeffs.push(field.zero());
            for j in (0..coeffs.len()).rev() {
                let shifted = if j > 0 { coeffs[j - 1].clone() } else { field.zero() };
                coeffs[j] = shifted - &coeffs[j] * root;
            }
        }

        Self::new(field, coeffs)
    }
}

// --------------
// | Arithmetic |
// --------------

impl Add<&DensePoly> for &DensePoly {
    type Output = DensePoly;

    fn add(self, rhs: &DensePoly) -> Self::Output {
        self.field.assert_same(&rhs.field);
        let len = self.coeffs.len().max(rhs.coeffs.len());
        let coeffs = (0..len).map(|i| self.coeff(i) + rhs.coeff(i)).collect_vec();

        DensePoly::new(&self.field, coeffs)
    }
}
impl_borrow_variants!(DensePoly, Add, add, +, DensePoly);

impl Mul<&DensePoly> for &DensePoly {
    type Output = DensePoly;

    fn mul(self, rhs: &DensePoly) -> Self::Output {
        self.field.assert_same(&rhs.field);

        // Scalar fast path
        if self.degree() == 0 {
            return rhs.scale(&self.coeffs[0]);
        }
        if rhs.degree() == 0 {
            return self.scale(&rhs.coeffs[0]);
        }

        let mut coeffs = vec![self.field.zero(); self.degree() + rhs.degree() + 1];
        for (i, a) in self.coeffs.iter().enumerate() {
            for (j, b) in rhs.coeffs.iter().enumerate() {
                coeffs[i + j] += a * b;
            }
        }

        DensePoly::new(&self.field, coeffs)
    }
}
impl_borrow_variants!(DensePoly, Mul, mul, *, DensePoly);

#[cfg(test)]
mod test {
    use itertools::Itertools;
    use rand::thread_rng;

    use super::DensePoly;
    use crate::test_helpers::{large_field, random_distinct_scalars, toy_field};

    /// Tests that normalization strips trailing zeros down to a constant
    #[test]
    fn test_normalize() {
        let field = toy_field();
        let f = DensePoly::from_u64s(&field, &[1, 2, 0, 0]);
        assert_eq!(f.degree(), 1);

        let zero = DensePoly::from_u64s(&field, &[0, 0, 0]);
        assert!(zero.is_zero());
        assert_eq!(zero.degree(), 0);

        let empty = DensePoly::new(&field, vec![]);
        assert!(empty.is_zero());
    }

    /// Tests the formal derivative
    #[test]
    fn test_diff() {
        let field = toy_field();

        // 3 + 2x + 5x^3 -> 2 + 15x^2
        let f = DensePoly::from_u64s(&field, &[3, 2, 0, 5]);
        assert_eq!(f.diff(), DensePoly::from_u64s(&field, &[2, 0, 15]));
        assert!(DensePoly::from_u64s(&field, &[42]).diff().is_zero());
    }

    /// Tests Horner evaluation against a direct sum of powers
    #[test]
    fn test_eval() {
        let mut rng = thread_rng();
        let field = large_field();
        let coeffs = (0..6).map(|_| field.random(&mut rng)).collect_vec();
        let f = DensePoly::new(&field, coeffs.clone());
        let x = field.random(&mut rng);

        let mut expected = field.zero();
        for (i, c) in coeffs.iter().enumerate() {
            expected += c * x.pow_u64(i as u64);
        }

        assert_eq!(f.eval(&x), expected);
    }

    /// Tests multiplication, including the constant fast path
    #[test]
    fn test_mul() {
        let field = toy_field();

        // (1 + x)(1 - x) = 1 - x^2
        let f = DensePoly::from_u64s(&field, &[1, 1]);
        let g = DensePoly::from_u64s(&field, &[1, 96]);
        assert_eq!(&f * &g, DensePoly::from_u64s(&field, &[1, 0, 96]));

        let three = DensePoly::from_u64s(&field, &[3]);
        assert_eq!(&three * &f, DensePoly::from_u64s(&field, &[3, 3]));
        assert!((DensePoly::zero(&field) * f).is_zero());
    }

    /// Tests addition sizes the result to the larger operand and normalizes
    #[test]
    fn test_add() {
        let field = toy_field();
        let f = DensePoly::from_u64s(&field, &[1, 2, 3]);
        let g = DensePoly::from_u64s(&field, &[5, 0, 94]);

        assert_eq!(&f + &g, DensePoly::from_u64s(&field, &[6, 2]));
    }

    /// Tests that the product of linear factors vanishes at each root
    #[test]
    fn test_build_from_roots() {
        let mut rng = thread_rng();
        let field = large_field();
        let roots = random_distinct_scalars(&field, 5, &mut rng);
        let f = DensePoly::build_from_roots(&field, &roots);

        assert_eq!(f.degree(), roots.len());
        assert!(f.leading_coeff().is_one());
        for r in roots.iter() {
            assert!(f.eval(r).is_zero());
        }

        assert_eq!(DensePoly::build_from_roots(&field, &[]), DensePoly::from_u64s(&field, &[1]));
    }

    /// Tests that dividing out a subset of roots leaves the remaining roots
    #[test]
    fn test_divides_subset() {
        let mut rng = thread_rng();
        let field = large_field();
        let roots = random_distinct_scalars(&field, 6, &mut rng);

        let all = DensePoly::build_from_roots(&field, &roots);
        let subset = DensePoly::build_from_roots(&field, &roots[..2]);
        let rest = DensePoly::build_from_roots(&field, &roots[2..]);

        assert_eq!(all.divides(&subset).unwrap(), Some(rest));
    }

    /// Tests division with a non-monic divisor
    #[test]
    fn test_divides_non_monic() {
        let field = toy_field();
        let f = DensePoly::from_u64s(&field, &[2, 7, 3]);
        let g = DensePoly::from_u64s(&field, &[1, 3]);

        let q = f.divides(&g).unwrap().unwrap();
        assert_eq!(&q * &g, f);
    }

    /// Tests the failure cases of exact division
    #[test]
    fn test_divides_failures() {
        let field = toy_field();
        let f = DensePoly::from_u64s(&field, &[1, 0, 1]);
        let g = DensePoly::from_u64s(&field, &[1, 1]);

        // Non-zero remainder
        assert_eq!(f.divides(&g).unwrap(), None);
        // Divisor of larger degree
        assert_eq!(g.divides(&f).unwrap(), None);
        // Zero divisor
        assert!(f.divides(&DensePoly::zero(&field)).is_err());
    }
}
