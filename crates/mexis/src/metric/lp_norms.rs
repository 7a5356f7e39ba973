//! Minkowski norms between two vectors.

/// Manhattan distance between two vectors.
///
/// Also known as the L1-norm or the taxicab distance, defined as the sum of
/// the absolute differences between corresponding elements.
///
/// # Examples
///
/// ```
/// use mexis::metric::manhattan;
///
/// let x = [1.0, 2.0, 3.0];
/// let y = [4.0, 5.0, 6.0];
///
/// assert!((manhattan(&x, &y) - 9.0).abs() <= f64::EPSILON);
/// ```
#[must_use]
pub fn manhattan(x: &[f64], y: &[f64]) -> f64 {
    x.iter().zip(y.iter()).map(|(a, b)| (a - b).abs()).sum()
}

/// Euclidean distance between two vectors.
///
/// The L2-norm, defined as the square root of the sum of squared differences
/// between corresponding elements.
///
/// # Examples
///
/// ```
/// use mexis::metric::euclidean;
///
/// let x = [1.0, 2.0, 3.0];
/// let y = [4.0, 5.0, 6.0];
///
/// assert!((euclidean(&x, &y) - 27.0_f64.sqrt()).abs() <= f64::EPSILON);
/// ```
#[must_use]
pub fn euclidean(x: &[f64], y: &[f64]) -> f64 {
    x.iter()
        .zip(y.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        .sqrt()
}

/// L5-norm between two vectors.
///
/// Defined as the fifth root of the sum of the fifth powers of the absolute
/// differences between corresponding elements.
#[must_use]
pub fn minkowski5(x: &[f64], y: &[f64]) -> f64 {
    x.iter()
        .zip(y.iter())
        .map(|(a, b)| (a - b).abs().powi(5))
        .sum::<f64>()
        .powf(1.0 / 5.0)
}

/// Chebyshev distance between two vectors.
///
/// The L-infinity norm, defined as the maximum absolute difference between
/// corresponding elements.
#[must_use]
pub fn chebyshev(x: &[f64], y: &[f64]) -> f64 {
    x.iter()
        .zip(y.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norms_on_axis_pair() {
        let x = [0.0, 0.0];
        let y = [3.0, 4.0];

        float_cmp::assert_approx_eq!(f64, manhattan(&x, &y), 7.0);
        float_cmp::assert_approx_eq!(f64, euclidean(&x, &y), 5.0);
        float_cmp::assert_approx_eq!(f64, chebyshev(&x, &y), 4.0);
    }

    #[test]
    fn minkowski5_matches_hand_computation() {
        let x = [0.0, 0.0];
        let y = [1.0, 2.0];
        // (1^5 + 2^5) ^ (1/5) = 33 ^ 0.2
        float_cmp::assert_approx_eq!(f64, minkowski5(&x, &y), 33.0_f64.powf(1.0 / 5.0));
    }

    #[test]
    fn identity_and_symmetry() {
        let x = [1.5, -2.5, 0.0];
        let y = [-0.5, 4.0, 2.0];

        for d in [manhattan, euclidean, minkowski5, chebyshev] {
            float_cmp::assert_approx_eq!(f64, d(&x, &x), 0.0);
            float_cmp::assert_approx_eq!(f64, d(&x, &y), d(&y, &x));
        }
    }
}
