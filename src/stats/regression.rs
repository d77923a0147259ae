//! Mean generation time by least squares.

/// Fit `year = a + slope * generation` and return `-slope`, the number of
/// years separating consecutive generations.
///
/// Returns `None` without at least two distinct generations.
pub fn mean_generation_time(points: &[(u32, f64)]) -> Option<f64> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (mut sx, mut sy, mut sxy, mut sxx) = (0.0, 0.0, 0.0, 0.0);
    for &(generation, year) in points {
        let x = f64::from(generation);
        sx += x;
        sy += year;
        sxy += x * year;
        sxx += x * x;
    }
    let denominator = n * sxx - sx * sx;
    if denominator == 0.0 {
        return None;
    }
    let slope = (n * sxy - sx * sy) / denominator;
    Some(-slope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_data() {
        assert_eq!(mean_generation_time(&[]), None);
        assert_eq!(mean_generation_time(&[(1, 1990.0)]), None);
    }

    #[test]
    fn test_linear_data() {
        let points: Vec<(u32, f64)> = (1..=6).map(|g| (g, 2000.0 - 28.0 * f64::from(g - 1))).collect();
        let k = mean_generation_time(&points).unwrap();
        assert!((k - 28.0).abs() < 1e-9);
    }

    #[test]
    fn test_noisy_data() {
        let points = [(1, 1990.0), (2, 1958.0), (3, 1935.0), (4, 1901.0)];
        let k = mean_generation_time(&points).unwrap();
        assert!(k > 25.0 && k < 35.0);
    }
}
