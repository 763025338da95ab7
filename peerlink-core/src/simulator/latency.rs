//! One-way latency models for the simulator.

use std::sync::OnceLock;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Number of regions in the region delay matrix.
pub const REGION_COUNT: usize = 16;

/// Bounds of [`LatencyModel::Random`], in milliseconds.
pub const RANDOM_LATENCY_MIN_MS: u64 = 5;
pub const RANDOM_LATENCY_MAX_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatencyModel {
    #[default]
    None,
    /// Uniform in `[5, 250)` ms, drawn per operation.
    Random,
    Fixed(Duration),
    /// Region-to-region delay matrix.
    Real,
}

impl LatencyModel {
    pub fn fixed_ms(ms: u64) -> Self {
        LatencyModel::Fixed(Duration::from_millis(ms))
    }

    /// Parse `none`, `random`, `real` or `fixed:<ms>`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Some(LatencyModel::None),
            "random" => Some(LatencyModel::Random),
            "real" => Some(LatencyModel::Real),
            other => other
                .strip_prefix("fixed:")
                .and_then(|ms| ms.parse::<u64>().ok())
                .map(LatencyModel::fixed_ms),
        }
    }

    pub(crate) fn sample<R: Rng>(&self, rng: &mut R, from: Option<u32>, to: Option<u32>) -> Duration {
        match self {
            LatencyModel::None => Duration::ZERO,
            LatencyModel::Random => {
                Duration::from_millis(rng.gen_range(RANDOM_LATENCY_MIN_MS..RANDOM_LATENCY_MAX_MS))
            }
            LatencyModel::Fixed(latency) => *latency,
            LatencyModel::Real => region_latency(from, to),
        }
    }
}

/// Representative location per region: (latitude, longitude).
const REGION_LOCATIONS: [(f64, f64); REGION_COUNT] = [
    (38.9, -77.0),  // 0 us-east
    (40.0, -83.0),  // 1 us-central
    (37.4, -122.1), // 2 us-west
    (45.5, -122.7), // 3 us-northwest
    (43.7, -79.4),  // 4 canada
    (-23.5, -46.6), // 5 brazil
    (53.3, -6.3),   // 6 ireland
    (51.5, -0.1),   // 7 uk
    (50.1, 8.7),    // 8 central europe
    (59.3, 18.1),   // 9 nordics
    (19.1, 72.9),   // 10 india
    (1.35, 103.8),  // 11 singapore
    (35.7, 139.7),  // 12 japan
    (37.6, 127.0),  // 13 korea
    (-33.9, 151.2), // 14 australia
    (-33.9, 18.4),  // 15 south africa
];

/// Fixed cost per hop independent of distance.
const BASE_DELAY_MS: f64 = 2.0;
/// Fibre covers roughly 200 km per millisecond; routes are not straight.
const KM_PER_MS: f64 = 200.0;
const ROUTE_INFLATION: f64 = 1.5;

fn great_circle_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let h = ((lat2 - lat1) / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * ((lon2 - lon1) / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// One-way delays in whole milliseconds, computed once.
pub fn region_delay_matrix() -> &'static [[u64; REGION_COUNT]; REGION_COUNT] {
    static MATRIX: OnceLock<[[u64; REGION_COUNT]; REGION_COUNT]> = OnceLock::new();
    MATRIX.get_or_init(|| {
        let mut matrix = [[0u64; REGION_COUNT]; REGION_COUNT];
        for (i, row) in matrix.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                let km = great_circle_km(REGION_LOCATIONS[i], REGION_LOCATIONS[j]);
                *cell = (BASE_DELAY_MS + km * ROUTE_INFLATION / KM_PER_MS).round() as u64;
            }
        }
        matrix
    })
}

fn region_latency(from: Option<u32>, to: Option<u32>) -> Duration {
    match (from, to) {
        (Some(from), Some(to)) if (from as usize) < REGION_COUNT && (to as usize) < REGION_COUNT => {
            Duration::from_millis(region_delay_matrix()[from as usize][to as usize])
        }
        _ => {
            warn!(
                "No region delay for {:?} -> {:?} (regions 0..{}), using zero latency",
                from,
                to,
                REGION_COUNT - 1
            );
            Duration::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_parse() {
        assert_eq!(LatencyModel::parse("fixed:20"), Some(LatencyModel::fixed_ms(20)));
        assert_eq!(LatencyModel::parse("Random"), Some(LatencyModel::Random));
        assert_eq!(LatencyModel::parse("none"), Some(LatencyModel::None));
        assert_eq!(LatencyModel::parse("fixed:abc"), None);
    }

    #[test]
    fn test_random_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let latency = LatencyModel::Random.sample(&mut rng, None, None);
            assert!(latency >= Duration::from_millis(5) && latency < Duration::from_millis(250));
        }
    }

    #[test]
    fn test_matrix_is_symmetric_with_small_diagonal() {
        let matrix = region_delay_matrix();
        for i in 0..REGION_COUNT {
            assert_eq!(matrix[i][i], BASE_DELAY_MS as u64);
            for j in 0..REGION_COUNT {
                assert_eq!(matrix[i][j], matrix[j][i]);
            }
        }
        // transatlantic is slower than intra-us
        assert!(matrix[0][8] > matrix[0][1]);
    }

    #[test]
    fn test_unknown_region_is_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(LatencyModel::Real.sample(&mut rng, Some(3), Some(99)), Duration::ZERO);
        assert_eq!(LatencyModel::Real.sample(&mut rng, None, Some(1)), Duration::ZERO);
    }
}
