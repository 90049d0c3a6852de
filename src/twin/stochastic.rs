//! Stochastic process model
//!
//! Discretised mean-reverting random walk on a simulated-minute time base:
//!
//! ```text
//! next = current + k*(target - current)*(dt/60) + sigma*sqrt(dt/60)*N(0,1)
//! ```
//!
//! Normals are drawn from the injected RNG, so a seeded `StdRng` replays
//! identically.

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Draw one standard-normal sample.
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    StandardNormal.sample(rng)
}

/// Deterministic part of a drift step with an externally supplied normal.
///
/// The reversion term is capped at a full pull to target.
pub fn drift_step_with(
    current: f64,
    target: f64,
    k: f64,
    sigma: f64,
    dt_seconds: f64,
    normal: f64,
) -> f64 {
    let minutes = (dt_seconds / 60.0).max(0.0);
    let pull = (k * minutes).min(1.0);
    current + pull * (target - current) + sigma * minutes.sqrt() * normal
}

/// One mean-reverting step toward `target`.
pub fn drift_step<R: Rng + ?Sized>(
    current: f64,
    target: f64,
    k: f64,
    sigma: f64,
    dt_seconds: f64,
    rng: &mut R,
) -> f64 {
    let normal = standard_normal(rng);
    drift_step_with(current, target, k, sigma, dt_seconds, normal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use statrs::statistics::Statistics;

    #[test]
    fn test_standard_normal_moments() {
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<f64> = (0..20_000).map(|_| standard_normal(&mut rng)).collect();
        assert!(samples.iter().all(|s| s.is_finite()));

        let mean = samples.iter().mean();
        let std = samples.iter().std_dev();
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((std - 1.0).abs() < 0.05, "std {std}");
    }

    #[test]
    fn test_seeded_replay_is_identical() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let x = drift_step(10.0, 12.0, 0.3, 0.5, 60.0, &mut a);
            let y = drift_step(10.0, 12.0, 0.3, 0.5, 60.0, &mut b);
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn test_noise_free_step_reverts_toward_target() {
        // One simulated minute, k = 0.5: halfway to target
        let next = drift_step_with(10.0, 20.0, 0.5, 1.0, 60.0, 0.0);
        assert!((next - 15.0).abs() < 1e-12);

        // Huge dt caps the pull at the target instead of overshooting
        let next = drift_step_with(10.0, 20.0, 0.5, 0.0, 6_000.0, 0.0);
        assert!((next - 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_noise_scales_with_sqrt_minutes() {
        let one = drift_step_with(0.0, 0.0, 0.1, 2.0, 60.0, 1.0);
        let four = drift_step_with(0.0, 0.0, 0.1, 2.0, 240.0, 1.0);
        assert!((one - 2.0).abs() < 1e-12);
        assert!((four - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_walk_stays_near_target() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut x = 65.0;
        let mut max_dev: f64 = 0.0;
        for _ in 0..10_000 {
            x = drift_step(x, 65.0, 0.35, 0.5, 60.0, &mut rng);
            max_dev = max_dev.max((x - 65.0).abs());
        }
        // Stationary std is ~0.6; a 10k-step walk should never escape by 5 degrees
        assert!(max_dev < 5.0, "max deviation {max_dev}");
    }
}
