//! Free-space-weighted placement of new machines across volumes (spec §4.4).
//!
//! A direct port of the original agent's `random_weighted`, generalized from
//! an arbitrary weight map to the volume-placement use case: walk candidates
//! in order accumulating a cumulative weight share, and return the first one
//! whose share exceeds a uniform draw. Falls back to a uniform pick when all
//! weights are zero, as the original does.

use rand::Rng;

use crate::error::AgentErrorKind;
use crate::volume::Volume;
use crate::Result;

/// Choose a volume for a newly-seen machine among those that currently
/// accept new machines and are under their high-water mark (spec §4.4).
/// Fails `NoSuitableVolume` if none qualify.
pub fn choose_volume(volumes: &[Volume]) -> Result<&Volume> {
    choose_volume_with(volumes, &mut rand::thread_rng())
}

/// Testable variant taking an explicit RNG so the weighted distribution can
/// be exercised deterministically or over many draws (spec §8 invariant 4).
pub fn choose_volume_with<'a, R: Rng + ?Sized>(volumes: &'a [Volume], rng: &mut R) -> Result<&'a Volume> {
    let candidates: Vec<&Volume> = volumes.iter().filter(|v| v.effectively_accepts_new()).collect();
    if candidates.is_empty() {
        return Err(AgentErrorKind::NoSuitableVolume.into());
    }

    let total: f64 = candidates.iter().map(|v| v.available_mib.max(0.0)).sum();
    if total <= 0.0 {
        let idx = rng.gen_range(0..candidates.len());
        return Ok(candidates[idx]);
    }

    let r: f64 = rng.gen_range(0.0..1.0);
    let mut cumulative = 0.0;
    for v in &candidates {
        cumulative += v.available_mib.max(0.0) / total;
        if r < cumulative {
            return Ok(v);
        }
    }
    // Floating point rounding can leave `r` just shy of 1.0 past the last
    // share; the last candidate is the correct fallback.
    Ok(candidates[candidates.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn volume(name: &str, accept_new: bool, high_water_pct: f64, total_mib: f64, available_mib: f64) -> Volume {
        Volume {
            name: name.to_string(),
            path: PathBuf::from(format!("/data/{}", name)),
            accept_new,
            high_water_pct,
            total_mib,
            available_mib,
            device_id: 0,
        }
    }

    #[test]
    fn scenario_s3_high_water_excludes_b_and_picks_a_deterministically() {
        let volumes = vec![
            volume("A", true, 80.0, 100.0, 50.0),
            volume("B", true, 80.0, 100.0, 5.0), // 95% used > 80
        ];
        let picked = choose_volume(&volumes).unwrap();
        assert_eq!(picked.name, "A");
    }

    #[test]
    fn no_suitable_volume_when_all_excluded() {
        let volumes = vec![volume("A", false, 80.0, 100.0, 50.0)];
        assert!(choose_volume(&volumes).is_err());
    }

    #[test]
    fn weighted_frequency_converges_to_available_share() {
        let volumes = vec![
            volume("A", true, 80.0, 100.0, 75.0),
            volume("B", true, 80.0, 100.0, 25.0),
        ];
        let mut rng = rand::thread_rng();
        let mut counts: HashMap<String, u32> = HashMap::new();
        const TRIALS: u32 = 20_000;
        for _ in 0..TRIALS {
            let picked = choose_volume_with(&volumes, &mut rng).unwrap();
            *counts.entry(picked.name.clone()).or_insert(0) += 1;
        }
        let share_a = f64::from(counts["A"]) / f64::from(TRIALS);
        assert!((share_a - 0.75).abs() < 0.02, "share_a={}", share_a);
    }

    #[test]
    fn zero_weights_fall_back_to_uniform() {
        let volumes = vec![
            volume("A", true, 80.0, 100.0, 0.0),
            volume("B", true, 80.0, 100.0, 0.0),
        ];
        let mut rng = rand::thread_rng();
        // Should not panic or fail; every draw returns some candidate.
        for _ in 0..100 {
            assert!(choose_volume_with(&volumes, &mut rng).is_ok());
        }
    }
}
