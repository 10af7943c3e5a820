// src/utils/system.rs: System functions

use std::time::Duration;

use anyhow::Result;
use log::warn;
use rand::rngs::StdRng;
use rand::SeedableRng;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;

/// Determines the physical core count and current CPU load.
///
/// # Returns
///
/// Result<(usize, f32)> physical cores, current cpu usage
pub async fn detect_cores_and_load() -> Result<(usize, f32)> {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(Duration::from_millis(100)).await;
    let cpu_load = system.global_cpu_usage();
    Ok((physical_cores, cpu_load))
}

/// Warns when the requested job count oversubscribes the machine. The request
/// is honored either way.
///
/// # Arguments
///
/// * `requested` - Processor count from the command line.
/// * `physical_cores` - From detect_cores_and_load.
/// * `cpu_load` - Percent load from detect_cores_and_load.
///
/// # Returns
///
/// true if the request fits within the physical cores.
pub fn check_processor_budget(requested: usize, physical_cores: usize, cpu_load: f32) -> bool {
    if requested > physical_cores {
        warn!(
            "Requested {} concurrent jobs but only {} physical cores were detected (load {:.0}%)",
            requested, physical_cores, cpu_load
        );
        return false;
    }
    true
}

/// Creates an RNG from the system entropy pool. Optional seed for
/// reproducibility.
///
/// # Arguments
///
///  * `seed` - Seed number that allows reproducible results.
///
/// # Returns
///
/// A StdRng
pub fn generate_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Per-item seed so parallel jobs draw independent but reproducible streams.
pub fn derive_seed(seed: Option<u64>, item: usize) -> Option<u64> {
    seed.map(|s| s.wrapping_add((item as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)))
}
