//! CPU topology queries used for defaults and thread pinning.

use core_affinity::CoreId;
use sysinfo::{CpuRefreshKind, System};

/// Number of logical processors on this machine.
///
/// Falls back to the standard library's estimate and finally to 1 if sysinfo
/// cannot enumerate any CPU.
pub fn logical_cores() -> usize {
    let mut system = System::new();
    system.refresh_cpu_specifics(CpuRefreshKind::everything());

    match system.cpus().len() {
        0 => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        n => n,
    }
}

/// Core identifiers this process may pin threads to, in OS order.
pub fn core_ids() -> Vec<CoreId> {
    core_affinity::get_core_ids().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_least_one_core() {
        assert!(logical_cores() >= 1);
    }

    #[test]
    fn test_core_ids_are_unique() {
        let mut ids: Vec<usize> = core_ids().into_iter().map(|core| core.id).collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }
}
