//! Local system metrics collection for heartbeats.

use chrono::Utc;
use sysinfo::System;
use taskfly_state::SystemMetrics;

/// Sample cpu count, load averages, and memory usage from the OS.
pub fn collect(sys: &mut System) -> SystemMetrics {
    sys.refresh_cpu_all();
    sys.refresh_memory();
    let load = System::load_average();
    SystemMetrics {
        cpu_cores: sys.cpus().len() as u32,
        load_avg_1: load.one,
        load_avg_5: load.five,
        load_avg_15: load.fifteen,
        memory_total: sys.total_memory(),
        memory_used: sys.used_memory(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_reports_plausible_values() {
        let mut sys = System::new();
        let metrics = collect(&mut sys);
        assert!(metrics.cpu_cores >= 1);
        assert!(metrics.memory_total > 0);
        assert!(metrics.memory_used <= metrics.memory_total);
        assert!(metrics.load_avg_1 >= 0.0);
    }
}
