//! Snapshot collection via sysinfo. Each section degrades independently: a
//! failed read logs a warning and leaves the optional field absent.

use std::path::Path;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tracing::warn;

use crate::netrate;
use crate::types::{CpuStats, DiskStats, MemoryStats, Snapshot};

pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Collect one snapshot of the local host. Never fails the cycle; host id and
/// agent version are attached by the caller.
pub fn collect(state_dir: &Path) -> Snapshot {
    let refresh = RefreshKind::nothing()
        .with_cpu(CpuRefreshKind::everything())
        .with_memory(MemoryRefreshKind::everything());
    let sys = System::new_with_specifics(refresh);

    let ts = chrono::Utc::now().timestamp();

    let network = match netrate::sample(state_dir, ts) {
        Ok(rates) => rates,
        Err(e) => {
            warn!(error = %e, "network rate sampling failed");
            None
        }
    };

    Snapshot {
        host_id: String::new(),
        hostname: hostname(),
        agent_version: String::new(),
        ts,
        cpu: collect_cpu(&sys),
        memory: collect_memory(&sys),
        disk: collect_root_disk(),
        network,
        uptime_seconds: match System::uptime() {
            0 => None,
            secs => Some(secs),
        },
    }
}

fn collect_cpu(sys: &System) -> CpuStats {
    let load = System::load_average();
    let mut cores = sys.cpus().len();
    if cores == 0 {
        cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
    }
    CpuStats {
        load1: load.one,
        load5: load.five,
        load15: load.fifteen,
        cores,
    }
}

fn collect_memory(sys: &System) -> MemoryStats {
    let total_bytes = sys.total_memory();
    if total_bytes == 0 {
        warn!("memory totals unavailable");
    }
    MemoryStats {
        total_bytes,
        available_bytes: sys.available_memory(),
        swap_used_bytes: (sys.total_swap() > 0).then(|| sys.used_swap()),
    }
}

/// Total/free bytes of the root filesystem; falls back to the largest disk
/// when no `/` mount is listed.
fn collect_root_disk() -> DiskStats {
    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .list()
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .or_else(|| disks.list().iter().max_by_key(|disk| disk.total_space()));
    match root {
        Some(disk) => DiskStats {
            total_bytes: disk.total_space(),
            free_bytes: disk.available_space(),
        },
        None => {
            warn!("no disks reported; disk totals left at zero");
            DiskStats::default()
        }
    }
}
