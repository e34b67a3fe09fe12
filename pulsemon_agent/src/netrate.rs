//! Network throughput sampling. Cumulative interface counters are persisted
//! between runs; a rate is reported only when the previous sample is usable.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::Networks;

use crate::types::NetworkRates;

const STATE_FILE: &str = "net_state.json";
/// Samples further apart than this are not turned into rates.
const MAX_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetState {
    rx_bytes: u64,
    tx_bytes: u64,
    timestamp: i64,
}

/// Sum non-loopback interface totals, persist them, and return byte rates
/// relative to the previous run. `None` on first run, counter reset, or when
/// the elapsed window is outside (0, 300] seconds.
pub fn sample(state_dir: &Path, now: i64) -> io::Result<Option<NetworkRates>> {
    let (rx_bytes, tx_bytes) = read_interface_totals();
    let state_path = state_dir.join(STATE_FILE);

    let previous = load_state(&state_path);
    let current = NetState {
        rx_bytes,
        tx_bytes,
        timestamp: now,
    };
    save_state(&state_path, current)?;

    Ok(rates_between(previous, current))
}

fn read_interface_totals() -> (u64, u64) {
    let networks = Networks::new_with_refreshed_list();
    let mut rx_total: u64 = 0;
    let mut tx_total: u64 = 0;
    for (name, data) in networks.iter() {
        if name == "lo" || name == "lo0" {
            continue;
        }
        rx_total = rx_total.saturating_add(data.total_received());
        tx_total = tx_total.saturating_add(data.total_transmitted());
    }
    (rx_total, tx_total)
}

fn rates_between(previous: Option<NetState>, current: NetState) -> Option<NetworkRates> {
    let prev = previous?;

    let elapsed = current.timestamp - prev.timestamp;
    if elapsed <= 0 || elapsed > MAX_WINDOW_SECS {
        return None;
    }
    // counter reset detection
    if current.rx_bytes < prev.rx_bytes || current.tx_bytes < prev.tx_bytes {
        return None;
    }

    let secs = elapsed as f64;
    Some(NetworkRates {
        rx_bytes_per_sec: (current.rx_bytes - prev.rx_bytes) as f64 / secs,
        tx_bytes_per_sec: (current.tx_bytes - prev.tx_bytes) as f64 / secs,
    })
}

/// First run or a corrupt state file both read as "no previous sample".
fn load_state(path: &Path) -> Option<NetState> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn save_state(path: &Path, state: NetState) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    fs::write(&tmp, serde_json::to_string(&state).map_err(io::Error::other)?)?;
    fs::rename(&tmp, path)
}
