//! Data types exchanged with the ingest server.
//! Keep this module minimal and stable — it defines the wire format.

use serde::{Deserialize, Serialize};

/// One point-in-time bundle of host metrics plus identity, ready for
/// transmission. Serializes to a single-line camelCase JSON record; optional
/// sections are omitted entirely when unavailable, never zeroed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub host_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub agent_version: String,
    /// Unix timestamp in seconds.
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub cpu: CpuStats,
    #[serde(default)]
    pub memory: MemoryStats,
    #[serde(default)]
    pub disk: DiskStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkRates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub cores: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_used_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Present only when a valid previous counter sample exists.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRates {
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
}

/// `POST /v1/ingest` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub clock_skew: bool,
}

/// `POST /v1/ingest/batch` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub accepted: u64,
    #[serde(default)]
    pub rejected: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// `POST /v1/enroll` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollResponse {
    #[serde(default)]
    pub host_id: String,
    #[serde(default)]
    pub host_token: String,
}

#[cfg(test)]
pub(crate) fn test_snapshot(tag: &str) -> Snapshot {
    Snapshot {
        host_id: "host-test".to_string(),
        hostname: tag.to_string(),
        agent_version: "0.0.0".to_string(),
        ts: 1_700_000_000,
        cpu: CpuStats {
            load1: 0.42,
            load5: 0.35,
            load15: 0.30,
            cores: 4,
        },
        memory: MemoryStats {
            total_bytes: 8 << 30,
            available_bytes: 4 << 30,
            swap_used_bytes: None,
        },
        disk: DiskStats {
            total_bytes: 100 << 30,
            free_bytes: 60 << 30,
        },
        network: None,
        uptime_seconds: Some(3600),
    }
}
