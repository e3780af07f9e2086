//! Device telemetry: point-in-time snapshots of the shared accelerator.
//!
//! Telemetry is read-only shared state. It is sampled fresh before every
//! admission decision and never held or locked; the probe is the single
//! authority on free memory and temperature.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

const MIB_PER_GB: f64 = 1024.0;
const SMI_QUERY: &str =
    "--query-gpu=name,memory.total,memory.used,memory.free,utilization.gpu,temperature.gpu,power.draw";

/// Snapshot of device state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Device name as reported by the driver.
    pub name: String,
    /// Total device memory in GB.
    pub memory_total_gb: f64,
    /// Memory in use in GB.
    pub memory_used_gb: f64,
    /// Memory free in GB.
    pub memory_free_gb: f64,
    /// Utilization percentage.
    pub utilization_percent: f64,
    /// Core temperature in Celsius.
    pub temperature_c: f64,
    /// Power draw in watts.
    pub power_draw_w: f64,
}

impl DeviceStats {
    /// Idle device with `memory_gb` entirely free.
    #[must_use]
    pub fn idle(name: impl Into<String>, memory_gb: f64) -> Self {
        Self {
            name: name.into(),
            memory_total_gb: memory_gb,
            memory_used_gb: 0.0,
            memory_free_gb: memory_gb,
            utilization_percent: 0.0,
            temperature_c: 0.0,
            power_draw_w: 0.0,
        }
    }
}

/// Source of device telemetry.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Read the current device state. Must not fail: implementations fall back
    /// to a conservative estimate when the device cannot be queried.
    async fn sample(&self) -> DeviceStats;
}

/// Probe that shells out to `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    binary: String,
    timeout: Duration,
    fallback_memory_gb: f64,
}

impl NvidiaSmiProbe {
    /// Probe with a fallback of `fallback_memory_gb` free when the query fails.
    #[must_use]
    pub fn new(fallback_memory_gb: f64) -> Self {
        Self {
            binary: "nvidia-smi".into(),
            timeout: Duration::from_secs(5),
            fallback_memory_gb,
        }
    }

    /// Use a different executable (tests, wrappers).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn fallback(&self) -> DeviceStats {
        DeviceStats::idle("unknown device (estimated)", self.fallback_memory_gb)
    }

    async fn query(&self) -> Result<DeviceStats, String> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .arg(SMI_QUERY)
                .arg("--format=csv,noheader,nounits")
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| format!("{} timed out", self.binary))?
        .map_err(|e| e.to_string())?;

        if !output.status.success() {
            return Err(format!("{} exited with {}", self.binary, output.status));
        }
        parse_smi_line(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl DeviceProbe for NvidiaSmiProbe {
    async fn sample(&self) -> DeviceStats {
        match self.query().await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!("could not read device stats: {e}");
                self.fallback()
            }
        }
    }
}

/// Parse the first line of `nvidia-smi` CSV output (memory in MiB).
pub fn parse_smi_line(raw: &str) -> Result<DeviceStats, String> {
    let line = raw.lines().next().ok_or("empty nvidia-smi output")?;
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 7 {
        return Err(format!("expected 7 fields, got {}", parts.len()));
    }
    let num = |idx: usize| -> Result<f64, String> {
        parts[idx]
            .parse::<f64>()
            .map_err(|e| format!("field {idx} ({:?}): {e}", parts[idx]))
    };
    Ok(DeviceStats {
        name: parts[0].to_string(),
        memory_total_gb: num(1)? / MIB_PER_GB,
        memory_used_gb: num(2)? / MIB_PER_GB,
        memory_free_gb: num(3)? / MIB_PER_GB,
        utilization_percent: num(4)?,
        temperature_c: num(5)?,
        power_draw_w: num(6)?,
    })
}

/// Settable probe for tests and simulations.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    stats: Arc<Mutex<DeviceStats>>,
}

impl StaticProbe {
    /// Probe that always reports `stats` until changed.
    #[must_use]
    pub fn new(stats: DeviceStats) -> Self {
        Self {
            stats: Arc::new(Mutex::new(stats)),
        }
    }

    /// Replace the reported snapshot.
    pub fn set(&self, stats: DeviceStats) {
        *self.stats.lock() = stats;
    }

    /// Change only the free memory (used memory follows).
    pub fn set_free_memory(&self, free_gb: f64) {
        let mut stats = self.stats.lock();
        stats.memory_free_gb = free_gb;
        stats.memory_used_gb = (stats.memory_total_gb - free_gb).max(0.0);
    }

    /// Change only the temperature.
    pub fn set_temperature(&self, celsius: f64) {
        self.stats.lock().temperature_c = celsius;
    }
}

#[async_trait]
impl DeviceProbe for StaticProbe {
    async fn sample(&self) -> DeviceStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_smi_csv() {
        let stats =
            parse_smi_line("NVIDIA GeForce RTX 5080, 16384, 4096, 12288, 37, 61, 212.50\n").unwrap();
        assert_eq!(stats.name, "NVIDIA GeForce RTX 5080");
        assert_eq!(stats.memory_total_gb, 16.0);
        assert_eq!(stats.memory_free_gb, 12.0);
        assert_eq!(stats.temperature_c, 61.0);
        assert!((stats.power_draw_w - 212.5).abs() < 1e-9);
    }

    #[test]
    fn rejects_short_or_garbled_lines() {
        assert!(parse_smi_line("").is_err());
        assert!(parse_smi_line("gpu, 1, 2").is_err());
        assert!(parse_smi_line("gpu, a, b, c, d, e, f").is_err());
    }

    #[tokio::test]
    async fn missing_binary_falls_back() {
        let probe = NvidiaSmiProbe::new(16.0).with_binary("definitely-not-a-real-binary-xyz");
        let stats = probe.sample().await;
        assert_eq!(stats.memory_free_gb, 16.0);
        assert_eq!(stats.temperature_c, 0.0);
    }

    #[tokio::test]
    async fn static_probe_reflects_updates() {
        let probe = StaticProbe::new(DeviceStats::idle("test", 16.0));
        probe.set_free_memory(3.0);
        probe.set_temperature(85.0);
        let stats = probe.sample().await;
        assert_eq!(stats.memory_free_gb, 3.0);
        assert_eq!(stats.memory_used_gb, 13.0);
        assert_eq!(stats.temperature_c, 85.0);
    }
}
