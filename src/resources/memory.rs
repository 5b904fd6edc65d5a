//! # Memory Monitoring
//!
//! OS memory sampling behind the [`MemoryProbe`] trait, and classification of a
//! sample against the warning/critical thresholds.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{ProcessesToUpdate, System};

/// Raw memory reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub total_bytes: u64,
    /// Resident set size of this process, when the OS reports it
    pub process_rss_bytes: Option<u64>,
}

impl MemorySample {
    /// Used memory as a fraction of total, 0.0 when total is unknown
    pub fn usage_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Source of memory readings
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Reads system and process memory through `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl std::fmt::Debug for SysinfoProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoProbe").finish()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn sample(&self) -> MemorySample {
        let mut system = self.system.lock();
        system.refresh_memory();

        let process_rss_bytes = sysinfo::get_current_pid().ok().and_then(|pid| {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            system.process(pid).map(|process| process.memory())
        });

        MemorySample {
            used_bytes: system.used_memory(),
            total_bytes: system.total_memory(),
            process_rss_bytes,
        }
    }
}

/// Probe reporting a settable usage fraction of a fixed total.
///
/// Used to drive memory-pressure paths deterministically.
#[derive(Debug)]
pub struct StaticMemoryProbe {
    total_bytes: u64,
    fraction_bits: AtomicU64,
}

impl StaticMemoryProbe {
    const TOTAL_BYTES: u64 = 16 * 1024 * 1024 * 1024;

    pub fn new(usage_fraction: f64) -> Self {
        Self {
            total_bytes: Self::TOTAL_BYTES,
            fraction_bits: AtomicU64::new(usage_fraction.to_bits()),
        }
    }

    pub fn set_usage(&self, usage_fraction: f64) {
        self.fraction_bits
            .store(usage_fraction.to_bits(), Ordering::Relaxed);
    }
}

impl MemoryProbe for StaticMemoryProbe {
    fn sample(&self) -> MemorySample {
        let fraction = f64::from_bits(self.fraction_bits.load(Ordering::Relaxed));
        MemorySample {
            used_bytes: (self.total_bytes as f64 * fraction) as u64,
            total_bytes: self.total_bytes,
            process_rss_bytes: None,
        }
    }
}

/// Severity of a memory reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
}

/// A sample classified against the configured thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryCheck {
    pub usage_fraction: f64,
    pub level: MemoryLevel,
    pub sample: MemorySample,
}

impl MemoryCheck {
    pub fn classify(sample: MemorySample, warning_threshold: f64, critical_threshold: f64) -> Self {
        let usage_fraction = sample.usage_fraction();
        let level = if usage_fraction >= critical_threshold {
            MemoryLevel::Critical
        } else if usage_fraction >= warning_threshold {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        };
        Self {
            usage_fraction,
            level,
            sample,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.level == MemoryLevel::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_thresholds() {
        let probe = StaticMemoryProbe::new(0.5);
        assert_eq!(
            MemoryCheck::classify(probe.sample(), 0.8, 0.9).level,
            MemoryLevel::Normal
        );

        probe.set_usage(0.85);
        assert_eq!(
            MemoryCheck::classify(probe.sample(), 0.8, 0.9).level,
            MemoryLevel::Warning
        );

        probe.set_usage(0.92);
        let check = MemoryCheck::classify(probe.sample(), 0.8, 0.9);
        assert!(check.is_critical());
        assert!((check.usage_fraction - 0.92).abs() < 0.001);
    }

    #[test]
    fn test_zero_total_reports_zero_usage() {
        let sample = MemorySample {
            used_bytes: 10,
            total_bytes: 0,
            process_rss_bytes: None,
        };
        assert_eq!(sample.usage_fraction(), 0.0);
    }

    #[test]
    fn test_sysinfo_probe_reports_plausible_values() {
        let sample = SysinfoProbe::new().sample();
        assert!(sample.total_bytes > 0);
        assert!(sample.used_bytes <= sample.total_bytes);
    }
}
