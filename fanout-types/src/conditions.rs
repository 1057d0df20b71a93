//! Network condition profiles for per-worker fault injection.
//!
//! A [`NetworkConditions`] value describes what the link between a worker
//! and its protocol client should do to every call: delay it, lose it,
//! throttle it, or cut the worker off for a window. Absent fields leave the
//! link unaffected.

use crate::error::{ConditionsError, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fault-injection profile attached to a single worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConditions {
    /// Fixed delay applied to every call, in milliseconds.
    pub latency_ms: Option<u64>,
    /// Uniform jitter around the latency, in milliseconds.
    pub jitter_ms: Option<u64>,
    /// Probability (0..=1) that a call is lost.
    pub packet_loss_rate: Option<f64>,
    /// Probability (0..=1) per call of entering a disconnect window.
    pub disconnect_probability: Option<f64>,
    /// Length of a disconnect window, in milliseconds.
    pub disconnect_duration_ms: Option<u64>,
    /// Throughput cap in kbit/s.
    pub bandwidth_limit_kbps: Option<u64>,
}

impl NetworkConditions {
    /// A profile with no faults.
    pub fn none() -> Self {
        Self::default()
    }

    /// Add fixed latency.
    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    /// Add jitter.
    pub fn jitter(mut self, ms: u64) -> Self {
        self.jitter_ms = Some(ms);
        self
    }

    /// Add packet loss.
    pub fn packet_loss(mut self, rate: f64) -> Self {
        self.packet_loss_rate = Some(rate);
        self
    }

    /// Add random disconnect windows.
    pub fn disconnects(mut self, probability: f64, duration_ms: u64) -> Self {
        self.disconnect_probability = Some(probability);
        self.disconnect_duration_ms = Some(duration_ms);
        self
    }

    /// Add a bandwidth cap.
    pub fn bandwidth(mut self, kbps: u64) -> Self {
        self.bandwidth_limit_kbps = Some(kbps);
        self
    }

    /// True when no field is set.
    pub fn is_unaffected(&self) -> bool {
        *self == Self::default()
    }

    /// Check ranges before the profile is applied.
    pub fn validate(&self) -> Result<(), ConditionsError> {
        check_probability("packet_loss_rate", self.packet_loss_rate)?;
        check_probability("disconnect_probability", self.disconnect_probability)?;

        if self.bandwidth_limit_kbps == Some(0) {
            return Err(ConditionsError::ZeroBandwidth);
        }
        if self.disconnect_probability.unwrap_or(0.0) > 0.0 && self.disconnect_duration_ms.is_none()
        {
            return Err(ConditionsError::MissingDisconnectDuration);
        }
        Ok(())
    }
}

fn check_probability(field: &'static str, value: Option<f64>) -> Result<(), ConditionsError> {
    match value {
        Some(v) if !(0.0..=1.0).contains(&v) || v.is_nan() => {
            Err(ConditionsError::Probability { field, value: v })
        }
        _ => Ok(()),
    }
}

impl fmt::Display for NetworkConditions {
    /// Compact one-line rendering for logs, e.g. `latency=200ms±50ms loss=5.0%`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unaffected() {
            return f.write_str("none");
        }

        let mut parts = Vec::new();
        if let Some(latency) = self.latency_ms {
            match self.jitter_ms {
                Some(jitter) => parts.push(format!("latency={}ms±{}ms", latency, jitter)),
                None => parts.push(format!("latency={}ms", latency)),
            }
        } else if let Some(jitter) = self.jitter_ms {
            parts.push(format!("jitter={}ms", jitter));
        }
        if let Some(loss) = self.packet_loss_rate {
            parts.push(format!("loss={:.1}%", loss * 100.0));
        }
        if let Some(p) = self.disconnect_probability {
            parts.push(format!(
                "disconnect={:.1}%/{}ms",
                p * 100.0,
                self.disconnect_duration_ms.unwrap_or(0)
            ));
        }
        if let Some(rate) = self.bandwidth_limit_kbps {
            parts.push(format!("rate={}kbit", rate));
        }
        f.write_str(&parts.join(" "))
    }
}

/// Named chaos intensity, used to pick random profiles on a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChaosLevel {
    /// Mild delay and almost no loss.
    Low,
    /// Moderate delay and light loss.
    Medium,
    /// Heavy delay and noticeable loss.
    High,
}

impl ChaosLevel {
    /// Ranges used for this level.
    pub fn preset(self) -> ChaosPreset {
        match self {
            ChaosLevel::Low => ChaosPreset {
                delay_ms: (50, 150),
                jitter_ms: (0, 50),
                loss_percent: (0.0, 2.0),
                interval_ms: 15_000,
            },
            ChaosLevel::Medium => ChaosPreset {
                delay_ms: (100, 300),
                jitter_ms: (0, 75),
                loss_percent: (0.0, 3.5),
                interval_ms: 10_000,
            },
            ChaosLevel::High => ChaosPreset {
                delay_ms: (100, 500),
                jitter_ms: (0, 100),
                loss_percent: (0.0, 5.0),
                interval_ms: 10_000,
            },
        }
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ChaosLevel::Low => "low",
            ChaosLevel::Medium => "medium",
            ChaosLevel::High => "high",
        }
    }
}

impl FromStr for ChaosLevel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(ChaosLevel::Low),
            "medium" => Ok(ChaosLevel::Medium),
            "high" => Ok(ChaosLevel::High),
            other => Err(ParseError::ChaosLevel(other.to_string())),
        }
    }
}

/// Inclusive ranges a chaos schedule samples from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChaosPreset {
    /// Latency range in milliseconds.
    pub delay_ms: (u64, u64),
    /// Jitter range in milliseconds.
    pub jitter_ms: (u64, u64),
    /// Packet loss range in percent (0..=100).
    pub loss_percent: (f64, f64),
    /// How often a new profile is rolled, in milliseconds.
    pub interval_ms: u64,
}

impl ChaosPreset {
    /// Build the profile for one sampled point inside the ranges.
    pub fn conditions(&self, delay_ms: u64, jitter_ms: u64, loss_percent: f64) -> NetworkConditions {
        NetworkConditions::none()
            .latency(delay_ms.clamp(self.delay_ms.0, self.delay_ms.1))
            .jitter(jitter_ms.clamp(self.jitter_ms.0, self.jitter_ms.1))
            .packet_loss(loss_percent.clamp(self.loss_percent.0, self.loss_percent.1) / 100.0)
    }
}
