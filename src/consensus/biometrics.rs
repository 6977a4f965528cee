//! Physiological screening of heartbeat streams.
//!
//! Tracks a short per-identity history of heart rate and motion magnitude and
//! scores how plausible the next reading is for a living wearer. Readings are
//! assessed against history without mutating it; only admitted heartbeats are
//! recorded. History outlives collection rounds and is dropped only once an
//! identity has been idle for a while.

use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

use super::liveness::short_key;
use crate::types::Heartbeat;

/// ~5 minutes at 5s intervals
const MAX_HISTORY: usize = 60;
/// Readings needed before variability checks apply.
const MIN_VARIABILITY_SAMPLES: usize = 10;
/// Confidence below which a reading is rejected.
pub const REJECT_BELOW: f64 = 0.3;

/// Outcome of screening one reading
#[derive(Debug, Clone)]
pub struct BiometricResult {
    pub is_valid: bool,
    /// Confidence score in [0, 1] that the reading came from a living wearer
    pub confidence: f64,
    /// Why confidence was reduced, if it was
    pub reason: Option<String>,
    /// Heart-rate standard deviation over the window (BPM); 0 without history
    pub hrv_sdnn: f64,
}

#[derive(Debug, Default, Clone)]
struct History {
    heart_rates: VecDeque<u16>,
    motions: VecDeque<f64>,
    last_seen: u64,
}

impl History {
    fn push(&mut self, heart_rate: u16, motion: f64) {
        self.heart_rates.push_back(heart_rate);
        self.motions.push_back(motion);
        if self.heart_rates.len() > MAX_HISTORY {
            self.heart_rates.pop_front();
        }
        if self.motions.len() > MAX_HISTORY {
            self.motions.pop_front();
        }
    }
}

/// Per-identity physiological screen
#[derive(Debug, Default)]
pub struct BiometricScreen {
    histories: HashMap<String, History>,
}

impl BiometricScreen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score `hb` against the recorded history of its identity.
    pub fn assess(&self, hb: &Heartbeat) -> BiometricResult {
        let mut window = self.histories.get(&hb.device_pubkey).cloned().unwrap_or_default();
        window.push(hb.heart_rate, hb.motion.magnitude());

        let mut confidence = 1.0;
        let mut reasons: Vec<String> = Vec::new();

        if !(33.0..=42.0).contains(&hb.temperature) {
            confidence *= 0.3;
            reasons.push(format!("temperature {:.1}°C outside human range", hb.temperature));
        }

        let hrs: Vec<f64> = window.heart_rates.iter().map(|h| *h as f64).collect();
        let motions: Vec<f64> = window.motions.iter().copied().collect();

        let hrv_sdnn = if hrs.len() >= 5 { sample_std_dev(&hrs) } else { 0.0 };

        if hrs.len() >= MIN_VARIABILITY_SAMPLES {
            if hrv_sdnn < 0.5 {
                confidence *= 0.2;
                reasons.push(format!("HRV too low ({:.2} BPM SDNN)", hrv_sdnn));
            }
            if hrv_sdnn > 40.0 {
                confidence *= 0.4;
                reasons.push(format!("HRV too high ({:.2} BPM SDNN)", hrv_sdnn));
            }
            if is_periodic(&window.heart_rates) {
                confidence *= 0.3;
                reasons.push("heart rate oscillates periodically".to_string());
            }

            let avg_hr = mean(&hrs);
            let avg_motion = mean(&motions);
            if avg_hr > 130.0 && avg_motion < 0.05 {
                confidence *= 0.5;
                reasons.push(format!(
                    "avg HR {:.0} with avg motion {:.3}", avg_hr, avg_motion
                ));
            }
            if sample_std_dev(&motions) < 0.001 && avg_motion > 0.01 {
                confidence *= 0.4;
                reasons.push("motion magnitude constant".to_string());
            }
        }

        let is_valid = confidence >= REJECT_BELOW;
        if !is_valid {
            warn!("Biometric screen failed for {}...: confidence={:.2} {:?}",
                short_key(&hb.device_pubkey), confidence, reasons);
        } else if confidence < 0.7 {
            debug!("Biometric confidence low for {}...: {:.2} {:?}",
                short_key(&hb.device_pubkey), confidence, reasons);
        }

        BiometricResult {
            is_valid,
            confidence,
            reason: if reasons.is_empty() { None } else { Some(reasons.join("; ")) },
            hrv_sdnn,
        }
    }

    /// Append an admitted reading to its identity's history.
    pub fn record(&mut self, hb: &Heartbeat) {
        let history = self.histories.entry(hb.device_pubkey.clone()).or_default();
        history.push(hb.heart_rate, hb.motion.magnitude());
        history.last_seen = history.last_seen.max(hb.timestamp);
    }

    /// Forget identities whose last recorded reading is more than
    /// `max_idle_ms` older than `now_ms`.
    pub fn prune(&mut self, now_ms: u64, max_idle_ms: u64) {
        self.histories
            .retain(|_, h| now_ms.saturating_sub(h.last_seen) <= max_idle_ms);
    }

    pub fn tracked_identities(&self) -> usize {
        self.histories.len()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>()
        / (values.len() as f64 - 1.0);
    variance.sqrt()
}

/// Constant or strictly alternating heart rate over the most recent readings.
fn is_periodic(values: &VecDeque<u16>) -> bool {
    if values.len() < 8 {
        return false;
    }

    let recent: Vec<u16> = values.iter().rev().take(8).copied().collect();
    let period2_matches = (0..6).filter(|&i| recent[i] == recent[i + 2]).count();
    if period2_matches >= 5 {
        return true;
    }

    let distinct: HashSet<u16> = values.iter().rev().take(10).copied().collect();
    distinct.len() <= 1
}
