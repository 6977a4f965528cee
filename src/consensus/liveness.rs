//! Liveness model: heartbeat admission rules and the weight function.
//!
//! The continuity term of the weight is a pluggable [`ContinuityModel`]. The
//! default [`FixedContinuity`] always yields `1.0`; [`SessionContinuity`]
//! credits identities for how long they have been pulsing without a gap.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::{ConsensusConfig, ConsensusError};
use crate::crypto::verify_signature;
use crate::types::{Heartbeat, WeightParams};

/// Admission predicate for a heartbeat. Pure: touches no pool state.
///
/// Rejects on a bad signature, a timestamp older than `max_heartbeat_age_ms`,
/// a heart rate outside the configured inclusive range, or non-finite sensor
/// readings.
pub fn verify_heartbeat(
    hb: &Heartbeat,
    now_ms: u64,
    config: &ConsensusConfig,
) -> Result<(), ConsensusError> {
    if !verify_signature(&hb.device_pubkey, &hb.signable_bytes(), &hb.signature) {
        return Err(ConsensusError::InvalidHeartbeatSignature);
    }

    if now_ms.saturating_sub(hb.timestamp) > config.max_heartbeat_age_ms {
        return Err(ConsensusError::StaleHeartbeat);
    }

    if hb.heart_rate < config.min_heart_rate || hb.heart_rate > config.max_heart_rate {
        return Err(ConsensusError::InvalidHeartRate(hb.heart_rate));
    }

    if !hb.motion.is_finite() || !hb.temperature.is_finite() {
        return Err(ConsensusError::MalformedReading);
    }

    Ok(())
}

/// Source of the continuity factor in `[0, 1]` for a heartbeat.
pub trait ContinuityModel: Send + Sync {
    /// Continuity credited to `hb`. Must depend only on `hb` and state
    /// recorded by [`observe`](Self::observe), so repeated evaluation between
    /// two admissions returns the same value.
    fn continuity(&self, hb: &Heartbeat) -> f64;

    /// Record an admitted heartbeat.
    fn observe(&mut self, _hb: &Heartbeat) {}

    /// Drop history for identities idle for longer than `max_idle_ms`.
    fn prune(&mut self, _now_ms: u64, _max_idle_ms: u64) {}
}

/// Constant continuity. The default is `1.0`.
#[derive(Debug, Clone, Copy)]
pub struct FixedContinuity(pub f64);

impl Default for FixedContinuity {
    fn default() -> Self {
        Self(1.0)
    }
}

impl ContinuityModel for FixedContinuity {
    fn continuity(&self, _hb: &Heartbeat) -> f64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Session {
    started_at: u64,
    last_seen: u64,
}

/// Continuity grows linearly with session age up to `window_ms`.
///
/// A session restarts when an identity's heartbeats are more than
/// `max_gap_ms` apart.
#[derive(Debug, Clone)]
pub struct SessionContinuity {
    window_ms: u64,
    max_gap_ms: u64,
    sessions: HashMap<String, Session>,
}

impl SessionContinuity {
    pub fn new(window_ms: u64, max_gap_ms: u64) -> Self {
        Self { window_ms, max_gap_ms, sessions: HashMap::new() }
    }

    /// Session start for an identity, if one is open.
    pub fn session_start(&self, pubkey: &str) -> Option<u64> {
        self.sessions.get(pubkey).map(|s| s.started_at)
    }
}

impl ContinuityModel for SessionContinuity {
    fn continuity(&self, hb: &Heartbeat) -> f64 {
        if self.window_ms == 0 {
            return 1.0;
        }
        let Some(session) = self.sessions.get(&hb.device_pubkey) else {
            return 0.0;
        };
        let age_ms = hb.timestamp.saturating_sub(session.started_at) as f64;
        (age_ms / self.window_ms as f64).min(1.0)
    }

    fn observe(&mut self, hb: &Heartbeat) {
        let max_gap_ms = self.max_gap_ms;
        let session = self
            .sessions
            .entry(hb.device_pubkey.clone())
            .or_insert(Session { started_at: hb.timestamp, last_seen: hb.timestamp });

        if hb.timestamp.saturating_sub(session.last_seen) > max_gap_ms {
            debug!("Continuity session restarted for {}...", short_key(&hb.device_pubkey));
            session.started_at = hb.timestamp;
        }
        session.last_seen = session.last_seen.max(hb.timestamp);
    }

    fn prune(&mut self, now_ms: u64, max_idle_ms: u64) {
        self.sessions
            .retain(|_, s| now_ms.saturating_sub(s.last_seen) <= max_idle_ms);
    }
}

/// Serializable selection of a continuity strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ContinuityConfig {
    Fixed { value: f64 },
    Session { window_ms: u64, max_gap_ms: u64 },
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        ContinuityConfig::Fixed { value: 1.0 }
    }
}

impl ContinuityConfig {
    /// Five minutes of uninterrupted pulsing earns full continuity.
    pub fn session() -> Self {
        ContinuityConfig::Session { window_ms: 300_000, max_gap_ms: 60_000 }
    }

    pub fn build(&self) -> Box<dyn ContinuityModel> {
        match *self {
            ContinuityConfig::Fixed { value } => Box::new(FixedContinuity(value)),
            ContinuityConfig::Session { window_ms, max_gap_ms } => {
                Box::new(SessionContinuity::new(window_ms, max_gap_ms))
            }
        }
    }
}

/// Weight function bound to its coefficients and continuity strategy.
pub struct LivenessModel {
    params: WeightParams,
    continuity: Box<dyn ContinuityModel>,
}

impl LivenessModel {
    pub fn new(params: WeightParams, continuity: Box<dyn ContinuityModel>) -> Self {
        Self { params, continuity }
    }

    pub fn from_config(config: &ConsensusConfig) -> Self {
        Self::new(config.weights, config.continuity.build())
    }

    pub fn params(&self) -> &WeightParams {
        &self.params
    }

    /// `W_i = α·hr_norm + β·motion_norm + γ·continuity`
    pub fn weight(&self, hb: &Heartbeat) -> f64 {
        hb.weight_with_continuity(&self.params, self.continuity.continuity(hb))
    }

    pub fn observe(&mut self, hb: &Heartbeat) {
        self.continuity.observe(hb);
    }

    pub fn prune(&mut self, now_ms: u64, max_idle_ms: u64) {
        self.continuity.prune(now_ms, max_idle_ms);
    }
}

impl Default for LivenessModel {
    fn default() -> Self {
        Self::new(WeightParams::default(), Box::new(FixedContinuity::default()))
    }
}

pub(crate) fn short_key(pubkey: &str) -> &str {
    pubkey.get(..8).unwrap_or(pubkey)
}
