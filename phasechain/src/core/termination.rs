//! Multi-criteria termination.
//!
//! Called exactly once per orchestrator step. Criteria are evaluated in order
//! and the first match wins: step budget, idle time, persistent per-agent
//! cycles, then the environment's success flag. Every evaluation is audited.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::clock::Clock;
use crate::core::repetition::RepetitionDetector;
use crate::environment::Environment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminationSettings {
    pub max_steps: u64,
    pub idle_threshold_secs: u64,
    pub cycle_limit: u32,
    /// Reset an agent's cycle hits after this many consecutive cycle-free
    /// actions. Unset keeps hits for the controller's lifetime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_hit_decay_steps: Option<u32>,
}

impl Default for TerminationSettings {
    fn default() -> Self {
        Self {
            max_steps: 500,
            idle_threshold_secs: 300,
            cycle_limit: 3,
            cycle_hit_decay_steps: None,
        }
    }
}

impl TerminationSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("termination.max_steps must be > 0"));
        }
        if self.idle_threshold_secs == 0 {
            return Err(anyhow!("termination.idle_threshold_secs must be > 0"));
        }
        if self.idle_threshold().is_none() {
            return Err(anyhow!(
                "termination.idle_threshold_secs ({}) exceeds the representable duration",
                self.idle_threshold_secs
            ));
        }
        if self.cycle_limit == 0 {
            return Err(anyhow!("termination.cycle_limit must be > 0"));
        }
        if self.cycle_hit_decay_steps == Some(0) {
            return Err(anyhow!("termination.cycle_hit_decay_steps must be > 0 when set"));
        }
        Ok(())
    }

    fn idle_threshold(&self) -> Option<TimeDelta> {
        i64::try_from(self.idle_threshold_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationDecision {
    pub terminate: bool,
    /// `max_steps`, `idle_<secs>s`, `persistent_cycles_<agent>`, `success` or `continue`.
    pub reason: String,
    pub step: u64,
}

/// Audit entry for one `maybe_terminate` evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationAuditRecord {
    pub timestamp: DateTime<Utc>,
    pub decision: TerminationDecision,
    pub cycle_hits: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationState {
    pub step_count: u64,
    pub last_progress: DateTime<Utc>,
    pub cycle_hits: BTreeMap<String, u32>,
    clean_streaks: BTreeMap<String, u32>,
    /// Detector observation count per agent at the previous evaluation.
    observed: BTreeMap<String, u64>,
}

pub struct DynamicTerminationController {
    settings: TerminationSettings,
    clock: Arc<dyn Clock>,
    state: TerminationState,
    audit: Vec<TerminationAuditRecord>,
}

impl DynamicTerminationController {
    pub fn new(settings: TerminationSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        settings.validate()?;
        let state = TerminationState {
            step_count: 0,
            last_progress: clock.now(),
            cycle_hits: BTreeMap::new(),
            clean_streaks: BTreeMap::new(),
            observed: BTreeMap::new(),
        };
        Ok(Self {
            settings,
            clock,
            state,
            audit: Vec::new(),
        })
    }

    pub fn state(&self) -> &TerminationState {
        &self.state
    }

    pub fn audit_log(&self) -> &[TerminationAuditRecord] {
        &self.audit
    }

    pub fn maybe_terminate<E: Environment + ?Sized>(
        &mut self,
        env: &E,
        detector: &RepetitionDetector,
    ) -> TerminationDecision {
        self.state.step_count += 1;
        let now = self.clock.now();
        let reason = self.evaluate(env, detector, now);
        let decision = TerminationDecision {
            terminate: reason.is_some(),
            reason: reason.unwrap_or_else(|| "continue".to_string()),
            step: self.state.step_count,
        };
        if decision.terminate {
            info!(step = decision.step, reason = %decision.reason, "termination triggered");
        } else {
            debug!(step = decision.step, "continue");
        }
        self.audit.push(TerminationAuditRecord {
            timestamp: now,
            decision: decision.clone(),
            cycle_hits: self.state.cycle_hits.clone(),
        });
        decision
    }

    fn evaluate<E: Environment + ?Sized>(
        &mut self,
        env: &E,
        detector: &RepetitionDetector,
        now: DateTime<Utc>,
    ) -> Option<String> {
        if self.state.step_count >= self.settings.max_steps {
            return Some("max_steps".to_string());
        }

        let idle = now - self.state.last_progress;
        if let Some(threshold) = self.settings.idle_threshold() {
            if idle > threshold {
                return Some(format!("idle_{}s", idle.num_seconds()));
            }
        }

        let acting: Vec<&str> = env
            .last_actions()
            .iter()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(agent, _)| agent.as_str())
            .collect();
        for agent in &acting {
            // Only agents whose action reached the detector this step are judged.
            let observed = detector.observations(agent);
            let previous = self.state.observed.insert(agent.to_string(), observed);
            if previous == Some(observed) || observed == 0 {
                continue;
            }
            if detector.detect_cycle(agent).is_some() {
                self.state.clean_streaks.remove(*agent);
                let hits = self.state.cycle_hits.entry(agent.to_string()).or_insert(0);
                *hits += 1;
                debug!(agent, hits = *hits, limit = self.settings.cycle_limit, "cycle hit");
                if *hits >= self.settings.cycle_limit {
                    return Some(format!("persistent_cycles_{agent}"));
                }
            } else {
                self.record_clean_action(agent);
            }
        }

        if env.task_success() {
            return Some("success".to_string());
        }

        if !acting.is_empty() {
            self.state.last_progress = now;
        }
        None
    }

    fn record_clean_action(&mut self, agent: &str) {
        let Some(decay) = self.settings.cycle_hit_decay_steps else {
            return;
        };
        let streak = self.state.clean_streaks.entry(agent.to_string()).or_insert(0);
        *streak += 1;
        if *streak >= decay {
            self.state.clean_streaks.remove(agent);
            if self.state.cycle_hits.remove(agent).is_some() {
                debug!(agent, "cycle hits expired");
            }
        }
    }
}
