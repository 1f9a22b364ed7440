//! Per-agent repetition and cycle detection.
//!
//! Each agent has a bounded history of normalized action texts. Two checks run
//! against it, literal first:
//!
//! - **Literal**: the last `k` entries equal the `k` entries before them, for
//!   the smallest `k` in `min_cycle_len..=len/2`.
//! - **Semantic**: the newest entry's term-frequency cosine against the other
//!   entries of the trailing `2 * min_cycle_len` window reaches `sim_threshold`.

use std::collections::{BTreeMap, VecDeque};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::text::{TermVector, normalize};

/// Confidence at or above which a repeating agent is moved off the task.
pub const REASSIGN_CONFIDENCE: f64 = 0.95;
/// Longest cycle that is still answered by re-asking the same agent.
pub const REASK_MAX_CYCLE_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub window: usize,
    pub min_cycle_len: usize,
    pub sim_threshold: f64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            window: 16,
            min_cycle_len: 2,
            sim_threshold: 0.85,
        }
    }
}

impl DetectorSettings {
    pub fn validate(&self) -> Result<()> {
        if self.min_cycle_len == 0 {
            return Err(anyhow!("detector.min_cycle_len must be > 0"));
        }
        if self.window < 2 * self.min_cycle_len {
            return Err(anyhow!(
                "detector.window ({}) must hold two cycles of min_cycle_len ({})",
                self.window,
                self.min_cycle_len
            ));
        }
        if !(self.sim_threshold > 0.0 && self.sim_threshold <= 1.0) {
            return Err(anyhow!("detector.sim_threshold must be in (0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleKind {
    Literal,
    Semantic,
}

/// A detected repetition for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleInfo {
    pub agent: String,
    pub kind: CycleKind,
    pub cycle_len: usize,
    /// The repeating block (normalized), oldest first.
    pub sequence: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemediationAction {
    None,
    Reask,
    Reassign,
    Escalate,
}

/// Advisory follow-up for a detected cycle; callers decide whether to act.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    pub action: RemediationAction,
    pub reason: String,
}

impl Remediation {
    /// Map detector output to a remediation.
    pub fn for_cycle(cycle: Option<&CycleInfo>) -> Self {
        let Some(cycle) = cycle else {
            return Self {
                action: RemediationAction::None,
                reason: "no_cycle".to_string(),
            };
        };
        if cycle.cycle_len <= REASK_MAX_CYCLE_LEN && cycle.confidence < REASSIGN_CONFIDENCE {
            Self {
                action: RemediationAction::Reask,
                reason: "short_repeating_loop".to_string(),
            }
        } else if cycle.confidence >= REASSIGN_CONFIDENCE {
            Self {
                action: RemediationAction::Reassign,
                reason: "persistent_repetition".to_string(),
            }
        } else {
            Self {
                action: RemediationAction::Escalate,
                reason: "long_uncertain_loop".to_string(),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepetitionDetector {
    settings: DetectorSettings,
    histories: BTreeMap<String, VecDeque<String>>,
    observations: BTreeMap<String, u64>,
}

impl RepetitionDetector {
    pub fn new(settings: DetectorSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            histories: BTreeMap::new(),
            observations: BTreeMap::new(),
        })
    }

    /// Record a normalized observation, evicting the oldest on overflow.
    pub fn add_action(&mut self, agent: &str, text: &str) {
        let window = self.settings.window;
        let history = self
            .histories
            .entry(agent.to_string())
            .or_insert_with(|| VecDeque::with_capacity(window));
        if history.len() == window {
            history.pop_front();
        }
        history.push_back(normalize(text));
        *self.observations.entry(agent.to_string()).or_insert(0) += 1;
    }

    /// Total actions ever recorded for `agent`; unaffected by eviction and `reset`.
    pub fn observations(&self, agent: &str) -> u64 {
        self.observations.get(agent).copied().unwrap_or(0)
    }

    /// Normalized history for `agent`, oldest first.
    pub fn history(&self, agent: &str) -> Vec<&str> {
        self.histories
            .get(agent)
            .map(|h| h.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Forget `agent`'s history. The observation count is kept.
    pub fn reset(&mut self, agent: &str) {
        self.histories.remove(agent);
    }

    pub fn detect_cycle(&self, agent: &str) -> Option<CycleInfo> {
        let history: Vec<&str> = self.history(agent);
        let cycle = self
            .literal_cycle(agent, &history)
            .or_else(|| self.semantic_cycle(agent, &history));
        if let Some(cycle) = &cycle {
            debug!(
                agent,
                kind = ?cycle.kind,
                cycle_len = cycle.cycle_len,
                confidence = cycle.confidence,
                "repetition detected"
            );
        }
        cycle
    }

    /// Advisory remediation for `agent`'s current history.
    pub fn resolve(&self, agent: &str) -> Remediation {
        Remediation::for_cycle(self.detect_cycle(agent).as_ref())
    }

    fn literal_cycle(&self, agent: &str, history: &[&str]) -> Option<CycleInfo> {
        let len = history.len();
        (self.settings.min_cycle_len..=len / 2).find_map(|k| {
            let last = &history[len - k..];
            let prev = &history[len - 2 * k..len - k];
            (last == prev).then(|| CycleInfo {
                agent: agent.to_string(),
                kind: CycleKind::Literal,
                cycle_len: k,
                sequence: last.iter().map(|s| s.to_string()).collect(),
                confidence: 1.0,
            })
        })
    }

    fn semantic_cycle(&self, agent: &str, history: &[&str]) -> Option<CycleInfo> {
        let span = (2 * self.settings.min_cycle_len).min(history.len());
        if span < 2 {
            return None;
        }
        let window = &history[history.len() - span..];
        let (latest, prior) = window.split_last()?;
        let latest_vec = TermVector::from_text(latest);
        if latest_vec.is_empty() {
            return None;
        }
        let best = prior
            .iter()
            .map(|text| latest_vec.cosine(&TermVector::from_text(text)))
            .fold(0.0_f64, f64::max);
        (best >= self.settings.sim_threshold).then(|| CycleInfo {
            agent: agent.to_string(),
            kind: CycleKind::Semantic,
            cycle_len: 1,
            sequence: vec![latest.to_string()],
            confidence: best,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> RepetitionDetector {
        RepetitionDetector::new(DetectorSettings::default()).expect("settings")
    }

    #[test]
    fn alternating_pair_is_a_literal_cycle_of_two() {
        let mut d = detector();
        for text in ["plan the api", "write the tests", "plan the api", "write the tests"] {
            d.add_action("Coder", text);
        }
        let cycle = d.detect_cycle("Coder").expect("cycle");
        assert_eq!(cycle.kind, CycleKind::Literal);
        assert_eq!(cycle.cycle_len, 2);
        assert_eq!(cycle.confidence, 1.0);
        assert_eq!(cycle.sequence, vec!["plan the api", "write the tests"]);
    }

    #[test]
    fn single_entry_is_never_a_cycle() {
        let mut d = detector();
        d.add_action("Coder", "hello");
        assert_eq!(d.detect_cycle("Coder"), None);
        assert_eq!(d.detect_cycle("Nobody"), None);
    }

    #[test]
    fn near_duplicates_are_a_semantic_cycle() {
        let mut d = detector();
        d.add_action("Coder", "Let's write the login module");
        d.add_action("Coder", "let's write the login module!");
        let cycle = d.detect_cycle("Coder").expect("cycle");
        assert_eq!(cycle.kind, CycleKind::Semantic);
        assert_eq!(cycle.cycle_len, 1);
        assert!(cycle.confidence >= 0.85);
        assert_eq!(cycle.sequence, vec!["lets write the login module"]);
    }

    #[test]
    fn dissimilar_actions_are_not_a_cycle() {
        let mut d = detector();
        for text in ["design schema", "implement storage", "write docs", "ship release"] {
            d.add_action("Coder", text);
        }
        assert_eq!(d.detect_cycle("Coder"), None);
    }

    #[test]
    fn semantic_check_only_looks_at_the_trailing_window() {
        let mut d = detector();
        for text in [
            "compile the crate",
            "alpha",
            "beta",
            "gamma",
            "compile the crate",
        ] {
            d.add_action("Coder", text);
        }
        // Trailing window is the last four entries; the first repeat falls outside it.
        assert_eq!(d.detect_cycle("Coder"), None);
    }

    #[test]
    fn shortest_literal_cycle_wins() {
        let mut d = detector();
        for text in ["a", "b", "a", "b", "a", "b", "a", "b"] {
            d.add_action("Coder", text);
        }
        assert_eq!(d.detect_cycle("Coder").expect("cycle").cycle_len, 2);
    }

    #[test]
    fn history_is_bounded_and_per_agent() {
        let settings = DetectorSettings {
            window: 4,
            min_cycle_len: 2,
            sim_threshold: 0.85,
        };
        let mut d = RepetitionDetector::new(settings).expect("settings");
        for i in 0..6 {
            d.add_action("Coder", &format!("step {i}"));
        }
        d.add_action("Tester", "Other");
        assert_eq!(d.history("Coder"), vec!["step 2", "step 3", "step 4", "step 5"]);
        assert_eq!(d.history("Tester"), vec!["other"]);
        d.reset("Coder");
        assert!(d.history("Coder").is_empty());
    }

    #[test]
    fn resolve_maps_cycles_to_remediations() {
        let cycle = |cycle_len, confidence| CycleInfo {
            agent: "Coder".to_string(),
            kind: CycleKind::Semantic,
            cycle_len,
            sequence: Vec::new(),
            confidence,
        };
        assert_eq!(Remediation::for_cycle(None).action, RemediationAction::None);
        assert_eq!(
            Remediation::for_cycle(Some(&cycle(1, 0.9))).action,
            RemediationAction::Reask
        );
        assert_eq!(
            Remediation::for_cycle(Some(&cycle(2, 1.0))).action,
            RemediationAction::Reassign
        );
        assert_eq!(
            Remediation::for_cycle(Some(&cycle(5, 0.9))).action,
            RemediationAction::Escalate
        );

        let mut d = detector();
        assert_eq!(d.resolve("Coder").action, RemediationAction::None);
        d.add_action("Coder", "same");
        d.add_action("Coder", "same");
        assert_eq!(d.resolve("Coder").action, RemediationAction::Reassign);
    }

    #[test]
    fn settings_are_validated() {
        let bad = DetectorSettings {
            window: 3,
            min_cycle_len: 2,
            sim_threshold: 0.85,
        };
        assert!(RepetitionDetector::new(bad).is_err());
        let bad = DetectorSettings {
            sim_threshold: 0.0,
            ..DetectorSettings::default()
        };
        assert!(RepetitionDetector::new(bad).is_err());
    }
}
