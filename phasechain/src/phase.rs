//! Phase chain items, executor capabilities and the phase registry.
//!
//! Executors are external collaborators: they run one phase against the
//! environment and leave the step's per-agent actions in `last_actions`. The
//! registry maps configured phase names to executors and is validated against
//! the chain before anything runs.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::types::PhaseType;
use crate::environment::Environment;

/// A simple phase entry (also the unit of a composed phase's composition).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimplePhaseItem {
    pub phase: String,
    /// Turn budget; unset or `<= 0` falls back to the chain default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turn_step: Option<i64>,
    #[serde(default)]
    pub need_reflect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedPhaseItem {
    pub phase: String,
    pub cycle_num: u32,
    pub composition: Vec<SimplePhaseItem>,
}

/// One configured step of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase_type", rename_all = "lowercase")]
pub enum PhaseItem {
    Simple(SimplePhaseItem),
    Composed(ComposedPhaseItem),
}

impl PhaseItem {
    pub fn phase(&self) -> &str {
        match self {
            Self::Simple(item) => &item.phase,
            Self::Composed(item) => &item.phase,
        }
    }

    pub fn phase_type(&self) -> PhaseType {
        match self {
            Self::Simple(_) => PhaseType::Simple,
            Self::Composed(_) => PhaseType::Composed,
        }
    }
}

impl SimplePhaseItem {
    pub fn turn_limit(&self, default_limit: u32) -> u32 {
        match self.max_turn_step {
            Some(limit) if limit > 0 => u32::try_from(limit).unwrap_or(u32::MAX),
            _ => default_limit,
        }
    }
}

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("{phase_type} phase '{phase}' is not registered")]
    UnknownPhase { phase: String, phase_type: PhaseType },
    #[error("phase '{phase}' failed")]
    Execution {
        phase: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Runs one simple phase for at most `turn_limit` turns.
pub trait PhaseExecutor {
    fn execute(&self, env: &mut dyn Environment, turn_limit: u32, reflect: bool) -> Result<()>;
}

/// Inputs for a composed phase run.
pub struct ComposedRun<'a> {
    pub cycle_num: u32,
    pub composition: &'a [SimplePhaseItem],
    pub phases: &'a SimplePhases,
    pub default_turn_limit: u32,
}

/// Runs a nested cycle over a sub-composition of simple phases.
pub trait ComposedPhaseExecutor {
    fn execute(&self, env: &mut dyn Environment, run: ComposedRun<'_>) -> Result<()>;
}

/// Registered simple phases by name.
#[derive(Default)]
pub struct SimplePhases {
    executors: BTreeMap<String, Box<dyn PhaseExecutor>>,
}

impl SimplePhases {
    pub fn contains(&self, phase: &str) -> bool {
        self.executors.contains_key(phase)
    }

    /// Run `item`, resolving its turn limit against `default_turn_limit`.
    pub fn run(
        &self,
        env: &mut dyn Environment,
        item: &SimplePhaseItem,
        default_turn_limit: u32,
    ) -> Result<(), PhaseError> {
        let executor = self
            .executors
            .get(&item.phase)
            .ok_or_else(|| PhaseError::UnknownPhase {
                phase: item.phase.clone(),
                phase_type: PhaseType::Simple,
            })?;
        let turn_limit = item.turn_limit(default_turn_limit);
        debug!(
            phase = %item.phase,
            turn_limit,
            reflect = item.need_reflect,
            "running simple phase"
        );
        executor
            .execute(env, turn_limit, item.need_reflect)
            .map_err(|source| PhaseError::Execution {
                phase: item.phase.clone(),
                source,
            })
    }
}

#[derive(Default)]
pub struct PhaseRegistry {
    simple: SimplePhases,
    composed: BTreeMap<String, Box<dyn ComposedPhaseExecutor>>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_simple(
        &mut self,
        phase: &str,
        executor: impl PhaseExecutor + 'static,
    ) -> &mut Self {
        self.simple
            .executors
            .insert(phase.to_string(), Box::new(executor));
        self
    }

    pub fn register_composed(
        &mut self,
        phase: &str,
        executor: impl ComposedPhaseExecutor + 'static,
    ) -> &mut Self {
        self.composed.insert(phase.to_string(), Box::new(executor));
        self
    }

    /// Every phase the chain references, composition members included, must be registered.
    pub fn validate_chain(&self, chain: &[PhaseItem]) -> Result<(), PhaseError> {
        for item in chain {
            match item {
                PhaseItem::Simple(simple) => self.require_simple(&simple.phase)?,
                PhaseItem::Composed(composed) => {
                    if !self.composed.contains_key(&composed.phase) {
                        return Err(PhaseError::UnknownPhase {
                            phase: composed.phase.clone(),
                            phase_type: PhaseType::Composed,
                        });
                    }
                    for member in &composed.composition {
                        self.require_simple(&member.phase)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn require_simple(&self, phase: &str) -> Result<(), PhaseError> {
        if self.simple.contains(phase) {
            return Ok(());
        }
        Err(PhaseError::UnknownPhase {
            phase: phase.to_string(),
            phase_type: PhaseType::Simple,
        })
    }

    /// Dispatch `item` to its executor.
    #[instrument(skip_all, fields(phase = %item.phase(), phase_type = %item.phase_type()))]
    pub fn execute(
        &self,
        env: &mut dyn Environment,
        item: &PhaseItem,
        default_turn_limit: u32,
    ) -> Result<(), PhaseError> {
        match item {
            PhaseItem::Simple(simple) => self.simple.run(env, simple, default_turn_limit),
            PhaseItem::Composed(composed) => {
                let executor =
                    self.composed
                        .get(&composed.phase)
                        .ok_or_else(|| PhaseError::UnknownPhase {
                            phase: composed.phase.clone(),
                            phase_type: PhaseType::Composed,
                        })?;
                let run = ComposedRun {
                    cycle_num: composed.cycle_num,
                    composition: &composed.composition,
                    phases: &self.simple,
                    default_turn_limit,
                };
                executor
                    .execute(env, run)
                    .map_err(|source| PhaseError::Execution {
                        phase: composed.phase.clone(),
                        source,
                    })
            }
        }
    }
}

/// Composed phase that repeats its composition `cycle_num` times.
///
/// The step's actions are the latest action of every agent seen across the
/// nested runs. Stops early once the environment is terminated. When a
/// member fails, the actions gathered so far are still left in the
/// environment before the error is returned.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleComposedPhase;

impl ComposedPhaseExecutor for CycleComposedPhase {
    fn execute(&self, env: &mut dyn Environment, run: ComposedRun<'_>) -> Result<()> {
        let mut merged = BTreeMap::new();
        let result = run_cycles(env, &run, &mut merged);
        *env.last_actions_mut() = merged;
        result.map_err(Into::into)
    }
}

fn run_cycles(
    env: &mut dyn Environment,
    run: &ComposedRun<'_>,
    merged: &mut BTreeMap<String, String>,
) -> Result<(), PhaseError> {
    for cycle in 0..run.cycle_num {
        for item in run.composition {
            debug!(cycle, phase = %item.phase, "composed cycle member");
            env.last_actions_mut().clear();
            let outcome = run.phases.run(env, item, run.default_turn_limit);
            merged.extend(
                env.last_actions()
                    .iter()
                    .filter(|(_, text)| !text.trim().is_empty())
                    .map(|(agent, text)| (agent.clone(), text.clone())),
            );
            outcome?;
            if env.is_terminated() {
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ChatEnvironment;
    use crate::test_support::ScriptedPhase;

    fn simple(phase: &str, max_turn_step: Option<i64>) -> SimplePhaseItem {
        SimplePhaseItem {
            phase: phase.to_string(),
            max_turn_step,
            need_reflect: false,
        }
    }

    #[test]
    fn turn_limit_falls_back_when_unset_or_non_positive() {
        assert_eq!(simple("A", None).turn_limit(10), 10);
        assert_eq!(simple("A", Some(0)).turn_limit(10), 10);
        assert_eq!(simple("A", Some(-3)).turn_limit(10), 10);
        assert_eq!(simple("A", Some(4)).turn_limit(10), 4);
    }

    #[test]
    fn executor_receives_resolved_limit_and_reflect_flag() {
        let phase = ScriptedPhase::repeating(&[("Coder", "code")]);
        let calls = phase.calls();
        let mut registry = PhaseRegistry::new();
        registry.register_simple("Coding", phase);

        let mut env = ChatEnvironment::new();
        let item = PhaseItem::Simple(SimplePhaseItem {
            phase: "Coding".to_string(),
            max_turn_step: Some(-1),
            need_reflect: true,
        });
        registry.execute(&mut env, &item, 7).expect("execute");

        assert_eq!(calls.borrow().as_slice(), &[(7, true)]);
        assert_eq!(env.last_actions.get("Coder").map(String::as_str), Some("code"));
    }

    #[test]
    fn validate_chain_reports_unknown_names() {
        let mut registry = PhaseRegistry::new();
        registry.register_simple("Coding", ScriptedPhase::repeating(&[]));
        registry.register_composed("Review", CycleComposedPhase);

        let ok = vec![
            PhaseItem::Simple(simple("Coding", None)),
            PhaseItem::Composed(ComposedPhaseItem {
                phase: "Review".to_string(),
                cycle_num: 2,
                composition: vec![simple("Coding", None)],
            }),
        ];
        registry.validate_chain(&ok).expect("valid chain");

        let missing_member = vec![PhaseItem::Composed(ComposedPhaseItem {
            phase: "Review".to_string(),
            cycle_num: 1,
            composition: vec![simple("Testing", None)],
        })];
        let err = registry.validate_chain(&missing_member).expect_err("unknown");
        assert_eq!(err.to_string(), "simple phase 'Testing' is not registered");

        let missing_composed = vec![PhaseItem::Composed(ComposedPhaseItem {
            phase: "Nope".to_string(),
            cycle_num: 1,
            composition: Vec::new(),
        })];
        let err = registry.validate_chain(&missing_composed).expect_err("unknown");
        assert_eq!(err.to_string(), "composed phase 'Nope' is not registered");
    }

    #[test]
    fn composed_phase_cycles_and_merges_actions() {
        let coding = ScriptedPhase::new(vec![
            vec![("Coder", "draft 1")],
            vec![("Coder", "draft 2")],
        ]);
        let coding_calls = coding.calls();
        let review = ScriptedPhase::repeating(&[("Reviewer", "looks fine")]);

        let mut registry = PhaseRegistry::new();
        registry
            .register_simple("Coding", coding)
            .register_simple("CodeReview", review)
            .register_composed("CodeReviewCycle", CycleComposedPhase);

        let item = PhaseItem::Composed(ComposedPhaseItem {
            phase: "CodeReviewCycle".to_string(),
            cycle_num: 2,
            composition: vec![simple("Coding", Some(3)), simple("CodeReview", None)],
        });
        let mut env = ChatEnvironment::new();
        registry.execute(&mut env, &item, 10).expect("execute");

        assert_eq!(coding_calls.borrow().len(), 2);
        assert_eq!(env.last_actions.get("Coder").map(String::as_str), Some("draft 2"));
        assert_eq!(
            env.last_actions.get("Reviewer").map(String::as_str),
            Some("looks fine")
        );
    }

    #[test]
    fn composed_failure_keeps_actions_from_earlier_members() {
        let mut registry = PhaseRegistry::new();
        registry
            .register_simple("Coding", ScriptedPhase::repeating(&[("Coder", "draft")]))
            .register_simple("CodeReview", ScriptedPhase::failing("reviewer timed out"))
            .register_composed("CodeReviewCycle", CycleComposedPhase);

        let item = PhaseItem::Composed(ComposedPhaseItem {
            phase: "CodeReviewCycle".to_string(),
            cycle_num: 2,
            composition: vec![simple("Coding", None), simple("CodeReview", None)],
        });
        let mut env = ChatEnvironment::new();
        let err = registry
            .execute(&mut env, &item, 10)
            .expect_err("member failure");

        assert_eq!(
            format!("{:#}", anyhow::Error::from(err)),
            "phase 'CodeReviewCycle' failed: phase 'CodeReview' failed: reviewer timed out"
        );
        assert_eq!(env.last_actions.get("Coder").map(String::as_str), Some("draft"));
    }

    #[test]
    fn executor_failures_are_wrapped_with_the_phase_name() {
        let mut registry = PhaseRegistry::new();
        registry.register_simple("Coding", ScriptedPhase::failing("model unavailable"));
        let mut env = ChatEnvironment::new();
        let err = registry
            .execute(&mut env, &PhaseItem::Simple(simple("Coding", None)), 10)
            .expect_err("failure");
        assert!(matches!(err, PhaseError::Execution { .. }));
        assert_eq!(
            format!("{:#}", anyhow::Error::from(err)),
            "phase 'Coding' failed: model unavailable"
        );
    }

    #[test]
    fn chain_items_parse_from_tagged_toml() {
        #[derive(Deserialize)]
        struct Doc {
            chain: Vec<PhaseItem>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[chain]]
            phase_type = "simple"
            phase = "DemandAnalysis"
            max_turn_step = -1

            [[chain]]
            phase_type = "composed"
            phase = "CodeCompleteAll"
            cycle_num = 3
            composition = [{ phase = "CodeComplete", need_reflect = true }]
            "#,
        )
        .expect("parse");
        assert_eq!(doc.chain[0].phase(), "DemandAnalysis");
        assert_eq!(doc.chain[1].phase_type(), PhaseType::Composed);
        let PhaseItem::Composed(composed) = &doc.chain[1] else {
            panic!("expected composed item");
        };
        assert!(composed.composition[0].need_reflect);
    }
}
