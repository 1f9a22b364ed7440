//! Phase chain orchestration.
//!
//! Runs the configured chain one step at a time. Each step delegates to the
//! phase executor, passes every non-empty agent action through role
//! validation, memory and repetition tracking, then asks the termination
//! controller once whether to stop. The chain ends at the first terminated
//! step or when it is exhausted; both are terminal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::clock::Clock;
use crate::core::repetition::{Remediation, RepetitionDetector};
use crate::core::role_validator::RoleConformanceValidator;
use crate::core::termination::DynamicTerminationController;
use crate::core::types::{ActionRecord, Decision, StepTelemetry};
use crate::environment::Environment;
use crate::io::audit::{AuditPaths, append_records};
use crate::io::config::ChainConfig;
use crate::io::memory_store::HybridMemoryStore;
use crate::phase::{PhaseItem, PhaseRegistry};

/// Result of a single step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub phase: String,
    pub terminated: bool,
    pub telemetry: StepTelemetry,
    /// Long-term memory entries after the step.
    pub memory_size: usize,
    pub last_actions: BTreeMap<String, String>,
}

/// Why `run_chain` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStop {
    /// The termination controller stopped the chain after `phase`.
    Terminated { phase: String, reason: String },
    /// Every configured step ran.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutcome {
    pub steps_executed: u32,
    pub stop: ChainStop,
}

struct AuditSink {
    paths: AuditPaths,
    validation_flushed: usize,
    termination_flushed: usize,
}

pub struct PhaseOrchestrator<E: Environment> {
    chain: Vec<PhaseItem>,
    registry: PhaseRegistry,
    validator: RoleConformanceValidator,
    detector: RepetitionDetector,
    memory: HybridMemoryStore,
    termination: DynamicTerminationController,
    clock: Arc<dyn Clock>,
    default_turn_limit: u32,
    audit: Option<AuditSink>,
    env: E,
}

impl<E: Environment> PhaseOrchestrator<E> {
    /// Build every component from `config`, failing fast on invalid config or
    /// chain phases missing from `registry`.
    pub fn new(
        config: &ChainConfig,
        registry: PhaseRegistry,
        env: E,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        registry
            .validate_chain(&config.chain)
            .context("validate phase chain")?;

        let validator = RoleConformanceValidator::new(&config.constraints, &config.overrides)?;
        let detector = RepetitionDetector::new(config.detector)?;
        let termination = DynamicTerminationController::new(config.termination, clock.clone())?;
        let memory = HybridMemoryStore::open(config.memory.clone(), clock.clone());
        let audit = config.audit.dir.as_deref().map(|dir| AuditSink {
            paths: AuditPaths::new(dir),
            validation_flushed: 0,
            termination_flushed: 0,
        });
        info!(steps = config.chain.len(), "phase orchestrator ready");

        Ok(Self {
            chain: config.chain.clone(),
            registry,
            validator,
            detector,
            memory,
            termination,
            clock,
            default_turn_limit: config.chat_turn_limit_default,
            audit,
            env,
        })
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    pub fn validator(&self) -> &RoleConformanceValidator {
        &self.validator
    }

    /// Mutable access for registering overrides between steps.
    pub fn validator_mut(&mut self) -> &mut RoleConformanceValidator {
        &mut self.validator
    }

    pub fn detector(&self) -> &RepetitionDetector {
        &self.detector
    }

    pub fn memory(&self) -> &HybridMemoryStore {
        &self.memory
    }

    pub fn termination(&self) -> &DynamicTerminationController {
        &self.termination
    }

    /// Run the whole chain, stopping at the first terminated step.
    pub fn execute_chain(&mut self) -> ChainOutcome {
        self.run_chain(|_| {})
    }

    /// Like [`Self::execute_chain`], calling `on_step` after every step.
    pub fn run_chain<F: FnMut(&StepOutcome)>(&mut self, mut on_step: F) -> ChainOutcome {
        let chain = self.chain.clone();
        let mut steps_executed = 0u32;
        for item in &chain {
            let step = self.execute_step(item);
            steps_executed += 1;
            on_step(&step);
            if step.terminated {
                let reason = step
                    .telemetry
                    .termination()
                    .map(|decision| decision.reason.clone())
                    .unwrap_or_default();
                return ChainOutcome {
                    steps_executed,
                    stop: ChainStop::Terminated {
                        phase: step.phase,
                        reason,
                    },
                };
            }
        }
        ChainOutcome {
            steps_executed,
            stop: ChainStop::Exhausted,
        }
    }

    /// Execute one phase item with the reliability checks around it.
    ///
    /// Never fails: phase errors are captured in the step telemetry.
    #[instrument(skip_all, fields(phase = %item.phase(), phase_type = %item.phase_type()))]
    pub fn execute_step(&mut self, item: &PhaseItem) -> StepOutcome {
        let started = Instant::now();
        let phase = item.phase().to_string();
        let phase_type = item.phase_type();
        let mut telemetry = StepTelemetry::new(&phase, phase_type, self.clock.now());

        // Actions from a previous step must never be re-processed.
        self.env.last_actions_mut().clear();
        if let Err(err) = self
            .registry
            .execute(&mut self.env, item, self.default_turn_limit)
        {
            let message = format!("{:#}", anyhow::Error::from(err));
            warn!(error = %message, "phase execution failed");
            self.env
                .log(&format!("[ERROR] Phase execution failed: {message}"));
            telemetry.error = Some(message);
        }

        let actions: Vec<(String, String)> = self
            .env
            .last_actions()
            .iter()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(role, text)| (role.clone(), text.clone()))
            .collect();

        for (role, text) in actions {
            let record = self.validator.enforce(&role, &text);
            telemetry.decisions.push(Decision::RoleValidator {
                role: role.clone(),
                ok: record.ok,
                reason: record.reason.clone(),
                guidance: record.guidance.clone(),
            });
            if !record.ok {
                self.env
                    .log(&format!("[RoleValidator] {role}: {}", record.reason));
                continue;
            }

            let meta = BTreeMap::from([
                ("role".to_string(), role.clone()),
                ("phase".to_string(), phase.clone()),
                ("phase_type".to_string(), phase_type.to_string()),
            ]);
            let memory_decision = match self.memory.write(&text, meta, true) {
                Ok(()) => Decision::Memory {
                    role: role.clone(),
                    persisted: true,
                    error: None,
                },
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(
                        role = %role,
                        error = %message,
                        "memory persistence failed; continuing in-memory"
                    );
                    Decision::Memory {
                        role: role.clone(),
                        persisted: false,
                        error: Some(message),
                    }
                }
            };
            telemetry.decisions.push(memory_decision);

            self.detector.add_action(&role, &text);
            if let Some(cycle) = self.detector.detect_cycle(&role) {
                self.env.log(&format!(
                    "[CycleDetector] {role} loop: len={} conf={:.2}",
                    cycle.cycle_len, cycle.confidence
                ));
                let remediation = Remediation::for_cycle(Some(&cycle));
                telemetry.decisions.push(Decision::CycleDetector {
                    role: role.clone(),
                    cycle,
                    remediation,
                });
            }

            telemetry.actions.push(ActionRecord {
                role,
                text,
                timestamp: self.clock.now(),
                phase: phase.clone(),
                phase_type,
            });
        }

        let decision = self.termination.maybe_terminate(&self.env, &self.detector);
        if decision.terminate {
            self.env
                .log(&format!("[Termination] triggered: {}", decision.reason));
            self.env.set_terminated(true);
            telemetry.terminated = true;
        }
        telemetry.decisions.push(Decision::Termination { decision });
        telemetry.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.flush_audit(&telemetry);
        self.env.record_telemetry(telemetry.clone());
        debug!(
            actions = telemetry.actions.len(),
            decisions = telemetry.decisions.len(),
            terminated = telemetry.terminated,
            "step complete"
        );

        StepOutcome {
            phase,
            terminated: telemetry.terminated,
            telemetry,
            memory_size: self.memory.long_term().len(),
            last_actions: self.env.last_actions().clone(),
        }
    }

    fn flush_audit(&mut self, telemetry: &StepTelemetry) {
        let Some(sink) = self.audit.as_mut() else {
            return;
        };
        let validation = &self.validator.decisions()[sink.validation_flushed..];
        let termination = &self.termination.audit_log()[sink.termination_flushed..];
        let result = append_records(&sink.paths.telemetry_path, std::slice::from_ref(telemetry))
            .and_then(|()| append_records(&sink.paths.validation_path, validation))
            .and_then(|()| append_records(&sink.paths.termination_path, termination));
        match result {
            Ok(()) => {
                sink.validation_flushed += validation.len();
                sink.termination_flushed += termination.len();
            }
            Err(err) => {
                warn!(
                    dir = %sink.paths.dir.display(),
                    error = %format!("{err:#}"),
                    "audit append failed"
                );
            }
        }
    }
}
