//! Shared environment threaded through every phase step.
//!
//! Phase executors write the per-agent actions of the step they ran into
//! `last_actions`; the orchestrator reads them, flips `terminated`, and appends
//! one [`StepTelemetry`] per step to the telemetry log.

use std::collections::BTreeMap;

use tracing::info;

use crate::core::types::StepTelemetry;

pub trait Environment {
    /// Collaborator-facing log line.
    fn log(&mut self, message: &str);

    /// Agent -> action text for the step just run.
    fn last_actions(&self) -> &BTreeMap<String, String>;

    fn last_actions_mut(&mut self) -> &mut BTreeMap<String, String>;

    fn is_terminated(&self) -> bool;

    fn set_terminated(&mut self, terminated: bool);

    /// External success signal; `false` when the collaborator never sets one.
    fn task_success(&self) -> bool {
        false
    }

    /// Append-only; entries are never mutated once recorded.
    fn record_telemetry(&mut self, telemetry: StepTelemetry);

    fn telemetry_log(&self) -> &[StepTelemetry];
}

/// In-process environment used by the orchestrator and tests.
#[derive(Debug, Clone, Default)]
pub struct ChatEnvironment {
    pub last_actions: BTreeMap<String, String>,
    pub terminated: bool,
    pub task_success: bool,
    messages: Vec<String>,
    telemetry: Vec<StepTelemetry>,
}

impl ChatEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

impl Environment for ChatEnvironment {
    fn log(&mut self, message: &str) {
        info!(target: "phasechain::env", "{message}");
        self.messages.push(message.to_string());
    }

    fn last_actions(&self) -> &BTreeMap<String, String> {
        &self.last_actions
    }

    fn last_actions_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.last_actions
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn set_terminated(&mut self, terminated: bool) {
        self.terminated = terminated;
    }

    fn task_success(&self) -> bool {
        self.task_success
    }

    fn record_telemetry(&mut self, telemetry: StepTelemetry) {
        self.telemetry.push(telemetry);
    }

    fn telemetry_log(&self) -> &[StepTelemetry] {
        &self.telemetry
    }
}
