//! Test-only helpers: scripted phase executors, a manual clock and config builders.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use crate::core::clock::Clock;
use crate::environment::Environment;
use crate::io::config::ChainConfig;
use crate::phase::{PhaseExecutor, PhaseItem, SimplePhaseItem};

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        let start = Utc
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }
}

impl ManualClock {
    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += TimeDelta::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One scripted step: agent -> action text.
pub type ScriptedActions = Vec<(&'static str, &'static str)>;

enum Script {
    Queue(RefCell<VecDeque<ScriptedActions>>),
    Repeat(ScriptedActions),
    Fail(String),
}

/// Phase executor that replays predetermined actions.
///
/// Records `(turn_limit, reflect)` for every call; optionally advances a
/// [`ManualClock`] per call to simulate slow phases.
pub struct ScriptedPhase {
    script: Script,
    calls: Rc<RefCell<Vec<(u32, bool)>>>,
    tick: Option<(ManualClock, i64)>,
}

impl ScriptedPhase {
    /// Returns each queued step once, then errors.
    pub fn new(steps: Vec<ScriptedActions>) -> Self {
        Self::with_script(Script::Queue(RefCell::new(steps.into())))
    }

    /// Returns the same actions on every call.
    pub fn repeating(actions: &[(&'static str, &'static str)]) -> Self {
        Self::with_script(Script::Repeat(actions.to_vec()))
    }

    /// Fails every call with `message`.
    pub fn failing(message: &str) -> Self {
        Self::with_script(Script::Fail(message.to_string()))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            calls: Rc::new(RefCell::new(Vec::new())),
            tick: None,
        }
    }

    /// Advance `clock` by `secs` on every call.
    pub fn advancing(mut self, clock: &ManualClock, secs: i64) -> Self {
        self.tick = Some((clock.clone(), secs));
        self
    }

    pub fn calls(&self) -> Rc<RefCell<Vec<(u32, bool)>>> {
        Rc::clone(&self.calls)
    }
}

impl PhaseExecutor for ScriptedPhase {
    fn execute(&self, env: &mut dyn Environment, turn_limit: u32, reflect: bool) -> Result<()> {
        self.calls.borrow_mut().push((turn_limit, reflect));
        if let Some((clock, secs)) = &self.tick {
            clock.advance_secs(*secs);
        }
        let actions = match &self.script {
            Script::Queue(queue) => queue
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| anyhow!("scripted phase exhausted"))?,
            Script::Repeat(actions) => actions.clone(),
            Script::Fail(message) => return Err(anyhow!("{message}")),
        };
        let last = env.last_actions_mut();
        for (agent, text) in actions {
            last.insert(agent.to_string(), text.to_string());
        }
        Ok(())
    }
}

/// Simple phase item with default turn budget.
pub fn simple_item(phase: &str) -> PhaseItem {
    PhaseItem::Simple(SimplePhaseItem {
        phase: phase.to_string(),
        max_turn_step: None,
        need_reflect: false,
    })
}

/// Config with the given chain, memory persisted under `dir`, audit under `dir/audit`.
pub fn chain_config(dir: &Path, chain: Vec<PhaseItem>) -> ChainConfig {
    let mut cfg = ChainConfig {
        chain,
        ..ChainConfig::default()
    };
    cfg.memory.storage_path = Some(dir.join("memory.json"));
    cfg.audit.dir = Some(dir.join("audit"));
    cfg
}

/// Role -> (allow, deny) constraint table for configs.
pub fn constraints(
    rules: &[(&str, &[&str], &[&str])],
) -> BTreeMap<String, crate::core::role_validator::PatternRules> {
    rules
        .iter()
        .map(|(role, allow, deny)| {
            (
                role.to_string(),
                crate::core::role_validator::PatternRules {
                    allow: allow.iter().map(|s| s.to_string()).collect(),
                    deny: deny.iter().map(|s| s.to_string()).collect(),
                },
            )
        })
        .collect()
}

/// Scratch directory for filesystem-backed tests.
pub fn scratch_dir() -> Result<tempfile::TempDir> {
    Ok(tempfile::tempdir()?)
}
