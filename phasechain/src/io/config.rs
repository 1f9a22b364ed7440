//! Chain configuration (TOML).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::repetition::DetectorSettings;
use crate::core::role_validator::{PatternRules, RoleConformanceValidator};
use crate::core::termination::TerminationSettings;
use crate::io::memory_store::MemorySettings;
use crate::phase::PhaseItem;

/// Phase chain configuration.
///
/// Loaded once at startup and immutable afterwards. Missing fields default to
/// the values the reliability layer was tuned with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChainConfig {
    /// Turn limit for simple phases whose `max_turn_step` is unset or `<= 0`.
    pub chat_turn_limit_default: u32,

    pub termination: TerminationSettings,

    pub detector: DetectorSettings,

    pub memory: MemorySettings,

    pub audit: AuditConfig,

    /// Global rules that take precedence over every role.
    pub overrides: PatternRules,

    /// Per-role allow/deny patterns.
    pub constraints: BTreeMap<String, PatternRules>,

    pub chain: Vec<PhaseItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory for JSONL audit files. Unset disables on-disk audit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chat_turn_limit_default: 10,
            termination: TerminationSettings::default(),
            detector: DetectorSettings::default(),
            memory: MemorySettings::default(),
            audit: AuditConfig::default(),
            overrides: PatternRules::default(),
            constraints: BTreeMap::new(),
            chain: Vec::new(),
        }
    }
}

impl ChainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chat_turn_limit_default == 0 {
            return Err(anyhow!("chat_turn_limit_default must be > 0"));
        }
        self.termination.validate()?;
        self.detector.validate()?;
        self.memory.validate()?;
        for (idx, item) in self.chain.iter().enumerate() {
            if item.phase().trim().is_empty() {
                return Err(anyhow!("chain[{idx}] has an empty phase name"));
            }
        }
        RoleConformanceValidator::new(&self.constraints, &self.overrides)?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ChainConfig::default()`.
pub fn load_config(path: &Path) -> Result<ChainConfig> {
    if !path.exists() {
        let cfg = ChainConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ChainConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ChainConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
