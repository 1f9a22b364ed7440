//! Logic behind the `phasechain` CLI commands.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use crate::core::clock::SystemClock;
use crate::io::config::{ChainConfig, load_config};
use crate::io::memory_store::{HybridMemoryStore, MemorySettings};

/// Summary printed by `phasechain validate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSummary {
    pub steps: usize,
    pub roles: usize,
    pub phases: Vec<String>,
}

/// Load and validate a chain config. Unlike `load_config`, a missing file is an error.
pub fn validate_config(path: &Path) -> Result<ConfigSummary> {
    if !path.exists() {
        return Err(anyhow!("config not found: {}", path.display()));
    }
    let cfg = load_config(path)?;
    Ok(summarize(&cfg))
}

fn summarize(cfg: &ChainConfig) -> ConfigSummary {
    ConfigSummary {
        steps: cfg.chain.len(),
        roles: cfg.constraints.len(),
        phases: cfg
            .chain
            .iter()
            .map(|item| format!("{} ({})", item.phase(), item.phase_type()))
            .collect(),
    }
}

/// One ranked memory match.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMatch {
    pub seq: u64,
    pub score: f64,
    pub role: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Empty,
    Matches(Vec<QueryMatch>),
}

fn open_store(store: &Path) -> Result<HybridMemoryStore> {
    let settings = MemorySettings {
        storage_path: Some(store.to_path_buf()),
        ..MemorySettings::default()
    };
    HybridMemoryStore::try_open(settings, Arc::new(SystemClock))
        .with_context(|| format!("open memory store {}", store.display()))
}

/// Rank the persisted log at `store` against `query`.
pub fn query_memory(store: &Path, query: &str, k: usize) -> Result<QueryOutcome> {
    let memory = open_store(store)?;
    let matches: Vec<QueryMatch> = memory
        .retrieve(query, k)
        .into_iter()
        .map(|hit| QueryMatch {
            seq: hit.entry.seq,
            score: hit.score,
            role: hit.entry.meta.get("role").cloned(),
            text: hit.entry.text.clone(),
        })
        .collect();
    if matches.is_empty() {
        return Ok(QueryOutcome::Empty);
    }
    Ok(QueryOutcome::Matches(matches))
}

/// Entry counts before and after `phasechain memory prune`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub before: usize,
    pub after: usize,
}

/// Keep only the newest `keep` entries of the persisted log at `store`.
pub fn prune_memory(store: &Path, keep: usize) -> Result<PruneReport> {
    let mut memory = open_store(store)?;
    let before = memory.long_term().len();
    memory.prune(keep)?;
    Ok(PruneReport {
        before,
        after: memory.long_term().len(),
    })
}
