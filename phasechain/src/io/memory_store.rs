//! Hybrid short/long-term memory with a persisted JSON log.
//!
//! Every write lands in a bounded short-term ring. Persisted writes also append
//! to the long-term log, which is rewritten in full on disk (temp file +
//! rename). Durability is best-effort: the in-memory state stays authoritative
//! and persistence failures are returned to the caller, never rolled back.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::clock::Clock;
use crate::core::text::{InverseDocumentFrequency, TermVector, term_set};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub short_window: usize,
    /// Location of the long-term log. Unset keeps long-term memory in-process only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,
    /// Prune the long-term log to this many entries on open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_long_term: Option<usize>,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            short_window: 50,
            storage_path: None,
            max_long_term: None,
        }
    }
}

impl MemorySettings {
    pub fn validate(&self) -> Result<()> {
        if self.short_window == 0 {
            return Err(anyhow!("memory.short_window must be > 0"));
        }
        if self.max_long_term == Some(0) {
            return Err(anyhow!("memory.max_long_term must be > 0 when set"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Store-wide sequence number; unique across reloads.
    pub seq: u64,
    pub text: String,
    pub meta: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    /// Normalized, deduplicated terms of `text`.
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedEntry<'a> {
    pub entry: &'a MemoryEntry,
    pub score: f64,
}

pub struct HybridMemoryStore {
    settings: MemorySettings,
    clock: Arc<dyn Clock>,
    short_term: VecDeque<MemoryEntry>,
    long_term: Vec<MemoryEntry>,
    next_seq: u64,
}

impl HybridMemoryStore {
    /// Open the store, treating an unreadable log as empty.
    pub fn open(settings: MemorySettings, clock: Arc<dyn Clock>) -> Self {
        let long_term = match settings.storage_path.as_deref() {
            Some(path) => load_long_term(path).unwrap_or_else(|err| {
                warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "memory log unreadable; starting empty"
                );
                Vec::new()
            }),
            None => Vec::new(),
        };
        let mut store = Self::with_long_term(settings, clock, long_term);
        store.prune_on_open();
        store
    }

    /// Open the store, failing if an existing log cannot be read.
    pub fn try_open(settings: MemorySettings, clock: Arc<dyn Clock>) -> Result<Self> {
        let long_term = match settings.storage_path.as_deref() {
            Some(path) => load_long_term(path)?,
            None => Vec::new(),
        };
        let mut store = Self::with_long_term(settings, clock, long_term);
        store.prune_on_open();
        Ok(store)
    }

    fn with_long_term(
        settings: MemorySettings,
        clock: Arc<dyn Clock>,
        long_term: Vec<MemoryEntry>,
    ) -> Self {
        let next_seq = long_term.iter().map(|e| e.seq + 1).max().unwrap_or(0);
        debug!(entries = long_term.len(), next_seq, "memory store opened");
        let short_term = VecDeque::with_capacity(settings.short_window);
        Self {
            settings,
            clock,
            short_term,
            long_term,
            next_seq,
        }
    }

    fn prune_on_open(&mut self) {
        if let Some(max) = self.settings.max_long_term {
            if self.long_term.len() > max {
                if let Err(err) = self.prune(max) {
                    warn!(error = %format!("{err:#}"), "prune on open failed to persist");
                }
            }
        }
    }

    pub fn short_term(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.short_term.iter()
    }

    pub fn long_term(&self) -> &[MemoryEntry] {
        &self.long_term
    }

    /// Append `text` to short-term memory, and to the long-term log when `persist`.
    ///
    /// The in-memory append always happens; an `Err` only reports that the
    /// persisted log could not be rewritten.
    pub fn write(
        &mut self,
        text: &str,
        meta: BTreeMap<String, String>,
        persist: bool,
    ) -> Result<()> {
        let entry = MemoryEntry {
            seq: self.next_seq,
            text: text.to_string(),
            meta,
            timestamp: self.clock.now(),
            tokens: term_set(text).into_iter().collect(),
        };
        self.next_seq += 1;

        if self.short_term.len() == self.settings.short_window {
            self.short_term.pop_front();
        }
        self.short_term.push_back(entry.clone());

        if !persist {
            return Ok(());
        }
        self.long_term.push(entry);
        self.flush()
    }

    /// Up to `k` entries from short ∪ long term ranked by relevance to `query`.
    ///
    /// Score is the lexical term overlap plus the TF-IDF cosine over the
    /// candidates and the query; zero-overlap entries are dropped and ties go
    /// to the most recent entry.
    pub fn retrieve(&self, query: &str, k: usize) -> Vec<RetrievedEntry<'_>> {
        let query_terms = term_set(query);
        if query_terms.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut seen = BTreeSet::new();
        let candidates: Vec<&MemoryEntry> = self
            .long_term
            .iter()
            .chain(self.short_term.iter())
            .filter(|entry| seen.insert(entry.seq))
            .collect();

        let token_sets: Vec<BTreeSet<String>> = candidates
            .iter()
            .map(|entry| entry.tokens.iter().cloned().collect())
            .collect();
        let idf = InverseDocumentFrequency::from_corpus(
            token_sets.iter().chain(std::iter::once(&query_terms)),
        );
        let query_vec = TermVector::from_text(query).weighted(&idf);

        let mut scored: Vec<RetrievedEntry<'_>> = candidates
            .iter()
            .zip(&token_sets)
            .filter_map(|(entry, tokens)| {
                let overlap = tokens.intersection(&query_terms).count();
                if overlap == 0 {
                    return None;
                }
                let cosine = TermVector::from_text(&entry.text)
                    .weighted(&idf)
                    .cosine(&query_vec);
                Some(RetrievedEntry {
                    entry: *entry,
                    score: overlap as f64 + cosine,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.entry.timestamp.cmp(&a.entry.timestamp))
                .then_with(|| b.entry.seq.cmp(&a.entry.seq))
        });
        scored.truncate(k);
        scored
    }

    /// Keep only the most recent `max_size` long-term entries and persist.
    pub fn prune(&mut self, max_size: usize) -> Result<()> {
        if self.long_term.len() > max_size {
            let drop = self.long_term.len() - max_size;
            self.long_term.drain(..drop);
            debug!(dropped = drop, kept = max_size, "long-term memory pruned");
        }
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        match self.settings.storage_path.as_deref() {
            Some(path) => write_long_term(path, &self.long_term),
            None => Ok(()),
        }
    }
}

/// Read a persisted long-term log. A missing file is an empty log.
pub fn load_long_term(path: &Path) -> Result<Vec<MemoryEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read memory log {}", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&contents).with_context(|| format!("parse memory log {}", path.display()))
}

/// Atomically replace the persisted log (temp file + rename).
pub fn write_long_term(path: &Path, entries: &[MemoryEntry]) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(entries).context("serialize memory log")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("memory log path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp memory log {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace memory log {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualClock;

    fn meta(role: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("role".to_string(), role.to_string()),
            ("phase".to_string(), "Coding".to_string()),
        ])
    }

    fn settings(path: Option<PathBuf>) -> MemorySettings {
        MemorySettings {
            short_window: 3,
            storage_path: path,
            max_long_term: None,
        }
    }

    fn texts(results: &[RetrievedEntry<'_>]) -> Vec<String> {
        results.iter().map(|r| r.entry.text.clone()).collect()
    }

    #[test]
    fn persisted_entries_survive_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("memory").join("log.json");
        let clock = Arc::new(ManualClock::default());

        let mut store = HybridMemoryStore::open(settings(Some(path.clone())), clock.clone());
        store
            .write("implement the login handler", meta("Coder"), true)
            .expect("persist");
        store.write("scratch note", meta("Coder"), false).expect("write");
        drop(store);

        let reopened = HybridMemoryStore::open(settings(Some(path)), clock);
        assert_eq!(reopened.long_term().len(), 1);
        let results = reopened.retrieve("login handler tests", 3);
        assert_eq!(texts(&results), vec!["implement the login handler"]);
        assert_eq!(results[0].entry.meta.get("role").map(String::as_str), Some("Coder"));
    }

    #[test]
    fn sequence_numbers_continue_after_reload() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("log.json");
        let clock = Arc::new(ManualClock::default());
        let mut store = HybridMemoryStore::open(settings(Some(path.clone())), clock.clone());
        store.write("one", meta("A"), true).expect("persist");
        store.write("two", meta("A"), true).expect("persist");

        let mut reopened = HybridMemoryStore::open(settings(Some(path)), clock);
        reopened.write("three", meta("A"), true).expect("persist");
        let seqs: Vec<u64> = reopened.long_term().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn short_term_is_a_bounded_ring() {
        let mut store = HybridMemoryStore::open(settings(None), Arc::new(ManualClock::default()));
        for i in 0..5 {
            store.write(&format!("note {i}"), meta("A"), false).expect("write");
        }
        let kept: Vec<&str> = store.short_term().map(|e| e.text.as_str()).collect();
        assert_eq!(kept, vec!["note 2", "note 3", "note 4"]);
        assert!(store.long_term().is_empty());
    }

    #[test]
    fn retrieve_ranks_by_overlap_then_recency_and_deduplicates() {
        let clock = ManualClock::default();
        let mut store = HybridMemoryStore::open(settings(None), Arc::new(clock.clone()));
        store.write("database schema draft", meta("A"), true).expect("write");
        clock.advance_secs(1);
        store.write("login page layout", meta("B"), true).expect("write");
        clock.advance_secs(1);
        store.write("login page layout", meta("C"), true).expect("write");
        clock.advance_secs(1);
        store.write("unrelated chatter", meta("D"), false).expect("write");

        let results = store.retrieve("login page", 5);
        let roles: Vec<&str> = results
            .iter()
            .map(|r| r.entry.meta["role"].as_str())
            .collect();
        assert_eq!(roles, vec!["C", "B"]);

        assert!(store.retrieve("nothing matches", 5).is_empty());
        assert!(store.retrieve("...", 5).is_empty());
        assert_eq!(store.retrieve("login", 1).len(), 1);
    }

    #[test]
    fn more_shared_terms_rank_higher() {
        let clock = ManualClock::default();
        let mut store = HybridMemoryStore::open(settings(None), Arc::new(clock.clone()));
        store.write("write login tests for the api", meta("A"), true).expect("write");
        clock.advance_secs(1);
        store.write("login", meta("B"), true).expect("write");

        let results = store.retrieve("login tests api", 2);
        assert_eq!(results[0].entry.meta["role"], "A");
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn prune_keeps_most_recent_and_persists() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("log.json");
        let clock = Arc::new(ManualClock::default());
        let mut store = HybridMemoryStore::open(settings(Some(path.clone())), clock);
        for i in 0..4 {
            store.write(&format!("entry {i}"), meta("A"), true).expect("write");
        }
        store.prune(2).expect("prune");

        let on_disk = load_long_term(&path).expect("load");
        let kept: Vec<&str> = on_disk.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(kept, vec!["entry 2", "entry 3"]);
    }

    #[test]
    fn max_long_term_prunes_on_open() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("log.json");
        let clock = Arc::new(ManualClock::default());
        let mut store = HybridMemoryStore::open(settings(Some(path.clone())), clock.clone());
        for i in 0..5 {
            store.write(&format!("entry {i}"), meta("A"), true).expect("write");
        }
        let bounded = MemorySettings {
            max_long_term: Some(2),
            ..settings(Some(path))
        };
        let reopened = HybridMemoryStore::open(bounded, clock);
        assert_eq!(reopened.long_term().len(), 2);
    }

    #[test]
    fn persistence_failure_keeps_in_memory_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        // A directory where the log file should be makes the rename fail.
        let path = temp.path().join("log.json");
        fs::create_dir_all(&path).expect("mkdir");
        let mut store =
            HybridMemoryStore::open(settings(Some(path)), Arc::new(ManualClock::default()));

        let err = store.write("keep me", meta("A"), true);
        assert!(err.is_err());
        assert_eq!(store.long_term().len(), 1);
        assert_eq!(store.retrieve("keep", 1).len(), 1);
    }

    #[test]
    fn corrupt_log_is_swallowed_by_open_but_not_try_open() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("log.json");
        fs::write(&path, "{not json").expect("write");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());

        let store = HybridMemoryStore::open(settings(Some(path.clone())), clock.clone());
        assert!(store.long_term().is_empty());
        assert!(HybridMemoryStore::try_open(settings(Some(path)), clock).is_err());
    }
}
