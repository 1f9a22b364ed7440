//! Text normalization and bag-of-terms vectors.
//!
//! Shared by the role validator (robust pattern matching), the repetition
//! detector (literal + semantic comparison) and memory retrieval (lexical
//! overlap + cosine ranking).

use std::collections::{BTreeMap, BTreeSet};

/// Case-fold, strip punctuation and collapse whitespace.
///
/// Apostrophes are dropped rather than replaced so `let's` and `lets` agree.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch == '\'' || ch == '\u{2019}' {
            continue;
        }
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(ch);
        } else {
            pending_space = true;
        }
    }
    out
}

/// Split normalized text into terms.
pub fn terms(text: &str) -> Vec<String> {
    normalize(text)
        .split(' ')
        .filter(|term| !term.is_empty())
        .map(str::to_string)
        .collect()
}

/// Unique, sorted term set for `text`.
pub fn term_set(text: &str) -> BTreeSet<String> {
    terms(text).into_iter().collect()
}

/// Sparse term-frequency vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TermVector {
    weights: BTreeMap<String, f64>,
}

impl TermVector {
    /// Raw term frequencies of `text`.
    pub fn from_text(text: &str) -> Self {
        let mut weights = BTreeMap::new();
        for term in terms(text) {
            *weights.entry(term).or_insert(0.0) += 1.0;
        }
        Self { weights }
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Rescale each term by its inverse document frequency.
    pub fn weighted(&self, idf: &InverseDocumentFrequency) -> Self {
        let weights = self
            .weights
            .iter()
            .map(|(term, tf)| (term.clone(), tf * idf.weight(term)))
            .collect();
        Self { weights }
    }

    fn norm(&self) -> f64 {
        self.weights.values().map(|w| w * w).sum::<f64>().sqrt()
    }

    /// Cosine similarity in `[0, 1]`; zero when either vector is empty.
    pub fn cosine(&self, other: &Self) -> f64 {
        let denom = self.norm() * other.norm();
        if denom == 0.0 {
            return 0.0;
        }
        let (small, large) = if self.weights.len() <= other.weights.len() {
            (self, other)
        } else {
            (other, self)
        };
        let dot: f64 = small
            .weights
            .iter()
            .filter_map(|(term, w)| large.weights.get(term).map(|o| w * o))
            .sum();
        (dot / denom).clamp(0.0, 1.0)
    }
}

/// Smoothed IDF table over a joint corpus (`ln((1 + n) / (1 + df)) + 1`).
///
/// Terms shared by every document keep a positive weight, so two texts that
/// overlap at all never score zero.
#[derive(Debug, Clone, Default)]
pub struct InverseDocumentFrequency {
    docs: usize,
    doc_freq: BTreeMap<String, usize>,
}

impl InverseDocumentFrequency {
    pub fn from_corpus<'a, I>(docs: I) -> Self
    where
        I: IntoIterator<Item = &'a BTreeSet<String>>,
    {
        let mut table = Self::default();
        for doc in docs {
            table.docs += 1;
            for term in doc {
                *table.doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
        }
        table
    }

    pub fn weight(&self, term: &str) -> f64 {
        let df = self.doc_freq.get(term).copied().unwrap_or(0);
        ((1.0 + self.docs as f64) / (1.0 + df as f64)).ln() + 1.0
    }
}
