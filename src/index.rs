//! TF-IDF vector index with cosine similarity search and atomic on-disk
//! persistence.
//!
//! The index is built once over a fixed corpus of chunk texts and is
//! immutable afterward: the weighting model is fitted at build time and
//! queries are transformed with the already-fitted model, never refitted.
//! That makes [`TfidfIndex::search`] deterministic and lock-free for
//! concurrent readers.
//!
//! On disk an index is a directory holding two artifacts:
//!
//! - `model.json`: fitted vocabulary, idf weights, and the stored
//!   per-text vectors
//! - `texts.json`: the ordered chunk texts the model was fitted over
//!
//! Both are written to temporary names and renamed into place, so a reader
//! never observes one artifact without a consistent partner. [`TfidfIndex::load`]
//! fails with `IndexCorrupt` when the pair is inconsistent.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{ChatError, Result};

const MODEL_FILE: &str = "model.json";
const TEXTS_FILE: &str = "texts.json";

/// Terms excluded from the vocabulary. A compact English stop-word set;
/// enough to keep glue words from dominating the frequency statistics.
const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "am", "an", "and", "any", "are", "as", "at",
    "be", "because", "been", "before", "being", "below", "between", "both", "but", "by", "can",
    "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for", "from",
    "further", "had", "has", "have", "having", "he", "her", "here", "hers", "him", "his", "how",
    "i", "if", "in", "into", "is", "it", "its", "just", "me", "more", "most", "my", "no", "nor",
    "not", "now", "of", "off", "on", "once", "only", "or", "other", "our", "ours", "out", "over",
    "own", "same", "she", "should", "so", "some", "such", "than", "that", "the", "their", "them",
    "then", "there", "these", "they", "this", "those", "through", "to", "too", "under", "until",
    "up", "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "whom",
    "why", "will", "with", "would", "you", "your", "yours",
];

/// Fitted term-weighting model: vocabulary, smoothed idf per term, and the
/// L2-normalized tf-idf vector of every text the model was fitted over.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TfidfModel {
    /// Term at position `i` has term id `i`.
    vocab: Vec<String>,
    /// Smoothed inverse document frequency per term id.
    idf: Vec<f64>,
    /// Sparse L2-normalized vector per text, row-aligned with the text list.
    /// Entries are (term id, weight) sorted by term id.
    vectors: Vec<Vec<(u32, f64)>>,
}

/// A term-frequency vector index over a fixed corpus of chunk texts.
#[derive(Debug, Clone)]
pub struct TfidfIndex {
    model: TfidfModel,
    term_ids: HashMap<String, u32>,
    texts: Vec<String>,
}

impl TfidfIndex {
    /// Fit a TF-IDF model over `texts` and compute a weighted vector per
    /// text. Fails with `EmptyCorpus` for an empty input.
    ///
    /// Vocabulary is capped at `max_vocab` terms, keeping the terms that
    /// appear in the most texts (ties broken by first appearance).
    pub fn build(texts: Vec<String>, max_vocab: usize) -> Result<Self> {
        if texts.is_empty() {
            return Err(ChatError::EmptyCorpus);
        }

        let tokenized: Vec<Vec<String>> = texts.iter().map(|t| tokenize(t)).collect();

        // Document frequency per term, in first-seen order.
        let mut df: HashMap<&str, usize> = HashMap::new();
        let mut first_seen: Vec<&str> = Vec::new();
        for tokens in &tokenized {
            let mut seen: HashMap<&str, ()> = HashMap::new();
            for tok in tokens {
                if seen.insert(tok.as_str(), ()).is_none() {
                    let count = df.entry(tok.as_str()).or_insert(0);
                    if *count == 0 {
                        first_seen.push(tok.as_str());
                    }
                    *count += 1;
                }
            }
        }

        // Keep the max_vocab highest-df terms, stable on first appearance.
        let mut ranked: Vec<(usize, &str)> = first_seen
            .iter()
            .enumerate()
            .map(|(order, term)| (order, *term))
            .collect();
        ranked.sort_by(|a, b| df[b.1].cmp(&df[a.1]).then(a.0.cmp(&b.0)));
        ranked.truncate(max_vocab);
        // Back to first-seen order so term ids are independent of df ties.
        ranked.sort_by_key(|(order, _)| *order);

        let vocab: Vec<String> = ranked.iter().map(|(_, t)| t.to_string()).collect();
        let term_ids: HashMap<String, u32> = vocab
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();

        let n = texts.len() as f64;
        let idf: Vec<f64> = vocab
            .iter()
            .map(|term| ((1.0 + n) / (1.0 + df[term.as_str()] as f64)).ln() + 1.0)
            .collect();

        let vectors: Vec<Vec<(u32, f64)>> = tokenized
            .iter()
            .map(|tokens| weight_tokens(tokens, &term_ids, &idf))
            .collect();

        Ok(Self {
            model: TfidfModel { vocab, idf, vectors },
            term_ids,
            texts,
        })
    }

    /// Number of texts in the index.
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// Similarity search: transform `query` into the fitted vector space and
    /// rank every stored text by cosine similarity.
    ///
    /// Returns at most `min(k, len)` `(text, score)` pairs in descending
    /// score order, ties broken by insertion order. An empty index yields an
    /// empty result, never an error.
    pub fn search(&self, query: &str, k: usize) -> Vec<(&str, f64)> {
        if self.texts.is_empty() || k == 0 {
            return Vec::new();
        }

        let query_vec = weight_tokens(&tokenize(query), &self.term_ids, &self.model.idf);

        let mut scored: Vec<(usize, f64)> = self
            .model
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, sparse_dot(&query_vec, v)))
            .collect();

        // Stable sort preserves insertion order among equal scores.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(i, score)| (self.texts[i].as_str(), score))
            .collect()
    }

    /// Durably serialize the fitted model and the chunk-text list under
    /// `dir`, creating it as needed. Each artifact is written to a temporary
    /// name and renamed into place.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;

        write_atomic(&dir.join(MODEL_FILE), &serde_json::to_vec(&self.model)?)?;
        write_atomic(&dir.join(TEXTS_FILE), &serde_json::to_vec(&self.texts)?)?;

        tracing::info!(dir = %dir.display(), texts = self.texts.len(), "index persisted");
        Ok(())
    }

    /// True if any index artifact exists under `dir`. A half-written pair
    /// still counts as existing; `load` reports it as corrupt.
    pub fn exists(dir: &Path) -> bool {
        dir.join(MODEL_FILE).exists() || dir.join(TEXTS_FILE).exists()
    }

    /// Deserialize a persisted index from `dir`. Fails with `IndexCorrupt`
    /// when either artifact is missing or unreadable, or when the model and
    /// text list are not row-aligned.
    pub fn load(dir: &Path) -> Result<Self> {
        let corrupt = |reason: String| ChatError::IndexCorrupt {
            path: dir.display().to_string(),
            reason,
        };

        let model_bytes = fs::read(dir.join(MODEL_FILE))
            .map_err(|e| corrupt(format!("{}: {}", MODEL_FILE, e)))?;
        let texts_bytes = fs::read(dir.join(TEXTS_FILE))
            .map_err(|e| corrupt(format!("{}: {}", TEXTS_FILE, e)))?;

        let model: TfidfModel = serde_json::from_slice(&model_bytes)
            .map_err(|e| corrupt(format!("{}: {}", MODEL_FILE, e)))?;
        let texts: Vec<String> = serde_json::from_slice(&texts_bytes)
            .map_err(|e| corrupt(format!("{}: {}", TEXTS_FILE, e)))?;

        if model.vectors.len() != texts.len() {
            return Err(corrupt(format!(
                "model holds {} vectors but text list holds {} entries",
                model.vectors.len(),
                texts.len()
            )));
        }
        if model.vocab.len() != model.idf.len() {
            return Err(corrupt(format!(
                "vocabulary has {} terms but {} idf weights",
                model.vocab.len(),
                model.idf.len()
            )));
        }

        let term_ids = model
            .vocab
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();

        Ok(Self {
            model,
            term_ids,
            texts,
        })
    }
}

/// Directory holding the persisted index for one (user, document) pair.
pub fn index_dir(root: &Path, user_id: &str, document_id: &str) -> std::path::PathBuf {
    root.join(user_id).join(document_id)
}

/// Lowercase alphanumeric tokenization; single-character tokens and
/// stop words are dropped.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1 && !STOP_WORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// Compute an L2-normalized sparse tf-idf vector for a token list, keyed by
/// term id. Tokens outside the fitted vocabulary are ignored.
fn weight_tokens(
    tokens: &[String],
    term_ids: &HashMap<String, u32>,
    idf: &[f64],
) -> Vec<(u32, f64)> {
    let mut counts: HashMap<u32, f64> = HashMap::new();
    for tok in tokens {
        if let Some(&id) = term_ids.get(tok.as_str()) {
            *counts.entry(id).or_insert(0.0) += 1.0;
        }
    }

    let mut entries: Vec<(u32, f64)> = counts
        .into_iter()
        .map(|(id, tf)| (id, tf * idf[id as usize]))
        .collect();
    entries.sort_by_key(|(id, _)| *id);

    let norm: f64 = entries.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
    if norm > f64::EPSILON {
        for entry in &mut entries {
            entry.1 /= norm;
        }
    }

    entries
}

/// Dot product of two sparse vectors sorted by term id. Both sides are
/// L2-normalized, so this is cosine similarity.
fn sparse_dot(a: &[(u32, f64)], b: &[(u32, f64)]) -> f64 {
    let mut i = 0;
    let mut j = 0;
    let mut dot = 0.0;
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                dot += a[i].1 * b[j].1;
                i += 1;
                j += 1;
            }
        }
    }
    dot
}

/// Write `bytes` to `path` via a temporary sibling and an atomic rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<String> {
        vec![
            "cats are mammals".to_string(),
            "dogs are mammals".to_string(),
            "rocket engines burn fuel".to_string(),
        ]
    }

    #[test]
    fn test_build_empty_corpus_fails() {
        let err = TfidfIndex::build(Vec::new(), 1000).unwrap_err();
        assert!(matches!(err, ChatError::EmptyCorpus));
    }

    #[test]
    fn test_exact_duplicate_ranks_first_with_unit_score() {
        let index = TfidfIndex::build(corpus(), 1000).unwrap();
        let results = index.search("cats are mammals", 3);
        assert_eq!(results[0].0, "cats are mammals");
        assert!((results[0].1 - 1.0).abs() < 1e-9, "score {}", results[0].1);
    }

    #[test]
    fn test_topical_query_ranks_on_topic_chunks_first() {
        let index = TfidfIndex::build(corpus(), 1000).unwrap();
        let results = index.search("tell me about mammals", 3);
        let ranked: Vec<&str> = results.iter().map(|(t, _)| *t).collect();
        assert_eq!(
            ranked,
            vec![
                "cats are mammals",
                "dogs are mammals",
                "rocket engines burn fuel"
            ]
        );
        assert!(results[0].1 > results[2].1);
    }

    #[test]
    fn test_k_bound() {
        let index = TfidfIndex::build(corpus(), 1000).unwrap();
        assert_eq!(index.search("mammals", 100).len(), 3);
        assert_eq!(index.search("mammals", 2).len(), 2);
        assert_eq!(index.search("mammals", 0).len(), 0);
    }

    #[test]
    fn test_ties_broken_by_insertion_order() {
        let index = TfidfIndex::build(
            vec![
                "alpha beta".to_string(),
                "alpha beta".to_string(),
                "gamma delta".to_string(),
            ],
            1000,
        )
        .unwrap();
        let results = index.search("alpha", 2);
        assert_eq!(results.len(), 2);
        assert!((results[0].1 - results[1].1).abs() < 1e-12);
        // Equal scores keep corpus order.
        assert_eq!(results[0].0, "alpha beta");
        assert_eq!(results[1].0, "alpha beta");
    }

    #[test]
    fn test_query_with_no_known_terms_scores_zero() {
        let index = TfidfIndex::build(corpus(), 1000).unwrap();
        let results = index.search("zyzzyva", 3);
        assert_eq!(results.len(), 3);
        for (_, score) in &results {
            assert_eq!(*score, 0.0);
        }
    }

    #[test]
    fn test_vocab_cap_keeps_highest_df_terms() {
        let index = TfidfIndex::build(
            vec![
                "shared shared unique1".to_string(),
                "shared unique2".to_string(),
                "shared unique3".to_string(),
            ],
            1,
        )
        .unwrap();
        // Only "shared" survives the cap, so a unique term can't match.
        assert_eq!(index.search("unique2", 1)[0].1, 0.0);
        assert!(index.search("shared", 1)[0].1 > 0.0);
    }

    #[test]
    fn test_persist_load_roundtrip_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");

        let index = TfidfIndex::build(corpus(), 1000).unwrap();
        index.persist(&path).unwrap();

        let a = TfidfIndex::load(&path).unwrap();
        let b = TfidfIndex::load(&path).unwrap();
        let ra = a.search("tell me about mammals", 3);
        let rb = b.search("tell me about mammals", 3);
        assert_eq!(ra, rb);
        assert_eq!(ra, index.search("tell me about mammals", 3));
    }

    #[test]
    fn test_load_missing_texts_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");

        let index = TfidfIndex::build(corpus(), 1000).unwrap();
        index.persist(&path).unwrap();
        std::fs::remove_file(path.join(TEXTS_FILE)).unwrap();

        assert!(TfidfIndex::exists(&path));
        let err = TfidfIndex::load(&path).unwrap_err();
        assert!(matches!(err, ChatError::IndexCorrupt { .. }));
    }

    #[test]
    fn test_load_mismatched_artifacts_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");

        let index = TfidfIndex::build(corpus(), 1000).unwrap();
        index.persist(&path).unwrap();
        // Simulate a crash that left a stale texts file from a smaller corpus.
        std::fs::write(
            path.join(TEXTS_FILE),
            serde_json::to_vec(&vec!["only one".to_string()]).unwrap(),
        )
        .unwrap();

        let err = TfidfIndex::load(&path).unwrap_err();
        assert!(matches!(err, ChatError::IndexCorrupt { .. }));
    }
}
