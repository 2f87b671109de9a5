//! Destination prediction by lexical similarity.
//!
//! Given a code snippet and an ordered corpus of candidate files, rank each
//! candidate by how closely its vocabulary matches the snippet's. The model
//! is a from-scratch TF-IDF built fresh for every call and thrown away
//! afterwards, so concurrent predictions never share state.
//!
//! # Algorithm
//!
//! 1. Tokenize into maximal runs of `[A-Za-z0-9_]`, lowercased.
//! 2. One document per corpus entry (first `max_candidates` only), plus the
//!    snippet appended as the query document.
//! 3. `tf(t, d) = count(t, d) / |d|`.
//! 4. `idf(t) = ln((D + 1) / (df(t) + 1)) + 1` across all documents,
//!    query included.
//! 5. Each document becomes a `tf × idf` vector over the full vocabulary,
//!    L2-normalized (a zero vector stays zero).
//! 6. `score = cosine(query, candidate)`.
//!
//! Results come back in input order, unsorted. Use [`best_match`] or
//! [`rank`] to pick or display.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::PredictionError;

/// Corpus entries beyond this many (in input order) are ignored.
pub const DEFAULT_MAX_CANDIDATES: usize = 100;

/// One candidate file offered to the predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorpusEntry {
    pub file_name: String,
    pub content: String,
}

impl CorpusEntry {
    pub fn new(file_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            content: content.into(),
        }
    }
}

/// Similarity of one candidate to the snippet, in `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityResult {
    pub file_name: String,
    pub score: f64,
}

/// Split text into lowercase word tokens.
///
/// Anything outside `[A-Za-z0-9_]` is a separator and produces nothing.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
        .collect()
}

/// Per-call TF-IDF model. Term ids index into the vocabulary.
#[derive(Debug, Default)]
struct TfIdfModel {
    vocabulary: HashMap<String, usize>,
    term_frequencies: Vec<HashMap<usize, f64>>,
    idf: Vec<f64>,
}

impl TfIdfModel {
    fn add_document(&mut self, tokens: &[String]) {
        let mut counts: HashMap<usize, f64> = HashMap::new();
        for token in tokens {
            let next_id = self.vocabulary.len();
            let id = *self.vocabulary.entry(token.clone()).or_insert(next_id);
            *counts.entry(id).or_insert(0.0) += 1.0;
        }

        let total = tokens.len() as f64;
        for count in counts.values_mut() {
            *count /= total;
        }
        self.term_frequencies.push(counts);
    }

    fn finalize(&mut self) {
        let documents = self.term_frequencies.len() as f64;
        let mut doc_freq = vec![0usize; self.vocabulary.len()];
        for tf in &self.term_frequencies {
            for &id in tf.keys() {
                doc_freq[id] += 1;
            }
        }
        self.idf = doc_freq
            .into_iter()
            .map(|df| ((documents + 1.0) / (df as f64 + 1.0)).ln() + 1.0)
            .collect();
    }

    fn vector(&self, doc: usize) -> Vec<f64> {
        let mut vector = vec![0.0; self.vocabulary.len()];
        if let Some(tf) = self.term_frequencies.get(doc) {
            for (&id, &freq) in tf {
                vector[id] = freq * self.idf[id];
            }
        }
        vector
    }
}

/// Scale a vector to unit length. A zero vector is returned unchanged.
pub fn normalize(vector: &[f64]) -> Vec<f64> {
    let magnitude = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
    if magnitude == 0.0 {
        return vec![0.0; vector.len()];
    }
    vector.iter().map(|v| v / magnitude).collect()
}

/// Cosine similarity of two vectors.
///
/// Returns `0.0` for empty vectors, mismatched lengths, or when either
/// vector has zero magnitude.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Rank `corpus` against `snippet` using the default candidate cap.
pub fn predict(
    snippet: &str,
    corpus: &[CorpusEntry],
) -> Result<Vec<SimilarityResult>, PredictionError> {
    predict_with_limit(snippet, corpus, DEFAULT_MAX_CANDIDATES)
}

/// Rank the first `max_candidates` entries of `corpus` against `snippet`.
pub fn predict_with_limit(
    snippet: &str,
    corpus: &[CorpusEntry],
    max_candidates: usize,
) -> Result<Vec<SimilarityResult>, PredictionError> {
    if snippet.trim().is_empty() {
        return Err(PredictionError::NoSnippet);
    }
    if corpus.is_empty() || max_candidates == 0 {
        return Err(PredictionError::NoCandidates);
    }

    let candidates = &corpus[..corpus.len().min(max_candidates)];

    let mut model = TfIdfModel::default();
    for entry in candidates {
        model.add_document(&tokenize(&entry.content));
    }
    let query_index = candidates.len();
    model.add_document(&tokenize(snippet));
    model.finalize();

    let query = normalize(&model.vector(query_index));

    let mut results = Vec::with_capacity(candidates.len());
    for (index, entry) in candidates.iter().enumerate() {
        let candidate = normalize(&model.vector(index));
        let score = cosine_similarity(&query, &candidate);
        if !score.is_finite() {
            return Err(PredictionError::Failed(format!(
                "non-finite score for '{}'",
                entry.file_name
            )));
        }
        results.push(SimilarityResult {
            file_name: entry.file_name.clone(),
            score: score.clamp(0.0, 1.0),
        });
    }

    tracing::debug!(
        candidates = results.len(),
        vocabulary = model.vocabulary.len(),
        "ranked apply destinations"
    );

    Ok(results)
}

/// Highest-scoring result; ties go to the earliest entry.
pub fn best_match(results: &[SimilarityResult]) -> Option<&SimilarityResult> {
    let mut best: Option<&SimilarityResult> = None;
    for result in results {
        match best {
            Some(current) if result.score <= current.score => {}
            _ => best = Some(result),
        }
    }
    best
}

/// Results sorted by score descending, input order kept among ties.
pub fn rank(results: &[SimilarityResult]) -> Vec<SimilarityResult> {
    let mut ranked = results.to_vec();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_words_and_case() {
        assert_eq!(
            tokenize("fn Foo_bar(x1) -> Baz {}"),
            vec!["fn", "foo_bar", "x1", "baz"]
        );
    }

    #[test]
    fn test_tokenize_separators_only() {
        assert!(tokenize("  {}()[];:.,-+*/\n\t").is_empty());
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_zero_vector() {
        let v = vec![1.0, 2.0, 3.0];
        let zero = vec![0.0; 3];
        assert_eq!(cosine_similarity(&v, &zero), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero), 0.0);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_normalize_zero_vector_stays_zero() {
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
        let unit = normalize(&[3.0, 4.0]);
        assert!((unit[0] - 0.6).abs() < 1e-12);
        assert!((unit[1] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_predict_requires_snippet() {
        let corpus = vec![CorpusEntry::new("a.js", "let a = 1;")];
        assert_eq!(predict("", &corpus), Err(PredictionError::NoSnippet));
        assert_eq!(predict("   \n", &corpus), Err(PredictionError::NoSnippet));
    }

    #[test]
    fn test_predict_requires_candidates() {
        assert_eq!(predict("let a = 1;", &[]), Err(PredictionError::NoCandidates));
    }

    #[test]
    fn test_predict_exact_match_ranks_first() {
        let snippet = "function add(a,b){return a+b}";
        let corpus = vec![
            CorpusEntry::new("a.js", snippet),
            CorpusEntry::new("b.js", "import x from 'y'"),
        ];
        let results = predict(snippet, &corpus).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].file_name, "a.js");
        assert_eq!(results[1].file_name, "b.js");
        assert!((results[0].score - 1.0).abs() < 1e-9);
        assert!(results[0].score > results[1].score);
        assert_eq!(best_match(&results).unwrap().file_name, "a.js");
    }

    #[test]
    fn test_predict_caps_corpus() {
        let corpus: Vec<CorpusEntry> = (0..101)
            .map(|i| CorpusEntry::new(format!("file{i}.rs"), format!("fn item_{i}() {{}}")))
            .collect();
        let results = predict("fn item_100() {}", &corpus).unwrap();

        assert_eq!(results.len(), 100);
        assert!(results.iter().all(|r| r.file_name != "file100.rs"));
    }

    #[test]
    fn test_predict_keeps_input_order() {
        let corpus = vec![
            CorpusEntry::new("z.py", "def unrelated(): pass"),
            CorpusEntry::new("m.py", "def handler(request): return request.user"),
            CorpusEntry::new("a.py", "import os"),
        ];
        let results = predict("return request.user", &corpus).unwrap();
        let names: Vec<&str> = results.iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(names, vec!["z.py", "m.py", "a.py"]);
        assert_eq!(best_match(&results).unwrap().file_name, "m.py");
    }

    #[test]
    fn test_empty_candidate_scores_zero() {
        let corpus = vec![
            CorpusEntry::new("empty.txt", ""),
            CorpusEntry::new("punct.txt", "{}();"),
        ];
        let results = predict("let value = 1", &corpus).unwrap();
        assert!(results.iter().all(|r| r.score == 0.0));
    }

    #[test]
    fn test_snippet_without_tokens_scores_zero() {
        let corpus = vec![CorpusEntry::new("a.js", "let a = 1;")];
        let results = predict("{ } ;", &corpus).unwrap();
        assert_eq!(results[0].score, 0.0);
    }

    #[test]
    fn test_scores_within_unit_interval() {
        let corpus = vec![
            CorpusEntry::new("a.rs", "pub fn parse(input: &str) -> Result<Ast> { todo!() }"),
            CorpusEntry::new("b.rs", "pub struct Ast { nodes: Vec<Node> }"),
            CorpusEntry::new("c.rs", "mod tests { use super::*; }"),
        ];
        let results = predict("fn parse(input: &str) -> Ast", &corpus).unwrap();
        for r in &results {
            assert!((0.0..=1.0).contains(&r.score), "{} out of range", r.score);
        }
    }

    #[test]
    fn test_best_match_tie_goes_to_first() {
        let results = vec![
            SimilarityResult { file_name: "first".into(), score: 0.5 },
            SimilarityResult { file_name: "second".into(), score: 0.5 },
            SimilarityResult { file_name: "third".into(), score: 0.1 },
        ];
        assert_eq!(best_match(&results).unwrap().file_name, "first");
        assert!(best_match(&[]).is_none());
    }

    #[test]
    fn test_rank_is_stable_descending() {
        let results = vec![
            SimilarityResult { file_name: "a".into(), score: 0.2 },
            SimilarityResult { file_name: "b".into(), score: 0.9 },
            SimilarityResult { file_name: "c".into(), score: 0.2 },
        ];
        let names: Vec<String> = rank(&results).into_iter().map(|r| r.file_name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }
}
