/// In-memory BM25 index over tokenized chunks
use ahash::{HashMap, HashMapExt};

/// BM25 tuning constants
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    /// Term-frequency saturation
    pub k1: f32,
    /// Document-length normalization strength (0 = none, 1 = full)
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// Lexical index built once per corpus generation
///
/// Positions are chunk indices; the index is never mutated after `build`.
#[derive(Debug, Clone)]
pub struct SparseIndex {
    params: Bm25Params,
    term_freqs: Vec<HashMap<String, u32>>,
    doc_lens: Vec<usize>,
    avg_doc_len: f32,
    doc_freqs: HashMap<String, usize>,
}

impl SparseIndex {
    /// Build document-frequency statistics from per-chunk tokens
    pub fn build(tokens: &[Vec<String>], params: Bm25Params) -> Self {
        let mut term_freqs = Vec::with_capacity(tokens.len());
        let mut doc_lens = Vec::with_capacity(tokens.len());
        let mut doc_freqs: HashMap<String, usize> = HashMap::new();

        for doc in tokens {
            let mut freqs: HashMap<String, u32> = HashMap::new();
            for token in doc {
                *freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *doc_freqs.entry(term.clone()).or_insert(0) += 1;
            }
            doc_lens.push(doc.len());
            term_freqs.push(freqs);
        }

        let avg_doc_len = if doc_lens.is_empty() {
            0.0
        } else {
            doc_lens.iter().sum::<usize>() as f32 / doc_lens.len() as f32
        };

        Self {
            params,
            term_freqs,
            doc_lens,
            avg_doc_len,
            doc_freqs,
        }
    }

    /// Empty index (cold start)
    pub fn empty(params: Bm25Params) -> Self {
        Self::build(&[], params)
    }

    pub fn len(&self) -> usize {
        self.term_freqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.term_freqs.is_empty()
    }

    /// Inverse document frequency, kept non-negative for very common terms
    fn idf(&self, term: &str) -> f32 {
        let n = self.len() as f32;
        let df = self.doc_freqs.get(term).copied().unwrap_or(0) as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    /// BM25 score of one chunk for the given query tokens
    pub fn score(&self, query_tokens: &[String], chunk_index: usize) -> f32 {
        let Some(freqs) = self.term_freqs.get(chunk_index) else {
            return 0.0;
        };
        let Bm25Params { k1, b } = self.params;
        let doc_len = self.doc_lens[chunk_index] as f32;
        let length_norm = if self.avg_doc_len > 0.0 {
            1.0 - b + b * doc_len / self.avg_doc_len
        } else {
            1.0
        };

        query_tokens
            .iter()
            .filter_map(|term| freqs.get(term).map(|tf| (term, *tf as f32)))
            .map(|(term, tf)| self.idf(term) * tf * (k1 + 1.0) / (tf + k1 * length_norm))
            .sum()
    }

    /// Top-`k` chunk indices by BM25 score, ties broken by lower index
    ///
    /// Chunks sharing no term with the query are not returned.
    pub fn search(&self, query_tokens: &[String], k: usize) -> Vec<(usize, f32)> {
        if self.is_empty() || query_tokens.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = (0..self.len())
            .map(|idx| (idx, self.score(query_tokens, idx)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::tokenize;

    fn build(docs: &[&str]) -> SparseIndex {
        let tokens: Vec<Vec<String>> = docs.iter().map(|d| tokenize(d)).collect();
        SparseIndex::build(&tokens, Bm25Params::default())
    }

    #[test]
    fn test_empty_corpus() {
        let index = SparseIndex::empty(Bm25Params::default());
        assert!(index.is_empty());
        assert!(index.search(&tokenize("anything"), 5).is_empty());
    }

    #[test]
    fn test_rare_terms_score_higher() {
        let index = build(&[
            "leave policy leave request",
            "leave calendar",
            "medical certificate",
        ]);

        let leave = index.score(&tokenize("leave"), 1);
        let medical = index.score(&tokenize("medical"), 2);
        assert!(medical > leave);
    }

    #[test]
    fn test_term_frequency_saturates() {
        let index = build(&["fox", "fox fox", "fox fox fox fox fox fox fox fox"]);
        let query = tokenize("fox");
        let one = index.score(&query, 0);
        let two = index.score(&query, 1);
        let many = index.score(&query, 2);
        assert!(two > one);
        // length normalization plus saturation keep the long doc from running away
        assert!(many < one * 4.0);
    }

    #[test]
    fn test_search_orders_and_skips_non_matching() {
        let index = build(&[
            "the quick brown fox",
            "python programming tutorial",
            "a fox and another fox",
        ]);

        let results = index.search(&tokenize("fox"), 10);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(idx, _)| *idx != 1));
    }

    #[test]
    fn test_ties_break_by_lower_index() {
        let index = build(&["alpha beta", "gamma delta", "alpha beta"]);
        let results = index.search(&tokenize("alpha"), 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 0);
        assert_eq!(results[1].0, 2);
        assert_eq!(results[0].1, results[1].1);
    }

    #[test]
    fn test_truncates_to_k() {
        let index = build(&["a x", "a y", "a z"]);
        assert_eq!(index.search(&tokenize("a"), 2).len(), 2);
        assert!(index.search(&tokenize("a"), 0).is_empty());
    }
}
