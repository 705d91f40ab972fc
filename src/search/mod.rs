//! Hybrid tool ranking.
//!
//! The registry index combines three signals over every tool's searchable
//! text: TF-IDF cosine similarity, BM25, and exact-keyword boosting. Each
//! component is max-normalised across the corpus and blended 0.3/0.4/0.3.
//! The authored-tool store uses the separate fuzzy ranker in [`fuzzy`].

pub mod fuzzy;
mod text;

pub use text::{extract_keywords, preprocess_query, tokenize};

use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// TF-IDF vocabulary cap (unigrams + bigrams).
const MAX_FEATURES: usize = 1000;
/// Minimum combined score for a hit to be emitted.
const SCORE_FLOOR: f64 = 0.01;

const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;

/// Keyword-boost weights per field.
const NAME_WEIGHT: f64 = 5.0;
const TAG_WEIGHT: f64 = 3.0;
const CATEGORY_WEIGHT: f64 = 2.5;
const DESCRIPTION_WEIGHT: f64 = 2.0;
const PARAM_WEIGHT: f64 = 1.5;

/// Searchable projection of one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDoc {
    pub name: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub required_params: Vec<String>,
    pub optional_params: Vec<String>,
    pub param_types: Vec<String>,
}

impl ToolDoc {
    fn searchable_text(&self) -> String {
        let mut parts: Vec<String> = vec![
            self.name.clone(),
            self.name.replace('_', " "),
            self.description.clone(),
            self.category.clone(),
            self.tags.join(" "),
            self.required_params.join(" "),
            self.optional_params.join(" "),
        ];
        for p in self.required_params.iter().chain(&self.optional_params) {
            parts.push(p.replace('_', " "));
        }
        parts.extend(self.param_types.iter().cloned());
        parts.retain(|p| !p.is_empty());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub tfidf: f64,
    pub bm25: f64,
    pub keyword: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub name: String,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub doc: ToolDoc,
}

pub struct SearchIndex {
    docs: Vec<ToolDoc>,
    /// Whitespace tokens of each doc's searchable text (BM25).
    bm25_tokens: Vec<Vec<String>>,
    bm25_df: HashMap<String, usize>,
    avg_doc_len: f64,
    /// Capped unigram+bigram vocabulary (TF-IDF).
    vocab: HashMap<String, usize>,
    idf: Vec<f64>,
    /// L2-normalised TF-IDF vectors, one per doc.
    doc_vectors: Vec<HashMap<usize, f64>>,
}

/// TF-IDF terms for a text: stopword-filtered unigrams plus their bigrams.
fn tfidf_terms(text: &str) -> Vec<String> {
    let tokens: Vec<String> = tokenize(text)
        .into_iter()
        .filter(|t| !text::is_stopword(t))
        .collect();
    let mut terms = text::bigrams(&tokens);
    terms.extend(tokens);
    terms
}

fn l2_normalize(vector: &mut HashMap<usize, f64>) {
    let norm = vector.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in vector.values_mut() {
            *v /= norm;
        }
    }
}

impl SearchIndex {
    pub fn empty() -> Self {
        Self::build(Vec::new())
    }

    pub fn build(docs: Vec<ToolDoc>) -> Self {
        let texts: Vec<String> = docs.iter().map(|d| d.searchable_text()).collect();

        // BM25 corpus: plain whitespace tokens.
        let bm25_tokens: Vec<Vec<String>> = texts
            .iter()
            .map(|t| {
                t.to_lowercase()
                    .split_whitespace()
                    .map(|s| s.to_string())
                    .collect()
            })
            .collect();
        let mut bm25_df: HashMap<String, usize> = HashMap::new();
        for tokens in &bm25_tokens {
            let unique: HashSet<&String> = tokens.iter().collect();
            for token in unique {
                *bm25_df.entry(token.clone()).or_insert(0) += 1;
            }
        }
        let avg_doc_len = if bm25_tokens.is_empty() {
            0.0
        } else {
            bm25_tokens.iter().map(|t| t.len() as f64).sum::<f64>() / bm25_tokens.len() as f64
        };

        // TF-IDF vocabulary: top terms by corpus frequency, deterministic
        // tie-break on the term itself.
        let doc_terms: Vec<Vec<String>> = texts.iter().map(|t| tfidf_terms(t)).collect();
        let mut corpus_freq: HashMap<String, usize> = HashMap::new();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for terms in &doc_terms {
            for term in terms {
                *corpus_freq.entry(term.clone()).or_insert(0) += 1;
            }
            let unique: HashSet<&String> = terms.iter().collect();
            for term in unique {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
        }
        let mut ranked: Vec<(String, usize)> = corpus_freq.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(MAX_FEATURES);

        let vocab: HashMap<String, usize> = ranked
            .into_iter()
            .enumerate()
            .map(|(idx, (term, _))| (term, idx))
            .collect();

        let n_docs = docs.len() as f64;
        let mut idf = vec![0.0; vocab.len()];
        for (term, &idx) in &vocab {
            let df = *doc_freq.get(term).unwrap_or(&0) as f64;
            idf[idx] = ((1.0 + n_docs) / (1.0 + df)).ln() + 1.0;
        }

        let doc_vectors: Vec<HashMap<usize, f64>> = doc_terms
            .iter()
            .map(|terms| {
                let mut vector: HashMap<usize, f64> = HashMap::new();
                for term in terms {
                    if let Some(&idx) = vocab.get(term) {
                        *vector.entry(idx).or_insert(0.0) += 1.0;
                    }
                }
                for (idx, v) in vector.iter_mut() {
                    *v *= idf[*idx];
                }
                l2_normalize(&mut vector);
                vector
            })
            .collect();

        Self {
            docs,
            bm25_tokens,
            bm25_df,
            avg_doc_len,
            vocab,
            idf,
            doc_vectors,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn tfidf_scores(&self, query: &str) -> Vec<f64> {
        let mut query_vector: HashMap<usize, f64> = HashMap::new();
        for term in tfidf_terms(query) {
            if let Some(&idx) = self.vocab.get(&term) {
                *query_vector.entry(idx).or_insert(0.0) += 1.0;
            }
        }
        for (idx, v) in query_vector.iter_mut() {
            *v *= self.idf[*idx];
        }
        l2_normalize(&mut query_vector);

        self.doc_vectors
            .iter()
            .map(|doc| {
                query_vector
                    .iter()
                    .map(|(idx, qv)| qv * doc.get(idx).unwrap_or(&0.0))
                    .sum()
            })
            .collect()
    }

    fn bm25_scores(&self, query: &str) -> Vec<f64> {
        let query_tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();
        let n = self.docs.len() as f64;

        self.bm25_tokens
            .iter()
            .map(|doc_tokens| {
                let doc_len = doc_tokens.len() as f64;
                let mut tf: HashMap<&String, f64> = HashMap::new();
                for token in doc_tokens {
                    *tf.entry(token).or_insert(0.0) += 1.0;
                }
                query_tokens
                    .iter()
                    .map(|qt| {
                        let Some(&freq) = tf.get(qt) else { return 0.0 };
                        let df = *self.bm25_df.get(qt).unwrap_or(&0) as f64;
                        let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                        idf * freq * (BM25_K1 + 1.0)
                            / (freq
                                + BM25_K1
                                    * (1.0 - BM25_B + BM25_B * doc_len / self.avg_doc_len.max(1.0)))
                    })
                    .sum()
            })
            .collect()
    }

    fn keyword_scores(&self, keywords: &[String]) -> Vec<f64> {
        self.docs
            .iter()
            .map(|doc| {
                let name = doc.name.to_lowercase();
                let description = doc.description.to_lowercase();
                let category = doc.category.to_lowercase();
                let mut score = 0.0;
                for kw in keywords {
                    if name.contains(kw.as_str()) {
                        score += NAME_WEIGHT;
                    }
                    if description.contains(kw.as_str()) {
                        score += DESCRIPTION_WEIGHT;
                    }
                    if doc.tags.iter().any(|t| t.to_lowercase().contains(kw.as_str())) {
                        score += TAG_WEIGHT;
                    }
                    if category.contains(kw.as_str()) {
                        score += CATEGORY_WEIGHT;
                    }
                    if doc
                        .required_params
                        .iter()
                        .any(|p| p.to_lowercase().contains(kw.as_str()))
                    {
                        score += PARAM_WEIGHT;
                    }
                }
                score
            })
            .collect()
    }

    /// Rank all docs against a query. `excluded` names (bugged tools) are
    /// dropped; `category` filters exact matches when provided.
    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        category: Option<&str>,
        excluded: &HashSet<String>,
    ) -> Vec<SearchHit> {
        if self.docs.is_empty() {
            return Vec::new();
        }

        let processed = preprocess_query(query);
        let keywords = extract_keywords(query);

        let tfidf = normalize_max(self.tfidf_scores(&processed));
        let bm25 = normalize_max(self.bm25_scores(&processed));
        let keyword = normalize_max(self.keyword_scores(&keywords));

        let mut hits: Vec<SearchHit> = Vec::new();
        for (idx, doc) in self.docs.iter().enumerate() {
            if excluded.contains(&doc.name) {
                continue;
            }
            if let Some(cat) = category {
                if doc.category != cat {
                    continue;
                }
            }
            let score = 0.3 * tfidf[idx] + 0.4 * bm25[idx] + 0.3 * keyword[idx];
            if score > SCORE_FLOOR {
                hits.push(SearchHit {
                    name: doc.name.clone(),
                    score,
                    breakdown: ScoreBreakdown {
                        tfidf: tfidf[idx],
                        bm25: bm25[idx],
                        keyword: keyword[idx],
                    },
                    doc: doc.clone(),
                });
            }
        }

        // Stable sort keeps index order for equal scores.
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        hits
    }
}

fn normalize_max(scores: Vec<f64>) -> Vec<f64> {
    let max = scores.iter().cloned().fold(0.0_f64, f64::max);
    if max > 0.0 {
        scores.into_iter().map(|s| s / max).collect()
    } else {
        scores
    }
}

/// Render the LLM-ready context block for the top matches.
pub fn render_context(query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No relevant tools found for this query.".to_string();
    }

    let mut out = format!("Most relevant tools for: '{query}'\n\n");
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!(
            "{}. Tool: {} (Relevance: {:.2})\n",
            i + 1,
            hit.name,
            hit.score
        ));
        out.push_str(&format!("   Description: {}\n", hit.doc.description));
        out.push_str(&format!("   Category: {}\n", hit.doc.category));
        let required = if hit.doc.required_params.is_empty() {
            "None".to_string()
        } else {
            hit.doc.required_params.join(", ")
        };
        out.push_str(&format!("   Required Params: {required}\n"));
        if !hit.doc.optional_params.is_empty() {
            out.push_str(&format!(
                "   Optional Params: {}\n",
                hit.doc.optional_params.join(", ")
            ));
        }
        if !hit.doc.tags.is_empty() {
            out.push_str(&format!("   Tags: {}\n", hit.doc.tags.join(", ")));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str, description: &str, category: &str, tags: &[&str]) -> ToolDoc {
        ToolDoc {
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            required_params: vec!["a".into(), "b".into()],
            optional_params: vec![],
            param_types: vec!["int".into()],
        }
    }

    fn corpus() -> SearchIndex {
        SearchIndex::build(vec![
            doc(
                "multiply",
                "Multiply two numbers together",
                "computation",
                &["math", "arithmetic"],
            ),
            doc(
                "web_search",
                "Search the web for information",
                "web",
                &["search", "internet"],
            ),
            doc(
                "reverse_text",
                "Reverse a string of text",
                "text",
                &["string", "reverse"],
            ),
            doc(
                "get_weather",
                "Get current weather for a location",
                "api",
                &["weather", "forecast"],
            ),
        ])
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = SearchIndex::empty();
        assert!(index
            .search("anything", 5, None, &HashSet::new())
            .is_empty());
    }

    #[test]
    fn exact_name_ranks_first() {
        let index = corpus();
        let hits = index.search("multiply numbers", 3, None, &HashSet::new());
        assert!(!hits.is_empty());
        assert_eq!(hits[0].name, "multiply");
    }

    #[test]
    fn scores_are_descending_and_bounded() {
        let index = corpus();
        let hits = index.search("search the internet", 4, None, &HashSet::new());
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        for hit in &hits {
            assert!(hit.breakdown.tfidf >= 0.0 && hit.breakdown.tfidf <= 1.0);
            assert!(hit.breakdown.bm25 >= 0.0 && hit.breakdown.bm25 <= 1.0);
            assert!(hit.breakdown.keyword >= 0.0 && hit.breakdown.keyword <= 1.0);
            assert!(hit.score > SCORE_FLOOR);
        }
    }

    #[test]
    fn category_filter_applies() {
        let index = corpus();
        let hits = index.search("search", 5, Some("web"), &HashSet::new());
        assert!(hits.iter().all(|h| h.doc.category == "web"));
    }

    #[test]
    fn excluded_tools_are_dropped() {
        let index = corpus();
        let mut excluded = HashSet::new();
        excluded.insert("web_search".to_string());
        let hits = index.search("search the web", 5, None, &excluded);
        assert!(hits.iter().all(|h| h.name != "web_search"));
    }

    #[test]
    fn abbreviation_reaches_expansion() {
        let index = SearchIndex::build(vec![doc(
            "query_database",
            "Run a query against a database",
            "data",
            &["database"],
        )]);
        let hits = index.search("db lookup", 3, None, &HashSet::new());
        assert!(!hits.is_empty());
    }

    #[test]
    fn top_k_truncates() {
        let index = corpus();
        let hits = index.search("a tool for text search weather numbers", 2, None, &HashSet::new());
        assert!(hits.len() <= 2);
    }

    #[test]
    fn context_rendering_lists_params() {
        let index = corpus();
        let hits = index.search("multiply", 1, None, &HashSet::new());
        let context = render_context("multiply", &hits);
        assert!(context.contains("Tool: multiply"));
        assert!(context.contains("Required Params: a, b"));
    }

    #[test]
    fn context_for_no_hits() {
        assert_eq!(
            render_context("nothing", &[]),
            "No relevant tools found for this query."
        );
    }
}
