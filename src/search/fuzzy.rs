//! Fuzzy ranker for the authored-tool store.
//!
//! Looser than the hybrid index: substring hits, synonym-expanded word
//! overlap, and sequence similarity, with mild boosts for healthy and
//! frequently used tools. Scores are open-ended; callers filter with a
//! threshold (default 0.3).

use std::collections::HashSet;

/// Default minimum score for a store search hit.
pub const DEFAULT_THRESHOLD: f64 = 0.3;

/// Synonym groups used for query expansion.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("calculate", &["compute", "find", "determine", "get"]),
    ("convert", &["transform", "change", "translate"]),
    ("factorial", &["fact", "permutation"]),
    ("temperature", &["temp", "fahrenheit", "celsius", "kelvin"]),
    ("count", &["number", "quantity", "amount"]),
    ("character", &["char", "letter", "symbol"]),
    ("string", &["text", "word"]),
    ("add", &["sum", "plus", "addition"]),
    ("subtract", &["minus", "difference"]),
    ("multiply", &["times", "product"]),
    ("divide", &["division", "quotient"]),
];

const ACTION_WORDS: &[&str] = &[
    "calculate",
    "compute",
    "convert",
    "find",
    "count",
    "get",
    "transform",
];

/// The store fields the ranker scores against.
pub struct FuzzyFields<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub tags: &'a [String],
    pub category: Option<&'a str>,
    pub is_active: bool,
    pub is_bugged: bool,
    pub execution_count: i64,
}

fn words(text: &str) -> HashSet<String> {
    super::tokenize(text).into_iter().collect()
}

/// Expand query words with their synonym groups (both directions).
fn expand(query_words: &HashSet<String>) -> HashSet<String> {
    let mut expanded = query_words.clone();
    for word in query_words {
        for (key, values) in SYNONYMS {
            if word == key || values.contains(&word.as_str()) {
                expanded.insert(key.to_string());
                expanded.extend(values.iter().map(|v| v.to_string()));
            }
        }
    }
    expanded
}

/// Ratcliff–Obershelp sequence similarity in `[0, 1]`: twice the total
/// length of recursively matched blocks over the combined length.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let matched = matching_chars(&a, &b);
    2.0 * matched as f64 / (a.len() + b.len()) as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    // Longest common substring via a rolling DP row.
    let (mut best_len, mut best_a, mut best_b) = (0usize, 0usize, 0usize);
    let mut prev = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        let mut cur = vec![0usize; b.len() + 1];
        for (j, &cb) in b.iter().enumerate() {
            if ca == cb {
                cur[j + 1] = prev[j] + 1;
                if cur[j + 1] > best_len {
                    best_len = cur[j + 1];
                    best_a = i + 1 - cur[j + 1];
                    best_b = j + 1 - cur[j + 1];
                }
            }
        }
        prev = cur;
    }
    if best_len == 0 {
        return 0;
    }
    best_len
        + matching_chars(&a[..best_a], &b[..best_b])
        + matching_chars(&a[best_a + best_len..], &b[best_b + best_len..])
}

/// Score one stored tool against a query.
pub fn fuzzy_score(query: &str, fields: &FuzzyFields<'_>) -> f64 {
    let query_lower = query.to_lowercase();
    let expanded = expand(&words(&query_lower));

    let name_lower = fields.name.to_lowercase();
    let desc_lower = fields.description.to_lowercase();
    let tags_lower = fields.tags.join(" ").to_lowercase();
    let category_lower = fields.category.unwrap_or("").to_lowercase();
    let combined = format!("{name_lower} {desc_lower} {tags_lower} {category_lower}");
    let tool_words = words(&combined);

    let mut score = 0.0;

    // Exact substring matches.
    if name_lower.contains(&query_lower) {
        score += 10.0;
    }
    if desc_lower.contains(&query_lower) {
        score += 5.0;
    }

    // Word overlap with the synonym-expanded query.
    let overlap = expanded.intersection(&tool_words).count();
    score += overlap as f64 * 2.0;

    // Sequence similarity.
    score += similarity_ratio(&query_lower, &name_lower) * 3.0;
    score += similarity_ratio(&query_lower, &desc_lower) * 2.0;

    // Tag and category hits.
    for tag in fields.tags {
        if expanded.contains(&tag.to_lowercase()) {
            score += 3.0;
        }
    }
    if !category_lower.is_empty()
        && (expanded.contains(&category_lower)
            || expanded.iter().any(|w| category_lower.contains(w.as_str())))
    {
        score += 2.0;
    }

    // Action-verb overlap.
    let query_actions: HashSet<&String> = expanded
        .iter()
        .filter(|w| ACTION_WORDS.contains(&w.as_str()))
        .collect();
    let tool_actions: HashSet<&String> = tool_words
        .iter()
        .filter(|w| ACTION_WORDS.contains(&w.as_str()))
        .collect();
    let action_overlap = query_actions.intersection(&tool_actions).count();
    score += action_overlap as f64 * 1.5;

    // Health and popularity boosts.
    if fields.is_active {
        score *= 1.1;
    }
    if !fields.is_bugged {
        score *= 1.1;
    }
    if fields.execution_count > 0 {
        score += (fields.execution_count as f64 * 0.1).min(2.0);
    }

    score
}
