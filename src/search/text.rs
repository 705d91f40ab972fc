//! Query preprocessing and tokenisation shared by both rankers.

/// English stop-words excluded from the TF-IDF vocabulary.
pub const STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "am", "an", "and", "any", "are", "as", "at",
    "be", "because", "been", "before", "being", "below", "between", "both", "but", "by", "did",
    "do", "does", "doing", "down", "during", "each", "few", "for", "from", "further", "had",
    "has", "have", "having", "he", "her", "here", "hers", "him", "his", "how", "i", "if", "in",
    "into", "is", "it", "its", "just", "me", "more", "most", "my", "no", "nor", "not", "now",
    "of", "off", "on", "once", "only", "or", "other", "our", "out", "over", "own", "same", "she",
    "should", "so", "some", "such", "than", "that", "the", "their", "them", "then", "there",
    "these", "they", "this", "those", "through", "to", "too", "under", "until", "up", "very",
    "was", "we", "were", "what", "when", "where", "which", "while", "who", "whom", "why", "will",
    "with", "you", "your",
];

/// Meta-words stripped from queries before keyword matching.
const META_WORDS: &[&str] = &["need", "want", "use", "help", "tool", "function", "can", "how"];

/// Common abbreviations expanded before matching.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("calc", "calculate"),
    ("math", "mathematical"),
    ("web", "website internet"),
    ("db", "database"),
    ("img", "image"),
    ("vid", "video"),
    ("txt", "text"),
    ("doc", "document"),
];

/// Split on non-alphanumeric boundaries, lowercased.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Lowercase and expand known abbreviations token-wise.
pub fn preprocess_query(query: &str) -> String {
    let lower = query.to_lowercase();
    lower
        .split_whitespace()
        .map(|word| {
            let stripped: String = word
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect();
            ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == stripped)
                .map(|(_, expansion)| expansion.to_string())
                .unwrap_or_else(|| word.to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extract the keywords used for exact-match boosting: preprocessed tokens
/// minus meta-words and anything two characters or shorter.
pub fn extract_keywords(query: &str) -> Vec<String> {
    tokenize(&preprocess_query(query))
        .into_iter()
        .filter(|w| w.len() > 2 && !META_WORDS.contains(&w.as_str()))
        .collect()
}

/// Adjacent-pair bigrams over a token sequence.
pub fn bigrams(tokens: &[String]) -> Vec<String> {
    tokens
        .windows(2)
        .map(|pair| format!("{} {}", pair[0], pair[1]))
        .collect()
}

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}
