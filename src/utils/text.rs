//! Text normalization helpers for backend responses

/// Normalize a raw backend text response: strip surrounding whitespace and
/// quote characters, then lowercase. Classification and toxicity backends
/// tend to wrap their one-word answers in quotes.
pub fn normalize_label(raw: &str) -> String {
    raw.replace(['\'', '"'], "").trim().to_lowercase()
}

/// Parse a normalized text response as a boolean.
/// "yes"/"true"/"t"/"1" are true, anything else is false.
pub fn str_to_bool(value: &str) -> bool {
    matches!(value, "yes" | "true" | "t" | "1")
}
