//! Path component sanitization for download folder names

/// Replace everything that could confuse a filesystem (or escape the
/// download folder) with underscores. Patient IDs, pseudonyms and study
/// descriptions come from remote peers and are not trustworthy.
pub fn sanitize_filename(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '^' | ',' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned
        .trim_matches(|c: char| c == ' ' || c == '.')
        .to_string();

    // never allow a component that resolves to a path segment
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return "unnamed".to_string();
    }

    cleaned
}
