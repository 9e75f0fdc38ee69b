//! Plate text sanitization
//!
//! Recognized text is upper-cased and everything outside `[A-Z0-9]` is
//! dropped. An empty result is not a plate.

use crate::domain::types::Plate;

/// Normalize raw OCR text into a canonical plate identifier.
pub fn sanitize(raw: &str) -> Option<Plate> {
    let cleaned: String = raw
        .chars()
        .flat_map(char::to_uppercase)
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        .collect();

    if cleaned.is_empty() {
        None
    } else {
        Some(Plate::from_sanitized(cleaned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(raw: &str) -> Option<String> {
        sanitize(raw).map(|p| p.as_str().to_string())
    }

    #[test]
    fn test_sanitize_strips_and_uppercases() {
        assert_eq!(s("ab-12 cd"), Some("AB12CD".to_string()));
        assert_eq!(s("  KL 01 \t AB 1234\n"), Some("KL01AB1234".to_string()));
        assert_eq!(s("[xyz.999]"), Some("XYZ999".to_string()));
    }

    #[test]
    fn test_sanitize_empty_results() {
        assert_eq!(s(""), None);
        assert_eq!(s("   "), None);
        assert_eq!(s("-.-/|"), None);
    }

    #[test]
    fn test_sanitize_drops_non_ascii_letters() {
        assert_eq!(s("é1"), Some("1".to_string()));
        assert_eq!(s("ÅÄÖ"), None);
        // Case mapping that expands stays within the ASCII alphabet
        assert_eq!(s("straße"), Some("STRASSE".to_string()));
    }

    #[test]
    fn test_sanitize_idempotent() {
        let inputs =
            ["ab-12 cd", "", "   ", "straße 7", "Ω≈ç√", "MH12DE1433", "mixed Case 0x1F!", "ǅ"];
        for raw in inputs {
            let once = sanitize(raw);
            let twice = once.as_ref().and_then(|p| sanitize(p.as_str()));
            assert_eq!(once, twice, "input {raw:?}");
        }
    }
}
