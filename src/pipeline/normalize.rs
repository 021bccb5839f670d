//! String normalization shared by the comparator and the discovery paths.
//! Everything here is lossy on purpose: the output is only ever compared
//! against other normalized output, never shown to the user.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Trailing parenthetical or bracketed noise: "(Album Version)", "[Remaster]",
/// "(feat. X)" and friends at the end of a title.
static TRAILING_PARENTHETICAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*[(\[][^)\]]*[)\]]\s*$").unwrap());

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Lowercase, fold diacritics, collapse whitespace.
pub fn normalize(s: &str) -> String {
    let folded: String = s
        .nfkd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect();
    let lowered = folded.to_lowercase();
    WHITESPACE_RUN.replace_all(lowered.trim(), " ").into_owned()
}

/// Title normalization additionally strips one trailing parenthetical noise
/// group, so "My Song (Album Version)" and "My Song" compare as equal.
pub fn normalize_title(s: &str) -> String {
    let stripped = TRAILING_PARENTHETICAL.replace(s, "");
    let normalized = normalize(&stripped);
    if normalized.is_empty() {
        // A title that was nothing but a parenthetical keeps its content.
        normalize(s)
    } else {
        normalized
    }
}

pub fn normalize_artist(s: &str) -> String {
    normalize(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_collapses() {
        assert_eq!(normalize("  My   SONG "), "my song");
    }

    #[test]
    fn folds_diacritics() {
        assert_eq!(normalize("Björk"), "bjork");
        assert_eq!(normalize("Beyoncé"), "beyonce");
    }

    #[test]
    fn strips_trailing_parenthetical() {
        assert_eq!(normalize_title("My Song (Album Version)"), "my song");
        assert_eq!(normalize_title("My Song [2011 Remaster]"), "my song");
    }

    #[test]
    fn keeps_interior_parenthetical() {
        assert_eq!(normalize_title("Wake Up (and Go) Now"), "wake up (and go) now");
    }

    #[test]
    fn all_parenthetical_title_survives() {
        assert_eq!(normalize_title("(Untitled)"), "(untitled)");
    }
}
