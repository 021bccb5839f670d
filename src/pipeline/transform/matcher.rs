use once_cell::sync::Lazy;
use regex::Regex;

use super::TransformError;

/// Converts JS-style `$<name>` backreferences to the `${name}` form the
/// regex crate understands.
static NAMED_BACKREF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$<([A-Za-z_][A-Za-z0-9_]*)>").unwrap());

/// A rule or `when` matcher string. `/pattern/flags` is a regular
/// expression; anything else, including a bare leading slash with no closing
/// slash, is a literal substring.
#[derive(Debug, Clone)]
pub enum Matcher {
    Literal(String),
    Pattern(Regex),
}

impl Matcher {
    pub fn parse(raw: &str) -> Result<Matcher, TransformError> {
        let Some((pattern, flags)) = split_regex_notation(raw) else {
            return Ok(Matcher::Literal(raw.to_string()));
        };

        let mut inline = String::new();
        for flag in flags.chars() {
            match flag {
                'i' => inline.push('i'),
                'm' => inline.push('m'),
                's' => inline.push('s'),
                // Global and unicode are already how the regex crate works.
                'g' | 'u' => {}
                other => {
                    return Err(TransformError::InvalidFlag {
                        pattern: raw.to_string(),
                        flag: other,
                    })
                }
            }
        }

        let full = if inline.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{inline}){pattern}")
        };
        let regex = Regex::new(&full).map_err(|source| TransformError::InvalidPattern {
            pattern: raw.to_string(),
            source,
        })?;
        Ok(Matcher::Pattern(regex))
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        match self {
            Matcher::Literal(s) => haystack.contains(s.as_str()),
            Matcher::Pattern(re) => re.is_match(haystack),
        }
    }

    /// Replace every occurrence. Regex replacements support `$1` and
    /// `$<name>` capture references; literal replacements are verbatim.
    pub fn replace_all(&self, haystack: &str, replacement: &str) -> String {
        match self {
            Matcher::Literal(s) => haystack.replace(s.as_str(), replacement),
            Matcher::Pattern(re) => {
                let replacement = NAMED_BACKREF.replace_all(replacement, "$${$1}");
                re.replace_all(haystack, replacement.as_ref()).into_owned()
            }
        }
    }
}

/// `/body/flags` → `(body, flags)`; `None` when the string is not regex
/// notation. Flags must be letters only.
fn split_regex_notation(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix('/')?;
    let close = rest.rfind('/')?;
    let (pattern, flags) = (&rest[..close], &rest[close + 1..]);
    if !flags.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some((pattern, flags))
}
