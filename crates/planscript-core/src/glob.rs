//! Glob subset
//!
//! The matcher recognizes `*` (within one path segment), `**` (any number
//! of segments, must stand alone), and `?` (one character). Brace
//! alternation is rejected loudly rather than silently mis-matched.
//! Patterns and matched paths use forward slashes on every host.

use thiserror::Error;

/// Pattern rejected at compile time.
#[derive(Debug, Error)]
pub enum GlobError {
    #[error("SchemaError: glob '{0}' uses brace alternation, which is not supported")]
    BracesUnsupported(String),

    #[error("SchemaError: glob '{0}': '**' must be its own path segment")]
    BadDoubleStar(String),

    #[error("SchemaError: glob pattern must not be empty")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    /// A literal `**` segment: zero or more whole segments.
    AnyDepth,
    /// A single segment matched character-wise (`*`, `?`, literals).
    Chars(Vec<CharToken>),
}

#[derive(Debug, Clone, PartialEq)]
enum CharToken {
    Literal(char),
    Star,
    Question,
}

/// A compiled glob pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobPattern {
    source: String,
    segments: Vec<Segment>,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, GlobError> {
        if pattern.is_empty() {
            return Err(GlobError::Empty);
        }
        if pattern.contains('{') || pattern.contains('}') {
            return Err(GlobError::BracesUnsupported(pattern.to_string()));
        }

        let mut segments = Vec::new();
        for raw in pattern.split('/') {
            if raw == "**" {
                segments.push(Segment::AnyDepth);
                continue;
            }
            if raw.contains("**") {
                return Err(GlobError::BadDoubleStar(pattern.to_string()));
            }
            let tokens = raw
                .chars()
                .map(|ch| match ch {
                    '*' => CharToken::Star,
                    '?' => CharToken::Question,
                    other => CharToken::Literal(other),
                })
                .collect();
            segments.push(Segment::Chars(tokens));
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Match a root-relative, forward-slash path.
    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('/').collect();
        match_segments(&self.segments, &parts)
    }
}

fn match_segments(pattern: &[Segment], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(Segment::AnyDepth) => {
            // A trailing `**` stands for at least one remaining segment;
            // in the middle it may also match zero.
            if pattern.len() == 1 {
                return !path.is_empty();
            }
            if match_segments(&pattern[1..], path) {
                return true;
            }
            match path.split_first() {
                Some((_, rest)) => match_segments(pattern, rest),
                None => false,
            }
        }
        Some(Segment::Chars(tokens)) => match path.split_first() {
            Some((head, rest)) => {
                let chars: Vec<char> = head.chars().collect();
                match_chars(tokens, &chars) && match_segments(&pattern[1..], rest)
            }
            None => false,
        },
    }
}

fn match_chars(tokens: &[CharToken], chars: &[char]) -> bool {
    match tokens.first() {
        None => chars.is_empty(),
        Some(CharToken::Star) => {
            if match_chars(&tokens[1..], chars) {
                return true;
            }
            match chars.split_first() {
                Some((_, rest)) => match_chars(tokens, rest),
                None => false,
            }
        }
        Some(CharToken::Question) => match chars.split_first() {
            Some((_, rest)) => match_chars(&tokens[1..], rest),
            None => false,
        },
        Some(CharToken::Literal(expected)) => match chars.split_first() {
            Some((actual, rest)) => actual == expected && match_chars(&tokens[1..], rest),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled(pattern: &str) -> GlobPattern {
        GlobPattern::new(pattern).expect("valid pattern")
    }

    #[test]
    fn test_single_star_does_not_cross_separators() {
        let pattern = compiled("*.rs");
        assert!(pattern.matches("lib.rs"));
        assert!(!pattern.matches("src/lib.rs"));
    }

    #[test]
    fn test_double_star_crosses_separators() {
        let pattern = compiled("**/*.rs");
        assert!(pattern.matches("lib.rs"));
        assert!(pattern.matches("src/lib.rs"));
        assert!(pattern.matches("src/deep/nested/mod.rs"));
        assert!(!pattern.matches("src/lib.txt"));
    }

    #[test]
    fn test_trailing_double_star() {
        let pattern = compiled("src/**");
        assert!(pattern.matches("src/lib.rs"));
        assert!(pattern.matches("src/a/b/c.txt"));
        assert!(!pattern.matches("tests/lib.rs"));
        // The bare directory name itself is not inside `src/**`.
        assert!(!pattern.matches("src"));
    }

    #[test]
    fn test_question_matches_one_character() {
        let pattern = compiled("file?.txt");
        assert!(pattern.matches("file1.txt"));
        assert!(!pattern.matches("file10.txt"));
        assert!(!pattern.matches("file.txt"));
    }

    #[test]
    fn test_braces_are_rejected() {
        match GlobPattern::new("src/{a,b}.rs") {
            Err(GlobError::BracesUnsupported(_)) => {}
            other => panic!("expected BracesUnsupported, got {:?}", other),
        }
    }

    #[test]
    fn test_embedded_double_star_is_rejected() {
        assert!(GlobPattern::new("src/**.rs").is_err());
    }
}
