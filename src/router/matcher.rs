//! Glob-style pattern matching for identity and issuer conditions

use glob::{MatchOptions, Pattern};
use std::fmt;
use thiserror::Error;

/// Pattern compilation errors
#[derive(Error, Debug)]
#[error("Invalid pattern '{pattern}': {source}")]
pub struct PatternError {
    pattern: String,
    #[source]
    source: glob::PatternError,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A compiled glob pattern matched against whole strings
///
/// `*` matches any run of characters (including none) and `?` matches exactly
/// one character. Everything else, `[`, `]` and regex metacharacters
/// included, is matched literally.
#[derive(Clone)]
pub struct PatternMatcher {
    source: String,
    compiled: Pattern,
}

impl PatternMatcher {
    /// Compile a pattern
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let compiled = Pattern::new(&translate(pattern)).map_err(|source| PatternError {
            pattern: pattern.to_string(),
            source,
        })?;

        Ok(Self {
            source: pattern.to_string(),
            compiled,
        })
    }

    /// Test a value against the pattern (full-string match)
    pub fn test(&self, value: &str) -> bool {
        self.compiled.matches_with(value, MATCH_OPTIONS)
    }

    /// The pattern as written
    pub fn pattern(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for PatternMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PatternMatcher").field(&self.source).finish()
    }
}

/// Rewrite our wildcard syntax into `glob` syntax.
///
/// Literal runs go through `Pattern::escape` so `[`/`]` cannot open a
/// character class, and runs of `*` collapse to one because `glob` rejects
/// `**` outside a path component.
fn translate(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut literal = String::new();
    let mut last_was_star = false;

    for c in pattern.chars() {
        match c {
            '*' | '?' => {
                if !literal.is_empty() {
                    out.push_str(&Pattern::escape(&literal));
                    literal.clear();
                }
                if c == '*' {
                    if !last_was_star {
                        out.push('*');
                    }
                    last_was_star = true;
                } else {
                    out.push('?');
                    last_was_star = false;
                }
            }
            _ => {
                literal.push(c);
                last_was_star = false;
            }
        }
    }

    if !literal.is_empty() {
        out.push_str(&Pattern::escape(&literal));
    }

    out
}
