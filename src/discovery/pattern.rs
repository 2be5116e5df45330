//! Glob patterns over `/`-separated relative paths.
//!
//! Supported syntax:
//!
//! | Glob | Matches |
//! |------|---------|
//! | `*` | Any run of characters within one path segment |
//! | `?` | One character other than `/` |
//! | `**` | Any run of characters, across segments |
//! | `**/` | Zero or more leading directories |
//! | `{a,b}` | Either alternative |
//!
//! Patterns are compiled once into anchored regular expressions.

use regex::Regex;

use super::{DiscoveryError, DiscoveryResult};

/// A compiled glob pattern.
///
/// # Example
///
/// ```
/// use shardrun::discovery::Pattern;
///
/// let pattern = Pattern::new("**/*.spec.js").unwrap();
/// assert!(pattern.matches("login.spec.js"));
/// assert!(pattern.matches("ui/wizard/login.spec.js"));
/// assert!(!pattern.matches("ui/login.js"));
/// ```
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compiles a glob pattern.
    pub fn new(glob: &str) -> DiscoveryResult<Self> {
        let translated = translate(glob)?;
        let regex = Regex::new(&translated).map_err(|e| DiscoveryError::InvalidPattern {
            pattern: glob.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: glob.to_string(),
            regex,
        })
    }

    /// Compiles every pattern in `globs`.
    pub fn compile_all(globs: &[String]) -> DiscoveryResult<Vec<Self>> {
        globs.iter().map(|g| Self::new(g)).collect()
    }

    /// Tests a relative, `/`-separated path.
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// The original glob text.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn translate(glob: &str) -> DiscoveryResult<String> {
    let invalid = |reason: &str| DiscoveryError::InvalidPattern {
        pattern: glob.to_string(),
        reason: reason.to_string(),
    };

    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let mut depth = 0usize;
    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '{' => {
                depth += 1;
                out.push_str("(?:");
            }
            '}' => {
                if depth == 0 {
                    return Err(invalid("unmatched '}'"));
                }
                depth -= 1;
                out.push(')');
            }
            ',' if depth > 0 => out.push('|'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }

    if depth > 0 {
        return Err(invalid("unclosed '{'"));
    }
    out.push('$');
    Ok(out)
}
