//! Glob patterns for project filters (`*` any run, `?` one character).

use regex::Regex;

/// A compiled, anchored glob.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        Ok(Self {
            source: pattern.to_string(),
            regex: Regex::new(&expr)?,
        })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl PartialEq for GlobPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_and_question_mark() {
        let glob = GlobPattern::new("demo-*").unwrap();
        assert!(glob.matches("demo-"));
        assert!(glob.matches("demo-app"));
        assert!(!glob.matches("other"));
        assert!(!glob.matches("my-demo-app"));

        let glob = GlobPattern::new("v?").unwrap();
        assert!(glob.matches("v1"));
        assert!(!glob.matches("v10"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let glob = GlobPattern::new("a.b+(c)").unwrap();
        assert!(glob.matches("a.b+(c)"));
        assert!(!glob.matches("axb+(c)"));
    }
}
