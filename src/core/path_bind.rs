//! Pattern → replacement route rules.
//!
//! A [`RouteRule`] is compiled once when a definition is loaded and never
//! mutated afterwards; a reload builds a fresh `Vec<RouteRule>`. Rule lists are
//! therefore plain immutable data that any number of request tasks can scan
//! concurrently.
//!
//! Pattern syntax:
//! * a key starting with `^` is taken as a raw regular expression;
//! * anything else is a glob where `*` captures `(.*)` and every other
//!   character is literal.
//!
//! Both forms are anchored at both ends. Replacement templates use the
//! `regex` expansion syntax (`$1`, `${name}`).
use regex::Regex;
use thiserror::Error;

/// Raised when a route pattern is not a valid regular expression.
#[derive(Error, Debug, Clone)]
#[error("Invalid route pattern '{pattern}': {message}")]
pub struct InvalidPatternError {
    pub pattern: String,
    pub message: String,
}

/// A compiled pattern and the template its matches are rewritten into.
#[derive(Debug, Clone)]
pub struct RouteRule {
    source: String,
    pattern: Regex,
    replacement: String,
}

impl RouteRule {
    /// Compile a rule from its declared pattern and replacement template.
    pub fn compile(
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self, InvalidPatternError> {
        let expression = to_regex(pattern);
        let compiled = Regex::new(&expression).map_err(|e| InvalidPatternError {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            source: pattern.to_string(),
            pattern: compiled,
            replacement: replacement.into(),
        })
    }

    /// The pattern as written in the definition file.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    /// Same pattern, different template.
    pub fn with_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacement = replacement.into();
        self
    }

    /// Number of capture groups, not counting the implicit whole match.
    pub fn capture_count(&self) -> usize {
        self.pattern.captures_len().saturating_sub(1)
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }

    /// Rewrite `path` through this rule, or `None` when it does not match.
    pub fn apply(&self, path: &str) -> Option<String> {
        let captures = self.pattern.captures(path)?;
        let mut expanded = String::with_capacity(self.replacement.len() + path.len());
        captures.expand(&self.replacement, &mut expanded);
        Some(expanded)
    }
}

fn to_regex(pattern: &str) -> String {
    if let Some(body) = pattern.strip_prefix('^') {
        return format!("^(?:{})$", strip_end_anchor(body));
    }

    let mut expression = String::with_capacity(pattern.len() + 8);
    expression.push('^');
    for (index, literal) in pattern.split('*').enumerate() {
        if index > 0 {
            expression.push_str("(.*)");
        }
        expression.push_str(&regex::escape(literal));
    }
    expression.push('$');
    expression
}

/// `body` without a trailing `$`, unless that `$` is escaped.
fn strip_end_anchor(body: &str) -> &str {
    let Some(rest) = body.strip_suffix('$') else {
        return body;
    };
    let backslashes = rest.chars().rev().take_while(|&c| c == '\\').count();
    if backslashes % 2 == 0 { rest } else { body }
}

/// First rule (in insertion order) matching `path`, rewritten through its template.
pub fn resolve(rules: &[RouteRule], path: &str) -> Option<String> {
    rules.iter().find_map(|rule| rule.apply(path))
}

/// Every matching rule's rewrite, in insertion order.
pub fn resolve_all<'a>(
    rules: &'a [RouteRule],
    path: &'a str,
) -> impl Iterator<Item = String> + 'a {
    rules.iter().filter_map(move |rule| rule.apply(path))
}
