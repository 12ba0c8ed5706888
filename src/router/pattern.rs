//! Route rule compilation.
//!
//! Rule syntax:
//!
//! | Token | Matches | Example |
//! |-------|---------|---------|
//! | `:name` | one path segment (up to the next `/`) | `/user/:id` |
//! | `*name` | the rest of the path, slashes included | `/file/*path` |
//! | `( ... )` | an optional group | `/posts(/:page)` |
//!
//! Everything else matches literally. Rules are anchored at both ends, so
//! `/user/:id` does not match `/user/1/edit`.

use once_cell::sync::Lazy;
use regex::Regex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Maximum number of captured parameters before heap allocation.
pub const MAX_INLINE_PARAMS: usize = 8;

/// Captured `(name, value)` pairs in rule order; values are percent-decoded.
pub type ParamVec = SmallVec<[(Arc<str>, String); MAX_INLINE_PARAMS]>;

static TOKEN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"[:*]([A-Za-z_][A-Za-z0-9_]*)|[()]").ok());

/// A rule that cannot be compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// Rules must be absolute paths.
    MissingLeadingSlash { rule: String },
    /// `:` or `*` not followed by a parameter name.
    MissingName { rule: String, position: usize },
    /// The same parameter name appears twice.
    DuplicateName { rule: String, name: String },
    /// Parentheses do not pair up.
    UnbalancedGroup { rule: String },
    /// The generated expression was rejected by the regex engine.
    Regex { rule: String, message: String },
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternError::MissingLeadingSlash { rule } => {
                write!(f, "route rule '{rule}' must start with '/'")
            }
            PatternError::MissingName { rule, position } => {
                write!(f, "route rule '{rule}' has an unnamed parameter at byte {position}")
            }
            PatternError::DuplicateName { rule, name } => {
                write!(f, "route rule '{rule}' uses parameter '{name}' more than once")
            }
            PatternError::UnbalancedGroup { rule } => {
                write!(f, "route rule '{rule}' has unbalanced parentheses")
            }
            PatternError::Regex { rule, message } => {
                write!(f, "route rule '{rule}' did not compile: {message}")
            }
        }
    }
}

impl std::error::Error for PatternError {}

/// A compiled route rule.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    rule: String,
    regex: Regex,
    names: Vec<Arc<str>>,
}

impl RoutePattern {
    /// Compile `rule` into an anchored regex.
    ///
    /// ```
    /// use wsgilite::router::RoutePattern;
    ///
    /// let pattern = RoutePattern::parse("/user/:id").unwrap();
    /// let params = pattern.captures("/user/42").unwrap();
    /// assert_eq!(&*params[0].0, "id");
    /// assert_eq!(params[0].1, "42");
    /// ```
    pub fn parse(rule: &str) -> Result<Self, PatternError> {
        if !rule.starts_with('/') {
            return Err(PatternError::MissingLeadingSlash { rule: rule.to_string() });
        }
        let tokenizer = TOKEN.as_ref().ok_or_else(|| PatternError::Regex {
            rule: rule.to_string(),
            message: "tokenizer unavailable".to_string(),
        })?;

        let mut pattern = String::with_capacity(rule.len() + 16);
        pattern.push('^');
        let mut names: Vec<Arc<str>> = Vec::new();
        let mut depth = 0usize;
        let mut cursor = 0usize;

        for token in tokenizer.captures_iter(rule) {
            let Some(whole) = token.get(0) else { continue };
            push_literal(&mut pattern, rule, cursor, whole.start())?;
            cursor = whole.end();

            match whole.as_str() {
                "(" => {
                    depth += 1;
                    pattern.push_str("(?:");
                }
                ")" => {
                    depth = depth.checked_sub(1).ok_or_else(|| PatternError::UnbalancedGroup {
                        rule: rule.to_string(),
                    })?;
                    pattern.push_str(")?");
                }
                text => {
                    let name = token.get(1).map(|m| m.as_str()).unwrap_or_default();
                    if names.iter().any(|n| &**n == name) {
                        return Err(PatternError::DuplicateName {
                            rule: rule.to_string(),
                            name: name.to_string(),
                        });
                    }
                    names.push(Arc::from(name));
                    if text.starts_with(':') {
                        pattern.push_str("([^/]+)");
                    } else {
                        pattern.push_str("(.*)");
                    }
                }
            }
        }
        push_literal(&mut pattern, rule, cursor, rule.len())?;
        if depth != 0 {
            return Err(PatternError::UnbalancedGroup { rule: rule.to_string() });
        }
        pattern.push('$');

        let regex = Regex::new(&pattern).map_err(|err| PatternError::Regex {
            rule: rule.to_string(),
            message: err.to_string(),
        })?;

        Ok(Self {
            rule: rule.to_string(),
            regex,
            names,
        })
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }

    /// Parameter names in rule order.
    pub fn names(&self) -> &[Arc<str>] {
        &self.names
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Match `path` and return its parameters, or `None` if it does not
    /// match. Parameters inside an optional group that did not participate
    /// are left out.
    pub fn captures(&self, path: &str) -> Option<ParamVec> {
        let caps = self.regex.captures(path)?;
        let mut params = ParamVec::new();
        for (i, name) in self.names.iter().enumerate() {
            if let Some(m) = caps.get(i + 1) {
                let value = urlencoding::decode(m.as_str())
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| m.as_str().to_string());
                params.push((Arc::clone(name), value));
            }
        }
        Some(params)
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rule)
    }
}

fn push_literal(
    pattern: &mut String,
    rule: &str,
    start: usize,
    end: usize,
) -> Result<(), PatternError> {
    let literal = &rule[start..end];
    if let Some(offset) = literal.find([':', '*']) {
        return Err(PatternError::MissingName {
            rule: rule.to_string(),
            position: start + offset,
        });
    }
    pattern.push_str(&regex::escape(literal));
    Ok(())
}
