//! Route pattern compilation.
//!
//! A registration pattern follows the grammar `[METHOD[,METHOD...]:]PATH[@DOMAIN]`:
//!
//! | Pattern                   | Meaning                                      |
//! |---------------------------|----------------------------------------------|
//! | `/users`                  | literal path, any domain, all methods        |
//! | `GET:/users/:id`          | named parameter segment, GET only            |
//! | `GET,POST:/users`         | one compiled pattern per listed method       |
//! | `/files/*path`            | wildcard tail (also bare `*`)                |
//! | `/admin-{page}@admin.io`  | `{field}` placeholder, bound to one domain   |
//!
//! Compilation classifies each `/`-delimited segment as literal, named
//! parameter (`:name`), wildcard (`*name`/`*`), or field-embedded
//! (`seg-{name}`), and produces an anchored matcher regex plus the ordered
//! capture names. Patterns are immutable after compilation.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::http::{MethodSpec, UnsupportedMethod};

/// Domain used when a pattern carries no `@DOMAIN` suffix.
pub const DEFAULT_DOMAIN: &str = "default";

/// Errors produced while compiling a route pattern.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("pattern {0:?} has an empty path")]
    EmptyPath(String),

    #[error("pattern {0:?}: path must start with '/'")]
    MissingLeadingSlash(String),

    #[error("pattern {pattern:?}: {source}")]
    Method {
        pattern: String,
        #[source]
        source: UnsupportedMethod,
    },

    #[error("pattern {pattern:?}: matcher compilation failed: {source}")]
    Matcher {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// How a single path segment matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Literal,
    Param,
    Wildcard,
    Field,
}

/// A compiled, immutable route pattern.
///
/// Carries everything the index and comparator need precomputed: the matcher
/// regex, ordered parameter names, path depth, the fuzzy-marker count, the
/// stripped-literal length, and the dominant placeholder kind.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    domain: String,
    method: MethodSpec,
    path: String,
    priority: usize,
    matcher: Regex,
    prefix_matcher: Regex,
    param_names: Vec<String>,
    fuzzy: bool,
    fuzzy_markers: usize,
    literal_len: usize,
    kind_score: u8,
}

impl RoutePattern {
    /// Compiles a pattern string into one `RoutePattern` per declared method.
    ///
    /// Multi-method declarations (`GET,POST:/x`) share the compiled matcher.
    ///
    /// # Errors
    ///
    /// [`PatternError`] when the path is empty, lacks a leading `/`, names an
    /// unsupported method, or produces an uncompilable matcher.
    pub fn parse(pattern: &str) -> Result<Vec<Arc<RoutePattern>>, PatternError> {
        let trimmed = pattern.trim();

        // Trailing @DOMAIN
        let (rest, domain) = match trimmed.rfind('@') {
            Some(pos) => (&trimmed[..pos], trimmed[pos + 1..].trim().to_owned()),
            None => (trimmed, DEFAULT_DOMAIN.to_owned()),
        };

        // Leading METHOD[,METHOD...]:
        let (methods, raw_path) = match rest.find(':') {
            Some(pos)
                if pos > 0
                    && rest[..pos]
                        .chars()
                        .all(|c| c.is_ascii_alphabetic() || c == ',') =>
            {
                let mut methods = Vec::new();
                for name in rest[..pos].split(',').filter(|s| !s.is_empty()) {
                    let spec: MethodSpec =
                        name.parse().map_err(|source| PatternError::Method {
                            pattern: pattern.to_owned(),
                            source,
                        })?;
                    methods.push(spec);
                }
                (methods, &rest[pos + 1..])
            }
            _ => (vec![MethodSpec::All], rest),
        };

        let raw_path = raw_path.trim();
        if raw_path.is_empty() {
            return Err(PatternError::EmptyPath(pattern.to_owned()));
        }
        if !raw_path.starts_with('/') {
            return Err(PatternError::MissingLeadingSlash(pattern.to_owned()));
        }

        // Right-trim trailing slashes, keeping the root itself.
        let mut path = raw_path.trim_end_matches('/').to_owned();
        if path.is_empty() {
            path.push('/');
        }

        let compiled = compile_path(pattern, &path)?;
        let priority = path.matches('/').count();

        Ok(methods
            .into_iter()
            .map(|method| {
                Arc::new(RoutePattern {
                    domain: domain.clone(),
                    method,
                    path: path.clone(),
                    priority,
                    matcher: compiled.matcher.clone(),
                    prefix_matcher: compiled.prefix_matcher.clone(),
                    param_names: compiled.param_names.clone(),
                    fuzzy: compiled.fuzzy,
                    fuzzy_markers: compiled.fuzzy_markers,
                    literal_len: compiled.literal_len,
                    kind_score: compiled.kind_score,
                })
            })
            .collect())
    }

    /// Routing domain this pattern is bound to.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Method spec this pattern is bound to.
    pub fn method(&self) -> &MethodSpec {
        &self.method
    }

    /// Normalized path (no trailing slash except the root).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path depth: the number of `/` characters in the path.
    pub fn priority(&self) -> usize {
        self.priority
    }

    /// Ordered capture names, aligned with the matcher's groups.
    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    /// `true` when any segment matches by rule rather than literally.
    pub fn is_fuzzy(&self) -> bool {
        self.fuzzy
    }

    /// Number of placeholder markers across the whole path.
    pub fn fuzzy_markers(&self) -> usize {
        self.fuzzy_markers
    }

    /// Path length with placeholder tokens stripped.
    pub fn literal_len(&self) -> usize {
        self.literal_len
    }

    /// Dominant placeholder kind: `{field}` 3, `:name` 2, `*wildcard` 1, none 0.
    pub fn kind_score(&self) -> u8 {
        self.kind_score
    }

    /// Tests `path` against the exact matcher, binding parameters positionally.
    pub fn match_path(&self, path: &str) -> Option<Vec<(String, String)>> {
        self.bind(&self.matcher, path)
    }

    /// Tests `path` against the prefix matcher (the pattern itself or any
    /// sub-path of it). Middleware entries match this way so a chain bound at
    /// `/api` wraps every handler underneath it.
    pub fn match_prefix(&self, path: &str) -> Option<Vec<(String, String)>> {
        self.bind(&self.prefix_matcher, path)
    }

    fn bind(&self, matcher: &Regex, path: &str) -> Option<Vec<(String, String)>> {
        let captures = matcher.captures(path)?;
        let params = self
            .param_names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                captures
                    .get(i + 1)
                    .map(|m| (name.clone(), m.as_str().to_owned()))
            })
            .collect();
        Some(params)
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.method, self.path, self.domain)
    }
}

/// Splits a normalized path into its non-empty segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// `true` when a segment matches by rule: `:name`, `*`, `*name`, or an
/// embedded `{field}` placeholder.
pub fn is_fuzzy_segment(segment: &str) -> bool {
    segment.starts_with(':') || segment.starts_with('*') || segment.contains('{')
}

struct CompiledPath {
    matcher: Regex,
    prefix_matcher: Regex,
    param_names: Vec<String>,
    fuzzy: bool,
    fuzzy_markers: usize,
    literal_len: usize,
    kind_score: u8,
}

fn compile_path(pattern: &str, path: &str) -> Result<CompiledPath, PatternError> {
    let mut body = String::with_capacity(path.len() + 16);
    body.push('^');
    let mut param_names = Vec::new();
    let mut fuzzy_markers = 0usize;
    let mut stripped = String::with_capacity(path.len());
    let mut has_field = false;
    let mut has_param = false;
    let mut has_wildcard = false;

    let segs = segments(path);
    if segs.is_empty() {
        body.push('/');
        stripped.push('/');
    }
    for seg in &segs {
        body.push('/');
        stripped.push('/');
        if let Some(name) = seg.strip_prefix(':') {
            body.push_str("([^/]+)");
            param_names.push(name.to_owned());
            fuzzy_markers += 1;
            has_param = true;
        } else if let Some(name) = seg.strip_prefix('*') {
            body.push_str("(.*)");
            param_names.push(if name.is_empty() {
                "*".to_owned()
            } else {
                name.to_owned()
            });
            fuzzy_markers += 1;
            has_wildcard = true;
        } else if seg.contains('{') {
            compile_field_segment(seg, &mut body, &mut stripped, &mut param_names);
            fuzzy_markers += seg.matches('{').count();
            has_field = true;
        } else {
            body.push_str(&regex::escape(seg));
            stripped.push_str(seg);
        }
    }

    let exact = format!("{body}$");
    let prefix = if segs.is_empty() {
        "^/.*$".to_owned()
    } else {
        format!("{body}(?:/.*)?$")
    };

    let matcher = Regex::new(&exact).map_err(|source| PatternError::Matcher {
        pattern: pattern.to_owned(),
        source,
    })?;
    let prefix_matcher = Regex::new(&prefix).map_err(|source| PatternError::Matcher {
        pattern: pattern.to_owned(),
        source,
    })?;

    let kind_score = if has_field {
        3
    } else if has_param {
        2
    } else if has_wildcard {
        1
    } else {
        0
    };

    Ok(CompiledPath {
        matcher,
        prefix_matcher,
        fuzzy: fuzzy_markers > 0,
        fuzzy_markers,
        literal_len: stripped.len(),
        kind_score,
        param_names,
    })
}

/// Rewrites a segment with embedded `{name}` placeholders, e.g.
/// `admin-{page}` → `admin\-([^/]+)` with `page` captured.
fn compile_field_segment(
    seg: &str,
    body: &mut String,
    stripped: &mut String,
    param_names: &mut Vec<String>,
) {
    let mut rest = seg;
    while let Some(open) = rest.find('{') {
        let literal = &rest[..open];
        body.push_str(&regex::escape(literal));
        stripped.push_str(literal);
        match rest[open..].find('}') {
            Some(close) => {
                param_names.push(rest[open + 1..open + close].to_owned());
                body.push_str("([^/]+)");
                rest = &rest[open + close + 1..];
            }
            None => {
                // Unterminated brace: treat the remainder literally.
                body.push_str(&regex::escape(&rest[open..]));
                stripped.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    body.push_str(&regex::escape(rest));
    stripped.push_str(rest);
}
