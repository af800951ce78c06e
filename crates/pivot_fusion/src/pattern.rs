//! Key-pattern compiler.
//!
//! A pattern string such as `users##{group}##{user_id}##{}` compiles into an
//! ordered segment list: literal text, named captures (`{name}`), and at most
//! one attribute slot (`{}`). Captures form the identity of a logical row;
//! the attribute names which column a physical key populates.

use crate::error::{PivotError, PivotResult};

/// One compiled pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Fixed byte run that must match exactly.
    Literal(String),
    /// Named variable segment; part of the row identity.
    Capture(String),
    /// Trailing-column slot; its key bytes name the populated column.
    Attr,
}

impl Segment {
    fn is_literal(&self) -> bool {
        matches!(self, Segment::Literal(_))
    }
}

/// Compiled key pattern.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    pattern: String,
    segments: Vec<Segment>,
    capture_names: Vec<String>,
    literal_prefix: String,
    has_attr: bool,
}

impl KeyPattern {
    /// Compiles `pattern`, rejecting ambiguous or malformed shapes.
    ///
    /// Two non-literal segments must be separated by at least one literal
    /// byte, otherwise decomposition of a key is ambiguous.
    pub fn compile(pattern: &str) -> PivotResult<Self> {
        if pattern.is_empty() {
            return Err(PivotError::pattern("pattern cannot be empty"));
        }

        let segments = tokenize(pattern);

        let mut capture_names = Vec::new();
        let mut has_attr = false;
        let mut previous_was_variable = false;
        for segment in &segments {
            match segment {
                Segment::Literal(_) => previous_was_variable = false,
                Segment::Capture(name) => {
                    if previous_was_variable {
                        return Err(PivotError::pattern(format!(
                            "capture '{{{name}}}' must be separated from the previous \
                             variable segment by literal text"
                        )));
                    }
                    if capture_names.iter().any(|existing| existing == name) {
                        return Err(PivotError::pattern(format!(
                            "duplicate capture name '{name}'"
                        )));
                    }
                    capture_names.push(name.clone());
                    previous_was_variable = true;
                }
                Segment::Attr => {
                    if previous_was_variable {
                        return Err(PivotError::pattern(
                            "attribute slot '{}' must be separated from the previous \
                             variable segment by literal text",
                        ));
                    }
                    if has_attr {
                        return Err(PivotError::pattern(
                            "pattern may contain at most one attribute slot '{}'",
                        ));
                    }
                    has_attr = true;
                    previous_was_variable = true;
                }
            }
        }

        let literal_prefix = segments
            .iter()
            .take_while(|segment| segment.is_literal())
            .map(|segment| match segment {
                Segment::Literal(text) => text.as_str(),
                _ => unreachable!(),
            })
            .collect();

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
            capture_names,
            literal_prefix,
            has_attr,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Capture names in pattern order.
    pub fn capture_names(&self) -> &[String] {
        &self.capture_names
    }

    pub fn capture_count(&self) -> usize {
        self.capture_names.len()
    }

    /// Concatenation of leading literal segments before the first variable.
    pub fn literal_prefix(&self) -> &str {
        &self.literal_prefix
    }

    pub fn has_attr(&self) -> bool {
        self.has_attr
    }

    pub fn has_capture(&self, name: &str) -> bool {
        self.capture_index(name).is_some()
    }

    /// Positional index of a capture name, if declared.
    pub fn capture_index(&self, name: &str) -> Option<usize> {
        self.capture_names.iter().position(|cap| cap == name)
    }
}

/// Splits the raw pattern into segments without validating adjacency.
///
/// A brace run that is not `{}` or `{[A-Za-z0-9_]+}` is plain literal text.
fn tokenize(pattern: &str) -> Vec<Segment> {
    let bytes = pattern.as_bytes();
    let mut segments: Vec<Segment> = Vec::new();
    let mut literal = String::new();
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos] == b'{' {
            if let Some(end) = pattern[pos..].find('}').map(|offset| pos + offset) {
                let name = &pattern[pos + 1..end];
                if name.is_empty() || is_capture_name(name) {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    if name.is_empty() {
                        segments.push(Segment::Attr);
                    } else {
                        segments.push(Segment::Capture(name.to_string()));
                    }
                    pos = end + 1;
                    continue;
                }
            }
        }
        let ch = pattern[pos..].chars().next().expect("in-bounds char");
        literal.push(ch);
        pos += ch.len_utf8();
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

fn is_capture_name(name: &str) -> bool {
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_captures_attr_and_literals() {
        let pattern = KeyPattern::compile("users##{group}##{user_id}##{}").unwrap();
        assert_eq!(
            pattern.segments(),
            &[
                Segment::Literal("users##".into()),
                Segment::Capture("group".into()),
                Segment::Literal("##".into()),
                Segment::Capture("user_id".into()),
                Segment::Literal("##".into()),
                Segment::Attr,
            ]
        );
        assert_eq!(pattern.capture_names(), &["group", "user_id"]);
        assert_eq!(pattern.literal_prefix(), "users##");
        assert!(pattern.has_attr());
        assert_eq!(pattern.capture_index("user_id"), Some(1));
        assert_eq!(pattern.capture_index("missing"), None);
    }

    #[test]
    fn literal_prefix_is_empty_when_pattern_starts_variable() {
        let pattern = KeyPattern::compile("{a}/{}").unwrap();
        assert_eq!(pattern.literal_prefix(), "");
        assert_eq!(pattern.capture_count(), 1);
    }

    #[test]
    fn rejects_adjacent_variable_segments() {
        for bad in ["{}{x}", "{x}{y}", "{}{}", "a{x}{y}b", "{x}{}"] {
            let err = KeyPattern::compile(bad).unwrap_err();
            assert!(matches!(err, PivotError::Pattern(_)), "pattern {bad}");
        }
    }

    #[test]
    fn rejects_duplicate_captures_and_double_attr() {
        assert!(KeyPattern::compile("{a}#{a}").is_err());
        assert!(KeyPattern::compile("{}#{}#x").is_err());
        assert!(KeyPattern::compile("").is_err());
    }

    #[test]
    fn malformed_braces_are_literal_text() {
        let pattern = KeyPattern::compile("v1/{a-b}/{x}").unwrap();
        assert_eq!(
            pattern.segments(),
            &[
                Segment::Literal("v1/{a-b}/".into()),
                Segment::Capture("x".into()),
            ]
        );
        assert!(!pattern.has_attr());
    }
}
