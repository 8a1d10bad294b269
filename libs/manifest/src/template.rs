//! The manifest expression language: `{{ path.to.value[index] }}`.
//!
//! Grammar:
//! ```text
//! path    := segment ('.' segment)*
//! segment := identifier ('[' integer ']')?
//! ```
//! Unresolvable or malformed paths render as the empty string, so a sloppy
//! manifest degrades to blank fields instead of failing a send.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path expression")]
    Empty,
    #[error("invalid path expression at byte {0}")]
    Invalid(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    key: String,
    index: Option<usize>,
}

/// A parsed dotted-path accessor with optional array indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    segments: Vec<Segment>,
}

impl PathExpr {
    pub fn parse(input: &str) -> Result<Self, PathError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(PathError::Empty);
        }
        let bytes = input.as_bytes();
        let mut segments = Vec::new();
        let mut pos = 0;
        loop {
            let key_start = pos;
            while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                pos += 1;
            }
            if pos == key_start {
                return Err(PathError::Invalid(pos));
            }
            let key = input[key_start..pos].to_string();
            let mut index = None;
            if pos < bytes.len() && bytes[pos] == b'[' {
                pos += 1;
                let digit_start = pos;
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
                if pos == digit_start || pos >= bytes.len() || bytes[pos] != b']' {
                    return Err(PathError::Invalid(pos));
                }
                index = input[digit_start..pos].parse().ok();
                pos += 1;
            }
            segments.push(Segment { key, index });
            if pos == bytes.len() {
                break;
            }
            if bytes[pos] != b'.' {
                return Err(PathError::Invalid(pos));
            }
            pos += 1;
        }
        Ok(Self { segments })
    }

    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = current.as_object()?.get(&segment.key)?;
            if let Some(index) = segment.index {
                current = current.as_array()?.get(index)?;
            }
        }
        Some(current)
    }
}

/// Resolves a dotted path against a JSON value, or `None` when the path is
/// malformed or absent.
pub fn extract<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    PathExpr::parse(path).ok()?.resolve(root)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Renders a template, substituting every `{{ expr }}` with its resolved
/// value. Unresolvable expressions become empty strings.
pub fn render(template: &str, ctx: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let expr = &after_open[..close];
                if let Some(value) = extract(ctx, expr) {
                    out.push_str(&value_to_string(value));
                }
                rest = &after_open[close + 2..];
            }
            None => {
                // Unterminated placeholder: emit the tail verbatim.
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_segments_and_indexes() {
        let expr = PathExpr::parse("data.items[2].id").unwrap();
        let root = json!({ "data": { "items": [{}, {}, { "id": "x9" }] } });
        assert_eq!(expr.resolve(&root), Some(&json!("x9")));
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(PathExpr::parse("").is_err());
        assert!(PathExpr::parse(".leading").is_err());
        assert!(PathExpr::parse("a..b").is_err());
        assert!(PathExpr::parse("a[").is_err());
        assert!(PathExpr::parse("a[x]").is_err());
        assert!(PathExpr::parse("a[1").is_err());
        assert!(PathExpr::parse("a b").is_err());
    }

    #[test]
    fn renders_against_context() {
        let ctx = json!({
            "to": "+15551234567",
            "creds": { "api_key": "k-123" },
            "settings": { "regions": ["us", "eu"] }
        });
        assert_eq!(
            render("to={{ to }}&key={{ creds.api_key }}&r={{ settings.regions[1] }}", &ctx),
            "to=+15551234567&key=k-123&r=eu"
        );
    }

    #[test]
    fn unresolvable_paths_render_empty() {
        let ctx = json!({ "to": "1" });
        assert_eq!(render("a={{ missing.deep }}&b={{ to }}", &ctx), "a=&b=1");
        assert_eq!(render("x={{ !!bad!! }}", &ctx), "x=");
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        let ctx = json!({});
        assert_eq!(render("tail {{ never", &ctx), "tail {{ never");
    }

    #[test]
    fn non_string_scalars_stringify() {
        let ctx = json!({ "n": 42, "b": true, "nil": null });
        assert_eq!(render("{{ n }}/{{ b }}/{{ nil }}", &ctx), "42/true/");
    }
}
