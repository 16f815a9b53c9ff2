//! Input mappings: projecting state into node arguments.
//!
//! Agent and subgraph nodes declare an `input_mapping`: target argument
//! name to a selector over the state snapshot. Selectors start with `$.`
//! and support property chaining, indexed access, a `*` wildcard over
//! arrays (used when reading a join's aggregated list), and a default
//! literal after `||`:
//!
//! ```text
//! question:  $.request.question
//! first:     $.items[0]
//! titles:    $.results[*].title
//! limit:     $.options.limit || 10
//! ```
//!
//! Selectors are parsed at compile time; application never fails: a
//! missing path resolves to the declared default, or `null`.

use serde_json::Value;
use thiserror::Error;

/// Parse failure for a selector.
#[derive(Debug, Error)]
#[error("invalid selector '{selector}': {detail}")]
pub struct MappingParseError {
    pub selector: String,
    pub detail: String,
}

/// One step of a selector path.
#[derive(Debug, Clone, PartialEq)]
enum Seg {
    Key(String),
    Index(usize),
    Wildcard,
}

/// A compiled `$.`-selector with optional default.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    segments: Vec<Seg>,
    default: Option<Value>,
    raw: String,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, MappingParseError> {
        let err = |detail: String| MappingParseError {
            selector: source.to_string(),
            detail,
        };

        let (path_part, default) = match source.split_once("||") {
            Some((path, fallback)) => {
                let literal: Value = serde_json::from_str(fallback.trim())
                    .map_err(|e| err(format!("default is not a JSON literal: {e}")))?;
                (path.trim(), Some(literal))
            }
            None => (source.trim(), None),
        };

        let rest = path_part
            .strip_prefix('$')
            .ok_or_else(|| err("selector must start with '$.'".into()))?;

        let mut segments = Vec::new();
        let chars: Vec<char> = rest.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '.' => {
                    i += 1;
                    if i < chars.len() && chars[i] == '*' {
                        segments.push(Seg::Wildcard);
                        i += 1;
                        continue;
                    }
                    let start = i;
                    while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                        i += 1;
                    }
                    if start == i {
                        return Err(err("expected property name after '.'".into()));
                    }
                    segments.push(Seg::Key(chars[start..i].iter().collect()));
                }
                '[' => {
                    i += 1;
                    if i < chars.len() && chars[i] == '*' {
                        segments.push(Seg::Wildcard);
                        i += 1;
                    } else if i < chars.len() && (chars[i] == '\'' || chars[i] == '"') {
                        let quote = chars[i];
                        i += 1;
                        let start = i;
                        while i < chars.len() && chars[i] != quote {
                            i += 1;
                        }
                        if i == chars.len() {
                            return Err(err("unterminated quoted key".into()));
                        }
                        segments.push(Seg::Key(chars[start..i].iter().collect()));
                        i += 1;
                    } else {
                        let start = i;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                        if start == i {
                            return Err(err("expected index, '*', or quoted key in brackets".into()));
                        }
                        let text: String = chars[start..i].iter().collect();
                        let index = text
                            .parse::<usize>()
                            .map_err(|_| err(format!("invalid index '{text}'")))?;
                        segments.push(Seg::Index(index));
                    }
                    if i >= chars.len() || chars[i] != ']' {
                        return Err(err("expected closing ']'".into()));
                    }
                    i += 1;
                }
                other => return Err(err(format!("unexpected character '{other}'"))),
            }
        }

        if segments.is_empty() {
            return Err(err("selector selects nothing".into()));
        }

        Ok(Self {
            segments,
            default,
            raw: source.to_string(),
        })
    }

    /// Resolve against a state snapshot. Missing paths yield the declared
    /// default, or `null`.
    pub fn apply(&self, state: &Value) -> Value {
        let resolved = resolve(state, &self.segments);
        match resolved {
            Value::Null => self.default.clone().unwrap_or(Value::Null),
            found => found,
        }
    }

    /// Top-level state property this selector reads.
    pub fn root_property(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Seg::Key(key)) => Some(key),
            _ => None,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

fn resolve(value: &Value, segments: &[Seg]) -> Value {
    let Some((head, rest)) = segments.split_first() else {
        return value.clone();
    };
    match head {
        Seg::Key(key) => match value.get(key) {
            Some(next) => resolve(next, rest),
            None => Value::Null,
        },
        Seg::Index(index) => match value.get(index) {
            Some(next) => resolve(next, rest),
            None => Value::Null,
        },
        Seg::Wildcard => match value.as_array() {
            Some(items) => Value::Array(
                items
                    .iter()
                    .map(|item| resolve(item, rest))
                    .filter(|v| !v.is_null())
                    .collect(),
            ),
            None => Value::Null,
        },
    }
}

/// A compiled `input_mapping`: target argument name → selector.
///
/// Entries keep declaration order so the produced argument bundle is
/// stable for digests and transcripts.
#[derive(Debug, Clone, Default)]
pub struct InputMapping {
    entries: Vec<(String, Selector)>,
}

impl InputMapping {
    /// Compile a mapping of `target → selector` strings.
    pub fn parse<'a, I>(entries: I) -> Result<Self, MappingParseError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut compiled = Vec::new();
        for (target, selector) in entries {
            compiled.push((target.to_string(), Selector::parse(selector)?));
        }
        compiled.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self { entries: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the argument bundle for a node from the state snapshot.
    pub fn apply(&self, state: &Value) -> Value {
        let mut bundle = serde_json::Map::new();
        for (target, selector) in &self.entries {
            bundle.insert(target.clone(), selector.apply(state));
        }
        Value::Object(bundle)
    }

    /// Top-level state properties this mapping reads.
    pub fn root_properties(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|(_, s)| s.root_property())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn property_chain() {
        let sel = Selector::parse("$.request.question").unwrap();
        let state = json!({"request": {"question": "why?"}});
        assert_eq!(sel.apply(&state), json!("why?"));
    }

    #[test]
    fn indexed_access() {
        let sel = Selector::parse("$.items[1]").unwrap();
        assert_eq!(sel.apply(&json!({"items": ["a", "b"]})), json!("b"));
        assert_eq!(sel.apply(&json!({"items": []})), Value::Null);
    }

    #[test]
    fn wildcard_collects_over_arrays() {
        let sel = Selector::parse("$.results[*].title").unwrap();
        let state = json!({"results": [
            {"title": "one"},
            {"score": 2},
            {"title": "three"}
        ]});
        assert_eq!(sel.apply(&state), json!(["one", "three"]));
    }

    #[test]
    fn dot_star_wildcard() {
        let sel = Selector::parse("$.results.*.title").unwrap();
        let state = json!({"results": [{"title": "x"}]});
        assert_eq!(sel.apply(&state), json!(["x"]));
    }

    #[test]
    fn default_literal_used_for_missing() {
        let sel = Selector::parse("$.options.limit || 10").unwrap();
        assert_eq!(sel.apply(&json!({})), json!(10));
        assert_eq!(sel.apply(&json!({"options": {"limit": 3}})), json!(3));
    }

    #[test]
    fn quoted_keys() {
        let sel = Selector::parse("$[\"odd key\"].x").unwrap();
        assert_eq!(sel.apply(&json!({"odd key": {"x": 1}})), json!(1));
    }

    #[test]
    fn parse_failures() {
        assert!(Selector::parse("request.question").is_err());
        assert!(Selector::parse("$.").is_err());
        assert!(Selector::parse("$.a[").is_err());
        assert!(Selector::parse("$.a || not-json").is_err());
        assert!(Selector::parse("$").is_err());
    }

    #[test]
    fn mapping_builds_sorted_bundle() {
        let mapping = InputMapping::parse([
            ("question", "$.q"),
            ("attempts", "$.meta.attempts || 0"),
        ])
        .unwrap();
        let bundle = mapping.apply(&json!({"q": "hello"}));
        assert_eq!(bundle, json!({"attempts": 0, "question": "hello"}));
        assert_eq!(mapping.root_properties(), vec!["meta", "q"]);
    }
}
