//! Route segments and URL patterns.

use percent_encoding::percent_decode_str;
use regex_lite::Regex;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// One piece of a route segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Static(String),
    /// `[name]`
    Param(String),
    /// `[...name]`
    Rest(String),
}

/// A parsed path segment, e.g. `post-[id]` → `[Static("post-"), Param("id")]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub parts: Vec<Part>,
}

/// How specific a segment is. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SegmentRank {
    Static,
    Mixed,
    Dynamic,
    Rest,
}

impl Segment {
    /// Parse a file or directory name into a segment.
    pub fn parse(name: &str) -> Result<Self, String> {
        let mut parts = Vec::new();
        let mut rest = name;

        while !rest.is_empty() {
            match rest.find('[') {
                Some(0) => {
                    let close = rest
                        .find(']')
                        .ok_or_else(|| format!("Unclosed '[' in '{name}'"))?;
                    let inner = &rest[1..close];
                    let part = match inner.strip_prefix("...") {
                        Some(param) => Part::Rest(check_param(name, param)?),
                        None => Part::Param(check_param(name, inner)?),
                    };
                    if matches!(parts.last(), Some(Part::Param(_) | Part::Rest(_))) {
                        return Err(format!(
                            "Parameters in '{name}' must be separated by static text"
                        ));
                    }
                    parts.push(part);
                    rest = &rest[close + 1..];
                }
                Some(open) => {
                    parts.push(Part::Static(check_static(name, &rest[..open])?));
                    rest = &rest[open..];
                }
                None => {
                    parts.push(Part::Static(check_static(name, rest)?));
                    rest = "";
                }
            }
        }

        let has_rest = parts.iter().any(|p| matches!(p, Part::Rest(_)));
        if has_rest && parts.len() > 1 {
            return Err(format!(
                "Rest parameter in '{name}' must be the whole segment"
            ));
        }

        Ok(Self { parts })
    }

    #[must_use]
    pub fn rank(&self) -> SegmentRank {
        let dynamic = self
            .parts
            .iter()
            .filter(|p| !matches!(p, Part::Static(_)))
            .count();
        match self.parts.as_slice() {
            [Part::Rest(_)] => SegmentRank::Rest,
            _ if dynamic == 0 => SegmentRank::Static,
            _ if dynamic == self.parts.len() => SegmentRank::Dynamic,
            _ => SegmentRank::Mixed,
        }
    }
}

fn check_param(name: &str, param: &str) -> Result<String, String> {
    let valid = !param.is_empty()
        && param
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if valid {
        Ok(param.to_string())
    } else {
        Err(format!("Invalid parameter name '{param}' in '{name}'"))
    }
}

fn check_static(name: &str, text: &str) -> Result<String, String> {
    if text.contains(']') {
        return Err(format!("Unexpected ']' in '{name}'"));
    }
    Ok(text.to_string())
}

/// Value of one route parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Single(String),
    /// Rest parameters, split on `/`.
    Rest(Vec<String>),
}

pub type Params = BTreeMap<String, ParamValue>;

/// Anchored URL pattern for a route.
#[derive(Clone)]
pub struct RoutePattern {
    regex: Regex,
    /// `(name, is_rest)` in capture order.
    params: Vec<(String, bool)>,
}

impl RoutePattern {
    /// Build the pattern for a route made of `segments`.
    ///
    /// # Errors
    /// Returns the regex error message if the pattern does not compile.
    pub fn new(segments: &[Segment]) -> Result<Self, String> {
        let mut source = String::from("^");
        let mut params = Vec::new();

        for segment in segments {
            source.push('/');
            for part in &segment.parts {
                match part {
                    Part::Static(text) => source.push_str(&regex_lite::escape(text)),
                    Part::Param(name) => {
                        source.push_str("([^/]+?)");
                        params.push((name.clone(), false));
                    }
                    Part::Rest(name) => {
                        source.push_str("(.+?)");
                        params.push((name.clone(), true));
                    }
                }
            }
        }

        if segments.is_empty() {
            source.push_str("/$");
        } else {
            source.push_str("/?$");
        }

        let regex = Regex::new(&source).map_err(|e| e.to_string())?;
        Ok(Self { regex, params })
    }

    /// Parameter names in order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(name, _)| name.as_str())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Match `path` and extract its parameters, percent-decoded.
    #[must_use]
    pub fn exec(&self, path: &str) -> Option<Params> {
        let captures = self.regex.captures(path)?;
        let mut params = Params::new();
        for (i, (name, rest)) in self.params.iter().enumerate() {
            let raw = captures.get(i + 1).map_or("", |m| m.as_str());
            let value = if *rest {
                ParamValue::Rest(decode(raw).split('/').map(str::to_string).collect())
            } else {
                ParamValue::Single(decode(raw))
            };
            params.insert(name.clone(), value);
        }
        Some(params)
    }
}

impl fmt::Debug for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutePattern({})", self.as_str())
    }
}

impl PartialEq for RoutePattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for RoutePattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

fn decode(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}
