//! Channel name patterns.
//!
//! Channel names are `:`-separated ("room:42:general").  A pattern segment
//! may be a parameter:
//! - `{name}` — binds exactly one segment
//! - `{name?}` — optional; binds one segment if present
//! - `{name*}` — binds the whole remainder (must be last)
//!
//! `room:{id}` matches `room:42` with `id = "42"`.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    OptionalParam(String),
    RestParam(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPattern {
    segments: Vec<Segment>,
}

impl ChannelPattern {
    pub fn parse(pattern: &str) -> Self {
        let segments = pattern
            .split(':')
            .map(|part| {
                if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                    if let Some(name) = inner.strip_suffix('*') {
                        Segment::RestParam(name.to_owned())
                    } else if let Some(name) = inner.strip_suffix('?') {
                        Segment::OptionalParam(name.to_owned())
                    } else {
                        Segment::Param(inner.to_owned())
                    }
                } else {
                    Segment::Literal(part.to_owned())
                }
            })
            .collect();
        ChannelPattern { segments }
    }

    /// Match a concrete channel name; on success returns the bound
    /// parameters.
    pub fn matches(&self, name: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = name.split(':').collect();
        let mut params = HashMap::new();
        let mut idx = 0;

        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => {
                    if parts.get(idx) != Some(&lit.as_str()) {
                        return None;
                    }
                    idx += 1;
                }
                Segment::Param(name) => {
                    let part = parts.get(idx)?;
                    params.insert(name.clone(), (*part).to_owned());
                    idx += 1;
                }
                Segment::OptionalParam(name) => {
                    if let Some(part) = parts.get(idx) {
                        params.insert(name.clone(), (*part).to_owned());
                        idx += 1;
                    }
                }
                Segment::RestParam(name) => {
                    params.insert(name.clone(), parts[idx..].join(":"));
                    return Some(params);
                }
            }
        }

        (idx == parts.len()).then_some(params)
    }
}
