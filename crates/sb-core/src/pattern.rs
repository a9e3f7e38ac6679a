//! Dotted-name glob patterns for middleware scoping.
//!
//! Grammar over `.`-separated segments:
//! - bare segment — exact match
//! - `*` — any single segment
//! - `**` — any remaining suffix (zero or more segments); only valid last

/// A parsed procedure-name pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
    Rest,
}

impl Pattern {
    /// Parse a pattern string.  A `**` anywhere but the final segment is
    /// treated as a literal-free rest match from that point on (everything
    /// after it is unreachable, so we normalize by truncating).
    pub fn parse(pattern: &str) -> Self {
        let mut segments = Vec::new();
        for part in pattern.split('.') {
            match part {
                "**" => {
                    segments.push(Segment::Rest);
                    break;
                }
                "*" => segments.push(Segment::Any),
                literal => segments.push(Segment::Literal(literal.to_owned())),
            }
        }
        Pattern { segments }
    }

    pub fn matches(&self, name: &str) -> bool {
        let parts: Vec<&str> = if name.is_empty() {
            Vec::new()
        } else {
            name.split('.').collect()
        };

        let mut idx = 0;
        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Any => {
                    if idx >= parts.len() {
                        return false;
                    }
                    idx += 1;
                }
                Segment::Literal(lit) => {
                    if parts.get(idx) != Some(&lit.as_str()) {
                        return false;
                    }
                    idx += 1;
                }
            }
        }
        idx == parts.len()
    }
}
