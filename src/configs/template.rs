// SPDX-License-Identifier: Apache-2.0

//! Minimal `{{.Field}}` interpolation for metric names and tags.
//!
//! Templates are compiled once at config load and rendered per matched line
//! with the rule's capture map as context. Rendering is total and
//! deterministic: a field with no corresponding capture renders as the empty
//! string, never an error.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("unterminated '{{{{' at byte {0}")]
    Unterminated(usize),

    #[error("invalid field reference {0:?}, expected {{{{.Name}}}}")]
    InvalidField(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A compiled metric-name or tags template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

/// Whether a config string uses template interpolation at all. Strings
/// without it are used literally and never compiled.
pub fn has_interpolation(s: &str) -> bool {
    s.contains("{{.")
}

impl Template {
    pub fn parse(input: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = input;
        let mut consumed = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or(Error::Unterminated(consumed + start))?;

            let field = after[..end].trim();
            let name = field
                .strip_prefix('.')
                .filter(|n| {
                    !n.is_empty() && n.chars().all(|c| c.is_alphanumeric() || c == '_')
                })
                .ok_or_else(|| Error::InvalidField(field.to_string()))?;
            segments.push(Segment::Field(name.to_string()));

            consumed += start + 2 + end + 2;
            rest = &after[end + 2..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Template { segments })
    }

    /// Render with the capture map as context. Missing fields render empty.
    pub fn render(&self, ctx: &HashMap<String, String>) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field(name) => {
                    if let Some(v) = ctx.get(name) {
                        out.push_str(v);
                    }
                }
            }
        }
        out
    }
}
