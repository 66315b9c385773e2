//! Topic routing-key matching
//!
//! Patterns and keys are split on a fixed `.` separator and compared segment
//! by segment. In a pattern, `*` stands for exactly one segment and `#` for
//! the remaining segments, zero or more. `#` may only appear as the last
//! segment. Wildcards cannot be mixed into a literal segment, and no segment
//! may be empty. Matching is case-sensitive.
//!
//! `/` has no special meaning: `test/topic` is one literal segment.

use crate::utils::error::{BrokerError, Result};

pub const SEPARATOR: char = '.';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    /// `*`
    One,
    /// `#`
    Rest,
}

/// A validated topic binding pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parses `pattern`, rejecting empty segments, a `#` that is not last and
    /// wildcards mixed into literal segments.
    pub fn parse(pattern: &str) -> Result<Self> {
        let raw: Vec<&str> = pattern.split(SEPARATOR).collect();
        let mut segments = Vec::with_capacity(raw.len());

        for (idx, seg) in raw.iter().enumerate() {
            let segment = match *seg {
                "" => {
                    return Err(BrokerError::Validation(format!(
                        "pattern '{pattern}' has an empty segment"
                    )));
                }
                "*" => Segment::One,
                "#" if idx + 1 == raw.len() => Segment::Rest,
                "#" => {
                    return Err(BrokerError::Validation(format!(
                        "pattern '{pattern}' has segments after '#'"
                    )));
                }
                s if s.contains(['*', '#']) => {
                    return Err(BrokerError::Validation(format!(
                        "pattern '{pattern}' mixes a wildcard into segment '{s}'"
                    )));
                }
                s => Segment::Literal(s.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self { segments })
    }

    /// Matches a routing key that already passed [`validate_key`].
    pub fn matches(&self, key: &str) -> bool {
        let mut key_segments = key.split(SEPARATOR);

        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::One => {
                    if key_segments.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(expected) => match key_segments.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }

        key_segments.next().is_none()
    }
}

/// Checks that a routing key published to a topic exchange has no empty
/// segment.
pub fn validate_key(key: &str) -> Result<()> {
    if key.split(SEPARATOR).any(str::is_empty) {
        return Err(BrokerError::Validation(format!(
            "routing key '{key}' has an empty segment"
        )));
    }
    Ok(())
}

/// Validates both sides and matches `pattern` against `key`.
pub fn topic_matches(pattern: &str, key: &str) -> Result<bool> {
    let pattern = TopicPattern::parse(pattern)?;
    validate_key(key)?;
    Ok(pattern.matches(key))
}
