//! Tag encodings shared with host bindings.
//!
//! # Legacy string format
//!
//! Older bindings pass tags as a single string: `key1=value1,key2=value2`. There is no
//! escaping, so:
//!
//! - `=` inside a value survives, because each entry is split on its *first* `=`
//! - `,` anywhere, or `=` inside a key, cannot be represented
//! - entries and keys are trimmed when parsed, so whitespace around a key or at the end
//!   of a value cannot be represented either
//!
//! [`tags_to_string`] refuses tags it cannot represent instead of producing a string
//! that would parse back differently. [`string_to_tags`] skips malformed entries (no
//! `=`, or an empty key) and logs them.
//!
//! # Structured format
//!
//! [`tags_to_json`] / [`tags_from_json`] encode tags as a JSON array of
//! `{"key": ..., "value": ...}` objects and round-trip every tag exactly, duplicates and
//! order included.

use serde::Deserialize;
use tracing::warn;

use crate::tags::{Tag, TagError};

const ENTRY_DELIMITER: char = ',';
const PAIR_DELIMITER: char = '=';

/// Parses `key=value,key=value`.
///
/// ```
/// use pyroscope_agent_native::tags::legacy::string_to_tags;
///
/// assert_eq!(
///     string_to_tags("region=us-east,query=a=b"),
///     vec![
///         ("region".to_string(), "us-east".to_string()),
///         ("query".to_string(), "a=b".to_string()),
///     ]
/// );
/// assert!(string_to_tags("").is_empty());
/// ```
#[must_use]
pub fn string_to_tags(tags: &str) -> Vec<(String, String)> {
    tags.split(ENTRY_DELIMITER)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once(PAIR_DELIMITER) {
            Some((key, value)) if !key.trim().is_empty() => {
                Some((key.trim().to_string(), value.to_string()))
            }
            _ => {
                warn!("Ignoring malformed tag '{}', expected 'key=value'", entry);
                None
            }
        })
        .collect()
}

/// Encodes tags as `key=value,key=value`, refusing any tag the format cannot carry.
pub fn tags_to_string<'a>(tags: impl IntoIterator<Item = &'a Tag>) -> Result<String, TagError> {
    let mut encoded = Vec::new();
    for tag in tags {
        tag.validate()?;
        let offending = tag
            .key
            .chars()
            .find(|c| *c == ENTRY_DELIMITER || *c == PAIR_DELIMITER)
            .or_else(|| tag.value.chars().find(|c| *c == ENTRY_DELIMITER));
        if let Some(character) = offending {
            return Err(TagError::Delimiter {
                key: tag.key.clone(),
                character,
            });
        }
        if tag.key.trim() != tag.key || tag.value.trim_end() != tag.value {
            return Err(TagError::Whitespace {
                key: tag.key.clone(),
            });
        }
        encoded.push(tag.to_string());
    }
    Ok(encoded.join(","))
}

/// Encodes tags as a JSON array of `{"key", "value"}` objects.
pub fn tags_to_json<'a>(tags: impl IntoIterator<Item = &'a Tag>) -> Result<String, TagError> {
    let tags: Vec<&Tag> = tags.into_iter().collect();
    Ok(serde_json::to_string(&tags)?)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonTags {
    List(Vec<Tag>),
    Map(std::collections::BTreeMap<String, String>),
}

/// Decodes tags from a JSON array of `{"key", "value"}` objects, or from a plain JSON
/// object of string values (listed in key order).
pub fn tags_from_json(json: &str) -> Result<Vec<Tag>, TagError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let tags = match serde_json::from_str::<JsonTags>(json)? {
        JsonTags::List(tags) => tags,
        JsonTags::Map(map) => map.into_iter().map(Tag::from).collect(),
    };
    for tag in &tags {
        tag.validate()?;
    }
    Ok(tags)
}
