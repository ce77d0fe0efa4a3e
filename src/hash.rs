//! Deterministic, version-tagged content hashing.
//!
//! Grounded on `_hash_utils.py`: canonical JSON (sorted keys, no
//! whitespace, empty fields dropped), MD5 digest, version byte prefix,
//! first 15 of the 16 MD5 bytes kept (collision resistance isn't the
//! point — this is a change detector, not a content address).

use md5::{Digest, Md5};
use serde_json::{Map, Value};

const VERSION: u8 = 0;

/// Computes the content hash of `thing`, a JSON value already shaped by
/// the caller (identity fields such as `url`/`updated` must already be
/// excluded — see [`drop_empty`] for the elision policy applied here).
pub fn get_hash(thing: &Value) -> Vec<u8> {
    let canonical = canonical_json(thing);
    let digest = Md5::digest(canonical.as_bytes());
    let mut out = Vec::with_capacity(16);
    out.push(VERSION);
    out.extend_from_slice(&digest[..15]);
    out
}

pub fn check_hash(thing: &Value, hash: &[u8]) -> bool {
    get_hash(thing) == hash
}

/// Serialises `value` the way `_json_dumps` does: sorted keys, no
/// indentation, minimal separators, and object fields whose value is
/// null or an empty array/object dropped (applied recursively).
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&drop_empty(value)).expect("Value always serializes")
}

fn drop_empty(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                let v = &map[key];
                if is_empty(v) {
                    continue;
                }
                out.insert(key.clone(), drop_empty(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(drop_empty).collect()),
        other => other.clone(),
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Builds the hashable JSON view of a [`crate::types::FeedData`],
/// excluding `url` and `updated` (identity fields per §4.7).
pub fn feed_hashable(feed: &crate::types::FeedData) -> Value {
    let mut map = Map::new();
    insert_opt(&mut map, "title", feed.title.as_deref());
    insert_opt(&mut map, "link", feed.link.as_deref());
    insert_opt(&mut map, "author", feed.author.as_deref());
    insert_opt(&mut map, "subtitle", feed.subtitle.as_deref());
    insert_opt(&mut map, "version", feed.version.as_deref());
    Value::Object(map)
}

/// Builds the hashable JSON view of a [`crate::types::EntryData`],
/// excluding `feed_url`, `id`, and `updated`.
pub fn entry_hashable(entry: &crate::types::EntryData) -> Value {
    let mut map = Map::new();
    insert_opt(&mut map, "title", entry.title.as_deref());
    insert_opt(&mut map, "link", entry.link.as_deref());
    insert_opt(&mut map, "author", entry.author.as_deref());
    if let Some(p) = entry.published {
        map.insert("published".into(), Value::String(p.to_rfc3339()));
    }
    insert_opt(&mut map, "summary", entry.summary.as_deref());
    if !entry.content.is_empty() {
        let content: Vec<Value> = entry
            .content
            .iter()
            .map(|c| {
                let mut cm = Map::new();
                insert_opt(&mut cm, "value", c.value.as_deref());
                insert_opt(&mut cm, "type", c.mime_type.as_deref());
                insert_opt(&mut cm, "language", c.language.as_deref());
                Value::Object(cm)
            })
            .collect();
        map.insert("content".into(), Value::Array(content));
    }
    if !entry.enclosures.is_empty() {
        let enclosures: Vec<Value> = entry
            .enclosures
            .iter()
            .map(|e| {
                let mut em = Map::new();
                em.insert("href".into(), Value::String(e.href.clone()));
                insert_opt(&mut em, "type", e.mime_type.as_deref());
                if let Some(l) = e.length {
                    em.insert("length".into(), Value::from(l));
                }
                Value::Object(em)
            })
            .collect();
        map.insert("enclosures".into(), Value::Array(enclosures));
    }
    Value::Object(map)
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        map.insert(key.to_string(), Value::String(v.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn check_hash_roundtrips() {
        let thing = json!({"a": 1, "b": "x"});
        let h = get_hash(&thing);
        assert!(check_hash(&thing, &h));
    }

    #[test]
    fn empty_fields_do_not_affect_hash() {
        let a = json!({"title": "t"});
        let b = json!({"title": "t", "subtitle": null, "tags": []});
        assert_eq!(get_hash(&a), get_hash(&b));
    }

    #[test]
    fn changing_a_field_changes_the_hash() {
        let a = json!({"title": "t"});
        let b = json!({"title": "t2"});
        assert_ne!(get_hash(&a), get_hash(&b));
    }

    #[test]
    fn hash_is_version_prefixed_and_15_bytes_of_digest() {
        let h = get_hash(&json!({}));
        assert_eq!(h.len(), 16);
        assert_eq!(h[0], VERSION);
    }

    #[test]
    fn empty_string_field_is_elided_like_a_missing_one() {
        let a = json!({"title": "t"});
        let b = json!({"title": "t", "subtitle": ""});
        assert_eq!(get_hash(&a), get_hash(&b));
    }

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(get_hash(&a), get_hash(&b));
    }
}
