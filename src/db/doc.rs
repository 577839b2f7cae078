//! # Attribute Extraction and Index Hashing
//!
//! Secondary indexes map *values found at a path inside a document* to
//! document ids. This module provides the two pure functions that make that
//! mapping deterministic: [`get_in`], which resolves a path to the flat list
//! of values it addresses, and [`str_hash`], which folds a value's string
//! form into the integer key the hash table files work with.

use serde_json::Value;
use smallvec::SmallVec;

static JSON_NULL: Value = Value::Null;

/// Values extracted from one document for one index path. Nearly always one
/// or two scalars, hence the inline capacity.
pub type ExtractedValues<'a> = SmallVec<[&'a Value; 4]>;

/// Resolve the attribute(s) addressed by `path` inside `doc`.
///
/// Maps descend by key; arrays fan out, each element resolved against the
/// remaining path, so one indexed path may yield several values per
/// document. A missing key resolves to null (callers skip nulls), and a
/// scalar met before the path is exhausted yields nothing. Anything that is
/// not a map at a recursion root yields nothing.
pub fn get_in<'a>(doc: &'a Value, path: &[String]) -> ExtractedValues<'a> {
    let mut out = ExtractedValues::new();
    get_in_value(doc, path, &mut out);
    out
}

fn get_in_value<'a>(value: &'a Value, path: &[String], out: &mut ExtractedValues<'a>) {
    if !value.is_object() {
        return;
    }
    let mut thing = value;
    for (i, seg) in path.iter().enumerate() {
        match thing {
            Value::Object(map) => thing = map.get(seg).unwrap_or(&JSON_NULL),
            Value::Array(elements) => {
                for element in elements {
                    get_in_value(element, &path[i..], out);
                }
                return;
            }
            _ => return,
        }
    }
    match thing {
        Value::Array(elements) => out.extend(elements.iter()),
        other => out.push(other),
    }
}

/// The string form a value is indexed under: bare contents for strings, the
/// JSON serialization for everything else.
pub fn index_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fold a string into a non-negative integer key (sdbm-style). Only used to
/// turn indexed values into keys for the integer hash tables.
pub fn str_hash(s: &str) -> u64 {
    let mut hash: i64 = 0;
    for c in s.chars() {
        hash = (c as i64)
            .wrapping_add(hash << 6)
            .wrapping_add(hash << 16)
            .wrapping_sub(hash);
    }
    hash.wrapping_abs() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(segs: &[&str]) -> Vec<String> {
        segs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn str_hash_is_bit_exact() {
        assert_eq!(str_hash(""), 0);
        assert_eq!(str_hash("x"), 120);
        assert_eq!(str_hash("y"), 121);
        assert_eq!(str_hash("1"), 49);
        assert_eq!(str_hash("abc"), 417_419_622_498);
        assert_eq!(str_hash("Source"), 4_719_767_873_461_673_893);
    }

    #[test]
    fn get_in_resolves_nested_maps() {
        let doc = json!({"a": {"b": {"c": 7}}});
        let got = get_in(&doc, &path(&["a", "b", "c"]));
        assert_eq!(got.as_slice(), [&json!(7)]);
    }

    #[test]
    fn get_in_flattens_an_array_leaf() {
        let doc = json!({"tags": ["x", "y"]});
        let got = get_in(&doc, &path(&["tags"]));
        assert_eq!(got.as_slice(), [&json!("x"), &json!("y")]);
    }

    #[test]
    fn get_in_fans_out_over_arrays_of_maps() {
        let doc = json!({"a": [{"b": 1}, {"b": 2}, {"c": 3}]});
        let got = get_in(&doc, &path(&["a", "b"]));
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], &json!(1));
        assert_eq!(got[1], &json!(2));
        assert!(got[2].is_null(), "missing key resolves to null");
    }

    #[test]
    fn get_in_yields_nothing_for_scalar_obstructions() {
        let doc = json!({"a": 5});
        assert!(get_in(&doc, &path(&["a", "b"])).is_empty());
        assert!(get_in(&json!(42), &path(&["a"])).is_empty());
    }

    #[test]
    fn get_in_with_exhausted_path_yields_the_value_itself() {
        let doc = json!({"a": {"deep": true}});
        let got = get_in(&doc, &path(&["a"]));
        assert_eq!(got.as_slice(), [&json!({"deep": true})]);
    }

    #[test]
    fn array_elements_that_are_not_maps_contribute_nothing_mid_path() {
        let doc = json!({"a": [[1], [2]]});
        assert!(get_in(&doc, &path(&["a", "b"])).is_empty());
    }

    #[test]
    fn index_str_uses_bare_strings_and_json_for_the_rest() {
        assert_eq!(index_str(&json!("plain")), "plain");
        assert_eq!(index_str(&json!(1)), "1");
        assert_eq!(index_str(&json!(true)), "true");
        assert_eq!(index_str(&json!([1, 2])), "[1,2]");
    }
}
