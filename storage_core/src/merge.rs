//! Deep-merge behaviour for config fragments.
//!
//! Mirrors `shipcat_definitions`'s own `mod merge` (manifest fragments
//! merging over regions) but operates on bare `serde_json::Value` trees
//! rather than typed manifests, since config fragments are merged before
//! the schema is known to be complete (spec §4.1).

use serde_json::Value;

/// Recursively merge `patch` into `base`.
///
/// When both sides hold an object at a key, recurse; otherwise `patch`'s
/// value replaces `base`'s. This is a direct port of the original agent's
/// `dict_merge`.
pub fn deep_merge(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut out = base_map.clone();
            for (k, v) in patch_map {
                let merged = match out.get(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        (_, patch) => patch.clone(),
    }
}
