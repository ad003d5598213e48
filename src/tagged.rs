//! Tagged-meta decoding for action/page parameters.
//!
//! The orchestrator sends parameters as plain JSON alongside a `paramsMeta`
//! side-channel describing which leaf values were richer types on the
//! wire's origin side (dates, primarily) — the same superjson-like shape
//! the upstream SDK uses so values round-trip without losing type fidelity
//! over a JSON transport. `paramsMeta` is a flat map of dotted path →
//! type tag; currently only `"Date"` is recognized, matching spec 4.4 step
//! 6 ("dates normalized").

use serde_json::Value;

/// Decode `params` using `meta` to normalize tagged values in place.
///
/// Unknown tags and paths that don't resolve are left untouched rather than
/// treated as errors — a stale or partial `paramsMeta` should degrade
/// gracefully, not fail the transaction before the handler even runs.
#[must_use]
pub fn decode_params(mut params: Value, meta: Option<&Value>) -> Value {
    let Some(Value::Object(tags)) = meta else {
        return params;
    };
    for (path, tag) in tags {
        let Value::String(tag) = tag else { continue };
        if tag != "Date" {
            continue;
        }
        if let Some(slot) = resolve_path_mut(&mut params, path) {
            if let Value::String(raw) = slot {
                if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(raw) {
                    *raw = parsed.to_rfc3339();
                }
            }
        }
    }
    params
}

fn resolve_path_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = current.get_mut(segment)?;
    }
    Some(current)
}

/// Meta map attached to an outbound envelope. The host cannot introspect a
/// generic [`Value`] for richer origin types the way a typed handler output
/// could, so this is always empty in practice — flagged in `DESIGN.md`
/// rather than silently pretended away.
#[must_use]
pub fn empty_meta() -> Value {
    serde_json::json!({})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_tagged_top_level_date() {
        let params = serde_json::json!({"when": "2024-01-02T03:04:05+00:00"});
        let meta = serde_json::json!({"when": "Date"});
        let decoded = decode_params(params, Some(&meta));
        assert_eq!(decoded["when"], "2024-01-02T03:04:05+00:00");
    }

    #[test]
    fn leaves_unmatched_paths_untouched() {
        let params = serde_json::json!({"a": 1});
        let meta = serde_json::json!({"missing.path": "Date"});
        let decoded = decode_params(params.clone(), Some(&meta));
        assert_eq!(decoded, params);
    }

    #[test]
    fn handles_nested_paths() {
        let params = serde_json::json!({"range": {"start": "2024-06-01T00:00:00Z"}});
        let meta = serde_json::json!({"range.start": "Date"});
        let decoded = decode_params(params, Some(&meta));
        assert!(decoded["range"]["start"].is_string());
    }
}
