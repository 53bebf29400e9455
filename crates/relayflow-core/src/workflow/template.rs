//! Template resolution for action metadata.
//!
//! A pure function from (template string, trigger payload) to a resolved
//! string. Placeholders have the form `{{field.path}}`; whitespace inside the
//! braces is ignored and numeric segments index into arrays
//! (`{{items.0.sku}}`). A placeholder whose path does not resolve is left in
//! place verbatim.

use serde_json::Value;

use relayflow_types::workflow::ActionMetadata;

use std::collections::BTreeMap;

/// Resolve every `{{path}}` placeholder of `template` against `payload`.
pub fn resolve_template(template: &str, payload: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            // Unterminated placeholder: keep the remainder as-is
            out.push_str(&rest[start..]);
            return out;
        };

        let path = after_open[..end].trim();
        match lookup_path(payload, path) {
            Some(value) if !path.is_empty() => out.push_str(&value_to_string(value)),
            _ => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}

/// Resolve every field of an action's metadata.
pub fn resolve_fields(metadata: &ActionMetadata, payload: &Value) -> BTreeMap<String, String> {
    metadata
        .iter()
        .map(|(name, template)| (name.clone(), resolve_template(template, payload)))
        .collect()
}

/// Follow a dotted path into a JSON value.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Convert a JSON value to the string inserted into a template.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays become compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_simple_field() {
        let payload = json!({ "email": "a@b.com" });
        assert_eq!(resolve_template("{{email}}", &payload), "a@b.com");
    }

    #[test]
    fn test_resolve_metadata_map() {
        let payload = json!({ "email": "a@b.com" });
        let metadata = ActionMetadata::from([("email".to_string(), "{{email}}".to_string())]);
        let fields = resolve_fields(&metadata, &payload);
        assert_eq!(fields["email"], "a@b.com");
    }

    #[test]
    fn test_resolve_nested_path_and_surrounding_text() {
        let payload = json!({ "comment": { "email": "x@y.io", "amount": 5 } });
        assert_eq!(
            resolve_template("Send {{comment.amount}} SOL to {{ comment.email }}!", &payload),
            "Send 5 SOL to x@y.io!"
        );
    }

    #[test]
    fn test_resolve_array_index() {
        let payload = json!({ "items": [{ "sku": "A1" }, { "sku": "B2" }] });
        assert_eq!(resolve_template("{{items.1.sku}}", &payload), "B2");
    }

    #[test]
    fn test_unresolved_placeholder_left_asis() {
        let payload = json!({ "email": "a@b.com" });
        assert_eq!(
            resolve_template("to {{missing.field}} from {{email}}", &payload),
            "to {{missing.field}} from a@b.com"
        );
        assert_eq!(resolve_template("{{}}", &payload), "{{}}");
    }

    #[test]
    fn test_unterminated_placeholder() {
        let payload = json!({ "a": 1 });
        assert_eq!(resolve_template("x {{a}} {{a", &payload), "x 1 {{a");
    }

    #[test]
    fn test_non_string_values() {
        let payload = json!({ "flag": true, "none": null, "obj": { "k": [1, 2] } });
        assert_eq!(resolve_template("{{flag}}", &payload), "true");
        assert_eq!(resolve_template("{{none}}", &payload), "null");
        assert_eq!(resolve_template("{{obj}}", &payload), r#"{"k":[1,2]}"#);
    }

    #[test]
    fn test_plain_text_unchanged() {
        assert_eq!(resolve_template("no placeholders", &json!({})), "no placeholders");
    }
}
