use serde_json::Value;

/// Last-resort field names older deployments of the provider used.
const LEGACY_TEXT_FIELDS: [&str; 3] = ["reply", "message", "response"];

/// Pull the reply text out of whichever envelope the upstream returned.
///
/// The provider's response shape is not stable across versions, so shapes
/// are tried in strict priority order, most current first:
/// 1. a top-level flattened `output_text` field,
/// 2. the structured output list (`output[0].content[0].text`),
/// 3. the legacy flat fields `reply`, `message`, `response`.
/// The first non-empty string wins; `None` means no shape matched.
pub fn extract_reply(body: &Value) -> Option<String> {
    if let Some(text) = non_empty_str(&body["output_text"]) {
        return Some(text);
    }
    if let Some(text) = non_empty_str(&body["output"][0]["content"][0]["text"]) {
        return Some(text);
    }
    for field in LEGACY_TEXT_FIELDS {
        if let Some(text) = non_empty_str(&body[field]) {
            return Some(text);
        }
    }
    None
}

fn non_empty_str(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
