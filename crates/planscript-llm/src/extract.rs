//! JSON extraction and recovery
//!
//! Provider output rarely arrives as clean JSON. Extraction order:
//! fenced code block first, then the first balanced `{...}` substring
//! that survives cleanup. Cleanup drops trailing commas and rewrites
//! single-quoted values and bare keys. When even that fails, a truncated
//! WRITE_FILE reply can often be salvaged by anchoring the content on
//! its closing `</html>` or trimming ragged JSON tails.

use serde_json::Value;

use planscript_core::plan::{Plan, PlanAction};

/// Extract, clean and parse the first plausible JSON object.
pub fn extract_plan_json(text: &str) -> Option<Value> {
    if let Some(fenced) = fenced_block(text) {
        if let Some(value) = parse_cleaned(&fenced) {
            return Some(value);
        }
    }
    for (start, ch) in text.char_indices() {
        if ch != '{' {
            continue;
        }
        if let Some(end) = find_object_end(text, start) {
            if let Some(value) = parse_cleaned(&text[start..=end]) {
                return Some(value);
            }
        }
    }
    None
}

/// Content of the first ``` or ```json fence.
fn fenced_block(text: &str) -> Option<String> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let body_start = if let Some(rest) = after_open.strip_prefix("json") {
        rest
    } else {
        after_open
    };
    let body_start = body_start.strip_prefix('\n').unwrap_or(body_start);
    let close = body_start.find("```")?;
    Some(body_start[..close].trim().to_string())
}

fn parse_cleaned(candidate: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        if value.is_object() {
            return Some(value);
        }
        return None;
    }
    let cleaned = clean_json(candidate);
    match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

/// Find the index of the brace closing the object opened at `start`,
/// honoring strings and escapes.
fn find_object_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text[start..].char_indices() {
        let abs = start + idx;
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(abs);
                }
            }
            _ => {}
        }
    }
    None
}

/// Best-effort cleanup: trailing commas out, single-quoted values and
/// bare keys rewritten to double-quoted equivalents.
pub fn clean_json(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    while i < chars.len() {
        let ch = chars[i];
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
                i += 1;
            }
            '\'' => {
                // Re-quote a single-quoted string.
                out.push('"');
                i += 1;
                while i < chars.len() {
                    let c = chars[i];
                    if c == '\\' && i + 1 < chars.len() {
                        out.push(c);
                        out.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    if c == '\'' {
                        i += 1;
                        break;
                    }
                    if c == '"' {
                        out.push('\\');
                    }
                    out.push(c);
                    i += 1;
                }
                out.push('"');
            }
            ',' => {
                // Drop the comma when only whitespace separates it from a
                // closing bracket.
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                    i += 1;
                } else {
                    out.push(ch);
                    i += 1;
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                // Possibly a bare key: IDENT whitespace* ':'
                let start = i;
                let mut j = i;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let mut k = j;
                while k < chars.len() && chars[k].is_whitespace() {
                    k += 1;
                }
                let word: String = chars[start..j].iter().collect();
                let is_literal = matches!(word.as_str(), "true" | "false" | "null");
                if !is_literal && k < chars.len() && chars[k] == ':' && preceded_by_opener(&out) {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    out.push_str(&word);
                }
                i = j;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    out
}

/// A bare key can only follow `{` or `,` (modulo whitespace).
fn preceded_by_opener(out: &str) -> bool {
    matches!(
        out.chars().rev().find(|c| !c.is_whitespace()),
        Some('{') | Some(',') | None
    )
}

/// Salvage a truncated WRITE_FILE reply. The reply must name the
/// WRITE_FILE action and carry an extractable path and an opened content
/// string. Content ends at the last `</html>` when present; otherwise
/// ragged JSON tails are trimmed.
pub fn recover_truncated_write(raw: &str) -> Option<Plan> {
    if !looks_like_write_file(raw) {
        return None;
    }
    let path = extract_string_field(raw, "path")?;

    let content_key = raw.find("\"content\"")?;
    let after_key = &raw[content_key + "\"content\"".len()..];
    let colon = after_key.find(':')?;
    let after_colon = after_key[colon + 1..].trim_start();
    let opened = after_colon.strip_prefix('"')?;

    let escaped_content = match opened.rfind("</html>") {
        Some(anchor) => &opened[..anchor + "</html>".len()],
        None => trim_json_tail(opened),
    };
    let content = unescape_json_string(escaped_content);

    Some(Plan::new(PlanAction::WriteFile {
        path,
        content,
        mode: planscript_core::plan::WriteMode::Overwrite,
    }))
}

fn looks_like_write_file(raw: &str) -> bool {
    let Some(idx) = raw.find("\"action\"") else {
        return false;
    };
    raw[idx..].find("WRITE_FILE").is_some()
}

/// Extract a simple `"key": "value"` string field.
fn extract_string_field(raw: &str, key: &str) -> Option<String> {
    let needle = format!("\"{}\"", key);
    let key_at = raw.find(&needle)?;
    let after = &raw[key_at + needle.len()..];
    let colon = after.find(':')?;
    let after_colon = after[colon + 1..].trim_start();
    let opened = after_colon.strip_prefix('"')?;
    let mut value = String::new();
    let mut escaped = false;
    for ch in opened.chars() {
        if escaped {
            value.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => return Some(value),
            other => value.push(other),
        }
    }
    None
}

/// Trim ragged JSON endings left by a mid-string cutoff: closing quotes,
/// braces, brackets, commas and a dangling backslash.
fn trim_json_tail(opened: &str) -> &str {
    let mut end = opened.len();
    let bytes = opened.as_bytes();
    while end > 0 {
        let ch = bytes[end - 1];
        if matches!(ch, b'"' | b'}' | b']' | b',' | b'\\') || ch.is_ascii_whitespace() {
            end -= 1;
        } else {
            break;
        }
    }
    &opened[..end]
}

/// Undo JSON string escapes over recovered content.
fn unescape_json_string(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                if let Ok(code) = u32::from_str_radix(&hex, 16) {
                    if let Some(decoded) = char::from_u32(code) {
                        out.push(decoded);
                    }
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fenced_json_block_is_preferred() {
        let raw = "Here is the plan:\n```json\n{\"action\": \"REPORT\", \"args\": {\"message\": \"ok\"}, \"done\": true}\n```\nthanks";
        let value = extract_plan_json(raw).expect("extract");
        assert_eq!(value["action"], "REPORT");
    }

    #[test]
    fn test_plain_fence_without_language_tag() {
        let raw = "```\n{\"action\": \"REPORT\", \"args\": {\"message\": \"ok\"}}\n```";
        assert!(extract_plan_json(raw).is_some());
    }

    #[test]
    fn test_first_balanced_object_is_found_in_prose() {
        let raw = r#"I think {not json} then {"action": "SEARCH", "args": {"query": "x"}} trailing"#;
        let value = extract_plan_json(raw).expect("extract");
        assert_eq!(value["action"], "SEARCH");
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse_the_scanner() {
        let raw = r#"{"action": "REPORT", "args": {"message": "brace } inside"}}"#;
        let value = extract_plan_json(raw).expect("extract");
        assert_eq!(value["args"]["message"], "brace } inside");
    }

    #[test]
    fn test_cleanup_fixes_trailing_commas_bare_keys_single_quotes() {
        let raw = "{action: 'REPORT', args: {message: 'hi',},}";
        let value = extract_plan_json(raw).expect("extract");
        assert_eq!(value, json!({"action": "REPORT", "args": {"message": "hi"}}));
    }

    #[test]
    fn test_recover_truncated_write_with_html_anchor() {
        let raw = r#"{"action": "WRITE_FILE", "args": {"path": "index.html", "content": "<html>\n<body>hi</body>\n</html>"#;
        let plan = recover_truncated_write(raw).expect("recover");
        match plan.action {
            PlanAction::WriteFile { path, content, .. } => {
                assert_eq!(path, "index.html");
                assert!(content.starts_with("<html>\n<body>"));
                assert!(content.ends_with("</html>"));
            }
            other => panic!("expected WRITE_FILE, got {:?}", other),
        }
    }

    #[test]
    fn test_recover_trims_ragged_tail_without_anchor() {
        let raw = r#"{"action": "WRITE_FILE", "args": {"path": "a.txt", "content": "partial text"}}"#;
        // Force the non-parsing path by breaking the JSON.
        let broken = &raw[..raw.len() - 1];
        let plan = recover_truncated_write(broken).expect("recover");
        match plan.action {
            PlanAction::WriteFile { content, .. } => assert_eq!(content, "partial text"),
            other => panic!("expected WRITE_FILE, got {:?}", other),
        }
    }

    #[test]
    fn test_recovery_requires_write_file_header() {
        let raw = r#"{"action": "READ_FILE", "args": {"path": "a.txt", "content": "x"#;
        assert!(recover_truncated_write(raw).is_none());
    }

    #[test]
    fn test_unescape_handles_common_escapes() {
        assert_eq!(unescape_json_string(r#"a\nb\"c\\dA"#), "a\nb\"c\\dA");
    }
}
