//! Text extraction from the response shapes OpenAI-compatible servers return,
//! plus cleanup of captions and poll options.

use serde_json::Value;

type ShapeMatcher = fn(&Value) -> Option<String>;

/// Tried in order; the first matcher yielding non-empty text wins.
const SHAPE_MATCHERS: &[ShapeMatcher] = &[
    chat_message_string,
    chat_message_parts,
    completion_text,
    output_text,
    responses_output,
    plain_response,
];

pub const POLL_OPTION_MAX_CHARS: usize = 100;

pub fn extract_text(response: &Value) -> Option<String> {
    SHAPE_MATCHERS.iter().find_map(|matcher| matcher(response))
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn first_choice(response: &Value) -> Option<&Value> {
    response
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|choices| choices.first())
}

fn chat_message_string(response: &Value) -> Option<String> {
    first_choice(response)?
        .get("message")?
        .get("content")?
        .as_str()
        .and_then(non_empty)
}

fn join_text_parts(parts: &[Value]) -> Option<String> {
    let texts: Vec<String> = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
        .filter_map(non_empty)
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

fn chat_message_parts(response: &Value) -> Option<String> {
    let parts = first_choice(response)?
        .get("message")?
        .get("content")?
        .as_array()?;
    join_text_parts(parts)
}

fn completion_text(response: &Value) -> Option<String> {
    first_choice(response)?.get("text")?.as_str().and_then(non_empty)
}

fn output_text(response: &Value) -> Option<String> {
    response.get("output_text")?.as_str().and_then(non_empty)
}

fn responses_output(response: &Value) -> Option<String> {
    let items = response.get("output")?.as_array()?;
    let parts: Vec<Value> = items
        .iter()
        .filter_map(|item| item.get("content").and_then(|v| v.as_array()))
        .flatten()
        .cloned()
        .collect();
    join_text_parts(&parts)
}

fn plain_response(response: &Value) -> Option<String> {
    ["response", "result"]
        .iter()
        .find_map(|key| response.get(*key).and_then(|v| v.as_str()).and_then(non_empty))
}

const QUOTES: &[char] = &['"', '\'', '«', '»', '“', '”', '„', '`'];
const LIST_MARKERS: &[char] = &['-', '*', '•', '–', '—'];

/// Single line, no wrapping quotes, at most `max_chars` characters.
pub fn clean_caption(raw: &str, max_chars: usize) -> String {
    let single_line = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let unquoted = single_line.trim_matches(QUOTES).trim();
    unquoted.chars().take(max_chars).collect()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim().trim_start_matches(LIST_MARKERS).trim_start();
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(stripped) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return stripped.trim_start();
        }
    }
    line
}

/// One option per line; numbering, bullets and quotes removed, duplicates dropped.
pub fn parse_poll_options(raw: &str, count: usize) -> Vec<String> {
    let mut options: Vec<String> = Vec::new();
    for line in raw.lines() {
        let option = strip_list_marker(line).trim_matches(QUOTES).trim();
        if option.is_empty() {
            continue;
        }
        let option: String = option.chars().take(POLL_OPTION_MAX_CHARS).collect();
        let lowered = option.to_lowercase();
        if options.iter().any(|existing| existing.to_lowercase() == lowered) {
            continue;
        }
        options.push(option);
        if options.len() == count {
            break;
        }
    }
    options
}
