//! LLM keyword extraction with the JSON-robustness ladder: parse the reply
//! as-is, then a brace-delimited body, then retry after stripping the prompt
//! echo. Callers fall back to the canned fail response when all rungs miss.

use regex::Regex;
use serde_json::Value;

/// Greedy first-`{`-to-last-`}` body of the reply.
pub fn locate_json_body(text: &str) -> Option<String> {
    // (?s) so the body may span lines.
    let re = Regex::new(r"(?s)\{.*\}").ok()?;
    re.find(text).map(|m| m.as_str().to_string())
}

/// Decode the keyword JSON out of an LLM reply. `prompt` is used for the
/// echo-stripping fallback.
pub fn parse_keywords_reply(reply: &str, prompt: &str) -> Option<Value> {
    if let Some(body) = locate_json_body(reply) {
        if let Ok(value) = serde_json::from_str::<Value>(&body) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    // Some models echo the prompt and wrap the JSON in chatter; strip the
    // echo and re-extract the first brace-delimited span.
    let prompt_head = if prompt.is_empty() {
        prompt
    } else {
        &prompt[..prompt.len() - prompt.chars().last().map(|c| c.len_utf8()).unwrap_or(0)]
    };
    let stripped = reply
        .replace(prompt_head, "")
        .replace("user", "")
        .replace("model", "")
        .trim()
        .to_string();
    let body = {
        let after_open = stripped.split_once('{')?.1;
        let inner = after_open.split_once('}')?.0;
        format!("{{{inner}}}")
    };
    serde_json::from_str::<Value>(&body)
        .ok()
        .filter(Value::is_object)
}

pub fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_json_reply() {
        let reply = r#"{"high_level_keywords": ["supply chain"], "low_level_keywords": ["acme"]}"#;
        let parsed = parse_keywords_reply(reply, "prompt").unwrap();
        assert_eq!(string_list(&parsed, "high_level_keywords"), vec!["supply chain"]);
        assert_eq!(string_list(&parsed, "low_level_keywords"), vec!["acme"]);
    }

    #[test]
    fn test_fenced_json_reply() {
        let reply = "```json\n{\"entities_from_query\": [\"acme\"]}\n```";
        let parsed = parse_keywords_reply(reply, "prompt").unwrap();
        assert_eq!(string_list(&parsed, "entities_from_query"), vec!["acme"]);
    }

    #[test]
    fn test_echoed_prompt_fallback() {
        let prompt = "Query: what links acme and bolt?\nOutput:";
        let reply = format!(
            "{prompt} here you go {{\"low_level_keywords\": [\"acme\"]}} hope that helps"
        );
        let parsed = parse_keywords_reply(&reply, prompt).unwrap();
        assert_eq!(string_list(&parsed, "low_level_keywords"), vec!["acme"]);
    }

    #[test]
    fn test_unparseable_reply_is_none() {
        assert!(parse_keywords_reply("no json here", "prompt").is_none());
    }

    #[test]
    fn test_missing_key_is_empty_list() {
        let parsed = json!({"other": 1});
        assert!(string_list(&parsed, "high_level_keywords").is_empty());
    }
}
