use serde_json::Value;

/// A tool call being assembled from a model stream.
///
/// Argument payloads arrive as arbitrary fragments of one JSON document and
/// are only parsed once the call is complete.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub tool_name: String,
    fragments: Vec<String>,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            fragments: Vec::new(),
        }
    }

    pub fn push_fragment(&mut self, fragment: &str) {
        self.fragments.push(fragment.to_string());
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    /// The concatenated argument payload.
    pub fn raw_arguments(&self) -> String {
        self.fragments.concat()
    }

    /// Parse the concatenated payload.
    ///
    /// A call that streamed no argument bytes at all is treated as `{}`.
    pub fn parse_arguments(&self) -> Result<Value, serde_json::Error> {
        let raw = self.raw_arguments();
        if raw.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assemble(id: &str, parts: &[&str]) -> ToolInvocation {
        let mut inv = ToolInvocation::new(id, "query");
        for part in parts {
            inv.push_fragment(part);
        }
        inv
    }

    #[test]
    fn test_fragment_boundaries_do_not_matter() {
        let payload = r#"{"q": "select 1", "limit": 10, "nested": {"a": [1, 2, "x,y"]}}"#;
        let direct: Value = serde_json::from_str(payload).unwrap();

        // Every single split point, plus a per-character split.
        for cut in 0..=payload.len() {
            if !payload.is_char_boundary(cut) {
                continue;
            }
            let inv = assemble("c", &[&payload[..cut], &payload[cut..]]);
            assert_eq!(inv.parse_arguments().unwrap(), direct, "split at {}", cut);
        }

        let chars: Vec<String> = payload.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = chars.iter().map(String::as_str).collect();
        assert_eq!(assemble("c", &refs).parse_arguments().unwrap(), direct);
    }

    #[test]
    fn test_two_fragment_scenario() {
        let inv = assemble("call_1", &[r#"{"q":"#, r#""1"}"#]);
        assert_eq!(inv.fragments().len(), 2);
        assert_eq!(inv.parse_arguments().unwrap(), json!({"q": "1"}));
    }

    #[test]
    fn test_no_fragments_is_empty_object() {
        let inv = ToolInvocation::new("call_1", "query");
        assert_eq!(inv.parse_arguments().unwrap(), json!({}));
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let inv = assemble("call_1", &[r#"{"q":"#, r#"1"#]);
        assert!(inv.parse_arguments().is_err());
    }
}
