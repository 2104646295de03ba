//! Follow-on job expansion and event-safe input summaries.

use serde_json::Value;

use crate::model::JsonMap;
use crate::model::job::{JobType, NewJob};

const MAX_FRAME_PATHS: usize = 100;
const MAX_ID_LIST: usize = 200;

/// Values substituted into `nextJobs` inputs.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub project_id: &'a str,
    pub job_id: &'a str,
    pub input: &'a JsonMap,
    pub output: &'a JsonMap,
}

impl TemplateContext<'_> {
    /// Value a single token stands for, if it resolves.
    fn lookup(&self, token: &str) -> Option<Value> {
        match token {
            "$projectId" => return Some(Value::String(self.project_id.to_string())),
            "$jobId" => return Some(Value::String(self.job_id.to_string())),
            _ => {}
        }
        if let Some(field) = token.strip_prefix("$output.") {
            return self.output.get(field).cloned();
        }
        if let Some(field) = token.strip_prefix("$input.") {
            return self.input.get(field).cloned();
        }
        None
    }

    /// Replace tokens embedded in a longer string with their text form.
    fn splice(&self, s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find('$') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            let end = token_end(tail);
            let token = &tail[..end];
            match self.lookup(token) {
                Some(Value::String(v)) => out.push_str(&v),
                Some(v @ (Value::Number(_) | Value::Bool(_))) => out.push_str(&v.to_string()),
                _ => out.push_str(token),
            }
            rest = &tail[end..];
        }
        out.push_str(rest);
        out
    }

    /// Recursively expand tokens in `value`.
    pub fn expand(&self, value: &Value) -> Value {
        match value {
            Value::String(s) if is_token(s) => self.lookup(s).unwrap_or_else(|| value.clone()),
            Value::String(s) if s.contains('$') => Value::String(self.splice(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.expand(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.expand(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Length of the `$name` or `$scope.field` token at the start of `s`.
fn token_end(s: &str) -> usize {
    let body = &s[1..];
    let mut end = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(body.len());
    let head = &body[..end];
    if (head == "input" || head == "output") && body[end..].starts_with('.') {
        let field = &body[end + 1..];
        let field_len = field
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(field.len());
        if field_len > 0 {
            end += 1 + field_len;
        }
    }
    1 + end
}

fn is_token(s: &str) -> bool {
    s.starts_with('$') && token_end(s) == s.len() && s.len() > 1
}

/// Expand `input.nextJobs` into jobs to enqueue. Entries without a known
/// `type` are skipped.
pub fn expand_next_jobs(next_jobs: Option<&Value>, ctx: &TemplateContext<'_>) -> Vec<NewJob> {
    let Some(Value::Array(entries)) = next_jobs else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let job_type: JobType = entry.get("type")?.as_str()?.parse().ok()?;
            let input = entry
                .get("input")
                .map(|i| ctx.expand(i))
                .unwrap_or_else(|| Value::Object(JsonMap::new()));
            Some(NewJob::new(job_type).input(input))
        })
        .collect()
}

/// Copy of a job input small enough to embed in an event payload.
pub fn summarize_input(input: &JsonMap) -> JsonMap {
    let mut out = JsonMap::new();
    for (key, value) in input {
        match (key.as_str(), value) {
            ("workflow", _) => {}
            ("nextJobs", Value::Array(items)) => {
                out.insert("nextJobsCount".into(), items.len().into());
            }
            ("framePaths", Value::Array(items)) if items.len() > MAX_FRAME_PATHS => {
                out.insert("framePathsCount".into(), items.len().into());
            }
            ("assetIds" | "atlasIds", Value::Array(items)) if items.len() > MAX_ID_LIST => {
                out.insert(format!("{key}Count"), items.len().into());
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_boundaries() {
        assert!(is_token("$jobId"));
        assert!(is_token("$output.assetId"));
        assert!(!is_token("$output."));
        assert!(!is_token("prefix-$jobId"));
        assert_eq!(token_end("$input.a_b-c"), "$input.a_b".len());
    }

    #[test]
    fn summary_drops_bulky_fields() {
        let frames: Vec<String> = (0..150).map(|i| format!("f{i}.png")).collect();
        let input = json!({
            "workflow": {"1": {}},
            "nextJobs": [{"type": "export"}],
            "framePaths": frames,
            "assetIds": ["a1"],
            "specId": "s1"
        });
        let summary = summarize_input(input.as_object().unwrap());
        assert!(!summary.contains_key("workflow"));
        assert_eq!(summary.get("nextJobsCount"), Some(&json!(1)));
        assert_eq!(summary.get("framePathsCount"), Some(&json!(150)));
        assert_eq!(summary.get("assetIds"), Some(&json!(["a1"])));
        assert_eq!(summary.get("specId"), Some(&json!("s1")));
    }
}
