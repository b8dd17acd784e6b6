use serde_json::{json, Value};

pub const INSIGHT_EXTRACTION_PROMPT: &str = r####"
You are a psychologist specialised in gerontology and behavioral analysis.

Analyse the following transcript of conversations between a voice assistant and an elderly user and identify:

1. Communication patterns that worked well
2. Patterns that did not work (for example: ignored reminders, became irritated)
3. Preferred tone of voice and style
4. Emotional triggers, positive and negative
5. Topics of interest

Transcript:
{transcript}

Return strictly a JSON object with the following shape and nothing else:
{
  "insights": [
    {
      "category": "communication_style|preferences|triggers|failures",
      "observation": "short, objective description",
      "confidence": 0.0-1.0,
      "evidence": ["excerpt from the conversation that supports it"]
    }
  ]
}

The "category" field must be exactly one of: communication_style, preferences, triggers, failures.
"####;

pub const PROMPT_OPTIMIZATION_PROMPT: &str = r####"
You are a meta-agent specialised in optimising system prompts for health-care assistants.

Your goal is to improve the assistant's system prompt for one specific elderly user, based on behavioral insights.

CURRENT PROMPT:
{current_prompt}

BEHAVIORAL INSIGHTS:
{insights}

TASK:
Rewrite the system prompt incorporating the insights above. The new prompt must:
1. Keep the structure and intent of the current prompt
2. Add specific instructions derived from the insights
3. Be concise and objective
4. Focus on improving adherence and satisfaction

Return ONLY the new prompt, with no additional commentary.
"####;

/// Replace `{name}` placeholders in one left-to-right pass. Substituted
/// values are never rescanned, so a value containing another placeholder
/// stays literal.
pub fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut filled = String::with_capacity(template.len());
    let mut rest = template;

    'scan: while let Some(open) = rest.find('{') {
        filled.push_str(&rest[..open]);
        let tail = &rest[open..];
        for (name, value) in values {
            if let Some(after) = tail
                .strip_prefix('{')
                .and_then(|t| t.strip_prefix(*name))
                .and_then(|t| t.strip_prefix('}'))
            {
                filled.push_str(value);
                rest = after;
                continue 'scan;
            }
        }
        filled.push('{');
        rest = &tail[1..];
    }
    filled.push_str(rest);
    filled
}

/// JSON schema for the extraction response, sent as the structured
/// response format.
pub fn insight_response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "insights": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "category": {
                            "type": "string",
                            "enum": [
                                "communication_style",
                                "preferences",
                                "triggers",
                                "failures"
                            ]
                        },
                        "observation": { "type": "string" },
                        "confidence": {
                            "type": "number",
                            "minimum": 0.0,
                            "maximum": 1.0
                        },
                        "evidence": {
                            "type": "array",
                            "items": { "type": "string" }
                        }
                    },
                    "required": ["category", "observation", "confidence", "evidence"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["insights"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InsightCategory;

    #[test]
    fn schema_enumerates_every_category() {
        let schema = insight_response_schema();
        let allowed = schema["properties"]["insights"]["items"]["properties"]
            ["category"]["enum"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        let expected = InsightCategory::ALL
            .iter()
            .map(|c| c.as_str().to_string())
            .collect::<Vec<_>>();
        assert_eq!(allowed, expected);
    }

    #[test]
    fn fill_template_does_not_rescan_values() {
        let filled = fill_template(
            "A={a} B={b} {unknown} {",
            &[("a", "{b}"), ("b", "{a}")],
        );
        assert_eq!(filled, "A={b} B={a} {unknown} {");
    }

    #[test]
    fn templates_carry_their_placeholders() {
        assert!(INSIGHT_EXTRACTION_PROMPT.contains("{transcript}"));
        assert!(PROMPT_OPTIMIZATION_PROMPT.contains("{current_prompt}"));
        assert!(PROMPT_OPTIMIZATION_PROMPT.contains("{insights}"));
    }
}
