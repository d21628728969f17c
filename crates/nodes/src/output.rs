//! Validation of model output against a stage's declared artifact shapes.
//!
//! A stage with one output takes the whole response as that artifact. A stage
//! with several outputs must answer with a JSON object keyed by artifact name.
//! Every rejection is a [`ValidationError`] whose message is fed back to the
//! model on the next repair attempt.

use std::sync::LazyLock;

use pipeline::{
    Artifact, ArtifactContent, ArtifactShape, OutputSpec, StageDefinition, ValidationError,
};
use regex::Regex;
use serde_json::Value;

static RE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([\w+#.\-]*)[^\n]*\n(.*?)\n?```").expect("valid regex")
});

/// Returns the body of the fenced block tagged `language`, else of the first
/// fenced block, else `None`.
pub fn fenced_block<'a>(text: &'a str, language: Option<&str>) -> Option<&'a str> {
    let blocks: Vec<(&str, &str)> = RE_FENCE
        .captures_iter(text)
        .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
        .collect();
    if let Some(language) = language {
        if let Some((_, body)) = blocks
            .iter()
            .find(|(tag, _)| tag.eq_ignore_ascii_case(language))
        {
            return Some(body);
        }
    }
    blocks.first().map(|(_, body)| *body)
}

/// Parses `response` into the artifacts `stage` declares.
pub fn parse_outputs(
    stage: &StageDefinition,
    response: &str,
) -> Result<Vec<Artifact>, ValidationError> {
    if response.trim().is_empty() {
        return Err(ValidationError::whole_response("the response is empty"));
    }

    match stage.outputs.as_slice() {
        [] => Err(ValidationError::whole_response(
            "the stage declares no outputs",
        )),
        [single] => {
            let content = parse_text_value(single, response)?;
            Ok(vec![Artifact::new(
                single.name.clone(),
                stage.id.clone(),
                content,
            )])
        }
        outputs => parse_object(stage, outputs, response),
    }
}

fn parse_object(
    stage: &StageDefinition,
    outputs: &[OutputSpec],
    response: &str,
) -> Result<Vec<Artifact>, ValidationError> {
    let body = fenced_block(response, Some("json")).unwrap_or(response).trim();
    let object = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return Err(ValidationError::whole_response(format!(
                "expected a JSON object with keys {}",
                key_list(outputs)
            )))
        }
        Err(e) => {
            return Err(ValidationError::whole_response(format!(
                "expected a JSON object with keys {}: {e}",
                key_list(outputs)
            )))
        }
    };

    if let Some(extra) = object
        .keys()
        .find(|k| !outputs.iter().any(|o| o.name.as_str() == k.as_str()))
    {
        return Err(ValidationError::whole_response(format!(
            "unexpected key '{extra}'; only {} may be written",
            key_list(outputs)
        )));
    }

    let mut artifacts = Vec::with_capacity(outputs.len());
    for output in outputs {
        let value = object.get(output.name.as_str()).ok_or_else(|| {
            ValidationError::for_artifact(&output.name, "missing from the response object")
        })?;
        let content = match (&output.shape, value) {
            (ArtifactShape::Json, value) => ArtifactContent::Json(value.clone()),
            (_, Value::String(text)) => parse_text_value(output, text)?,
            (shape, _) => {
                return Err(ValidationError::for_artifact(
                    &output.name,
                    format!("expected a string holding {}", shape.label()),
                ))
            }
        };
        artifacts.push(Artifact::new(output.name.clone(), stage.id.clone(), content));
    }
    Ok(artifacts)
}

fn parse_text_value(output: &OutputSpec, text: &str) -> Result<ArtifactContent, ValidationError> {
    match &output.shape {
        ArtifactShape::Text => {
            if text.trim().is_empty() {
                Err(ValidationError::for_artifact(&output.name, "text is empty"))
            } else {
                Ok(ArtifactContent::Text(text.to_string()))
            }
        }
        ArtifactShape::Code { language } => {
            let code = fenced_block(text, language.as_deref()).unwrap_or(text.trim());
            if code.trim().is_empty() {
                Err(ValidationError::for_artifact(&output.name, "code is empty"))
            } else {
                Ok(ArtifactContent::Text(code.to_string()))
            }
        }
        ArtifactShape::Json => {
            let body = fenced_block(text, Some("json")).unwrap_or(text).trim();
            serde_json::from_str::<Value>(body)
                .map(ArtifactContent::Json)
                .map_err(|e| {
                    ValidationError::for_artifact(&output.name, format!("invalid JSON: {e}"))
                })
        }
    }
}

fn key_list(outputs: &[OutputSpec]) -> String {
    outputs
        .iter()
        .map(|o| format!("\"{}\"", o.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Describes the expected response format for the system prompt.
pub fn output_contract(stage: &StageDefinition) -> String {
    match stage.outputs.as_slice() {
        [single] => match &single.shape {
            ArtifactShape::Text => format!("Respond with the content of '{}'.", single.name),
            ArtifactShape::Code { language } => format!(
                "Respond with the complete source of '{}' in a single ```{}``` fenced block.",
                single.name,
                language.as_deref().unwrap_or("")
            ),
            ArtifactShape::Json => format!(
                "Respond with the JSON document '{}' and nothing else.",
                single.name
            ),
        },
        outputs => {
            let fields = outputs
                .iter()
                .map(|o| format!("\"{}\" ({})", o.name, o.shape.label()))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "Respond with one JSON object whose keys are exactly: {fields}. \
                 Text and code values are strings."
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{ArtifactName, StageId};

    fn name(n: &str) -> ArtifactName {
        ArtifactName::new(n).unwrap()
    }

    fn stage(outputs: Vec<OutputSpec>) -> StageDefinition {
        outputs.into_iter().fold(
            StageDefinition::new(StageId::new("s").unwrap(), "do it"),
            StageDefinition::with_output,
        )
    }

    #[test]
    fn single_text_output_keeps_response_verbatim() {
        let s = stage(vec![OutputSpec::text(name("review"))]);
        let artifacts = parse_outputs(&s, "OK: M").unwrap();
        assert_eq!(artifacts[0].content, ArtifactContent::Text("OK: M".into()));
        assert_eq!(artifacts[0].stage, StageId::new("s").unwrap());
    }

    #[test]
    fn code_output_unwraps_fenced_block() {
        let s = stage(vec![OutputSpec::code(name("module.py"), "python")]);
        let response = "Here is the file:\n\n```python\nclass Account:\n    pass\n```\nDone.";
        let artifacts = parse_outputs(&s, response).unwrap();
        assert_eq!(
            artifacts[0].content.as_text(),
            "class Account:\n    pass"
        );
    }

    #[test]
    fn code_output_prefers_matching_language() {
        let s = stage(vec![OutputSpec::code(name("app.py"), "python")]);
        let response = "```bash\npip install gradio\n```\n```python\nimport gradio\n```";
        let artifacts = parse_outputs(&s, response).unwrap();
        assert_eq!(artifacts[0].content.as_text(), "import gradio");
    }

    #[test]
    fn unfenced_code_is_taken_whole() {
        let s = stage(vec![OutputSpec::code(name("module"), "python")]);
        let artifacts = parse_outputs(&s, "M").unwrap();
        assert_eq!(artifacts[0].content.as_text(), "M");
    }

    #[test]
    fn empty_response_is_rejected() {
        let s = stage(vec![OutputSpec::text(name("a"))]);
        let err = parse_outputs(&s, "  \n").unwrap_err();
        assert!(err.artifact.is_none());
    }

    #[test]
    fn invalid_json_output_names_the_artifact() {
        let s = stage(vec![OutputSpec::json(name("findings"))]);
        let err = parse_outputs(&s, "not json").unwrap_err();
        assert_eq!(err.artifact, Some(name("findings")));
    }

    #[test]
    fn json_output_accepts_fenced_json() {
        let s = stage(vec![OutputSpec::json(name("findings"))]);
        let artifacts = parse_outputs(&s, "```json\n{\"issues\": []}\n```").unwrap();
        assert_eq!(
            artifacts[0].content,
            ArtifactContent::Json(serde_json::json!({"issues": []}))
        );
    }

    #[test]
    fn multiple_outputs_are_read_from_an_object() {
        let s = stage(vec![
            OutputSpec::text(name("review.md")),
            OutputSpec::json(name("issues")),
        ]);
        let response = r#"{"review.md": "looks fine", "issues": [1, 2]}"#;
        let artifacts = parse_outputs(&s, response).unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].content.as_text(), "looks fine");
        assert_eq!(
            artifacts[1].content,
            ArtifactContent::Json(serde_json::json!([1, 2]))
        );
    }

    #[test]
    fn undeclared_artifacts_are_rejected() {
        let s = stage(vec![
            OutputSpec::text(name("a")),
            OutputSpec::text(name("b")),
        ]);
        let err = parse_outputs(&s, r#"{"a": "x", "b": "y", "c": "z"}"#).unwrap_err();
        assert!(err.reason.contains("'c'"));
    }

    #[test]
    fn missing_artifact_is_reported() {
        let s = stage(vec![
            OutputSpec::text(name("a")),
            OutputSpec::text(name("b")),
        ]);
        let err = parse_outputs(&s, r#"{"a": "x"}"#).unwrap_err();
        assert_eq!(err.artifact, Some(name("b")));
    }

    #[test]
    fn contract_describes_multi_output_keys() {
        let s = stage(vec![
            OutputSpec::text(name("a")),
            OutputSpec::json(name("b")),
        ]);
        let contract = output_contract(&s);
        assert!(contract.contains("\"a\" (text)"));
        assert!(contract.contains("\"b\" (json)"));
    }
}
