//! Prompt assembly under a context-window ceiling.
//!
//! The system prompt carries the stage instructions and output contract. The
//! user prompt carries, in order: declared inputs, recalled memory, and the
//! corrective context of a repair attempt. When the whole exceeds the ceiling,
//! memory records are dropped least-relevant first, then inputs are truncated
//! with an explicit marker. Instructions and corrections are never cut.

use pipeline::{ArtifactName, ArtifactShape, MemoryRecord, RunId, StageDefinition};

use crate::output::output_contract;

/// Longest excerpt of a previous response quoted back in a repair prompt.
const MAX_PREVIOUS_RESPONSE_CHARS: usize = 4_000;

/// Longest excerpt of one memory record.
const MAX_MEMORY_RECORD_CHARS: usize = 2_000;

/// Room left for the truncation marker itself.
const MARKER_RESERVE: usize = 40;

/// Where a resolved input came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    /// The run's requirements text.
    Request,
    /// An artifact committed earlier in this run.
    RunContext,
    /// An exact-key record in long-term memory.
    LongTermMemory,
    /// An exact-key record in entity memory.
    EntityMemory,
}

/// One declared input with its value.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInput {
    /// Declared input key.
    pub name: ArtifactName,
    /// Text of the value.
    pub content: String,
    /// Shape of the producing output, when produced in this run.
    pub shape: Option<ArtifactShape>,
    /// Origin of the value.
    pub source: InputSource,
}

/// Everything a stage sees: its declared inputs and recalled memory slices.
#[derive(Debug, Clone, PartialEq)]
pub struct InputContext {
    /// Run the stage executes in.
    pub run_id: RunId,
    /// Declared inputs in declaration order.
    pub inputs: Vec<ResolvedInput>,
    /// Recalled memory, most relevant first.
    pub memory: Vec<MemoryRecord>,
}

/// Corrective context for a repair attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    /// What went wrong, phrased for the model.
    pub problem: String,
    /// The rejected response.
    pub previous_response: String,
}

/// An assembled request body.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    /// System prompt.
    pub system: String,
    /// User prompt.
    pub user: String,
    /// Memory records dropped to respect the ceiling.
    pub dropped_memory: usize,
    /// Inputs truncated to respect the ceiling.
    pub truncated_inputs: usize,
}

/// Assembles the prompt for `stage`, keeping the total under `max_chars`.
pub fn assemble(
    stage: &StageDefinition,
    input: &InputContext,
    correction: Option<&Correction>,
    max_chars: usize,
) -> Prompt {
    let system = format!("{}\n\n{}", stage.instructions.trim(), output_contract(stage));
    let correction_section = correction.map(render_correction).unwrap_or_default();

    let fixed = char_len(&system) + char_len(&correction_section);
    let budget = max_chars.saturating_sub(fixed);

    let mut input_sections: Vec<(String, String)> = input
        .inputs
        .iter()
        .map(|i| (input_header(i), i.content.clone()))
        .collect();
    let mut memory_lines: Vec<String> = input.memory.iter().map(render_memory).collect();

    let inputs_len = |sections: &[(String, String)]| -> usize {
        sections
            .iter()
            .map(|(h, b)| char_len(h) + char_len(b) + 2)
            .sum()
    };
    let memory_len = |lines: &[String]| -> usize {
        if lines.is_empty() {
            0
        } else {
            char_len(MEMORY_HEADER) + lines.iter().map(|l| char_len(l) + 1).sum::<usize>()
        }
    };

    let mut dropped_memory = 0;
    while !memory_lines.is_empty()
        && inputs_len(&input_sections) + memory_len(&memory_lines) > budget
    {
        memory_lines.pop();
        dropped_memory += 1;
    }

    let mut truncated_inputs = 0;
    if inputs_len(&input_sections) > budget {
        let mut remaining = budget;
        let count = input_sections.len();
        for (index, (header, body)) in input_sections.iter_mut().enumerate() {
            let share = remaining / (count - index);
            let overhead = char_len(header) + 2;
            let allowed = share.saturating_sub(overhead);
            if char_len(body) > allowed {
                *body = truncate_with_marker(body, allowed.saturating_sub(MARKER_RESERVE));
                truncated_inputs += 1;
            }
            remaining = remaining.saturating_sub(overhead + char_len(body));
        }
    }

    let mut user = String::new();
    for (header, body) in &input_sections {
        user.push_str(header);
        user.push_str(body);
        user.push_str("\n\n");
    }
    if !memory_lines.is_empty() {
        user.push_str(MEMORY_HEADER);
        for line in &memory_lines {
            user.push_str(line);
            user.push('\n');
        }
    }
    user.push_str(&correction_section);
    if user.trim().is_empty() {
        user.push_str("Begin.");
    }

    Prompt {
        system,
        user,
        dropped_memory,
        truncated_inputs,
    }
}

const MEMORY_HEADER: &str = "## Relevant memory\n";

fn input_header(input: &ResolvedInput) -> String {
    let origin = match input.source {
        InputSource::Request => "requirements",
        InputSource::RunContext => "from this run",
        InputSource::LongTermMemory => "from long-term memory",
        InputSource::EntityMemory => "from entity memory",
    };
    match &input.shape {
        Some(ArtifactShape::Code {
            language: Some(language),
        }) => format!("## Input: {} ({origin}, {language})\n", input.name),
        _ => format!("## Input: {} ({origin})\n", input.name),
    }
}

fn render_memory(record: &MemoryRecord) -> String {
    let value = truncate_with_marker(&record.value, MAX_MEMORY_RECORD_CHARS);
    format!("- [{}] {}: {}", record.scope.label(), record.key, value)
}

fn render_correction(correction: &Correction) -> String {
    format!(
        "## Correction\nYour previous response was rejected.\n{}\n\nPrevious response:\n{}\n\nProduce a corrected, complete response.\n",
        correction.problem.trim(),
        truncate_with_marker(&correction.previous_response, MAX_PREVIOUS_RESPONSE_CHARS)
    )
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Keeps the first `max_chars` characters and appends a truncation marker.
pub fn truncate_with_marker(text: &str, max_chars: usize) -> String {
    let total = char_len(text);
    if total <= max_chars {
        return text.to_string();
    }
    let marker = format!("\n[... truncated {} characters]", total - max_chars);
    let kept: String = text.chars().take(max_chars).collect();
    kept + &marker
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{MemoryKey, MemoryScope, MemoryValue, OutputSpec, StageId};

    fn stage() -> StageDefinition {
        StageDefinition::new(StageId::new("design").unwrap(), "Design the system.")
            .with_output(OutputSpec::text(ArtifactName::new("design.md").unwrap()))
    }

    fn input(name: &str, content: &str) -> ResolvedInput {
        ResolvedInput {
            name: ArtifactName::new(name).unwrap(),
            content: content.into(),
            shape: None,
            source: InputSource::RunContext,
        }
    }

    fn memory(key: &str, value: &str) -> MemoryRecord {
        MemoryRecord::new(
            MemoryScope::LongTerm,
            MemoryKey::new(key).unwrap(),
            MemoryValue::from(value),
        )
    }

    fn context(inputs: Vec<ResolvedInput>, memory: Vec<MemoryRecord>) -> InputContext {
        InputContext {
            run_id: RunId::new("r").unwrap(),
            inputs,
            memory,
        }
    }

    #[test]
    fn prompt_contains_inputs_memory_and_contract() {
        let prompt = assemble(
            &stage(),
            &context(
                vec![input("requirements.md", "R")],
                vec![memory("pattern", "use layers")],
            ),
            None,
            10_000,
        );
        assert!(prompt.system.starts_with("Design the system."));
        assert!(prompt.system.contains("'design.md'"));
        assert!(prompt.user.contains("## Input: requirements.md"));
        assert!(prompt.user.contains("use layers"));
        assert_eq!(prompt.dropped_memory, 0);
        assert_eq!(prompt.truncated_inputs, 0);
    }

    #[test]
    fn memory_is_dropped_before_inputs_are_cut() {
        let big_memory = "m".repeat(500);
        let ctx = context(
            vec![input("requirements.md", &"r".repeat(200))],
            vec![memory("a", &big_memory), memory("b", &big_memory)],
        );
        let prompt = assemble(&stage(), &ctx, None, 800);
        assert_eq!(prompt.dropped_memory, 2);
        assert_eq!(prompt.truncated_inputs, 0);
        assert!(prompt.user.contains(&"r".repeat(200)));
    }

    #[test]
    fn oversized_inputs_are_truncated_with_marker() {
        let ctx = context(vec![input("requirements.md", &"r".repeat(5_000))], vec![]);
        let prompt = assemble(&stage(), &ctx, None, 1_000);
        assert_eq!(prompt.truncated_inputs, 1);
        assert!(prompt.user.contains("[... truncated"));
        assert!(prompt.system.chars().count() + prompt.user.chars().count() <= 1_000);
    }

    #[test]
    fn corrections_survive_the_cap() {
        let ctx = context(vec![input("requirements.md", &"r".repeat(5_000))], vec![]);
        let correction = Correction {
            problem: "Output validation failed: code is empty".into(),
            previous_response: String::new(),
        };
        let prompt = assemble(&stage(), &ctx, Some(&correction), 1_000);
        assert!(prompt.user.contains("code is empty"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(10);
        let cut = truncate_with_marker(&text, 3);
        assert!(cut.starts_with("ééé\n[... truncated 7"));
    }
}
