//! Pattern Extractor (Section 4.4): distills a bounded, reusable workflow
//! from a run's steps. Pure and total — this module never fails and never
//! touches the filesystem or network.

use orc_core::{Id, Pattern, Step, StepRole, TaskType, Variable};
use regex::Regex;
use std::sync::OnceLock;

const MAX_STEPS: usize = 12;
const MAX_CONTENT_LEN: usize = 160;

/// Run the extractor over `steps` for the given task type. Returns `None`
/// when there is nothing worth keeping (empty or all-failed step lists).
pub fn extract(
    run_id: &Id,
    project_id: &str,
    instructions: &str,
    task_type: TaskType,
    steps: &[Step],
) -> Option<Pattern> {
    let kept: Vec<&Step> = steps
        .iter()
        .filter(|s| matches!(s.role, StepRole::Assistant | StepRole::Tool) && s.outcome_ok)
        .collect();
    if kept.is_empty() {
        return None;
    }

    let normalized: Vec<String> = kept
        .iter()
        .take(MAX_STEPS)
        .map(|s| normalize(&s.content))
        .collect();

    let summary = kept
        .iter()
        .filter(|s| s.role == StepRole::Assistant)
        .map(|s| normalize(&s.content))
        .find(|s| !s.is_empty())
        .unwrap_or_default();
    let summary = clamp(&summary, MAX_CONTENT_LEN);

    let joined_text = {
        let mut text = instructions.to_string();
        for step in &normalized {
            text.push('\n');
            text.push_str(step);
        }
        text
    };
    let variables = discover_variables(task_type, &joined_text);

    let rendered_block = render(run_id, &summary, &normalized, &variables);

    Some(Pattern {
        run_id: run_id.clone(),
        project_id: project_id.to_string(),
        name: format!("pattern-{run_id}"),
        summary,
        steps: normalized,
        variables,
        rendered_block,
    })
}

fn normalize(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    clamp(collapsed.trim(), MAX_CONTENT_LEN)
}

fn clamp(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn render(run_id: &Id, summary: &str, steps: &[String], variables: &[Variable]) -> String {
    let mut out = String::new();
    out.push_str(&format!("<reference_workflow id=\"pat-{run_id}\">\n"));
    out.push_str(&format!("What worked before: {summary}\n\n"));
    out.push_str("Sequence:\n");
    for (i, step) in steps.iter().enumerate() {
        out.push_str(&format!("{}. {step}\n", i + 1));
    }
    out.push('\n');
    out.push_str("Variables:\n");
    for var in variables {
        out.push_str(&format!(
            "- {}: {} (ex: {})\n",
            var.name, var.type_tag, var.example
        ));
    }
    out.push('\n');
    out.push_str("Apply the same sequence when it fits...\n");
    out.push_str("</reference_workflow>");
    out
}

fn shared_variable_patterns() -> &'static [(&'static str, &'static str, &'static str)] {
    // (name, type_tag, regex) — classes common to every task type.
    &[
        ("file_ref", "file_reference", r"\b[\w./-]+\.(?:rs|py|ts|tsx|js|md|txt|json|yaml|yml|csv|toml)\b"),
        ("range", "range", r"\b\d+(?:\.\.|-)\d+\b"),
        ("url", "url", r"https?://[^\s)]+"),
        ("citation", "citation", r"\[\d+\]|\(\w+,\s*\d{4}\)"),
    ]
}

fn domain_variable_patterns(task_type: TaskType) -> &'static [(&'static str, &'static str, &'static str)] {
    match task_type {
        TaskType::Code => &[("substitution", "substitution", r"\$\{?\w+\}?")],
        TaskType::DataAnalysis => &[
            ("dataset_name", "dataset_name", r"\b[\w-]+\.(?:csv|parquet|xlsx)\b"),
            ("chart_type", "chart_type", r"\b(?:bar|line|scatter|pie|histogram)\s+chart\b"),
        ],
        TaskType::DocumentProcessing | TaskType::DocumentWriting | TaskType::DocumentAnalysis => &[
            ("document_format", "document_format", r"\b(?:pdf|docx|markdown|html)\b"),
            ("template", "template", r"\btemplate\b\s*[:=]?\s*[\w.-]+"),
        ],
        TaskType::Writing => &[
            ("tone", "tone", r"\b(?:formal|casual|friendly|authoritative|playful)\s+tone\b"),
            ("audience", "audience", r"\bfor\s+(?:a\s+)?[\w -]+\s+audience\b"),
        ],
        TaskType::Research => &[("citation_style", "citation_style", r"\b(?:APA|MLA|Chicago)\b")],
    }
}

fn regex_cache() -> &'static std::sync::Mutex<std::collections::HashMap<&'static str, Regex>> {
    static CACHE: OnceLock<std::sync::Mutex<std::collections::HashMap<&'static str, Regex>>> =
        OnceLock::new();
    CACHE.get_or_init(Default::default)
}

fn compiled(pattern: &'static str) -> Regex {
    let mut cache = regex_cache().lock().expect("regex cache mutex poisoned");
    cache
        .entry(pattern)
        .or_insert_with(|| Regex::new(pattern).expect("static pattern is valid"))
        .clone()
}

fn discover_variables(task_type: TaskType, text: &str) -> Vec<Variable> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for (name, type_tag, pattern) in shared_variable_patterns()
        .iter()
        .chain(domain_variable_patterns(task_type).iter())
    {
        let regex = compiled(pattern);
        if let Some(m) = regex.find(text) {
            let example = m.as_str().to_string();
            if seen.insert((*name, example.clone())) {
                out.push(Variable {
                    name: (*name).to_string(),
                    type_tag: (*type_tag).to_string(),
                    example,
                    description: format!("A {name} referenced in the run's instructions or steps."),
                });
            }
        }
    }
    out
}
