//! Prompt assembly for generation, repair and story decoding.
//!
//! The builder owns the structure of each request (which sections appear, in
//! what order); the guide texts are plain constants and can be overridden.

use crate::backend::GenerationRequest;
use crate::config::RepairConfig;
use crate::error::{Error, Result};
use crate::failure::FailureContext;
use crate::suite::{StoryHints, TestSuite};
use std::collections::BTreeSet;
use std::fs;

// ═══════════════════════════════════════════════════════════════════════════════
// GUIDES
// ═══════════════════════════════════════════════════════════════════════════════

pub const SCRIPT_GUIDE: &str = r#"You are a senior test engineer turning structured test cases into one runnable pytest file.

MODE:
- If the suite has a real target address (not empty, "N/A", "-", "None" or a placeholder), use HTTP mode:
  call the target with `requests`, set a timeout on every request, assert status codes and JSON bodies.
- Otherwise use LOCAL mode: no HTTP clients at all. Functions under test that do not exist must be
  implemented inside the same file, then called directly.

RULES:
- Python and pytest only; every test function starts with `test_`.
- The file must run as-is with `pytest -q <entry point>`.
- Implement every test case. No TODOs, no `pass` placeholders.
- Failure paths get explicit assertions (error fields in HTTP mode, exceptions in local mode).
- Do not import modules the project does not provide.

OUTPUT:
- The final Python source only. No Markdown fences, no explanations."#;

pub const REPAIR_GUIDE: &str = r#"You are a senior test engineer repairing an existing pytest file with the smallest change that makes it pass.

KEEP THE MODE:
- With a real target address, stay in HTTP mode: `requests` only, with timeouts.
- Without one, stay in LOCAL mode: no HTTP. If the file imports a module that does not exist,
  remove the import and implement the needed functions inside the file.

ALLOWED: fix assertions, add missing functions, adjust inputs or preconditions, add needed fixtures.
FORBIDDEN: deleting test functions or assertions to hide failures, new external dependencies, Markdown fences.

OUTPUT:
- The complete repaired Python source only."#;

pub const STORY_GUIDE: &str = r#"You are a test architect. Turn the user story below into a structured test suite.

OUTPUT (one JSON object only, no Markdown, no comments):
{
  "suite_id": "",
  "suite_name": "",
  "description": "",
  "context": {
    "target": "",
    "language": "python",
    "framework": "pytest",
    "entry_point": "tests/test_generated.py"
  },
  "fixtures": [
    {"name": "", "type": "http", "details": {"base_url": ""}}
  ],
  "test_cases": [
    {"id": "", "title": "", "priority": "P0", "steps": ["step 1", "step 2"], "expected_result": ""}
  ]
}

RULES:
- At least 3 test cases covering the happy path, error handling and boundaries.
- Steps are concrete and executable; expected results are verifiable.
- Without a known target or entry point use placeholders (http://placeholder/api, tests/test_generated.py).
- Note auth, seed data or dependent services as fixtures.
- State assumptions for vague requirements in `description`."#;

pub const JSON_REPAIR_GUIDE: &str = r#"You fix malformed JSON describing a test suite.

Return the corrected JSON only: one object with suite_id, suite_name, description, context,
fixtures and test_cases. Close every string and bracket, restore missing commas and quotes,
and keep the original meaning. Do not invent fields. No Markdown fences."#;

/// Modules the generated file may import without a hint.
pub const ALLOWED_MODULES: &[&str] = &[
    "collections",
    "dataclasses",
    "decimal",
    "fractions",
    "itertools",
    "json",
    "math",
    "os",
    "pathlib",
    "pytest",
    "random",
    "requests",
    "statistics",
    "sys",
    "time",
    "typing",
];

const PLACEHOLDER_TARGETS: &[&str] = &["", "unknown", "n/a", "-", "none"];

// ═══════════════════════════════════════════════════════════════════════════════
// BUILDER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    script_guide: String,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self {
            script_guide: SCRIPT_GUIDE.to_string(),
        }
    }
}

impl PromptBuilder {
    pub fn with_script_guide(guide: impl Into<String>) -> Self {
        Self {
            script_guide: guide.into(),
        }
    }

    /// Built-in guides, or the `system_guide` file named in `config`.
    pub fn from_config(config: &RepairConfig) -> Result<Self> {
        let Some(path) = &config.system_guide else {
            return Ok(Self::default());
        };
        let guide = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read system guide {}: {}", path.display(), e))
        })?;
        if guide.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "system guide {} is empty",
                path.display()
            )));
        }
        Ok(Self::with_script_guide(guide.trim()))
    }

    /// First attempt: write the file from the suite description.
    pub fn generation(&self, suite: &TestSuite) -> GenerationRequest {
        let mut sections = vec![suite_header(suite)];
        sections.push(fixtures_section(suite));
        sections.push(test_cases_section(suite));
        sections.push(origin_story_section(suite));

        let mut requirements = format!(
            "Write the complete test file.\nOutput path: {}\nImplement every test case.",
            suite.entry_point().display()
        );
        if is_placeholder_target(&suite.context.target) {
            requirements.push_str(
                "\nNOTE: the target address is empty or a placeholder. Keep all logic local; send no HTTP requests.",
            );
        }
        sections.push(requirements);

        GenerationRequest::new(self.script_guide.clone(), join_sections(sections))
    }

    /// Later attempts: repair `current_code` given the previous run's failure.
    pub fn repair(
        &self,
        suite: &TestSuite,
        current_code: &str,
        failure: &FailureContext,
    ) -> GenerationRequest {
        let mut sections = vec![suite_header(suite), origin_story_section(suite)];
        sections.push(format!("Entry point: {}", suite.entry_point().display()));
        if failure.summary.is_some() {
            sections.push(format!("Failure summary (JSON):\n{}", failure.summary_json()));
        }
        for (name, tail) in &failure.logs {
            if !tail.trim().is_empty() {
                sections.push(format!("Log [{}] (tail):\n{}", name, tail));
            }
        }

        let unknown = unknown_imports(current_code);
        if !unknown.is_empty() {
            sections.push(format!(
                "The file imports modules that may not exist: {}. If the project does not provide them, \
                 remove those imports and implement what is needed inside the file.",
                unknown.join(", ")
            ));
        }

        sections.push(format!("Current test file:\n{}", current_code));
        sections.push(
            "Return the complete repaired test file. No Markdown fences, no explanations.".to_string(),
        );

        GenerationRequest::new(REPAIR_GUIDE, join_sections(sections))
    }

    pub fn story(&self, story: &str, hints: &StoryHints) -> GenerationRequest {
        let mut task = format!("USER STORY:\n{}", story.trim());

        let facts: Vec<String> = [
            ("suite_id", &hints.suite_id),
            ("suite_name", &hints.suite_name),
            ("target address", &hints.target),
            ("entry point", &hints.entry_point),
            ("fixtures", &hints.fixtures_hint),
        ]
        .into_iter()
        .filter_map(|(label, value)| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| format!("{}: {}", label, v))
        })
        .collect();
        if !facts.is_empty() {
            task.push_str("\n\nKNOWN FACTS:\n");
            task.push_str(&facts.join("; "));
        }
        task.push_str("\n\nReturn the JSON object only.");

        GenerationRequest::new(STORY_GUIDE, task)
    }

    pub fn json_repair(&self, raw: &str) -> GenerationRequest {
        GenerationRequest::new(
            JSON_REPAIR_GUIDE,
            format!(
                "This answer should have been valid JSON but does not parse:\n{}\n\n\
                 Return it as a well-formed JSON object with the same content.",
                raw
            ),
        )
    }
}

/// Top-level modules imported by `code` that are not in `ALLOWED_MODULES`.
pub fn unknown_imports(code: &str) -> Vec<String> {
    let mut unknown = BTreeSet::new();
    for line in code.lines() {
        let line = line.trim();
        let module = if let Some(rest) = line.strip_prefix("from ") {
            match rest.split_once(" import ") {
                Some((module, _)) => module,
                None => continue,
            }
        } else if let Some(rest) = line.strip_prefix("import ") {
            rest.split(',').next().unwrap_or_default()
        } else {
            continue;
        };

        let root = module
            .trim()
            .split(|c: char| c == '.' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        if !root.is_empty() && !ALLOWED_MODULES.contains(&root) {
            unknown.insert(root.to_string());
        }
    }
    unknown.into_iter().collect()
}

fn is_placeholder_target(target: &str) -> bool {
    let normalized = target.trim().to_lowercase();
    PLACEHOLDER_TARGETS.contains(&normalized.as_str()) || normalized.contains("placeholder")
}

fn suite_header(suite: &TestSuite) -> String {
    let ctx = &suite.context;
    let or = |value: &str, fallback: &str| {
        if value.trim().is_empty() {
            fallback.to_string()
        } else {
            value.to_string()
        }
    };
    [
        format!("Suite ID: {}", or(&suite.suite_id, "N/A")),
        format!("Suite name: {}", or(&suite.suite_name, "N/A")),
        format!("Description: {}", or(&suite.description, "none")),
        format!("Language: {}", or(&ctx.language, "python")),
        format!("Framework: {}", or(&ctx.framework, "pytest")),
        format!("Entry point: {}", suite.entry_point().display()),
        format!("Target: {}", or(&ctx.target, "unknown")),
    ]
    .join("\n")
}

fn fixtures_section(suite: &TestSuite) -> String {
    if suite.fixtures.is_empty() {
        return String::new();
    }
    let mut lines = vec!["Fixtures:".to_string()];
    for fixture in &suite.fixtures {
        lines.push(format!("- name: {}", fixture.name));
        let kind = if fixture.kind.is_empty() { "custom" } else { fixture.kind.as_str() };
        lines.push(format!("  type: {}", kind));
        if !fixture.details.is_empty() {
            lines.push("  details:".to_string());
            for (key, value) in &fixture.details {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                lines.push(format!("    {}: {}", key, rendered));
            }
        }
    }
    lines.join("\n")
}

fn test_cases_section(suite: &TestSuite) -> String {
    if suite.test_cases.is_empty() {
        return "(No test cases given; write at least one representative test.)".to_string();
    }
    suite
        .test_cases
        .iter()
        .map(|case| {
            let steps = if case.steps.is_empty() {
                "  (no steps)".to_string()
            } else {
                case.steps
                    .iter()
                    .enumerate()
                    .map(|(i, step)| format!("  {}. {}", i + 1, step))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            let expected = if case.expected_result.is_empty() {
                "not specified"
            } else {
                case.expected_result.as_str()
            };
            format!(
                "Case: [{}] {} ({})\nSteps:\n{}\nExpected: {}",
                if case.id.is_empty() { "TC" } else { case.id.as_str() },
                if case.title.is_empty() { "untitled" } else { case.title.as_str() },
                if case.priority.is_empty() { "P?" } else { case.priority.as_str() },
                steps,
                expected
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn origin_story_section(suite: &TestSuite) -> String {
    let story = suite.context.origin_story.trim();
    if story.is_empty() {
        String::new()
    } else {
        format!("Original user story:\n{}", story)
    }
}

fn join_sections(sections: Vec<String>) -> String {
    sections
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
