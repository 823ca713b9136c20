//! Structured test suites, and turning a user story into one.

use crate::backend::GenerationBackend;
use crate::config::DEFAULT_ENTRY_POINT;
use crate::error::{Error, Result};
use crate::extract::{extract_json_object, sanitize_json};
use crate::prompt::PromptBuilder;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Generation rounds before story decoding gives up.
pub const STORY_ROUNDS: usize = 3;
const PLACEHOLDER_BASE_URL: &str = "http://placeholder/api";

/// Models write `null` where they mean "unknown".
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSuite {
    #[serde(deserialize_with = "null_as_default")]
    pub suite_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub suite_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(deserialize_with = "null_as_default")]
    pub context: SuiteContext,
    #[serde(deserialize_with = "null_as_default")]
    pub fixtures: Vec<Fixture>,
    #[serde(deserialize_with = "null_as_default")]
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteContext {
    /// Base address of the system under test; empty means "stay local".
    #[serde(deserialize_with = "null_as_default")]
    pub target: String,
    #[serde(deserialize_with = "null_as_default")]
    pub language: String,
    #[serde(deserialize_with = "null_as_default")]
    pub framework: String,
    #[serde(deserialize_with = "null_as_default")]
    pub entry_point: String,
    #[serde(deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub origin_story: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixture {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "type", alias = "kind", deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(deserialize_with = "null_as_default")]
    pub details: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestCase {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub priority: String,
    #[serde(deserialize_with = "null_as_default")]
    pub steps: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub expected_result: String,
}

impl TestSuite {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::SuiteParse(format!("{}: {}", path.display(), e)))
    }

    /// Relative path of the entry artifact.
    pub fn entry_point(&self) -> PathBuf {
        let entry = self.context.entry_point.trim();
        if entry.is_empty() {
            PathBuf::from(DEFAULT_ENTRY_POINT)
        } else {
            PathBuf::from(entry)
        }
    }

    pub fn label(&self) -> &str {
        if !self.suite_name.is_empty() {
            &self.suite_name
        } else if !self.suite_id.is_empty() {
            &self.suite_id
        } else {
            "unnamed suite"
        }
    }

    fn fill_defaults(&mut self, story: &str, hints: &StoryHints) {
        let ctx = &mut self.context;
        fill(&mut ctx.language, Some("python"));
        fill(&mut ctx.framework, Some("pytest"));
        fill(
            &mut ctx.entry_point,
            Some(hints.entry_point.as_deref().unwrap_or(DEFAULT_ENTRY_POINT)),
        );
        fill(&mut ctx.target, hints.target.as_deref());
        fill(&mut ctx.origin_story, Some(story.trim()));
        fill(&mut self.suite_id, hints.suite_id.as_deref());
        fill(&mut self.suite_name, hints.suite_name.as_deref());

        if self.fixtures.is_empty() {
            let base_url = hints
                .target
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or(PLACEHOLDER_BASE_URL);
            self.fixtures.push(Fixture {
                name: "client".to_string(),
                kind: "http".to_string(),
                details: BTreeMap::from([(
                    "base_url".to_string(),
                    Value::String(base_url.to_string()),
                )]),
            });
        }
    }
}

fn fill(slot: &mut String, value: Option<&str>) {
    if slot.trim().is_empty() {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            *slot = value.to_string();
        }
    }
}

/// Optional facts the caller already knows about the story's suite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoryHints {
    pub suite_id: Option<String>,
    pub suite_name: Option<String>,
    pub target: Option<String>,
    pub entry_point: Option<String>,
    pub fixtures_hint: Option<String>,
}

/// Ask `backend` for a structured suite describing `story`.
///
/// Backend errors abort at once; only undecodable responses use up rounds.
pub fn generate_from_story<B: GenerationBackend + ?Sized>(
    backend: &B,
    story: &str,
    hints: &StoryHints,
) -> Result<TestSuite> {
    generate_from_story_with(backend, &PromptBuilder::default(), story, hints)
}

pub fn generate_from_story_with<B: GenerationBackend + ?Sized>(
    backend: &B,
    prompts: &PromptBuilder,
    story: &str,
    hints: &StoryHints,
) -> Result<TestSuite> {
    let base = prompts.story(story, hints);
    let mut last_error: Option<String> = None;

    for round in 1..=STORY_ROUNDS {
        let mut request = base.clone();
        if let Some(err) = &last_error {
            request.task_instruction.push_str(&format!(
                "\n\nNOTE: the previous answer could not be parsed ({}). \
                 Return one valid JSON object, every string and bracket closed, nothing else.",
                err
            ));
        }

        debug!(round, backend = backend.name(), "requesting suite from story");
        let response = backend.generate(&request)?;
        match decode_suite(backend, prompts, &response) {
            Ok(mut suite) => {
                if suite.test_cases.is_empty() {
                    return Err(Error::SuiteParse(
                        "generated suite has no test cases".to_string(),
                    ));
                }
                suite.fill_defaults(story, hints);
                info!(
                    round,
                    suite = suite.label(),
                    cases = suite.test_cases.len(),
                    "generated suite from story"
                );
                return Ok(suite);
            }
            Err(Error::SuiteParse(reason)) => {
                warn!(round, error = %reason, "suite response not decodable");
                last_error = Some(reason);
            }
            Err(other) => return Err(other),
        }
    }

    Err(Error::SuiteParse(format!(
        "no decodable suite after {} rounds: {}",
        STORY_ROUNDS,
        last_error.unwrap_or_default()
    )))
}

fn decode_suite<B: GenerationBackend + ?Sized>(
    backend: &B,
    prompts: &PromptBuilder,
    response: &str,
) -> Result<TestSuite> {
    let candidate = extract_json_object(response)
        .ok_or_else(|| Error::SuiteParse("no JSON object in response".to_string()))?;

    let value = match serde_json::from_str::<Value>(&candidate) {
        Ok(value) => value,
        Err(first) => {
            let sanitized = sanitize_json(&candidate);
            match serde_json::from_str::<Value>(&sanitized) {
                Ok(value) if sanitized != candidate => value,
                _ => {
                    debug!(error = %first, "asking backend to repair suite JSON");
                    let repaired = backend.generate(&prompts.json_repair(response))?;
                    let candidate = extract_json_object(&repaired).ok_or_else(|| {
                        Error::SuiteParse(format!("{}; repair returned no JSON", first))
                    })?;
                    serde_json::from_str::<Value>(&candidate).map_err(|e| {
                        Error::SuiteParse(format!("{}; still invalid after repair: {}", first, e))
                    })?
                }
            }
        }
    };

    if !value.is_object() {
        return Err(Error::SuiteParse("response is not a JSON object".to_string()));
    }
    serde_json::from_value(value).map_err(|e| Error::SuiteParse(e.to_string()))
}
