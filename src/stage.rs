//! Stage definitions and the context they read from.
//!
//! A pipeline is a plain ordered list of [`StageDefinition`]s. Each one is
//! immutable and shared by every run: a name, a function that turns the
//! run's accumulated [`RunContext`] into the stage's input, and the kind of
//! output the stage must produce.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a stage is expected to return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputKind {
    /// Any text; folded into the context verbatim.
    FreeText,
    /// A JSON object carrying at least the `required` top-level keys.
    Json {
        #[serde(default)]
        required: Vec<String>,
    },
}

impl Default for OutputKind {
    fn default() -> Self {
        OutputKind::Json {
            required: Vec::new(),
        }
    }
}

impl OutputKind {
    pub fn expects_json(&self) -> bool {
        matches!(self, OutputKind::Json { .. })
    }
}

/// Declarative form of a stage, as written in `jobline.toml`.
///
/// The template may reference any context block as `{{name}}`, the previous
/// stage's parsed output as `{{previous}}` and all blocks at once as
/// `{{context}}`. Unknown references render as empty text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub output: OutputKind,
}

/// The input handed to the stage executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInput {
    pub stage: String,
    pub prompt: String,
    pub expects_json: bool,
}

pub type InputBuilder = Arc<dyn Fn(&RunContext) -> String + Send + Sync>;

#[derive(Clone)]
pub struct StageDefinition {
    name: String,
    input_builder: InputBuilder,
    output_kind: OutputKind,
}

impl fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("output_kind", &self.output_kind)
            .finish_non_exhaustive()
    }
}

impl StageDefinition {
    pub fn new(
        name: impl Into<String>,
        output_kind: OutputKind,
        input_builder: impl Fn(&RunContext) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            input_builder: Arc::new(input_builder),
            output_kind,
        }
    }

    pub fn from_template(
        name: impl Into<String>,
        template: impl Into<String>,
        output_kind: OutputKind,
    ) -> Self {
        let template = template.into();
        Self::new(name, output_kind, move |ctx| render_template(&template, ctx))
    }

    pub fn from_spec(spec: &StageSpec) -> Self {
        Self::from_template(spec.name.clone(), spec.template.clone(), spec.output.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_kind(&self) -> &OutputKind {
        &self.output_kind
    }

    pub fn build_input(&self, ctx: &RunContext) -> StageInput {
        StageInput {
            stage: self.name.clone(),
            prompt: (self.input_builder)(ctx),
            expects_json: self.output_kind.expects_json(),
        }
    }
}

/// Named blocks accumulated over a run, in insertion order.
///
/// Payload blocks come first; each completed stage adds its parsed output
/// under its own name and becomes [`RunContext::previous`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunContext {
    blocks: Vec<(String, Value)>,
    previous: Option<String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a payload block. A block with the same name is replaced in place.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.blocks.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.blocks.push((name, value)),
        }
    }

    /// Record a stage's parsed output and make it the previous output.
    pub fn fold_stage(&mut self, stage: &str, value: Value) {
        self.insert(stage, value);
        self.previous = Some(stage.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.blocks.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn previous(&self) -> Option<&Value> {
        self.previous.as_deref().and_then(|name| self.get(name))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().map(|(n, _)| n.as_str())
    }

    /// Every block as a markdown section.
    pub fn render_all(&self) -> String {
        self.blocks
            .iter()
            .map(|(name, value)| format!("### {name}\n{}", render_value(value)))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn lookup(&self, key: &str) -> String {
        match key {
            "previous" => self.previous().map(render_value).unwrap_or_default(),
            "context" => self.render_all(),
            name => self.get(name).map(render_value).unwrap_or_default(),
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Substitute `{{key}}` references. An unterminated `{{` is kept literally.
pub fn render_template(template: &str, ctx: &RunContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                out.push_str(&ctx.lookup(after[..end].trim()));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// The built-in three-stage candidate assessment pipeline: extract the
/// candidate profile, assess it against the requirements, plan the interview.
pub fn default_stages() -> Vec<StageSpec> {
    vec![
        StageSpec {
            name: "extract".into(),
            template: "You are a recruiting analyst. Extract the candidate's details from the \
                       material below. Respond with ONLY a JSON object of the form \
                       {\"candidate_info\": {\"first_name\": \"\", \"last_name\": \"\", \
                       \"skills\": [], \"experience\": \"\"}}.\n\n{{context}}"
                .into(),
            output: OutputKind::Json {
                required: vec!["candidate_info".into()],
            },
        },
        StageSpec {
            name: "assess".into(),
            template: "You are an experienced team lead. Take the candidate JSON below, add an \
                       \"assessment\" key with grade, type, criteria_matching and \
                       values_assessment, and return the full merged JSON object. Do not start \
                       from scratch.\n\nCandidate:\n{{previous}}\n\nRequirements:\n{{requirements}}"
                .into(),
            output: OutputKind::Json {
                required: vec!["candidate_info".into(), "assessment".into()],
            },
        },
        StageSpec {
            name: "plan".into(),
            template: "Prepare an interview plan for the assessed candidate below. Respond with \
                       ONLY a JSON object with \"key_topics\" (list of strings) and \
                       \"suggested_questions\" (list of {\"category\", \"questions\"}).\n\n\
                       {{previous}}"
                .into(),
            output: OutputKind::Json {
                required: vec!["key_topics".into(), "suggested_questions".into()],
            },
        },
    ]
}
