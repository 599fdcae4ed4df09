use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};

pub const REVIEW_SYSTEM: &str = "review-system";
pub const REVIEW_USER: &str = "review-user";
pub const SCENARIO_SYSTEM: &str = "scenario-system";
pub const SCENARIO_USER: &str = "scenario-user";

const DEFAULT_REVIEW_SYSTEM: &str = "\
You are reviewing a code change for {{ name }}.
{{ focus }}

Report only problems introduced or touched by the change. Respond with JSON only:
{\"findings\": [{\"file\": \"path\", \"line\": 1, \"snippet\": \"code on that line\", \
\"severity\": \"critical|warning|info\", \"category\": \"{{ name }}\", \
\"message\": \"what is wrong\", \"suggestion\": \"how to fix it\", \"confidence\": 0.0}]}
Return {\"findings\": []} when there is nothing to report.
";

const DEFAULT_SCENARIO_SYSTEM: &str = "\
You are writing tests for a code change. Scenario: {{ name }}.
{{ focus }}

Respond with JSON only:
{\"tests\": [{\"file\": \"path of the new test file\", \"content\": \"full file content\", \
\"description\": \"what the test checks\"}]}
";

const DEFAULT_USER: &str = "\
Changed files ({{ files | len }}):
{% for file in files %}- {{ file }}
{% endfor %}
```diff
{{ diff }}
```
";

const TEMPLATE_NAMES: &[&str] = &[REVIEW_SYSTEM, REVIEW_USER, SCENARIO_SYSTEM, SCENARIO_USER];

fn default_template(name: &str) -> Option<&'static str> {
    match name {
        REVIEW_SYSTEM => Some(DEFAULT_REVIEW_SYSTEM),
        SCENARIO_SYSTEM => Some(DEFAULT_SCENARIO_SYSTEM),
        REVIEW_USER | SCENARIO_USER => Some(DEFAULT_USER),
        _ => None,
    }
}

/// Values available to every template.
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub name: String,
    pub focus: String,
    pub files: Vec<String>,
    pub diff: String,
}

/// Compiled prompt templates: embedded defaults, each replaceable by a
/// `<name>.md` file in the override directory.
pub struct PromptEngine {
    engine: upon::Engine<'static>,
    override_dir: Option<PathBuf>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<PathBuf>) -> Result<Self> {
        let mut engine = upon::Engine::new();
        engine.add_function("len", |list: &[upon::Value]| list.len() as i64);

        for name in TEMPLATE_NAMES {
            let source = match override_source(override_dir.as_deref(), name)? {
                Some(source) => source,
                None => default_template(name)
                    .ok_or_else(|| Error::Prompt(format!("unknown prompt template: {name}")))?
                    .to_string(),
            };
            engine
                .add_template(*name, source)
                .map_err(|e| Error::Prompt(format!("failed to compile template {name}: {e}")))?;
        }

        Ok(Self {
            engine,
            override_dir,
        })
    }

    pub fn override_dir(&self) -> Option<&Path> {
        self.override_dir.as_deref()
    }

    pub fn render(&self, name: &str, ctx: &PromptContext) -> Result<String> {
        let template = self
            .engine
            .get_template(name)
            .ok_or_else(|| Error::Prompt(format!("unknown prompt template: {name}")))?;
        template
            .render(ctx)
            .to_string()
            .map_err(|e| Error::Prompt(format!("failed to render template {name}: {e}")))
    }
}

fn override_source(dir: Option<&Path>, name: &str) -> Result<Option<String>> {
    let Some(dir) = dir else {
        return Ok(None);
    };
    let path = dir.join(format!("{name}.md"));
    if !path.exists() {
        return Ok(None);
    }
    std::fs::read_to_string(&path).map(Some).map_err(|e| {
        Error::Prompt(format!(
            "failed to read override template {}: {e}",
            path.display()
        ))
    })
}
