//! Mode definitions.
//!
//! A mode bundles the observation-type vocabulary, the concept vocabulary,
//! and the prompt templates used by the session supervisor. Modes live as
//! `modes/<name>.json` files under the data directory. A file named
//! `parent--override.json` inherits from `parent.json`: plain objects merge
//! recursively, arrays and scalars replace.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ModeError {
    #[error("mode not found: {0}")]
    NotFound(String),
    #[error("invalid mode file {name}: {source}")]
    Invalid {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModePrompts {
    #[serde(default = "default_init_prompt")]
    pub init: String,
    #[serde(default = "default_continuation_prompt")]
    pub continuation: String,
    #[serde(default = "default_observation_prompt")]
    pub observation: String,
    #[serde(default = "default_summarize_prompt")]
    pub summarize: String,
}

impl Default for ModePrompts {
    fn default() -> Self {
        Self {
            init: default_init_prompt(),
            continuation: default_continuation_prompt(),
            observation: default_observation_prompt(),
            summarize: default_summarize_prompt(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mode {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_observation_types")]
    pub observation_types: Vec<String>,
    #[serde(default = "default_concepts")]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub prompts: ModePrompts,
}

impl Default for Mode {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            observation_types: default_observation_types(),
            concepts: default_concepts(),
            prompts: ModePrompts::default(),
        }
    }
}

fn default_observation_types() -> Vec<String> {
    ["decision", "bugfix", "feature", "refactor", "discovery", "change"]
        .map(str::to_string)
        .to_vec()
}

fn default_concepts() -> Vec<String> {
    [
        "architecture",
        "build",
        "config",
        "database",
        "dependency",
        "error-handling",
        "performance",
        "security",
        "testing",
        "tooling",
    ]
    .map(str::to_string)
    .to_vec()
}

fn default_init_prompt() -> String {
    "You are a memory agent for the project {project}. Compress tool-use \
     events into <memory> observations. The session began with this request:\n\
     {user_prompt}"
        .to_string()
}

fn default_continuation_prompt() -> String {
    "Continuing the memory session for {project} at prompt #{prompt_number}. \
     Keep emitting <memory> observations for new tool events."
        .to_string()
}

fn default_observation_prompt() -> String {
    "Tool: {tool_name}\nInput: {tool_input}\nResult: {tool_response}\n\n\
     Record what mattered as <memory><observation type=\"...\">...</observation></memory>."
        .to_string()
}

fn default_summarize_prompt() -> String {
    "The assistant finished with:\n{last_assistant_message}\n\n\
     Emit a <summary> with request/investigated/learned/completed/next_steps/notes."
        .to_string()
}

/// Substitute `{key}` placeholders. Unknown placeholders are left alone.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Deep-merge `overlay` onto `base`: objects merge key-by-key recursively,
/// everything else (arrays included) replaces.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Load every mode file under `dir`, resolving single-level
/// `parent--override` inheritance. A missing or empty directory yields just
/// the built-in default mode.
pub fn load_modes(dir: &Path) -> Result<HashMap<String, Mode>, ModeError> {
    let mut raw: HashMap<String, Value> = HashMap::new();
    if dir.is_dir() {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Value>(&text) {
                Ok(value) => {
                    raw.insert(name.to_string(), value);
                }
                Err(e) => warn!(mode = name, error = %e, "skipping unparseable mode file"),
            }
        }
    }

    let mut modes = HashMap::new();
    for (name, value) in &raw {
        let resolved = match name.split_once("--") {
            Some((parent, _)) => match raw.get(parent) {
                Some(parent_value) => deep_merge(parent_value.clone(), value.clone()),
                None => {
                    warn!(mode = %name, parent, "mode parent missing, using override alone");
                    value.clone()
                }
            },
            None => value.clone(),
        };
        let mut mode: Mode =
            serde_json::from_value(resolved).map_err(|source| ModeError::Invalid {
                name: name.clone(),
                source,
            })?;
        mode.name = name.clone();
        modes.insert(name.clone(), mode);
    }

    modes
        .entry("default".to_string())
        .or_insert_with(Mode::default);
    Ok(modes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_merges_objects_and_replaces_arrays() {
        let base = json!({
            "prompts": {"init": "a", "summarize": "b"},
            "concepts": ["one", "two"],
            "observation_types": ["decision"]
        });
        let overlay = json!({
            "prompts": {"init": "A"},
            "concepts": ["three"]
        });
        let merged = deep_merge(base, overlay);
        assert_eq!(merged["prompts"]["init"], "A");
        assert_eq!(merged["prompts"]["summarize"], "b");
        assert_eq!(merged["concepts"], json!(["three"]));
        assert_eq!(merged["observation_types"], json!(["decision"]));
    }

    #[test]
    fn render_template_replaces_known_placeholders() {
        let out = render_template("p={project} t={tool_name}", &[("project", "x/y")]);
        assert_eq!(out, "p=x/y t={tool_name}");
    }

    #[test]
    fn load_modes_resolves_parent_override() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("code.json"),
            json!({
                "concepts": ["testing", "build"],
                "prompts": {"init": "base init", "summarize": "base summary"}
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("code--terse.json"),
            json!({
                "prompts": {"init": "terse init"}
            })
            .to_string(),
        )
        .unwrap();

        let modes = load_modes(dir.path()).unwrap();
        let terse = &modes["code--terse"];
        assert_eq!(terse.prompts.init, "terse init");
        assert_eq!(terse.prompts.summarize, "base summary");
        assert_eq!(terse.concepts, vec!["testing", "build"]);
        assert!(modes.contains_key("default"));
    }

    #[test]
    fn load_modes_without_directory_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let modes = load_modes(&dir.path().join("missing")).unwrap();
        assert_eq!(modes.len(), 1);
        assert_eq!(modes["default"].observation_types.len(), 6);
    }
}
