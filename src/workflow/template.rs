//! Workflow argument templating
//!
//! Deliberately minimal: `{{ .field }}` substitutes an input or output
//! variable, `{{ steps.<id>.<path> }}` reads a stored step result. Missing
//! references render as empty strings and surface as warnings on the step
//! record. No expression language.

use crate::Result;
use crate::error::TemplateError;
use minijinja::{Environment, UndefinedBehavior};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

/// Look up a dot-separated path with numeric array indices, e.g.
/// `pods.0.name`. Exact traversal, no wildcards.
pub fn lookup_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn reference_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"\{\{\s*\.?([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}")
            .expect("reference regex is valid")
    })
}

fn hyphenated_step_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        // steps.<id-with-hyphen> needs bracket syntax for the renderer.
        Regex::new(r"steps\.([A-Za-z0-9_]*-[A-Za-z0-9_\-]*)")
            .expect("step reference regex is valid")
    })
}

/// Template renderer shared by the workflow engine and lifecycle tools
pub struct Templater {
    env: Arc<Environment<'static>>,
}

impl Templater {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| minijinja::AutoEscape::None);
        // Missing references render empty instead of erroring.
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        Self { env: Arc::new(env) }
    }

    /// Render one template string against the scope
    pub fn render(&self, template: &str, scope: &HashMap<String, Value>) -> Result<String> {
        let normalized = normalize(template);
        let context = minijinja::Value::from_serialize(scope);
        self.env
            .render_str(&normalized, context)
            .map_err(|e| TemplateError::Syntax(e.to_string()).into())
    }

    /// Render a value tree: strings are templated (a string that is exactly
    /// one reference keeps the referenced value's JSON type), arrays and
    /// objects recurse. Unresolved references are collected as warnings.
    pub fn render_value(
        &self,
        value: &Value,
        scope: &HashMap<String, Value>,
        warnings: &mut Vec<String>,
    ) -> Result<Value> {
        match value {
            Value::String(template) => {
                self.collect_unresolved(template, scope, warnings);

                // Whole-value reference: return the actual value, not its
                // string rendering, so numbers and objects survive.
                if let Some(reference) = whole_reference(template) {
                    return Ok(resolve_reference(&reference, scope).unwrap_or(Value::Null));
                }

                self.render(template, scope).map(Value::String)
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, scope, warnings))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(key, value)| {
                    self.render_value(value, scope, warnings)
                        .map(|rendered| (key.clone(), rendered))
                })
                .collect::<Result<Map<String, Value>>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    fn collect_unresolved(
        &self,
        template: &str,
        scope: &HashMap<String, Value>,
        warnings: &mut Vec<String>,
    ) {
        for capture in reference_regex().captures_iter(template) {
            let reference = &capture[1];
            if resolve_reference(reference, scope).is_none() {
                warnings.push(format!("unresolved reference '{}'", reference));
            }
        }
    }
}

impl Default for Templater {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a whole args map, returning resolved args plus template warnings
pub fn render_args(
    args: &HashMap<String, Value>,
    scope: &HashMap<String, Value>,
) -> Result<(Map<String, Value>, Vec<String>)> {
    static TEMPLATER: OnceLock<Templater> = OnceLock::new();
    let templater = TEMPLATER.get_or_init(Templater::new);

    let mut warnings = Vec::new();
    let mut rendered = Map::new();
    // Stable ordering keeps resolved inputs deterministic in records.
    let mut keys: Vec<&String> = args.keys().collect();
    keys.sort();
    for key in keys {
        let value = templater.render_value(&args[key], scope, &mut warnings)?;
        rendered.insert(key.clone(), value);
    }
    Ok((rendered, warnings))
}

/// `{{ .foo }}` -> `{{ foo }}`, hyphenated step ids -> bracket syntax
fn normalize(template: &str) -> String {
    let dotless = template.replace("{{ .", "{{ ").replace("{{.", "{{ ");
    hyphenated_step_regex()
        .replace_all(&dotless, |caps: &regex::Captures| {
            format!("steps['{}']", &caps[1])
        })
        .to_string()
}

/// If the template is exactly one `{{ reference }}`, return the reference
fn whole_reference(template: &str) -> Option<String> {
    let trimmed = template.trim();
    let capture = reference_regex().captures(trimmed)?;
    let whole = capture.get(0)?;
    if whole.start() == 0 && whole.end() == trimmed.len() {
        Some(capture[1].to_string())
    } else {
        None
    }
}

/// Resolve a dotted reference against the scope map
fn resolve_reference(reference: &str, scope: &HashMap<String, Value>) -> Option<Value> {
    let (head, rest) = match reference.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (reference, None),
    };
    let root = scope.get(head)?;
    match rest {
        Some(rest) => lookup_path(root, rest),
        None => Some(root.clone()),
    }
}
