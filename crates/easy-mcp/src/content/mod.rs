//! Prompt and resource Content Handlers
//!
//! Both stores are keyed by a name derived from the file path relative to
//! their root directory, so a deleted file can be removed by recomputing the
//! same key. Every change is published on a broadcast channel.

pub mod prompts;
pub mod resources;
pub mod watcher;

pub use prompts::{PromptDefinition, PromptStore};
pub use resources::{mime_type_for, ResourceDefinition, ResourceStore};
pub use watcher::{watch_content, ContentWatcher};

use regex::Regex;
use serde_json::{Map, Value};
use std::path::{Component, Path};
use std::sync::OnceLock;
use tokio::sync::broadcast;

pub(crate) const CHANGE_CAPACITY: usize = 64;

/// Which store changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Prompt,
    Resource,
}

/// One add/update/remove applied to a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    pub kind: ContentKind,
    pub key: String,
    pub removed: bool,
}

/// A store fed from files under one root directory
pub trait ContentHandler: Send + Sync {
    fn kind(&self) -> ContentKind;

    fn root(&self) -> &Path;

    /// Key of the entry a file maps to, or None when the file is ignored
    fn key_for(&self, path: &Path) -> Option<String>;

    /// Add or replace the entry for `path`; returns its key
    fn upsert(&self, path: &Path, content: String) -> Option<String>;

    /// Remove the entry for `path`; returns the removed key
    fn remove(&self, path: &Path) -> Option<String>;

    fn subscribe(&self) -> broadcast::Receiver<ContentChange>;
}

fn placeholder_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").ok())
        .as_ref()
}

/// `{{param}}` names in order of first appearance, without duplicates
pub fn extract_parameters(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let Some(re) = placeholder_regex() else {
        return names;
    };
    for caps in re.captures_iter(template) {
        let name = &caps[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Substitute `{{param}}` placeholders. Unknown placeholders are left as is;
/// non-string values are inserted as JSON.
pub fn render(template: &str, arguments: &Map<String, Value>) -> String {
    let Some(re) = placeholder_regex() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex::Captures<'_>| match arguments.get(&caps[1]) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => caps[0].to_string(),
    })
    .into_owned()
}

/// Path of `path` relative to `root` with `/` separators. Hidden files and
/// anything outside the root map to None.
pub(crate) fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str()?;
                if part.starts_with('.') {
                    return None;
                }
                parts.push(part.to_string());
            }
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// First non-empty line with markdown heading markers removed
pub(crate) fn first_line_description(content: &str) -> Option<String> {
    content
        .lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .map(String::from)
}
