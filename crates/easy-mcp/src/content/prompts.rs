//! Prompt store
//!
//! Each file under the prompts directory is one prompt template. The prompt
//! name is the relative path without its extension (`team/review.md` →
//! `team/review`). When two files map to the same name, the one loaded
//! first keeps it until it is removed.

use super::{
    extract_parameters, first_line_description, relative_key, render, ContentChange,
    ContentHandler, ContentKind, CHANGE_CAPACITY,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct PromptDefinition {
    pub name: String,
    pub description: Option<String>,
    pub template: String,
    /// `{{param}}` placeholders in order of appearance
    pub parameters: Vec<String>,
    pub source_path: PathBuf,
}

impl PromptDefinition {
    /// `prompts/list` entry
    pub fn to_list_entry(&self) -> Value {
        let arguments: Vec<Value> = self
            .parameters
            .iter()
            .map(|p| json!({ "name": p, "required": false }))
            .collect();
        json!({
            "name": self.name,
            "description": self.description,
            "arguments": arguments,
        })
    }

    pub fn render(&self, arguments: &Map<String, Value>) -> String {
        render(&self.template, arguments)
    }
}

pub struct PromptStore {
    root: PathBuf,
    prompts: RwLock<BTreeMap<String, PromptDefinition>>,
    changes: broadcast::Sender<ContentChange>,
}

impl PromptStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            root: root.into(),
            prompts: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    pub fn list(&self) -> Vec<PromptDefinition> {
        self.prompts
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<PromptDefinition> {
        self.prompts.read().ok()?.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.prompts.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, key: &str, removed: bool) {
        let _ = self.changes.send(ContentChange {
            kind: ContentKind::Prompt,
            key: key.to_string(),
            removed,
        });
    }
}

impl ContentHandler for PromptStore {
    fn kind(&self) -> ContentKind {
        ContentKind::Prompt
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = relative_key(&self.root, path)?;
        let key = match relative.rsplit_once('/') {
            Some((dir, file)) => format!("{}/{}", dir, strip_extension(file)),
            None => strip_extension(&relative).to_string(),
        };
        Some(key)
    }

    fn upsert(&self, path: &Path, content: String) -> Option<String> {
        let name = self.key_for(path)?;
        let prompt = PromptDefinition {
            name: name.clone(),
            description: first_line_description(&content),
            parameters: extract_parameters(&content),
            template: content,
            source_path: path.to_path_buf(),
        };
        {
            let mut prompts = self.prompts.write().ok()?;
            if let Some(existing) = prompts.get(&name) {
                if existing.source_path != path {
                    warn!(
                        prompt = %name,
                        kept = %existing.source_path.display(),
                        ignored = %path.display(),
                        "Prompt name already taken by another file"
                    );
                    return None;
                }
            }
            debug!(prompt = %name, parameters = ?prompt.parameters, "Prompt loaded");
            prompts.insert(name.clone(), prompt);
        }
        self.publish(&name, false);
        Some(name)
    }

    fn remove(&self, path: &Path) -> Option<String> {
        let name = self.key_for(path)?;
        let removed = {
            let mut prompts = self.prompts.write().ok()?;
            match prompts.get(&name) {
                Some(existing) if existing.source_path == path => prompts.remove(&name),
                _ => None,
            }
        };
        removed.map(|_| {
            debug!(prompt = %name, "Prompt removed");
            self.publish(&name, true);
            name
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<ContentChange> {
        self.changes.subscribe()
    }
}

fn strip_extension(file: &str) -> &str {
    match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_relative_path_without_extension() {
        let store = PromptStore::new("/p");
        assert_eq!(store.key_for(Path::new("/p/review.md")).as_deref(), Some("review"));
        assert_eq!(
            store.key_for(Path::new("/p/team/deploy.v2.txt")).as_deref(),
            Some("team/deploy.v2")
        );
        assert_eq!(store.key_for(Path::new("/p/README")).as_deref(), Some("README"));
        assert_eq!(store.key_for(Path::new("/elsewhere/x.md")), None);
    }

    #[test]
    fn test_upsert_replace_remove() {
        let store = PromptStore::new("/p");
        let mut changes = store.subscribe();
        let path = Path::new("/p/greet.md");

        store.upsert(path, "# Greeting\nHello {{name}}".into());
        let prompt = store.get("greet").unwrap();
        assert_eq!(prompt.description.as_deref(), Some("Greeting"));
        assert_eq!(prompt.parameters, vec!["name".to_string()]);

        store.upsert(path, "Bye {{name}} from {{place}}".into());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("greet").unwrap().parameters.len(), 2);

        assert_eq!(store.remove(path).as_deref(), Some("greet"));
        assert!(store.is_empty());
        assert_eq!(store.remove(path), None);

        let first = changes.try_recv().unwrap();
        assert_eq!(first, ContentChange { kind: ContentKind::Prompt, key: "greet".into(), removed: false });
        let _ = changes.try_recv().unwrap();
        assert!(changes.try_recv().unwrap().removed);
    }

    #[test]
    fn test_same_stem_keeps_first_file() {
        let store = PromptStore::new("/p");
        let md = Path::new("/p/a.md");
        let txt = Path::new("/p/a.txt");

        assert_eq!(store.upsert(md, "from markdown".into()).as_deref(), Some("a"));
        assert_eq!(store.upsert(txt, "from text".into()), None);
        assert_eq!(store.get("a").unwrap().template, "from markdown");
        assert_eq!(store.get("a").unwrap().source_path, md);

        // Removing the shadowed file leaves the prompt alone
        assert_eq!(store.remove(txt), None);
        assert_eq!(store.len(), 1);

        assert_eq!(store.remove(md).as_deref(), Some("a"));
        assert_eq!(store.upsert(txt, "from text".into()).as_deref(), Some("a"));
        assert_eq!(store.get("a").unwrap().template, "from text");
    }

    #[test]
    fn test_list_entry_and_render() {
        let store = PromptStore::new("/p");
        store.upsert(Path::new("/p/ask.md"), "Tell me about {{topic}}".into());
        let prompt = store.get("ask").unwrap();
        assert_eq!(
            prompt.to_list_entry(),
            json!({
                "name": "ask",
                "description": "Tell me about {{topic}}",
                "arguments": [{"name": "topic", "required": false}]
            })
        );
        let args = json!({"topic": "rust"});
        assert_eq!(prompt.render(args.as_object().unwrap()), "Tell me about rust");
    }
}
