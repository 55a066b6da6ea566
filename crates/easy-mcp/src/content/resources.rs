//! Resource store
//!
//! Each file under the resources directory is readable as
//! `resource://<relative path>`. Files containing `{{param}}` placeholders are
//! templates and are rendered with the `arguments` of `resources/read`.

use super::{
    extract_parameters, first_line_description, relative_key, render, ContentChange,
    ContentHandler, ContentKind, CHANGE_CAPACITY,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

pub const RESOURCE_SCHEME: &str = "resource://";

/// MIME type for a file name, by extension
pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" => "text/markdown",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "yaml" | "yml" => "application/yaml",
        "toml" => "application/toml",
        "js" | "mjs" => "text/javascript",
        "css" => "text/css",
        "svg" => "image/svg+xml",
        _ => "text/plain",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    pub uri: String,
    /// Relative path of the source file
    pub name: String,
    pub description: Option<String>,
    pub mime_type: String,
    pub content: String,
    pub parameters: Vec<String>,
    pub source_path: PathBuf,
}

impl ResourceDefinition {
    /// `resources/list` entry
    pub fn to_list_entry(&self) -> Value {
        json!({
            "uri": self.uri,
            "name": self.name,
            "description": self.description,
            "mimeType": self.mime_type,
        })
    }

    /// Content with template placeholders filled from `arguments`
    pub fn read(&self, arguments: Option<&Map<String, Value>>) -> String {
        match arguments {
            Some(args) if !self.parameters.is_empty() => render(&self.content, args),
            _ => self.content.clone(),
        }
    }
}

pub struct ResourceStore {
    root: PathBuf,
    resources: RwLock<BTreeMap<String, ResourceDefinition>>,
    changes: broadcast::Sender<ContentChange>,
}

impl ResourceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            root: root.into(),
            resources: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    pub fn list(&self) -> Vec<ResourceDefinition> {
        self.resources
            .read()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, uri: &str) -> Option<ResourceDefinition> {
        self.resources.read().ok()?.get(uri).cloned()
    }

    pub fn len(&self) -> usize {
        self.resources.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentHandler for ResourceStore {
    fn kind(&self) -> ContentKind {
        ContentKind::Resource
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        relative_key(&self.root, path).map(|relative| format!("{}{}", RESOURCE_SCHEME, relative))
    }

    fn upsert(&self, path: &Path, content: String) -> Option<String> {
        let uri = self.key_for(path)?;
        let name = uri.trim_start_matches(RESOURCE_SCHEME).to_string();
        let resource = ResourceDefinition {
            uri: uri.clone(),
            name,
            description: first_line_description(&content),
            mime_type: mime_type_for(path).to_string(),
            parameters: extract_parameters(&content),
            content,
            source_path: path.to_path_buf(),
        };
        debug!(uri = %uri, mime = %resource.mime_type, "Resource loaded");
        self.resources.write().ok()?.insert(uri.clone(), resource);
        let _ = self.changes.send(ContentChange {
            kind: ContentKind::Resource,
            key: uri.clone(),
            removed: false,
        });
        Some(uri)
    }

    fn remove(&self, path: &Path) -> Option<String> {
        let uri = self.key_for(path)?;
        self.resources.write().ok()?.remove(&uri)?;
        debug!(uri = %uri, "Resource removed");
        let _ = self.changes.send(ContentChange {
            kind: ContentKind::Resource,
            key: uri.clone(),
            removed: true,
        });
        Some(uri)
    }

    fn subscribe(&self) -> broadcast::Receiver<ContentChange> {
        self.changes.subscribe()
    }
}
