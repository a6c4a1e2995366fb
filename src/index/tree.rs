//! Directory-tree projection of the index
//!
//! Nodes live in an arena (`Vec`) and reference each other by index, so
//! the tree has no shared-pointer cycles and is rebuilt wholesale on every
//! index load.

use crate::index::IndexElement;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

/// A file attached to a tree node
#[derive(Debug, Clone)]
pub struct FileRef {
    pub object_id: Uuid,
    pub date: i64,
    pub digest: Option<Vec<u8>>,
}

/// One node in the tree; directories have `file == None`
#[derive(Debug)]
pub struct TreeNode {
    pub name: String,
    pub file: Option<FileRef>,
    children: Vec<usize>,
}

/// Arena-allocated directory tree; node 0 is the root
pub struct IndexTree {
    nodes: Vec<TreeNode>,
}

/// A listing entry as exposed over the API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeEntry {
    pub name: String,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<i64>,
}

impl IndexTree {
    /// An empty tree containing only the root
    pub fn new() -> Self {
        IndexTree {
            nodes: vec![TreeNode {
                name: String::new(),
                file: None,
                children: Vec::new(),
            }],
        }
    }

    /// Project a flat element list into a tree
    pub fn build(elements: &[IndexElement]) -> Self {
        let mut tree = Self::new();
        for element in elements {
            let file = match element.object_uuid() {
                Ok(object_id) => FileRef {
                    object_id,
                    date: element.date,
                    digest: element.digest.clone(),
                },
                Err(_) => {
                    warn!(path = %element.path, "skipping index entry with invalid object id");
                    continue;
                }
            };
            tree.insert(&element.path, file);
        }
        tree
    }

    fn insert(&mut self, path: &str, file: FileRef) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut node = 0usize;
        for (i, segment) in segments.iter().enumerate() {
            node = match self.find_child(node, segment) {
                Some(child) => child,
                None => self.add_child(node, segment),
            };
            if i == segments.len() - 1 {
                self.nodes[node].file = Some(file.clone());
            }
        }
    }

    fn find_child(&self, node: usize, name: &str) -> Option<usize> {
        self.nodes[node]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c].name == name)
    }

    fn add_child(&mut self, node: usize, name: &str) -> usize {
        let id = self.nodes.len();
        self.nodes.push(TreeNode {
            name: name.to_string(),
            file: None,
            children: Vec::new(),
        });
        self.nodes[node].children.push(id);
        id
    }

    /// Find the node at a path; `/` is the root
    pub fn find(&self, path: &str) -> Option<usize> {
        let mut node = 0usize;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = self.find_child(node, segment)?;
        }
        Some(node)
    }

    /// The object id of the file at a path, if any
    pub fn file_at(&self, path: &str) -> Option<Uuid> {
        let node = self.find(path)?;
        self.nodes[node].file.as_ref().map(|f| f.object_id)
    }

    /// List the children of a directory path, sorted by name
    ///
    /// Returns `None` when the path does not exist or names a file.
    pub fn list(&self, path: &str) -> Option<Vec<TreeEntry>> {
        let node = self.find(path)?;
        if self.nodes[node].file.is_some() {
            return None;
        }

        let mut entries: Vec<TreeEntry> = self.nodes[node]
            .children
            .iter()
            .map(|&c| {
                let child = &self.nodes[c];
                TreeEntry {
                    name: child.name.clone(),
                    is_dir: child.file.is_none(),
                    object_id: child.file.as_ref().map(|f| f.object_id.to_string()),
                    date: child.file.as_ref().map(|f| f.date),
                }
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Some(entries)
    }

    /// Total node count, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }
}

impl Default for IndexTree {
    fn default() -> Self {
        Self::new()
    }
}
