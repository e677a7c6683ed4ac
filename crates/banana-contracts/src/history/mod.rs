//! Version tree of generation results.
//!
//! Entries live in an arena and refer to each other by [`EntryId`]. A handle
//! carries the store id and the store epoch, so handles from another store or
//! from before a [`HistoryStore::clear`] are rejected instead of aliasing a
//! newer entry.

pub mod manifest;

use std::fmt;

use chrono::{DateTime, Utc};
use similar::TextDiff;
use uuid::Uuid;

use crate::errors::NotFoundError;
use crate::image::Image;
use crate::request::GenerationRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    store: Uuid,
    epoch: u32,
    index: u32,
}

impl EntryId {
    /// Position in append order within the current epoch.
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Human-facing label (`v1`, `v2`, ...), also used in the session file.
    pub fn version_label(self) -> String {
        format!("v{}", self.index + 1)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (epoch {})", self.version_label(), self.epoch)
    }
}

/// Output of one successful generation call. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    image: Image,
    request: GenerationRequest,
    created_at: DateTime<Utc>,
    parent: Option<EntryId>,
}

impl GenerationResult {
    pub fn new(image: Image, request: GenerationRequest) -> Self {
        Self::with_created_at(image, request, Utc::now())
    }

    pub fn with_created_at(
        image: Image,
        request: GenerationRequest,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            image,
            request,
            created_at,
            parent: None,
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Set by [`HistoryStore::append`].
    pub fn parent(&self) -> Option<EntryId> {
        self.parent
    }
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    id: EntryId,
    result: GenerationResult,
    children: Vec<EntryId>,
    prompt_diff: Option<Vec<String>>,
}

impl HistoryEntry {
    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn result(&self) -> &GenerationResult {
        &self.result
    }

    pub fn image(&self) -> &Image {
        self.result.image()
    }

    pub fn parent(&self) -> Option<EntryId> {
        self.result.parent
    }

    /// Children in the order they were appended.
    pub fn children(&self) -> &[EntryId] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        self.result.parent.is_none()
    }

    /// Unified diff of this entry's prompt against its parent's; `None` for
    /// roots.
    pub fn prompt_diff(&self) -> Option<&[String]> {
        self.prompt_diff.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    id: Uuid,
    epoch: u32,
    nodes: Vec<HistoryEntry>,
    current: Option<u32>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            epoch: 0,
            nodes: Vec::new(),
            current: None,
        }
    }

    pub fn store_id(&self) -> Uuid {
        self.id
    }

    /// Adds a node. `None` starts a new root; `Some(parent)` adds a child,
    /// which branches when `parent` already has children. The new node
    /// becomes current.
    pub fn append(
        &mut self,
        mut result: GenerationResult,
        parent: Option<EntryId>,
    ) -> Result<EntryId, NotFoundError> {
        let prompt_diff = match parent {
            Some(parent_id) => {
                let parent_entry = self.get(parent_id)?;
                Some(prompt_diff(
                    parent_entry.result.request.prompt(),
                    result.request.prompt(),
                ))
            }
            None => None,
        };

        let id = EntryId {
            store: self.id,
            epoch: self.epoch,
            index: self.nodes.len() as u32,
        };
        result.parent = parent;
        if let Some(parent_id) = parent {
            self.nodes[parent_id.index()].children.push(id);
        }
        self.nodes.push(HistoryEntry {
            id,
            result,
            children: Vec::new(),
            prompt_diff,
        });
        self.current = Some(id.index);
        Ok(id)
    }

    pub fn current(&self) -> Option<&HistoryEntry> {
        self.current.map(|index| &self.nodes[index as usize])
    }

    pub fn current_id(&self) -> Option<EntryId> {
        self.current().map(HistoryEntry::id)
    }

    /// Moves the current pointer. Nothing is deleted.
    pub fn restore(&mut self, id: EntryId) -> Result<(), NotFoundError> {
        self.check(id)?;
        self.current = Some(id.index);
        Ok(())
    }

    /// Drops every node. Handles issued before the clear stay invalid even
    /// after new appends reuse their indices.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.current = None;
        self.epoch = self.epoch.wrapping_add(1);
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.check(id).is_ok()
    }

    pub fn get(&self, id: EntryId) -> Result<&HistoryEntry, NotFoundError> {
        self.check(id)?;
        Ok(&self.nodes[id.index()])
    }

    pub fn children(&self, id: EntryId) -> Result<&[EntryId], NotFoundError> {
        Ok(self.get(id)?.children())
    }

    /// Entries from `id` up to its root, `id` first.
    pub fn ancestors(&self, id: EntryId) -> Result<Ancestors<'_>, NotFoundError> {
        self.check(id)?;
        Ok(Ancestors {
            store: self,
            next: Some(id.index()),
        })
    }

    pub fn roots(&self) -> impl Iterator<Item = &HistoryEntry> + '_ {
        self.nodes.iter().filter(|entry| entry.is_root())
    }

    /// All entries in append order.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> + '_ {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolves a `vN` label produced by [`EntryId::version_label`].
    pub fn find_version(&self, label: &str) -> Option<EntryId> {
        let index = label
            .trim()
            .strip_prefix('v')
            .and_then(|raw| raw.parse::<usize>().ok())?
            .checked_sub(1)?;
        self.nodes.get(index).map(HistoryEntry::id)
    }

    fn check(&self, id: EntryId) -> Result<(), NotFoundError> {
        if id.store == self.id && id.epoch == self.epoch && id.index() < self.nodes.len() {
            Ok(())
        } else {
            Err(NotFoundError { id })
        }
    }
}

/// Lazy walk towards the root. Clone it to walk again from the start.
#[derive(Debug, Clone)]
pub struct Ancestors<'a> {
    store: &'a HistoryStore,
    next: Option<usize>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a HistoryEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = &self.store.nodes[self.next?];
        self.next = entry.parent().map(EntryId::index);
        Some(entry)
    }
}

fn prompt_diff(prev: &str, curr: &str) -> Vec<String> {
    let diff = TextDiff::from_lines(prev, curr);
    let rendered = diff.unified_diff().header("prev", "curr").to_string();
    rendered.lines().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, Rgb, RgbImage};

    use super::*;
    use crate::request::{GenerationMode, RequestBuilder};
    use crate::resolution::ResolutionTier;

    fn result(prompt: &str, shade: u8) -> GenerationResult {
        let pixels = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([shade, 0, 0])));
        let image = Image::from_dynamic(pixels);
        let request = RequestBuilder::new(GenerationMode::FullEdit, prompt)
            .base_image(image.clone())
            .resolution(ResolutionTier::Auto)
            .build()
            .expect("valid request");
        GenerationResult::new(image, request)
    }

    #[test]
    fn restore_moves_current_without_deleting() -> anyhow::Result<()> {
        let mut store = HistoryStore::new();
        let root = store.append(result("root", 1), None)?;
        let child = store.append(result("child", 2), Some(root))?;
        assert_eq!(store.current_id(), Some(child));

        store.restore(root)?;
        assert_eq!(store.current_id(), Some(root));
        assert_eq!(store.len(), 2);
        assert_eq!(store.children(root)?, &[child]);
        Ok(())
    }

    #[test]
    fn ancestors_walk_to_root_and_restart() -> anyhow::Result<()> {
        let mut store = HistoryStore::new();
        let root = store.append(result("root", 1), None)?;
        let child = store.append(result("child", 2), Some(root))?;

        let walk = store.ancestors(child)?;
        let ids: Vec<EntryId> = walk.clone().map(HistoryEntry::id).collect();
        assert_eq!(ids, vec![child, root]);
        let again: Vec<EntryId> = walk.map(HistoryEntry::id).collect();
        assert_eq!(again, ids);
        assert_eq!(store.ancestors(root)?.count(), 1);
        Ok(())
    }

    #[test]
    fn clear_invalidates_old_handles() -> anyhow::Result<()> {
        let mut store = HistoryStore::new();
        let root = store.append(result("root", 1), None)?;
        store.clear();
        assert!(store.is_empty());
        assert!(store.current().is_none());
        assert_eq!(store.restore(root), Err(NotFoundError { id: root }));

        let fresh = store.append(result("fresh", 3), None)?;
        assert_eq!(fresh.index(), root.index());
        assert!(store.restore(root).is_err());
        assert!(store.get(root).is_err());
        assert!(store.ancestors(root).is_err());
        assert!(store.append(result("orphan", 4), Some(root)).is_err());
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn editing_from_an_older_version_branches() -> anyhow::Result<()> {
        let mut store = HistoryStore::new();
        let root = store.append(result("base", 1), None)?;
        let first = store.append(result("base\nwarmer", 2), Some(root))?;
        store.restore(root)?;
        let second = store.append(result("base\ncooler", 3), Some(root))?;

        assert_eq!(store.children(root)?, &[first, second]);
        assert_eq!(store.get(second)?.parent(), Some(root));
        assert_eq!(store.get(first)?.image().dimensions(), (8, 8));
        assert_eq!(store.current_id(), Some(second));
        let diff = store.get(second)?.prompt_diff().unwrap_or_default().join("\n");
        assert!(diff.contains("+cooler"));
        assert!(store.get(root)?.prompt_diff().is_none());
        Ok(())
    }

    #[test]
    fn handles_from_another_store_are_rejected() -> anyhow::Result<()> {
        let mut first = HistoryStore::new();
        let mut second = HistoryStore::new();
        let foreign = first.append(result("a", 1), None)?;
        second.append(result("b", 2), None)?;
        assert!(!second.contains(foreign));
        assert!(second.restore(foreign).is_err());
        Ok(())
    }

    #[test]
    fn multiple_roots_are_independent_sessions() -> anyhow::Result<()> {
        let mut store = HistoryStore::new();
        let a = store.append(result("a", 1), None)?;
        let b = store.append(result("b", 2), None)?;
        let roots: Vec<EntryId> = store.roots().map(HistoryEntry::id).collect();
        assert_eq!(roots, vec![a, b]);
        assert_eq!(store.find_version("v2"), Some(b));
        assert_eq!(store.find_version("v9"), None);
        assert_eq!(store.find_version("v0"), None);
        Ok(())
    }
}
