use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use hookline_core::ids::ItemId;
use hookline_core::item::ParsedItem;
use hookline_core::request::ContentKey;

/// Loading state of one visible slot.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Loading { progress: f64 },
    Ready,
}

/// One entry of a caller-visible list.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleItem {
    pub id: ItemId,
    #[serde(flatten)]
    pub status: ItemStatus,
    pub item: Option<ParsedItem>,
    pub favorite: bool,
    pub created_at: DateTime<Utc>,
}

impl VisibleItem {
    pub fn placeholder(id: ItemId) -> Self {
        Self {
            id,
            status: ItemStatus::Loading { progress: 0.0 },
            item: None,
            favorite: false,
            created_at: Utc::now(),
        }
    }

    pub fn ready(id: ItemId, item: ParsedItem) -> Self {
        Self {
            id,
            status: ItemStatus::Ready,
            item: Some(item),
            favorite: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.status, ItemStatus::Loading { .. })
    }

    pub fn progress(&self) -> f64 {
        match self.status {
            ItemStatus::Loading { progress } => progress,
            ItemStatus::Ready => 1.0,
        }
    }
}

/// Where a batch window goes in its list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Front,
    Back,
}

/// Visible item lists keyed by content type and category.
///
/// Every write is scoped to an item id, never a whole-list replace, so a
/// session filling its window and a caller editing other entries can run
/// at the same time.
#[derive(Debug, Default)]
pub struct ItemStore {
    lists: DashMap<ContentKey, Vec<VisibleItem>>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list for `key` with ready items, e.g. from a session cache.
    pub fn seed(&self, key: ContentKey, items: Vec<ParsedItem>) -> Vec<ItemId> {
        let entries: Vec<VisibleItem> = items
            .into_iter()
            .map(|item| VisibleItem::ready(ItemId::new(), item))
            .collect();
        let ids = entries.iter().map(|e| e.id.clone()).collect();
        self.lists.insert(key, entries);
        ids
    }

    pub fn snapshot(&self, key: &ContentKey) -> Vec<VisibleItem> {
        self.lists.get(key).map(|l| l.value().clone()).unwrap_or_default()
    }

    pub fn len(&self, key: &ContentKey) -> usize {
        self.lists.get(key).map_or(0, |l| l.len())
    }

    pub fn is_empty(&self, key: &ContentKey) -> bool {
        self.len(key) == 0
    }

    pub fn get(&self, key: &ContentKey, id: &ItemId) -> Option<VisibleItem> {
        self.lists
            .get(key)
            .and_then(|l| l.iter().find(|e| &e.id == id).cloned())
    }

    /// Insert one loading placeholder per id, in order. Returns the list
    /// length before the insert.
    pub fn insert_placeholders(&self, key: &ContentKey, placement: Placement, ids: &[ItemId]) -> usize {
        let mut list = self.lists.entry(key.clone()).or_default();
        let base_index = list.len();
        let placeholders = ids.iter().cloned().map(VisibleItem::placeholder);
        match placement {
            Placement::Back => list.extend(placeholders),
            Placement::Front => {
                list.splice(0..0, placeholders);
            }
        }
        base_index
    }

    /// Put a parsed item into the entry with `id` and mark it ready. Keeps the
    /// entry's favorite flag. Returns false if the entry is gone.
    pub fn fill(&self, key: &ContentKey, id: &ItemId, item: ParsedItem) -> bool {
        self.update(key, id, |entry| {
            entry.item = Some(item);
            entry.status = ItemStatus::Ready;
        })
    }

    /// Update a loading entry's progress. Ready entries are left alone.
    pub fn set_progress(&self, key: &ContentKey, id: &ItemId, progress: f64) -> bool {
        self.update(key, id, |entry| {
            if entry.is_loading() {
                entry.status = ItemStatus::Loading { progress };
            }
        })
    }

    /// Remove every entry whose id is in `ids`. Returns how many were removed.
    pub fn remove(&self, key: &ContentKey, ids: &[ItemId]) -> usize {
        let Some(mut list) = self.lists.get_mut(key) else {
            return 0;
        };
        let before = list.len();
        list.retain(|e| !ids.contains(&e.id));
        before - list.len()
    }

    /// Flip the favorite flag. Returns the new value, or `None` if missing.
    pub fn toggle_favorite(&self, key: &ContentKey, id: &ItemId) -> Option<bool> {
        let mut list = self.lists.get_mut(key)?;
        let entry = list.iter_mut().find(|e| &e.id == id)?;
        entry.favorite = !entry.favorite;
        Some(entry.favorite)
    }

    /// Apply `f` to the entry with `id`. Returns false if it does not exist.
    pub fn update(&self, key: &ContentKey, id: &ItemId, f: impl FnOnce(&mut VisibleItem)) -> bool {
        let Some(mut list) = self.lists.get_mut(key) else {
            return false;
        };
        match list.iter_mut().find(|e| &e.id == id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }
}
