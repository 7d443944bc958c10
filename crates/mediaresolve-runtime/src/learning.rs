//! Learning filename patterns from user corrections.
//!
//! Mappings are only created when the user confirms a match. The
//! [`PatternLearner`] owns the persistence seam; matching itself is the
//! deterministic [`PatternMatcher`] from `mediaresolve-core`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use mediaresolve_core::patterns::{extract, normalize_token};
use mediaresolve_core::{FilenameMapping, MetadataItem, PatternError, PatternKind, PatternMatch, PatternMatcher};

use crate::retry::StoreError;

/// Errors from pattern learning.
#[derive(Error, Debug)]
pub enum LearningError {
    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("No learned pattern with id '{0}'")]
    NotFound(String),

    #[error("Failed to access pattern file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse pattern file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persistence seam for learned mappings.
#[async_trait]
pub trait PatternStore: Send + Sync {
    /// Insert or replace a mapping by id.
    async fn upsert(&self, mapping: FilenameMapping) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<FilenameMapping>, StoreError>;

    async fn list(&self) -> Result<Vec<FilenameMapping>, StoreError>;

    async fn delete(&self, id: &str) -> Result<Option<FilenameMapping>, StoreError>;

    /// Bump use count and last-used time. Returns the updated mapping.
    async fn record_use(&self, id: &str, at: DateTime<Utc>) -> Result<Option<FilenameMapping>, StoreError>;
}

/// Process-local pattern store with optional JSON file backing.
#[derive(Debug, Default)]
pub struct InMemoryPatternStore {
    mappings: RwLock<BTreeMap<String, FilenameMapping>>,
}

impl InMemoryPatternStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_mappings(mappings: impl IntoIterator<Item = FilenameMapping>) -> Self {
        Self {
            mappings: RwLock::new(mappings.into_iter().map(|m| (m.id.clone(), m)).collect()),
        }
    }

    /// Load mappings from a JSON array file. A missing file is an empty store.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, LearningError> {
        let path = path.as_ref();
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let mappings: Vec<FilenameMapping> = serde_json::from_str(&raw)?;
        tracing::debug!(path = %path.display(), count = mappings.len(), "Loaded learned patterns");
        Ok(Self::from_mappings(mappings))
    }

    /// Write all mappings to `path` as a JSON array.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), LearningError> {
        let mappings: Vec<FilenameMapping> = self.mappings.read().values().cloned().collect();
        let json = serde_json::to_string_pretty(&mappings)?;
        tokio::fs::write(path.as_ref(), json).await?;
        Ok(())
    }
}

#[async_trait]
impl PatternStore for InMemoryPatternStore {
    async fn upsert(&self, mapping: FilenameMapping) -> Result<(), StoreError> {
        self.mappings.write().insert(mapping.id.clone(), mapping);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<FilenameMapping>, StoreError> {
        Ok(self.mappings.read().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<FilenameMapping>, StoreError> {
        Ok(self.mappings.read().values().cloned().collect())
    }

    async fn delete(&self, id: &str) -> Result<Option<FilenameMapping>, StoreError> {
        Ok(self.mappings.write().remove(id))
    }

    async fn record_use(&self, id: &str, at: DateTime<Utc>) -> Result<Option<FilenameMapping>, StoreError> {
        let mut mappings = self.mappings.write();
        Ok(mappings.get_mut(id).map(|m| {
            m.mark_used(at);
            m.clone()
        }))
    }
}

/// Lookup of media entities by metadata id.
#[async_trait]
pub trait MetadataCatalog: Send + Sync {
    async fn get(&self, metadata_id: &str) -> Result<Option<MetadataItem>, StoreError>;
}

/// Catalog backed by a map, for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    items: RwLock<HashMap<String, MetadataItem>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an item under `metadata_id`.
    pub fn insert(&self, metadata_id: impl Into<String>, item: MetadataItem) {
        self.items.write().insert(metadata_id.into(), item);
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

#[async_trait]
impl MetadataCatalog for InMemoryCatalog {
    async fn get(&self, metadata_id: &str) -> Result<Option<MetadataItem>, StoreError> {
        Ok(self.items.read().get(metadata_id).cloned())
    }
}

/// Creates, matches and forgets learned filename mappings.
pub struct PatternLearner {
    store: Arc<dyn PatternStore>,
    matcher: PatternMatcher,
}

impl PatternLearner {
    pub fn new(store: Arc<dyn PatternStore>) -> Self {
        Self {
            store,
            matcher: PatternMatcher::new(),
        }
    }

    pub fn with_matcher(mut self, matcher: PatternMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Learn that `filename` belongs to `metadata_id`.
    ///
    /// Re-learning a filename that already has a mapping relinks it to the
    /// new id instead of creating a second mapping.
    pub async fn learn_from_correction(
        &self,
        filename: &str,
        metadata_id: &str,
    ) -> Result<FilenameMapping, LearningError> {
        let filename = filename.trim();
        let mut mapping = FilenameMapping::from_extracted(&extract(filename), metadata_id)?;

        let existing = self
            .store
            .list()
            .await?
            .into_iter()
            .find(|m| m.kind != PatternKind::FuzzyTitle && m.pattern == filename);
        if let Some(existing) = existing {
            mapping = relink(existing, mapping);
        }

        self.store.upsert(mapping.clone()).await?;
        tracing::info!(
            pattern = %mapping.pattern,
            kind = %mapping.kind,
            metadata_id = %mapping.metadata_id,
            "Learned filename pattern"
        );
        Ok(mapping)
    }

    /// Learn a title-only mapping from a user-edited title.
    pub async fn learn_title(
        &self,
        title: &str,
        metadata_id: &str,
    ) -> Result<FilenameMapping, LearningError> {
        let mut mapping = FilenameMapping::fuzzy_title(title, metadata_id)?;
        let key = normalize_token(&mapping.title);

        let existing = self
            .store
            .list()
            .await?
            .into_iter()
            .find(|m| m.kind == PatternKind::FuzzyTitle && normalize_token(&m.title) == key);
        if let Some(existing) = existing {
            mapping = relink(existing, mapping);
        }

        self.store.upsert(mapping.clone()).await?;
        tracing::info!(title = %mapping.title, metadata_id = %mapping.metadata_id, "Learned title pattern");
        Ok(mapping)
    }

    /// Best learned mapping for a filename, without recording a use.
    pub async fn find_matching_pattern(&self, filename: &str) -> Result<Option<PatternMatch>, LearningError> {
        let mappings = self.store.list().await?;
        Ok(self.matcher.find(filename, &mappings))
    }

    /// Find a mapping for `filename` and record the use when one matches.
    pub async fn apply(&self, filename: &str) -> Result<Option<PatternMatch>, LearningError> {
        let Some(mut hit) = self.find_matching_pattern(filename).await? else {
            return Ok(None);
        };
        if let Some(updated) = self.store.record_use(&hit.mapping.id, Utc::now()).await? {
            hit.mapping = updated;
        }
        tracing::debug!(
            filename,
            pattern = %hit.mapping.pattern,
            strategy = %hit.strategy,
            confidence = hit.confidence,
            "Learned pattern matched"
        );
        Ok(Some(hit))
    }

    pub async fn record_use(&self, id: &str) -> Result<FilenameMapping, LearningError> {
        self.store
            .record_use(id, Utc::now())
            .await?
            .ok_or_else(|| LearningError::NotFound(id.to_string()))
    }

    /// Delete a mapping. Only ever called on explicit user request.
    pub async fn forget(&self, id: &str) -> Result<FilenameMapping, LearningError> {
        let removed = self
            .store
            .delete(id)
            .await?
            .ok_or_else(|| LearningError::NotFound(id.to_string()))?;
        tracing::info!(pattern = %removed.pattern, metadata_id = %removed.metadata_id, "Forgot learned pattern");
        Ok(removed)
    }

    /// All mappings, most used first.
    pub async fn list(&self) -> Result<Vec<FilenameMapping>, LearningError> {
        let mut mappings = self.store.list().await?;
        mappings.sort_by(|a, b| b.use_count.cmp(&a.use_count).then(a.created_at.cmp(&b.created_at)));
        Ok(mappings)
    }
}

/// Keep the existing identity and usage history, take everything else
/// from the fresh mapping.
fn relink(existing: FilenameMapping, fresh: FilenameMapping) -> FilenameMapping {
    FilenameMapping {
        id: existing.id,
        use_count: existing.use_count,
        created_at: existing.created_at,
        last_used_at: existing.last_used_at,
        ..fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediaresolve_core::MatchStrategy;

    fn learner() -> PatternLearner {
        PatternLearner::new(Arc::new(InMemoryPatternStore::new()))
    }

    #[tokio::test]
    async fn test_learn_and_match_sibling_episode() {
        let learner = learner();
        learner
            .learn_from_correction("[Grp] Title - 01.mkv", "tmdb:100")
            .await
            .unwrap();

        let hit = learner
            .find_matching_pattern("[Grp] Title - 27.mkv")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.mapping.metadata_id, "tmdb:100");
        assert!(hit.confidence >= 0.9);
    }

    #[tokio::test]
    async fn test_relearn_relinks_existing_mapping() {
        let learner = learner();
        let first = learner
            .learn_from_correction("[Grp] Title - 01.mkv", "tmdb:1")
            .await
            .unwrap();
        let second = learner
            .learn_from_correction("[Grp] Title - 01.mkv", "tmdb:2")
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        let all = learner.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].metadata_id, "tmdb:2");
    }

    #[tokio::test]
    async fn test_learn_title_relinks_by_normalized_title() {
        let learner = learner();
        let a = learner.learn_title("The Expanse", "tmdb:1").await.unwrap();
        let b = learner.learn_title("  the expanse ", "tmdb:2").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(learner.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_records_use() {
        let learner = learner();
        learner
            .learn_from_correction("[Grp] Title - 01.mkv", "tmdb:100")
            .await
            .unwrap();

        let hit = learner.apply("[Grp] Title - 02.mkv").await.unwrap().unwrap();
        assert_eq!(hit.strategy, MatchStrategy::GroupTitle);
        assert_eq!(hit.mapping.use_count, 1);
        assert!(hit.mapping.last_used_at.is_some());

        // lookups without apply leave the count alone
        let peek = learner.find_matching_pattern("[Grp] Title - 03.mkv").await.unwrap().unwrap();
        assert_eq!(peek.mapping.use_count, 1);
    }

    #[tokio::test]
    async fn test_forget() {
        let learner = learner();
        let mapping = learner
            .learn_from_correction("[Grp] Title - 01.mkv", "tmdb:100")
            .await
            .unwrap();

        learner.forget(&mapping.id).await.unwrap();
        assert!(learner.find_matching_pattern("[Grp] Title - 27.mkv").await.unwrap().is_none());
        assert!(matches!(learner.forget(&mapping.id).await, Err(LearningError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rejects_empty_metadata_id() {
        let result = learner().learn_from_correction("[Grp] Title - 01.mkv", " ").await;
        assert!(matches!(result, Err(LearningError::Pattern(PatternError::MissingMetadataId))));
    }

    #[tokio::test]
    async fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");

        let store = Arc::new(InMemoryPatternStore::new());
        let learner = PatternLearner::new(store.clone());
        learner
            .learn_from_correction("[Grp] Title - 01.mkv", "tmdb:100")
            .await
            .unwrap();
        store.save(&path).await.unwrap();

        let reloaded = InMemoryPatternStore::load(&path).await.unwrap();
        let mappings = reloaded.list().await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].metadata_id, "tmdb:100");

        let missing = InMemoryPatternStore::load(dir.path().join("absent.json")).await.unwrap();
        assert!(missing.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_catalog_lookup() {
        let catalog = InMemoryCatalog::new();
        catalog.insert("tmdb:100", MetadataItem::new("100", "Title", "tmdb"));
        assert_eq!(catalog.get("tmdb:100").await.unwrap().unwrap().title, "Title");
        assert!(catalog.get("tmdb:404").await.unwrap().is_none());
    }
}
