use crate::error::{CharavaultError, Result};
use crate::tokens::TokenCounts;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock as StdRwLock};
use tokio::sync::RwLock;
use tracing::debug;

pub type CharacterId = i64;

/// Lowercase hex SHA-256 of `content`.
pub fn sha256_hex(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterRecord {
    pub id: CharacterId,
    pub char_name: String,
    /// SHA-256 of the uploaded data URI, used for deduplication.
    pub file_hash: String,
    pub etag: String,
    pub upload_date: NaiveDateTime,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
}

/// A character row before the repository assigns it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCharacter {
    pub char_name: String,
    pub file_hash: String,
    pub etag: String,
    pub upload_date: NaiveDateTime,
    pub file_name: String,
    pub source_uri: Option<String>,
}

/// Stored definition. `id` is the id of the owning character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionRecord {
    pub id: CharacterId,
    pub definition_json: String,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub tokens_permanent: Option<u32>,
    pub tokens_total: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionHistory {
    pub definition_id: CharacterId,
    pub prev_definition: String,
    pub changed_date: NaiveDateTime,
}

#[async_trait]
pub trait CardRepository: Send + Sync {
    /// Insert rows and return them with their assigned ids, in input order.
    async fn insert_characters(&self, rows: Vec<NewCharacter>) -> Result<Vec<CharacterRecord>>;
    /// The subset of `hashes` that already belongs to a stored character.
    async fn character_hashes_in(&self, hashes: &[String]) -> Result<HashSet<String>>;
    async fn get_character(&self, id: CharacterId) -> Result<Option<CharacterRecord>>;
    async fn set_character_name(&self, id: CharacterId, name: &str) -> Result<()>;
    /// Remove a character row. Removing a missing id is not an error.
    async fn delete_character(&self, id: CharacterId) -> Result<()>;
    async fn characters_without_definition(&self) -> Result<Vec<CharacterRecord>>;
    async fn character_count(&self) -> Result<usize>;
    async fn highest_character_id(&self) -> Result<Option<CharacterId>>;

    async fn insert_definition(&self, record: DefinitionRecord) -> Result<()>;
    async fn get_definition(&self, id: CharacterId) -> Result<Option<DefinitionRecord>>;
    async fn update_definition(&self, id: CharacterId, json: &str, content_hash: &str)
        -> Result<()>;
    async fn definitions_missing_tokens(&self) -> Result<Vec<DefinitionRecord>>;
    async fn definitions_missing_embedding(&self) -> Result<Vec<DefinitionRecord>>;
    async fn set_token_counts(&self, id: CharacterId, counts: TokenCounts) -> Result<()>;
    async fn set_embedding(&self, id: CharacterId, embedding: Vec<f32>) -> Result<()>;
    async fn definition_count(&self) -> Result<usize>;

    async fn append_history(&self, entry: DefinitionHistory) -> Result<()>;
    async fn history(&self, id: CharacterId) -> Result<Vec<DefinitionHistory>>;
}

#[derive(Default)]
struct MemoryTables {
    next_id: CharacterId,
    characters: BTreeMap<CharacterId, CharacterRecord>,
    definitions: BTreeMap<CharacterId, DefinitionRecord>,
    history: Vec<DefinitionHistory>,
}

/// In-process repository used by tests and single-node deployments.
#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<MemoryTables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository whose first assigned id is `last_id + 1`.
    pub fn starting_after(last_id: CharacterId) -> Self {
        Self {
            tables: RwLock::new(MemoryTables {
                next_id: last_id.max(0),
                ..Default::default()
            }),
        }
    }
}

fn missing_definition(id: CharacterId) -> CharavaultError {
    CharavaultError::NotFound(format!("definition {}", id))
}

#[async_trait]
impl CardRepository for MemoryRepository {
    async fn insert_characters(&self, rows: Vec<NewCharacter>) -> Result<Vec<CharacterRecord>> {
        let mut tables = self.tables.write().await;
        let mut inserted = Vec::with_capacity(rows.len());

        for row in rows {
            tables.next_id += 1;
            let record = CharacterRecord {
                id: tables.next_id,
                char_name: row.char_name,
                file_hash: row.file_hash,
                etag: row.etag,
                upload_date: row.upload_date,
                file_name: row.file_name,
                source_uri: row.source_uri,
            };
            tables.characters.insert(record.id, record.clone());
            inserted.push(record);
        }

        Ok(inserted)
    }

    async fn character_hashes_in(&self, hashes: &[String]) -> Result<HashSet<String>> {
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let tables = self.tables.read().await;
        Ok(tables
            .characters
            .values()
            .filter(|c| wanted.contains(c.file_hash.as_str()))
            .map(|c| c.file_hash.clone())
            .collect())
    }

    async fn get_character(&self, id: CharacterId) -> Result<Option<CharacterRecord>> {
        Ok(self.tables.read().await.characters.get(&id).cloned())
    }

    async fn set_character_name(&self, id: CharacterId, name: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let character = tables
            .characters
            .get_mut(&id)
            .ok_or_else(|| CharavaultError::NotFound(format!("character {}", id)))?;
        character.char_name = name.to_string();
        Ok(())
    }

    async fn delete_character(&self, id: CharacterId) -> Result<()> {
        self.tables.write().await.characters.remove(&id);
        Ok(())
    }

    async fn characters_without_definition(&self) -> Result<Vec<CharacterRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .characters
            .values()
            .filter(|c| !tables.definitions.contains_key(&c.id))
            .cloned()
            .collect())
    }

    async fn character_count(&self) -> Result<usize> {
        Ok(self.tables.read().await.characters.len())
    }

    async fn highest_character_id(&self) -> Result<Option<CharacterId>> {
        Ok(self.tables.read().await.characters.keys().next_back().copied())
    }

    async fn insert_definition(&self, record: DefinitionRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.definitions.contains_key(&record.id) {
            return Err(CharavaultError::StorageError(format!(
                "definition {} already exists",
                record.id
            )));
        }
        tables.definitions.insert(record.id, record);
        Ok(())
    }

    async fn get_definition(&self, id: CharacterId) -> Result<Option<DefinitionRecord>> {
        Ok(self.tables.read().await.definitions.get(&id).cloned())
    }

    async fn update_definition(
        &self,
        id: CharacterId,
        json: &str,
        content_hash: &str,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let record = tables
            .definitions
            .get_mut(&id)
            .ok_or_else(|| missing_definition(id))?;
        record.definition_json = json.to_string();
        record.content_hash = content_hash.to_string();
        Ok(())
    }

    async fn definitions_missing_tokens(&self) -> Result<Vec<DefinitionRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .definitions
            .values()
            .filter(|d| d.tokens_permanent.is_none() || d.tokens_total.is_none())
            .cloned()
            .collect())
    }

    async fn definitions_missing_embedding(&self) -> Result<Vec<DefinitionRecord>> {
        let tables = self.tables.read().await;
        // Newest first.
        Ok(tables
            .definitions
            .values()
            .rev()
            .filter(|d| d.embedding.is_none())
            .cloned()
            .collect())
    }

    async fn set_token_counts(&self, id: CharacterId, counts: TokenCounts) -> Result<()> {
        let mut tables = self.tables.write().await;
        let record = tables
            .definitions
            .get_mut(&id)
            .ok_or_else(|| missing_definition(id))?;
        record.tokens_permanent = Some(counts.tokens_permanent);
        record.tokens_total = Some(counts.tokens_total);
        Ok(())
    }

    async fn set_embedding(&self, id: CharacterId, embedding: Vec<f32>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let record = tables
            .definitions
            .get_mut(&id)
            .ok_or_else(|| missing_definition(id))?;
        record.embedding = Some(embedding);
        Ok(())
    }

    async fn definition_count(&self) -> Result<usize> {
        Ok(self.tables.read().await.definitions.len())
    }

    async fn append_history(&self, entry: DefinitionHistory) -> Result<()> {
        self.tables.write().await.history.push(entry);
        Ok(())
    }

    async fn history(&self, id: CharacterId) -> Result<Vec<DefinitionHistory>> {
        let tables = self.tables.read().await;
        Ok(tables
            .history
            .iter()
            .filter(|h| h.definition_id == id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ImageVariant {
    Full,
    Thumb,
}

/// Storage key of a character image: `full/<id>.png` or `thumb/<id>.png`.
pub fn image_key(variant: ImageVariant, id: CharacterId) -> String {
    format!("{}/{}.png", variant, id)
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; a missing key is `NotFound`.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    /// Remove an object. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Object store rooted at a local directory.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Highest id among the stored `<variant>/<id>.png` objects.
    pub async fn highest_image_id(&self, variant: ImageVariant) -> Result<Option<CharacterId>> {
        let dir = self.root.join(variant.to_string());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut highest = None;
        while let Some(entry) = entries.next_entry().await? {
            let id = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(".png"))
                .and_then(|stem| stem.parse::<CharacterId>().ok());
            if let Some(id) = id {
                highest = highest.max(Some(id));
            }
        }
        Ok(highest)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(CharavaultError::StorageError(format!(
                "invalid object key: {}",
                key
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CharavaultError::NotFound(format!("image {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(path = %path.display(), "stored object");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| CharavaultError::NotFound(format!("image {}", key)))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

/// Single-slot cache whose value is valid only for the watermark it was
/// stored under (the highest character id at computation time).
pub struct WatermarkCache<T> {
    slot: StdRwLock<Option<(CharacterId, T)>>,
}

impl<T> Default for WatermarkCache<T> {
    fn default() -> Self {
        Self {
            slot: StdRwLock::new(None),
        }
    }
}

impl<T: Clone> WatermarkCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, watermark: CharacterId) -> Option<T> {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some((stored, value)) if *stored == watermark => Some(value.clone()),
            _ => None,
        }
    }

    pub fn set(&self, watermark: CharacterId, value: T) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some((watermark, value));
    }

    pub fn invalidate(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
