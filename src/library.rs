use crate::config::LibrarySettings;
use crate::definition::{decode_data_uri, embed_definition_into_png, encode_data_uri, estimate_base64_image_size};
use crate::embedding::{embed_optional, EmbeddingProvider};
use crate::error::{CharavaultError, Result};
use crate::normalize::{parse_to_canonical, NormalizeOptions};
use crate::pipeline::{prepare_batch, run_blocking, CardImage, MAX_BATCH_CONCURRENCY};
use crate::store::{
    image_key, sha256_hex, CardRepository, CharacterId, DefinitionHistory, ImageVariant,
    NewCharacter, ObjectStore, WatermarkCache,
};
use crate::tokens::{compute_token_counts, select_embedding_input, EmbeddingInput};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// One uploaded card file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpload {
    pub name: String,
    /// PNG data URI.
    pub content: String,
    /// Epoch milliseconds (13 digits) or a timestamp string.
    #[serde(default, deserialize_with = "de_last_modified")]
    pub last_modified: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
}

fn de_last_modified<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

/// Interpret a browser `lastModified` value as a UTC timestamp.
pub fn parse_upload_date(last_modified: &str) -> Option<NaiveDateTime> {
    let raw = last_modified.trim();

    if raw.len() == 13 && raw.bytes().all(|b| b.is_ascii_digit()) {
        let millis: i64 = raw.parse().ok()?;
        return DateTime::from_timestamp_millis(millis).map(|dt| dt.naive_utc());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedCard {
    pub id: CharacterId,
    pub name: String,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFailure {
    pub file_name: String,
    /// Set when the character row was stored but its definition could not be.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<CharacterId>,
    pub error_code: String,
    pub error: String,
}

impl UploadFailure {
    fn new(file_name: &str, id: Option<CharacterId>, err: &CharavaultError) -> Self {
        Self {
            file_name: file_name.to_string(),
            id,
            error_code: err.code().to_string(),
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    pub inserted: Vec<UploadedCard>,
    /// File names skipped because the same file is already stored or was
    /// repeated in the batch.
    pub duplicates: Vec<String>,
    pub failed: Vec<UploadFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadedCard {
    /// PNG data URI with the current definition embedded.
    pub card: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LibraryStats {
    pub characters: usize,
    pub definitions: usize,
    pub highest_id: CharacterId,
}

struct PendingUpload {
    row: NewCharacter,
    png: Vec<u8>,
}

pub struct CardLibrary {
    repository: Arc<dyn CardRepository>,
    objects: Arc<dyn ObjectStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: LibrarySettings,
    stats_cache: WatermarkCache<LibraryStats>,
}

impl CardLibrary {
    pub fn new(
        repository: Arc<dyn CardRepository>,
        objects: Arc<dyn ObjectStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: LibrarySettings,
    ) -> Self {
        Self {
            repository,
            objects,
            embedder,
            settings,
            stats_cache: WatermarkCache::new(),
        }
    }

    pub fn settings(&self) -> &LibrarySettings {
        &self.settings
    }

    pub fn embedder(&self) -> &dyn EmbeddingProvider {
        self.embedder.as_ref()
    }

    pub fn repository(&self) -> &dyn CardRepository {
        self.repository.as_ref()
    }

    fn check_size(&self, content: &str) -> Result<()> {
        let size = estimate_base64_image_size(content).bytes;
        if size > self.settings.max_image_bytes {
            return Err(CharavaultError::PayloadTooLarge {
                size,
                limit: self.settings.max_image_bytes,
            });
        }
        Ok(())
    }

    /// Store new card files and derive their definitions.
    ///
    /// Files are deduplicated by the hash of their data URI. The stored image
    /// keeps its original metadata; a card whose definition cannot be derived
    /// keeps its character row and is picked up again by
    /// [`insert_missing_definitions`](Self::insert_missing_definitions).
    pub async fn upload(
        &self,
        files: Vec<FileUpload>,
        options: &NormalizeOptions,
    ) -> Result<UploadReport> {
        let mut report = UploadReport::default();
        let mut seen = HashSet::new();
        let mut pending = Vec::new();

        for file in files {
            let hash = sha256_hex(&file.content);
            if seen.contains(&hash) {
                report.duplicates.push(file.name);
                continue;
            }

            let png = match self
                .check_size(&file.content)
                .and_then(|_| decode_data_uri(&file.content))
            {
                Ok(png) => {
                    seen.insert(hash.clone());
                    png
                }
                Err(e) => {
                    warn!(file = %file.name, error = %e, "rejected upload");
                    report.failed.push(UploadFailure::new(&file.name, None, &e));
                    continue;
                }
            };

            let upload_date = parse_upload_date(&file.last_modified).unwrap_or_else(|| {
                warn!(file = %file.name, last_modified = %file.last_modified, "unreadable lastModified, using current time");
                Utc::now().naive_utc()
            });

            pending.push(PendingUpload {
                row: NewCharacter {
                    char_name: String::new(),
                    etag: hash.clone(),
                    file_hash: hash,
                    upload_date,
                    file_name: file.name,
                    source_uri: file.source_uri,
                },
                png,
            });
        }

        let hashes: Vec<String> = pending.iter().map(|p| p.row.file_hash.clone()).collect();
        let existing = self.repository.character_hashes_in(&hashes).await?;
        let (known, fresh): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|p| existing.contains(&p.row.file_hash));
        report
            .duplicates
            .extend(known.into_iter().map(|p| p.row.file_name));

        if fresh.is_empty() {
            info!(duplicates = report.duplicates.len(), "no new files to upload");
            return Ok(report);
        }

        let (rows, images): (Vec<_>, Vec<_>) = fresh.into_iter().map(|p| (p.row, p.png)).unzip();
        let records = self.repository.insert_characters(rows).await?;

        let mut stored = Vec::with_capacity(records.len());
        for (record, png) in records.into_iter().zip(images) {
            let key = image_key(ImageVariant::Full, record.id);
            match self.objects.put(&key, png.clone()).await {
                Ok(()) => stored.push((record, png)),
                Err(e) => {
                    warn!(id = record.id, file = %record.file_name, error = %e, "failed to store card image");
                    // A row without its image could never be downloaded.
                    let id = match self.repository.delete_character(record.id).await {
                        Ok(()) => None,
                        Err(rollback) => {
                            warn!(id = record.id, error = %rollback, "failed to remove character without image");
                            Some(record.id)
                        }
                    };
                    report
                        .failed
                        .push(UploadFailure::new(&record.file_name, id, &e));
                }
            }
        }

        let card_images: Vec<CardImage> = stored.iter().map(|(_, png)| CardImage::Png(png)).collect();
        let prepared = prepare_batch(
            &card_images,
            options,
            self.embedder.as_ref(),
            self.settings.embedding_token_limit,
            self.settings.batch_concurrency,
        )
        .await;

        for ((record, _), result) in stored.into_iter().zip(prepared) {
            let stored = match result {
                Ok(definition) => {
                    let name = definition.card.data.name.clone();
                    self.store_definition(record.id, &name, definition.into_record(record.id))
                        .await
                        .map(|_| name)
                }
                Err(e) => Err(e),
            };

            match stored {
                Ok(name) => report.inserted.push(UploadedCard {
                    id: record.id,
                    name,
                    file_name: record.file_name,
                }),
                Err(e) => report
                    .failed
                    .push(UploadFailure::new(&record.file_name, Some(record.id), &e)),
            }
        }

        self.stats_cache.invalidate();
        info!(
            inserted = report.inserted.len(),
            duplicates = report.duplicates.len(),
            failed = report.failed.len(),
            "upload finished"
        );
        Ok(report)
    }

    async fn store_definition(
        &self,
        id: CharacterId,
        name: &str,
        record: crate::store::DefinitionRecord,
    ) -> Result<()> {
        self.repository.insert_definition(record).await?;
        self.repository.set_character_name(id, name).await
    }

    /// Re-embed the stored definition into the stored image.
    pub async fn download(&self, id: CharacterId) -> Result<DownloadedCard> {
        let character = self
            .repository
            .get_character(id)
            .await?
            .ok_or_else(|| CharavaultError::NotFound(format!("character {}", id)))?;
        let definition = self
            .repository
            .get_definition(id)
            .await?
            .ok_or_else(|| CharavaultError::NotFound(format!("definition {}", id)))?;
        let png = self.objects.get(&image_key(ImageVariant::Full, id)).await?;

        let json = definition.definition_json;
        let embedded = run_blocking(move || embed_definition_into_png(&png, &json)).await?;

        Ok(DownloadedCard {
            card: encode_data_uri(&embedded),
            name: format!(
                "{}_{}.png",
                character.char_name,
                character.upload_date.format("%Y-%m-%d_%H-%M-%S")
            ),
        })
    }

    pub async fn definition(&self, id: CharacterId) -> Result<crate::store::DefinitionRecord> {
        self.repository
            .get_definition(id)
            .await?
            .ok_or_else(|| CharavaultError::NotFound(format!("definition {}", id)))
    }

    /// Replace a definition as-is, keeping the previous text in history.
    ///
    /// Edits are stored exactly as given and are not re-normalized. The
    /// character is renamed when `data.name` changes.
    pub async fn update_definition(&self, id: CharacterId, definition_json: &str) -> Result<()> {
        let new_value: Value = serde_json::from_str(definition_json)?;
        let old = self.definition(id).await?;

        self.repository
            .append_history(DefinitionHistory {
                definition_id: id,
                prev_definition: old.definition_json.clone(),
                changed_date: Utc::now().naive_utc(),
            })
            .await?;

        self.repository
            .update_definition(id, definition_json, &sha256_hex(definition_json))
            .await?;

        let old_name = serde_json::from_str::<Value>(&old.definition_json)
            .ok()
            .and_then(|v| v.pointer("/data/name").cloned());
        let new_name = new_value.pointer("/data/name").and_then(Value::as_str);

        if let Some(name) = new_name {
            if old_name.as_ref().and_then(Value::as_str) != Some(name) {
                debug!(id, name, "definition rename");
                self.repository.set_character_name(id, name).await?;
            }
        }

        Ok(())
    }

    pub async fn history(&self, id: CharacterId) -> Result<Vec<DefinitionHistory>> {
        self.repository.history(id).await
    }

    /// Derive definitions for characters stored without one.
    pub async fn insert_missing_definitions(&self) -> Result<usize> {
        let missing = self.repository.characters_without_definition().await?;
        if missing.is_empty() {
            return Ok(0);
        }
        info!(count = missing.len(), "inserting missing definitions");

        let mut characters = Vec::with_capacity(missing.len());
        let mut images = Vec::with_capacity(missing.len());
        for character in missing {
            match self
                .objects
                .get(&image_key(ImageVariant::Full, character.id))
                .await
            {
                Ok(png) => {
                    characters.push(character);
                    images.push(png);
                }
                Err(e) => warn!(id = character.id, error = %e, "image missing for character"),
            }
        }

        let card_images: Vec<CardImage> = images.iter().map(|png| CardImage::Png(png)).collect();
        let prepared = prepare_batch(
            &card_images,
            &NormalizeOptions::default(),
            self.embedder.as_ref(),
            self.settings.embedding_token_limit,
            self.settings.batch_concurrency,
        )
        .await;

        let mut inserted = 0;
        for (character, result) in characters.into_iter().zip(prepared) {
            let Ok(definition) = result else {
                continue;
            };
            let name = definition.card.data.name.clone();
            match self
                .store_definition(character.id, &name, definition.into_record(character.id))
                .await
            {
                Ok(()) => inserted += 1,
                Err(e) => warn!(id = character.id, error = %e, "failed to store definition"),
            }
        }

        self.stats_cache.invalidate();
        Ok(inserted)
    }

    /// Fill token counts on definitions stored without them.
    pub async fn backfill_token_counts(&self) -> Result<usize> {
        let missing = self.repository.definitions_missing_tokens().await?;
        let mut updated = 0;

        for record in missing {
            let json = record.definition_json;
            let counts = run_blocking(move || {
                parse_to_canonical(&json).and_then(|card| compute_token_counts(&card))
            })
            .await;
            match counts {
                Ok(counts) => {
                    self.repository.set_token_counts(record.id, counts).await?;
                    updated += 1;
                }
                Err(e) => warn!(id = record.id, error = %e, "token count failed"),
            }
        }

        info!(updated, "token counts backfilled");
        Ok(updated)
    }

    /// Request embeddings for definitions stored without one.
    pub async fn backfill_embeddings(&self) -> Result<usize> {
        let missing = self.repository.definitions_missing_embedding().await?;
        info!(count = missing.len(), provider = self.embedder.name(), "generating missing embeddings");

        let semaphore = Arc::new(Semaphore::new(
            self.settings.batch_concurrency.clamp(1, MAX_BATCH_CONCURRENCY),
        ));
        let max_tokens = self.settings.embedding_token_limit;

        let tasks = missing.into_iter().map(|record| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                let json = record.definition_json;
                let input = run_blocking(move || {
                    parse_to_canonical(&json).and_then(|card| select_embedding_input(&card, max_tokens))
                })
                .await;
                match input {
                    Ok(EmbeddingInput::Embed(text)) => embed_optional(self.embedder.as_ref(), &text)
                        .await
                        .map(|vector| (record.id, vector)),
                    Ok(EmbeddingInput::Skip { .. }) => None,
                    Err(e) => {
                        warn!(id = record.id, error = %e, "stored definition cannot be embedded");
                        None
                    }
                }
            }
        });

        let mut updated = 0;
        for (id, vector) in join_all(tasks).await.into_iter().flatten() {
            self.repository.set_embedding(id, vector).await?;
            updated += 1;
        }

        Ok(updated)
    }

    /// Counts memoized until a new character is stored.
    pub async fn library_stats(&self) -> Result<LibraryStats> {
        let watermark = self.repository.highest_character_id().await?.unwrap_or(0);
        if let Some(stats) = self.stats_cache.get(watermark) {
            return Ok(stats);
        }

        let stats = LibraryStats {
            characters: self.repository.character_count().await?,
            definitions: self.repository.definition_count().await?,
            highest_id: watermark,
        };
        self.stats_cache.set(watermark, stats);
        Ok(stats)
    }
}
