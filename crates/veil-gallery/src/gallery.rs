//! Reference gallery service: validation, replace-by-name updates, export/import,
//! and change notification on top of a [`GalleryStore`].

use crate::store::{GalleryStore, StoreError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use veil_core::{Embedding, EmbeddingQuality, GalleryEntry};

/// Current export document version.
pub const EXPORT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("person name is empty")]
    EmptyName,
    #[error("no valid embeddings for {0}")]
    NoValidEmbeddings(String),
    #[error("unsupported export version {0}")]
    UnsupportedVersion(u32),
    #[error("export format: {0}")]
    Format(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Serialized form of the whole gallery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryExport {
    pub version: u32,
    pub exported_at: String,
    pub entries: Vec<GalleryEntry>,
}

/// Outcome of an import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub rejected: Vec<String>,
}

/// The user-curated set of named reference embeddings.
///
/// Every mutation bumps a revision counter observable through [`Gallery::subscribe`].
pub struct Gallery {
    store: Arc<dyn GalleryStore>,
    revision: watch::Sender<u64>,
}

impl Gallery {
    pub fn new(store: Arc<dyn GalleryStore>) -> Self {
        let (revision, _) = watch::channel(0);
        Self { store, revision }
    }

    /// Receiver that changes whenever the gallery is mutated.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Add or replace the entry for `person`.
    ///
    /// Embeddings with the wrong dimensionality or non-finite values are dropped
    /// together with their quality metadata. An entry left with no embeddings is
    /// rejected. Replacing keeps the original `created_at`.
    pub fn add(
        &self,
        person: &str,
        embeddings: Vec<Embedding>,
        quality: Option<Vec<EmbeddingQuality>>,
    ) -> Result<GalleryEntry, GalleryError> {
        let mut entry = GalleryEntry::new(person, embeddings);
        entry.quality = quality.unwrap_or_default();
        let entry = self.validate(entry)?;
        let entry = self.stamp(entry)?;
        self.store.put(&entry)?;
        tracing::info!(person = %entry.person, embeddings = entry.embeddings.len(), "gallery entry stored");
        self.bump();
        Ok(entry)
    }

    pub fn get(&self, person: &str) -> Result<Option<GalleryEntry>, GalleryError> {
        Ok(self.store.get(person.trim())?)
    }

    pub fn delete(&self, person: &str) -> Result<bool, GalleryError> {
        let removed = self.store.delete(person.trim())?;
        if removed {
            tracing::info!(person, "gallery entry deleted");
            self.bump();
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<GalleryEntry>, GalleryError> {
        Ok(self.store.get_all()?)
    }

    pub fn clear(&self) -> Result<(), GalleryError> {
        self.store.clear()?;
        tracing::info!("gallery cleared");
        self.bump();
        Ok(())
    }

    pub fn export(&self) -> Result<GalleryExport, GalleryError> {
        Ok(GalleryExport {
            version: EXPORT_VERSION,
            exported_at: Utc::now().to_rfc3339(),
            entries: self.list()?,
        })
    }

    pub fn export_json(&self) -> Result<String, GalleryError> {
        Ok(serde_json::to_string_pretty(&self.export()?)?)
    }

    /// Import entries with replace-by-name semantics. Invalid entries are
    /// reported, not fatal.
    pub fn import(&self, entries: Vec<GalleryEntry>) -> Result<ImportReport, GalleryError> {
        let mut report = ImportReport::default();
        for entry in entries {
            let person = entry.person.clone();
            let entry = match self.validate(entry) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(person = %person, error = %e, "rejecting imported entry");
                    report.rejected.push(person);
                    continue;
                }
            };
            let entry = self.stamp(entry)?;
            self.store.put(&entry)?;
            report.imported += 1;
        }
        if report.imported > 0 {
            self.bump();
        }
        tracing::info!(imported = report.imported, rejected = report.rejected.len(), "gallery import finished");
        Ok(report)
    }

    pub fn import_json(&self, json: &str) -> Result<ImportReport, GalleryError> {
        let export: GalleryExport = serde_json::from_str(json)?;
        if export.version != EXPORT_VERSION {
            return Err(GalleryError::UnsupportedVersion(export.version));
        }
        self.import(export.entries)
    }

    fn validate(&self, mut entry: GalleryEntry) -> Result<GalleryEntry, GalleryError> {
        entry.person = entry.person.trim().to_string();
        if entry.person.is_empty() {
            return Err(GalleryError::EmptyName);
        }

        let quality = std::mem::take(&mut entry.quality);
        let aligned = quality.len() == entry.embeddings.len();
        if !quality.is_empty() && !aligned {
            tracing::warn!(person = %entry.person, "quality metadata does not line up with embeddings; dropping it");
        }

        let mut embeddings = Vec::with_capacity(entry.embeddings.len());
        let mut kept_quality = Vec::new();
        for (i, embedding) in std::mem::take(&mut entry.embeddings).into_iter().enumerate() {
            if !embedding.is_valid() {
                tracing::warn!(person = %entry.person, dim = embedding.values.len(), "discarding invalid embedding");
                continue;
            }
            if aligned {
                kept_quality.push(quality[i].clone());
            }
            embeddings.push(embedding);
        }

        if embeddings.is_empty() {
            return Err(GalleryError::NoValidEmbeddings(entry.person));
        }
        entry.embeddings = embeddings;
        entry.quality = kept_quality;
        Ok(entry)
    }

    fn stamp(&self, mut entry: GalleryEntry) -> Result<GalleryEntry, GalleryError> {
        let now = Utc::now().to_rfc3339();
        entry.created_at = match self.store.get(&entry.person)? {
            Some(existing) if !existing.created_at.is_empty() => existing.created_at,
            _ => now.clone(),
        };
        entry.updated_at = now;
        Ok(entry)
    }
}
