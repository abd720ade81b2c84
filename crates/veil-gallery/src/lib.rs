//! veil-gallery — The user-curated reference gallery.
//!
//! Stores `person name -> [embedding]` durably in SQLite and validates every
//! entry against the recognizer's embedding dimensionality.

pub mod gallery;
pub mod store;

pub use gallery::{Gallery, GalleryError, GalleryExport, ImportReport};
pub use store::{GalleryStore, MemoryGalleryStore, SqliteGalleryStore, StoreError};
