//! veil-pipeline — Scans a live document for pictures and hides the ones
//! showing people from the gallery.
//!
//! The [`Controller`] discovers pictures through the [`Scanner`], asks the
//! recognition engine about each one through the [`DetectionGateway`], and
//! applies the verdict with the [`Renderer`]. Per-element progress lives in
//! the [`RecordTable`].

pub mod config;
pub mod controller;
pub mod document;
pub mod gateway;
pub mod preloader;
pub mod records;
pub mod render;
pub mod scanner;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, ConfigStore, Configuration, PipelineTuning};
pub use controller::{Controller, Inspector, PipelineError, PipelineState};
pub use document::{Document, MemoryDocument, NodeId, PictureSpec, Pixels};
pub use gateway::{DetectionGateway, GatewayError, SkipReason, Verdict};
pub use records::{BlockInfo, PictureState, RecordTable};
pub use render::Renderer;
pub use scanner::Scanner;
