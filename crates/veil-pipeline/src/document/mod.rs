//! The live document the pipeline scans and mutates.
//!
//! Nodes are addressed by a stable [`NodeId`]; the pipeline never holds on to
//! node contents, it re-reads a [`PictureElement`] snapshot whenever it needs one.

pub mod memory;

use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use memory::{MemoryDocument, PictureSpec, Pixels};

/// Attributes whose change alters what a picture displays.
pub const LOCATOR_ATTRIBUTES: [&str; 2] = ["src", "srcset"];

/// Stable identity of a document node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Width/height in device-independent pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    /// True when either axis is smaller than `floor`.
    pub fn below(&self, floor: f32) -> bool {
        self.width < floor || self.height < floor
    }
}

/// sRGB colour with alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const WHITE: Rgba = Rgba::opaque(255, 255, 255);
    pub const BLACK: Rgba = Rgba::opaque(0, 0, 0);
    pub const TRANSPARENT: Rgba = Rgba { r: 0, g: 0, b: 0, a: 0 };

    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub fn is_transparent(&self) -> bool {
        self.a == 0
    }

    /// WCAG relative luminance in [0, 1].
    pub fn luminance(&self) -> f32 {
        let channel = |c: u8| {
            let c = c as f32 / 255.0;
            if c <= 0.03928 {
                c / 12.92
            } else {
                ((c + 0.055) / 1.055).powf(2.4)
            }
        };
        0.2126 * channel(self.r) + 0.7152 * channel(self.g) + 0.0722 * channel(self.b)
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Snapshot of a picture element.
#[derive(Debug, Clone, PartialEq)]
pub struct PictureElement {
    pub id: NodeId,
    pub locator: Option<String>,
    pub alt: Option<String>,
    pub rendered: Size,
    pub natural: Size,
    /// Finished loading (successfully or not).
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentChange {
    Inserted(NodeId),
    Removed(NodeId),
    AttributeChanged { node: NodeId, attribute: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Failed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RasterError {
    #[error("cross-origin pixels are not readable")]
    CrossOrigin,
    #[error("raster surface is tainted")]
    Tainted,
    #[error("picture has not finished loading")]
    NotLoaded,
    #[error("no such picture")]
    Missing,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StyleError {
    #[error("document head does not exist yet")]
    HeadMissing,
}

/// Static view of the document shell used for hydration detection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentShell {
    pub host: String,
    /// Server-delivered markup (head plus the root of the body).
    pub markup: String,
}

/// Document-visible side effects the pipeline may perform on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    SetLocator(String),
    SetAlt(Option<String>),
    SetAttribute { name: String, value: String },
    RemoveAttribute(String),
    /// `None` removes the inline property.
    SetStyle { property: String, value: Option<String> },
}

/// The live, mutating document.
///
/// Listener methods hand back one-shot receivers; dropping a receiver
/// unregisters interest.
pub trait Document: Send + Sync + 'static {
    fn shell(&self) -> DocumentShell;
    fn install_style_rule(&self, css: &str) -> Result<(), StyleError>;
    /// All picture elements, in document order.
    fn pictures(&self) -> Vec<NodeId>;
    fn picture(&self, id: NodeId) -> Option<PictureElement>;
    fn parent(&self, id: NodeId) -> Option<NodeId>;
    /// Computed background colour of a node, if it declares one.
    fn background_color(&self, id: NodeId) -> Option<Rgba>;
    /// Draw the picture to an off-document surface and export it as a `data:` URL.
    fn rasterize(&self, id: NodeId) -> Result<String, RasterError>;
    fn apply(&self, id: NodeId, mutation: Mutation);
    /// Structural and attribute changes from now on.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DocumentChange>;
    /// Fires once when the picture finishes or fails loading.
    fn on_load(&self, id: NodeId) -> oneshot::Receiver<LoadOutcome>;
    /// Fires on the next click on the node.
    fn on_click(&self, id: NodeId) -> oneshot::Receiver<()>;
    /// Fires at the host page's next idle point.
    fn on_idle(&self) -> oneshot::Receiver<()>;
}
