//! Arena-backed in-memory [`Document`].
//!
//! Used by the CLI to run the pipeline over local files and by tests to drive
//! insertions, locator changes, load completion, and clicks.

use super::{
    Document, DocumentChange, DocumentShell, LoadOutcome, Mutation, NodeId, PictureElement,
    RasterError, Rgba, Size, StyleError,
};
use crate::preloader::HIDE_RULE;
use crate::render::PROCESSED_ATTR;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

/// What drawing a locator to a raster surface yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pixels {
    /// Readable; exports as this `data:` URL.
    Readable(String),
    CrossOrigin,
    Tainted,
}

/// Initial state of a picture element.
#[derive(Debug, Clone)]
pub struct PictureSpec {
    pub locator: Option<String>,
    pub alt: Option<String>,
    pub rendered: Size,
    pub natural: Size,
    pub complete: bool,
}

impl PictureSpec {
    /// A picture that already finished loading, displayed at its intrinsic size.
    pub fn loaded(locator: impl Into<String>, width: f32, height: f32) -> Self {
        Self {
            locator: Some(locator.into()),
            alt: None,
            rendered: Size::new(width, height),
            natural: Size::new(width, height),
            complete: true,
        }
    }

    /// A picture still loading; intrinsic size is unknown until it completes.
    pub fn loading(locator: impl Into<String>, width: f32, height: f32) -> Self {
        Self {
            locator: Some(locator.into()),
            alt: None,
            rendered: Size::new(width, height),
            natural: Size::default(),
            complete: false,
        }
    }

    pub fn rendered_as(mut self, width: f32, height: f32) -> Self {
        self.rendered = Size::new(width, height);
        self
    }

    pub fn with_alt(mut self, alt: impl Into<String>) -> Self {
        self.alt = Some(alt.into());
        self
    }
}

struct Node {
    parent: Option<NodeId>,
    background: Option<Rgba>,
    attributes: BTreeMap<String, String>,
    style: BTreeMap<String, String>,
    picture: Option<PictureSpec>,
    removed: bool,
}

#[derive(Default)]
struct Inner {
    nodes: Vec<Node>,
    head: bool,
    style_rules: Vec<String>,
    shell: DocumentShell,
    resources: HashMap<String, Pixels>,
    subscribers: Vec<mpsc::UnboundedSender<DocumentChange>>,
    load_listeners: HashMap<NodeId, Vec<oneshot::Sender<LoadOutcome>>>,
    click_listeners: HashMap<NodeId, Vec<oneshot::Sender<()>>>,
    idle_listeners: Vec<oneshot::Sender<()>>,
    mutations: Vec<(NodeId, Mutation)>,
}

impl Inner {
    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize).filter(|n| !n.removed)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0 as usize).filter(|n| !n.removed)
    }

    fn emit(&mut self, change: DocumentChange) {
        self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    fn is_descendant(&self, mut id: NodeId, ancestor: NodeId) -> bool {
        while let Some(parent) = self.nodes.get(id.0 as usize).and_then(|n| n.parent) {
            if parent == ancestor {
                return true;
            }
            id = parent;
        }
        false
    }
}

/// In-memory document with arena-indexed nodes. Document order is insertion order.
pub struct MemoryDocument {
    inner: Mutex<Inner>,
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocument {
    pub fn new() -> Self {
        Self::with_shell(DocumentShell::default())
    }

    pub fn with_shell(shell: DocumentShell) -> Self {
        Self {
            inner: Mutex::new(Inner {
                head: true,
                shell,
                ..Inner::default()
            }),
        }
    }

    /// A document whose head has not been parsed yet.
    pub fn without_head(self) -> Self {
        self.lock().head = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_head(&self) {
        self.lock().head = true;
    }

    pub fn add_container(&self, parent: Option<NodeId>, background: Option<Rgba>) -> NodeId {
        let mut inner = self.lock();
        let id = NodeId(inner.nodes.len() as u64);
        inner.nodes.push(Node {
            parent,
            background,
            attributes: BTreeMap::new(),
            style: BTreeMap::new(),
            picture: None,
            removed: false,
        });
        id
    }

    pub fn add_picture(&self, parent: Option<NodeId>, spec: PictureSpec) -> NodeId {
        let mut inner = self.lock();
        let id = NodeId(inner.nodes.len() as u64);
        let mut attributes = BTreeMap::new();
        if let Some(locator) = &spec.locator {
            attributes.insert("src".to_string(), locator.clone());
        }
        inner.nodes.push(Node {
            parent,
            background: None,
            attributes,
            style: BTreeMap::new(),
            picture: Some(spec),
            removed: false,
        });
        inner.emit(DocumentChange::Inserted(id));
        id
    }

    /// Declare what rasterizing `locator` yields.
    pub fn register(&self, locator: impl Into<String>, pixels: Pixels) {
        self.lock().resources.insert(locator.into(), pixels);
    }

    /// Host-page change of a picture's locator.
    pub fn set_source(&self, id: NodeId, locator: impl Into<String>) {
        let locator = locator.into();
        let mut inner = self.lock();
        let Some(node) = inner.node_mut(id) else {
            return;
        };
        node.attributes.insert("src".into(), locator.clone());
        if let Some(picture) = node.picture.as_mut() {
            picture.locator = Some(locator);
        }
        inner.emit(DocumentChange::AttributeChanged {
            node: id,
            attribute: "src".into(),
        });
    }

    /// Host-page change of an arbitrary attribute.
    pub fn set_attribute(&self, id: NodeId, name: &str, value: &str) {
        let mut inner = self.lock();
        let Some(node) = inner.node_mut(id) else {
            return;
        };
        node.attributes.insert(name.into(), value.into());
        inner.emit(DocumentChange::AttributeChanged {
            node: id,
            attribute: name.into(),
        });
    }

    /// Complete (or fail) loading and notify load listeners.
    pub fn finish_load(&self, id: NodeId, natural: Size, outcome: LoadOutcome) {
        let mut inner = self.lock();
        let Some(picture) = inner.node_mut(id).and_then(|n| n.picture.as_mut()) else {
            return;
        };
        picture.complete = true;
        picture.natural = match outcome {
            LoadOutcome::Loaded => natural,
            LoadOutcome::Failed => Size::default(),
        };
        for listener in inner.load_listeners.remove(&id).unwrap_or_default() {
            let _ = listener.send(outcome);
        }
    }

    /// Remove a node and its subtree.
    pub fn remove(&self, id: NodeId) {
        let mut inner = self.lock();
        let doomed: Vec<NodeId> = (0..inner.nodes.len() as u64)
            .map(NodeId)
            .filter(|&n| n == id || inner.is_descendant(n, id))
            .filter(|&n| inner.node(n).is_some())
            .collect();
        for node in doomed {
            let was_picture = inner.node(node).is_some_and(|n| n.picture.is_some());
            if let Some(n) = inner.nodes.get_mut(node.0 as usize) {
                n.removed = true;
            }
            inner.load_listeners.remove(&node);
            inner.click_listeners.remove(&node);
            if was_picture {
                inner.emit(DocumentChange::Removed(node));
            }
        }
    }

    /// Click a node. Returns whether any listener was waiting.
    pub fn click(&self, id: NodeId) -> bool {
        let listeners = self.lock().click_listeners.remove(&id).unwrap_or_default();
        let mut delivered = false;
        for listener in listeners {
            delivered |= listener.send(()).is_ok();
        }
        delivered
    }

    /// Click listeners on `id` whose receiving end is still alive.
    pub fn click_listeners(&self, id: NodeId) -> usize {
        self.lock()
            .click_listeners
            .get(&id)
            .map_or(0, |listeners| listeners.iter().filter(|tx| !tx.is_closed()).count())
    }

    pub fn signal_idle(&self) {
        let listeners = std::mem::take(&mut self.lock().idle_listeners);
        for listener in listeners {
            let _ = listener.send(());
        }
    }

    pub fn locator(&self, id: NodeId) -> Option<String> {
        self.lock()
            .node(id)
            .and_then(|n| n.picture.as_ref())
            .and_then(|p| p.locator.clone())
    }

    pub fn alt(&self, id: NodeId) -> Option<String> {
        self.lock()
            .node(id)
            .and_then(|n| n.picture.as_ref())
            .and_then(|p| p.alt.clone())
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<String> {
        self.lock().node(id).and_then(|n| n.attributes.get(name).cloned())
    }

    pub fn inline_style(&self, id: NodeId, property: &str) -> Option<String> {
        self.lock().node(id).and_then(|n| n.style.get(property).cloned())
    }

    pub fn style_rules(&self) -> Vec<String> {
        self.lock().style_rules.clone()
    }

    /// Every mutation the pipeline applied, in order.
    pub fn mutations(&self) -> Vec<(NodeId, Mutation)> {
        self.lock().mutations.clone()
    }

    /// Whether the picture would currently paint, given inline styles and the hiding rule.
    pub fn is_visible(&self, id: NodeId) -> bool {
        let inner = self.lock();
        let Some(node) = inner.node(id) else {
            return false;
        };
        if node.style.get("visibility").is_some_and(|v| v.starts_with("hidden")) {
            return false;
        }
        let rule_active = inner.style_rules.iter().any(|rule| rule == HIDE_RULE);
        let processed = node.attributes.contains_key(PROCESSED_ATTR);
        let inline = node
            .picture
            .as_ref()
            .and_then(|p| p.locator.as_deref())
            .is_some_and(|l| l.starts_with("data:"));
        !(rule_active && !processed && !inline)
    }
}

impl Document for MemoryDocument {
    fn shell(&self) -> DocumentShell {
        self.lock().shell.clone()
    }

    fn install_style_rule(&self, css: &str) -> Result<(), StyleError> {
        let mut inner = self.lock();
        if !inner.head {
            return Err(StyleError::HeadMissing);
        }
        inner.style_rules.push(css.to_string());
        Ok(())
    }

    fn pictures(&self) -> Vec<NodeId> {
        let inner = self.lock();
        inner
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.removed && n.picture.is_some())
            .map(|(i, _)| NodeId(i as u64))
            .collect()
    }

    fn picture(&self, id: NodeId) -> Option<PictureElement> {
        let inner = self.lock();
        let spec = inner.node(id)?.picture.as_ref()?;
        Some(PictureElement {
            id,
            locator: spec.locator.clone(),
            alt: spec.alt.clone(),
            rendered: spec.rendered,
            natural: spec.natural,
            complete: spec.complete,
        })
    }

    fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.lock().node(id)?.parent
    }

    fn background_color(&self, id: NodeId) -> Option<Rgba> {
        self.lock().node(id)?.background
    }

    fn rasterize(&self, id: NodeId) -> Result<String, RasterError> {
        let inner = self.lock();
        let spec = inner
            .node(id)
            .and_then(|n| n.picture.as_ref())
            .ok_or(RasterError::Missing)?;
        if !spec.complete {
            return Err(RasterError::NotLoaded);
        }
        let locator = spec.locator.as_deref().ok_or(RasterError::Missing)?;
        match inner.resources.get(locator) {
            Some(Pixels::Readable(url)) => Ok(url.clone()),
            Some(Pixels::CrossOrigin) => Err(RasterError::CrossOrigin),
            Some(Pixels::Tainted) => Err(RasterError::Tainted),
            None if locator.starts_with("data:") => Ok(locator.to_string()),
            None => Err(RasterError::CrossOrigin),
        }
    }

    fn apply(&self, id: NodeId, mutation: Mutation) {
        let mut inner = self.lock();
        let Some(node) = inner.node_mut(id) else {
            return;
        };
        let attribute = match &mutation {
            Mutation::SetLocator(locator) => {
                node.attributes.insert("src".into(), locator.clone());
                if let Some(picture) = node.picture.as_mut() {
                    picture.locator = Some(locator.clone());
                }
                "src".to_string()
            }
            Mutation::SetAlt(alt) => {
                if let Some(picture) = node.picture.as_mut() {
                    picture.alt = alt.clone();
                }
                "alt".to_string()
            }
            Mutation::SetAttribute { name, value } => {
                node.attributes.insert(name.clone(), value.clone());
                name.clone()
            }
            Mutation::RemoveAttribute(name) => {
                node.attributes.remove(name);
                name.clone()
            }
            Mutation::SetStyle { property, value } => {
                match value {
                    Some(value) => node.style.insert(property.clone(), value.clone()),
                    None => node.style.remove(property),
                };
                "style".to_string()
            }
        };
        inner.mutations.push((id, mutation));
        inner.emit(DocumentChange::AttributeChanged { node: id, attribute });
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<DocumentChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    fn on_load(&self, id: NodeId) -> oneshot::Receiver<LoadOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        match inner.node(id).and_then(|n| n.picture.as_ref()) {
            // Already settled: fire immediately.
            Some(spec) if spec.complete => {
                let outcome = if spec.natural.width > 0.0 {
                    LoadOutcome::Loaded
                } else {
                    LoadOutcome::Failed
                };
                let _ = tx.send(outcome);
            }
            Some(_) => inner.load_listeners.entry(id).or_default().push(tx),
            None => {}
        }
        rx
    }

    fn on_click(&self, id: NodeId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        if inner.node(id).is_some() {
            inner.click_listeners.entry(id).or_default().push(tx);
        }
        rx
    }

    fn on_idle(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().idle_listeners.push(tx);
        rx
    }
}
