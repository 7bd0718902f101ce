//! Remote cursor overlay.
//!
//! Every remote participant with a selection gets its own frame loop:
//!
//! ```text
//! next_frame() ─► entry still selecting? ─► children() ─► client_rects()
//!      ▲                 │ no: clear, exit                     │
//!      │                                                       ▼
//!      └──── paint / skip ◄── degenerate or unresolved? ◄── first rect
//!                                                     − container origin
//!                                                     + scroll offset
//! ```
//!
//! A frame whose selection cannot be resolved yet (remote content not laid
//! out, offset past the end) is skipped and the caret cleared; the loop
//! keeps running. Loops are started and stopped as awareness entries
//! change, and all of them stop on [`CursorOverlay::teardown`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use scribe_core::{Block, Selection};

use crate::awareness::{CursorColor, PresenceEntry};
use crate::binding::{EditorBinding, EditorEngine};

// ───────────────────────────────────────────────────────────────────
// Geometry
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Zero origin and zero size: layout has not produced a position yet.
    pub fn is_degenerate(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.width == 0.0 && self.height == 0.0
    }
}

/// The scrollable element the overlay is positioned in.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollContainer {
    /// Client-space bounding rect
    pub bounds: Rect,
    pub scroll_left: f32,
    pub scroll_top: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    NodeNotFound { block: u32 },
    OffsetOutOfRange { block: u32, offset: u32, len: u32 },
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NodeNotFound { block } => write!(f, "Block {block} is not rendered"),
            Self::OffsetOutOfRange { block, offset, len } => {
                write!(f, "Offset {offset} past end of block {block} (length {len})")
            }
        }
    }
}

impl std::error::Error for ResolveError {}

/// The local editor's rendering, as far as cursor projection needs it.
pub trait EditorSurface: Send + Sync {
    /// Client-space rectangles covering `selection` in the rendering of
    /// `children`, in document order.
    fn client_rects(
        &self,
        children: &[Block],
        selection: &Selection,
    ) -> Result<Vec<Rect>, ResolveError>;

    fn container(&self) -> ScrollContainer;
}

/// Caret rectangle relative to the scroll container's content.
///
/// `Ok(None)` means there is nothing renderable this frame.
pub fn project_selection<S: EditorSurface + ?Sized>(
    surface: &S,
    children: &[Block],
    selection: &Selection,
) -> Result<Option<Rect>, ResolveError> {
    let rects = surface.client_rects(children, selection)?;
    let Some(first) = rects.first() else {
        return Ok(None);
    };
    if first.is_degenerate() {
        return Ok(None);
    }
    let container = surface.container();
    Ok(Some(Rect {
        x: first.x - container.bounds.x + container.scroll_left,
        y: first.y - container.bounds.y + container.scroll_top,
        width: first.width,
        height: first.height,
    }))
}

// ───────────────────────────────────────────────────────────────────
// Output
// ───────────────────────────────────────────────────────────────────

/// One remote caret, ready to draw.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorProjection {
    pub connection_id: Uuid,
    pub name: String,
    pub color: CursorColor,
    pub caret: Rect,
}

impl CursorProjection {
    pub const LABEL_HEIGHT: f32 = 16.0;

    /// Top-left of the name label, just above the caret.
    pub fn label_origin(&self) -> (f32, f32) {
        (self.caret.x, self.caret.y - Self::LABEL_HEIGHT)
    }
}

pub trait CursorSink: Send + Sync {
    fn paint(&self, projection: &CursorProjection);
    fn clear(&self, connection_id: &Uuid);
}

/// In-memory sink holding the latest caret of every participant.
#[derive(Default)]
pub struct OverlayCanvas {
    cursors: Mutex<HashMap<Uuid, CursorProjection>>,
    frames: Mutex<u64>,
}

impl OverlayCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    fn cursors_lock(&self) -> MutexGuard<'_, HashMap<Uuid, CursorProjection>> {
        self.cursors.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Visible carets ordered by connection id.
    pub fn cursors(&self) -> Vec<CursorProjection> {
        let mut cursors: Vec<CursorProjection> = self.cursors_lock().values().cloned().collect();
        cursors.sort_by_key(|c| c.connection_id);
        cursors
    }

    pub fn cursor(&self, connection_id: &Uuid) -> Option<CursorProjection> {
        self.cursors_lock().get(connection_id).cloned()
    }

    pub fn frames_painted(&self) -> u64 {
        *self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CursorSink for OverlayCanvas {
    fn paint(&self, projection: &CursorProjection) {
        self.cursors_lock()
            .insert(projection.connection_id, projection.clone());
        *self.frames.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }

    fn clear(&self, connection_id: &Uuid) {
        self.cursors_lock().remove(connection_id);
    }
}

// ───────────────────────────────────────────────────────────────────
// Frame scheduling
// ───────────────────────────────────────────────────────────────────

/// Resolves once per display frame.
pub trait FrameScheduler: Send + Sync + 'static {
    fn next_frame(&self) -> impl Future<Output = ()> + Send;
}

/// Frames paced by a sleep after each one, so a slow frame delays the next
/// instead of piling up ticks.
#[derive(Debug, Clone, Copy)]
pub struct TickFrames {
    period: Duration,
}

impl TickFrames {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl FrameScheduler for TickFrames {
    async fn next_frame(&self) {
        tokio::time::sleep(self.period).await;
    }
}

// ───────────────────────────────────────────────────────────────────
// Overlay
// ───────────────────────────────────────────────────────────────────

struct OverlayContext<E: EditorEngine, S, K, F> {
    binding: Arc<EditorBinding<E>>,
    surface: Arc<S>,
    sink: Arc<K>,
    frames: Arc<F>,
    loops: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl<E, S, K, F> OverlayContext<E, S, K, F>
where
    E: EditorEngine,
    S: EditorSurface + 'static,
    K: CursorSink + 'static,
    F: FrameScheduler,
{
    fn loops(&self) -> MutexGuard<'_, HashMap<Uuid, JoinHandle<()>>> {
        self.loops.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start loops for newly selecting participants, stop the rest.
    fn reconcile(self: &Arc<Self>) {
        let selecting: HashSet<Uuid> = self
            .binding
            .handle()
            .awareness()
            .entries()
            .into_iter()
            .filter(|entry| entry.selection.is_some())
            .map(|entry| entry.connection_id)
            .collect();

        let mut loops = self.loops();
        loops.retain(|id, task| {
            let keep = selecting.contains(id) && !task.is_finished();
            if !keep {
                task.abort();
                self.sink.clear(id);
            }
            keep
        });
        for id in selecting {
            if !loops.contains_key(&id) {
                let context = Arc::clone(self);
                loops.insert(id, tokio::spawn(async move { context.participant_loop(id).await }));
            }
        }
    }

    async fn participant_loop(self: Arc<Self>, id: Uuid) {
        loop {
            self.frames.next_frame().await;

            let entry = self.binding.handle().awareness().entry(&id);
            match entry {
                Some(entry) if entry.selection.is_some() => self.render_frame(entry),
                _ => {
                    self.sink.clear(&id);
                    return;
                }
            }
        }
    }

    fn render_frame(&self, entry: PresenceEntry) {
        let Some(selection) = entry.selection else {
            return;
        };
        let children = self.binding.children();
        match project_selection(self.surface.as_ref(), &children, &selection) {
            Ok(Some(caret)) => self.sink.paint(&CursorProjection {
                connection_id: entry.connection_id,
                name: entry.name,
                color: entry.color,
                caret,
            }),
            Ok(None) => {
                log::trace!("Caret of {} not renderable yet", entry.connection_id);
                self.sink.clear(&entry.connection_id);
            }
            Err(e) => {
                log::trace!("Skipping frame for {}: {e}", entry.connection_id);
                self.sink.clear(&entry.connection_id);
            }
        }
    }
}

/// Type-erased control over a running set of participant loops.
trait LoopSet: Send + Sync {
    fn active(&self) -> usize;
    fn stop_all(&self);
}

impl<E, S, K, F> LoopSet for OverlayContext<E, S, K, F>
where
    E: EditorEngine,
    S: EditorSurface + 'static,
    K: CursorSink + 'static,
    F: FrameScheduler,
{
    fn active(&self) -> usize {
        self.loops().values().filter(|task| !task.is_finished()).count()
    }

    fn stop_all(&self) {
        for (id, task) in self.loops().drain() {
            task.abort();
            self.sink.clear(&id);
        }
    }
}

/// Owns the per-participant loops and the task that keeps them in step
/// with the awareness registry.
pub struct CursorOverlay {
    watcher: Mutex<Option<JoinHandle<()>>>,
    loops: Arc<dyn LoopSet>,
}

impl CursorOverlay {
    /// Start rendering. Must be called from within a tokio runtime.
    pub fn start<E, S, K, F>(
        binding: Arc<EditorBinding<E>>,
        surface: Arc<S>,
        sink: Arc<K>,
        frames: F,
    ) -> Self
    where
        E: EditorEngine,
        S: EditorSurface + 'static,
        K: CursorSink + 'static,
        F: FrameScheduler,
    {
        let context = Arc::new(OverlayContext {
            binding,
            surface,
            sink,
            frames: Arc::new(frames),
            loops: Mutex::new(HashMap::new()),
        });

        let mut changes = context.binding.handle().awareness().subscribe();
        let watched = context.clone();
        let watcher = tokio::spawn(async move {
            watched.reconcile();
            while changes.changed().await.is_ok() {
                watched.reconcile();
            }
        });

        Self {
            watcher: Mutex::new(Some(watcher)),
            loops: context,
        }
    }

    /// Number of participant loops currently running.
    pub fn active_loops(&self) -> usize {
        self.loops.active()
    }

    /// Stop every loop and clear every caret. Idempotent.
    pub fn teardown(&self) {
        if let Some(watcher) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            watcher.abort();
        }
        self.loops.stop_all();
    }
}

impl Drop for CursorOverlay {
    fn drop(&mut self) {
        self.teardown();
    }
}
