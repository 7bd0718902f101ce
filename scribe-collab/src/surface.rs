//! Fixed-metric layout of the block list.
//!
//! Every block occupies one line of `line_height`; every character is
//! `char_width` wide. Good enough for monospace editors and deterministic
//! enough for tests.

use std::sync::Mutex;

use scribe_core::{Block, Selection, TextPoint};

use crate::overlay::{EditorSurface, Rect, ResolveError, ScrollContainer};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridMetrics {
    pub char_width: f32,
    pub line_height: f32,
    pub padding: f32,
}

impl Default for GridMetrics {
    fn default() -> Self {
        Self {
            char_width: 8.0,
            line_height: 20.0,
            padding: 12.0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ScrollOffset {
    left: f32,
    top: f32,
}

pub struct TextGridSurface {
    bounds: Rect,
    metrics: GridMetrics,
    scroll: Mutex<ScrollOffset>,
}

impl TextGridSurface {
    /// `bounds` is the container's client-space rectangle.
    pub fn new(bounds: Rect, metrics: GridMetrics) -> Self {
        Self {
            bounds,
            metrics,
            scroll: Mutex::new(ScrollOffset::default()),
        }
    }

    fn offset(&self) -> ScrollOffset {
        *self.scroll.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn scroll_to(&self, left: f32, top: f32) {
        let mut scroll = self.scroll.lock().unwrap_or_else(|e| e.into_inner());
        scroll.left = left.max(0.0);
        scroll.top = top.max(0.0);
    }

    pub fn scroll_by(&self, dx: f32, dy: f32) {
        let current = self.offset();
        self.scroll_to(current.left + dx, current.top + dy);
    }

    fn check(children: &[Block], point: TextPoint) -> Result<(), ResolveError> {
        let block = children
            .get(point.block as usize)
            .ok_or(ResolveError::NodeNotFound { block: point.block })?;
        let len = block.char_len();
        if point.offset > len {
            return Err(ResolveError::OffsetOutOfRange {
                block: point.block,
                offset: point.offset,
                len,
            });
        }
        Ok(())
    }
}

impl EditorSurface for TextGridSurface {
    fn client_rects(
        &self,
        children: &[Block],
        selection: &Selection,
    ) -> Result<Vec<Rect>, ResolveError> {
        let (start, end) = selection.ordered();
        Self::check(children, start)?;
        Self::check(children, end)?;

        let GridMetrics {
            char_width,
            line_height,
            padding,
        } = self.metrics;
        let scroll = self.offset();

        let mut rects = Vec::with_capacity((end.block - start.block + 1) as usize);
        for block in start.block..=end.block {
            let len = children[block as usize].char_len();
            let from = if block == start.block { start.offset } else { 0 };
            let to = if block == end.block { end.offset } else { len };
            rects.push(Rect {
                x: self.bounds.x + padding + from as f32 * char_width - scroll.left,
                y: self.bounds.y + padding + block as f32 * line_height - scroll.top,
                width: (to - from) as f32 * char_width,
                height: line_height,
            });
        }
        Ok(rects)
    }

    fn container(&self) -> ScrollContainer {
        let scroll = self.offset();
        ScrollContainer {
            bounds: self.bounds,
            scroll_left: scroll.left,
            scroll_top: scroll.top,
        }
    }
}
