//! Remote cursor rendering across two live sessions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, init_logging, join_local, relay, test_config, wait_synced};
use scribe_collab::{GridMetrics, OverlayCanvas, Rect, SeedOutcome, TextGridSurface};
use scribe_core::{Selection, TextPoint};

fn grid_surface() -> Arc<TextGridSurface> {
    Arc::new(TextGridSurface::new(
        Rect::new(0.0, 0.0, 800.0, 600.0),
        GridMetrics::default(),
    ))
}

#[tokio::test]
async fn test_remote_caret_painted_and_cleared() {
    init_logging();
    let relay = relay();
    let config = test_config(5);
    let alice = join_local(&relay, "cursors", "Alice", Some("# Hello\n\nworld"), &config).await;
    assert_eq!(alice.seed_outcome().await, Some(SeedOutcome::Inserted { blocks: 2 }));
    let bob = join_local(&relay, "cursors", "Bob", None, &config).await;
    wait_synced(&bob).await;

    let surface = grid_surface();
    let canvas = Arc::new(OverlayCanvas::new());
    let overlay = alice.attach_overlay(surface.clone(), canvas.clone());
    let bob_id = bob.handle().peer().peer_id;

    bob.binding().set_selection(Some(Selection::caret(TextPoint::new(1, 3))));
    eventually("bob's caret painted", || canvas.cursor(&bob_id).is_some()).await;

    let cursor = canvas.cursor(&bob_id).unwrap();
    assert_eq!(cursor.name, "Bob");
    // padding 12, char width 8, line height 20
    assert_eq!(cursor.caret, Rect::new(36.0, 32.0, 0.0, 20.0));
    assert_eq!(overlay.active_loops(), 1);

    // Scrolling moves the client rect but not the projected caret.
    surface.scroll_by(0.0, 40.0);
    let painted = canvas.frames_painted();
    eventually("another frame", || canvas.frames_painted() > painted).await;
    assert_eq!(canvas.cursor(&bob_id).unwrap().caret, cursor.caret);

    bob.binding().set_selection(None);
    eventually("bob's caret cleared", || canvas.cursor(&bob_id).is_none()).await;
    eventually("bob's loop stopped", || overlay.active_loops() == 0).await;

    overlay.teardown();
    overlay.teardown();
}

#[tokio::test]
async fn test_unresolvable_selection_skips_frames() {
    init_logging();
    let relay = relay();
    let config = test_config(5);
    let alice = join_local(&relay, "skips", "Alice", Some("one line"), &config).await;
    assert_eq!(alice.seed_outcome().await, Some(SeedOutcome::Inserted { blocks: 1 }));
    let bob = join_local(&relay, "skips", "Bob", None, &config).await;
    wait_synced(&bob).await;

    let canvas = Arc::new(OverlayCanvas::new());
    let overlay = alice.attach_overlay(grid_surface(), canvas.clone());
    let bob_id = bob.handle().peer().peer_id;

    // Block 4 does not exist on alice's side.
    bob.binding().set_selection(Some(Selection::caret(TextPoint::new(4, 0))));
    eventually("loop started", || overlay.active_loops() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(canvas.cursor(&bob_id).is_none());
    assert_eq!(canvas.frames_painted(), 0);

    // The loop survives and paints once the selection resolves.
    bob.binding().set_selection(Some(Selection::caret(TextPoint::new(0, 2))));
    eventually("caret painted after recovery", || canvas.cursor(&bob_id).is_some()).await;
}

#[tokio::test]
async fn test_teardown_and_leave_clear_cursors() {
    init_logging();
    let relay = relay();
    let config = test_config(5);
    let alice = join_local(&relay, "teardown", "Alice", Some("text"), &config).await;
    assert!(alice.seed_outcome().await.is_some());
    let bob = join_local(&relay, "teardown", "Bob", None, &config).await;
    wait_synced(&bob).await;

    let canvas = Arc::new(OverlayCanvas::new());
    let overlay = alice.attach_overlay(grid_surface(), canvas.clone());
    let bob_id = bob.handle().peer().peer_id;
    bob.binding().set_selection(Some(Selection::caret(TextPoint::new(0, 1))));
    eventually("caret painted", || canvas.cursor(&bob_id).is_some()).await;

    // Bob leaving removes his entry, which stops his loop.
    bob.leave();
    eventually("caret cleared on leave", || canvas.cursor(&bob_id).is_none()).await;
    eventually("no loops left", || overlay.active_loops() == 0).await;

    overlay.teardown();
    assert!(canvas.cursors().is_empty());
}
