//! End-to-end room sessions over the in-process transport.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{
    eventually, eventually_async, init_logging, join_local, relay, test_config, wait_synced,
};
use scribe_collab::{
    CollabConfig, ConnectionIndicator, EditorOp, MarkdownEngine, ProviderEvent,
    ProviderEventKind, SeedOutcome, SeedingController,
};
use scribe_core::{Block, Selection, SharedDocument, TextPoint};

#[tokio::test]
async fn test_concurrent_edits_converge() {
    init_logging();
    let relay = relay();
    let config = test_config(10);
    let alice = join_local(&relay, "notes", "Alice", None, &config).await;
    let bob = join_local(&relay, "notes", "Bob", None, &config).await;
    wait_synced(&alice).await;
    wait_synced(&bob).await;

    alice
        .binding()
        .apply(EditorOp::InsertBlocks {
            index: 0,
            blocks: vec![Block::paragraph("from alice")],
        })
        .unwrap();
    bob.binding()
        .apply(EditorOp::InsertBlocks {
            index: 0,
            blocks: vec![Block::paragraph("from bob")],
        })
        .unwrap();

    eventually("both edits everywhere", || {
        let a = alice.binding().children();
        a.len() == 2 && a == bob.binding().children()
    })
    .await;
}

#[tokio::test]
async fn test_single_seed_seen_by_late_joiner() {
    init_logging();
    let relay = relay();
    let config = test_config(10);

    let alice = join_local(&relay, "r1", "Alice", Some("# Hello"), &config).await;
    assert_eq!(alice.seed_outcome().await, Some(SeedOutcome::Inserted { blocks: 1 }));

    eventually_async("seed to reach the relay", || async {
        let Some(state) = relay.room_state("r1").await else {
            return false;
        };
        let doc = SharedDocument::new();
        doc.apply_update(&state).is_ok() && doc.len() == 1
    })
    .await;

    let bob = join_local(&relay, "r1", "Bob", Some("# Hello"), &config).await;
    assert_eq!(bob.seed_outcome().await, Some(SeedOutcome::DocumentNotEmpty));

    let expected = vec![Block::heading(1, "Hello")];
    assert_eq!(*bob.binding().children(), expected);
    assert_eq!(*alice.binding().children(), expected);
    assert_eq!(bob.binding().markdown(), "# Hello");
}

#[tokio::test]
async fn test_racing_seeders_agree() {
    init_logging();
    let relay = relay();
    let config = test_config(50);
    let content = "# Hello\n\nWorld";

    let (alice, bob) = tokio::join!(
        join_local(&relay, "r2", "Alice", Some(content), &config),
        join_local(&relay, "r2", "Bob", Some(content), &config),
    );
    let (a, b) = tokio::join!(alice.seed_outcome(), bob.seed_outcome());

    let inserted = [&a, &b]
        .iter()
        .filter(|o| matches!(o, Some(SeedOutcome::Inserted { .. })))
        .count();
    assert!((1..=2).contains(&inserted), "outcomes: {a:?} {b:?}");
    for outcome in [&a, &b] {
        assert!(matches!(
            outcome,
            Some(SeedOutcome::Inserted { blocks: 2 }) | Some(SeedOutcome::RacedByPeer)
        ));
    }

    // Let every update settle, then compare.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let children = alice.binding().children();
    assert_eq!(children, bob.binding().children());
    assert_eq!(children.len(), 2 * inserted);
    assert_eq!(children[0], Block::heading(1, "Hello"));
}

#[tokio::test]
async fn test_second_seed_attempt_is_noop() {
    init_logging();
    let relay = relay();
    let config = test_config(5);
    let alice = join_local(&relay, "idem", "Alice", Some("# Once"), &config).await;
    assert_eq!(alice.seed_outcome().await, Some(SeedOutcome::Inserted { blocks: 1 }));
    // Cached result on repeated queries.
    assert_eq!(alice.seed_outcome().await, Some(SeedOutcome::Inserted { blocks: 1 }));

    let again = SeedingController::new(Duration::from_millis(5))
        .run(alice.handle().clone(), &MarkdownEngine, Some("# Once"))
        .await;
    assert_eq!(again, SeedOutcome::AlreadyAttempted);
    assert_eq!(alice.binding().children().len(), 1);
}

#[tokio::test]
async fn test_blank_initial_content_not_seeded() {
    init_logging();
    let relay = relay();
    let alice = join_local(&relay, "blank", "Alice", Some("  \n "), &test_config(5)).await;
    assert_eq!(alice.seed_outcome().await, Some(SeedOutcome::NothingToSeed));
    assert!(alice.binding().children().is_empty());
}

#[tokio::test]
async fn test_presence_is_ephemeral() {
    init_logging();
    let relay = relay();
    let config = test_config(5);
    let alice = join_local(&relay, "presence", "Alice", None, &config).await;
    let bob = join_local(&relay, "presence", "Bob", None, &config).await;
    wait_synced(&alice).await;
    wait_synced(&bob).await;

    let bob_id = bob.handle().peer().peer_id;
    let alice_id = alice.handle().peer().peer_id;
    let caret = Selection::caret(TextPoint::new(0, 0));
    bob.binding().set_selection(Some(caret));

    eventually("alice sees bob's caret", || {
        alice
            .handle()
            .awareness()
            .entry(&bob_id)
            .is_some_and(|e| e.name == "Bob" && e.selection == Some(caret))
    })
    .await;

    alice.leave();
    assert_eq!(alice.handle().awareness().peer_count(), 0);
    assert!(alice.handle().is_destroyed());

    eventually("bob forgets alice", || {
        bob.handle().awareness().entry(&alice_id).is_none()
    })
    .await;
    eventually_async("relay drops alice", || async {
        relay.peer_count("presence").await == 1
    })
    .await;
}

#[tokio::test]
async fn test_reconnect_resyncs_missed_edits() {
    init_logging();
    let relay = relay();
    let config = test_config(5);
    let alice = join_local(&relay, "reconnect", "Alice", None, &config).await;
    let bob = join_local(&relay, "reconnect", "Bob", None, &config).await;
    wait_synced(&alice).await;
    wait_synced(&bob).await;

    alice.adapter().disconnect().await;
    assert!(!alice.adapter().is_connected());
    assert!(!alice.adapter().is_synced());
    assert_eq!(alice.handle().indicator(), ConnectionIndicator::Connecting);

    bob.binding()
        .apply(EditorOp::SetContent("while you were away".into()))
        .unwrap();
    alice
        .binding()
        .apply(EditorOp::InsertBlocks {
            index: 0,
            blocks: vec![Block::Divider],
        })
        .unwrap();

    alice.adapter().connect();
    wait_synced(&alice).await;
    assert_eq!(alice.handle().indicator(), ConnectionIndicator::Hidden);

    eventually("offline edits merged both ways", || {
        let a = alice.binding().children();
        a.len() == 2 && a == bob.binding().children()
    })
    .await;
}

#[tokio::test]
async fn test_status_listeners() {
    init_logging();
    let relay = relay();
    let alice = join_local(&relay, "events", "Alice", None, &test_config(5)).await;
    wait_synced(&alice).await;

    let synced_events = Arc::new(AtomicUsize::new(0));
    let counter = synced_events.clone();
    let id = alice.adapter().on(ProviderEventKind::Synced, move |event| {
        if matches!(event, ProviderEvent::Synced(_)) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    alice.adapter().disconnect().await;
    alice.adapter().connect();
    wait_synced(&alice).await;
    // false on disconnect, true after the new handshake
    assert_eq!(synced_events.load(Ordering::SeqCst), 2);

    alice.adapter().off(ProviderEventKind::Synced, id);
    alice.adapter().off(ProviderEventKind::Synced, id);
    alice.adapter().disconnect().await;
    assert_eq!(synced_events.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    init_logging();
    let relay = relay();
    let config = test_config(5);
    let a = join_local(&relay, "room-a", "Alice", Some("# A"), &config).await;
    let b = join_local(&relay, "room-b", "Bob", Some("# B"), &config).await;
    assert!(matches!(a.seed_outcome().await, Some(SeedOutcome::Inserted { .. })));
    assert!(matches!(b.seed_outcome().await, Some(SeedOutcome::Inserted { .. })));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(a.binding().markdown(), "# A");
    assert_eq!(b.binding().markdown(), "# B");
    assert_eq!(relay.room_count().await, 2);
}

#[tokio::test]
async fn test_lone_peer_reconnects_keep_room() {
    init_logging();
    let relay = relay();
    let config = test_config(5);
    let alice = join_local(&relay, "rejoin", "Alice", Some("# Kept"), &config).await;
    assert_eq!(alice.seed_outcome().await, Some(SeedOutcome::Inserted { blocks: 1 }));
    eventually_async("seed on the relay", || async {
        relay.room_state("rejoin").await.is_some_and(|state| {
            let doc = SharedDocument::new();
            doc.apply_update(&state).is_ok() && !doc.is_empty()
        })
    })
    .await;

    for _ in 0..10 {
        alice.adapter().disconnect().await;
        alice.adapter().connect();
        wait_synced(&alice).await;
    }
    // Let every torn-down link finish leaving
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.room_count().await, 1);
    assert_eq!(relay.peer_count("rejoin").await, 1);

    let bob = join_local(&relay, "rejoin", "Bob", Some("# Other"), &config).await;
    assert_eq!(bob.seed_outcome().await, Some(SeedOutcome::DocumentNotEmpty));
    assert_eq!(*bob.binding().children(), vec![Block::heading(1, "Kept")]);
}

#[tokio::test]
async fn test_single_slot_links_do_not_stall() {
    init_logging();
    let relay = relay();
    let config = CollabConfig {
        channel_capacity: 1,
        ..test_config(5)
    };
    let alice = join_local(&relay, "narrow", "Alice", None, &config).await;
    let bob = join_local(&relay, "narrow", "Bob", None, &config).await;
    wait_synced(&alice).await;
    wait_synced(&bob).await;

    for i in 0..20u32 {
        alice
            .binding()
            .apply(EditorOp::InsertBlocks {
                index: i,
                blocks: vec![Block::paragraph(format!("a{i}"))],
            })
            .unwrap();
        bob.binding()
            .apply(EditorOp::InsertBlocks {
                index: 0,
                blocks: vec![Block::paragraph(format!("b{i}"))],
            })
            .unwrap();
        alice
            .binding()
            .set_selection(Some(Selection::caret(TextPoint::new(0, i))));
    }

    eventually("both sides hold all forty blocks", || {
        let a = alice.binding().children();
        a.len() == 40 && a == bob.binding().children()
    })
    .await;
    assert!(alice.handle().is_connected());
    assert!(bob.handle().is_connected());
}

#[tokio::test]
async fn test_concurrent_typing_in_one_block_merges() {
    init_logging();
    let relay = relay();
    let config = test_config(5);
    let alice = join_local(&relay, "typing", "Alice", Some("hello world"), &config).await;
    assert_eq!(alice.seed_outcome().await, Some(SeedOutcome::Inserted { blocks: 1 }));
    let bob = join_local(&relay, "typing", "Bob", None, &config).await;
    wait_synced(&bob).await;
    eventually("bob sees the seed", || {
        *bob.binding().children() == vec![Block::paragraph("hello world")]
    })
    .await;

    alice
        .binding()
        .apply(EditorOp::InsertText {
            index: 0,
            offset: 5,
            text: ", brave".into(),
        })
        .unwrap();
    let end = bob.binding().children()[0].char_len();
    bob.binding()
        .apply(EditorOp::InsertText {
            index: 0,
            offset: end,
            text: "!".into(),
        })
        .unwrap();
    bob.binding()
        .apply(EditorOp::DeleteText {
            index: 0,
            offset: 0,
            count: 1,
        })
        .unwrap();
    bob.binding()
        .apply(EditorOp::InsertText {
            index: 0,
            offset: 0,
            text: "H".into(),
        })
        .unwrap();

    eventually("typing merged on both sides", || {
        let expected = vec![Block::paragraph("Hello, brave world!")];
        *alice.binding().children() == expected && *bob.binding().children() == expected
    })
    .await;
}
