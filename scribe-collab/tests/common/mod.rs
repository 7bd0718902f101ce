//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use scribe_collab::{
    CollabConfig, LocalTransport, MarkdownEngine, PeerInfo, RoomOptions, RoomRelay, RoomSession,
    StaticAuthorizer,
};

pub type LocalSession = RoomSession<LocalTransport, MarkdownEngine>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Short delays so tests finish quickly.
pub fn test_config(seed_delay_ms: u64) -> CollabConfig {
    CollabConfig {
        seed_delay: Duration::from_millis(seed_delay_ms),
        frame_interval: Duration::from_millis(5),
        ..CollabConfig::default()
    }
}

pub fn relay() -> Arc<RoomRelay> {
    Arc::new(RoomRelay::new(64, 10))
}

pub async fn join_local(
    relay: &Arc<RoomRelay>,
    room: &str,
    name: &str,
    initial: Option<&str>,
    config: &CollabConfig,
) -> LocalSession {
    let mut options = RoomOptions::new(room, PeerInfo::new(name));
    if let Some(content) = initial {
        options = options.with_initial_content(content);
    }
    RoomSession::join(
        options,
        &StaticAuthorizer::allow_all(),
        LocalTransport::new(relay.clone()),
        Arc::new(MarkdownEngine),
        config,
    )
    .await
    .unwrap()
}

/// Poll `check` until it holds, failing after five seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Async flavour of [`eventually`] for checks that need to await.
pub async fn eventually_async<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_synced<T, E>(session: &RoomSession<T, E>)
where
    T: scribe_collab::RealtimeTransport,
    E: scribe_collab::EditorEngine,
{
    let synced = tokio::time::timeout(Duration::from_secs(5), session.handle().wait_synced())
        .await
        .expect("sync timed out");
    assert!(synced, "room destroyed before sync");
}
