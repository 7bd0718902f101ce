use std::time::Duration;

/// Client-side tuning for a collaboration room.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Pause between the emptiness check and the seed insert, giving a
    /// racing participant's seed time to arrive.
    pub seed_delay: Duration,
    /// How often the local presence entry is re-announced.
    pub awareness_renew_interval: Duration,
    /// Remote presence entries not renewed within this window are dropped.
    pub presence_idle_timeout: Duration,
    /// Buffer size of the transport channels.
    pub channel_capacity: usize,
    /// Frame period of the cursor overlay.
    pub frame_interval: Duration,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            seed_delay: Duration::from_millis(250),
            awareness_renew_interval: Duration::from_secs(15),
            presence_idle_timeout: Duration::from_secs(30),
            channel_capacity: 256,
            frame_interval: Duration::from_millis(16),
        }
    }
}
