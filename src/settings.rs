use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_api_base_url() -> String {
    "https://api.parlo.app".to_string()
}

fn default_min_duration_ms() -> u64 {
    500
}

fn default_max_duration_ms() -> u64 {
    60_000
}

fn default_capture_tick_ms() -> u64 {
    100
}

fn default_render_debounce_ms() -> u64 {
    50
}

/// Runtime configuration for the conversation core.
///
/// Everything has a serde default so a partial JSON blob from the host
/// application deserializes cleanly.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CoreSettings {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Bearer token for upload and stream requests. Token acquisition and
    /// storage are the host's problem; the core only attaches it.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Preferred input device by name; default device when `None` or when
    /// the named device has disappeared.
    #[serde(default)]
    pub selected_microphone: Option<String>,

    /// Captures shorter than this are discarded.
    #[serde(default = "default_min_duration_ms")]
    pub min_duration_ms: u64,

    /// Hard ceiling: recording is force-stopped (as a normal stop) at this
    /// elapsed time, and reported durations are clamped to it.
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,

    /// Interval of the capture progress tick (elapsed time + input level).
    #[serde(default = "default_capture_tick_ms")]
    pub capture_tick_ms: u64,

    /// Debounce window for coalescing streamed tokens into UI writes.
    #[serde(default = "default_render_debounce_ms")]
    pub render_debounce_ms: u64,

    /// When set, committed recordings are also written here as WAV files.
    #[serde(default)]
    pub keep_recordings_dir: Option<PathBuf>,
}

impl Default for CoreSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty settings object deserializes")
    }
}

impl CoreSettings {
    pub fn min_duration(&self) -> Duration {
        Duration::from_millis(self.min_duration_ms)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn capture_tick(&self) -> Duration {
        Duration::from_millis(self.capture_tick_ms)
    }

    pub fn render_debounce(&self) -> Duration {
        Duration::from_millis(self.render_debounce_ms)
    }
}
