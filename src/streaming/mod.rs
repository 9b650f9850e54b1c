pub mod events;
pub mod ledger;
pub mod session;

pub use events::{EventStream, MemoryProbe, NoopMemoryProbe, Stats, TranscriptionEvent};
pub use session::StreamingSession;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ENV_PREFIX: &str = "STREAMSCRIBE_";

/// Cooperative cancellation flag shared between the session and its decode
/// worker. Observed between every forward-pass boundary.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// How long a provisional token must survive unchanged before promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelayPreset {
    Low,
    #[default]
    Medium,
    High,
}

impl DelayPreset {
    pub fn delay(self) -> Duration {
        match self {
            DelayPreset::Low => Duration::from_millis(200),
            DelayPreset::Medium => Duration::from_millis(600),
            DelayPreset::High => Duration::from_millis(1200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Passed verbatim to the LM prompt builder.
    pub language: String,
    /// Minimum wall-clock between streaming decode passes.
    pub decode_interval_seconds: f64,
    pub delay_preset: DelayPreset,
    /// Hard budget for one decode loop.
    pub max_tokens_per_pass: usize,
    /// Logit scaling factor; 0 disables scaling.
    pub temperature: f32,
    /// Completed-window cache capacity.
    pub max_cached_windows: usize,
    /// Re-decode each completed window in full instead of relying on
    /// streaming promotion.
    pub finalize_completed_windows: bool,
    /// Mel frames per encoder window.
    pub window_frames: usize,
    pub featurizer: crate::features::FeaturizerConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            language: "English".to_string(),
            decode_interval_seconds: 0.4,
            delay_preset: DelayPreset::default(),
            max_tokens_per_pass: 256,
            temperature: 0.0,
            max_cached_windows: 4,
            finalize_completed_windows: false,
            window_frames: 125,
            featurizer: crate::features::FeaturizerConfig::default(),
        }
    }
}

impl StreamingConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn decode_interval(&self) -> Duration {
        Duration::from_secs_f64(self.decode_interval_seconds.max(0.0))
    }

    fn apply_env_overrides(&mut self) {
        let read = |suffix: &str| std::env::var(format!("{ENV_PREFIX}{suffix}")).ok();

        if let Some(v) = read("LANGUAGE") {
            self.language = v;
        }
        if let Some(v) = read("DECODE_INTERVAL_SECONDS") {
            match v.parse() {
                Ok(parsed) => self.decode_interval_seconds = parsed,
                Err(_) => log::warn!("Ignoring invalid decode interval override '{v}'"),
            }
        }
        if let Some(v) = read("DELAY_PRESET") {
            match v.to_ascii_lowercase().as_str() {
                "low" => self.delay_preset = DelayPreset::Low,
                "medium" => self.delay_preset = DelayPreset::Medium,
                "high" => self.delay_preset = DelayPreset::High,
                _ => log::warn!("Ignoring invalid delay preset override '{v}'"),
            }
        }
        if let Some(v) = read("MAX_TOKENS_PER_PASS") {
            match v.parse::<usize>() {
                Ok(parsed) if parsed > 0 => self.max_tokens_per_pass = parsed,
                _ => log::warn!("Ignoring invalid token budget override '{v}'"),
            }
        }
        if let Some(v) = read("TEMPERATURE") {
            match v.parse() {
                Ok(parsed) => self.temperature = parsed,
                Err(_) => log::warn!("Ignoring invalid temperature override '{v}'"),
            }
        }
        if let Some(v) = read("MAX_CACHED_WINDOWS") {
            match v.parse() {
                Ok(parsed) => self.max_cached_windows = parsed,
                Err(_) => log::warn!("Ignoring invalid cache capacity override '{v}'"),
            }
        }
        if let Some(v) = read("FINALIZE_WINDOWS") {
            match v.parse() {
                Ok(parsed) => self.finalize_completed_windows = parsed,
                Err(_) => log::warn!("Ignoring invalid finalize override '{v}'"),
            }
        }
        if let Some(v) = read("WINDOW_FRAMES") {
            match v.parse::<usize>() {
                Ok(parsed) if parsed > 0 => self.window_frames = parsed,
                _ => log::warn!("Ignoring invalid window size override '{v}'"),
            }
        }
    }
}
