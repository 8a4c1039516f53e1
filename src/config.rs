//! Runtime configuration consumed by the core (spec §6 `AppParams`).
//!
//! CLI parsing is out of scope (non-goal); callers populate this struct
//! directly or via [`AppParams::from_env`].

use std::time::Duration;

/// Parameters the core needs from its environment. Everything else
/// (windowing, input, tray, crash handling) lives outside the core and is
/// not represented here.
#[derive(Debug, Clone)]
pub struct AppParams {
    /// Target render tick rate in frames/sec. `0` means "derive from the
    /// display's refresh rate" (spec §4.6: `1e9 / (refresh*2)`).
    pub fps_limit: u32,
    /// Sleep between `QUEUE_EMPTY` retries on the frame queue.
    pub frame_poll_interval: Duration,
    /// Sleep between `QUEUE_EMPTY` retries on the cursor queue.
    pub cursor_poll_interval: Duration,
    /// Resize the host window automatically when the source size changes.
    pub auto_resize: bool,
    /// Preserve the source aspect ratio when scaling to the window.
    pub keep_aspect: bool,
    /// Force a specific aspect ratio regardless of source size, if set.
    pub force_aspect: Option<f32>,
    /// Render an on-screen FPS counter.
    pub show_fps: bool,
    /// How long a stalled host heartbeat is tolerated before
    /// `session_valid` reports false.
    pub heartbeat_timeout: Duration,
    /// How long the top-level (re)init loop retries `INVALID_MAGIC` /
    /// `INVALID_SESSION` before giving up and surfacing a fatal error.
    pub session_init_timeout: Duration,
    /// `setup`'s `streaming` argument (spec §4.5): triple-buffered
    /// PBO-backed upload versus a single directly-written slot. The
    /// original client decides this per-renderer capability; this client
    /// always prefers streaming and only falls back when told to.
    pub streaming: bool,
}

impl Default for AppParams {
    fn default() -> Self {
        Self {
            fps_limit: 0,
            frame_poll_interval: Duration::from_millis(1),
            cursor_poll_interval: Duration::from_millis(1),
            auto_resize: true,
            keep_aspect: true,
            force_aspect: None,
            show_fps: false,
            heartbeat_timeout: Duration::from_secs(2),
            session_init_timeout: Duration::from_secs(10),
            streaming: true,
        }
    }
}

impl AppParams {
    /// Overlay a handful of `VMDISPLAY_*` environment variables on top of
    /// [`AppParams::default`]. Unset or unparsable variables fall back to
    /// the default; this is deliberately not a general-purpose config
    /// loader, just enough ambient configuration for a headless client.
    pub fn from_env() -> Self {
        let mut params = Self::default();

        if let Some(v) = env_u32("VMDISPLAY_FPS_LIMIT") {
            params.fps_limit = v;
        }
        if let Some(v) = env_u64("VMDISPLAY_FRAME_POLL_MS") {
            params.frame_poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("VMDISPLAY_CURSOR_POLL_MS") {
            params.cursor_poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_bool("VMDISPLAY_AUTO_RESIZE") {
            params.auto_resize = v;
        }
        if let Some(v) = env_bool("VMDISPLAY_KEEP_ASPECT") {
            params.keep_aspect = v;
        }
        if let Some(v) = env_bool("VMDISPLAY_SHOW_FPS") {
            params.show_fps = v;
        }
        if let Some(v) = env_u64("VMDISPLAY_HEARTBEAT_TIMEOUT_MS") {
            params.heartbeat_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("VMDISPLAY_SESSION_INIT_TIMEOUT_MS") {
            params.session_init_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_bool("VMDISPLAY_STREAMING") {
            params.streaming = v;
        }

        params
    }

    /// The fixed-rate tick period for the render loop (spec §4.6).
    pub fn tick_period(&self, refresh_rate_hz: f64) -> Duration {
        let nanos = if self.fps_limit > 0 {
            1e9 / self.fps_limit as f64
        } else {
            1e9 / (refresh_rate_hz * 2.0)
        };
        Duration::from_nanos(nanos.max(1.0) as u64)
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tick_period_derives_from_refresh() {
        let params = AppParams::default();
        let period = params.tick_period(60.0);
        // 1e9 / (60*2) = ~8.33ms
        assert!(period.as_millis() >= 8 && period.as_millis() <= 9);
    }

    #[test]
    fn explicit_fps_limit_overrides_refresh() {
        let mut params = AppParams::default();
        params.fps_limit = 100;
        let period = params.tick_period(60.0);
        assert_eq!(period, Duration::from_nanos(10_000_000));
    }
}
