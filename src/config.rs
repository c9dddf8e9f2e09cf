use serde::Serialize;

/// Process-wide configuration, populated from the environment at startup.
///
/// `.env` is loaded first (see `main.rs`), then overridden by whatever is
/// actually present in the process environment.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub redis_url: Option<String>,
    pub control_channel_debug: bool,
    pub feature_use_cookies: bool,
    pub profile_base_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8091,
            redis_url: None,
            control_channel_debug: false,
            feature_use_cookies: false,
            profile_base_dir: "/tmp/visual-stream-profiles".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("SERVER_HOST").unwrap_or(defaults.host),
            port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            control_channel_debug: std::env::var("CONTROL_CHANNEL_DEBUG")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            feature_use_cookies: std::env::var("FEATURE_USE_COOKIES")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            profile_base_dir: std::env::var("VISUAL_PROFILE_DIR")
                .unwrap_or(defaults.profile_base_dir),
        }
    }
}
