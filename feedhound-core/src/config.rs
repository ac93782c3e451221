use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// Engine configuration as loaded from `engine.toml`.
///
/// Every section has defaults so a file only needs to carry the values it
/// changes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    pub paths: PathsSection,
    pub chromium: ChromiumSection,
    pub flags: FlagsSection,
    pub user_agents: UserAgentSection,
    pub viewport: ViewportSection,
    pub fingerprint: FingerprintSection,
    pub retry: RetrySection,
    pub session: SessionSection,
    pub navigation: NavigationSection,
    pub stabilization: StabilizationSection,
    pub scroll: ScrollSection,
    pub extraction: ExtractionSection,
    pub overlay: OverlaySection,
    /// Per-target candidate overrides, replacing the built-in catalogue entry.
    pub selectors: BTreeMap<String, Vec<String>>,
}

impl EngineConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn session_state_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.session_state)
    }

    pub fn learned_selectors_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.learned_selectors)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.profiles_dir)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.scroll.stall_limit == 0 {
            return Err("scroll.stall_limit must be at least 1".into());
        }
        if self.scroll.increment_px[0] == 0 || self.scroll.increment_px[1] == 0 {
            return Err("scroll.increment_px must be positive".into());
        }
        if self.stabilization.poll_interval_ms == 0 || self.session.poll_interval_ms == 0 {
            return Err("poll intervals must be positive".into());
        }
        if self.extraction.flush_batch == 0 {
            return Err("extraction.flush_batch must be at least 1".into());
        }
        if let Some(rule) = self.overlay.rules.iter().find(|rule| rule.name.trim().is_empty()) {
            return Err(format!(
                "overlay rule with detect target '{}' has no name",
                rule.detect
            ));
        }
        if let Some((target, _)) = self
            .selectors
            .iter()
            .find(|(_, candidates)| candidates.is_empty())
        {
            return Err(format!("selectors.{target} must list at least one candidate"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub base_dir: String,
    pub session_state: String,
    pub learned_selectors: String,
    pub profiles_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: ".".into(),
            session_state: "state/session.json".into(),
            learned_selectors: "state/learned_selectors.json".into(),
            profiles_dir: "state/profiles".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChromiumSection {
    pub executable_path: String,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub request_timeout_seconds: Option<u64>,
    pub profile_ttl_hours: u64,
}

impl Default for ChromiumSection {
    fn default() -> Self {
        Self {
            executable_path: "chromium".into(),
            headless: true,
            sandbox: true,
            disable_gpu: true,
            request_timeout_seconds: Some(30),
            profile_ttl_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlagsSection {
    pub no_first_run: bool,
    pub disable_automation_controlled: bool,
    pub disable_blink_features: Vec<String>,
    pub mute_audio: bool,
    pub lang: Option<String>,
    pub accept_language: Option<String>,
}

impl Default for FlagsSection {
    fn default() -> Self {
        Self {
            no_first_run: true,
            disable_automation_controlled: true,
            disable_blink_features: vec!["AutomationControlled".into()],
            mute_audio: true,
            lang: Some("en-US".into()),
            accept_language: Some("en-US,en;q=0.9".into()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserAgentSection {
    pub pool: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViewportSection {
    pub resolutions: Vec<[u32; 2]>,
    pub jitter_pixels: u32,
    pub device_scale_factor: [f32; 2],
}

impl Default for ViewportSection {
    fn default() -> Self {
        Self {
            resolutions: vec![[1366, 768], [1440, 900], [1920, 1080]],
            jitter_pixels: 24,
            device_scale_factor: [1.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FingerprintSection {
    pub hide_webdriver: bool,
    pub enable_webgl_mask: bool,
    pub webgl_vendor: Option<String>,
    pub webgl_renderer: Option<String>,
    pub enable_canvas_noise: bool,
    pub canvas_noise_range: [i32; 2],
}

impl Default for FingerprintSection {
    fn default() -> Self {
        Self {
            hide_webdriver: true,
            enable_webgl_mask: true,
            webgl_vendor: None,
            webgl_renderer: None,
            enable_canvas_noise: false,
            canvas_noise_range: [-2, 2],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub schedule_ms: Vec<u64>,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            schedule_ms: vec![1_000, 2_000, 4_000],
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Low-risk authenticated surface used for the validity probe.
    pub home_url: String,
    pub login_url: String,
    pub probe_timeout_ms: u64,
    pub login_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl SessionSection {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            home_url: "https://www.facebook.com/".into(),
            login_url: "https://www.facebook.com/login".into(),
            probe_timeout_ms: 15_000,
            login_timeout_secs: 300,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NavigationSection {
    /// Path segment appended to a bare feed URL to land on its primary view.
    pub primary_view_suffix: String,
    /// Path segments that already name a specific view; URLs containing one
    /// are never re-anchored.
    pub sub_views: Vec<String>,
    pub content_check_ms: u64,
}

impl NavigationSection {
    pub fn content_check(&self) -> Duration {
        Duration::from_millis(self.content_check_ms)
    }
}

impl Default for NavigationSection {
    fn default() -> Self {
        Self {
            primary_view_suffix: "discussion".into(),
            sub_views: [
                "about",
                "members",
                "media",
                "events",
                "files",
                "announcements",
                "photos",
                "videos",
                "search",
                "buy_sell_discussion",
                "pending_posts",
                "permalink",
                "posts",
                "admin",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            content_check_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StabilizationSection {
    pub min_text_length: usize,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub after_scroll_timeout_ms: u64,
}

impl StabilizationSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn after_scroll_timeout(&self) -> Duration {
        Duration::from_millis(self.after_scroll_timeout_ms)
    }
}

impl Default for StabilizationSection {
    fn default() -> Self {
        Self {
            min_text_length: 100,
            poll_interval_ms: 250,
            timeout_ms: 30_000,
            after_scroll_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrollSection {
    pub increment_px: [u32; 2],
    pub pause_ms: [u32; 2],
    /// Consecutive scrolls without new content before the feed is exhausted.
    pub stall_limit: u32,
}

impl Default for ScrollSection {
    fn default() -> Self {
        Self {
            increment_px: [700, 950],
            pause_ms: [1_000, 2_500],
            stall_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionSection {
    pub flush_batch: usize,
    pub include_comments: bool,
    pub max_comments_per_post: usize,
    /// Empty container resolutions in a row before asking the backend for
    /// new container candidates.
    pub discovery_after_empty: u32,
    pub normalize_timestamps: bool,
    pub content_key_chars: usize,
}

impl Default for ExtractionSection {
    fn default() -> Self {
        Self {
            flush_batch: 10,
            include_comments: false,
            max_comments_per_post: 20,
            discovery_after_empty: 2,
            normalize_timestamps: true,
            content_key_chars: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlaySection {
    /// Press Escape when an overlay is detected but no dismiss control resolves.
    pub escape_fallback: bool,
    pub rules: Vec<OverlayRuleConfig>,
}

impl Default for OverlaySection {
    fn default() -> Self {
        let rule = |name: &str, detect: &str, dismiss: &str, priority: u32| OverlayRuleConfig {
            name: name.into(),
            detect: detect.into(),
            dismiss: dismiss.into(),
            priority,
        };
        Self {
            escape_fallback: true,
            rules: vec![
                rule("cookie_consent", "consent_banner", "consent_accept", 10),
                rule("notification_prompt", "notification_prompt", "dismiss_button", 20),
                rule("dialog", "overlay", "close_button", 30),
            ],
        }
    }
}

/// Detection and dismissal both name selector registry targets.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayRuleConfig {
    pub name: String,
    pub detect: String,
    pub dismiss: String,
    #[serde(default)]
    pub priority: u32,
}

pub fn load_engine_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig> {
    let path = path.as_ref();
    let config: EngineConfig = load_toml(path)?;
    config.validate().map_err(|message| ConfigError::Invalid {
        message,
        path: path.to_path_buf(),
    })?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
