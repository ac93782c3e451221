use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ChromiumSection, EngineConfig, FlagsSection, ViewportSection};

use super::driver::LaunchMode;
use super::error::{BrowserError, BrowserResult};
use super::fingerprint::FingerprintMasker;
use super::profile::{BrowserProfile, ProfileManager};

const FALLBACK_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq)]
pub struct ViewportSpec {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

impl ViewportSpec {
    /// One of the configured resolutions, jittered so consecutive launches
    /// do not report identical window sizes.
    pub fn pick<R: Rng + ?Sized>(section: &ViewportSection, rng: &mut R) -> Self {
        let base = section.resolutions.choose(rng).copied().unwrap_or([1366, 768]);
        let jitter = section.jitter_pixels as i32;
        let mut jittered = |value: u32, min: i32, max: i32| {
            (value as i32 + rng.gen_range(-jitter..=jitter)).clamp(min, max) as u32
        };
        let width = jittered(base[0], 640, 2560);
        let height = jittered(base[1], 480, 1600);
        let [a, b] = section.device_scale_factor;
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            width,
            height,
            device_scale_factor: f64::from(rng.gen_range(low..=high)),
        }
    }
}

fn pick_user_agent<R: Rng + ?Sized>(pool: &[String], rng: &mut R) -> String {
    pool.choose(rng)
        .cloned()
        .unwrap_or_else(|| FALLBACK_USER_AGENT.to_string())
}

/// Command-line switches for one launch.
fn launch_args(
    chromium: &ChromiumSection,
    flags: &FlagsSection,
    viewport: &ViewportSpec,
    user_agent: &str,
) -> Vec<String> {
    let mut args = vec![
        format!("--user-agent={user_agent}"),
        format!("--window-size={},{}", viewport.width, viewport.height),
        // Site notification prompts are handled as overlays instead.
        "--disable-notifications".to_string(),
        "--password-store=basic".to_string(),
    ];
    let switches = [
        (chromium.disable_gpu, "--disable-gpu"),
        (flags.mute_audio, "--mute-audio"),
        (flags.no_first_run, "--no-first-run"),
        (
            flags.disable_automation_controlled,
            "--disable-features=AutomationControlled",
        ),
    ];
    args.extend(
        switches
            .into_iter()
            .filter(|(enabled, _)| *enabled)
            .map(|(_, switch)| switch.to_string()),
    );
    if let Some(lang) = &flags.lang {
        args.push(format!("--lang={lang}"));
    }
    if let Some(accept) = &flags.accept_language {
        args.push(format!("--accept-lang={accept}"));
    }
    if !flags.disable_blink_features.is_empty() {
        args.push(format!(
            "--disable-blink-features={}",
            flags.disable_blink_features.join(",")
        ));
    }
    args
}

/// Starts one Chromium process per session attempt, each with a throwaway
/// profile directory. Nothing but exported session state outlives it.
#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    config: Arc<EngineConfig>,
    profiles: ProfileManager,
    fingerprint: Arc<FingerprintMasker>,
}

impl BrowserLauncher {
    pub fn new(config: Arc<EngineConfig>) -> BrowserResult<Self> {
        let profiles = ProfileManager::from_config(&config)?;
        let fingerprint = Arc::new(FingerprintMasker::new(
            config.fingerprint.clone(),
            config.flags.lang.clone(),
        ));
        Ok(Self {
            config,
            profiles,
            fingerprint,
        })
    }

    pub fn profile_manager(&self) -> &ProfileManager {
        &self.profiles
    }

    pub async fn launch(&self, mode: LaunchMode) -> BrowserResult<BrowserAutomation> {
        let swept = self.profiles.cleanup_expired()?;
        if swept > 0 {
            debug!(swept, "removed expired browser profiles");
        }
        let profile = self.profiles.allocate()?;
        let (viewport, user_agent) = {
            let mut rng = rand::thread_rng();
            (
                ViewportSpec::pick(&self.config.viewport, &mut rng),
                pick_user_agent(&self.config.user_agents.pool, &mut rng),
            )
        };
        let chromium_config = self.chromium_config(&profile, &viewport, &user_agent, mode)?;
        info!(
            profile = %profile.id(),
            mode = ?mode,
            width = viewport.width,
            height = viewport.height,
            "launching chromium"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "cdp handler error");
                }
            }
        });

        Ok(BrowserAutomation {
            browser,
            profile,
            handler_task: Some(handler_task),
            accept_language: self.config.flags.accept_language.clone(),
            user_agent,
            fingerprint: Arc::clone(&self.fingerprint),
        })
    }

    fn chromium_config(
        &self,
        profile: &BrowserProfile,
        viewport: &ViewportSpec,
        user_agent: &str,
        mode: LaunchMode,
    ) -> BrowserResult<ChromiumConfig> {
        let chromium = &self.config.chromium;
        let mut builder = ChromiumConfig::builder()
            .chrome_executable(&chromium.executable_path)
            .user_data_dir(profile.path())
            .viewport(ChromiumViewport {
                width: viewport.width,
                height: viewport.height,
                device_scale_factor: Some(viewport.device_scale_factor),
                emulating_mobile: false,
                is_landscape: viewport.width >= viewport.height,
                has_touch: false,
            })
            .args(launch_args(chromium, &self.config.flags, viewport, user_agent));
        if !mode.is_headless() {
            builder = builder.with_head();
        }
        if !chromium.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = chromium.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }
        builder.build().map_err(BrowserError::Configuration)
    }
}

/// A running browser bound to its profile directory.
#[derive(Debug)]
pub struct BrowserAutomation {
    browser: Browser,
    profile: BrowserProfile,
    handler_task: Option<JoinHandle<()>>,
    accept_language: Option<String>,
    user_agent: String,
    fingerprint: Arc<FingerprintMasker>,
}

impl BrowserAutomation {
    pub fn profile(&self) -> &BrowserProfile {
        &self.profile
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Opens a blank tab with the user agent override and fingerprint
    /// scripts installed before any site script runs.
    pub async fn new_context(&self) -> BrowserResult<BrowserContext> {
        let page = self
            .browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await?;
        let mut overrides = SetUserAgentOverrideParams::builder().user_agent(self.user_agent.clone());
        if let Some(accept) = &self.accept_language {
            overrides = overrides.accept_language(accept.clone());
        }
        page.set_user_agent(overrides.build().map_err(BrowserError::Configuration)?)
            .await?;
        for script in self.fingerprint.scripts() {
            let params = AddScriptToEvaluateOnNewDocumentParams::builder()
                .source(script)
                .build()
                .map_err(BrowserError::Configuration)?;
            page.evaluate_on_new_document(params).await?;
        }
        Ok(BrowserContext { page })
    }

    /// Closes the browser and deletes its profile directory.
    pub async fn shutdown(mut self) -> BrowserResult<()> {
        info!(profile = %self.profile.id(), "shutting down chromium");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "chromium did not close cleanly");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "cdp handler task failed");
            }
        }
        self.profile.release()
    }
}

impl Drop for BrowserAutomation {
    fn drop(&mut self) {
        if self
            .handler_task
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            warn!(profile = %self.profile.id(), "chromium dropped without shutdown");
        }
    }
}

#[derive(Debug)]
pub struct BrowserContext {
    page: Page,
}

impl BrowserContext {
    pub fn page(&self) -> &Page {
        &self.page
    }

    pub async fn goto(&self, url: &str) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn viewport_stays_within_jitter() {
        let section = ViewportSection {
            resolutions: vec![[1440, 900]],
            jitter_pixels: 20,
            device_scale_factor: [1.25, 1.0],
        };
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let viewport = ViewportSpec::pick(&section, &mut rng);
            assert!((1420..=1460).contains(&viewport.width));
            assert!((880..=920).contains(&viewport.height));
            assert!((1.0..=1.25).contains(&viewport.device_scale_factor));
        }
    }

    #[test]
    fn empty_pools_fall_back() {
        let section = ViewportSection {
            resolutions: Vec::new(),
            jitter_pixels: 0,
            device_scale_factor: [1.0, 1.0],
        };
        let mut rng = StdRng::seed_from_u64(1);
        let viewport = ViewportSpec::pick(&section, &mut rng);
        assert_eq!((viewport.width, viewport.height), (1366, 768));
        assert_eq!(pick_user_agent(&[], &mut rng), FALLBACK_USER_AGENT);
    }

    #[test]
    fn launch_args_follow_flags() {
        let viewport = ViewportSpec {
            width: 1400,
            height: 880,
            device_scale_factor: 1.0,
        };
        let mut flags = FlagsSection::default();
        flags.mute_audio = false;
        let args = launch_args(&ChromiumSection::default(), &flags, &viewport, "UA/1");
        assert_eq!(args[0], "--user-agent=UA/1");
        assert!(args.contains(&"--window-size=1400,880".to_string()));
        assert!(args.contains(&"--disable-features=AutomationControlled".to_string()));
        assert!(args.contains(&"--disable-blink-features=AutomationControlled".to_string()));
        assert!(args.contains(&"--accept-lang=en-US,en;q=0.9".to_string()));
        assert!(!args.contains(&"--mute-audio".to_string()));
    }
}
