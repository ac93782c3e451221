mod automation;
mod chromium;
mod driver;
mod error;
mod fingerprint;
mod human;
mod metrics;
mod profile;
mod retry;

pub use automation::{BrowserAutomation, BrowserContext, BrowserLauncher, ViewportSpec};
pub use chromium::{ChromiumDriver, ChromiumDriverFactory, CHROMIUM_BACKEND};
pub use driver::{DriverFactory, ElementRef, LaunchMode, PageDriver, ViewMetrics};
pub use error::{BrowserError, BrowserResult};
pub use fingerprint::FingerprintMasker;
pub use human::ScrollPacer;
pub use metrics::EngineMetrics;
pub use profile::{BrowserProfile, ProfileManager};
pub use retry::{Backoff, RetryPolicy};
