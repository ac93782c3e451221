use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::BrowserResult;

/// Handle to an element owned by a [`PageDriver`]. Only meaningful to the
/// driver that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementRef(u64);

impl ElementRef {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    Headless,
    /// Visible window, used for operator-driven login.
    Headed,
}

impl LaunchMode {
    pub fn from_headless(headless: bool) -> Self {
        if headless {
            LaunchMode::Headless
        } else {
            LaunchMode::Headed
        }
    }

    pub fn is_headless(self) -> bool {
        matches!(self, LaunchMode::Headless)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewMetrics {
    pub scroll_y: f64,
    pub scroll_height: f64,
    pub viewport_height: f64,
}

impl ViewMetrics {
    pub fn at_bottom(&self) -> bool {
        self.scroll_y + self.viewport_height >= self.scroll_height - 1.0
    }
}

/// Capabilities the engine needs from a browser backend. The orchestration
/// layer only ever talks to this trait.
#[async_trait]
pub trait PageDriver: Send {
    async fn navigate(&mut self, url: &str) -> BrowserResult<()>;

    async fn current_url(&mut self) -> BrowserResult<String>;

    /// Matches `css` below `scope`, or against the whole document when
    /// `scope` is `None`. Results are in document order.
    async fn query_all(
        &mut self,
        scope: Option<ElementRef>,
        css: &str,
    ) -> BrowserResult<Vec<ElementRef>>;

    async fn click(&mut self, element: ElementRef) -> BrowserResult<()>;

    async fn read_text(&mut self, element: ElementRef) -> BrowserResult<String>;

    async fn read_attribute(
        &mut self,
        element: ElementRef,
        name: &str,
    ) -> BrowserResult<Option<String>>;

    async fn is_visible(&mut self, element: ElementRef) -> BrowserResult<bool>;

    async fn scroll_by(&mut self, delta_y: f64) -> BrowserResult<()>;

    async fn view_metrics(&mut self) -> BrowserResult<ViewMetrics>;

    async fn press_escape(&mut self) -> BrowserResult<()>;

    /// Forgets every element handed out so far and returns how many were
    /// dropped. Using an older [`ElementRef`] afterwards fails with
    /// [`BrowserError::Detached`](super::BrowserError::Detached).
    async fn release_elements(&mut self) -> BrowserResult<usize>;

    /// Serializes the authentication context of the page (cookies and the
    /// like). Opaque to everything but the matching [`DriverFactory`].
    async fn export_state(&mut self) -> BrowserResult<serde_json::Value>;

    /// Locator expressions the backend believes match post containers on the
    /// current page. Backends without a discovery heuristic return nothing.
    async fn suggest_locators(&mut self) -> BrowserResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn close(&mut self) -> BrowserResult<()>;
}

#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Identifies whose state blobs this factory can restore.
    fn backend(&self) -> &str;

    async fn open(
        &self,
        mode: LaunchMode,
        restore: Option<&serde_json::Value>,
    ) -> BrowserResult<Box<dyn PageDriver>>;
}
