use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::cdp::browser_protocol::network::{
    Cookie, CookieParam, SetCookiesParams, TimeSinceEpoch,
};
use chromiumoxide::cdp::js_protocol::runtime::ReleaseObjectParams;
use chromiumoxide::element::Element;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;

use super::automation::{BrowserAutomation, BrowserContext, BrowserLauncher};
use super::driver::{DriverFactory, ElementRef, LaunchMode, PageDriver, ViewMetrics};
use super::error::{BrowserError, BrowserResult};

pub const CHROMIUM_BACKEND: &str = "chromium";

const VIEW_METRICS_SCRIPT: &str = r#"({
    scrollY: window.scrollY,
    scrollHeight: document.documentElement.scrollHeight,
    viewportHeight: window.innerHeight
})"#;

const VISIBLE_FN: &str = r#"function() {
    const rect = this.getBoundingClientRect();
    const style = window.getComputedStyle(this);
    return rect.width > 0 && rect.height > 0
        && style.visibility !== 'hidden' && style.display !== 'none';
}"#;

const CLICK_FN: &str = "function() { this.click(); }";

const DISCOVER_CONTAINERS_SCRIPT: &str = r#"(() => {
    const feed = document.querySelector('[role="feed"]') || document.body;
    const counts = new Map();
    for (const node of feed.querySelectorAll('div, article')) {
        const text = (node.innerText || '').trim();
        if (text.length < 80 || !node.querySelector('a[href]')) {
            continue;
        }
        let selector = null;
        if (node.getAttribute('role') === 'article') {
            selector = 'div[role="article"]';
        } else if (node.hasAttribute('aria-posinset')) {
            selector = 'div[aria-posinset]';
        } else if (node.dataset && node.dataset.pagelet) {
            selector = `[data-pagelet^="${node.dataset.pagelet.replace(/[0-9_]+$/, '')}"]`;
        } else if (node.parentElement === feed) {
            selector = `[role="feed"] > ${node.tagName.toLowerCase()}`;
        }
        if (selector) {
            counts.set(selector, (counts.get(selector) || 0) + 1);
        }
    }
    return [...counts.entries()]
        .filter(([, n]) => n >= 2)
        .sort((a, b) => b[1] - a[1])
        .map(([s]) => s)
        .slice(0, 5);
})()"#;

/// Cookie jar snapshot carried in the opaque session payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredState {
    cookies: Vec<StoredCookie>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    path: String,
    expires: f64,
    http_only: bool,
    secure: bool,
}

impl From<Cookie> for StoredCookie {
    fn from(cookie: Cookie) -> Self {
        Self {
            name: cookie.name,
            value: cookie.value,
            domain: cookie.domain,
            path: cookie.path,
            expires: cookie.expires,
            http_only: cookie.http_only,
            secure: cookie.secure,
        }
    }
}

impl StoredCookie {
    fn to_param(&self) -> BrowserResult<CookieParam> {
        let mut builder = CookieParam::builder()
            .name(self.name.clone())
            .value(self.value.clone())
            .domain(self.domain.clone())
            .path(self.path.clone())
            .http_only(self.http_only)
            .secure(self.secure);
        if self.expires > 0.0 {
            builder = builder.expires(TimeSinceEpoch::new(self.expires));
        }
        builder.build().map_err(BrowserError::State)
    }
}

#[derive(Debug, Clone)]
pub struct ChromiumDriverFactory {
    launcher: BrowserLauncher,
}

impl ChromiumDriverFactory {
    pub fn new(config: Arc<EngineConfig>) -> BrowserResult<Self> {
        Ok(Self {
            launcher: BrowserLauncher::new(config)?,
        })
    }
}

#[async_trait]
impl DriverFactory for ChromiumDriverFactory {
    fn backend(&self) -> &str {
        CHROMIUM_BACKEND
    }

    async fn open(
        &self,
        mode: LaunchMode,
        restore: Option<&serde_json::Value>,
    ) -> BrowserResult<Box<dyn PageDriver>> {
        let automation = self.launcher.launch(mode).await?;
        let context = match automation.new_context().await {
            Ok(context) => context,
            Err(err) => {
                if let Err(shutdown) = automation.shutdown().await {
                    warn!(error = %shutdown, "failed to shut down after context error");
                }
                return Err(err);
            }
        };
        let mut driver = ChromiumDriver {
            automation: Some(automation),
            context,
            elements: HashMap::new(),
            next_id: 0,
        };
        if let Some(state) = restore {
            if let Err(err) = driver.restore(state).await {
                driver.close().await?;
                return Err(err);
            }
        }
        Ok(Box::new(driver))
    }
}

/// [`PageDriver`] over a single Chromium tab. Elements handed out are kept in
/// an arena until the next navigation or [`PageDriver::release_elements`].
#[derive(Debug)]
pub struct ChromiumDriver {
    automation: Option<BrowserAutomation>,
    context: BrowserContext,
    elements: HashMap<u64, Element>,
    next_id: u64,
}

impl ChromiumDriver {
    async fn restore(&mut self, state: &serde_json::Value) -> BrowserResult<()> {
        let stored: StoredState = serde_json::from_value(state.clone())
            .map_err(|err| BrowserError::State(err.to_string()))?;
        let cookies = stored
            .cookies
            .iter()
            .map(StoredCookie::to_param)
            .collect::<BrowserResult<Vec<_>>>()?;
        debug!(cookies = cookies.len(), "restoring cookie jar");
        if !cookies.is_empty() {
            self.context
                .page()
                .execute(SetCookiesParams::new(cookies))
                .await?;
        }
        Ok(())
    }

    fn register(&mut self, element: Element) -> ElementRef {
        let id = self.next_id;
        self.next_id += 1;
        self.elements.insert(id, element);
        ElementRef::new(id)
    }

    fn element(&self, element: ElementRef) -> BrowserResult<&Element> {
        self.elements
            .get(&element.id())
            .ok_or(BrowserError::Detached(element.id()))
    }

    fn ensure_open(&self) -> BrowserResult<()> {
        if self.automation.is_some() {
            Ok(())
        } else {
            Err(BrowserError::Closed)
        }
    }
}

/// CDP reports a node that left the document in a few different ways.
fn classify(err: chromiumoxide::error::CdpError, element: ElementRef) -> BrowserError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("detached")
        || lower.contains("no node")
        || lower.contains("could not find node")
        || lower.contains("cannot find context")
    {
        BrowserError::Detached(element.id())
    } else {
        BrowserError::Cdp(err)
    }
}

#[async_trait]
impl PageDriver for ChromiumDriver {
    async fn navigate(&mut self, url: &str) -> BrowserResult<()> {
        self.ensure_open()?;
        self.elements.clear();
        self.context.goto(url).await
    }

    async fn current_url(&mut self) -> BrowserResult<String> {
        self.ensure_open()?;
        Ok(self.context.page().url().await?.unwrap_or_default())
    }

    async fn query_all(
        &mut self,
        scope: Option<ElementRef>,
        css: &str,
    ) -> BrowserResult<Vec<ElementRef>> {
        self.ensure_open()?;
        let found = match scope {
            Some(scope) => self
                .element(scope)?
                .find_elements(css)
                .await
                .map_err(|err| classify(err, scope))?,
            None => self.context.page().find_elements(css).await?,
        };
        Ok(found.into_iter().map(|element| self.register(element)).collect())
    }

    async fn click(&mut self, element: ElementRef) -> BrowserResult<()> {
        self.ensure_open()?;
        self.element(element)?
            .call_js_fn(CLICK_FN, false)
            .await
            .map_err(|err| classify(err, element))?;
        Ok(())
    }

    async fn read_text(&mut self, element: ElementRef) -> BrowserResult<String> {
        self.ensure_open()?;
        let text = self
            .element(element)?
            .inner_text()
            .await
            .map_err(|err| classify(err, element))?;
        Ok(text.unwrap_or_default())
    }

    async fn read_attribute(
        &mut self,
        element: ElementRef,
        name: &str,
    ) -> BrowserResult<Option<String>> {
        self.ensure_open()?;
        self.element(element)?
            .attribute(name)
            .await
            .map_err(|err| classify(err, element))
    }

    async fn is_visible(&mut self, element: ElementRef) -> BrowserResult<bool> {
        self.ensure_open()?;
        let returns = self
            .element(element)?
            .call_js_fn(VISIBLE_FN, false)
            .await
            .map_err(|err| classify(err, element))?;
        Ok(returns
            .result
            .value
            .and_then(|value| value.as_bool())
            .unwrap_or(false))
    }

    async fn scroll_by(&mut self, delta_y: f64) -> BrowserResult<()> {
        self.ensure_open()?;
        let script = format!("window.scrollBy(0, {delta_y});");
        self.context.page().evaluate(script.as_str()).await?;
        Ok(())
    }

    async fn view_metrics(&mut self) -> BrowserResult<ViewMetrics> {
        self.ensure_open()?;
        self.context
            .page()
            .evaluate(VIEW_METRICS_SCRIPT)
            .await?
            .into_value()
            .map_err(|err| BrowserError::Unexpected(format!("failed to decode view metrics: {err}")))
    }

    async fn press_escape(&mut self) -> BrowserResult<()> {
        self.ensure_open()?;
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let mut params = DispatchKeyEventParams::new(kind);
            params.key = Some("Escape".into());
            params.code = Some("Escape".into());
            params.windows_virtual_key_code = Some(27);
            self.context.page().execute(params).await?;
        }
        Ok(())
    }

    async fn export_state(&mut self) -> BrowserResult<serde_json::Value> {
        self.ensure_open()?;
        let cookies = self.context.page().get_cookies().await?;
        let state = StoredState {
            cookies: cookies.into_iter().map(StoredCookie::from).collect(),
        };
        serde_json::to_value(state).map_err(|err| BrowserError::State(err.to_string()))
    }

    async fn suggest_locators(&mut self) -> BrowserResult<Vec<String>> {
        self.ensure_open()?;
        self.context
            .page()
            .evaluate(DISCOVER_CONTAINERS_SCRIPT)
            .await?
            .into_value()
            .map_err(|err| {
                BrowserError::Unexpected(format!("failed to decode locator suggestions: {err}"))
            })
    }

    async fn release_elements(&mut self) -> BrowserResult<usize> {
        self.ensure_open()?;
        let released: Vec<Element> = self.elements.drain().map(|(_, element)| element).collect();
        let page = self.context.page();
        let results = join_all(released.iter().map(|element| {
            page.execute(ReleaseObjectParams::new(element.remote_object_id.clone()))
        }))
        .await;
        let failed = results.iter().filter(|result| result.is_err()).count();
        if failed > 0 {
            trace!(failed, "remote objects already gone");
        }
        Ok(released.len())
    }

    async fn close(&mut self) -> BrowserResult<()> {
        self.elements.clear();
        match self.automation.take() {
            Some(automation) => automation.shutdown().await,
            None => Ok(()),
        }
    }
}
