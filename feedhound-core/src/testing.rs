//! Scripted in-memory feed implementing the backend traits.
//!
//! [`FakeFeed`] renders a small keyed DOM from a [`FeedScript`] on every call,
//! so element handles detach exactly when the scripted page stops rendering
//! them. Selector matching supports the CSS subset the default catalogue
//! uses: type, class, id and attribute selectors, `:not(...)`, descendant and
//! child combinators. Anything else matches nothing.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::browser::{
    BrowserError, BrowserResult, DriverFactory, ElementRef, LaunchMode, PageDriver, ViewMetrics,
};
use crate::config::{EngineConfig, RetrySection, ScrollSection, StabilizationSection};
use crate::session::{LoginDecision, LoginPrompt, LoginReason, LoginRequest, SessionState};

pub const FAKE_BACKEND: &str = "fake";
pub const FAKE_HOME_URL: &str = "https://feed.test/";
pub const FAKE_LOGIN_URL: &str = "https://feed.test/login";
pub const FAKE_FEED_URL: &str = "https://feed.test/groups/fake";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeComment {
    pub id: String,
    pub author: String,
    pub text: String,
}

impl FakeComment {
    pub fn new(id: &str, author: &str, text: &str) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakePost {
    pub permalink: Option<String>,
    pub author: Option<String>,
    pub avatar: Option<String>,
    pub text: String,
    /// Rendered cut short behind a "See more" toggle until clicked.
    pub truncated: bool,
    pub timestamp: Option<String>,
    pub comments: Vec<FakeComment>,
}

impl FakePost {
    pub fn numbered(index: usize) -> Self {
        Self {
            permalink: Some(format!("{FAKE_FEED_URL}/posts/{}/", 10_000 + index)),
            author: Some(format!("Author {index}")),
            avatar: Some(format!("https://cdn.feed.test/avatars/{index}.jpg")),
            text: format!(
                "Post {index}: notes from the community board about the upcoming meetup and its agenda."
            ),
            truncated: false,
            timestamp: Some(format!("{}h", index % 23 + 1)),
            comments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayKind {
    Consent,
    Notification,
    Dialog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeOverlay {
    pub kind: OverlayKind,
    /// Scrolls on the current page before the overlay shows up.
    pub after_scrolls: u32,
    /// The dismiss click lands after the overlay already went away.
    pub detach_on_dismiss: bool,
    /// Whether the overlay renders a dismiss control at all.
    pub dismissable: bool,
}

impl FakeOverlay {
    pub fn new(kind: OverlayKind) -> Self {
        Self {
            kind,
            after_scrolls: 0,
            detach_on_dismiss: false,
            dismissable: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedScript {
    pub feed_url: String,
    pub home_url: String,
    pub login_url: String,
    pub posts: Vec<FakePost>,
    pub initial_visible: usize,
    pub post_height: f64,
    pub viewport_height: f64,
    pub overlays: Vec<FakeOverlay>,
    pub session_token: String,
    /// How long the operator takes to log in once the login page is open in
    /// a visible window. `None` never logs in.
    pub login_after: Option<Duration>,
    /// Skeleton placeholders replace the feed for this long after each load.
    pub skeleton_for: Duration,
    /// The bare feed URL renders no posts; only the primary view does.
    pub bare_url_empty: bool,
    pub failing_navigations: u32,
    /// Render posts with markup none of the built-in candidates match.
    pub legacy_markup: bool,
    pub suggested_locators: Vec<String>,
}

impl FeedScript {
    pub fn with_posts(count: usize) -> Self {
        Self {
            feed_url: FAKE_FEED_URL.into(),
            home_url: FAKE_HOME_URL.into(),
            login_url: FAKE_LOGIN_URL.into(),
            posts: (0..count).map(FakePost::numbered).collect(),
            initial_visible: 5,
            post_height: 300.0,
            viewport_height: 900.0,
            overlays: Vec::new(),
            session_token: "token-1".into(),
            login_after: Some(Duration::from_secs(2)),
            skeleton_for: Duration::ZERO,
            bare_url_empty: false,
            failing_navigations: 0,
            legacy_markup: false,
            suggested_locators: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FakeEvent {
    Opened { mode: LaunchMode, restored: bool },
    Navigated(String),
    Clicked(String),
    Escape,
    Scrolled(f64),
    Exported,
    /// Element handles dropped by a release, with how many were live.
    Released(usize),
    Closed,
}

#[derive(Debug, Default)]
struct Shared {
    events: Vec<FakeEvent>,
    failing_navigations: u32,
}

/// Factory handing out pages of one scripted feed. Clones share the event log.
#[derive(Debug, Clone)]
pub struct FakeFeed {
    script: Arc<FeedScript>,
    shared: Arc<Mutex<Shared>>,
}

impl FakeFeed {
    pub fn new(script: FeedScript) -> Self {
        let shared = Shared {
            events: Vec::new(),
            failing_navigations: script.failing_navigations,
        };
        Self {
            script: Arc::new(script),
            shared: Arc::new(Mutex::new(shared)),
        }
    }

    pub fn script(&self) -> &FeedScript {
        &self.script
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        lock(&self.shared).events.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                FakeEvent::Clicked(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    pub fn fail_next_navigations(&self, count: u32) {
        lock(&self.shared).failing_navigations = count;
    }

    /// Session state this feed accepts.
    pub fn valid_session(&self) -> SessionState {
        SessionState::new(FAKE_BACKEND, json!({ "token": self.script.session_token }))
    }

    /// A page already logged in and showing the feed.
    pub async fn authenticated_page(&self) -> Box<dyn PageDriver> {
        self.page(true)
    }

    /// A page without a session, showing the feed URL.
    pub async fn anonymous_page(&self) -> Box<dyn PageDriver> {
        self.page(false)
    }

    fn page(&self, authed: bool) -> Box<dyn PageDriver> {
        let mut driver = FakeDriver::new(self, LaunchMode::Headless, authed);
        driver.record(FakeEvent::Opened {
            mode: LaunchMode::Headless,
            restored: authed,
        });
        let url = self.script.feed_url.clone();
        driver.goto(&url);
        Box::new(driver)
    }

    /// Engine configuration pointing at this feed, with short timings and
    /// state files under `base_dir`.
    pub fn engine_config(base_dir: &Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.paths.base_dir = base_dir.to_string_lossy().into_owned();
        config.session.home_url = FAKE_HOME_URL.into();
        config.session.login_url = FAKE_LOGIN_URL.into();
        config.session.probe_timeout_ms = 2_000;
        config.session.login_timeout_secs = 60;
        config.session.poll_interval_ms = 100;
        config.retry = RetrySection {
            max_attempts: 3,
            schedule_ms: vec![10, 20],
            jitter_ms: 0,
        };
        config.navigation.content_check_ms = 500;
        config.stabilization = StabilizationSection {
            min_text_length: 40,
            poll_interval_ms: 50,
            timeout_ms: 1_000,
            after_scroll_timeout_ms: 300,
        };
        config.scroll = ScrollSection {
            increment_px: [700, 950],
            pause_ms: [10, 20],
            stall_limit: 3,
        };
        config.extraction.flush_batch = 4;
        config
    }
}

#[async_trait]
impl DriverFactory for FakeFeed {
    fn backend(&self) -> &str {
        FAKE_BACKEND
    }

    async fn open(
        &self,
        mode: LaunchMode,
        restore: Option<&Value>,
    ) -> BrowserResult<Box<dyn PageDriver>> {
        let authed = match restore {
            None => false,
            Some(payload) => match payload.get("token") {
                Some(Value::String(token)) => *token == self.script.session_token,
                Some(Value::Null) => false,
                _ => return Err(BrowserError::State("payload carries no token".into())),
            },
        };
        let mut driver = FakeDriver::new(self, mode, authed);
        driver.record(FakeEvent::Opened {
            mode,
            restored: restore.is_some(),
        });
        Ok(Box::new(driver))
    }
}

/// Login prompt answering every request the same way and counting calls.
#[derive(Debug)]
pub struct ScriptedPrompt {
    decision: LoginDecision,
    calls: AtomicUsize,
    reasons: Mutex<Vec<LoginReason>>,
}

impl ScriptedPrompt {
    pub fn new(decision: LoginDecision) -> Self {
        Self {
            decision,
            calls: AtomicUsize::new(0),
            reasons: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reasons(&self) -> Vec<LoginReason> {
        lock(&self.reasons).clone()
    }
}

#[async_trait]
impl LoginPrompt for ScriptedPrompt {
    async fn login_required(&self, request: &LoginRequest) -> LoginDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.reasons).push(request.reason);
        self.decision
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageKind {
    Blank,
    Home,
    Login,
    Feed { bare: bool },
}

#[derive(Debug)]
struct PageState {
    url: String,
    authed: bool,
    loaded_at: Instant,
    login_started: Option<Instant>,
    scroll_y: f64,
    scrolls: u32,
    expanded: HashSet<usize>,
    comments_open: HashSet<usize>,
    dismissed: HashSet<usize>,
    tab_clicked: bool,
}

struct FakeDriver {
    script: Arc<FeedScript>,
    shared: Arc<Mutex<Shared>>,
    mode: LaunchMode,
    page: PageState,
    closed: bool,
    ids: HashMap<String, u64>,
    keys: HashMap<u64, String>,
    next_id: u64,
}

impl FakeDriver {
    fn new(feed: &FakeFeed, mode: LaunchMode, authed: bool) -> Self {
        Self {
            script: Arc::clone(&feed.script),
            shared: Arc::clone(&feed.shared),
            mode,
            page: PageState {
                url: "about:blank".into(),
                authed,
                loaded_at: Instant::now(),
                login_started: None,
                scroll_y: 0.0,
                scrolls: 0,
                expanded: HashSet::new(),
                comments_open: HashSet::new(),
                dismissed: HashSet::new(),
                tab_clicked: false,
            },
            closed: false,
            ids: HashMap::new(),
            keys: HashMap::new(),
            next_id: 1,
        }
    }

    fn record(&self, event: FakeEvent) {
        lock(&self.shared).events.push(event);
    }

    fn goto(&mut self, url: &str) {
        let page = &mut self.page;
        page.url = url.to_string();
        page.loaded_at = Instant::now();
        page.scroll_y = 0.0;
        page.scrolls = 0;
        page.expanded.clear();
        page.comments_open.clear();
        page.tab_clicked = false;
        page.login_started = (url == self.script.login_url
            && self.mode == LaunchMode::Headed
            && !page.authed)
            .then(Instant::now);
        self.record(FakeEvent::Navigated(url.to_string()));
    }

    fn ensure_open(&mut self) -> BrowserResult<()> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        if let (false, Some(started), Some(after)) =
            (self.page.authed, self.page.login_started, self.script.login_after)
        {
            if started.elapsed() >= after {
                self.page.authed = true;
            }
        }
        Ok(())
    }

    fn kind(&self) -> PageKind {
        let url = self.page.url.as_str();
        if url == self.script.login_url {
            PageKind::Login
        } else if url.starts_with(&self.script.feed_url) {
            let bare = !url.trim_end_matches('/').ends_with("/discussion");
            PageKind::Feed { bare }
        } else if url.starts_with(&self.script.home_url) {
            PageKind::Home
        } else {
            PageKind::Blank
        }
    }

    fn materialized(&self) -> usize {
        let revealed = (self.page.scroll_y / self.script.post_height).floor() as usize;
        (self.script.initial_visible + revealed).min(self.script.posts.len())
    }

    fn scroll_height(&self) -> f64 {
        let shown = self.materialized();
        let loader = if shown < self.script.posts.len() { 400.0 } else { 0.0 };
        (shown as f64 * self.script.post_height + loader).max(self.script.viewport_height)
    }

    fn visible_overlays(&self) -> Vec<usize> {
        if !matches!(self.kind(), PageKind::Feed { .. }) || !self.page.authed {
            return Vec::new();
        }
        self.script
            .overlays
            .iter()
            .enumerate()
            .filter(|(index, overlay)| {
                !self.page.dismissed.contains(index) && self.page.scrolls >= overlay.after_scrolls
            })
            .map(|(index, _)| index)
            .collect()
    }

    fn render(&self) -> Dom {
        let mut dom = Dom::new();
        let kind = self.kind();
        if kind == PageKind::Blank {
            return dom;
        }
        if !self.page.authed {
            let form = dom.add(Dom::ROOT, "login", "form", &[("id", "login_form")], "");
            dom.add(form, "login/email", "input", &[("name", "email")], "");
            dom.add(form, "login/pass", "input", &[("name", "pass")], "");
            return dom;
        }
        dom.add(
            Dom::ROOT,
            "landmark",
            "div",
            &[("aria-label", "Your profile"), ("role", "button")],
            "",
        );
        let PageKind::Feed { bare } = kind else {
            return dom;
        };

        let selected = !bare || self.page.tab_clicked;
        let tab_href = format!("{}/discussion", self.script.feed_url);
        dom.add(
            Dom::ROOT,
            "tab",
            "a",
            &[
                ("role", "tab"),
                ("href", tab_href.as_str()),
                ("aria-selected", if selected { "true" } else { "false" }),
            ],
            "Discussion",
        );

        if self.page.loaded_at.elapsed() < self.script.skeleton_for {
            dom.add(
                Dom::ROOT,
                "skeleton",
                "div",
                &[("data-visualcompletion", "loading-state")],
                "",
            );
            return dom;
        }

        let feed = dom.add(Dom::ROOT, "feed", "div", &[("role", "feed")], "");
        if !(bare && self.script.bare_url_empty && !self.page.tab_clicked) {
            for index in 0..self.materialized() {
                self.render_post(&mut dom, feed, index);
            }
        }
        for index in self.visible_overlays() {
            self.render_overlay(&mut dom, index);
        }
        dom
    }

    fn render_post(&self, dom: &mut Dom, feed: usize, index: usize) {
        let post = &self.script.posts[index];
        let key = format!("feed/post{index}");
        let position = (index + 1).to_string();
        let container = if self.script.legacy_markup {
            dom.add(feed, &key, "div", &[("class", "userContentWrapper")], "")
        } else {
            dom.add(
                feed,
                &key,
                "div",
                &[("aria-posinset", position.as_str()), ("role", "article")],
                "",
            )
        };

        if let Some(author) = &post.author {
            let heading = dom.add(container, &format!("{key}/h3"), "h3", &[], "");
            let strong = dom.add(heading, &format!("{key}/strong"), "strong", &[], "");
            dom.add(
                strong,
                &format!("{key}/author"),
                "a",
                &[("href", profile_link(author).as_str())],
                author,
            );
        }
        if let Some(avatar) = &post.avatar {
            let alt = format!("{} profile picture", post.author.as_deref().unwrap_or("User"));
            dom.add(
                container,
                &format!("{key}/avatar"),
                "img",
                &[("alt", alt.as_str()), ("src", avatar.as_str())],
                "",
            );
        }
        let time_parent = match &post.permalink {
            Some(link) => dom.add(
                container,
                &format!("{key}/permalink"),
                "a",
                &[("href", link.as_str())],
                "",
            ),
            None => dom.add(container, &format!("{key}/meta"), "span", &[], ""),
        };
        if let Some(timestamp) = &post.timestamp {
            dom.add(time_parent, &format!("{key}/time"), "abbr", &[], timestamp);
        }

        let message = dom.add(
            container,
            &format!("{key}/message"),
            "div",
            &[("data-ad-rendering-role", "story_message")],
            "",
        );
        if post.truncated && !self.page.expanded.contains(&index) {
            let shown: String = post.text.chars().take(40).collect();
            let clipped = format!("{shown}…");
            dom.add(message, &format!("{key}/text"), "div", &[("dir", "auto")], &clipped);
            dom.add(
                message,
                &format!("{key}/see-more"),
                "div",
                &[("role", "button")],
                "See more",
            );
        } else {
            dom.add(message, &format!("{key}/text"), "div", &[("dir", "auto")], &post.text);
        }

        if post.comments.is_empty() {
            return;
        }
        let list = dom.add(container, &format!("{key}/comments"), "ul", &[], "");
        let open = self.page.comments_open.contains(&index);
        let shown = if open { post.comments.len() } else { 1 };
        let base = post
            .permalink
            .clone()
            .unwrap_or_else(|| format!("{FAKE_FEED_URL}/posts/{}/", 10_000 + index));
        for (position, comment) in post.comments.iter().take(shown).enumerate() {
            let comment_key = format!("{key}/c{position}");
            let item = dom.add(list, &format!("{comment_key}/li"), "li", &[], "");
            let label = format!("Comment by {}", comment.author);
            let article = dom.add(
                item,
                &comment_key,
                "div",
                &[("role", "article"), ("aria-label", label.as_str())],
                "",
            );
            dom.add(
                article,
                &format!("{comment_key}/author"),
                "a",
                &[("href", profile_link(&comment.author).as_str())],
                &comment.author,
            );
            dom.add(
                article,
                &format!("{comment_key}/text"),
                "div",
                &[("dir", "auto"), ("style", "text-align: start;")],
                &comment.text,
            );
            let href = format!("{base}?comment_id={}", comment.id);
            let link_key = format!("{comment_key}/link");
            let link = dom.add(article, &link_key, "a", &[("href", href.as_str())], "");
            dom.add(link, &format!("{comment_key}/time"), "abbr", &[], "1h");
        }
        if !open && post.comments.len() > 1 {
            dom.add(
                container,
                &format!("{key}/more-comments"),
                "div",
                &[("role", "button")],
                "View more comments",
            );
        }
    }

    fn render_overlay(&self, dom: &mut Dom, index: usize) {
        let overlay = &self.script.overlays[index];
        let key = format!("overlay{index}");
        let dismiss_key = format!("{key}/dismiss");
        match overlay.kind {
            OverlayKind::Consent => {
                let node = dom.add(
                    Dom::ROOT,
                    &key,
                    "div",
                    &[("data-testid", "cookie-policy-manage-dialog")],
                    "We use cookies",
                );
                if overlay.dismissable {
                    dom.add(
                        node,
                        &dismiss_key,
                        "button",
                        &[("data-cookiebanner", "accept_button")],
                        "Allow all cookies",
                    );
                }
            }
            OverlayKind::Notification => {
                let node = dom.add(
                    Dom::ROOT,
                    &key,
                    "div",
                    &[("role", "dialog"), ("aria-label", "Turn on notifications")],
                    "Turn on notifications",
                );
                if overlay.dismissable {
                    dom.add(
                        node,
                        &dismiss_key,
                        "div",
                        &[("role", "button"), ("aria-label", "Not now")],
                        "Not now",
                    );
                }
            }
            OverlayKind::Dialog => {
                let node = dom.add(
                    Dom::ROOT,
                    &key,
                    "div",
                    &[("role", "dialog"), ("aria-label", "Join group")],
                    "Join this group",
                );
                if overlay.dismissable {
                    dom.add(
                        node,
                        &dismiss_key,
                        "div",
                        &[("role", "button"), ("aria-label", "Close")],
                        "",
                    );
                }
            }
        }
    }

    fn handle(&mut self, key: &str) -> ElementRef {
        if let Some(id) = self.ids.get(key) {
            return ElementRef::new(*id);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(key.to_string(), id);
        self.keys.insert(id, key.to_string());
        ElementRef::new(id)
    }

    /// Renders the page and locates `element` in it.
    fn locate(&mut self, element: ElementRef) -> BrowserResult<(Dom, usize)> {
        self.ensure_open()?;
        let dom = self.render();
        let node = self
            .keys
            .get(&element.id())
            .and_then(|key| dom.find(key))
            .ok_or(BrowserError::Detached(element.id()))?;
        Ok((dom, node))
    }
}

fn profile_link(author: &str) -> String {
    format!(
        "https://feed.test/user/{}",
        author.to_lowercase().replace(' ', ".")
    )
}

fn post_index(key: &str) -> Option<usize> {
    key.strip_prefix("feed/post")?
        .split('/')
        .next()?
        .parse()
        .ok()
}

#[async_trait]
impl PageDriver for FakeDriver {
    async fn navigate(&mut self, url: &str) -> BrowserResult<()> {
        self.ensure_open()?;
        {
            let mut shared = lock(&self.shared);
            if shared.failing_navigations > 0 {
                shared.failing_navigations -= 1;
                return Err(BrowserError::Timeout(format!("navigation to {url}")));
            }
        }
        self.goto(url);
        Ok(())
    }

    async fn current_url(&mut self) -> BrowserResult<String> {
        self.ensure_open()?;
        Ok(self.page.url.clone())
    }

    async fn query_all(
        &mut self,
        scope: Option<ElementRef>,
        css: &str,
    ) -> BrowserResult<Vec<ElementRef>> {
        let (dom, root) = match scope {
            Some(scope) => self.locate(scope)?,
            None => {
                self.ensure_open()?;
                (self.render(), Dom::ROOT)
            }
        };
        let Some(selector) = Selector::parse(css) else {
            return Ok(Vec::new());
        };
        let keys: Vec<String> = dom
            .descendants(root)
            .into_iter()
            .filter(|node| selector.matches(&dom, *node))
            .map(|node| dom.nodes[node].key.clone())
            .collect();
        Ok(keys.iter().map(|key| self.handle(key)).collect())
    }

    async fn click(&mut self, element: ElementRef) -> BrowserResult<()> {
        let (dom, node) = self.locate(element)?;
        let key = dom.nodes[node].key.clone();
        self.record(FakeEvent::Clicked(key.clone()));
        if key == "tab" {
            self.page.tab_clicked = true;
        } else if key.ends_with("/see-more") {
            if let Some(index) = post_index(&key) {
                self.page.expanded.insert(index);
            }
        } else if key.ends_with("/more-comments") {
            if let Some(index) = post_index(&key) {
                self.page.comments_open.insert(index);
            }
        } else if let Some(rest) = key.strip_prefix("overlay") {
            if let Some(index) = rest
                .strip_suffix("/dismiss")
                .and_then(|index| index.parse::<usize>().ok())
            {
                self.page.dismissed.insert(index);
                if self.script.overlays[index].detach_on_dismiss {
                    return Err(BrowserError::Detached(element.id()));
                }
            }
        }
        Ok(())
    }

    async fn read_text(&mut self, element: ElementRef) -> BrowserResult<String> {
        let (dom, node) = self.locate(element)?;
        Ok(dom.text(node))
    }

    async fn read_attribute(
        &mut self,
        element: ElementRef,
        name: &str,
    ) -> BrowserResult<Option<String>> {
        let (dom, node) = self.locate(element)?;
        Ok(dom.attr(node, name).map(str::to_string))
    }

    async fn is_visible(&mut self, element: ElementRef) -> BrowserResult<bool> {
        self.locate(element)?;
        Ok(true)
    }

    async fn scroll_by(&mut self, delta_y: f64) -> BrowserResult<()> {
        self.ensure_open()?;
        let max = (self.scroll_height() - self.script.viewport_height).max(0.0);
        self.page.scroll_y = (self.page.scroll_y + delta_y).clamp(0.0, max);
        self.page.scrolls += 1;
        self.record(FakeEvent::Scrolled(delta_y));
        Ok(())
    }

    async fn view_metrics(&mut self) -> BrowserResult<ViewMetrics> {
        self.ensure_open()?;
        Ok(ViewMetrics {
            scroll_y: self.page.scroll_y,
            scroll_height: self.scroll_height(),
            viewport_height: self.script.viewport_height,
        })
    }

    async fn press_escape(&mut self) -> BrowserResult<()> {
        self.ensure_open()?;
        self.record(FakeEvent::Escape);
        if let Some(index) = self.visible_overlays().last().copied() {
            self.page.dismissed.insert(index);
        }
        Ok(())
    }

    async fn export_state(&mut self) -> BrowserResult<Value> {
        self.ensure_open()?;
        self.record(FakeEvent::Exported);
        Ok(if self.page.authed {
            json!({ "token": self.script.session_token })
        } else {
            json!({ "token": null })
        })
    }

    async fn suggest_locators(&mut self) -> BrowserResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self.script.suggested_locators.clone())
    }

    async fn release_elements(&mut self) -> BrowserResult<usize> {
        self.ensure_open()?;
        let released = self.keys.len();
        self.ids.clear();
        self.keys.clear();
        self.record(FakeEvent::Released(released));
        Ok(released)
    }

    async fn close(&mut self) -> BrowserResult<()> {
        if !self.closed {
            self.closed = true;
            self.record(FakeEvent::Closed);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Node {
    key: String,
    tag: String,
    attrs: Vec<(String, String)>,
    text: String,
    parent: Option<usize>,
    children: Vec<usize>,
}

#[derive(Debug)]
struct Dom {
    nodes: Vec<Node>,
}

impl Dom {
    const ROOT: usize = 0;

    fn new() -> Self {
        Self {
            nodes: vec![Node {
                key: "body".into(),
                tag: "body".into(),
                attrs: Vec::new(),
                text: String::new(),
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    fn add(
        &mut self,
        parent: usize,
        key: &str,
        tag: &str,
        attrs: &[(&str, &str)],
        text: &str,
    ) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            key: key.to_string(),
            tag: tag.to_string(),
            attrs: attrs
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            text: text.to_string(),
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(index);
        index
    }

    fn find(&self, key: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.key == key)
    }

    fn attr(&self, node: usize, name: &str) -> Option<&str> {
        self.nodes[node]
            .attrs
            .iter()
            .find(|(attr, _)| attr == name)
            .map(|(_, value)| value.as_str())
    }

    /// Nodes below `node` in document order.
    fn descendants(&self, node: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack: Vec<usize> = self.nodes[node].children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.nodes[next].children.iter().rev());
        }
        out
    }

    fn text(&self, node: usize) -> String {
        std::iter::once(node)
            .chain(self.descendants(node))
            .map(|index| self.nodes[index].text.as_str())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum AttrOp {
    Exists,
    Equals(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    Word(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, AttrOp)>,
    negations: Vec<Compound>,
}

impl Compound {
    fn matches(&self, dom: &Dom, index: usize) -> bool {
        let node = &dom.nodes[index];
        if let Some(tag) = &self.tag {
            if !node.tag.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if dom.attr(index, "id") != Some(id.as_str()) {
                return false;
            }
        }
        let classes = dom.attr(index, "class").unwrap_or_default();
        if !self
            .classes
            .iter()
            .all(|class| classes.split_whitespace().any(|have| have == class))
        {
            return false;
        }
        let attrs_match = self.attrs.iter().all(|(name, op)| {
            let Some(value) = dom.attr(index, name) else {
                return false;
            };
            match op {
                AttrOp::Exists => true,
                AttrOp::Equals(expected) => value == expected,
                AttrOp::Prefix(expected) => value.starts_with(expected.as_str()),
                AttrOp::Suffix(expected) => value.ends_with(expected.as_str()),
                AttrOp::Contains(expected) => value.contains(expected.as_str()),
                AttrOp::Word(expected) => value.split_whitespace().any(|word| word == expected),
            }
        });
        attrs_match && !self.negations.iter().any(|negated| negated.matches(dom, index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

/// A complex selector: compounds joined by combinators, rightmost last.
#[derive(Debug, Clone, PartialEq)]
struct Selector {
    parts: Vec<(Combinator, Compound)>,
}

impl Selector {
    fn parse(input: &str) -> Option<Self> {
        let mut parser = CssParser {
            chars: input.chars().collect(),
            pos: 0,
        };
        let mut parts = Vec::new();
        loop {
            let spaced = parser.skip_whitespace();
            let Some(next) = parser.peek() else {
                break;
            };
            let combinator = if next == '>' {
                parser.pos += 1;
                parser.skip_whitespace();
                Combinator::Child
            } else if parts.is_empty() || spaced {
                Combinator::Descendant
            } else {
                return None;
            };
            if combinator == Combinator::Child && parts.is_empty() {
                return None;
            }
            parts.push((combinator, parser.compound()?));
        }
        (!parts.is_empty()).then_some(Self { parts })
    }

    fn matches(&self, dom: &Dom, index: usize) -> bool {
        self.match_at(self.parts.len() - 1, dom, index)
    }

    fn match_at(&self, part: usize, dom: &Dom, index: usize) -> bool {
        let (combinator, compound) = &self.parts[part];
        if !compound.matches(dom, index) {
            return false;
        }
        if part == 0 {
            return true;
        }
        match combinator {
            Combinator::Child => dom.nodes[index]
                .parent
                .is_some_and(|parent| self.match_at(part - 1, dom, parent)),
            Combinator::Descendant => {
                let mut current = dom.nodes[index].parent;
                while let Some(ancestor) = current {
                    if self.match_at(part - 1, dom, ancestor) {
                        return true;
                    }
                    current = dom.nodes[ancestor].parent;
                }
                false
            }
        }
    }
}

struct CssParser {
    chars: Vec<char>,
    pos: usize,
}

impl CssParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn ident(&mut self) -> Option<String> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            self.pos += 1;
        }
        (self.pos > start).then(|| self.chars[start..self.pos].iter().collect())
    }

    fn compound(&mut self) -> Option<Compound> {
        let mut compound = Compound::default();
        let mut any = false;
        match self.peek() {
            Some('*') => {
                self.pos += 1;
                any = true;
            }
            Some(c) if c.is_alphabetic() => {
                compound.tag = self.ident();
                any = true;
            }
            _ => {}
        }
        loop {
            match self.peek() {
                Some('.') => {
                    self.pos += 1;
                    compound.classes.push(self.ident()?);
                }
                Some('#') => {
                    self.pos += 1;
                    compound.id = Some(self.ident()?);
                }
                Some('[') => {
                    self.pos += 1;
                    compound.attrs.push(self.attribute()?);
                }
                Some(':') => {
                    self.pos += 1;
                    if self.ident()? != "not" || self.peek() != Some('(') {
                        return None;
                    }
                    self.pos += 1;
                    self.skip_whitespace();
                    compound.negations.push(self.compound()?);
                    self.skip_whitespace();
                    if self.peek() != Some(')') {
                        return None;
                    }
                    self.pos += 1;
                }
                Some(c) if c.is_whitespace() || c == '>' || c == ')' => break,
                None => break,
                Some(_) => return None,
            }
            any = true;
        }
        any.then_some(compound)
    }

    fn attribute(&mut self) -> Option<(String, AttrOp)> {
        self.skip_whitespace();
        let name = self.ident()?;
        self.skip_whitespace();
        let op = match self.peek()? {
            ']' => {
                self.pos += 1;
                return Some((name, AttrOp::Exists));
            }
            '=' => {
                self.pos += 1;
                '='
            }
            marker @ ('^' | '$' | '*' | '~') => {
                self.pos += 1;
                if self.peek() != Some('=') {
                    return None;
                }
                self.pos += 1;
                marker
            }
            _ => return None,
        };
        self.skip_whitespace();
        let value = match self.peek()? {
            quote @ ('"' | '\'') => {
                self.pos += 1;
                let start = self.pos;
                while self.peek()? != quote {
                    self.pos += 1;
                }
                let value: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                value
            }
            _ => self.ident()?,
        };
        self.skip_whitespace();
        if self.peek() != Some(']') {
            return None;
        }
        self.pos += 1;
        let op = match op {
            '=' => AttrOp::Equals(value),
            '^' => AttrOp::Prefix(value),
            '$' => AttrOp::Suffix(value),
            '*' => AttrOp::Contains(value),
            _ => AttrOp::Word(value),
        };
        Some((name, op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selectors::{default_catalogue, Locator};

    fn sample() -> Dom {
        let mut dom = Dom::new();
        let feed = dom.add(Dom::ROOT, "feed", "div", &[("role", "feed")], "");
        let post = dom.add(feed, "post", "div", &[("role", "article"), ("class", "card wide")], "");
        let list = dom.add(post, "list", "ul", &[], "");
        let item = dom.add(list, "item", "li", &[], "");
        dom.add(item, "reply", "div", &[("role", "article")], "reply");
        dom.add(post, "link", "a", &[("href", "/posts/1/?comment_id=4")], "1h");
        dom
    }

    fn select(dom: &Dom, css: &str) -> Vec<String> {
        let selector = Selector::parse(css).unwrap();
        dom.descendants(Dom::ROOT)
            .into_iter()
            .filter(|node| selector.matches(dom, *node))
            .map(|node| dom.nodes[node].key.clone())
            .collect()
    }

    #[test]
    fn combinators_and_attributes() {
        let dom = sample();
        assert_eq!(select(&dom, r#"div[role="feed"] div[role="article"]"#), ["post", "reply"]);
        assert_eq!(select(&dom, r#"ul > li div[role="article"]"#), ["reply"]);
        assert_eq!(select(&dom, "div.card.wide"), ["post"]);
        assert_eq!(select(&dom, r#"a[href*="/posts/"]"#), ["link"]);
        assert!(select(&dom, r#"a[href*="/posts/"]:not([href*="comment_id"])"#).is_empty());
        assert_eq!(select(&dom, "[role^=fe]"), ["feed"]);
    }

    #[test]
    fn unsupported_syntax_is_rejected() {
        for css in ["div, span", "div:first-child", "> div", "div[role", ""] {
            assert!(Selector::parse(css).is_none(), "{css}");
        }
    }

    #[test]
    fn catalogue_css_is_understood() {
        for (_, candidates) in default_catalogue() {
            for candidate in *candidates {
                let locator = Locator::parse(candidate).unwrap();
                assert!(Selector::parse(locator.css()).is_some(), "{candidate}");
            }
        }
    }

    #[tokio::test]
    async fn detached_handles_error() {
        let mut script = FeedScript::with_posts(1);
        script.posts[0].truncated = true;
        let feed = FakeFeed::new(script);
        let mut page = feed.authenticated_page().await;
        let toggle = page.query_all(None, r#"div[role="button"]"#).await.unwrap();
        assert_eq!(toggle.len(), 1);
        page.click(toggle[0]).await.unwrap();
        let err = page.read_text(toggle[0]).await.unwrap_err();
        assert!(err.is_detached());
    }
}
