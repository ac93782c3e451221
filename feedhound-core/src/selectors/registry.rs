use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::browser::{BrowserError, BrowserResult, ElementRef, PageDriver};
use crate::config::EngineConfig;
use crate::persist::write_atomic;

use super::defaults::default_catalogue;
use super::locator::Locator;
use super::SelectorError;

const LEARNED_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CandidateHealth {
    pub hits: u64,
    pub misses: u64,
}

impl CandidateHealth {
    /// Laplace-smoothed hit ratio; an untried candidate scores 0.5.
    pub fn score(&self) -> f64 {
        (self.hits as f64 + 1.0) / (self.hits as f64 + self.misses as f64 + 2.0)
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    locator: Locator,
    health: CandidateHealth,
}

/// Ordered candidates for one logical target. Never empty.
#[derive(Debug, Clone)]
pub struct SelectorSpec {
    target: String,
    candidates: Vec<Candidate>,
    baseline: Vec<String>,
    last_success: Option<usize>,
}

impl SelectorSpec {
    pub fn new<I, S>(target: impl Into<String>, candidates: I) -> Result<Self, SelectorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let target = target.into();
        let mut parsed: Vec<Candidate> = Vec::new();
        for raw in candidates {
            let locator = Locator::parse(raw.as_ref())?;
            if parsed.iter().all(|existing| existing.locator != locator) {
                parsed.push(Candidate {
                    locator,
                    health: CandidateHealth::default(),
                });
            }
        }
        if parsed.is_empty() {
            return Err(SelectorError::EmptyCandidates(target));
        }
        let baseline = parsed.iter().map(|c| c.locator.raw().to_string()).collect();
        Ok(Self {
            target,
            candidates: parsed,
            baseline,
            last_success: None,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        self.candidates.iter().map(|c| c.locator.raw())
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn health(&self, index: usize) -> Option<CandidateHealth> {
        self.candidates.get(index).map(|c| c.health)
    }

    /// Position the most recent successful candidate held when it matched,
    /// before any promotion.
    pub fn last_success(&self) -> Option<usize> {
        self.last_success
    }

    /// Moves the candidate at `index` to the front. Returns whether the order
    /// changed.
    pub fn promote(&mut self, index: usize) -> bool {
        if index == 0 || index >= self.candidates.len() {
            return false;
        }
        let candidate = self.candidates.remove(index);
        self.candidates.insert(0, candidate);
        true
    }

    /// Appends a new fallback candidate. Returns `false` when it is already
    /// known.
    pub fn add_alternative(&mut self, raw: &str) -> Result<bool, SelectorError> {
        let locator = Locator::parse(raw)?;
        if self.candidates.iter().any(|c| c.locator == locator) {
            return Ok(false);
        }
        self.candidates.push(Candidate {
            locator,
            health: CandidateHealth::default(),
        });
        Ok(true)
    }

    fn snapshot(&self) -> Vec<String> {
        self.candidates().map(str::to_string).collect()
    }

    fn diverged(&self) -> bool {
        self.candidates().ne(self.baseline.iter().map(String::as_str))
    }

    /// Puts `preferred` first (in the given order) and keeps the remaining
    /// current candidates behind it.
    fn reorder(&mut self, preferred: &[String]) -> usize {
        let mut merged: Vec<Candidate> = Vec::with_capacity(self.candidates.len());
        for raw in preferred {
            let locator = match Locator::parse(raw) {
                Ok(locator) => locator,
                Err(err) => {
                    warn!(target = %self.target, error = %err, "skipping learned locator");
                    continue;
                }
            };
            if merged.iter().any(|c| c.locator == locator) {
                continue;
            }
            let existing = self
                .candidates
                .iter()
                .position(|c| c.locator == locator)
                .map(|index| self.candidates.remove(index));
            merged.push(existing.unwrap_or(Candidate {
                locator,
                health: CandidateHealth::default(),
            }));
        }
        let learned = merged.len();
        merged.append(&mut self.candidates);
        self.candidates = merged;
        learned
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LearnedSelectors {
    version: u32,
    targets: BTreeMap<String, Vec<String>>,
}

/// Per-engine table of [`SelectorSpec`]s.
#[derive(Debug, Clone, Default)]
pub struct SelectorRegistry {
    specs: BTreeMap<String, SelectorSpec>,
    promotions: u64,
}

impl SelectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Result<Self, SelectorError> {
        let mut registry = Self::new();
        for (target, candidates) in default_catalogue() {
            registry.insert(SelectorSpec::new(*target, candidates.iter())?);
        }
        Ok(registry)
    }

    /// Built-in catalogue with the `[selectors]` overrides from `config`
    /// applied on top.
    pub fn from_config(config: &EngineConfig) -> Result<Self, SelectorError> {
        let mut registry = Self::with_defaults()?;
        for (target, candidates) in &config.selectors {
            registry.insert(SelectorSpec::new(target.clone(), candidates)?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, spec: SelectorSpec) -> Option<SelectorSpec> {
        self.specs.insert(spec.target.clone(), spec)
    }

    pub fn spec(&self, target: &str) -> Option<&SelectorSpec> {
        self.specs.get(target)
    }

    pub fn specs(&self) -> impl Iterator<Item = &SelectorSpec> {
        self.specs.values()
    }

    /// Promotions performed since this registry was built.
    pub fn promotions(&self) -> u64 {
        self.promotions
    }

    pub fn add_alternative(&mut self, target: &str, raw: &str) -> Result<bool, SelectorError> {
        match self.specs.get_mut(target) {
            Some(spec) => {
                let added = spec.add_alternative(raw)?;
                if added {
                    info!(%target, locator = %raw, "learned new selector candidate");
                }
                Ok(added)
            }
            None => {
                warn!(%target, "cannot add alternative to unknown selector target");
                Ok(false)
            }
        }
    }

    /// First element matched by the highest-priority working candidate.
    pub async fn resolve(
        &mut self,
        driver: &mut dyn PageDriver,
        target: &str,
        scope: Option<ElementRef>,
    ) -> BrowserResult<Option<ElementRef>> {
        Ok(self
            .resolve_all(driver, target, scope)
            .await?
            .into_iter()
            .next())
    }

    /// Every element matched by the highest-priority working candidate.
    ///
    /// Candidates that error are skipped like misses; the error only surfaces
    /// when no candidate could be evaluated at all. An unknown target resolves
    /// to nothing.
    pub async fn resolve_all(
        &mut self,
        driver: &mut dyn PageDriver,
        target: &str,
        scope: Option<ElementRef>,
    ) -> BrowserResult<Vec<ElementRef>> {
        let Some(spec) = self.specs.get_mut(target) else {
            warn!(%target, "unknown selector target");
            return Ok(Vec::new());
        };
        let mut evaluated = false;
        let mut last_error: Option<BrowserError> = None;
        for index in 0..spec.candidates.len() {
            let locator = spec.candidates[index].locator.clone();
            match locator.find_all(driver, scope).await {
                Ok(found) if !found.is_empty() => {
                    let health = &mut spec.candidates[index].health;
                    health.hits = health.hits.saturating_add(1);
                    spec.last_success = Some(index);
                    if spec.promote(index) {
                        self.promotions += 1;
                        info!(
                            %target,
                            locator = %locator,
                            from = index,
                            "promoted selector candidate"
                        );
                    }
                    return Ok(found);
                }
                Ok(_) => {
                    evaluated = true;
                    let health = &mut spec.candidates[index].health;
                    health.misses = health.misses.saturating_add(1);
                }
                Err(err) => {
                    debug!(%target, locator = %locator, error = %err, "selector candidate failed");
                    let health = &mut spec.candidates[index].health;
                    health.misses = health.misses.saturating_add(1);
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) if !evaluated => Err(err),
            _ => Ok(Vec::new()),
        }
    }

    /// Merges candidate orders persisted by [`save_learned`](Self::save_learned).
    /// A missing file is not an error. Returns the number of targets merged.
    pub fn load_learned(&mut self, path: &Path) -> Result<usize, SelectorError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(SelectorError::Io {
                    source,
                    path: path.to_path_buf(),
                })
            }
        };
        let learned: LearnedSelectors =
            serde_json::from_str(&content).map_err(|source| SelectorError::Parse {
                source,
                path: path.to_path_buf(),
            })?;
        let mut merged = 0;
        for (target, order) in learned.targets {
            match self.specs.get_mut(&target) {
                Some(spec) => {
                    if spec.reorder(&order) > 0 {
                        merged += 1;
                    }
                }
                None => debug!(%target, "ignoring learned selectors for unknown target"),
            }
        }
        debug!(path = %path.display(), targets = merged, "loaded learned selectors");
        Ok(merged)
    }

    /// Persists the candidate order of every target that drifted from its
    /// initial order. Returns the number of targets written.
    pub fn save_learned(&self, path: &Path) -> Result<usize, SelectorError> {
        let targets: BTreeMap<String, Vec<String>> = self
            .specs
            .values()
            .filter(|spec| spec.diverged())
            .map(|spec| (spec.target.clone(), spec.snapshot()))
            .collect();
        let count = targets.len();
        let learned = LearnedSelectors {
            version: LEARNED_FORMAT_VERSION,
            targets,
        };
        let body = serde_json::to_vec_pretty(&learned).map_err(|source| SelectorError::Parse {
            source,
            path: path.to_path_buf(),
        })?;
        write_atomic(path, &body).map_err(|source| SelectorError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selectors::targets;
    use crate::testing::{FakeFeed, FeedScript};
    use tempfile::tempdir;

    #[test]
    fn empty_candidate_list_is_rejected() {
        let err = SelectorSpec::new("nothing", Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, SelectorError::EmptyCandidates(target) if target == "nothing"));
    }

    #[test]
    fn duplicates_collapse() {
        let spec = SelectorSpec::new("x", ["a.one", " a.one ", "a.two"]).unwrap();
        assert_eq!(spec.len(), 2);
    }

    #[tokio::test]
    async fn second_candidate_is_promoted_and_tried_first() {
        let feed = FakeFeed::new(FeedScript::with_posts(3));
        let mut driver = feed.authenticated_page().await;
        let mut registry = SelectorRegistry::new();
        registry.insert(
            SelectorSpec::new(
                targets::POST_CONTAINER,
                ["section.never-matches", "div[aria-posinset]"],
            )
            .unwrap(),
        );

        let first = registry
            .resolve_all(driver.as_mut(), targets::POST_CONTAINER, None)
            .await
            .unwrap();
        assert_eq!(first.len(), 3);
        let spec = registry.spec(targets::POST_CONTAINER).unwrap();
        assert_eq!(spec.last_success(), Some(1));
        assert_eq!(spec.candidates().next(), Some("div[aria-posinset]"));
        assert_eq!(registry.promotions(), 1);

        registry
            .resolve_all(driver.as_mut(), targets::POST_CONTAINER, None)
            .await
            .unwrap();
        let spec = registry.spec(targets::POST_CONTAINER).unwrap();
        assert_eq!(spec.last_success(), Some(0));
        assert_eq!(spec.health(0).unwrap().hits, 2);
        assert_eq!(spec.health(1).unwrap().misses, 1);
        assert_eq!(registry.promotions(), 1);
    }

    #[tokio::test]
    async fn unknown_target_resolves_to_nothing() {
        let feed = FakeFeed::new(FeedScript::with_posts(1));
        let mut driver = feed.authenticated_page().await;
        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let found = registry
            .resolve(driver.as_mut(), "no_such_target", None)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn learned_order_survives_a_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("learned.json");

        let mut registry = SelectorRegistry::with_defaults().unwrap();
        registry
            .specs
            .get_mut(targets::POST_CONTAINER)
            .unwrap()
            .promote(1);
        registry
            .add_alternative(targets::CLOSE_BUTTON, r#"i[data-icon="close"]"#)
            .unwrap();
        assert_eq!(registry.save_learned(&path).unwrap(), 2);

        let mut fresh = SelectorRegistry::with_defaults().unwrap();
        assert_eq!(fresh.load_learned(&path).unwrap(), 2);
        let containers: Vec<_> = fresh
            .spec(targets::POST_CONTAINER)
            .unwrap()
            .candidates()
            .collect();
        assert_eq!(containers[0], "div[aria-posinset]");
        assert_eq!(containers.len(), 4);
        assert!(fresh
            .spec(targets::CLOSE_BUTTON)
            .unwrap()
            .candidates()
            .any(|c| c == r#"i[data-icon="close"]"#));
    }

    #[test]
    fn missing_learned_file_is_fine() {
        let dir = tempdir().unwrap();
        let mut registry = SelectorRegistry::with_defaults().unwrap();
        assert_eq!(
            registry
                .load_learned(&dir.path().join("absent.json"))
                .unwrap(),
            0
        );
    }

    #[test]
    fn config_overrides_replace_defaults() {
        let mut config = EngineConfig::default();
        config
            .selectors
            .insert(targets::SKELETON.into(), vec!["div.placeholder".into()]);
        let registry = SelectorRegistry::from_config(&config).unwrap();
        let skeleton: Vec<_> = registry
            .spec(targets::SKELETON)
            .unwrap()
            .candidates()
            .collect();
        assert_eq!(skeleton, vec!["div.placeholder"]);
    }
}
