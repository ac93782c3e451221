use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::browser::{BrowserResult, ElementRef, EngineMetrics, PageDriver};
use crate::selectors::SelectorRegistry;

/// Everything a component needs to act on the live page, borrowed for the
/// duration of one operation.
pub struct PageView<'a> {
    pub driver: &'a mut dyn PageDriver,
    pub registry: &'a mut SelectorRegistry,
    pub metrics: &'a mut EngineMetrics,
    pub cancel: &'a CancellationToken,
}

impl<'a> PageView<'a> {
    pub fn new(
        driver: &'a mut dyn PageDriver,
        registry: &'a mut SelectorRegistry,
        metrics: &'a mut EngineMetrics,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            driver,
            registry,
            metrics,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn resolve(
        &mut self,
        target: &str,
        scope: Option<ElementRef>,
    ) -> BrowserResult<Option<ElementRef>> {
        let before = self.registry.promotions();
        let found = self.registry.resolve(&mut *self.driver, target, scope).await;
        self.note_promotion(before);
        found
    }

    pub async fn resolve_all(
        &mut self,
        target: &str,
        scope: Option<ElementRef>,
    ) -> BrowserResult<Vec<ElementRef>> {
        let before = self.registry.promotions();
        let found = self
            .registry
            .resolve_all(&mut *self.driver, target, scope)
            .await;
        self.note_promotion(before);
        found
    }

    /// Resolves `target` under `scope` and reads its text, trimmed. Empty
    /// text counts as absent.
    pub async fn text_of(
        &mut self,
        target: &str,
        scope: Option<ElementRef>,
    ) -> BrowserResult<Option<String>> {
        let Some(element) = self.resolve(target, scope).await? else {
            return Ok(None);
        };
        let text = self.driver.read_text(element).await?;
        let text = text.trim();
        Ok((!text.is_empty()).then(|| text.to_string()))
    }

    /// Drops every element handle issued so far. Only for points where no
    /// caller still holds an [`ElementRef`].
    pub async fn release_elements(&mut self) -> BrowserResult<()> {
        let released = self.driver.release_elements().await?;
        if released > 0 {
            trace!(released, "released element handles");
        }
        Ok(())
    }

    fn note_promotion(&mut self, before: u64) {
        if self.registry.promotions() > before {
            self.metrics.record_promotion();
        }
    }
}
