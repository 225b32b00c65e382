//! Site adapter contract, the browser session seam, and the scripted locator adapters.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use dealerscope_core::{normalize_key_fragment, RawDealerTuple, Source};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

pub mod chrome;
pub mod sites;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use chrome::{ChromeOptions, ChromeSession, ChromeSessionFactory};
pub use sites::{kia_script, opel_script, seat_script};

pub const CRATE_NAME: &str = "dealerscope-adapters";

pub const DEFAULT_MAX_PAGES: usize = 50;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const OVERLAY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("browser call failed: {0:#}")]
    Transport(anyhow::Error),
    #[error("browser session is no longer usable: {0:#}")]
    Closed(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{site} step `{step}` timed out after {timeout:?}")]
    ExtractionTimeout {
        site: Source,
        step: &'static str,
        timeout: Duration,
    },
    #[error("browser transport error: {0:#}")]
    Transport(anyhow::Error),
    #[error("browser session failure: {0:#}")]
    SessionFailure(anyhow::Error),
    #[error("result markup could not be parsed: {0}")]
    Parse(String),
}

impl AdapterError {
    /// Worth another attempt with the same session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExtractionTimeout { .. } | Self::Transport(_))
    }

    /// The session cannot be used for further terms.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::SessionFailure(_))
    }
}

impl From<SessionError> for AdapterError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Transport(inner) => Self::Transport(inner),
            SessionError::Closed(inner) => Self::SessionFailure(inner),
        }
    }
}

/// Where a selector is evaluated: the page itself or the document of an iframe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Document,
    Frame(&'static str),
}

/// Page-level operations an adapter needs from a browser. Element lookups
/// report absence as `false`/`0` rather than an error so callers can poll.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), SessionError>;
    async fn reload(&self) -> Result<(), SessionError>;
    async fn count(&self, scope: &Scope, selector: &str) -> Result<usize, SessionError>;
    /// Clicks the first match. `Ok(false)` when nothing matches.
    async fn click(&self, scope: &Scope, selector: &str) -> Result<bool, SessionError>;
    /// Replaces the value of the first matching input with `text`.
    async fn type_text(&self, scope: &Scope, selector: &str, text: &str) -> Result<bool, SessionError>;
    /// Runs a snippet in the page; a truthy result counts as success.
    async fn run_script(&self, script: &str) -> Result<bool, SessionError>;
    async fn html(&self, scope: &Scope) -> Result<String, SessionError>;
    async fn close(&self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, SessionError>;
}

/// Produces raw tuples for one search term. The session belongs to the
/// caller: adapters drive it but never close it.
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    fn source(&self) -> Source;
    async fn extract(
        &self,
        term: &str,
        session: &dyn BrowserSession,
    ) -> Result<Vec<RawDealerTuple>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPolicy {
    /// A missing control is skipped.
    Optional,
    /// A missing control fails the extraction with `ExtractionTimeout`.
    Required,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    Navigate(&'static str),
    Reload,
    /// Sleeps for the step timeout.
    Pause,
    Click { scope: Scope, selector: &'static str },
    TypeTerm { scope: Scope, selector: &'static str },
    WaitFor { scope: Scope, selector: &'static str },
    /// Polls a page snippet until it returns a truthy value.
    Script(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStep {
    pub name: &'static str,
    pub action: StepAction,
    pub timeout: Duration,
    pub policy: StepPolicy,
}

impl ScriptStep {
    pub fn required(name: &'static str, action: StepAction, timeout: Duration) -> Self {
        Self {
            name,
            action,
            timeout,
            policy: StepPolicy::Required,
        }
    }

    pub fn optional(name: &'static str, action: StepAction, timeout: Duration) -> Self {
        Self {
            name,
            action,
            timeout,
            policy: StepPolicy::Optional,
        }
    }

    /// Consent banners and promo popups: absent is fine.
    pub fn dismiss(name: &'static str, scope: Scope, selector: &'static str) -> Self {
        Self::optional(name, StepAction::Click { scope, selector }, OVERLAY_TIMEOUT)
    }

    pub fn pause(name: &'static str, duration: Duration) -> Self {
        Self::required(name, StepAction::Pause, duration)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pagination {
    None,
    /// A button that appends more results to the same list.
    LoadMore { selector: &'static str },
    /// A next-page link; the page is exhausted once `disabled` matches.
    NextPage {
        next: &'static str,
        disabled: &'static str,
    },
}

pub type PageParser = fn(&str) -> Result<Vec<RawDealerTuple>, AdapterError>;

/// Everything that differs between dealer locators, as data.
#[derive(Debug, Clone)]
pub struct LocatorScript {
    pub source: Source,
    /// Navigation, overlay handling and term submission, in order.
    pub steps: Vec<ScriptStep>,
    pub results_scope: Scope,
    pub results_selector: &'static str,
    pub results_timeout: Duration,
    pub pagination: Pagination,
    /// Pause after each page change before reading the list again.
    pub settle: Duration,
    pub max_pages: usize,
    pub poll_interval: Duration,
    pub parse: PageParser,
}

pub struct ScriptedAdapter {
    script: LocatorScript,
}

impl ScriptedAdapter {
    pub fn new(script: LocatorScript) -> Self {
        Self { script }
    }

    async fn run_step(
        &self,
        step: &ScriptStep,
        term: &str,
        session: &dyn BrowserSession,
    ) -> Result<(), AdapterError> {
        let source = self.script.source;
        let interval = self.script.poll_interval;
        debug!(%source, step = step.name, "running locator step");

        let satisfied = match &step.action {
            StepAction::Navigate(url) => {
                session.navigate(url).await?;
                true
            }
            StepAction::Reload => {
                session.reload().await?;
                true
            }
            StepAction::Pause => {
                tokio::time::sleep(step.timeout).await;
                true
            }
            StepAction::Click { scope, selector } => {
                poll_until(step.timeout, interval, || session.click(scope, selector)).await?
            }
            StepAction::TypeTerm { scope, selector } => {
                poll_until(step.timeout, interval, || session.type_text(scope, selector, term))
                    .await?
            }
            StepAction::WaitFor { scope, selector } => {
                poll_until(step.timeout, interval, || async move {
                    Ok(session.count(scope, selector).await? > 0)
                })
                .await?
            }
            StepAction::Script(script) => {
                poll_until(step.timeout, interval, || session.run_script(script)).await?
            }
        };

        if satisfied {
            return Ok(());
        }
        match step.policy {
            StepPolicy::Optional => {
                debug!(%source, step = step.name, "optional control not found; continuing");
                Ok(())
            }
            StepPolicy::Required => Err(AdapterError::ExtractionTimeout {
                site: source,
                step: step.name,
                timeout: step.timeout,
            }),
        }
    }

    async fn wait_for_results(&self, session: &dyn BrowserSession) -> Result<(), AdapterError> {
        let step = ScriptStep::required(
            "results-ready",
            StepAction::WaitFor {
                scope: self.script.results_scope.clone(),
                selector: self.script.results_selector,
            },
            self.script.results_timeout,
        );
        self.run_step(&step, "", session).await
    }

    async fn read_page(&self, session: &dyn BrowserSession) -> Result<Vec<RawDealerTuple>, AdapterError> {
        let html = session.html(&self.script.results_scope).await?;
        (self.script.parse)(&html)
    }

    async fn next_page_available(
        &self,
        session: &dyn BrowserSession,
        next: &str,
        disabled: &str,
    ) -> Result<bool, AdapterError> {
        let scope = &self.script.results_scope;
        Ok(session.count(scope, next).await? > 0 && session.count(scope, disabled).await? == 0)
    }
}

#[async_trait]
impl SiteAdapter for ScriptedAdapter {
    fn source(&self) -> Source {
        self.script.source
    }

    async fn extract(
        &self,
        term: &str,
        session: &dyn BrowserSession,
    ) -> Result<Vec<RawDealerTuple>, AdapterError> {
        let script = &self.script;
        for step in &script.steps {
            self.run_step(step, term, session).await?;
        }
        self.wait_for_results(session).await?;

        let mut raw = Vec::new();
        match &script.pagination {
            Pagination::None => raw.extend(self.read_page(session).await?),
            Pagination::LoadMore { selector } => {
                let mut expansions = 0;
                while expansions < script.max_pages
                    && session.click(&script.results_scope, selector).await?
                {
                    expansions += 1;
                    tokio::time::sleep(script.settle).await;
                }
                if expansions == script.max_pages {
                    warn!(source = %script.source, term, expansions, "stopped expanding results at page limit");
                }
                raw.extend(self.read_page(session).await?);
            }
            Pagination::NextPage { next, disabled } => {
                let mut page = 1;
                loop {
                    raw.extend(self.read_page(session).await?);
                    if !self.next_page_available(session, next, disabled).await? {
                        break;
                    }
                    if page >= script.max_pages {
                        warn!(source = %script.source, term, page, "stopped paging at page limit");
                        break;
                    }
                    if !session.click(&script.results_scope, next).await? {
                        break;
                    }
                    tokio::time::sleep(script.settle).await;
                    self.wait_for_results(session).await?;
                    page += 1;
                }
            }
        }

        let tuples = finalize_extraction(raw);
        debug!(source = %script.source, term, tuples = tuples.len(), "extraction finished");
        Ok(tuples)
    }
}

/// Drops empty tuples and keeps the first tuple per (name, street).
pub fn finalize_extraction(raw: Vec<RawDealerTuple>) -> Vec<RawDealerTuple> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(RawDealerTuple::has_content)
        .filter(|tuple| {
            let key = (
                normalize_key_fragment(tuple.name.as_deref().unwrap_or_default()),
                normalize_key_fragment(tuple.street.as_deref().unwrap_or_default()),
            );
            seen.insert(key)
        })
        .collect()
}

/// Probes at least once, then every `interval` until `timeout` elapses.
async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut probe: F) -> Result<bool, SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, SessionError>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if probe().await? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

pub fn adapter_for_source(source: Source) -> Box<dyn SiteAdapter> {
    let script = match source {
        Source::Kia => kia_script(),
        Source::Opel => opel_script(),
        Source::Seat => seat_script(),
    };
    Box::new(ScriptedAdapter::new(script))
}
