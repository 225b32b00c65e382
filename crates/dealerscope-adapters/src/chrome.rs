//! `BrowserSession` backed by a headless Chrome process.
//!
//! headless_chrome is synchronous, so every call runs on the blocking pool.
//! A failed call is classified by probing the browser afterwards: if the
//! process no longer answers, the session is reported as closed.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{BrowserSession, Scope, SessionError, SessionFactory};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChromeOptions {
    pub headless: bool,
    pub sandbox: bool,
    pub window_size: (u32, u32),
}

impl Default for ChromeOptions {
    fn default() -> Self {
        Self {
            headless: true,
            sandbox: false,
            window_size: (1920, 1080),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChromeSessionFactory {
    options: ChromeOptions,
}

impl ChromeSessionFactory {
    pub fn new(options: ChromeOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        let options = self.options.clone();
        let session = tokio::task::spawn_blocking(move || ChromeSession::launch(&options))
            .await
            .map_err(|e| SessionError::Closed(anyhow!("browser launch task failed: {e}")))?
            .map_err(SessionError::Closed)?;
        Ok(Box::new(session))
    }
}

pub struct ChromeSession {
    browser: Arc<Browser>,
    tab: Arc<Tab>,
}

impl ChromeSession {
    pub fn launch(options: &ChromeOptions) -> Result<Self> {
        info!(headless = options.headless, "launching chrome");
        let launch = LaunchOptions::default_builder()
            .headless(options.headless)
            .sandbox(options.sandbox)
            .window_size(Some(options.window_size))
            .build()
            .context("failed to build chrome launch options")?;
        let browser = Browser::new(launch).context("failed to launch chrome")?;
        let tab = browser.new_tab().context("failed to open browser tab")?;
        Ok(Self {
            browser: Arc::new(browser),
            tab,
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        let outcome = tokio::task::spawn_blocking(move || op(tab.as_ref()))
            .await
            .map_err(|e| SessionError::Closed(anyhow!("browser worker task failed: {e}")))?;
        match outcome {
            Ok(value) => Ok(value),
            Err(err) => Err(self.classify(err).await),
        }
    }

    async fn classify(&self, err: anyhow::Error) -> SessionError {
        let browser = Arc::clone(&self.browser);
        let alive = tokio::task::spawn_blocking(move || browser.get_version().is_ok())
            .await
            .unwrap_or(false);
        if alive {
            SessionError::Transport(err)
        } else {
            SessionError::Closed(err)
        }
    }

    async fn evaluate(&self, script: String) -> Result<JsonValue, SessionError> {
        self.blocking(move |tab| {
            let result = tab.evaluate(&script, false)?;
            Ok(result.value.unwrap_or(JsonValue::Null))
        })
        .await
    }
}

fn quoted(value: &str) -> String {
    JsonValue::from(value).to_string()
}

fn root_expr(scope: &Scope) -> String {
    match scope {
        Scope::Document => "document".to_string(),
        Scope::Frame(frame) => format!(
            "(document.querySelector({})?.contentDocument ?? null)",
            quoted(frame)
        ),
    }
}

fn count_script(scope: &Scope, selector: &str) -> String {
    format!(
        "(() => {{ const root = {}; return root ? root.querySelectorAll({}).length : 0; }})()",
        root_expr(scope),
        quoted(selector)
    )
}

fn click_script(scope: &Scope, selector: &str) -> String {
    format!(
        "(() => {{ const root = {}; const el = root && root.querySelector({}); \
         if (!el) return false; el.scrollIntoView({{ block: 'center' }}); el.click(); return true; }})()",
        root_expr(scope),
        quoted(selector)
    )
}

fn fill_script(scope: &Scope, selector: &str, text: &str) -> String {
    format!(
        "(() => {{ const root = {}; const el = root && root.querySelector({}); \
         if (!el) return false; el.focus(); el.value = {}; \
         for (const kind of ['input', 'keyup', 'change']) {{ el.dispatchEvent(new Event(kind, {{ bubbles: true }})); }} \
         return true; }})()",
        root_expr(scope),
        quoted(selector),
        quoted(text)
    )
}

fn html_script(scope: &Scope) -> String {
    format!(
        "(() => {{ const root = {}; return root && root.documentElement ? root.documentElement.outerHTML : ''; }})()",
        root_expr(scope)
    )
}

fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        _ => true,
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        debug!(url, "navigating");
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&url)?.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn reload(&self) -> Result<(), SessionError> {
        self.blocking(|tab| {
            tab.reload(false, None)?.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn count(&self, scope: &Scope, selector: &str) -> Result<usize, SessionError> {
        let value = self.evaluate(count_script(scope, selector)).await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    async fn click(&self, scope: &Scope, selector: &str) -> Result<bool, SessionError> {
        let value = self.evaluate(click_script(scope, selector)).await?;
        Ok(truthy(&value))
    }

    async fn type_text(&self, scope: &Scope, selector: &str, text: &str) -> Result<bool, SessionError> {
        match scope {
            // Real keystrokes so autocomplete widgets on the page react.
            Scope::Document => {
                if self.count(scope, selector).await? == 0 {
                    return Ok(false);
                }
                self.evaluate(fill_script(scope, selector, "")).await?;
                let selector = selector.to_string();
                let text = text.to_string();
                self.blocking(move |tab| {
                    tab.find_element(&selector)?.type_into(&text)?;
                    Ok(true)
                })
                .await
            }
            Scope::Frame(_) => {
                let value = self.evaluate(fill_script(scope, selector, text)).await?;
                Ok(truthy(&value))
            }
        }
    }

    async fn run_script(&self, script: &str) -> Result<bool, SessionError> {
        let value = self.evaluate(script.to_string()).await?;
        Ok(truthy(&value))
    }

    async fn html(&self, scope: &Scope) -> Result<String, SessionError> {
        let value = self.evaluate(html_script(scope)).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.blocking(|tab| {
            tab.close(true)?;
            Ok(())
        })
        .await
    }
}
