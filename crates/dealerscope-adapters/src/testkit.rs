//! Scriptable in-memory browser for adapter and runner tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{BrowserSession, Scope, SessionError, SessionFactory};

#[derive(Debug, Default)]
struct FakeState {
    /// Selector -> number of probes that must fail before it appears.
    elements: HashMap<String, u32>,
    pages: Vec<String>,
    current_page: usize,
    next_page: Option<(String, String)>,
    load_more: Option<(String, usize)>,
    close_on_navigate: bool,
    closed: bool,
    actions: Vec<String>,
}

impl FakeState {
    fn probe(&mut self, selector: &str) -> bool {
        if let Some((next, disabled)) = &self.next_page {
            let more = self.current_page + 1 < self.pages.len();
            if selector == next {
                return true;
            }
            if selector == disabled {
                return !more;
            }
        }
        if let Some((button, remaining)) = &self.load_more {
            if selector == button {
                return *remaining > 0;
            }
        }
        match self.elements.get_mut(selector) {
            Some(0) => true,
            Some(pending) => {
                *pending -= 1;
                false
            }
            None => false,
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::Closed(anyhow::anyhow!("fake browser was closed")))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeSession {
    state: Mutex<FakeState>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_element(self, selector: &str) -> Self {
        self.with_element_after(selector, 0)
    }

    /// The element only matches after `misses` unsuccessful probes.
    pub fn with_element_after(self, selector: &str, misses: u32) -> Self {
        self.lock().elements.insert(selector.to_string(), misses);
        self
    }

    pub fn with_pages(self, pages: Vec<String>) -> Self {
        self.lock().pages = pages;
        self
    }

    /// Clicking `next` advances through the pages; `disabled` matches on the last one.
    pub fn with_next_page(self, next: &str, disabled: &str) -> Self {
        self.lock().next_page = Some((next.to_string(), disabled.to_string()));
        self
    }

    pub fn with_load_more(self, selector: &str, clicks: usize) -> Self {
        self.lock().load_more = Some((selector.to_string(), clicks));
        self
    }

    pub fn closed_on_navigate(self) -> Self {
        self.lock().close_on_navigate = true;
        self
    }

    pub fn actions(&self) -> Vec<String> {
        self.lock().actions.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        let mut state = self.lock();
        state.ensure_open()?;
        if state.close_on_navigate {
            state.closed = true;
            return Err(SessionError::Closed(anyhow::anyhow!("target crashed")));
        }
        state.actions.push(format!("navigate:{url}"));
        Ok(())
    }

    async fn reload(&self) -> Result<(), SessionError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.actions.push("reload".to_string());
        Ok(())
    }

    async fn count(&self, _scope: &Scope, selector: &str) -> Result<usize, SessionError> {
        let mut state = self.lock();
        state.ensure_open()?;
        Ok(usize::from(state.probe(selector)))
    }

    async fn click(&self, _scope: &Scope, selector: &str) -> Result<bool, SessionError> {
        let mut state = self.lock();
        state.ensure_open()?;
        if !state.probe(selector) {
            return Ok(false);
        }
        if state.next_page.as_ref().is_some_and(|(next, _)| next == selector)
            && state.current_page + 1 < state.pages.len()
        {
            state.current_page += 1;
        }
        if let Some((button, remaining)) = state.load_more.as_mut() {
            if button.as_str() == selector {
                *remaining -= 1;
            }
        }
        state.actions.push(format!("click:{selector}"));
        Ok(true)
    }

    async fn type_text(&self, _scope: &Scope, selector: &str, text: &str) -> Result<bool, SessionError> {
        let mut state = self.lock();
        state.ensure_open()?;
        if !state.probe(selector) {
            return Ok(false);
        }
        state.actions.push(format!("type:{selector}:{text}"));
        Ok(true)
    }

    async fn run_script(&self, _script: &str) -> Result<bool, SessionError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.actions.push("script".to_string());
        Ok(true)
    }

    async fn html(&self, _scope: &Scope) -> Result<String, SessionError> {
        let state = self.lock();
        state.ensure_open()?;
        Ok(state.pages.get(state.current_page).cloned().unwrap_or_default())
    }

    async fn close(&self) -> Result<(), SessionError> {
        let mut state = self.lock();
        state.closed = true;
        state.actions.push("close".to_string());
        Ok(())
    }
}

/// Hands out blank fake sessions and counts opens and closes.
#[derive(Debug, Clone, Default)]
pub struct FakeSessionFactory {
    pub opened: Arc<AtomicU64>,
    pub closed: Arc<AtomicU64>,
    fail_open: bool,
}

impl FakeSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }
}

struct CountedSession {
    inner: FakeSession,
    closed: Arc<AtomicU64>,
}

#[async_trait]
impl BrowserSession for CountedSession {
    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.inner.navigate(url).await
    }

    async fn reload(&self) -> Result<(), SessionError> {
        self.inner.reload().await
    }

    async fn count(&self, scope: &Scope, selector: &str) -> Result<usize, SessionError> {
        self.inner.count(scope, selector).await
    }

    async fn click(&self, scope: &Scope, selector: &str) -> Result<bool, SessionError> {
        self.inner.click(scope, selector).await
    }

    async fn type_text(&self, scope: &Scope, selector: &str, text: &str) -> Result<bool, SessionError> {
        self.inner.type_text(scope, selector, text).await
    }

    async fn run_script(&self, script: &str) -> Result<bool, SessionError> {
        self.inner.run_script(script).await
    }

    async fn html(&self, scope: &Scope) -> Result<String, SessionError> {
        self.inner.html(scope).await
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        if self.fail_open {
            return Err(SessionError::Closed(anyhow::anyhow!("browser failed to launch")));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountedSession {
            inner: FakeSession::new(),
            closed: self.closed.clone(),
        }))
    }
}
