//! Test doubles shared with downstream crates through the `testkit` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dealerscope_core::Coordinates;

use crate::{GeocodeBackend, GeocodeError};

/// Scripted geocoder that counts upstream calls.
pub struct CountingBackend {
    pub calls: Arc<AtomicU64>,
    answers: Mutex<VecDeque<Result<Option<Coordinates>, GeocodeError>>>,
    fallback: Option<Coordinates>,
}

impl CountingBackend {
    pub fn always(coordinates: Option<Coordinates>) -> Self {
        Self::scripted(Vec::new(), coordinates)
    }

    /// Plays `answers` in order, then keeps returning `fallback`.
    pub fn scripted(
        answers: Vec<Result<Option<Coordinates>, GeocodeError>>,
        fallback: Option<Coordinates>,
    ) -> Self {
        Self {
            calls: Arc::new(AtomicU64::new(0)),
            answers: Mutex::new(answers.into()),
            fallback,
        }
    }
}

#[async_trait]
impl GeocodeBackend for CountingBackend {
    async fn lookup(
        &self,
        _postal_code: &str,
        _city: Option<&str>,
    ) -> Result<Option<Coordinates>, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .answers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        next.unwrap_or(Ok(self.fallback))
    }
}
