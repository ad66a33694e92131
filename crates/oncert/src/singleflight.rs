//! Per-key request coalescing.
//!
//! A [`Group`] collapses concurrent calls that share a key into one
//! underlying execution: the first caller spawns the work, everyone else
//! joins the in-flight call and receives a clone of its outcome. The work
//! runs as a detached task, so a joiner abandoning its wait (for example on
//! a handshake deadline) never cancels the in-flight execution.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::{Error, Result};

type Waiter<T> = watch::Receiver<Option<T>>;

/// A set of in-flight calls keyed by string.
pub struct Group<T> {
    calls: Arc<Mutex<HashMap<String, Waiter<T>>>>,
}

impl<T> Default for Group<T> {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Group<T> {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the in-flight call for `key`, spawning `work` if none is
    /// running. Returns a receiver that resolves with the call's outcome.
    ///
    /// The key is cleared before the outcome is broadcast, so a caller
    /// arriving after completion starts a fresh call.
    pub fn join<F>(&self, key: &str, work: F) -> Waiter<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut calls = self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(rx) = calls.get(key) {
            return rx.clone();
        }

        let (tx, rx) = watch::channel(None);
        calls.insert(key.to_string(), rx.clone());
        drop(calls);

        let calls = Arc::clone(&self.calls);
        let key = key.to_string();
        tokio::spawn(async move {
            let outcome = work.await;
            calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            // Receivers may all have given up; that is fine.
            let _ = tx.send(Some(outcome));
        });

        rx
    }
}

/// Waits for a joined call to resolve.
pub async fn wait<T: Clone>(mut rx: Waiter<T>) -> Result<T> {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return Ok(outcome);
        }
        rx.changed()
            .await
            .map_err(|_| Error::Internal("in-flight call dropped without a result".to_string()))?;
    }
}
