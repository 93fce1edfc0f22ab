//! Closeable awaitable cells.
//!
//! `Watch<T>` holds a value that tasks can await on. It backs the recycler's
//! pending counter, the latest-info-slot tracker, and the slot lock
//! manager's low-water mark. Closing a watch releases every awaiter with
//! `Cancelled`; operations after close fail immediately.

use tokio::sync::watch;

use crate::error::{PagelogError, PagelogResult};

#[derive(Debug, Clone, Copy)]
struct Cell<T> {
    value: T,
    closed: bool,
}

/// A shared value with awaitable change notification and close-on-shutdown
/// semantics.
#[derive(Debug)]
pub struct Watch<T> {
    tx: watch::Sender<Cell<T>>,
}

impl<T: Copy + PartialEq + Send + Sync + 'static> Watch<T> {
    pub fn new(value: T) -> Self {
        let (tx, _rx) = watch::channel(Cell {
            value,
            closed: false,
        });
        Self { tx }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().value
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().closed
    }

    /// Store `value`, waking awaiters when it changed.
    pub fn set(&self, value: T) {
        self.tx.send_if_modified(|cell| {
            if cell.value == value {
                false
            } else {
                cell.value = value;
                true
            }
        });
    }

    /// Apply `update` to the stored value and return the result.
    pub fn modify<R>(&self, update: impl FnOnce(&mut T) -> R) -> R {
        let mut result = None;
        self.tx.send_modify(|cell| {
            result = Some(update(&mut cell.value));
        });
        result.expect("send_modify always runs the closure")
    }

    /// Release all awaiters with `Cancelled`. Idempotent.
    pub fn close(&self) {
        self.tx.send_if_modified(|cell| {
            if cell.closed {
                false
            } else {
                cell.closed = true;
                true
            }
        });
    }

    /// Wait until the value differs from `current`, returning the observed
    /// value. Fails with `Cancelled` once the watch is closed.
    pub async fn await_not_equal(&self, current: T) -> PagelogResult<T> {
        self.await_condition(|value| *value != current).await
    }

    /// Wait until `predicate` holds for the stored value.
    pub async fn await_condition(
        &self,
        mut predicate: impl FnMut(&T) -> bool,
    ) -> PagelogResult<T> {
        let mut rx = self.tx.subscribe();
        let cell = rx
            .wait_for(|cell| cell.closed || predicate(&cell.value))
            .await
            .map_err(|_| PagelogError::Cancelled)?;
        if cell.closed && !predicate(&cell.value) {
            return Err(PagelogError::Cancelled);
        }
        Ok(cell.value)
    }
}
