// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Cooperative cancellation flag shared between a caller and search workers.
///
/// Workers check the flag once per candidate. A child token is cancelled
/// together with its parent, but cancelling the child leaves the parent
/// untouched, so a search can stop its own workers without stopping the
/// caller.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelToken>>,
}

assert_impl_all!(CancelToken: Send, Sync);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is also cancelled when `self` is.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::Relaxed) {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }
}
