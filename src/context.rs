//! # Request Context
//!
//! [`Context`] rides along every select, write and optimizer pass. It
//! carries the cooperative cancellation token and the optional execution
//! deadline of the originating request. Long-running loops call
//! [`Context::check`] at iterator boundaries, between merge steps, between
//! sort chunks and between optimizer chunks; cancellation surfaces as a
//! typed error, never as a panic or an unwound stack.
//!
//! ## Budget Propagation
//!
//! The remaining budget is derived from the deadline on demand, so a
//! context can be cloned freely into sub-queries and index accesses without
//! recomputation at clone time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: None,
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Context driven by an external cancellation flag.
    pub fn with_cancel(flag: Arc<AtomicBool>) -> Self {
        Self {
            cancel: Some(flag),
            deadline: None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelable(&self) -> bool {
        self.cancel.is_some() || self.deadline.is_some()
    }

    /// Returns an error once the request is canceled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(Error::canceled("request canceled"));
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::timeout("execution deadline exceeded"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn default_context_never_cancels() {
        assert!(Context::new().check().is_ok());
    }

    #[test]
    fn cancel_flag_surfaces_canceled() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = Context::with_cancel(flag.clone());
        assert!(ctx.check().is_ok());
        flag.store(true, Ordering::Relaxed);
        assert_eq!(ctx.check().unwrap_err().kind(), ErrorKind::Canceled);
    }

    #[test]
    fn elapsed_deadline_surfaces_timeout() {
        let ctx = Context::with_timeout(Duration::ZERO);
        assert_eq!(ctx.check().unwrap_err().kind(), ErrorKind::Timeout);
    }
}
