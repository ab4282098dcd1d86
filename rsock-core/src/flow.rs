//! Credit-based flow control (request-N accounting).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Per-stream, per-direction credit window.
///
/// The receiver grants credit with request-N frames; the emitter consumes
/// one unit per item. The window accumulates in 64 bits and is clamped to
/// `i32::MAX`, so repeated large grants saturate instead of wrapping, and it
/// never goes negative. `i32::MAX` outstanding credit is effectively
/// unbounded.
pub struct FlowController {
    window: Mutex<i64>,
    closed: AtomicBool,
    notify: Notify,
}

const WINDOW_MAX: i64 = i32::MAX as i64;

impl FlowController {
    /// Creates a controller with an empty window.
    pub fn new() -> Self {
        Self::with_initial(0)
    }

    /// Creates a controller seeded from a request frame's initial request-N.
    pub fn with_initial(initial: u32) -> Self {
        Self {
            window: Mutex::new(i64::from(initial).min(WINDOW_MAX)),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Resets the window from an initial request-N field.
    pub fn initial(&self, n: u32) {
        *self.window.lock() = i64::from(n).min(WINDOW_MAX);
        self.notify.notify_waiters();
    }

    /// Adds credit, saturating at `i32::MAX`.
    pub fn grant(&self, n: u32) {
        {
            let mut window = self.window.lock();
            *window = (*window + i64::from(n)).min(WINDOW_MAX);
        }
        self.notify.notify_waiters();
    }

    /// Takes up to `n` units of credit; returns how many were taken.
    pub fn consume(&self, n: u32) -> u32 {
        let mut window = self.window.lock();
        let allowed = (*window).min(i64::from(n)).max(0) as u32;
        *window -= i64::from(allowed);
        allowed
    }

    /// Currently available credit.
    pub fn available(&self) -> i32 {
        (*self.window.lock()).clamp(0, WINDOW_MAX) as i32
    }

    /// Waits until one unit of credit is available and consumes it.
    ///
    /// Returns `false` if the controller was closed (stream canceled or
    /// errored) before credit arrived; no credit is consumed in that case.
    pub async fn claim(&self) -> bool {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            if self.consume(1) == 1 {
                return true;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so a grant between the check and
            // the await cannot be missed.
            notified.as_mut().enable();
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            if self.consume(1) == 1 {
                return true;
            }
            notified.await;
        }
    }

    /// Closes the controller; waiters wake and fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_grant_consume() {
        let flow = FlowController::new();
        assert_eq!(flow.available(), 0);
        flow.grant(3);
        assert_eq!(flow.available(), 3);
        assert_eq!(flow.consume(2), 2);
        assert_eq!(flow.consume(5), 1);
        assert_eq!(flow.consume(1), 0);
        assert_eq!(flow.available(), 0);
    }

    #[test]
    fn test_window_saturates_without_overflow() {
        let flow = FlowController::new();
        let chunk = (i32::MAX / 3) as u32;
        for _ in 0..4 {
            flow.grant(chunk);
        }
        assert_eq!(flow.available(), i32::MAX);

        // Consumption still works after saturation and never goes negative.
        assert_eq!(flow.consume(10), 10);
        assert_eq!(flow.available(), i32::MAX - 10);
        flow.grant(u32::MAX);
        assert_eq!(flow.available(), i32::MAX);
    }

    #[test]
    fn test_initial_window() {
        let flow = FlowController::with_initial(u32::MAX);
        assert_eq!(flow.available(), i32::MAX);

        let flow = FlowController::with_initial(5);
        assert_eq!(flow.available(), 5);
        flow.initial(2);
        assert_eq!(flow.available(), 2);
    }

    #[tokio::test]
    async fn test_claim_consumes_one() {
        let flow = FlowController::with_initial(2);
        assert!(flow.claim().await);
        assert!(flow.claim().await);
        assert_eq!(flow.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_suspends_until_grant() {
        let flow = Arc::new(FlowController::new());
        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.claim().await })
        };

        // No credit: the claim must still be pending.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        flow.grant(1);
        assert!(waiter.await.unwrap());
        assert_eq!(flow.available(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let flow = Arc::new(FlowController::new());
        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.claim().await })
        };
        tokio::task::yield_now().await;
        flow.close();
        assert!(!waiter.await.unwrap());
        assert!(flow.is_closed());
    }

    #[tokio::test]
    async fn test_claim_after_close_fails_fast() {
        let flow = FlowController::with_initial(10);
        flow.close();
        assert!(!flow.claim().await);
        // Credit is untouched by failed claims.
        assert_eq!(flow.available(), 10);
    }
}
