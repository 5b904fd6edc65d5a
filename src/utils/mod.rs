//! Small helpers shared by the long-running loops.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::constants::defaults::STOP_POLL_INTERVAL_MS;

/// Sleep for `duration` unless `stop_flag` is raised first.
///
/// Wakes on `notify` or at least every [`STOP_POLL_INTERVAL_MS`] to re-check
/// the flag. Returns `true` when the sleep ended because of a stop request.
pub async fn sleep_unless_stopped(duration: Duration, stop_flag: &AtomicBool, notify: &Notify) -> bool {
    let deadline = Instant::now() + duration;
    let poll = Duration::from_millis(STOP_POLL_INTERVAL_MS);

    loop {
        if stop_flag.load(Ordering::Acquire) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let slice = (deadline - now).min(poll);
        tokio::select! {
            _ = tokio::time::sleep(slice) => {}
            _ = notify.notified() => {}
        }
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sleep_runs_to_completion_without_stop() {
        let flag = AtomicBool::new(false);
        let notify = Notify::new();
        let stopped = sleep_unless_stopped(Duration::from_millis(20), &flag, &notify).await;
        assert!(!stopped);
    }

    #[tokio::test]
    async fn test_sleep_returns_early_when_stopped() {
        let flag = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let waiter = {
            let flag = flag.clone();
            let notify = notify.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let stopped = sleep_unless_stopped(Duration::from_secs(30), &flag, &notify).await;
                (stopped, started.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        flag.store(true, Ordering::Release);
        notify.notify_waiters();

        let (stopped, elapsed) = waiter.await.unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_panic_message_extracts_strings() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
