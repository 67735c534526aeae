//! Bounded exponential backoff for calls against the shared store.

use std::time::Duration;

use crate::error::Result;

/// Attempts made before a transient error is surfaced.
pub const MAX_ATTEMPTS: u32 = 3;

const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Run `f`, retrying transient failures with 50ms, 100ms, ... between
/// attempts. Non-transient errors are returned immediately.
pub fn with_backoff<T>(what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    let mut backoff = BACKOFF_BASE;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                tracing::debug!(what, attempt, error = %e, "transient failure, backing off");
                std::thread::sleep(backoff);
                attempt += 1;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MatchdayError;
    use std::cell::Cell;

    #[test]
    fn recovers_after_transient_failures() {
        let calls = Cell::new(0);
        let v = with_backoff("llen", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(MatchdayError::TransientBackend("timeout".into()))
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(v, 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let r: Result<()> = with_backoff("llen", || {
            calls.set(calls.get() + 1);
            Err(MatchdayError::TransientBackend("timeout".into()))
        });
        assert!(r.is_err());
        assert_eq!(calls.get(), MAX_ATTEMPTS);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let r: Result<()> = with_backoff("get", || {
            calls.set(calls.get() + 1);
            Err(MatchdayError::WrongType("k".into()))
        });
        assert!(r.is_err());
        assert_eq!(calls.get(), 1);
    }
}
