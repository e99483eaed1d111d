//! # Resource Guard
//!
//! Two composable capabilities for operations that may exhaust process
//! resources: bounded retry-with-backoff around file-descriptor exhaustion,
//! and a scoped call-depth (stack) budget raise for invocations known to
//! recurse deeply. The depth raise is a narrow, time-boxed override restored
//! on every exit path, never a global default change.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Implemented by errors the retry wrapper can classify. Only
/// resource-exhaustion signals are retried; everything else propagates on
/// the first attempt.
pub trait ResourceSignal {
    fn is_exhaustion(&self) -> bool;
}

impl ResourceSignal for std::io::Error {
    fn is_exhaustion(&self) -> bool {
        matches!(
            self.raw_os_error(),
            Some(code) if code == libc::EMFILE || code == libc::ENFILE
        )
    }
}

#[derive(Debug, Error)]
pub enum GuardError<E: std::error::Error + 'static> {
    /// All retries spent; carries the last underlying cause.
    #[error("resource exhausted after {attempts} attempts: {source}")]
    ResourceExhausted { attempts: u32, source: E },
    /// The wrapped operation failed with a non-exhaustion error.
    #[error(transparent)]
    Operation(E),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_wait_ms: u64,
    pub backoff_multiplier: f64,
    pub max_wait_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_wait_ms: 500,
            backoff_multiplier: 2.0,
            max_wait_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (zero-based):
    /// `initial_wait * multiplier^attempt`, capped at `max_wait`.
    pub fn wait_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let millis = (self.initial_wait_ms as f64 * factor).round() as u64;
        Duration::from_millis(millis.min(self.max_wait_ms))
    }
}

/// Run `op`, retrying on resource-exhaustion signals.
///
/// On each exhaustion the `release_hint` is invoked (a best-effort chance
/// for the caller to close handles or drop caches) before backing off. The
/// operation runs at most `max_retries + 1` times; once retries are spent
/// the last cause surfaces as [`GuardError::ResourceExhausted`].
pub fn with_retry<T, E, F, H>(
    policy: &RetryPolicy,
    mut release_hint: H,
    mut op: F,
) -> Result<T, GuardError<E>>
where
    E: std::error::Error + ResourceSignal + 'static,
    F: FnMut() -> Result<T, E>,
    H: FnMut(),
{
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_exhaustion() => {
                if attempt >= policy.max_retries {
                    return Err(GuardError::ResourceExhausted {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
                let wait = policy.wait_for(attempt);
                warn!(
                    "resource exhaustion (attempt {}/{}), retrying in {}ms: {err}",
                    attempt + 1,
                    policy.max_retries,
                    wait.as_millis()
                );
                release_hint();
                std::thread::sleep(wait);
                attempt += 1;
            }
            Err(err) => return Err(GuardError::Operation(err)),
        }
    }
}

/// RAII raise of the process stack limit. The prior soft limit is restored
/// on drop, whether the wrapped call succeeded, failed, or was cancelled.
pub struct DepthBudget {
    #[cfg(unix)]
    prior_cur: Option<libc::rlim_t>,
}

impl DepthBudget {
    pub fn raise(budget_mib: u64) -> Self {
        #[cfg(unix)]
        {
            let requested = budget_mib.saturating_mul(1024 * 1024) as libc::rlim_t;
            let prior_cur = unsafe {
                let mut limit = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                if libc::getrlimit(libc::RLIMIT_STACK, &mut limit) != 0 {
                    warn!(
                        "getrlimit failed for stack budget: {}",
                        std::io::Error::last_os_error()
                    );
                    None
                } else if requested <= limit.rlim_cur {
                    // Current budget already covers the request.
                    None
                } else {
                    let new_cur = requested.min(limit.rlim_max);
                    if new_cur > limit.rlim_cur {
                        let raised = libc::rlimit {
                            rlim_cur: new_cur,
                            rlim_max: limit.rlim_max,
                        };
                        if libc::setrlimit(libc::RLIMIT_STACK, &raised) != 0 {
                            warn!(
                                "setrlimit failed for stack budget: {}",
                                std::io::Error::last_os_error()
                            );
                            None
                        } else {
                            debug!("raised stack limit {} -> {}", limit.rlim_cur, new_cur);
                            Some(limit.rlim_cur)
                        }
                    } else {
                        None
                    }
                }
            };
            Self { prior_cur }
        }
        #[cfg(not(unix))]
        {
            let _ = budget_mib;
            warn!("stack budget raise is only supported on Unix platforms");
            Self {}
        }
    }
}

impl Drop for DepthBudget {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(prior) = self.prior_cur {
            unsafe {
                let mut limit = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                if libc::getrlimit(libc::RLIMIT_STACK, &mut limit) == 0 {
                    limit.rlim_cur = prior;
                    if libc::setrlimit(libc::RLIMIT_STACK, &limit) != 0 {
                        warn!(
                            "failed to restore stack limit: {}",
                            std::io::Error::last_os_error()
                        );
                    } else {
                        debug!("restored stack limit to {prior}");
                    }
                }
            }
        }
    }
}

/// Run `op` under a temporarily raised stack budget.
pub fn with_depth_budget<T>(budget_mib: u64, op: impl FnOnce() -> T) -> T {
    let _guard = DepthBudget::raise(budget_mib);
    op()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_wait_ms: 1,
            backoff_multiplier: 2.0,
            max_wait_ms: 4,
        }
    }

    fn emfile() -> io::Error {
        io::Error::from_raw_os_error(libc::EMFILE)
    }

    #[test]
    fn retries_exactly_max_retries_times() {
        let calls = Cell::new(0u32);
        let hints = Cell::new(0u32);
        let result: Result<(), _> = with_retry(
            &fast_policy(3),
            || hints.set(hints.get() + 1),
            || {
                calls.set(calls.get() + 1);
                Err(emfile())
            },
        );
        assert_eq!(calls.get(), 4, "initial call plus three retries");
        assert_eq!(hints.get(), 3, "release hint fires once per retry");
        match result {
            Err(GuardError::ResourceExhausted { attempts, source }) => {
                assert_eq!(attempts, 4);
                assert!(source.is_exhaustion());
            }
            other => panic!("expected ResourceExhausted, got {other:?}"),
        }
    }

    #[test]
    fn succeeds_after_transient_exhaustion() {
        let calls = Cell::new(0u32);
        let result = with_retry(
            &fast_policy(3),
            || {},
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(emfile())
                } else {
                    Ok(42)
                }
            },
        );
        assert_eq!(result.expect("value"), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn non_exhaustion_errors_are_not_retried() {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = with_retry(
            &fast_policy(3),
            || {},
            || {
                calls.set(calls.get() + 1);
                Err(io::Error::new(io::ErrorKind::NotFound, "missing"))
            },
        );
        assert_eq!(calls.get(), 1);
        assert!(matches!(result, Err(GuardError::Operation(_))));
    }

    #[test]
    fn backoff_waits_are_capped_at_max_wait() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_wait_ms: 100,
            backoff_multiplier: 3.0,
            max_wait_ms: 500,
        };
        assert_eq!(policy.wait_for(0), Duration::from_millis(100));
        assert_eq!(policy.wait_for(1), Duration::from_millis(300));
        assert_eq!(policy.wait_for(2), Duration::from_millis(500));
        assert_eq!(policy.wait_for(9), Duration::from_millis(500));
    }

    #[test]
    fn depth_budget_restores_on_all_exit_paths() {
        #[cfg(unix)]
        {
            let before = unsafe {
                let mut limit = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                assert_eq!(libc::getrlimit(libc::RLIMIT_STACK, &mut limit), 0);
                limit.rlim_cur
            };

            with_depth_budget(1024, || {});
            let caught = std::panic::catch_unwind(|| {
                with_depth_budget(1024, || panic!("boom"));
            });
            assert!(caught.is_err());

            let after = unsafe {
                let mut limit = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                assert_eq!(libc::getrlimit(libc::RLIMIT_STACK, &mut limit), 0);
                limit.rlim_cur
            };
            assert_eq!(before, after);
        }
    }
}
