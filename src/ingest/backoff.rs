//! Reconnect policy for the input channel receivers.
//!
//! Transport failures never reach the pipeline thread. A receiver loop that
//! loses its connection sleeps according to [`BackoffPolicy`] and tries again
//! until it is told to stop or runs out of attempts.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{IngestError, IngestResult};

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for doubling).
    pub backoff_multiplier: f64,
    /// Maximum number of reconnect attempts (0 = unlimited).
    pub max_attempts: u32,
    /// Whether to add up to 25% jitter to delays.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: 0, // Unlimited
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay for a given attempt number (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            capped_delay * (1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }

    /// Check if another reconnect attempt should be made.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

/// Drive `session` until `stop` is raised, retrying transport failures with
/// backoff.
///
/// `session` sets its `connected` argument once the peer accepted it. A
/// stream that ends while `stop` is clear counts as a transport failure, so
/// the receiver reconnects. The attempt counter restarts after every session
/// that connected. Non-transport errors end the loop and are returned to the
/// receiver thread's owner.
pub fn run_with_reconnect<F>(
    channel: &str,
    policy: &BackoffPolicy,
    stop: &AtomicBool,
    mut session: F,
) -> IngestResult<()>
where
    F: FnMut(&mut bool) -> IngestResult<()>,
{
    let mut attempt = 0u32;
    while !stop.load(Ordering::Relaxed) {
        let mut connected = false;
        let result = match session(&mut connected) {
            Ok(()) if stop.load(Ordering::Relaxed) => break,
            Ok(()) => {
                info!(channel, "Stream closed by peer");
                Err(IngestError::Transport(format!("{}: stream closed by peer", channel)))
            }
            Err(err) => Err(err),
        };
        if connected {
            attempt = 0;
        }
        match result {
            Err(err @ (IngestError::Transport(_) | IngestError::Io(_))) => {
                attempt += 1;
                if !policy.should_retry(attempt) {
                    warn!(channel, attempt, error = %err, "Giving up after repeated transport failures");
                    return Err(IngestError::Transport(format!(
                        "{}: {} attempts failed, last error: {}",
                        channel, attempt, err
                    )));
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(channel, attempt, ?delay, error = %err, "Transport failure, reconnecting");
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
            Ok(()) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            max_attempts: 0,
            jitter: false,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(4));
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let policy = BackoffPolicy {
            jitter: true,
            ..no_jitter()
        };
        for _ in 0..20 {
            let d = policy.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(1) && d <= Duration::from_micros(1250));
        }
    }

    #[test]
    fn transport_errors_are_retried_until_stopped() {
        let stop = AtomicBool::new(false);
        let mut calls = 0;
        let result = run_with_reconnect("test", &no_jitter(), &stop, |_| {
            calls += 1;
            if calls < 3 {
                Err(IngestError::Transport("refused".into()))
            } else {
                stop.store(true, Ordering::Relaxed);
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn closed_stream_reconnects() {
        let stop = AtomicBool::new(false);
        let mut calls = 0;
        let result = run_with_reconnect("test", &no_jitter(), &stop, |connected| {
            calls += 1;
            *connected = true;
            if calls == 3 {
                stop.store(true, Ordering::Relaxed);
            }
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn attempts_are_bounded() {
        let stop = AtomicBool::new(false);
        let policy = BackoffPolicy {
            max_attempts: 2,
            ..no_jitter()
        };
        let result = run_with_reconnect("test", &policy, &stop, |_| {
            Err(IngestError::Transport("refused".into()))
        });
        assert!(matches!(result, Err(IngestError::Transport(_))));
    }

    #[test]
    fn connected_sessions_reset_the_attempt_count() {
        let stop = AtomicBool::new(false);
        let policy = BackoffPolicy {
            max_attempts: 2,
            ..no_jitter()
        };
        let mut calls = 0;
        let result = run_with_reconnect("test", &policy, &stop, |connected| {
            calls += 1;
            if calls == 6 {
                stop.store(true, Ordering::Relaxed);
                return Ok(());
            }
            // Every session connects, then drops.
            *connected = true;
            Err(IngestError::Transport("reset by peer".into()))
        });
        assert!(result.is_ok());
        assert_eq!(calls, 6);
    }

    #[test]
    fn fatal_errors_stop_the_loop() {
        let stop = AtomicBool::new(false);
        let result = run_with_reconnect("test", &no_jitter(), &stop, |_| {
            Err(IngestError::Codec("garbage".into()))
        });
        assert!(matches!(result, Err(IngestError::Codec(_))));
    }
}
