// src/db/backoff.rs
//! Retry schedule shared by connection setup and the batch writer.

use std::{thread::sleep, time::Duration};
use crate::config::RetryConfig;

/// `attempt` n (1-based) waits `base_delay * factor^(n-1)`, capped at `max_delay`.
/// A factor of 1.0 gives a fixed delay.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay:   Duration,
    pub factor:       f64,
    pub max_delay:    Option<Duration>,
}

/// Why [`Backoff::retry`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed transiently; carries the last error.
    Exhausted { attempts: u32, last: E },
    /// A non-transient error, returned without further attempts.
    Permanent(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent(e) => e,
        }
    }
}

impl Backoff {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, base_delay: delay, factor: 1.0, max_delay: None }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, factor: f64) -> Self {
        Self { max_attempts, base_delay, factor, max_delay: None }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exp);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Whether a failed `attempt` (1-based) will be followed by another.
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts.
    /// `op` receives the 1-based attempt number.
    pub fn retry<T, E, F, P>(&self, mut op: F, is_transient: P) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if !is_transient(&e) => return Err(RetryError::Permanent(e)),
                Err(e) if !self.has_next(attempt) => {
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }
                Err(_) => sleep(self.delay(attempt)),
            }
        }
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base_delay:   cfg.base_delay,
            factor:       cfg.factor,
            max_delay:    cfg.max_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delays_double() {
        let b = Backoff::exponential(5, Duration::from_millis(100), 2.0);
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn fixed_delay_never_grows() {
        let b = Backoff::fixed(5, Duration::from_secs(1));
        assert_eq!(b.delay(1), b.delay(5));
    }

    #[test]
    fn max_delay_caps_growth() {
        let b = Backoff {
            max_delay: Some(Duration::from_millis(300)),
            ..Backoff::exponential(10, Duration::from_millis(100), 2.0)
        };
        assert_eq!(b.delay(3), Duration::from_millis(300));
        assert_eq!(b.delay(9), Duration::from_millis(300));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let b = Backoff::fixed(5, Duration::ZERO);
        let out: Result<u32, RetryError<&str>> =
            b.retry(|n| if n < 3 { Err("busy") } else { Ok(n) }, |_| true);
        assert_eq!(out.unwrap(), 3);
    }

    #[test]
    fn permanent_error_stops_immediately() {
        let b = Backoff::fixed(5, Duration::ZERO);
        let mut calls = 0;
        let out: Result<(), _> = b.retry(
            |_| {
                calls += 1;
                Err("corrupt")
            },
            |e| *e == "busy",
        );
        assert!(matches!(out, Err(RetryError::Permanent("corrupt"))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn last_attempt_has_no_successor() {
        let b = Backoff::fixed(3, Duration::ZERO);
        assert!(b.has_next(1));
        assert!(b.has_next(2));
        assert!(!b.has_next(3));

        // Zero attempts still runs once and never schedules a retry.
        assert!(!Backoff::fixed(0, Duration::ZERO).has_next(1));
    }

    #[test]
    fn exhaustion_reports_attempts() {
        let b = Backoff::fixed(4, Duration::ZERO);
        let out: Result<(), _> = b.retry(|_| Err("busy"), |_| true);
        match out {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last, "busy");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
