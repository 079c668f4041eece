//! Retry delay policy
//!
//! Decides how long a requeued job waits before it becomes claimable again.

use chrono::Duration;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid retry policy '{0}', expected immediate, fixed:<secs> or exponential:<base_secs>:<max_secs>")]
pub struct ParseRetryPolicyError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Claimable again on the next poll
    Immediate,
    Fixed(Duration),
    /// `base * 2^(n-1)` after the n-th failure, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl RetryPolicy {
    /// Delay before the retry that follows failure number `failures`
    pub fn delay(&self, failures: i32) -> Duration {
        match *self {
            RetryPolicy::Immediate => Duration::zero(),
            RetryPolicy::Fixed(delay) => delay,
            RetryPolicy::Exponential { base, max } => {
                let exponent = failures.saturating_sub(1).clamp(0, 30) as u32;
                base.checked_mul(2_i32.pow(exponent))
                    .map_or(max, |delay| delay.min(max))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            base: Duration::seconds(30),
            max: Duration::minutes(30),
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Immediate => write!(f, "immediate"),
            RetryPolicy::Fixed(delay) => write!(f, "fixed:{}", delay.num_seconds()),
            RetryPolicy::Exponential { base, max } => {
                write!(f, "exponential:{}:{}", base.num_seconds(), max.num_seconds())
            }
        }
    }
}

impl FromStr for RetryPolicy {
    type Err = ParseRetryPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseRetryPolicyError(s.to_string());
        let seconds = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map(|secs| Duration::seconds(secs.into()))
                .map_err(|_| invalid())
        };

        let parts: Vec<&str> = s.trim().split(':').collect();
        match parts.as_slice() {
            [name] if name.eq_ignore_ascii_case("immediate") => Ok(RetryPolicy::Immediate),
            [name, delay] if name.eq_ignore_ascii_case("fixed") => {
                Ok(RetryPolicy::Fixed(seconds(delay)?))
            }
            [name, base, max] if name.eq_ignore_ascii_case("exponential") => {
                let (base, max) = (seconds(base)?, seconds(max)?);
                if base > max {
                    return Err(invalid());
                }
                Ok(RetryPolicy::Exponential { base, max })
            }
            _ => Err(invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("immediate".parse::<RetryPolicy>().unwrap(), RetryPolicy::Immediate);
        assert_eq!(
            "fixed:45".parse::<RetryPolicy>().unwrap(),
            RetryPolicy::Fixed(Duration::seconds(45))
        );
        assert_eq!(
            "Exponential:10:600".parse::<RetryPolicy>().unwrap(),
            RetryPolicy::Exponential {
                base: Duration::seconds(10),
                max: Duration::seconds(600),
            }
        );

        for bad in ["", "fixed", "fixed:-1", "exponential:60:10", "linear:5", "fixed:1:2"] {
            assert!(bad.parse::<RetryPolicy>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.to_string().parse::<RetryPolicy>().unwrap(), policy);
    }

    #[test]
    fn test_exponential_delay_doubles_up_to_cap() {
        let policy = RetryPolicy::Exponential {
            base: Duration::seconds(10),
            max: Duration::seconds(60),
        };
        assert_eq!(policy.delay(1), Duration::seconds(10));
        assert_eq!(policy.delay(2), Duration::seconds(20));
        assert_eq!(policy.delay(3), Duration::seconds(40));
        assert_eq!(policy.delay(4), Duration::seconds(60));
        assert_eq!(policy.delay(40), Duration::seconds(60));
    }

    #[test]
    fn test_immediate_and_fixed() {
        assert_eq!(RetryPolicy::Immediate.delay(3), Duration::zero());
        assert_eq!(
            RetryPolicy::Fixed(Duration::seconds(5)).delay(9),
            Duration::seconds(5)
        );
    }
}
