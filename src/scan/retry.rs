use std::time::Duration;

use crate::config::ScanConfig;
use crate::jobs::Priority;
use crate::Error;

/// What to do about a failed scan attempt.
#[derive(Debug)]
pub enum Verdict {
    Retry(Duration),
    Fail(Error),
}

/// Tracks failures across the attempts of one scan and decides whether the
/// next one is worth making.
#[derive(Debug)]
pub struct RetryPolicy {
    base_backoff: Duration,
    max_backoff: Duration,
    io_limit: u32,
    corrupt_after: u32,
    resource_limit: u32,
    io_errors: u32,
    resource_retries: u32,
    next_backoff: Duration,
}

impl RetryPolicy {
    /// `resource_retries` bounds retries after running out of memory or
    /// buffer space; the caller picks it, usually zero.
    pub fn new(config: &ScanConfig, priority: Priority, resource_retries: u32) -> Self {
        let io_limit = match priority {
            Priority::Urgent => config.urgent_max_retries.min(config.max_io_retries),
            Priority::Normal => config.max_io_retries,
        };
        Self {
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
            io_limit,
            corrupt_after: config.corrupt_after_io_errors,
            resource_limit: resource_retries,
            io_errors: 0,
            resource_retries: 0,
            next_backoff: config.base_backoff,
        }
    }

    pub fn io_errors(&self) -> u32 {
        self.io_errors
    }

    pub fn classify(&mut self, error: Error) -> Verdict {
        match error {
            e if e.is_corruption() => Verdict::Fail(e),
            e @ (Error::OutOfMemory(_) | Error::BufferTooSmall { .. }) => {
                if self.resource_retries >= self.resource_limit {
                    return Verdict::Fail(e);
                }
                self.resource_retries += 1;
                Verdict::Retry(self.base_backoff)
            }
            e if e.is_transient() => {
                self.io_errors += 1;
                if self.io_errors > self.corrupt_after {
                    return Verdict::Fail(Error::Corrupt(format!(
                        "{} I/O errors reading the same range, last: {}",
                        self.io_errors, e
                    )));
                }
                if self.io_errors > self.io_limit {
                    return Verdict::Fail(e);
                }
                Verdict::Retry(self.backoff())
            }
            e => Verdict::Fail(e),
        }
    }

    fn backoff(&mut self) -> Duration {
        let current = self.next_backoff;
        self.next_backoff = (current * 2).min(self.max_backoff);
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn io_error() -> Error {
        Error::ReadError("test", io::Error::new(io::ErrorKind::Other, "flaky"))
    }

    fn backoff_of(verdict: Verdict) -> Duration {
        match verdict {
            Verdict::Retry(d) => d,
            Verdict::Fail(e) => panic!("expected a retry, got {}", e),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = ScanConfig::default().corrupt_after_io_errors(100);
        let mut policy = RetryPolicy::new(&config, Priority::Normal, 0);
        let delays: Vec<u64> = (0..10)
            .map(|_| backoff_of(policy.classify(io_error())).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 320, 640, 1280, 2000, 2000]);
    }

    #[test]
    fn test_repeated_io_errors_become_corruption() {
        let mut policy = RetryPolicy::new(&ScanConfig::default(), Priority::Normal, 0);
        for _ in 0..10 {
            assert!(matches!(policy.classify(io_error()), Verdict::Retry(_)));
        }
        assert!(matches!(policy.classify(io_error()), Verdict::Fail(Error::Corrupt(_))));
        assert_eq!(policy.io_errors(), 11);
    }

    #[test]
    fn test_urgent_scans_retry_little() {
        let mut policy = RetryPolicy::new(&ScanConfig::default(), Priority::Urgent, 0);
        assert!(matches!(policy.classify(io_error()), Verdict::Retry(_)));
        assert!(matches!(policy.classify(io_error()), Verdict::Retry(_)));
        assert!(matches!(policy.classify(io_error()), Verdict::Fail(Error::ReadError(..))));
    }

    #[test]
    fn test_corruption_and_misuse_fail_at_once() {
        let mut policy = RetryPolicy::new(&ScanConfig::default(), Priority::Normal, 5);
        assert!(matches!(
            policy.classify(Error::Corrupt("x".to_string())),
            Verdict::Fail(Error::Corrupt(_))
        ));
        assert!(matches!(policy.classify(Error::Cancelled), Verdict::Fail(Error::Cancelled)));
        assert!(matches!(
            policy.classify(Error::PendingUnlink("db0001.dat".into())),
            Verdict::Fail(Error::PendingUnlink(_))
        ));
    }

    #[test]
    fn test_resource_retries_are_caller_bounded() {
        let mut none = RetryPolicy::new(&ScanConfig::default(), Priority::Normal, 0);
        assert!(matches!(none.classify(Error::OutOfMemory(1 << 20)), Verdict::Fail(_)));

        let mut two = RetryPolicy::new(&ScanConfig::default(), Priority::Normal, 2);
        let tight = || Error::BufferTooSmall {
            needed: 10,
            available: 5,
        };
        assert!(matches!(two.classify(tight()), Verdict::Retry(_)));
        assert!(matches!(two.classify(tight()), Verdict::Retry(_)));
        assert!(matches!(two.classify(tight()), Verdict::Fail(_)));
        assert_eq!(two.io_errors(), 0);
    }
}
