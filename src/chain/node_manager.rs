//! Rotates between configured chain node endpoints on repeated transient
//! failures, generalizing the exponential-backoff retry loop the teacher
//! used for a single fixed endpoint.

use std::time::Duration;

use log::warn;

use crate::core::errors::CoreError;

/// Endpoint pool with exponential backoff and round-robin failover.
pub struct NodeManager {
    endpoints: Vec<String>,
    current: usize,
    max_retries: u32,
    retry_base_delay_ms: u64,
}

impl NodeManager {
    pub fn new(endpoints: Vec<String>, max_retries: u32, retry_base_delay_ms: u64) -> Self {
        assert!(!endpoints.is_empty(), "node manager needs at least one endpoint");
        Self {
            endpoints,
            current: 0,
            max_retries,
            retry_base_delay_ms,
        }
    }

    pub fn current_endpoint(&self) -> String {
        self.endpoints[self.current].clone()
    }

    fn rotate(&mut self) {
        self.current = (self.current + 1) % self.endpoints.len();
    }

    /// Runs `operation` against the current endpoint, retrying with
    /// exponential backoff on `ChainTransient`, rotating to the next
    /// endpoint after each failed attempt so a single dead node can't
    /// stall every call.
    pub async fn with_retry<T, F, Fut>(&mut self, operation: F) -> Result<T, CoreError>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        let mut attempts = 0;
        let mut last_error = CoreError::ChainTransient("unknown error".into());

        while attempts < self.max_retries {
            match operation(self.current_endpoint()).await {
                Ok(result) => return Ok(result),
                Err(CoreError::ChainTransient(reason)) => {
                    attempts += 1;
                    last_error = CoreError::ChainTransient(reason.clone());
                    if attempts < self.max_retries {
                        let delay = self.retry_base_delay_ms * 2u64.pow(attempts - 1);
                        warn!(
                            "chain call failed on {} (attempt {}/{}): {}; rotating and retrying in {}ms",
                            self.current_endpoint(),
                            attempts,
                            self.max_retries,
                            reason,
                            delay
                        );
                        self.rotate();
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn rotates_endpoint_on_each_transient_failure() {
        let mut manager = NodeManager::new(
            vec!["a".into(), "b".into(), "c".into()],
            3,
            1,
        );
        let calls = AtomicUsize::new(0);
        let seen: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());

        let result = manager
            .with_retry(|endpoint| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(endpoint);
                async move { Err::<(), _>(CoreError::ChainTransient("down".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn non_transient_error_is_not_retried() {
        let mut manager = NodeManager::new(vec!["a".into()], 5, 1);
        let result: Result<(), _> = manager
            .with_retry(|_| async { Err(CoreError::InvalidConfig("bad".into())) })
            .await;
        assert!(matches!(result, Err(CoreError::InvalidConfig(_))));
    }
}
