//! One-shot readiness signal with any number of waiters

use std::sync::Arc;
use tokio::sync::watch;

/// Fired once after the first start pass; never reset.
#[derive(Debug, Clone)]
pub struct Readiness {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark ready; later calls are no-ops
    pub fn fire(&self) {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until ready, returns immediately when already fired
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_multiple_waiters() {
        let readiness = Readiness::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let r = readiness.clone();
                tokio::spawn(async move { r.wait().await })
            })
            .collect();

        assert!(!readiness.is_ready());
        readiness.fire();
        readiness.fire();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn test_wait_after_fire() {
        let readiness = Readiness::new();
        readiness.fire();
        tokio::time::timeout(Duration::from_millis(100), readiness.wait())
            .await
            .unwrap();
    }
}
