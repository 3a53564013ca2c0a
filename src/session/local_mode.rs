use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;

#[derive(Default)]
struct Inner {
    enabled: bool,
    generation: u64,
}

/// Operator override that suppresses remote commands for a bounded time.
/// A timer task clears it on expiry.
#[derive(Clone, Default)]
pub struct LocalMode {
    inner: Arc<Mutex<Inner>>,
}

impl LocalMode {
    /// Whether local mode is on.
    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Turn local mode on for `duration`. Re-enabling restarts the timer.
    pub fn enable(&self, duration: Duration) {
        let generation = {
            let mut inner = self.inner.lock();
            inner.enabled = true;
            inner.generation += 1;
            inner.generation
        };
        tracing::info!(duration = format!("{:?}", duration), "local mode enabled");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let mut inner = inner.lock();
            if inner.generation == generation && inner.enabled {
                inner.enabled = false;
                tracing::info!("local mode expired");
            }
        });
    }

    /// Turn local mode off now.
    pub fn disable(&self) {
        let mut inner = self.inner.lock();
        inner.enabled = false;
        inner.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_expires() {
        let local_mode = LocalMode::default();
        local_mode.enable(Duration::from_millis(20));
        assert!(local_mode.is_enabled());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!local_mode.is_enabled());
    }

    #[tokio::test]
    async fn test_reenable_restarts_timer() {
        let local_mode = LocalMode::default();
        local_mode.enable(Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(15)).await;
        local_mode.enable(Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(local_mode.is_enabled());
        local_mode.disable();
        assert!(!local_mode.is_enabled());
    }
}
