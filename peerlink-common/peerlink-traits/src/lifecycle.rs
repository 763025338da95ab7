use async_trait::async_trait;
use std::error::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded { reason: String },
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Start/stop control for long-running components.
///
/// Components are shared behind `Arc`, so every method takes `&self` and the
/// implementor keeps its running flag internally.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn start(&self) -> Result<(), Box<dyn Error + Send + Sync>>;
    async fn stop(&self) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn shutdown(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.stop().await
    }

    fn is_running(&self) -> bool;
    async fn health_check(&self) -> HealthStatus;
}

pub trait Named {
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Toggle {
        running: AtomicBool,
    }

    #[async_trait]
    impl Lifecycle for Toggle {
        async fn start(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn health_check(&self) -> HealthStatus {
            if self.is_running() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy { reason: "Not running".to_string() }
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_defaults_to_stop() {
        let toggle = Toggle { running: AtomicBool::new(false) };
        toggle.start().await.unwrap();
        assert!(toggle.health_check().await.is_healthy());
        toggle.shutdown().await.unwrap();
        assert!(!toggle.is_running());
    }
}
