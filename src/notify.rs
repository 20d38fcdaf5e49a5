//! Delivery of price alerts to users.

use async_trait::async_trait;
use tracing::info;

use crate::error::NotifyError;

/// Fire-and-forget message to a user. Callers log failures and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user: &str, message: &str) -> Result<(), NotifyError>;
}

/// Writes alerts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user: &str, message: &str) -> Result<(), NotifyError> {
        info!(user = %user, alert = %message, "Price alert");
        Ok(())
    }
}
