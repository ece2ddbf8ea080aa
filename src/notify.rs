use async_trait::async_trait;
use serde_json::Value;

/// Fire-and-forget operator notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str, context: Value) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str, context: Value) -> anyhow::Result<()> {
        tracing::warn!(context = %context, "{message}");
        Ok(())
    }
}

/// Deliver a notification; a failing notifier is logged and otherwise ignored.
pub async fn notify_quietly(notifier: &dyn Notifier, message: &str, context: Value) {
    if let Err(e) = notifier.notify(message, context).await {
        tracing::debug!(error = %e, "notification delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _message: &str, _context: Value) -> anyhow::Result<()> {
            anyhow::bail!("webhook offline")
        }
    }

    #[tokio::test]
    async fn failing_notifier_is_swallowed() {
        notify_quietly(&FailingNotifier, "drift", json!({ "external_id": "c-1" })).await;
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        assert!(LogNotifier.notify("drift", json!({})).await.is_ok());
    }
}
