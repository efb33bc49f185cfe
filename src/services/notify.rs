//! Delivery of user-facing messages such as recall results.

use async_trait::async_trait;
use std::io;

use super::Actor;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &Actor, subject: &str, body: &str) -> io::Result<()>;
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipient: &Actor, subject: &str, body: &str) -> io::Result<()> {
        tracing::info!(
            actor = %recipient.id,
            email = recipient.email.as_deref().unwrap_or("-"),
            subject,
            body,
            "notification"
        );
        Ok(())
    }
}
