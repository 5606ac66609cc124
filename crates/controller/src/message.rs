//! Sync for the `Message` resource: deliver the note once, then record `sent`.

use std::sync::Arc;

use async_trait::async_trait;
use herald_core::{Message, ObjectKey, ResourceStore};
use tracing::{debug, info};

use crate::reconcile::{Reconcile, SyncError};

#[derive(Debug, thiserror::Error)]
#[error("delivering {key} failed: {reason}")]
pub struct NotifyError {
    pub key: ObjectKey,
    pub reason: String,
}

impl From<NotifyError> for SyncError {
    fn from(e: NotifyError) -> Self {
        SyncError::Action(e.to_string())
    }
}

/// Where message notes go.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, key: &ObjectKey, note: &str) -> Result<(), NotifyError>;
}

/// Writes the note to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, key: &ObjectKey, note: &str) -> Result<(), NotifyError> {
        info!(key = %key, note = %note, "sent message");
        Ok(())
    }
}

/// Delivery is at-least-once: if the status write fails the note may be
/// delivered again on the retry.
pub struct MessageSync {
    store: Arc<dyn ResourceStore<Message>>,
    notifier: Arc<dyn Notifier>,
}

impl MessageSync {
    pub fn new(store: Arc<dyn ResourceStore<Message>>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }
}

#[async_trait]
impl Reconcile<Message> for MessageSync {
    async fn sync(&self, msg: Arc<Message>) -> Result<(), SyncError> {
        let key = ObjectKey::new(msg.metadata.namespace.clone(), msg.metadata.name.clone());
        if msg.status.sent {
            debug!(key = %key, "already sent; skipping");
            return Ok(());
        }

        self.notifier.deliver(&key, &msg.note()).await?;

        let mut next = (*msg).clone();
        next.status.sent = true;
        self.store.update_status(&next).await?;
        info!(key = %key, "saved status sent=true");
        Ok(())
    }
}
