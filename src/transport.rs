use futures::future::BoxFuture;

use crate::error::TransportError;
use crate::messages::Notification;

/// Push delivery collaborator. The returned future resolves when the
/// delivery outcome is known; callers do not wait on it inline.
pub trait Transport: Send + Sync {
    fn send(&self, notification: Notification) -> BoxFuture<'static, Result<(), TransportError>>;
}
