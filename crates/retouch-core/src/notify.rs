//! Notifier trait.

use async_trait::async_trait;

/// Best-effort delivery of a text message to the requesting user.
///
/// Implementations must swallow their own failures: a notification
/// failure never affects the outcome of the request that triggered it.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `message` to `user_ref`. Returns whether delivery was
    /// accepted; callers only log the result.
    async fn notify(&self, user_ref: &str, message: &str) -> bool;
}

/// Notifier that drops every message. Used when no channel is
/// configured and in tests.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _user_ref: &str, _message: &str) -> bool {
        true
    }
}
