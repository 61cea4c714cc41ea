//! Cancellation signalling.
//!
//! Cancellation is a `watch` channel carrying `true` once shutdown has been
//! requested. Receivers are cheap to clone and can be awaited repeatedly.

use tokio::sync::watch;

/// Create a cancellation channel in the running state.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Wait until cancellation is requested.
///
/// Never completes if the sender is dropped without requesting it.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Whether cancellation has already been requested.
pub fn is_cancelled(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}
