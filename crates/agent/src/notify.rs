//! Debounced user notifications.
//!
//! Policy bursts (a snapshot re-applying three targets, say) must not
//! spam the logged-in user. The debouncer keeps a single pending message
//! and one timer: the first request inside a quiet period fires
//! immediately, later ones coalesce into whichever message arrived last
//! and fire once the cooldown elapses.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Sink for user-visible messages. Delivery into graphical sessions is
/// handled by the desktop integration outside this crate.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Default sink: structured log only.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        tracing::info!(message, "user notification");
    }
}

pub struct NotifyDebouncer {
    tx: mpsc::Sender<String>,
}

impl NotifyDebouncer {
    pub fn new(cooldown: Duration, notifier: Arc<dyn Notifier>) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(16);
        tokio::spawn(async move {
            let mut last_fired: Option<Instant> = None;
            let mut pending: Option<String> = None;
            loop {
                let deadline = last_fired.map(|fired| fired + cooldown);
                tokio::select! {
                    request = rx.recv() => match request {
                        None => {
                            if let Some(message) = pending.take() {
                                notifier.notify(&message);
                            }
                            break;
                        }
                        Some(message) => {
                            let now = Instant::now();
                            let quiet = last_fired
                                .map_or(true, |fired| now.duration_since(fired) >= cooldown);
                            if quiet && pending.is_none() {
                                notifier.notify(&message);
                                last_fired = Some(now);
                            } else {
                                // Single pending slot: the newest message
                                // wins the coalesce.
                                pending = Some(message);
                            }
                        }
                    },
                    () = sleep_until_opt(deadline), if pending.is_some() => {
                        if let Some(message) = pending.take() {
                            notifier.notify(&message);
                            last_fired = Some(Instant::now());
                        }
                    }
                }
            }
        });
        Self { tx }
    }

    /// Queue a notification; drops silently when the agent is flooding
    /// faster than the debouncer drains, which is the point.
    pub fn request(&self, message: impl Into<String>) {
        let _ = self.tx.try_send(message.into());
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
