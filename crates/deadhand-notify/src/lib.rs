//! Deadhand Notification Service
//!
//! Fire-and-forget delivery of reminders and confirmation requests.
//!
//! Transports (SMTP, SMS gateways, Nostr relays) live outside this crate
//! behind the `Notifier` trait. `NotificationService` routes a message to the
//! notifier registered for each channel and logs failures; a failed
//! delivery never fails the operation that triggered it.
//!
//! Each send runs on a worker thread and is abandoned once its timeout
//! passes, so a transport that hangs costs the caller at most that long.
//!
//! # Example
//!
//! ```
//! use deadhand_core::ChannelKind;
//! use deadhand_notify::{templates, LogNotifier, NotificationService};
//! use std::sync::Arc;
//!
//! let service = NotificationService::new()
//!     .with_notifier(ChannelKind::Email, Arc::new(LogNotifier));
//!
//! let msg = templates::confirmation_request("alice", "case-1", "email", 72);
//! let report = service.dispatch(&[ChannelKind::Email, ChannelKind::Sms], &msg);
//! assert_eq!(report.sent, vec![ChannelKind::Email]);
//! assert_eq!(report.failed.len(), 1); // no SMS notifier registered
//! ```

pub mod templates;

pub use templates::{NotificationLevel, NotificationMessage};

use deadhand_core::{BoundedCallError, CallBudget, ChannelKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Default upper bound on a single send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from notification delivery
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Delivery via {channel} failed: {reason}")]
    DeliveryFailed { channel: ChannelKind, reason: String },

    #[error("No notifier configured for {0}")]
    NoNotifier(ChannelKind),

    #[error("Delivery via {channel} gave no answer within {timeout:?}")]
    TimedOut { channel: ChannelKind, timeout: Duration },
}

/// A transport for one channel kind.
pub trait Notifier: Send + Sync {
    fn send(&self, channel: ChannelKind, message: &NotificationMessage) -> Result<(), NotifyError>;
}

/// Outcome of a dispatch, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: Vec<ChannelKind>,
    pub failed: Vec<(ChannelKind, NotifyError)>,
}

/// Routes messages to per-channel notifiers.
#[derive(Clone)]
pub struct NotificationService {
    notifiers: HashMap<ChannelKind, Arc<dyn Notifier>>,
    send_timeout: Duration,
    workers: CallBudget,
}

impl Default for NotificationService {
    fn default() -> Self {
        Self {
            notifiers: HashMap::new(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            workers: CallBudget::default(),
        }
    }
}

impl NotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifier(mut self, channel: ChannelKind, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.insert(channel, notifier);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Sends given up on whose transports have not returned yet.
    pub fn hung_sends(&self) -> usize {
        self.workers.abandoned()
    }

    /// Send `message` on every listed channel. Never fails; see the report.
    pub fn dispatch(&self, channels: &[ChannelKind], message: &NotificationMessage) -> DispatchReport {
        self.dispatch_within(channels, message, self.send_timeout)
    }

    /// Like [`dispatch`](Self::dispatch), waiting at most `timeout` per channel.
    pub fn dispatch_within(
        &self,
        channels: &[ChannelKind],
        message: &NotificationMessage,
        timeout: Duration,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();

        for &channel in channels {
            let result = match self.notifiers.get(&channel) {
                Some(notifier) => self.send_one(notifier.clone(), channel, message, timeout),
                None => Err(NotifyError::NoNotifier(channel)),
            };
            match result {
                Ok(()) => {
                    log::info!("Notification sent via {} ({:?})", channel, message.level);
                    report.sent.push(channel);
                }
                Err(e) => {
                    log::error!("Notification via {} failed: {}", channel, e);
                    report.failed.push((channel, e));
                }
            }
        }

        report
    }

    fn send_one(
        &self,
        notifier: Arc<dyn Notifier>,
        channel: ChannelKind,
        message: &NotificationMessage,
        timeout: Duration,
    ) -> Result<(), NotifyError> {
        let message = message.clone();
        let name = format!("notify-{}", channel);
        match self
            .workers
            .call(&name, timeout, move || notifier.send(channel, &message))
        {
            Ok(result) => result,
            Err(BoundedCallError::TimedOut(timeout)) => Err(NotifyError::TimedOut { channel, timeout }),
            Err(e) => Err(NotifyError::DeliveryFailed {
                channel,
                reason: e.to_string(),
            }),
        }
    }
}

/// Writes messages to the log. Stand-in transport for headless deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, channel: ChannelKind, message: &NotificationMessage) -> Result<(), NotifyError> {
        log::info!("[{}] {}", channel, message.subject);
        log::debug!("[{}] {}", channel, message.body);
        Ok(())
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(ChannelKind, NotificationMessage)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(ChannelKind, NotificationMessage)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Notifier for MemoryNotifier {
    fn send(&self, channel: ChannelKind, message: &NotificationMessage) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((channel, message.clone()));
        Ok(())
    }
}
