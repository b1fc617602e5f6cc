use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, TrySendError};

use crate::{Result, SensorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationCategory {
    FrameCorrupted,
    FramesDropped,
    HardwareError,
    HardwareEvent,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Asynchronous device event.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub category: NotificationCategory,
    pub severity: Severity,
    pub description: String,
    pub timestamp_ms: f64,
}

pub type NotificationsCallback = Arc<dyn Fn(Notification) + Send + Sync>;

enum Message {
    Notify(Notification),
    Stop,
}

/// Delivers notifications on its own thread so a slow consumer never
/// stalls frame delivery.
pub struct NotificationsProcessor {
    sender: Sender<Message>,
    callback: Arc<RwLock<Option<NotificationsCallback>>>,
    thread: Option<JoinHandle<()>>,
}

impl NotificationsProcessor {
    pub fn new(capacity: usize) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded::<Message>(capacity.max(1));
        let callback: Arc<RwLock<Option<NotificationsCallback>>> = Arc::new(RwLock::new(None));
        let slot = callback.clone();

        let thread = std::thread::Builder::new()
            .name("sensor-notifications".into())
            .spawn(move || {
                for message in receiver.iter() {
                    let notification = match message {
                        Message::Notify(n) => n,
                        Message::Stop => break,
                    };
                    let cb = slot.read().unwrap_or_else(PoisonError::into_inner).clone();
                    match cb {
                        Some(cb) => cb(notification),
                        None => log::debug!(
                            "No notifications callback, dropping: {}",
                            notification.description
                        ),
                    }
                }
                log::debug!("Notifications thread stopped");
            })
            .map_err(|e| {
                SensorError::Thread(format!("Failed to spawn notifications thread: {}", e))
            })?;

        Ok(Self {
            sender,
            callback,
            thread: Some(thread),
        })
    }

    pub fn set_callback(&self, callback: NotificationsCallback) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Queue a notification without blocking the caller.
    pub fn raise_notification(&self, notification: Notification) {
        match self.sender.try_send(Message::Notify(notification)) {
            Ok(()) => {}
            Err(TrySendError::Full(Message::Notify(n))) => {
                log::warn!("Notification queue full, dropping: {}", n.description);
            }
            Err(_) => log::debug!("Notifications processor stopped"),
        }
    }
}

impl Drop for NotificationsProcessor {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn note(description: &str) -> Notification {
        Notification {
            category: NotificationCategory::HardwareEvent,
            severity: Severity::Info,
            description: description.into(),
            timestamp_ms: 0.0,
        }
    }

    #[test]
    fn test_delivers_in_order() {
        let processor = NotificationsProcessor::new(8).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        processor.set_callback(Arc::new(move |n: Notification| {
            let _ = tx.send(n.description);
        }));
        processor.raise_notification(note("first"));
        processor.raise_notification(note("second"));

        let timeout = Duration::from_secs(1);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "first");
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "second");
    }

    #[test]
    fn test_slow_consumer_does_not_block_raise() {
        let processor = NotificationsProcessor::new(1).unwrap();
        processor.set_callback(Arc::new(|_n: Notification| {
            std::thread::sleep(Duration::from_millis(50));
        }));
        let start = std::time::Instant::now();
        for i in 0..10 {
            processor.raise_notification(note(&format!("n{}", i)));
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
