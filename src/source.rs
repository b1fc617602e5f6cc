//! Frame dispatch between the backend capture thread and user callbacks.
//!
//! The capture thread only queues frames; a dedicated dispatch thread runs
//! the user callback. Stopping the source drains the queue and joins the
//! dispatch thread, so no callback runs once `stop()` has returned.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::types::Frame;
use crate::{Result, SensorError};

pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

enum Dispatch {
    Frame(Frame),
    Stop,
}

/// Result of handing a frame to the dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Queued,
    /// Queue full and the source drops on overflow.
    Dropped,
    /// The source has been stopped.
    Closed,
}

/// Producer handle used on the capture path.
#[derive(Clone)]
pub struct FrameSink {
    sender: Sender<Dispatch>,
    drop_on_full: bool,
}

impl FrameSink {
    pub fn dispatch(&self, frame: Frame) -> DispatchOutcome {
        if self.drop_on_full {
            match self.sender.try_send(Dispatch::Frame(frame)) {
                Ok(()) => DispatchOutcome::Queued,
                Err(TrySendError::Full(_)) => {
                    log::trace!("Frame queue full, dropping frame");
                    DispatchOutcome::Dropped
                }
                Err(TrySendError::Disconnected(_)) => DispatchOutcome::Closed,
            }
        } else {
            match self.sender.send(Dispatch::Frame(frame)) {
                Ok(()) => DispatchOutcome::Queued,
                Err(_) => DispatchOutcome::Closed,
            }
        }
    }
}

struct Dispatcher {
    sender: Sender<Dispatch>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

/// Owns the dispatch thread of one sensor.
pub struct FrameSource {
    name: String,
    capacity: usize,
    drop_on_full: bool,
    active: Mutex<Option<Dispatcher>>,
}

impl FrameSource {
    pub fn new(name: &str, capacity: usize, drop_on_full: bool) -> Self {
        Self {
            name: name.to_string(),
            capacity: capacity.max(1),
            drop_on_full,
            active: Mutex::new(None),
        }
    }

    /// Spawn the dispatch thread delivering to `callback`.
    pub fn start(&self, callback: FrameCallback) -> Result<FrameSink> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            return Err(SensorError::invalid_state("frame source already started"));
        }

        let (sender, receiver) = crossbeam_channel::bounded(self.capacity);
        let name = self.name.clone();
        let thread = std::thread::Builder::new()
            .name(format!("{}-dispatch", self.name))
            .spawn(move || dispatch_loop(&name, receiver, callback))
            .map_err(|e| SensorError::Thread(format!("Failed to spawn dispatch thread: {}", e)))?;

        let sink = FrameSink {
            sender: sender.clone(),
            drop_on_full: self.drop_on_full,
        };
        *active = Some(Dispatcher {
            sender,
            thread_id: thread.thread().id(),
            thread: Some(thread),
        });
        Ok(sink)
    }

    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Whether the caller is running on this source's dispatch thread,
    /// i.e. inside the frame callback.
    pub fn is_dispatch_thread(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|d| d.thread_id == std::thread::current().id())
    }

    /// Deliver queued frames, then stop and join the dispatch thread.
    pub fn stop(&self) {
        let dispatcher = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut dispatcher) = dispatcher else {
            return;
        };
        let _ = dispatcher.sender.send(Dispatch::Stop);
        if dispatcher.thread_id == std::thread::current().id() {
            log::warn!("{}: stop requested from its own frame callback", self.name);
            return;
        }
        if let Some(thread) = dispatcher.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(name: &str, receiver: Receiver<Dispatch>, callback: FrameCallback) {
    log::debug!("{}: dispatch thread started", name);
    for message in receiver.iter() {
        match message {
            Dispatch::Frame(frame) => {
                if catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
                    log::error!("{}: frame callback panicked", name);
                }
            }
            Dispatch::Stop => break,
        }
    }
    log::debug!("{}: dispatch thread stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClockDomain, Format, FrameMetadata, Fourcc, StreamKind, StreamProfile};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn frame(n: u64) -> Frame {
        Frame {
            profile: StreamProfile::new(StreamKind::Depth, Format::Z16, 4, 4, 30),
            fourcc: Fourcc::new(b"Z16 "),
            data: vec![0; 32],
            metadata: FrameMetadata {
                timestamp_ms: n as f64,
                frame_number: n,
                domain: ClockDomain::SystemTime,
                system_time_ms: 0.0,
            },
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn test_stop_drains_queue() {
        let source = FrameSource::new("test", 64, false);
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let sink = source
            .start(Arc::new(move |_f: Frame| {
                std::thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        for n in 0..20 {
            assert_eq!(sink.dispatch(frame(n)), DispatchOutcome::Queued);
        }
        source.stop();
        assert_eq!(delivered.load(Ordering::SeqCst), 20);
        assert_eq!(sink.dispatch(frame(99)), DispatchOutcome::Closed);
        assert!(!source.is_active());
    }

    #[test]
    fn test_drop_on_full() {
        let source = FrameSource::new("test", 1, true);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let sink = source
            .start(Arc::new(move |_f: Frame| {
                let _ = gate_rx.recv();
            }))
            .unwrap();

        // First frame blocks in the callback, second fills the queue.
        assert_eq!(sink.dispatch(frame(0)), DispatchOutcome::Queued);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sink.dispatch(frame(1)), DispatchOutcome::Queued);
        assert_eq!(sink.dispatch(frame(2)), DispatchOutcome::Dropped);

        drop(gate_tx);
        source.stop();
    }

    #[test]
    fn test_dispatch_thread_detection() {
        let source = Arc::new(FrameSource::new("test", 4, false));
        let (seen_tx, seen_rx) = crossbeam_channel::bounded(1);
        let weak = Arc::downgrade(&source);
        let sink = source
            .start(Arc::new(move |_f: Frame| {
                let inside = weak.upgrade().map(|s| s.is_dispatch_thread());
                let _ = seen_tx.try_send(inside);
            }))
            .unwrap();

        assert!(!source.is_dispatch_thread());
        sink.dispatch(frame(0));
        assert_eq!(
            seen_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Some(true)
        );
        source.stop();
        assert!(!source.is_dispatch_thread());
    }

    #[test]
    fn test_restart_after_stop() {
        let source = FrameSource::new("test", 4, true);
        source.start(Arc::new(|_f: Frame| {})).unwrap();
        assert!(source.start(Arc::new(|_f: Frame| {})).is_err());
        source.stop();
        assert!(source.start(Arc::new(|_f: Frame| {})).is_ok());
    }
}
