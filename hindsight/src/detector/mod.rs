//! Pause Detection and Listener Dispatch
//!
//! A pause detector discovers process-wide execution stalls and reports them
//! to registered listeners as `(length, end_time)` events. This module holds
//! the machinery shared by every detector: a single dispatcher thread
//! draining a bounded message queue, so listener-list changes and pause
//! notifications are observed in publish order, and no listener sees an
//! event after its removal request has been processed (a removal racing an
//! in-flight dispatch may deliver at most one more event).
//!
//! Listeners are held weakly. A consumer that disappears without
//! deregistering — a dropped [`LatencyStats`](crate::LatencyStats), say — is
//! pruned in-line the next time an event fails to reach it, so the detector
//! never keeps its consumers alive.
//!
//! [`SimplePauseDetector`] is the concrete consensus-based detector.

mod simple;

pub use simple::SimplePauseDetector;

use crate::config::DETECTOR_QUEUE_CAPACITY;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, warn};

/// A consumer of pause events.
pub trait PauseListener: Send + Sync {
    /// Called by the dispatcher for each detected pause, with the pause
    /// length and end time in nanoseconds.
    fn handle_pause(&self, pause_length: u64, pause_end_time: u64);
}

/// Dispatch priority of a listener within one event.
///
/// High-priority listeners see an event before normal ones do. The interval
/// estimator registers high so its state already reflects a pause by the
/// time the recorder's correction callback asks for an estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerPriority {
    /// Fired first within each event.
    High,
    /// Fired after all high-priority listeners.
    Normal,
}

/// Identifies a listener registration for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// A detector of process-wide pauses.
///
/// Implementations own their detection mechanism; registration, prioritised
/// dispatch, and shutdown semantics are common to all of them (and are
/// provided by [`DetectorCore`], which implementations delegate to).
pub trait PauseDetector: Send + Sync {
    /// Registers `listener` at the given priority. The detector keeps only a
    /// weak reference; the caller retains ownership.
    fn add_listener(&self, listener: &Arc<dyn PauseListener>, priority: ListenerPriority)
        -> ListenerId;

    /// Requests removal of a registration. Eventually consistent: a dispatch
    /// already in flight may still reach the listener once.
    fn remove_listener(&self, id: ListenerId);

    /// Number of currently registered listeners, as seen by the dispatcher.
    fn listener_count(&self) -> usize;

    /// Stops the detector. Pending notifications are dispatched first.
    fn shutdown(&self);
}

enum Message {
    Add {
        id: ListenerId,
        listener: Weak<dyn PauseListener>,
        priority: ListenerPriority,
    },
    Remove(ListenerId),
    Pause {
        pause_length: u64,
        pause_end_time: u64,
    },
    Shutdown,
}

/// Cloneable handle detector threads use to publish pause events.
///
/// Publishing never blocks: the queue is bounded and an overflowing
/// notification is dropped (pause detection is best-effort; a missed pause
/// only reduces correction fidelity).
#[derive(Clone)]
pub struct PauseNotifier {
    sender: Sender<Message>,
}

impl PauseNotifier {
    /// Publishes one pause event.
    pub fn notify(&self, pause_length: u64, pause_end_time: u64) {
        match self.sender.try_send(Message::Pause {
            pause_length,
            pause_end_time,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(pause_length, "pause notification dropped: dispatch queue full");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// The dispatcher and listener registry shared by all detectors.
///
/// Usable directly as an inert [`PauseDetector`] driven purely through
/// [`DetectorCore::notify_pause`], which is how tests inject synthetic
/// pauses.
pub struct DetectorCore {
    sender: Sender<Message>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
    next_listener_id: AtomicU64,
    registered: Arc<AtomicUsize>,
    shut_down: AtomicBool,
}

impl DetectorCore {
    /// Spawns the dispatcher thread.
    pub fn new() -> DetectorCore {
        let (sender, receiver) = bounded(DETECTOR_QUEUE_CAPACITY);
        let registered = Arc::new(AtomicUsize::new(0));
        let dispatcher_registered = Arc::clone(&registered);
        let handle = thread::Builder::new()
            .name("hindsight-pause-dispatch".into())
            .spawn(move || {
                Dispatcher {
                    receiver,
                    high: Vec::new(),
                    normal: Vec::new(),
                    registered: dispatcher_registered,
                }
                .run()
            })
            .expect("failed to spawn pause dispatcher thread");
        DetectorCore {
            sender,
            dispatcher: Mutex::new(Some(handle)),
            next_listener_id: AtomicU64::new(0),
            registered,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Publishes a pause event to all listeners, high priority first.
    pub fn notify_pause(&self, pause_length: u64, pause_end_time: u64) {
        self.notifier().notify(pause_length, pause_end_time);
    }

    /// A cloneable publishing handle for detector worker threads.
    pub fn notifier(&self) -> PauseNotifier {
        PauseNotifier {
            sender: self.sender.clone(),
        }
    }
}

impl PauseDetector for DetectorCore {
    fn add_listener(
        &self,
        listener: &Arc<dyn PauseListener>,
        priority: ListenerPriority,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        // Registry changes must not be lost; block if the queue is full.
        if self
            .sender
            .send(Message::Add {
                id,
                listener: Arc::downgrade(listener),
                priority,
            })
            .is_err()
        {
            warn!("listener registered on a shut-down pause detector");
        }
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        let _ = self.sender.send(Message::Remove(id));
    }

    fn listener_count(&self) -> usize {
        self.registered.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.sender.send(Message::Shutdown);
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for DetectorCore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DetectorCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct RegisteredListener {
    id: ListenerId,
    listener: Weak<dyn PauseListener>,
}

struct Dispatcher {
    receiver: Receiver<Message>,
    high: Vec<RegisteredListener>,
    normal: Vec<RegisteredListener>,
    registered: Arc<AtomicUsize>,
}

impl Dispatcher {
    fn run(mut self) {
        while let Ok(message) = self.receiver.recv() {
            match message {
                Message::Add {
                    id,
                    listener,
                    priority,
                } => {
                    debug!(?id, ?priority, "pause listener added");
                    let entry = RegisteredListener { id, listener };
                    match priority {
                        ListenerPriority::High => self.high.push(entry),
                        ListenerPriority::Normal => self.normal.push(entry),
                    }
                    self.registered.fetch_add(1, Ordering::AcqRel);
                }
                Message::Remove(id) => {
                    let before = self.high.len() + self.normal.len();
                    self.high.retain(|entry| entry.id != id);
                    self.normal.retain(|entry| entry.id != id);
                    let removed = before - (self.high.len() + self.normal.len());
                    if removed > 0 {
                        debug!(?id, "pause listener removed");
                        self.registered.fetch_sub(removed, Ordering::AcqRel);
                    }
                }
                Message::Pause {
                    pause_length,
                    pause_end_time,
                } => {
                    Self::dispatch(&mut self.high, &self.registered, pause_length, pause_end_time);
                    Self::dispatch(
                        &mut self.normal,
                        &self.registered,
                        pause_length,
                        pause_end_time,
                    );
                }
                Message::Shutdown => {
                    debug!("pause dispatcher stopping");
                    return;
                }
            }
        }
    }

    fn dispatch(
        listeners: &mut Vec<RegisteredListener>,
        registered: &AtomicUsize,
        pause_length: u64,
        pause_end_time: u64,
    ) {
        listeners.retain(|entry| match entry.listener.upgrade() {
            Some(listener) => {
                listener.handle_pause(pause_length, pause_end_time);
                true
            }
            None => {
                // The consumer is gone; the registration removes itself.
                debug!(id = ?entry.id, "pruning listener for dropped consumer");
                registered.fetch_sub(1, Ordering::AcqRel);
                false
            }
        });
    }
}
