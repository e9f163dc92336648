/// Detector observer module
///
/// Keyword and state observers, and the registry the detector notifies.
/// Observers may be added or removed from any thread while a notification is
/// in flight: mutation swaps in a new list, notification walks a snapshot.

use crate::audio_stream::SharedAudioStream;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Detector lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorState {
    /// Detection loop is running
    Active,
    /// The audio stream was closed; the loop has stopped
    StreamClosed,
    /// A fatal read or trigger error stopped the loop
    Error,
}

impl fmt::Display for DetectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectorState::Active => "ACTIVE",
            DetectorState::StreamClosed => "STREAM_CLOSED",
            DetectorState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Detected wake segment
#[derive(Debug, Clone)]
pub struct KeywordEvent {
    /// Stream the indices refer to
    pub stream: Arc<SharedAudioStream>,

    /// Label of the wake phrase
    pub keyword: String,

    /// Absolute index of the first sample of the segment
    pub begin_index: u64,

    /// Absolute index one past the last sample of the segment
    pub end_index: u64,
}

impl KeywordEvent {
    /// Segment length in samples; zero if the indices are inverted
    pub fn len(&self) -> u64 {
        self.end_index.saturating_sub(self.begin_index)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait KeywordObserver: Send + Sync {
    fn on_keyword_detected(&self, event: &KeywordEvent);
}

pub trait StateObserver: Send + Sync {
    fn on_state_changed(&self, state: DetectorState);
}

impl<F> KeywordObserver for F
where
    F: Fn(&KeywordEvent) + Send + Sync,
{
    fn on_keyword_detected(&self, event: &KeywordEvent) {
        self(event)
    }
}

impl<F> StateObserver for F
where
    F: Fn(DetectorState) + Send + Sync,
{
    fn on_state_changed(&self, state: DetectorState) {
        self(state)
    }
}

/// Copy-on-write set of observers, keyed on `Arc` identity
pub struct ObserverSet<T: ?Sized> {
    observers: RwLock<Arc<Vec<Arc<T>>>>,
}

impl<T: ?Sized> ObserverSet<T> {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Returns false if the observer was already registered
    pub fn add(&self, observer: Arc<T>) -> bool {
        let mut observers = self.observers.write();
        if observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            return false;
        }

        let mut next = Vec::with_capacity(observers.len() + 1);
        next.extend(observers.iter().cloned());
        next.push(observer);
        *observers = Arc::new(next);
        true
    }

    /// Returns false if the observer was not registered
    pub fn remove(&self, observer: &Arc<T>) -> bool {
        let mut observers = self.observers.write();
        if !observers.iter().any(|o| Arc::ptr_eq(o, observer)) {
            return false;
        }

        let next = observers
            .iter()
            .filter(|o| !Arc::ptr_eq(o, observer))
            .cloned()
            .collect();
        *observers = Arc::new(next);
        true
    }

    /// Current membership; later mutation does not affect it
    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        Arc::clone(&self.observers.read())
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized> Default for ObserverSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> FromIterator<Arc<T>> for ObserverSet<T> {
    fn from_iter<I: IntoIterator<Item = Arc<T>>>(iter: I) -> Self {
        let set = Self::new();
        for observer in iter {
            set.add(observer);
        }
        set
    }
}

/// Keyword and state observers of one detector
pub struct DetectorObserverRegistry {
    keyword_observers: ObserverSet<dyn KeywordObserver>,
    state_observers: ObserverSet<dyn StateObserver>,
    state: Mutex<Option<DetectorState>>,
}

impl DetectorObserverRegistry {
    pub fn new(
        keyword_observers: Vec<Arc<dyn KeywordObserver>>,
        state_observers: Vec<Arc<dyn StateObserver>>,
    ) -> Self {
        Self {
            keyword_observers: keyword_observers.into_iter().collect(),
            state_observers: state_observers.into_iter().collect(),
            state: Mutex::new(None),
        }
    }

    pub fn add_keyword_observer(&self, observer: Arc<dyn KeywordObserver>) -> bool {
        self.keyword_observers.add(observer)
    }

    pub fn remove_keyword_observer(&self, observer: &Arc<dyn KeywordObserver>) -> bool {
        self.keyword_observers.remove(observer)
    }

    pub fn add_state_observer(&self, observer: Arc<dyn StateObserver>) -> bool {
        self.state_observers.add(observer)
    }

    pub fn remove_state_observer(&self, observer: &Arc<dyn StateObserver>) -> bool {
        self.state_observers.remove(observer)
    }

    pub fn keyword_observer_count(&self) -> usize {
        self.keyword_observers.len()
    }

    pub fn state_observer_count(&self) -> usize {
        self.state_observers.len()
    }

    /// Last state broadcast, `None` before the detector started
    pub fn state(&self) -> Option<DetectorState> {
        *self.state.lock()
    }

    pub fn notify_keyword_observers(&self, event: &KeywordEvent) {
        info!(
            "Keyword '{}' detected: [{}, {})",
            event.keyword, event.begin_index, event.end_index
        );

        for observer in self.keyword_observers.snapshot().iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                observer.on_keyword_detected(event)
            }));
            if let Err(payload) = outcome {
                error!("Keyword observer panicked: {}", panic_message(&*payload));
            }
        }
    }

    /// Broadcast `state` if it differs from the current one
    pub fn notify_state_observers(&self, state: DetectorState) {
        {
            let mut current = self.state.lock();
            if *current == Some(state) {
                return;
            }
            *current = Some(state);
        }

        debug!("Detector state -> {}", state);

        for observer in self.state_observers.snapshot().iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| observer.on_state_changed(state)));
            if let Err(payload) = outcome {
                error!("State observer panicked: {}", panic_message(&*payload));
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Notification forwarded to async consumers
#[derive(Debug, Clone)]
pub enum DetectorEvent {
    Keyword(KeywordEvent),
    State(DetectorState),
}

/// Observer that pushes every notification into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<DetectorEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DetectorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: DetectorEvent) {
        if self.tx.send(event).is_err() {
            debug!("Detector event dropped: receiver closed");
        }
    }
}

impl KeywordObserver for ChannelObserver {
    fn on_keyword_detected(&self, event: &KeywordEvent) {
        self.send(DetectorEvent::Keyword(event.clone()));
    }
}

impl StateObserver for ChannelObserver {
    fn on_state_changed(&self, state: DetectorState) {
        self.send(DetectorEvent::State(state));
    }
}
