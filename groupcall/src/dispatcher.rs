//! Event dispatch for session callbacks.
//!
//! A [`Dispatcher`] maps a fixed set of named actions to ordered lists of
//! registered handlers. Triggering an action schedules every handler on the
//! tokio runtime, each as its own task: handlers run concurrently with each
//! other and with the trigger site, and a panicking handler never affects
//! the others or the caller.

use groupcall_core::GroupCallError;
use groupcall_signaling::ParticipantUpdate;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Actions a session can dispatch handlers for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// The engine's network state flipped between connected and not
    NetworkStatusChanged,
    /// A participant-list delta arrived from the platform
    ParticipantListUpdated,
    /// A non-repeating audio source reached its end
    AudioPlayoutEnded,
    /// A non-repeating video source reached its end
    VideoPlayoutEnded,
    /// The call was discarded server-side
    CallDiscarded,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::NetworkStatusChanged => "network_status_changed",
            Action::ParticipantListUpdated => "participant_list_updated",
            Action::AudioPlayoutEnded => "audio_playout_ended",
            Action::VideoPlayoutEnded => "video_playout_ended",
            Action::CallDiscarded => "call_discarded",
        };
        f.write_str(name)
    }
}

/// Payload handed to handlers when their action triggers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Network state transition, after deduplication
    NetworkStatusChanged {
        /// New connection state
        connected: bool,
    },
    /// Participant-list delta, changed participants only
    ParticipantListUpdated {
        /// Changed participants
        participants: Vec<ParticipantUpdate>,
    },
    /// End of a non-repeating audio source
    AudioPlayoutEnded {
        /// Source identifier the stream was started with
        source: String,
    },
    /// End of a non-repeating video source
    VideoPlayoutEnded {
        /// Source identifier the stream was started with
        source: String,
    },
    /// Server-side call discard
    CallDiscarded,
}

/// An asynchronous event handler. The returned future is spawned on the
/// runtime, so a handler can never block the dispatcher. Registration
/// identity is the `Arc` allocation: re-adding the same `Arc` is a no-op.
pub type Handler = Arc<dyn Fn(SessionEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registry mapping actions to ordered handler lists
pub struct Dispatcher {
    handlers: Mutex<HashMap<Action, Vec<Handler>>>,
}

impl Dispatcher {
    /// Create a dispatcher serving exactly the given actions.
    pub fn new(actions: &[Action]) -> Self {
        Self {
            handlers: Mutex::new(actions.iter().map(|&a| (a, Vec::new())).collect()),
        }
    }

    /// Register a handler for an action. Returns `Ok(false)` when the same
    /// handler is already registered for that action, `Ok(true)` when it was
    /// added, and `InvalidAction` when this dispatcher does not serve the
    /// action.
    pub fn add_handler(&self, handler: Handler, action: Action) -> Result<bool, GroupCallError> {
        let mut handlers = self.handlers.lock();
        let list = handlers
            .get_mut(&action)
            .ok_or_else(|| GroupCallError::InvalidAction {
                action: action.to_string(),
            })?;

        if list.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            debug!(%action, "Handler already registered");
            return Ok(false);
        }
        list.push(handler);
        Ok(true)
    }

    /// Remove a previously registered handler. Idempotent: returns whether a
    /// removal actually happened.
    pub fn remove_handler(&self, handler: &Handler, action: Action) -> Result<bool, GroupCallError> {
        let mut handlers = self.handlers.lock();
        let list = handlers
            .get_mut(&action)
            .ok_or_else(|| GroupCallError::InvalidAction {
                action: action.to_string(),
            })?;

        let before = list.len();
        list.retain(|h| !Arc::ptr_eq(h, handler));
        Ok(list.len() != before)
    }

    /// Drop every registered handler.
    pub fn remove_all(&self) {
        for list in self.handlers.lock().values_mut() {
            list.clear();
        }
    }

    /// Schedule every handler registered for `action`, each as its own
    /// spawned task. Does not wait for any of them; handler failures and
    /// panics stay inside their task.
    pub fn trigger(&self, action: Action, event: SessionEvent) {
        let snapshot: Vec<Handler> = match self.handlers.lock().get(&action) {
            Some(list) => list.clone(),
            None => {
                debug!(%action, "Trigger for unserved action ignored");
                return;
            }
        };

        debug!(%action, handlers = snapshot.len(), "Trigger handlers");
        for handler in snapshot {
            tokio::spawn(handler(event.clone()));
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.lock();
        let counts: HashMap<String, usize> = handlers
            .iter()
            .map(|(a, l)| (a.to_string(), l.len()))
            .collect();
        f.debug_struct("Dispatcher").field("handlers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_event| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    async fn settle() {
        // Let spawned handler tasks run.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn add_is_idempotent_per_arc_identity() {
        let dispatcher = Dispatcher::new(&[Action::NetworkStatusChanged]);
        let handler = counting_handler(Arc::new(AtomicUsize::new(0)));

        assert!(dispatcher
            .add_handler(Arc::clone(&handler), Action::NetworkStatusChanged)
            .unwrap());
        assert!(!dispatcher
            .add_handler(Arc::clone(&handler), Action::NetworkStatusChanged)
            .unwrap());
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let dispatcher = Dispatcher::new(&[Action::NetworkStatusChanged]);
        let handler = counting_handler(Arc::new(AtomicUsize::new(0)));

        let err = dispatcher
            .add_handler(handler, Action::CallDiscarded)
            .unwrap_err();
        assert!(matches!(err, GroupCallError::InvalidAction { .. }));
    }

    #[tokio::test]
    async fn remove_reports_whether_anything_was_removed() {
        let dispatcher = Dispatcher::new(&[Action::CallDiscarded]);
        let handler = counting_handler(Arc::new(AtomicUsize::new(0)));

        dispatcher
            .add_handler(Arc::clone(&handler), Action::CallDiscarded)
            .unwrap();
        assert!(dispatcher.remove_handler(&handler, Action::CallDiscarded).unwrap());
        assert!(!dispatcher.remove_handler(&handler, Action::CallDiscarded).unwrap());
    }

    #[tokio::test]
    async fn trigger_runs_every_registered_handler() {
        let dispatcher = Dispatcher::new(&[Action::NetworkStatusChanged]);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        dispatcher
            .add_handler(counting_handler(Arc::clone(&first)), Action::NetworkStatusChanged)
            .unwrap();
        dispatcher
            .add_handler(counting_handler(Arc::clone(&second)), Action::NetworkStatusChanged)
            .unwrap();

        dispatcher.trigger(
            Action::NetworkStatusChanged,
            SessionEvent::NetworkStatusChanged { connected: true },
        );
        settle().await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_starve_the_others() {
        let dispatcher = Dispatcher::new(&[Action::CallDiscarded]);
        let survivor = Arc::new(AtomicUsize::new(0));

        let panicking: Handler = Arc::new(|_event| {
            Box::pin(async {
                panic!("handler blew up");
            })
        });
        dispatcher.add_handler(panicking, Action::CallDiscarded).unwrap();
        dispatcher
            .add_handler(counting_handler(Arc::clone(&survivor)), Action::CallDiscarded)
            .unwrap();

        dispatcher.trigger(Action::CallDiscarded, SessionEvent::CallDiscarded);
        settle().await;

        assert_eq!(survivor.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn trigger_does_not_wait_for_handlers() {
        let dispatcher = Dispatcher::new(&[Action::CallDiscarded]);
        let done = Arc::new(AtomicUsize::new(0));
        let done_handler = Arc::clone(&done);

        let slow: Handler = Arc::new(move |_event| {
            let done = Arc::clone(&done_handler);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
        });
        dispatcher.add_handler(slow, Action::CallDiscarded).unwrap();

        let start = std::time::Instant::now();
        dispatcher.trigger(Action::CallDiscarded, SessionEvent::CallDiscarded);
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }
}
