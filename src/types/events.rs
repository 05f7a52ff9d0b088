use dashmap::DashMap;
use log::error;
use serde_json::Value;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Local lifecycle event, triggered when the logical connection comes up.
pub const CONNECT: &str = "connect";
/// Local lifecycle event, triggered when the logical connection goes down.
pub const DISCONNECT: &str = "disconnect";
/// Wire event carrying call signaling envelopes in both directions.
pub const CALL_SIGNAL: &str = "call_signal";
/// Outbound chat message.
pub const MESSAGE_SEND: &str = "message_send";

/// Realtime events owned by collaborators outside the call core.
///
/// Their payload schemas are opaque here; the transport only guarantees
/// ordering, offline queuing and local dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RealtimeEvent {
    MatchCreated,
    MessageReceived,
    Notification,
    UserOnline,
    UserOffline,
    UserTyping,
}

impl RealtimeEvent {
    pub const ALL: [RealtimeEvent; 6] = [
        Self::MatchCreated,
        Self::MessageReceived,
        Self::Notification,
        Self::UserOnline,
        Self::UserOffline,
        Self::UserTyping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MatchCreated => "match_created",
            Self::MessageReceived => "message_received",
            Self::Notification => "notification",
            Self::UserOnline => "user_online",
            Self::UserOffline => "user_offline",
            Self::UserTyping => "user_typing",
        }
    }
}

impl std::fmt::Display for RealtimeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A callback registered for one event name.
///
/// Handles are compared by pointer, so keep the `Arc` around if you intend
/// to unsubscribe later.
pub type Subscriber = Arc<dyn Fn(&Value) + Send + Sync>;

/// Mapping from event name to the set of subscribers for it.
///
/// Registering the same handle twice keeps a single entry. Dispatch works on
/// a snapshot, so subscribers may subscribe or unsubscribe (themselves
/// included) while being invoked.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: DashMap<String, Vec<Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event: &str, subscriber: Subscriber) {
        let mut list = self.subscribers.entry(event.to_string()).or_default();
        if !list.iter().any(|existing| Arc::ptr_eq(existing, &subscriber)) {
            list.push(subscriber);
        }
    }

    /// Removes `subscriber` from `event`. Unknown handles are ignored.
    pub fn unsubscribe(&self, event: &str, subscriber: &Subscriber) -> bool {
        let removed = match self.subscribers.get_mut(event) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|existing| !Arc::ptr_eq(existing, subscriber));
                before != list.len()
            }
            None => false,
        };
        self.subscribers.remove_if(event, |_, list| list.is_empty());
        removed
    }

    /// Invokes every subscriber of `event` with `payload`.
    ///
    /// A panicking subscriber is logged and skipped; the rest still run.
    /// Returns how many subscribers were invoked.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let snapshot = match self.subscribers.get(event) {
            Some(list) => list.value().clone(),
            None => return 0,
        };

        for subscriber in &snapshot {
            invoke_isolated(event, || subscriber(payload));
        }
        snapshot.len()
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers
            .get(event)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    pub fn has_subscribers(&self, event: &str) -> bool {
        self.subscriber_count(event) > 0
    }
}

/// Runs a callback, containing any panic it raises. Returns false if it
/// panicked.
pub(crate) fn invoke_isolated<F: FnOnce()>(context: &str, callback: F) -> bool {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => true,
        Err(panic) => {
            error!(
                target: "Realtime/Events",
                "Callback for '{}' panicked: {}",
                context,
                panic_message(panic.as_ref())
            );
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> Subscriber {
        let counter = counter.clone();
        Arc::new(move |_: &Value| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_duplicate_subscription_is_kept_once() {
        let registry = SubscriberRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let subscriber = counting(&hits);

        registry.subscribe("user_online", subscriber.clone());
        registry.subscribe("user_online", subscriber.clone());

        assert_eq!(registry.subscriber_count("user_online"), 1);
        assert_eq!(registry.dispatch("user_online", &json!({"userId": "u1"})), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let registry = SubscriberRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let registered = counting(&hits);
        let stranger = counting(&hits);

        assert!(!registry.unsubscribe("notification", &stranger));

        registry.subscribe("notification", registered.clone());
        assert!(!registry.unsubscribe("notification", &stranger));
        assert_eq!(registry.subscriber_count("notification"), 1);

        assert!(registry.unsubscribe("notification", &registered));
        assert!(!registry.has_subscribers("notification"));
        assert_eq!(registry.dispatch("notification", &Value::Null), 0);
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_dispatch() {
        let registry = SubscriberRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.subscribe("match_created", counting(&hits));
        registry.subscribe("match_created", Arc::new(|_: &Value| panic!("boom")));
        registry.subscribe("match_created", counting(&hits));

        assert_eq!(registry.dispatch("match_created", &Value::Null), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscriber_can_unsubscribe_itself_during_dispatch() {
        let registry = Arc::new(SubscriberRegistry::new());
        let slot: Arc<Mutex<Option<Subscriber>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        let subscriber: Subscriber = {
            let registry = registry.clone();
            let slot = slot.clone();
            let hits = hits.clone();
            Arc::new(move |_: &Value| {
                hits.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = slot.lock().unwrap().take() {
                    registry.unsubscribe("user_typing", &me);
                }
            })
        };
        *slot.lock().unwrap() = Some(subscriber.clone());
        registry.subscribe("user_typing", subscriber);

        registry.dispatch("user_typing", &Value::Null);
        registry.dispatch("user_typing", &Value::Null);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!registry.has_subscribers("user_typing"));
    }

    #[test]
    fn test_payload_is_passed_through() {
        let registry = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.subscribe(
            "message_received",
            Arc::new(move |payload: &Value| sink.lock().unwrap().push(payload.clone())),
        );

        registry.dispatch("message_received", &json!({"id": "m1"}));
        registry.dispatch("message_received", &json!({"id": "m2"}));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![json!({"id": "m1"}), json!({"id": "m2"})]
        );
    }

    #[test]
    fn test_event_names() {
        let names: Vec<&str> = RealtimeEvent::ALL.iter().map(|e| e.as_str()).collect();
        assert_eq!(
            names,
            [
                "match_created",
                "message_received",
                "notification",
                "user_online",
                "user_offline",
                "user_typing"
            ]
        );
    }
}
