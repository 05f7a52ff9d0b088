//! Addressing layer between the realtime transport and the call managers.
//!
//! The router is not a network endpoint of its own. It subscribes once to
//! the signal event on the transport, decodes each envelope and queues it
//! once on the addressed user's [`CallManager`](super::CallManager). Screens
//! listening for incoming calls of that user see each new offer as well, but
//! only observe it.

use super::error::CallError;
use super::registry::CallRegistry;
use super::signaling::{SignalEnvelope, SignalSender, SignalType};
use crate::client::{EmitOutcome, RealtimeClient};
use crate::types::events::{Subscriber, invoke_isolated};
use dashmap::DashMap;
use log::{debug, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Called with every new offer addressed to the subscribed user, after the
/// offer has been queued on that user's call manager.
pub type IncomingHandler = Arc<dyn Fn(&SignalEnvelope) + Send + Sync>;

/// Where an inbound envelope went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// An offer queued on the manager and shown to this many incoming-call
    /// handlers.
    Handlers(usize),
    /// Queued on the addressed user's call manager.
    Manager,
    /// A retried offer for a call that is already ringing or active.
    Duplicate,
}

struct ChannelEntry {
    id: u64,
    handler: IncomingHandler,
}

type ChannelKey = (String, String);

pub struct CallRouter {
    client: Arc<RealtimeClient>,
    registry: Arc<CallRegistry>,
    /// Keyed by (local user id, channel key).
    channels: DashMap<ChannelKey, ChannelEntry>,
    next_id: AtomicU64,
    signal_event: String,
    subscriber: Subscriber,
}

impl CallRouter {
    pub fn new(client: Arc<RealtimeClient>, registry: Arc<CallRegistry>) -> Arc<Self> {
        let signal_event = client.config().signal_event.clone();
        Arc::new_cyclic(|this: &Weak<Self>| {
            let this = this.clone();
            let subscriber: Subscriber = Arc::new(move |payload: &Value| {
                if let Some(router) = this.upgrade() {
                    router.route_value(payload);
                }
            });
            client.on(&signal_event, subscriber.clone());
            Self {
                client,
                registry,
                channels: DashMap::new(),
                next_id: AtomicU64::new(1),
                signal_event,
                subscriber,
            }
        })
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    /// Registers `handler` for offers addressed to `local_user_id` on
    /// `channel_key`. Subscribing the same channel again replaces the old
    /// handler.
    pub fn subscribe_incoming(
        self: &Arc<Self>,
        channel_key: &str,
        local_user_id: &str,
        handler: IncomingHandler,
    ) -> RouterSubscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let key = (local_user_id.to_string(), channel_key.to_string());
        if self
            .channels
            .insert(key.clone(), ChannelEntry { id, handler })
            .is_some()
        {
            debug!(target: "Calls/Router", "Replaced handler on channel '{channel_key}' for {local_user_id}");
        }
        RouterSubscription {
            router: Arc::downgrade(self),
            key,
            id,
            active: AtomicBool::new(true),
        }
    }

    pub fn channel_count(&self, local_user_id: &str) -> usize {
        self.channels
            .iter()
            .filter(|entry| entry.key().0 == local_user_id)
            .count()
    }

    /// Sends an envelope through the transport.
    pub async fn send(&self, envelope: &SignalEnvelope) -> Result<EmitOutcome, CallError> {
        Ok(self.client.send_signal(envelope).await?)
    }

    fn route_value(&self, payload: &Value) {
        let envelope = match SignalEnvelope::from_value(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "Calls/Router", "Dropping signal: {e}");
                return;
            }
        };
        if let Err(e) = self.route_envelope(envelope) {
            warn!(target: "Calls/Router", "Dropping signal: {e}");
        }
    }

    /// Routes one decoded envelope by its recipient.
    ///
    /// The recipient's manager gets every envelope exactly once, however many
    /// channels are subscribed for that user.
    pub fn route_envelope(&self, envelope: SignalEnvelope) -> Result<RouteOutcome, CallError> {
        let handlers = self.handlers_for(&envelope.to);
        // A user with a subscribed channel is bound even before its manager
        // has been created.
        let manager = if handlers.is_empty() {
            self.registry.get(&envelope.to)
        } else {
            Some(self.registry.manager_for(&envelope.to))
        };
        let Some(manager) = manager else {
            return Err(CallError::UnknownRecipient(envelope.to));
        };

        let is_offer = envelope.signal_type == SignalType::Offer;
        if is_offer && manager.is_tracking(&envelope.call_id) {
            debug!(
                target: "Calls/Router",
                "Duplicate offer for call {} to {}",
                envelope.call_id, envelope.to
            );
            return Ok(RouteOutcome::Duplicate);
        }
        if !is_offer || handlers.is_empty() {
            debug!(
                target: "Calls/Router",
                "{} for call {} -> {}",
                envelope.signal_type, envelope.call_id, envelope.to
            );
            manager.deliver(envelope);
            return Ok(RouteOutcome::Manager);
        }

        manager.deliver(envelope.clone());
        for handler in &handlers {
            invoke_isolated("incoming call handler", || handler(&envelope));
        }
        Ok(RouteOutcome::Handlers(handlers.len()))
    }

    fn handlers_for(&self, local_user_id: &str) -> Vec<IncomingHandler> {
        self.channels
            .iter()
            .filter(|entry| entry.key().0 == local_user_id)
            .map(|entry| entry.value().handler.clone())
            .collect()
    }

    fn remove_channel(&self, key: &ChannelKey, id: u64) -> bool {
        self.channels
            .remove_if(key, |_, entry| entry.id == id)
            .is_some()
    }
}

impl Drop for CallRouter {
    fn drop(&mut self) {
        self.client.off(&self.signal_event, &self.subscriber);
    }
}

/// Handle for one incoming-call subscription. Unsubscribes on drop.
///
/// `unsubscribe` may be called any number of times, including from inside
/// the handler while it is being invoked.
pub struct RouterSubscription {
    router: Weak<CallRouter>,
    key: ChannelKey,
    id: u64,
    active: AtomicBool,
}

impl RouterSubscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(router) = self.router.upgrade()
            && router.remove_channel(&self.key, self.id)
        {
            debug!(
                target: "Calls/Router",
                "Unsubscribed channel '{}' for {}",
                self.key.1, self.key.0
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for RouterSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::{CallObserver, CallSession, CallState};
    use crate::config::ClientConfig;
    use crate::transport::mock::MockTransportFactory;
    use crate::types::events::CALL_SIGNAL;
    use serde_json::json;
    use std::sync::Mutex;

    fn setup() -> (Arc<RealtimeClient>, Arc<CallRouter>) {
        let client = RealtimeClient::new(ClientConfig::default(), MockTransportFactory::new());
        let registry = CallRegistry::new(client.clone());
        let router = CallRouter::new(client.clone(), registry);
        (client, router)
    }

    fn recording_handler() -> (IncomingHandler, Arc<Mutex<Vec<SignalEnvelope>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: IncomingHandler = Arc::new(move |envelope: &SignalEnvelope| {
            sink.lock().unwrap().push(envelope.clone());
        });
        (handler, seen)
    }

    fn offer_json(call_id: &str, from: &str, to: &str) -> Value {
        json!({"type": "offer", "callId": call_id, "from": from, "to": to})
    }

    #[tokio::test]
    async fn test_offer_reaches_only_addressed_user() {
        let (client, router) = setup();
        let (u1_handler, u1_seen) = recording_handler();
        let (u3_handler, u3_seen) = recording_handler();
        let _u1 = router.subscribe_incoming("chat", "U1", u1_handler);
        let _u3 = router.subscribe_incoming("chat", "U3", u3_handler);

        client.trigger(CALL_SIGNAL, &offer_json("C1", "U2", "U1"));

        assert_eq!(u1_seen.lock().unwrap().len(), 1);
        assert_eq!(u1_seen.lock().unwrap()[0].call_id.as_str(), "C1");
        assert!(u3_seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_channels_do_not_cross_talk_across_users() {
        let (_client, router) = setup();
        let (chat, chat_seen) = recording_handler();
        let (matches, matches_seen) = recording_handler();
        let _chat = router.subscribe_incoming("chat", "U1", chat);
        let _matches = router.subscribe_incoming("matches", "U1", matches);
        assert_eq!(router.channel_count("U1"), 2);

        let envelope = SignalEnvelope::from_value(&offer_json("C1", "U2", "U1")).unwrap();
        let outcome = router.route_envelope(envelope).unwrap();

        assert_eq!(outcome, RouteOutcome::Handlers(2));
        assert_eq!(chat_seen.lock().unwrap().len(), 1);
        assert_eq!(matches_seen.lock().unwrap().len(), 1);
    }

    #[derive(Default)]
    struct ErrorCount(AtomicU64);

    impl CallObserver for ErrorCount {
        fn on_state_change(&self, _session: &CallSession) {}

        fn on_error(&self, _error: &CallError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn queued_for_call(client: &RealtimeClient, call_id: &str) -> Vec<Value> {
        client
            .queued_events()
            .await
            .into_iter()
            .filter(|event| event.payload["callId"] == call_id)
            .map(|event| event.payload)
            .collect()
    }

    #[tokio::test]
    async fn test_offer_reaches_manager_once_for_many_channels() {
        let (client, router) = setup();
        let (chat, chat_seen) = recording_handler();
        let (matches, matches_seen) = recording_handler();
        let _chat = router.subscribe_incoming("chat", "U1", chat);
        let _matches = router.subscribe_incoming("matches", "U1", matches);

        let manager = router.registry().manager_for("U1");
        let first = SignalEnvelope::from_value(&offer_json("C1", "U2", "U1")).unwrap();
        manager.receive_offer(first).await.unwrap();
        manager.accept_call(None).await.unwrap();
        let errors = Arc::new(ErrorCount::default());
        manager.add_observer(errors.clone());

        let second = SignalEnvelope::from_value(&offer_json("C2", "U3", "U1")).unwrap();
        assert_eq!(router.route_envelope(second).unwrap(), RouteOutcome::Handlers(2));
        assert_eq!(chat_seen.lock().unwrap().len(), 1);
        assert_eq!(matches_seen.lock().unwrap().len(), 1);

        for _ in 0..200 {
            tokio::task::yield_now().await;
        }
        let busy = queued_for_call(&client, "C2").await;
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0]["payload"]["reason"], "busy");
        assert_eq!(errors.0.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), CallState::Active);
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_dropped() {
        let (client, router) = setup();

        let envelope = SignalEnvelope::from_value(&offer_json("C1", "U2", "U9")).unwrap();
        let result = router.route_envelope(envelope);
        assert!(matches!(result, Err(CallError::UnknownRecipient(id)) if id == "U9"));

        // Through the transport it is logged, not propagated
        assert_eq!(client.trigger(CALL_SIGNAL, &offer_json("C1", "U2", "U9")), 1);
        assert!(client.trigger(CALL_SIGNAL, &json!({"type": "offer"})) == 1);
        assert!(router.registry().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_offer_for_tracked_call_is_ignored() {
        let (_client, router) = setup();
        let manager = router.registry().manager_for("U1");
        let offer = SignalEnvelope::from_value(&offer_json("C1", "U2", "U1")).unwrap();
        manager.receive_offer(offer.clone()).await.unwrap();

        let (handler, seen) = recording_handler();
        let _sub = router.subscribe_incoming("chat", "U1", handler);

        assert_eq!(router.route_envelope(offer).unwrap(), RouteOutcome::Duplicate);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_offer_goes_to_manager() {
        let (_client, router) = setup();
        let _manager = router.registry().manager_for("U1");
        let hangup = SignalEnvelope::hangup("C1".into(), "U2", "U1", "ended");

        assert_eq!(router.route_envelope(hangup).unwrap(), RouteOutcome::Manager);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_safe_during_dispatch() {
        let (client, router) = setup();
        let slot: Arc<Mutex<Option<RouterSubscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));

        let handler: IncomingHandler = {
            let slot = slot.clone();
            let calls = calls.clone();
            Arc::new(move |_: &SignalEnvelope| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = slot.lock().unwrap().as_ref() {
                    sub.unsubscribe();
                    sub.unsubscribe();
                }
            })
        };
        *slot.lock().unwrap() = Some(router.subscribe_incoming("chat", "U1", handler));

        client.trigger(CALL_SIGNAL, &offer_json("C1", "U2", "U1"));
        client.trigger(CALL_SIGNAL, &offer_json("C2", "U2", "U1"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(router.channel_count("U1"), 0);
        let sub = slot.lock().unwrap().take().unwrap();
        assert!(!sub.is_active());
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn test_replaced_channel_survives_old_handle_drop() {
        let (_client, router) = setup();
        let (first, _) = recording_handler();
        let (second, second_seen) = recording_handler();

        let old = router.subscribe_incoming("chat", "U1", first);
        let _new = router.subscribe_incoming("chat", "U1", second);
        drop(old);

        assert_eq!(router.channel_count("U1"), 1);
        let envelope = SignalEnvelope::from_value(&offer_json("C1", "U2", "U1")).unwrap();
        router.route_envelope(envelope).unwrap();
        assert_eq!(second_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_router_unsubscribes_from_transport() {
        let (client, router) = setup();
        assert_eq!(client.subscriber_count(CALL_SIGNAL), 1);

        drop(router);

        assert_eq!(client.subscriber_count(CALL_SIGNAL), 0);
    }
}
