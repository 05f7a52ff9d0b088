//! Glue between a UI screen and the call core.
//!
//! A [`CallScreen`] binds to the shared [`CallManager`] of its local user,
//! listens on the router for incoming offers and turns UI actions into
//! manager intents. Failures are logged and returned, never panicked on.

use crate::calls::{
    CallError, CallInfo, CallManager, CallObserver, CallOptions, CallRouter, CallSession,
    CallState, IncomingHandler, ObserverId, OfferDisposition, RouterSubscription, SignalEnvelope,
};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct CallScreen {
    channel_key: String,
    manager: Arc<CallManager>,
    subscription: RouterSubscription,
    observers: Mutex<Vec<ObserverId>>,
    ring_timeout: Option<Arc<RingTimeout>>,
}

impl CallScreen {
    /// Binds a screen on `channel_key` to the call manager of `local_user_id`.
    pub fn attach(channel_key: &str, local_user_id: &str, router: &Arc<CallRouter>) -> Self {
        let manager = router.registry().manager_for(local_user_id);
        // The router already queued the offer on the shared manager.
        let channel = channel_key.to_string();
        let handler: IncomingHandler = Arc::new(move |offer: &SignalEnvelope| {
            debug!(
                target: "Calls/Screen",
                "[{channel}] Incoming call {} from {}",
                offer.call_id, offer.from
            );
        });
        let subscription = router.subscribe_incoming(channel_key, local_user_id, handler);
        info!(target: "Calls/Screen", "[{channel_key}] Attached for {local_user_id}");

        Self {
            channel_key: channel_key.to_string(),
            manager,
            subscription,
            observers: Mutex::new(Vec::new()),
            ring_timeout: None,
        }
    }

    pub fn with_observer(self, observer: Arc<dyn CallObserver>) -> Self {
        self.add_observer(observer);
        self
    }

    /// Hangs up calls still ringing after `timeout`.
    pub fn with_ring_timeout(mut self, timeout: Duration) -> Self {
        let ring_timeout = Arc::new(RingTimeout {
            manager: Arc::downgrade(&self.manager),
            timeout,
            timer: Arc::new(Mutex::new(None)),
        });
        self.add_observer(ring_timeout.clone());
        self.ring_timeout = Some(ring_timeout);
        self
    }

    pub fn add_observer(&self, observer: Arc<dyn CallObserver>) -> ObserverId {
        let id = self.manager.add_observer(observer);
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        id
    }

    pub fn channel_key(&self) -> &str {
        &self.channel_key
    }

    pub fn local_user_id(&self) -> &str {
        self.manager.local_user_id()
    }

    pub fn manager(&self) -> &Arc<CallManager> {
        &self.manager
    }

    pub fn state(&self) -> CallState {
        self.manager.state()
    }

    pub fn session(&self) -> CallSession {
        self.manager.session()
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_active()
    }

    pub async fn start(
        &self,
        remote_user_id: &str,
        remote_name: &str,
        remote_photo: Option<String>,
        options: CallOptions,
    ) -> Result<CallInfo, CallError> {
        let result = self
            .manager
            .start_call(remote_user_id, remote_name, remote_photo, options)
            .await;
        self.log_failure("start", result)
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        let result = self.manager.accept_call(None).await;
        self.log_failure("accept", result)
    }

    pub async fn decline(&self) -> Result<(), CallError> {
        let result = self.manager.decline_call().await;
        self.log_failure("decline", result)
    }

    pub async fn end(&self) -> Result<(), CallError> {
        let result = self.manager.end_call().await;
        self.log_failure("end", result)
    }

    /// Clears a finished call so a new one can start.
    pub fn acknowledge(&self) -> Result<(), CallError> {
        let result = self.manager.acknowledge();
        self.log_failure("acknowledge", result)
    }

    /// Feeds an offer obtained outside the router, e.g. from a push
    /// notification.
    pub async fn set_incoming_call(
        &self,
        offer: SignalEnvelope,
    ) -> Result<OfferDisposition, CallError> {
        let result = if offer.to != self.local_user_id() {
            Err(CallError::UnknownRecipient(offer.to))
        } else {
            self.manager.receive_offer(offer).await
        };
        self.log_failure("set incoming call", result)
    }

    /// Unsubscribes from the router and removes this screen's observers.
    /// Idempotent. Also runs on drop.
    pub fn detach(&self) {
        if !self.subscription.is_active() {
            return;
        }
        self.subscription.unsubscribe();
        let ids: Vec<ObserverId> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for id in ids {
            self.manager.remove_observer(id);
        }
        if let Some(ring_timeout) = &self.ring_timeout {
            ring_timeout.cancel();
        }
        info!(target: "Calls/Screen", "[{}] Detached", self.channel_key);
    }

    fn log_failure<T>(&self, intent: &str, result: Result<T, CallError>) -> Result<T, CallError> {
        if let Err(e) = &result {
            warn!(
                target: "Calls/Screen",
                "[{}] {} failed: {} ({})",
                self.channel_key,
                intent,
                e,
                e.user_message()
            );
        }
        result
    }
}

impl Drop for CallScreen {
    fn drop(&mut self) {
        self.detach();
    }
}

type TimerSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

struct RingTimeout {
    manager: Weak<CallManager>,
    timeout: Duration,
    timer: TimerSlot,
}

impl RingTimeout {
    fn cancel(&self) {
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }
}

impl CallObserver for RingTimeout {
    fn on_state_change(&self, session: &CallSession) {
        self.cancel();
        if !session.state.is_ringing() {
            return;
        }
        let Some(call_id) = session.call_id().cloned() else {
            return;
        };

        let manager = self.manager.clone();
        let slot = self.timer.clone();
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Ending the call notifies this observer again; keep it from
            // aborting this task.
            slot.lock().unwrap_or_else(PoisonError::into_inner).take();

            let Some(manager) = manager.upgrade() else {
                return;
            };
            let session = manager.session();
            if session.state.is_ringing() && session.call_id() == Some(&call_id) {
                info!(target: "Calls/Screen", "Call {call_id} unanswered after {timeout:?}, hanging up");
                if let Err(e) = manager.end_call().await {
                    warn!(target: "Calls/Screen", "Failed to end unanswered call {call_id}: {e}");
                }
            }
        });
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::{CallRegistry, SignalType};
    use crate::client::RealtimeClient;
    use crate::config::ClientConfig;
    use crate::transport::mock::MockTransportFactory;
    use crate::types::events::CALL_SIGNAL;
    use serde_json::json;

    fn setup() -> (Arc<RealtimeClient>, Arc<CallRouter>) {
        let client = RealtimeClient::new(ClientConfig::default(), MockTransportFactory::new());
        let router = CallRouter::new(client.clone(), CallRegistry::new(client.clone()));
        (client, router)
    }

    async fn settle(manager: &CallManager, state: CallState) {
        for _ in 0..100 {
            if manager.state() == state {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_screens_share_identity_manager() {
        let (_client, router) = setup();
        let chat = CallScreen::attach("chat", "U1", &router);
        let matches = CallScreen::attach("matches", "U1", &router);

        assert!(Arc::ptr_eq(chat.manager(), matches.manager()));
        assert_eq!(router.channel_count("U1"), 2);
    }

    #[tokio::test]
    async fn test_incoming_offer_rings_screen() {
        let (client, router) = setup();
        let screen = CallScreen::attach("chat", "U1", &router);

        client.trigger(
            CALL_SIGNAL,
            &json!({"type": "offer", "callId": "C1", "from": "U2", "to": "U1",
                    "payload": {"callerName": "Dana"}}),
        );
        settle(screen.manager(), CallState::IncomingRinging).await;

        let session = screen.session();
        assert_eq!(session.state, CallState::IncomingRinging);
        assert_eq!(session.info.unwrap().remote_name, "Dana");

        screen.accept().await.unwrap();
        assert_eq!(screen.state(), CallState::Active);
    }

    #[tokio::test]
    async fn test_set_incoming_call_checks_recipient() {
        let (_client, router) = setup();
        let screen = CallScreen::attach("chat", "U1", &router);

        let stray = SignalEnvelope::new(SignalType::Offer, "C1".into(), "U2", "U5");
        assert!(matches!(
            screen.set_incoming_call(stray).await,
            Err(CallError::UnknownRecipient(_))
        ));

        let offer = SignalEnvelope::new(SignalType::Offer, "C1".into(), "U2", "U1");
        assert_eq!(
            screen.set_incoming_call(offer).await.unwrap(),
            OfferDisposition::Ringing
        );
    }

    #[tokio::test]
    async fn test_intent_failure_is_returned_not_panicked() {
        let (_client, router) = setup();
        let screen = CallScreen::attach("chat", "U1", &router);

        assert!(matches!(
            screen.decline().await,
            Err(CallError::InvalidTransition(_))
        ));
        assert!(screen.acknowledge().is_err());
        assert!(screen.state().is_idle());
    }

    #[tokio::test]
    async fn test_detach_releases_subscriptions() {
        let (_client, router) = setup();
        let screen = CallScreen::attach("chat", "U1", &router)
            .with_ring_timeout(Duration::from_secs(30));
        let manager = screen.manager().clone();
        assert_eq!(manager.observer_count(), 1);

        screen.detach();
        screen.detach();

        assert!(!screen.is_attached());
        assert_eq!(router.channel_count("U1"), 0);
        assert_eq!(manager.observer_count(), 0);

        drop(screen);
        assert_eq!(router.channel_count("U1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_timeout_hangs_up_unanswered_call() {
        let (_client, router) = setup();
        let screen = CallScreen::attach("chat", "U1", &router)
            .with_ring_timeout(Duration::from_secs(45));

        let info = screen
            .start("U2", "Dana", None, CallOptions::audio())
            .await
            .unwrap();
        assert_eq!(screen.state(), CallState::OutgoingRinging);

        tokio::time::sleep(Duration::from_secs(44)).await;
        assert_eq!(screen.state(), CallState::OutgoingRinging);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle(screen.manager(), CallState::Ended).await;
        assert_eq!(screen.state(), CallState::Ended);
        assert!(screen.session().info.unwrap().call_id == info.call_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_call_is_not_timed_out() {
        let (_client, router) = setup();
        let screen = CallScreen::attach("chat", "U1", &router)
            .with_ring_timeout(Duration::from_secs(45));

        let info = screen
            .start("U2", "Dana", None, CallOptions::audio())
            .await
            .unwrap();
        let answer = SignalEnvelope::new(SignalType::Answer, info.call_id, "U2", "U1");
        screen.manager().receive_answer(&answer).unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(screen.state(), CallState::Active);
    }
}
