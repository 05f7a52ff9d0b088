//! Call manager for orchestrating call lifecycle.

use super::error::CallError;
use super::signaling::{
    CallId, CallOptions, SignalEnvelope, SignalSender, SignalType, reason,
};
use super::state::{CallInfo, CallSession, CallState, CallTransition, InvalidTransition};
use crate::client::EmitOutcome;
use crate::types::events::invoke_isolated;
use log::{debug, info, warn};
use scopeguard::ScopeGuard;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;

/// Receives call state changes and errors.
///
/// Callbacks run synchronously right after the session is updated and
/// must not block.
pub trait CallObserver: Send + Sync {
    fn on_state_change(&self, session: &CallSession);

    fn on_error(&self, _error: &CallError) {}

    /// An `ice` envelope for the live call. Media negotiation is up to the
    /// observer.
    fn on_media_signal(&self, _envelope: &SignalEnvelope) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// What happened to an inbound offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    /// The machine moved to `IncomingRinging`.
    Ringing,
    /// A retry of the call already ringing or active; ignored.
    Duplicate,
    /// Another call is live; a busy hangup was sent back.
    Busy,
}

type IntentGuard<'a> = ScopeGuard<&'a AtomicBool, fn(&AtomicBool)>;

fn release_intent(flag: &AtomicBool) {
    flag.store(false, Ordering::SeqCst);
}

/// The call state machine of one local identity.
///
/// Holds at most one call. Local intents are single-flight: an intent issued
/// while another is still awaiting its signal send is rejected instead of
/// interleaving. Inbound envelopes are applied in arrival order by a
/// dedicated task fed through [`CallManager::deliver`].
pub struct CallManager {
    local_user_id: String,
    signaler: Arc<dyn SignalSender>,
    session: Mutex<CallSession>,
    /// Snapshots waiting to be handed to observers, in revision order.
    pending_notifications: Mutex<VecDeque<CallSession>>,
    notifying: AtomicBool,
    observers: RwLock<Vec<(ObserverId, Arc<dyn CallObserver>)>>,
    next_observer_id: AtomicU64,
    intent_in_flight: AtomicBool,
    inbox: mpsc::UnboundedSender<SignalEnvelope>,
}

impl CallManager {
    /// Creates the machine and its inbound worker. Must be called from
    /// within a tokio runtime.
    pub fn new(local_user_id: impl Into<String>, signaler: Arc<dyn SignalSender>) -> Arc<Self> {
        let (inbox, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            local_user_id: local_user_id.into(),
            signaler,
            session: Mutex::new(CallSession::default()),
            pending_notifications: Mutex::new(VecDeque::new()),
            notifying: AtomicBool::new(false),
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            intent_in_flight: AtomicBool::new(false),
            inbox,
        });
        tokio::spawn(Self::run_inbox(Arc::downgrade(&manager), rx));
        manager
    }

    async fn run_inbox(manager: Weak<Self>, mut rx: mpsc::UnboundedReceiver<SignalEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            if let Err(e) = manager.handle_signal(envelope).await {
                warn!(target: "Calls/Manager", "[{}] Failed to handle signal: {e}", manager.local_user_id);
            }
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn state(&self) -> CallState {
        self.lock_session().state
    }

    /// A snapshot of the current session.
    pub fn session(&self) -> CallSession {
        self.lock_session().clone()
    }

    /// Whether `call_id` is the call currently ringing, active or ending.
    pub fn is_tracking(&self, call_id: &CallId) -> bool {
        self.lock_session().tracks_live_call(call_id)
    }

    pub fn add_observer(&self, observer: Arc<dyn CallObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::SeqCst));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        before != observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queues an inbound envelope for ordered processing.
    pub fn deliver(&self, envelope: SignalEnvelope) {
        if self.inbox.send(envelope).is_err() {
            warn!(target: "Calls/Manager", "[{}] Inbound worker is gone, dropping signal", self.local_user_id);
        }
    }

    // Intents

    /// Places an outgoing call. Fails with `AlreadyInCall` unless idle.
    pub async fn start_call(
        &self,
        remote_user_id: &str,
        remote_name: &str,
        remote_photo: Option<String>,
        options: CallOptions,
    ) -> Result<CallInfo, CallError> {
        let result = self
            .start_call_inner(remote_user_id, remote_name, remote_photo, options)
            .await;
        self.report(result)
    }

    async fn start_call_inner(
        &self,
        remote_user_id: &str,
        remote_name: &str,
        remote_photo: Option<String>,
        options: CallOptions,
    ) -> Result<CallInfo, CallError> {
        let _intent = self.begin_intent("start")?;
        if remote_user_id.is_empty() || remote_user_id == self.local_user_id {
            return Err(CallError::UnknownRecipient(remote_user_id.to_string()));
        }

        let info = CallInfo::new_outgoing(
            CallId::generate(),
            remote_user_id,
            remote_name,
            remote_photo,
            options.video,
        );
        self.transition(CallTransition::StartOutgoing(info.clone()))
            .map_err(|e| match e {
                CallError::InvalidTransition(_) => CallError::AlreadyInCall,
                other => other,
            })?;
        info!(
            target: "Calls/Manager",
            "[{}] Calling {} (call {})",
            self.local_user_id, remote_user_id, info.call_id
        );

        let offer = SignalEnvelope::new(
            SignalType::Offer,
            info.call_id.clone(),
            &self.local_user_id,
            remote_user_id,
        )
        .with_payload(options.offer_payload());
        self.send_or_fail(&info.call_id, &offer).await?;
        Ok(info)
    }

    /// Answers the ringing incoming call.
    pub async fn accept_call(&self, answer: Option<Value>) -> Result<(), CallError> {
        let result = self.accept_call_inner(answer).await;
        self.report(result)
    }

    async fn accept_call_inner(&self, answer: Option<Value>) -> Result<(), CallError> {
        let _intent = self.begin_intent("accept")?;
        let info = self.live_info(CallTransition::LocalAccepted)?;

        let mut envelope = SignalEnvelope::new(
            SignalType::Answer,
            info.call_id.clone(),
            &self.local_user_id,
            &info.remote_user_id,
        );
        envelope.payload = answer;
        info!(target: "Calls/Manager", "[{}] Accepted call {}", self.local_user_id, info.call_id);
        self.send_or_fail(&info.call_id, &envelope).await?;
        Ok(())
    }

    /// Rejects the ringing incoming call. The local state ends up `Ended`
    /// even if the hangup cannot be sent; observers get the send error.
    pub async fn decline_call(&self) -> Result<(), CallError> {
        let result = self.decline_call_inner().await;
        self.report(result)
    }

    async fn decline_call_inner(&self) -> Result<(), CallError> {
        let _intent = self.begin_intent("decline")?;
        let info = self.live_info(CallTransition::LocalDeclined)?;
        info!(target: "Calls/Manager", "[{}] Declined call {}", self.local_user_id, info.call_id);
        self.send_hangup(&info, reason::DECLINED).await;
        Ok(())
    }

    /// Hangs up the live call: `Ending`, send hangup, `Ended`. Always
    /// completes locally.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let result = self.end_call_inner().await;
        self.report(result)
    }

    async fn end_call_inner(&self) -> Result<(), CallError> {
        let _intent = self.begin_intent("end")?;
        let info = self.live_info(CallTransition::LocalEnding)?;
        info!(target: "Calls/Manager", "[{}] Ending call {}", self.local_user_id, info.call_id);

        self.send_hangup(&info, reason::ENDED).await;

        // A remote hangup may have finished the call while we were sending.
        self.transition_if(|session| {
            (session.state == CallState::Ending && session.call_id() == Some(&info.call_id))
                .then_some(CallTransition::Hungup)
        })?;
        Ok(())
    }

    /// Returns a finished machine (`Ended` or `Failed`) to `Idle`.
    pub fn acknowledge(&self) -> Result<(), CallError> {
        let result = self.transition(CallTransition::Acknowledged).map(|_| ());
        self.report(result)
    }

    /// Moves the live call to `Failed`, recording `error`. No-op without a
    /// live call.
    pub fn fail_call(&self, error: &str) -> Result<bool, CallError> {
        let failed = self.transition_if(|session| {
            session.state.is_live().then(|| CallTransition::Failed {
                error: error.to_string(),
            })
        })?;
        Ok(failed.is_some())
    }

    // Inbound signals

    /// Applies one inbound envelope addressed to this identity.
    pub async fn handle_signal(&self, envelope: SignalEnvelope) -> Result<(), CallError> {
        if envelope.to != self.local_user_id {
            return self.report(Err(CallError::UnknownRecipient(envelope.to)));
        }
        match envelope.signal_type {
            SignalType::Offer => self.receive_offer(envelope).await.map(|_| ()),
            SignalType::Answer => self.receive_answer(&envelope).map(|_| ()),
            SignalType::Hangup => self.receive_hangup(&envelope).map(|_| ()),
            SignalType::Ice => {
                self.receive_ice(&envelope);
                Ok(())
            }
        }
    }

    /// Rings for an inbound offer if idle. While another call is live the
    /// state is left alone and a busy hangup goes back to the caller.
    pub async fn receive_offer(
        &self,
        offer: SignalEnvelope,
    ) -> Result<OfferDisposition, CallError> {
        let info = CallInfo::from_offer(&offer);
        let mut disposition = OfferDisposition::Busy;
        self.transition_if(|session| {
            if session.tracks_live_call(&offer.call_id) {
                disposition = OfferDisposition::Duplicate;
                None
            } else if session.state.is_idle() {
                disposition = OfferDisposition::Ringing;
                Some(CallTransition::OfferReceived(info))
            } else {
                None
            }
        })?;

        match disposition {
            OfferDisposition::Ringing => {
                info!(
                    target: "Calls/Manager",
                    "[{}] Incoming call {} from {}",
                    self.local_user_id, offer.call_id, offer.from
                );
            }
            OfferDisposition::Duplicate => {
                debug!(
                    target: "Calls/Manager",
                    "[{}] Ignoring duplicate offer for call {}",
                    self.local_user_id, offer.call_id
                );
            }
            OfferDisposition::Busy => {
                warn!(
                    target: "Calls/Manager",
                    "[{}] Busy, rejecting call {} from {}",
                    self.local_user_id, offer.call_id, offer.from
                );
                let busy = SignalEnvelope::hangup(
                    offer.call_id.clone(),
                    &self.local_user_id,
                    &offer.from,
                    reason::BUSY,
                );
                if let Err(e) = self.signaler.send_signal(&busy).await {
                    warn!(target: "Calls/Manager", "Failed to send busy signal: {e}");
                }
                self.notify_error(&CallError::AlreadyInCall);
            }
        }
        Ok(disposition)
    }

    /// Returns whether the answer moved the call to `Active`. Repeated or
    /// unrelated answers are ignored.
    pub fn receive_answer(&self, answer: &SignalEnvelope) -> Result<bool, CallError> {
        let applied = self.transition_if(|session| {
            (session.state == CallState::OutgoingRinging
                && session.call_id() == Some(&answer.call_id))
            .then_some(CallTransition::RemoteAnswered)
        })?;
        if applied.is_none() {
            debug!(target: "Calls/Manager", "[{}] Ignoring answer for call {}", self.local_user_id, answer.call_id);
        }
        Ok(applied.is_some())
    }

    /// Returns whether the hangup ended the live call.
    pub fn receive_hangup(&self, hangup: &SignalEnvelope) -> Result<bool, CallError> {
        let reason = hangup.hangup_reason().unwrap_or(reason::ENDED).to_string();
        let applied = self.transition_if(|session| {
            session
                .tracks_live_call(&hangup.call_id)
                .then_some(CallTransition::RemoteHangup { reason })
        })?;
        match applied {
            Some(_) => info!(
                target: "Calls/Manager",
                "[{}] Call {} hung up by {}",
                self.local_user_id, hangup.call_id, hangup.from
            ),
            None => debug!(
                target: "Calls/Manager",
                "[{}] Ignoring hangup for call {}",
                self.local_user_id, hangup.call_id
            ),
        }
        Ok(applied.is_some())
    }

    fn receive_ice(&self, envelope: &SignalEnvelope) {
        if !self.is_tracking(&envelope.call_id) {
            debug!(target: "Calls/Manager", "[{}] Ignoring ice for call {}", self.local_user_id, envelope.call_id);
            return;
        }
        for observer in self.observer_snapshot() {
            invoke_isolated("call media observer", || observer.on_media_signal(envelope));
        }
    }

    // Internals

    fn begin_intent(&self, intent: &str) -> Result<IntentGuard<'_>, CallError> {
        if self.intent_in_flight.swap(true, Ordering::SeqCst) {
            debug!(target: "Calls/Manager", "[{}] Rejecting re-entrant {intent}", self.local_user_id);
            return Err(if intent == "start" {
                CallError::AlreadyInCall
            } else {
                CallError::InvalidTransition(InvalidTransition {
                    current_state: format!("{:?}", self.state()),
                    attempted: format!("{intent} while another call action is in progress"),
                })
            });
        }
        Ok(scopeguard::guard(
            &self.intent_in_flight,
            release_intent as fn(&AtomicBool),
        ))
    }

    /// Applies `transition` and returns the info of the call it applied to.
    fn live_info(&self, transition: CallTransition) -> Result<CallInfo, CallError> {
        let session = self.transition(transition)?;
        session.info.ok_or_else(|| {
            CallError::InvalidSignal("call session has no call info".to_string())
        })
    }

    async fn send_or_fail(
        &self,
        call_id: &CallId,
        envelope: &SignalEnvelope,
    ) -> Result<EmitOutcome, CallError> {
        match self.signaler.send_signal(envelope).await {
            Ok(EmitOutcome::Queued) => {
                debug!(
                    target: "Calls/Manager",
                    "{} for call {} queued until reconnect",
                    envelope.signal_type, call_id
                );
                Ok(EmitOutcome::Queued)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(target: "Calls/Manager", "Failed to send {} for call {}: {e}", envelope.signal_type, call_id);
                let error = e.to_string();
                self.transition_if(|session| {
                    session
                        .tracks_live_call(call_id)
                        .then(|| CallTransition::Failed { error })
                })?;
                Err(CallError::Transport(e))
            }
        }
    }

    async fn send_hangup(&self, info: &CallInfo, reason: &str) {
        let hangup = SignalEnvelope::hangup(
            info.call_id.clone(),
            &self.local_user_id,
            &info.remote_user_id,
            reason,
        );
        if let Err(e) = self.signaler.send_signal(&hangup).await {
            warn!(
                target: "Calls/Manager",
                "Failed to send hangup for call {}: {e}, finishing locally",
                info.call_id
            );
            // The call still ends here, but the peer was never told.
            self.notify_error(&CallError::Transport(e));
        }
    }

    fn transition(&self, transition: CallTransition) -> Result<CallSession, CallError> {
        let mut transition = Some(transition);
        self.transition_if(|_| transition.take())?
            .ok_or_else(|| CallError::InvalidSignal("transition was not applied".to_string()))
    }

    /// Decides and applies a transition atomically against the current
    /// session. `decide` returning `None` leaves the session untouched.
    fn transition_if(
        &self,
        decide: impl FnOnce(&CallSession) -> Option<CallTransition>,
    ) -> Result<Option<CallSession>, CallError> {
        let snapshot = {
            let mut session = self.lock_session();
            let Some(transition) = decide(&session) else {
                return Ok(None);
            };
            session.apply_transition(transition)?;
            let snapshot = session.clone();
            self.pending_notifications
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(snapshot.clone());
            snapshot
        };
        debug!(
            target: "Calls/Manager",
            "[{}] State -> {:?} (revision {})",
            self.local_user_id, snapshot.state, snapshot.revision
        );
        self.drain_notifications();
        Ok(Some(snapshot))
    }

    /// Delivers queued snapshots to observers in revision order. A transition
    /// made from inside an observer is delivered after the current one.
    fn drain_notifications(&self) {
        loop {
            if self.notifying.swap(true, Ordering::SeqCst) {
                return;
            }
            while let Some(snapshot) = self.pop_notification() {
                for observer in self.observer_snapshot() {
                    invoke_isolated("call observer", || observer.on_state_change(&snapshot));
                }
            }
            self.notifying.store(false, Ordering::SeqCst);
            if self
                .pending_notifications
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
            {
                return;
            }
        }
    }

    fn pop_notification(&self) -> Option<CallSession> {
        self.pending_notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn report<T>(&self, result: Result<T, CallError>) -> Result<T, CallError> {
        if let Err(e) = &result {
            self.notify_error(e);
        }
        result
    }

    fn notify_error(&self, error: &CallError) {
        for observer in self.observer_snapshot() {
            invoke_isolated("call error observer", || observer.on_error(error));
        }
    }

    fn observer_snapshot(&self) -> Vec<Arc<dyn CallObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect()
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, CallSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
