use crate::client::{EmitOutcome, RealtimeClient};
use crate::error::TransportError;
use crate::types::events::{MESSAGE_SEND, RealtimeEvent, Subscriber};
use chrono::{DateTime, Utc};
use log::debug;
use rand::RngCore;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// A chat message as sent on `message_send`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub id: String,
    pub match_id: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl OutgoingMessage {
    fn new(match_id: &str, body: &str) -> Self {
        let mut id = [0u8; 8];
        rand::rng().fill_bytes(&mut id);
        Self {
            id: hex::encode(id),
            match_id: match_id.to_string(),
            body: body.to_string(),
            sent_at: Utc::now(),
        }
    }
}

/// Chat and presence events on the shared realtime connection.
///
/// Payload schemas belong to the chat backend; this only names the events.
pub struct ChatEvents<'a> {
    client: &'a RealtimeClient,
}

impl<'a> ChatEvents<'a> {
    pub(crate) fn new(client: &'a RealtimeClient) -> Self {
        Self { client }
    }

    pub async fn send_message(
        &self,
        match_id: &str,
        body: &str,
    ) -> Result<(OutgoingMessage, EmitOutcome), TransportError> {
        let message = OutgoingMessage::new(match_id, body);
        debug!(target: "Chat", "Sending message {} to match {}", message.id, match_id);
        let outcome = self
            .client
            .emit(MESSAGE_SEND, serde_json::to_value(&message)?)
            .await?;
        Ok((message, outcome))
    }

    pub async fn set_typing(
        &self,
        match_id: &str,
        typing: bool,
    ) -> Result<EmitOutcome, TransportError> {
        self.client
            .emit(
                RealtimeEvent::UserTyping.as_str(),
                json!({ "matchId": match_id, "isTyping": typing }),
            )
            .await
    }

    /// Subscribes `handler` to `event`. Keep the returned handle to
    /// unsubscribe with [`ChatEvents::off`].
    pub fn on<F>(&self, event: RealtimeEvent, handler: F) -> Subscriber
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let subscriber: Subscriber = Arc::new(handler);
        self.client.on(event.as_str(), subscriber.clone());
        subscriber
    }

    pub fn off(&self, event: RealtimeEvent, subscriber: &Subscriber) {
        self.client.off(event.as_str(), subscriber);
    }

    pub fn on_match_created<F>(&self, handler: F) -> Subscriber
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on(RealtimeEvent::MatchCreated, handler)
    }

    pub fn on_message_received<F>(&self, handler: F) -> Subscriber
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on(RealtimeEvent::MessageReceived, handler)
    }

    pub fn on_notification<F>(&self, handler: F) -> Subscriber
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on(RealtimeEvent::Notification, handler)
    }

    pub fn on_user_online<F>(&self, handler: F) -> Subscriber
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on(RealtimeEvent::UserOnline, handler)
    }

    pub fn on_user_offline<F>(&self, handler: F) -> Subscriber
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on(RealtimeEvent::UserOffline, handler)
    }

    pub fn on_user_typing<F>(&self, handler: F) -> Subscriber
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on(RealtimeEvent::UserTyping, handler)
    }
}

impl RealtimeClient {
    pub fn chat(&self) -> ChatEvents<'_> {
        ChatEvents::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::mock::MockTransportFactory;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_send_message_and_typing() {
        let factory = MockTransportFactory::new();
        let client = RealtimeClient::new(ClientConfig::default(), factory.clone());
        client.set_identity_token("secret");
        client.connect().await.unwrap();

        let (message, outcome) = client.chat().send_message("x1", "Is Biscuit still available?").await.unwrap();
        client.chat().set_typing("x1", true).await.unwrap();

        assert_eq!(outcome, EmitOutcome::Delivered);
        let frames = factory.sent_frames();
        assert_eq!(frames[0].event, "message_send");
        assert_eq!(frames[0].data["id"], message.id.as_str());
        assert_eq!(frames[0].data["matchId"], "x1");
        assert_eq!(frames[1].event, "user_typing");
        assert_eq!(frames[1].data, json!({"matchId": "x1", "isTyping": true}));

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_event_helpers_subscribe_by_name() {
        let client = RealtimeClient::new(ClientConfig::default(), MockTransportFactory::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let handle = client.chat().on_user_online(move |payload| {
            sink.lock().unwrap().push(payload.clone());
        });

        client.trigger("user_online", &json!({"userId": "U2"}));
        client.chat().off(RealtimeEvent::UserOnline, &handle);
        client.trigger("user_online", &json!({"userId": "U3"}));

        assert_eq!(*seen.lock().unwrap(), vec![json!({"userId": "U2"})]);
    }
}
