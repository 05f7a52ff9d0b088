pub use pawcall_tokio_transport::{
    TokioWebSocketTransportFactory, Transport, TransportEvent, TransportFactory,
};

/// In-memory transport doubles used by the unit and integration tests.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use crate::framing::Frame;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use tokio::sync::mpsc;

    type FrameLog = Arc<Mutex<Vec<String>>>;

    /// A transport that records every frame it is asked to send.
    pub struct MockTransport {
        sent: FrameLog,
        fail_sends: Arc<AtomicBool>,
        closed: AtomicBool,
    }

    impl MockTransport {
        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_frame(&self, frame: &str) -> Result<(), anyhow::Error> {
            // Give other tasks a chance to interleave, like a real socket would.
            tokio::task::yield_now().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("Socket is closed"));
            }
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("mock send failure"));
            }
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(frame.to_string());
            Ok(())
        }

        async fn disconnect(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// A scriptable factory. Frames sent through any transport it created
    /// land in one shared log, standing in for "what the backend received".
    #[derive(Default)]
    pub struct MockTransportFactory {
        sent: FrameLog,
        fail_sends: Arc<AtomicBool>,
        fail_next_connects: AtomicUsize,
        connects: AtomicUsize,
        tokens: Mutex<Vec<String>>,
        transports: Mutex<Vec<Arc<MockTransport>>>,
        event_senders: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
    }

    impl MockTransportFactory {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Makes the next `count` connect attempts fail.
        pub fn fail_next_connects(&self, count: usize) {
            self.fail_next_connects.store(count, Ordering::SeqCst);
        }

        pub fn set_fail_sends(&self, fail: bool) {
            self.fail_sends.store(fail, Ordering::SeqCst);
        }

        /// Number of connect attempts, failed ones included.
        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn last_token(&self) -> Option<String> {
            self.tokens
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .last()
                .cloned()
        }

        pub fn sent_raw(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Decoded frames received by the "backend", oldest first.
        pub fn sent_frames(&self) -> Vec<Frame> {
            self.sent_raw()
                .iter()
                .filter_map(|raw| Frame::decode(raw).ok())
                .collect()
        }

        pub fn latest_transport(&self) -> Option<Arc<MockTransport>> {
            self.transports
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .last()
                .cloned()
        }

        fn latest_sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
            self.event_senders
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .last()
                .cloned()
        }

        /// Delivers a raw text frame on the most recent connection.
        pub async fn inject_raw(&self, text: impl Into<String>) -> bool {
            match self.latest_sender() {
                Some(tx) => tx
                    .send(TransportEvent::FrameReceived(text.into()))
                    .await
                    .is_ok(),
                None => false,
            }
        }

        /// Delivers an event from the "backend" on the most recent connection.
        pub async fn inject(&self, frame: Frame) -> bool {
            match frame.encode() {
                Ok(text) => self.inject_raw(text).await,
                Err(_) => false,
            }
        }

        /// Simulates the backend dropping the most recent connection.
        pub async fn drop_connection(&self) -> bool {
            if let Some(transport) = self.latest_transport() {
                transport.closed.store(true, Ordering::SeqCst);
            }
            match self.latest_sender() {
                Some(tx) => tx.send(TransportEvent::Disconnected).await.is_ok(),
                None => false,
            }
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
            token: &str,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.tokens
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(token.to_string());

            let pending_failures = self.fail_next_connects.load(Ordering::SeqCst);
            if pending_failures > 0 {
                self.fail_next_connects
                    .store(pending_failures - 1, Ordering::SeqCst);
                return Err(anyhow::anyhow!("mock connect failure"));
            }

            let transport = Arc::new(MockTransport {
                sent: self.sent.clone(),
                fail_sends: self.fail_sends.clone(),
                closed: AtomicBool::new(false),
            });
            let (tx, rx) = mpsc::channel(100);
            let _ = tx.try_send(TransportEvent::Connected);

            self.transports
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(transport.clone());
            self.event_senders
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(tx);

            Ok((transport, rx))
        }
    }
}
