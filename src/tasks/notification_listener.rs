use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::models::notification::decode_payload;
use crate::services::reconciliation::ReconciliationService;
use crate::tasks::transport::{NotificationTransport, TransportMessage};

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the single background task that pulls billing notifications and feeds
/// them to the reconciliation service.
pub struct NotificationListener {
    service: Arc<ReconciliationService>,
    transport: Arc<dyn NotificationTransport>,
    max_messages: usize,
    poll_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl NotificationListener {
    pub fn new(
        service: Arc<ReconciliationService>,
        transport: Arc<dyn NotificationTransport>,
        max_messages: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            service,
            transport,
            max_messages: max_messages.max(1),
            poll_interval,
            running: Mutex::new(None),
        }
    }

    /// Spawns the pull loop. Returns `false` without spawning when it is already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            log::debug!("Notification listener already running");
            return false;
        }

        let (shutdown, signal) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            self.service.clone(),
            self.transport.clone(),
            self.max_messages,
            self.poll_interval,
            signal,
        ));
        *running = Some(Running { shutdown, handle });

        log::info!("Notification listener started");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Signals the loop to stop and waits up to `grace` for the in-flight batch.
    /// Messages still unsettled after that are redelivered by the transport.
    pub async fn stop(&self, grace: Duration) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(Running { shutdown, mut handle }) = running else {
            return;
        };

        let _ = shutdown.send(true);
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => log::info!("Notification listener stopped"),
            Err(_) => {
                log::warn!(
                    "Notification listener did not stop within {:?}; aborting",
                    grace
                );
                handle.abort();
            }
        }
    }
}

async fn run_loop(
    service: Arc<ReconciliationService>,
    transport: Arc<dyn NotificationTransport>,
    max_messages: usize,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let pulled = tokio::select! {
            _ = shutdown.changed() => break,
            pulled = transport.pull(max_messages) => pulled,
        };

        let messages = match pulled {
            Ok(messages) => messages,
            Err(e) => {
                log::error!("Failed to pull billing notifications: {}", e);
                Vec::new()
            }
        };

        if messages.is_empty() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        }

        for message in messages {
            handle_message(&service, transport.as_ref(), message).await;
        }
    }
}

/// Decodes and dispatches one message, then settles it with the transport.
async fn handle_message(
    service: &ReconciliationService,
    transport: &dyn NotificationTransport,
    message: TransportMessage,
) {
    let payload = match decode_payload(&message.data) {
        Ok(payload) => payload,
        Err(e) => {
            // Redelivery cannot fix a body that does not decode.
            log::error!("Dropping undecodable message {}: {}", message.message_id, e);
            settle(transport, &message, true).await;
            return;
        }
    };
    log::debug!("Billing notification {}: {}", message.message_id, payload);

    match service.process_notification(&payload).await {
        Ok(outcome) => {
            if outcome.success {
                log::info!("Notification {}: {}", message.message_id, outcome.message);
            } else {
                log::warn!("Notification {} not applied: {}", message.message_id, outcome.message);
            }
            settle(transport, &message, true).await;
        }
        Err(e) => {
            log::error!(
                "Notification {} failed, leaving it for redelivery: {}",
                message.message_id,
                e
            );
            settle(transport, &message, false).await;
        }
    }
}

async fn settle(transport: &dyn NotificationTransport, message: &TransportMessage, ack: bool) {
    let result = if ack {
        transport.ack(&message.ack_id).await
    } else {
        transport.nack(&message.ack_id).await
    };
    if let Err(e) = result {
        log::error!("Failed to settle message {}: {}", message.message_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::errors::SubscriptionError;
    use crate::models::receipt::{Receipt, VerificationResult};
    use crate::models::subscription::{Provider, SubscriptionStatus};
    use crate::services::memory_store::MemoryStore;
    use crate::services::store::SubscriptionStore;
    use crate::services::verifier::ReceiptVerifier;
    use crate::tasks::transport::TransportError;
    use async_trait::async_trait;
    use base64::{engine::general_purpose, Engine as _};
    use serde_json::json;
    use std::collections::VecDeque;

    struct NoVerifier;

    #[async_trait]
    impl ReceiptVerifier for NoVerifier {
        async fn verify(
            &self,
            provider: Provider,
            _receipt: &Receipt,
        ) -> Result<VerificationResult, SubscriptionError> {
            Err(SubscriptionError::UnsupportedProvider(provider.to_string()))
        }
    }

    #[derive(Default)]
    struct QueueTransport {
        queue: Mutex<VecDeque<TransportMessage>>,
        acked: Mutex<Vec<String>>,
        nacked: Mutex<Vec<String>>,
    }

    impl QueueTransport {
        fn push(&self, ack_id: &str, data: Vec<u8>) {
            self.queue.lock().unwrap().push_back(TransportMessage {
                ack_id: ack_id.to_string(),
                message_id: format!("msg-{}", ack_id),
                data,
            });
        }

        fn acked(&self) -> Vec<String> {
            self.acked.lock().unwrap().clone()
        }

        fn nacked(&self) -> Vec<String> {
            self.nacked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationTransport for QueueTransport {
        async fn pull(&self, max_messages: usize) -> Result<Vec<TransportMessage>, TransportError> {
            let mut queue = self.queue.lock().unwrap();
            let count = max_messages.min(queue.len());
            Ok(queue.drain(..count).collect())
        }

        async fn ack(&self, ack_id: &str) -> Result<(), TransportError> {
            self.acked.lock().unwrap().push(ack_id.to_string());
            Ok(())
        }

        async fn nack(&self, ack_id: &str) -> Result<(), TransportError> {
            self.nacked.lock().unwrap().push(ack_id.to_string());
            Ok(())
        }
    }

    fn service(store: &MemoryStore) -> Arc<ReconciliationService> {
        Arc::new(ReconciliationService::new(
            Arc::new(store.clone()),
            Arc::new(NoVerifier),
            AppConfig::default(),
        ))
    }

    fn direct_purchase(user_id: i64, token: &str) -> Vec<u8> {
        json!({
            "purchaseToken": token,
            "subscriptionId": "pro_plan_monthly",
            "userId": user_id
        })
        .to_string()
        .into_bytes()
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_joins() {
        let store = MemoryStore::new();
        let transport = Arc::new(QueueTransport::default());
        let listener =
            NotificationListener::new(service(&store), transport, 10, Duration::from_millis(10));

        assert!(!listener.is_running());
        assert!(listener.start());
        assert!(!listener.start());
        assert!(listener.is_running());

        listener.stop(Duration::from_secs(1)).await;
        assert!(!listener.is_running());

        assert!(listener.start());
        listener.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_processes_and_acks_messages() {
        let store = MemoryStore::new();
        let transport = Arc::new(QueueTransport::default());

        let wrapped = json!({
            "message": {
                "data": general_purpose::STANDARD.encode(direct_purchase(42, "tok-1")),
                "messageId": "1"
            }
        });
        transport.push("ack-1", wrapped.to_string().into_bytes());
        transport.push("ack-2", direct_purchase(43, "tok-2"));
        transport.push("ack-3", b"{not json".to_vec());
        transport.push(
            "ack-4",
            json!({"subscriptionNotification": {
                "purchaseToken": "tok-unknown",
                "subscriptionId": "pro_plan_monthly",
                "notificationType": 2
            }})
            .to_string()
            .into_bytes(),
        );

        let listener = NotificationListener::new(
            service(&store),
            transport.clone(),
            2,
            Duration::from_millis(10),
        );
        listener.start();
        wait_until(|| transport.acked().len() == 4).await;
        listener.stop(Duration::from_secs(1)).await;

        assert_eq!(transport.acked(), vec!["ack-1", "ack-2", "ack-3", "ack-4"]);
        assert!(transport.nacked().is_empty());
        let first = store.find_active(42).await.unwrap().unwrap();
        assert_eq!(first.status, SubscriptionStatus::Active);
        assert!(store.find_active(43).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreadable_message_does_not_block_batch() {
        let store = MemoryStore::new();
        let transport = Arc::new(QueueTransport::default());
        transport.push("ack-1", Vec::new());
        transport.push("ack-2", direct_purchase(42, "tok-1"));

        let listener = NotificationListener::new(
            service(&store),
            transport.clone(),
            10,
            Duration::from_millis(10),
        );
        listener.start();
        wait_until(|| transport.acked().len() == 2).await;
        listener.stop(Duration::from_secs(1)).await;

        assert_eq!(transport.acked(), vec!["ack-1", "ack-2"]);
        assert!(transport.nacked().is_empty());
        assert!(store.find_active(42).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_failure_nacks_and_keeps_running() {
        let store = MemoryStore::new();
        store.fail_history_writes(true);
        let transport = Arc::new(QueueTransport::default());
        transport.push("ack-1", direct_purchase(42, "tok-1"));

        let listener = NotificationListener::new(
            service(&store),
            transport.clone(),
            10,
            Duration::from_millis(10),
        );
        listener.start();
        wait_until(|| transport.nacked().len() == 1).await;
        assert!(listener.is_running());

        store.fail_history_writes(false);
        transport.push("ack-1", direct_purchase(42, "tok-1"));
        wait_until(|| transport.acked().len() == 1).await;
        listener.stop(Duration::from_secs(1)).await;

        assert_eq!(transport.nacked(), vec!["ack-1"]);
        assert!(store.find_active(42).await.unwrap().is_some());
    }
}
