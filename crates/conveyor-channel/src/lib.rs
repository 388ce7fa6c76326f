//!
//! Conveyor Channel - In-memory message channel
//!
//! Implements the [`MessageChannel`] trait with at-least-once queue
//! semantics: visibility timeouts, explicit acknowledge/reject, bounded
//! delivery attempts with poison routing, and oneshot-based reply
//! correlation keyed by run ID.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use conveyor_core::{
    ConveyorError, DataPacket, ExecutionReply, Message, MessageChannel, MessageId, PoisonHandler,
    ResponseHandle, RunId,
};

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// How long a dequeued message stays invisible before redelivery
    pub visibility_timeout: Duration,

    /// Delivery attempts before a message is routed to the poison handler
    pub max_deliver: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_deliver: 5,
        }
    }
}

struct QueuedMessage {
    message: Message,
    delivery_count: u32,
    available_at: Instant,
}

struct InFlightMessage {
    message: Message,
    delivery_count: u32,
    invisible_until: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedMessage>,
    in_flight: HashMap<String, InFlightMessage>,
}

// Run ID -> (registration token, reply slot). Shared with handle cleanup
// closures, which outlive any borrow of the channel.
type PendingReplies = Arc<StdMutex<HashMap<String, (u64, oneshot::Sender<ExecutionReply>)>>>;

/// In-memory, at-least-once message channel
///
/// Single work queue plus per-run reply slots. Messages survive consumer
/// failure through the visibility timeout; they do not survive process
/// restart, which is the documented scope of this implementation.
pub struct InMemoryMessageChannel {
    config: ChannelConfig,
    queue: Mutex<QueueState>,
    pending_replies: PendingReplies,
    registration_counter: AtomicU64,
    poison_handler: StdMutex<Option<PoisonHandler>>,
    poisoned: AtomicU64,
}

impl InMemoryMessageChannel {
    /// Create a channel with the given configuration
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            queue: Mutex::new(QueueState::default()),
            pending_replies: Arc::new(StdMutex::new(HashMap::new())),
            registration_counter: AtomicU64::new(0),
            poison_handler: StdMutex::new(None),
            poisoned: AtomicU64::new(0),
        }
    }

    /// Create a channel with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ChannelConfig::default())
    }

    /// Number of messages waiting for delivery
    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.ready.len()
    }

    /// Number of delivered, unacknowledged messages
    pub async fn in_flight_count(&self) -> usize {
        self.queue.lock().await.in_flight.len()
    }

    /// Number of messages routed to the poison handler so far
    pub fn poisoned_count(&self) -> u64 {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Move expired in-flight messages back to the queue, collecting any
    /// that have exhausted their delivery attempts
    fn reclaim_expired(&self, state: &mut QueueState, now: Instant) -> Vec<Message> {
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.invisible_until <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut poisoned = Vec::new();
        for id in expired {
            if let Some(entry) = state.in_flight.remove(&id) {
                if entry.delivery_count >= self.config.max_deliver {
                    poisoned.push(entry.message);
                } else {
                    debug!(message = %id, "Visibility timeout lapsed, requeueing");
                    state.ready.push_back(QueuedMessage {
                        message: entry.message,
                        delivery_count: entry.delivery_count,
                        available_at: now,
                    });
                }
            }
        }
        poisoned
    }

    fn route_to_poison(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let handler = self.poison_handler.lock().unwrap_or_else(|e| e.into_inner());
        for message in messages {
            warn!(
                message = %message.id,
                run = %message.run_id,
                "Delivery attempts exhausted, routing to poison handler"
            );
            self.poisoned.fetch_add(1, Ordering::SeqCst);
            if let Some(handler) = handler.as_ref() {
                handler(message);
            }
        }
    }

    fn deliver_reply(&self, run_id: &RunId, reply: ExecutionReply) {
        let taken = {
            let mut pending = self
                .pending_replies
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.remove(&run_id.0)
        };

        match taken {
            Some((_, sender)) => {
                if sender.send(reply).is_err() {
                    debug!(run = %run_id, "Reply receiver went away");
                }
            }
            // Publishing with nobody waiting is a no-op by contract
            None => debug!(run = %run_id, "No reply registration for run"),
        }
    }
}

#[async_trait]
impl MessageChannel for InMemoryMessageChannel {
    async fn enqueue(&self, message: Message) -> Result<(), ConveyorError> {
        let mut state = self.queue.lock().await;
        debug!(message = %message.id, run = %message.run_id, "Message enqueued");
        state.ready.push_back(QueuedMessage {
            message,
            delivery_count: 0,
            available_at: Instant::now(),
        });
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Message>, ConveyorError> {
        let now = Instant::now();
        let poisoned;
        let delivered;
        {
            let mut state = self.queue.lock().await;
            poisoned = self.reclaim_expired(&mut state, now);

            let position = state
                .ready
                .iter()
                .position(|queued| queued.available_at <= now);
            delivered = match position {
                Some(index) => state.ready.remove(index).map(|mut queued| {
                    queued.delivery_count += 1;
                    state.in_flight.insert(
                        queued.message.id.0.clone(),
                        InFlightMessage {
                            message: queued.message.clone(),
                            delivery_count: queued.delivery_count,
                            invisible_until: now + self.config.visibility_timeout,
                        },
                    );
                    queued.message
                }),
                None => None,
            };
        }

        self.route_to_poison(poisoned);
        Ok(delivered)
    }

    async fn acknowledge(&self, message_id: &MessageId) -> Result<(), ConveyorError> {
        let mut state = self.queue.lock().await;
        if state.in_flight.remove(&message_id.0).is_none() {
            // Late ack after a visibility reclaim; normal under
            // at-least-once delivery
            debug!(message = %message_id, "Acknowledge for unknown delivery");
        }
        Ok(())
    }

    async fn reject(
        &self,
        message_id: &MessageId,
        delay: Option<Duration>,
    ) -> Result<(), ConveyorError> {
        let poisoned;
        {
            let mut state = self.queue.lock().await;
            let entry = state.in_flight.remove(&message_id.0);
            poisoned = match entry {
                Some(entry) if entry.delivery_count >= self.config.max_deliver => {
                    vec![entry.message]
                }
                Some(entry) => {
                    let available_at = Instant::now() + delay.unwrap_or(Duration::ZERO);
                    state.ready.push_back(QueuedMessage {
                        message: entry.message,
                        delivery_count: entry.delivery_count,
                        available_at,
                    });
                    Vec::new()
                }
                None => {
                    debug!(message = %message_id, "Reject for unknown delivery");
                    Vec::new()
                }
            };
        }

        self.route_to_poison(poisoned);
        Ok(())
    }

    async fn enqueue_with_response(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<ResponseHandle, ConveyorError> {
        let run_id = message.run_id.clone();
        let (sender, receiver) = oneshot::channel();
        let token = self.registration_counter.fetch_add(1, Ordering::SeqCst);

        {
            let mut pending = self
                .pending_replies
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if pending.contains_key(&run_id.0) {
                return Err(ConveyorError::TransportFailure(format!(
                    "A reply registration already exists for run {}",
                    run_id
                )));
            }
            pending.insert(run_id.0.clone(), (token, sender));
        }

        if let Err(e) = self.enqueue(message).await {
            self.pending_replies
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&run_id.0);
            return Err(e);
        }

        // Cleanup evicts only its own registration, never a newer one
        // made after this handle lapsed
        let pending = self.pending_replies.clone();
        let run_key = run_id.0;
        let cleanup = Box::new(move || {
            let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.get(&run_key).map(|(t, _)| *t) == Some(token) {
                pending.remove(&run_key);
            }
        }) as Box<dyn FnOnce() + Send>;

        Ok(ResponseHandle::new(receiver, timeout, cleanup))
    }

    async fn publish_result(
        &self,
        run_id: &RunId,
        output: DataPacket,
    ) -> Result<(), ConveyorError> {
        self.deliver_reply(run_id, ExecutionReply::Result { output });
        Ok(())
    }

    async fn publish_error(
        &self,
        run_id: &RunId,
        error: &ConveyorError,
    ) -> Result<(), ConveyorError> {
        self.deliver_reply(run_id, ExecutionReply::from_error(error));
        Ok(())
    }

    async fn on_poison(&self, handler: PoisonHandler) -> Result<(), ConveyorError> {
        let mut slot = self.poison_handler.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn message(run: &str) -> Message {
        Message::new(RunId(run.to_string()), DataPacket::new(json!({"n": 1})))
    }

    fn channel(visibility: Duration, max_deliver: u32) -> InMemoryMessageChannel {
        InMemoryMessageChannel::new(ChannelConfig {
            visibility_timeout: visibility,
            max_deliver,
        })
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_acknowledge() {
        let channel = InMemoryMessageChannel::with_defaults();
        let msg = message("run1");
        let id = msg.id.clone();

        channel.enqueue(msg).await.unwrap();
        assert_eq!(channel.queue_depth().await, 1);

        let delivered = channel.dequeue().await.unwrap().unwrap();
        assert_eq!(delivered.id, id);
        assert_eq!(channel.queue_depth().await, 0);
        assert_eq!(channel.in_flight_count().await, 1);

        channel.acknowledge(&id).await.unwrap();
        assert_eq!(channel.in_flight_count().await, 0);
        assert!(channel.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_on_empty_queue_returns_none() {
        let channel = InMemoryMessageChannel::with_defaults();
        assert!(channel.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_messages_delivered_in_enqueue_order() {
        let channel = InMemoryMessageChannel::with_defaults();
        let first = message("run1");
        let second = message("run2");
        let first_id = first.id.clone();
        let second_id = second.id.clone();

        channel.enqueue(first).await.unwrap();
        channel.enqueue(second).await.unwrap();

        assert_eq!(channel.dequeue().await.unwrap().unwrap().id, first_id);
        assert_eq!(channel.dequeue().await.unwrap().unwrap().id, second_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_message_is_redelivered() {
        let channel = channel(Duration::from_millis(100), 5);
        let msg = message("run1");
        let id = msg.id.clone();

        channel.enqueue(msg).await.unwrap();
        channel.dequeue().await.unwrap().unwrap();
        assert!(channel.dequeue().await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(150)).await;
        let redelivered = channel.dequeue().await.unwrap().unwrap();
        assert_eq!(redelivered.id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_with_delay_defers_redelivery() {
        let channel = channel(Duration::from_secs(30), 5);
        let msg = message("run1");
        let id = msg.id.clone();

        channel.enqueue(msg).await.unwrap();
        channel.dequeue().await.unwrap().unwrap();
        channel
            .reject(&id, Some(Duration::from_millis(200)))
            .await
            .unwrap();

        assert!(channel.dequeue().await.unwrap().is_none());
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(channel.dequeue().await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn test_poison_routing_after_max_deliveries() {
        let channel = channel(Duration::from_secs(30), 2);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        channel
            .on_poison(Box::new(move |_msg| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        let msg = message("run1");
        let id = msg.id.clone();
        channel.enqueue(msg).await.unwrap();

        // Two deliveries, each rejected; the second rejection poisons
        channel.dequeue().await.unwrap().unwrap();
        channel.reject(&id, None).await.unwrap();
        channel.dequeue().await.unwrap().unwrap();
        channel.reject(&id, None).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(channel.poisoned_count(), 1);
        assert!(channel.dequeue().await.unwrap().is_none());
        assert_eq!(channel.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_reply_round_trip() {
        let channel = InMemoryMessageChannel::with_defaults();
        let msg = message("run1");
        let run_id = msg.run_id.clone();

        let handle = channel
            .enqueue_with_response(msg, Duration::from_secs(1))
            .await
            .unwrap();

        channel
            .publish_result(&run_id, DataPacket::new(json!({"done": true})))
            .await
            .unwrap();

        let reply = handle.wait().await.unwrap();
        match reply {
            Some(ExecutionReply::Result { output }) => {
                assert_eq!(output.as_value()["done"], true);
            }
            other => panic!("Expected result reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_reply_registration_is_rejected() {
        let channel = InMemoryMessageChannel::with_defaults();
        let first = message("run1");
        let second = Message::new(RunId("run1".to_string()), DataPacket::null());

        let _handle = channel
            .enqueue_with_response(first, Duration::from_secs(1))
            .await
            .unwrap();

        let result = channel
            .enqueue_with_response(second, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ConveyorError::TransportFailure(_))));
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_registration() {
        let channel = InMemoryMessageChannel::with_defaults();
        let first = message("run1");
        let second = Message::new(RunId("run1".to_string()), DataPacket::null());

        let handle = channel
            .enqueue_with_response(first, Duration::from_secs(1))
            .await
            .unwrap();
        drop(handle);

        // The run ID can be awaited again
        let result = channel
            .enqueue_with_response(second, Duration::from_secs(1))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_publish_without_registration_is_noop() {
        let channel = InMemoryMessageChannel::with_defaults();
        let run_id = RunId("nobody".to_string());

        channel
            .publish_result(&run_id, DataPacket::null())
            .await
            .unwrap();
        channel
            .publish_error(&run_id, &ConveyorError::Timeout("late".to_string()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_error_carries_classification() {
        let channel = InMemoryMessageChannel::with_defaults();
        let msg = message("run1");
        let run_id = msg.run_id.clone();

        let handle = channel
            .enqueue_with_response(msg, Duration::from_secs(1))
            .await
            .unwrap();
        channel
            .publish_error(&run_id, &ConveyorError::CircuitOpen("antifraud".to_string()))
            .await
            .unwrap();

        match handle.wait().await.unwrap() {
            Some(ExecutionReply::Error { class, .. }) => assert_eq!(class, "circuit_open"),
            other => panic!("Expected error reply, got {:?}", other),
        }
    }
}
