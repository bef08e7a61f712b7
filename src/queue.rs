//! In-process control queue with visibility timeouts and a dead-letter list.
//!
//! Semantics follow a hosted message queue: a received message stays
//! invisible until it is acked, released, or its visibility timeout expires,
//! after which it is delivered again with a higher receive count. Delivery is
//! at-least-once; consumers deduplicate by message id.

use crate::MessageId;
use crate::error::QueueError;
use crate::model::{ControlCommand, ControlMessage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Anything that can put a command on the control queue.
#[async_trait]
pub trait CommandPublisher: Send + Sync + 'static {
    async fn publish(&self, command: ControlCommand) -> Result<MessageId, QueueError>;
}

/// A received message and the handle used to settle it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: ControlMessage,
    pub receipt: uuid::Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub body: String,
    pub receive_count: u32,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub in_flight: usize,
    pub dead_letters: usize,
}

#[derive(Debug)]
struct Envelope {
    message_id: MessageId,
    body: String,
    sent_at: DateTime<Utc>,
    receive_count: u32,
    visible_at: Instant,
}

#[derive(Debug)]
struct InFlight {
    envelope: Envelope,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    in_flight: HashMap<uuid::Uuid, InFlight>,
    dead: Vec<DeadLetter>,
    closed: bool,
}

impl QueueState {
    /// Return expired in-flight messages to the ready list.
    fn reap(&mut self, now: Instant) {
        let expired: Vec<uuid::Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(entry) = self.in_flight.remove(&receipt) {
                tracing::debug!(
                    message_id = %entry.envelope.message_id,
                    "visibility timeout expired, message visible again"
                );
                let mut envelope = entry.envelope;
                envelope.visible_at = now;
                self.ready.push_back(envelope);
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let ready = self.ready.iter().map(|envelope| envelope.visible_at);
        let in_flight = self.in_flight.values().map(|entry| entry.deadline);
        ready.chain(in_flight).min()
    }

    fn bury(&mut self, envelope: Envelope, reason: String) {
        tracing::error!(
            message_id = %envelope.message_id,
            receive_count = envelope.receive_count,
            %reason,
            "control message moved to dead-letter list"
        );
        self.dead.push(DeadLetter {
            message_id: envelope.message_id,
            body: envelope.body,
            receive_count: envelope.receive_count,
            reason,
            dead_at: Utc::now(),
        });
    }
}

#[derive(Debug)]
pub struct ControlQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl ControlQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    pub fn send(&self, command: &ControlCommand) -> Result<MessageId, QueueError> {
        self.send_with_delay(command, Duration::ZERO)
    }

    pub fn send_with_delay(
        &self,
        command: &ControlCommand,
        delay: Duration,
    ) -> Result<MessageId, QueueError> {
        let body = serde_json::to_string(command)?;
        self.enqueue(body, delay)
    }

    /// Enqueue a body as-is. Bodies that do not parse as a control command
    /// are dead-lettered when received.
    pub fn send_raw(&self, body: impl Into<String>) -> Result<MessageId, QueueError> {
        self.enqueue(body.into(), Duration::ZERO)
    }

    fn enqueue(&self, body: String, delay: Duration) -> Result<MessageId, QueueError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.ready.push_back(Envelope {
                message_id: message_id.clone(),
                body,
                sent_at: Utc::now(),
                receive_count: 0,
                visible_at: Instant::now() + delay,
            });
        }
        self.notify.notify_one();
        Ok(message_id)
    }

    /// Wait for the next visible message. Returns `None` once the queue is
    /// closed.
    pub async fn receive(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wakeup = {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                let now = Instant::now();
                state.reap(now);
                if let Some(delivery) = self.take_visible(&mut state, now) {
                    return Some(delivery);
                }
                state.next_wakeup()
            };

            match wakeup {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Non-blocking variant of [`receive`](Self::receive).
    pub fn try_receive(&self) -> Option<Delivery> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let now = Instant::now();
        state.reap(now);
        self.take_visible(&mut state, now)
    }

    fn take_visible(&self, state: &mut QueueState, now: Instant) -> Option<Delivery> {
        while let Some(position) = state.ready.iter().position(|e| e.visible_at <= now) {
            let mut envelope = state.ready.remove(position)?;
            envelope.receive_count += 1;

            let command = match serde_json::from_str::<ControlCommand>(&envelope.body) {
                Ok(command) => command,
                Err(error) => {
                    state.bury(envelope, format!("unparseable control message: {error}"));
                    continue;
                }
            };

            let receipt = uuid::Uuid::new_v4();
            let message = ControlMessage {
                message_id: envelope.message_id.clone(),
                command,
                receive_count: envelope.receive_count,
                sent_at: envelope.sent_at,
            };
            state.in_flight.insert(
                receipt,
                InFlight {
                    envelope,
                    deadline: now + self.visibility_timeout,
                },
            );
            return Some(Delivery { message, receipt });
        }
        None
    }

    /// Delete a handled message.
    pub fn ack(&self, receipt: uuid::Uuid) -> Result<(), QueueError> {
        self.state
            .lock()
            .in_flight
            .remove(&receipt)
            .map(|_| ())
            .ok_or(QueueError::UnknownReceipt(receipt))
    }

    /// Make a message visible again after `delay`.
    pub fn release(&self, receipt: uuid::Uuid, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            let entry = state
                .in_flight
                .remove(&receipt)
                .ok_or(QueueError::UnknownReceipt(receipt))?;
            let mut envelope = entry.envelope;
            envelope.visible_at = Instant::now() + delay;
            state.ready.push_back(envelope);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn dead_letter(&self, receipt: uuid::Uuid, reason: impl Into<String>) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let entry = state
            .in_flight
            .remove(&receipt)
            .ok_or(QueueError::UnknownReceipt(receipt))?;
        state.bury(entry.envelope, reason.into());
        Ok(())
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead.clone()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            depth: state.ready.len(),
            in_flight: state.in_flight.len(),
            dead_letters: state.dead.len(),
        }
    }

    /// Stop handing out messages and wake every waiting receiver.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl CommandPublisher for ControlQueue {
    async fn publish(&self, command: ControlCommand) -> Result<MessageId, QueueError> {
        let message_id = self.send(&command)?;
        tracing::debug!(%message_id, kind = %command.kind, "control command published");
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CommandType;

    #[tokio::test]
    async fn unacked_message_is_redelivered_after_visibility_timeout() {
        tokio::time::pause();
        let queue = ControlQueue::new(Duration::from_secs(30));
        let sent = queue.send(&ControlCommand::build("p1")).unwrap();

        let first = queue.receive().await.unwrap();
        assert_eq!(first.message.message_id, sent);
        assert_eq!(first.message.receive_count, 1);
        assert!(queue.try_receive().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.receive().await.unwrap();
        assert_eq!(second.message.message_id, sent);
        assert_eq!(second.message.receive_count, 2);

        assert!(matches!(
            queue.ack(first.receipt),
            Err(QueueError::UnknownReceipt(_))
        ));
        queue.ack(second.receipt).unwrap();
        assert_eq!(queue.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn release_applies_delay() {
        tokio::time::pause();
        let queue = ControlQueue::new(Duration::from_secs(30));
        queue.send(&ControlCommand::delete("p1")).unwrap();

        let delivery = queue.receive().await.unwrap();
        queue.release(delivery.receipt, Duration::from_secs(5)).unwrap();
        assert!(queue.try_receive().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        let again = queue.try_receive().unwrap();
        assert_eq!(again.message.command.kind, CommandType::IndexDelete);
        assert_eq!(again.message.receive_count, 2);
    }

    #[tokio::test]
    async fn unparseable_body_is_dead_lettered() {
        let queue = ControlQueue::new(Duration::from_secs(30));
        queue.send_raw(r#"{"type": "PROJECT_CREATE"}"#).unwrap();
        queue.send(&ControlCommand::resched()).unwrap();

        let delivery = queue.try_receive().unwrap();
        assert_eq!(delivery.message.command.kind, CommandType::IndexResched);

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("unparseable"));
    }

    #[tokio::test]
    async fn pending_receive_is_woken_by_send() {
        let queue = ControlQueue::new(Duration::from_secs(30));
        let mut receive = tokio_test::task::spawn(queue.receive());
        tokio_test::assert_pending!(receive.poll());

        queue.send(&ControlCommand::build("p1")).unwrap();
        assert!(receive.is_woken());
        let delivery = tokio_test::assert_ready!(receive.poll()).unwrap();
        assert_eq!(delivery.message.command, ControlCommand::build("p1"));
    }

    #[tokio::test]
    async fn receive_wakes_on_send_and_close() {
        let queue = std::sync::Arc::new(ControlQueue::new(Duration::from_secs(30)));

        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive().await.map(|d| d.message.command) })
        };
        tokio::task::yield_now().await;
        queue.send(&ControlCommand::build("p1")).unwrap();
        assert_eq!(receiver.await.unwrap(), Some(ControlCommand::build("p1")));

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive().await.is_none() })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(waiting.await.unwrap());
        assert!(matches!(
            queue.send(&ControlCommand::resched()),
            Err(QueueError::Closed)
        ));
    }
}
