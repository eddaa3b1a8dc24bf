//! Sans-io session channel state machine.
//!
//! [`ChannelMachine::handle`] is the single transition function. It consumes
//! a [`ChannelEvent`] (a transport callback, a timer expiry, or a UI command),
//! updates the [`SessionView`], and queues [`Effect`]s for the driver to
//! carry out: open or close a connection, transmit a frame, arm or cancel a
//! timer, emit a [`SessionEvent`]. Nothing here touches the network or the
//! clock, so every transition is testable in isolation.
//!
//! Connections are tagged with a [`ConnectionId`]. Only the current id is
//! honored; callbacks from superseded connections are dropped.

use std::fmt;
use std::time::Duration;

use assess_core::protocol::{InboundMessage, NORMAL_CLOSURE, OutboundMessage};
use assess_core::{InteractionId, ReconnectPolicy, SessionId, TransportError};
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::debounce::Coalescer;
use crate::errors::ChannelError;
use crate::status::{
    CANNOT_SUBMIT, CODE_NOT_SAVED, ConnectionStatus, PROCESS_FAILED, RECONNECT_EXHAUSTED,
    SessionEvent, SessionView,
};

/// Close reason used when a connection is replaced by a new attempt.
pub const REASON_SUPERSEDED: &str = "Superseded by new connection";
/// Close reason used by [`ChannelEvent::EndSession`].
pub const REASON_SESSION_ENDED: &str = "Session ended by user";
/// Close reason used by [`ChannelEvent::Dispose`].
pub const REASON_DISPOSED: &str = "Component unmounting";

/// Identifies one connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Input to the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    /// Open a connection (initial, manual, or retry).
    Connect,
    /// The transport opened connection `0`.
    Opened(ConnectionId),
    /// A text frame arrived.
    MessageReceived {
        /// Connection it arrived on.
        id: ConnectionId,
        /// Raw payload.
        payload: String,
    },
    /// The transport closed, or failed to open, a connection.
    Closed {
        /// Connection that closed.
        id: ConnectionId,
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The scheduled reconnect delay elapsed.
    ReconnectTimerFired,
    /// The code update coalescing window elapsed.
    DebounceElapsed,
    /// The editor content changed.
    CodeChanged(String),
    /// The user answered the current question.
    SubmitResponse {
        /// Interaction being answered.
        interaction_id: InteractionId,
        /// Answer text.
        response: String,
    },
    /// Close the connection and stop reconnecting.
    Close {
        /// Close code to send.
        code: u16,
        /// Close reason to send.
        reason: String,
    },
    /// The user ended the session. Closes and refuses further connects.
    EndSession,
    /// The owner is going away. Cancels everything and closes.
    Dispose,
    /// An [`Effect::Transmit`] was queued on its link.
    Delivered {
        /// Connection it was queued on.
        id: ConnectionId,
        /// Message that was queued.
        message: OutboundMessage,
    },
    /// An [`Effect::Transmit`] could not be queued on its link.
    DeliveryFailed {
        /// Connection it was meant for.
        id: ConnectionId,
        /// Message that was not sent.
        message: OutboundMessage,
        /// Why the link refused it.
        error: TransportError,
    },
}

/// Work for the driver produced by a transition.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Dial `url` for connection `id`.
    Open {
        /// New connection id.
        id: ConnectionId,
        /// Endpoint URL.
        url: String,
    },
    /// Write a message on connection `id`.
    ///
    /// The driver reports the outcome with [`ChannelEvent::Delivered`] or
    /// [`ChannelEvent::DeliveryFailed`].
    Transmit {
        /// Target connection.
        id: ConnectionId,
        /// Message to send.
        message: OutboundMessage,
    },
    /// Close connection `id` and release it.
    CloseConnection {
        /// Connection to close.
        id: ConnectionId,
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Fire [`ChannelEvent::ReconnectTimerFired`] after `delay`.
    ScheduleReconnect {
        /// 1-based attempt being scheduled.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Cancel a scheduled reconnect.
    CancelReconnect,
    /// (Re)arm the debounce timer to fire [`ChannelEvent::DebounceElapsed`].
    ArmDebounce(Duration),
    /// Cancel the debounce timer.
    CancelDebounce,
    /// Deliver an event to subscribers.
    Emit(SessionEvent),
}

#[derive(Debug)]
struct LiveConnection {
    id: ConnectionId,
    open: bool,
}

/// State of one session channel.
#[derive(Debug)]
pub struct ChannelMachine {
    session_id: SessionId,
    url: String,
    policy: ReconnectPolicy,
    last_id: u64,
    connection: Option<LiveConnection>,
    reconnect_pending: bool,
    ending: bool,
    disposed: bool,
    code: Coalescer<String>,
    view: SessionView,
    effects: Vec<Effect>,
}

impl ChannelMachine {
    /// Create a machine in the `Initializing` state.
    pub fn new(session_id: SessionId, config: &ChannelConfig) -> Self {
        Self {
            url: config.endpoint(&session_id),
            session_id,
            policy: config.reconnect,
            last_id: 0,
            connection: None,
            reconnect_pending: false,
            ending: false,
            disposed: false,
            code: Coalescer::new(config.debounce_window),
            view: SessionView::default(),
            effects: Vec::new(),
        }
    }

    /// Session this machine serves.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Current view snapshot.
    pub fn view(&self) -> &SessionView {
        &self.view
    }

    /// Take the effects queued by previous transitions.
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Apply one event.
    ///
    /// Errors are returned for commands that could not be carried out; the
    /// same condition is reflected in the view where the UI needs to see it.
    pub fn handle(&mut self, event: ChannelEvent) -> Result<(), ChannelError> {
        if self.disposed {
            debug!(?event, "event after dispose ignored");
            return Err(ChannelError::ChannelClosed);
        }
        match event {
            ChannelEvent::Connect => {
                // A requested connect starts a fresh retry budget.
                if !self.ending {
                    self.view.reconnect_attempts = 0;
                }
                self.connect()
            }
            ChannelEvent::Opened(id) => {
                self.on_opened(id);
                Ok(())
            }
            ChannelEvent::MessageReceived { id, payload } => {
                self.on_message(id, &payload);
                Ok(())
            }
            ChannelEvent::Closed { id, code, reason } => {
                self.on_closed(id, code, &reason);
                Ok(())
            }
            ChannelEvent::ReconnectTimerFired => self.on_reconnect_timer(),
            ChannelEvent::DebounceElapsed => {
                self.on_debounce_elapsed();
                Ok(())
            }
            ChannelEvent::CodeChanged(code) => {
                let window = self.code.offer(code);
                self.effects.push(Effect::ArmDebounce(window));
                Ok(())
            }
            ChannelEvent::SubmitResponse {
                interaction_id,
                response,
            } => self.submit_response(interaction_id, response),
            ChannelEvent::Close { code, reason } => {
                self.close(code, reason);
                Ok(())
            }
            ChannelEvent::EndSession => {
                self.ending = true;
                self.close(NORMAL_CLOSURE, REASON_SESSION_ENDED.to_owned());
                Ok(())
            }
            ChannelEvent::Dispose => {
                self.close(NORMAL_CLOSURE, REASON_DISPOSED.to_owned());
                self.disposed = true;
                Ok(())
            }
            ChannelEvent::Delivered { id, message } => {
                self.on_delivered(id, &message);
                Ok(())
            }
            ChannelEvent::DeliveryFailed { id, message, error } => {
                self.on_delivery_failed(id, &message, &error);
                Err(ChannelError::Transport(error))
            }
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────

    fn connect(&mut self) -> Result<(), ChannelError> {
        if self.ending {
            return Err(ChannelError::Ending);
        }
        self.cancel_reconnect();
        if let Some(prev) = self.connection.take() {
            self.effects.push(Effect::CloseConnection {
                id: prev.id,
                code: NORMAL_CLOSURE,
                reason: REASON_SUPERSEDED.to_owned(),
            });
        }

        self.last_id += 1;
        let id = ConnectionId(self.last_id);
        self.connection = Some(LiveConnection { id, open: false });

        info!(
            session_id = %self.session_id,
            connection_id = %id,
            attempt = self.view.reconnect_attempts + 1,
            "connecting"
        );
        self.set_status(ConnectionStatus::Connecting);
        self.clear_error();
        self.effects.push(Effect::Open {
            id,
            url: self.url.clone(),
        });
        Ok(())
    }

    fn on_opened(&mut self, id: ConnectionId) {
        let Some(conn) = self.connection.as_mut().filter(|c| c.id == id) else {
            debug!(connection_id = %id, "open from superseded connection ignored");
            return;
        };
        conn.open = true;
        info!(session_id = %self.session_id, connection_id = %id, "connected");
        self.set_status(ConnectionStatus::Connected);
        self.clear_error();
        self.view.reconnect_attempts = 0;
    }

    fn on_closed(&mut self, id: ConnectionId, code: u16, reason: &str) {
        if !self.is_current(id) {
            debug!(connection_id = %id, code, "close from superseded connection ignored");
            return;
        }
        self.connection = None;

        if code == NORMAL_CLOSURE || self.ending {
            info!(session_id = %self.session_id, code, reason, "connection closed");
            self.set_status(ConnectionStatus::Closed { code });
            return;
        }

        self.view.reconnect_attempts += 1;
        let attempt = self.view.reconnect_attempts;
        let max_attempts = self.policy.max_attempts;

        if let Some(delay) = self.policy.delay_for(attempt) {
            warn!(
                session_id = %self.session_id,
                code,
                reason,
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "connection lost, scheduling reconnect"
            );
            self.set_status(ConnectionStatus::Reconnecting {
                attempt,
                max_attempts,
            });
            self.set_error(format!(
                "Connection lost. Attempting to reconnect ({attempt}/{max_attempts})..."
            ));
            self.reconnect_pending = true;
            self.effects
                .push(Effect::ScheduleReconnect { attempt, delay });
        } else {
            warn!(
                session_id = %self.session_id,
                code,
                attempts = attempt - 1,
                "max reconnect attempts reached"
            );
            self.set_error(RECONNECT_EXHAUSTED.to_owned());
            self.set_status(ConnectionStatus::Failed);
        }
    }

    fn on_reconnect_timer(&mut self) -> Result<(), ChannelError> {
        if !self.reconnect_pending {
            debug!("stale reconnect timer ignored");
            return Ok(());
        }
        self.reconnect_pending = false;
        self.connect()
    }

    fn close(&mut self, code: u16, reason: String) {
        self.cancel_reconnect();
        if self.code.discard() {
            debug!("pending code update dropped on close");
            self.effects.push(Effect::CancelDebounce);
        }
        if let Some(conn) = self.connection.take() {
            info!(session_id = %self.session_id, connection_id = %conn.id, code, %reason, "closing connection");
            self.effects.push(Effect::CloseConnection {
                id: conn.id,
                code,
                reason,
            });
        }
        self.set_status(ConnectionStatus::Closed { code });
    }

    fn cancel_reconnect(&mut self) {
        if self.reconnect_pending {
            self.reconnect_pending = false;
            self.effects.push(Effect::CancelReconnect);
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    fn on_message(&mut self, id: ConnectionId, payload: &str) {
        if !self.is_current(id) {
            debug!(connection_id = %id, "message from superseded connection ignored");
            return;
        }
        match InboundMessage::parse(payload) {
            Ok(InboundMessage::Question(interaction)) => {
                debug!(interaction_id = %interaction.interaction_id, "question received");
                self.view.interaction = Some(interaction.clone());
                self.emit(SessionEvent::Question(interaction));
                if self.view.evaluation.take().is_some() {
                    self.emit(SessionEvent::EvaluationCleared);
                }
                self.clear_error();
            }
            Ok(InboundMessage::Evaluation(evaluation)) => {
                debug!(score = ?evaluation.score, "evaluation received");
                self.view.evaluation = Some(evaluation.clone());
                self.emit(SessionEvent::Evaluation(evaluation));
            }
            Ok(InboundMessage::Error { detail }) => {
                warn!(session_id = %self.session_id, %detail, "server reported error");
                self.set_error(format!("Server error: {detail}"));
                self.set_status(ConnectionStatus::Errored);
            }
            Ok(InboundMessage::Unknown { message_type }) => {
                info!(%message_type, "unhandled message type");
            }
            Err(e) => {
                warn!(error = %e, "failed to process inbound message");
                self.set_error(PROCESS_FAILED.to_owned());
            }
        }
    }

    // ── Outbound ────────────────────────────────────────────────────

    fn on_debounce_elapsed(&mut self) {
        let Some(code) = self.code.take() else {
            return;
        };
        if let Some(id) = self.open_id() {
            debug!(connection_id = %id, len = code.len(), "sending code update");
            self.effects.push(Effect::Transmit {
                id,
                message: OutboundMessage::CodeUpdate { code },
            });
        } else {
            warn!(status = %self.view.status, "connection not open, code update dropped");
            self.set_error(CODE_NOT_SAVED.to_owned());
        }
    }

    fn submit_response(
        &mut self,
        interaction_id: InteractionId,
        response: String,
    ) -> Result<(), ChannelError> {
        self.clear_error();
        let Some(id) = self.open_id() else {
            warn!(%interaction_id, "connection not open, response not sent");
            self.set_error(CANNOT_SUBMIT.to_owned());
            return Err(ChannelError::NotConnected);
        };
        debug!(connection_id = %id, %interaction_id, "submitting response");
        self.effects.push(Effect::Transmit {
            id,
            message: OutboundMessage::ResponseSubmitted {
                interaction_id,
                response,
            },
        });
        Ok(())
    }

    fn on_delivered(&mut self, id: ConnectionId, message: &OutboundMessage) {
        debug!(connection_id = %id, kind = message.kind(), "frame queued");
        // The question is only retired once its answer is queued.
        if matches!(message, OutboundMessage::ResponseSubmitted { .. })
            && self.view.interaction.take().is_some()
        {
            self.emit(SessionEvent::InteractionCleared);
        }
    }

    fn on_delivery_failed(
        &mut self,
        id: ConnectionId,
        message: &OutboundMessage,
        error: &TransportError,
    ) {
        warn!(
            session_id = %self.session_id,
            connection_id = %id,
            kind = message.kind(),
            %error,
            "outbound message not sent"
        );
        match message {
            OutboundMessage::CodeUpdate { .. } => self.set_error(CODE_NOT_SAVED.to_owned()),
            OutboundMessage::ResponseSubmitted { .. } => self.set_error(CANNOT_SUBMIT.to_owned()),
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn is_current(&self, id: ConnectionId) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id == id)
    }

    fn open_id(&self) -> Option<ConnectionId> {
        self.connection
            .as_ref()
            .filter(|c| c.open)
            .map(|c| c.id)
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.view.status != status {
            self.view.status = status;
            self.emit(SessionEvent::StatusChanged(status));
        }
    }

    fn set_error(&mut self, text: String) {
        self.view.error = Some(text.clone());
        self.emit(SessionEvent::Error(text));
    }

    fn clear_error(&mut self) {
        if self.view.error.take().is_some() {
            self.emit(SessionEvent::ErrorCleared);
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        self.effects.push(Effect::Emit(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use assess_core::logging::capture_logs;
    use assess_core::protocol::{ABNORMAL_CLOSURE, EvaluationResult};
    use proptest::prelude::*;

    fn machine() -> ChannelMachine {
        ChannelMachine::new(SessionId::parse("s1").unwrap(), &ChannelConfig::default())
    }

    fn transmitted(effects: &[Effect]) -> Vec<OutboundMessage> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Transmit { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn scheduled(effects: &[Effect]) -> Vec<(u32, Duration)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::ScheduleReconnect { attempt, delay } => Some((*attempt, *delay)),
                _ => None,
            })
            .collect()
    }

    fn opened_id(effects: &[Effect]) -> ConnectionId {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::Open { id, .. } => Some(*id),
                _ => None,
            })
            .expect("expected an Open effect")
    }

    /// Connect and open; returns the live connection id.
    fn connected(m: &mut ChannelMachine) -> ConnectionId {
        m.handle(ChannelEvent::Connect).unwrap();
        let id = opened_id(&m.drain_effects());
        m.handle(ChannelEvent::Opened(id)).unwrap();
        let _ = m.drain_effects();
        id
    }

    fn abnormal(id: ConnectionId) -> ChannelEvent {
        ChannelEvent::Closed {
            id,
            code: ABNORMAL_CLOSURE,
            reason: String::new(),
        }
    }

    /// Report every queued transmit as delivered.
    fn deliver_all(m: &mut ChannelMachine, effects: &[Effect]) {
        for effect in effects {
            if let Effect::Transmit { id, message } = effect {
                m.handle(ChannelEvent::Delivered {
                    id: *id,
                    message: message.clone(),
                })
                .unwrap();
            }
        }
    }

    fn question(id: ConnectionId, interaction_id: &str) -> ChannelEvent {
        message(
            id,
            &format!(r#"{{"message_type":"question","interaction_id":"{interaction_id}","question":"Q"}}"#),
        )
    }

    fn message(id: ConnectionId, payload: &str) -> ChannelEvent {
        ChannelEvent::MessageReceived {
            id,
            payload: payload.to_owned(),
        }
    }

    // ── connect ─────────────────────────────────────────────────────

    #[test]
    fn connect_opens_session_endpoint() {
        let mut m = machine();
        m.handle(ChannelEvent::Connect).unwrap();
        let effects = m.drain_effects();
        assert!(effects.contains(&Effect::Open {
            id: ConnectionId(1),
            url: "ws://localhost:8000/ws/session/s1".into(),
        }));
        assert_eq!(m.view().status, ConnectionStatus::Connecting);
        assert!(m.open_id().is_none());
    }

    #[test]
    fn open_resets_counter_and_clears_error() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(abnormal(id)).unwrap();
        assert_eq!(m.view().reconnect_attempts, 1);
        assert!(m.view().error.is_some());

        m.handle(ChannelEvent::ReconnectTimerFired).unwrap();
        let id = opened_id(&m.drain_effects());
        m.handle(ChannelEvent::Opened(id)).unwrap();

        assert_eq!(m.view().status, ConnectionStatus::Connected);
        assert_eq!(m.view().reconnect_attempts, 0);
        assert!(m.view().error.is_none());
    }

    #[test]
    fn reconnect_while_connecting_closes_previous() {
        let mut m = machine();
        m.handle(ChannelEvent::Connect).unwrap();
        let first = opened_id(&m.drain_effects());
        m.handle(ChannelEvent::Connect).unwrap();
        let effects = m.drain_effects();
        assert_matches!(
            effects.first(),
            Some(Effect::CloseConnection { id, code: 1000, .. }) if *id == first
        );
        let second = opened_id(&effects);
        assert_ne!(first, second);

        // The superseded connection's callbacks are ignored.
        m.handle(ChannelEvent::Opened(first)).unwrap();
        assert_eq!(m.view().status, ConnectionStatus::Connecting);
        m.handle(abnormal(first)).unwrap();
        assert_eq!(m.view().reconnect_attempts, 0);
        assert!(scheduled(&m.drain_effects()).is_empty());
    }

    #[test]
    fn connect_cancels_pending_reconnect() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(abnormal(id)).unwrap();
        let _ = m.drain_effects();

        m.handle(ChannelEvent::Connect).unwrap();
        let effects = m.drain_effects();
        assert_eq!(effects.first(), Some(&Effect::CancelReconnect));

        // The old timer firing late does not open a second connection.
        m.handle(ChannelEvent::ReconnectTimerFired).unwrap();
        assert!(m.drain_effects().is_empty());
    }

    #[test]
    fn connect_refused_while_ending() {
        let mut m = machine();
        let _ = connected(&mut m);
        m.handle(ChannelEvent::EndSession).unwrap();
        let _ = m.drain_effects();
        assert_eq!(m.handle(ChannelEvent::Connect), Err(ChannelError::Ending));
        assert!(m.drain_effects().is_empty());
    }

    // ── reconnection ────────────────────────────────────────────────

    #[test]
    fn manual_connect_after_failure_restores_budget() {
        let mut m = machine();
        let mut id = connected(&mut m);
        loop {
            m.handle(abnormal(id)).unwrap();
            if m.view().status == ConnectionStatus::Failed {
                break;
            }
            m.handle(ChannelEvent::ReconnectTimerFired).unwrap();
            id = opened_id(&m.drain_effects());
        }
        let _ = m.drain_effects();

        m.handle(ChannelEvent::Connect).unwrap();
        let id = opened_id(&m.drain_effects());
        assert_eq!(m.view().reconnect_attempts, 0);
        m.handle(abnormal(id)).unwrap();
        assert_eq!(
            scheduled(&m.drain_effects()),
            vec![(1, Duration::from_millis(2000))]
        );
    }

    #[test]
    fn backoff_doubles_then_fails_after_max() {
        let mut m = machine();
        let mut id = connected(&mut m);
        let mut delays = Vec::new();

        for _ in 0..6 {
            m.handle(abnormal(id)).unwrap();
            let effects = m.drain_effects();
            delays.extend(scheduled(&effects));
            if m.view().status == ConnectionStatus::Failed {
                break;
            }
            m.handle(ChannelEvent::ReconnectTimerFired).unwrap();
            id = opened_id(&m.drain_effects());
        }

        assert_eq!(
            delays,
            vec![
                (1, Duration::from_millis(2000)),
                (2, Duration::from_millis(4000)),
                (3, Duration::from_millis(8000)),
                (4, Duration::from_millis(16_000)),
                (5, Duration::from_millis(32_000)),
            ]
        );
        assert_eq!(m.view().status, ConnectionStatus::Failed);
        assert_eq!(m.view().error.as_deref(), Some(RECONNECT_EXHAUSTED));

        // Nothing left to fire.
        m.handle(ChannelEvent::ReconnectTimerFired).unwrap();
        assert!(m.drain_effects().is_empty());
    }

    #[test]
    fn reconnecting_status_and_message_carry_attempt() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(abnormal(id)).unwrap();
        assert_eq!(
            m.view().status,
            ConnectionStatus::Reconnecting {
                attempt: 1,
                max_attempts: 5
            }
        );
        assert_eq!(
            m.view().error.as_deref(),
            Some("Connection lost. Attempting to reconnect (1/5)...")
        );
    }

    #[test]
    fn normal_closure_never_reconnects() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(ChannelEvent::Closed {
            id,
            code: NORMAL_CLOSURE,
            reason: "bye".into(),
        })
        .unwrap();
        let effects = m.drain_effects();
        assert!(scheduled(&effects).is_empty());
        assert_eq!(m.view().status, ConnectionStatus::Closed { code: 1000 });
        assert_eq!(m.view().reconnect_attempts, 0);
    }

    #[test]
    fn reconnect_logs_attempt() {
        let (logs, _guard) = capture_logs();
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(abnormal(id)).unwrap();
        assert!(logs.has_event(
            tracing::Level::WARN,
            "connection lost, scheduling reconnect"
        ));
        assert!(logs.has_field("attempt", "1"));
        assert!(logs.has_field("delay_ms", "2000"));
    }

    proptest! {
        #[test]
        fn normal_closure_ignores_attempt_counter(prior_failures in 0u32..5) {
            let mut m = machine();
            let mut id = connected(&mut m);
            for _ in 0..prior_failures {
                m.handle(abnormal(id)).unwrap();
                m.handle(ChannelEvent::ReconnectTimerFired).unwrap();
                id = opened_id(&m.drain_effects());
            }
            m.handle(ChannelEvent::Closed { id, code: NORMAL_CLOSURE, reason: String::new() }).unwrap();
            prop_assert!(scheduled(&m.drain_effects()).is_empty());
            prop_assert_eq!(m.view().status, ConnectionStatus::Closed { code: NORMAL_CLOSURE });
        }
    }

    // ── inbound ─────────────────────────────────────────────────────

    #[test]
    fn question_clears_evaluation_and_error() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(message(
            id,
            r#"{"message_type":"evaluation_result","evaluation":"ok","score":0.5}"#,
        ))
        .unwrap();
        m.handle(message(id, "garbage")).unwrap();
        assert!(m.view().evaluation.is_some());
        assert_eq!(m.view().error.as_deref(), Some(PROCESS_FAILED));
        let _ = m.drain_effects();

        m.handle(message(
            id,
            r#"{"message_type":"question","interaction_id":"i2","question":"Why?"}"#,
        ))
        .unwrap();
        assert!(m.view().evaluation.is_none());
        assert!(m.view().error.is_none());
        let effects = m.drain_effects();
        assert!(effects.contains(&Effect::Emit(SessionEvent::EvaluationCleared)));
        assert!(effects.contains(&Effect::Emit(SessionEvent::ErrorCleared)));
    }

    #[test]
    fn malformed_payload_keeps_interaction_and_evaluation() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(message(
            id,
            r#"{"message_type":"question","interaction_id":"i1","question":"Q"}"#,
        ))
        .unwrap();
        m.handle(message(id, r#"{"no_type":true}"#)).unwrap();
        assert_eq!(
            m.view().interaction.as_ref().map(|i| i.interaction_id.as_str()),
            Some("i1")
        );
        assert_eq!(m.view().error.as_deref(), Some(PROCESS_FAILED));
        assert_eq!(m.view().status, ConnectionStatus::Connected);
    }

    #[test]
    fn evaluation_with_non_numeric_score_is_null() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(message(
            id,
            r#"{"message_type":"evaluation_result","evaluation":"Meh","score":"high"}"#,
        ))
        .unwrap();
        assert_eq!(
            m.view().evaluation,
            Some(EvaluationResult {
                feedback: "Meh".into(),
                score: None
            })
        );
    }

    #[test]
    fn server_error_keeps_connection_open() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(message(id, r#"{"message_type":"error","detail":"Rate limited"}"#))
            .unwrap();
        let effects = m.drain_effects();
        assert_eq!(m.view().error.as_deref(), Some("Server error: Rate limited"));
        assert_eq!(m.view().status, ConnectionStatus::Errored);
        assert!(m.open_id().is_some());
        assert!(
            !effects
                .iter()
                .any(|e| matches!(e, Effect::CloseConnection { .. }))
        );
    }

    #[test]
    fn unknown_message_type_changes_nothing() {
        let mut m = machine();
        let id = connected(&mut m);
        let before = m.view().clone();
        m.handle(message(id, r#"{"message_type":"progress","pct":40}"#))
            .unwrap();
        assert_eq!(m.view(), &before);
        assert!(m.drain_effects().is_empty());
    }

    // ── outbound ────────────────────────────────────────────────────

    #[test]
    fn rapid_code_updates_send_only_latest() {
        let mut m = machine();
        let _ = connected(&mut m);
        for code in ["a", "ab", "abc"] {
            m.handle(ChannelEvent::CodeChanged(code.into())).unwrap();
        }
        let effects = m.drain_effects();
        assert_eq!(
            effects,
            vec![Effect::ArmDebounce(Duration::from_secs(1)); 3],
            "each change rearms the window"
        );
        assert!(transmitted(&effects).is_empty());

        m.handle(ChannelEvent::DebounceElapsed).unwrap();
        assert_eq!(
            transmitted(&m.drain_effects()),
            vec![OutboundMessage::CodeUpdate { code: "abc".into() }]
        );

        // A spurious second expiry sends nothing.
        m.handle(ChannelEvent::DebounceElapsed).unwrap();
        assert!(m.drain_effects().is_empty());
    }

    #[test]
    fn code_update_while_not_open_is_dropped_with_warning() {
        let mut m = machine();
        m.handle(ChannelEvent::Connect).unwrap();
        let _ = m.drain_effects();

        m.handle(ChannelEvent::CodeChanged("x".into())).unwrap();
        m.handle(ChannelEvent::DebounceElapsed).unwrap();
        let effects = m.drain_effects();

        assert!(transmitted(&effects).is_empty());
        assert_eq!(m.view().error.as_deref(), Some(CODE_NOT_SAVED));
        assert_eq!(m.view().status, ConnectionStatus::Connecting);
        assert!(
            !effects
                .iter()
                .any(|e| matches!(e, Effect::Emit(SessionEvent::StatusChanged(_))))
        );
    }

    #[test]
    fn response_round_trip_scenario() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(message(
            id,
            r#"{"message_type":"question","interaction_id":"i1","question":"Reverse a string"}"#,
        ))
        .unwrap();
        assert_eq!(
            m.view().interaction.as_ref().map(|i| i.question.as_str()),
            Some("Reverse a string")
        );
        assert!(m.view().evaluation.is_none());
        let _ = m.drain_effects();

        m.handle(ChannelEvent::SubmitResponse {
            interaction_id: "i1".into(),
            response: "abc".into(),
        })
        .unwrap();
        let effects = m.drain_effects();
        assert_eq!(
            transmitted(&effects),
            vec![OutboundMessage::ResponseSubmitted {
                interaction_id: "i1".into(),
                response: "abc".into()
            }]
        );
        assert!(m.view().interaction.is_some(), "kept until delivery");

        deliver_all(&mut m, &effects);
        assert!(
            m.drain_effects()
                .contains(&Effect::Emit(SessionEvent::InteractionCleared))
        );
        assert!(m.view().interaction.is_none());

        m.handle(message(
            id,
            r#"{"message_type":"evaluation_result","evaluation":"Good","score":0.8}"#,
        ))
        .unwrap();
        let eval = m.view().evaluation.clone().unwrap();
        assert_eq!(eval.feedback, "Good");
        assert_eq!(eval.score_percent().as_deref(), Some("80%"));
    }

    #[test]
    fn response_while_disconnected_keeps_interaction() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(message(
            id,
            r#"{"message_type":"question","interaction_id":"i1","question":"Q"}"#,
        ))
        .unwrap();
        m.handle(abnormal(id)).unwrap();
        let _ = m.drain_effects();

        let result = m.handle(ChannelEvent::SubmitResponse {
            interaction_id: "i1".into(),
            response: "abc".into(),
        });
        assert_eq!(result, Err(ChannelError::NotConnected));
        assert!(transmitted(&m.drain_effects()).is_empty());
        assert!(m.view().interaction.is_some());
        assert_eq!(m.view().error.as_deref(), Some(CANNOT_SUBMIT));
    }

    #[test]
    fn failed_response_delivery_keeps_interaction() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(question(id, "i1")).unwrap();
        m.handle(ChannelEvent::SubmitResponse {
            interaction_id: "i1".into(),
            response: "abc".into(),
        })
        .unwrap();
        let message = transmitted(&m.drain_effects()).remove(0);

        let result = m.handle(ChannelEvent::DeliveryFailed {
            id,
            message,
            error: TransportError::Full,
        });
        assert_eq!(result, Err(ChannelError::Transport(TransportError::Full)));
        assert_eq!(
            m.view().interaction.as_ref().map(|i| i.interaction_id.as_str()),
            Some("i1")
        );
        assert_eq!(m.view().error.as_deref(), Some(CANNOT_SUBMIT));
        let effects = m.drain_effects();
        assert!(effects.contains(&Effect::Emit(SessionEvent::Error(CANNOT_SUBMIT.into()))));
        assert!(!effects.contains(&Effect::Emit(SessionEvent::InteractionCleared)));

        // A retry that goes through clears the error and the question.
        m.handle(ChannelEvent::SubmitResponse {
            interaction_id: "i1".into(),
            response: "abc".into(),
        })
        .unwrap();
        let effects = m.drain_effects();
        deliver_all(&mut m, &effects);
        assert!(m.view().interaction.is_none());
        assert!(m.view().error.is_none());
    }

    #[test]
    fn failed_code_delivery_warns() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(ChannelEvent::CodeChanged("x".into())).unwrap();
        m.handle(ChannelEvent::DebounceElapsed).unwrap();
        let message = transmitted(&m.drain_effects()).remove(0);

        let result = m.handle(ChannelEvent::DeliveryFailed {
            id,
            message,
            error: TransportError::Closed,
        });
        assert_eq!(result, Err(ChannelError::Transport(TransportError::Closed)));
        assert_eq!(m.view().error.as_deref(), Some(CODE_NOT_SAVED));
        assert_eq!(m.view().status, ConnectionStatus::Connected);
    }

    #[test]
    fn delivered_code_update_leaves_question() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(question(id, "i1")).unwrap();
        m.handle(ChannelEvent::CodeChanged("x".into())).unwrap();
        m.handle(ChannelEvent::DebounceElapsed).unwrap();
        let effects = m.drain_effects();
        deliver_all(&mut m, &effects);
        assert!(m.view().interaction.is_some());
    }

    // ── close / teardown ────────────────────────────────────────────

    #[test]
    fn close_cancels_reconnect_and_pending_code() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(ChannelEvent::CodeChanged("x".into())).unwrap();
        m.handle(abnormal(id)).unwrap();
        let _ = m.drain_effects();

        m.handle(ChannelEvent::Close {
            code: 4000,
            reason: "user".into(),
        })
        .unwrap();
        let effects = m.drain_effects();
        assert!(effects.contains(&Effect::CancelReconnect));
        assert!(effects.contains(&Effect::CancelDebounce));
        assert_eq!(m.view().status, ConnectionStatus::Closed { code: 4000 });

        m.handle(ChannelEvent::ReconnectTimerFired).unwrap();
        m.handle(ChannelEvent::DebounceElapsed).unwrap();
        assert!(m.drain_effects().is_empty());
    }

    #[test]
    fn explicit_close_with_abnormal_code_does_not_reconnect() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(ChannelEvent::Close {
            code: 4001,
            reason: "kick".into(),
        })
        .unwrap();
        let _ = m.drain_effects();
        // Peer's echo of the close arrives afterwards.
        m.handle(ChannelEvent::Closed {
            id,
            code: 4001,
            reason: "kick".into(),
        })
        .unwrap();
        assert!(scheduled(&m.drain_effects()).is_empty());
        assert_eq!(m.view().status, ConnectionStatus::Closed { code: 4001 });
    }

    #[test]
    fn end_session_sends_normal_closure() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(ChannelEvent::EndSession).unwrap();
        let effects = m.drain_effects();
        assert!(effects.contains(&Effect::CloseConnection {
            id,
            code: NORMAL_CLOSURE,
            reason: REASON_SESSION_ENDED.into(),
        }));
        assert!(m.ending);
    }

    #[test]
    fn dispose_closes_and_rejects_further_events() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(ChannelEvent::Dispose).unwrap();
        let effects = m.drain_effects();
        assert!(effects.contains(&Effect::CloseConnection {
            id,
            code: NORMAL_CLOSURE,
            reason: REASON_DISPOSED.into(),
        }));
        assert_eq!(m.view().status, ConnectionStatus::Closed { code: 1000 });

        assert_eq!(
            m.handle(ChannelEvent::ReconnectTimerFired),
            Err(ChannelError::ChannelClosed)
        );
        assert_eq!(m.handle(ChannelEvent::Connect), Err(ChannelError::ChannelClosed));
        assert!(m.drain_effects().is_empty());
    }

    #[test]
    fn dispose_during_backoff_cancels_timer() {
        let mut m = machine();
        let id = connected(&mut m);
        m.handle(abnormal(id)).unwrap();
        let _ = m.drain_effects();
        m.handle(ChannelEvent::Dispose).unwrap();
        let effects = m.drain_effects();
        assert!(effects.contains(&Effect::CancelReconnect));
        assert!(
            !effects
                .iter()
                .any(|e| matches!(e, Effect::CloseConnection { .. })),
            "no live connection to close"
        );
    }
}
