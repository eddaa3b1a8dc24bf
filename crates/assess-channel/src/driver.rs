//! Tokio task that runs a [`ChannelMachine`] against a real [`Connector`].
//!
//! The task owns the machine, the live [`Link`], the in-flight dial and both
//! timer deadlines. Everything it reacts to (commands from the handle, dial
//! outcomes, link events, deadline expiry) funnels through
//! [`ChannelMachine::handle`], and the resulting [`Effect`]s are applied
//! before the next event is polled. Deadlines are plain fields, so a cancel
//! effect takes hold before any later event can observe the old deadline.

use std::future::pending;
use std::sync::Arc;

use assess_core::protocol::{ABNORMAL_CLOSURE, OutboundMessage};
use assess_core::{InteractionId, SessionId, TransportError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::ChannelConfig;
use crate::errors::ChannelError;
use crate::machine::{ChannelEvent, ChannelMachine, ConnectionId, Effect};
use crate::status::{SessionEvent, SessionView};
use crate::transport::{Connector, Frame, Link, LinkEvent};

type Reply = oneshot::Sender<Result<(), ChannelError>>;
type ConnectOutcome = (ConnectionId, Result<Link, TransportError>);

enum Command {
    UpdateCode(String),
    SubmitResponse {
        interaction_id: InteractionId,
        response: String,
        reply: Reply,
    },
    Close {
        code: u16,
        reason: String,
        reply: Reply,
    },
    EndSession {
        reply: Reply,
    },
    Reconnect {
        reply: Reply,
    },
}

/// Entry point for starting a session channel.
pub struct SessionChannel;

impl SessionChannel {
    /// Spawn the channel task and begin connecting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: &ChannelConfig,
        session_id: SessionId,
        connector: Arc<dyn Connector>,
    ) -> SessionHandle {
        let machine = ChannelMachine::new(session_id.clone(), config);
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (view_tx, view_rx) = watch::channel(machine.view().clone());
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let driver = Driver {
            machine,
            connector,
            link: None,
            connecting: None,
            outcome_tx,
            outcome_rx,
            reconnect_at: None,
            debounce_at: None,
            events: events.clone(),
            view: view_tx,
            dropped_frames: 0,
        };
        let task = tokio::spawn(driver.run(command_rx, cancel.clone()));

        SessionHandle {
            session_id,
            commands: command_tx,
            events,
            view: view_rx,
            cancel,
            task: Some(task),
        }
    }

    /// Validate `session_id` and spawn the channel task.
    pub fn open(
        config: &ChannelConfig,
        session_id: &str,
        connector: Arc<dyn Connector>,
    ) -> Result<SessionHandle, ChannelError> {
        let session_id = SessionId::parse(session_id)?;
        Ok(Self::spawn(config, session_id, connector))
    }
}

/// Caller-side handle to a running session channel.
///
/// Dropping the handle tears the channel down: the connection is closed
/// with `1000 / "Component unmounting"` and all timers are cancelled.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: SessionId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    view: watch::Receiver<SessionView>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Session this channel serves.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Offer new editor content. Sent once the coalescing window elapses.
    pub fn update_code(&self, code: impl Into<String>) -> Result<(), ChannelError> {
        self.commands
            .try_send(Command::UpdateCode(code.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ChannelError::Busy,
                mpsc::error::TrySendError::Closed(_) => ChannelError::ChannelClosed,
            })
    }

    /// Answer the current question.
    ///
    /// Returns [`ChannelError::NotConnected`] if the connection is not open,
    /// or [`ChannelError::Transport`] if the link refused the frame. Either
    /// way the question stays pending and nothing is resent automatically.
    pub async fn submit_response(
        &self,
        interaction_id: InteractionId,
        response: impl Into<String>,
    ) -> Result<(), ChannelError> {
        let response = response.into();
        self.request(|reply| Command::SubmitResponse {
            interaction_id,
            response,
            reply,
        })
        .await
    }

    /// Close the connection and stop reconnecting.
    pub async fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), ChannelError> {
        let reason = reason.into();
        self.request(|reply| Command::Close {
            code,
            reason,
            reply,
        })
        .await
    }

    /// End the session. No further connections are made.
    pub async fn end_session(&self) -> Result<(), ChannelError> {
        self.request(|reply| Command::EndSession { reply }).await
    }

    /// Open a fresh connection, replacing any current one.
    pub async fn reconnect(&self) -> Result<(), ChannelError> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Current snapshot.
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Receiver that is notified whenever the snapshot changes.
    pub fn watch_view(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// Tear down and wait for the channel task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "session channel task failed");
            }
        }
    }

    async fn request(&self, build: impl FnOnce(Reply) -> Command) -> Result<(), ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ChannelError::ChannelClosed)?;
        rx.await.map_err(|_| ChannelError::ChannelClosed)?
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver {
    machine: ChannelMachine,
    connector: Arc<dyn Connector>,
    link: Option<(ConnectionId, Link)>,
    connecting: Option<(ConnectionId, JoinHandle<()>)>,
    outcome_tx: mpsc::UnboundedSender<ConnectOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
    reconnect_at: Option<Instant>,
    debounce_at: Option<Instant>,
    events: broadcast::Sender<SessionEvent>,
    view: watch::Sender<SessionView>,
    dropped_frames: u64,
}

impl Driver {
    #[instrument(name = "session_channel", skip_all, fields(session_id = %self.machine.session_id()))]
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        if let Err(e) = self.step(ChannelEvent::Connect) {
            warn!(error = %e, "initial connect refused");
        }

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                Some((id, outcome)) = self.outcome_rx.recv() => self.on_connect_outcome(id, outcome),
                (id, event) = next_link_event(&mut self.link) => self.on_link_event(id, event),
                () = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    if let Err(e) = self.step(ChannelEvent::ReconnectTimerFired) {
                        debug!(error = %e, "reconnect skipped");
                    }
                }
                () = sleep_until_opt(self.debounce_at) => {
                    self.debounce_at = None;
                    if let Err(e) = self.step(ChannelEvent::DebounceElapsed) {
                        warn!(error = %e, "code update not delivered");
                    }
                }
            }
        }

        let _ = self.step(ChannelEvent::Dispose);
        if let Some((_, task)) = self.connecting.take() {
            task.abort();
        }
        debug!(dropped_frames = self.dropped_frames, "session channel stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::UpdateCode(code) => {
                let _ = self.step(ChannelEvent::CodeChanged(code));
            }
            Command::SubmitResponse {
                interaction_id,
                response,
                reply,
            } => {
                let result = self.step(ChannelEvent::SubmitResponse {
                    interaction_id,
                    response,
                });
                let _ = reply.send(result);
            }
            Command::Close {
                code,
                reason,
                reply,
            } => {
                let _ = reply.send(self.step(ChannelEvent::Close { code, reason }));
            }
            Command::EndSession { reply } => {
                let _ = reply.send(self.step(ChannelEvent::EndSession));
            }
            Command::Reconnect { reply } => {
                let _ = reply.send(self.step(ChannelEvent::Connect));
            }
        }
    }

    fn on_connect_outcome(&mut self, id: ConnectionId, outcome: Result<Link, TransportError>) {
        if self.connecting.as_ref().is_none_or(|(current, _)| *current != id) {
            debug!(connection_id = %id, "superseded connect outcome discarded");
            return;
        }
        self.connecting = None;

        let event = match outcome {
            Ok(link) => {
                self.link = Some((id, link));
                ChannelEvent::Opened(id)
            }
            Err(e) => {
                warn!(connection_id = %id, error = %e, "connect failed");
                ChannelEvent::Closed {
                    id,
                    code: ABNORMAL_CLOSURE,
                    reason: e.to_string(),
                }
            }
        };
        let _ = self.step(event);
    }

    fn on_link_event(&mut self, id: ConnectionId, event: Option<LinkEvent>) {
        let event = match event {
            Some(LinkEvent::Text(payload)) => ChannelEvent::MessageReceived { id, payload },
            Some(LinkEvent::Closed { code, reason }) => {
                self.link = None;
                ChannelEvent::Closed { id, code, reason }
            }
            None => {
                self.link = None;
                ChannelEvent::Closed {
                    id,
                    code: ABNORMAL_CLOSURE,
                    reason: String::new(),
                }
            }
        };
        let _ = self.step(event);
    }

    /// Feed one event to the machine and carry out its effects.
    ///
    /// Transmit outcomes are fed back before the view is published, so a
    /// frame the link refused is reported even when the transition itself
    /// succeeded.
    fn step(&mut self, event: ChannelEvent) -> Result<(), ChannelError> {
        let mut result = self.machine.handle(event);
        let mut outcomes = self.apply_effects();
        while !outcomes.is_empty() {
            for outcome in outcomes {
                if let Err(e) = self.machine.handle(outcome) {
                    result = result.and(Err(e));
                }
            }
            outcomes = self.apply_effects();
        }
        self.publish_view();
        result
    }

    /// Carry out queued effects, returning the outcome of every transmit.
    fn apply_effects(&mut self) -> Vec<ChannelEvent> {
        let mut outcomes = Vec::new();
        for effect in self.machine.drain_effects() {
            match effect {
                Effect::Open { id, url } => self.open(id, url),
                Effect::Transmit { id, message } => {
                    outcomes.push(match self.transmit(id, &message) {
                        Ok(()) => ChannelEvent::Delivered { id, message },
                        Err(error) => ChannelEvent::DeliveryFailed { id, message, error },
                    });
                }
                Effect::CloseConnection { id, code, reason } => self.close(id, code, reason),
                Effect::ScheduleReconnect { delay, .. } => {
                    self.reconnect_at = Some(Instant::now() + delay);
                }
                Effect::CancelReconnect => self.reconnect_at = None,
                Effect::ArmDebounce(window) => self.debounce_at = Some(Instant::now() + window),
                Effect::CancelDebounce => self.debounce_at = None,
                Effect::Emit(event) => {
                    let _ = self.events.send(event);
                }
            }
        }
        outcomes
    }

    fn open(&mut self, id: ConnectionId, url: String) {
        if let Some((prev, task)) = self.connecting.take() {
            debug!(connection_id = %prev, "aborting superseded dial");
            task.abort();
        }
        let connector = Arc::clone(&self.connector);
        let outcomes = self.outcome_tx.clone();
        let task = tokio::spawn(async move {
            let outcome = connector.connect(&url).await;
            let _ = outcomes.send((id, outcome));
        });
        self.connecting = Some((id, task));
    }

    fn transmit(&mut self, id: ConnectionId, message: &OutboundMessage) -> Result<(), TransportError> {
        let kind = message.kind();
        let Some((_, link)) = self.link.as_ref().filter(|(current, _)| *current == id) else {
            warn!(connection_id = %id, kind, "no live link for transmit");
            return Err(TransportError::Closed);
        };
        let text = message.to_json().map_err(|e| TransportError::Encode {
            message: e.to_string(),
        })?;
        link.try_send(Frame::Text(text)).map_err(|e| {
            self.dropped_frames += 1;
            warn!(
                connection_id = %id,
                kind,
                error = %e,
                dropped_frames = self.dropped_frames,
                "outbound frame dropped"
            );
            e
        })
    }

    fn close(&mut self, id: ConnectionId, code: u16, reason: String) {
        if let Some((current, link)) = self.link.take() {
            if current == id {
                if let Err(e) = link.try_send(Frame::Close { code, reason }) {
                    debug!(connection_id = %id, error = %e, "close frame not queued");
                }
            } else {
                self.link = Some((current, link));
            }
        }
        if self.connecting.as_ref().is_some_and(|(current, _)| *current == id) {
            if let Some((_, task)) = self.connecting.take() {
                task.abort();
            }
        }
    }

    fn publish_view(&self) {
        let current = self.machine.view();
        let _ = self.view.send_if_modified(|view| {
            if view == current {
                false
            } else {
                view.clone_from(current);
                true
            }
        });
    }
}

async fn next_link_event(link: &mut Option<(ConnectionId, Link)>) -> (ConnectionId, Option<LinkEvent>) {
    match link {
        Some((id, link)) => (*id, link.inbound.recv().await),
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
