use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::logring::Direction;

use super::broker::Broker;
use super::error::RelayError;
use super::protocol::{
    CdpEventPayload, ExtensionCommand, ExtensionFrame, ExtensionFrameKind, TabDetachedPayload,
    TabUpdatedPayload,
};

/// Liveness frame method names on the extension wire.
const PING_METHOD: &str = "ping";
const PONG_METHOD: &str = "pong";

/// Connection state of the single upstream extension socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionState {
    /// No extension socket bound.
    Absent,
    /// Socket upgraded, initial tab sync pending.
    Connecting,
    /// Keepalives flowing; commands may be forwarded.
    Ready,
    /// A pong was missed; the link is suspect but not yet closed.
    Stale,
}

impl ExtensionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Stale => "stale",
        }
    }
}

/// Command sent from the broker to the link task.
pub enum LinkCommand {
    /// Send an extension command and deliver the response via the oneshot.
    Send {
        method: String,
        params: Option<Value>,
        response_tx: oneshot::Sender<Result<Value, RelayError>>,
    },
    /// Close the socket (supersede or shutdown).
    Close { reason: &'static str },
}

/// Handle addressing the current link task.
pub struct LinkHandle {
    pub generation: u64,
    command_tx: mpsc::Sender<LinkCommand>,
}

impl LinkHandle {
    /// Ask the link task to close. Best-effort; the task may already be gone.
    pub async fn close(&self, reason: &'static str) {
        let _ = self.command_tx.send(LinkCommand::Close { reason }).await;
    }
}

struct SlotInner {
    state: ExtensionState,
    handle: Option<LinkHandle>,
}

/// Owner of the single extension link slot.
///
/// A new extension connection always wins: the browser may restart the
/// extension involuntarily, and the replacement must be able to reclaim the
/// slot. The superseded task is told to close and its pendings are drained.
pub struct ExtensionSlot {
    inner: Mutex<SlotInner>,
    next_generation: AtomicU64,
}

impl Default for ExtensionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionSlot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: ExtensionState::Absent,
                handle: None,
            }),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Install a new link, returning its generation and the superseded
    /// handle (if any). State becomes `Connecting`.
    pub fn begin(&self, command_tx: mpsc::Sender<LinkCommand>) -> (u64, Option<LinkHandle>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("extension slot lock poisoned");
        let old = inner.handle.replace(LinkHandle {
            generation,
            command_tx,
        });
        inner.state = ExtensionState::Connecting;
        (generation, old)
    }

    #[must_use]
    pub fn state(&self) -> ExtensionState {
        self.inner.lock().expect("extension slot lock poisoned").state
    }

    /// True when a link socket is bound (any non-absent state).
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.inner
            .lock()
            .expect("extension slot lock poisoned")
            .handle
            .is_some()
    }

    /// Mark the link ready once the initial tab sync has completed.
    pub fn mark_ready(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().expect("extension slot lock poisoned");
        if inner.handle.as_ref().is_some_and(|h| h.generation == generation) {
            inner.state = ExtensionState::Ready;
            true
        } else {
            false
        }
    }

    /// Mark the link stale after a missed pong.
    pub fn mark_stale(&self, generation: u64) {
        let mut inner = self.inner.lock().expect("extension slot lock poisoned");
        if inner.handle.as_ref().is_some_and(|h| h.generation == generation)
            && inner.state == ExtensionState::Ready
        {
            inner.state = ExtensionState::Stale;
        }
    }

    /// A pong arrived: a stale link is healthy again.
    pub fn pong_received(&self, generation: u64) {
        let mut inner = self.inner.lock().expect("extension slot lock poisoned");
        if inner.handle.as_ref().is_some_and(|h| h.generation == generation)
            && inner.state == ExtensionState::Stale
        {
            inner.state = ExtensionState::Ready;
        }
    }

    /// Clear the slot if `generation` is still current. Returns true when
    /// the slot was actually cleared (i.e. no newer link has taken over).
    pub fn clear(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().expect("extension slot lock poisoned");
        if inner.handle.as_ref().is_some_and(|h| h.generation == generation) {
            inner.handle = None;
            inner.state = ExtensionState::Absent;
            true
        } else {
            false
        }
    }

    /// Sender for client-originated forwarding. Fails fast unless the link
    /// is `Ready`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ExtensionAbsent` when no ready link is bound.
    pub fn forward_sender(&self) -> Result<mpsc::Sender<LinkCommand>, RelayError> {
        let inner = self.inner.lock().expect("extension slot lock poisoned");
        if inner.state != ExtensionState::Ready {
            return Err(RelayError::ExtensionAbsent);
        }
        inner
            .handle
            .as_ref()
            .map(|h| h.command_tx.clone())
            .ok_or(RelayError::ExtensionAbsent)
    }

    /// Sender regardless of readiness (handshake traffic, close commands).
    #[must_use]
    pub fn any_sender(&self) -> Option<mpsc::Sender<LinkCommand>> {
        self.inner
            .lock()
            .expect("extension slot lock poisoned")
            .handle
            .as_ref()
            .map(|h| h.command_tx.clone())
    }
}

/// Event surfaced from the link task to the broker's dispatcher.
pub enum ExtensionEvent {
    /// A new link finished its WebSocket upgrade.
    LinkUp { generation: u64 },
    /// The link socket is gone.
    LinkDown { generation: u64, reason: String },
    /// CDP event emitted by a tab.
    Cdp(CdpEventPayload),
    /// The browser debugger detached from a tab.
    TabDetached(TabDetachedPayload),
    /// A tab appeared or changed url/title.
    TabUpdated(TabUpdatedPayload),
}

struct PendingCommand {
    response_tx: oneshot::Sender<Result<Value, RelayError>>,
    method: String,
    deadline: Instant,
}

/// Run the link task for one extension socket until it closes.
///
/// The task owns the socket exclusively: it multiplexes outbound commands,
/// inbound responses/events, the keepalive ticker, and per-command deadlines
/// in a single `select!` loop.
pub async fn run_link(
    broker: Arc<Broker>,
    generation: u64,
    socket: WebSocket,
    command_rx: mpsc::Receiver<LinkCommand>,
) {
    let mut task = LinkTask {
        broker,
        generation,
        socket,
        command_rx,
        pending: HashMap::new(),
        next_id: 1,
        awaiting_pong: false,
        missed_pongs: 0,
    };
    task.run().await;
}

struct LinkTask {
    broker: Arc<Broker>,
    generation: u64,
    socket: WebSocket,
    command_rx: mpsc::Receiver<LinkCommand>,
    pending: HashMap<u64, PendingCommand>,
    next_id: u64,
    awaiting_pong: bool,
    missed_pongs: u32,
}

impl LinkTask {
    async fn run(&mut self) {
        let events = self.broker.events_sender();
        let _ = events
            .send(ExtensionEvent::LinkUp {
                generation: self.generation,
            })
            .await;

        let mut keepalive = tokio::time::interval(self.broker.config.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Consume the immediate first tick so the first ping goes out one
        // full interval after connect.
        keepalive.tick().await;

        let reason: String = loop {
            let next_deadline = self.pending.values().map(|p| p.deadline).min();
            let deadline_sleep = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                frame = self.socket.recv() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(text.as_str(), &events).await;
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            break "socket closed".into();
                        }
                        Some(Ok(_)) => {
                            // Binary and WS-level ping/pong frames are not
                            // part of the extension protocol.
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(LinkCommand::Send { method, params, response_tx }) => {
                            if !self.send_command(method, params, response_tx).await {
                                break "write failed".into();
                            }
                        }
                        Some(LinkCommand::Close { reason }) => {
                            let _ = self.socket.send(Message::Close(Some(CloseFrame {
                                code: 1000,
                                reason: reason.into(),
                            }))).await;
                            break reason.to_owned();
                        }
                        None => break "handle dropped".into(),
                    }
                }

                _ = keepalive.tick() => {
                    if !self.keepalive_tick().await {
                        break "keepalive timeout".into();
                    }
                }

                () = deadline_sleep => {
                    self.sweep_timeouts();
                }
            }
        };

        self.drain_pending();
        let _ = events
            .send(ExtensionEvent::LinkDown {
                generation: self.generation,
                reason,
            })
            .await;
    }

    async fn handle_text(&mut self, text: &str, events: &mpsc::Sender<ExtensionEvent>) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            self.broker.log.append(
                Direction::ExtensionLifecycle,
                None,
                None,
                json!({ "event": "decodeError", "bytes": text.len() }),
            );
            return;
        };

        // Liveness replies stay out of the frame ring.
        if value.get("method").and_then(Value::as_str) == Some(PONG_METHOD) {
            self.awaiting_pong = false;
            self.missed_pongs = 0;
            self.broker.extension.pong_received(self.generation);
            return;
        }

        self.broker
            .log
            .append(Direction::FromExtension, None, None, value.clone());

        let Ok(frame) = serde_json::from_value::<ExtensionFrame>(value) else {
            return;
        };
        match frame.classify() {
            Some(ExtensionFrameKind::Response { id, result }) => {
                if let Some(pending) = self.pending.remove(&id) {
                    let outcome = result.map_err(RelayError::Extension);
                    let _ = pending.response_tx.send(outcome);
                } else {
                    // Late response after timeout: drop, but leave a trace.
                    self.broker.log.append(
                        Direction::ExtensionLifecycle,
                        None,
                        None,
                        json!({ "event": "lateResponse", "id": id }),
                    );
                }
            }
            Some(ExtensionFrameKind::Event { method, params }) => {
                self.dispatch_event(&method, params, events).await;
            }
            None => {}
        }
    }

    async fn dispatch_event(
        &mut self,
        method: &str,
        params: Value,
        events: &mpsc::Sender<ExtensionEvent>,
    ) {
        let event = match method {
            "cdpEvent" => serde_json::from_value::<CdpEventPayload>(params)
                .ok()
                .map(ExtensionEvent::Cdp),
            "tabDetached" => serde_json::from_value::<TabDetachedPayload>(params)
                .ok()
                .map(ExtensionEvent::TabDetached),
            "tabUpdated" => serde_json::from_value::<TabUpdatedPayload>(params)
                .ok()
                .map(ExtensionEvent::TabUpdated),
            other => {
                debug!(method = other, "ignoring unknown extension event");
                None
            }
        };
        if let Some(event) = event {
            let _ = events.send(event).await;
        }
    }

    /// Write a command frame. Returns false when the socket is unusable.
    async fn send_command(
        &mut self,
        method: String,
        params: Option<Value>,
        response_tx: oneshot::Sender<Result<Value, RelayError>>,
    ) -> bool {
        let id = self.next_id;
        self.next_id += 1;
        let command = ExtensionCommand {
            id,
            method: method.clone(),
            params,
        };
        let json = match serde_json::to_string(&command) {
            Ok(json) => json,
            Err(e) => {
                let _ = response_tx.send(Err(RelayError::Internal(format!(
                    "serialization error: {e}"
                ))));
                return true;
            }
        };

        self.broker.log.append(
            Direction::ToExtension,
            None,
            None,
            serde_json::to_value(&command).unwrap_or(Value::Null),
        );

        if let Err(e) = self.socket.send(Message::Text(json.into())).await {
            warn!(error = %e, "extension socket write failed");
            let _ = response_tx.send(Err(RelayError::LinkClosed));
            return false;
        }

        self.pending.insert(
            id,
            PendingCommand {
                response_tx,
                method,
                deadline: Instant::now() + self.broker.config.command_timeout,
            },
        );
        true
    }

    /// Keepalive tick: count the outstanding pong, then send the next ping.
    /// Returns false once the miss limit is reached.
    async fn keepalive_tick(&mut self) -> bool {
        if self.awaiting_pong {
            self.missed_pongs += 1;
            if self.missed_pongs == 1 {
                self.broker.extension.mark_stale(self.generation);
                self.broker.log.append(
                    Direction::ExtensionLifecycle,
                    None,
                    None,
                    json!({ "event": "stale", "missedPongs": self.missed_pongs }),
                );
            }
            if self.missed_pongs >= self.broker.config.missed_pong_limit {
                return false;
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        let ping = json!({ "id": id, "method": PING_METHOD });
        if self.socket.send(Message::Text(ping.to_string().into())).await.is_err() {
            return false;
        }
        self.awaiting_pong = true;
        true
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let timed_out: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&id, _)| id)
            .collect();

        for id in timed_out {
            if let Some(pending) = self.pending.remove(&id) {
                self.broker.log.append(
                    Direction::ExtensionLifecycle,
                    None,
                    None,
                    json!({ "event": "commandTimeout", "id": id, "method": pending.method }),
                );
                let _ = pending.response_tx.send(Err(RelayError::CommandTimeout {
                    method: pending.method,
                }));
            }
        }
    }

    fn drain_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (_, p) in pending {
            let _ = p.response_tx.send(Err(RelayError::LinkClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_sender() -> mpsc::Sender<LinkCommand> {
        mpsc::channel(1).0
    }

    // --- slot state machine ---

    #[test]
    fn slot_starts_absent() {
        let slot = ExtensionSlot::new();
        assert_eq!(slot.state(), ExtensionState::Absent);
        assert!(!slot.is_attached());
        assert!(slot.forward_sender().is_err());
    }

    #[test]
    fn begin_installs_connecting_link() {
        let slot = ExtensionSlot::new();
        let (generation, old) = slot.begin(dummy_sender());
        assert!(old.is_none());
        assert_eq!(slot.state(), ExtensionState::Connecting);
        assert!(slot.is_attached());
        // Not ready yet: forwarding must fail fast.
        assert!(slot.forward_sender().is_err());
        assert!(slot.mark_ready(generation));
        assert!(slot.forward_sender().is_ok());
    }

    #[test]
    fn new_link_supersedes_old() {
        let slot = ExtensionSlot::new();
        let (first, _) = slot.begin(dummy_sender());
        let (second, old) = slot.begin(dummy_sender());
        assert!(old.is_some());
        assert_eq!(old.unwrap().generation, first);
        assert!(second > first);

        // The old generation can no longer mutate the slot.
        assert!(!slot.mark_ready(first));
        assert!(!slot.clear(first));
        assert!(slot.is_attached());
    }

    #[test]
    fn clear_current_generation_resets_to_absent() {
        let slot = ExtensionSlot::new();
        let (generation, _) = slot.begin(dummy_sender());
        slot.mark_ready(generation);
        assert!(slot.clear(generation));
        assert_eq!(slot.state(), ExtensionState::Absent);
        assert!(slot.forward_sender().is_err());
    }

    #[test]
    fn stale_and_pong_round_trip() {
        let slot = ExtensionSlot::new();
        let (generation, _) = slot.begin(dummy_sender());
        slot.mark_ready(generation);

        slot.mark_stale(generation);
        assert_eq!(slot.state(), ExtensionState::Stale);
        assert!(slot.forward_sender().is_err());

        slot.pong_received(generation);
        assert_eq!(slot.state(), ExtensionState::Ready);
        assert!(slot.forward_sender().is_ok());
    }

    #[test]
    fn stale_before_ready_is_ignored() {
        let slot = ExtensionSlot::new();
        let (generation, _) = slot.begin(dummy_sender());
        slot.mark_stale(generation);
        assert_eq!(slot.state(), ExtensionState::Connecting);
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ExtensionState::Ready).unwrap(),
            serde_json::Value::String("ready".into())
        );
        assert_eq!(ExtensionState::Absent.as_str(), "absent");
    }
}
