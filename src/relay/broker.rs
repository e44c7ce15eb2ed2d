use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ResolvedRelay;
use crate::logring::{Direction, LogRing, now_iso8601};

use super::client::{CLOSE_NORMAL, CLOSE_OVERLOAD, ClientHandle, ClientShared};
use super::error::RelayError;
use super::extension::{ExtensionEvent, ExtensionSlot, ExtensionState, LinkCommand};
use super::protocol::{
    self, AttachResult, CdpEventPayload, ClientFrame, EXTENSION_ERROR, INTERNAL_ERROR,
    METHOD_NOT_FOUND, TabDetachedPayload, TabRecord, TabUpdatedPayload,
};
use super::registry::{Registry, SessionEntry, TargetEntry};

/// Product string reported by `Browser.getVersion`.
const PRODUCT: &str = "BrowserForce/1.0";

/// Pause between the coerced `Runtime.disable` and the forwarded
/// `Runtime.enable`, long enough for the browser to tear the agent down.
const RUNTIME_REENABLE_DELAY: Duration = Duration::from_millis(50);

/// Detach reason meaning the user revoked debugging for the whole browser.
const REASON_CANCELED: &str = "canceled_by_user";
/// Detach reason meaning the tab itself is gone.
const REASON_TARGET_CLOSED: &str = "target_closed";

/// Outcome of one inbound client frame, as seen by the reader loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Frame was classified and handled (even if it produced a CDP error).
    Handled,
    /// Frame could not be decoded; the reader counts these toward its
    /// close threshold.
    DecodeFault,
}

/// The relay broker: glues the extension link, target registry, and client
/// sessions together, translating CDP frames to extension frames and back.
///
/// Instance-scoped on purpose: the process owns exactly one, tests build as
/// many as they like.
pub struct Broker {
    pub config: ResolvedRelay,
    pub token: String,
    pub log: LogRing,
    pub registry: Mutex<Registry>,
    pub extension: ExtensionSlot,
    clients: Mutex<HashMap<u64, ClientHandle>>,
    next_client_id: AtomicU64,
    events_tx: mpsc::Sender<ExtensionEvent>,
}

impl Broker {
    /// Build a broker and spawn its extension-event dispatcher.
    #[must_use]
    pub fn start(config: ResolvedRelay, token: String) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity);
        let broker = Arc::new(Self {
            log: LogRing::new(config.log_capacity),
            config,
            token,
            registry: Mutex::new(Registry::new()),
            extension: ExtensionSlot::new(),
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            events_tx,
        });
        tokio::spawn(run_dispatcher(Arc::clone(&broker), events_rx));
        broker
    }

    /// Sender side of the extension-event channel, for link tasks.
    #[must_use]
    pub fn events_sender(&self) -> mpsc::Sender<ExtensionEvent> {
        self.events_tx.clone()
    }

    // ------------------------------------------------------------------
    // Client lifecycle
    // ------------------------------------------------------------------

    /// Register a new CDP client, returning its id plus the egress queue
    /// receiver and close-state for the writer task.
    pub fn register_client(
        &self,
        label: Option<String>,
    ) -> (u64, mpsc::Receiver<String>, Arc<ClientShared>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (handle, receiver, shared) = ClientHandle::new(
            client_id,
            label.clone(),
            now_iso8601(),
            self.config.client_queue_capacity,
        );
        self.log.append(
            Direction::ClientLifecycle,
            Some(client_id),
            label.as_deref(),
            json!({ "event": "connected" }),
        );
        info!(client_id, label = label.as_deref(), "cdp client connected");
        self.clients
            .lock()
            .expect("client map lock poisoned")
            .insert(client_id, handle);
        (client_id, receiver, shared)
    }

    /// Drop a client: close its socket with the given reason, release its
    /// sessions, and detach targets nobody else holds.
    pub fn drop_client(&self, client_id: u64, code: u16, reason: &str) {
        let handle = self
            .clients
            .lock()
            .expect("client map lock poisoned")
            .remove(&client_id);
        let Some(handle) = handle else { return };
        handle.set_close(code, reason);
        self.log.append(
            Direction::ClientLifecycle,
            Some(client_id),
            handle.label.as_deref(),
            json!({ "event": "disconnected", "reason": reason }),
        );
        info!(client_id, reason, "cdp client dropped");
        // Dropping the handle closes the egress queue; the writer task
        // flushes the close frame recorded above.
        drop(handle);

        let removed = self
            .registry
            .lock()
            .expect("registry lock poisoned")
            .remove_client_sessions(client_id);
        self.release_orphaned_targets(&removed);
    }

    /// True while the client is still registered.
    #[must_use]
    pub fn client_connected(&self, client_id: u64) -> bool {
        self.clients
            .lock()
            .expect("client map lock poisoned")
            .contains_key(&client_id)
    }

    fn client_label(&self, client_id: u64) -> Option<String> {
        self.clients
            .lock()
            .expect("client map lock poisoned")
            .get(&client_id)
            .and_then(|c| c.label.clone())
    }

    /// After sessions were removed, detach any target left without holders.
    fn release_orphaned_targets(&self, removed: &[SessionEntry]) {
        for session in removed {
            let orphan = {
                let mut reg = self.registry.lock().expect("registry lock poisoned");
                let still_held = !reg.sessions_for_target(&session.target_id).is_empty();
                let attached = reg.get(&session.target_id).is_some_and(|t| t.attached);
                if !still_held && attached {
                    reg.set_attached(&session.target_id, false);
                    reg.get(&session.target_id).map(TargetEntry::target_info)
                } else {
                    None
                }
            };
            if let Some(info) = orphan {
                self.extension_cast("detachTab", Some(json!({ "tabId": session.tab_id })));
                self.broadcast_target_event(
                    "Target.targetInfoChanged",
                    json!({ "targetInfo": info }),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Egress
    // ------------------------------------------------------------------

    /// Queue a frame to one client. A full queue means the consumer is not
    /// keeping up; the client is dropped rather than stalling upstream.
    pub fn send_to_client(&self, client_id: u64, frame: &Value) {
        let overflow = {
            let clients = self.clients.lock().expect("client map lock poisoned");
            let Some(handle) = clients.get(&client_id) else {
                return;
            };
            if handle.try_enqueue(frame.to_string()).is_ok() {
                self.log.append(
                    Direction::ToClient,
                    Some(client_id),
                    handle.label.as_deref(),
                    frame.clone(),
                );
                false
            } else {
                true
            }
        };
        if overflow {
            self.drop_client(client_id, CLOSE_OVERLOAD, "slow consumer");
        }
    }

    /// Send a Target-domain event to every client that opted into discovery.
    pub fn broadcast_target_event(&self, method: &str, params: Value) {
        let recipients: Vec<u64> = {
            let clients = self.clients.lock().expect("client map lock poisoned");
            clients
                .values()
                .filter(|c| c.discover)
                .map(|c| c.client_id)
                .collect()
        };
        let frame = protocol::event(method, params, None);
        for client_id in recipients {
            self.send_to_client(client_id, &frame);
        }
    }

    /// `Target.targetDestroyed` to discovery subscribers plus any client
    /// that held a session on the target, deduplicated.
    fn notify_target_destroyed(&self, target_id: &str, holders: &[SessionEntry]) {
        let mut recipients: HashSet<u64> = {
            let clients = self.clients.lock().expect("client map lock poisoned");
            clients
                .values()
                .filter(|c| c.discover)
                .map(|c| c.client_id)
                .collect()
        };
        recipients.extend(
            holders
                .iter()
                .filter(|s| s.target_id == target_id)
                .map(|s| s.client_id),
        );
        let frame = protocol::event(
            "Target.targetDestroyed",
            json!({ "targetId": target_id }),
            None,
        );
        for client_id in recipients {
            self.send_to_client(client_id, &frame);
        }
    }

    // ------------------------------------------------------------------
    // Extension calls
    // ------------------------------------------------------------------

    /// Send a command to the extension and await its response.
    ///
    /// # Errors
    ///
    /// `RelayError::ExtensionAbsent` when no ready link is bound,
    /// `RelayError::LinkClosed` if the link dies mid-flight,
    /// `RelayError::CommandTimeout` / `RelayError::Extension` from the link.
    pub async fn extension_call(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RelayError> {
        let tx = self.extension.forward_sender()?;
        Self::call_via(&tx, method, params).await
    }

    /// Like [`extension_call`](Self::extension_call) but usable during the
    /// connecting handshake (initial `listTabs`).
    async fn extension_call_any(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RelayError> {
        let tx = self
            .extension
            .any_sender()
            .ok_or(RelayError::ExtensionAbsent)?;
        Self::call_via(&tx, method, params).await
    }

    async fn call_via(
        tx: &mpsc::Sender<LinkCommand>,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RelayError> {
        let (response_tx, response_rx) = oneshot::channel();
        tx.send(LinkCommand::Send {
            method: method.to_owned(),
            params,
            response_tx,
        })
        .await
        .map_err(|_| RelayError::LinkClosed)?;
        response_rx.await.map_err(|_| RelayError::LinkClosed)?
    }

    /// Fire-and-forget extension command; the response is discarded.
    pub fn extension_cast(&self, method: &str, params: Option<Value>) {
        if let Ok(tx) = self.extension.forward_sender() {
            let (response_tx, _discarded) = oneshot::channel();
            let _ = tx.try_send(LinkCommand::Send {
                method: method.to_owned(),
                params,
                response_tx,
            });
        }
    }

    // ------------------------------------------------------------------
    // Client ingress
    // ------------------------------------------------------------------

    /// Handle one text frame from a client socket.
    pub async fn handle_client_frame(self: &Arc<Self>, client_id: u64, text: &str) -> FrameOutcome {
        let label = self.client_label(client_id);

        let Ok(value) = serde_json::from_str::<Value>(text) else {
            self.log.append(
                Direction::ClientLifecycle,
                Some(client_id),
                label.as_deref(),
                json!({ "event": "decodeError", "bytes": text.len() }),
            );
            return FrameOutcome::DecodeFault;
        };
        self.log.append(
            Direction::FromClient,
            Some(client_id),
            label.as_deref(),
            value.clone(),
        );

        let frame = match serde_json::from_value::<ClientFrame>(value) {
            Ok(frame) => frame,
            Err(_) => {
                self.log.append(
                    Direction::ClientLifecycle,
                    Some(client_id),
                    label.as_deref(),
                    json!({ "event": "decodeError", "detail": "unrecognized frame shape" }),
                );
                return FrameOutcome::DecodeFault;
            }
        };
        let (Some(id), Some(method)) = (frame.id, frame.method) else {
            self.log.append(
                Direction::ClientLifecycle,
                Some(client_id),
                label.as_deref(),
                json!({ "event": "decodeError", "detail": "missing id or method" }),
            );
            return FrameOutcome::DecodeFault;
        };

        if let Some(session_id) = frame.session_id {
            self.forward_session(client_id, id, &method, frame.params, &session_id)
                .await;
        } else {
            self.handle_local(client_id, id, &method, frame.params).await;
        }
        FrameOutcome::Handled
    }

    /// Route a session-scoped frame to the extension as `cdpCommand`.
    async fn forward_session(
        self: &Arc<Self>,
        client_id: u64,
        id: u64,
        method: &str,
        params: Option<Value>,
        session_id: &str,
    ) {
        enum Route {
            Session { tab_id: u64, reenable: bool },
            Child { tab_id: u64 },
            Unknown,
        }

        let route = {
            let mut reg = self.registry.lock().expect("registry lock poisoned");
            if let Some(entry) = reg.session_mut(session_id) {
                if entry.client_id == client_id {
                    let reenable = method == "Runtime.enable" && !entry.runtime_enabled;
                    if reenable {
                        entry.runtime_enabled = true;
                    }
                    Route::Session {
                        tab_id: entry.tab_id,
                        reenable,
                    }
                } else {
                    Route::Unknown
                }
            } else if let Some(tab_id) = reg.child_session_tab(session_id) {
                Route::Child { tab_id }
            } else {
                Route::Unknown
            }
        };

        match route {
            Route::Unknown => {
                self.send_to_client(
                    client_id,
                    &protocol::response_err(
                        id,
                        Some(session_id),
                        INTERNAL_ERROR,
                        "session not found",
                    ),
                );
            }
            Route::Session { tab_id, reenable } => {
                if reenable {
                    // The browser only re-emits executionContextCreated for
                    // an agent it believes is freshly enabled, so cycle it.
                    self.extension_cast(
                        "cdpCommand",
                        Some(json!({ "tabId": tab_id, "method": "Runtime.disable" })),
                    );
                    tokio::time::sleep(RUNTIME_REENABLE_DELAY).await;
                }
                self.forward_command(client_id, id, session_id, tab_id, None, method, params)
                    .await;
            }
            Route::Child { tab_id } => {
                self.forward_command(
                    client_id,
                    id,
                    session_id,
                    tab_id,
                    Some(session_id),
                    method,
                    params,
                )
                .await;
            }
        }
    }

    /// Submit a `cdpCommand` in ingress order; the response is awaited off
    /// the ingress path so later frames from the same client keep flowing.
    #[allow(clippy::too_many_arguments)]
    async fn forward_command(
        self: &Arc<Self>,
        client_id: u64,
        id: u64,
        session_stamp: &str,
        tab_id: u64,
        child_session_id: Option<&str>,
        method: &str,
        params: Option<Value>,
    ) {
        let mut ext_params = json!({ "tabId": tab_id, "method": method });
        if let Some(params) = params {
            ext_params["params"] = params;
        }
        if let Some(child) = child_session_id {
            ext_params["childSessionId"] = Value::String(child.to_owned());
        }

        let tx = match self.extension.forward_sender() {
            Ok(tx) => tx,
            Err(e) => {
                self.send_to_client(
                    client_id,
                    &protocol::response_err(id, Some(session_stamp), e.cdp_code(), &e.cdp_message()),
                );
                return;
            }
        };

        let (response_tx, response_rx) = oneshot::channel();
        if tx
            .send(LinkCommand::Send {
                method: "cdpCommand".into(),
                params: Some(ext_params),
                response_tx,
            })
            .await
            .is_err()
        {
            let e = RelayError::LinkClosed;
            self.send_to_client(
                client_id,
                &protocol::response_err(id, Some(session_stamp), e.cdp_code(), &e.cdp_message()),
            );
            return;
        }

        let broker = Arc::clone(self);
        let session_stamp = session_stamp.to_owned();
        tokio::spawn(async move {
            let outcome = match response_rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(RelayError::LinkClosed),
            };
            let frame = match outcome {
                Ok(result) => protocol::response_ok(id, Some(&session_stamp), result),
                Err(e) => protocol::response_err(
                    id,
                    Some(&session_stamp),
                    e.cdp_code(),
                    &e.cdp_message(),
                ),
            };
            broker.send_to_client(client_id, &frame);
        });
    }

    /// Answer methods the broker synthesizes locally.
    async fn handle_local(
        self: &Arc<Self>,
        client_id: u64,
        id: u64,
        method: &str,
        params: Option<Value>,
    ) {
        let params = params.unwrap_or(Value::Null);
        match method {
            "Browser.getVersion" => {
                self.send_to_client(
                    client_id,
                    &protocol::response_ok(
                        id,
                        None,
                        json!({
                            "protocolVersion": "1.3",
                            "product": PRODUCT,
                            "revision": "",
                            "userAgent": "BrowserForce Relay",
                            "jsVersion": "",
                        }),
                    ),
                );
            }
            "Target.getTargets" => {
                let infos: Vec<Value> = {
                    let reg = self.registry.lock().expect("registry lock poisoned");
                    reg.snapshot().iter().map(TargetEntry::target_info).collect()
                };
                self.send_to_client(
                    client_id,
                    &protocol::response_ok(id, None, json!({ "targetInfos": infos })),
                );
            }
            "Target.setDiscoverTargets" => {
                let discover = params["discover"].as_bool().unwrap_or(false);
                {
                    let mut clients = self.clients.lock().expect("client map lock poisoned");
                    if let Some(client) = clients.get_mut(&client_id) {
                        client.discover = discover;
                    }
                }
                if discover {
                    // Replay the current world before any live event so the
                    // subscriber starts consistent.
                    let infos: Vec<Value> = {
                        let reg = self.registry.lock().expect("registry lock poisoned");
                        reg.snapshot().iter().map(TargetEntry::target_info).collect()
                    };
                    for info in infos {
                        self.send_to_client(
                            client_id,
                            &protocol::event(
                                "Target.targetCreated",
                                json!({ "targetInfo": info }),
                                None,
                            ),
                        );
                    }
                }
                self.send_to_client(client_id, &protocol::response_ok(id, None, json!({})));
            }
            "Target.setAutoAttach" => {
                let auto_attach = params["autoAttach"].as_bool().unwrap_or(false);
                let wait = params["waitForDebuggerOnStart"].as_bool().unwrap_or(false);
                {
                    let mut clients = self.clients.lock().expect("client map lock poisoned");
                    if let Some(client) = clients.get_mut(&client_id) {
                        client.auto_attach = auto_attach;
                        client.wait_for_debugger = wait;
                    }
                }
                self.send_to_client(client_id, &protocol::response_ok(id, None, json!({})));
            }
            "Target.attachToTarget" => {
                self.attach_to_target(client_id, id, &params).await;
            }
            "Target.detachFromTarget" => {
                self.detach_from_target(client_id, id, &params);
            }
            "Target.createTarget" => {
                self.create_target(client_id, id, &params).await;
            }
            "Target.closeTarget" => {
                self.close_target(client_id, id, &params).await;
            }
            other => {
                debug!(client_id, method = other, "unrouteable method");
                self.send_to_client(
                    client_id,
                    &protocol::response_err(
                        id,
                        None,
                        METHOD_NOT_FOUND,
                        &format!("'{other}' wasn't found"),
                    ),
                );
            }
        }
    }

    async fn attach_to_target(self: &Arc<Self>, client_id: u64, id: u64, params: &Value) {
        let Some(target_id) = params["targetId"].as_str() else {
            self.send_to_client(
                client_id,
                &protocol::response_err(id, None, EXTENSION_ERROR, "targetId is required"),
            );
            return;
        };
        if !params["flatten"].as_bool().unwrap_or(false) {
            self.send_to_client(
                client_id,
                &protocol::response_err(
                    id,
                    None,
                    EXTENSION_ERROR,
                    "only flatten mode is supported",
                ),
            );
            return;
        }

        let minted = {
            let mut reg = self.registry.lock().expect("registry lock poisoned");
            reg.mint_session(client_id, target_id)
        };
        let Some(outcome) = minted else {
            self.send_to_client(
                client_id,
                &protocol::response_err(
                    id,
                    None,
                    EXTENSION_ERROR,
                    "no target with given id found",
                ),
            );
            return;
        };

        if !outcome.created {
            // One active session per (client, target): re-attach returns it.
            self.send_to_client(
                client_id,
                &protocol::response_ok(id, None, json!({ "sessionId": outcome.session_id })),
            );
            return;
        }

        let attach = self
            .extension_call(
                "attachTab",
                Some(json!({ "tabId": outcome.tab_id, "sessionId": outcome.session_id })),
            )
            .await;

        match attach {
            Ok(result) => {
                // Adopt url/title from the browser's targetInfo when present;
                // the target's first-seen identity stays stable.
                let info = {
                    let mut reg = self.registry.lock().expect("registry lock poisoned");
                    if let Ok(attach) = serde_json::from_value::<AttachResult>(result)
                        && let Some(target_info) = attach.target_info
                    {
                        reg.upsert_tab(
                            attach.tab_id,
                            None,
                            target_info["url"].as_str(),
                            target_info["title"].as_str(),
                        );
                    }
                    reg.set_attached(target_id, true);
                    reg.get(target_id).map(TargetEntry::target_info)
                };

                if let Some(info) = &info {
                    self.send_to_client(
                        client_id,
                        &protocol::event(
                            "Target.attachedToTarget",
                            json!({
                                "sessionId": outcome.session_id,
                                "targetInfo": info,
                                "waitingForDebugger": false,
                            }),
                            None,
                        ),
                    );
                }
                self.send_to_client(
                    client_id,
                    &protocol::response_ok(id, None, json!({ "sessionId": outcome.session_id })),
                );
                if let Some(info) = info {
                    self.broadcast_target_event(
                        "Target.targetInfoChanged",
                        json!({ "targetInfo": info }),
                    );
                }
            }
            Err(e) => {
                {
                    let mut reg = self.registry.lock().expect("registry lock poisoned");
                    reg.remove_session(&outcome.session_id);
                }
                self.send_to_client(
                    client_id,
                    &protocol::response_err(id, None, e.cdp_code(), &e.cdp_message()),
                );
            }
        }
    }

    fn detach_from_target(&self, client_id: u64, id: u64, params: &Value) {
        let Some(session_id) = params["sessionId"].as_str() else {
            self.send_to_client(
                client_id,
                &protocol::response_err(id, None, EXTENSION_ERROR, "sessionId is required"),
            );
            return;
        };

        let removed = {
            let mut reg = self.registry.lock().expect("registry lock poisoned");
            let owned = reg
                .session(session_id)
                .is_some_and(|s| s.client_id == client_id);
            if owned {
                reg.remove_session(session_id)
            } else {
                None
            }
        };
        let Some(entry) = removed else {
            self.send_to_client(
                client_id,
                &protocol::response_err(id, None, INTERNAL_ERROR, "session not found"),
            );
            return;
        };

        self.send_to_client(
            client_id,
            &protocol::event(
                "Target.detachedFromTarget",
                json!({ "sessionId": entry.session_id, "targetId": entry.target_id }),
                None,
            ),
        );
        self.send_to_client(client_id, &protocol::response_ok(id, None, json!({})));
        self.release_orphaned_targets(std::slice::from_ref(&entry));
    }

    async fn create_target(self: &Arc<Self>, client_id: u64, id: u64, params: &Value) {
        let url = params["url"].as_str().unwrap_or("about:blank");
        let (auto_attach, wait) = {
            let clients = self.clients.lock().expect("client map lock poisoned");
            clients
                .get(&client_id)
                .map_or((false, false), |c| (c.auto_attach, c.wait_for_debugger))
        };

        // The extension attaches on create, so a session id travels along.
        let provisional = uuid::Uuid::new_v4().to_string();
        let created = self
            .extension_call(
                "createTab",
                Some(json!({ "url": url, "sessionId": provisional })),
            )
            .await;

        let result = match created {
            Ok(result) => result,
            Err(e) => {
                self.send_to_client(
                    client_id,
                    &protocol::response_err(id, None, e.cdp_code(), &e.cdp_message()),
                );
                return;
            }
        };
        let Ok(attach) = serde_json::from_value::<AttachResult>(result) else {
            self.send_to_client(
                client_id,
                &protocol::response_err(id, None, INTERNAL_ERROR, "malformed createTab result"),
            );
            return;
        };

        let (target_id, info) = {
            let mut reg = self.registry.lock().expect("registry lock poisoned");
            let (target_id, _) =
                reg.upsert_tab(attach.tab_id, attach.target_id.as_deref(), Some(url), None);
            let info = reg.get(&target_id).map(TargetEntry::target_info);
            (target_id, info)
        };
        if let Some(info) = info {
            self.broadcast_target_event("Target.targetCreated", json!({ "targetInfo": info }));
        }

        if auto_attach && wait {
            let bound = {
                let mut reg = self.registry.lock().expect("registry lock poisoned");
                let bound = reg.bind_session(&provisional, client_id, &target_id);
                if bound.is_some() {
                    reg.set_attached(&target_id, true);
                }
                bound.map(|b| {
                    (
                        b.session_id,
                        reg.get(&target_id).map(TargetEntry::target_info),
                    )
                })
            };
            if let Some((session_id, info)) = bound {
                self.send_to_client(
                    client_id,
                    &protocol::event(
                        "Target.attachedToTarget",
                        json!({
                            "sessionId": session_id,
                            "targetInfo": info,
                            // Pausing new targets until runIfWaitingForDebugger
                            // is not implemented; report them running.
                            "waitingForDebugger": false,
                        }),
                        None,
                    ),
                );
            }
        } else {
            // The client decides whether to attach; release the implicit
            // attach the extension performed on create.
            self.extension_cast("detachTab", Some(json!({ "tabId": attach.tab_id })));
        }

        self.send_to_client(
            client_id,
            &protocol::response_ok(id, None, json!({ "targetId": target_id })),
        );
    }

    async fn close_target(self: &Arc<Self>, client_id: u64, id: u64, params: &Value) {
        let Some(target_id) = params["targetId"].as_str() else {
            self.send_to_client(
                client_id,
                &protocol::response_err(id, None, EXTENSION_ERROR, "targetId is required"),
            );
            return;
        };
        let tab_id = {
            let reg = self.registry.lock().expect("registry lock poisoned");
            reg.get(target_id).map(|t| t.tab_id)
        };
        let Some(tab_id) = tab_id else {
            self.send_to_client(
                client_id,
                &protocol::response_err(
                    id,
                    None,
                    EXTENSION_ERROR,
                    "no target with given id found",
                ),
            );
            return;
        };

        match self
            .extension_call("closeTab", Some(json!({ "tabId": tab_id })))
            .await
        {
            Ok(_) => {
                let (holders, target_id_owned) = {
                    let mut reg = self.registry.lock().expect("registry lock poisoned");
                    let holders = reg.remove_sessions_for_target(target_id);
                    reg.remove_target(target_id);
                    (holders, target_id.to_owned())
                };
                self.send_to_client(
                    client_id,
                    &protocol::response_ok(id, None, json!({ "success": true })),
                );
                self.notify_target_destroyed(&target_id_owned, &holders);
            }
            Err(e) => {
                self.send_to_client(
                    client_id,
                    &protocol::response_err(id, None, e.cdp_code(), &e.cdp_message()),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Extension event handling (single dispatcher task)
    // ------------------------------------------------------------------

    fn handle_extension_event(self: &Arc<Self>, event: ExtensionEvent) {
        match event {
            ExtensionEvent::LinkUp { generation } => {
                // The tab sync awaits a link response; run it off the
                // dispatcher so event handling never blocks on the link.
                let broker = Arc::clone(self);
                tokio::spawn(async move {
                    broker.handle_link_up(generation).await;
                });
            }
            ExtensionEvent::LinkDown { generation, reason } => {
                self.handle_link_down(generation, &reason);
            }
            ExtensionEvent::Cdp(payload) => self.handle_cdp_event(payload),
            ExtensionEvent::TabDetached(payload) => self.handle_tab_detached(&payload),
            ExtensionEvent::TabUpdated(payload) => self.handle_tab_updated(&payload),
        }
    }

    /// Initial tab sync: seed the registry, then mark the link ready.
    async fn handle_link_up(self: &Arc<Self>, generation: u64) {
        let listed = self.extension_call_any("listTabs", None).await;
        let tabs: Vec<TabRecord> = match listed {
            Ok(result) => serde_json::from_value(result["tabs"].clone()).unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "extension tab sync failed");
                if let Some(tx) = self.extension.any_sender() {
                    let _ = tx
                        .send(LinkCommand::Close {
                            reason: "handshake failed",
                        })
                        .await;
                }
                return;
            }
        };

        if !self.extension.mark_ready(generation) {
            // Superseded while the sync was in flight.
            return;
        }

        let (created, destroyed) = {
            let mut reg = self.registry.lock().expect("registry lock poisoned");
            let live: HashSet<u64> = tabs.iter().map(|t| t.tab_id).collect();

            // Targets whose tab disappeared while the link was down.
            let stale: Vec<TargetEntry> = reg
                .snapshot()
                .into_iter()
                .filter(|t| !live.contains(&t.tab_id))
                .collect();
            let mut destroyed = Vec::new();
            for target in stale {
                let holders = reg.remove_sessions_for_target(&target.target_id);
                reg.remove_target(&target.target_id);
                destroyed.push((target.target_id, holders));
            }

            let mut created = Vec::new();
            for tab in &tabs {
                let (target_id, is_new) =
                    reg.upsert_tab(tab.tab_id, None, tab.url.as_deref(), tab.title.as_deref());
                if is_new && let Some(entry) = reg.get(&target_id) {
                    created.push(entry.target_info());
                }
            }
            (created, destroyed)
        };

        for (target_id, holders) in destroyed {
            self.notify_target_destroyed(&target_id, &holders);
        }
        for info in created {
            self.broadcast_target_event("Target.targetCreated", json!({ "targetInfo": info }));
        }

        self.log.append(
            Direction::ExtensionLifecycle,
            None,
            None,
            json!({ "event": "ready", "tabs": tabs.len() }),
        );
        info!(tabs = tabs.len(), "extension link ready");
    }

    /// The link died: the browser view is gone, so every target goes with it.
    fn handle_link_down(self: &Arc<Self>, generation: u64, reason: &str) {
        if !self.extension.clear(generation) {
            // A newer link superseded this one and owns the world now.
            return;
        }
        self.log.append(
            Direction::ExtensionLifecycle,
            None,
            None,
            json!({ "event": "disconnected", "reason": reason }),
        );
        info!(reason, "extension link down");

        let (sessions, targets) = {
            let mut reg = self.registry.lock().expect("registry lock poisoned");
            (reg.drain_sessions(), reg.clear_targets())
        };
        for target in targets {
            self.notify_target_destroyed(&target.target_id, &sessions);
        }
    }

    /// Fan a tab's CDP event out to every session attached to its target.
    fn handle_cdp_event(self: &Arc<Self>, payload: CdpEventPayload) {
        // Flat-mode auto-attach traffic defines the child-session universe.
        if payload.method == "Target.attachedToTarget"
            && let Some(child) = payload.params["sessionId"].as_str()
        {
            let mut reg = self.registry.lock().expect("registry lock poisoned");
            reg.register_child_session(child, payload.tab_id);
            let target_info = &payload.params["targetInfo"];
            if let Some(child_target) = target_info["targetId"].as_str()
                && target_info["type"].as_str() != Some("page")
            {
                reg.upsert_child_target(
                    child_target,
                    payload.tab_id,
                    target_info["url"].as_str(),
                    target_info["title"].as_str(),
                );
            }
        } else if payload.method == "Target.detachedFromTarget"
            && let Some(child) = payload.params["sessionId"].as_str()
        {
            let mut reg = self.registry.lock().expect("registry lock poisoned");
            reg.remove_child_session(child);
        }

        let sessions = {
            let reg = self.registry.lock().expect("registry lock poisoned");
            reg.sessions_for_tab(payload.tab_id)
        };

        if let Some(child) = payload.child_session_id {
            // Child events keep the browser's session id on the envelope;
            // deliver once per attached client.
            let recipients: HashSet<u64> = sessions.iter().map(|s| s.client_id).collect();
            let frame = protocol::event(&payload.method, payload.params, Some(&child));
            for client_id in recipients {
                self.send_to_client(client_id, &frame);
            }
        } else {
            for session in sessions {
                let frame = protocol::event(
                    &payload.method,
                    payload.params.clone(),
                    Some(&session.session_id),
                );
                self.send_to_client(session.client_id, &frame);
            }
        }
    }

    fn handle_tab_detached(self: &Arc<Self>, payload: &TabDetachedPayload) {
        if payload.reason == REASON_CANCELED {
            // The user revoked debugging for the whole browser, not one tab:
            // every attached target detaches and clients must re-attach on
            // fresh consent.
            let (sessions, attached) = {
                let mut reg = self.registry.lock().expect("registry lock poisoned");
                let attached = reg.attached_targets();
                for target in &attached {
                    reg.set_attached(&target.target_id, false);
                }
                (reg.drain_sessions(), attached)
            };
            for target in attached {
                self.notify_target_destroyed(&target.target_id, &sessions);
            }
            return;
        }

        let target = {
            let reg = self.registry.lock().expect("registry lock poisoned");
            reg.target_for_tab(payload.tab_id).cloned()
        };
        let Some(target) = target else { return };

        if payload.reason == REASON_TARGET_CLOSED {
            let holders = {
                let mut reg = self.registry.lock().expect("registry lock poisoned");
                let holders = reg.remove_sessions_for_target(&target.target_id);
                reg.remove_target(&target.target_id);
                holders
            };
            self.notify_target_destroyed(&target.target_id, &holders);
            return;
        }

        // Single-tab detach (e.g. the user closed the debugger bar): the tab
        // survives as a discoverable target.
        let (holders, info) = {
            let mut reg = self.registry.lock().expect("registry lock poisoned");
            let holders = reg.remove_sessions_for_target(&target.target_id);
            reg.set_attached(&target.target_id, false);
            (
                holders,
                reg.get(&target.target_id).map(TargetEntry::target_info),
            )
        };
        for session in &holders {
            self.send_to_client(
                session.client_id,
                &protocol::event(
                    "Target.detachedFromTarget",
                    json!({ "sessionId": session.session_id, "targetId": target.target_id }),
                    None,
                ),
            );
        }
        if let Some(info) = info {
            self.broadcast_target_event("Target.targetInfoChanged", json!({ "targetInfo": info }));
        }
    }

    fn handle_tab_updated(self: &Arc<Self>, payload: &TabUpdatedPayload) {
        let (created, info) = {
            let mut reg = self.registry.lock().expect("registry lock poisoned");
            let (target_id, created) = reg.upsert_tab(
                payload.tab_id,
                None,
                payload.url.as_deref(),
                payload.title.as_deref(),
            );
            (created, reg.get(&target_id).map(TargetEntry::target_info))
        };
        let Some(info) = info else { return };
        if created {
            self.broadcast_target_event("Target.targetCreated", json!({ "targetInfo": info }));
        } else {
            self.broadcast_target_event("Target.targetInfoChanged", json!({ "targetInfo": info }));
        }
    }

    // ------------------------------------------------------------------
    // Admin views & shutdown
    // ------------------------------------------------------------------

    /// Health summary for `GET /`.
    #[must_use]
    pub fn status(&self) -> Value {
        let extension = matches!(
            self.extension.state(),
            ExtensionState::Ready | ExtensionState::Stale
        );
        let targets = self
            .registry
            .lock()
            .expect("registry lock poisoned")
            .target_count();
        let clients = self
            .clients
            .lock()
            .expect("client map lock poisoned")
            .len();
        json!({
            "status": "ok",
            "extension": extension,
            "targets": targets,
            "clients": clients,
        })
    }

    /// Detail view for `GET /logs/status`.
    #[must_use]
    pub fn logs_status(&self) -> Value {
        let counts: serde_json::Map<String, Value> = self
            .log
            .counts()
            .into_iter()
            .map(|(name, count)| (name.to_owned(), Value::from(count)))
            .collect();
        let client_rows: Vec<Value> = {
            let reg = self.registry.lock().expect("registry lock poisoned");
            let clients = self.clients.lock().expect("client map lock poisoned");
            clients
                .values()
                .map(|c| c.summary(reg.session_count_for_client(c.client_id)))
                .collect()
        };
        json!({
            "counts": counts,
            "clients": client_rows,
            "extension": self.extension.state().as_str(),
        })
    }

    /// Graceful shutdown: close every client, then the extension link.
    pub async fn shutdown(&self) {
        let handles: Vec<ClientHandle> = {
            let mut clients = self.clients.lock().expect("client map lock poisoned");
            clients.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.set_close(CLOSE_NORMAL, "server shutting down");
        }
        drop(handles);

        {
            let mut reg = self.registry.lock().expect("registry lock poisoned");
            reg.drain_sessions();
        }

        if let Some(tx) = self.extension.any_sender() {
            let _ = tx.send(LinkCommand::Close { reason: "shutdown" }).await;
        }
        self.log.append(
            Direction::ExtensionLifecycle,
            None,
            None,
            json!({ "event": "shutdown" }),
        );
    }
}

/// Consume extension events for a broker until its channel closes.
async fn run_dispatcher(broker: Arc<Broker>, mut events_rx: mpsc::Receiver<ExtensionEvent>) {
    while let Some(event) = events_rx.recv().await {
        broker.handle_extension_event(event);
    }
}
