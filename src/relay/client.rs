use std::sync::{Arc, Mutex};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// WebSocket close code for policy violations (bad token, decode storm).
pub const CLOSE_POLICY: u16 = 1008;
/// WebSocket close code for an overloaded peer (slow consumer drop).
pub const CLOSE_OVERLOAD: u16 = 1013;
/// Normal close (server shutdown).
pub const CLOSE_NORMAL: u16 = 1000;

/// State shared between a client's handle and its writer task, so the
/// writer can report why the broker dropped the client.
#[derive(Default)]
pub struct ClientShared {
    close: Mutex<Option<(u16, String)>>,
}

impl ClientShared {
    /// Record the close code/reason the writer should send. First write wins.
    pub fn set_close(&self, code: u16, reason: &str) {
        let mut close = self.close.lock().expect("client close lock poisoned");
        if close.is_none() {
            *close = Some((code, reason.to_owned()));
        }
    }

    fn take_close(&self) -> Option<(u16, String)> {
        self.close.lock().expect("client close lock poisoned").take()
    }
}

/// Per-client connection state held in the broker's client map.
///
/// Egress is a bounded queue: a slow consumer overflows it and is dropped,
/// so one stuck client can never stall the extension or its peers.
pub struct ClientHandle {
    pub client_id: u64,
    pub label: Option<String>,
    pub connected_at: String,
    /// True after `Target.setDiscoverTargets{discover:true}`.
    pub discover: bool,
    /// True after `Target.setAutoAttach{autoAttach:true}`.
    pub auto_attach: bool,
    pub wait_for_debugger: bool,
    sender: mpsc::Sender<String>,
    shared: Arc<ClientShared>,
}

impl ClientHandle {
    /// Create a handle plus the queue receiver and shared close state for
    /// the writer task.
    #[must_use]
    pub fn new(
        client_id: u64,
        label: Option<String>,
        connected_at: String,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<String>, Arc<ClientShared>) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let shared = Arc::new(ClientShared::default());
        (
            Self {
                client_id,
                label,
                connected_at,
                discover: false,
                auto_attach: false,
                wait_for_debugger: false,
                sender,
                shared: Arc::clone(&shared),
            },
            receiver,
            shared,
        )
    }

    /// Queue an outbound frame without blocking.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` when the queue is full or the writer is gone; the
    /// caller is expected to drop the client.
    pub fn try_enqueue(&self, frame: String) -> Result<(), ()> {
        self.sender.try_send(frame).map_err(|_| ())
    }

    /// Record the close reason the writer task should deliver.
    pub fn set_close(&self, code: u16, reason: &str) {
        self.shared.set_close(code, reason);
    }

    /// Summary row for the admin log-status endpoint.
    #[must_use]
    pub fn summary(&self, session_count: usize) -> Value {
        json!({
            "clientId": self.client_id,
            "label": self.label,
            "connectedAt": self.connected_at,
            "sessions": session_count,
        })
    }
}

/// Writer task: drains the egress queue onto the socket.
///
/// Runs until the queue closes (client dropped or broker shutdown), then
/// delivers the recorded close frame, if any.
pub async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut receiver: mpsc::Receiver<String>,
    shared: Arc<ClientShared>,
) {
    while let Some(frame) = receiver.recv().await {
        if sink.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }

    let close = shared
        .take_close()
        .map(|(code, reason)| CloseFrame {
            code,
            reason: reason.into(),
        });
    let _ = sink.send(Message::Close(close)).await;
}
