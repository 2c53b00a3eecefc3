//! Unix socket listener speaking newline-delimited JSON.
//!
//! Each connection gets a writer task fed by an unbounded channel; RPC
//! responses and server-initiated [`ClientEvent`] frames share that
//! channel, so a client never sees an event interleaved inside a
//! response line.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;

use cachet_model::rpc::{DeliveryRequest, DeliveryResponse};
use cachet_model::{ClientPresence, Connectivity};

use crate::connection_table::ConnectionHandle;
use crate::rpc;
use crate::server_state::ServerState;

/// Start the delivery listener on a Unix socket.
pub async fn start_listener(
    socket_path: &str,
    state: Arc<ServerState>,
    shutdown_tx: mpsc::Sender<()>,
) {
    // Remove stale socket file if it exists
    let _ = std::fs::remove_file(socket_path);

    let listener = match UnixListener::bind(socket_path) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, path = %socket_path, "failed to bind delivery socket");
            return;
        }
    };

    tracing::info!(path = %socket_path, "delivery listener started");

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = Arc::clone(&state);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(serve_connection(stream, state, shutdown_tx));
            }
            Err(e) => {
                tracing::warn!(error = %e, "delivery accept error");
            }
        }
    }
}

async fn serve_connection(
    stream: tokio::net::UnixStream,
    state: Arc<ServerState>,
    shutdown_tx: mpsc::Sender<()>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let mut buf = frame.into_bytes();
            buf.push(b'\n');
            if let Err(e) = writer.write_all(&buf).await {
                tracing::warn!(error = %e, "failed to write delivery frame");
                break;
            }
        }
    });

    let handle = ConnectionHandle::new(state.connections.next_connection_id(), tx.clone());
    // Set by the first Hello on this connection.
    let mut client_id: Option<String> = None;

    while let Ok(Some(line)) = lines.next_line().await {
        let request: DeliveryRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                let resp = DeliveryResponse::Error {
                    code: 400,
                    message: format!("invalid request: {e}"),
                };
                if !send_response(&tx, &resp) {
                    break;
                }
                continue;
            }
        };

        if let DeliveryRequest::Hello { client_id: id } = &request {
            // Register before the handler runs so its backlog flush finds
            // the live connection.
            state.connections.register(id, handle.clone());
            client_id = Some(id.clone());
            tracing::info!(client = %id, connection = handle.id(), "client connected");
        }

        let response = rpc::handle_request(&state, request, &shutdown_tx).await;
        if !send_response(&tx, &response) {
            break;
        }
    }

    if let Some(id) = client_id {
        // Only the current connection may evict the entry; a superseded
        // connection's close must not knock a reconnected client offline.
        if state.connections.unregister(&id, &handle) {
            let presence = ClientPresence {
                client_id: id.clone(),
                connectivity: Connectivity::Offline,
                updated_at: timestamp_ms(),
            };
            if let Err(e) = state.gateway.save_presence(&presence) {
                tracing::warn!(client = %id, error = %e, "failed to record offline presence");
            }
            tracing::info!(client = %id, connection = handle.id(), "client disconnected");
        }
    }
    drop(tx);
    let _ = writer_task.await;
}

fn send_response(tx: &mpsc::UnboundedSender<String>, response: &DeliveryResponse) -> bool {
    match serde_json::to_string(response) {
        Ok(frame) => tx.send(frame).is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize response");
            false
        }
    }
}

fn timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}
