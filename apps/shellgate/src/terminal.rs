use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::audit::{self, AUDIT_CHANNEL_CAPACITY};
use crate::config::Config;
use crate::error::RelayError;
use crate::handlers::{session_key_from, AppState, ErrorBody};
use crate::recorder::Recorder;
use crate::registry::SessionEntry;
use crate::relay::{FrameSource, OutputSink, Relay};
use crate::ssh::{self, INITIAL_COLS, INITIAL_ROWS};

/// GET /terminal - upgrade to the web terminal socket.
///
/// Resolution failures are rejected before the upgrade; everything after the
/// upgrade is reported through the socket itself.
pub async fn terminal_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let Some(key) = session_key_from(&headers) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "session key header is required".to_string(),
            }),
        )
            .into_response();
    };
    let Some(entry) = state.registry.lookup(&key) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "user not logged in".to_string(),
            }),
        )
            .into_response();
    };

    let config = state.config.clone();
    ws.on_upgrade(move |socket| handle_terminal(socket, entry, key, config, remote_addr))
}

/// Per-connection orchestrator: builds the relay, starts its tasks and blocks
/// until all of them have returned.
async fn handle_terminal(
    mut socket: WebSocket,
    entry: Arc<SessionEntry>,
    session_key: String,
    config: Arc<Config>,
    remote_addr: SocketAddr,
) {
    let cluster = entry.identity.cluster.clone();
    let user = entry.identity.username.clone();
    info!(%cluster, %user, client = %remote_addr, "terminal session opening");

    // Transcript and audit log are auxiliary: failing to set either up is
    // logged and the terminal still opens.
    let recorder = if config.record {
        match Recorder::create(&transcript_path(&config.record_path, &cluster, &user, remote_addr))
        {
            Ok(recorder) => Some(recorder),
            Err(err) => {
                warn!(error = %err, "could not create transcript; recording disabled");
                None
            }
        }
    } else {
        None
    };

    let audit_file = match audit::open_log(
        Path::new(&config.audit_log_dir),
        &cluster,
        &user,
        &session_key,
    )
    .await
    {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(error = %err, "could not open audit log; auditing disabled");
            None
        }
    };

    // Initializing: open the shell on the borrowed connection. Failures here
    // abort before Active; the client learns why from the close frame.
    let (shell_stdin, shell_output) = match ssh::open_shell(&entry.handle).await {
        Ok(parts) => parts,
        Err(err) => {
            error!(error = %err, "shell setup failed");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: err.to_string().into(),
                })))
                .await;
            return;
        }
    };

    // Header goes in before the pump starts, so it precedes every output event.
    if let Some(recorder) = &recorder {
        if let Err(err) = recorder.write_header(INITIAL_ROWS as u16, INITIAL_COLS as u16) {
            warn!(error = %err, "transcript header write failed");
        }
    }

    let (audit_tx, audit_rx) = mpsc::channel(AUDIT_CHANNEL_CAPACITY);
    let audit_writer = audit::spawn_writer(audit_file, audit_rx);

    let (ws_tx, ws_rx) = socket.split();
    let relay = Arc::new(Relay::new(
        Box::new(shell_stdin),
        Box::new(WsOutput { sink: ws_tx }),
        recorder,
        &cluster,
        &user,
        audit_tx,
    ));

    let inbound = tokio::spawn(
        relay
            .clone()
            .run_inbound(Box::new(WsFrames { stream: ws_rx })),
    );
    let pump = tokio::spawn(relay.clone().run_shell(Box::new(shell_output)));

    let (inbound_res, pump_res) = tokio::join!(inbound, pump);
    log_task_outcome("inbound", inbound_res);
    log_task_outcome("shell", pump_res);

    // Dropping the relay releases the last audit sender; the writer drains
    // whatever is queued and exits.
    drop(relay);
    let _ = audit_writer.await;
    info!(%cluster, %user, client = %remote_addr, "terminal session closed");
}

fn log_task_outcome(
    task: &str,
    result: Result<Result<(), RelayError>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => debug!(task, "relay task finished"),
        Ok(Err(err)) => warn!(task, error = %err, "relay task ended with error"),
        Err(err) => error!(task, error = %err, "relay task panicked"),
    }
}

/// `{record_path}/{cluster}/{user}/{cluster}_{user}_{addr}_{start}.cast`
fn transcript_path(
    record_path: &str,
    cluster: &str,
    user: &str,
    remote_addr: SocketAddr,
) -> std::path::PathBuf {
    let addr = remote_addr.to_string().replace(':', "");
    let start = chrono::Local::now().format("%Y%m%d_%H%M%S");
    Path::new(record_path)
        .join(cluster)
        .join(user)
        .join(format!("{cluster}_{user}_{addr}_{start}.cast"))
}

struct WsFrames {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WsFrames {
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, RelayError>> {
        while let Some(msg) = self.stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                // Some clients deliver frames as text; the tag byte decides.
                Ok(Message::Text(text)) => return Some(Ok(text.into_bytes())),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some(Err(RelayError::Transport(err.to_string()))),
            }
        }
        None
    }
}

struct WsOutput {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl OutputSink for WsOutput {
    async fn send_output(&mut self, data: &[u8]) -> Result<(), RelayError> {
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|err| RelayError::Transport(err.to_string()))
    }

    async fn send_close(&mut self, reason: Option<String>) {
        let frame = reason.map(|reason| CloseFrame {
            code: close_code::ERROR,
            reason: reason.into(),
        });
        // The peer may already be gone; a failed close is final either way.
        let _ = self.sink.send(Message::Close(frame)).await;
        let _ = self.sink.close().await;
    }
}
