use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect, Pty};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::RelayError;
use crate::relay::{ShellEvent, ShellEvents, ShellInput};

/// Terminal type requested for interactive shells.
const TERM: &str = "xterm";
/// Initial PTY geometry; the client follows up with a resize frame once the
/// browser knows its real dimensions.
pub const INITIAL_COLS: u32 = 150;
pub const INITIAL_ROWS: u32 = 30;

/// Authenticated SSH connection to a cluster login node, shared by every
/// relay and keep-alive probe tied to one login session.
pub type SshHandle = Arc<Mutex<Handle<ClientHandler>>>;

pub struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are not pinned; the gateway talks to nodes inside the
        // cluster network it was deployed for.
        Ok(true)
    }
}

/// Connect and authenticate against a login node with password auth.
pub async fn connect(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<SshHandle> {
    let config = Arc::new(client::Config::default());
    let mut handle = tokio::time::timeout(
        timeout,
        client::connect(config, (host, port), ClientHandler),
    )
    .await
    .map_err(|_| anyhow!("ssh connect to {host}:{port} timed out"))??;

    let auth = handle.authenticate_password(username, password).await?;
    if !auth.success() {
        return Err(anyhow!("authentication failed for {username}@{host}"));
    }
    debug!(%host, port, %username, "ssh connection established");
    Ok(Arc::new(Mutex::new(handle)))
}

/// Run a one-shot command on a fresh channel and capture its output. Used for
/// home-path discovery at login and for keep-alive probes.
pub async fn exec_capture(handle: &SshHandle, command: &str) -> Result<String> {
    let mut channel = {
        let guard = handle.lock().await;
        guard.channel_open_session().await?
    };
    channel.exec(true, command).await?;

    let mut output = Vec::new();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => output.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } if exit_status != 0 => {
                return Err(anyhow!("`{command}` exited with status {exit_status}"));
            }
            _ => {}
        }
    }
    Ok(String::from_utf8_lossy(&output).trim().to_string())
}

/// Tear the whole connection down. Best effort; the remote may already be gone.
pub async fn disconnect(handle: &SshHandle) {
    let guard = handle.lock().await;
    let _ = guard
        .disconnect(Disconnect::ByApplication, "session closed", "en")
        .await;
}

/// Stdin sink and window control for one interactive shell channel.
pub struct ShellStdin {
    channel: ChannelWriteHalf<Msg>,
}

/// Combined stdout/stderr and lifecycle events for the same channel.
pub struct ShellOutput {
    channel: ChannelReadHalf,
}

/// Open a shell channel on the borrowed connection: request a PTY with the
/// initial geometry and the minimal terminal-mode set, then start the remote
/// interactive shell. Any failure here aborts relay construction.
pub async fn open_shell(handle: &SshHandle) -> Result<(ShellStdin, ShellOutput), RelayError> {
    let channel = {
        let guard = handle.lock().await;
        guard
            .channel_open_session()
            .await
            .map_err(|err| RelayError::Setup(err.to_string()))?
    };

    let modes = [
        (Pty::ECHO, 1),
        (Pty::TTY_OP_ISPEED, 14400),
        (Pty::TTY_OP_OSPEED, 14400),
    ];
    channel
        .request_pty(false, TERM, INITIAL_COLS, INITIAL_ROWS, 0, 0, &modes)
        .await
        .map_err(|err| RelayError::Setup(format!("pty request failed: {err}")))?;
    channel
        .request_shell(false)
        .await
        .map_err(|err| RelayError::Setup(format!("shell request failed: {err}")))?;

    let (read, write) = channel.split();
    Ok((ShellStdin { channel: write }, ShellOutput { channel: read }))
}

#[async_trait]
impl ShellInput for ShellStdin {
    async fn write_input(&mut self, data: &[u8]) -> Result<(), RelayError> {
        self.channel.data(data).await.map_err(RelayError::from)
    }

    async fn resize(&mut self, rows: u32, cols: u32) -> Result<(), RelayError> {
        self.channel
            .window_change(cols, rows, 0, 0)
            .await
            .map_err(RelayError::from)
    }

    async fn shutdown(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
    }
}

#[async_trait]
impl ShellEvents for ShellOutput {
    async fn next_event(&mut self) -> ShellEvent {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => return ShellEvent::Output(data.to_vec()),
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    return ShellEvent::Output(data.to_vec())
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(exit_status, "remote shell exited");
                    return ShellEvent::Exited;
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return ShellEvent::Exited
                }
                Some(_) => continue,
            }
        }
    }
}
