use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::CommandAuditor;
use crate::error::RelayError;
use crate::protocol::{self, Frame};
use crate::recorder::{EventKind, Recorder};

/// Writable side of the remote shell: the PTY's stdin plus window control.
#[async_trait]
pub trait ShellInput: Send {
    async fn write_input(&mut self, data: &[u8]) -> Result<(), RelayError>;
    async fn resize(&mut self, rows: u32, cols: u32) -> Result<(), RelayError>;
    /// Close the remote session handle. Safe to call more than once.
    async fn shutdown(&mut self);
}

/// One observation from the remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Combined stdout/stderr bytes, delivered as they arrive.
    Output(Vec<u8>),
    /// The remote process terminated (normal exit or error).
    Exited,
}

/// Readable side of the remote shell, consumed by the output pump. The pump
/// doubles as the exit-watcher: `Exited` is the remote process's completion
/// signal.
#[async_trait]
pub trait ShellEvents: Send {
    async fn next_event(&mut self) -> ShellEvent;
}

/// Source of raw client frames from the socket. `None` means the peer closed.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, RelayError>>;
}

/// Sink for terminal output flowing back to the client.
#[async_trait]
pub trait OutputSink: Send {
    async fn send_output(&mut self, data: &[u8]) -> Result<(), RelayError>;
    /// Best-effort close, optionally carrying an error text for the peer.
    async fn send_close(&mut self, reason: Option<String>);
}

/// One interactive terminal instance: bridges a single socket connection to a
/// single remote PTY shell, recording output and auditing input on the way
/// through.
///
/// At most one shell and one socket are ever associated with a relay, and
/// both are closed exactly once regardless of which task observes termination
/// first.
pub struct Relay {
    shell: Mutex<Box<dyn ShellInput>>,
    output: Mutex<Box<dyn OutputSink>>,
    recorder: Option<Recorder>,
    auditor: Mutex<CommandAuditor>,
    audit_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Relay {
    pub fn new(
        shell: Box<dyn ShellInput>,
        output: Box<dyn OutputSink>,
        recorder: Option<Recorder>,
        cluster: &str,
        user: &str,
        audit_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            shell: Mutex::new(shell),
            output: Mutex::new(output),
            recorder,
            auditor: Mutex::new(CommandAuditor::new(cluster, user)),
            audit_tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Inbound task: decode client frames and drive the shell's input side.
    ///
    /// Ends on peer close, any read or protocol error, or cancellation from
    /// the exit-watcher; whichever way it ends, it tears the session down so
    /// the other task cannot outlive it.
    pub async fn run_inbound(self: Arc<Self>, mut frames: Box<dyn FrameSource>) -> Result<(), RelayError> {
        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                frame = frames.next_frame() => match frame {
                    None => break Ok(()),
                    Some(Err(err)) => break Err(err),
                    Some(Ok(raw)) => {
                        if let Err(err) = self.handle_frame(&raw).await {
                            break Err(err);
                        }
                    }
                },
            }
        };
        let reason = result.as_ref().err().map(|err| err.to_string());
        self.close(reason).await;
        result
    }

    /// Output pump and exit-watcher: forward every chunk the shell produces
    /// and shut the session down when the remote process ends.
    pub async fn run_shell(self: Arc<Self>, mut events: Box<dyn ShellEvents>) -> Result<(), RelayError> {
        let result = loop {
            match events.next_event().await {
                ShellEvent::Output(data) => {
                    if let Err(err) = self.forward_output(&data).await {
                        break Err(err);
                    }
                }
                ShellEvent::Exited => {
                    debug!("remote shell terminated");
                    break Ok(());
                }
            }
        };
        self.close(None).await;
        result
    }

    async fn handle_frame(&self, raw: &[u8]) -> Result<(), RelayError> {
        match protocol::decode(raw)? {
            None => Ok(()),
            Some(Frame::Data(payload)) => {
                // Audit before forwarding, so a record is emitted even if the
                // stdin write fails.
                let flushed = self.auditor.lock().await.observe(&payload);
                if let Some(record) = flushed {
                    if self.audit_tx.send(record).await.is_err() {
                        warn!("audit writer gone; dropping command record");
                    }
                }
                self.shell.lock().await.write_input(&payload).await
            }
            Some(Frame::Resize { rows, cols }) => {
                if rows > 0 && cols > 0 {
                    self.shell.lock().await.resize(rows, cols).await
                } else {
                    debug!(rows, cols, "ignoring resize with non-positive geometry");
                    Ok(())
                }
            }
        }
    }

    /// Write one chunk of remote output to the transcript and the socket.
    /// Transcript failures are logged and swallowed; the interactive session
    /// must not die because audit storage failed.
    async fn forward_output(&self, data: &[u8]) -> Result<(), RelayError> {
        if let Some(recorder) = &self.recorder {
            if let Err(err) = recorder.write_event(EventKind::Output, &String::from_utf8_lossy(data))
            {
                warn!(error = %err, "transcript write failed; session continues");
            }
        }
        let mut output = self.output.lock().await;
        // Checked under the output lock: the socket is never written after
        // the terminating step has closed it.
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Transport("socket already closed".into()));
        }
        output.send_output(data).await
    }

    /// Terminating step: cancel the peer task, close the shell handle and the
    /// socket. Idempotent; only the first caller performs the close.
    pub async fn close(&self, reason: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.shell.lock().await.shutdown().await;
        self.output.lock().await.send_close(reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AUDIT_CHANNEL_CAPACITY;
    use crate::recorder::Recorder;
    use std::io::{self, Write};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct ShellProbe {
        input: Arc<StdMutex<Vec<u8>>>,
        geometry: Arc<StdMutex<Option<(u32, u32)>>>,
        shutdowns: Arc<StdMutex<usize>>,
    }

    struct MockShell(ShellProbe);

    #[async_trait]
    impl ShellInput for MockShell {
        async fn write_input(&mut self, data: &[u8]) -> Result<(), RelayError> {
            self.0.input.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
        async fn resize(&mut self, rows: u32, cols: u32) -> Result<(), RelayError> {
            *self.0.geometry.lock().unwrap() = Some((rows, cols));
            Ok(())
        }
        async fn shutdown(&mut self) {
            *self.0.shutdowns.lock().unwrap() += 1;
        }
    }

    struct MockEvents(mpsc::UnboundedReceiver<ShellEvent>);

    #[async_trait]
    impl ShellEvents for MockEvents {
        async fn next_event(&mut self) -> ShellEvent {
            self.0.recv().await.unwrap_or(ShellEvent::Exited)
        }
    }

    struct MockFrames(mpsc::UnboundedReceiver<Result<Vec<u8>, RelayError>>);

    #[async_trait]
    impl FrameSource for MockFrames {
        async fn next_frame(&mut self) -> Option<Result<Vec<u8>, RelayError>> {
            self.0.recv().await
        }
    }

    #[derive(Clone, Default)]
    struct SocketProbe {
        sent: Arc<StdMutex<Vec<Vec<u8>>>>,
        closes: Arc<StdMutex<Vec<Option<String>>>>,
    }

    struct MockSocket(SocketProbe);

    #[async_trait]
    impl OutputSink for MockSocket {
        async fn send_output(&mut self, data: &[u8]) -> Result<(), RelayError> {
            self.0.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }
        async fn send_close(&mut self, reason: Option<String>) {
            self.0.closes.lock().unwrap().push(reason);
        }
    }

    struct Harness {
        relay: Arc<Relay>,
        shell: ShellProbe,
        socket: SocketProbe,
        audit_rx: mpsc::Receiver<String>,
    }

    fn harness(recorder: Option<Recorder>) -> Harness {
        let shell = ShellProbe::default();
        let socket = SocketProbe::default();
        let (audit_tx, audit_rx) = mpsc::channel(AUDIT_CHANNEL_CAPACITY);
        let relay = Arc::new(Relay::new(
            Box::new(MockShell(shell.clone())),
            Box::new(MockSocket(socket.clone())),
            recorder,
            "hpc1",
            "alice",
            audit_tx,
        ));
        Harness {
            relay,
            shell,
            socket,
            audit_rx,
        }
    }

    #[tokio::test]
    async fn data_frames_reach_shell_stdin_and_audit_log() {
        let mut h = harness(None);
        let (tx, rx) = mpsc::unbounded_channel();
        let inbound = tokio::spawn(h.relay.clone().run_inbound(Box::new(MockFrames(rx))));

        // Keystroke-sized frames, the way terminal clients send them.
        for chunk in [&b"l"[..], b"s", b"\n"] {
            tx.send(Ok(protocol::encode_data(chunk))).unwrap();
        }
        drop(tx);
        inbound.await.unwrap().unwrap();

        assert_eq!(*h.shell.input.lock().unwrap(), b"ls\n");
        let record = h.audit_rx.recv().await.unwrap();
        assert!(record.ends_with("input: ls\n"), "{record}");
    }

    #[tokio::test]
    async fn resize_changes_geometry_without_writing_stdin() {
        let h = harness(None);
        let (tx, rx) = mpsc::unbounded_channel();
        let inbound = tokio::spawn(h.relay.clone().run_inbound(Box::new(MockFrames(rx))));

        tx.send(Ok(protocol::encode_resize(40, 120))).unwrap();
        drop(tx);
        inbound.await.unwrap().unwrap();

        assert_eq!(*h.shell.geometry.lock().unwrap(), Some((40, 120)));
        assert!(h.shell.input.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_geometry_resize_is_ignored() {
        let h = harness(None);
        let (tx, rx) = mpsc::unbounded_channel();
        let inbound = tokio::spawn(h.relay.clone().run_inbound(Box::new(MockFrames(rx))));

        tx.send(Ok(protocol::encode_resize(0, 120))).unwrap();
        tx.send(Ok(protocol::encode_resize(40, 0))).unwrap();
        drop(tx);
        inbound.await.unwrap().unwrap();

        assert_eq!(*h.shell.geometry.lock().unwrap(), None);
    }

    #[tokio::test]
    async fn shell_exit_cancels_inbound_and_closes_socket() {
        let h = harness(None);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inbound = tokio::spawn(h.relay.clone().run_inbound(Box::new(MockFrames(frame_rx))));
        let pump = tokio::spawn(h.relay.clone().run_shell(Box::new(MockEvents(event_rx))));

        event_tx.send(ShellEvent::Exited).unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            pump.await.unwrap().unwrap();
            inbound.await.unwrap().unwrap();
        })
        .await
        .expect("both tasks must end once the shell exits");

        assert_eq!(h.socket.closes.lock().unwrap().len(), 1);
        assert_eq!(*h.shell.shutdowns.lock().unwrap(), 1);
        // The frame sender is still open; inbound ended via cancellation.
        drop(frame_tx);
    }

    #[tokio::test]
    async fn output_flows_to_socket_and_recorder() {
        #[derive(Clone, Default)]
        struct Buf(Arc<StdMutex<Vec<u8>>>);
        impl Write for Buf {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let transcript = Buf::default();
        let recorder = Recorder::from_writer(transcript.clone());
        recorder.write_header(30, 150).unwrap();
        let h = harness(Some(recorder));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(h.relay.clone().run_shell(Box::new(MockEvents(event_rx))));

        event_tx.send(ShellEvent::Output(b"$ hello\r\n".to_vec())).unwrap();
        event_tx.send(ShellEvent::Exited).unwrap();
        pump.await.unwrap().unwrap();

        assert_eq!(*h.socket.sent.lock().unwrap(), vec![b"$ hello\r\n".to_vec()]);
        let persisted = String::from_utf8(transcript.0.lock().unwrap().clone()).unwrap();
        assert!(persisted.contains("$ hello\\r\\n"), "{persisted}");
    }

    #[tokio::test]
    async fn recorder_failure_does_not_end_the_session() {
        struct FailingWriter;
        impl Write for FailingWriter {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("disk full"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let h = harness(Some(Recorder::from_writer(FailingWriter)));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(h.relay.clone().run_shell(Box::new(MockEvents(event_rx))));

        event_tx.send(ShellEvent::Output(b"one".to_vec())).unwrap();
        event_tx.send(ShellEvent::Output(b"two".to_vec())).unwrap();
        event_tx.send(ShellEvent::Exited).unwrap();
        pump.await.unwrap().unwrap();

        // Every frame still reached the client.
        assert_eq!(h.socket.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let h = harness(None);
        h.relay.close(Some("first".into())).await;
        h.relay.close(Some("second".into())).await;
        h.relay.close(None).await;

        assert_eq!(*h.shell.shutdowns.lock().unwrap(), 1);
        let closes = h.socket.closes.lock().unwrap();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn no_output_is_written_after_close() {
        let h = harness(None);
        h.relay.close(None).await;

        let err = h.relay.forward_output(b"late").await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
        assert!(h.socket.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_resize_ends_the_session_with_reason() {
        let h = harness(None);
        let (tx, rx) = mpsc::unbounded_channel();
        let inbound = tokio::spawn(h.relay.clone().run_inbound(Box::new(MockFrames(rx))));

        tx.send(Ok(b"2not json".to_vec())).unwrap();
        let err = inbound.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));

        let closes = h.socket.closes.lock().unwrap();
        assert_eq!(closes.len(), 1);
        assert!(closes[0].as_deref().unwrap().contains("protocol error"));
    }

    #[tokio::test]
    async fn unknown_frame_tags_are_skipped() {
        let h = harness(None);
        let (tx, rx) = mpsc::unbounded_channel();
        let inbound = tokio::spawn(h.relay.clone().run_inbound(Box::new(MockFrames(rx))));

        tx.send(Ok(b"9future".to_vec())).unwrap();
        tx.send(Ok(protocol::encode_data(b"x"))).unwrap();
        drop(tx);
        inbound.await.unwrap().unwrap();

        assert_eq!(*h.shell.input.lock().unwrap(), b"x");
    }
}
