use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Tag identifying this service in audit log lines.
const AUDIT_TAG: &str = "shellgate";

/// Capacity of the channel between the inbound task and the audit writer.
pub const AUDIT_CHANNEL_CAPACITY: usize = 16;

/// Accumulates raw terminal input into line-oriented audit records.
///
/// A chunk whose *first byte* is `\n` or `\r` flushes the buffer (with that
/// byte appended) as one record; any other chunk is appended unconditionally.
/// A newline arriving mid-chunk therefore does not trigger a flush; that
/// matches how interactive clients deliver input (one keystroke per frame)
/// and is the behavior the audit format was built around.
pub struct CommandAuditor {
    cluster: String,
    user: String,
    buf: Vec<u8>,
}

impl CommandAuditor {
    pub fn new(cluster: &str, user: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            user: user.to_string(),
            buf: Vec::new(),
        }
    }

    /// Observe one inbound data chunk. Returns the formatted audit record
    /// when the chunk completes a line.
    pub fn observe(&mut self, input: &[u8]) -> Option<String> {
        let first = *input.first()?;
        if first == b'\n' || first == b'\r' {
            self.buf.push(first);
            let text = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            let stamp = chrono::Local::now().format("%b %d %H:%M:%S");
            Some(format!(
                "{stamp} {AUDIT_TAG} {} {} input: {text}",
                self.cluster, self.user
            ))
        } else {
            self.buf.extend_from_slice(input);
            None
        }
    }
}

/// Path of the per-session audit log: `{dir}/{cluster}_{user}_{session_key}.log`.
pub fn log_path(dir: &Path, cluster: &str, user: &str, session_key: &str) -> PathBuf {
    dir.join(format!("{cluster}_{user}_{session_key}.log"))
}

/// Open the audit log for appending, creating the directory if needed.
pub async fn open_log(dir: &Path, cluster: &str, user: &str, session_key: &str) -> Result<File> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating audit log directory {}", dir.display()))?;
    let path = log_path(dir, cluster, user, session_key);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("opening audit log {}", path.display()))
}

/// Spawn the single writer task draining flushed audit records.
///
/// The task exits when every sender is dropped. Write failures end the task
/// but never the session; auditing is best-effort. When the log file could
/// not be opened the task still drains the channel so producers never block
/// on a missing consumer.
pub fn spawn_writer(file: Option<File>, mut rx: mpsc::Receiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut file) = file else {
            while rx.recv().await.is_some() {}
            return;
        };
        while let Some(record) = rx.recv().await {
            if let Err(err) = file.write_all(record.as_bytes()).await {
                warn!(error = %err, "audit log write failed; dropping remaining records");
                while rx.recv().await.is_some() {}
                return;
            }
        }
        let _ = file.flush().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn chunks_accumulate_until_newline_first_byte() {
        let mut auditor = CommandAuditor::new("hpc1", "alice");
        assert!(auditor.observe(b"l").is_none());
        assert!(auditor.observe(b"s").is_none());
        let record = auditor.observe(b"\n").expect("newline flushes");
        assert!(record.contains("shellgate hpc1 alice input: ls\n"), "{record}");
    }

    #[test]
    fn carriage_return_also_flushes() {
        let mut auditor = CommandAuditor::new("hpc1", "alice");
        auditor.observe(b"pwd");
        let record = auditor.observe(b"\r").unwrap();
        assert!(record.ends_with("input: pwd\r"), "{record}");
    }

    #[test]
    fn buffer_resets_after_flush() {
        let mut auditor = CommandAuditor::new("hpc1", "alice");
        auditor.observe(b"first");
        auditor.observe(b"\n").unwrap();
        auditor.observe(b"second");
        let record = auditor.observe(b"\r").unwrap();
        assert!(record.ends_with("input: second\r"), "{record}");
    }

    #[test]
    fn newline_mid_chunk_does_not_flush() {
        let mut auditor = CommandAuditor::new("hpc1", "alice");
        // Pasted input can embed a newline; only a leading one triggers.
        assert!(auditor.observe(b"echo hi\nls").is_none());
        let record = auditor.observe(b"\n").unwrap();
        assert!(record.ends_with("input: echo hi\nls\n"), "{record}");
    }

    #[test]
    fn only_the_first_byte_of_a_flush_chunk_is_kept() {
        let mut auditor = CommandAuditor::new("hpc1", "alice");
        auditor.observe(b"ls");
        let record = auditor.observe(b"\ntrailing").unwrap();
        assert!(record.ends_with("input: ls\n"), "{record}");
    }

    #[test]
    fn empty_chunk_is_ignored() {
        let mut auditor = CommandAuditor::new("hpc1", "alice");
        assert!(auditor.observe(b"").is_none());
    }

    #[tokio::test]
    async fn writer_appends_records_and_exits_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let file = open_log(dir.path(), "hpc1", "alice", "sgk_test")
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(AUDIT_CHANNEL_CAPACITY);
        let writer = spawn_writer(Some(file), rx);

        tx.send("line one\n".to_string()).await.unwrap();
        tx.send("line two\n".to_string()).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        let path = log_path(dir.path(), "hpc1", "alice", "sgk_test");
        let mut contents = String::new();
        File::open(&path)
            .await
            .unwrap()
            .read_to_string(&mut contents)
            .await
            .unwrap();
        assert_eq!(contents, "line one\nline two\n");
    }

    #[tokio::test]
    async fn writer_without_file_drains_channel() {
        let (tx, rx) = mpsc::channel(AUDIT_CHANNEL_CAPACITY);
        let writer = spawn_writer(None, rx);
        for _ in 0..64 {
            tx.send("dropped\n".to_string()).await.unwrap();
        }
        drop(tx);
        writer.await.unwrap();
    }
}
