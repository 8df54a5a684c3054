use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

/// Stream type of a transcript event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Terminal output (remote stdout and stderr combined).
    Output,
    /// Terminal input. Not recorded by the relay today, kept for playback
    /// tooling that understands input events.
    #[allow(dead_code)]
    Input,
}

impl EventKind {
    fn as_str(self) -> &'static str {
        match self {
            EventKind::Output => "o",
            EventKind::Input => "i",
        }
    }
}

struct Inner {
    out: Box<dyn Write + Send>,
    start: Instant,
    header_written: bool,
}

/// Append-only transcript of one session's terminal output, in the asciicast
/// v2 line format: one JSON header object followed by `[elapsed, type, text]`
/// event lines.
///
/// All writes go through a single internal lock, held for the full duration of
/// `write_header`/`write_event`, because output can arrive interleaved with
/// header initialization during session start.
pub struct Recorder {
    inner: Mutex<Inner>,
}

impl Recorder {
    /// Open a transcript file at `path`, creating parent directories.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(file))
    }

    /// Build a recorder over an arbitrary writer.
    pub fn from_writer(out: impl Write + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner {
                out: Box::new(out),
                start: Instant::now(),
                header_written: false,
            }),
        }
    }

    /// Write the transcript header. Must be called exactly once, before any
    /// event; a second call is an error.
    pub fn write_header(&self, rows: u16, cols: u16) -> io::Result<()> {
        let mut inner = lock(&self.inner)?;
        if inner.header_written {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "transcript header already written",
            ));
        }
        let header = serde_json::json!({
            "version": 2,
            "width": cols,
            "height": rows,
            "timestamp": chrono::Utc::now().timestamp(),
        });
        writeln!(inner.out, "{header}")?;
        inner.header_written = true;
        Ok(())
    }

    /// Append one timestamped event. Events land in the order their writers
    /// acquire the lock, which for the single output pump is arrival order.
    pub fn write_event(&self, kind: EventKind, data: &str) -> io::Result<()> {
        let mut inner = lock(&self.inner)?;
        let elapsed = inner.start.elapsed().as_secs_f64();
        let event = serde_json::json!([elapsed, kind.as_str(), data]);
        writeln!(inner.out, "{event}")
    }
}

fn lock(inner: &Mutex<Inner>) -> io::Result<std::sync::MutexGuard<'_, Inner>> {
    inner
        .lock()
        .map_err(|_| io::Error::other("recorder lock poisoned"))
}
