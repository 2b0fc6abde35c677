//! Streaming step output to the operator and to captured log files.

use crate::request::Target;
use gitian_sandbox::{OutputLine, OutputSender, OutputStream};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Pipeline step that produced output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Setup,
    Build,
    Sign,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Build => write!(f, "build"),
            Self::Sign => write!(f, "sign"),
        }
    }
}

/// Receiver of streamed build and sign output.
///
/// Fire-and-forget: a sink cannot fail a step, and a panicking sink is
/// contained by the forwarder.
pub trait LogSink: Send + Sync {
    fn emit(&self, target: Target, step: Step, line: &OutputLine);
}

/// Forwards output lines as `tracing` events under `gitian::output`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn emit(&self, target: Target, step: Step, line: &OutputLine) {
        match line.stream {
            OutputStream::Stdout => {
                tracing::info!(target: "gitian::output", os = %target, %step, "{}", line.line)
            }
            OutputStream::Stderr => {
                tracing::warn!(target: "gitian::output", os = %target, %step, "{}", line.line)
            }
        }
    }
}

/// Path of a captured step log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogRef(PathBuf);

impl LogRef {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl From<PathBuf> for LogRef {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

/// Captured log file of one step, `<logs>/<version>/<target>-<step>.log`.
pub struct LogCapture {
    path: PathBuf,
    file: Option<tokio::io::BufWriter<tokio::fs::File>>,
}

impl LogCapture {
    /// Open (truncate) the log file. A file that cannot be opened only
    /// disables capturing.
    pub async fn create(logs_dir: &Path, version: &str, target: Target, step: Step) -> Self {
        let dir = logs_dir.join(version);
        let path = dir.join(format!("{target}-{step}.log"));
        let file = match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => tokio::fs::File::create(&path).await,
            Err(e) => Err(e),
        };
        let file = match file {
            Ok(file) => Some(tokio::io::BufWriter::new(file)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot capture step log");
                None
            }
        };
        Self { path, file }
    }

    pub fn log_ref(&self) -> LogRef {
        LogRef(self.path.clone())
    }

    async fn write_line(&mut self, line: &OutputLine) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let prefix = match line.stream {
            OutputStream::Stdout => "",
            OutputStream::Stderr => "! ",
        };
        let text = format!("{prefix}{}\n", line.line);
        if let Err(e) = file.write_all(text.as_bytes()).await {
            tracing::warn!(path = %self.path.display(), error = %e, "Step log write failed");
            self.file = None;
        }
    }

    async fn finish(mut self) -> LogRef {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush().await {
                tracing::warn!(path = %self.path.display(), error = %e, "Step log flush failed");
            }
        }
        LogRef(self.path)
    }
}

/// Everything a step needs to stream its output.
#[derive(Clone)]
pub struct StepLog {
    sink: Arc<dyn LogSink>,
    logs_dir: PathBuf,
}

impl StepLog {
    pub fn new(sink: Arc<dyn LogSink>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            sink,
            logs_dir: logs_dir.into(),
        }
    }

    /// Start forwarding lines for one step.
    ///
    /// Lines sent through the returned [`OutputSender`] reach the sink and
    /// the captured log. The forwarder finishes once every sender clone is
    /// dropped; awaiting [`LogForwarder::finish`] then yields the log path.
    pub async fn start(&self, version: &str, target: Target, step: Step) -> (OutputSender, LogForwarder) {
        let capture = LogCapture::create(&self.logs_dir, version, target, step).await;
        let log = capture.log_ref();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(forward(rx, Arc::clone(&self.sink), capture, target, step));
        (tx, LogForwarder { task, log })
    }
}

/// Handle to a running output forwarder.
pub struct LogForwarder {
    task: JoinHandle<LogRef>,
    log: LogRef,
}

impl LogForwarder {
    pub fn log_ref(&self) -> LogRef {
        self.log.clone()
    }

    /// Wait for all output to be written.
    pub async fn finish(self) -> LogRef {
        match self.task.await {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!(error = %e, "Log forwarder stopped early");
                self.log
            }
        }
    }
}

async fn forward(
    mut rx: mpsc::UnboundedReceiver<OutputLine>,
    sink: Arc<dyn LogSink>,
    mut capture: LogCapture,
    target: Target,
    step: Step,
) -> LogRef {
    let mut sink_ok = true;
    while let Some(line) = rx.recv().await {
        if sink_ok {
            let emitted =
                std::panic::catch_unwind(AssertUnwindSafe(|| sink.emit(target, step, &line)));
            if emitted.is_err() {
                tracing::warn!(os = %target, %step, "Log sink panicked, detaching it");
                sink_ok = false;
            }
        }
        capture.write_line(&line).await;
    }
    capture.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl LogSink for Recording {
        fn emit(&self, _target: Target, _step: Step, line: &OutputLine) {
            self.0.lock().unwrap().push(line.line.clone());
        }
    }

    struct Exploding;

    impl LogSink for Exploding {
        fn emit(&self, _target: Target, _step: Step, _line: &OutputLine) {
            panic!("sink down");
        }
    }

    #[tokio::test]
    async fn test_lines_reach_sink_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(Recording::default());
        let log = StepLog::new(sink.clone(), dir.path());

        let (tx, forwarder) = log.start("0.21.2", Target::Windows, Step::Build).await;
        tx.send(OutputLine::stdout("configure")).unwrap();
        tx.send(OutputLine::stderr("warning: x")).unwrap();
        drop(tx);
        let log_ref = forwarder.finish().await;

        assert_eq!(log_ref.path(), dir.path().join("0.21.2/windows-build.log"));
        let written = std::fs::read_to_string(log_ref.path()).unwrap();
        assert_eq!(written, "configure\n! warning: x\n");
        assert_eq!(*sink.0.lock().unwrap(), vec!["configure", "warning: x"]);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_stop_capture() {
        let dir = tempfile::tempdir().unwrap();
        let log = StepLog::new(Arc::new(Exploding), dir.path());

        let (tx, forwarder) = log.start("1.0", Target::Linux, Step::Sign).await;
        tx.send(OutputLine::stdout("one")).unwrap();
        tx.send(OutputLine::stdout("two")).unwrap();
        drop(tx);
        let log_ref = forwarder.finish().await;

        let written = std::fs::read_to_string(log_ref.path()).unwrap();
        assert_eq!(written, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_unwritable_log_dir_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let log = StepLog::new(Arc::new(TracingLogSink), &blocker);

        let (tx, forwarder) = log.start("1.0", Target::MacOs, Step::Build).await;
        tx.send(OutputLine::stdout("still fine")).unwrap();
        drop(tx);
        let log_ref = forwarder.finish().await;
        assert!(!log_ref.path().exists());
    }
}
