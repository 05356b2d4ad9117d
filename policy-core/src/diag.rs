//! Diagnostics channel shared by all compiler passes.
//!
//! Passes never print directly. Every message goes through a bounded queue
//! to a single reporter thread that owns the output stream, so messages keep
//! their submission order and one run reports all defects it can find.
//!
//! ## Severities
//!
//! - `Abort`: printed together with `Aborted`, ends the run immediately
//! - `Error`: counted; reaching the configured maximum ends the run with
//!   `Aborted after N errors`
//! - `Warning`: printed with `Warning: ` prefix, never stops the run
//! - `Info` / `Progress`: only queued in verbose mode
//!
//! ## Checkpoints
//!
//! [`Diagnostics::stop_on_err`] is a "drain and check" barrier: the reporter
//! answers only after every earlier message is written, and the pipeline
//! stops with `Aborted with N error(s)` if any error was seen so far.
//!
//! ## Sorted output
//!
//! With `sort_messages` enabled the reporter buffers messages and emits them
//! ordered by (severity, text) at each checkpoint and at the end of the run.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use thiserror::Error;

use crate::config::Config;

const QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Abort,
    Error,
    Warning,
    Info,
    Progress,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Message {
    pub severity: Severity,
    pub text: String,
}

/// Reasons a pipeline run stops early.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{0}")]
    Abort(String),
    #[error("aborted after {0} errors")]
    TooManyErrors(usize),
    #[error("aborted with {0} error(s)")]
    Errors(usize),
}

/// Counters handed back when the reporter shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Summary {
    pub errors: usize,
    pub warnings: usize,
    pub aborted: bool,
}

enum Event {
    Message(Message),
    Check(SyncSender<bool>),
}

pub struct Diagnostics {
    tx: Option<SyncSender<Event>>,
    reporter: Option<JoinHandle<Summary>>,
    aborted: Arc<AtomicBool>,
    errors: Arc<AtomicUsize>,
    verbose: bool,
    time_stamps: bool,
    started: Instant,
}

impl Diagnostics {
    /// Start a reporter writing to stderr.
    pub fn new(config: &Config) -> Self {
        Self::with_writer(config, io::stderr())
    }

    /// Start a reporter writing to `out`.
    pub fn with_writer<W: Write + Send + 'static>(config: &Config, out: W) -> Self {
        let (tx, rx) = sync_channel(QUEUE_DEPTH);
        let aborted = Arc::new(AtomicBool::new(false));
        let errors = Arc::new(AtomicUsize::new(0));
        let reporter = Reporter {
            out: Box::new(out),
            max_errors: config.max_errors,
            sort: config.sort_messages,
            buffer: Vec::new(),
            summary: Summary::default(),
            stopped: false,
            aborted: Arc::clone(&aborted),
            errors: Arc::clone(&errors),
        };
        let handle = std::thread::spawn(move || reporter.run(rx));
        Self {
            tx: Some(tx),
            reporter: Some(handle),
            aborted,
            errors,
            verbose: config.verbose,
            time_stamps: config.time_stamps,
            started: Instant::now(),
        }
    }

    pub fn error(&self, text: impl Into<String>) {
        self.send(Severity::Error, text.into());
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.send(Severity::Warning, text.into());
    }

    pub fn info(&self, text: impl Into<String>) {
        if self.verbose {
            self.send(Severity::Info, text.into());
        }
    }

    pub fn progress(&self, text: &str) {
        if !self.verbose {
            return;
        }
        let text = if self.time_stamps {
            format!("{:.0}s {text}", self.started.elapsed().as_secs_f64())
        } else {
            text.to_string()
        };
        self.send(Severity::Progress, text);
    }

    /// Report a fatal defect and wait until it is written.
    ///
    /// The returned error is meant to be propagated with `?`.
    pub fn abort(&self, text: impl Into<String>) -> CompileError {
        let text = text.into();
        if let Some(tx) = &self.tx {
            let msg = Message {
                severity: Severity::Abort,
                text: text.clone(),
            };
            let (reply_tx, reply_rx) = sync_channel(1);
            if tx.send(Event::Message(msg)).is_ok() && tx.send(Event::Check(reply_tx)).is_ok() {
                let _ = reply_rx.recv();
            }
        }
        CompileError::Abort(text)
    }

    /// Wait until all queued messages are written, then fail if any error was seen.
    pub fn stop_on_err(&self) -> Result<(), CompileError> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(CompileError::TooManyErrors(self.error_count()));
        }
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        let (reply_tx, reply_rx) = sync_channel(1);
        if tx.send(Event::Check(reply_tx)).is_err() {
            return Err(CompileError::Errors(self.error_count()));
        }
        match reply_rx.recv() {
            Ok(true) => Ok(()),
            _ if self.aborted.load(Ordering::SeqCst) => {
                Err(CompileError::TooManyErrors(self.error_count()))
            }
            _ => Err(CompileError::Errors(self.error_count())),
        }
    }

    /// Errors counted by the reporter so far.
    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    /// Close the queue and wait for the reporter to drain it.
    pub fn finish(mut self) -> Summary {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Summary {
        self.tx.take();
        match self.reporter.take() {
            Some(handle) => handle.join().unwrap_or(Summary {
                errors: self.error_count(),
                warnings: 0,
                aborted: true,
            }),
            None => Summary::default(),
        }
    }

    fn send(&self, severity: Severity, text: String) {
        if self.aborted.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(Event::Message(Message { severity, text }));
        }
    }
}

impl Drop for Diagnostics {
    fn drop(&mut self) {
        if self.reporter.is_some() {
            self.shutdown();
        }
    }
}

struct Reporter {
    out: Box<dyn Write + Send>,
    max_errors: usize,
    sort: bool,
    buffer: Vec<Message>,
    summary: Summary,
    stopped: bool,
    aborted: Arc<AtomicBool>,
    errors: Arc<AtomicUsize>,
}

impl Reporter {
    fn run(mut self, rx: Receiver<Event>) -> Summary {
        // Keep receiving after a stop so that senders never block.
        for event in rx {
            match event {
                Event::Message(msg) => {
                    if self.stopped {
                        continue;
                    }
                    if msg.severity == Severity::Abort {
                        self.flush_sorted();
                        self.emit(msg);
                    } else if self.sort {
                        self.buffer.push(msg);
                    } else {
                        self.emit(msg);
                    }
                }
                Event::Check(reply) => {
                    self.flush_sorted();
                    if self.stopped {
                        let _ = reply.send(false);
                        continue;
                    }
                    if self.summary.errors > 0 {
                        let n = self.summary.errors;
                        self.line(&format!("Aborted with {n} error(s)"));
                        self.stop();
                        let _ = reply.send(false);
                    } else {
                        let _ = reply.send(true);
                    }
                }
            }
        }
        self.flush_sorted();
        let _ = self.out.flush();
        self.summary
    }

    fn emit(&mut self, msg: Message) {
        if self.stopped {
            return;
        }
        match msg.severity {
            Severity::Abort => {
                self.line(&format!("Error: {}", msg.text));
                self.line("Aborted");
                self.count_error();
                self.stop();
            }
            Severity::Error => {
                self.line(&format!("Error: {}", msg.text));
                self.count_error();
                if self.max_errors > 0 && self.summary.errors >= self.max_errors {
                    let n = self.summary.errors;
                    self.line(&format!("Aborted after {n} errors"));
                    self.stop();
                }
            }
            Severity::Warning => {
                self.line(&format!("Warning: {}", msg.text));
                self.summary.warnings += 1;
            }
            Severity::Info | Severity::Progress => self.line(&msg.text),
        }
    }

    fn flush_sorted(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut buffered = std::mem::take(&mut self.buffer);
        buffered.sort();
        for msg in buffered {
            self.emit(msg);
        }
    }

    fn count_error(&mut self) {
        self.summary.errors += 1;
        self.errors.store(self.summary.errors, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.summary.aborted = true;
        self.aborted.store(true, Ordering::SeqCst);
        let _ = self.out.flush();
    }

    fn line(&mut self, text: &str) {
        let _ = writeln!(self.out, "{text}");
    }
}

/// In-memory sink, handy for capturing diagnostics in tests and tools.
#[derive(Debug, Clone, Default)]
pub struct CaptureWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CaptureWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        match self.buf.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        }
    }
}

impl Write for CaptureWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .buf
            .lock()
            .map_err(|_| io::Error::other("capture buffer poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CaptureWriter, CompileError, Diagnostics};
    use crate::config::Config;

    fn config(max_errors: usize) -> Config {
        Config {
            max_errors,
            ..Config::default()
        }
    }

    #[test]
    fn messages_keep_submission_order() {
        let out = CaptureWriter::new();
        let diag = Diagnostics::with_writer(&config(10), out.clone());
        diag.warning("first");
        diag.error("second");
        diag.warning("third");
        let summary = diag.finish();

        assert_eq!(
            out.contents(),
            "Warning: first\nError: second\nWarning: third\n"
        );
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.warnings, 2);
    }

    #[test]
    fn checkpoint_passes_without_errors() {
        let out = CaptureWriter::new();
        let diag = Diagnostics::with_writer(&config(10), out.clone());
        diag.warning("only a warning");
        diag.stop_on_err().expect("no errors queued");
        assert_eq!(out.contents(), "Warning: only a warning\n");
    }

    #[test]
    fn checkpoint_drains_before_failing() {
        let out = CaptureWriter::new();
        let diag = Diagnostics::with_writer(&config(10), out.clone());
        diag.error("a");
        diag.error("b");
        let err = diag.stop_on_err().expect_err("errors were queued");
        assert!(matches!(err, CompileError::Errors(2)));
        assert_eq!(out.contents(), "Error: a\nError: b\nAborted with 2 error(s)\n");
    }

    #[test]
    fn error_limit_stops_reporting() {
        let out = CaptureWriter::new();
        let diag = Diagnostics::with_writer(&config(2), out.clone());
        for i in 0..5 {
            diag.error(format!("e{i}"));
        }
        let err = diag.stop_on_err().expect_err("limit reached");
        assert!(matches!(err, CompileError::TooManyErrors(2)));
        let summary = diag.finish();
        assert!(summary.aborted);
        assert_eq!(out.contents(), "Error: e0\nError: e1\nAborted after 2 errors\n");
    }

    #[test]
    fn abort_is_written_before_returning() {
        let out = CaptureWriter::new();
        let diag = Diagnostics::with_writer(&config(10), out.clone());
        let err = diag.abort("broken input");
        assert_eq!(err.to_string(), "broken input");
        assert_eq!(out.contents(), "Error: broken input\nAborted\n");
        diag.warning("ignored after abort");
        diag.finish();
        assert!(!out.contents().contains("ignored"));
    }

    #[test]
    fn abort_flushes_sorted_buffer_first() {
        let out = CaptureWriter::new();
        let cfg = Config {
            sort_messages: true,
            ..config(10)
        };
        let diag = Diagnostics::with_writer(&cfg, out.clone());
        diag.warning("zebra");
        diag.error("alpha");
        let err = diag.abort("unreachable zone");
        assert!(matches!(err, CompileError::Abort(_)));
        assert!(diag.stop_on_err().is_err());
        let summary = diag.finish();
        assert!(summary.aborted);
        assert_eq!(summary.errors, 2);
        assert_eq!(
            out.contents(),
            "Error: alpha\nWarning: zebra\nError: unreachable zone\nAborted\n"
        );
    }

    #[test]
    fn sorted_mode_orders_by_severity_then_text() {
        let out = CaptureWriter::new();
        let cfg = Config {
            sort_messages: true,
            ..config(10)
        };
        let diag = Diagnostics::with_writer(&cfg, out.clone());
        diag.warning("zebra");
        diag.error("beta");
        diag.warning("alpha");
        diag.error("alpha");
        let _ = diag.stop_on_err();
        assert_eq!(
            out.contents(),
            "Error: alpha\nError: beta\nWarning: alpha\nWarning: zebra\nAborted with 2 error(s)\n"
        );
    }

    #[test]
    fn info_needs_verbose() {
        let out = CaptureWriter::new();
        let quiet = Diagnostics::with_writer(&config(10), out.clone());
        quiet.info("hidden");
        quiet.progress("hidden too");
        quiet.finish();
        assert_eq!(out.contents(), "");

        let out = CaptureWriter::new();
        let cfg = Config {
            verbose: true,
            ..config(10)
        };
        let verbose = Diagnostics::with_writer(&cfg, out.clone());
        verbose.info("shown");
        verbose.progress("Ready");
        verbose.finish();
        assert_eq!(out.contents(), "shown\nReady\n");
    }
}
