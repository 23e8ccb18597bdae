//! Resident query daemon — a local stream socket per source file.
//!
//! The socket lives at `<dir>/csvquery_<crc32(abs source path)>.sock`, where
//! `<dir>` is `/tmp` unless `CSVQUERY_SOCKET_DIR` overrides it.  Requests
//! are newline-framed JSON objects; `query` and `count` stream text lines
//! closed by `OK` / `ERR <Kind>: <msg>`, while `ping`, `reload`, and
//! `shutdown` answer with a single JSON line.
//!
//! ```text
//! → {"cmd":"query","where":{"op":"=","column":"STATUS","value":"active"}}
//! ← WARN SourceStale: size changed from 40 to 39      (only when stale)
//! ← 10,9
//! ← 30,9
//! ← OK
//! ```
//!
//! Query rows are written to the socket as the executor produces them, not
//! buffered into a full result first.  While a `query`/`count` runs, a
//! watcher thread peeks the connection; a client that hangs up raises the
//! request's cancel flag and the scan aborts after its current block.  A
//! write that fails mid-stream stops the scan the same way.
//!
//! The engine (source map, index readers, blooms) is opened lazily on the
//! first request and shared read-only across handler threads.  A panic in a
//! handler is caught at the connection boundary and reported as
//! `InternalError`; the daemon stays up.  SIGINT/SIGTERM stop the accept
//! loop, let in-flight handlers finish, and unlink the socket.

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::executor::{Engine, QueryRequest, RowSink};

/// Default per-request deadline.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

const ACCEPT_POLL: Duration = Duration::from_millis(50);
/// Socket read timeout; bounds how long idle reads, the stop-flag poll, and
/// the client watcher's peek can block.
const READ_POLL: Duration = Duration::from_millis(150);

/// Socket path derived from the absolute source path.
pub fn socket_path_for(source: &Path) -> PathBuf {
    let dir = std::env::var_os("CSVQUERY_SOCKET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    let abs = source.canonicalize().unwrap_or_else(|_| source.to_owned());
    let hash = crc32fast::hash(abs.to_string_lossy().as_bytes());
    dir.join(format!("csvquery_{}.sock", hex::encode(hash.to_be_bytes())))
}

enum Flow {
    Continue,
    CloseConnection,
}

/// Streams response lines straight onto the connection.  A failed write
/// means the client is gone, which reads as cancellation upstream.
struct WireSink<'a> {
    stream: &'a mut UnixStream,
}

impl RowSink for WireSink<'_> {
    fn warning(&mut self, message: &str) -> Result<()> {
        writeln!(self.stream, "WARN {message}").map_err(|_| Error::Canceled)
    }

    fn row(&mut self, offset: u64, length: u64) -> Result<()> {
        writeln!(self.stream, "{offset},{length}").map_err(|_| Error::Canceled)
    }
}

/// Peek the connection until the request finishes or the client hangs up;
/// a hang-up raises `cancel` so the running scan aborts after its block.
/// Peeking consumes nothing, so a pipelined next request is left intact.
fn watch_client(stream: UnixStream, cancel: &AtomicBool, done: &AtomicBool) {
    let mut byte = [0u8; 1];
    while !done.load(Ordering::SeqCst) {
        match stream.peek(&mut byte) {
            Ok(0) => {
                cancel.store(true, Ordering::SeqCst);
                return;
            }
            Ok(_) => std::thread::sleep(READ_POLL),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => {
                cancel.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

pub struct Daemon {
    source_path: PathBuf,
    socket_path: PathBuf,
    sep:         u8,
    engine:      Mutex<Option<Arc<Engine>>>,
    stop:        Arc<AtomicBool>,
    deadline:    Duration,
}

impl Daemon {
    pub fn new(source_path: PathBuf, socket_override: Option<PathBuf>, sep: u8) -> Self {
        let socket_path = socket_override.unwrap_or_else(|| socket_path_for(&source_path));
        Self {
            source_path,
            socket_path,
            sep,
            engine: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            deadline: REQUEST_DEADLINE,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Bind the socket, install signal handlers, and serve until stopped.
    pub fn run(&self) -> Result<()> {
        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).is_ok() {
                return Err(Error::Protocol(format!(
                    "a daemon is already listening on {}",
                    self.socket_path.display()
                )));
            }
            // Leftover from an unclean shutdown.
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;

        let stop = self.stop_flag();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .map_err(|e| Error::Internal(format!("signal handler: {e}")))?;

        info!(socket = %self.socket_path.display(), "daemon listening");
        self.serve(listener)
    }

    /// Accept loop.  Public so tests can drive a pre-bound listener without
    /// touching process signal state.
    pub fn serve(&self, listener: UnixListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        std::thread::scope(|s| {
            while !self.stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        s.spawn(move || self.handle_connection(stream));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        std::thread::sleep(ACCEPT_POLL);
                    }
                }
            }
        });
        // In-flight handlers have finished; remove our address.
        let _ = std::fs::remove_file(&self.socket_path);
        info!("daemon stopped");
        Ok(())
    }

    fn handle_connection(&self, stream: UnixStream) {
        if stream.set_read_timeout(Some(READ_POLL)).is_err() {
            return;
        }
        let mut reader = BufReader::new(match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        });
        let mut writer = stream;
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => return, // client hung up
                Ok(_) => {}
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if self.stop.load(Ordering::SeqCst) {
                        return;
                    }
                    continue;
                }
                Err(_) => return,
            }
            if line.trim().is_empty() {
                continue;
            }

            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.dispatch(line.trim(), &mut writer)
            }));
            let flow = match outcome {
                Ok(Ok(flow)) => flow,
                Ok(Err(e)) => {
                    debug!(error = %e, "request failed");
                    if writeln!(writer, "{}", e.wire_line()).is_err() {
                        return;
                    }
                    Flow::Continue
                }
                Err(_) => {
                    let e = Error::Internal("handler panicked".into());
                    if writeln!(writer, "{}", e.wire_line()).is_err() {
                        return;
                    }
                    Flow::Continue
                }
            };
            if matches!(flow, Flow::CloseConnection) {
                return;
            }
        }
    }

    fn dispatch(&self, line: &str, writer: &mut UnixStream) -> Result<Flow> {
        let request: Value = serde_json::from_str(line)
            .map_err(|e| Error::Protocol(format!("request is not valid JSON: {e}")))?;
        let cmd = request
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("request is missing \"cmd\"".into()))?;

        match cmd {
            "ping" => {
                writeln!(writer, "{}", json!({"ok": true}))?;
                Ok(Flow::Continue)
            }
            "shutdown" => {
                writeln!(writer, "{}", json!({"ok": true}))?;
                self.stop.store(true, Ordering::SeqCst);
                Ok(Flow::CloseConnection)
            }
            "reload" => {
                // Drop the cached engine; the next request reopens meta and
                // indexes from disk.
                *self.engine_slot() = None;
                writeln!(writer, "{}", json!({"ok": true}))?;
                Ok(Flow::Continue)
            }
            "query" => {
                let engine = self.engine()?;
                let mut req = QueryRequest::from_json(&request)?;
                req.deadline = Some(Instant::now() + self.deadline);
                let cancel = Arc::new(AtomicBool::new(false));
                req.cancel = Some(Arc::clone(&cancel));

                let probe = writer.try_clone()?;
                let done = AtomicBool::new(false);
                std::thread::scope(|s| {
                    s.spawn(|| watch_client(probe, &cancel, &done));
                    let mut sink = WireSink { stream: &mut *writer };
                    let result = engine.query_stream(&req, &mut sink);
                    done.store(true, Ordering::SeqCst);
                    result
                })?;
                writeln!(writer, "OK")?;
                Ok(Flow::Continue)
            }
            "count" => {
                let engine = self.engine()?;
                let mut req = QueryRequest::from_json(&request)?;
                req.deadline = Some(Instant::now() + self.deadline);
                let cancel = Arc::new(AtomicBool::new(false));
                req.cancel = Some(Arc::clone(&cancel));

                let probe = writer.try_clone()?;
                let done = AtomicBool::new(false);
                let result = std::thread::scope(|s| {
                    s.spawn(|| watch_client(probe, &cancel, &done));
                    let result = engine.count(&req);
                    done.store(true, Ordering::SeqCst);
                    result
                })?;
                for w in &result.warnings {
                    writeln!(writer, "WARN {w}")?;
                }
                writeln!(writer, "{}", result.count)?;
                writeln!(writer, "OK")?;
                Ok(Flow::Continue)
            }
            other => Err(Error::Protocol(format!("unknown cmd \"{other}\""))),
        }
    }

    fn engine_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<Engine>>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn engine(&self) -> Result<Arc<Engine>> {
        let mut slot = self.engine_slot();
        if let Some(ref e) = *slot {
            return Ok(Arc::clone(e));
        }
        let engine = Arc::new(Engine::open(&self.source_path, self.sep)?);
        *slot = Some(Arc::clone(&engine));
        Ok(engine)
    }
}
