//! Per-core I/O event loop (renamed from the teacher's `worker.rs`, which
//! conflated "the thread that owns an epoll instance" with "the thread that
//! may block" — this crate keeps those as two tiers: `IoThread` here never
//! blocks past a nonblocking syscall; `workerpool::WorkerPool` is the tier
//! that may. One `IoThread` per core, each with its own `SO_REUSEPORT`
//! listener and `ConnectionSlab`, so cores never contend on a shared socket
//! or a shared connection table.

use crate::conn::{ConnState, READ_BUF_SIZE};
use crate::dispatch::{DispatchEngine, FinishedResponse};
use crate::error::EngineResult;
use crate::http::Method;
use crate::metrics::IoMetrics;
use crate::parser::{self, ParseError};
use crate::slab::ConnectionSlab;
use crate::syscalls::{self, EPOLLIN, EPOLLOUT, Epoll, epoll_event};
use libc::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LISTENER_TOKEN: u64 = u64::MAX;
const EVENT_BATCH: usize = 256;
const DEFAULT_KEEP_ALIVE: bool = true;

pub struct IoThreadConfig {
    pub core_id: usize,
    pub host: String,
    pub port: u16,
    pub slab_capacity: usize,
    pub request_timeout: Duration,
}

/// Owns one epoll instance, one listening socket, and one connection slab.
/// Runs entirely on its own OS thread; never touches the WorkerPool's
/// internal locks except through `execute`.
pub struct IoThread {
    config: IoThreadConfig,
    dispatch: Arc<DispatchEngine>,
    worker_pool: Arc<crate::workerpool::WorkerPool>,
    metrics: Arc<IoMetrics>,
    shutdown: Arc<AtomicBool>,
}

impl IoThread {
    pub fn new(
        config: IoThreadConfig,
        dispatch: Arc<DispatchEngine>,
        worker_pool: Arc<crate::workerpool::WorkerPool>,
        metrics: Arc<IoMetrics>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self { config, dispatch, worker_pool, metrics, shutdown }
    }

    pub fn spawn(self) -> std::thread::JoinHandle<EngineResult<()>> {
        let core_id = self.config.core_id;
        std::thread::Builder::new()
            .name(format!("io-{core_id}"))
            .spawn(move || self.run())
            .expect("failed to spawn I/O thread")
    }

    fn run(self) -> EngineResult<()> {
        if let Some(core) = core_affinity::get_core_ids().and_then(|ids| ids.into_iter().nth(self.config.core_id)) {
            core_affinity::set_for_current(core);
        }

        let listen_fd = syscalls::create_listen_socket_reuseport(&self.config.host, self.config.port)?;
        let epoll = Epoll::new()?;
        epoll.add(listen_fd, LISTENER_TOKEN, EPOLLIN)?;

        let mut slab = ConnectionSlab::new(self.config.slab_capacity);
        let mut events = vec![unsafe { std::mem::zeroed::<epoll_event>() }; EVENT_BATCH];

        tracing::info!(core = self.config.core_id, port = self.config.port, "I/O thread listening");

        while !self.shutdown.load(Ordering::Acquire) {
            let n = match epoll.wait(&mut events, 250) {
                Ok(n) => n,
                Err(err) => {
                    tracing::error!(error = %err, "epoll_wait failed");
                    continue;
                }
            };

            for event in &events[..n] {
                if event.u64 == LISTENER_TOKEN {
                    self.accept_loop(listen_fd, &epoll, &mut slab);
                } else {
                    self.handle_readable(event.u64 as usize, &epoll, &mut slab);
                }
            }

            self.reap_idle(&epoll, &mut slab);
        }

        Ok(())
    }

    fn accept_loop(&self, listen_fd: c_int, epoll: &Epoll, slab: &mut ConnectionSlab) {
        loop {
            match syscalls::accept_connection(listen_fd) {
                Ok(Some(fd)) => match slab.allocate(fd) {
                    Some(idx) => {
                        if epoll.add(fd, idx as u64, EPOLLIN).is_err() {
                            slab.free(idx);
                            continue;
                        }
                        self.metrics.inc_conn();
                    }
                    None => {
                        tracing::warn!("connection slab full; dropping accepted socket");
                        unsafe {
                            libc::close(fd);
                        }
                    }
                },
                Ok(None) => break, // drained the accept backlog
                Err(err) => {
                    tracing::error!(error = %err, "accept failed");
                    break;
                }
            }
        }
    }

    fn handle_readable(&self, idx: usize, epoll: &Epoll, slab: &mut ConnectionSlab) {
        let Some(conn) = slab.get_mut(idx) else { return };
        if conn.state == ConnState::Writing {
            self.flush_pending_write(idx, epoll, slab);
            return;
        }

        conn.state = ConnState::Reading;
        let free_space = READ_BUF_SIZE - conn.read_len as usize;
        if free_space == 0 {
            self.respond_and_close(idx, epoll, slab, 431, "Request Header Fields Too Large");
            return;
        }

        let read_result = syscalls::read_nonblocking(conn.fd, &mut conn.read_buf[conn.read_len as usize..]);
        match read_result {
            Ok(0) => self.close_conn(idx, epoll, slab),
            Ok(n) => {
                conn.read_len += n as u16;
                conn.last_active = now_secs();
                self.try_dispatch(idx, epoll, slab);
            }
            Err(err) => {
                tracing::debug!(error = %err, "connection read error");
                self.close_conn(idx, epoll, slab);
            }
        }
    }

    /// Attempts to parse a full request out of the connection's read buffer
    /// and classify it. Eligible GET/HEAD requests against middleware-free
    /// routes are answered inline; everything else is handed to the worker
    /// pool, which takes ownership of the file descriptor.
    fn try_dispatch(&self, idx: usize, epoll: &Epoll, slab: &mut ConnectionSlab) {
        // Snapshot into an owned buffer first so the parsed `RawRequest`'s
        // lifetime is tied to a local `Vec`, not to the slab — letting the
        // branches below borrow `slab` mutably again without fighting the
        // borrow checker over a reference into `conn.read_buf`.
        let snapshot: Vec<u8> = {
            let conn = slab.get_mut(idx).expect("connection vanished mid-dispatch");
            conn.state = ConnState::Parsing;
            conn.read_buf[..conn.read_len as usize].to_vec()
        };

        let (raw, consumed) = match parser::parse_request(&snapshot) {
            Ok(pair) => pair,
            Err(ParseError::Incomplete) => return, // wait for more EPOLLIN
            Err(_) => {
                self.respond_and_close(idx, epoll, slab, 400, "Bad Request");
                return;
            }
        };

        if let Some(conn) = slab.get_mut(idx) {
            conn.state = ConnState::Dispatching;
        }
        let keep_alive_requested = raw.is_keep_alive(DEFAULT_KEEP_ALIVE);
        let on_io_thread = true;

        if self.dispatch.is_fast_path_eligible(raw.method, on_io_thread) {
            if let Some(finished) = self.dispatch.try_fast_path(&raw, on_io_thread) {
                self.metrics.inc_req();
                self.complete_on_io_thread(idx, epoll, slab, finished, keep_alive_requested, consumed);
                return;
            }
        }

        self.hand_off_to_worker(idx, epoll, slab, consumed, keep_alive_requested, raw.method);
    }

    /// Writes `finished` directly from this I/O thread (fast / ultra-fast
    /// path) and either resets the connection for the next pipelined
    /// request or closes it.
    fn complete_on_io_thread(
        &self,
        idx: usize,
        epoll: &Epoll,
        slab: &mut ConnectionSlab,
        finished: FinishedResponse,
        keep_alive: bool,
        consumed: usize,
    ) {
        let bytes = render_response(&finished, keep_alive);
        let conn = slab.get_mut(idx).expect("connection vanished mid-write");
        let remaining = conn.read_len as usize - consumed;
        conn.read_buf.copy_within(consumed..consumed + remaining, 0);
        conn.read_len = remaining as u16;

        let n = bytes.len().min(crate::conn::WRITE_BUF_SIZE);
        conn.write_buf[..n].copy_from_slice(&bytes[..n]);
        conn.write_pos = 0;
        conn.write_len = n as u16;
        conn.keep_alive = keep_alive as u8;
        conn.requests_served += 1;
        conn.state = ConnState::Writing;

        if n < bytes.len() {
            tracing::warn!("response exceeds write buffer; truncating on fast path");
        }

        self.metrics.add_bytes(n);
        self.flush_pending_write(idx, epoll, slab);
    }

    fn flush_pending_write(&self, idx: usize, epoll: &Epoll, slab: &mut ConnectionSlab) {
        let conn = slab.get_mut(idx).expect("connection vanished mid-flush");
        let pending = &conn.write_buf[conn.write_pos as usize..conn.write_len as usize];
        if pending.is_empty() {
            let keep_alive = conn.keep_alive == 1;
            conn.write_pos = 0;
            conn.write_len = 0;
            if keep_alive {
                conn.state = ConnState::Accepted;
                let _ = epoll.modify(conn.fd, idx as u64, EPOLLIN);
            } else {
                self.close_conn(idx, epoll, slab);
            }
            return;
        }

        match syscalls::write_nonblocking(conn.fd, pending) {
            Ok(0) => {
                let _ = epoll.modify(conn.fd, idx as u64, EPOLLOUT);
            }
            Ok(n) => {
                conn.write_pos += n as u16;
                self.flush_pending_write(idx, epoll, slab);
            }
            Err(_) => self.close_conn(idx, epoll, slab),
        }
    }

    fn respond_and_close(&self, idx: usize, epoll: &Epoll, slab: &mut ConnectionSlab, status: u16, message: &str) {
        let finished = FinishedResponse {
            status,
            content_type: "application/json".to_string(),
            headers: Vec::new(),
            body: format!(r#"{{"error":true,"status":{status},"message":"{message}"}}"#).into_bytes(),
        };
        let consumed = slab.get(idx).map(|c| c.read_len as usize).unwrap_or(0);
        self.complete_on_io_thread(idx, epoll, slab, finished, false, consumed);
    }

    /// Removes the connection from this thread's epoll and slab, then
    /// re-dispatches it onto the worker pool as an owned byte buffer — the
    /// worker reparses and may block on further reads/writes freely.
    fn hand_off_to_worker(
        &self,
        idx: usize,
        epoll: &Epoll,
        slab: &mut ConnectionSlab,
        _consumed: usize,
        keep_alive: bool,
        method: Method,
    ) {
        let conn = slab.get_mut(idx).expect("connection vanished at handoff");
        let fd = conn.fd;
        let buf = conn.read_buf[..conn.read_len as usize].to_vec();
        let _ = epoll.delete(fd);
        slab.free(idx);

        let dispatch = self.dispatch.clone();
        let metrics = self.metrics.clone();
        let timeout = self.config.request_timeout;
        self.worker_pool.execute(move || {
            metrics.inc_req();
            worker_serve_connection(fd, buf, dispatch, keep_alive, timeout);
        });
        let _ = method; // classification already consumed; kept for future per-method metrics
    }

    fn close_conn(&self, idx: usize, epoll: &Epoll, slab: &mut ConnectionSlab) {
        if let Some(conn) = slab.get(idx) {
            let _ = epoll.delete(conn.fd);
            unsafe {
                libc::close(conn.fd);
            }
            self.metrics.dec_conn();
        }
        slab.free(idx);
    }

    /// Closes connections that have sat idle past the configured timeout —
    /// a plain linear sweep; slabs are sized so this stays cheap relative to
    /// the 250ms epoll_wait tick that drives it.
    fn reap_idle(&self, epoll: &Epoll, slab: &mut ConnectionSlab) {
        let now = now_secs();
        let deadline = self.config.request_timeout.as_secs() as u32;
        for idx in 0..slab.capacity() {
            let Some(conn) = slab.get(idx) else { continue };
            if conn.state == ConnState::Free {
                continue;
            }
            if now.saturating_sub(conn.last_active) > deadline {
                self.close_conn(idx, epoll, slab);
            }
        }
    }
}

fn now_secs() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

fn render_response(finished: &FinishedResponse, keep_alive: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + finished.body.len());
    let reason = reason_phrase(finished.status);
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", finished.status, reason).as_bytes());
    out.extend_from_slice(format!("Content-Type: {}\r\n", finished.content_type).as_bytes());
    out.extend_from_slice(format!("Content-Length: {}\r\n", finished.body.len()).as_bytes());
    out.extend_from_slice(format!("Date: {}\r\n", httpdate::fmt_http_date(std::time::SystemTime::now())).as_bytes());
    for (name, value) in &finished.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(if keep_alive { b"Connection: keep-alive\r\n" } else { b"Connection: close\r\n" });
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&finished.body);
    out
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Runs on a worker thread: owns `fd` for its remaining lifetime, blocking
/// freely on reads and writes. Serves one request per connection; HTTP
/// pipelining across the worker tier is out of scope (the framing needed to
/// split multiple requests out of one buffer requires Content-Length-aware
/// body accounting the wire parser does not yet do).
fn worker_serve_connection(
    fd: c_int,
    mut buf: Vec<u8>,
    dispatch: Arc<DispatchEngine>,
    keep_alive_requested: bool,
    timeout: Duration,
) {
    let deadline = Instant::now() + timeout;
    let raw_and_consumed = loop {
        match parser::parse_request(&buf) {
            Ok(pair) => break Some(pair),
            Err(ParseError::Incomplete) => {
                if Instant::now() > deadline {
                    break None;
                }
                let mut chunk = [0u8; 4096];
                match blocking_read(fd, &mut chunk, deadline) {
                    Some(0) | None => break None,
                    Some(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            Err(_) => break None,
        }
    };

    let Some((raw, _consumed)) = raw_and_consumed else {
        close_fd(fd);
        return;
    };

    let keep_alive = raw.is_keep_alive(keep_alive_requested);
    let finished = dispatch.dispatch_worker_path(raw);
    let bytes = render_response(&finished, false); // worker tier always closes after one response
    let _ = blocking_write_all(fd, &bytes, deadline);
    let _ = keep_alive;
    close_fd(fd);
}

/// `read_nonblocking` returns `Ok(0)` for both "would block" and "peer
/// closed"; this loop treats both the same way and relies on `deadline` to
/// bound the wait, so a genuine early EOF just costs a few backoff cycles
/// instead of closing immediately.
fn blocking_read(fd: c_int, buf: &mut [u8], deadline: Instant) -> Option<usize> {
    let mut backoff = Duration::from_micros(50);
    loop {
        match syscalls::read_nonblocking(fd, buf) {
            Ok(0) if Instant::now() < deadline => {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_millis(10));
            }
            Ok(n) => return Some(n),
            Err(_) => return None,
        }
        if Instant::now() > deadline {
            return None;
        }
    }
}

fn blocking_write_all(fd: c_int, mut buf: &[u8], deadline: Instant) -> Option<()> {
    let mut backoff = Duration::from_micros(50);
    while !buf.is_empty() {
        match syscalls::write_nonblocking(fd, buf) {
            Ok(0) => {
                if Instant::now() > deadline {
                    return None;
                }
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_millis(10));
            }
            Ok(n) => buf = &buf[n..],
            Err(_) => return None,
        }
    }
    Some(())
}

fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}
