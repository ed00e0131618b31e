//! I/O manager
//!
//! A single reactor thread owns every live connection and its read buffer.
//! It multiplexes readiness over the connections plus a self-wake pipe,
//! reassembles length-prefixed frames, and hands complete frames to the
//! worker pool. All cross-thread input (new connections, shutdown) arrives
//! through one signal queue; the pipe byte only interrupts the wait.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossfire::{mpmc, mpsc, spsc, MRx, MTx, Rx, Tx};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::frame;
use crate::net::{Connection, UnifyStream};
use crate::server::ServerFactory;
use crate::worker::{WorkItem, Worker};

const READ_CHUNK: usize = 4096;
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub(crate) enum Signal {
    /// Register a freshly accepted socket.
    Connection(UnifyStream),
    /// Begin the drain with the given aggregate budget.
    Shutdown(Duration),
}

/// Cross-thread handle to the reactor. Owned by the server; all operations
/// are safe to call from any thread.
pub(crate) struct ReactorHandle {
    signal_tx: MTx<Signal>,
    work_tx: MTx<WorkItem>,
    work_rx: MRx<WorkItem>,
    wake_tx: Mutex<Option<OwnedFd>>,
    ack_rx: Mutex<Rx<()>>,
    closing: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    num_workers: usize,
}

impl ReactorHandle {
    /// Create the channels and the wake pipe, spin up the worker pool, then
    /// start the reactor thread.
    pub(crate) fn spawn<F: ServerFactory>(facts: Arc<F>) -> io::Result<ReactorHandle> {
        let config = facts.get_config();
        let (signal_tx, signal_rx) = mpsc::unbounded_blocking::<Signal>();
        let (work_tx, work_rx) = mpmc::bounded_blocking::<WorkItem>(config.effective_queue_depth());
        let (ack_tx, ack_rx) = spsc::bounded_blocking::<()>(1);
        let (wake_rx, wake_tx) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let num_workers = config.num_workers.max(1);
        let read_buf_size = config.read_buf_size;

        let workers = Worker::spawn_pool(&facts, &work_rx)?;
        let reactor: Reactor<F> = Reactor {
            logger: facts.new_logger(),
            read_buf_size,
            wake_rx,
            signal_rx,
            work_tx: work_tx.clone(),
            conns: HashMap::new(),
            bufs: HashMap::new(),
            workers,
            ack_tx,
        };
        let thread =
            std::thread::Builder::new().name("rpc-reactor".to_string()).spawn(move || {
                reactor.run()
            })?;
        Ok(ReactorHandle {
            signal_tx,
            work_tx,
            work_rx,
            wake_tx: Mutex::new(Some(wake_tx)),
            ack_rx: Mutex::new(ack_rx),
            closing: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(Some(thread)),
            num_workers,
        })
    }

    /// Queue a new connection for registration and wake the reactor.
    /// Returns immediately. Sockets arriving after shutdown began are
    /// dropped.
    pub(crate) fn add_connection(&self, stream: UnifyStream) {
        if self.closing.load(Ordering::SeqCst) {
            debug!("reactor closing, dropping {:?}", stream);
            return;
        }
        if self.signal_tx.send(Signal::Connection(stream)).is_ok() {
            self.kick();
        }
    }

    /// Drain the worker pool within `timeout` and stop the reactor thread.
    /// Frames still queued are dropped; only frames already picked up by a
    /// worker get to finish.
    pub(crate) fn shutdown(&self, timeout: Duration) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            self.drain(timeout);
        }
        self.join_thread();
    }

    /// Post-serve cleanup for the path where `shutdown` was never reached.
    pub(crate) fn ensure_closed(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            self.drain(Duration::from_secs(0));
        }
        self.join_thread();
    }

    fn drain(&self, timeout: Duration) {
        while self.work_rx.try_recv().is_ok() {}
        for _ in 0..self.num_workers {
            let _ = self.work_tx.send(WorkItem::Shutdown);
        }
        let _ = self.signal_tx.send(Signal::Shutdown(timeout));
        self.kick();
        // Err here means the reactor died before acking; nothing left to wait on
        let _ = self.ack_rx.lock().unwrap().recv();
        // close the write end of the wake pipe; the reactor thread dropped
        // the read end when it exited
        self.wake_tx.lock().unwrap().take();
    }

    fn join_thread(&self) {
        if let Some(t) = self.thread.lock().unwrap().take() {
            let _ = t.join();
        }
    }

    fn kick(&self) {
        if let Some(fd) = self.wake_tx.lock().unwrap().as_ref() {
            let byte = [0u8; 1];
            // a full pipe already wakes the reactor, the result is moot
            let _ = unsafe {
                libc::write(fd.as_raw_fd(), byte.as_ptr() as *const libc::c_void, 1)
            };
        }
    }
}

struct Reactor<F: ServerFactory> {
    logger: F::Logger,
    read_buf_size: usize,
    wake_rx: OwnedFd,
    signal_rx: Rx<Signal>,
    work_tx: MTx<WorkItem>,
    conns: HashMap<RawFd, Arc<Connection>>,
    bufs: HashMap<RawFd, BytesMut>,
    workers: Vec<JoinHandle<()>>,
    ack_tx: Tx<()>,
}

impl<F: ServerFactory> Reactor<F> {
    fn run(mut self) {
        let timeout = self.poll_loop();
        self.join_workers(timeout);
        let _ = self.ack_tx.send(());
        logger_info!(self.logger, "reactor terminated");
    }

    /// Readiness loop; returns the drain budget once a shutdown signal
    /// arrives.
    fn poll_loop(&mut self) -> Duration {
        loop {
            let order: Vec<RawFd> = self.conns.keys().copied().collect();
            let mut fds = Vec::with_capacity(order.len() + 1);
            fds.push(PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN));
            for fd in &order {
                // conns keeps each fd open until after this poll returns
                fds.push(PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(*fd) },
                    PollFlags::POLLIN,
                ));
            }
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    logger_warn!(self.logger, "reactor poll error: {}", e);
                    continue;
                }
            }
            if fds[0].revents().map_or(false, |ev| !ev.is_empty()) {
                drop(fds);
                self.drain_wake_pipe();
                // a wake byte without a queued signal is harmless, the drain
                // below finds the queue empty and the loop just re-polls
                if let Some(timeout) = self.drain_signals() {
                    return timeout;
                }
                continue;
            }
            let mut ready = Vec::new();
            for (i, fd) in order.iter().enumerate() {
                if fds[i + 1].revents().map_or(false, |ev| !ev.is_empty()) {
                    ready.push(*fd);
                }
            }
            drop(fds);
            for fd in ready {
                self.read_ready(fd);
            }
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_rx.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < buf.len() as isize {
                return;
            }
        }
    }

    fn drain_signals(&mut self) -> Option<Duration> {
        while let Ok(sig) = self.signal_rx.try_recv() {
            match sig {
                Signal::Connection(stream) => self.register(stream),
                Signal::Shutdown(timeout) => {
                    // leave remaining signals and readables unprocessed
                    logger_info!(self.logger, "reactor draining, budget {:?}", timeout);
                    return Some(timeout);
                }
            }
        }
        None
    }

    fn register(&mut self, stream: UnifyStream) {
        let fd = stream.as_raw_fd();
        logger_trace!(self.logger, "register {:?}", stream);
        self.conns.insert(fd, Arc::new(Connection::new(stream)));
        self.bufs.insert(fd, BytesMut::with_capacity(self.read_buf_size));
    }

    /// Read whatever the socket has, extract every complete frame, and
    /// enqueue them in wire order. EOF (or a read error) removes the
    /// connection and discards the unframed tail.
    fn read_ready(&mut self, fd: RawFd) {
        let conn = match self.conns.get(&fd) {
            Some(c) => c.clone(),
            None => return,
        };
        let buf = match self.bufs.get_mut(&fd) {
            Some(b) => b,
            None => return,
        };
        let mut eof = false;
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            match conn.read(&mut scratch) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => buf.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("{:?} read error, treating as eof: {}", conn, e);
                    eof = true;
                    break;
                }
            }
        }
        while let Some(payload) = frame::extract_frame(buf) {
            let item = WorkItem::Frame { conn: conn.clone(), payload };
            if self.work_tx.send(item).is_err() {
                break;
            }
        }
        if eof {
            debug!("{:?} eof, {} unframed byte(s) discarded", conn, buf.len());
            self.conns.remove(&fd);
            self.bufs.remove(&fd);
        }
    }

    /// Give the pool `timeout` in aggregate to finish, then abandon whatever
    /// is still busy. Abandoned workers exit on their own once their current
    /// processor call returns, their shutdown items are already queued.
    fn join_workers(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut abandoned = 0usize;
        for handle in self.workers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(JOIN_POLL_INTERVAL);
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            logger_warn!(
                self.logger,
                "{} worker(s) still busy at drain deadline, abandoned",
                abandoned
            );
        }
    }
}
