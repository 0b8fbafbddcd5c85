//! Worker threads and the target builder.
//!
//! Each worker is a single-threaded unit pinned to one CPU, driving
//! every queue placed on it: readiness events and cross-thread wakeups
//! mark queues runnable, and each runnable queue gets one budgeted
//! `io_work` pass per loop iteration. Socket readiness stands in for
//! the data-ready/write-space/state-change callbacks: READABLE wakes
//! the queue, WRITABLE clears the send-buffer stall, and close or error
//! events trigger release.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::Error;
use crate::executor::{Executor, ResponseSink};
use crate::metrics;
use crate::port::{create_listener, listener_addr, run_acceptor, AcceptorConfig};
use crate::queue::{Queue, RecvState, WorkStatus};
use crate::registry::QueueRegistry;

/// Token reserved for the worker's waker; queues use `slot + 1`.
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// Messages delivered to a worker from the acceptor and from response
/// sinks on other threads.
pub(crate) enum WorkerMsg {
    /// A freshly accepted connection to adopt.
    Conn(RawFd, SocketAddr),
    /// Wake a queue; `queue_id` guards against a recycled slot.
    Wake { slot: u32, queue_id: u32 },
}

/// Result type for `TargetBuilder::launch`.
type LaunchResult = Result<(ShutdownHandle, Vec<thread::JoinHandle<Result<(), Error>>>), Error>;

/// Handle returned by `launch()` for shutdown and admin operations.
pub struct ShutdownHandle {
    shutdown_flag: Arc<AtomicBool>,
    worker_wakers: Vec<Arc<Waker>>,
    listen_fd: RawFd,
    listen_fd_closed: Arc<AtomicBool>,
    local_addr: SocketAddr,
    registry: Arc<QueueRegistry>,
}

impl ShutdownHandle {
    /// Signal all workers to shut down gracefully: stop accepting,
    /// release every queue, and exit the event loops.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Release);
        // Close the listen fd to unblock the acceptor's accept4().
        if !self.listen_fd_closed.swap(true, Ordering::AcqRel) {
            unsafe {
                libc::close(self.listen_fd);
            }
        }
        for waker in &self.worker_wakers {
            let _ = waker.wake();
        }
    }

    /// The bound transport address, as reported to discovery.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shut down every queue belonging to a controller.
    pub fn delete_ctrl(&self, ctrl: u32) {
        self.registry.delete_ctrl(ctrl);
    }

    /// Number of live queues across all workers.
    pub fn active_queues(&self) -> usize {
        self.registry.len()
    }
}

/// Builder for launching the target.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use caravan::{Config, TargetBuilder};
/// # struct Noop;
/// # impl caravan::Executor for Noop {
/// #     fn init_request(&self, _: &protocol_nvme_tcp::NvmeCommand, _: u16) -> Result<(), u16> { Ok(()) }
/// #     fn execute(&self, req: caravan::ExecRequest) { req.complete(0) }
/// # }
///
/// let (handle, workers) = TargetBuilder::new(Config::default())
///     .bind("127.0.0.1:4420".parse().unwrap())
///     .launch(Arc::new(Noop))
///     .unwrap();
/// # handle.shutdown();
/// for h in workers {
///     h.join().unwrap().unwrap();
/// }
/// ```
pub struct TargetBuilder {
    config: Config,
    bind_addr: Option<SocketAddr>,
}

impl TargetBuilder {
    /// Create a new builder with the given config.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            bind_addr: None,
        }
    }

    /// Set the transport address to listen on.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Launch the acceptor and worker threads.
    pub fn launch(self, executor: Arc<dyn Executor>) -> LaunchResult {
        self.config.validate()?;
        let addr = self
            .bind_addr
            .ok_or_else(|| Error::Config("bind address required".into()))?;

        let num_threads = if self.config.worker.threads == 0 {
            num_cpus()
        } else {
            self.config.worker.threads
        };

        let registry = Arc::new(QueueRegistry::new());
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        // Build per-worker polls and channels before spawning anything
        // so the acceptor can address every worker.
        let mut worker_txs = Vec::with_capacity(num_threads);
        let mut worker_wakers = Vec::with_capacity(num_threads);
        let mut worker_parts = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let (tx, rx) = crossbeam_channel::unbounded::<WorkerMsg>();
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
            worker_txs.push(tx.clone());
            worker_wakers.push(waker.clone());
            worker_parts.push((poll, waker, rx, tx));
        }

        let listen_fd = create_listener(addr, self.config.backlog, self.config.sock_buf_size)?;
        let local_addr = listener_addr(listen_fd)?;
        let listen_fd_closed = Arc::new(AtomicBool::new(false));

        let acceptor_config = AcceptorConfig {
            listen_fd,
            worker_channels: worker_txs,
            worker_wakers: worker_wakers.clone(),
            shutdown_flag: shutdown_flag.clone(),
            tcp_nodelay: self.config.tcp_nodelay,
        };
        let acceptor_closed = listen_fd_closed.clone();
        thread::Builder::new()
            .name("caravan-acceptor".to_string())
            .spawn(move || {
                run_acceptor(acceptor_config);
                if !acceptor_closed.swap(true, Ordering::AcqRel) {
                    unsafe {
                        libc::close(listen_fd);
                    }
                }
            })
            .map_err(Error::Io)?;

        let mut handles = Vec::with_capacity(num_threads);
        for (worker_id, (poll, waker, rx, tx)) in worker_parts.into_iter().enumerate() {
            let config = self.config.clone();
            let executor = executor.clone();
            let registry = registry.clone();
            let shutdown_flag = shutdown_flag.clone();

            let handle = thread::Builder::new()
                .name(format!("caravan-worker-{worker_id}"))
                .spawn(move || {
                    if config.worker.pin_to_core {
                        pin_to_core(config.worker.core_offset + worker_id)?;
                    }
                    let mut worker =
                        Worker::new(config, executor, registry, poll, waker, rx, tx, shutdown_flag);
                    worker.run()
                })
                .map_err(Error::Io)?;
            handles.push(handle);
        }

        let handle = ShutdownHandle {
            shutdown_flag,
            worker_wakers,
            listen_fd,
            listen_fd_closed,
            local_addr,
            registry,
        };
        Ok((handle, handles))
    }
}

struct Worker {
    poll: Poll,
    events: Events,
    queues: Vec<Option<Queue>>,
    free: Vec<u32>,
    runnable: VecDeque<u32>,
    rx: Receiver<WorkerMsg>,
    tx: Sender<WorkerMsg>,
    waker: Arc<Waker>,
    executor: Arc<dyn Executor>,
    registry: Arc<QueueRegistry>,
    config: Config,
    shutdown_flag: Arc<AtomicBool>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: Config,
        executor: Arc<dyn Executor>,
        registry: Arc<QueueRegistry>,
        poll: Poll,
        waker: Arc<Waker>,
        rx: Receiver<WorkerMsg>,
        tx: Sender<WorkerMsg>,
        shutdown_flag: Arc<AtomicBool>,
    ) -> Self {
        let max = config.max_queues;
        let mut queues = Vec::with_capacity(max as usize);
        queues.resize_with(max as usize, || None);
        let free: Vec<u32> = (0..max).rev().collect();
        Self {
            poll,
            events: Events::with_capacity(1024),
            queues,
            free,
            runnable: VecDeque::new(),
            rx,
            tx,
            waker,
            executor,
            registry,
            config,
            shutdown_flag,
        }
    }

    fn run(&mut self) -> Result<(), Error> {
        let mut actions: Vec<(u32, bool, bool)> = Vec::new();
        loop {
            // Poll without blocking while queues are runnable so budgeted
            // passes interleave with fresh readiness.
            let timeout = if self.runnable.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() != io::ErrorKind::Interrupted {
                    return Err(Error::Io(e));
                }
            }

            if self.shutdown_flag.load(Ordering::Relaxed) {
                self.teardown();
                return Ok(());
            }

            actions.clear();
            for event in self.events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                let slot = (event.token().0 - 1) as u32;
                let closed = event.is_error() || event.is_read_closed() || event.is_write_closed();
                actions.push((slot, closed, event.is_writable()));
            }
            for &(slot, closed, writable) in &actions {
                let release = {
                    let Some(queue) = self.queues[slot as usize].as_mut() else {
                        continue;
                    };
                    if writable && queue.no_space {
                        queue.no_space = false;
                    }
                    // Queues in the receive-error terminal state no
                    // longer read; the peer close is their release
                    // trigger.
                    closed && queue.rcv_state == RecvState::Err
                };
                if release {
                    self.release_queue(slot);
                } else {
                    self.schedule(slot);
                }
            }

            while let Ok(msg) = self.rx.try_recv() {
                match msg {
                    WorkerMsg::Conn(fd, addr) => self.accept_queue(fd, addr),
                    WorkerMsg::Wake { slot, queue_id } => {
                        let valid = self
                            .queues
                            .get(slot as usize)
                            .and_then(|q| q.as_ref())
                            .map(|q| q.id)
                            == Some(queue_id);
                        if valid {
                            self.schedule(slot);
                        }
                    }
                }
            }

            // One pass over the current runnable set; queues that still
            // have work requeue themselves behind the others.
            let n = self.runnable.len();
            for _ in 0..n {
                let Some(slot) = self.runnable.pop_front() else {
                    break;
                };
                let status = {
                    let Some(queue) = self.queues[slot as usize].as_mut() else {
                        continue;
                    };
                    queue.queued = false;
                    queue.io_work()
                };
                match status {
                    WorkStatus::Idle => {}
                    WorkStatus::Pending => self.schedule(slot),
                    WorkStatus::Release => self.release_queue(slot),
                }
            }
        }
    }

    fn schedule(&mut self, slot: u32) {
        if let Some(queue) = self.queues[slot as usize].as_mut() {
            if !queue.queued {
                queue.queued = true;
                self.runnable.push_back(slot);
            }
        }
    }

    /// Adopt an accepted connection: claim a slot, register the socket,
    /// and build the queue in its CONNECTING state.
    fn accept_queue(&mut self, fd: RawFd, peer: SocketAddr) {
        let Some(slot) = self.free.pop() else {
            warn!(%peer, "queue limit reached, dropping connection");
            unsafe {
                libc::close(fd);
            }
            return;
        };

        // Safety: the acceptor hands us sole ownership of the fd, already
        // non-blocking.
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
        let mut stream = mio::net::TcpStream::from_std(std_stream);

        if let Err(e) = self.poll.registry().register(
            &mut stream,
            Token(slot as usize + 1),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            error!(%peer, "failed to register connection: {e}");
            self.free.push(slot);
            return;
        }

        let id = self.registry.insert(fd);
        let sink = ResponseSink::new(self.tx.clone(), self.waker.clone(), slot, id);
        let queue = Queue::new(
            stream,
            id,
            sink,
            self.executor.clone(),
            self.registry.clone(),
            self.config.inline_data_size,
        );
        debug!(queue = id, %peer, "accepted");
        metrics::QUEUES_ACTIVE.increment();
        self.queues[slot as usize] = Some(queue);
        self.schedule(slot);
    }

    fn release_queue(&mut self, slot: u32) {
        let Some(mut queue) = self.queues[slot as usize].take() else {
            return;
        };
        queue.release();
        // Remove from the registry before the socket closes on drop so a
        // concurrent controller delete never shuts a recycled fd.
        self.registry.remove(queue.id);
        let _ = self.poll.registry().deregister(&mut queue.sock);
        debug!(queue = queue.id, "released");
        drop(queue);
        metrics::QUEUES_RELEASED.increment();
        metrics::QUEUES_ACTIVE.decrement();
        self.free.push(slot);
    }

    fn teardown(&mut self) {
        for slot in 0..self.queues.len() as u32 {
            self.release_queue(slot);
        }
    }
}

/// Pin the current thread to a specific CPU core.
fn pin_to_core(core: usize) -> Result<(), Error> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Get the number of available CPU cores.
fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 {
        1
    } else {
        ret as usize
    }
}
