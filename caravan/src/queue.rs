//! Per-connection queue state and the budgeted work loop.
//!
//! One queue per accepted connection. The queue owns the socket, the
//! receive and send state machines (`recv.rs` / `send.rs`), the command
//! slot pool, and both caravans. All state-machine progress and socket
//! I/O for a queue happen on its worker thread; socket readiness and
//! executor completions only enqueue wakeups.

use std::collections::VecDeque;
use std::io;
use std::net::Shutdown;
use std::sync::Arc;

use mio::net::TcpStream;
use tracing::error;

use protocol_nvme_tcp::{DIGEST_SIZE, HEADER_SIZE, ICREQ_SIZE, ICRESP_SIZE};

use crate::caravan::{Caravan, CARAVAN2_CAPACITY, CARAVAN_CAPACITY};
use crate::executor::{ExecCompletion, ExecRequest, Executor, QueueInstall, ResponseSink};
use crate::metrics;
use crate::pool::CommandPool;
use crate::registry::QueueRegistry;

/// Receive state machine invocations per scheduling pass.
pub(crate) const RECV_BUDGET: usize = 16;

/// Send state machine invocations per scheduling pass.
pub(crate) const SEND_BUDGET: usize = 16;

/// Total operations before the work loop yields and requeues itself.
pub(crate) const IO_WORK_BUDGET: usize = 64;

/// Receive scratch: large enough for the biggest inbound PDU plus an
/// optional header digest trailer.
const PDU_SCRATCH: usize = ICREQ_SIZE + DIGEST_SIZE;

/// Receive state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvState {
    Pdu,
    Data,
    Ddgst,
    Err,
}

/// Queue lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueState {
    Connecting,
    Live,
    Disconnecting,
}

/// Outcome of one state machine step: completed, or no progress
/// possible right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Done,
    Again,
}

/// Whether a budgeted pass still had work left when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Some,
    None,
}

/// A failure that ends the queue.
#[derive(Debug)]
pub(crate) enum QueueFailure {
    /// The peer went away; shut the socket and release quietly.
    PeerClosed,
    /// Protocol or I/O fault; enter the receive-error terminal state and
    /// notify the controller.
    Fatal,
}

/// What the worker should do with the queue after a work pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkStatus {
    Idle,
    Pending,
    Release,
}

pub(crate) struct Queue {
    pub sock: TcpStream,
    pub id: u32,
    pub qid: u16,
    pub ctrl: Option<u32>,
    pub state: QueueState,

    // recv state
    pub rcv_state: RecvState,
    pub pdu: [u8; PDU_SCRATCH],
    pub offset: usize,
    pub left: usize,
    pub cur_cmd: Option<u16>,

    // digest state
    pub hdr_digest: bool,
    pub data_digest: bool,

    // send state
    pub pool: CommandPool,
    pub resp_send_list: VecDeque<u16>,
    pub snd_cmd: Option<u16>,
    pub sink: ResponseSink,

    // caravans
    pub caravan: Caravan,
    pub caravan2: Caravan,
    pub no_space: bool,

    /// Unwritten tail of the synchronous `icresp`; the queue stays in
    /// `Connecting` until it drains.
    pub pending_icresp: Option<(usize, [u8; ICRESP_SIZE])>,

    /// Worker bookkeeping: queue is on the runnable list.
    pub queued: bool,

    pub executor: Arc<dyn Executor>,
    pub registry: Arc<QueueRegistry>,
    pub inline_data_size: u32,
}

impl Queue {
    pub fn new(
        sock: TcpStream,
        id: u32,
        sink: ResponseSink,
        executor: Arc<dyn Executor>,
        registry: Arc<QueueRegistry>,
        inline_data_size: u32,
    ) -> Self {
        let mut queue = Self {
            sock,
            id,
            qid: 0,
            ctrl: None,
            state: QueueState::Connecting,
            rcv_state: RecvState::Pdu,
            pdu: [0; PDU_SCRATCH],
            offset: 0,
            left: 0,
            cur_cmd: None,
            hdr_digest: false,
            data_digest: false,
            pool: CommandPool::new(),
            resp_send_list: VecDeque::new(),
            snd_cmd: None,
            sink,
            caravan: Caravan::new(CARAVAN_CAPACITY),
            caravan2: Caravan::new(CARAVAN2_CAPACITY),
            no_space: false,
            pending_icresp: None,
            queued: false,
            executor,
            registry,
            inline_data_size,
        };
        queue.prepare_receive_pdu();
        queue
    }

    /// Admin queues bypass the caravans; their outputs go directly to
    /// the socket. A queue counts as admin until a connect installs a
    /// non-zero qid.
    pub fn is_admin(&self) -> bool {
        self.qid == 0
    }

    /// Re-arm the receive scratch for the next PDU header.
    pub fn prepare_receive_pdu(&mut self) {
        self.offset = 0;
        self.left = HEADER_SIZE;
        self.cur_cmd = None;
        self.rcv_state = RecvState::Pdu;
    }

    /// One scheduling pass: budgeted receive and send, looping while
    /// both directions keep making progress, bounded by the work budget.
    pub fn io_work(&mut self) -> WorkStatus {
        let mut ops = 0usize;
        loop {
            let mut pending = false;

            match self.try_recv(RECV_BUDGET, &mut ops) {
                Ok(Progress::Some) => pending = true,
                Ok(Progress::None) => {}
                Err(failure) => return self.handle_failure(failure),
            }

            match self.try_send(SEND_BUDGET, &mut ops) {
                Ok(Progress::Some) => pending = true,
                Ok(Progress::None) => {}
                Err(failure) => return self.handle_failure(failure),
            }

            if !pending {
                return WorkStatus::Idle;
            }
            if ops >= IO_WORK_BUDGET {
                // Budget exhausted with work remaining; requeue so other
                // queues on this worker get a turn.
                return WorkStatus::Pending;
            }
        }
    }

    fn handle_failure(&mut self, failure: QueueFailure) -> WorkStatus {
        match failure {
            QueueFailure::PeerClosed => {
                let _ = self.sock.shutdown(Shutdown::Both);
                WorkStatus::Release
            }
            QueueFailure::Fatal => {
                self.fatal_error();
                if self.ctrl.is_none() {
                    WorkStatus::Release
                } else {
                    // The controller was notified; teardown arrives via
                    // delete_ctrl shutting our socket.
                    WorkStatus::Idle
                }
            }
        }
    }

    /// Enter the receive-error terminal state and notify the owning
    /// controller, or shut the socket when none is attached yet.
    pub fn fatal_error(&mut self) {
        self.rcv_state = RecvState::Err;
        metrics::FATAL_ERRORS.increment();
        match self.ctrl {
            Some(ctrl) => self.executor.fatal_error(ctrl),
            None => {
                let _ = self.sock.shutdown(Shutdown::Both);
            }
        }
    }

    /// Drain the lock-free inbox into the ordered response-send list.
    /// Entries come off the stack newest-first; prepending each one
    /// rebuilds arrival order at the front of the list.
    pub fn process_resp_list(&mut self) {
        for entry in self.sink.take_all() {
            let ExecCompletion { tag, payload } = entry;
            if let Some(payload) = payload {
                if let Some(install) = payload.install {
                    self.install(install);
                }
                let cmd = self.pool.cmd_mut(tag);
                cmd.completion = payload.cqe;
                if payload.data.is_some() {
                    cmd.data = payload.data;
                }
            }
            self.resp_send_list.push_front(tag);
        }
    }

    /// Apply queue installation from a completed connect command: size
    /// the slot pool at twice the submission queue size and bind the
    /// queue to its controller.
    pub fn install(&mut self, install: QueueInstall) {
        if self.pool.nr_cmds() > 0 {
            error!(queue = self.id, "queue installed twice");
            return;
        }
        self.qid = install.qid;
        self.ctrl = Some(install.ctrl);
        self.registry.set_ctrl(self.id, install.ctrl);
        self.pool.install(install.sq_size.saturating_mul(2));
    }

    /// Hand a validated command to the executor, moving its data buffer
    /// along with it.
    pub fn execute(&mut self, tag: u16) {
        let (cmd, transfer_len, data) = {
            let slot = self.pool.cmd_mut(tag);
            (slot.cmd, slot.transfer_len, slot.data.take())
        };
        let req = ExecRequest::new(cmd, transfer_len, data, tag, self.sink.clone());
        self.executor.execute(req);
    }

    /// Queue this slot for the send state machine without an executor
    /// round trip (R2T solicitations and locally failed commands).
    pub fn queue_response(&mut self, tag: u16) {
        self.sink.push(ExecCompletion { tag, payload: None });
    }

    /// Fail a command locally with `status` and route it to the send
    /// state machine.
    pub fn complete_request(&mut self, tag: u16, status: u16) {
        let cmd = self.pool.cmd_mut(tag);
        cmd.completion.command_id = cmd.cmd.command_id;
        cmd.completion.status = status;
        self.queue_response(tag);
    }

    /// Tear down queue-held resources. The worker drops the socket and
    /// removes the registry entry afterwards.
    pub fn release(&mut self) {
        self.state = QueueState::Disconnecting;
        // Finish commands still waiting on inbound data.
        self.pool.for_each_mut(|cmd| {
            if cmd.need_data_in() {
                cmd.data = None;
            }
        });
        self.executor.sq_destroy(self.qid);
    }
}

/// Outcome of one socket read/write attempt.
pub(crate) enum IoStep {
    Done(usize),
    Again,
}

/// One vectored read attempt with the error mapping shared by every
/// receive site: EOF and connection resets release the queue, would-block
/// yields, anything else is fatal.
pub(crate) fn read_step(
    sock: &mut TcpStream,
    bufs: &mut [io::IoSliceMut<'_>],
) -> Result<IoStep, QueueFailure> {
    use std::io::Read;
    loop {
        match sock.read_vectored(bufs) {
            Ok(0) => return Err(QueueFailure::PeerClosed),
            Ok(n) => return Ok(IoStep::Done(n)),
            Err(e) => match e.kind() {
                io::ErrorKind::WouldBlock => return Ok(IoStep::Again),
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                    return Err(QueueFailure::PeerClosed)
                }
                _ => {
                    error!("queue recv error: {e}");
                    return Err(QueueFailure::Fatal);
                }
            },
        }
    }
}

/// One vectored write attempt, mirroring [`read_step`]'s mapping.
pub(crate) fn write_step(
    sock: &mut TcpStream,
    bufs: &[io::IoSlice<'_>],
) -> Result<IoStep, QueueFailure> {
    use std::io::Write;
    loop {
        match sock.write_vectored(bufs) {
            Ok(0) => return Ok(IoStep::Again),
            Ok(n) => return Ok(IoStep::Done(n)),
            Err(e) => match e.kind() {
                io::ErrorKind::WouldBlock => return Ok(IoStep::Again),
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                    return Err(QueueFailure::PeerClosed)
                }
                _ => {
                    error!("queue send error: {e}");
                    return Err(QueueFailure::Fatal);
                }
            },
        }
    }
}
