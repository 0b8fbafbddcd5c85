//! The command executor seam.
//!
//! The queue engine decodes capsules and moves payload; actually
//! performing block I/O is the job of an injected [`Executor`]. The
//! engine validates each capsule through [`Executor::init_request`],
//! then hands it over with [`Executor::execute`]. Execution is
//! asynchronous: the executor completes the request from any thread via
//! [`ExecRequest::complete`], which pushes onto the owning queue's
//! lock-free inbox and wakes its worker.

use std::sync::Arc;

use protocol_nvme_tcp::{NvmeCommand, NvmeCompletion};

use crate::inbox::ResponseStack;
use crate::sg::SgBuffer;
use crate::worker::WorkerMsg;

/// Queue installation parameters surfaced by the completion of a
/// fabrics connect command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInstall {
    /// Submission queue id; 0 is the admin queue.
    pub qid: u16,
    /// Submission queue size. The queue provisions `2 × sq_size` slots.
    pub sq_size: u16,
    /// Controller id owning the queue.
    pub ctrl: u32,
}

/// A command handed to the executor for asynchronous execution.
pub struct ExecRequest {
    cmd: NvmeCommand,
    transfer_len: u32,
    data: Option<SgBuffer>,
    install: Option<QueueInstall>,
    tag: u16,
    sink: ResponseSink,
}

impl ExecRequest {
    pub(crate) fn new(
        cmd: NvmeCommand,
        transfer_len: u32,
        data: Option<SgBuffer>,
        tag: u16,
        sink: ResponseSink,
    ) -> Self {
        Self {
            cmd,
            transfer_len,
            data,
            install: None,
            tag,
            sink,
        }
    }

    /// The command being executed.
    pub fn command(&self) -> &NvmeCommand {
        &self.cmd
    }

    /// Expected total data transfer for the command.
    pub fn transfer_len(&self) -> u32 {
        self.transfer_len
    }

    /// The command's data buffer: received write payload, or the buffer
    /// a read fills before completing.
    pub fn data_mut(&mut self) -> Option<&mut SgBuffer> {
        self.data.as_mut()
    }

    /// Record queue installation to apply when this request completes.
    /// Used by the executor when completing a fabrics connect command.
    pub fn install_queue(&mut self, install: QueueInstall) {
        self.install = Some(install);
    }

    /// Complete the request with a status code. May be called from any
    /// thread; the response flows back through the queue's inbox.
    pub fn complete(self, status: u16) {
        let cqe = NvmeCompletion {
            command_id: self.cmd.command_id,
            status,
            ..Default::default()
        };
        self.complete_with(cqe);
    }

    /// Complete the request with a fully formed completion entry.
    pub fn complete_with(self, cqe: NvmeCompletion) {
        self.sink.push(ExecCompletion {
            tag: self.tag,
            payload: Some(CompletionPayload {
                cqe,
                data: self.data,
                install: self.install,
            }),
        });
    }
}

/// The NVMe command executor consumed by the queue engine.
pub trait Executor: Send + Sync + 'static {
    /// Validate a freshly received command. Returning `Err(status)`
    /// marks the request failed with that status; the queue still drains
    /// any inline payload before responding.
    fn init_request(&self, cmd: &NvmeCommand, qid: u16) -> Result<(), u16>;

    /// Execute a validated command. Completion may happen inline or from
    /// another thread via [`ExecRequest::complete`].
    fn execute(&self, req: ExecRequest);

    /// The submission queue of a releasing connection is being destroyed.
    fn sq_destroy(&self, qid: u16) {
        let _ = qid;
    }

    /// A fatal transport error occurred on a queue owned by `ctrl`.
    fn fatal_error(&self, ctrl: u32) {
        let _ = ctrl;
    }
}

/// Completion payload carried back through the inbox.
pub(crate) struct CompletionPayload {
    pub cqe: NvmeCompletion,
    pub data: Option<SgBuffer>,
    pub install: Option<QueueInstall>,
}

/// One inbox entry. Entries without a payload are transport-internal
/// (R2T solicitations and locally failed commands whose status is
/// already recorded in the slot).
pub(crate) struct ExecCompletion {
    pub tag: u16,
    pub payload: Option<CompletionPayload>,
}

/// Cloneable handle that delivers completions to a queue's inbox and
/// wakes its worker. Safe to use from any thread.
#[derive(Clone)]
pub(crate) struct ResponseSink {
    inner: Arc<SinkInner>,
}

pub(crate) struct SinkInner {
    pub stack: ResponseStack<ExecCompletion>,
    pub tx: crossbeam_channel::Sender<WorkerMsg>,
    pub waker: Arc<mio::Waker>,
    pub slot: u32,
    pub queue_id: u32,
}

impl ResponseSink {
    pub fn new(
        tx: crossbeam_channel::Sender<WorkerMsg>,
        waker: Arc<mio::Waker>,
        slot: u32,
        queue_id: u32,
    ) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                stack: ResponseStack::new(),
                tx,
                waker,
                slot,
                queue_id,
            }),
        }
    }

    /// Push a completion and wake the owning worker.
    pub fn push(&self, completion: ExecCompletion) {
        self.inner.stack.push(completion);
        let _ = self.inner.tx.send(WorkerMsg::Wake {
            slot: self.inner.slot,
            queue_id: self.inner.queue_id,
        });
        let _ = self.inner.waker.wake();
    }

    /// Detach all pending completions, newest-first.
    pub fn take_all(&self) -> Vec<ExecCompletion> {
        self.inner.stack.take_all()
    }
}
