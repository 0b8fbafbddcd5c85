//! Command slots and the per-queue slot pool.
//!
//! Slots live in a contiguous array sized at queue install time; a
//! slot's tag is its array index, and the protocol's transfer tag is
//! exactly this index, making solicited-data dispatch O(1). A reserved
//! connect slot handles the initial fabrics exchange before the pool is
//! installed and is never recycled through the free list.

use protocol_nvme_tcp::{NvmeCommand, NvmeCompletion, DIGEST_SIZE, RSP_PDU_SIZE};

use crate::sg::SgBuffer;

/// Tag of the reserved connect slot.
pub(crate) const CONNECT_TAG: u16 = u16::MAX;

/// Outbound PDU scratch: a 24-byte header plus optional header digest.
pub(crate) const PDU_BUF_SIZE: usize = RSP_PDU_SIZE + DIGEST_SIZE;

/// Per-command send pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendState {
    DataPdu,
    Data,
    R2t,
    Ddgst,
    Response,
}

/// A command control block.
pub(crate) struct Command {
    /// Latest command capsule received into this slot.
    pub cmd: NvmeCommand,
    /// Completion to transmit in the response PDU.
    pub completion: NvmeCompletion,
    /// Scatter-gather data buffer, present while the transport holds the
    /// payload (absorbing a write, or carrying read data to the wire).
    pub data: Option<SgBuffer>,
    /// Expected total data transfer for the command.
    pub transfer_len: u32,
    /// Payload bytes carried by the PDU currently being received.
    pub pdu_len: u32,
    /// Payload bytes of the current PDU received so far.
    pub pdu_recv: u32,
    /// Bytes received into the data buffer across all PDUs.
    pub rbytes_done: u32,
    /// Bytes of the data buffer sent.
    pub wbytes_done: u32,
    /// Command validation failed; absorb any inline payload but never
    /// execute.
    pub init_failed: bool,

    /// Send pipeline state.
    pub send_state: SendState,
    /// Bytes emitted in the current send sub-stage.
    pub offset: u32,
    /// Current scatter-gather segment for payload emission.
    pub cur_seg: u32,
    /// Data digest computed over the outbound payload, wire-encoded.
    pub ddgst_buf: [u8; DIGEST_SIZE],
    /// Expected inbound data digest.
    pub exp_ddgst: u32,

    /// Encoded `c2h_data` header (plus optional header digest).
    pub data_pdu: [u8; PDU_BUF_SIZE],
    pub data_pdu_len: u8,
    /// Encoded response PDU.
    pub rsp_pdu: [u8; PDU_BUF_SIZE],
    pub rsp_pdu_len: u8,
    /// Encoded `r2t` PDU.
    pub r2t_pdu: [u8; PDU_BUF_SIZE],
    pub r2t_pdu_len: u8,
}

impl Command {
    fn new() -> Self {
        Self {
            cmd: NvmeCommand::default(),
            completion: NvmeCompletion::default(),
            data: None,
            transfer_len: 0,
            pdu_len: 0,
            pdu_recv: 0,
            rbytes_done: 0,
            wbytes_done: 0,
            init_failed: false,
            send_state: SendState::Response,
            offset: 0,
            cur_seg: 0,
            ddgst_buf: [0; DIGEST_SIZE],
            exp_ddgst: 0,
            data_pdu: [0; PDU_BUF_SIZE],
            data_pdu_len: 0,
            rsp_pdu: [0; PDU_BUF_SIZE],
            rsp_pdu_len: 0,
            r2t_pdu: [0; PDU_BUF_SIZE],
            r2t_pdu_len: 0,
        }
    }

    /// Reset per-use state when the slot is taken from the free list.
    fn reset(&mut self) {
        self.completion = NvmeCompletion::default();
        self.data = None;
        self.transfer_len = 0;
        self.pdu_len = 0;
        self.pdu_recv = 0;
        self.rbytes_done = 0;
        self.wbytes_done = 0;
        self.init_failed = false;
        self.send_state = SendState::Response;
        self.offset = 0;
        self.cur_seg = 0;
    }

    /// Whether this command still needs inbound payload and has not
    /// already failed.
    pub fn need_data_in(&self) -> bool {
        self.cmd.is_write() && self.rbytes_done < self.transfer_len && self.completion.status == 0
    }

    /// Whether this command has outbound payload to emit.
    pub fn need_data_out(&self) -> bool {
        !self.cmd.is_write() && self.transfer_len > 0 && self.completion.status == 0
    }

    /// Whether the current command PDU carries its write payload inline.
    pub fn has_inline_data(&self) -> bool {
        self.cmd.is_write() && self.pdu_len > 0 && self.rbytes_done == 0
    }
}

/// Fixed-size pool of command slots with a free list.
pub(crate) struct CommandPool {
    slots: Vec<Command>,
    connect: Command,
    free: Vec<u16>,
}

impl CommandPool {
    /// Create an uninstalled pool holding only the connect slot. The
    /// connect slot is seeded onto the free list so the initial fabrics
    /// command can claim it before the pool is sized.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            connect: Command::new(),
            free: vec![CONNECT_TAG],
        }
    }

    /// Size the pool at queue install time.
    pub fn install(&mut self, nr_cmds: u16) {
        debug_assert!(self.slots.is_empty(), "pool installed twice");
        self.slots = (0..nr_cmds).map(|_| Command::new()).collect();
        self.free.reserve(nr_cmds as usize);
        for tag in (0..nr_cmds).rev() {
            self.free.push(tag);
        }
    }

    /// Number of installed slots, connect slot excluded.
    pub fn nr_cmds(&self) -> u16 {
        self.slots.len() as u16
    }

    /// Take a slot from the free list, resetting its per-use counters.
    pub fn get(&mut self) -> Option<u16> {
        let tag = self.free.pop()?;
        self.cmd_mut(tag).reset();
        Some(tag)
    }

    /// Return a slot to the free list. The connect slot is never recycled.
    pub fn put(&mut self, tag: u16) {
        if tag == CONNECT_TAG {
            return;
        }
        debug_assert!(!self.free.contains(&tag), "double free of slot {tag}");
        self.free.push(tag);
    }

    pub fn cmd(&self, tag: u16) -> &Command {
        if tag == CONNECT_TAG {
            &self.connect
        } else {
            &self.slots[tag as usize]
        }
    }

    pub fn cmd_mut(&mut self, tag: u16) -> &mut Command {
        if tag == CONNECT_TAG {
            &mut self.connect
        } else {
            &mut self.slots[tag as usize]
        }
    }

    /// Visit every slot, connect slot included.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut Command)) {
        for cmd in self.slots.iter_mut() {
            f(cmd);
        }
        f(&mut self.connect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_slot_first_and_never_recycled() {
        let mut pool = CommandPool::new();
        assert_eq!(pool.get(), Some(CONNECT_TAG));
        assert_eq!(pool.get(), None);

        pool.put(CONNECT_TAG);
        assert_eq!(pool.get(), None);
    }

    #[test]
    fn install_sizes_free_list() {
        let mut pool = CommandPool::new();
        assert_eq!(pool.get(), Some(CONNECT_TAG));
        pool.install(4);
        assert_eq!(pool.nr_cmds(), 4);

        let mut tags = Vec::new();
        while let Some(tag) = pool.get() {
            tags.push(tag);
        }
        assert_eq!(tags.len(), 4);

        pool.put(tags[0]);
        assert_eq!(pool.get(), Some(tags[0]));
    }

    #[test]
    fn get_resets_counters() {
        let mut pool = CommandPool::new();
        pool.install(1);
        let tag = pool.get().unwrap();
        {
            let cmd = pool.cmd_mut(tag);
            cmd.rbytes_done = 100;
            cmd.pdu_len = 64;
            cmd.init_failed = true;
            cmd.data = Some(crate::sg::SgBuffer::alloc(64));
        }
        pool.put(tag);
        let tag = pool.get().unwrap();
        let cmd = pool.cmd(tag);
        assert_eq!(cmd.rbytes_done, 0);
        assert_eq!(cmd.pdu_len, 0);
        assert!(!cmd.init_failed);
        assert!(cmd.data.is_none());
    }

    #[test]
    fn command_classification() {
        let mut cmd = Command::new();
        cmd.cmd.opcode = protocol_nvme_tcp::NVME_CMD_WRITE;
        cmd.transfer_len = 512;
        assert!(cmd.need_data_in());
        assert!(!cmd.need_data_out());

        cmd.pdu_len = 512;
        assert!(cmd.has_inline_data());
        cmd.rbytes_done = 512;
        assert!(!cmd.need_data_in());
        assert!(!cmd.has_inline_data());

        let mut read = Command::new();
        read.cmd.opcode = protocol_nvme_tcp::NVME_CMD_READ;
        read.transfer_len = 512;
        assert!(read.need_data_out());
        read.completion.status = protocol_nvme_tcp::NVME_SC_INVALID_FIELD;
        assert!(!read.need_data_out());
    }
}
