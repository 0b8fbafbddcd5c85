//! Receive state machine.
//!
//! Bytes from the socket flow through `RECV_PDU` (header, then the
//! typed remainder plus optional header digest), then either dispatch a
//! command to the executor or absorb write payload through `RECV_DATA`
//! and `RECV_DDGST`. Inbound PDUs are processed strictly in wire order.

use std::io::{IoSlice, IoSliceMut};

use tracing::{debug, error, warn};

use protocol_nvme_tcp::{
    digest, CmdCapsule, DataHeader, IcReq, IcResp, PduHeader, PduType, CMD_PDU_SIZE,
    DATA_DIGEST_ENABLE, DATA_PDU_SIZE, DIGEST_SIZE, HDR_DIGEST_ENABLE, HEADER_SIZE, ICREQ_SIZE,
    ICRESP_SIZE, NVME_SC_DNR, NVME_SC_INVALID_FIELD, PFV_1_0,
};

use crate::metrics;
use crate::queue::{
    read_step, write_step, IoStep, Progress, Queue, QueueFailure, QueueState, RecvState, Step,
};
use crate::sg::SgBuffer;

/// Fixed size of each recognized inbound PDU type.
fn inbound_pdu_size(pdu_type: u8) -> Option<usize> {
    match PduType::from_u8(pdu_type)? {
        PduType::Icreq => Some(ICREQ_SIZE),
        PduType::Cmd => Some(CMD_PDU_SIZE),
        PduType::H2cData => Some(DATA_PDU_SIZE),
        _ => None,
    }
}

impl Queue {
    /// Run the receive state machine up to `budget` times, stopping at
    /// the first step that makes no progress.
    pub(crate) fn try_recv(
        &mut self,
        budget: usize,
        ops: &mut usize,
    ) -> Result<Progress, QueueFailure> {
        for _ in 0..budget {
            match self.try_recv_one()? {
                Step::Done => *ops += 1,
                Step::Again => return Ok(Progress::None),
            }
        }
        Ok(Progress::Some)
    }

    fn try_recv_one(&mut self) -> Result<Step, QueueFailure> {
        if self.rcv_state == RecvState::Err {
            return Ok(Step::Again);
        }

        if self.rcv_state == RecvState::Pdu {
            match self.try_recv_pdu()? {
                Step::Again => return Ok(Step::Again),
                Step::Done => {}
            }
        }

        if self.rcv_state == RecvState::Data {
            match self.try_recv_data()? {
                Step::Again => return Ok(Step::Again),
                Step::Done => {}
            }
        }

        if self.rcv_state == RecvState::Ddgst {
            match self.try_recv_ddgst()? {
                Step::Again => return Ok(Step::Again),
                Step::Done => {}
            }
        }

        Ok(Step::Done)
    }

    fn try_recv_pdu(&mut self) -> Result<Step, QueueFailure> {
        loop {
            if self.left > 0 {
                let (offset, left) = (self.offset, self.left);
                let (sock, pdu) = (&mut self.sock, &mut self.pdu);
                let mut bufs = [IoSliceMut::new(&mut pdu[offset..offset + left])];
                match read_step(sock, &mut bufs)? {
                    IoStep::Again => return Ok(Step::Again),
                    IoStep::Done(n) => {
                        self.offset += n;
                        self.left -= n;
                    }
                }
                if self.left > 0 {
                    return Ok(Step::Again);
                }
            }

            if self.offset == HEADER_SIZE {
                // Common header complete; validate and arm the typed
                // remainder plus optional header digest.
                let pdu_type = self.pdu[0];
                let hlen = self.pdu[2] as usize;
                let Some(expected) = inbound_pdu_size(pdu_type) else {
                    error!(queue = self.id, pdu_type, "unexpected pdu type");
                    return Err(QueueFailure::Fatal);
                };
                if hlen != expected {
                    error!(queue = self.id, pdu_type, hlen, "bad pdu hlen");
                    return Err(QueueFailure::Fatal);
                }
                self.left = hlen - HEADER_SIZE + self.hdgst_len();
                continue;
            }
            break;
        }

        let hdr = PduHeader::parse(&self.pdu).map_err(|_| QueueFailure::Fatal)?;

        if self.hdr_digest {
            self.verify_hdgst(&hdr)?;
        }
        if self.data_digest {
            self.check_ddgst_flag(&hdr)?;
        }

        self.done_recv_pdu(hdr)
    }

    fn hdgst_len(&self) -> usize {
        if self.hdr_digest {
            DIGEST_SIZE
        } else {
            0
        }
    }

    /// Recompute the header digest and compare it byte-for-byte with the
    /// received trailer.
    fn verify_hdgst(&mut self, hdr: &PduHeader) -> Result<(), QueueFailure> {
        if !hdr.has_hdgst() {
            error!(
                queue = self.id,
                "header digest enabled but no header digest"
            );
            return Err(QueueFailure::Fatal);
        }
        let hlen = hdr.hlen as usize;
        let exp = digest::header_digest(&self.pdu[..hlen]);
        let recv = u32::from_le_bytes([
            self.pdu[hlen],
            self.pdu[hlen + 1],
            self.pdu[hlen + 2],
            self.pdu[hlen + 3],
        ]);
        if recv != exp {
            metrics::DIGEST_ERRORS.increment();
            error!(
                queue = self.id,
                "header digest error: recv {recv:#x} expected {exp:#x}"
            );
            return Err(QueueFailure::Fatal);
        }
        Ok(())
    }

    /// A PDU carrying payload must advertise the data digest when the
    /// queue negotiated one.
    fn check_ddgst_flag(&mut self, hdr: &PduHeader) -> Result<(), QueueFailure> {
        let hdgst = if hdr.has_hdgst() { DIGEST_SIZE as u32 } else { 0 };
        let payload = hdr.plen.saturating_sub(hdr.hlen as u32 + hdgst);
        if payload > 0 && !hdr.has_ddgst() {
            error!(queue = self.id, "data digest flag is cleared");
            return Err(QueueFailure::Fatal);
        }
        Ok(())
    }

    fn done_recv_pdu(&mut self, hdr: PduHeader) -> Result<Step, QueueFailure> {
        metrics::PDUS_RECEIVED.increment();

        if self.state == QueueState::Connecting {
            if hdr.pdu_type != PduType::Icreq as u8 {
                error!(
                    queue = self.id,
                    pdu_type = hdr.pdu_type,
                    "unexpected pdu type before icreq"
                );
                return Err(QueueFailure::Fatal);
            }
            return self.handle_icreq(&hdr);
        }

        if hdr.pdu_type == PduType::H2cData as u8 {
            self.handle_h2c_data()?;
            return Ok(Step::Done);
        }

        // Command capsule: claim a slot and hand the command to the
        // executor for validation.
        let Some(tag) = self.pool.get() else {
            // The initiator promised not to oversubscribe the queue.
            error!(
                queue = self.id,
                nr_cmds = self.pool.nr_cmds(),
                "out of command slots"
            );
            return Err(QueueFailure::Fatal);
        };
        self.cur_cmd = Some(tag);

        let capsule =
            CmdCapsule::parse(&self.pdu[..CMD_PDU_SIZE]).map_err(|_| QueueFailure::Fatal)?;
        self.pool.cmd_mut(tag).cmd = capsule.cmd;

        if let Err(status) = self.executor.init_request(&capsule.cmd, self.qid) {
            warn!(
                queue = self.id,
                command_id = capsule.cmd.command_id,
                opcode = capsule.cmd.opcode,
                status,
                "command failed validation"
            );
            return self.handle_req_failure(tag, status);
        }

        if let Err(status) = self.map_data(tag) {
            error!(queue = self.id, status, "failed to map data");
            if self.pool.cmd(tag).has_inline_data() {
                return Err(QueueFailure::Fatal);
            }
            self.complete_request(tag, status);
            self.prepare_receive_pdu();
            return Ok(Step::Done);
        }

        let cmd = self.pool.cmd(tag);
        if cmd.need_data_in() {
            if cmd.has_inline_data() {
                // In-capsule payload follows in this PDU.
                self.rcv_state = RecvState::Data;
                return Ok(Step::Done);
            }
            // Solicit the payload with an R2T via the response path.
            self.queue_response(tag);
            self.prepare_receive_pdu();
            return Ok(Step::Done);
        }

        self.execute(tag);
        self.prepare_receive_pdu();
        Ok(Step::Done)
    }

    /// Validate the initial connection request, latch digest options,
    /// and answer with an `icresp` written synchronously.
    fn handle_icreq(&mut self, hdr: &PduHeader) -> Result<Step, QueueFailure> {
        if hdr.plen as usize != ICREQ_SIZE {
            error!(queue = self.id, plen = hdr.plen, "bad icreq pdu length");
            return Err(QueueFailure::Fatal);
        }
        let icreq = IcReq::parse(&self.pdu[..ICREQ_SIZE]).map_err(|_| QueueFailure::Fatal)?;

        if icreq.pfv != PFV_1_0 {
            error!(queue = self.id, pfv = icreq.pfv, "bad pfv");
            return Err(QueueFailure::Fatal);
        }
        if icreq.hpda != 0 {
            error!(queue = self.id, hpda = icreq.hpda, "unsupported hpda");
            return Err(QueueFailure::Fatal);
        }
        if icreq.maxr2t != 0 {
            // This target advertises a single outstanding R2T per command.
            error!(
                queue = self.id,
                maxr2t = icreq.maxr2t + 1,
                "unsupported maxr2t"
            );
            return Err(QueueFailure::Fatal);
        }

        self.hdr_digest = icreq.digest & HDR_DIGEST_ENABLE != 0;
        self.data_digest = icreq.digest & DATA_DIGEST_ENABLE != 0;

        let mut icresp_digest = 0;
        if self.hdr_digest {
            icresp_digest |= HDR_DIGEST_ENABLE;
        }
        if self.data_digest {
            icresp_digest |= DATA_DIGEST_ENABLE;
        }
        let icresp = IcResp {
            pfv: PFV_1_0,
            cpda: 0,
            digest: icresp_digest,
            maxdata: 0xffff,
        };
        let mut buf = [0u8; ICRESP_SIZE];
        icresp.encode(&mut buf);

        debug!(
            queue = self.id,
            hdr_digest = self.hdr_digest,
            data_digest = self.data_digest,
            "connection exchange"
        );
        self.prepare_receive_pdu();

        // The icresp bypasses the caravans. A short write parks the tail
        // and the LIVE transition waits until it drains.
        match write_step(&mut self.sock, &[IoSlice::new(&buf)])? {
            IoStep::Done(n) if n == ICRESP_SIZE => {
                self.state = QueueState::Live;
                Ok(Step::Done)
            }
            IoStep::Done(n) => {
                self.pending_icresp = Some((n, buf));
                Ok(Step::Again)
            }
            IoStep::Again => {
                self.pending_icresp = Some((0, buf));
                Ok(Step::Again)
            }
        }
    }

    /// Dispatch solicited write data to its command slot by transfer tag.
    fn handle_h2c_data(&mut self) -> Result<(), QueueFailure> {
        let data =
            DataHeader::parse(&self.pdu[..DATA_PDU_SIZE]).map_err(|_| QueueFailure::Fatal)?;

        if (data.ttag as usize) >= self.pool.nr_cmds() as usize {
            error!(queue = self.id, ttag = data.ttag, "invalid ttag");
            return Err(QueueFailure::Fatal);
        }
        let tag = data.ttag;

        let cmd = self.pool.cmd(tag);
        if !cmd.need_data_in() {
            error!(queue = self.id, ttag = data.ttag, "unsolicited h2c data");
            return Err(QueueFailure::Fatal);
        }
        if data.data_offset != cmd.rbytes_done {
            error!(
                ttag = data.ttag,
                data_offset = data.data_offset,
                expected = cmd.rbytes_done,
                "unexpected data offset"
            );
            self.complete_request(tag, NVME_SC_INVALID_FIELD | NVME_SC_DNR);
            return Err(QueueFailure::Fatal);
        }
        let end = data.data_offset.checked_add(data.data_length);
        if end.is_none() || end > Some(cmd.transfer_len) {
            error!(
                ttag = data.ttag,
                data_length = data.data_length,
                transfer_len = cmd.transfer_len,
                "data overruns transfer"
            );
            self.complete_request(tag, NVME_SC_INVALID_FIELD | NVME_SC_DNR);
            return Err(QueueFailure::Fatal);
        }

        let cmd = self.pool.cmd_mut(tag);
        cmd.pdu_len = data.data_length;
        cmd.pdu_recv = 0;
        self.cur_cmd = Some(tag);
        self.rcv_state = RecvState::Data;
        Ok(())
    }

    /// Size the command's data buffer from its SGL descriptor. Inline
    /// descriptors bound the payload to the port's inline-data size.
    fn map_data(&mut self, tag: u16) -> Result<(), u16> {
        let inline_limit = self.inline_data_size;
        let cmd = self.pool.cmd_mut(tag);
        let sgl = cmd.cmd.sgl;
        let len = sgl.length;
        if len == 0 {
            return Ok(());
        }
        if sgl.is_inline() {
            if !cmd.cmd.is_write() {
                return Err(NVME_SC_INVALID_FIELD | NVME_SC_DNR);
            }
            if len > inline_limit {
                return Err(protocol_nvme_tcp::NVME_SC_SGL_INVALID_OFFSET | NVME_SC_DNR);
            }
            cmd.pdu_len = len;
        }
        cmd.transfer_len = len;
        cmd.data = Some(SgBuffer::alloc(len));
        Ok(())
    }

    /// A command failed validation. Record the failing status; if the
    /// capsule carries inline payload it must still be drained before
    /// the response goes out, otherwise respond immediately.
    fn handle_req_failure(&mut self, tag: u16, status: u16) -> Result<Step, QueueFailure> {
        {
            let cmd = self.pool.cmd_mut(tag);
            cmd.completion.command_id = cmd.cmd.command_id;
            cmd.completion.status = status;
        }

        let (is_write, inline, len) = {
            let cmd = self.pool.cmd(tag);
            (cmd.cmd.is_write(), cmd.cmd.sgl.is_inline(), cmd.cmd.sgl.length)
        };

        if !is_write || !inline || len == 0 || len > self.inline_data_size {
            self.queue_response(tag);
            self.prepare_receive_pdu();
            return Ok(Step::Done);
        }

        // Absorb the in-capsule payload without executing.
        let cmd = self.pool.cmd_mut(tag);
        cmd.pdu_len = len;
        cmd.transfer_len = len;
        cmd.data = Some(SgBuffer::alloc(len));
        cmd.init_failed = true;
        self.cur_cmd = Some(tag);
        self.rcv_state = RecvState::Data;
        Ok(Step::Done)
    }

    fn try_recv_data(&mut self) -> Result<Step, QueueFailure> {
        let Some(tag) = self.cur_cmd else {
            error!(queue = self.id, "recv data with no current command");
            return Err(QueueFailure::Fatal);
        };

        loop {
            let (remaining, at) = {
                let cmd = self.pool.cmd(tag);
                (cmd.pdu_len - cmd.pdu_recv, cmd.rbytes_done)
            };
            if remaining == 0 {
                break;
            }

            let sock = &mut self.sock;
            let cmd = self.pool.cmd_mut(tag);
            let Some(data) = cmd.data.as_mut() else {
                error!(queue = self.id, "recv data with no buffer");
                return Err(QueueFailure::Fatal);
            };
            let mut slices = data.slices_mut(at, remaining);
            match read_step(sock, &mut slices)? {
                IoStep::Again => return Ok(Step::Again),
                IoStep::Done(n) => {
                    cmd.pdu_recv += n as u32;
                    cmd.rbytes_done += n as u32;
                }
            }
        }

        let (init_failed, transfer_done) = {
            let cmd = self.pool.cmd(tag);
            (cmd.init_failed, cmd.rbytes_done == cmd.transfer_len)
        };

        if !init_failed && transfer_done {
            if self.data_digest {
                self.prep_recv_ddgst(tag);
                return Ok(Step::Done);
            }
            self.execute(tag);
        } else if init_failed && transfer_done {
            // Deferred response for a command that failed validation but
            // had to drain its inline payload first.
            self.queue_response(tag);
        }

        self.prepare_receive_pdu();
        Ok(Step::Done)
    }

    /// Capture the expected digest over the received payload, then arm
    /// the 4-byte trailer read.
    fn prep_recv_ddgst(&mut self, tag: u16) {
        let cmd = self.pool.cmd_mut(tag);
        cmd.exp_ddgst = cmd.data.as_ref().map(|d| d.digest()).unwrap_or(0);
        self.offset = 0;
        self.left = DIGEST_SIZE;
        self.rcv_state = RecvState::Ddgst;
    }

    fn try_recv_ddgst(&mut self) -> Result<Step, QueueFailure> {
        let Some(tag) = self.cur_cmd else {
            error!(queue = self.id, "recv ddgst with no current command");
            return Err(QueueFailure::Fatal);
        };

        let (offset, left) = (self.offset, self.left);
        let (sock, pdu) = (&mut self.sock, &mut self.pdu);
        let mut bufs = [IoSliceMut::new(&mut pdu[offset..offset + left])];
        match read_step(sock, &mut bufs)? {
            IoStep::Again => return Ok(Step::Again),
            IoStep::Done(n) => {
                self.offset += n;
                self.left -= n;
            }
        }
        if self.left > 0 {
            return Ok(Step::Again);
        }

        let recv = u32::from_le_bytes([self.pdu[0], self.pdu[1], self.pdu[2], self.pdu[3]]);
        let cmd = self.pool.cmd_mut(tag);
        if recv != cmd.exp_ddgst {
            metrics::DIGEST_ERRORS.increment();
            error!(
                queue = self.id,
                command_id = cmd.cmd.command_id,
                "data digest error: recv {recv:#x} expected {:#x}",
                cmd.exp_ddgst
            );
            cmd.data = None;
            return Err(QueueFailure::Fatal);
        }

        let (init_failed, transfer_done) = (cmd.init_failed, cmd.rbytes_done == cmd.transfer_len);
        if !init_failed && transfer_done {
            self.execute(tag);
        }
        self.prepare_receive_pdu();
        Ok(Step::Done)
    }
}
