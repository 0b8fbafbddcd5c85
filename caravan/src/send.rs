//! Send state machine and caravan flushing.
//!
//! Each command walks (data-PDU → data → data-digest → response), or
//! (r2t), or (response) alone. On I/O queues every emission is appended
//! to a caravan; the budgeted loop drains the caravans with single
//! vectored sends. Admin queue emissions go directly to the socket.

use std::io::IoSlice;
use std::os::fd::AsRawFd;

use tracing::{debug, warn};

use protocol_nvme_tcp::{digest, DataHeader, R2t, RspPdu, DIGEST_SIZE, ICRESP_SIZE};

use crate::caravan::{Segment, SegmentSource};
use crate::metrics;
use crate::pool::{CommandPool, SendState};
use crate::queue::{
    write_step, IoStep, Progress, Queue, QueueFailure, QueueState, Step,
};

/// Outcome of a caravan flush attempt.
enum FlushOutcome {
    /// Every gathered byte reached the socket; owners were released.
    Flushed,
    /// A short send left a tail; it is retained for a follow-up flush.
    Partial,
    /// The socket send buffer is full; the write-space wakeup resumes us.
    NoSpace,
}

/// Free space in the socket send buffer: SO_SNDBUF minus the bytes
/// still queued for transmit (TIOCOUTQ). `None` if either query fails;
/// the caller falls through to the write and lets would-block decide.
fn sndbuf_space(sock: &mio::net::TcpStream) -> Option<usize> {
    let fd = sock.as_raw_fd();
    let mut sndbuf: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &mut sndbuf as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return None;
    }
    let mut outq: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut outq) };
    if ret != 0 {
        return None;
    }
    Some((sndbuf as usize).saturating_sub(outq as usize))
}

/// Resolve a caravan segment to the command-owned bytes it describes.
fn segment_bytes<'a>(pool: &'a CommandPool, seg: &Segment) -> &'a [u8] {
    let cmd = pool.cmd(seg.tag);
    let (start, end) = (seg.offset as usize, (seg.offset + seg.len) as usize);
    match seg.source {
        SegmentSource::DataPdu => &cmd.data_pdu[start..end],
        SegmentSource::RspPdu => &cmd.rsp_pdu[start..end],
        SegmentSource::R2tPdu => &cmd.r2t_pdu[start..end],
        SegmentSource::DataDigest => &cmd.ddgst_buf[start..end],
        SegmentSource::Data { page } => match cmd.data.as_ref() {
            Some(data) => &data.segment(page)[start..end],
            None => {
                debug_assert!(false, "caravan data segment without a buffer");
                &[]
            }
        },
    }
}

impl Queue {
    /// Run the send state machine up to `budget` times, flushing the
    /// caravans whenever one demands it, a step stalls, or the batch
    /// ends.
    pub(crate) fn try_send(
        &mut self,
        budget: usize,
        ops: &mut usize,
    ) -> Result<Progress, QueueFailure> {
        if self.pending_icresp.is_some() {
            match self.drain_icresp()? {
                Step::Again => return Ok(Progress::None),
                Step::Done => {}
            }
        }

        for i in 0..budget {
            let last_in_batch = i + 1 == budget;
            let result = self.try_send_one(last_in_batch);
            let stalled = !matches!(result, Ok(Progress::Some));

            if (self.caravan.send_now || stalled || last_in_batch) && !self.caravan.is_empty() {
                if let FlushOutcome::NoSpace = self.flush_caravan(false)? {
                    return Ok(Progress::None);
                }
            }
            if (self.caravan2.send_now || stalled || last_in_batch) && !self.caravan2.is_empty() {
                if let FlushOutcome::NoSpace = self.flush_caravan(true)? {
                    return Ok(Progress::None);
                }
            }

            match result {
                Ok(Progress::Some) => *ops += 1,
                other => return other,
            }
        }
        Ok(Progress::Some)
    }

    /// Finish writing a parked `icresp`; the queue goes live once the
    /// last byte is out.
    fn drain_icresp(&mut self) -> Result<Step, QueueFailure> {
        let Some((mut off, buf)) = self.pending_icresp.take() else {
            return Ok(Step::Done);
        };
        while off < ICRESP_SIZE {
            match write_step(&mut self.sock, &[IoSlice::new(&buf[off..])])? {
                IoStep::Again => {
                    self.pending_icresp = Some((off, buf));
                    return Ok(Step::Again);
                }
                IoStep::Done(n) => off += n,
            }
        }
        self.state = QueueState::Live;
        Ok(Step::Done)
    }

    fn try_send_one(&mut self, last_in_batch: bool) -> Result<Progress, QueueFailure> {
        if self.snd_cmd.is_none() || self.state == QueueState::Disconnecting {
            if self.fetch_cmd().is_none() {
                return Ok(Progress::None);
            }
        }
        let Some(tag) = self.snd_cmd else {
            return Ok(Progress::None);
        };

        if self.pool.cmd(tag).send_state == SendState::DataPdu {
            match self.try_send_data_pdu(tag)? {
                Step::Again => return Ok(Progress::None),
                Step::Done => {}
            }
        }

        if self.pool.cmd(tag).send_state == SendState::Data {
            match self.try_send_data(tag)? {
                Step::Again => return Ok(Progress::None),
                Step::Done => {}
            }
        }

        if self.pool.cmd(tag).send_state == SendState::Ddgst {
            match self.try_send_ddgst(tag)? {
                Step::Again => return Ok(Progress::None),
                Step::Done => {}
            }
        }

        if self.pool.cmd(tag).send_state == SendState::R2t {
            match self.try_send_r2t(tag, last_in_batch)? {
                Step::Again => return Ok(Progress::None),
                Step::Done => {}
            }
        }

        if self.snd_cmd == Some(tag) && self.pool.cmd(tag).send_state == SendState::Response {
            match self.try_send_response(tag, last_in_batch)? {
                Step::Again => return Ok(Progress::None),
                Step::Done => {}
            }
        }

        Ok(Progress::Some)
    }

    /// Pop the next response to transmit, draining the lock-free inbox
    /// when the ordered list runs dry, and classify the command's send
    /// pipeline.
    fn fetch_cmd(&mut self) -> Option<u16> {
        let tag = match self.resp_send_list.pop_front() {
            Some(tag) => tag,
            None => {
                self.process_resp_list();
                self.resp_send_list.pop_front()?
            }
        };
        self.snd_cmd = Some(tag);

        let cmd = self.pool.cmd(tag);
        if cmd.need_data_out() {
            self.setup_c2h_data_pdu(tag);
        } else if cmd.need_data_in() {
            self.setup_r2t_pdu(tag);
        } else {
            self.setup_response_pdu(tag);
        }
        Some(tag)
    }

    fn setup_c2h_data_pdu(&mut self, tag: u16) {
        let (hdgst, ddgst) = (self.hdr_digest, self.data_digest);
        let cmd = self.pool.cmd_mut(tag);
        cmd.offset = 0;
        cmd.cur_seg = 0;
        cmd.send_state = SendState::DataPdu;

        let hdr = DataHeader {
            command_id: cmd.completion.command_id,
            ttag: 0,
            data_offset: cmd.wbytes_done,
            data_length: cmd.transfer_len,
        };
        let mut len = hdr.encode_c2h(hdgst, ddgst, &mut cmd.data_pdu);
        if ddgst {
            let crc = cmd.data.as_ref().map(|d| d.digest()).unwrap_or(0);
            cmd.ddgst_buf = crc.to_le_bytes();
        }
        if hdgst {
            let crc = digest::header_digest(&cmd.data_pdu[..len]);
            cmd.data_pdu[len..len + DIGEST_SIZE].copy_from_slice(&crc.to_le_bytes());
            len += DIGEST_SIZE;
        }
        cmd.data_pdu_len = len as u8;
    }

    fn setup_r2t_pdu(&mut self, tag: u16) {
        let hdgst = self.hdr_digest;
        let cmd = self.pool.cmd_mut(tag);
        cmd.offset = 0;
        cmd.send_state = SendState::R2t;

        let r2t = R2t {
            command_id: cmd.cmd.command_id,
            ttag: tag,
            r2t_offset: cmd.rbytes_done,
            r2t_length: cmd.transfer_len - cmd.rbytes_done,
        };
        let mut len = r2t.encode(hdgst, &mut cmd.r2t_pdu);
        if hdgst {
            let crc = digest::header_digest(&cmd.r2t_pdu[..len]);
            cmd.r2t_pdu[len..len + DIGEST_SIZE].copy_from_slice(&crc.to_le_bytes());
            len += DIGEST_SIZE;
        }
        cmd.r2t_pdu_len = len as u8;
    }

    fn setup_response_pdu(&mut self, tag: u16) {
        let hdgst = self.hdr_digest;
        let cmd = self.pool.cmd_mut(tag);
        cmd.offset = 0;
        cmd.send_state = SendState::Response;

        let rsp = RspPdu {
            cqe: cmd.completion,
        };
        let mut len = rsp.encode(hdgst, &mut cmd.rsp_pdu);
        if hdgst {
            let crc = digest::header_digest(&cmd.rsp_pdu[..len]);
            cmd.rsp_pdu[len..len + DIGEST_SIZE].copy_from_slice(&crc.to_le_bytes());
            len += DIGEST_SIZE;
        }
        cmd.rsp_pdu_len = len as u8;
    }

    fn try_send_data_pdu(&mut self, tag: u16) -> Result<Step, QueueFailure> {
        if !self.is_admin() {
            if self.caravan.is_full() {
                self.caravan.send_now = true;
                return Ok(Step::Done);
            }
            let cmd = self.pool.cmd(tag);
            let left = cmd.data_pdu_len as u32 - cmd.offset;
            self.caravan.push(Segment {
                tag,
                source: SegmentSource::DataPdu,
                offset: cmd.offset,
                len: left,
            });
            let cmd = self.pool.cmd_mut(tag);
            cmd.send_state = SendState::Data;
            cmd.offset = 0;
            return Ok(Step::Done);
        }

        let sock = &mut self.sock;
        let cmd = self.pool.cmd(tag);
        let buf = &cmd.data_pdu[cmd.offset as usize..cmd.data_pdu_len as usize];
        match write_step(sock, &[IoSlice::new(buf)])? {
            IoStep::Again => Ok(Step::Again),
            IoStep::Done(n) => {
                let cmd = self.pool.cmd_mut(tag);
                cmd.offset += n as u32;
                if cmd.offset < cmd.data_pdu_len as u32 {
                    return Ok(Step::Again);
                }
                cmd.send_state = SendState::Data;
                cmd.offset = 0;
                Ok(Step::Done)
            }
        }
    }

    fn try_send_data(&mut self, tag: u16) -> Result<Step, QueueFailure> {
        loop {
            let (nr_segs, cur_seg, seg_off) = {
                let cmd = self.pool.cmd(tag);
                let nr = cmd.data.as_ref().map(|d| d.nr_segments()).unwrap_or(0);
                (nr, cmd.cur_seg, cmd.offset)
            };
            if cur_seg >= nr_segs {
                break;
            }

            if !self.is_admin() {
                if self.caravan.is_full() {
                    self.caravan.send_now = true;
                    return Ok(Step::Done);
                }
                let left = {
                    let cmd = self.pool.cmd(tag);
                    let seg = cmd
                        .data
                        .as_ref()
                        .expect("segment count was nonzero")
                        .segment(cur_seg);
                    seg.len() as u32 - seg_off
                };
                self.caravan.push(Segment {
                    tag,
                    source: SegmentSource::Data { page: cur_seg },
                    offset: seg_off,
                    len: left,
                });
                let cmd = self.pool.cmd_mut(tag);
                cmd.wbytes_done += left;
                cmd.cur_seg += 1;
                cmd.offset = 0;
                continue;
            }

            let sock = &mut self.sock;
            let cmd = self.pool.cmd(tag);
            let seg = cmd
                .data
                .as_ref()
                .expect("segment count was nonzero")
                .segment(cur_seg);
            let seg_len = seg.len() as u32;
            let buf = &seg[seg_off as usize..];
            match write_step(sock, &[IoSlice::new(buf)])? {
                IoStep::Again => return Ok(Step::Again),
                IoStep::Done(n) => {
                    let cmd = self.pool.cmd_mut(tag);
                    cmd.offset += n as u32;
                    cmd.wbytes_done += n as u32;
                    if cmd.offset == seg_len {
                        cmd.cur_seg += 1;
                        cmd.offset = 0;
                    }
                }
            }
        }

        if self.data_digest {
            let cmd = self.pool.cmd_mut(tag);
            cmd.send_state = SendState::Ddgst;
            cmd.offset = 0;
        } else {
            self.setup_response_pdu(tag);
        }
        Ok(Step::Done)
    }

    fn try_send_ddgst(&mut self, tag: u16) -> Result<Step, QueueFailure> {
        if !self.is_admin() {
            if self.caravan.is_full() {
                self.caravan.send_now = true;
                return Ok(Step::Done);
            }
            let offset = self.pool.cmd(tag).offset;
            self.caravan.push(Segment {
                tag,
                source: SegmentSource::DataDigest,
                offset,
                len: DIGEST_SIZE as u32 - offset,
            });
            self.setup_response_pdu(tag);
            return Ok(Step::Done);
        }

        let sock = &mut self.sock;
        let cmd = self.pool.cmd(tag);
        let buf = &cmd.ddgst_buf[cmd.offset as usize..];
        match write_step(sock, &[IoSlice::new(buf)])? {
            IoStep::Again => Ok(Step::Again),
            IoStep::Done(n) => {
                let cmd = self.pool.cmd_mut(tag);
                cmd.offset += n as u32;
                if cmd.offset < DIGEST_SIZE as u32 {
                    return Ok(Step::Again);
                }
                self.setup_response_pdu(tag);
                Ok(Step::Done)
            }
        }
    }

    fn try_send_r2t(&mut self, tag: u16, _last_in_batch: bool) -> Result<Step, QueueFailure> {
        if !self.is_admin() {
            if self.caravan2.is_full() {
                self.caravan2.send_now = true;
                return Ok(Step::Done);
            }
            let cmd = self.pool.cmd(tag);
            let left = cmd.r2t_pdu_len as u32 - cmd.offset;
            self.caravan2.push(Segment {
                tag,
                source: SegmentSource::R2tPdu,
                offset: cmd.offset,
                len: left,
            });
            self.pool.cmd_mut(tag).offset += left;
            // The command stays allocated pending the solicited data.
            self.snd_cmd = None;
            metrics::R2TS_SENT.increment();
            return Ok(Step::Done);
        }

        let sock = &mut self.sock;
        let cmd = self.pool.cmd(tag);
        let buf = &cmd.r2t_pdu[cmd.offset as usize..cmd.r2t_pdu_len as usize];
        match write_step(sock, &[IoSlice::new(buf)])? {
            IoStep::Again => Ok(Step::Again),
            IoStep::Done(n) => {
                let cmd = self.pool.cmd_mut(tag);
                cmd.offset += n as u32;
                if cmd.offset < cmd.r2t_pdu_len as u32 {
                    return Ok(Step::Again);
                }
                self.snd_cmd = None;
                metrics::R2TS_SENT.increment();
                Ok(Step::Done)
            }
        }
    }

    fn try_send_response(&mut self, tag: u16, _last_in_batch: bool) -> Result<Step, QueueFailure> {
        if !self.is_admin() {
            // Read responses ride C1 so they flush in the same vectored
            // send as their data; write responses share C2 with R2Ts.
            let is_write = self.pool.cmd(tag).cmd.is_write();
            {
                let car = if is_write {
                    &mut self.caravan2
                } else {
                    &mut self.caravan
                };
                if car.is_full() {
                    car.send_now = true;
                    return Ok(Step::Done);
                }
            }
            let (offset, left) = {
                let cmd = self.pool.cmd(tag);
                (cmd.offset, cmd.rsp_pdu_len as u32 - cmd.offset)
            };
            let car = if is_write {
                &mut self.caravan2
            } else {
                &mut self.caravan
            };
            car.push(Segment {
                tag,
                source: SegmentSource::RspPdu,
                offset,
                len: left,
            });
            car.own(tag);
            self.pool.cmd_mut(tag).offset += left;
            self.snd_cmd = None;
            metrics::RESPONSES_SENT.increment();
            return Ok(Step::Done);
        }

        let sock = &mut self.sock;
        let cmd = self.pool.cmd(tag);
        let buf = &cmd.rsp_pdu[cmd.offset as usize..cmd.rsp_pdu_len as usize];
        match write_step(sock, &[IoSlice::new(buf)])? {
            IoStep::Again => Ok(Step::Again),
            IoStep::Done(n) => {
                let cmd = self.pool.cmd_mut(tag);
                cmd.offset += n as u32;
                if cmd.offset < cmd.rsp_pdu_len as u32 {
                    return Ok(Step::Again);
                }
                cmd.data = None;
                self.snd_cmd = None;
                self.pool.put(tag);
                metrics::RESPONSES_SENT.increment();
                Ok(Step::Done)
            }
        }
    }

    /// Drain a caravan with one vectored send. The send buffer is
    /// checked for room first; a stall (or a would-block from the write
    /// itself) sets the no-space flag and the write-space wakeup resumes
    /// us. A short send trims the sent prefix and keeps the tail (owners
    /// are only released once every byte is out).
    fn flush_caravan(&mut self, second: bool) -> Result<FlushOutcome, QueueFailure> {
        let caravan_len = if second {
            self.caravan2.len()
        } else {
            self.caravan.len()
        };
        if sndbuf_space(&self.sock).is_some_and(|space| space < caravan_len) {
            self.no_space = true;
            metrics::CARAVAN_SEND_STALLS.increment();
            return Ok(FlushOutcome::NoSpace);
        }

        let sent = {
            let car = if second { &self.caravan2 } else { &self.caravan };
            let pool = &self.pool;
            let mut slices = Vec::with_capacity(car.segments().len());
            for seg in car.segments() {
                slices.push(IoSlice::new(segment_bytes(pool, seg)));
            }
            match write_step(&mut self.sock, &slices)? {
                IoStep::Again => {
                    self.no_space = true;
                    metrics::CARAVAN_SEND_STALLS.increment();
                    return Ok(FlushOutcome::NoSpace);
                }
                IoStep::Done(n) => n,
            }
        };

        metrics::CARAVAN_FLUSHES.increment();
        metrics::CARAVAN_FLUSHED_BYTES.add(sent as u64);
        debug!(queue = self.id, second, sent, "caravan flush");

        let car = if second {
            &mut self.caravan2
        } else {
            &mut self.caravan
        };
        car.consume(sent);
        if !car.is_empty() {
            warn!(
                queue = self.id,
                remaining = car.len(),
                "short caravan send, retaining tail"
            );
            return Ok(FlushOutcome::Partial);
        }

        for tag in car.finish() {
            self.pool.cmd_mut(tag).data = None;
            self.pool.put(tag);
        }
        Ok(FlushOutcome::Flushed)
    }
}
