//! End-to-end tests driving a live target over loopback with a
//! synchronous in-memory executor.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use caravan::{
    ConfigBuilder, Error, ExecRequest, Executor, QueueInstall, ShutdownHandle, TargetBuilder,
};
use protocol_nvme_tcp::{
    digest, CmdCapsule, DataHeader, IcReq, IcResp, NvmeCommand, PduHeader, PduType, R2t, RspPdu,
    SglDescriptor, CMD_PDU_SIZE, DATA_DIGEST_ENABLE, DATA_PDU_SIZE, DIGEST_SIZE, HDR_DIGEST_ENABLE,
    ICREQ_SIZE, ICRESP_SIZE, NVME_CMD_READ, NVME_CMD_WRITE, NVME_OPC_FABRICS, PFV_1_0,
    R2T_PDU_SIZE, RSP_PDU_SIZE,
};

/// Executor that serves reads from a constant pattern and records write
/// payloads.
struct TestExecutor {
    pattern: u8,
    writes: Mutex<Vec<Vec<u8>>>,
}

impl TestExecutor {
    fn new(pattern: u8) -> Arc<Self> {
        Arc::new(Self {
            pattern,
            writes: Mutex::new(Vec::new()),
        })
    }

    fn captured_writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }
}

impl Executor for TestExecutor {
    fn init_request(&self, _cmd: &NvmeCommand, _qid: u16) -> Result<(), u16> {
        Ok(())
    }

    fn execute(&self, mut req: ExecRequest) {
        let cmd = *req.command();
        match cmd.opcode {
            NVME_OPC_FABRICS => {
                // Tests encode qid in cdw10 and sq size in cdw11.
                req.install_queue(QueueInstall {
                    qid: cmd.cdw10 as u16,
                    sq_size: cmd.cdw11.max(1) as u16,
                    ctrl: 1,
                });
                req.complete(0);
            }
            NVME_CMD_READ => {
                let len = req.transfer_len() as usize;
                let pattern = vec![self.pattern; len];
                if let Some(data) = req.data_mut() {
                    data.write_at(0, &pattern);
                }
                req.complete(0);
            }
            NVME_CMD_WRITE => {
                if let Some(data) = req.data_mut() {
                    self.writes.lock().unwrap().push(data.to_vec());
                }
                req.complete(0);
            }
            _ => req.complete(0),
        }
    }
}

type Workers = Vec<JoinHandle<Result<(), Error>>>;

fn start(executor: Arc<TestExecutor>) -> (ShutdownHandle, Workers) {
    let config = ConfigBuilder::new()
        .workers(1)
        .pin_to_core(false)
        .max_queues(32)
        .build()
        .unwrap();
    TargetBuilder::new(config)
        .bind("127.0.0.1:0".parse().unwrap())
        .launch(executor)
        .unwrap()
}

fn stop(handle: ShutdownHandle, workers: Workers) {
    handle.shutdown();
    for h in workers {
        h.join().unwrap().unwrap();
    }
}

fn connect(handle: &ShutdownHandle) -> TcpStream {
    let sock = TcpStream::connect(handle.local_addr()).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    sock.set_nodelay(true).unwrap();
    sock
}

fn read_exact(sock: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    sock.read_exact(&mut buf).unwrap();
    buf
}

/// Perform the initial connection exchange with the given digest options.
fn handshake(sock: &mut TcpStream, digest_opts: u8) {
    let icreq = IcReq {
        pfv: PFV_1_0,
        hpda: 0,
        digest: digest_opts,
        maxr2t: 0,
    };
    let mut buf = [0u8; ICREQ_SIZE];
    icreq.encode(&mut buf);
    sock.write_all(&buf).unwrap();

    let reply = read_exact(sock, ICRESP_SIZE);
    let hdr = PduHeader::parse(&reply).unwrap();
    assert_eq!(hdr.pdu_type, PduType::Icresp as u8);
    assert_eq!(hdr.plen as usize, ICRESP_SIZE);
    let icresp = IcResp::parse(&reply).unwrap();
    assert_eq!(icresp.pfv, PFV_1_0);
    assert_eq!(icresp.cpda, 0);
    assert_eq!(icresp.maxdata, 0xffff);
    assert_eq!(icresp.digest, digest_opts);
}

/// Encode a command capsule, optionally with inline payload and digests.
fn cmd_pdu(cmd: &NvmeCommand, inline: Option<&[u8]>, hdgst: bool, ddgst: bool) -> Vec<u8> {
    let data_len = inline.map(|d| d.len()).unwrap_or(0) as u32;
    let mut buf = vec![0u8; CMD_PDU_SIZE + DIGEST_SIZE + data_len as usize + DIGEST_SIZE];
    let capsule = CmdCapsule { cmd: *cmd };
    let mut off = capsule.encode(data_len, hdgst, ddgst, &mut buf);
    if hdgst {
        let crc = digest::header_digest(&buf[..CMD_PDU_SIZE]);
        buf[off..off + DIGEST_SIZE].copy_from_slice(&crc.to_le_bytes());
        off += DIGEST_SIZE;
    }
    if let Some(payload) = inline {
        buf[off..off + payload.len()].copy_from_slice(payload);
        off += payload.len();
        if ddgst {
            let crc = digest::header_digest(payload);
            buf[off..off + DIGEST_SIZE].copy_from_slice(&crc.to_le_bytes());
            off += DIGEST_SIZE;
        }
    }
    buf.truncate(off);
    buf
}

/// Connect the queue as an I/O queue via a fabrics command.
fn install_io_queue(sock: &mut TcpStream, qid: u16, sq_size: u16) {
    let cmd = NvmeCommand {
        opcode: NVME_OPC_FABRICS,
        command_id: 0xc0,
        cdw10: qid as u32,
        cdw11: sq_size as u32,
        ..Default::default()
    };
    sock.write_all(&cmd_pdu(&cmd, None, false, false)).unwrap();

    let reply = read_exact(sock, RSP_PDU_SIZE);
    let rsp = RspPdu::parse(&reply).unwrap();
    assert_eq!(rsp.cqe.command_id, 0xc0);
    assert_eq!(rsp.cqe.status, 0);
}

fn assert_connection_closed(sock: &mut TcpStream) {
    let mut buf = [0u8; 16];
    match sock.read(&mut buf) {
        Ok(0) => {}
        Err(_) => {}
        Ok(n) => panic!("expected connection close, read {n} bytes"),
    }
}

#[test]
fn handshake_goes_live() {
    let executor = TestExecutor::new(0xA5);
    let (handle, workers) = start(executor);
    let mut sock = connect(&handle);
    handshake(&mut sock, 0);
    assert_eq!(handle.active_queues(), 1);
    drop(sock);
    stop(handle, workers);
}

#[test]
fn rejects_bad_pfv() {
    let executor = TestExecutor::new(0);
    let (handle, workers) = start(executor);
    let mut sock = connect(&handle);

    let icreq = IcReq {
        pfv: 99,
        hpda: 0,
        digest: 0,
        maxr2t: 0,
    };
    let mut buf = [0u8; ICREQ_SIZE];
    icreq.encode(&mut buf);
    sock.write_all(&buf).unwrap();

    assert_connection_closed(&mut sock);
    stop(handle, workers);
}

#[test]
fn small_read_coalesces_data_and_response() {
    let executor = TestExecutor::new(0xA5);
    let (handle, workers) = start(executor.clone());
    let mut sock = connect(&handle);
    handshake(&mut sock, 0);
    install_io_queue(&mut sock, 1, 8);

    let cmd = NvmeCommand {
        opcode: NVME_CMD_READ,
        command_id: 7,
        nsid: 1,
        sgl: SglDescriptor::transport(512),
        ..Default::default()
    };
    sock.write_all(&cmd_pdu(&cmd, None, false, false)).unwrap();

    // One c2h_data PDU, the payload, then the response, in order.
    let reply = read_exact(&mut sock, DATA_PDU_SIZE + 512 + RSP_PDU_SIZE);

    let data_hdr = PduHeader::parse(&reply).unwrap();
    assert_eq!(data_hdr.pdu_type, PduType::C2hData as u8);
    assert_eq!(data_hdr.plen as usize, DATA_PDU_SIZE + 512);
    let data = DataHeader::parse(&reply).unwrap();
    assert_eq!(data.command_id, 7);
    assert_eq!(data.data_offset, 0);
    assert_eq!(data.data_length, 512);

    let payload = &reply[DATA_PDU_SIZE..DATA_PDU_SIZE + 512];
    assert!(payload.iter().all(|&b| b == 0xA5));

    let rsp = RspPdu::parse(&reply[DATA_PDU_SIZE + 512..]).unwrap();
    assert_eq!(rsp.cqe.command_id, 7);
    assert_eq!(rsp.cqe.status, 0);

    stop(handle, workers);
}

#[test]
fn inline_write_responds_without_r2t() {
    let executor = TestExecutor::new(0);
    let (handle, workers) = start(executor.clone());
    let mut sock = connect(&handle);
    handshake(&mut sock, 0);
    install_io_queue(&mut sock, 1, 8);

    let payload = vec![0x5A; 512];
    let cmd = NvmeCommand {
        opcode: NVME_CMD_WRITE,
        command_id: 9,
        nsid: 1,
        sgl: SglDescriptor::inline(512),
        ..Default::default()
    };
    sock.write_all(&cmd_pdu(&cmd, Some(&payload), false, false))
        .unwrap();

    // A response and nothing else; no R2T precedes it.
    let reply = read_exact(&mut sock, RSP_PDU_SIZE);
    let hdr = PduHeader::parse(&reply).unwrap();
    assert_eq!(hdr.pdu_type, PduType::Rsp as u8);
    let rsp = RspPdu::parse(&reply).unwrap();
    assert_eq!(rsp.cqe.command_id, 9);
    assert_eq!(rsp.cqe.status, 0);

    assert_eq!(executor.captured_writes(), vec![payload]);
    stop(handle, workers);
}

#[test]
fn solicited_write_round_trip() {
    let executor = TestExecutor::new(0);
    let (handle, workers) = start(executor.clone());
    let mut sock = connect(&handle);
    handshake(&mut sock, 0);
    install_io_queue(&mut sock, 1, 8);

    let cmd = NvmeCommand {
        opcode: NVME_CMD_WRITE,
        command_id: 11,
        nsid: 1,
        sgl: SglDescriptor::transport(8192),
        ..Default::default()
    };
    sock.write_all(&cmd_pdu(&cmd, None, false, false)).unwrap();

    // The target solicits the whole payload with a single R2T.
    let reply = read_exact(&mut sock, R2T_PDU_SIZE);
    let hdr = PduHeader::parse(&reply).unwrap();
    assert_eq!(hdr.pdu_type, PduType::R2t as u8);
    let r2t = R2t::parse(&reply).unwrap();
    assert_eq!(r2t.command_id, 11);
    assert_eq!(r2t.r2t_offset, 0);
    assert_eq!(r2t.r2t_length, 8192);

    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    let data_hdr = DataHeader {
        command_id: 11,
        ttag: r2t.ttag,
        data_offset: 0,
        data_length: 8192,
    };
    let mut h2c = vec![0u8; DATA_PDU_SIZE];
    data_hdr.encode_h2c(false, false, &mut h2c);
    sock.write_all(&h2c).unwrap();
    sock.write_all(&payload).unwrap();

    let reply = read_exact(&mut sock, RSP_PDU_SIZE);
    let rsp = RspPdu::parse(&reply).unwrap();
    assert_eq!(rsp.cqe.command_id, 11);
    assert_eq!(rsp.cqe.status, 0);

    assert_eq!(executor.captured_writes(), vec![payload]);
    stop(handle, workers);
}

#[test]
fn header_digest_mismatch_is_fatal() {
    let executor = TestExecutor::new(0);
    let (handle, workers) = start(executor);
    let mut sock = connect(&handle);
    handshake(&mut sock, HDR_DIGEST_ENABLE);

    let cmd = NvmeCommand {
        opcode: NVME_CMD_READ,
        command_id: 3,
        nsid: 1,
        ..Default::default()
    };
    let mut pdu = cmd_pdu(&cmd, None, true, false);
    // Flip one bit of the trailing header digest.
    pdu[CMD_PDU_SIZE] ^= 0x01;
    sock.write_all(&pdu).unwrap();

    // No response; the queue enters its receive-error state and the
    // socket is shut down.
    assert_connection_closed(&mut sock);
    stop(handle, workers);
}

#[test]
fn header_digest_round_trip() {
    let executor = TestExecutor::new(0);
    let (handle, workers) = start(executor);
    let mut sock = connect(&handle);
    handshake(&mut sock, HDR_DIGEST_ENABLE);

    // Zero-length read on the admin queue: a bare response, carrying a
    // header digest.
    let cmd = NvmeCommand {
        opcode: NVME_CMD_READ,
        command_id: 5,
        nsid: 1,
        ..Default::default()
    };
    sock.write_all(&cmd_pdu(&cmd, None, true, false)).unwrap();

    let reply = read_exact(&mut sock, RSP_PDU_SIZE + DIGEST_SIZE);
    let hdr = PduHeader::parse(&reply).unwrap();
    assert_eq!(hdr.pdu_type, PduType::Rsp as u8);
    assert!(hdr.has_hdgst());
    assert_eq!(hdr.plen as usize, RSP_PDU_SIZE + DIGEST_SIZE);

    let crc = digest::header_digest(&reply[..RSP_PDU_SIZE]);
    let trailer = u32::from_le_bytes([
        reply[RSP_PDU_SIZE],
        reply[RSP_PDU_SIZE + 1],
        reply[RSP_PDU_SIZE + 2],
        reply[RSP_PDU_SIZE + 3],
    ]);
    assert_eq!(trailer, crc);

    let rsp = RspPdu::parse(&reply).unwrap();
    assert_eq!(rsp.cqe.command_id, 5);
    stop(handle, workers);
}

#[test]
fn data_digest_round_trip() {
    let executor = TestExecutor::new(0x3C);
    let (handle, workers) = start(executor.clone());
    let mut sock = connect(&handle);
    handshake(&mut sock, DATA_DIGEST_ENABLE);
    install_io_queue(&mut sock, 1, 8);

    // Inline write with a trailing data digest.
    let payload = vec![0x77; 512];
    let cmd = NvmeCommand {
        opcode: NVME_CMD_WRITE,
        command_id: 21,
        nsid: 1,
        sgl: SglDescriptor::inline(512),
        ..Default::default()
    };
    sock.write_all(&cmd_pdu(&cmd, Some(&payload), false, true))
        .unwrap();
    let reply = read_exact(&mut sock, RSP_PDU_SIZE);
    let rsp = RspPdu::parse(&reply).unwrap();
    assert_eq!(rsp.cqe.status, 0);
    assert_eq!(executor.captured_writes(), vec![payload]);

    // Read: data PDU, payload, digest trailer, response.
    let cmd = NvmeCommand {
        opcode: NVME_CMD_READ,
        command_id: 22,
        nsid: 1,
        sgl: SglDescriptor::transport(512),
        ..Default::default()
    };
    sock.write_all(&cmd_pdu(&cmd, None, false, false)).unwrap();

    let reply = read_exact(&mut sock, DATA_PDU_SIZE + 512 + DIGEST_SIZE + RSP_PDU_SIZE);
    let hdr = PduHeader::parse(&reply).unwrap();
    assert_eq!(hdr.pdu_type, PduType::C2hData as u8);
    assert!(hdr.has_ddgst());
    assert_eq!(hdr.plen as usize, DATA_PDU_SIZE + 512 + DIGEST_SIZE);

    let payload = &reply[DATA_PDU_SIZE..DATA_PDU_SIZE + 512];
    assert!(payload.iter().all(|&b| b == 0x3C));

    let trailer = u32::from_le_bytes([
        reply[DATA_PDU_SIZE + 512],
        reply[DATA_PDU_SIZE + 513],
        reply[DATA_PDU_SIZE + 514],
        reply[DATA_PDU_SIZE + 515],
    ]);
    assert_eq!(trailer, digest::header_digest(payload));

    let rsp = RspPdu::parse(&reply[DATA_PDU_SIZE + 512 + DIGEST_SIZE..]).unwrap();
    assert_eq!(rsp.cqe.command_id, 22);
    stop(handle, workers);
}

#[test]
fn pipelined_reads_arrive_in_order() {
    let executor = TestExecutor::new(0xEE);
    let (handle, workers) = start(executor);
    let mut sock = connect(&handle);
    handshake(&mut sock, 0);
    install_io_queue(&mut sock, 1, 8);

    let mut batch = Vec::new();
    for id in 0..4u16 {
        let cmd = NvmeCommand {
            opcode: NVME_CMD_READ,
            command_id: id,
            nsid: 1,
            sgl: SglDescriptor::transport(64),
            ..Default::default()
        };
        batch.extend_from_slice(&cmd_pdu(&cmd, None, false, false));
    }
    sock.write_all(&batch).unwrap();

    let per_cmd = DATA_PDU_SIZE + 64 + RSP_PDU_SIZE;
    let reply = read_exact(&mut sock, per_cmd * 4);
    for id in 0..4u16 {
        let chunk = &reply[per_cmd * id as usize..per_cmd * (id + 1) as usize];
        let data = DataHeader::parse(chunk).unwrap();
        assert_eq!(data.command_id, id);
        assert_eq!(data.data_length, 64);
        assert!(chunk[DATA_PDU_SIZE..DATA_PDU_SIZE + 64]
            .iter()
            .all(|&b| b == 0xEE));
        let rsp = RspPdu::parse(&chunk[DATA_PDU_SIZE + 64..]).unwrap();
        assert_eq!(rsp.cqe.command_id, id);
        assert_eq!(rsp.cqe.status, 0);
    }
    stop(handle, workers);
}

#[test]
fn unknown_pdu_type_tears_down() {
    let executor = TestExecutor::new(0);
    let (handle, workers) = start(executor);
    let mut sock = connect(&handle);
    handshake(&mut sock, 0);

    let bogus = PduHeader {
        pdu_type: 0x42,
        flags: 0,
        hlen: 24,
        pdo: 0,
        plen: 24,
    };
    let mut buf = [0u8; 24];
    bogus.encode(&mut buf);
    sock.write_all(&buf).unwrap();

    assert_connection_closed(&mut sock);
    stop(handle, workers);
}

#[test]
fn short_header_is_retained_across_reads() {
    let executor = TestExecutor::new(0);
    let (handle, workers) = start(executor);
    let mut sock = connect(&handle);
    handshake(&mut sock, 0);

    let cmd = NvmeCommand {
        opcode: NVME_CMD_READ,
        command_id: 13,
        nsid: 1,
        ..Default::default()
    };
    let pdu = cmd_pdu(&cmd, None, false, false);

    // Deliver the capsule in two pieces with a pause between them.
    sock.write_all(&pdu[..30]).unwrap();
    sock.flush().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    sock.write_all(&pdu[30..]).unwrap();

    let reply = read_exact(&mut sock, RSP_PDU_SIZE);
    let rsp = RspPdu::parse(&reply).unwrap();
    assert_eq!(rsp.cqe.command_id, 13);
    assert_eq!(rsp.cqe.status, 0);
    stop(handle, workers);
}

#[test]
fn delete_ctrl_shuts_owned_queues() {
    let executor = TestExecutor::new(0);
    let (handle, workers) = start(executor);
    let mut sock = connect(&handle);
    handshake(&mut sock, 0);
    install_io_queue(&mut sock, 1, 8);

    handle.delete_ctrl(1);
    assert_connection_closed(&mut sock);
    stop(handle, workers);
}
