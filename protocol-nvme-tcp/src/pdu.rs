//! NVMe/TCP PDU headers and bodies.
//!
//! Every PDU begins with a fixed 8-byte common header:
//!
//! ```text
//! Byte/     0       |       1       |       2       |       3       |
//!   +---------------+---------------+---------------+---------------+
//!  0| Type          | Flags         | HLEN          | PDO           |
//!   +---------------+---------------+---------------+---------------+
//!  4| PLEN (total PDU length, including digests)                    |
//!   +---------------+---------------+---------------+---------------+
//! ```
//!
//! `PLEN` counts the header, an optional 4-byte header digest, the
//! payload, and an optional 4-byte data digest.

use crate::error::ParseError;
use crate::nvme::{NvmeCommand, NvmeCompletion};

/// Size of the common PDU header.
pub const HEADER_SIZE: usize = 8;

/// Size of a CRC32C digest trailer.
pub const DIGEST_SIZE: usize = 4;

/// Total size of an `icreq` PDU, header included.
pub const ICREQ_SIZE: usize = 128;

/// Total size of an `icresp` PDU, header included.
pub const ICRESP_SIZE: usize = 128;

/// Size of a command capsule PDU: header plus the 64-byte NVMe command.
pub const CMD_PDU_SIZE: usize = 72;

/// Size of a response PDU: header plus the 16-byte completion.
pub const RSP_PDU_SIZE: usize = 24;

/// Size of a data PDU header (`c2h_data` / `h2c_data`), payload excluded.
pub const DATA_PDU_SIZE: usize = 24;

/// Size of an `r2t` PDU.
pub const R2T_PDU_SIZE: usize = 24;

/// Protocol framing version 1.0.
pub const PFV_1_0: u16 = 1;

/// `icreq`/`icresp` digest option bit: enable header digest.
pub const HDR_DIGEST_ENABLE: u8 = 1 << 0;

/// `icreq`/`icresp` digest option bit: enable data digest.
pub const DATA_DIGEST_ENABLE: u8 = 1 << 1;

/// Header flag: a header digest trailer follows the header.
pub const FLAG_HDGST: u8 = 1 << 0;

/// Header flag: a data digest trailer follows the payload.
pub const FLAG_DDGST: u8 = 1 << 1;

/// Header flag: this data PDU is the last for the command.
pub const FLAG_DATA_LAST: u8 = 1 << 2;

/// PDU type bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    Icreq = 0x00,
    Icresp = 0x01,
    H2cTerm = 0x02,
    C2hTerm = 0x03,
    Cmd = 0x04,
    Rsp = 0x05,
    H2cData = 0x06,
    C2hData = 0x07,
    R2t = 0x09,
}

impl PduType {
    /// Try to convert a byte to a PDU type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(PduType::Icreq),
            0x01 => Some(PduType::Icresp),
            0x02 => Some(PduType::H2cTerm),
            0x03 => Some(PduType::C2hTerm),
            0x04 => Some(PduType::Cmd),
            0x05 => Some(PduType::Rsp),
            0x06 => Some(PduType::H2cData),
            0x07 => Some(PduType::C2hData),
            0x09 => Some(PduType::R2t),
            _ => None,
        }
    }
}

/// Common PDU header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    /// PDU type byte (kept raw so unknown types surface as errors at
    /// dispatch, not at parse).
    pub pdu_type: u8,
    /// PDU flags.
    pub flags: u8,
    /// Header length in bytes.
    pub hlen: u8,
    /// Payload data offset from the start of the PDU, 0 if no payload.
    pub pdo: u8,
    /// Total PDU length, digests included.
    pub plen: u32,
}

impl PduHeader {
    /// Parse a common header from a byte buffer.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < HEADER_SIZE {
            return Err(ParseError::Incomplete);
        }
        Ok(Self {
            pdu_type: data[0],
            flags: data[1],
            hlen: data[2],
            pdo: data[3],
            plen: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        })
    }

    /// Encode the header into a byte buffer. Returns HEADER_SIZE.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = self.pdu_type;
        buf[1] = self.flags;
        buf[2] = self.hlen;
        buf[3] = self.pdo;
        buf[4..8].copy_from_slice(&self.plen.to_le_bytes());
        HEADER_SIZE
    }

    /// Whether the header digest flag is set.
    pub fn has_hdgst(&self) -> bool {
        self.flags & FLAG_HDGST != 0
    }

    /// Whether the data digest flag is set.
    pub fn has_ddgst(&self) -> bool {
        self.flags & FLAG_DDGST != 0
    }
}

/// Initial connection request, sent by the initiator as the first PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcReq {
    /// Protocol framing version.
    pub pfv: u16,
    /// Host PDU data alignment. Only 0 is supported.
    pub hpda: u8,
    /// Digest option bits.
    pub digest: u8,
    /// Maximum number of outstanding R2Ts per command, 0-based.
    pub maxr2t: u32,
}

impl IcReq {
    /// Parse an `icreq` from a full 128-byte PDU buffer.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < ICREQ_SIZE {
            return Err(ParseError::Incomplete);
        }
        Ok(Self {
            pfv: u16::from_le_bytes([data[8], data[9]]),
            hpda: data[10],
            digest: data[11],
            maxr2t: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
        })
    }

    /// Encode a full 128-byte `icreq` PDU. Returns ICREQ_SIZE.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[..ICREQ_SIZE].fill(0);
        PduHeader {
            pdu_type: PduType::Icreq as u8,
            flags: 0,
            hlen: ICREQ_SIZE as u8,
            pdo: 0,
            plen: ICREQ_SIZE as u32,
        }
        .encode(buf);
        buf[8..10].copy_from_slice(&self.pfv.to_le_bytes());
        buf[10] = self.hpda;
        buf[11] = self.digest;
        buf[12..16].copy_from_slice(&self.maxr2t.to_le_bytes());
        ICREQ_SIZE
    }
}

/// Initial connection response, sent by the target to complete the
/// connection exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcResp {
    /// Protocol framing version.
    pub pfv: u16,
    /// Controller PDU data alignment. This target always reports 0.
    pub cpda: u8,
    /// Digest option bits echoing the negotiated options.
    pub digest: u8,
    /// Maximum h2c data PDU payload the target accepts.
    pub maxdata: u32,
}

impl IcResp {
    /// Parse an `icresp` from a full 128-byte PDU buffer.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < ICRESP_SIZE {
            return Err(ParseError::Incomplete);
        }
        Ok(Self {
            pfv: u16::from_le_bytes([data[8], data[9]]),
            cpda: data[10],
            digest: data[11],
            maxdata: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
        })
    }

    /// Encode a full 128-byte `icresp` PDU. Returns ICRESP_SIZE.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[..ICRESP_SIZE].fill(0);
        PduHeader {
            pdu_type: PduType::Icresp as u8,
            flags: 0,
            hlen: ICRESP_SIZE as u8,
            pdo: 0,
            plen: ICRESP_SIZE as u32,
        }
        .encode(buf);
        buf[8..10].copy_from_slice(&self.pfv.to_le_bytes());
        buf[10] = self.cpda;
        buf[11] = self.digest;
        buf[12..16].copy_from_slice(&self.maxdata.to_le_bytes());
        ICRESP_SIZE
    }
}

/// Command capsule: the common header followed by a 64-byte NVMe command,
/// optionally followed by in-capsule data.
#[derive(Debug, Clone, Copy)]
pub struct CmdCapsule {
    pub cmd: NvmeCommand,
}

impl CmdCapsule {
    /// Parse the embedded command from a capsule PDU buffer.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < CMD_PDU_SIZE {
            return Err(ParseError::Incomplete);
        }
        Ok(Self {
            cmd: NvmeCommand::parse(&data[HEADER_SIZE..CMD_PDU_SIZE])?,
        })
    }

    /// Encode a command capsule header plus command. The caller appends
    /// any in-capsule data; `data_len` and the digest lengths size `plen`.
    pub fn encode(&self, data_len: u32, hdgst: bool, ddgst: bool, buf: &mut [u8]) -> usize {
        let hdgst_len = if hdgst { DIGEST_SIZE as u32 } else { 0 };
        let ddgst_len = if ddgst && data_len > 0 {
            DIGEST_SIZE as u32
        } else {
            0
        };
        let mut flags = 0;
        if hdgst {
            flags |= FLAG_HDGST;
        }
        if ddgst && data_len > 0 {
            flags |= FLAG_DDGST;
        }
        PduHeader {
            pdu_type: PduType::Cmd as u8,
            flags,
            hlen: CMD_PDU_SIZE as u8,
            pdo: if data_len > 0 {
                (CMD_PDU_SIZE as u32 + hdgst_len) as u8
            } else {
                0
            },
            plen: CMD_PDU_SIZE as u32 + hdgst_len + data_len + ddgst_len,
        }
        .encode(buf);
        self.cmd.encode(&mut buf[HEADER_SIZE..CMD_PDU_SIZE]);
        CMD_PDU_SIZE
    }
}

/// Response PDU: the common header followed by a 16-byte completion.
#[derive(Debug, Clone, Copy)]
pub struct RspPdu {
    pub cqe: NvmeCompletion,
}

impl RspPdu {
    /// Parse a response PDU.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < RSP_PDU_SIZE {
            return Err(ParseError::Incomplete);
        }
        Ok(Self {
            cqe: NvmeCompletion::parse(&data[HEADER_SIZE..RSP_PDU_SIZE])?,
        })
    }

    /// Encode a response PDU header plus completion. The caller appends
    /// the header digest when `hdgst` is set. Returns RSP_PDU_SIZE.
    pub fn encode(&self, hdgst: bool, buf: &mut [u8]) -> usize {
        let hdgst_len = if hdgst { DIGEST_SIZE as u32 } else { 0 };
        PduHeader {
            pdu_type: PduType::Rsp as u8,
            flags: if hdgst { FLAG_HDGST } else { 0 },
            hlen: RSP_PDU_SIZE as u8,
            pdo: 0,
            plen: RSP_PDU_SIZE as u32 + hdgst_len,
        }
        .encode(buf);
        self.cqe.encode(&mut buf[HEADER_SIZE..RSP_PDU_SIZE]);
        RSP_PDU_SIZE
    }
}

/// Data PDU header, shared by `h2c_data` and `c2h_data`. The payload
/// follows the header (and optional header digest) on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Command identifier this data belongs to.
    pub command_id: u16,
    /// Transfer tag: the target-side slot index for solicited data.
    pub ttag: u16,
    /// Byte offset of this payload within the command's data buffer.
    pub data_offset: u32,
    /// Payload length carried by this PDU.
    pub data_length: u32,
}

impl DataHeader {
    /// Parse a data PDU header.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < DATA_PDU_SIZE {
            return Err(ParseError::Incomplete);
        }
        Ok(Self {
            command_id: u16::from_le_bytes([data[8], data[9]]),
            ttag: u16::from_le_bytes([data[10], data[11]]),
            data_offset: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            data_length: u32::from_le_bytes([data[16], data[17], data[18], data[19]]),
        })
    }

    /// Encode a `c2h_data` PDU header for a transfer of `data_length`
    /// bytes. `plen` covers the header, digests, and the payload the
    /// caller emits after the header. Returns DATA_PDU_SIZE.
    pub fn encode_c2h(&self, hdgst: bool, ddgst: bool, buf: &mut [u8]) -> usize {
        let hdgst_len = if hdgst { DIGEST_SIZE as u32 } else { 0 };
        let ddgst_len = if ddgst { DIGEST_SIZE as u32 } else { 0 };
        let mut flags = FLAG_DATA_LAST;
        if hdgst {
            flags |= FLAG_HDGST;
        }
        if ddgst {
            flags |= FLAG_DDGST;
        }
        PduHeader {
            pdu_type: PduType::C2hData as u8,
            flags,
            hlen: DATA_PDU_SIZE as u8,
            pdo: (DATA_PDU_SIZE as u32 + hdgst_len) as u8,
            plen: DATA_PDU_SIZE as u32 + hdgst_len + self.data_length + ddgst_len,
        }
        .encode(buf);
        self.encode_body(buf);
        DATA_PDU_SIZE
    }

    /// Encode an `h2c_data` PDU header (initiator side; used by tests).
    pub fn encode_h2c(&self, hdgst: bool, ddgst: bool, buf: &mut [u8]) -> usize {
        let hdgst_len = if hdgst { DIGEST_SIZE as u32 } else { 0 };
        let ddgst_len = if ddgst { DIGEST_SIZE as u32 } else { 0 };
        let mut flags = FLAG_DATA_LAST;
        if hdgst {
            flags |= FLAG_HDGST;
        }
        if ddgst {
            flags |= FLAG_DDGST;
        }
        PduHeader {
            pdu_type: PduType::H2cData as u8,
            flags,
            hlen: DATA_PDU_SIZE as u8,
            pdo: (DATA_PDU_SIZE as u32 + hdgst_len) as u8,
            plen: DATA_PDU_SIZE as u32 + hdgst_len + self.data_length + ddgst_len,
        }
        .encode(buf);
        self.encode_body(buf);
        DATA_PDU_SIZE
    }

    fn encode_body(&self, buf: &mut [u8]) {
        buf[8..10].copy_from_slice(&self.command_id.to_le_bytes());
        buf[10..12].copy_from_slice(&self.ttag.to_le_bytes());
        buf[12..16].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.data_length.to_le_bytes());
        buf[20..24].fill(0);
    }
}

/// Ready-to-transfer PDU, soliciting write payload from the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct R2t {
    /// Command identifier this solicitation belongs to.
    pub command_id: u16,
    /// Transfer tag the initiator must echo in the solicited `h2c_data`.
    pub ttag: u16,
    /// Byte offset the solicited data must start at.
    pub r2t_offset: u32,
    /// Number of bytes solicited.
    pub r2t_length: u32,
}

impl R2t {
    /// Parse an `r2t` PDU.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < R2T_PDU_SIZE {
            return Err(ParseError::Incomplete);
        }
        Ok(Self {
            command_id: u16::from_le_bytes([data[8], data[9]]),
            ttag: u16::from_le_bytes([data[10], data[11]]),
            r2t_offset: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            r2t_length: u32::from_le_bytes([data[16], data[17], data[18], data[19]]),
        })
    }

    /// Encode an `r2t` PDU header. Returns R2T_PDU_SIZE.
    pub fn encode(&self, hdgst: bool, buf: &mut [u8]) -> usize {
        let hdgst_len = if hdgst { DIGEST_SIZE as u32 } else { 0 };
        PduHeader {
            pdu_type: PduType::R2t as u8,
            flags: if hdgst { FLAG_HDGST } else { 0 },
            hlen: R2T_PDU_SIZE as u8,
            pdo: 0,
            plen: R2T_PDU_SIZE as u32 + hdgst_len,
        }
        .encode(buf);
        buf[8..10].copy_from_slice(&self.command_id.to_le_bytes());
        buf[10..12].copy_from_slice(&self.ttag.to_le_bytes());
        buf[12..16].copy_from_slice(&self.r2t_offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.r2t_length.to_le_bytes());
        buf[20..24].fill(0);
        R2T_PDU_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let hdr = PduHeader {
            pdu_type: PduType::C2hData as u8,
            flags: FLAG_DATA_LAST | FLAG_HDGST,
            hlen: 24,
            pdo: 28,
            plen: 540,
        };
        let mut buf = [0u8; 8];
        hdr.encode(&mut buf);
        let parsed = PduHeader::parse(&buf).unwrap();
        assert_eq!(hdr, parsed);
        assert!(parsed.has_hdgst());
        assert!(!parsed.has_ddgst());
    }

    #[test]
    fn header_incomplete() {
        assert_eq!(PduHeader::parse(&[0u8; 4]), Err(ParseError::Incomplete));
    }

    #[test]
    fn icreq_roundtrip() {
        let req = IcReq {
            pfv: PFV_1_0,
            hpda: 0,
            digest: HDR_DIGEST_ENABLE | DATA_DIGEST_ENABLE,
            maxr2t: 0,
        };
        let mut buf = [0u8; ICREQ_SIZE];
        assert_eq!(req.encode(&mut buf), ICREQ_SIZE);

        let hdr = PduHeader::parse(&buf).unwrap();
        assert_eq!(hdr.pdu_type, PduType::Icreq as u8);
        assert_eq!(hdr.hlen as usize, ICREQ_SIZE);
        assert_eq!(hdr.plen as usize, ICREQ_SIZE);

        let parsed = IcReq::parse(&buf).unwrap();
        assert_eq!(req, parsed);
    }

    #[test]
    fn icresp_roundtrip() {
        let rsp = IcResp {
            pfv: PFV_1_0,
            cpda: 0,
            digest: 0,
            maxdata: 0xffff,
        };
        let mut buf = [0u8; ICRESP_SIZE];
        rsp.encode(&mut buf);
        let parsed = IcResp::parse(&buf).unwrap();
        assert_eq!(rsp, parsed);
    }

    #[test]
    fn c2h_data_header_lengths() {
        let data = DataHeader {
            command_id: 7,
            ttag: 0,
            data_offset: 0,
            data_length: 512,
        };
        let mut buf = [0u8; DATA_PDU_SIZE];
        data.encode_c2h(false, false, &mut buf);
        let hdr = PduHeader::parse(&buf).unwrap();
        assert_eq!(hdr.plen, 24 + 512);
        assert_eq!(hdr.pdo, 24);
        assert_eq!(hdr.flags & FLAG_DATA_LAST, FLAG_DATA_LAST);

        // Digests widen plen and shift the payload offset.
        data.encode_c2h(true, true, &mut buf);
        let hdr = PduHeader::parse(&buf).unwrap();
        assert_eq!(hdr.plen, 24 + 4 + 512 + 4);
        assert_eq!(hdr.pdo, 28);
    }

    #[test]
    fn data_header_roundtrip() {
        let data = DataHeader {
            command_id: 3,
            ttag: 5,
            data_offset: 4096,
            data_length: 8192,
        };
        let mut buf = [0u8; DATA_PDU_SIZE];
        data.encode_h2c(false, false, &mut buf);
        assert_eq!(DataHeader::parse(&buf).unwrap(), data);
    }

    #[test]
    fn r2t_roundtrip() {
        let r2t = R2t {
            command_id: 11,
            ttag: 4,
            r2t_offset: 0,
            r2t_length: 8192,
        };
        let mut buf = [0u8; R2T_PDU_SIZE];
        r2t.encode(false, &mut buf);
        let hdr = PduHeader::parse(&buf).unwrap();
        assert_eq!(hdr.pdu_type, PduType::R2t as u8);
        assert_eq!(hdr.plen as usize, R2T_PDU_SIZE);
        assert_eq!(R2t::parse(&buf).unwrap(), r2t);
    }

    #[test]
    fn pdu_type_roundtrip() {
        for val in 0..=0xFF {
            if let Some(t) = PduType::from_u8(val) {
                assert_eq!(t as u8, val);
            }
        }
        assert_eq!(PduType::from_u8(0x08), None);
        assert_eq!(PduType::from_u8(0xFF), None);
    }
}
