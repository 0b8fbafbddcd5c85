//! NVMe/TCP PDU framing codec.
//!
//! This crate provides parsing and encoding for the PDU types an
//! NVMe-over-TCP target speaks: the initial connection exchange
//! (`icreq`/`icresp`), command capsules, responses, data PDUs in both
//! directions, and ready-to-transfer solicitations. It also carries the
//! embedded NVMe command/completion layouts and the CRC32C digest
//! helpers used for the optional header and data digest trailers.
//!
//! All multi-byte integers on the wire are little-endian. Parsing and
//! encoding operate on plain byte slices; this crate performs no I/O.
//!
//! # Example
//!
//! ```
//! use protocol_nvme_tcp::{IcResp, PduHeader, PduType, PFV_1_0};
//!
//! let icresp = IcResp {
//!     pfv: PFV_1_0,
//!     cpda: 0,
//!     digest: 0,
//!     maxdata: 0xffff,
//! };
//! let mut buf = [0u8; 128];
//! let len = icresp.encode(&mut buf);
//! assert_eq!(len, 128);
//!
//! let hdr = PduHeader::parse(&buf).unwrap();
//! assert_eq!(hdr.pdu_type, PduType::Icresp as u8);
//! ```

pub mod digest;
mod error;
mod nvme;
mod pdu;

pub use error::ParseError;
pub use nvme::{
    NvmeCommand, NvmeCompletion, SglDescriptor, NVME_CMD_FLUSH, NVME_CMD_READ, NVME_CMD_WRITE,
    NVME_OPC_FABRICS, NVME_SC_DNR, NVME_SC_INTERNAL, NVME_SC_INVALID_FIELD,
    NVME_SC_SGL_INVALID_OFFSET, NVME_SC_SUCCESS, SGL_DESC_INLINE,
};
pub use pdu::{
    CmdCapsule, DataHeader, IcReq, IcResp, PduHeader, PduType, R2t, RspPdu, CMD_PDU_SIZE,
    DATA_DIGEST_ENABLE, DATA_PDU_SIZE, DIGEST_SIZE, FLAG_DATA_LAST, FLAG_DDGST, FLAG_HDGST,
    HDR_DIGEST_ENABLE, HEADER_SIZE, ICREQ_SIZE, ICRESP_SIZE, PFV_1_0, R2T_PDU_SIZE, RSP_PDU_SIZE,
};
