//! Error types for NVMe/TCP PDU parsing.

/// Error type for PDU parsing operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Need more data to complete parsing.
    /// This is not a fatal error - the caller should buffer more data and retry.
    #[error("incomplete data")]
    Incomplete,

    /// Unknown PDU type byte.
    #[error("unknown pdu type: {0:#04x}")]
    UnknownType(u8),

    /// Header length field does not match the fixed size of the PDU type.
    #[error("pdu type {pdu_type:#04x} bad hlen {hlen}")]
    BadHeaderLength { pdu_type: u8, hlen: u8 },

    /// Total PDU length field is inconsistent with the PDU type.
    #[error("pdu type {pdu_type:#04x} bad plen {plen}")]
    BadPduLength { pdu_type: u8, plen: u32 },
}
