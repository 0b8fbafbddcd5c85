//! Embedded NVMe command and completion layouts.
//!
//! A command capsule carries a 64-byte NVMe submission queue entry; a
//! response PDU carries a 16-byte completion queue entry. Both map
//! directly to NVMe command dwords with all fields little-endian.

use crate::error::ParseError;

/// NVM command set opcodes.
pub const NVME_CMD_FLUSH: u8 = 0x00;
pub const NVME_CMD_WRITE: u8 = 0x01;
pub const NVME_CMD_READ: u8 = 0x02;

/// Fabrics command opcode.
pub const NVME_OPC_FABRICS: u8 = 0x7f;

/// Status codes.
pub const NVME_SC_SUCCESS: u16 = 0x0000;
pub const NVME_SC_INVALID_FIELD: u16 = 0x0002;
pub const NVME_SC_INTERNAL: u16 = 0x0006;
pub const NVME_SC_SGL_INVALID_OFFSET: u16 = 0x0016;

/// Do-not-retry status bit.
pub const NVME_SC_DNR: u16 = 0x4000;

/// SGL descriptor identifier for in-capsule (inline) data: data block
/// descriptor with offset addressing.
pub const SGL_DESC_INLINE: u8 = 0x51;

/// The 16-byte SGL data pointer embedded in a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SglDescriptor {
    /// Address, or offset for in-capsule data.
    pub addr: u64,
    /// Transfer length in bytes.
    pub length: u32,
    /// Descriptor type and subtype identifier.
    pub desc_type: u8,
}

impl SglDescriptor {
    /// An in-capsule data descriptor for `length` bytes at offset 0.
    pub fn inline(length: u32) -> Self {
        Self {
            addr: 0,
            length,
            desc_type: SGL_DESC_INLINE,
        }
    }

    /// A transport data block descriptor for `length` bytes; the payload
    /// moves in data PDUs rather than in the capsule.
    pub fn transport(length: u32) -> Self {
        Self {
            addr: 0,
            length,
            desc_type: 0x01,
        }
    }

    /// Whether this descriptor indicates in-capsule data.
    pub fn is_inline(&self) -> bool {
        self.desc_type == SGL_DESC_INLINE
    }

    fn parse(data: &[u8]) -> Self {
        Self {
            addr: u64::from_le_bytes([
                data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
            ]),
            length: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            desc_type: data[15],
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.addr.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..15].fill(0);
        buf[15] = self.desc_type;
    }
}

/// A 64-byte NVMe command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NvmeCommand {
    /// Command opcode.
    pub opcode: u8,
    /// Command flags. Capsule commands use SGL addressing (`1 << 6`).
    pub flags: u8,
    /// Command identifier, echoed in the completion.
    pub command_id: u16,
    /// Namespace ID.
    pub nsid: u32,
    /// Command dwords 2-3.
    pub cdw2: u32,
    pub cdw3: u32,
    /// Metadata pointer.
    pub metadata: u64,
    /// Data pointer: a single SGL descriptor.
    pub sgl: SglDescriptor,
    /// Command dwords 10-15.
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl NvmeCommand {
    /// Parse a command from its 64-byte wire form.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < 64 {
            return Err(ParseError::Incomplete);
        }
        Ok(Self {
            opcode: data[0],
            flags: data[1],
            command_id: u16::from_le_bytes([data[2], data[3]]),
            nsid: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            cdw2: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            cdw3: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            metadata: u64::from_le_bytes([
                data[16], data[17], data[18], data[19], data[20], data[21], data[22], data[23],
            ]),
            sgl: SglDescriptor::parse(&data[24..40]),
            cdw10: u32::from_le_bytes([data[40], data[41], data[42], data[43]]),
            cdw11: u32::from_le_bytes([data[44], data[45], data[46], data[47]]),
            cdw12: u32::from_le_bytes([data[48], data[49], data[50], data[51]]),
            cdw13: u32::from_le_bytes([data[52], data[53], data[54], data[55]]),
            cdw14: u32::from_le_bytes([data[56], data[57], data[58], data[59]]),
            cdw15: u32::from_le_bytes([data[60], data[61], data[62], data[63]]),
        })
    }

    /// Encode the command into its 64-byte wire form. Returns 64.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = self.opcode;
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.command_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.nsid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.cdw2.to_le_bytes());
        buf[12..16].copy_from_slice(&self.cdw3.to_le_bytes());
        buf[16..24].copy_from_slice(&self.metadata.to_le_bytes());
        self.sgl.encode(&mut buf[24..40]);
        buf[40..44].copy_from_slice(&self.cdw10.to_le_bytes());
        buf[44..48].copy_from_slice(&self.cdw11.to_le_bytes());
        buf[48..52].copy_from_slice(&self.cdw12.to_le_bytes());
        buf[52..56].copy_from_slice(&self.cdw13.to_le_bytes());
        buf[56..60].copy_from_slice(&self.cdw14.to_le_bytes());
        buf[60..64].copy_from_slice(&self.cdw15.to_le_bytes());
        64
    }

    /// Whether this command transfers data host-to-controller. Odd
    /// opcodes write; this includes fabrics commands, whose payload is
    /// carried in-capsule.
    pub fn is_write(&self) -> bool {
        self.opcode & 1 == 1
    }
}

/// A 16-byte NVMe completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NvmeCompletion {
    /// Command-specific result.
    pub result: u32,
    /// Submission queue head pointer.
    pub sq_head: u16,
    /// Submission queue identifier.
    pub sq_id: u16,
    /// Command identifier echoed from the command.
    pub command_id: u16,
    /// Status field; bit 0 is the phase tag, unused on fabrics.
    pub status: u16,
}

impl NvmeCompletion {
    /// Parse a completion from its 16-byte wire form.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < 16 {
            return Err(ParseError::Incomplete);
        }
        Ok(Self {
            result: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            sq_head: u16::from_le_bytes([data[8], data[9]]),
            sq_id: u16::from_le_bytes([data[10], data[11]]),
            command_id: u16::from_le_bytes([data[12], data[13]]),
            status: u16::from_le_bytes([data[14], data[15]]),
        })
    }

    /// Encode the completion into its 16-byte wire form. Returns 16.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0..4].copy_from_slice(&self.result.to_le_bytes());
        buf[4..8].fill(0);
        buf[8..10].copy_from_slice(&self.sq_head.to_le_bytes());
        buf[10..12].copy_from_slice(&self.sq_id.to_le_bytes());
        buf[12..14].copy_from_slice(&self.command_id.to_le_bytes());
        buf[14..16].copy_from_slice(&self.status.to_le_bytes());
        16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrip() {
        let cmd = NvmeCommand {
            opcode: NVME_CMD_READ,
            flags: 1 << 6,
            command_id: 0x1234,
            nsid: 1,
            sgl: SglDescriptor::transport(512),
            cdw10: 0x1000,
            cdw12: 0, // one block
            ..Default::default()
        };
        let mut buf = [0u8; 64];
        assert_eq!(cmd.encode(&mut buf), 64);
        let parsed = NvmeCommand::parse(&buf).unwrap();
        assert_eq!(cmd, parsed);
    }

    #[test]
    fn completion_roundtrip() {
        let cqe = NvmeCompletion {
            result: 7,
            sq_head: 3,
            sq_id: 1,
            command_id: 0x1234,
            status: NVME_SC_INVALID_FIELD | NVME_SC_DNR,
        };
        let mut buf = [0u8; 16];
        cqe.encode(&mut buf);
        assert_eq!(NvmeCompletion::parse(&buf).unwrap(), cqe);
    }

    #[test]
    fn write_classification() {
        let mut cmd = NvmeCommand {
            opcode: NVME_CMD_WRITE,
            ..Default::default()
        };
        assert!(cmd.is_write());
        cmd.opcode = NVME_CMD_READ;
        assert!(!cmd.is_write());
        cmd.opcode = NVME_CMD_FLUSH;
        assert!(!cmd.is_write());
        // Fabrics commands carry their payload in-capsule.
        cmd.opcode = NVME_OPC_FABRICS;
        assert!(cmd.is_write());
    }

    #[test]
    fn inline_descriptor() {
        let sgl = SglDescriptor::inline(512);
        assert!(sgl.is_inline());
        assert!(!SglDescriptor::transport(512).is_inline());
    }
}
