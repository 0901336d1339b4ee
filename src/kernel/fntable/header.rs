//! Module header layout
//!
//! The header sits inside a module's code section and is little-endian like
//! the rest of the target's data. Function pointers are word addresses, as
//! the target's compiler emits them.
//!
//! ```text
//! +0  pid       u8
//! +1  num_sub   u8
//! +2  num_prov  u8
//! +3  flags     u8
//! +4  handler   u16   word address of the message handler
//! +6  fcb[num_sub + num_prov], 8 bytes each:
//!       ptr u16 | proto [u8; 4] | pid u8 | fid u8
//! ```
//!
//! Subscribed blocks come first. In a subscribed block `pid`/`fid` name the
//! provider; in a provided block they name the module itself and the
//! function it exports.

use super::proto::Proto;
use super::{FntableError, FntableResult, FunctionId};
use crate::kernel::ModuleId;
use bytemuck::{Pod, Zeroable};

pub const HEADER_SIZE: usize = 6;
pub const FCB_SIZE: usize = 8;

/// Byte offset of the `ptr` field of function control block `index`
pub fn fcb_ptr_offset(index: usize) -> usize {
    HEADER_SIZE + index * FCB_SIZE
}

/// Offset of the `handler` field
pub const HANDLER_OFFSET: usize = 4;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawHeader {
    pid: u8,
    num_sub: u8,
    num_prov: u8,
    flags: u8,
    handler: [u8; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawFcb {
    ptr: [u8; 2],
    proto: [u8; 4],
    pid: u8,
    fid: u8,
}

/// A function control block as stored in flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcbRecord {
    /// Word address (provided) or ignored (subscribed)
    pub ptr: u16,
    pub proto: Proto,
    pub pid: ModuleId,
    pub fid: FunctionId,
}

/// Decoded module header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHeader {
    pub pid: ModuleId,
    pub flags: u8,
    /// Word address of the message handler
    pub handler: u16,
    pub subscribed: Vec<FcbRecord>,
    pub provided: Vec<FcbRecord>,
}

impl ModuleHeader {
    /// Size of the fixed part, needed before the block count is known
    pub const FIXED_SIZE: usize = HEADER_SIZE;

    /// Total encoded size
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + (self.subscribed.len() + self.provided.len()) * FCB_SIZE
    }

    /// Number of control blocks announced by a fixed header
    pub fn block_count(fixed: &[u8; HEADER_SIZE]) -> usize {
        let raw: RawHeader = bytemuck::cast(*fixed);
        raw.num_sub as usize + raw.num_prov as usize
    }

    pub fn decode(bytes: &[u8]) -> FntableResult<Self> {
        let fixed: [u8; HEADER_SIZE] = bytes
            .get(..HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(FntableError::BadHeader("truncated header"))?;
        let raw: RawHeader = bytemuck::cast(fixed);

        let total = Self::block_count(&fixed);
        let blocks = &bytes[HEADER_SIZE..];
        if blocks.len() < total * FCB_SIZE {
            return Err(FntableError::BadHeader("truncated function table"));
        }

        let mut records = Vec::with_capacity(total);
        for chunk in blocks.chunks_exact(FCB_SIZE).take(total) {
            let mut buf = [0u8; FCB_SIZE];
            buf.copy_from_slice(chunk);
            let fcb: RawFcb = bytemuck::cast(buf);
            let proto = Proto(fcb.proto);
            if proto.validate().is_none() {
                return Err(FntableError::BadProto(fcb.proto));
            }
            records.push(FcbRecord {
                ptr: u16::from_le_bytes(fcb.ptr),
                proto,
                pid: fcb.pid,
                fid: fcb.fid,
            });
        }

        let provided = records.split_off(raw.num_sub as usize);
        Ok(Self {
            pid: raw.pid,
            flags: raw.flags,
            handler: u16::from_le_bytes(raw.handler),
            subscribed: records,
            provided,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let raw = RawHeader {
            pid: self.pid,
            num_sub: self.subscribed.len() as u8,
            num_prov: self.provided.len() as u8,
            flags: self.flags,
            handler: self.handler.to_le_bytes(),
        };
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(bytemuck::bytes_of(&raw));
        for rec in self.subscribed.iter().chain(&self.provided) {
            let fcb = RawFcb {
                ptr: rec.ptr.to_le_bytes(),
                proto: rec.proto.0,
                pid: rec.pid,
                fid: rec.fid,
            };
            out.extend_from_slice(bytemuck::bytes_of(&fcb));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModuleHeader {
        ModuleHeader {
            pid: 0x81,
            flags: 0,
            handler: 0x0840,
            subscribed: vec![FcbRecord {
                ptr: 0,
                proto: Proto(*b"sCv1"),
                pid: 0x82,
                fid: 3,
            }],
            provided: vec![FcbRecord {
                ptr: 0x0850,
                proto: Proto(*b"vvv0"),
                pid: 0x81,
                fid: 1,
            }],
        }
    }

    #[test]
    fn test_layout() {
        let bytes = sample().encode();
        assert_eq!(bytes.len(), 6 + 2 * 8);
        assert_eq!(&bytes[..6], &[0x81, 1, 1, 0, 0x40, 0x08]);
        // Provided block: ptr little-endian, then proto, pid, fid
        assert_eq!(&bytes[14..22], &[0x50, 0x08, b'v', b'v', b'v', b'0', 0x81, 1]);
        assert_eq!(fcb_ptr_offset(1), 14);
    }

    #[test]
    fn test_decode_matches_encode() {
        let header = sample();
        assert_eq!(ModuleHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_decode_rejects_truncation_and_bad_proto() {
        let bytes = sample().encode();
        assert_eq!(
            ModuleHeader::decode(&bytes[..4]),
            Err(FntableError::BadHeader("truncated header"))
        );
        assert_eq!(
            ModuleHeader::decode(&bytes[..20]),
            Err(FntableError::BadHeader("truncated function table"))
        );

        let mut bad = bytes.clone();
        bad[8] = b'?';
        assert!(matches!(
            ModuleHeader::decode(&bad),
            Err(FntableError::BadProto(_))
        ));
    }
}
