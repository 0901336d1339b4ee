//! Fetch protocol frames
//!
//! ```text
//! request:  0x01 | key u16 | bitmap_size u8 | bitmap[bitmap_size]
//! fragment: 0x02 | fragment_index u16 | key u16 | payload[fragment_size]
//! ```
//!
//! The leading byte is the link-layer message type; the rest is big-endian.
//! The last fragment of an image is zero-padded to the full payload size.

use super::{FetchError, FetchResult, ModuleKey};
use bytemuck::{Pod, Zeroable};

pub const MSG_REQUEST: u8 = 0x01;
pub const MSG_FRAGMENT: u8 = 0x02;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawRequest {
    key: [u8; 2],
    bitmap_size: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawFragment {
    index: [u8; 2],
    key: [u8; 2],
}

const REQUEST_HEADER: usize = std::mem::size_of::<RawRequest>();
const FRAGMENT_HEADER: usize = std::mem::size_of::<RawFragment>();

/// Ask a neighbour for the fragments whose bits are set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub key: ModuleKey,
    pub bitmap: Vec<u8>,
}

/// One fragment of a module image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub index: u16,
    pub key: ModuleKey,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Request(FetchRequest),
    Fragment(Fragment),
}

impl Packet {
    pub fn encode(&self) -> FetchResult<Vec<u8>> {
        match self {
            Packet::Request(req) => {
                let bitmap_size = u8::try_from(req.bitmap.len())
                    .map_err(|_| FetchError::BadPacket("bitmap too large"))?;
                let raw = RawRequest {
                    key: req.key.to_be_bytes(),
                    bitmap_size,
                };
                let mut out = Vec::with_capacity(1 + REQUEST_HEADER + req.bitmap.len());
                out.push(MSG_REQUEST);
                out.extend_from_slice(bytemuck::bytes_of(&raw));
                out.extend_from_slice(&req.bitmap);
                Ok(out)
            }
            Packet::Fragment(frag) => {
                let raw = RawFragment {
                    index: frag.index.to_be_bytes(),
                    key: frag.key.to_be_bytes(),
                };
                let mut out = Vec::with_capacity(1 + FRAGMENT_HEADER + frag.payload.len());
                out.push(MSG_FRAGMENT);
                out.extend_from_slice(bytemuck::bytes_of(&raw));
                out.extend_from_slice(&frag.payload);
                Ok(out)
            }
        }
    }

    pub fn decode(frame: &[u8]) -> FetchResult<Self> {
        let (&kind, body) = frame
            .split_first()
            .ok_or(FetchError::BadPacket("empty frame"))?;
        match kind {
            MSG_REQUEST => {
                let raw: &RawRequest = body
                    .get(..REQUEST_HEADER)
                    .and_then(|b| bytemuck::try_from_bytes(b).ok())
                    .ok_or(FetchError::BadPacket("truncated request"))?;
                let bitmap = body[REQUEST_HEADER..]
                    .get(..raw.bitmap_size as usize)
                    .ok_or(FetchError::BadPacket("truncated bitmap"))?;
                Ok(Packet::Request(FetchRequest {
                    key: u16::from_be_bytes(raw.key),
                    bitmap: bitmap.to_vec(),
                }))
            }
            MSG_FRAGMENT => {
                let raw: &RawFragment = body
                    .get(..FRAGMENT_HEADER)
                    .and_then(|b| bytemuck::try_from_bytes(b).ok())
                    .ok_or(FetchError::BadPacket("truncated fragment"))?;
                Ok(Packet::Fragment(Fragment {
                    index: u16::from_be_bytes(raw.index),
                    key: u16::from_be_bytes(raw.key),
                    payload: body[FRAGMENT_HEADER..].to_vec(),
                }))
            }
            _ => Err(FetchError::BadPacket("unknown message type")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let packet = Packet::Request(FetchRequest {
            key: 0x0102,
            bitmap: vec![0x05, 0x80],
        });
        let frame = packet.encode().unwrap();
        assert_eq!(frame, vec![MSG_REQUEST, 0x01, 0x02, 2, 0x05, 0x80]);
        assert_eq!(Packet::decode(&frame).unwrap(), packet);
    }

    #[test]
    fn test_fragment_wire_format() {
        let packet = Packet::Fragment(Fragment {
            index: 3,
            key: 0xBEEF,
            payload: vec![1, 2, 3, 0],
        });
        let frame = packet.encode().unwrap();
        assert_eq!(frame, vec![MSG_FRAGMENT, 0, 3, 0xBE, 0xEF, 1, 2, 3, 0]);
        assert_eq!(Packet::decode(&frame).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(
            Packet::decode(&[]),
            Err(FetchError::BadPacket("empty frame"))
        );
        assert_eq!(
            Packet::decode(&[0x7F, 0, 0]),
            Err(FetchError::BadPacket("unknown message type"))
        );
        assert_eq!(
            Packet::decode(&[MSG_REQUEST, 0, 1]),
            Err(FetchError::BadPacket("truncated request"))
        );
        assert_eq!(
            Packet::decode(&[MSG_REQUEST, 0, 1, 4, 0xFF]),
            Err(FetchError::BadPacket("truncated bitmap"))
        );
        assert_eq!(
            Packet::decode(&[MSG_FRAGMENT, 0, 1, 0]),
            Err(FetchError::BadPacket("truncated fragment"))
        );
    }

    #[test]
    fn test_oversized_bitmap_not_encodable() {
        let packet = Packet::Request(FetchRequest {
            key: 1,
            bitmap: vec![0; 256],
        });
        assert!(packet.encode().is_err());
    }
}
