//! NRPE v2/v3 packet codec.
//!
//! All integers are big-endian. The common 16-byte header is
//! `version:i16, type:i16, crc32:u32, result_code:i16`, followed for v3 by
//! a 2-byte alignment field and a 4-byte `buffer_length`; for v2 those last
//! 6 header bytes are already the start of the fixed buffer.
//!
//! v2 packets are exactly 1036 bytes: 10 bytes of fields, a 1023-byte
//! null-terminated buffer, 2 random filler bytes and 1 pad byte. v3 packets
//! are `19 + buffer_length` bytes: the 16-byte header, `buffer_length`
//! buffer bytes and 3 trailing pad bytes.
//!
//! The CRC32-IEEE checksum covers the whole packet with the 4-byte CRC
//! field zeroed, not a prefix of it.

use rand::Rng as _;
use thiserror::Error;

/// NRPE query packet type.
pub const QUERY_PACKET: i16 = 1;
/// NRPE response packet type.
pub const RESPONSE_PACKET: i16 = 2;

/// Total size of a v2 packet.
pub const V2_PACKET_LEN: usize = 1036;
/// Capacity of the v2 fixed buffer, including the null terminator.
pub const V2_BUFFER_LEN: usize = 1023;
/// Size of the common header.
pub const HEADER_LEN: usize = 16;

// Cap on the v3 buffer length, to bound allocations on malformed frames.
const V3_MAX_BUFFER_LEN: usize = 64 * 1024;

const CRC_RANGE: std::ops::Range<usize> = 4..8;

/// A decoded NRPE packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version, 2 or 3.
    pub version: i16,

    /// [`QUERY_PACKET`] or [`RESPONSE_PACKET`].
    pub packet_type: i16,

    /// Plugin result code (0 OK, 1 warning, 2 critical, 3 unknown).
    pub result_code: i16,

    /// Command or reply text.
    pub buffer: String,
}

/// Packet codec failure.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The packet is shorter than its layout requires.
    #[error("truncated packet")]
    Truncated,

    /// The version field is neither 2 nor 3.
    #[error("unsupported protocol version {0}")]
    Version(i16),

    /// The advertised v3 buffer length is out of range.
    #[error("buffer length {0} is out of range")]
    BufferLength(i32),

    /// The checksum does not match.
    #[error("CRC32 mismatch: packet carries {carried:#010x}, computed {computed:#010x}")]
    Crc {
        /// Checksum carried in the packet.
        carried: u32,
        /// Checksum computed over the packet.
        computed: u32,
    },

    /// The buffer is not valid UTF-8.
    #[error("buffer is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),
}

/// Returns how many bytes follow the 16-byte header for this packet.
pub fn body_len(header: &[u8; HEADER_LEN]) -> Result<usize, PacketError> {
    match read_i16(&header[0..2]) {
        2 => Ok(V2_PACKET_LEN - HEADER_LEN),
        3 => {
            let buffer_len = read_i32(&header[12..16]);

            if buffer_len < 1 || buffer_len as usize > V3_MAX_BUFFER_LEN {
                return Err(PacketError::BufferLength(buffer_len));
            }

            // Total is 19 + buffer_length; the header accounts for 16.
            Ok(buffer_len as usize + 3)
        }
        version => Err(PacketError::Version(version)),
    }
}

/// Encodes a packet using its version's wire layout.
pub fn encode(packet: &Packet) -> Vec<u8> {
    match packet.version {
        2 => encode_v2(packet),
        _ => encode_v3(packet),
    }
}

fn encode_v2(packet: &Packet) -> Vec<u8> {
    let mut bytes = vec![0u8; V2_PACKET_LEN];

    bytes[0..2].copy_from_slice(&packet.version.to_be_bytes());
    bytes[2..4].copy_from_slice(&packet.packet_type.to_be_bytes());
    bytes[8..10].copy_from_slice(&packet.result_code.to_be_bytes());

    let buffer = packet.buffer.as_bytes();
    let len = buffer.len().min(V2_BUFFER_LEN - 1);
    bytes[10..10 + len].copy_from_slice(&buffer[..len]);

    // Two bytes of random filler after the fixed buffer, as the reference
    // implementation sends. The final pad byte stays zero.
    let filler: [u8; 2] = rand::rng().random();
    bytes[10 + V2_BUFFER_LEN..10 + V2_BUFFER_LEN + 2].copy_from_slice(&filler);

    write_crc(&mut bytes);

    bytes
}

fn encode_v3(packet: &Packet) -> Vec<u8> {
    let buffer = packet.buffer.as_bytes();
    let buffer_len = buffer.len() + 1;
    let mut bytes = vec![0u8; HEADER_LEN + buffer_len + 3];

    bytes[0..2].copy_from_slice(&packet.version.to_be_bytes());
    bytes[2..4].copy_from_slice(&packet.packet_type.to_be_bytes());
    bytes[8..10].copy_from_slice(&packet.result_code.to_be_bytes());
    bytes[12..16].copy_from_slice(&(buffer_len as i32).to_be_bytes());
    bytes[HEADER_LEN..HEADER_LEN + buffer.len()].copy_from_slice(buffer);

    write_crc(&mut bytes);

    bytes
}

/// Decodes and validates a full packet.
pub fn decode(bytes: &[u8]) -> Result<Packet, PacketError> {
    if bytes.len() < HEADER_LEN {
        return Err(PacketError::Truncated);
    }

    let version = read_i16(&bytes[0..2]);

    let buffer_region = match version {
        2 => {
            if bytes.len() != V2_PACKET_LEN {
                return Err(PacketError::Truncated);
            }

            &bytes[10..10 + V2_BUFFER_LEN]
        }
        3 => {
            let buffer_len = read_i32(&bytes[12..16]);

            if buffer_len < 1 || buffer_len as usize > V3_MAX_BUFFER_LEN {
                return Err(PacketError::BufferLength(buffer_len));
            }

            if bytes.len() != HEADER_LEN + buffer_len as usize + 3 {
                return Err(PacketError::Truncated);
            }

            &bytes[HEADER_LEN..HEADER_LEN + buffer_len as usize]
        }
        version => return Err(PacketError::Version(version)),
    };

    verify_crc(bytes)?;

    let terminated = buffer_region
        .iter()
        .position(|byte| *byte == 0)
        .map(|end| &buffer_region[..end])
        .unwrap_or(buffer_region);

    Ok(Packet {
        version,
        packet_type: read_i16(&bytes[2..4]),
        result_code: read_i16(&bytes[8..10]),
        buffer: std::str::from_utf8(terminated)?.to_owned(),
    })
}

fn write_crc(bytes: &mut [u8]) {
    let crc = crc32_with_zeroed_field(bytes);
    bytes[CRC_RANGE].copy_from_slice(&crc.to_be_bytes());
}

fn verify_crc(bytes: &[u8]) -> Result<(), PacketError> {
    let carried = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let computed = crc32_with_zeroed_field(bytes);

    if carried != computed {
        return Err(PacketError::Crc { carried, computed });
    }

    Ok(())
}

fn crc32_with_zeroed_field(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();

    hasher.update(&bytes[..CRC_RANGE.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&bytes[CRC_RANGE.end..]);

    hasher.finalize()
}

fn read_i16(bytes: &[u8]) -> i16 {
    i16::from_be_bytes([bytes[0], bytes[1]])
}

fn read_i32(bytes: &[u8]) -> i32 {
    i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(version: i16) -> Packet {
        Packet {
            version,
            packet_type: QUERY_PACKET,
            result_code: 0,
            buffer: "check_load".to_owned(),
        }
    }

    #[test]
    fn v2_round_trip() {
        let packet = sample(2);
        let bytes = encode(&packet);

        assert_eq!(bytes.len(), V2_PACKET_LEN);
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn v3_round_trip() {
        let packet = Packet {
            result_code: 2,
            packet_type: RESPONSE_PACKET,
            ..sample(3)
        };
        let bytes = encode(&packet);

        assert_eq!(bytes.len(), 19 + packet.buffer.len() + 1);
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn v2_filler_does_not_affect_equality() {
        // Encoding twice yields different bytes (random filler) but the
        // same decoded packet.
        let packet = sample(2);

        assert_eq!(decode(&encode(&packet)).unwrap(), decode(&encode(&packet)).unwrap());
    }

    #[test]
    fn flipping_any_buffer_byte_fails_crc() {
        let bytes = encode(&sample(3));

        for index in HEADER_LEN..bytes.len() - 3 {
            let mut corrupted = bytes.clone();
            corrupted[index] ^= 0x01;

            match decode(&corrupted) {
                Err(PacketError::Crc { .. }) => {}
                other => panic!("byte {index}: expected CRC error, got {other:?}"),
            }
        }
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut bytes = encode(&sample(3));
        bytes[0..2].copy_from_slice(&4i16.to_be_bytes());

        assert!(matches!(decode(&bytes), Err(PacketError::Version(4))));
    }

    #[test]
    fn oversized_v3_buffer_is_rejected() {
        let mut header = [0u8; HEADER_LEN];
        header[0..2].copy_from_slice(&3i16.to_be_bytes());
        header[12..16].copy_from_slice(&(1_000_000i32).to_be_bytes());

        assert!(matches!(
            body_len(&header),
            Err(PacketError::BufferLength(1_000_000))
        ));
    }

    #[test]
    fn body_len_matches_layouts() {
        let mut v2 = [0u8; HEADER_LEN];
        v2[0..2].copy_from_slice(&2i16.to_be_bytes());
        assert_eq!(body_len(&v2).unwrap(), V2_PACKET_LEN - HEADER_LEN);

        let mut v3 = [0u8; HEADER_LEN];
        v3[0..2].copy_from_slice(&3i16.to_be_bytes());
        v3[12..16].copy_from_slice(&11i32.to_be_bytes());
        assert_eq!(body_len(&v3).unwrap(), 14);
    }

    #[test]
    fn v2_overlong_buffer_is_truncated_with_terminator() {
        let packet = Packet {
            buffer: "x".repeat(4096),
            ..sample(2)
        };

        let decoded = decode(&encode(&packet)).unwrap();
        assert_eq!(decoded.buffer.len(), V2_BUFFER_LEN - 1);
    }
}
