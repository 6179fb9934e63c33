//! Zabbix v1 passive-check framing and key parsing.
//!
//! On the wire: 4 magic bytes `"ZBXD"`, a version byte, a little-endian
//! 64-bit payload length, then the ASCII payload `key[arg1,arg2,...]`.
//! Replies use the same framing around the raw reply string.

use thiserror::Error;

/// Frame magic.
pub const MAGIC: [u8; 4] = *b"ZBXD";

/// Size of the frame header: magic + version + data length.
pub const HEADER_LEN: usize = 13;

// Cap on the payload length, to bound allocations on malformed frames.
const MAX_DATA_LEN: u64 = 64 * 1024;

/// Packet or key parsing failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// The frame does not start with `"ZBXD"`.
    #[error("bad frame magic")]
    Magic,

    /// The advertised payload length is out of range.
    #[error("payload length {0} is out of range")]
    DataLength(u64),

    /// The payload is not valid UTF-8.
    #[error("payload is not valid text")]
    Encoding,

    /// An argument list was opened but never closed.
    #[error("unmatched bracket in key")]
    UnmatchedBracket,

    /// A quoted argument was opened but never closed.
    #[error("unterminated quote in key")]
    UnterminatedQuote,

    /// Text where an argument separator was expected.
    #[error("malformed argument list")]
    MalformedArguments,
}

/// Decodes the 13-byte frame header, returning `(version, data_length)`.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u64), PacketError> {
    if header[..4] != MAGIC {
        return Err(PacketError::Magic);
    }

    let data_len = u64::from_le_bytes([
        header[5], header[6], header[7], header[8], header[9], header[10], header[11], header[12],
    ]);

    if data_len == 0 || data_len > MAX_DATA_LEN {
        return Err(PacketError::DataLength(data_len));
    }

    Ok((header[4], data_len))
}

/// Encodes a reply frame.
pub fn encode_reply(version: u8, data: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + data.len());

    bytes.extend_from_slice(&MAGIC);
    bytes.push(version);
    bytes.extend_from_slice(&(data.len() as u64).to_le_bytes());
    bytes.extend_from_slice(data.as_bytes());

    bytes
}

/// Splits a payload of the form `key[arg1,arg2,...]` into the key and its
/// arguments.
///
/// Spaces are stripped first. Arguments are comma-separated at the top
/// level; an argument may be bracketed (commas and the closing bracket are
/// literal until the matching `]`) or double-quoted (quotes are stripped,
/// commas inside are literal). A trailing comma introduces one empty final
/// argument. An unmatched opening bracket is an error.
pub fn split_data(payload: &str) -> Result<(String, Vec<String>), PacketError> {
    let data: String = payload.chars().filter(|c| *c != ' ').collect();

    let open = match data.find('[') {
        Some(open) => open,
        None => return Ok((data, Vec::new())),
    };

    if !data.ends_with(']') {
        return Err(PacketError::UnmatchedBracket);
    }

    let key = data[..open].to_owned();
    let inner = &data[open + 1..data.len() - 1];

    if inner.is_empty() {
        return Ok((key, vec![String::new()]));
    }

    let bytes = inner.as_bytes();
    let mut args = Vec::new();
    let mut i = 0;

    loop {
        let arg = match bytes.get(i) {
            Some(b'[') => {
                let close = inner[i..]
                    .find(']')
                    .ok_or(PacketError::UnmatchedBracket)?
                    + i;
                let arg = inner[i + 1..close].to_owned();

                i = close + 1;
                arg
            }
            Some(b'"') => {
                let close = inner[i + 1..]
                    .find('"')
                    .ok_or(PacketError::UnterminatedQuote)?
                    + i
                    + 1;
                let arg = inner[i + 1..close].to_owned();

                i = close + 1;
                arg
            }
            _ => {
                let end = inner[i..].find(',').map(|comma| comma + i).unwrap_or(inner.len());
                let arg = inner[i..end].to_owned();

                i = end;
                arg
            }
        };

        args.push(arg);

        match bytes.get(i) {
            None => break,
            Some(b',') => {
                i += 1;

                if i == inner.len() {
                    // Trailing comma: one empty final argument.
                    args.push(String::new());
                    break;
                }
            }
            Some(_) => return Err(PacketError::MalformedArguments),
        }
    }

    Ok((key, args))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn bare_key() {
        assert_eq!(split_data("k").unwrap(), ("k".to_owned(), vec![]));
        assert_eq!(
            split_data("agent.ping").unwrap(),
            ("agent.ping".to_owned(), vec![])
        );
    }

    #[test]
    fn empty_argument_list() {
        assert_eq!(split_data("k[]").unwrap(), ("k".to_owned(), args(&[""])));
    }

    #[test]
    fn plain_arguments() {
        assert_eq!(
            split_data("k[a,b,c]").unwrap(),
            ("k".to_owned(), args(&["a", "b", "c"]))
        );
    }

    #[test]
    fn quoted_argument_protects_commas() {
        assert_eq!(
            split_data("k[\"a,b\"]").unwrap(),
            ("k".to_owned(), args(&["a,b"]))
        );
    }

    #[test]
    fn nested_brackets_are_literal() {
        assert_eq!(
            split_data("k[[x,y],z]").unwrap(),
            ("k".to_owned(), args(&["x,y", "z"]))
        );
    }

    #[test]
    fn unmatched_bracket_is_an_error() {
        assert_eq!(split_data("k[a,"), Err(PacketError::UnmatchedBracket));
    }

    #[test]
    fn trailing_comma_adds_an_empty_argument() {
        assert_eq!(
            split_data("k[a,b,]").unwrap(),
            ("k".to_owned(), args(&["a", "b", ""]))
        );
    }

    #[test]
    fn spaces_are_stripped() {
        assert_eq!(
            split_data("k[ a , b ]").unwrap(),
            ("k".to_owned(), args(&["a", "b"]))
        );
    }

    #[test]
    fn header_round_trip() {
        let reply = encode_reply(1, "1");

        assert_eq!(reply.len(), 14);

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&reply[..HEADER_LEN]);

        assert_eq!(decode_header(&header).unwrap(), (1, 1));
        assert_eq!(&reply[HEADER_LEN..], b"1");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(b"ZBXX");
        header[5] = 1;

        assert_eq!(decode_header(&header), Err(PacketError::Magic));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&MAGIC);
        header[5..13].copy_from_slice(&(10_000_000u64).to_le_bytes());

        assert_eq!(
            decode_header(&header),
            Err(PacketError::DataLength(10_000_000))
        );
    }
}
