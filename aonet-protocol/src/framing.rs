//! The outer 4-byte length prefix each record is wrapped in on the wire.
//!
//! Transport-agnostic: this module only knows how to add/strip the
//! prefix around an already-encoded [`crate::message`] record; actual
//! socket reads/writes live with the caller.

/// Prepend the 4-byte big-endian length of `record` to itself.
pub fn frame(record: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(4 + record.len());
    framed.extend_from_slice(&(record.len() as u32).to_be_bytes());
    framed.extend_from_slice(record);
    framed
}

/// Parse a 4-byte big-endian length prefix.
pub fn read_length_prefix(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_prepends_big_endian_length() {
        let record = b"abcde";
        let framed = frame(record);
        assert_eq!(&framed[..4], &5u32.to_be_bytes());
        assert_eq!(&framed[4..], record);
    }
}
