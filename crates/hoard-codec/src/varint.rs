//! Unsigned LEB128 length prefixes.

use std::io::{self, Read};

/// Longest encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

pub fn encode_u64(mut value: u64, out: &mut Vec<u8>) -> usize {
    let start = out.len();
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
    out.len() - start
}

/// Read one varint.
///
/// Returns `Ok(None)` when the reader is already at end of stream, and an
/// `UnexpectedEof` error when the stream ends inside the varint.
pub fn read_u64<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<(u64, usize)>> {
    let mut value = 0u64;
    let mut byte = [0u8; 1];

    for i in 0..MAX_VARINT_LEN {
        let n = loop {
            match reader.read(&mut byte) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            if i == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        value |= u64::from(byte[0] & 0x7f) << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "varint longer than 10 bytes",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encodings() {
        let mut out = Vec::new();
        assert_eq!(encode_u64(0, &mut out), 1);
        assert_eq!(encode_u64(300, &mut out), 2);
        assert_eq!(out, vec![0x00, 0xac, 0x02]);
    }

    #[test]
    fn test_read_back_max() {
        let mut out = Vec::new();
        encode_u64(u64::MAX, &mut out);
        assert_eq!(out.len(), MAX_VARINT_LEN);
        let (value, len) = read_u64(&mut out.as_slice()).unwrap().unwrap();
        assert_eq!(value, u64::MAX);
        assert_eq!(len, MAX_VARINT_LEN);
    }

    #[test]
    fn test_empty_is_none() {
        let empty: &[u8] = &[];
        assert!(read_u64(&mut &*empty).unwrap().is_none());
    }

    #[test]
    fn test_cut_varint_is_eof() {
        let cut: &[u8] = &[0xac];
        let err = read_u64(&mut &*cut).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
