//! Decoding of files made of several concatenated zlib members.
//!
//! Every append session on a compressed file writes one complete zlib stream,
//! so a journal that was appended to N times holds N members back to back.

use std::io::{self, BufRead, Read};

use flate2::bufread::ZlibDecoder;

pub struct MultiZlibDecoder<R: BufRead> {
    idle: Option<R>,
    decoder: Option<ZlibDecoder<R>>,
}

impl<R: BufRead> MultiZlibDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            idle: Some(reader),
            decoder: None,
        }
    }
}

impl<R: BufRead> Read for MultiZlibDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(decoder) = self.decoder.as_mut() {
                let n = decoder.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                // Member finished (or input exhausted).
                self.idle = self.decoder.take().map(ZlibDecoder::into_inner);
            }

            let Some(mut inner) = self.idle.take() else {
                return Ok(0);
            };
            if inner.fill_buf()?.is_empty() {
                return Ok(0);
            }
            self.decoder = Some(ZlibDecoder::new(inner));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn member(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_concatenated_members() {
        let mut bytes = member(b"hello ");
        bytes.extend(member(b"world"));
        let mut out = String::new();
        MultiZlibDecoder::new(bytes.as_slice())
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_empty_input() {
        let mut out = Vec::new();
        MultiZlibDecoder::new(&[][..]).read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }
}
