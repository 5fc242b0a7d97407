//! Netascii translation
//!
//! On the wire a netascii line ends in CR LF and a bare CR is sent as CR NUL.
//! Locally, lines end in LF. Both directions carry state across DATA blocks
//! because a translated pair may straddle a block boundary.

use std::io::{self, Read};

use super::packet::SEGMENT_SIZE;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0;

/// Local text to netascii
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetasciiEncoder {
    /// Second half of a pair that did not fit the previous buffer
    pending: Option<u8>,
}

impl NetasciiEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill `buf` with translated bytes read from `src`
    ///
    /// Returns fewer bytes than `buf.len()` only at end of input.
    pub fn read<R: Read + ?Sized>(&mut self, src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(byte) = self.pending.take() {
            buf[0] = byte;
            filled = 1;
        }

        let mut raw = [0u8; SEGMENT_SIZE];
        while filled < buf.len() {
            // Each input byte expands to at most two, so half the room always fits
            let want = ((buf.len() - filled) / 2).clamp(1, raw.len());
            let got = match src.read(&mut raw[..want]) {
                Ok(0) => break,
                Ok(got) => got,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            for &byte in &raw[..got] {
                let (first, second) = match byte {
                    LF => (CR, Some(LF)),
                    CR => (CR, Some(NUL)),
                    other => (other, None),
                };
                buf[filled] = first;
                filled += 1;
                if let Some(second) = second {
                    if filled < buf.len() {
                        buf[filled] = second;
                        filled += 1;
                    } else {
                        self.pending = Some(second);
                    }
                }
            }
        }
        Ok(filled)
    }
}

/// Netascii to local text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetasciiDecoder {
    /// The previous block ended in CR
    carry_cr: bool,
}

impl NetasciiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one block, appending to `out`
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len());
        for &byte in input {
            if std::mem::take(&mut self.carry_cr) {
                match byte {
                    LF => {
                        out.push(LF);
                        continue;
                    }
                    NUL => {
                        out.push(CR);
                        continue;
                    }
                    // Lone CR is kept as is
                    _ => out.push(CR),
                }
            }
            if byte == CR {
                self.carry_cr = true;
            } else {
                out.push(byte);
            }
        }
    }

    /// End of input: a dangling CR is kept
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if std::mem::take(&mut self.carry_cr) {
            out.push(CR);
        }
    }
}

/// Read one DATA payload from `src`, translating through `encoder` when set
///
/// The payload is shorter than `SEGMENT_SIZE` only at end of input.
pub fn read_segment<R: Read + ?Sized>(src: &mut R, encoder: Option<&mut NetasciiEncoder>) -> io::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(SEGMENT_SIZE);
    match encoder {
        Some(encoder) => {
            data.resize(SEGMENT_SIZE, 0);
            let filled = encoder.read(src, &mut data)?;
            data.truncate(filled);
        }
        None => {
            Read::take(src, SEGMENT_SIZE as u64).read_to_end(&mut data)?;
        }
    }
    Ok(data)
}
