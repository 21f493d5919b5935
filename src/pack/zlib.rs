//! Zlib compression helper for pack payloads.
//!
//! Every pack payload is deflated into a zlib stream. Compression state is
//! kept in per-thread scratch so the parallel delta search can pre-compress
//! cached deltas without per-call allocations of the compressor itself.

use std::cell::RefCell;
use std::io;

use flate2::{Compress, Compression, FlushCompress, Status};

thread_local! {
    static DEFLATE: RefCell<Compress> =
        RefCell::new(Compress::new(Compression::default(), true));
}

/// Compresses `data` into a fresh zlib stream.
///
/// # Errors
///
/// Returns an error only if the underlying compressor reports one, which
/// indicates a bug rather than bad input.
pub(crate) fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    DEFLATE.with(|z| {
        let mut z = z.borrow_mut();
        z.reset();

        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let mut in_pos = 0usize;
        loop {
            if out.capacity() == out.len() {
                out.reserve(out.capacity().max(64));
            }
            let before_in = z.total_in() as usize;
            let status = z
                .compress_vec(&data[in_pos..], &mut out, FlushCompress::Finish)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            in_pos += z.total_in() as usize - before_in;
            match status {
                Status::StreamEnd => return Ok(out),
                Status::Ok | Status::BufError => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    fn inflate(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        ZlibDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn deflate_round_trips() {
        let data = b"0123456789".repeat(100);
        let z = deflate(&data).unwrap();
        assert!(z.len() < data.len());
        assert_eq!(inflate(&z), data);
    }

    #[test]
    fn deflate_empty_input() {
        let z = deflate(b"").unwrap();
        assert_eq!(inflate(&z), b"");
    }

    #[test]
    fn deflate_incompressible_input() {
        let data: Vec<u8> = (0..100_000u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let z = deflate(&data).unwrap();
        assert_eq!(inflate(&z), data);
    }
}
