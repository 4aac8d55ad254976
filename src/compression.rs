//! Streaming zlib compression for the content store
//!
//! Content is pushed through a deflate (zlib) stream in fixed-size chunks so
//! that files of any size can be stored without holding them in memory. Each
//! encoder/decoder lives for exactly one [`CompressionEngine::compress_stream`]
//! or [`CompressionEngine::decompress_stream`] call; nothing is shared between
//! calls, and the stream is finalized before the call returns.
//!
//! ## Examples
//!
//! ```rust
//! use strata::compression::CompressionEngine;
//!
//! let mut engine = CompressionEngine::new(6, 4096);
//! let data = b"hello hello hello hello".to_vec();
//!
//! let mut compressed = Vec::new();
//! let (read, written) = engine.compress_stream(&data[..], data.len() as u64, &mut compressed)?;
//! assert_eq!(read, data.len() as u64);
//! assert_eq!(written, compressed.len() as u64);
//!
//! let mut restored = Vec::new();
//! engine.decompress_stream(&compressed[..], written, &mut restored)?;
//! assert_eq!(restored, data);
//! # Ok::<(), std::io::Error>(())
//! ```

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};
use tracing::trace;

/// Running totals for one engine instance
#[derive(Debug, Default, Clone)]
pub struct CompressionStats {
    /// Number of streams compressed
    pub streams_compressed: usize,
    /// Number of streams decompressed
    pub streams_decompressed: usize,
    /// Uncompressed bytes consumed by the compressor
    pub bytes_in: u64,
    /// Compressed bytes produced by the compressor
    pub bytes_out: u64,
}

impl CompressionStats {
    /// Compressed size as a fraction of the input (1.0 when nothing was compressed)
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            return 1.0;
        }
        self.bytes_out as f64 / self.bytes_in as f64
    }
}

/// zlib stream engine with a fixed chunk size
#[derive(Debug)]
pub struct CompressionEngine {
    level: Compression,
    chunk_size: usize,
    stats: CompressionStats,
}

impl CompressionEngine {
    /// Create an engine compressing at `level` (clamped to 0-9)
    pub fn new(level: u32, chunk_size: usize) -> Self {
        Self {
            level: Compression::new(level.min(9)),
            chunk_size: chunk_size.max(1),
            stats: CompressionStats::default(),
        }
    }

    /// Statistics since creation
    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    /// Chunk size used for streaming
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Compress exactly `length` bytes from `reader` into `writer`
    ///
    /// Returns `(bytes_read, bytes_written)`. Fails with `UnexpectedEof` if the
    /// reader ends before `length` bytes were consumed.
    pub fn compress_stream<R: Read, W: Write>(
        &mut self,
        reader: R,
        length: u64,
        writer: W,
    ) -> io::Result<(u64, u64)> {
        let mut source = reader.take(length);
        let mut encoder = ZlibEncoder::new(CountingWriter::new(writer), self.level);
        let mut buf = vec![0u8; self.chunk_size.min(length.max(1) as usize)];
        let mut read = 0u64;

        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            encoder.write_all(&buf[..n])?;
            read += n as u64;
        }

        let counter = encoder.finish()?;
        if read != length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {} bytes of content, read {}", length, read),
            ));
        }

        let written = counter.count;
        let mut inner = counter.inner;
        inner.flush()?;

        self.stats.streams_compressed += 1;
        self.stats.bytes_in += read;
        self.stats.bytes_out += written;
        trace!("Compressed stream: {} -> {} bytes", read, written);
        Ok((read, written))
    }

    /// Decompress `compressed_length` bytes from `reader` into `writer`
    ///
    /// Returns the number of decompressed bytes written.
    pub fn decompress_stream<R: Read, W: Write>(
        &mut self,
        reader: R,
        compressed_length: u64,
        mut writer: W,
    ) -> io::Result<u64> {
        let mut decoder = ZlibDecoder::new(reader.take(compressed_length));
        let mut buf = vec![0u8; self.chunk_size];
        let mut written = 0u64;

        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
            written += n as u64;
        }
        writer.flush()?;

        self.stats.streams_decompressed += 1;
        trace!("Decompressed stream: {} -> {} bytes", compressed_length, written);
        Ok(written)
    }
}

/// Writer adapter counting the bytes passed through it
struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_across_chunks() {
        let mut engine = CompressionEngine::new(6, 7);
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 13) as u8).collect();

        let mut compressed = Vec::new();
        let (read, written) = engine
            .compress_stream(&data[..], data.len() as u64, &mut compressed)
            .unwrap();
        assert_eq!(read, 1000);
        assert_eq!(written as usize, compressed.len());
        assert!(compressed.len() < data.len());

        let mut restored = Vec::new();
        let n = engine.decompress_stream(&compressed[..], written, &mut restored).unwrap();
        assert_eq!(n, 1000);
        assert_eq!(restored, data);
        assert_eq!(engine.stats().streams_compressed, 1);
        assert_eq!(engine.stats().streams_decompressed, 1);
    }

    #[test]
    fn test_only_declared_length_is_consumed() {
        let mut engine = CompressionEngine::new(1, 1024);
        let data = b"0123456789abcdef";
        let mut compressed = Vec::new();
        let (read, written) = engine.compress_stream(&data[..], 10, &mut compressed).unwrap();
        assert_eq!(read, 10);

        let mut restored = Vec::new();
        engine.decompress_stream(&compressed[..], written, &mut restored).unwrap();
        assert_eq!(restored, b"0123456789");
    }

    #[test]
    fn test_short_reader_is_an_error() {
        let mut engine = CompressionEngine::new(6, 1024);
        let err = engine
            .compress_stream(&b"abc"[..], 10, Vec::new())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_decompress_stops_at_compressed_length() {
        let mut engine = CompressionEngine::new(6, 16);
        let mut store = Vec::new();
        let (_, first) = engine.compress_stream(&b"first"[..], 5, &mut store).unwrap();
        engine.compress_stream(&b"second"[..], 6, &mut store).unwrap();

        let mut out = Vec::new();
        engine.decompress_stream(&store[..], first, &mut out).unwrap();
        assert_eq!(out, b"first");
    }
}
