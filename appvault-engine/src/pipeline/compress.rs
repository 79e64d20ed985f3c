//! Compressor write layers.

use super::Sink;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Write};

pub struct GzipSink(GzEncoder<Box<dyn Sink>>);

impl GzipSink {
    pub fn new(inner: Box<dyn Sink>, level: i32) -> Self {
        let level = level.clamp(0, 9) as u32;
        Self(GzEncoder::new(inner, Compression::new(level)))
    }
}

impl Write for GzipSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Sink for GzipSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish()?.finish()
    }
}

pub struct ZstdSink(zstd::stream::write::Encoder<'static, Box<dyn Sink>>);

impl ZstdSink {
    pub fn new(inner: Box<dyn Sink>, level: i32) -> io::Result<Self> {
        Ok(Self(zstd::stream::write::Encoder::new(inner, level)?))
    }
}

impl Write for ZstdSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Sink for ZstdSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish()?.finish()
    }
}
