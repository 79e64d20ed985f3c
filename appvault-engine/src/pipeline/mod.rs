//! Layered archive streams.
//!
//! Writing: raw sink <- cipher <- compressor. Reading mirrors it:
//! raw source -> cipher -> decompressor. Each write layer owns the layer
//! below it and [`Sink::finish`] closes them in reverse order of
//! construction, so a caller only ever finishes the outermost layer.

pub mod cipher;
pub mod compress;

pub use cipher::{generate_iv, generate_keypair, CipherType, KeyMaterial, IV_LEN};

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Write end of a pipeline layer.
pub trait Sink: Write + Send {
    /// Flush trailers of this layer, then finish the layer below.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

impl Sink for std::fs::File {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionType {
    #[serde(rename = "no")]
    None,
    #[serde(rename = "gz")]
    Gzip,
    #[serde(rename = "zst")]
    Zstd,
    /// Anything a newer or foreign writer recorded that we cannot read
    #[serde(other, rename = "unsupported")]
    Unsupported,
}

impl CompressionType {
    /// Readable types in discovery order.
    pub const ALL: [CompressionType; 3] = [
        CompressionType::None,
        CompressionType::Gzip,
        CompressionType::Zstd,
    ];

    pub fn is_compressed(self) -> bool {
        self != CompressionType::None
    }
}

/// Key material plus the per-backup IV.
#[derive(Clone, Copy)]
pub struct Crypto<'a> {
    pub keys: &'a KeyMaterial,
    pub iv: &'a [u8],
}

/// Wrap `raw` for writing an archive.
pub fn open_write(
    raw: Box<dyn Sink>,
    compression: CompressionType,
    level: i32,
    crypto: Option<Crypto<'_>>,
) -> Result<Box<dyn Sink>> {
    if compression == CompressionType::Unsupported {
        return Err(EngineError::CryptoSetup(
            "Unsupported compression algorithm".to_string(),
        ));
    }

    let mut stream = raw;
    if let Some(crypto) = crypto {
        if crypto.iv.is_empty() {
            return Err(EngineError::CryptoSetup("IV is null".to_string()));
        }
        stream = Box::new(cipher::CipherWriter::new(stream, crypto.keys, crypto.iv)?);
    }

    Ok(match compression {
        CompressionType::Gzip => Box::new(compress::GzipSink::new(stream, level)),
        CompressionType::Zstd => Box::new(compress::ZstdSink::new(stream, level)?),
        _ => stream,
    })
}

/// Wrap `raw` for reading an archive.
pub fn open_read(
    raw: Box<dyn Read + Send>,
    compression: CompressionType,
    crypto: Option<Crypto<'_>>,
) -> Result<Box<dyn Read + Send>> {
    if compression == CompressionType::Unsupported {
        return Err(EngineError::CryptoSetup(
            "Unsupported compression algorithm".to_string(),
        ));
    }

    let mut stream = raw;
    if let Some(crypto) = crypto {
        if crypto.iv.is_empty() {
            return Err(EngineError::CryptoSetup(
                "IV vector could not be read".to_string(),
            ));
        }
        stream = Box::new(cipher::CipherReader::new(stream, crypto.keys, crypto.iv)?);
    }

    Ok(match compression {
        CompressionType::Gzip => Box::new(flate2::read::GzDecoder::new(stream)),
        CompressionType::Zstd => Box::new(zstd::stream::read::Decoder::new(stream)?),
        _ => stream,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Sink;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    /// In-memory sink whose bytes stay readable after `finish`.
    #[derive(Clone, Default)]
    pub struct MemorySink {
        pub bytes: Arc<Mutex<Vec<u8>>>,
        pub finished: Arc<Mutex<bool>>,
    }

    impl MemorySink {
        pub fn contents(&self) -> Vec<u8> {
            self.bytes.lock().unwrap().clone()
        }
    }

    impl Write for MemorySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.bytes.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Sink for MemorySink {
        fn finish(self: Box<Self>) -> io::Result<()> {
            *self.finished.lock().unwrap() = true;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemorySink;
    use super::*;
    use std::io::Cursor;

    fn password() -> KeyMaterial {
        KeyMaterial::Password {
            password: "correct horse".to_string(),
            salt: b"appvault-salt".to_vec(),
        }
    }

    fn sample() -> Vec<u8> {
        // several cipher frames, partly compressible
        let mut data = Vec::new();
        for i in 0..150_000u32 {
            data.extend_from_slice(&(i % 97).to_le_bytes());
        }
        data
    }

    fn write_all(
        data: &[u8],
        compression: CompressionType,
        crypto: Option<Crypto<'_>>,
    ) -> MemorySink {
        let raw = MemorySink::default();
        let mut sink = open_write(Box::new(raw.clone()), compression, 3, crypto).unwrap();
        sink.write_all(data).unwrap();
        sink.finish().unwrap();
        assert!(*raw.finished.lock().unwrap(), "raw layer was not finished");
        raw
    }

    fn read_all(bytes: Vec<u8>, compression: CompressionType, crypto: Option<Crypto<'_>>) -> io::Result<Vec<u8>> {
        let mut reader = open_read(Box::new(Cursor::new(bytes)), compression, crypto)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_every_layer_combination_round_trips() {
        let data = sample();
        let keys = password();
        let iv = generate_iv();

        for compression in CompressionType::ALL {
            for encrypted in [false, true] {
                let crypto = encrypted.then_some(Crypto { keys: &keys, iv: &iv });
                let raw = write_all(&data, compression, crypto);
                let back = read_all(raw.contents(), compression, crypto).unwrap();
                assert_eq!(back, data, "{:?} encrypted={}", compression, encrypted);
            }
        }
    }

    #[test]
    fn test_truncated_encrypted_stream_fails() {
        let keys = password();
        let iv = generate_iv();
        let crypto = Some(Crypto { keys: &keys, iv: &iv });
        let mut bytes = write_all(&sample(), CompressionType::None, crypto).contents();
        bytes.truncate(bytes.len() - 100);

        assert!(read_all(bytes, CompressionType::None, crypto).is_err());
    }

    #[test]
    fn test_wrong_password_fails() {
        let keys = password();
        let iv = generate_iv();
        let bytes = write_all(b"secret", CompressionType::Gzip, Some(Crypto { keys: &keys, iv: &iv }))
            .contents();

        let other = KeyMaterial::Password {
            password: "wrong".to_string(),
            salt: b"appvault-salt".to_vec(),
        };
        assert!(read_all(bytes, CompressionType::Gzip, Some(Crypto { keys: &other, iv: &iv })).is_err());
    }

    #[test]
    fn test_setup_errors() {
        let keys = password();
        let raw = Box::new(MemorySink::default());
        let err = open_write(raw, CompressionType::Unsupported, 3, None).err().unwrap();
        assert!(matches!(err, EngineError::CryptoSetup(_)));

        let raw = Box::new(MemorySink::default());
        let err = open_write(raw, CompressionType::None, 3, Some(Crypto { keys: &keys, iv: &[] }))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::CryptoSetup(_)));

        let err = open_read(Box::new(Cursor::new(Vec::new())), CompressionType::Zstd, Some(Crypto { keys: &keys, iv: &[] }))
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Crypto setup failed: IV vector could not be read");
    }

    #[test]
    fn test_unknown_compression_name_deserializes() {
        let t: CompressionType = serde_json::from_str("\"lz4\"").unwrap();
        assert_eq!(t, CompressionType::Unsupported);
        let t: CompressionType = serde_json::from_str("\"zst\"").unwrap();
        assert_eq!(t, CompressionType::Zstd);
    }
}
