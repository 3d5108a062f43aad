//! Buffered and streaming digest verification.

use std::io;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

use crate::digest::{Digest, Hasher};
use crate::error::{DigestError, StreamError};

/// Incremental verifier for one expected digest.
///
/// Feed it content with [`Verifier::update`] (or through `io::Write`) and
/// call [`Verifier::finish`] once the content is complete.
#[derive(Clone)]
pub struct Verifier {
    expected: Digest,
    hasher: Hasher,
    written: u64,
}

impl Verifier {
    /// Create a verifier using the algorithm named by `expected`.
    pub fn new(expected: &Digest) -> Self {
        Self {
            expected: expected.clone(),
            hasher: expected.algorithm().hasher(),
            written: 0,
        }
    }

    /// Hash another chunk of content.
    pub fn update(&mut self, data: &[u8]) {
        self.written += data.len() as u64;
        self.hasher.update(data);
    }

    /// Bytes hashed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Returns true if the content seen so far matches the expected digest.
    pub fn verified(&self) -> bool {
        self.actual() == self.expected
    }

    /// Consume the verifier and compare against the expected digest.
    pub fn finish(self) -> Result<(), DigestError> {
        let actual = self.actual();
        if actual == self.expected {
            Ok(())
        } else {
            Err(DigestError::Mismatch {
                expected: self.expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }

    fn actual(&self) -> Digest {
        Digest::from_parts(
            self.expected.algorithm(),
            self.hasher.clone().finalize_hex(),
        )
    }
}

impl io::Write for Verifier {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Verify a fully buffered object.
pub fn verify_bytes(expected: &Digest, data: &[u8]) -> Result<(), DigestError> {
    let mut verifier = Verifier::new(expected);
    verifier.update(data);
    verifier.finish()
}

/// Drain `stream`, hashing every chunk as it arrives, and return the content
/// once it has verified against `expected`.
///
/// `limit` bounds the number of bytes accepted; exceeding it stops the read
/// with [`DigestError::TooLarge`] before the rest of the stream is pulled.
pub async fn verify_stream<S, E>(
    expected: &Digest,
    stream: S,
    limit: Option<u64>,
) -> Result<Bytes, StreamError<E>>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    futures_util::pin_mut!(stream);

    let mut verifier = Verifier::new(expected);
    let mut buf = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(StreamError::Stream)?;
        if let Some(limit) = limit {
            if verifier.written() + chunk.len() as u64 > limit {
                return Err(DigestError::TooLarge { limit }.into());
            }
        }
        verifier.update(&chunk);
        buf.extend_from_slice(&chunk);
    }

    verifier.finish()?;
    Ok(buf.freeze())
}
