// dbshuttle/src/pipeline/gzip.rs
use bytes::Bytes;
use flate2::Compression;
use flate2::write::{GzDecoder, GzEncoder};
use std::io::Write;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::errors::{AppError, Result};
use crate::progress::ProgressHandle;

/// Compresses chunks from `input` and forwards the gzip stream to `output`.
///
/// The encoder writes into a scratch buffer that is drained downstream after
/// every input chunk, so the stage never holds more than one chunk's worth
/// of compressed output; the bounded channels on both sides carry the
/// backpressure. Returns the number of raw bytes consumed.
///
/// When `progress` is supplied (a local-destination backup, where this is
/// the only stage that sees byte counts) consumed bytes are reported with
/// an unknown total.
pub async fn compress(
    mut input: Receiver<Bytes>,
    output: Sender<Bytes>,
    progress: Option<ProgressHandle>,
) -> Result<u64> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut consumed = 0u64;
    if let Some(p) = &progress {
        p.report(0, None).await;
    }
    while let Some(chunk) = input.recv().await {
        encoder.write_all(&chunk).map_err(AppError::Compression)?;
        consumed += chunk.len() as u64;
        if !encoder.get_ref().is_empty() {
            let produced = std::mem::take(encoder.get_mut());
            if output.send(Bytes::from(produced)).await.is_err() {
                // Consumer went away: the coordinator owns whatever failed it.
                return Ok(consumed);
            }
        }
        if let Some(p) = &progress {
            p.report(consumed, None).await;
        }
    }
    let tail = encoder.finish().map_err(AppError::Compression)?;
    if !tail.is_empty() {
        let _ = output.send(Bytes::from(tail)).await;
    }
    Ok(consumed)
}

/// Inflates a gzip stream arriving on `input` and forwards the plain bytes
/// to `output`. Malformed or truncated input fails the stage with a
/// compression error. Returns the number of decompressed bytes produced.
pub async fn decompress(mut input: Receiver<Bytes>, output: Sender<Bytes>) -> Result<u64> {
    let mut decoder = GzDecoder::new(Vec::new());
    let mut produced = 0u64;
    while let Some(chunk) = input.recv().await {
        decoder.write_all(&chunk).map_err(AppError::Compression)?;
        if !decoder.get_ref().is_empty() {
            let plain = std::mem::take(decoder.get_mut());
            produced += plain.len() as u64;
            if output.send(Bytes::from(plain)).await.is_err() {
                return Ok(produced);
            }
        }
    }
    let tail = decoder.finish().map_err(AppError::Compression)?;
    if !tail.is_empty() {
        produced += tail.len() as u64;
        let _ = output.send(Bytes::from(tail)).await;
    }
    Ok(produced)
}
