//! Asynchronous strip pipeline.
//!
//! Runs after a metadata miss has been served: the compressed upstream
//! body is staged to disk, decompressed, parsed, trimmed, and written to
//! the cache store.  Failures are logged and leave the raw staging file
//! in place so the next miss for the package overwrites it; the client
//! response is never affected.

use std::io::Read;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::stats::StatsSink;
use crate::store::CacheStore;
use crate::trim::trim;

/// Stage, decompress, trim and cache one upstream body.  Returns the
/// parsed full document so the caller can hand it to the prefetcher.
///
/// Replaying the pipeline on the same input produces the same cache file.
pub async fn strip_and_cache(
    store: &CacheStore,
    stats: &StatsSink,
    name: &str,
    body: Bytes,
    content_encoding: Option<&str>,
) -> Result<Value> {
    store.raw_put(name, &body).await?;

    // Decompress, parse and re-serialize off the async threads; registry
    // documents reach tens of megabytes.
    let encoding = content_encoding.map(str::to_string);
    let (raw_len, doc, trimmed_bytes) = tokio::task::spawn_blocking(move || {
        let raw = decompress(&body, encoding.as_deref())?;
        let doc: Value = serde_json::from_slice(&raw).context("upstream body is not JSON")?;
        let trimmed = trim(&doc);
        let bytes = serde_json::to_vec(&trimmed).context("failed to serialize trimmed document")?;
        Ok::<_, anyhow::Error>((raw.len() as u64, doc, bytes))
    })
    .await
    .context("strip worker task failed")??;

    store.put(name, &trimmed_bytes).await?;
    store.raw_delete(name).await?;
    stats
        .record_strip(name, raw_len, trimmed_bytes.len() as u64)
        .await;

    debug!(
        package = %name,
        raw_bytes = raw_len,
        stripped_bytes = trimmed_bytes.len(),
        "stripped and cached"
    );
    Ok(doc)
}

/// Decode an upstream body according to its `content-encoding`.  Absent
/// or unrecognised encodings are treated as identity.
fn decompress(body: &[u8], encoding: Option<&str>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match encoding.unwrap_or("identity") {
        "br" => {
            brotli::Decompressor::new(body, 4096)
                .read_to_end(&mut out)
                .context("brotli decode failed")?;
        }
        "gzip" => {
            flate2::read::GzDecoder::new(body)
                .read_to_end(&mut out)
                .context("gzip decode failed")?;
        }
        "deflate" => {
            flate2::read::ZlibDecoder::new(body)
                .read_to_end(&mut out)
                .context("deflate decode failed")?;
        }
        _ => out.extend_from_slice(body),
    }
    Ok(out)
}
