use crate::blob_store::BlobStore;
use anyhow::{Context, Result};
use async_zip::base::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use axum::body::Body;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, instrument, warn};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Write a zip archive of the named blobs to `writer`.
///
/// Each blob becomes one deflated entry named after the blob itself.
/// Blobs that are missing or unreadable are skipped. Returns the number of
/// entries written.
#[instrument(skip(writer, blobs, names), fields(requested = names.len()))]
pub async fn write_archive<W>(writer: W, blobs: &BlobStore, names: &[String]) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut zip = ZipFileWriter::with_tokio(writer);
    let mut entries = 0;

    for name in names {
        let data = match blobs.read(name).await {
            Ok(data) => data,
            Err(e) => {
                warn!(blob = %name, error = %format!("{e:#}"), "Skipping blob missing from archive");
                continue;
            }
        };

        let entry = ZipEntryBuilder::new(name.clone().into(), Compression::Deflate);
        zip.write_entry_whole(entry, &data)
            .await
            .with_context(|| format!("Failed to add {name} to archive"))?;
        entries += 1;
    }

    zip.close().await.context("Failed to finish archive")?;

    debug!(entries, "Archive written");
    metrics::counter!("compressor.archives.entries").increment(entries as u64);

    Ok(entries)
}

/// Stream a zip archive of the named blobs as a response body.
///
/// The archive is produced by a background task through an in-memory pipe,
/// so nothing is buffered on disk. A failure midway truncates the stream.
pub fn archive_body(blobs: Arc<BlobStore>, names: Vec<String>) -> Body {
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);

    tokio::spawn(async move {
        if let Err(e) = write_archive(writer, &blobs, &names).await {
            error!(error = %format!("{e:#}"), "Archive stream aborted");
        }
    });

    Body::from_stream(ReaderStream::new(reader))
}
