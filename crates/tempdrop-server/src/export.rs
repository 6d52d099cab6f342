//! Streaming zip export of every live file

use crate::server::SharedState;
use async_zip::base::write::ZipFileWriter;
use async_zip::error::ZipError;
use async_zip::{Compression, ZipEntryBuilder};
use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use ephemeral_registry::{ObjectRecord, Registry};
use std::collections::HashSet;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

pub const ARCHIVE_NAME: &str = "all_files.zip";

/// Bytes buffered between the archive writer and the response body
const PIPE_BUFFER: usize = 64 * 1024;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub entries: usize,
    pub skipped: usize,
    pub truncated: usize,
}

/// Hands out archive entry names, suffixing repeats as `name (1).ext`
#[derive(Default)]
struct EntryNames {
    seen: HashSet<String>,
}

impl EntryNames {
    fn unique(&mut self, name: &str) -> String {
        if self.seen.insert(name.to_string()) {
            return name.to_string();
        }

        let (stem, ext) = match name.rfind('.') {
            Some(i) if i > 0 => name.split_at(i),
            _ => (name, ""),
        };
        let mut n = 1;
        loop {
            let candidate = format!("{} ({}){}", stem, n, ext);
            if self.seen.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Write `records` as a deflate zip into `out`, one entry at a time.
///
/// Entries whose content has vanished are skipped. A read failure part way
/// through an entry closes it truncated and the export moves on; only a
/// failure to write the archive itself aborts.
pub async fn write_archive<W>(
    registry: &Registry,
    records: &[ObjectRecord],
    out: W,
) -> Result<ExportSummary, ZipError>
where
    W: AsyncWrite + Unpin,
{
    let mut zip = ZipFileWriter::with_tokio(out);
    let mut names = EntryNames::default();
    let mut summary = ExportSummary::default();

    for record in records {
        let reader = match registry.open_content(&record.id).await {
            Ok(Some((_, reader))) => reader,
            Ok(None) => {
                warn!(id = %record.id, "File vanished before export, skipping");
                summary.skipped += 1;
                continue;
            }
            Err(e) => {
                warn!(id = %record.id, error = %e, "Failed to open file for export, skipping");
                summary.skipped += 1;
                continue;
            }
        };

        let name = names.unique(&record.display_name);
        let builder = ZipEntryBuilder::new(name.clone().into(), Compression::Deflate);
        let mut entry = zip.write_entry_stream(builder).await?;

        if let Err(e) = futures::io::copy(&mut reader.compat(), &mut entry).await {
            warn!(id = %record.id, name = %name, error = %e, "Export entry truncated");
            summary.truncated += 1;
        }
        entry.close().await?;
        summary.entries += 1;
    }

    let mut out = zip.close().await?.into_inner();
    out.flush().await?;
    Ok(summary)
}

/// `GET /download-all`
pub async fn download_all(State(state): State<SharedState>) -> Response {
    let records = state.registry.list().await;
    let (reader, writer) = tokio::io::duplex(PIPE_BUFFER);

    let registry = state.registry.clone();
    tokio::spawn(async move {
        match write_archive(&registry, &records, writer).await {
            Ok(summary) => info!(
                entries = summary.entries,
                skipped = summary.skipped,
                truncated = summary.truncated,
                "Archive export finished"
            ),
            Err(e) => warn!(error = %e, "Archive export aborted"),
        }
    });

    (
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", ARCHIVE_NAME),
            ),
        ],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response()
}
