// src/fetch/archives.rs

use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fetch::periods::Period;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Both regular and empty ZIP archives start with these two bytes.
const ZIP_MAGIC: &[u8; 2] = b"PK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStatus {
    Pending,
    Valid,
    Corrupt,
}

/// A downloaded archive bound to exactly one period.
#[derive(Debug, Clone)]
pub struct Archive {
    pub period: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub status: ArchiveStatus,
}

/// How a single download attempt failed; fatal failures skip the retry loop.
enum AttemptError {
    Transient(String),
    Fatal(String),
}

/// Download one period's archive to `<dest_dir>/<period>.zip`, retrying
/// transient failures with exponential backoff. The body streams into a
/// `.part` file which replaces any stale prior download only after the
/// format signature checks out.
pub async fn download_archive(
    client: &Client,
    period: &Period,
    dest_dir: impl AsRef<Path>,
) -> Result<Archive> {
    let dest_dir = dest_dir.as_ref();
    fs::create_dir_all(dest_dir).await?;
    let dest_path = dest_dir.join(format!("{}.zip", period.key));
    let part_path = dest_path.with_extension("zip.part");

    let mut attempt = 0;
    loop {
        attempt += 1;
        match stream_to_file(client, &period.url, &part_path).await {
            Ok(()) => break,
            Err(AttemptError::Fatal(reason)) => {
                let _ = fs::remove_file(&part_path).await;
                return Err(Error::DownloadFailed {
                    period: period.key.clone(),
                    reason,
                });
            }
            Err(AttemptError::Transient(reason)) if attempt < MAX_ATTEMPTS => {
                let backoff = INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1);
                warn!(
                    period = %period.key,
                    attempt,
                    delay_ms = backoff,
                    %reason,
                    "retrying archive download"
                );
                sleep(Duration::from_millis(backoff)).await;
            }
            Err(AttemptError::Transient(reason)) => {
                let _ = fs::remove_file(&part_path).await;
                return Err(Error::DownloadFailed {
                    period: period.key.clone(),
                    reason: format!("retries exhausted: {reason}"),
                });
            }
        }
    }

    let bytes = match validate_signature(&part_path).await {
        Ok(bytes) => bytes,
        Err(reason) => {
            let _ = fs::remove_file(&part_path).await;
            return Err(Error::ArchiveCorrupt {
                period: period.key.clone(),
                reason,
            });
        }
    };

    fs::rename(&part_path, &dest_path).await?;
    info!(period = %period.key, bytes, path = %dest_path.display(), "archive downloaded");

    Ok(Archive {
        period: period.key.clone(),
        path: dest_path,
        bytes,
        status: ArchiveStatus::Valid,
    })
}

async fn stream_to_file(
    client: &Client,
    url: &str,
    part_path: &Path,
) -> std::result::Result<(), AttemptError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| AttemptError::Transient(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let reason = format!("HTTP status {status}");
        return Err(if status.is_client_error() {
            AttemptError::Fatal(reason)
        } else {
            AttemptError::Transient(reason)
        });
    }

    let mut file = fs::File::create(part_path)
        .await
        .map_err(|e| AttemptError::Transient(format!("creating {}: {e}", part_path.display())))?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AttemptError::Transient(e.to_string()))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| AttemptError::Transient(e.to_string()))?;
    }
    file.flush()
        .await
        .map_err(|e| AttemptError::Transient(e.to_string()))?;
    debug!(%url, path = %part_path.display(), "download attempt complete");
    Ok(())
}

/// Check the downloaded file is non-empty and starts with the ZIP magic.
/// Returns the byte size on success, a reason string on failure.
async fn validate_signature(path: &Path) -> std::result::Result<u64, String> {
    let meta = fs::metadata(path)
        .await
        .map_err(|e| format!("reading downloaded file: {e}"))?;
    if meta.len() == 0 {
        return Err("downloaded file is empty".into());
    }

    let mut file = fs::File::open(path)
        .await
        .map_err(|e| format!("reading downloaded file: {e}"))?;
    let mut magic = [0u8; ZIP_MAGIC.len()];
    if file.read_exact(&mut magic).await.is_err() || &magic != ZIP_MAGIC {
        return Err("missing ZIP signature".into());
    }
    Ok(meta.len())
}
