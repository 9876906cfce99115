use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tokio::process::Command;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::capture::muxer::PLAYLIST_NAME;

pub const CONTAINER_NAME: &str = "download.m4a";

/// Convert a committed HLS tree into a single downloadable container.
///
/// The external converter reads the stored playlist, copies the audio
/// without re-encoding and stamps the recording's metadata map as container
/// tags. The result is cached inside the recording directory and rebuilt on
/// every request so edited metadata is always reflected.
pub async fn hls_to_container(
    muxer_program: &str,
    recording_dir: &Path,
    metadata: &BTreeMap<String, String>,
) -> anyhow::Result<PathBuf> {
    let manifest = recording_dir.join(PLAYLIST_NAME);
    let output = recording_dir.join(CONTAINER_NAME);

    let mut cmd = Command::new(muxer_program);
    cmd.args(["-y", "-loglevel", "error", "-i"]).arg(&manifest);
    for (key, value) in metadata {
        cmd.arg("-metadata").arg(format!("{key}={value}"));
    }
    cmd.args(["-c", "copy"]).arg(&output);

    debug!("converting {:?} to {:?}", manifest, output);
    let status = cmd
        .status()
        .await
        .with_context(|| format!("spawning converter '{muxer_program}'"))?;
    if !status.success() {
        bail!("converter exited with {status}");
    }
    Ok(output)
}

/// Bundle converted containers into a ZIP with stored (uncompressed)
/// entries, preserving the given order.
pub async fn bundle_zip(entries: Vec<(String, PathBuf)>) -> anyhow::Result<tokio::fs::File> {
    let zip_path = std::env::temp_dir().join(format!("aircheck-bulk-{}.zip", uuid::Uuid::new_v4()));
    let build_path = zip_path.clone();

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let file = std::fs::File::create(&build_path)?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, source) in entries {
            zip.start_file(name, options)?;
            let mut reader = std::fs::File::open(&source)?;
            std::io::copy(&mut reader, &mut zip)?;
        }
        zip.finish()?;
        Ok(())
    })
    .await
    .context("zip build task panicked")??;

    let file = tokio::fs::File::open(&zip_path).await?;
    // The open handle keeps the data readable; the path can go right away.
    let _ = tokio::fs::remove_file(&zip_path).await;
    info!("bulk archive assembled at {:?}", zip_path);
    Ok(file)
}
