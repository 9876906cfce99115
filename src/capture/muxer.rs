use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

pub const PLAYLIST_NAME: &str = "recording.m3u8";
pub const SEGMENTS_DIR: &str = "segments";

/// Argument contract of the external segment muxer: pull the live HLS
/// source, reconnect across network hiccups, drop any video stream, copy
/// the audio without re-encoding, and emit an unbounded segment playlist.
#[derive(Debug, Clone)]
pub struct MuxerCommand {
    pub program: String,
    pub loglevel: String,
    pub segment_seconds: u32,
}

impl MuxerCommand {
    /// Build the capture invocation. Output paths are relative; the staging
    /// directory is the working directory so the playlist references
    /// `segments/NNNNN.ts` and the tree stays relocatable at commit.
    pub fn capture(&self, hls_url: &str, staging_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-y", "-loglevel", &self.loglevel])
            .args([
                "-reconnect",
                "1",
                "-reconnect_streamed",
                "1",
                "-reconnect_on_network_error",
                "1",
                "-reconnect_at_eof",
                "1",
                "-rw_timeout",
                "15000000",
            ])
            .args(["-i", hls_url])
            .args(["-vn", "-c", "copy"])
            .args(["-f", "hls"])
            .args(["-hls_time", &self.segment_seconds.to_string()])
            .args(["-hls_list_size", "0"])
            .args([
                "-hls_segment_filename",
                &format!("{SEGMENTS_DIR}/%05d.ts"),
            ])
            .arg(PLAYLIST_NAME)
            .current_dir(staging_dir)
            .stdin(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Ask the muxer to finish cleanly (`q` on stdin, the conventional quit
/// command), then escalate to a kill after the grace period.
pub async fn stop_gracefully(child: &mut Child, grace: Duration) -> io::Result<()> {
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(b"q").await;
        let _ = stdin.flush().await;
        drop(stdin);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            debug!("muxer stopped: {:?}", status?);
        }
        Err(_) => {
            warn!("muxer ignored quit request, killing");
            child.start_kill()?;
            let _ = child.wait().await;
        }
    }
    Ok(())
}
