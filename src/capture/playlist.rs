use std::io;
use std::path::Path;

use thiserror::Error;

const END_MARKER: &str = "#EXT-X-ENDLIST";

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("missing #EXTM3U header")]
    NotAPlaylist,
    #[error("bad EXTINF line: {0}")]
    BadExtinf(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub duration: f64,
    pub uri: String,
}

/// A parsed HLS media playlist, just deep enough for the commit policy:
/// segment count, captured duration and the end marker.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub target_duration: Option<u64>,
    pub segments: Vec<Segment>,
    pub end_list: bool,
}

impl MediaPlaylist {
    pub fn parse(text: &str) -> Result<Self, PlaylistError> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        if lines.next() != Some("#EXTM3U") {
            return Err(PlaylistError::NotAPlaylist);
        }

        let mut playlist = MediaPlaylist {
            target_duration: None,
            segments: Vec::new(),
            end_list: false,
        };
        let mut pending: Option<f64> = None;
        for line in lines {
            if let Some(rest) = line.strip_prefix("#EXTINF:") {
                let duration = rest
                    .split(',')
                    .next()
                    .and_then(|d| d.trim().parse::<f64>().ok())
                    .ok_or_else(|| PlaylistError::BadExtinf(line.to_string()))?;
                pending = Some(duration);
            } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                playlist.target_duration = rest.trim().parse().ok();
            } else if line == END_MARKER {
                playlist.end_list = true;
            } else if !line.starts_with('#') {
                if let Some(duration) = pending.take() {
                    playlist.segments.push(Segment {
                        duration,
                        uri: line.to_string(),
                    });
                }
            }
        }
        Ok(playlist)
    }

    /// Captured wall-clock duration, the sum of segment durations.
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    pub fn last_segment(&self) -> Option<&Segment> {
        self.segments.last()
    }
}

/// Make the playlist a complete, non-live one. A muxer stopped by force may
/// never write the end marker; playback later is a straight file serve, so
/// the marker is appended before commit. Returns whether the file changed.
pub async fn ensure_end_marker(path: &Path) -> io::Result<bool> {
    let text = tokio::fs::read_to_string(path).await?;
    if text.lines().any(|l| l.trim() == END_MARKER) {
        return Ok(false);
    }
    let mut amended = text;
    if !amended.ends_with('\n') {
        amended.push('\n');
    }
    amended.push_str(END_MARKER);
    amended.push('\n');
    tokio::fs::write(path, amended).await?;
    Ok(true)
}
