//! Append-only event-playlist writing.
//!
//! Every append is a single write of complete `\n`-terminated lines followed
//! by a flush, so a concurrent loopback reader only ever observes the file at
//! line boundaries.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::errors::PlaylistError;

const PLAYLIST_VERSION: u32 = 7;
const TARGET_DURATION: u32 = 2;

#[derive(Debug)]
pub struct PlaylistWriter {
    path: PathBuf,
    header_written: bool,
    endlist_written: bool,
}

impl PlaylistWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            header_written: false,
            endlist_written: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header_written(&self) -> bool {
        self.header_written
    }

    /// Create the playlist file and emit the fixed preamble. Callable at most
    /// once per session.
    pub async fn write_header(
        &mut self,
        first_sequence: u64,
        first_init_filename: &str,
    ) -> Result<(), PlaylistError> {
        if self.header_written {
            return Err(PlaylistError::HeaderAlreadyWritten);
        }

        let header = format!(
            "#EXTM3U\n\
             #EXT-X-VERSION:{PLAYLIST_VERSION}\n\
             #EXT-X-TARGETDURATION:{TARGET_DURATION}\n\
             #EXT-X-MEDIA-SEQUENCE:{first_sequence}\n\
             #EXT-X-PLAYLIST-TYPE:EVENT\n\
             #EXT-X-MAP:URI=\"{first_init_filename}\"\n"
        );

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        file.write_all(header.as_bytes()).await?;
        file.flush().await?;

        self.header_written = true;
        Ok(())
    }

    /// Introduce a new period: a discontinuity followed by the new map line.
    pub async fn append_new_period(&mut self, init_filename: &str) -> Result<(), PlaylistError> {
        let lines = format!("#EXT-X-DISCONTINUITY\n#EXT-X-MAP:URI=\"{init_filename}\"\n");
        self.append(&lines).await
    }

    /// Append one media entry, optionally preceded by a discontinuity tag.
    pub async fn append_media(
        &mut self,
        filename: &str,
        duration: f64,
        with_discontinuity: bool,
    ) -> Result<(), PlaylistError> {
        let mut lines = String::new();
        if with_discontinuity {
            lines.push_str("#EXT-X-DISCONTINUITY\n");
        }
        lines.push_str(&format!("#EXTINF:{duration:.6},\n{filename}\n"));
        self.append(&lines).await
    }

    /// Terminate the stream. Callable at most once per session.
    pub async fn append_endlist(&mut self) -> Result<(), PlaylistError> {
        if self.endlist_written {
            return Err(PlaylistError::EndlistAlreadyWritten);
        }
        self.append("#EXT-X-ENDLIST\n").await?;
        self.endlist_written = true;
        Ok(())
    }

    async fn append(&mut self, lines: &str) -> Result<(), PlaylistError> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_in(dir: &tempfile::TempDir) -> PlaylistWriter {
        PlaylistWriter::new(dir.path().join("playlist.m3u8"))
    }

    async fn read(writer: &PlaylistWriter) -> String {
        tokio::fs::read_to_string(writer.path()).await.unwrap()
    }

    #[tokio::test]
    async fn header_has_the_fixed_preamble() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(&dir);
        writer.write_header(10, "p0_segment_000010.mp4").await.unwrap();

        assert_eq!(
            read(&writer).await,
            "#EXTM3U\n\
             #EXT-X-VERSION:7\n\
             #EXT-X-TARGETDURATION:2\n\
             #EXT-X-MEDIA-SEQUENCE:10\n\
             #EXT-X-PLAYLIST-TYPE:EVENT\n\
             #EXT-X-MAP:URI=\"p0_segment_000010.mp4\"\n"
        );
    }

    #[tokio::test]
    async fn header_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(&dir);
        writer.write_header(0, "p0_segment_000000.mp4").await.unwrap();
        assert!(matches!(
            writer.write_header(0, "p0_segment_000000.mp4").await,
            Err(PlaylistError::HeaderAlreadyWritten)
        ));
    }

    #[tokio::test]
    async fn media_entries_carry_six_fractional_digits() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(&dir);
        writer.write_header(0, "p0_segment_000000.mp4").await.unwrap();
        writer
            .append_media("p0_segment_000001.m4s", 2.0, false)
            .await
            .unwrap();
        writer
            .append_media("p0_segment_000002.m4s", 1.9666, true)
            .await
            .unwrap();

        let contents = read(&writer).await;
        assert!(contents.contains("#EXTINF:2.000000,\np0_segment_000001.m4s\n"));
        assert!(contents.contains(
            "#EXT-X-DISCONTINUITY\n#EXTINF:1.966600,\np0_segment_000002.m4s\n"
        ));
    }

    #[tokio::test]
    async fn new_periods_follow_a_discontinuity() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(&dir);
        writer.write_header(0, "p0_segment_000000.mp4").await.unwrap();
        writer.append_new_period("p1_segment_000100.mp4").await.unwrap();

        let contents = read(&writer).await;
        assert!(contents.ends_with(
            "#EXT-X-DISCONTINUITY\n#EXT-X-MAP:URI=\"p1_segment_000100.mp4\"\n"
        ));
        assert_eq!(contents.matches("#EXT-X-MAP").count(), 2);
    }

    #[tokio::test]
    async fn endlist_is_write_once_and_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(&dir);
        writer.write_header(0, "p0_segment_000000.mp4").await.unwrap();
        writer
            .append_media("p0_segment_000001.m4s", 2.0, false)
            .await
            .unwrap();
        writer.append_endlist().await.unwrap();
        assert!(matches!(
            writer.append_endlist().await,
            Err(PlaylistError::EndlistAlreadyWritten)
        ));

        let contents = read(&writer).await;
        assert_eq!(contents.matches("#EXT-X-ENDLIST").count(), 1);
        assert!(contents.ends_with("#EXT-X-ENDLIST\n"));
    }
}
