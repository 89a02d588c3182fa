//! HLS manifests built from on-disk segment state.
//!
//! The master manifest lists every rendition that has output. A rendition's
//! media manifest is its canonical `index.m3u8` once the job is `READY`, and
//! otherwise an EVENT playlist assembled from the progressive segment files.
//! The end marker appears only for a `READY` job.

use std::fmt::Write as _;
use std::time::Duration;

use crate::jobs::JobStatus;
use crate::transcode::{Rendition, SegmentStore, find_rendition, segment_file_name};

/// Errors from manifest queries.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("No segments available yet")]
    Pending,

    #[error("Unknown rendition {name}")]
    UnknownRendition { name: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// URL of a rendition's media manifest under `base`.
pub fn media_playlist_url(base: &str, rendition: &str) -> String {
    format!("{base}/playlist?res={rendition}")
}

/// URL of one segment file under `base`.
pub fn segment_url(base: &str, rendition: &str, file: &str) -> String {
    format!("{base}/segments/{rendition}/{file}")
}

/// Builds master and media manifests for one ladder.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    ladder: Vec<Rendition>,
    segment_duration: Duration,
}

impl ManifestBuilder {
    pub fn new(ladder: Vec<Rendition>, segment_duration: Duration) -> Self {
        Self {
            ladder,
            segment_duration,
        }
    }

    pub fn ladder(&self) -> &[Rendition] {
        &self.ladder
    }

    /// Renditions that have at least one segment or a canonical package.
    pub fn available_renditions<'a>(&'a self, store: &dyn SegmentStore) -> Vec<&'a Rendition> {
        self.ladder
            .iter()
            .filter(|rendition| {
                store.has_canonical(&rendition.name) || store.segment_count(&rendition.name) > 0
            })
            .collect()
    }

    /// Master manifest pointing at every available rendition.
    ///
    /// # Errors
    /// - `ManifestError::Pending` - No rendition has any output yet
    pub fn master(&self, store: &dyn SegmentStore, base_url: &str) -> Result<String, ManifestError> {
        let available = self.available_renditions(store);
        if available.is_empty() {
            return Err(ManifestError::Pending);
        }

        let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
        for rendition in available {
            let _ = writeln!(
                out,
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={},NAME=\"{}\"",
                rendition.bandwidth,
                rendition.resolution(),
                rendition.name
            );
            let _ = writeln!(out, "{}", media_playlist_url(base_url, &rendition.name));
        }
        Ok(out)
    }

    /// Media manifest of one rendition.
    ///
    /// A `READY` job serves its canonical package when there is one, else the
    /// progressive segments as VOD with an end marker. Before that the
    /// progressive segments are served as an EVENT playlist; a canonical
    /// package is only used if no progressive segment exists, with its
    /// VOD markers removed.
    ///
    /// # Errors
    /// - `ManifestError::UnknownRendition` - Name not in the ladder
    /// - `ManifestError::Pending` - Rendition has no segments yet
    pub fn media(
        &self,
        store: &dyn SegmentStore,
        rendition: &str,
        status: JobStatus,
        base_url: &str,
    ) -> Result<String, ManifestError> {
        let rendition = find_rendition(&self.ladder, rendition).ok_or_else(|| {
            ManifestError::UnknownRendition {
                name: rendition.to_string(),
            }
        })?;

        let finished = status == JobStatus::Ready;
        let canonical = store.canonical_playlist(&rendition.name);
        if let (true, Some(canonical)) = (finished, &canonical) {
            return Ok(rewrite_canonical(canonical, base_url, &rendition.name, true));
        }

        let indices = store.segment_indices(&rendition.name);
        if indices.is_empty() {
            return match canonical {
                Some(canonical) => Ok(rewrite_canonical(
                    &canonical,
                    base_url,
                    &rendition.name,
                    finished,
                )),
                None => Err(ManifestError::Pending),
            };
        }

        let target = self.segment_duration.as_secs_f64().ceil() as u64;

        let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target}");
        out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
        out.push_str(if finished {
            "#EXT-X-PLAYLIST-TYPE:VOD\n"
        } else {
            "#EXT-X-PLAYLIST-TYPE:EVENT\n"
        });
        for index in indices {
            let _ = writeln!(out, "#EXTINF:{target}.0,");
            let _ = writeln!(
                out,
                "{}",
                segment_url(base_url, &rendition.name, &segment_file_name(index))
            );
        }
        if finished {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        Ok(out)
    }
}

/// Points the segment lines of a canonical playlist at segment URLs. Unless
/// `finished`, the playlist is turned into an open EVENT playlist.
fn rewrite_canonical(playlist: &str, base_url: &str, rendition: &str, finished: bool) -> String {
    let mut out = String::with_capacity(playlist.len() * 2);
    for line in playlist.lines() {
        let trimmed = line.trim();
        if !finished && trimmed == "#EXT-X-ENDLIST" {
            continue;
        }
        if !finished && trimmed.starts_with("#EXT-X-PLAYLIST-TYPE:") {
            out.push_str("#EXT-X-PLAYLIST-TYPE:EVENT\n");
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else {
            let file = trimmed.rsplit('/').next().unwrap_or(trimmed);
            out.push_str(&segment_url(base_url, rendition, file));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::InMemorySegmentStore;

    const BASE: &str = "/api/jobs/abc";

    fn builder() -> ManifestBuilder {
        ManifestBuilder::new(Rendition::default_ladder(), Duration::from_secs(10))
    }

    #[test]
    fn test_master_lists_only_renditions_with_output() {
        let store = InMemorySegmentStore::new();
        assert!(matches!(
            builder().master(&store, BASE),
            Err(ManifestError::Pending)
        ));

        store.insert("720p", 0);
        store.set_canonical("360p", "#EXTM3U\n");
        let master = builder().master(&store, BASE).unwrap();

        assert!(master.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(master.contains(
            "#EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1280x720,NAME=\"720p\"\n/api/jobs/abc/playlist?res=720p\n"
        ));
        assert!(master.contains("NAME=\"360p\""));
        assert!(!master.contains("1080p"));
    }

    #[test]
    fn test_media_event_until_ready() {
        let store = InMemorySegmentStore::new();
        for index in [3, 1, 2, 0] {
            store.insert("480p", index);
        }

        let live = builder()
            .media(&store, "480p", JobStatus::DownloadingAndTranscoding, BASE)
            .unwrap();
        assert!(live.contains("#EXT-X-TARGETDURATION:10\n"));
        assert!(live.contains("#EXT-X-PLAYLIST-TYPE:EVENT\n"));
        assert!(!live.contains("#EXT-X-ENDLIST"));

        let order: Vec<&str> = live.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(
            order,
            [
                "/api/jobs/abc/segments/480p/segment_000.ts",
                "/api/jobs/abc/segments/480p/segment_001.ts",
                "/api/jobs/abc/segments/480p/segment_002.ts",
                "/api/jobs/abc/segments/480p/segment_003.ts",
            ]
        );
        assert_eq!(live.matches("#EXTINF:10.0,").count(), 4);

        let done = builder().media(&store, "480p", JobStatus::Ready, BASE).unwrap();
        assert!(done.contains("#EXT-X-PLAYLIST-TYPE:VOD\n"));
        assert!(done.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn test_media_errors() {
        let store = InMemorySegmentStore::new();
        assert!(matches!(
            builder().media(&store, "4k", JobStatus::Ready, BASE),
            Err(ManifestError::UnknownRendition { .. })
        ));
        assert!(matches!(
            builder().media(&store, "720p", JobStatus::Downloading, BASE),
            Err(ManifestError::Pending)
        ));
    }

    const CANONICAL: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:10.000000,\nvod_000.ts\n#EXTINF:4.5,\nvod_001.ts\n#EXT-X-ENDLIST\n";

    #[test]
    fn test_canonical_playlist_is_rewritten() {
        let store = InMemorySegmentStore::new();
        store.insert("720p", 0);
        store.set_canonical("720p", CANONICAL);

        let media = builder()
            .media(&store, "720p", JobStatus::Ready, BASE)
            .unwrap();
        assert!(media.contains("#EXTINF:4.5,\n/api/jobs/abc/segments/720p/vod_001.ts\n"));
        assert!(media.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn test_canonical_package_has_no_end_marker_before_ready() {
        let store = InMemorySegmentStore::new();
        store.set_canonical("720p", CANONICAL);

        // Only the canonical package exists: served open-ended.
        let media = builder()
            .media(&store, "720p", JobStatus::DownloadingAndTranscoding, BASE)
            .unwrap();
        assert!(!media.contains("#EXT-X-ENDLIST"));
        assert!(!media.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
        assert!(media.contains("#EXT-X-PLAYLIST-TYPE:EVENT\n"));
        assert!(media.contains("/api/jobs/abc/segments/720p/vod_000.ts\n"));

        // Progressive segments win until the job is READY.
        store.insert("720p", 0);
        let media = builder()
            .media(&store, "720p", JobStatus::Error, BASE)
            .unwrap();
        assert!(!media.contains("#EXT-X-ENDLIST"));
        assert!(media.contains("/api/jobs/abc/segments/720p/segment_000.ts\n"));
        assert!(!media.contains("vod_"));
    }
}
