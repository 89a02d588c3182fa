//! On-disk segment state.
//!
//! A segment exists when `{job_dir}/{rendition}/segment_{index:03}.ts` is
//! present and non-empty. Nothing else is persisted; staging files end in
//! `.part` and never match the segment pattern. Canonical package segments
//! are named `vod_{index:03}.ts` so they never mix into the progressive set.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use parking_lot::RwLock;
use regex::Regex;

/// File name of a canonical package's media manifest.
pub const CANONICAL_PLAYLIST: &str = "index.m3u8";

/// ffmpeg output pattern of canonical package segments.
pub const CANONICAL_SEGMENT_PATTERN: &str = "vod_%03d.ts";

static SEGMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^segment_(\d+)\.ts$").expect("valid regex"));

static CANONICAL_SEGMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^vod_\d+\.ts$").expect("valid regex"));

/// `segment_007.ts` for index 7; indices past 999 widen naturally.
pub fn segment_file_name(index: u32) -> String {
    format!("segment_{index:03}.ts")
}

/// `vod_007.ts` for index 7 of a canonical package.
pub fn canonical_segment_file_name(index: u32) -> String {
    format!("vod_{index:03}.ts")
}

/// Whether `file_name` is a progressive or canonical segment that may be served.
pub fn is_segment_file(file_name: &str) -> bool {
    SEGMENT_NAME.is_match(file_name) || CANONICAL_SEGMENT_NAME.is_match(file_name)
}

/// Index encoded in a segment file name, `None` for anything else.
pub fn parse_segment_index(file_name: &str) -> Option<u32> {
    SEGMENT_NAME
        .captures(file_name)
        .and_then(|captures| captures.get(1))
        .and_then(|index| index.as_str().parse().ok())
}

/// Read side of segment state, queried by the transcoder and manifest builder.
pub trait SegmentStore: Send + Sync {
    /// Whether segment `index` of `rendition` is complete.
    fn has_segment(&self, rendition: &str, index: u32) -> bool;

    /// Indices of complete segments, ascending.
    fn segment_indices(&self, rendition: &str) -> Vec<u32>;

    /// Canonical `index.m3u8` contents, if the finalization pass produced one.
    fn canonical_playlist(&self, rendition: &str) -> Option<String>;

    fn has_canonical(&self, rendition: &str) -> bool {
        self.canonical_playlist(rendition).is_some()
    }

    fn segment_count(&self, rendition: &str) -> usize {
        self.segment_indices(rendition).len()
    }
}

/// Segment state read straight from a job directory.
#[derive(Debug, Clone)]
pub struct FsSegmentStore {
    root: PathBuf,
}

impl FsSegmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rendition_dir(&self, rendition: &str) -> PathBuf {
        self.root.join(rendition)
    }

    pub fn segment_path(&self, rendition: &str, index: u32) -> PathBuf {
        self.rendition_dir(rendition).join(segment_file_name(index))
    }

    /// Staging path the encoder writes before the rename into place.
    pub fn staging_path(&self, rendition: &str, index: u32) -> PathBuf {
        self.rendition_dir(rendition)
            .join(format!("{}.part", segment_file_name(index)))
    }

    pub fn canonical_path(&self, rendition: &str) -> PathBuf {
        self.rendition_dir(rendition).join(CANONICAL_PLAYLIST)
    }
}

impl SegmentStore for FsSegmentStore {
    fn has_segment(&self, rendition: &str, index: u32) -> bool {
        std::fs::metadata(self.segment_path(rendition, index))
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false)
    }

    fn segment_indices(&self, rendition: &str) -> Vec<u32> {
        let Ok(entries) = std::fs::read_dir(self.rendition_dir(rendition)) else {
            return Vec::new();
        };

        let mut indices: Vec<u32> = entries
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .metadata()
                    .map(|meta| meta.is_file() && meta.len() > 0)
                    .unwrap_or(false)
            })
            .filter_map(|entry| parse_segment_index(&entry.file_name().to_string_lossy()))
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    fn canonical_playlist(&self, rendition: &str) -> Option<String> {
        std::fs::read_to_string(self.canonical_path(rendition)).ok()
    }
}

/// Segment state held in memory, for manifest and service tests.
#[derive(Debug, Default)]
pub struct InMemorySegmentStore {
    segments: RwLock<BTreeMap<String, BTreeSet<u32>>>,
    canonical: RwLock<BTreeMap<String, String>>,
}

impl InMemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, rendition: &str, index: u32) {
        self.segments
            .write()
            .entry(rendition.to_string())
            .or_default()
            .insert(index);
    }

    pub fn set_canonical(&self, rendition: &str, playlist: impl Into<String>) {
        self.canonical
            .write()
            .insert(rendition.to_string(), playlist.into());
    }
}

impl SegmentStore for InMemorySegmentStore {
    fn has_segment(&self, rendition: &str, index: u32) -> bool {
        self.segments
            .read()
            .get(rendition)
            .is_some_and(|indices| indices.contains(&index))
    }

    fn segment_indices(&self, rendition: &str) -> Vec<u32> {
        self.segments
            .read()
            .get(rendition)
            .map(|indices| indices.iter().copied().collect())
            .unwrap_or_default()
    }

    fn canonical_playlist(&self, rendition: &str) -> Option<String> {
        self.canonical.read().get(rendition).cloned()
    }
}
