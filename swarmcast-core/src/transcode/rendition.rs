//! Bitrate ladder.

/// One output quality of the adaptive stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendition {
    /// Directory and manifest name, e.g. `720p`
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    /// Advertised `BANDWIDTH` in the master manifest
    pub bandwidth: u64,
}

impl Rendition {
    pub fn new(
        name: impl Into<String>,
        width: u32,
        height: u32,
        video_bitrate_kbps: u32,
        bandwidth: u64,
    ) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            video_bitrate_kbps,
            bandwidth,
        }
    }

    /// 1080p/720p/480p/360p, highest first.
    pub fn default_ladder() -> Vec<Rendition> {
        vec![
            Rendition::new("1080p", 1920, 1080, 5000, 5_000_000),
            Rendition::new("720p", 1280, 720, 3000, 2_800_000),
            Rendition::new("480p", 854, 480, 1500, 1_400_000),
            Rendition::new("360p", 640, 360, 800, 800_000),
        ]
    }

    /// Rate-control buffer: twice the target bitrate.
    pub fn bufsize_kbps(&self) -> u32 {
        self.video_bitrate_kbps * 2
    }

    /// `WxH`, as used in `RESOLUTION=`.
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Looks up a rendition by name.
pub fn find_rendition<'a>(ladder: &'a [Rendition], name: &str) -> Option<&'a Rendition> {
    ladder.iter().find(|rendition| rendition.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ladder() {
        let ladder = Rendition::default_ladder();
        let names: Vec<&str> = ladder.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["1080p", "720p", "480p", "360p"]);

        let hd = find_rendition(&ladder, "720p").unwrap();
        assert_eq!(hd.resolution(), "1280x720");
        assert_eq!(hd.bufsize_kbps(), 6000);
        assert_eq!(hd.bandwidth, 2_800_000);

        assert!(find_rendition(&ladder, "4k").is_none());
    }
}
