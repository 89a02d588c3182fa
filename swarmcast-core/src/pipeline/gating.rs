//! Segment plan and progress gating.
//!
//! Segment `i` covers `[i*d, min((i+1)*d, total))`. During the live phase it
//! may be encoded once download progress reaches
//! `(i+1)*d/total*100 + safety_margin`, or as soon as the transfer seeds.

use std::time::Duration;

/// Residual shorter than this does not get a segment of its own.
const MIN_SLICE_SECONDS: f64 = 0.001;

/// Time range of one segment in the source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentSlice {
    pub index: u32,
    pub start: f64,
    pub duration: f64,
}

/// Segmentation of one source of known duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPlan {
    segment_duration: f64,
    total_duration: f64,
    safety_margin: f64,
}

impl SegmentPlan {
    pub fn new(segment_duration: Duration, total_duration: f64, safety_margin_percent: f64) -> Self {
        Self {
            segment_duration: segment_duration.as_secs_f64().max(MIN_SLICE_SECONDS),
            total_duration: total_duration.max(0.0),
            safety_margin: safety_margin_percent.max(0.0),
        }
    }

    pub fn total_duration(&self) -> f64 {
        self.total_duration
    }

    pub fn segment_duration(&self) -> f64 {
        self.segment_duration
    }

    /// `ceil(total / segment_duration)`.
    pub fn segment_count(&self) -> u32 {
        if self.total_duration < MIN_SLICE_SECONDS {
            return 0;
        }
        let exact = self.total_duration / self.segment_duration;
        let whole = exact.floor();
        let residual = (exact - whole) * self.segment_duration;
        if residual >= MIN_SLICE_SECONDS {
            whole as u32 + 1
        } else {
            whole as u32
        }
    }

    /// Slice of `index`, with the last one clamped to the end of the source.
    pub fn slice(&self, index: u32) -> Option<SegmentSlice> {
        if index >= self.segment_count() {
            return None;
        }
        let start = f64::from(index) * self.segment_duration;
        let duration = self
            .segment_duration
            .min(self.total_duration - start)
            .max(0.0);
        Some(SegmentSlice {
            index,
            start,
            duration,
        })
    }

    /// Progress percent at which the bytes for `index` are expected on disk.
    pub fn required_progress(&self, index: u32) -> f64 {
        if self.total_duration <= 0.0 {
            return 100.0;
        }
        f64::from(index + 1) * self.segment_duration / self.total_duration * 100.0
    }

    /// Live-phase gate for `index`.
    pub fn is_ready(&self, index: u32, progress: f64, seeding: bool) -> bool {
        seeding || progress >= self.required_progress(index) + self.safety_margin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(total: f64) -> SegmentPlan {
        SegmentPlan::new(Duration::from_secs(10), total, 5.0)
    }

    #[test]
    fn test_partial_last_segment() {
        let plan = plan(95.0);
        assert_eq!(plan.segment_count(), 10);

        let last = plan.slice(9).unwrap();
        assert_eq!(last.start, 90.0);
        assert_eq!(last.duration, 5.0);
        assert!(plan.slice(10).is_none());

        let first = plan.slice(0).unwrap();
        assert_eq!((first.start, first.duration), (0.0, 10.0));
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        assert_eq!(plan(100.0).segment_count(), 10);
        assert_eq!(plan(0.0).segment_count(), 0);
        assert_eq!(plan(3.0).segment_count(), 1);
    }

    #[test]
    fn test_gate_includes_safety_margin() {
        let plan = plan(100.0);
        // index 0 needs 10% + 5%
        assert!(!plan.is_ready(0, 14.9, false));
        assert!(plan.is_ready(0, 15.0, false));
        assert!(plan.is_ready(0, 0.0, true));

        // last index can only go through the live gate once seeding
        assert!(!plan.is_ready(9, 100.0, false));
        assert!(plan.is_ready(9, 100.0, true));
    }
}
