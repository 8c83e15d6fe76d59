//! Builds the ordered segment list from engine output.

use serde::{Deserialize, Serialize};

use crate::job::Segment;

/// Unit of timestamps reported by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeUnit {
    Seconds,
    Centiseconds,
}

impl TimeUnit {
    pub fn to_seconds(self, value: f64) -> f64 {
        match self {
            Self::Seconds => value,
            Self::Centiseconds => value / 100.0,
        }
    }
}

/// Builds a segment in seconds. A missing `end` falls back to `start`, an
/// `end` before `start` is raised to `start`, and text is trimmed.
pub fn normalize(start: f64, end: Option<f64>, text: &str, unit: TimeUnit) -> Segment {
    let start = unit.to_seconds(start).max(0.0);
    let end = end
        .map(|end| unit.to_seconds(end))
        .filter(|end| end.is_finite())
        .unwrap_or(start)
        .max(start);
    Segment::new(start, end, text.trim())
}

#[derive(Debug, Clone, Default)]
pub struct SegmentAssembler {
    segments: Vec<Segment>,
}

impl SegmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incremental append for streamed segments. Returns `false` when a
    /// segment with the same `(start, text)` is already present.
    pub fn append(&mut self, segment: Segment) -> bool {
        if self.contains(&segment) {
            return false;
        }
        let index = self
            .segments
            .partition_point(|existing| existing.start <= segment.start);
        self.segments.insert(index, segment);
        true
    }

    /// Replaces the list with a full snapshot of decoder output.
    pub fn replace_all<I>(&mut self, segments: I)
    where
        I: IntoIterator<Item = Segment>,
    {
        self.segments = segments.into_iter().collect();
        self.segments.sort_by(|a, b| a.start.total_cmp(&b.start));
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn last_end(&self) -> Option<f64> {
        self.segments.last().map(|segment| segment.end)
    }

    fn contains(&self, segment: &Segment) -> bool {
        self.segments
            .iter()
            .any(|existing| existing.start == segment.start && existing.text == segment.text)
    }
}
