//! Plain-text and SRT renderings of a finished transcript.

use crate::job::Segment;

/// `MM:SS`, or `HH:MM:SS` once the hour is reached.
pub fn format_timestamp(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "00:00".to_string();
    }
    let total = seconds.floor() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

pub fn segments_to_text(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|segment| {
            format!(
                "[{}] --> [{}]\n{}",
                format_timestamp(segment.start),
                format_timestamp(segment.end),
                segment.text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn segments_to_srt(segments: &[Segment]) -> String {
    let mut out = String::new();
    for (index, segment) in segments.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            srt_time(segment.start),
            srt_time(segment.end),
            segment.text.trim()
        ));
    }
    out
}

fn srt_time(seconds: f64) -> String {
    let total_ms = if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1000.0).round() as u64
    } else {
        0
    };
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{hours:02}:{minutes:02}:{secs:02},{millis:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_switch_to_hours() {
        assert_eq!(format_timestamp(0.0), "00:00");
        assert_eq!(format_timestamp(75.9), "01:15");
        assert_eq!(format_timestamp(3725.0), "01:02:05");
        assert_eq!(format_timestamp(f64::NAN), "00:00");
    }

    #[test]
    fn text_blocks_are_separated_by_blank_line() {
        let text = segments_to_text(&[
            Segment::new(0.0, 2.0, " Hello "),
            Segment::new(2.0, 4.5, "world"),
        ]);
        assert_eq!(text, "[00:00] --> [00:02]\nHello\n\n[00:02] --> [00:04]\nworld");
    }

    #[test]
    fn srt_uses_millisecond_commas() {
        let srt = segments_to_srt(&[Segment::new(1.25, 3661.5, "hi")]);
        assert_eq!(srt, "1\n00:00:01,250 --> 01:01:01,500\nhi\n\n");
    }
}
