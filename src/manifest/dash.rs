//! DASH MPD generation

use chrono::{DateTime, Utc};

use crate::types::DashSegment;

/// One adaptation set (a single representation per set in this pipeline)
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationSet {
    /// Also the directory prefix of the set's segments ("video_720p")
    pub id: String,
    pub mime_type: String,
    pub codecs: String,
    pub width: u32,
    pub height: u32,
    /// Peak bandwidth in bits per second
    pub bandwidth: u64,
    /// Explicit timeline; when absent the static MPD falls back to a fixed
    /// segment duration on the template
    pub segment_timeline: Option<Vec<DashSegment>>,
    /// First segment number; 1 for VOD, carried from the caller for live
    pub start_number: u32,
}

/// Static (VOD) MPD.
pub fn static_mpd(
    adaptations: &[AdaptationSet],
    duration_seconds: f64,
    default_segment_duration_ms: u64,
) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    xml.push_str(&format!(
        "<MPD xmlns=\"urn:mpeg:dash:schema:mpd:2011\" \
         profiles=\"urn:mpeg:dash:profile:isoff-live:2011\" type=\"static\" \
         minBufferTime=\"PT2S\" mediaPresentationDuration=\"PT{:.3}S\">\n",
        duration_seconds
    ));
    xml.push_str("  <Period id=\"1\" start=\"PT0S\">\n");
    for adaptation in sorted_by_bandwidth(adaptations) {
        push_adaptation(&mut xml, adaptation, Some(default_segment_duration_ms));
    }
    xml.push_str("  </Period>\n");
    xml.push_str("</MPD>\n");
    xml
}

/// Dynamic (live) MPD. `publish_time` is supplied by the caller so the
/// builder itself stays a pure function.
pub fn live_mpd(adaptations: &[AdaptationSet], publish_time: DateTime<Utc>) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    xml.push_str(&format!(
        "<MPD xmlns=\"urn:mpeg:dash:schema:mpd:2011\" \
         profiles=\"urn:mpeg:dash:profile:isoff-live:2011\" type=\"dynamic\" \
         minBufferTime=\"PT2S\" timeShiftBufferDepth=\"PT30S\" \
         availabilityStartTime=\"1970-01-01T00:00:00Z\" publishTime=\"{}\">\n",
        publish_time.format("%Y-%m-%dT%H:%M:%SZ")
    ));
    xml.push_str("  <Period id=\"1\" start=\"PT0S\">\n");
    for adaptation in sorted_by_bandwidth(adaptations) {
        // a live MPD without a timeline is not playable
        push_adaptation(&mut xml, adaptation, None);
    }
    xml.push_str("  </Period>\n");
    xml.push_str("</MPD>\n");
    xml
}

fn sorted_by_bandwidth(adaptations: &[AdaptationSet]) -> Vec<&AdaptationSet> {
    let mut sorted: Vec<&AdaptationSet> = adaptations.iter().collect();
    sorted.sort_by_key(|a| a.bandwidth);
    sorted
}

fn push_adaptation(
    xml: &mut String,
    adaptation: &AdaptationSet,
    fallback_duration_ms: Option<u64>,
) {
    xml.push_str(&format!(
        "    <AdaptationSet id=\"{}\" mimeType=\"{}\" codecs=\"{}\" startWithSAP=\"1\">\n",
        escape(&adaptation.id),
        escape(&adaptation.mime_type),
        escape(&adaptation.codecs)
    ));
    xml.push_str(&format!(
        "      <Representation id=\"{}\" width=\"{}\" height=\"{}\" bandwidth=\"{}\">\n",
        escape(&adaptation.id),
        adaptation.width,
        adaptation.height,
        adaptation.bandwidth
    ));

    let template_attrs = format!(
        "initialization=\"{id}/init.mp4\" media=\"{id}/segment-$Number$.m4s\" \
         timescale=\"1000\" startNumber=\"{start}\"",
        id = escape(&adaptation.id),
        start = adaptation.start_number
    );

    match (&adaptation.segment_timeline, fallback_duration_ms) {
        (Some(timeline), _) => {
            xml.push_str(&format!("        <SegmentTemplate {}>\n", template_attrs));
            xml.push_str("          <SegmentTimeline>\n");
            for segment in timeline {
                xml.push_str(&format!(
                    "            <S t=\"{}\" d=\"{}\"/>\n",
                    segment.start_ms, segment.duration_ms
                ));
            }
            xml.push_str("          </SegmentTimeline>\n");
            xml.push_str("        </SegmentTemplate>\n");
        }
        (None, Some(duration_ms)) => {
            xml.push_str(&format!(
                "        <SegmentTemplate {} duration=\"{}\"/>\n",
                template_attrs, duration_ms
            ));
        }
        (None, None) => {
            // timeline is mandatory for dynamic MPDs; emit an empty one
            // rather than an unbounded template
            xml.push_str(&format!("        <SegmentTemplate {}>\n", template_attrs));
            xml.push_str("          <SegmentTimeline>\n");
            xml.push_str("          </SegmentTimeline>\n");
            xml.push_str("        </SegmentTemplate>\n");
        }
    }

    xml.push_str("      </Representation>\n");
    xml.push_str("    </AdaptationSet>\n");
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
