//! HLS playlist generation

use crate::types::HlsSegment;

/// One variant entry of the master playlist
#[derive(Debug, Clone, PartialEq)]
pub struct VariantStream {
    /// Quality name, also the variant playlist's basename ("720p")
    pub name: String,
    /// Peak bandwidth in bits per second
    pub bandwidth: u64,
    /// "WxH"
    pub resolution: String,
}

/// Master playlist. Variants are emitted in ascending bandwidth order
/// regardless of input order.
pub fn master_playlist(variants: &[VariantStream]) -> String {
    let mut sorted: Vec<&VariantStream> = variants.iter().collect();
    sorted.sort_by_key(|v| v.bandwidth);

    let mut lines = vec!["#EXTM3U".to_string(), "#EXT-X-VERSION:3".to_string()];
    for variant in sorted {
        lines.push(format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}",
            variant.bandwidth, variant.resolution
        ));
        lines.push(format!("{}.m3u8", variant.name));
    }
    lines.join("\n")
}

/// VOD variant playlist: full timeline, terminated by ENDLIST.
pub fn variant_playlist(segments: &[HlsSegment]) -> String {
    let mut lines = playlist_header(segments, 0);
    push_segments(&mut lines, segments);
    lines.push("#EXT-X-ENDLIST".to_string());
    lines.join("\n")
}

/// Live variant playlist: caller-provided media sequence, no ENDLIST.
pub fn live_playlist(segments: &[HlsSegment], sequence_no: u64) -> String {
    let mut lines = playlist_header(segments, sequence_no);
    push_segments(&mut lines, segments);
    lines.join("\n")
}

fn playlist_header(segments: &[HlsSegment], sequence_no: u64) -> Vec<String> {
    let max_duration = segments
        .iter()
        .map(|s| s.duration_seconds)
        .fold(0.0f64, f64::max);
    vec![
        "#EXTM3U".to_string(),
        "#EXT-X-VERSION:3".to_string(),
        format!("#EXT-X-TARGETDURATION:{}", max_duration.ceil() as u64),
        format!("#EXT-X-MEDIA-SEQUENCE:{}", sequence_no),
    ]
}

fn push_segments(lines: &mut Vec<String>, segments: &[HlsSegment]) {
    for segment in segments {
        lines.push(format!("#EXTINF:{:.6},", segment.duration_seconds));
        lines.push(segment.filename.clone());
    }
}

/// Parse a variant playlist back into its segment timeline. Used to verify
/// the round-trip property and by the live-playlist tooling.
pub fn parse_variant_playlist(text: &str) -> Vec<HlsSegment> {
    let mut segments = Vec::new();
    let mut pending_duration: Option<f64> = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            pending_duration = rest.trim_end_matches(',').parse::<f64>().ok();
        } else if !line.starts_with('#') && !line.is_empty() {
            if let Some(duration) = pending_duration.take() {
                segments.push(HlsSegment {
                    index: segments.len() as u32,
                    filename: line.to_string(),
                    duration_seconds: duration,
                });
            }
        }
    }
    segments
}
