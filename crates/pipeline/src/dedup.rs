//! Temporal deduplication of rectified captures.
//!
//! A capture survives only when its perceptual hash moves far enough
//! from the last emitted capture. Page transitions are never collapsed:
//! the tracker's event flag forces emission regardless of distance.

use drumsheet_core::options::DedupeLevel;
use drumsheet_core::phash::hamming_distance;

use crate::rectify::RectifiedCapture;
use crate::tracker::TrackEvent;

/// Hash and tracker event of one rectified capture; all dedup needs,
/// so the pixel data can stay on disk.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSignature {
    pub frame_index: u64,
    pub hash: u64,
    pub event: TrackEvent,
}

/// Indices of the captures to keep, in input order.
///
/// Guarantees: the result never has more entries than the input,
/// relative order is preserved, and each decision depends only on the
/// captures kept before it (keeping a capture never retroactively
/// suppresses an earlier one). Identical input yields identical output.
pub fn select_captures(signatures: &[CaptureSignature], level: DedupeLevel) -> Vec<usize> {
    let threshold = level.hamming_threshold();
    let mut kept = Vec::with_capacity(signatures.len());
    let mut last_hash: Option<u64> = None;

    for (index, signature) in signatures.iter().enumerate() {
        let emit = match last_hash {
            None => true,
            Some(last) => {
                signature.event == TrackEvent::PageTransition
                    || hamming_distance(signature.hash, last) > threshold
            }
        };
        if emit {
            last_hash = Some(signature.hash);
            kept.push(index);
        }
    }

    let removed = signatures.len() - kept.len();
    if removed > 0 {
        tracing::debug!(removed, kept = kept.len(), "temporal dedupe dropped near-duplicates");
    }
    kept
}

/// In-memory variant over full captures, for callers that already hold
/// the pixel data.
pub fn filter_captures(
    captures: Vec<(RectifiedCapture, TrackEvent)>,
    level: DedupeLevel,
) -> Vec<RectifiedCapture> {
    let signatures: Vec<CaptureSignature> = captures
        .iter()
        .map(|(capture, event)| CaptureSignature {
            frame_index: capture.frame_index,
            hash: capture.hash,
            event: *event,
        })
        .collect();
    let kept = select_captures(&signatures, level);

    let mut kept_iter = kept.into_iter().peekable();
    captures
        .into_iter()
        .enumerate()
        .filter_map(|(index, (capture, _))| {
            if kept_iter.peek() == Some(&index) {
                kept_iter.next();
                Some(capture)
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature(frame_index: u64, hash: u64, event: TrackEvent) -> CaptureSignature {
        CaptureSignature {
            frame_index,
            hash,
            event,
        }
    }

    fn plain(hashes: &[u64]) -> Vec<CaptureSignature> {
        hashes
            .iter()
            .enumerate()
            .map(|(i, h)| signature(i as u64, *h, TrackEvent::None))
            .collect()
    }

    #[test]
    fn identical_hashes_collapse_to_the_first_capture() {
        let sigs = plain(&[0xABCD; 10]);
        assert_eq!(select_captures(&sigs, DedupeLevel::Normal), vec![0]);
    }

    #[test]
    fn distance_must_exceed_the_level_threshold() {
        let sigs = plain(&[
            0,
            // 12 differing bits: exactly at the normal threshold, dropped.
            (1u64 << 12) - 1,
            // 13 differing bits clears it.
            (1u64 << 13) - 1,
        ]);
        assert_eq!(select_captures(&sigs, DedupeLevel::Normal), vec![0, 2]);
    }

    #[test]
    fn sensitivity_levels_change_the_outcome() {
        let sigs = plain(&[0, (1u64 << 7) - 1]);
        assert_eq!(select_captures(&sigs, DedupeLevel::Sensitive), vec![0, 1]);
        assert_eq!(select_captures(&sigs, DedupeLevel::Aggressive), vec![0]);
    }

    #[test]
    fn page_transitions_are_always_emitted() {
        let sigs = vec![
            signature(0, 0, TrackEvent::None),
            signature(1, 0, TrackEvent::PageTransition),
            signature(2, 0, TrackEvent::None),
        ];
        assert_eq!(select_captures(&sigs, DedupeLevel::Normal), vec![0, 1]);
    }

    #[test]
    fn selection_is_idempotent() {
        let sigs = plain(&[0, 1, u64::MAX, u64::MAX ^ 0xFFFF, 7]);
        let once = select_captures(&sigs, DedupeLevel::Normal);
        let surviving: Vec<CaptureSignature> = once.iter().map(|i| sigs[*i]).collect();
        let twice = select_captures(&surviving, DedupeLevel::Normal);
        assert_eq!(twice.len(), once.len());
        assert_eq!(twice, (0..once.len()).collect::<Vec<_>>());
    }

    #[test]
    fn capture_filtering_matches_signature_selection() {
        use image::RgbImage;

        let captures: Vec<(RectifiedCapture, TrackEvent)> = [0u64, 0, u64::MAX]
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                (
                    RectifiedCapture {
                        frame_index: i as u64,
                        image: RgbImage::new(1, 1),
                        hash: *hash,
                        content_box: None,
                    },
                    TrackEvent::None,
                )
            })
            .collect();
        let kept = filter_captures(captures, DedupeLevel::Normal);
        let indices: Vec<u64> = kept.iter().map(|c| c.frame_index).collect();
        assert_eq!(indices, vec![0, 2]);
    }
}
