//! Encoded video packet handed from the encoder to the broadcast sender.

use std::time::Instant;

use bytes::Bytes;

// MARK: - Replacement

/// One in-place byte-sequence replacement the sender applies while slicing
/// the access unit into datagrams. Produced by the bitstream post-processor
/// for SPS/VUI fix-ups; replacements are applied in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub old: Bytes,
    pub new: Bytes,
}

impl Replacement {
    pub fn new(old: impl Into<Bytes>, new: impl Into<Bytes>) -> Self {
        Self { old: old.into(), new: new.into() }
    }

    /// Apply every replacement to `data`, in order. A replacement whose
    /// `old` sequence is absent is skipped.
    pub fn apply_all(replacements: &[Replacement], data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        for rep in replacements {
            if let Some(pos) = find(&out, &rep.old) {
                out.splice(pos..pos + rep.old.len(), rep.new.iter().copied());
            }
        }
        out
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// MARK: - VideoPacket

/// One encoded access unit plus the metadata the sender needs.
#[derive(Debug, Clone)]
pub struct VideoPacket {
    pub data: Bytes,
    pub idr: bool,
    /// Monotonic frame index (encoder pts).
    pub frame_index: i64,
    /// First frame produced after a reference-frame invalidation request.
    pub after_ref_frame_invalidation: bool,
    /// Steady-clock capture timestamp for client latency math.
    pub frame_timestamp: Option<Instant>,
    /// SPS/VUI fix-ups to splice in during packetization.
    pub replacements: Vec<Replacement>,
}

impl VideoPacket {
    pub fn new(data: impl Into<Bytes>, frame_index: i64, idr: bool) -> Self {
        Self {
            data: data.into(),
            idr,
            frame_index,
            after_ref_frame_invalidation: false,
            frame_timestamp: None,
            replacements: Vec::new(),
        }
    }

    /// Payload with all replacements applied.
    pub fn patched_data(&self) -> Vec<u8> {
        if self.replacements.is_empty() {
            return self.data.to_vec();
        }
        Replacement::apply_all(&self.replacements, &self.data)
    }

    pub fn is_idr(&self) -> bool {
        self.idr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacements_apply_in_order() {
        let data = b"aa BB cc".to_vec();
        let reps = vec![
            Replacement::new(&b"BB"[..], &b"XXYY"[..]),
            Replacement::new(&b"XXYY cc"[..], &b"Z"[..]),
        ];
        assert_eq!(Replacement::apply_all(&reps, &data), b"aa Z".to_vec());
    }

    #[test]
    fn missing_old_sequence_is_skipped() {
        let data = b"hello".to_vec();
        let reps = vec![Replacement::new(&b"nope"[..], &b"x"[..])];
        assert_eq!(Replacement::apply_all(&reps, &data), data);
    }

    #[test]
    fn packet_without_replacements_passes_through() {
        let pkt = VideoPacket::new(vec![1, 2, 3], 0, true);
        assert_eq!(pkt.patched_data(), vec![1, 2, 3]);
        assert!(pkt.is_idr());
    }
}
