//! Reed–Solomon erasure coding for the media paths.
//!
//! Video: each encoded frame is sliced into MTU-sized fragments; fragments
//! form systematic RS groups with parity sized from `fec_percentage`,
//! bounded by `min_required_fec_packets` below and the GF(2⁸) shard limit
//! above. Audio: a fixed 4-data/2-parity arrangement over the encrypted
//! Opus payloads.

use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

/// GF(2⁸) limit on total shards per group.
const MAX_TOTAL_SHARDS: usize = 255;

/// Cap on data shards per video group; larger frames span several groups.
pub const MAX_DATA_SHARDS: usize = 100;

pub const AUDIO_DATA_SHARDS: usize = 4;
pub const AUDIO_FEC_SHARDS: usize = 2;

#[derive(Error, Debug)]
pub enum FecError {
    #[error("Reed-Solomon error: {0}")]
    ReedSolomon(#[from] reed_solomon_erasure::Error),
}

// ── Video groups ──────────────────────────────────────────────────────────────

/// One encoded FEC group: `data_shards` original fragments (zero-padded to
/// the common shard size) followed by `parity_shards` parity fragments.
#[derive(Debug, Clone)]
pub struct FecGroup {
    pub data_shards: usize,
    pub parity_shards: usize,
    pub shard_size: usize,
    pub shards: Vec<Vec<u8>>,
}

/// Parity count for a group: `⌈K·pct/100⌉`, at least `min_required`, and
/// never pushing the group past the shard limit.
pub fn parity_for(data_shards: usize, fec_percentage: u32, min_required: u32) -> usize {
    if fec_percentage == 0 && min_required == 0 {
        return 0;
    }
    let from_pct = (data_shards * fec_percentage as usize).div_ceil(100);
    from_pct
        .max(min_required as usize)
        .min(MAX_TOTAL_SHARDS.saturating_sub(data_shards))
}

/// Encode one group of fragments. Fragments may have ragged sizes; all
/// shards in the output are padded to the longest.
pub fn encode_group(
    fragments: &[Vec<u8>],
    fec_percentage: u32,
    min_required: u32,
) -> Result<FecGroup, FecError> {
    let data_shards = fragments.len();
    let shard_size = fragments.iter().map(Vec::len).max().unwrap_or(0);
    let parity_shards = parity_for(data_shards, fec_percentage, min_required);

    let mut shards: Vec<Vec<u8>> = fragments
        .iter()
        .map(|f| {
            let mut s = f.clone();
            s.resize(shard_size, 0);
            s
        })
        .collect();

    if parity_shards > 0 && data_shards > 0 {
        shards.extend(std::iter::repeat_with(|| vec![0u8; shard_size]).take(parity_shards));
        let rs = ReedSolomon::new(data_shards, parity_shards)?;
        rs.encode(&mut shards)?;
    }

    Ok(FecGroup { data_shards, parity_shards, shard_size, shards })
}

/// Split a frame's fragments into group-sized runs.
pub fn group_fragments(fragments: Vec<Vec<u8>>) -> Vec<Vec<Vec<u8>>> {
    if fragments.is_empty() {
        return Vec::new();
    }
    fragments
        .chunks(MAX_DATA_SHARDS)
        .map(|c| c.to_vec())
        .collect()
}

// ── Audio ─────────────────────────────────────────────────────────────────────

/// Rolling 4+2 audio FEC: push encrypted payloads, get two parity shards
/// back on every fourth packet.
pub struct AudioFecEncoder {
    rs: ReedSolomon,
    pending: Vec<Vec<u8>>,
    /// Sequence number of the first shard in the current group.
    base_sequence: u16,
    base_timestamp: u32,
}

impl AudioFecEncoder {
    pub fn new() -> Self {
        Self {
            rs: ReedSolomon::new(AUDIO_DATA_SHARDS, AUDIO_FEC_SHARDS)
                .expect("static audio shard counts are valid"),
            pending: Vec::with_capacity(AUDIO_DATA_SHARDS),
            base_sequence: 0,
            base_timestamp: 0,
        }
    }

    /// Add one encrypted audio payload. Returns the parity shards plus the
    /// group's base sequence/timestamp once the group is full.
    pub fn push(
        &mut self,
        payload: &[u8],
        sequence: u16,
        timestamp: u32,
    ) -> Result<Option<AudioParity>, FecError> {
        if self.pending.is_empty() {
            self.base_sequence = sequence;
            self.base_timestamp = timestamp;
        }
        self.pending.push(payload.to_vec());
        if self.pending.len() < AUDIO_DATA_SHARDS {
            return Ok(None);
        }

        let shard_size = self.pending.iter().map(Vec::len).max().unwrap_or(0);
        let mut shards: Vec<Vec<u8>> = self
            .pending
            .drain(..)
            .map(|mut s| {
                s.resize(shard_size, 0);
                s
            })
            .collect();
        shards.extend(std::iter::repeat_with(|| vec![0u8; shard_size]).take(AUDIO_FEC_SHARDS));
        self.rs.encode(&mut shards)?;

        Ok(Some(AudioParity {
            shards: shards.split_off(AUDIO_DATA_SHARDS),
            base_sequence: self.base_sequence,
            base_timestamp: self.base_timestamp,
        }))
    }
}

impl Default for AudioFecEncoder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AudioParity {
    pub shards: Vec<Vec<u8>>,
    pub base_sequence: u16,
    pub base_timestamp: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_sizing_honours_percentage_and_floor() {
        assert_eq!(parity_for(10, 20, 2), 2); // ⌈10·0.2⌉ = 2
        assert_eq!(parity_for(10, 50, 2), 5);
        assert_eq!(parity_for(3, 20, 2), 2); // floor wins
        assert_eq!(parity_for(10, 0, 0), 0);
        // Never exceeds the GF(2⁸) group limit
        assert_eq!(parity_for(200, 100, 2), 55);
    }

    #[test]
    fn group_survives_parity_many_erasures() {
        let fragments: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 100]).collect();
        let group = encode_group(&fragments, 50, 2).unwrap();
        assert_eq!(group.data_shards, 10);
        assert_eq!(group.parity_shards, 5);

        // Drop 5 shards (the max recoverable), reconstruct, compare
        let mut holed: Vec<Option<Vec<u8>>> = group.shards.iter().cloned().map(Some).collect();
        for i in [0usize, 3, 4, 9, 12] {
            holed[i] = None;
        }
        let rs = ReedSolomon::new(group.data_shards, group.parity_shards).unwrap();
        rs.reconstruct(&mut holed).unwrap();
        for (i, shard) in holed.iter().take(10).enumerate() {
            assert_eq!(shard.as_deref().unwrap(), &group.shards[i][..]);
        }
    }

    #[test]
    fn ragged_fragments_are_padded() {
        let fragments = vec![vec![1u8; 100], vec![2u8; 37]];
        let group = encode_group(&fragments, 20, 2).unwrap();
        assert!(group.shards.iter().all(|s| s.len() == 100));
        assert_eq!(&group.shards[1][..37], &[2u8; 37][..]);
        assert_eq!(&group.shards[1][37..], &[0u8; 63][..]);
    }

    #[test]
    fn large_frames_split_into_groups() {
        let fragments: Vec<Vec<u8>> = (0..250).map(|_| vec![0u8; 10]).collect();
        let groups = group_fragments(fragments);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), MAX_DATA_SHARDS);
        assert_eq!(groups[2].len(), 50);
    }

    #[test]
    fn audio_fec_emits_parity_every_fourth_packet() {
        let mut enc = AudioFecEncoder::new();
        assert!(enc.push(&[1; 32], 10, 1000).unwrap().is_none());
        assert!(enc.push(&[2; 32], 11, 1240).unwrap().is_none());
        assert!(enc.push(&[3; 32], 12, 1480).unwrap().is_none());
        let parity = enc.push(&[4; 32], 13, 1720).unwrap().unwrap();
        assert_eq!(parity.shards.len(), AUDIO_FEC_SHARDS);
        assert_eq!(parity.base_sequence, 10);
        assert_eq!(parity.base_timestamp, 1000);

        // Next group starts fresh
        assert!(enc.push(&[5; 32], 14, 1960).unwrap().is_none());
    }

    #[test]
    fn audio_parity_recovers_dropped_shards() {
        let mut enc = AudioFecEncoder::new();
        let payloads: Vec<Vec<u8>> = (1..=4u8).map(|i| vec![i; 48]).collect();
        let mut parity = None;
        for (i, p) in payloads.iter().enumerate() {
            parity = enc.push(p, i as u16, 0).unwrap();
        }
        let parity = parity.unwrap();

        let mut holed: Vec<Option<Vec<u8>>> = payloads.iter().cloned().map(Some).collect();
        holed.extend(parity.shards.into_iter().map(Some));
        holed[1] = None;
        holed[3] = None;
        let rs = ReedSolomon::new(AUDIO_DATA_SHARDS, AUDIO_FEC_SHARDS).unwrap();
        rs.reconstruct(&mut holed).unwrap();
        assert_eq!(holed[1].as_deref().unwrap(), &[2u8; 48][..]);
        assert_eq!(holed[3].as_deref().unwrap(), &[4u8; 48][..]);
    }
}
