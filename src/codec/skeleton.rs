//! Ogg Skeleton: the metadata stream describing the other streams of a chain.
//!
//! The skeleton begins with a `fishead` packet, followed by one `fisbone` per described stream
//! and, from version 4 on, one `index` packet per stream listing keypoints as
//! `(byte offset, timestamp)` pairs.

use super::{le16, le32, le64, Codec, CodecState};
use crate::common::{log_debug, log_warn, Serial};
use crate::math::{scale, NANOS_PER_SEC};

/// Smallest fisbone (and index) packet accepted.
const FISBONE_MIN_SIZE: usize = 52;
/// Size of the fields preceding the version specific part of a fishead.
const FISHEAD_COMMON_SIZE: usize = 44;

#[derive(Clone, Debug, Default)]
pub(crate) struct Fishead {
    pub(crate) major: u16,
}

/// What a skeleton packet says about the stream it references.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkeletonKind {
    Fisbone,
    Index,
}

/// One seek point of a skeleton index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Keypoint {
    /// Byte offset of the page to start decoding from.
    pub offset: u64,
    /// Presentation time in units of the index denominator.
    pub timestamp: u64,
}

/// Keypoints of one stream, sorted by offset and timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkeletonIndex {
    pub keypoints: Vec<Keypoint>,
    /// Timestamp units per second.
    pub denom: u64,
}

impl SkeletonIndex {
    /// Finds the last keypoint at or before `target` nanoseconds.
    ///
    /// Returns its byte offset and its time in nanoseconds.
    pub fn search(&self, target: u64) -> Option<(u64, u64)> {
        let ts = scale(target, self.denom, NANOS_PER_SEC);
        let after = self.keypoints.partition_point(|kp| kp.timestamp <= ts);
        let best = self.keypoints.get(after.checked_sub(1)?)?;
        Some((best.offset, scale(best.timestamp, NANOS_PER_SEC, self.denom)))
    }

    /// Offset of the last keypoint.
    pub fn last_offset(&self) -> Option<u64> {
        self.keypoints.last().map(|kp| kp.offset)
    }

    /// Drops keypoints at or past `length`. Returns `false` when nothing is left.
    pub fn clip(&mut self, length: u64) -> bool {
        let keep = self.keypoints.partition_point(|kp| kp.offset < length);
        self.keypoints.truncate(keep);
        !self.keypoints.is_empty()
    }
}

fn fraction_to_nanos(numer: u64, denom: u64) -> u64 {
    if denom == 0 {
        0
    } else {
        scale(NANOS_PER_SEC, numer, denom)
    }
}

fn span(first: u64, last: u64) -> Option<u64> {
    (last > first).then(|| last - first)
}

pub(super) fn setup(state: &mut CodecState, data: &[u8]) -> Option<Codec> {
    let major = le16(data, 8)?;
    let minor = le16(data, 10)?;
    let prestime_n = le64(data, 12)?;
    let prestime_d = le64(data, 20)?;
    let basetime_n = le64(data, 28)?;
    let basetime_d = le64(data, 36)?;

    let head = Fishead { major };
    let presentation_time = (prestime_d != 0).then(|| scale(NANOS_PER_SEC, prestime_n, prestime_d));
    let base_time = (basetime_d != 0).then(|| scale(NANOS_PER_SEC, basetime_n, basetime_d));

    if major == 3 && minor > 0 {
        let time_at = |at| Some(fraction_to_nanos(le64(data, at)?, le64(data, at + 8)?));
        let at = FISHEAD_COMMON_SIZE + 64;
        if let (Some(first), Some(last)) = (time_at(at), time_at(at + 16)) {
            state.total_time = span(first, last);
        }
    }
    log_debug!(
        "skeleton fishead {major}.{minor}, presentation time {presentation_time:?}, base time {base_time:?}, total time {:?}",
        state.total_time
    );

    state.is_skeleton = true;
    state.is_sparse = true;
    state.caps = super::Caps::new("application/x-ogg-skeleton");
    Some(Codec::Skeleton(head))
}

pub(super) fn parse_reference(data: &[u8]) -> Option<(Serial, SkeletonKind)> {
    if data.is_empty() {
        // end of the skeleton stream
        return None;
    }
    if data.len() < FISBONE_MIN_SIZE {
        log_warn!("small skeleton packet of size {}, ignoring", data.len());
        return None;
    }
    if data.starts_with(b"fisbone\0") {
        Some((le32(data, 12)?, SkeletonKind::Fisbone))
    } else if data.starts_with(b"index\0") {
        Some((le32(data, 6)?, SkeletonKind::Index))
    } else if data.starts_with(b"fishead\0") {
        None
    } else {
        log_warn!("unknown skeleton packet");
        None
    }
}

pub(super) fn add_fisbone(state: &mut CodecState, data: &[u8]) -> bool {
    if state.have_fisbone {
        return false;
    }
    // identifier, header offset, serial number, header count
    let Some(data) = data.get(20..) else {
        return false;
    };
    state.have_fisbone = true;

    // Codec headers are authoritative, only fill in what they left open.
    if state.granule_rate.is_none() {
        if let (Some(numer), Some(denom)) = (le64(data, 0), le64(data, 8)) {
            state.granule_rate = super::granule_rate(numer, denom);
        }
    }
    if state.granule_shift.is_none() {
        if let Some(&shift) = data.get(28) {
            if shift >= 63 {
                log_warn!("invalid granule shift {shift}");
                state.granule_rate = None;
            } else {
                state.granule_shift = Some(shift.into());
            }
        }
    }
    if let Some(preroll) = le32(data, 24) {
        state.preroll = preroll;
    }
    true
}

/// Reads one variable length number: 7 bits per byte, least significant group first, the
/// last byte has its high bit set.
fn read_vlc(data: &mut &[u8]) -> Option<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = data.split_first()?;
        *data = rest;
        if let Some(bits) = u64::from(byte & 0x7f).checked_shl(shift) {
            result |= bits;
        }
        shift += 7;
        if byte & 0x80 != 0 {
            return Some(result);
        }
    }
}

pub(super) fn add_index(state: &mut CodecState, head: &Fishead, data: &[u8]) -> bool {
    if state.index.is_some() {
        return true;
    }
    if (head.major == 3 && data.len() < 26) || (head.major == 4 && data.len() < 62) {
        log_warn!("small index packet of size {}, ignoring", data.len());
        return false;
    }

    // identifier and serial number
    let mut rest = &data[10..];
    let (Some(n_keypoints), Some(denom)) = (le64(rest, 0), le64(rest, 8)) else {
        return false;
    };
    let denom = denom.max(1);
    rest = &rest[16..];

    if head.major == 4 {
        let (Some(first), Some(last)) = (le64(rest, 0), le64(rest, 8)) else {
            return false;
        };
        state.total_time = span(
            scale(NANOS_PER_SEC, first, denom),
            scale(NANOS_PER_SEC, last, denom),
        );
        rest = &rest[16..];
    }

    let mut keypoints = Vec::with_capacity((n_keypoints as usize).min(rest.len() / 2));
    let mut offset = 0u64;
    let mut timestamp = 0u64;
    while (keypoints.len() as u64) < n_keypoints {
        let (Some(offset_delta), Some(ts_delta)) = (read_vlc(&mut rest), read_vlc(&mut rest))
        else {
            break;
        };
        offset = offset.wrapping_add(offset_delta);
        timestamp = timestamp.wrapping_add(ts_delta);
        keypoints.push(Keypoint { offset, timestamp });
    }
    if keypoints.len() as u64 != n_keypoints {
        log_warn!(
            "truncated index, expected {n_keypoints} keypoints, found {}",
            keypoints.len()
        );
    }

    if let [first, .., last] = keypoints.as_slice() {
        if keypoints.len() > 2 && last.timestamp > first.timestamp {
            let bytes = last.offset.saturating_sub(first.offset);
            state.idx_bitrate = scale(
                bytes.saturating_mul(8),
                denom,
                last.timestamp - first.timestamp,
            );
        }
    }
    state.index = Some(SkeletonIndex { keypoints, denom });
    true
}
