//! OGM (DirectShow style) audio, video and text streams.
//!
//! Data packets carry a length prefix whose size is encoded in the first byte; for audio and
//! text that prefix is the packet duration in granules.

use super::{granule_rate, le16, le32, le64, Caps, Codec, CodecState};
use crate::common::log_warn;

/// Granule rate numerator of video and text streams; the denominator is the time unit.
const TIME_BASE: u64 = 10_000_000;

fn fourcc(data: &[u8]) -> String {
    String::from_utf8_lossy(&data[9..13]).into_owned()
}

/// Time unit field, clamped to the positive `i32` range. `None` when it is not positive.
fn time_unit(data: &[u8]) -> Option<u64> {
    let unit = le64(data, 17)? as i64;
    if unit > i64::from(i32::MAX) || unit < i64::from(i32::MIN) {
        log_warn!("ogm time unit {unit} out of range");
    }
    let unit = unit.clamp(i32::MIN.into(), i32::MAX.into());
    u64::try_from(unit).ok().filter(|&u| u > 0)
}

pub(super) fn setup_audio(state: &mut CodecState, data: &[u8]) -> Option<Codec> {
    let samples_per_unit = le64(data, 25)?;
    state.granule_rate = Some(granule_rate(samples_per_unit, 1)?);
    state.n_header_packets = 1;
    state.is_ogm = true;

    let mut caps = Caps::new("audio/x-ogm-unknown");
    caps.fourcc = Some(fourcc(data));
    caps.rate = u32::try_from(samples_per_unit).ok();
    caps.channels = le16(data, 45).map(u32::from);
    state.caps = caps;
    Some(Codec::OgmAudio)
}

pub(super) fn setup_video(state: &mut CodecState, data: &[u8]) -> Option<Codec> {
    let unit = time_unit(data);
    if unit.is_none() {
        log_warn!("ogm video stream without a usable time unit");
    }
    state.is_video = true;
    state.granule_rate = unit.and_then(|unit| granule_rate(TIME_BASE, unit));
    state.n_header_packets = 1;
    state.frame_size = 1;
    state.is_ogm = true;

    let mut caps = Caps::new("video/x-ogm-unknown");
    caps.fourcc = Some(fourcc(data));
    caps.framerate = state.granule_rate;
    caps.width = le32(data, 45);
    caps.height = le32(data, 49);
    state.caps = caps;
    Some(Codec::OgmVideo)
}

pub(super) fn setup_text(state: &mut CodecState, data: &[u8]) -> Option<Codec> {
    let unit = time_unit(data)?;
    state.granule_rate = granule_rate(TIME_BASE, unit);
    state.n_header_packets = 1;
    state.is_ogm = true;
    state.is_ogm_text = true;
    state.is_sparse = true;
    state.caps = Caps::new("text/x-raw");
    Some(Codec::OgmText)
}

pub(super) fn is_header(data: &[u8]) -> bool {
    data.first().is_some_and(|&b| b & 1 == 1)
}

/// Size of the length prefix of a data packet, including the flag byte.
pub(crate) fn prefix_len(first: u8) -> usize {
    1 + usize::from(((first & 0xc0) >> 6) | ((first & 0x02) << 1))
}

pub(super) fn packet_duration(data: &[u8]) -> i64 {
    let Some(&first) = data.first() else {
        return -1;
    };
    let offset = prefix_len(first);
    if offset > data.len() {
        log_warn!("ogm packet shorter than its length prefix");
        return -1;
    }
    data[1..offset]
        .iter()
        .rev()
        .fold(0i64, |samples, &b| (samples << 8) | i64::from(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_header(kind: &[u8; 8], time_unit: i64, samples_per_unit: u64) -> Vec<u8> {
        let mut data = vec![0u8; 57];
        data[0] = 1;
        data[1..9].copy_from_slice(kind);
        data[9..13].copy_from_slice(b"XVID");
        data[17..25].copy_from_slice(&time_unit.to_le_bytes());
        data[25..33].copy_from_slice(&samples_per_unit.to_le_bytes());
        data[45..49].copy_from_slice(&640u32.to_le_bytes());
        data[49..53].copy_from_slice(&480u32.to_le_bytes());
        data
    }

    #[test]
    fn video_rate_from_time_unit() {
        let mut state = CodecState::default();
        assert!(state.setup(&stream_header(b"video\0\0\0", 400_000, 1)));
        assert_eq!(state.granule_rate(), granule_rate(25, 1));
        assert_eq!(state.caps().fourcc.as_deref(), Some("XVID"));
        assert_eq!(state.caps().width, Some(640));
    }

    #[test]
    fn text_needs_positive_time_unit() {
        let mut state = CodecState::default();
        assert!(!state.setup(&stream_header(b"text\0\0\0\0", 0, 1)[..25]));
        assert!(state.setup(&stream_header(b"text\0\0\0\0", 10_000, 1)[..25]));
        assert!(state.is_sparse());
    }

    #[test]
    fn length_prefix() {
        // two byte prefix (bits 7..6 = 0b10), little endian 0x0102
        assert_eq!(packet_duration(&[0x80, 0x02, 0x01, 0xaa]), 0x0102);
        // prefix bit 1 adds four bytes
        assert_eq!(prefix_len(0x02), 5);
        assert_eq!(packet_duration(&[0x40]), -1);
        assert_eq!(packet_duration(&[0x00, 0xaa]), 0);
    }
}
