//! Granule position mapping for the codecs that can be carried in Ogg.
//!
//! Every logical stream owns a [`CodecState`]. The first packet of the stream selects a codec by
//! its signature; from then on the state answers the timing questions the demuxer asks:
//!
//! - how an opaque granule position turns into a linear granule count and a timestamp,
//! - whether a packet is a header or a key frame,
//! - how many granules a packet spans.
//!
//! Codecs without any granule structure of their own use the default scheme, where the low
//! `granule_shift` bits hold the distance to the last key frame and the high bits hold the
//! key frame granule.

use num_rational::Ratio;

use crate::common::{log_debug, log_warn, GranulePos, GRANULE_UNSET};
use crate::math::units_to_nanos;

mod flac;
mod ogm;
mod opus;
mod skeleton;
mod speex;
mod theora;
mod vorbis;
mod vp8;

pub(crate) use ogm::prefix_len as ogm_prefix_len;
pub use skeleton::{Keypoint, SkeletonIndex, SkeletonKind};

/// Media type reported for streams whose first packet matches no known codec.
pub const UNKNOWN_MEDIA_TYPE: &str = "application/x-unknown";

/// Media description of a logical stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Caps {
    pub media_type: &'static str,
    pub rate: Option<u32>,
    pub channels: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<Ratio<u64>>,
    pub pixel_aspect_ratio: Option<Ratio<u32>>,
    /// Codec tag of OGM streams.
    pub fourcc: Option<String>,
    /// Header packets in stream order. Filled in when the stream is exposed.
    pub stream_headers: Vec<Vec<u8>>,
}

impl Caps {
    fn new(media_type: &'static str) -> Self {
        Caps {
            media_type,
            ..Caps::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) enum Codec {
    #[default]
    Unknown,
    Theora(theora::Theora),
    Vorbis(vorbis::Vorbis),
    Speex,
    FlacLegacy,
    Flac,
    Opus(opus::Opus),
    Vp8,
    Skeleton(skeleton::Fishead),
    OgmAudio,
    OgmVideo,
    OgmText,
}

struct Mapper {
    name: &'static str,
    signature: &'static [u8],
    min_size: usize,
    setup: fn(&mut CodecState, &[u8]) -> Option<Codec>,
}

const MAPPERS: &[Mapper] = &[
    Mapper {
        name: "theora",
        signature: b"\x80theora",
        min_size: 42,
        setup: theora::setup,
    },
    Mapper {
        name: "vorbis",
        signature: b"\x01vorbis",
        min_size: 29,
        setup: vorbis::setup,
    },
    Mapper {
        name: "speex",
        signature: b"Speex",
        min_size: 80,
        setup: speex::setup,
    },
    Mapper {
        name: "skeleton",
        signature: b"fishead\0",
        min_size: 64,
        setup: skeleton::setup,
    },
    Mapper {
        name: "flac (legacy)",
        signature: b"fLaC",
        min_size: 0,
        setup: flac::setup_legacy,
    },
    Mapper {
        name: "flac",
        signature: b"\x7fFLAC",
        min_size: 36,
        setup: flac::setup,
    },
    Mapper {
        name: "vp8",
        signature: b"OVP80\x01\x01",
        min_size: 26,
        setup: vp8::setup,
    },
    Mapper {
        name: "opus",
        signature: b"OpusHead",
        min_size: 19,
        setup: opus::setup,
    },
    Mapper {
        name: "ogm audio",
        signature: b"\x01audio\0\0\0",
        min_size: 53,
        setup: ogm::setup_audio,
    },
    Mapper {
        name: "ogm video",
        signature: b"\x01video\0\0\0",
        min_size: 53,
        setup: ogm::setup_video,
    },
    Mapper {
        name: "ogm text",
        signature: b"\x01text\0\0\0",
        min_size: 25,
        setup: ogm::setup_text,
    },
];

/// Timing state of one logical stream, driven by its codec.
#[derive(Clone, Debug, Default)]
pub struct CodecState {
    pub(crate) codec: Codec,
    pub(crate) granule_rate: Option<Ratio<u64>>,
    /// `None` until a codec header or a skeleton fisbone provides it.
    pub(crate) granule_shift: Option<u32>,
    /// Added to every granule before converting it to time; negative for codecs with pre-skip.
    pub(crate) granule_offset: i64,
    pub(crate) frame_size: i64,
    pub(crate) n_header_packets: u32,
    pub(crate) n_header_packets_seen: u32,
    pub(crate) have_headers: bool,
    pub(crate) accumulated_granule: i64,
    pub(crate) bitrate: u32,
    pub(crate) preroll: u32,
    pub(crate) is_sparse: bool,
    pub(crate) is_skeleton: bool,
    pub(crate) is_video: bool,
    pub(crate) is_ogm: bool,
    pub(crate) is_ogm_text: bool,
    pub(crate) audio_clipping: bool,
    pub(crate) have_fisbone: bool,
    pub(crate) index: Option<SkeletonIndex>,
    pub(crate) idx_bitrate: u64,
    pub(crate) total_time: Option<u64>,
    pub(crate) caps: Caps,
}

impl CodecState {
    /// Identifies the codec from the first packet of a stream.
    ///
    /// When no signature matches, or every matching setup rejects the packet, the stream is
    /// left without a codec and tagged with [`UNKNOWN_MEDIA_TYPE`].
    pub(crate) fn setup(&mut self, data: &[u8]) -> bool {
        for mapper in MAPPERS {
            if data.len() < mapper.min_size || !data.starts_with(mapper.signature) {
                continue;
            }
            let mut candidate = CodecState::default();
            match (mapper.setup)(&mut candidate, data) {
                Some(codec) => {
                    log_debug!("stream identified as {}", mapper.name);
                    candidate.codec = codec;
                    *self = candidate;
                    return true;
                }
                None => log_warn!("{} header rejected, trying other codecs", mapper.name),
            }
        }
        self.caps = Caps::new(UNKNOWN_MEDIA_TYPE);
        false
    }

    pub fn media_type(&self) -> &'static str {
        self.caps.media_type
    }

    pub fn caps(&self) -> &Caps {
        &self.caps
    }

    /// Granules per second, if known.
    pub fn granule_rate(&self) -> Option<Ratio<u64>> {
        self.granule_rate
    }

    pub fn granule_shift(&self) -> Option<u32> {
        self.granule_shift
    }

    pub fn is_sparse(&self) -> bool {
        self.is_sparse
    }

    pub fn is_skeleton(&self) -> bool {
        self.is_skeleton
    }

    /// No codec matched the first packet: the stream carries no timing.
    pub fn is_unknown(&self) -> bool {
        matches!(self.codec, Codec::Unknown)
    }

    pub(crate) fn is_vp8(&self) -> bool {
        matches!(self.codec, Codec::Vp8)
    }

    /// Converts a granule count to a timestamp in nanoseconds. Unknown rates map to zero.
    pub fn granule_to_time(&self, granule: i64) -> u64 {
        let Some(rate) = self.granule_rate else {
            return 0;
        };
        if granule == 0 {
            return 0;
        }
        let granule = granule.saturating_add(self.granule_offset);
        if granule < 0 {
            return 0;
        }
        units_to_nanos(granule as u64, rate)
    }

    /// Converts a granule position to a linear granule count.
    ///
    /// `-1` and `0` pass through unchanged. Codecs without a mapping yield `-1`.
    pub fn granulepos_to_granule(&mut self, granulepos: GranulePos) -> i64 {
        if granulepos == GRANULE_UNSET || granulepos == 0 {
            return granulepos;
        }
        match &mut self.codec {
            Codec::Theora(theora) => {
                theora::granulepos_to_granule(theora, self.granule_shift, granulepos)
            }
            Codec::Opus(opus) => opus::granulepos_to_granule(opus, granulepos),
            Codec::Vp8 => vp8::granulepos_to_granule(granulepos),
            Codec::Vorbis(_)
            | Codec::Speex
            | Codec::FlacLegacy
            | Codec::Flac
            | Codec::OgmAudio
            | Codec::OgmVideo
            | Codec::OgmText => default_granulepos_to_granule(self.granule_shift, granulepos),
            Codec::Unknown | Codec::Skeleton(_) => {
                log_warn!("cannot convert {} granule positions", self.caps.media_type);
                GRANULE_UNSET
            }
        }
    }

    /// Builds the granule position of a packet ending at `granule`, given the granule of the
    /// last key frame (negative when unknown).
    pub fn granule_to_granulepos(&self, granule: i64, keyframe_granule: i64) -> GranulePos {
        if granule == GRANULE_UNSET || granule == 0 {
            return granule;
        }
        match &self.codec {
            Codec::Vp8 => vp8::granule_to_granulepos(granule, keyframe_granule),
            Codec::Unknown | Codec::Skeleton(_) => {
                log_warn!("cannot build {} granule positions", self.caps.media_type);
                GRANULE_UNSET
            }
            codec => {
                let zero_keyoffset = matches!(codec, Codec::Theora(t) if t.zero_keyoffset);
                default_granule_to_granulepos(
                    self.granule_shift,
                    zero_keyoffset,
                    granule,
                    keyframe_granule,
                )
            }
        }
    }

    /// Granule of the key frame a granule position depends on.
    pub fn key_granule(&self, granulepos: GranulePos) -> i64 {
        if let Codec::Vp8 = self.codec {
            return vp8::key_granule(granulepos);
        }
        match self.granule_shift {
            _ if granulepos == GRANULE_UNSET || granulepos == 0 => granulepos,
            None => granulepos,
            Some(shift) => granulepos >> shift,
        }
    }

    pub fn is_granulepos_keyframe(&self, granulepos: GranulePos) -> bool {
        if granulepos == GRANULE_UNSET {
            return false;
        }
        match &self.codec {
            Codec::Theora(_) => theora::is_granulepos_keyframe(self.granule_shift, granulepos),
            Codec::Vp8 => vp8::is_granulepos_keyframe(granulepos),
            Codec::Vorbis(_)
            | Codec::Speex
            | Codec::FlacLegacy
            | Codec::Flac
            | Codec::OgmAudio
            | Codec::OgmText => true,
            Codec::Opus(_) | Codec::OgmVideo | Codec::Unknown | Codec::Skeleton(_) => false,
        }
    }

    pub fn is_packet_keyframe(&self, data: &[u8]) -> bool {
        match &self.codec {
            Codec::Theora(_) => theora::is_packet_keyframe(data),
            Codec::Vp8 => vp8::is_packet_keyframe(data),
            Codec::Vorbis(_)
            | Codec::Speex
            | Codec::FlacLegacy
            | Codec::Flac
            | Codec::Opus(_)
            | Codec::OgmAudio
            | Codec::OgmText => true,
            Codec::OgmVideo | Codec::Unknown | Codec::Skeleton(_) => false,
        }
    }

    /// Whether `data` is a header packet. Must be called once per packet, in stream order:
    /// some codecs learn from their headers here.
    pub fn is_header(&mut self, data: &[u8]) -> bool {
        let count_based = self.n_header_packets_seen < self.n_header_packets;
        match &mut self.codec {
            Codec::Theora(_) => theora::is_header(data),
            Codec::Vorbis(vorbis) => vorbis::is_header(vorbis, data),
            Codec::Speex => count_based,
            Codec::FlacLegacy => {
                if self.n_header_packets_seen == 1 {
                    if let Some(rate) = flac::legacy_streaminfo_rate(data) {
                        self.granule_rate = granule_rate(rate, 1);
                        self.caps.rate = u32::try_from(rate).ok();
                    }
                }
                count_based
            }
            Codec::Flac => flac::is_header(data),
            Codec::Opus(_) => opus::is_header(data),
            Codec::Vp8 => vp8::is_header(data),
            Codec::Skeleton(_) => true,
            Codec::OgmAudio | Codec::OgmVideo | Codec::OgmText => ogm::is_header(data),
            Codec::Unknown => false,
        }
    }

    /// Number of granules covered by a packet, `-1` when it cannot be determined.
    pub fn packet_duration(&mut self, data: &[u8]) -> i64 {
        match &mut self.codec {
            Codec::Theora(_) | Codec::Speex | Codec::OgmVideo => self.frame_size,
            Codec::Vorbis(vorbis) => vorbis::packet_duration(vorbis, data),
            Codec::FlacLegacy | Codec::Flac => flac::packet_duration(data),
            Codec::Opus(_) => opus::packet_duration(data),
            Codec::Vp8 => vp8::packet_duration(data),
            Codec::OgmAudio | Codec::OgmText => ogm::packet_duration(data),
            Codec::Unknown | Codec::Skeleton(_) => -1,
        }
    }

    /// Timestamp of the end of the packet carrying `granulepos`.
    pub fn end_time_for_granulepos(&mut self, granulepos: GranulePos) -> u64 {
        let granule = self.granulepos_to_granule(granulepos);
        self.granule_to_time(granule)
    }

    /// Like [`end_time_for_granulepos`](Self::end_time_for_granulepos), for codecs with a
    /// fixed frame size only.
    pub fn start_time_for_granulepos(&mut self, granulepos: GranulePos) -> Option<u64> {
        if self.frame_size == 0 {
            return None;
        }
        Some(self.end_time_for_granulepos(granulepos))
    }

    /// Forgets inter-packet state after data was lost.
    pub(crate) fn mark_discont(&mut self) {
        if let Codec::Vorbis(vorbis) = &mut self.codec {
            vorbis.last_size = 0;
        }
    }

    /// Merges the timing information of a skeleton fisbone addressed to this stream.
    ///
    /// Only the first fisbone is used, and codec headers always take precedence.
    pub(crate) fn add_fisbone(&mut self, data: &[u8]) -> bool {
        skeleton::add_fisbone(self, data)
    }

    /// Attaches a skeleton index addressed to this stream. `fishead` is the state of the
    /// skeleton stream carrying the index.
    pub(crate) fn add_index(&mut self, fishead: &CodecState, data: &[u8]) -> bool {
        let Codec::Skeleton(head) = &fishead.codec else {
            return false;
        };
        skeleton::add_index(self, head, data)
    }

    /// Looks up the index for the last keypoint at or before `target` nanoseconds.
    ///
    /// Returns the keypoint's byte offset and its time in nanoseconds.
    pub fn search_index(&self, target: u64) -> Option<(u64, u64)> {
        self.index.as_ref()?.search(target)
    }
}

/// Parses the stream reference of a skeleton packet (fisbone or index).
pub(crate) fn skeleton_reference(data: &[u8]) -> Option<(crate::common::Serial, SkeletonKind)> {
    skeleton::parse_reference(data)
}

pub(crate) fn granule_rate(numer: u64, denom: u64) -> Option<Ratio<u64>> {
    (numer != 0 && denom != 0).then(|| Ratio::new(numer, denom))
}

fn default_granulepos_to_granule(shift: Option<u32>, granulepos: GranulePos) -> i64 {
    match shift {
        Some(shift) if shift != 0 => {
            let keyindex = granulepos >> shift;
            let keyoffset = granulepos - (keyindex << shift);
            keyindex + keyoffset
        }
        _ => granulepos,
    }
}

fn default_granule_to_granulepos(
    shift: Option<u32>,
    zero_keyoffset: bool,
    granule: i64,
    keyframe_granule: i64,
) -> GranulePos {
    match shift {
        Some(shift) if shift != 0 => {
            // Without a known key frame, assume the stream starts with one.
            let keyframe = if keyframe_granule < 0 {
                i64::from(!zero_keyoffset)
            } else {
                keyframe_granule
            };
            let keyoffset = granule - keyframe;
            (keyframe << shift) | keyoffset
        }
        _ => granule,
    }
}

fn array<const N: usize>(data: &[u8], at: usize) -> Option<[u8; N]> {
    data.get(at..at.checked_add(N)?)?.try_into().ok()
}

fn le16(data: &[u8], at: usize) -> Option<u16> {
    array(data, at).map(u16::from_le_bytes)
}

fn le32(data: &[u8], at: usize) -> Option<u32> {
    array(data, at).map(u32::from_le_bytes)
}

fn le64(data: &[u8], at: usize) -> Option<u64> {
    array(data, at).map(u64::from_le_bytes)
}

fn be16(data: &[u8], at: usize) -> Option<u16> {
    array(data, at).map(u16::from_be_bytes)
}

fn be24(data: &[u8], at: usize) -> Option<u32> {
    let [a, b, c] = array::<3>(data, at)?;
    Some(u32::from_be_bytes([0, a, b, c]))
}

fn be32(data: &[u8], at: usize) -> Option<u32> {
    array(data, at).map(u32::from_be_bytes)
}
