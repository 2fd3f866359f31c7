use super::{granule_rate, le32, Caps, Codec, CodecState};

pub(super) fn setup(state: &mut CodecState, data: &[u8]) -> Option<Codec> {
    let rate = le32(data, 36)?;
    let channels = le32(data, 48)?;
    let frame_size = le32(data, 56)?;
    let frames_per_packet = le32(data, 64)?;
    let extra_headers = le32(data, 68)?;

    state.granule_shift = Some(0);
    state.bitrate = le32(data, 52)?;
    state.n_header_packets = extra_headers.saturating_add(2);
    state.frame_size = i64::from(frame_size) * i64::from(frames_per_packet);
    state.granule_rate = Some(granule_rate(rate.into(), 1)?);

    let mut caps = Caps::new("audio/x-speex");
    caps.rate = Some(rate);
    caps.channels = Some(channels);
    state.caps = caps;
    Some(Codec::Speex)
}
