//! The downstream side of the demuxer.

use std::sync::{Arc, Mutex, PoisonError};

use crate::codec::Caps;
use crate::common::{GranulePos, Serial};

/// Describes a logical stream when it is exposed downstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub serial: Serial,
    /// Media description, with the stream's header packets in `stream_headers`.
    pub caps: Caps,
}

/// A packet leaving the demuxer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputPacket {
    pub data: Vec<u8>,
    /// Presentation time in nanoseconds, on the timeline of the stream.
    pub pts: Option<u64>,
    pub duration: Option<u64>,
    /// Time at the end of the packet; zero for headers.
    pub offset: Option<u64>,
    /// Granule position at the end of the packet.
    pub offset_end: GranulePos,
    /// First packet after lost data or a seek.
    pub discont: bool,
    /// The packet cannot be decoded on its own.
    pub delta_unit: bool,
    pub header: bool,
    /// Samples to drop at the start and at the end of the decoded packet.
    pub clipping: Option<(u64, u64)>,
}

/// Mapping of stream timestamps to the playback timeline.
///
/// A packet with timestamp `pts` inside `[start, stop)` has stream time `time + (pts - start)`
/// and running time `base + (pts - start) / |rate|`. All values are nanoseconds.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub start: u64,
    pub stop: Option<u64>,
    /// Stream time of `start`.
    pub time: u64,
    /// Running time at `start`.
    pub base: u64,
    pub rate: f64,
    /// Last known position inside the segment.
    pub position: u64,
    pub duration: Option<u64>,
}

impl Default for Segment {
    fn default() -> Self {
        Segment {
            start: 0,
            stop: None,
            time: 0,
            base: 0,
            rate: 1.0,
            position: 0,
            duration: None,
        }
    }
}

impl Segment {
    pub fn is_reverse(&self) -> bool {
        self.rate < 0.0
    }

    /// Running time of `position`, or `None` when it lies outside the segment.
    pub fn running_time(&self, position: u64) -> Option<u64> {
        if position < self.start || self.stop.is_some_and(|stop| position > stop) {
            return None;
        }
        let elapsed = if self.is_reverse() {
            self.stop.or(self.duration)?.saturating_sub(position)
        } else {
            position - self.start
        };
        let rate = self.rate.abs();
        let scaled = if rate == 1.0 {
            elapsed
        } else {
            (elapsed as f64 / rate) as u64
        };
        Some(self.base + scaled)
    }

    /// Moves the segment to `[start, stop]` at `rate`.
    ///
    /// A flushing seek restarts the running time at zero; otherwise it continues from the
    /// running time of the current position.
    pub(crate) fn do_seek(&mut self, rate: f64, start: u64, stop: Option<u64>, flush: bool) {
        self.base = if flush {
            0
        } else {
            self.running_time(self.position).unwrap_or(self.base)
        };
        self.rate = rate;
        self.start = start;
        self.stop = stop;
        self.time = start;
        self.position = if rate < 0.0 {
            stop.or(self.duration).unwrap_or(start)
        } else {
            start
        };
    }
}

/// Receives everything the demuxer produces.
///
/// Calls arrive from whichever thread drives the demuxer, while the demuxer's locks are held:
/// implementations must not call back into the controller.
pub trait Sink: Send + Sync {
    /// A stream becomes visible. Its packets follow.
    fn add_stream(&self, info: StreamInfo);

    /// A stream stops being visible, usually because its chain ended.
    fn remove_stream(&self, serial: Serial);

    fn push(&self, serial: Serial, packet: OutputPacket);

    /// Packets from now on map to the playback timeline through `segment`.
    fn notify_segment(&self, segment: &Segment);

    /// No more data will follow until the next seek.
    fn notify_eos(&self);

    /// A flushing seek started; data in flight is to be discarded.
    fn flush_start(&self);

    /// The flushing seek is done.
    fn flush_stop(&self);

    /// `serial` has no data from `start` for `duration` nanoseconds.
    fn notify_gap(&self, serial: Serial, start: u64, duration: u64) {
        let _ = (serial, start, duration);
    }
}

impl<T: Sink + ?Sized> Sink for Arc<T> {
    fn add_stream(&self, info: StreamInfo) {
        (**self).add_stream(info)
    }

    fn remove_stream(&self, serial: Serial) {
        (**self).remove_stream(serial)
    }

    fn push(&self, serial: Serial, packet: OutputPacket) {
        (**self).push(serial, packet)
    }

    fn notify_segment(&self, segment: &Segment) {
        (**self).notify_segment(segment)
    }

    fn notify_eos(&self) {
        (**self).notify_eos()
    }

    fn flush_start(&self) {
        (**self).flush_start()
    }

    fn flush_stop(&self) {
        (**self).flush_stop()
    }

    fn notify_gap(&self, serial: Serial, start: u64, duration: u64) {
        (**self).notify_gap(serial, start, duration)
    }
}

/// Something the demuxer told its [`Sink`].
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    StreamAdded(StreamInfo),
    StreamRemoved(Serial),
    Packet(Serial, OutputPacket),
    Segment(Segment),
    Gap { serial: Serial, start: u64, duration: u64 },
    Eos,
    FlushStart,
    FlushStop,
}

/// A [`Sink`] that records every event, for inspection or replay on another thread.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        EventLog::default()
    }

    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Takes the events recorded so far.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Sink for EventLog {
    fn add_stream(&self, info: StreamInfo) {
        self.record(Event::StreamAdded(info));
    }

    fn remove_stream(&self, serial: Serial) {
        self.record(Event::StreamRemoved(serial));
    }

    fn push(&self, serial: Serial, packet: OutputPacket) {
        self.record(Event::Packet(serial, packet));
    }

    fn notify_segment(&self, segment: &Segment) {
        self.record(Event::Segment(segment.clone()));
    }

    fn notify_eos(&self) {
        self.record(Event::Eos);
    }

    fn flush_start(&self) {
        self.record(Event::FlushStart);
    }

    fn flush_stop(&self) {
        self.record(Event::FlushStop);
    }

    fn notify_gap(&self, serial: Serial, start: u64, duration: u64) {
        self.record(Event::Gap {
            serial,
            start,
            duration,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_log_through_arc() {
        let log = Arc::new(EventLog::new());
        let sink: &dyn Sink = &log;
        sink.notify_eos();
        sink.notify_gap(4, 10, 20);
        assert_eq!(
            log.take(),
            vec![
                Event::Eos,
                Event::Gap {
                    serial: 4,
                    start: 10,
                    duration: 20
                }
            ]
        );
        assert!(log.take().is_empty());
    }

    #[test]
    fn non_flushing_seek_keeps_running_time() {
        let mut segment = Segment {
            position: 3_000,
            ..Segment::default()
        };
        segment.do_seek(1.0, 10_000, None, false);
        assert_eq!(segment.base, 3_000);
        assert_eq!(segment.position, 10_000);
        assert_eq!(segment.running_time(12_000), Some(5_000));

        segment.do_seek(2.0, 0, Some(8_000), true);
        assert_eq!(segment.base, 0);
        assert_eq!(segment.running_time(4_000), Some(2_000));
        assert_eq!(segment.running_time(9_000), None);
    }

    #[test]
    fn reverse_seek_starts_at_stop() {
        let mut segment = Segment {
            duration: Some(60_000),
            ..Segment::default()
        };
        segment.do_seek(-1.0, 5_000, None, true);
        assert!(segment.is_reverse());
        assert_eq!(segment.position, 60_000);
        assert_eq!(segment.running_time(50_000), Some(10_000));
    }
}
