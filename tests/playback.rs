use std::io;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use approx::assert_abs_diff_eq;
use oggdemux::{DemuxBuilder, Event, EventLog, Flow, Serial, Source};
use rstest::rstest;
use rstest_reuse::{self, *};

mod test_support;
use test_support::*;

#[template]
#[rstest]
#[case::theora(theora_file(THEORA_SERIAL, 40, 300), vec![THEORA_SERIAL])]
#[case::vorbis(vorbis_file(VORBIS_SERIAL, 60), vec![VORBIS_SERIAL])]
#[case::multiplexed(theora_vorbis_file(20, 90), vec![THEORA_SERIAL, VORBIS_SERIAL])]
fn all_files(#[case] file: Vec<u8>, #[case] serials: Vec<Serial>) {}

#[apply(all_files)]
fn timestamps_never_go_back(#[case] file: Vec<u8>, #[case] serials: Vec<Serial>) {
    let demux = pull_demux(file);
    let events = run_to_end(&demux);

    for serial in serials {
        let pts: Vec<u64> = data_packets(&events, serial).iter().filter_map(|p| p.pts).collect();
        assert!(!pts.is_empty(), "no packets for {serial:08x}");
        assert!(pts.windows(2).all(|w| w[0] <= w[1]), "{serial:08x}: {pts:?}");
    }
}

#[apply(all_files)]
fn streams_added_before_their_packets(#[case] file: Vec<u8>, #[case] serials: Vec<Serial>) {
    let demux = pull_demux(file);
    let events = run_to_end(&demux);

    let mut added = Vec::new();
    for event in &events {
        match event {
            Event::StreamAdded(info) => added.push(info.serial),
            Event::Packet(serial, _) => assert!(added.contains(serial)),
            _ => {}
        }
    }
    assert_eq!(added, serials);
    assert_eq!(events.last(), Some(&Event::Eos));
    assert_eq!(events.iter().filter(|e| **e == Event::Eos).count(), 1);
}

#[test]
fn vorbis_timing_comes_from_granule_positions() {
    let demux = pull_demux(vorbis_file(VORBIS_SERIAL, 8));
    let events = run_to_end(&demux);

    let duration = demux.duration().unwrap();
    assert_abs_diff_eq!(duration.as_secs_f64(), 8192.0 / 44_100.0, epsilon = 1e-6);

    let packets = data_packets(&events, VORBIS_SERIAL);
    // two packets on the first page, one on each of the others
    assert_eq!(packets.len(), 9);
    assert_eq!(packets[0].duration, Some(0));
    let packet = packets.iter().find(|p| p.offset_end == 4096).unwrap();
    assert_abs_diff_eq!(secs(packet.offset.unwrap()), 4096.0 / 44_100.0, epsilon = 1e-6);
    assert_abs_diff_eq!(secs(packet.duration.unwrap()), 1024.0 / 44_100.0, epsilon = 1e-6);
    assert_abs_diff_eq!(secs(packet.pts.unwrap()), 3072.0 / 44_100.0, epsilon = 1e-6);
}

#[test]
fn headers_travel_in_caps() {
    let demux = pull_demux(theora_vorbis_file(5, 10));
    let events = run_to_end(&demux);

    let Event::StreamAdded(theora) = &events[0] else {
        panic!("expected a stream first, got {:?}", events[0]);
    };
    let Event::StreamAdded(vorbis) = &events[1] else {
        panic!("expected a second stream, got {:?}", events[1]);
    };
    assert!(matches!(events[2], Event::Segment(_)));

    assert_eq!(theora.caps.media_type, "video/x-theora");
    assert_eq!(theora.caps.stream_headers.len(), 3);
    assert_eq!(theora.caps.stream_headers[0], theora_id_header());
    assert_eq!(vorbis.caps.media_type, "audio/x-vorbis");
    assert_eq!(vorbis.caps.rate, Some(VORBIS_RATE));
    assert_eq!(vorbis.caps.stream_headers[2], vorbis_setup_header());

    let segments = events.iter().filter(|e| matches!(e, Event::Segment(_))).count();
    assert_eq!(segments, 1);
}

#[test]
fn theora_key_frames_are_flagged() {
    let demux = pull_demux(theora_file(THEORA_SERIAL, 25, 300));
    let events = run_to_end(&demux);

    let packets = data_packets(&events, THEORA_SERIAL);
    assert_eq!(packets.len(), 25);
    for (frame, packet) in (1..).zip(&packets) {
        assert_eq!(packet.pts, Some(theora_pts(frame)));
        assert_eq!(packet.duration, Some(100_000_000));
        assert_eq!(packet.delta_unit, theora_key(frame) != frame, "frame {frame}");
    }
    assert!(packets[0].discont);
    assert!(packets[1..].iter().all(|p| !p.discont));
}

#[test]
fn unknown_streams_pass_through_untimed() {
    const UNKNOWN: Serial = 0x0bad;
    let mut theora = StreamWriter::new(THEORA_SERIAL);
    let mut headers = theora_headers(&mut theora);
    let mut unknown = unknown_stream(UNKNOWN, 6);

    let mut file = headers.remove(0).bytes;
    file.extend(unknown.remove(0).bytes);
    file.extend(headers.into_iter().flat_map(|p| p.bytes));
    file.extend(interleave(vec![theora_frames(&mut theora, 20, 300), unknown]));

    let demux = pull_demux(file);
    let events = run_to_end(&demux);

    let caps = events
        .iter()
        .find_map(|e| match e {
            Event::StreamAdded(info) if info.serial == UNKNOWN => Some(&info.caps),
            _ => None,
        })
        .unwrap();
    assert_eq!(caps.media_type, oggdemux::codec::UNKNOWN_MEDIA_TYPE);

    let odd = data_packets(&events, UNKNOWN);
    assert!(odd.len() >= 6);
    assert!(odd.iter().all(|p| p.pts.is_none()));

    // timing of the known stream is unaffected
    assert_abs_diff_eq!(demux.duration().unwrap().as_secs_f64(), 2.0, epsilon = 1e-9);
    let frames = data_packets(&events, THEORA_SERIAL);
    assert_eq!(frames.len(), 20);
    assert_eq!(frames.last().unwrap().pts, Some(theora_pts(20)));
}

#[test]
fn garbage_before_first_page_is_skipped() {
    let mut file = b"this is not an ogg page".to_vec();
    file.extend(theora_file(THEORA_SERIAL, 12, 300));

    let demux = pull_demux(file);
    let events = run_to_end(&demux);
    assert_eq!(data_packets(&events, THEORA_SERIAL).len(), 12);
}

#[test]
fn position_follows_playback() {
    let demux = pull_demux(theora_file(THEORA_SERIAL, 30, 300));
    assert_eq!(demux.position(), None);
    run_to_end(&demux);
    assert_abs_diff_eq!(demux.position().unwrap().as_secs_f64(), 3.0, epsilon = 1e-9);
}

/// Twenty frames two to a page, with data page `damaged` left out or with a broken checksum.
fn damaged_pairs(damaged: usize, corrupt: bool) -> Vec<u8> {
    let mut writer = StreamWriter::new(THEORA_SERIAL);
    let mut file: Vec<u8> = theora_headers(&mut writer).into_iter().flat_map(|p| p.bytes).collect();
    for (n, page) in theora_frame_pairs(&mut writer, 20, 300).into_iter().enumerate() {
        let mut bytes = page.bytes;
        if n == damaged {
            if !corrupt {
                continue;
            }
            let last = bytes.len() - 1;
            bytes[last] ^= 0xff;
        }
        file.extend(bytes);
    }
    file
}

#[rstest]
#[case::lost(false)]
#[case::corrupted(true)]
fn timing_restarts_after_damaged_page(#[case] corrupt: bool) {
    // frames 3 and 4 go missing
    let demux = pull_demux(damaged_pairs(1, corrupt));
    let events = run_to_end(&demux);

    let packets = data_packets(&events, THEORA_SERIAL);
    let frames: Vec<i64> = packets.iter().map(|p| i64::from(p.data[1])).collect();
    assert_eq!(frames, [1, 2].into_iter().chain(5..=20).collect::<Vec<_>>());
    for (&frame, packet) in frames.iter().zip(&packets) {
        assert_eq!(packet.pts, Some(theora_pts(frame)), "frame {frame}");
    }
    assert!(packets[0].discont);
    assert!(!packets[1].discont);
    assert!(packets[2].discont, "no discont after the damage");
    assert!(packets[3..].iter().all(|p| !p.discont));
}

/// Holds back its first read until released.
struct GatedSource {
    data: Vec<u8>,
    entered: mpsc::Sender<()>,
    release: Option<mpsc::Receiver<()>>,
}

impl Source for GatedSource {
    fn read_range(&mut self, offset: u64, length: usize) -> io::Result<Option<Vec<u8>>> {
        if let Some(release) = self.release.take() {
            self.entered.send(()).unwrap();
            release.recv().unwrap();
        }
        let Some(rest) = self.data.get(offset as usize..).filter(|rest| !rest.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(rest[..length.min(rest.len())].to_vec()))
    }

    fn query_length(&mut self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

#[test]
fn queries_answer_while_chains_are_scanned() {
    let (entered_tx, entered) = mpsc::channel();
    let (release, release_rx) = mpsc::channel();
    let source = GatedSource {
        data: theora_file(THEORA_SERIAL, 10, 300),
        entered: entered_tx,
        release: Some(release_rx),
    };
    let demux = DemuxBuilder::new()
        .with_source(source)
        .with_sink(Arc::new(EventLog::new()))
        .build()
        .unwrap();
    let demux = &demux;

    thread::scope(|scope| {
        let streaming = scope.spawn(move || demux.step());
        entered.recv().unwrap();

        let (answer_tx, answer) = mpsc::channel();
        scope.spawn(move || {
            let _ = answer_tx.send((demux.duration(), demux.position()));
        });
        let queried = answer.recv_timeout(Duration::from_secs(5));
        release.send(()).unwrap();

        assert_eq!(queried, Ok((None, None)));
        assert_eq!(streaming.join().unwrap().unwrap(), Flow::Continue);
    });
    assert_abs_diff_eq!(demux.duration().unwrap().as_secs_f64(), 1.0, epsilon = 1e-9);
}
