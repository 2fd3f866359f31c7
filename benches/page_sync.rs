use std::time::Duration;

use divan::Bencher;
use oggdemux::page::{PageSync, Sync};
use oggdemux::SeekRequest;

#[path = "../tests/test_support/mod.rs"]
mod test_support;
use test_support::*;

fn main() {
    divan::main();
}

/// Frames a ten second video with pages of `frame_size` byte packets.
#[divan::bench(args = [100, 2_000, 60_000])]
fn frame_pages(bencher: Bencher, frame_size: usize) {
    let file = theora_file(THEORA_SERIAL, 100, frame_size);
    bencher.counter(divan::counter::BytesCount::new(file.len())).bench(|| {
        let mut sync = PageSync::new();
        sync.feed(divan::black_box(&file));
        let mut pages = 0;
        loop {
            match sync.page_seek() {
                Sync::Page(page) => {
                    divan::black_box_drop(page);
                    pages += 1;
                }
                Sync::Skipped(_) => {}
                Sync::NeedMore => break,
            }
        }
        pages
    })
}

/// Resynchronizes after garbage in front of every page.
#[divan::bench]
fn skip_garbage(bencher: Bencher) {
    let mut writer = StreamWriter::new(THEORA_SERIAL);
    let mut file = Vec::new();
    for frame in theora_frames(&mut writer, 200, 500) {
        file.extend_from_slice(b"OggS but not quite a page");
        file.extend(frame.bytes);
    }
    bencher.bench(|| {
        let mut sync = PageSync::new();
        sync.feed(divan::black_box(&file));
        while sync.page_seek() != Sync::NeedMore {}
    })
}

#[divan::bench]
fn play_multiplexed(bencher: Bencher) {
    let file = theora_vorbis_file(100, 430);
    bencher
        .with_inputs(|| pull_demux(file.clone()))
        .bench_values(|demux| run_to_end(&demux).len())
}

#[divan::bench(args = [1.0, 150.0, 299.0])]
fn bisect(bencher: Bencher, seconds: f64) {
    let file = theora_file(THEORA_SERIAL, 3000, 300);
    bencher
        .with_inputs(|| {
            let demux = pull_demux(file.clone());
            demux.step().unwrap();
            demux
        })
        .bench_refs(|demux| {
            demux
                .seek(&SeekRequest::to(Duration::from_secs_f64(seconds)))
                .unwrap()
        })
}
