//! Chains (groups of logical streams multiplexed together) and the registry that owns them.

use crate::common::{log_debug, Serial};
use crate::stream::LogicalStream;

/// A group of logical streams that start together with their begin-of-stream pages.
///
/// A physical file is a sequence of chains; each chain starts where the previous one ended.
#[derive(Debug, Default)]
pub struct Chain {
    pub(crate) streams: Vec<LogicalStream>,
    /// Byte offset of the first page of the chain.
    pub(crate) offset: u64,
    /// Byte offset just past the last page of the chain, when known.
    pub(crate) end_offset: Option<u64>,
    /// Whether all begin-of-stream pages were seen.
    pub(crate) have_bos: bool,
    /// Time at which the chain starts on the global timeline.
    pub(crate) begin_time: Option<u64>,
    /// Earliest start time of the chain's streams, in stream time.
    pub(crate) segment_start: Option<u64>,
    /// End time of the last page of the chain, in stream time.
    pub(crate) segment_stop: Option<u64>,
    pub(crate) total_time: Option<u64>,
}

impl Chain {
    pub(crate) fn new(offset: u64) -> Self {
        log_debug!("creating new chain at offset {offset}");
        Chain {
            offset,
            ..Chain::default()
        }
    }

    pub fn streams(&self) -> &[LogicalStream] {
        &self.streams
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn begin_time(&self) -> Option<u64> {
        self.begin_time
    }

    pub fn total_time(&self) -> Option<u64> {
        self.total_time
    }

    pub(crate) fn position(&self, serial: Serial) -> Option<usize> {
        self.streams.iter().position(|s| s.serial() == serial)
    }

    pub fn stream(&self, serial: Serial) -> Option<&LogicalStream> {
        self.streams.iter().find(|s| s.serial() == serial)
    }

    pub(crate) fn stream_mut(&mut self, serial: Serial) -> Option<&mut LogicalStream> {
        self.streams.iter_mut().find(|s| s.serial() == serial)
    }

    pub fn has_stream(&self, serial: Serial) -> bool {
        self.position(serial).is_some()
    }

    /// Adds a fresh stream and returns its index.
    pub(crate) fn new_stream(&mut self, serial: Serial) -> usize {
        log_debug!("creating new stream {serial:08x}");
        self.streams.push(LogicalStream::new(serial));
        self.streams.len() - 1
    }

    pub(crate) fn mark_discont(&mut self) {
        self.streams.iter_mut().for_each(LogicalStream::mark_discont);
    }

    pub(crate) fn reset(&mut self) {
        self.streams.iter_mut().for_each(LogicalStream::reset);
    }

    /// Earliest start time of the chain, once every timed stream knows its own.
    pub(crate) fn collect_start_time(&self) -> Option<u64> {
        let mut start = None;
        let known = |s: &&LogicalStream| !s.codec.is_skeleton() && !s.codec.is_unknown();
        for stream in self.streams.iter().filter(known) {
            match stream.start_time {
                Some(time) => start = Some(start.map_or(time, |s: u64| s.min(time))),
                None if !stream.codec.is_sparse() => return None,
                None => {}
            }
        }
        start
    }

    /// Fills in the segment start and the total time. Returns `false` while some stream has no
    /// start time yet.
    pub(crate) fn collect_chain_info(&mut self) -> bool {
        self.total_time = None;
        self.segment_start = self.collect_start_time();
        let Some(start) = self.segment_start else {
            return false;
        };
        if let Some(stop) = self.segment_stop {
            self.total_time = Some(stop.saturating_sub(start));
        }
        log_debug!("chain at {}: total time {:?}", self.offset, self.total_time);
        true
    }

    /// Latest first-page time over the timed streams, once all of them have one.
    pub(crate) fn collect_sync_time(&self) -> Option<u64> {
        let mut sync = None;
        for stream in self.streams.iter().filter(|s| s.is_timed()) {
            let time = stream.push_sync_time?;
            sync = Some(sync.map_or(time, |s: u64| s.max(time)));
        }
        sync
    }
}

/// Handle of a chain in a [`ChainRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChainId(usize);

/// Owns every chain the demuxer knows of.
///
/// Chains are addressed by [`ChainId`]; the registry tracks which chain is being built from
/// incoming begin-of-stream pages, which one is exposed, and in pull mode the full list of
/// chains of the file in byte order.
#[derive(Debug, Default)]
pub struct ChainRegistry {
    slots: Vec<Option<Chain>>,
    chains: Vec<ChainId>,
    pub(crate) building: Option<ChainId>,
    pub(crate) current: Option<ChainId>,
}

impl ChainRegistry {
    pub(crate) fn insert(&mut self, chain: Chain) -> ChainId {
        match self.slots.iter().position(Option::is_none) {
            Some(idx) => {
                self.slots[idx] = Some(chain);
                ChainId(idx)
            }
            None => {
                self.slots.push(Some(chain));
                ChainId(self.slots.len() - 1)
            }
        }
    }

    /// Drops a chain and every reference to it.
    pub(crate) fn remove(&mut self, id: ChainId) -> Option<Chain> {
        let chain = self.slots.get_mut(id.0)?.take()?;
        self.chains.retain(|&c| c != id);
        if self.building == Some(id) {
            self.building = None;
        }
        if self.current == Some(id) {
            self.current = None;
        }
        Some(chain)
    }

    pub fn get(&self, id: ChainId) -> Option<&Chain> {
        self.slots.get(id.0)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: ChainId) -> Option<&mut Chain> {
        self.slots.get_mut(id.0)?.as_mut()
    }

    pub fn current(&self) -> Option<ChainId> {
        self.current
    }

    pub fn building(&self) -> Option<ChainId> {
        self.building
    }

    /// Chains of the file, in byte order.
    pub fn chains(&self) -> &[ChainId] {
        &self.chains
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Records `id` as the next chain of the file, after those found before it.
    pub(crate) fn append(&mut self, id: ChainId) {
        self.chains.push(id);
    }

    pub(crate) fn stream_mut(&mut self, id: ChainId, idx: usize) -> Option<&mut LogicalStream> {
        self.get_mut(id)?.streams.get_mut(idx)
    }

    /// Locates the stream with `serial`, looking at the chain being built, then the exposed
    /// chain, then every known chain.
    pub(crate) fn find_stream(&self, serial: Serial) -> Option<(ChainId, usize)> {
        self.building
            .into_iter()
            .chain(self.current)
            .chain(self.chains.iter().copied())
            .find_map(|id| Some((id, self.get(id)?.position(serial)?)))
    }

    /// The known chain containing a stream with `serial`.
    pub(crate) fn find_chain(&self, serial: Serial) -> Option<ChainId> {
        self.chains
            .iter()
            .copied()
            .find(|&id| self.get(id).is_some_and(|c| c.has_stream(serial)))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Chain> {
        self.slots.iter_mut().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::vorbis_id_header;

    fn chain_with(serials: &[Serial]) -> Chain {
        let mut chain = Chain::new(0);
        for &serial in serials {
            let idx = chain.new_stream(serial);
            assert!(chain.streams[idx].codec.setup(&vorbis_id_header(44_100, 8, 11)));
        }
        chain
    }

    #[test]
    fn start_time_waits_for_timed_streams() {
        let mut chain = chain_with(&[1, 2, 3]);
        chain.streams[2].codec.is_sparse = true;
        chain.streams[0].start_time = Some(500);
        assert_eq!(chain.collect_start_time(), None);

        chain.streams[1].start_time = Some(200);
        assert_eq!(chain.collect_start_time(), Some(200));

        chain.segment_stop = Some(10_200);
        assert!(chain.collect_chain_info());
        assert_eq!(chain.total_time, Some(10_000));
    }

    #[test]
    fn sparse_start_time_counts_when_known() {
        let mut chain = chain_with(&[1, 2]);
        chain.streams[1].codec.is_sparse = true;
        chain.streams[0].start_time = Some(500);
        chain.streams[1].start_time = Some(100);
        assert_eq!(chain.collect_start_time(), Some(100));
    }

    #[test]
    fn unknown_streams_do_not_hold_back_start_time() {
        let mut chain = chain_with(&[1]);
        chain.new_stream(2);
        chain.streams[0].start_time = Some(40);
        assert_eq!(chain.collect_start_time(), Some(40));
    }

    #[test]
    fn sync_time_is_latest_of_timed_streams() {
        let mut chain = chain_with(&[1, 2]);
        chain.streams[0].push_sync_time = Some(3);
        assert_eq!(chain.collect_sync_time(), None);
        chain.streams[1].push_sync_time = Some(7);
        assert_eq!(chain.collect_sync_time(), Some(7));
    }

    #[test]
    fn find_stream_prefers_building_chain() {
        let mut registry = ChainRegistry::default();
        let old = registry.insert(chain_with(&[1, 2]));
        registry.append(old);
        let new = registry.insert(chain_with(&[2]));
        registry.building = Some(new);

        assert_eq!(registry.find_stream(2), Some((new, 0)));
        assert_eq!(registry.find_stream(1), Some((old, 0)));
        assert_eq!(registry.find_stream(9), None);
        assert_eq!(registry.find_chain(2), Some(old));
    }

    #[test]
    fn removed_slot_is_reused() {
        let mut registry = ChainRegistry::default();
        let first = registry.insert(chain_with(&[1]));
        registry.current = Some(first);
        assert!(registry.remove(first).is_some());
        assert_eq!(registry.current(), None);
        assert!(registry.get(first).is_none());

        let second = registry.insert(chain_with(&[2]));
        assert_eq!(second, first);
        assert!(registry.get(second).is_some_and(|c| c.has_stream(2)));
    }
}
