//! Tournament tree (tree of losers) over stream cursors.
//!
//! The tree stores stream indices; cursors live in the operator's arena.
//! Node 0 holds the overall winner, nodes 1..N the loser of each match. A pop
//! replays only the path from the winner's leaf, log2(N) comparisons.
//!
//! Exhausted streams lose every match. Equal keys break toward the lower
//! stream index, which makes merge output deterministic for a given input
//! schedule.

use crate::merge::stream::SourceStream;

pub(crate) struct TreeOfLosers {
    losers: Vec<usize>,
    initialized: bool,
    adjusted: bool,
}

impl TreeOfLosers {
    pub(crate) fn new(num_streams: usize) -> Self {
        debug_assert!(num_streams > 1);
        Self {
            losers: Vec::with_capacity(num_streams),
            initialized: false,
            adjusted: false,
        }
    }

    /// The currently smallest stream, or `None` when every stream is
    /// exhausted. Must not be called while any stream waits on its source.
    pub(crate) fn next(&mut self, streams: &[SourceStream]) -> Option<usize> {
        debug_assert!(streams.iter().all(|s| !s.needs_data()));
        if !self.initialized {
            self.init(streams);
        } else if !self.adjusted {
            self.update(streams);
        }
        let winner = self.losers[0];
        streams[winner].has_row().then_some(winner)
    }

    /// Tell the tree its winner advanced; the next `next` call replays the
    /// winner's path.
    pub(crate) fn winner_advanced(&mut self) {
        self.adjusted = false;
    }

    /// True iff stream `a` loses to stream `b`.
    fn is_gt(streams: &[SourceStream], a: usize, b: usize) -> bool {
        match (streams[a].has_row(), streams[b].has_row()) {
            (false, _) => true,
            (true, false) => false,
            (true, true) => streams[a]
                .compare(&streams[b])
                .then_with(|| a.cmp(&b))
                .is_gt(),
        }
    }

    fn init(&mut self, streams: &[SourceStream]) {
        let n = streams.len();
        self.losers = vec![usize::MAX; n];
        for i in 0..n {
            let mut winner = i;
            let mut cmp_node = (n + i) / 2;
            while cmp_node != 0 && self.losers[cmp_node] != usize::MAX {
                let challenger = self.losers[cmp_node];
                if Self::is_gt(streams, winner, challenger) {
                    self.losers[cmp_node] = winner;
                    winner = challenger;
                }
                cmp_node /= 2;
            }
            self.losers[cmp_node] = winner;
        }
        self.initialized = true;
        self.adjusted = true;
    }

    fn update(&mut self, streams: &[SourceStream]) {
        let mut winner = self.losers[0];
        let mut cmp_node = (streams.len() + winner) / 2;
        while cmp_node != 0 {
            let challenger = self.losers[cmp_node];
            if Self::is_gt(streams, winner, challenger) {
                self.losers[cmp_node] = winner;
                winner = challenger;
            }
            cmp_node /= 2;
        }
        self.losers[0] = winner;
        self.adjusted = true;
    }
}
