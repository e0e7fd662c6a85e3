//! Sliding-window duplicate detection per receiving chain generation.
//!
//! Memory is bounded on both axes: within a generation only indices inside
//! the window are remembered, and only the newest generations are tracked.
//! Anything that falls off either edge is rejected even if it was never seen,
//! trading perfect recall for a fixed footprint.

use crate::proto::{ReplayGenerationProto, ReplayWindowProto};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct GenerationWindow {
    highest: u32,
    seen: BTreeSet<u32>,
}

impl GenerationWindow {
    fn below_floor(&self, index: u32, window: u32) -> bool {
        index < self.highest && self.highest - index >= window
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayWindow {
    window: u32,
    max_generations: usize,
    /// Generations below this were evicted and are rejected wholesale.
    generation_floor: u32,
    generations: BTreeMap<u32, GenerationWindow>,
}

impl ReplayWindow {
    pub fn new(window: u32, max_generations: usize) -> Self {
        Self {
            window: window.max(1),
            max_generations: max_generations.max(1),
            generation_floor: 0,
            generations: BTreeMap::new(),
        }
    }

    /// Whether `(generation, index)` would be rejected. Does not record anything.
    pub fn is_replay(&self, generation: u32, index: u32) -> bool {
        if generation < self.generation_floor {
            return true;
        }
        match self.generations.get(&generation) {
            Some(entry) => entry.below_floor(index, self.window) || entry.seen.contains(&index),
            None => false,
        }
    }

    /// Records `(generation, index)` if it is new and inside the window.
    ///
    /// Returns `false` for duplicates and for pairs below either floor.
    pub fn accept(&mut self, generation: u32, index: u32) -> bool {
        if self.is_replay(generation, index) {
            return false;
        }

        let window = self.window;
        let entry = self.generations.entry(generation).or_default();
        if entry.seen.is_empty() || index > entry.highest {
            entry.highest = index;
        }
        entry.seen.insert(index);

        let highest = entry.highest;
        entry
            .seen
            .retain(|seen| !(*seen < highest && highest - *seen >= window));

        while self.generations.len() > self.max_generations {
            let Some((evicted, _)) = self.generations.pop_first() else {
                break;
            };
            self.generation_floor = self.generation_floor.max(evicted.saturating_add(1));
        }

        true
    }

    /// Number of generations currently tracked.
    pub fn tracked_generations(&self) -> usize {
        self.generations.len()
    }

    pub(crate) fn to_proto(&self) -> ReplayWindowProto {
        ReplayWindowProto {
            generation_floor: self.generation_floor,
            generations: self
                .generations
                .iter()
                .map(|(generation, entry)| ReplayGenerationProto {
                    generation: *generation,
                    highest: entry.highest,
                    seen: entry.seen.iter().copied().collect(),
                })
                .collect(),
        }
    }

    pub(crate) fn from_proto(proto: &ReplayWindowProto, window: u32, max_generations: usize) -> Self {
        let mut replay = Self::new(window, max_generations);
        replay.generation_floor = proto.generation_floor;
        for generation in &proto.generations {
            replay.generations.insert(
                generation.generation,
                GenerationWindow {
                    highest: generation.highest,
                    seen: generation.seen.iter().copied().collect(),
                },
            );
        }
        replay
    }
}
