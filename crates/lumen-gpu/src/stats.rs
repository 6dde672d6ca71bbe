//! Per-frame counters.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    DrawCalls,
    Dispatches,
    Submissions,
    PipelineBinds,
    PipelinesBuilt,
    Uploads,
    Transitions,
}

const COUNTERS: usize = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStatistics {
    pub frame: u64,
    pub draw_calls: u64,
    pub dispatches: u64,
    pub submissions: u64,
    pub pipeline_binds: u64,
    pub pipelines_built: u64,
    pub uploads: u64,
    pub transitions: u64,
}

/// Counters of the frame being recorded, plus the last completed frame.
#[derive(Default)]
pub struct Statistics {
    counters: [AtomicU64; COUNTERS],
    previous: Mutex<FrameStatistics>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, counter: Counter, amount: u64) {
        self.counters[counter as usize].fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, frame: u64) -> FrameStatistics {
        FrameStatistics {
            frame,
            draw_calls: self.get(Counter::DrawCalls),
            dispatches: self.get(Counter::Dispatches),
            submissions: self.get(Counter::Submissions),
            pipeline_binds: self.get(Counter::PipelineBinds),
            pipelines_built: self.get(Counter::PipelinesBuilt),
            uploads: self.get(Counter::Uploads),
            transitions: self.get(Counter::Transitions),
        }
    }

    /// Close `frame`: keep its totals as the previous frame and start over.
    pub fn roll(&self, frame: u64) -> FrameStatistics {
        let mut finished = FrameStatistics {
            frame,
            ..Default::default()
        };
        for (index, value) in [
            &mut finished.draw_calls,
            &mut finished.dispatches,
            &mut finished.submissions,
            &mut finished.pipeline_binds,
            &mut finished.pipelines_built,
            &mut finished.uploads,
            &mut finished.transitions,
        ]
        .into_iter()
        .enumerate()
        {
            *value = self.counters[index].swap(0, Ordering::Relaxed);
        }
        *self.previous.lock() = finished;
        finished
    }

    pub fn previous(&self) -> FrameStatistics {
        *self.previous.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roll_resets_and_keeps_previous() {
        let stats = Statistics::new();
        stats.add(Counter::DrawCalls, 3);
        stats.add(Counter::Transitions, 1);
        assert_eq!(stats.snapshot(1).draw_calls, 3);

        let finished = stats.roll(1);
        assert_eq!(finished.draw_calls, 3);
        assert_eq!(finished.transitions, 1);
        assert_eq!(stats.get(Counter::DrawCalls), 0);
        assert_eq!(stats.previous(), finished);
    }
}
