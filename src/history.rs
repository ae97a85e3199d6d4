//! rolling in-memory history of recorded readings.

use crate::domain::Reading;
use std::collections::VecDeque;

/// 30 minutes at the 2 second cadence
pub const DEFAULT_CAPACITY: usize = 900;

/// fixed-capacity fifo; the oldest reading is dropped once full
#[derive(Debug)]
pub struct HistoryBuffer {
    readings: VecDeque<Reading>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { readings: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn append(&mut self, reading: Reading) {
        if self.readings.len() == self.capacity {
            self.readings.pop_front();
        }
        self.readings.push_back(reading);
    }

    /// all retained readings, oldest first
    pub fn snapshot(&self) -> Vec<Reading> {
        self.readings.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
