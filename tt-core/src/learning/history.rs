//! Bounded cycle history

use std::collections::VecDeque;

use crate::data::CycleMetrics;

/// FIFO of finalized cycles for one mode
#[derive(Debug, Clone, Default)]
pub struct CycleHistory {
    cycles: VecDeque<CycleMetrics>,
    capacity: usize,
}

impl CycleHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            cycles: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    /// Append a cycle, evicting the oldest when full
    pub fn push(&mut self, metrics: CycleMetrics) {
        while self.cycles.len() >= self.capacity {
            self.cycles.pop_front();
        }
        self.cycles.push_back(metrics);
    }

    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &CycleMetrics> {
        self.cycles.iter()
    }

    /// Up to `count` most recent learning-eligible cycles, oldest first
    pub fn recent_eligible(&self, count: usize) -> Vec<&CycleMetrics> {
        let mut recent: Vec<&CycleMetrics> = self
            .cycles
            .iter()
            .rev()
            .filter(|c| c.is_learning_eligible())
            .take(count)
            .collect();
        recent.reverse();
        recent
    }

    pub fn eligible_count(&self) -> usize {
        self.cycles.iter().filter(|c| c.is_learning_eligible()).count()
    }

    pub fn clear(&mut self) {
        self.cycles.clear();
    }

    pub fn to_vec(&self) -> Vec<CycleMetrics> {
        self.cycles.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CycleMode, DisturbanceFlags};

    fn metrics(start_ms: u64, disturbed: bool) -> CycleMetrics {
        let mut m: CycleMetrics = serde_json::from_str(
            r#"{"mode":"heat","start_ms":0,"start_temp":19.0,"target_temp":20.0,"duration_minutes":30}"#,
        )
        .unwrap();
        m.start_ms = start_ms;
        m.mode = CycleMode::Heat;
        m.disturbances = DisturbanceFlags {
            solar_gain: disturbed,
            ..DisturbanceFlags::default()
        };
        m
    }

    #[test]
    fn test_fifo_eviction() {
        let mut history = CycleHistory::new(3);
        for i in 0..5 {
            history.push(metrics(i, false));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.iter().next().unwrap().start_ms, 2);
    }

    #[test]
    fn test_recent_eligible_skips_disturbed() {
        let mut history = CycleHistory::new(10);
        history.push(metrics(1, false));
        history.push(metrics(2, true));
        history.push(metrics(3, false));
        history.push(metrics(4, false));

        let recent = history.recent_eligible(2);
        let starts: Vec<u64> = recent.iter().map(|c| c.start_ms).collect();
        assert_eq!(starts, vec![3, 4]);
        assert_eq!(history.eligible_count(), 3);
    }
}
