//! Anchor enumeration and batch partitioning
//!
//! Anchors are enumerated chronologically over `[start, end]`, filtered by
//! every registered coverage check, then cut into consecutive groups of
//! `batch_size`. A short final group is kept as-is.

use chrono::NaiveDateTime;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::timestamp::{format_key, is_aligned, ticks_between};
use super::window::AnchorCoverage;
use crate::error::{TecError, TecResult};

/// A group of anchors materialized together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Position in the chronological schedule
    pub index: usize,
    /// Anchors in chronological order
    pub anchors: Vec<NaiveDateTime>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// First anchor, used as the batch key
    pub fn key(&self) -> Option<NaiveDateTime> {
        self.anchors.first().copied()
    }
}

/// Ordered batches plus bookkeeping about excluded anchors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSchedule {
    pub batches: Vec<Batch>,
    pub batch_size: usize,
    /// Candidate anchors rejected by a coverage check
    pub excluded: usize,
}

impl BatchSchedule {
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Total anchors across all batches
    pub fn num_anchors(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// All anchors in schedule order
    pub fn anchors(&self) -> impl Iterator<Item = &NaiveDateTime> {
        self.batches.iter().flat_map(|b| b.anchors.iter())
    }

    /// Mapping from each batch's first anchor to the batch
    pub fn by_first_anchor(&self) -> BTreeMap<NaiveDateTime, &Batch> {
        self.batches
            .iter()
            .filter_map(|b| b.key().map(|k| (k, b)))
            .collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Batch> {
        self.batches.iter()
    }

    /// Split batches chronologically, the first part holding `train_ratio` of them
    pub fn split(&self, train_ratio: f64) -> (BatchSchedule, BatchSchedule) {
        let n = self.batches.len();
        let cut = ((n as f64) * train_ratio.clamp(0.0, 1.0)).round() as usize;
        let cut = cut.min(n);
        let part = |batches: &[Batch]| BatchSchedule {
            batches: batches.to_vec(),
            batch_size: self.batch_size,
            excluded: 0,
        };
        (part(&self.batches[..cut]), part(&self.batches[cut..]))
    }

    /// Shuffle batch order with a seeded RNG; anchors inside a batch keep their order
    pub fn shuffle(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        self.batches.shuffle(&mut rng);
    }
}

/// Builds a [`BatchSchedule`] from a date range and coverage checks
pub struct BatchScheduleBuilder<'a> {
    start: NaiveDateTime,
    end: NaiveDateTime,
    resolution_minutes: u32,
    batch_size: usize,
    anchor_stride: u32,
    coverage: Vec<&'a dyn AnchorCoverage>,
}

impl<'a> BatchScheduleBuilder<'a> {
    pub fn new(
        start: NaiveDateTime,
        end: NaiveDateTime,
        resolution_minutes: u32,
        batch_size: usize,
    ) -> Self {
        Self {
            start,
            end,
            resolution_minutes,
            batch_size,
            anchor_stride: 1,
            coverage: Vec::new(),
        }
    }

    /// Only consider every `stride`-th tick as a candidate anchor
    pub fn with_anchor_stride(mut self, stride: u32) -> Self {
        self.anchor_stride = stride;
        self
    }

    /// Register a coverage check; anchors must pass all of them
    pub fn with_coverage(mut self, check: &'a dyn AnchorCoverage) -> Self {
        self.coverage.push(check);
        self
    }

    /// Candidate anchors before coverage filtering
    pub fn candidates(&self) -> TecResult<Vec<NaiveDateTime>> {
        if self.batch_size == 0 {
            return Err(TecError::Config("batch size must be at least 1".to_string()));
        }
        if self.anchor_stride == 0 {
            return Err(TecError::Config("anchor stride must be at least 1".to_string()));
        }
        if self.end < self.start {
            return Err(TecError::Config(format!(
                "end {} precedes start {}",
                format_key(&self.end),
                format_key(&self.start)
            )));
        }
        if !is_aligned(&self.start, self.resolution_minutes) {
            return Err(TecError::Config(format!(
                "start {} is not aligned to the {}-minute grid",
                format_key(&self.start),
                self.resolution_minutes
            )));
        }
        Ok(ticks_between(
            self.start,
            self.end,
            self.resolution_minutes,
            self.anchor_stride,
        ))
    }

    pub fn build(&self) -> TecResult<BatchSchedule> {
        let candidates = self.candidates()?;
        let total = candidates.len();

        let mut valid = Vec::with_capacity(total);
        let mut excluded_by: BTreeMap<&'static str, usize> = BTreeMap::new();
        for anchor in candidates {
            match self.coverage.iter().find_map(|c| c.check(&anchor).err().map(|e| (c.label(), e))) {
                None => valid.push(anchor),
                Some((label, err)) => {
                    if !err.is_missing_data() {
                        return Err(err);
                    }
                    debug!("Excluding anchor {} ({}): {}", format_key(&anchor), label, err);
                    *excluded_by.entry(label).or_insert(0) += 1;
                }
            }
        }

        let batches = partition(&valid, self.batch_size);
        let excluded = total - valid.len();
        info!(
            "Scheduled {} anchors in {} batches of up to {} ({} of {} candidates excluded: {:?})",
            valid.len(),
            batches.len(),
            self.batch_size,
            excluded,
            total,
            excluded_by
        );

        Ok(BatchSchedule {
            batches,
            batch_size: self.batch_size,
            excluded,
        })
    }
}

/// Consecutive groups of `batch_size`; the last group may be shorter
pub fn partition(anchors: &[NaiveDateTime], batch_size: usize) -> Vec<Batch> {
    anchors
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            anchors: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::timestamp::{parse_datetime, shift};
    use std::collections::BTreeSet;

    fn ts(s: &str) -> NaiveDateTime {
        parse_datetime(s).unwrap()
    }

    fn anchors(n: usize) -> Vec<NaiveDateTime> {
        (0..n).map(|i| shift(ts("2015-01-02"), i as i64, 5)).collect()
    }

    /// Rejects a fixed set of anchors as missing
    struct Holes(BTreeSet<NaiveDateTime>);

    impl AnchorCoverage for Holes {
        fn check(&self, anchor: &NaiveDateTime) -> TecResult<()> {
            if self.0.contains(anchor) {
                Err(TecError::MissingMap(*anchor))
            } else {
                Ok(())
            }
        }

        fn label(&self) -> &'static str {
            "holes"
        }
    }

    struct Broken;

    impl AnchorCoverage for Broken {
        fn check(&self, _anchor: &NaiveDateTime) -> TecResult<()> {
            Err(TecError::Config("broken".into()))
        }

        fn label(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn test_partition_sizes() {
        for (n, b) in [(10usize, 4usize), (12, 4), (3, 4), (1, 1), (0, 3), (17, 5)] {
            let batches = partition(&anchors(n), b);
            assert_eq!(batches.len(), (n + b - 1) / b);
            for batch in batches.iter().take(n / b) {
                assert_eq!(batch.len(), b);
            }
            if n % b != 0 {
                assert_eq!(batches.last().unwrap().len(), n % b);
            }
            let flat: Vec<_> = batches.iter().flat_map(|b| b.anchors.clone()).collect();
            assert_eq!(flat, anchors(n));
        }
    }

    #[test]
    fn test_build_excludes_uncovered() {
        let holes = Holes([ts("2015-01-02 00:10:00"), ts("2015-01-02 00:20:00")].into());
        let schedule = BatchScheduleBuilder::new(ts("2015-01-02"), ts("2015-01-02 00:55:00"), 5, 4)
            .with_coverage(&holes)
            .build()
            .unwrap();

        assert_eq!(schedule.excluded, 2);
        assert_eq!(schedule.num_anchors(), 10);
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule.batches[2].len(), 2);
        assert!(schedule.anchors().all(|a| !holes.0.contains(a)));
        assert!(schedule.anchors().collect::<Vec<_>>().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_end_is_inclusive_and_stride_applies() {
        let schedule = BatchScheduleBuilder::new(ts("2015-01-02"), ts("2015-01-02 01:00:00"), 5, 100)
            .with_anchor_stride(6)
            .build()
            .unwrap();
        let all: Vec<_> = schedule.anchors().copied().collect();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2], ts("2015-01-02 01:00:00"));
    }

    #[test]
    fn test_non_data_errors_propagate() {
        let err = BatchScheduleBuilder::new(ts("2015-01-02"), ts("2015-01-02 01:00:00"), 5, 4)
            .with_coverage(&Broken)
            .build()
            .unwrap_err();
        assert!(matches!(err, TecError::Config(_)));
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        assert!(BatchScheduleBuilder::new(ts("2015-01-03"), ts("2015-01-02"), 5, 4).build().is_err());
        assert!(BatchScheduleBuilder::new(ts("2015-01-02"), ts("2015-01-03"), 5, 0).build().is_err());
        assert!(BatchScheduleBuilder::new(ts("2015-01-02 00:03:00"), ts("2015-01-03"), 5, 4)
            .build()
            .is_err());
    }

    #[test]
    fn test_split_and_keys() {
        let schedule = BatchScheduleBuilder::new(ts("2015-01-02"), ts("2015-01-02 00:45:00"), 5, 2)
            .build()
            .unwrap();
        assert_eq!(schedule.len(), 5);

        let (train, val) = schedule.split(0.8);
        assert_eq!(train.len(), 4);
        assert_eq!(val.len(), 1);
        assert_eq!(val.batches[0].key(), Some(ts("2015-01-02 00:40:00")));

        let keys: Vec<_> = schedule.by_first_anchor().keys().copied().collect();
        assert_eq!(keys[1], ts("2015-01-02 00:10:00"));
    }

    #[test]
    fn test_shuffle_is_explicit_and_seeded() {
        let built = BatchScheduleBuilder::new(ts("2015-01-02"), ts("2015-01-02 04:00:00"), 5, 3)
            .build()
            .unwrap();
        let original = built.clone();

        let mut a = built.clone();
        let mut b = built;
        a.shuffle(7);
        b.shuffle(7);
        assert_eq!(a.batches, b.batches);
        assert_ne!(a.batches, original.batches);
        for batch in &a.batches {
            assert_eq!(batch, &original.batches[batch.index]);
        }
    }
}
