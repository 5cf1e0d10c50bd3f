//! Canonical time grid over a TEC map archive
//!
//! The archive is bulk loaded once for the requested range plus the load
//! window on either side. After loading, every lookup is an in-memory
//! operation.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use ndarray::Array2;
use ndarray_npy::{ReadNpyError, ReadNpyExt, WriteNpyExt};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::tec_map::TecMap;
use super::timestamp::{days_between, format_day, format_key, is_aligned, ticks_between};
use crate::error::{TecError, TecResult};

/// What to do when a whole day of the archive is absent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadPolicy {
    /// Abort the load with `DataLoad`
    #[default]
    Strict,
    /// Log the day as missing and continue; its anchors get excluded later
    Lenient,
}

/// Range and resolution of a grid load
#[derive(Debug, Clone)]
pub struct GridSpec {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub resolution_minutes: u32,
    pub load_window_days: u32,
    pub policy: LoadPolicy,
}

impl GridSpec {
    /// Earliest timestamp the index may hold
    pub fn lower_bound(&self) -> NaiveDateTime {
        self.start - Duration::days(self.load_window_days as i64)
    }

    /// Latest timestamp the index may hold
    pub fn upper_bound(&self) -> NaiveDateTime {
        self.end + Duration::days(self.load_window_days as i64)
    }
}

/// Source of TEC maps, one calendar day at a time
pub trait MapArchive {
    /// Maps for `day`, or `None` when the archive has no entry for that day
    fn read_day(&self, day: NaiveDate, resolution_minutes: u32) -> TecResult<Option<Vec<TecMap>>>;
}

/// Archive of `.npy` files laid out as `<root>/<YYYYMMDD>/<YYYYMMDD.HHMM>.npy`
#[derive(Debug, Clone)]
pub struct NpyArchive {
    root: PathBuf,
}

impl NpyArchive {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one day's maps
    pub fn day_dir(&self, day: &NaiveDate) -> PathBuf {
        self.root.join(format_day(day))
    }

    /// File path of the map at `ts`
    pub fn map_path(&self, ts: &NaiveDateTime) -> PathBuf {
        self.day_dir(&ts.date())
            .join(format!("{}.npy", format_key(ts)))
    }

    /// Write a map into the archive layout
    pub fn write_map(&self, ts: &NaiveDateTime, values: &Array2<f32>) -> TecResult<PathBuf> {
        let dir = self.day_dir(&ts.date());
        fs::create_dir_all(&dir)?;
        let path = self.map_path(ts);
        let writer = BufWriter::new(File::create(&path)?);
        values.write_npy(writer)?;
        Ok(path)
    }
}

/// Read a 2-D map stored as either f64 or f32
pub fn read_map_file(path: &Path) -> TecResult<Array2<f32>> {
    let file = File::open(path).map_err(|e| TecError::load(path, e.to_string()))?;
    match Array2::<f64>::read_npy(file) {
        Ok(values) => Ok(values.mapv(|v| v as f32)),
        Err(ReadNpyError::WrongDescriptor(_)) => {
            let file = File::open(path).map_err(|e| TecError::load(path, e.to_string()))?;
            Array2::<f32>::read_npy(file).map_err(|e| TecError::load(path, e.to_string()))
        }
        Err(e) => Err(TecError::load(path, e.to_string())),
    }
}

impl MapArchive for NpyArchive {
    fn read_day(&self, day: NaiveDate, resolution_minutes: u32) -> TecResult<Option<Vec<TecMap>>> {
        let dir = self.day_dir(&day);
        if !dir.is_dir() {
            return Ok(None);
        }

        let (Some(first), Some(last)) = (day.and_hms_opt(0, 0, 0), day.and_hms_opt(23, 59, 0)) else {
            return Err(TecError::load(dir, "invalid calendar day"));
        };

        let mut maps = Vec::new();
        for ts in ticks_between(first, last, resolution_minutes, 1) {
            let path = self.map_path(&ts);
            if path.is_file() {
                maps.push(TecMap::new(ts, read_map_file(&path)?));
            }
        }
        debug!("Read {} maps from {:?}", maps.len(), dir);
        Ok(Some(maps))
    }
}

/// In-memory index from grid timestamp to TEC map
#[derive(Debug, Clone)]
pub struct TimeGridIndex {
    maps: BTreeMap<NaiveDateTime, TecMap>,
    lower: NaiveDateTime,
    upper: NaiveDateTime,
    resolution_minutes: u32,
    shape: Option<(usize, usize)>,
    loaded_days: BTreeSet<NaiveDate>,
    missing_days: BTreeSet<NaiveDate>,
    missing_ticks: BTreeSet<NaiveDateTime>,
}

impl TimeGridIndex {
    /// Bulk load every map in `[start - window, end + window]`
    ///
    /// Days are read in parallel; the merged result is the same as a
    /// sequential load, including which error surfaces first.
    pub fn load<A: MapArchive + Sync>(archive: &A, spec: &GridSpec) -> TecResult<Self> {
        let lower = spec.lower_bound();
        let upper = spec.upper_bound();
        if upper < lower {
            return Err(TecError::Config(format!(
                "end date {} precedes start date {}",
                spec.end, spec.start
            )));
        }

        let days: BTreeSet<NaiveDate> = days_between(lower, upper).into_iter().collect();
        let days: Vec<NaiveDate> = days.into_iter().collect();
        info!(
            "Loading TEC maps for {} days ({} .. {})",
            days.len(),
            format_key(&lower),
            format_key(&upper)
        );

        let results: Vec<(NaiveDate, TecResult<Option<Vec<TecMap>>>)> = days
            .par_iter()
            .map(|&day| (day, archive.read_day(day, spec.resolution_minutes)))
            .collect();

        let mut index = Self::empty(spec);
        for (day, result) in results {
            match result? {
                Some(maps) => {
                    index.loaded_days.insert(day);
                    for map in maps {
                        index.insert(map)?;
                    }
                }
                None => match spec.policy {
                    LoadPolicy::Strict => {
                        return Err(TecError::load(
                            PathBuf::from(format_day(&day)),
                            "no archive entry for required day",
                        ));
                    }
                    LoadPolicy::Lenient => {
                        warn!("No TEC archive entry for {}, marking day as missing", format_day(&day));
                        index.missing_days.insert(day);
                    }
                },
            }
        }

        index.record_missing_ticks();
        if !index.missing_ticks.is_empty() {
            warn!(
                "{} grid ticks have no TEC map inside loaded days (first {})",
                index.missing_ticks.len(),
                index.missing_ticks.iter().next().map(format_key).unwrap_or_default()
            );
        }

        info!(
            "Loaded {} TEC maps, grid shape {:?}, {} missing days, {} missing ticks",
            index.len(),
            index.shape,
            index.missing_days.len(),
            index.missing_ticks.len()
        );
        Ok(index)
    }

    /// Build an index from maps already in memory
    pub fn from_maps<I>(maps: I, spec: &GridSpec) -> TecResult<Self>
    where
        I: IntoIterator<Item = TecMap>,
    {
        let mut index = Self::empty(spec);
        for map in maps {
            index.loaded_days.insert(map.timestamp.date());
            index.insert(map)?;
        }
        index.record_missing_ticks();
        Ok(index)
    }

    fn empty(spec: &GridSpec) -> Self {
        Self {
            maps: BTreeMap::new(),
            lower: spec.lower_bound(),
            upper: spec.upper_bound(),
            resolution_minutes: spec.resolution_minutes,
            shape: None,
            loaded_days: BTreeSet::new(),
            missing_days: BTreeSet::new(),
            missing_ticks: BTreeSet::new(),
        }
    }

    /// Grid ticks of loaded days, within bounds, that have no map
    fn record_missing_ticks(&mut self) {
        let mut missing = BTreeSet::new();
        for day in &self.loaded_days {
            let (Some(first), Some(last)) = (day.and_hms_opt(0, 0, 0), day.and_hms_opt(23, 59, 0)) else {
                continue;
            };
            let first = first.max(self.lower);
            let last = last.min(self.upper);
            if last < first {
                continue;
            }
            missing.extend(
                ticks_between(first, last, self.resolution_minutes, 1)
                    .into_iter()
                    .filter(|ts| is_aligned(ts, self.resolution_minutes) && !self.maps.contains_key(ts)),
            );
        }
        self.missing_ticks = missing;
    }

    fn insert(&mut self, map: TecMap) -> TecResult<()> {
        let ts = map.timestamp;
        if ts < self.lower || ts > self.upper || !is_aligned(&ts, self.resolution_minutes) {
            return Ok(());
        }
        match self.shape {
            None => self.shape = Some(map.shape()),
            Some(expected) if expected != map.shape() => {
                return Err(TecError::ShapeMismatch {
                    timestamp: ts,
                    expected,
                    actual: map.shape(),
                });
            }
            Some(_) => {}
        }
        self.maps.insert(ts, map);
        Ok(())
    }

    /// Map at `ts`, or `MissingMap` if absent or outside the loaded bounds
    pub fn get(&self, ts: &NaiveDateTime) -> TecResult<&TecMap> {
        self.maps.get(ts).ok_or(TecError::MissingMap(*ts))
    }

    pub fn contains(&self, ts: &NaiveDateTime) -> bool {
        self.maps.contains_key(ts)
    }

    /// Number of loaded maps
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Common (height, width) of all maps, once at least one is loaded
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.shape
    }

    pub fn resolution_minutes(&self) -> u32 {
        self.resolution_minutes
    }

    /// Inclusive bounds of the loaded range
    pub fn bounds(&self) -> (NaiveDateTime, NaiveDateTime) {
        (self.lower, self.upper)
    }

    pub fn loaded_days(&self) -> &BTreeSet<NaiveDate> {
        &self.loaded_days
    }

    pub fn missing_days(&self) -> &BTreeSet<NaiveDate> {
        &self.missing_days
    }

    /// Absent maps inside days the archive does have
    pub fn missing_ticks(&self) -> &BTreeSet<NaiveDateTime> {
        &self.missing_ticks
    }

    /// Iterate maps in chronological order
    pub fn iter(&self) -> impl Iterator<Item = &TecMap> {
        self.maps.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::timestamp::parse_datetime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn ts(s: &str) -> NaiveDateTime {
        parse_datetime(s).unwrap()
    }

    fn spec(start: &str, end: &str, window: u32, policy: LoadPolicy) -> GridSpec {
        GridSpec {
            start: ts(start),
            end: ts(end),
            resolution_minutes: 5,
            load_window_days: window,
            policy,
        }
    }

    /// Archive that counts reads per day and generates constant maps
    struct CountingArchive {
        present: BTreeSet<NaiveDate>,
        reads: Mutex<BTreeMap<NaiveDate, usize>>,
        total: AtomicUsize,
    }

    impl MapArchive for CountingArchive {
        fn read_day(&self, day: NaiveDate, resolution: u32) -> TecResult<Option<Vec<TecMap>>> {
            self.total.fetch_add(1, Ordering::SeqCst);
            *self.reads.lock().unwrap().entry(day).or_insert(0) += 1;
            if !self.present.contains(&day) {
                return Ok(None);
            }
            let first = day.and_hms_opt(0, 0, 0).unwrap();
            let last = day.and_hms_opt(23, 59, 0).unwrap();
            Ok(Some(
                ticks_between(first, last, resolution, 1)
                    .into_iter()
                    .map(|t| TecMap::new(t, Array2::zeros((2, 3))))
                    .collect(),
            ))
        }
    }

    fn counting(days: &[&str]) -> CountingArchive {
        CountingArchive {
            present: days.iter().map(|d| ts(d).date()).collect(),
            reads: Mutex::new(BTreeMap::new()),
            total: AtomicUsize::new(0),
        }
    }

    #[test]
    fn test_load_reads_each_day_once() {
        let archive = counting(&["2015-01-01", "2015-01-02", "2015-01-03"]);
        let index =
            TimeGridIndex::load(&archive, &spec("2015-01-02", "2015-01-02", 1, LoadPolicy::Strict)).unwrap();

        let reads = archive.reads.lock().unwrap();
        assert_eq!(reads.len(), 3);
        assert!(reads.values().all(|&n| n == 1));
        // 2015-01-01 00:00 .. 2015-01-03 00:00 inclusive
        assert_eq!(index.len(), 2 * 288 + 1);
        assert_eq!(index.shape(), Some((2, 3)));
    }

    #[test]
    fn test_strict_load_fails_on_missing_day() {
        let archive = counting(&["2015-01-02"]);
        let err = TimeGridIndex::load(&archive, &spec("2015-01-02", "2015-01-02", 1, LoadPolicy::Strict))
            .unwrap_err();
        assert!(matches!(err, TecError::DataLoad { .. }));
        assert!(err.to_string().contains("20150101"));
    }

    #[test]
    fn test_lenient_load_records_missing_day() {
        let archive = counting(&["2015-01-02"]);
        let index =
            TimeGridIndex::load(&archive, &spec("2015-01-02", "2015-01-02", 1, LoadPolicy::Lenient)).unwrap();
        assert_eq!(index.missing_days().len(), 2);
        assert!(index.get(&ts("2015-01-01 12:00:00")).is_err());
        assert!(index.get(&ts("2015-01-02 12:00:00")).is_ok());
    }

    #[test]
    fn test_get_outside_bounds_is_missing() {
        let archive = counting(&["2015-01-02", "2015-01-03"]);
        let index =
            TimeGridIndex::load(&archive, &spec("2015-01-02", "2015-01-02 12:00:00", 0, LoadPolicy::Strict))
                .unwrap();
        assert!(index.contains(&ts("2015-01-02 12:00:00")));
        let err = index.get(&ts("2015-01-02 12:05:00")).unwrap_err();
        assert!(matches!(err, TecError::MissingMap(_)));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let s = spec("2015-01-02", "2015-01-02", 0, LoadPolicy::Strict);
        let maps = vec![
            TecMap::new(ts("2015-01-02 00:00:00"), Array2::zeros((2, 3))),
            TecMap::new(ts("2015-01-02 00:00:00"), Array2::zeros((3, 3))),
        ];
        let err = TimeGridIndex::from_maps(maps, &s).unwrap_err();
        assert!(matches!(err, TecError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_npy_archive_round_trip_and_gaps() {
        let dir = tempdir().unwrap();
        let archive = NpyArchive::new(dir.path());
        let values = Array2::from_shape_fn((2, 2), |(i, j)| (i * 2 + j) as f32);
        archive.write_map(&ts("2015-01-02 00:00:00"), &values).unwrap();
        archive.write_map(&ts("2015-01-02 00:10:00"), &values).unwrap();

        let index =
            TimeGridIndex::load(&archive, &spec("2015-01-02", "2015-01-02 00:10:00", 0, LoadPolicy::Strict))
                .unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(&ts("2015-01-02 00:10:00")).unwrap().values, values);
        assert!(index.get(&ts("2015-01-02 00:05:00")).is_err());
        assert_eq!(
            index.missing_ticks().iter().collect::<Vec<_>>(),
            vec![&ts("2015-01-02 00:05:00")]
        );
    }

    #[test]
    fn test_strict_load_records_missing_tick() {
        let dir = tempdir().unwrap();
        let archive = NpyArchive::new(dir.path());
        let gap = ts("2015-01-02 12:00:00");
        for t in ticks_between(ts("2015-01-02"), ts("2015-01-02 23:55:00"), 5, 1) {
            if t != gap {
                archive.write_map(&t, &Array2::zeros((2, 2))).unwrap();
            }
        }

        let index =
            TimeGridIndex::load(&archive, &spec("2015-01-02", "2015-01-02 23:55:00", 0, LoadPolicy::Strict))
                .unwrap();
        assert_eq!(index.len(), 287);
        assert!(index.missing_days().is_empty());
        assert_eq!(index.missing_ticks().len(), 1);
        assert!(index.missing_ticks().contains(&gap));
    }

    #[test]
    fn test_full_days_have_no_missing_ticks() {
        let archive = counting(&["2015-01-01", "2015-01-02", "2015-01-03"]);
        let index =
            TimeGridIndex::load(&archive, &spec("2015-01-02", "2015-01-02", 1, LoadPolicy::Strict)).unwrap();
        assert!(index.missing_ticks().is_empty());
    }

    #[test]
    fn test_reads_f64_maps() {
        let dir = tempdir().unwrap();
        let archive = NpyArchive::new(dir.path());
        let t = ts("2015-01-02 00:05:00");
        fs::create_dir_all(archive.day_dir(&t.date())).unwrap();
        let values = Array2::<f64>::from_elem((3, 2), 7.25);
        values
            .write_npy(File::create(archive.map_path(&t)).unwrap())
            .unwrap();

        let read = read_map_file(&archive.map_path(&t)).unwrap();
        assert_eq!(read.dim(), (3, 2));
        assert_eq!(read[[2, 1]], 7.25);
    }

    #[test]
    fn test_corrupt_file_is_load_error() {
        let dir = tempdir().unwrap();
        let archive = NpyArchive::new(dir.path());
        let t = ts("2015-01-02 00:00:00");
        fs::create_dir_all(archive.day_dir(&t.date())).unwrap();
        fs::write(archive.map_path(&t), b"not an npy file").unwrap();

        let err = TimeGridIndex::load(&archive, &spec("2015-01-02", "2015-01-02", 0, LoadPolicy::Strict))
            .unwrap_err();
        assert!(matches!(err, TecError::DataLoad { .. }));
    }

    #[test]
    fn test_truncated_f32_map_reports_its_own_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.npy");
        Array2::<f32>::from_elem((4, 4), 1.5)
            .write_npy(File::create(&path).unwrap())
            .unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 8]).unwrap();

        let err = read_map_file(&path).unwrap_err();
        assert!(matches!(err, TecError::DataLoad { .. }));
        assert!(!err.to_string().contains("descriptor"));
    }
}
