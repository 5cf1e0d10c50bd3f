//! Exogenous space-weather (OMNI / IMF) series
//!
//! The table is loaded once per run from a read-only store, optionally
//! gap-filled and z-score normalized, then sliced per anchor with the same
//! offset pattern as the trend channel.

use chrono::{Duration, NaiveDateTime};
use ndarray::Array3;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::timestamp::{format_key, is_aligned, shift};
use super::window::{history_offsets, AnchorCoverage};
use crate::error::{TecError, TecResult};

/// File name of persisted normalization parameters inside a run directory
pub const NORMALIZATION_FILE: &str = "exogenous_norm.json";

/// Datetime format of the exogenous stores
pub const STORE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Feature vector at one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExogenousRecord {
    pub timestamp: NaiveDateTime,
    pub values: Vec<f64>,
}

/// How missing ticks are treated when the table is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GapPolicy {
    /// Leave gaps; anchors touching them are excluded
    #[default]
    Fail,
    /// Linearly interpolate gaps of at most `max_gap_ticks` missing ticks
    Interpolate { max_gap_ticks: u32 },
}

/// Time-indexed table of exogenous features
#[derive(Debug, Clone, Default)]
pub struct ExogenousTable {
    fields: Vec<String>,
    records: BTreeMap<NaiveDateTime, Vec<f64>>,
}

impl ExogenousTable {
    pub fn new<I>(fields: Vec<String>, records: I) -> TecResult<Self>
    where
        I: IntoIterator<Item = ExogenousRecord>,
    {
        let mut table = Self {
            fields,
            records: BTreeMap::new(),
        };
        for record in records {
            if record.values.len() != table.fields.len() {
                return Err(TecError::load(
                    PathBuf::from(format_key(&record.timestamp)),
                    format!(
                        "record has {} values for {} fields",
                        record.values.len(),
                        table.fields.len()
                    ),
                ));
            }
            table.records.insert(record.timestamp, record.values);
        }
        Ok(table)
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn feature_dim(&self) -> usize {
        self.fields.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, ts: &NaiveDateTime) -> TecResult<&[f64]> {
        self.records
            .get(ts)
            .map(Vec::as_slice)
            .ok_or(TecError::MissingExogenous(*ts))
    }

    /// Records in `[start, end]`
    pub fn range(&self, start: NaiveDateTime, end: NaiveDateTime) -> impl Iterator<Item = (&NaiveDateTime, &Vec<f64>)> {
        self.records.range(start..=end)
    }

    /// Drop records that fall between grid ticks; returns how many were dropped
    pub fn retain_aligned(&mut self, resolution_minutes: u32) -> usize {
        let before = self.records.len();
        self.records.retain(|ts, _| is_aligned(ts, resolution_minutes));
        before - self.records.len()
    }

    /// Apply a gap policy; returns the number of ticks filled
    ///
    /// Only records on the `resolution_minutes` grid bound a gap.
    pub fn fill_gaps(&mut self, policy: GapPolicy, resolution_minutes: u32) -> TecResult<usize> {
        if resolution_minutes == 0 {
            return Err(TecError::Config("resolution must be positive".to_string()));
        }
        let max_gap = match policy {
            GapPolicy::Fail => return Ok(0),
            GapPolicy::Interpolate { max_gap_ticks } => max_gap_ticks as i64,
        };
        let step = resolution_minutes as i64;

        let mut filled = Vec::new();
        let keys: Vec<NaiveDateTime> = self
            .records
            .keys()
            .filter(|ts| is_aligned(ts, resolution_minutes))
            .copied()
            .collect();
        for pair in keys.windows(2) {
            let (t0, t1) = (pair[0], pair[1]);
            let span = (t1 - t0).num_minutes() / step;
            let missing = span - 1;
            if missing < 1 || missing > max_gap {
                continue;
            }
            let (v0, v1) = (&self.records[&t0], &self.records[&t1]);
            for k in 1..span {
                let frac = k as f64 / span as f64;
                let values = v0.iter().zip(v1).map(|(a, b)| a + (b - a) * frac).collect();
                filled.push((shift(t0, k, resolution_minutes), values));
            }
        }

        let count = filled.len();
        self.records.extend(filled);
        if count > 0 {
            info!("Interpolated {} exogenous ticks (max gap {} ticks)", count, max_gap);
        }
        Ok(count)
    }

    /// Normalized copy of the table
    pub fn normalized(&self, params: &NormalizationParams) -> Self {
        Self {
            fields: self.fields.clone(),
            records: self
                .records
                .iter()
                .map(|(ts, v)| (*ts, params.normalize(v)))
                .collect(),
        }
    }
}

/// Read-only, range-queryable store of exogenous records
pub trait ExogenousSource {
    fn fetch(&self, start: NaiveDateTime, end: NaiveDateTime) -> TecResult<ExogenousTable>;

    fn describe(&self) -> String;
}

/// CSV file with a `datetime` column followed by feature columns
#[derive(Debug, Clone)]
pub struct CsvExogenousSource {
    path: PathBuf,
    fields: Vec<String>,
}

impl CsvExogenousSource {
    pub fn new<P: AsRef<Path>>(path: P, fields: Vec<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            fields,
        }
    }
}

impl ExogenousSource for CsvExogenousSource {
    fn fetch(&self, start: NaiveDateTime, end: NaiveDateTime) -> TecResult<ExogenousTable> {
        let mut reader = csv::Reader::from_path(&self.path)
            .map_err(|e| TecError::load(&self.path, e.to_string()))?;
        let headers = reader.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| TecError::load(&self.path, format!("missing column `{}`", name)))
        };
        let dt_col = column("datetime")?;
        let field_cols = self
            .fields
            .iter()
            .map(|f| column(f))
            .collect::<TecResult<Vec<usize>>>()?;

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for row in reader.records() {
            let row = row?;
            let raw_ts = row.get(dt_col).unwrap_or_default();
            let ts = NaiveDateTime::parse_from_str(raw_ts.trim(), STORE_DATETIME_FORMAT)
                .map_err(|e| TecError::load(&self.path, format!("bad datetime `{}`: {}", raw_ts, e)))?;
            if ts < start || ts > end {
                continue;
            }
            let values: Option<Vec<f64>> = field_cols
                .iter()
                .map(|&c| row.get(c).and_then(|v| v.trim().parse::<f64>().ok()))
                .collect();
            match values {
                Some(values) => records.push(ExogenousRecord { timestamp: ts, values }),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("Skipped {} exogenous rows with empty or non-numeric fields", skipped);
        }
        ExogenousTable::new(self.fields.clone(), records)
    }

    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }
}

/// OMNI store kept in SQLite, one row per tick
#[derive(Debug, Clone)]
pub struct SqliteExogenousSource {
    db_path: PathBuf,
    table: String,
    datetime_column: String,
    fields: Vec<String>,
}

impl SqliteExogenousSource {
    pub fn new<P: AsRef<Path>>(
        db_path: P,
        table: &str,
        datetime_column: &str,
        fields: Vec<String>,
    ) -> TecResult<Self> {
        for ident in std::iter::once(table)
            .chain(std::iter::once(datetime_column))
            .chain(fields.iter().map(String::as_str))
        {
            if ident.is_empty() || !ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(TecError::Config(format!("invalid sqlite identifier `{}`", ident)));
            }
        }
        Ok(Self {
            db_path: db_path.as_ref().to_path_buf(),
            table: table.to_string(),
            datetime_column: datetime_column.to_string(),
            fields,
        })
    }

    fn query(&self) -> String {
        let columns = self
            .fields
            .iter()
            .map(|f| format!("\"{}\"", f))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT \"{dt}\", {columns} FROM \"{table}\" WHERE \"{dt}\" BETWEEN ?1 AND ?2 ORDER BY \"{dt}\"",
            dt = self.datetime_column,
            columns = columns,
            table = self.table
        )
    }
}

impl ExogenousSource for SqliteExogenousSource {
    fn fetch(&self, start: NaiveDateTime, end: NaiveDateTime) -> TecResult<ExogenousTable> {
        if !self.db_path.is_file() {
            return Err(TecError::load(&self.db_path, "sqlite database not found"));
        }
        let conn = Connection::open_with_flags(&self.db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let mut stmt = conn.prepare(&self.query())?;
        let n = self.fields.len();
        let start_s = start.format(STORE_DATETIME_FORMAT).to_string();
        let end_s = end.format(STORE_DATETIME_FORMAT).to_string();

        let rows = stmt.query_map([start_s, end_s], |row| {
            let raw: String = row.get(0)?;
            let values = (0..n)
                .map(|i| row.get::<_, Option<f64>>(i + 1))
                .collect::<Result<Vec<Option<f64>>, _>>()?;
            Ok((raw, values))
        })?;

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for row in rows {
            let (raw, values) = row?;
            let ts = NaiveDateTime::parse_from_str(&raw, STORE_DATETIME_FORMAT)
                .map_err(|e| TecError::load(&self.db_path, format!("bad datetime `{}`: {}", raw, e)))?;
            match values.into_iter().collect::<Option<Vec<f64>>>() {
                Some(values) => records.push(ExogenousRecord { timestamp: ts, values }),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("Skipped {} exogenous rows with NULL fields", skipped);
        }
        ExogenousTable::new(self.fields.clone(), records)
    }

    fn describe(&self) -> String {
        format!("sqlite:{}#{}", self.db_path.display(), self.table)
    }
}

/// Z-score parameters, fitted on the training range only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationParams {
    pub feature_names: Vec<String>,
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl NormalizationParams {
    /// Fit on the records of `table` within `[start, end]`
    pub fn fit(table: &ExogenousTable, start: NaiveDateTime, end: NaiveDateTime) -> TecResult<Self> {
        let dim = table.feature_dim();
        let mut sums = vec![0.0; dim];
        let mut count = 0usize;
        for (_, values) in table.range(start, end) {
            for (s, v) in sums.iter_mut().zip(values) {
                *s += v;
            }
            count += 1;
        }
        if count == 0 {
            return Err(TecError::Normalization(format!(
                "no exogenous records between {} and {}",
                format_key(&start),
                format_key(&end)
            )));
        }
        let means: Vec<f64> = sums.iter().map(|s| s / count as f64).collect();

        let mut sq = vec![0.0; dim];
        for (_, values) in table.range(start, end) {
            for ((acc, v), m) in sq.iter_mut().zip(values).zip(&means) {
                *acc += (v - m).powi(2);
            }
        }
        let stds = sq.iter().map(|s| (s / count as f64).sqrt().max(1e-8)).collect();

        Ok(Self {
            feature_names: table.fields().to_vec(),
            means,
            stds,
        })
    }

    pub fn normalize(&self, values: &[f64]) -> Vec<f64> {
        values
            .iter()
            .zip(self.means.iter().zip(&self.stds))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }

    pub fn denormalize(&self, values: &[f64]) -> Vec<f64> {
        values
            .iter()
            .zip(self.means.iter().zip(&self.stds))
            .map(|(v, (m, s))| v * s + m)
            .collect()
    }

    /// Location of the persisted parameters inside a run directory
    pub fn path_in(run_dir: &Path) -> PathBuf {
        run_dir.join(NORMALIZATION_FILE)
    }

    pub fn save(&self, path: &Path) -> TecResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        serde_json::to_writer_pretty(File::create(path)?, self)?;
        info!("Saved exogenous normalization parameters to {:?}", path);
        Ok(())
    }

    pub fn load(path: &Path) -> TecResult<Self> {
        if !path.is_file() {
            return Err(TecError::Normalization(format!(
                "no persisted normalization parameters at {:?}",
                path
            )));
        }
        let params: Self = serde_json::from_reader(File::open(path)?)?;
        if params.means.len() != params.feature_names.len() || params.stds.len() != params.feature_names.len() {
            return Err(TecError::Normalization(format!("inconsistent parameter lengths in {:?}", path)));
        }
        Ok(params)
    }
}

/// Whether and how the exogenous table is normalized
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizationMode {
    Disabled,
    /// Fit on `[start, end]` and persist into the run directory
    Fit {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    /// Keep the table raw until the training split is known, then call
    /// [`ExogenousBatchBuilder::fit_normalization`]
    FitTraining,
    /// Reuse parameters persisted by a training run
    Load,
}

/// Options for building an [`ExogenousBatchBuilder`]
#[derive(Debug, Clone)]
pub struct ExogenousOptions {
    pub gap_policy: GapPolicy,
    pub normalization: NormalizationMode,
    pub run_dir: PathBuf,
    pub trend_freq: u32,
    pub trend_length: u32,
    pub resolution_minutes: u32,
}

/// Produces per-anchor exogenous sequences aligned to the trend window
#[derive(Debug, Clone)]
pub struct ExogenousBatchBuilder {
    table: ExogenousTable,
    params: Option<NormalizationParams>,
    trend_freq: u32,
    trend_length: u32,
    resolution_minutes: u32,
}

impl ExogenousBatchBuilder {
    /// Fetch `[start, end]` from `source` and prepare it per `options`
    pub fn load<S: ExogenousSource + ?Sized>(
        source: &S,
        start: NaiveDateTime,
        end: NaiveDateTime,
        options: &ExogenousOptions,
    ) -> TecResult<Self> {
        info!(
            "Loading exogenous data from {} ({} .. {})",
            source.describe(),
            format_key(&start),
            format_key(&end)
        );
        let raw = source.fetch(start, end)?;
        info!("Loaded {} exogenous records with {} fields", raw.len(), raw.feature_dim());
        Self::from_table(raw, options)
    }

    pub fn from_table(mut table: ExogenousTable, options: &ExogenousOptions) -> TecResult<Self> {
        if options.trend_freq < 1 || options.trend_length < 1 {
            return Err(TecError::Config(
                "exogenous alignment needs trend freq >= 1 and length >= 1".to_string(),
            ));
        }
        if options.resolution_minutes == 0 {
            return Err(TecError::Config("resolution must be positive".to_string()));
        }
        let dropped = table.retain_aligned(options.resolution_minutes);
        if dropped > 0 {
            warn!(
                "Dropped {} exogenous records off the {}-minute grid",
                dropped, options.resolution_minutes
            );
        }
        table.fill_gaps(options.gap_policy, options.resolution_minutes)?;

        let mut builder = Self {
            table,
            params: None,
            trend_freq: options.trend_freq,
            trend_length: options.trend_length,
            resolution_minutes: options.resolution_minutes,
        };
        match &options.normalization {
            NormalizationMode::Disabled | NormalizationMode::FitTraining => {}
            NormalizationMode::Fit { start, end } => builder.fit_normalization(*start, *end, &options.run_dir)?,
            NormalizationMode::Load => {
                let path = NormalizationParams::path_in(&options.run_dir);
                let params = NormalizationParams::load(&path)?;
                if params.feature_names != builder.table.fields() {
                    return Err(TecError::Normalization(format!(
                        "persisted fields {:?} differ from loaded fields {:?}",
                        params.feature_names,
                        builder.table.fields()
                    )));
                }
                info!("Reusing exogenous normalization parameters from {:?}", path);
                builder.table = builder.table.normalized(&params);
                builder.params = Some(params);
            }
        }
        Ok(builder)
    }

    /// Fit z-score parameters on `[start, end]` of the raw table, persist them
    /// into `run_dir` and normalize the table in place
    pub fn fit_normalization(&mut self, start: NaiveDateTime, end: NaiveDateTime, run_dir: &Path) -> TecResult<()> {
        if self.params.is_some() {
            return Err(TecError::Normalization("exogenous table is already normalized".to_string()));
        }
        let params = NormalizationParams::fit(&self.table, start, end)?;
        params.save(&NormalizationParams::path_in(run_dir))?;
        info!(
            "Fitted exogenous normalization on {} .. {}",
            format_key(&start),
            format_key(&end)
        );
        self.table = self.table.normalized(&params);
        self.params = Some(params);
        Ok(())
    }

    /// Time span covering the trend-aligned sequences of anchors in `[first, last]`
    pub fn history_span(&self, first: NaiveDateTime, last: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
        let reach = (self.trend_freq * self.trend_length) as i64;
        (
            shift(first, -reach, self.resolution_minutes),
            shift(last, -(self.trend_freq as i64), self.resolution_minutes),
        )
    }

    pub fn table(&self) -> &ExogenousTable {
        &self.table
    }

    pub fn params(&self) -> Option<&NormalizationParams> {
        self.params.as_ref()
    }

    pub fn feature_dim(&self) -> usize {
        self.table.feature_dim()
    }

    /// Map normalized values back to physical units
    pub fn denormalize(&self, values: &[f64]) -> Vec<f64> {
        match &self.params {
            Some(p) => p.denormalize(values),
            None => values.to_vec(),
        }
    }

    fn timestamps(&self, anchor: &NaiveDateTime, freq: u32, length: u32) -> Vec<NaiveDateTime> {
        history_offsets(freq, length)
            .into_iter()
            .map(|o| shift(*anchor, o, self.resolution_minutes))
            .collect()
    }

    /// `[batch, trend_length, features]` for `anchors`
    pub fn get_batch(&self, anchors: &[NaiveDateTime], trend_freq: u32, trend_length: u32) -> TecResult<Array3<f32>> {
        let dim = self.feature_dim();
        let mut batch = Array3::zeros((anchors.len(), trend_length as usize, dim));
        for (b, anchor) in anchors.iter().enumerate() {
            for (t, ts) in self.timestamps(anchor, trend_freq, trend_length).iter().enumerate() {
                let values = self.table.get(ts)?;
                for (f, v) in values.iter().enumerate() {
                    batch[[b, t, f]] = *v as f32;
                }
            }
        }
        debug!("Built exogenous batch {:?}", batch.dim());
        Ok(batch)
    }

    /// `get_batch` with the configured trend window
    pub fn batch_for(&self, anchors: &[NaiveDateTime]) -> TecResult<Array3<f32>> {
        self.get_batch(anchors, self.trend_freq, self.trend_length)
    }
}

impl AnchorCoverage for ExogenousBatchBuilder {
    fn check(&self, anchor: &NaiveDateTime) -> TecResult<()> {
        if !is_aligned(anchor, self.resolution_minutes) {
            return Err(TecError::InvalidAnchor {
                anchor: *anchor,
                reason: "not aligned to the exogenous grid".to_string(),
            });
        }
        for ts in self.timestamps(anchor, self.trend_freq, self.trend_length) {
            self.table.get(&ts)?;
        }
        Ok(())
    }

    fn label(&self) -> &'static str {
        "exogenous"
    }
}

/// Loading range for exogenous data: the requested range widened by the load window
pub fn exogenous_range(start: NaiveDateTime, end: NaiveDateTime, load_window_days: u32) -> (NaiveDateTime, NaiveDateTime) {
    let margin = Duration::days(load_window_days as i64);
    (start - margin, end + margin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::timestamp::{parse_datetime, ticks_between};
    use approx::assert_abs_diff_eq;
    use std::io::Write;
    use tempfile::tempdir;

    fn ts(s: &str) -> NaiveDateTime {
        parse_datetime(s).unwrap()
    }

    fn fields() -> Vec<String> {
        vec!["Bz".to_string(), "Vx".to_string()]
    }

    fn table(start: &str, end: &str) -> ExogenousTable {
        let records = ticks_between(ts(start), ts(end), 5, 1)
            .into_iter()
            .enumerate()
            .map(|(i, t)| ExogenousRecord {
                timestamp: t,
                values: vec![i as f64, -400.0 + (i % 7) as f64],
            });
        ExogenousTable::new(fields(), records).unwrap()
    }

    fn options(run_dir: &Path, normalization: NormalizationMode) -> ExogenousOptions {
        ExogenousOptions {
            gap_policy: GapPolicy::Fail,
            normalization,
            run_dir: run_dir.to_path_buf(),
            trend_freq: 36,
            trend_length: 2,
            resolution_minutes: 5,
        }
    }

    #[test]
    fn test_batch_follows_trend_offsets() {
        let dir = tempdir().unwrap();
        let builder = ExogenousBatchBuilder::from_table(
            table("2015-01-02", "2015-01-02 23:55:00"),
            &options(dir.path(), NormalizationMode::Disabled),
        )
        .unwrap();

        let anchors = [ts("2015-01-02 12:00:00"), ts("2015-01-02 12:05:00")];
        let batch = builder.get_batch(&anchors, 36, 2).unwrap();
        assert_eq!(batch.dim(), (2, 2, 2));
        // tick index of 06:00 is 72, of 09:00 is 108
        assert_eq!(batch[[0, 0, 0]], 72.0);
        assert_eq!(batch[[0, 1, 0]], 108.0);
        assert_eq!(batch[[1, 1, 0]], 109.0);
    }

    #[test]
    fn test_missing_tick_is_reported() {
        let dir = tempdir().unwrap();
        let mut t = table("2015-01-02", "2015-01-02 23:55:00");
        t.records.remove(&ts("2015-01-02 09:00:00"));
        let builder =
            ExogenousBatchBuilder::from_table(t, &options(dir.path(), NormalizationMode::Disabled)).unwrap();

        let err = builder.get_batch(&[ts("2015-01-02 12:00:00")], 36, 2).unwrap_err();
        assert!(matches!(err, TecError::MissingExogenous(_)));
        assert!(!builder.covers(&ts("2015-01-02 12:00:00")));
        assert!(builder.covers(&ts("2015-01-02 12:05:00")));
    }

    #[test]
    fn test_interpolation_fills_short_gaps_only() {
        let mut t = table("2015-01-02", "2015-01-02 02:00:00");
        t.records.remove(&ts("2015-01-02 00:10:00"));
        t.records.remove(&ts("2015-01-02 00:15:00"));
        for m in [40, 45, 50, 55] {
            t.records.remove(&ts(&format!("2015-01-02 00:{}:00", m)));
        }

        let filled = t.fill_gaps(GapPolicy::Interpolate { max_gap_ticks: 3 }, 5).unwrap();
        assert_eq!(filled, 2);
        let v = t.get(&ts("2015-01-02 00:10:00")).unwrap();
        assert_abs_diff_eq!(v[0], 2.0, epsilon = 1e-12);
        assert!(t.get(&ts("2015-01-02 00:45:00")).is_err());

        assert_eq!(t.fill_gaps(GapPolicy::Fail, 5).unwrap(), 0);
        assert!(t.fill_gaps(GapPolicy::Fail, 0).is_err());
    }

    #[test]
    fn test_off_grid_records_do_not_bound_gaps() {
        let mut t = table("2015-01-02", "2015-01-02 00:30:00");
        t.records.remove(&ts("2015-01-02 00:05:00"));
        t.records.remove(&ts("2015-01-02 00:10:00"));
        t.records.insert(ts("2015-01-02 00:07:00"), vec![50.0, 0.0]);

        let filled = t.fill_gaps(GapPolicy::Interpolate { max_gap_ticks: 2 }, 5).unwrap();
        assert_eq!(filled, 2);
        // 00:00 is tick 0 and 00:15 is tick 3
        assert_abs_diff_eq!(t.get(&ts("2015-01-02 00:05:00")).unwrap()[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.get(&ts("2015-01-02 00:10:00")).unwrap()[0], 2.0, epsilon = 1e-12);

        assert_eq!(t.retain_aligned(5), 1);
        assert!(t.get(&ts("2015-01-02 00:07:00")).is_err());
    }

    #[test]
    fn test_zero_resolution_rejected() {
        let dir = tempdir().unwrap();
        let mut opts = options(dir.path(), NormalizationMode::Disabled);
        opts.resolution_minutes = 0;
        let err = ExogenousBatchBuilder::from_table(table("2015-01-02", "2015-01-02 01:00:00"), &opts).unwrap_err();
        assert!(matches!(err, TecError::Config(_)));
    }

    #[test]
    fn test_normalization_round_trip() {
        let t = table("2015-01-02", "2015-01-02 23:55:00");
        let params = NormalizationParams::fit(&t, ts("2015-01-02"), ts("2015-01-02 23:55:00")).unwrap();
        for (_, values) in t.range(ts("2015-01-02"), ts("2015-01-02 23:55:00")) {
            let back = params.denormalize(&params.normalize(values));
            for (a, b) in back.iter().zip(values) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_fit_uses_training_range_and_load_reuses_it() {
        let dir = tempdir().unwrap();
        let train_end = ts("2015-01-02 05:55:00");
        let fitted = ExogenousBatchBuilder::from_table(
            table("2015-01-02", "2015-01-02 23:55:00"),
            &options(dir.path(), NormalizationMode::Fit { start: ts("2015-01-02"), end: train_end }),
        )
        .unwrap();
        let params = fitted.params().unwrap().clone();
        // mean of tick indices 0..=71
        assert_abs_diff_eq!(params.means[0], 35.5, epsilon = 1e-9);
        assert!(NormalizationParams::path_in(dir.path()).is_file());

        // inference over a later range with very different values
        let later = ExogenousTable::new(
            fields(),
            ticks_between(ts("2015-01-05"), ts("2015-01-05 23:55:00"), 5, 1)
                .into_iter()
                .map(|t| ExogenousRecord { timestamp: t, values: vec![1000.0, 0.0] }),
        )
        .unwrap();
        let loaded = ExogenousBatchBuilder::from_table(later, &options(dir.path(), NormalizationMode::Load)).unwrap();
        assert_eq!(loaded.params().unwrap(), &params);
        let v = loaded.table().get(&ts("2015-01-05 12:00:00")).unwrap();
        assert_abs_diff_eq!(v[0], (1000.0 - params.means[0]) / params.stds[0], epsilon = 1e-9);
        assert_abs_diff_eq!(loaded.denormalize(v)[0], 1000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_deferred_fit_on_training_span() {
        let dir = tempdir().unwrap();
        let mut builder = ExogenousBatchBuilder::from_table(
            table("2015-01-02", "2015-01-02 23:55:00"),
            &options(dir.path(), NormalizationMode::FitTraining),
        )
        .unwrap();
        assert!(builder.params().is_none());
        assert!(!NormalizationParams::path_in(dir.path()).exists());

        // anchors 12:00 .. 13:00 read ticks from 06:00 through 12:00
        let (start, end) = builder.history_span(ts("2015-01-02 12:00:00"), ts("2015-01-02 13:00:00"));
        assert_eq!(start, ts("2015-01-02 06:00:00"));
        assert_eq!(end, ts("2015-01-02 10:00:00"));

        builder.fit_normalization(start, end, dir.path()).unwrap();
        // mean of tick indices 72..=120
        assert_abs_diff_eq!(builder.params().unwrap().means[0], 96.0, epsilon = 1e-9);
        assert!(NormalizationParams::path_in(dir.path()).is_file());
        assert!(builder.fit_normalization(start, end, dir.path()).is_err());
    }

    #[test]
    fn test_load_without_persisted_params_fails() {
        let dir = tempdir().unwrap();
        let err = ExogenousBatchBuilder::from_table(
            table("2015-01-02", "2015-01-02 01:00:00"),
            &options(dir.path(), NormalizationMode::Load),
        )
        .unwrap_err();
        assert!(matches!(err, TecError::Normalization(_)));
    }

    #[test]
    fn test_csv_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("omni.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "datetime,Bx,Bz,Vx").unwrap();
        writeln!(f, "2015-01-01 23:55:00,1,2,3").unwrap();
        writeln!(f, "2015-01-02 00:00:00,1,-2.5,-410").unwrap();
        writeln!(f, "2015-01-02 00:05:00,1,,-400").unwrap();
        writeln!(f, "2015-01-02 00:10:00,1,3.0,-390").unwrap();
        drop(f);

        let source = CsvExogenousSource::new(&path, fields());
        let t = source.fetch(ts("2015-01-02"), ts("2015-01-02 01:00:00")).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(&ts("2015-01-02 00:00:00")).unwrap(), &[-2.5, -410.0]);
        assert!(t.get(&ts("2015-01-02 00:05:00")).is_err());

        let missing = CsvExogenousSource::new(&path, vec!["Np".to_string()]);
        assert!(missing.fetch(ts("2015-01-02"), ts("2015-01-03")).is_err());
    }

    #[test]
    fn test_sqlite_source() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("omni.sqlite");
        {
            let conn = Connection::open(&db).unwrap();
            conn.execute_batch(
                "CREATE TABLE IMF (datetime TEXT, Bz REAL, Vx REAL);
                 INSERT INTO IMF VALUES ('2015-01-02 00:00:00', -1.0, -420.0);
                 INSERT INTO IMF VALUES ('2015-01-02 00:05:00', NULL, -421.0);
                 INSERT INTO IMF VALUES ('2015-01-02 00:10:00', 0.5, -419.0);
                 INSERT INTO IMF VALUES ('2015-01-03 00:10:00', 0.5, -419.0);",
            )
            .unwrap();
        }
        let source = SqliteExogenousSource::new(&db, "IMF", "datetime", fields()).unwrap();
        let t = source.fetch(ts("2015-01-02"), ts("2015-01-02 23:55:00")).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(&ts("2015-01-02 00:10:00")).unwrap(), &[0.5, -419.0]);

        assert!(SqliteExogenousSource::new(&db, "IMF; DROP", "datetime", fields()).is_err());
    }
}
