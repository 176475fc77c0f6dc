//! ---
//! lmp_section: "07-resilience-fault-tolerance"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Chaos engine: scenarios, injection, recovery tracking, incidents."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
//! Append-only store of finalized injection records, optionally mirrored to
//! a JSON-lines file so history survives restarts.
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lmp_common::config::ScenarioCategory;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ChaosError, Result};
use crate::record::{InjectionId, InjectionOutcome, InjectionRecord};

const INCIDENT_LOG_VERSION: u16 = 1;

/// Query page size when the caller does not set one.
pub const DEFAULT_QUERY_LIMIT: usize = 100;
/// Largest page a query may request.
pub const MAX_QUERY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IncidentLogHeader {
    version: u16,
    created_at: DateTime<Utc>,
}

/// Filter applied by [`IncidentLog::query`]. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentFilter {
    /// Only records of this category.
    #[serde(default)]
    pub category: Option<ScenarioCategory>,
    /// Only records with this outcome.
    #[serde(default)]
    pub outcome: Option<InjectionOutcome>,
    /// Only records of this scenario.
    #[serde(default, rename = "scenario")]
    pub scenario_id: Option<String>,
    /// Inclusive lower bound on start time.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on start time.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    /// Maximum records returned; `None` means unbounded.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl IncidentFilter {
    /// Filter that matches every record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep records of `category`.
    pub fn category(mut self, category: ScenarioCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Keep records with `outcome`.
    pub fn outcome(mut self, outcome: InjectionOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Keep records of one scenario.
    pub fn scenario(mut self, scenario_id: impl Into<String>) -> Self {
        self.scenario_id = Some(scenario_id.into());
        self
    }

    /// Keep records that started within the bounds. Either side may be open.
    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    /// Return at most `limit` records.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Clamp the limit for operator-facing reads.
    pub fn paged(mut self) -> Self {
        self.limit = Some(
            self.limit
                .unwrap_or(DEFAULT_QUERY_LIMIT)
                .clamp(1, MAX_QUERY_LIMIT),
        );
        self
    }

    /// True when `record` passes every set criterion.
    pub fn matches(&self, record: &InjectionRecord) -> bool {
        if matches!(self.category, Some(category) if category != record.category) {
            return false;
        }
        if self.outcome.is_some() && self.outcome != record.outcome {
            return false;
        }
        if matches!(&self.scenario_id, Some(id) if *id != record.scenario_id) {
            return false;
        }
        if matches!(self.since, Some(since) if record.started_at < since) {
            return false;
        }
        if matches!(self.until, Some(until) if record.started_at >= until) {
            return false;
        }
        true
    }
}

#[derive(Default)]
struct Inner {
    /// Sorted by `started_at` ascending; ties keep append order.
    records: Vec<Arc<InjectionRecord>>,
    by_id: HashMap<InjectionId, Arc<InjectionRecord>>,
    sink: Option<IncidentSink>,
}

impl Inner {
    fn insert(&mut self, record: Arc<InjectionRecord>) {
        let position = self
            .records
            .partition_point(|existing| existing.started_at <= record.started_at);
        self.records.insert(position, Arc::clone(&record));
        self.by_id.insert(record.id, record);
    }
}

struct IncidentSink {
    path: PathBuf,
    file: File,
}

impl IncidentSink {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut sink = Self {
            path: path.to_path_buf(),
            file,
        };
        if fresh {
            let header = IncidentLogHeader {
                version: INCIDENT_LOG_VERSION,
                created_at: Utc::now(),
            };
            sink.write_line(&header)?;
        }
        Ok(sink)
    }

    /// Write one complete JSON line. Serialization finishes before any byte
    /// reaches the file.
    fn write_line<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Records recovered from an incident file.
#[derive(Debug)]
struct LoadedIncidents {
    records: Vec<InjectionRecord>,
    /// Byte length covering the header and every complete record.
    valid_len: u64,
    /// The last kept line lacks its newline.
    unterminated: bool,
    /// A trailing line could not be parsed and was dropped.
    torn_tail: bool,
}

fn load_incident_file(path: &Path) -> Result<LoadedIncidents> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut loaded = LoadedIncidents {
        records: Vec::new(),
        valid_len: 0,
        unterminated: false,
        torn_tail: false,
    };
    let mut offset = 0u64;
    let mut line = String::new();
    let mut header_seen = false;
    let mut unparsed: Option<serde_json::Error> = None;

    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        offset += read as u64;
        let terminated = line.ends_with('\n');
        let content = line.trim();
        if content.is_empty() {
            continue;
        }
        // Only the final line may be damaged; anything after it means corruption.
        if let Some(err) = unparsed.take() {
            return Err(err.into());
        }
        if !header_seen {
            header_seen = true;
            if terminated {
                loaded.valid_len = offset;
            } else {
                loaded.torn_tail = true;
            }
            continue;
        }
        match serde_json::from_str::<InjectionRecord>(content) {
            Ok(record) => {
                loaded.records.push(record);
                loaded.valid_len = offset;
                loaded.unterminated = !terminated;
            }
            Err(err) => unparsed = Some(err),
        }
    }

    if let Some(err) = unparsed {
        warn!(
            target: "lmp::chaos::incidents",
            path = %path.display(),
            error = %err,
            kept = loaded.records.len(),
            "dropping torn trailing incident line"
        );
        loaded.torn_tail = true;
    }
    Ok(loaded)
}

/// Read every record from a JSON-lines incident file, skipping the header.
///
/// A torn final line, as left by a crash mid-append, is skipped with a
/// warning; a damaged line followed by further records is an error.
pub fn read_incident_file(path: &Path) -> Result<Vec<InjectionRecord>> {
    Ok(load_incident_file(path)?.records)
}

/// Cut a torn tail off the file and terminate the last kept line.
fn repair_incident_file(path: &Path, loaded: &LoadedIncidents) -> Result<()> {
    if loaded.torn_tail {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(loaded.valid_len)?;
        info!(
            target: "lmp::chaos::incidents",
            path = %path.display(),
            length = loaded.valid_len,
            "truncated incident log to last complete record"
        );
    }
    if loaded.unterminated {
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Durable, append-only store of finalized injection records.
pub struct IncidentLog {
    inner: RwLock<Inner>,
}

impl IncidentLog {
    /// Volatile log kept only in memory.
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Open a file-backed log, loading any records already on disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut inner = Inner::default();
        if path.exists() && fs::metadata(path)?.len() > 0 {
            let loaded = load_incident_file(path)?;
            repair_incident_file(path, &loaded)?;
            for record in loaded.records {
                if inner.by_id.contains_key(&record.id) {
                    warn!(
                        target: "lmp::chaos::incidents",
                        injection = %record.id,
                        path = %path.display(),
                        "skipping duplicate incident on load"
                    );
                    continue;
                }
                inner.insert(Arc::new(record));
            }
        }
        inner.sink = Some(IncidentSink::open(path)?);
        info!(
            target: "lmp::chaos::incidents",
            path = %path.display(),
            loaded = inner.records.len(),
            "incident log opened"
        );
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Load a file-backed log for reading only. Appends stay in memory.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let log = Self::in_memory();
        {
            let mut inner = log.inner.write();
            for record in read_incident_file(path.as_ref())? {
                if !inner.by_id.contains_key(&record.id) {
                    inner.insert(Arc::new(record));
                }
            }
        }
        Ok(log)
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.inner.read().sink.as_ref().map(|sink| sink.path.clone())
    }

    /// Append a finalized record.
    ///
    /// Fails with [`ChaosError::RecordOpen`] for records without an outcome
    /// and [`ChaosError::AlreadyFinalized`] when the identifier is already stored.
    pub fn append(&self, record: InjectionRecord) -> Result<()> {
        if !record.is_finalized() {
            return Err(ChaosError::RecordOpen(record.id));
        }
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&record.id) {
            return Err(ChaosError::AlreadyFinalized(record.id));
        }
        if let Some(sink) = inner.sink.as_mut() {
            sink.write_line(&record)?;
        }
        debug!(
            target: "lmp::chaos::incidents",
            injection = %record.id,
            scenario = %record.scenario_id,
            outcome = ?record.outcome,
            "incident appended"
        );
        inner.insert(Arc::new(record));
        Ok(())
    }

    /// Finalized record by identifier.
    pub fn get(&self, id: InjectionId) -> Option<InjectionRecord> {
        self.inner
            .read()
            .by_id
            .get(&id)
            .map(|record| InjectionRecord::clone(record))
    }

    /// True if `id` was already finalized.
    pub fn contains(&self, id: InjectionId) -> bool {
        self.inner.read().by_id.contains_key(&id)
    }

    /// Number of finalized records.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// True before the first record is appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazy, start-ordered view over the records matching `filter`.
    ///
    /// The query works on a snapshot taken now; records appended later are not
    /// visible to it. Clone the query to iterate it again.
    pub fn query(&self, filter: IncidentFilter) -> IncidentQuery {
        let snapshot = self.inner.read().records.clone();
        IncidentQuery {
            remaining: filter.limit,
            records: snapshot.into_iter(),
            filter,
        }
    }
}

impl std::fmt::Debug for IncidentLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncidentLog")
            .field("path", &self.path())
            .field("len", &self.len())
            .finish()
    }
}

/// Iterator returned by [`IncidentLog::query`].
#[derive(Debug, Clone)]
pub struct IncidentQuery {
    records: std::vec::IntoIter<Arc<InjectionRecord>>,
    filter: IncidentFilter,
    remaining: Option<usize>,
}

impl Iterator for IncidentQuery {
    type Item = InjectionRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        let filter = &self.filter;
        let record = self.records.find(|record| filter.matches(record))?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(InjectionRecord::clone(&record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use lmp_common::config::{EffectConfig, RollbackAction};
    use std::time::Duration;

    use crate::record::TriggerSource;
    use crate::scenario::Scenario;

    fn finalized(
        id: &str,
        category: ScenarioCategory,
        outcome: InjectionOutcome,
        started_offset_secs: i64,
    ) -> InjectionRecord {
        let scenario = Scenario {
            id: id.into(),
            category,
            target: "es1".into(),
            effect: EffectConfig::default(),
            rollback: RollbackAction::Revert,
            interval: None,
        };
        let mut record = InjectionRecord::open(&scenario, TriggerSource::OnDemand);
        record.started_at = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
            + ChronoDuration::seconds(started_offset_secs);
        let ended = record.started_at + ChronoDuration::seconds(10);
        record.close(outcome, ended, Some(Duration::from_secs(10)));
        record
    }

    #[test]
    fn open_records_are_refused() {
        let log = IncidentLog::in_memory();
        let scenario = Scenario {
            id: "node-down-es1".into(),
            category: ScenarioCategory::NodeFailure,
            target: "es1".into(),
            effect: EffectConfig::default(),
            rollback: RollbackAction::Revert,
            interval: None,
        };
        let record = InjectionRecord::open(&scenario, TriggerSource::OnDemand);
        assert!(matches!(log.append(record), Err(ChaosError::RecordOpen(_))));
        assert!(log.is_empty());
    }

    #[test]
    fn duplicate_finalization_is_rejected() {
        let log = IncidentLog::in_memory();
        let record = finalized("a", ScenarioCategory::NodeFailure, InjectionOutcome::Success, 0);
        log.append(record.clone()).unwrap();
        let err = log.append(record.clone()).unwrap_err();
        assert!(matches!(err, ChaosError::AlreadyFinalized(id) if id == record.id));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn query_is_start_ordered_and_filtered() {
        let log = IncidentLog::in_memory();
        log.append(finalized("late", ScenarioCategory::NodeFailure, InjectionOutcome::Success, 30))
            .unwrap();
        log.append(finalized(
            "early",
            ScenarioCategory::NodeFailure,
            InjectionOutcome::FailedToRecover,
            10,
        ))
        .unwrap();
        log.append(finalized(
            "cpu",
            ScenarioCategory::ResourceExhaustion,
            InjectionOutcome::Success,
            20,
        ))
        .unwrap();

        let all: Vec<_> = log
            .query(IncidentFilter::new())
            .map(|r| r.scenario_id)
            .collect();
        assert_eq!(all, ["early", "cpu", "late"]);

        let node_failures: Vec<_> = log
            .query(IncidentFilter::new().category(ScenarioCategory::NodeFailure))
            .map(|r| r.scenario_id)
            .collect();
        assert_eq!(node_failures, ["early", "late"]);

        let successes = log
            .query(IncidentFilter::new().outcome(InjectionOutcome::Success).limit(1))
            .map(|r| r.scenario_id)
            .collect::<Vec<_>>();
        assert_eq!(successes, ["cpu"]);

        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let windowed: Vec<_> = log
            .query(IncidentFilter::new().between(
                Some(base + ChronoDuration::seconds(15)),
                Some(base + ChronoDuration::seconds(30)),
            ))
            .map(|r| r.scenario_id)
            .collect();
        assert_eq!(windowed, ["cpu"]);
    }

    #[test]
    fn query_is_restartable_and_blind_to_later_appends() {
        let log = IncidentLog::in_memory();
        log.append(finalized("a", ScenarioCategory::NodeFailure, InjectionOutcome::Success, 0))
            .unwrap();
        let query = log.query(IncidentFilter::new());
        log.append(finalized("b", ScenarioCategory::NodeFailure, InjectionOutcome::Success, 5))
            .unwrap();
        assert_eq!(query.clone().count(), 1);
        assert_eq!(query.count(), 1);
        assert_eq!(log.query(IncidentFilter::new()).count(), 2);
    }

    #[test]
    fn file_backed_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents/incidents.jsonl");
        let first = finalized("a", ScenarioCategory::NodeFailure, InjectionOutcome::Success, 0);
        let second = finalized(
            "b",
            ScenarioCategory::SecurityIncident,
            InjectionOutcome::Aborted,
            5,
        );
        {
            let log = IncidentLog::open(&path).unwrap();
            log.append(first.clone()).unwrap();
            log.append(second.clone()).unwrap();
        }

        let reopened = IncidentLog::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(first.id), Some(first.clone()));
        assert!(matches!(
            reopened.append(first),
            Err(ChaosError::AlreadyFinalized(_))
        ));

        let read_only = IncidentLog::open_read_only(&path).unwrap();
        assert_eq!(read_only.get(second.id), Some(second));
        assert_eq!(read_incident_file(&path).unwrap().len(), 2);
    }

    #[test]
    fn torn_tail_is_dropped_and_truncated_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.jsonl");
        let kept = finalized("a", ScenarioCategory::NodeFailure, InjectionOutcome::Success, 0);
        IncidentLog::open(&path).unwrap().append(kept.clone()).unwrap();
        let intact_len = fs::metadata(&path).unwrap().len();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"id":"0000"#).unwrap();
        drop(file);
        assert_eq!(read_incident_file(&path).unwrap(), vec![kept.clone()]);

        let reopened = IncidentLog::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);

        let next = finalized("b", ScenarioCategory::NodeFailure, InjectionOutcome::Partial, 5);
        reopened.append(next.clone()).unwrap();
        assert_eq!(read_incident_file(&path).unwrap(), vec![kept, next]);
    }

    #[test]
    fn unterminated_last_record_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.jsonl");
        let first = finalized("a", ScenarioCategory::NodeFailure, InjectionOutcome::Success, 0);
        let header = r#"{"version":1,"created_at":"2026-01-01T00:00:00Z"}"#;
        let body = format!("{header}\n{}", serde_json::to_string(&first).unwrap());
        fs::write(&path, body).unwrap();

        let log = IncidentLog::open(&path).unwrap();
        let second = finalized("b", ScenarioCategory::NodeFailure, InjectionOutcome::Success, 5);
        log.append(second.clone()).unwrap();
        assert_eq!(read_incident_file(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn damaged_line_between_records_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.jsonl");
        let record = finalized("a", ScenarioCategory::NodeFailure, InjectionOutcome::Success, 0);
        let body = format!(
            "{}\nnot json\n{}\n",
            r#"{"version":1,"created_at":"2026-01-01T00:00:00Z"}"#,
            serde_json::to_string(&record).unwrap()
        );
        fs::write(&path, body).unwrap();

        assert!(matches!(IncidentLog::open(&path), Err(ChaosError::Json(_))));
    }

    #[test]
    fn paged_filter_clamps_limit() {
        assert_eq!(IncidentFilter::new().paged().limit, Some(DEFAULT_QUERY_LIMIT));
        assert_eq!(
            IncidentFilter::new().limit(5_000).paged().limit,
            Some(MAX_QUERY_LIMIT)
        );
    }
}
