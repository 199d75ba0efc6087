//! Vacation records and their client-side storage.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use vacation_common::TrackerError;

/// Storage key holding the serialized vacation list.
pub const STORAGE_KEY: &str = "vac_track";

/// Header of the rendered list.
pub const PAST_VACATIONS_HEADER: &str = "Past Vacations";

/// Vacation tracker errors.
#[derive(Error, Debug)]
pub enum VacationError {
    #[error("Invalid dates: {0}")]
    InvalidDates(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VacationError> for TrackerError {
    fn from(err: VacationError) -> Self {
        match err {
            VacationError::InvalidDates(msg) => TrackerError::InvalidArgument(msg),
            VacationError::Io(e) => TrackerError::Io(e),
            other => TrackerError::storage_with_source("vacation storage", other),
        }
    }
}

pub type VacationResult<T> = Result<T, VacationError>;

/// One tracked vacation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VacationRecord {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl VacationRecord {
    /// Render as a list line, dates in US month/day/year order.
    pub fn describe(&self) -> String {
        format!(
            "From {} to {}",
            format_date(self.start_date),
            format_date(self.end_date)
        )
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format("%-m/%-d/%Y").to_string()
}

/// Check the raw form values. Both must be ISO dates and the vacation
/// cannot end before it starts.
pub fn validate_dates(start: &str, end: &str) -> VacationResult<VacationRecord> {
    let start = start.trim();
    let end = end.trim();
    if start.is_empty() || end.is_empty() {
        return Err(VacationError::InvalidDates(
            "start and end dates are required".into(),
        ));
    }

    let parse = |value: &str| {
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map_err(|e| VacationError::InvalidDates(format!("{value}: {e}")))
    };
    let start_date = parse(start)?;
    let end_date = parse(end)?;

    if start_date > end_date {
        return Err(VacationError::InvalidDates(format!(
            "{start_date} is after {end_date}"
        )));
    }

    Ok(VacationRecord {
        start_date,
        end_date,
    })
}

// ==================== Storage ====================

/// String key/value storage, the shape of a browser's local storage.
pub trait KeyValueStorage: Send + Sync {
    fn get_item(&self, key: &str) -> VacationResult<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> VacationResult<()>;
}

/// In-memory storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> VacationResult<Option<String>> {
        let items = self
            .items
            .lock()
            .map_err(|_| VacationError::Storage("storage lock poisoned".into()))?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> VacationResult<()> {
        let mut items = self
            .items
            .lock()
            .map_err(|_| VacationError::Storage("storage lock poisoned".into()))?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Storage persisted as one JSON object in a file.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn load(&self) -> VacationResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = std::fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&text)?)
    }
}

impl KeyValueStorage for FileStorage {
    fn get_item(&self, key: &str) -> VacationResult<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> VacationResult<()> {
        let mut items = self.load()?;
        items.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&items)?)?;
        debug!(path = %self.path.display(), key, "Storage written");
        Ok(())
    }
}

// ==================== Store ====================

/// The vacation list kept under [`STORAGE_KEY`].
#[derive(Debug)]
pub struct VacationStore<S> {
    storage: S,
}

impl<S: KeyValueStorage> VacationStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Validate and add a vacation. The stored list stays sorted newest
    /// start date first.
    pub fn store_new(&self, start: &str, end: &str) -> VacationResult<VacationRecord> {
        let record = validate_dates(start, end)?;

        let mut vacations = self.all()?;
        vacations.push(record);
        vacations.sort_by(|a, b| b.start_date.cmp(&a.start_date));

        self.storage
            .set_item(STORAGE_KEY, &serde_json::to_string(&vacations)?)?;
        info!(
            start = %record.start_date,
            end = %record.end_date,
            total = vacations.len(),
            "Vacation stored"
        );
        Ok(record)
    }

    /// Every stored vacation. Nothing stored yet is an empty list.
    pub fn all(&self) -> VacationResult<Vec<VacationRecord>> {
        match self.storage.get_item(STORAGE_KEY)? {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(Vec::new()),
        }
    }

    /// The "Past Vacations" listing, or `None` when there is nothing to show.
    pub fn render(&self) -> VacationResult<Option<String>> {
        let vacations = self.all()?;
        if vacations.is_empty() {
            return Ok(None);
        }

        let mut out = String::from(PAST_VACATIONS_HEADER);
        for vacation in &vacations {
            out.push('\n');
            out.push_str(&vacation.describe());
        }
        Ok(Some(out))
    }
}
