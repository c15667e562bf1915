use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use super::error::{Result, ScrapeError};
use super::state::JobState;

pub const DEFAULT_STATE_FILE: &str = "scrape_state.json";

const ARRAY_FIELDS: [&str; 3] = ["propertyUrls", "scrapedData", "errors"];
const NUMERIC_FIELDS: [&str; 2] = ["currentPage", "endPage"];

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> JobState {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return JobState::default(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "state file unreadable, starting fresh");
                return JobState::default();
            }
        };

        let value = match serde_json::from_str::<Value>(&content) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "state file is not JSON, starting fresh");
                return JobState::default();
            }
        };
        if !is_valid_state_shape(&value) {
            warn!(path = %self.path.display(), "state file has an invalid shape, starting fresh");
            return JobState::default();
        }

        match serde_json::from_value::<JobState>(value) {
            Ok(state) => {
                debug!(
                    urls = state.property_urls.len(),
                    records = state.scraped_data.len(),
                    "loaded job state"
                );
                state
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "state file failed to decode, starting fresh");
                JobState::default()
            }
        }
    }

    pub fn save(&self, state: &JobState) -> Result<()> {
        let persist = || -> io::Result<()> {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let bytes = serde_json::to_vec_pretty(state).map_err(io::Error::other)?;
            let tmp = self.temp_path();
            fs::write(&tmp, bytes)?;
            fs::rename(&tmp, &self.path)
        };
        persist().map_err(|err| ScrapeError::PersistenceFailure {
            path: self.path.display().to_string(),
            reason: err.to_string(),
        })
    }

    pub fn reset<F>(&self, overrides: F) -> Result<JobState>
    where
        F: FnOnce(&mut JobState),
    {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(ScrapeError::PersistenceFailure {
                    path: self.path.display().to_string(),
                    reason: err.to_string(),
                });
            }
        }
        let mut state = JobState::default();
        overrides(&mut state);
        self.save(&state)?;
        Ok(state)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| DEFAULT_STATE_FILE.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

pub fn is_valid_state_shape(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    let arrays_ok = ARRAY_FIELDS
        .iter()
        .all(|field| object.get(*field).is_some_and(Value::is_array));
    let numbers_ok = NUMERIC_FIELDS
        .iter()
        .all(|field| object.get(*field).is_some_and(Value::is_number));
    arrays_ok && numbers_ok
}
