//! Persisted agent identity.
//!
//! A small JSON document `{agent_uuid, password}` read once at startup and
//! rewritten when the identity changes. Saves go through a temporary file
//! and an atomic rename so a crash never leaves a torn state file behind.

use crate::BootstrapResult;
use anyhow::Context as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StateDocument {
    agent_uuid: String,
    password: String,
}

/// Handle to the on-disk agent state.
pub struct AgentState {
    path: PathBuf,
    doc: Mutex<StateDocument>,
}

impl AgentState {
    /// Loads the state file, or starts empty when it does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> BootstrapResult<Self> {
        let path = path.into();

        let doc = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("parsing state file {}", path.display()))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => StateDocument::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading state file {}", path.display()));
            }
        };

        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    /// Returns the stored agent UUID, if one has been assigned.
    pub fn agent_uuid(&self) -> Option<String> {
        let doc = self.doc.lock();

        (!doc.agent_uuid.is_empty()).then(|| doc.agent_uuid.clone())
    }

    /// Returns the stored agent password, if any.
    pub fn password(&self) -> Option<String> {
        let doc = self.doc.lock();

        (!doc.password.is_empty()).then(|| doc.password.clone())
    }

    /// Stores a new identity and saves the file.
    pub fn set_identity(&self, agent_uuid: &str, password: &str) -> io::Result<()> {
        let mut doc = self.doc.lock();

        doc.agent_uuid = agent_uuid.to_owned();
        doc.password = password.to_owned();

        save(&self.path, &doc)
    }
}

fn save(path: &Path, doc: &StateDocument) -> io::Result<()> {
    let tmp = tmp_path(path);
    let raw = serde_json::to_vec_pretty(doc)?;

    fs::write(&tmp, raw)?;
    fs::rename(&tmp, path)
}

/// `state.json` saves through `state.json.tmp`, appended rather than
/// substituted so the final name stays intact.
fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");

    PathBuf::from(tmp)
}
