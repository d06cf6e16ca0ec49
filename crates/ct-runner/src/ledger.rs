//! Required versus completed sessions, read straight from disk.
//!
//! Nothing is cached: every query re-reads the subject's session definition
//! file and response directory, so results always reflect the files present
//! at the time of the call. Concurrent runs for one subject are only kept
//! apart by [`crate::response::SubjectLock`], which callers must take.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{ExperimentConfig, Subject};
use crate::error::Result;
use crate::response::{strip_timestamp, RESPONSE_SUFFIX};
use crate::session::{Session, Trail};

#[derive(Debug, Deserialize)]
struct SessionFile {
    #[serde(default)]
    sessions: Vec<String>,
}

/// File names directly inside `dir`, sorted. A missing directory yields an
/// empty list.
fn file_names(dir: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            out.push(name.to_string());
        }
    }
    Ok(out)
}

pub fn list_sessions<S: Subject + ?Sized>(
    exp: &ExperimentConfig,
    subject: &S,
) -> Result<Vec<Session>> {
    let path = exp.session_file(subject)?;
    if !path.exists() {
        warn!(path = %path.display(), "no session file for subject");
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(&path)?;
    let doc: SessionFile = serde_yaml::from_str(&raw)?;
    doc.sessions
        .iter()
        .map(|s| Session::from_string(s))
        .collect()
}

/// Trails of all complete response artifacts of `subject`.
///
/// Only `*.dat` files count; incomplete runs end in `.dat.x` and are skipped.
pub fn list_completed<S: Subject + ?Sized>(
    exp: &ExperimentConfig,
    subject: &S,
) -> Result<Vec<Trail>> {
    let dir = exp.resp_dir(subject)?;
    if !dir.is_dir() {
        warn!(path = %dir.display(), "no response directory for subject");
        return Ok(Vec::new());
    }
    let trails = file_names(&dir)?
        .iter()
        .filter_map(|name| name.strip_suffix(RESPONSE_SUFFIX))
        .map(|stem| Trail::from_string(strip_timestamp(stem)))
        .collect();
    Ok(trails)
}

/// Picks the first session whose occurrence count so far exceeds its number
/// of completed trails. The n-th listing of a repeated session is satisfied
/// only by its n-th recorded run.
pub fn select_next(sessions: &[Session], trails: &[Trail]) -> Option<Session> {
    for (i, session) in sessions.iter().enumerate() {
        let n_required = sessions[..=i].iter().filter(|s| *s == session).count();
        let n_completed = trails.iter().filter(|t| t.matches(session)).count();
        let needs_doing = n_completed < n_required;
        debug!(
            session = %session,
            responses = n_completed,
            required = n_required,
            needs_doing,
            "session check"
        );
        if needs_doing {
            return Some(session.clone());
        }
    }
    None
}

pub fn next_session<S: Subject + ?Sized>(
    exp: &ExperimentConfig,
    subject: &S,
) -> Result<Option<Session>> {
    let trails = list_completed(exp, subject)?;
    for t in &trails {
        debug!(trail = %t, "found response");
    }
    let sessions = list_sessions(exp, subject)?;
    Ok(select_next(&sessions, &trails))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StimProgress {
    pub done: usize,
    pub todo: usize,
}

impl StimProgress {
    pub fn deficit(&self) -> usize {
        self.todo.saturating_sub(self.done)
    }
}

/// Progress grouped by stimulus-set name only.
///
/// Coarser than [`select_next`]: the randomization-sequence part is ignored,
/// so the two views can disagree when sequence names are shared between
/// stimulus sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub by_stim: BTreeMap<String, StimProgress>,
}

impl LedgerSummary {
    pub fn from_parts(sessions: &[Session], trails: &[Trail]) -> Self {
        let mut by_stim: BTreeMap<String, StimProgress> = BTreeMap::new();
        for s in sessions {
            by_stim.entry(s.stim.clone()).or_default().todo += 1;
        }
        for t in trails {
            by_stim.entry(t.stim.clone()).or_default().done += 1;
        }
        Self { by_stim }
    }

    pub fn total_deficit(&self) -> usize {
        self.by_stim.values().map(StimProgress::deficit).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.total_deficit() == 0
    }
}

pub fn summarize<S: Subject + ?Sized>(
    exp: &ExperimentConfig,
    subject: &S,
) -> Result<LedgerSummary> {
    let sessions = list_sessions(exp, subject)?;
    let trails = list_completed(exp, subject)?;
    Ok(LedgerSummary::from_parts(&sessions, &trails))
}

/// Identifiers of all subjects with a session definition file.
pub fn subjects(exp: &ExperimentConfig) -> Result<Vec<String>> {
    let dir = exp.sess_dir()?;
    if !dir.is_dir() {
        warn!(path = %dir.display(), "session directory missing");
        return Ok(Vec::new());
    }
    Ok(file_names(&dir)?
        .iter()
        .filter_map(|name| name.strip_suffix(".sessions"))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect())
}
