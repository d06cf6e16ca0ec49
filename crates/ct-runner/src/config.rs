use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths::{find_experiment_file, resolve_entry};
use crate::session::Session;

/// Identity of an enrolled subject, owned by an external subject store.
pub trait Subject {
    fn identifier(&self) -> &str;
}

impl Subject for str {
    fn identifier(&self) -> &str {
        self
    }
}

impl Subject for String {
    fn identifier(&self) -> &str {
        self.as_str()
    }
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    colortilt: DescriptorSection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DescriptorSection {
    contrast: Contrast,
    data_path: String,
    stim_path: String,
    sess_path: String,
    cursor_gain: f64,
}

#[derive(Debug, Deserialize)]
struct Contrast {
    fg: f64,
    bg: f64,
}

/// Parsed experiment descriptor. Loaded once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub c_fg: f64,
    pub c_bg: f64,
    pub cursor_gain: f64,
    pub data_path: String,
    pub stim_path: String,
    pub sess_path: String,
    pub source_file: PathBuf,
}

impl ExperimentConfig {
    pub fn from_yaml(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml_str(&raw, path)
    }

    pub fn from_yaml_str(raw: &str, source_file: &Path) -> Result<Self> {
        let doc: Descriptor = serde_yaml::from_str(raw)?;
        let root = doc.colortilt;
        Ok(Self {
            c_fg: root.contrast.fg,
            c_bg: root.contrast.bg,
            cursor_gain: root.cursor_gain,
            data_path: root.data_path,
            stim_path: root.stim_path,
            sess_path: root.sess_path,
            source_file: source_file.to_path_buf(),
        })
    }

    pub fn discover(explicit: Option<&Path>, name: &str) -> Result<Self> {
        let path = find_experiment_file(explicit, name)
            .ok_or_else(|| Error::Config(format!("could not find experiment file for '{}'", name)))?;
        Self::from_yaml(&path)
    }

    fn make_dir(&self, key: &str, entry: &str) -> Result<PathBuf> {
        resolve_entry(&self.source_file, entry).ok_or_else(|| {
            Error::Config(format!(
                "{} is empty in {}",
                key,
                self.source_file.display()
            ))
        })
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        self.make_dir("data-path", &self.data_path)
    }

    pub fn stim_dir(&self) -> Result<PathBuf> {
        self.make_dir("stim-path", &self.stim_path)
    }

    pub fn sess_dir(&self) -> Result<PathBuf> {
        self.make_dir("sess-path", &self.sess_path)
    }

    pub fn resp_dir<S: Subject + ?Sized>(&self, subject: &S) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(subject.identifier()))
    }

    pub fn session_file<S: Subject + ?Sized>(&self, subject: &S) -> Result<PathBuf> {
        Ok(self
            .sess_dir()?
            .join(format!("{}.sessions", subject.identifier())))
    }

    pub fn stim_file(&self, session: &Session) -> Result<PathBuf> {
        Ok(self.stim_dir()?.join(format!("{}.stm", session.stim)))
    }

    pub fn rnd_file(&self, session: &Session) -> Result<PathBuf> {
        Ok(self.stim_dir()?.join(format!("{}.rnd", session.rnd)))
    }

    pub fn resp_file<S: Subject + ?Sized>(
        &self,
        session: &Session,
        subject: &S,
        prefix: &str,
    ) -> Result<PathBuf> {
        Ok(self
            .resp_dir(subject)?
            .join(format!("{}{}.dat", prefix, session.name())))
    }
}
