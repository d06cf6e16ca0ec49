//! Recorded response artifacts.
//!
//! One file per run under `<data-path>/<subject>/`, named
//! `<timestamp>_<stim>@<rnd>.dat`. A run that stopped before the end of its
//! sequence is written with an extra `.x` suffix and never counts as done.

use chrono::{Local, NaiveDateTime};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{ExperimentConfig, Subject};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::stimulus::{char_field, field, split_fields, Stimulus};
use crate::store::{atomic_write_bytes, ensure_dir};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M";
pub const RESPONSE_SUFFIX: &str = ".dat";
pub const INCOMPLETE_SUFFIX: &str = ".x";
pub const RESPONSE_HEADER: &str = "size, bg, fg, phi_start, phi, side, duration";

const LOCK_FILE: &str = ".ct.lock";

pub fn make_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Width of a rendered [`TIMESTAMP_FORMAT`], without the `_` separator.
pub fn timestamp_width() -> usize {
    NaiveDateTime::default()
        .format(TIMESTAMP_FORMAT)
        .to_string()
        .len()
}

/// Strips a leading `<timestamp>_` token from a response file stem.
pub fn strip_timestamp(stem: &str) -> &str {
    let width = timestamp_width();
    match (stem.get(..width), stem.get(width..)) {
        (Some(ts), Some(rest))
            if rest.starts_with('_')
                && NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).is_ok() =>
        {
            &rest[1..]
        }
        _ => stem,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Response {
    pub stimulus: Stimulus,
    pub phi_start: f64,
    pub phi: f64,
    pub duration: f64,
}

impl Response {
    fn to_csv_row(self) -> String {
        format!(
            "{}, {}, {}, {}, {}, {}, {}",
            self.stimulus.size,
            self.stimulus.phi_bg,
            self.stimulus.phi_fg,
            self.phi_start,
            self.phi,
            self.stimulus.side,
            self.duration
        )
    }
}

pub fn responses_to_csv(responses: &[Response]) -> String {
    let mut out = String::from(RESPONSE_HEADER);
    for r in responses {
        out.push('\n');
        out.push_str(&r.to_csv_row());
    }
    out.push('\n');
    out
}

pub fn parse_responses(raw: &str, path: &Path) -> Result<Vec<Response>> {
    let mut lines = raw.lines().enumerate();
    match lines.next() {
        Some((_, header)) if split_fields(header) == split_fields(RESPONSE_HEADER) => {}
        _ => return Err(Error::parse(path, 1, "missing response header")),
    }
    let mut out = Vec::new();
    for (i, line) in lines {
        let lineno = i + 1;
        if line.trim().is_empty() {
            continue;
        }
        let f = split_fields(line.trim());
        if f.len() != 7 {
            return Err(Error::parse(
                path,
                lineno,
                format!("expected 7 fields, found {}", f.len()),
            ));
        }
        out.push(Response {
            stimulus: Stimulus {
                size: field(path, lineno, "size", f[0])?,
                phi_bg: field(path, lineno, "bg", f[1])?,
                phi_fg: field(path, lineno, "fg", f[2])?,
                side: char_field(path, lineno, "side", f[5])?,
            },
            phi_start: field(path, lineno, "phi_start", f[3])?,
            phi: field(path, lineno, "phi", f[4])?,
            duration: field(path, lineno, "duration", f[6])?,
        });
    }
    Ok(out)
}

pub fn read_responses(path: &Path) -> Result<Vec<Response>> {
    let raw = fs::read_to_string(path)?;
    parse_responses(&raw, path)
}

pub fn is_incomplete(path: &Path) -> bool {
    path.to_string_lossy().ends_with(INCOMPLETE_SUFFIX)
}

/// Records one run of `session`. `expected` is the length of the driving
/// randomization sequence; fewer responses mark the artifact incomplete.
/// Existing artifacts are never overwritten.
pub fn write_responses<S: Subject + ?Sized>(
    exp: &ExperimentConfig,
    subject: &S,
    session: &Session,
    responses: &[Response],
    expected: usize,
) -> Result<PathBuf> {
    if !session.is_valid() {
        return Err(Error::Config(format!(
            "cannot record responses for invalid session '{}'",
            session
        )));
    }
    let prefix = format!("{}_", make_timestamp());
    let mut path = exp.resp_file(session, subject, &prefix)?;
    let complete = responses.len() >= expected;
    if !complete {
        let mut name = path.into_os_string();
        name.push(INCOMPLETE_SUFFIX);
        path = PathBuf::from(name);
        warn!(
            session = %session,
            recorded = responses.len(),
            expected,
            "run incomplete, marking artifact"
        );
    }
    if path.exists() {
        return Err(Error::Config(format!(
            "response artifact already exists: {}",
            path.display()
        )));
    }
    atomic_write_bytes(&path, responses_to_csv(responses).as_bytes())?;
    info!(path = %path.display(), n = responses.len(), complete, "recorded responses");
    Ok(path)
}

/// Advisory per-subject lock, released on drop.
///
/// Only cooperating processes that acquire it are excluded; plain writers to
/// the response directory are not.
#[derive(Debug)]
pub struct SubjectLock {
    path: PathBuf,
}

impl SubjectLock {
    pub fn acquire<S: Subject + ?Sized>(exp: &ExperimentConfig, subject: &S) -> Result<Self> {
        let dir = exp.resp_dir(subject)?;
        ensure_dir(&dir)?;
        let lock_path = dir.join(LOCK_FILE);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                let payload = format!(
                    "pid={} acquired_at={}\n",
                    std::process::id(),
                    Local::now().to_rfc3339()
                );
                let _ = file.write_all(payload.as_bytes());
                let _ = file.sync_all();
                Ok(Self { path: lock_path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::Locked(lock_path))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SubjectLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::temp_root;

    fn exp_in(root: &Path) -> ExperimentConfig {
        let raw = "\
colortilt:
  contrast: {fg: 0.16, bg: 0.14}
  data-path: ./data
  stim-path: ./stimuli
  sess-path: ./sessions
  cursor-gain: 0.0001
";
        ExperimentConfig::from_yaml_str(raw, &root.join("colortilt.experiment"))
            .expect("descriptor")
    }

    fn response(i: usize) -> Response {
        Response {
            stimulus: Stimulus {
                phi_fg: i as f64 * 0.5,
                phi_bg: -1.0,
                size: 40.0,
                side: 'l',
            },
            phi_start: 1.25,
            phi: 0.75 + i as f64,
            duration: 3.5,
        }
    }

    #[test]
    fn timestamp_width_matches_rendered_timestamps() {
        assert_eq!(timestamp_width(), 13);
        assert_eq!(make_timestamp().len(), timestamp_width());
    }

    #[test]
    fn strip_timestamp_only_removes_real_timestamps() {
        assert_eq!(strip_timestamp("20150313T1430_tilt@r01"), "tilt@r01");
        assert_eq!(strip_timestamp("tilt@r01"), "tilt@r01");
        assert_eq!(strip_timestamp("abcdefghijklm_tilt@r01"), "abcdefghijklm_tilt@r01");
        assert_eq!(strip_timestamp("short"), "short");
    }

    #[test]
    fn complete_run_is_written_with_plain_suffix() {
        let root = temp_root("resp_complete");
        let exp = exp_in(&root);
        let session = Session::new("tilt", "r01");
        let responses: Vec<_> = (0..3).map(response).collect();

        let path = write_responses(&exp, "jb", &session, &responses, 3).expect("write");
        let name = path.file_name().expect("name").to_string_lossy().to_string();
        assert!(name.ends_with("_tilt@r01.dat"), "{}", name);
        assert!(!is_incomplete(&path));

        let back = read_responses(&path).expect("read back");
        assert_eq!(back, responses);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn short_run_is_marked_incomplete() {
        let root = temp_root("resp_short");
        let exp = exp_in(&root);
        let session = Session::new("tilt", "r01");
        let responses: Vec<_> = (0..2).map(response).collect();

        let path = write_responses(&exp, "jb", &session, &responses, 5).expect("write");
        assert!(path.to_string_lossy().ends_with("_tilt@r01.dat.x"));
        assert!(is_incomplete(&path));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn invalid_session_is_rejected() {
        let root = temp_root("resp_invalid");
        let exp = exp_in(&root);
        let err = write_responses(&exp, "jb", &Session::new("tilt", ""), &[], 0)
            .expect_err("invalid session");
        assert!(matches!(err, Error::Config(_)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn parse_responses_checks_header_and_width() {
        let p = Path::new("r.dat");
        assert!(parse_responses("a, b\n1, 2\n", p).is_err());
        let err = parse_responses(&format!("{}\n1, 2, 3\n", RESPONSE_HEADER), p)
            .expect_err("short row");
        match err {
            Error::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn subject_lock_is_exclusive() {
        let root = temp_root("lock");
        let exp = exp_in(&root);

        let lock1 = SubjectLock::acquire(&exp, "jb").expect("first lock must succeed");
        let err = SubjectLock::acquire(&exp, "jb").expect_err("second lock must fail");
        assert!(matches!(err, Error::Locked(_)), "unexpected lock error: {}", err);
        assert!(err.to_string().contains("subject_locked"));
        drop(lock1);
        let lock2 = SubjectLock::acquire(&exp, "jb").expect("lock should be re-acquirable");
        drop(lock2);
        let _ = fs::remove_dir_all(root);
    }
}
