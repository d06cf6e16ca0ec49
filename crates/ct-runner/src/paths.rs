use std::path::{Path, PathBuf};

use tracing::debug;

pub const DEFAULT_EXPERIMENT_NAME: &str = "colortilt";

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// Candidate descriptor locations, in lookup order.
pub fn experiment_candidates(explicit: Option<&Path>, name: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = explicit {
        out.push(expand_home(p));
    }
    out.push(PathBuf::from(format!("{}.experiment", name)));
    if let Some(home) = home_dir() {
        out.push(home.join(format!("{}.experiment", name)));
        out.push(home.join("experiments").join(format!("{}.experiment", name)));
        out.push(home.join("experiments").join(name).join("experiment"));
    }
    out
}

/// First existing descriptor among [`experiment_candidates`].
pub fn find_experiment_file(explicit: Option<&Path>, name: &str) -> Option<PathBuf> {
    for candidate in experiment_candidates(explicit, name) {
        debug!(path = %candidate.display(), "looking for experiment file");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Resolves a directory entry of the descriptor at `source_file`.
///
/// Absolute entries are kept, entries starting with `.` are taken relative to
/// the descriptor's directory, `~/` is expanded, anything else is left
/// relative to the working directory. An empty entry resolves to nothing.
pub fn resolve_entry(source_file: &Path, entry: &str) -> Option<PathBuf> {
    if entry.is_empty() {
        return None;
    }
    let path = Path::new(entry);
    if path.is_absolute() {
        return Some(path.to_path_buf());
    }
    if entry.starts_with('.') {
        let base = source_file.parent().unwrap_or(Path::new("."));
        return Some(base.join(path));
    }
    if entry == "~" || entry.starts_with("~/") {
        return Some(expand_home(path));
    }
    Some(path.to_path_buf())
}
