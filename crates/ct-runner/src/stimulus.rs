use rand::Rng;
use std::f64::consts::PI;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::config::ExperimentConfig;
use crate::error::{Error, Result};
use crate::randomizer::{block_shuffle, RandomSequence};
use crate::session::Session;
use crate::store::atomic_write_bytes;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stimulus {
    /// Foreground hue angle in radians.
    pub phi_fg: f64,
    /// Background hue angle in radians; negative means reference grey.
    pub phi_bg: f64,
    pub size: f32,
    pub side: char,
}

impl Stimulus {
    pub fn has_background(&self) -> bool {
        self.phi_bg >= 0.0
    }

    fn to_csv_row(self) -> String {
        format!("{}, {}, {}, {}", self.phi_fg, self.phi_bg, self.size, self.side)
    }
}

pub(crate) fn split_fields(line: &str) -> Vec<&str> {
    line.split(',').map(str::trim).collect()
}

pub(crate) fn field<T: std::str::FromStr>(
    path: &Path,
    line: usize,
    name: &str,
    raw: &str,
) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| Error::parse(path, line, format!("invalid {} '{}': {}", name, raw, e)))
}

pub(crate) fn char_field(path: &Path, line: usize, name: &str, raw: &str) -> Result<char> {
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(Error::parse(
            path,
            line,
            format!("invalid {} '{}': expected one character", name, raw),
        )),
    }
}

pub fn parse_stimuli(raw: &str, path: &Path) -> Result<Vec<Stimulus>> {
    let mut stimuli = Vec::new();
    for (i, line) in raw.lines().enumerate() {
        let lineno = i + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields = split_fields(trimmed);
        if fields.len() != 4 {
            return Err(Error::parse(
                path,
                lineno,
                format!("expected 4 fields, found {}", fields.len()),
            ));
        }
        stimuli.push(Stimulus {
            phi_fg: field(path, lineno, "fg", fields[0])?,
            phi_bg: field(path, lineno, "bg", fields[1])?,
            size: field(path, lineno, "size", fields[2])?,
            side: char_field(path, lineno, "side", fields[3])?,
        });
    }
    Ok(stimuli)
}

pub fn read_stimuli(path: &Path) -> Result<Vec<Stimulus>> {
    let raw = fs::read_to_string(path)?;
    parse_stimuli(&raw, path)
}

/// Renders a stimulus table; with `block_size` each block gets a comment
/// line in front.
pub fn stimuli_to_csv(stimuli: &[Stimulus], block_size: Option<usize>) -> String {
    let mut out = String::from("# fg, bg, size, side\n");
    for (i, s) in stimuli.iter().enumerate() {
        if let Some(bs) = block_size.filter(|&bs| bs > 0) {
            if i % bs == 0 {
                out.push_str(&format!("# block {}\n", i / bs));
            }
        }
        out.push_str(&s.to_csv_row());
        out.push('\n');
    }
    out
}

pub fn write_stimuli(path: &Path, stimuli: &[Stimulus], block_size: Option<usize>) -> Result<()> {
    let out = stimuli_to_csv(stimuli, block_size);
    atomic_write_bytes(path, out.as_bytes())?;
    info!(path = %path.display(), n = stimuli.len(), "wrote stimulus table");
    Ok(())
}

/// `n` angles evenly spaced over `[0, 2π)`.
pub fn angles(n: usize) -> Vec<f64> {
    (0..n).map(|i| 2.0 * PI * i as f64 / n as f64).collect()
}

/// Full factorial stimulus design, repeated once per block.
#[derive(Debug, Clone)]
pub struct StimulusGrid {
    pub n_fg: usize,
    pub n_bg: usize,
    pub sizes: Vec<f32>,
    pub sides: Vec<char>,
    pub blocks: usize,
}

impl Default for StimulusGrid {
    fn default() -> Self {
        Self {
            n_fg: 16,
            n_bg: 8,
            sizes: vec![40.0, 60.0],
            sides: vec!['r'],
            blocks: 2,
        }
    }
}

impl StimulusGrid {
    pub fn block_size(&self) -> usize {
        self.n_fg * self.n_bg * self.sizes.len() * self.sides.len()
    }

    fn design(&self) -> Vec<Stimulus> {
        let fgs = angles(self.n_fg);
        let bgs = angles(self.n_bg);
        let mut out = Vec::with_capacity(self.block_size());
        for &phi_fg in &fgs {
            for &phi_bg in &bgs {
                for &size in &self.sizes {
                    for &side in &self.sides {
                        out.push(Stimulus {
                            phi_fg,
                            phi_bg,
                            size,
                            side,
                        });
                    }
                }
            }
        }
        out
    }

    /// Blocks are contiguous, each one a separately shuffled copy of the
    /// design, so the table pairs with a randomizer of the same block count.
    pub fn generate<R: Rng>(&self, rng: &mut R) -> Result<Vec<Stimulus>> {
        if self.blocks == 0 {
            return Err(Error::Config("number of blocks must be at least 1".into()));
        }
        let block = self.design();
        if block.is_empty() {
            return Err(Error::Config("stimulus design is empty".into()));
        }
        let mut table = Vec::with_capacity(block.len() * self.blocks);
        for _ in 0..self.blocks {
            table.extend_from_slice(&block);
        }
        block_shuffle(&mut table, block.len(), rng);
        Ok(table)
    }
}

/// Pairs a stimulus table with a randomization sequence.
pub fn order_trials(
    stimuli: &[Stimulus],
    sequence: &RandomSequence,
    rnd_path: &Path,
) -> Result<Vec<Stimulus>> {
    sequence
        .indices()
        .iter()
        .enumerate()
        .map(|(i, &idx)| {
            stimuli.get(idx).copied().ok_or_else(|| {
                Error::parse(
                    rnd_path,
                    i + 2,
                    format!("index {} outside stimulus table of {}", idx, stimuli.len()),
                )
            })
        })
        .collect()
}

/// Stimuli of `session` in presentation order.
pub fn load_trials(exp: &ExperimentConfig, session: &Session) -> Result<Vec<Stimulus>> {
    let stimuli = read_stimuli(&exp.stim_file(session)?)?;
    let rnd_path = exp.rnd_file(session)?;
    let sequence = RandomSequence::read(&rnd_path)?;
    order_trials(&stimuli, &sequence, &rnd_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::randomizer::seeded_rng;
    use crate::store::temp_root;

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let raw = "# fg, bg, size, side\n\n0.0, 1.5, 40, l\n  \n3.14, -1, 60, r\n";
        let stimuli = parse_stimuli(raw, Path::new("t.stm")).expect("valid table");
        assert_eq!(stimuli.len(), 2);
        assert_eq!(stimuli[0].side, 'l');
        assert!(stimuli[0].has_background());
        assert_eq!(stimuli[1].size, 60.0);
        assert!(!stimuli[1].has_background());
    }

    #[test]
    fn parse_rejects_wrong_field_count() {
        let err = parse_stimuli("0.0, 1.0, 40\n", Path::new("t.stm")).expect_err("3 fields");
        match err {
            Error::Parse { line, message, .. } => {
                assert_eq!(line, 1);
                assert!(message.contains("expected 4 fields"), "{}", message);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(parse_stimuli("0.0, 1.0, 40, lr\n", Path::new("t.stm")).is_err());
    }

    #[test]
    fn grid_blocks_are_shuffled_copies_of_the_design() {
        let grid = StimulusGrid {
            n_fg: 4,
            n_bg: 2,
            sizes: vec![40.0],
            sides: vec!['l', 'r'],
            blocks: 3,
        };
        let table = grid.generate(&mut seeded_rng(9)).expect("grid");
        assert_eq!(grid.block_size(), 16);
        assert_eq!(table.len(), 48);

        let key = |s: &Stimulus| (s.phi_fg.to_bits(), s.phi_bg.to_bits(), s.side);
        let mut first: Vec<_> = table[..16].iter().map(key).collect();
        first.sort();
        for block in table.chunks(16).skip(1) {
            let mut keys: Vec<_> = block.iter().map(key).collect();
            keys.sort();
            assert_eq!(keys, first);
        }
    }

    #[test]
    fn angles_exclude_full_turn() {
        let a = angles(4);
        assert_eq!(a.len(), 4);
        assert_eq!(a[0], 0.0);
        assert!((a[2] - PI).abs() < 1e-12);
        assert!(a.iter().all(|&v| v < 2.0 * PI));
    }

    #[test]
    fn write_then_read_preserves_table() {
        let root = temp_root("stm");
        let path = root.join("tilt.stm");
        let grid = StimulusGrid {
            n_fg: 2,
            n_bg: 2,
            sizes: vec![40.0, 60.0],
            sides: vec!['r'],
            blocks: 2,
        };
        let table = grid.generate(&mut seeded_rng(1)).expect("grid");
        write_stimuli(&path, &table, Some(grid.block_size())).expect("write");
        let back = read_stimuli(&path).expect("read");
        assert_eq!(back, table);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn order_trials_rejects_out_of_range_index() {
        let table = vec![Stimulus {
            phi_fg: 0.0,
            phi_bg: 0.0,
            size: 40.0,
            side: 'r',
        }];
        let seq = RandomSequence(vec![0, 1]);
        let err = order_trials(&table, &seq, Path::new("r.rnd")).expect_err("index 1");
        match err {
            Error::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {}", other),
        }
    }
}
