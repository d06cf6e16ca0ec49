//! Block-constrained trial randomization.
//!
//! Trials `0..n` are split into `blocks` contiguous blocks of equal size. The
//! produced order is a permutation of `0..n` in which two neighbouring
//! positions never come from the same block, unless every other block has
//! already been used up.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::atomic_write_bytes;

pub const RND_HEADER: &str = "rnd";

/// Explicit seed if given, otherwise a fresh one from the OS-seeded thread
/// generator. The effective seed is logged so a run can be replayed.
pub fn resolve_seed(explicit: Option<u64>) -> u64 {
    let seed = match explicit {
        Some(seed) => seed,
        None => rand::rng().random::<u64>(),
    };
    info!(seed, explicit = explicit.is_some(), "randomizer seed");
    seed
}

pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialRandomizer {
    n: usize,
    blocks: usize,
    block_size: usize,
}

impl TrialRandomizer {
    pub fn new(n: usize, blocks: usize) -> Result<Self> {
        if blocks == 0 {
            return Err(Error::Config("number of blocks must be at least 1".into()));
        }
        if n % blocks != 0 {
            return Err(Error::Config(format!(
                "N={} not evenly divisible by B={} (remainder {})",
                n,
                blocks,
                n % blocks
            )));
        }
        Ok(Self {
            n,
            blocks,
            block_size: n / blocks,
        })
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_of(&self, index: usize) -> usize {
        index / self.block_size
    }

    pub fn shuffle<R: Rng>(&self, rng: &mut R) -> Vec<usize> {
        let mut numbers: Vec<usize> = (0..self.n).collect();
        if self.n == 0 {
            return numbers;
        }
        block_shuffle(&mut numbers, self.block_size, rng);

        if self.blocks == 1 {
            return numbers;
        }

        let mut cursors = vec![0usize; self.blocks];
        let mut out = Vec::with_capacity(self.n);
        let mut last: Option<usize> = None;

        while out.len() < self.n {
            let cur = rng.random_range(0..self.blocks);

            if last == Some(cur) {
                let alternatives = cursors
                    .iter()
                    .enumerate()
                    .any(|(b, &used)| b != cur && used < self.block_size);
                if alternatives {
                    debug!(block = cur, "block repeat, redrawing");
                    continue;
                }
            }

            let idx = cursors[cur];
            if idx < self.block_size {
                out.push(numbers[cur * self.block_size + idx]);
                cursors[cur] += 1;
                last = Some(cur);
            }
        }

        out
    }

    /// Seeds a fresh generator with `seed` and shuffles.
    pub fn generate(&self, seed: u64) -> RandomSequence {
        let mut rng = seeded_rng(seed);
        RandomSequence(self.shuffle(&mut rng))
    }
}

/// Permutes each consecutive window of `window` elements in place.
pub fn block_shuffle<T, R: Rng>(items: &mut [T], window: usize, rng: &mut R) {
    if window == 0 {
        return;
    }
    for chunk in items.chunks_mut(window) {
        chunk.shuffle(rng);
    }
}

/// Presentation order of a session, as indices into its stimulus table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RandomSequence(pub Vec<usize>);

impl RandomSequence {
    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_rnd_string(&self) -> String {
        let mut out = String::from(RND_HEADER);
        for n in &self.0 {
            out.push('\n');
            out.push_str(&n.to_string());
        }
        out
    }

    pub fn from_rnd_str(raw: &str, path: &Path) -> Result<Self> {
        let mut lines = raw.lines().enumerate();
        match lines.next() {
            Some((_, header)) if header.trim() == RND_HEADER => {}
            _ => return Err(Error::parse(path, 1, "missing 'rnd' header")),
        }
        let mut out = Vec::new();
        for (i, line) in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value = line
                .parse::<usize>()
                .map_err(|e| Error::parse(path, i + 1, format!("invalid index '{}': {}", line, e)))?;
            out.push(value);
        }
        Ok(Self(out))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_rnd_str(&raw, path)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_bytes(path, self.to_rnd_string().as_bytes())?;
        info!(path = %path.display(), n = self.len(), "wrote random sequence");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::temp_root;

    fn assert_permutation(seq: &[usize], n: usize) {
        let mut sorted = seq.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..n).collect::<Vec<_>>());
    }

    /// Adjacent same-block pairs are only allowed once all other blocks are
    /// exhausted, i.e. in the tail of the sequence.
    fn assert_no_avoidable_repeats(r: &TrialRandomizer, seq: &[usize]) {
        for i in 0..seq.len().saturating_sub(1) {
            let a = r.block_of(seq[i]);
            let b = r.block_of(seq[i + 1]);
            if a != b {
                continue;
            }
            let others_left = seq[i + 1..]
                .iter()
                .any(|&v| r.block_of(v) != a);
            assert!(
                !others_left,
                "avoidable repeat of block {} at position {}: {:?}",
                a, i, seq
            );
        }
    }

    #[test]
    fn rejects_uneven_block_split() {
        let err = TrialRandomizer::new(15, 4).expect_err("15 % 4 != 0");
        assert!(matches!(err, Error::Config(_)), "unexpected error: {}", err);
        assert!(TrialRandomizer::new(10, 0).is_err());
    }

    #[test]
    fn output_is_permutation_without_avoidable_repeats() {
        for &(n, b) in &[(12, 3), (16, 4), (256, 2), (40, 8), (9, 9)] {
            let r = TrialRandomizer::new(n, b).expect("valid split");
            for seed in 0..20u64 {
                let seq = r.generate(seed);
                assert_eq!(seq.len(), n);
                assert_permutation(seq.indices(), n);
                assert_no_avoidable_repeats(&r, seq.indices());
            }
        }
    }

    #[test]
    fn two_blocks_alternate_strictly() {
        let r = TrialRandomizer::new(20, 2).expect("valid split");
        let seq = r.generate(7);
        for w in seq.indices().windows(2) {
            assert_ne!(r.block_of(w[0]), r.block_of(w[1]), "{:?}", seq);
        }
    }

    #[test]
    fn same_seed_gives_same_sequence() {
        let r = TrialRandomizer::new(64, 4).expect("valid split");
        assert_eq!(r.generate(31337), r.generate(31337));
        assert_ne!(r.generate(1), r.generate(2));
    }

    #[test]
    fn single_block_is_plain_shuffle() {
        let r = TrialRandomizer::new(32, 1).expect("valid split");
        let seq = r.generate(5);
        assert_permutation(seq.indices(), 32);
        assert_ne!(seq.indices(), (0..32).collect::<Vec<_>>().as_slice());
    }

    #[test]
    fn empty_design_yields_empty_sequence() {
        let r = TrialRandomizer::new(0, 3).expect("0 splits evenly");
        assert!(r.generate(1).is_empty());
    }

    #[test]
    fn block_shuffle_keeps_windows() {
        let mut rng = seeded_rng(3);
        let mut items: Vec<usize> = (0..30).collect();
        block_shuffle(&mut items, 10, &mut rng);
        for (w, chunk) in items.chunks(10).enumerate() {
            assert!(chunk.iter().all(|&v| v / 10 == w), "{:?}", chunk);
        }
    }

    #[test]
    fn explicit_seed_is_used_verbatim() {
        assert_eq!(resolve_seed(Some(42)), 42);
    }

    #[test]
    fn rnd_file_round_trip() {
        let root = temp_root("rnd");
        let path = root.join("r01.rnd");
        let seq = TrialRandomizer::new(24, 3).expect("split").generate(11);
        seq.write(&path).expect("write rnd");

        let raw = fs::read_to_string(&path).expect("read raw");
        assert!(raw.starts_with("rnd\n"));
        assert!(!raw.ends_with('\n'));

        let back = RandomSequence::read(&path).expect("read rnd");
        assert_eq!(back, seq);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn rnd_parse_rejects_bad_input() {
        let p = Path::new("bad.rnd");
        assert!(RandomSequence::from_rnd_str("3\n1\n2", p).is_err());
        let err = RandomSequence::from_rnd_str("rnd\n1\nx\n", p).expect_err("bad index");
        match err {
            Error::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {}", other),
        }
        let ok = RandomSequence::from_rnd_str("rnd\n\n4\n0\n", p).expect("blank lines skipped");
        assert_eq!(ok.indices(), &[4, 0]);
    }
}
