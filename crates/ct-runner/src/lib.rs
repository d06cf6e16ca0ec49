//! Session bookkeeping and trial randomization for the colortilt experiment.
//!
//! The filesystem is the ledger: session definitions, stimulus tables,
//! randomization sequences and recorded responses all live in the directories
//! named by the experiment descriptor, and every query re-reads them.

pub mod config;
pub mod error;
pub mod ledger;
pub mod paths;
pub mod randomizer;
pub mod response;
pub mod session;
pub mod stimulus;
pub mod store;

pub use config::{ExperimentConfig, Subject};
pub use error::{Error, Result};
pub use ledger::{
    list_completed, list_sessions, next_session, select_next, subjects, summarize, LedgerSummary,
    StimProgress,
};
pub use paths::{find_experiment_file, resolve_entry, DEFAULT_EXPERIMENT_NAME};
pub use randomizer::{resolve_seed, seeded_rng, RandomSequence, TrialRandomizer};
pub use response::{parse_responses, read_responses, write_responses, Response, SubjectLock};
pub use session::{Session, Trail};
pub use stimulus::{
    load_trials, read_stimuli, stimuli_to_csv, write_stimuli, Stimulus, StimulusGrid,
};
