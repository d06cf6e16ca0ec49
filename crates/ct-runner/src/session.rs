//! Session and trail identifiers.
//!
//! Both are a `(stim, rnd)` pair written as `<stim>@<rnd>`. A [`Session`]
//! comes from a subject's session definition file and must be well formed;
//! a [`Trail`] is recovered from the name of a recorded response file and is
//! parsed leniently.

use std::fmt;

use crate::error::{Error, Result};

pub const SEPARATOR: char = '@';

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Session {
    pub stim: String,
    pub rnd: String,
}

impl Session {
    pub fn new(stim: impl Into<String>, rnd: impl Into<String>) -> Self {
        Self {
            stim: stim.into(),
            rnd: rnd.into(),
        }
    }

    /// Strict parse: an entry without `@` is a [`Error::MalformedSession`].
    pub fn from_string(s: &str) -> Result<Self> {
        let (stim, rnd) = s
            .split_once(SEPARATOR)
            .ok_or_else(|| Error::MalformedSession(s.to_string()))?;
        Ok(Self::new(stim, rnd))
    }

    pub fn name(&self) -> String {
        format!("{}{}{}", self.stim, SEPARATOR, self.rnd)
    }

    pub fn is_valid(&self) -> bool {
        !self.stim.is_empty() && !self.rnd.is_empty()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.stim, SEPARATOR, self.rnd)
    }
}

impl std::str::FromStr for Session {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Session::from_string(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Trail {
    pub stim: String,
    pub rnd: String,
}

impl Trail {
    /// Lenient parse: without `@` the whole input is the stimulus name.
    pub fn from_string(s: &str) -> Self {
        match s.split_once(SEPARATOR) {
            Some((stim, rnd)) => Self {
                stim: stim.to_string(),
                rnd: rnd.to_string(),
            },
            None => Self {
                stim: s.to_string(),
                rnd: String::new(),
            },
        }
    }

    pub fn name(&self) -> String {
        format!("{}{}{}", self.stim, SEPARATOR, self.rnd)
    }

    pub fn matches(&self, session: &Session) -> bool {
        self.stim == session.stim && self.rnd == session.rnd
    }
}

impl fmt::Display for Trail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.stim, SEPARATOR, self.rnd)
    }
}
