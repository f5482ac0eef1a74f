//! The object key convention that drives the pipeline.
//!
//! Every object the pipeline cares about lives under a three-segment key:
//!
//! ```text
//! {stage}/{agency}/{filename}
//! ```
//!
//! - `stage` is one of `raw`, `clean`, `ids-assigned` and identifies the
//!   pipeline step that consumes the object
//! - `agency` names the data source (a funding body such as `cihr`, or a
//!   patent-office pull)
//! - `filename` is the deposit name, carried unchanged across stages
//!
//! The convention is the contract between stages: a stage-producing job must
//! write its output under the **same** agency segment and the **next** stage
//! segment ([`ObjectKey::next_stage_key`]), so that the resulting creation
//! event routes to the following stage. Objects are never rewritten in place;
//! each stage produces a new key, preserving an audit trail of every
//! intermediate form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One step in the raw → clean → ids-assigned progression.
///
/// The terminal "store" work is not a stage in the key sense: its output is a
/// set of relational writes, not a new object, so the progression ends at
/// [`Stage::IdsAssigned`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// As-deposited agency files, the head of the chain.
    Raw,
    /// Output of the per-agency cleaning job.
    Clean,
    /// Output of the identifier-assignment job, input to the store job.
    IdsAssigned,
}

impl Stage {
    /// Returns the key-segment spelling of this stage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Clean => "clean",
            Self::IdsAssigned => "ids-assigned",
        }
    }

    /// Returns the stage that consumes this stage's output, if any.
    ///
    /// `IdsAssigned` is the last object-producing stage; its consumer writes
    /// to the relational sink instead of the object store.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Raw => Some(Self::Clean),
            Self::Clean => Some(Self::IdsAssigned),
            Self::IdsAssigned => None,
        }
    }

    /// All stages in pipeline order.
    #[must_use]
    pub const fn all() -> [Self; 3] {
        [Self::Raw, Self::Clean, Self::IdsAssigned]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(Self::Raw),
            "clean" => Ok(Self::Clean),
            "ids-assigned" => Ok(Self::IdsAssigned),
            other => Err(Error::InvalidInput(format!(
                "unknown stage '{other}': expected raw, clean, or ids-assigned"
            ))),
        }
    }
}

/// A parsed `{stage}/{agency}/{filename}` object key.
///
/// Parsing is strict: exactly three non-empty segments with a recognized
/// stage. Keys outside the convention (pipeline scripts, manifests, stray
/// uploads) fail to parse and are dropped by the router rather than treated
/// as pipeline inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectKey {
    stage: Stage,
    agency: String,
    filename: String,
}

impl ObjectKey {
    /// Builds a key from its parts.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKey` if the agency or filename is empty or
    /// contains a path separator.
    pub fn new(
        stage: Stage,
        agency: impl Into<String>,
        filename: impl Into<String>,
    ) -> Result<Self> {
        let agency = agency.into();
        let filename = filename.into();
        if agency.is_empty() || agency.contains('/') {
            return Err(Error::invalid_key(
                format!("{stage}/{agency}/{filename}"),
                "agency segment must be non-empty and must not contain '/'",
            ));
        }
        if filename.is_empty() || filename.contains('/') {
            return Err(Error::invalid_key(
                format!("{stage}/{agency}/{filename}"),
                "filename segment must be non-empty and must not contain '/'",
            ));
        }
        Ok(Self {
            stage,
            agency,
            filename,
        })
    }

    /// Parses a raw key string into its structured form.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKey` when the key does not have exactly three
    /// non-empty segments or the stage segment is unrecognized.
    pub fn parse(key: &str) -> Result<Self> {
        let mut parts = key.split('/');
        let (stage, agency, filename) = match (parts.next(), parts.next(), parts.next()) {
            (Some(stage), Some(agency), Some(filename)) => (stage, agency, filename),
            _ => {
                return Err(Error::invalid_key(
                    key,
                    "expected three segments: {stage}/{agency}/{filename}",
                ));
            }
        };
        if parts.next().is_some() {
            return Err(Error::invalid_key(
                key,
                "expected three segments: {stage}/{agency}/{filename}",
            ));
        }
        let stage = Stage::from_str(stage)
            .map_err(|e| Error::invalid_key(key, e.to_string()))?;
        Self::new(stage, agency, filename)
    }

    /// The stage segment.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// The agency segment.
    #[must_use]
    pub fn agency(&self) -> &str {
        &self.agency
    }

    /// The filename segment.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The key a stage-producing job must write its output to: the same
    /// agency and filename under the next stage.
    ///
    /// Returns `None` for `ids-assigned` keys, whose consumer writes to the
    /// relational sink rather than the object store.
    #[must_use]
    pub fn next_stage_key(&self) -> Option<Self> {
        self.stage.next().map(|stage| Self {
            stage,
            agency: self.agency.clone(),
            filename: self.filename.clone(),
        })
    }

    /// The `{stage}/{agency}` prefix routing rules match against.
    #[must_use]
    pub fn prefix(&self) -> String {
        format!("{}/{}", self.stage, self.agency)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.stage, self.agency, self.filename)
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.to_string()
    }
}
