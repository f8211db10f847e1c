//! Generation lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a cache generation
///
/// `Installing -> Current -> Stale -> deleted`. A generation only leaves
/// `Current` when another one takes its place.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    /// Base resources are being seeded
    Installing,
    /// Serving traffic
    Current,
    /// Superseded, pending deletion by the next activate
    Stale,
}

impl GenerationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationState::Installing => "installing",
            GenerationState::Current => "current",
            GenerationState::Stale => "stale",
        }
    }
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one generation
#[derive(Debug, Clone, Serialize)]
pub struct GenerationInfo {
    pub name: String,
    pub state: GenerationState,
    pub entries: usize,
}
