//! Serializable machine snapshots.
//!
//! A [`MachineSnapshot`] is a complete, self-contained image of a [`Machine`]: its states with
//! their original handles, the transition structure, the cursor, the equivalence classes at
//! capture time and optionally the runtime counters. Snapshots encode to JSON with a stable
//! field order, so they diff cleanly and can be inspected by hand. Restoring validates the
//! image before a machine is built, a snapshot that refers to states it does not contain is
//! rejected instead of producing a machine with dangling transitions.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::prelude::*;

/// The snapshot format version this build writes and the only one it accepts.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Why a snapshot could not be decoded or restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The snapshot was written by an incompatible format version.
    UnsupportedVersion(u32),
    /// The snapshot declares an initial state it does not contain.
    MissingInitial(StateId),
    /// A recorded transition points at a state the snapshot does not contain.
    DanglingTransition {
        /// The source state of the offending transition.
        state: StateId,
        /// The label of the offending transition.
        label: Label,
        /// The target handle that is missing from the snapshot.
        target: StateId,
    },
    /// The snapshot could not be encoded to or decoded from JSON.
    Serde(String),
    /// The snapshot file could not be read or written.
    Io(String),
}

impl Display for SnapshotError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::UnsupportedVersion(version) => write!(
                f,
                "snapshot version {version} is not supported, this build reads version {SNAPSHOT_VERSION}"
            ),
            SnapshotError::MissingInitial(id) => write!(
                f,
                "snapshot declares q{id} as initial but does not contain that state"
            ),
            SnapshotError::DanglingTransition {
                state,
                label,
                target,
            } => write!(
                f,
                "transition (q{state}, `{label}`) points at q{target} which is not in the snapshot"
            ),
            SnapshotError::Serde(message) => write!(f, "snapshot encoding failed: {message}"),
            SnapshotError::Io(message) => write!(f, "snapshot file access failed: {message}"),
        }
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(error: serde_json::Error) -> Self {
        SnapshotError::Serde(error.to_string())
    }
}

impl From<std::io::Error> for SnapshotError {
    fn from(error: std::io::Error) -> Self {
        SnapshotError::Io(error.to_string())
    }
}

/// One state as recorded in a snapshot. Transitions are held in a sorted map so the encoded
/// form is stable across captures of the same machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord<P> {
    /// The handle the state had when the snapshot was taken.
    pub id: StateId,
    /// The payload of the state.
    pub payload: P,
    /// The outgoing transitions by label.
    pub transitions: BTreeMap<Label, StateId>,
}

/// A complete image of a machine together with its classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot<P> {
    /// The format version, always [`SNAPSHOT_VERSION`] for captures made by this build.
    pub version: u32,
    /// The handle of the initial state.
    pub initial: StateId,
    /// Where the cursor pointed when the snapshot was taken.
    pub current: Option<StateId>,
    /// All states, ordered by handle.
    pub states: Vec<StateRecord<P>>,
    /// The equivalence class of every state at capture time.
    pub classes: BTreeMap<StateId, ClassId>,
    /// Runtime counters at capture time, if the snapshot was taken through a runtime.
    pub summary: Option<StatsSnapshot>,
}

impl<P: Payload> MachineSnapshot<P> {
    /// Captures `machine` together with its classification. Pass the runtime counters along
    /// when the snapshot is taken from a live [`crate::runtime::Runtime`].
    pub fn capture(
        machine: &Machine<P>,
        classes: &ClassMap<StateId>,
        summary: Option<StatsSnapshot>,
    ) -> Self {
        let mut states: Vec<StateRecord<P>> = machine
            .states()
            .map(|state| StateRecord {
                id: state.id(),
                payload: state.payload().clone(),
                transitions: state.transitions().map(|(l, t)| (l.clone(), t)).collect(),
            })
            .collect();
        states.sort_by_key(|record| record.id);
        Self {
            version: SNAPSHOT_VERSION,
            initial: machine.initial(),
            current: machine.current(),
            states,
            classes: classes.assignments().collect(),
            summary,
        }
    }

    /// Rebuilds the machine, keeping the handles it was captured with.
    ///
    /// The image is validated first: the version must match, the initial state must be
    /// present and every transition must point at a recorded state. A cursor pointing
    /// outside the snapshot is not fatal, the restored machine starts at its initial state
    /// instead.
    pub fn restore(&self) -> Result<Machine<P>, SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(self.version));
        }
        if !self.states.iter().any(|record| record.id == self.initial) {
            return Err(SnapshotError::MissingInitial(self.initial));
        }

        let mut machine = Machine::shell(self.initial);
        for record in &self.states {
            machine.insert_raw(record.id, record.payload.clone());
        }
        for record in &self.states {
            for (label, target) in &record.transitions {
                if !machine.contains_state(*target) {
                    return Err(SnapshotError::DanglingTransition {
                        state: record.id,
                        label: label.clone(),
                        target: *target,
                    });
                }
                machine.add_transition(record.id, label.clone(), *target);
            }
        }
        match self.current {
            Some(current) if machine.contains_state(current) => {
                machine.set_current(current);
            }
            Some(current) => {
                warn!("snapshot cursor q{current} is not part of the image, restarting");
                machine.restart();
            }
            None => machine.clear_current(),
        }
        debug!(
            "restored a machine with {} states and {} transitions",
            machine.state_count(),
            machine.transition_count()
        );
        Ok(machine)
    }

    /// Encodes the snapshot as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, SnapshotError>
    where
        P: Serialize,
    {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decodes a snapshot from JSON. This only checks that the document is well formed,
    /// structural validation happens in [`MachineSnapshot::restore`].
    pub fn from_json(json: &str) -> Result<Self, SnapshotError>
    where
        P: DeserializeOwned,
    {
        Ok(serde_json::from_str(json)?)
    }

    /// Writes the snapshot to the file at `path`, creating or truncating it.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError>
    where
        P: Serialize,
    {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Reads a snapshot from the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError>
    where
        P: DeserializeOwned,
    {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
