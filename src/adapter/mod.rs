//! Device families.
//!
//! An adapter knows how to turn a [`CommandSpec`] into request bytes, when an
//! accumulated notification buffer holds a whole response, and how to decode
//! that response into its telemetry document. It knows nothing about the
//! radio; the session hands it bytes.

use std::fmt;
use std::str::FromStr;

use bluest::Uuid;

use crate::command::{CommandPlan, CommandSpec, FrameKind, RequestFrame};
use crate::error::{Error, Result};
use crate::telemetry::TelemetrySource;

pub mod jbd;
pub mod rover;

pub use jbd::JbdBms;
pub use rover::RenogyRover;

/// The notify and write characteristics a family talks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Characteristics {
    pub notify: Uuid,
    pub write: Uuid,
}

/// Whether a response buffer holds a whole frame yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Incomplete,
    Complete(FrameKind),
}

pub trait DeviceAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    fn characteristics(&self) -> Characteristics;

    /// The requests issued when the caller does not supply a plan.
    fn default_plan(&self) -> CommandPlan;

    fn encode(&self, command: &CommandSpec) -> Result<RequestFrame>;

    fn encode_plan(&self, plan: &CommandPlan) -> Result<Vec<RequestFrame>> {
        plan.iter().map(|command| self.encode(command)).collect()
    }

    /// Decide whether `buffer` is a complete response to `pending`.
    ///
    /// Returns an error when the buffer can never become a valid response.
    fn classify(&self, buffer: &[u8], pending: &CommandSpec) -> Result<Classification>;

    /// Fold a completed frame into the telemetry document.
    fn decode(&mut self, kind: FrameKind, frame: &[u8]);

    fn telemetry(&self) -> &dyn TelemetrySource;
}

/// Supported device families, by the name used on the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    RenogyRover,
    Jbd,
}

impl AdapterKind {
    pub fn create(self) -> Box<dyn DeviceAdapter> {
        match self {
            AdapterKind::RenogyRover => Box::new(RenogyRover::default()),
            AdapterKind::Jbd => Box::new(JbdBms::default()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AdapterKind::RenogyRover => "renogy_rover",
            AdapterKind::Jbd => "jbd",
        }
    }
}

impl FromStr for AdapterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "renogy_rover" => Ok(AdapterKind::RenogyRover),
            "jbd" => Ok(AdapterKind::Jbd),
            other => Err(Error::UnsupportedAdapter(other.to_string())),
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[test]
fn test_adapter_kind_from_str() {
    assert_eq!("jbd".parse::<AdapterKind>().ok(), Some(AdapterKind::Jbd));
    assert_eq!(
        "renogy_rover".parse::<AdapterKind>().ok(),
        Some(AdapterKind::RenogyRover)
    );
    assert!(matches!(
        "victron".parse::<AdapterKind>(),
        Err(Error::UnsupportedAdapter(name)) if name == "victron"
    ));
}

#[test]
fn test_encode_plan_one_frame_per_command() {
    let adapter = AdapterKind::RenogyRover.create();
    let plan = adapter.default_plan();
    let frames = adapter.encode_plan(&plan).unwrap();
    assert_eq!(frames.len(), plan.len());
}
