use std::fmt;
use std::ops::Deref;

/// A single request in a plan.
///
/// `code` is the JBD opcode or the first Modbus register, depending on the
/// device family. `words` is the number of 16 bit registers the response
/// carries; JBD requests ignore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub code: u16,
    pub words: u16,
    pub name: &'static str,
}

impl CommandSpec {
    pub const fn new(code: u16, words: u16, name: &'static str) -> Self {
        Self { code, words, name }
    }
}

/// An ordered list of requests. Executed front to back, never reordered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandPlan(Vec<CommandSpec>);

impl CommandPlan {
    pub fn new(commands: Vec<CommandSpec>) -> Self {
        Self(commands)
    }
}

impl Deref for CommandPlan {
    type Target = [CommandSpec];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<CommandSpec> for CommandPlan {
    fn from_iter<I: IntoIterator<Item = CommandSpec>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Encoded bytes of one request, ready to be written to the radio.
#[derive(Clone, PartialEq, Eq)]
pub struct RequestFrame(Box<[u8]>);

impl RequestFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for RequestFrame {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Debug for RequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestFrame({})", hex::encode(&self.0))
    }
}

/// What a completed response frame contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// JBD basic information: pack voltage, current, capacity, temperatures.
    BatteryMetrics,
    /// JBD per-cell voltages.
    CellVoltages,
    /// Rover model string.
    DeviceInfo,
    /// Rover Modbus device address.
    DeviceAddress,
    /// Rover live charging data.
    ChargingInfo,
    /// Rover configured battery chemistry.
    BatteryType,
}

/// A response recognised as whole, tagged with the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFrame {
    pub command: CommandSpec,
    pub kind: FrameKind,
    pub bytes: Vec<u8>,
}

#[test]
fn test_plan_preserves_order() {
    let plan: CommandPlan = [
        CommandSpec::new(256, 34, "charging_info"),
        CommandSpec::new(12, 8, "device_info"),
    ]
    .into_iter()
    .collect();
    let codes: Vec<u16> = plan.iter().map(|c| c.code).collect();
    assert_eq!(codes, vec![256, 12]);
    assert_eq!(plan.len(), 2);
}

#[test]
fn test_request_frame_debug_is_hex() {
    let frame = RequestFrame::from(&[0xDD, 0xA5, 0x03][..]);
    assert_eq!(format!("{frame:?}"), "RequestFrame(dda503)");
}
