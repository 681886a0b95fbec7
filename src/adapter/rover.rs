//! Renogy Rover solar charge controllers, reached through a BT-1/BT-2 module.
//!
//! Requests are Modbus RTU "read holding registers" frames. A response is
//!
//! Offset | Length | Meaning
//! 0      | 1      | Device id
//! 1      | 1      | Function code
//! 2      | 1      | Byte count, `2 * words`
//! 3      | 2*words| Register values, big-endian
//! 3+2w   | 2      | CRC-16/MODBUS
//!
//! The response does not name the register it answers, so it is matched to
//! the request awaiting it by length.

use bluest::Uuid;

use super::{AdapterKind, Characteristics, Classification, DeviceAdapter};
use crate::codec::{self, decode_field, decode_uint, MODBUS_READ_HOLDING};
use crate::command::{CommandPlan, CommandSpec, FrameKind, RequestFrame};
use crate::error::{Error, Result};
use crate::telemetry::{ChargeControllerTelemetry, TelemetrySource};

pub const REG_DEVICE_INFO: u16 = 12;
pub const REG_DEVICE_ADDRESS: u16 = 26;
pub const REG_CHARGING_INFO: u16 = 256;
pub const REG_BATTERY_TYPE: u16 = 57348;

const NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
const WRITE_UUID: Uuid = Uuid::from_u128(0x0000ffd1_0000_1000_8000_00805f9b34fb);

const DEVICE_ID: u8 = 0xFF;
// Device id, function code, byte count and CRC.
const FRAME_OVERHEAD: usize = 5;
const EXCEPTION_LEN: usize = 5;

const CHARGING_STATE: [&str; 7] = [
    "deactivated",
    "activated",
    "mppt",
    "equalizing",
    "boost",
    "floating",
    "current limiting",
];

const LOAD_STATE: [&str; 2] = ["off", "on"];

// Indexed from 1.
const BATTERY_TYPE: [&str; 5] = ["open", "sealed", "gel", "lithium", "custom"];

/// Byte length of a response carrying `words` registers.
pub fn expected_len(words: u16) -> usize {
    usize::from(words) * 2 + FRAME_OVERHEAD
}

#[derive(Debug, Default)]
pub struct RenogyRover {
    telemetry: ChargeControllerTelemetry,
}

impl RenogyRover {
    pub fn controller(&self) -> &ChargeControllerTelemetry {
        &self.telemetry
    }

    fn parse_device_info(&mut self, frame: &[u8]) {
        let end = frame.len().min(17);
        let model = frame.get(3..end).unwrap_or_default();
        let model = String::from_utf8_lossy(model);
        let model = model.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        if !model.is_empty() {
            self.telemetry.model = Some(model.to_string());
        }
    }

    fn parse_device_address(&mut self, frame: &[u8]) {
        self.telemetry.device_address = Some(decode_uint(frame, 4, 1) as u8);
    }

    fn parse_charging_info(&mut self, frame: &[u8]) {
        let t = &mut self.telemetry;

        t.battery.state_of_charge = Some(decode_uint(frame, 3, 2));
        t.battery.voltage = Some(decode_field(frame, 5, 2, false, 0.1));
        t.battery.current = Some(decode_field(frame, 7, 2, false, 0.01));
        t.controller_temperature = Some(decode_uint(frame, 9, 1));
        t.battery.temperature = Some(decode_uint(frame, 10, 1));

        t.load.voltage = Some(decode_field(frame, 11, 2, false, 0.1));
        t.load.current = Some(decode_field(frame, 13, 2, false, 0.01));
        t.load.power = Some(decode_uint(frame, 15, 2));
        t.load.status = LOAD_STATE.get(decode_uint(frame, 67, 1) as usize >> 7).copied();

        t.photovoltaic.voltage = Some(decode_field(frame, 17, 2, false, 0.1));
        t.photovoltaic.current = Some(decode_field(frame, 19, 2, false, 0.01));
        t.photovoltaic.power = Some(decode_uint(frame, 21, 2));

        t.statistics.max_charging_power_today = Some(decode_uint(frame, 33, 2));
        t.statistics.max_discharging_power_today = Some(decode_uint(frame, 35, 2));
        t.statistics.charging_amp_hours_today = Some(decode_uint(frame, 37, 2));
        t.statistics.discharging_amp_hours_today = Some(decode_uint(frame, 39, 2));
        t.statistics.power_generation_today = Some(decode_uint(frame, 41, 2));
        t.statistics.power_consumption_today = Some(decode_uint(frame, 43, 2));
        t.statistics.power_generation_total = Some(decode_uint(frame, 59, 4));

        t.charging_status = CHARGING_STATE.get(decode_uint(frame, 68, 1) as usize).copied();
    }

    fn parse_battery_type(&mut self, frame: &[u8]) {
        let code = decode_uint(frame, 3, 2) as usize;
        self.telemetry.battery.battery_type = code
            .checked_sub(1)
            .and_then(|i| BATTERY_TYPE.get(i))
            .copied();
    }
}

impl DeviceAdapter for RenogyRover {
    fn kind(&self) -> AdapterKind {
        AdapterKind::RenogyRover
    }

    fn characteristics(&self) -> Characteristics {
        Characteristics {
            notify: NOTIFY_UUID,
            write: WRITE_UUID,
        }
    }

    fn default_plan(&self) -> CommandPlan {
        CommandPlan::new(vec![
            CommandSpec::new(REG_DEVICE_INFO, 8, "device_info"),
            CommandSpec::new(REG_CHARGING_INFO, 34, "charging_info"),
            CommandSpec::new(REG_BATTERY_TYPE, 1, "battery_type"),
        ])
    }

    fn encode(&self, command: &CommandSpec) -> Result<RequestFrame> {
        if command.words == 0 {
            return Err(Error::InvalidCommand(format!(
                "{}: a register read needs at least one word",
                command.name
            )));
        }
        let frame = codec::modbus_read_request(
            DEVICE_ID,
            MODBUS_READ_HOLDING,
            command.code,
            command.words,
        );
        Ok(RequestFrame::from(&frame[..]))
    }

    fn classify(&self, buffer: &[u8], pending: &CommandSpec) -> Result<Classification> {
        if buffer.len() == EXCEPTION_LEN
            && buffer[1] == MODBUS_READ_HOLDING | 0x80
            && codec::modbus_crc_ok(buffer)
        {
            return Err(Error::MalformedResponse(format!(
                "{}: controller returned exception code {:#04x}",
                pending.name, buffer[2]
            )));
        }

        let expected = expected_len(pending.words);
        if buffer.len() < expected {
            return Ok(Classification::Incomplete);
        }
        if buffer.len() > expected {
            return Err(Error::MalformedResponse(format!(
                "{}: {} bytes received, expected {expected}",
                pending.name,
                buffer.len()
            )));
        }
        if !codec::modbus_crc_ok(buffer) {
            return Err(Error::MalformedResponse(format!(
                "{}: CRC check failed",
                pending.name
            )));
        }

        let kind = match pending.code {
            REG_DEVICE_INFO => FrameKind::DeviceInfo,
            REG_DEVICE_ADDRESS => FrameKind::DeviceAddress,
            REG_CHARGING_INFO => FrameKind::ChargingInfo,
            REG_BATTERY_TYPE => FrameKind::BatteryType,
            other => {
                return Err(Error::MalformedResponse(format!(
                    "no decoder for register {other}"
                )))
            }
        };
        Ok(Classification::Complete(kind))
    }

    fn decode(&mut self, kind: FrameKind, frame: &[u8]) {
        match kind {
            FrameKind::DeviceInfo => self.parse_device_info(frame),
            FrameKind::DeviceAddress => self.parse_device_address(frame),
            FrameKind::ChargingInfo => self.parse_charging_info(frame),
            FrameKind::BatteryType => self.parse_battery_type(frame),
            _ => {}
        }
    }

    fn telemetry(&self) -> &dyn TelemetrySource {
        &self.telemetry
    }
}
