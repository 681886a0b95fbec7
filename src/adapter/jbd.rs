//! JBD battery management systems.
//!
//! Response frame layout:
//!
//! Offset | Length | Meaning
//! 0      | 1      | Start byte 0xDD
//! 1      | 1      | Opcode being answered
//! 2      | 1      | Status, 0x00 on success
//! 3      | 1      | Payload length `n`
//! 4      | n      | Payload
//! 4+n    | 2      | Checksum
//! 6+n    | 1      | End byte 0x77

use bluest::Uuid;

use super::{AdapterKind, Characteristics, Classification, DeviceAdapter};
use crate::codec::{self, decode_field, decode_uint, round2, JBD_END, JBD_START};
use crate::command::{CommandPlan, CommandSpec, FrameKind, RequestFrame};
use crate::error::{Error, Result};
use crate::telemetry::{BatteryTelemetry, MosfetStatus, TelemetrySource};

pub const OP_BASIC_INFO: u16 = 0x03;
pub const OP_CELL_VOLTAGES: u16 = 0x04;

const NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb);
const WRITE_UUID: Uuid = Uuid::from_u128(0x0000ff02_0000_1000_8000_00805f9b34fb);

// Header, checksum and end byte around the payload.
const FRAME_OVERHEAD: usize = 7;
const KELVIN_OFFSET: f64 = 273.1;

#[derive(Debug, Default)]
pub struct JbdBms {
    telemetry: BatteryTelemetry,
}

impl JbdBms {
    pub fn battery(&self) -> &BatteryTelemetry {
        &self.telemetry
    }

    fn parse_metrics(&mut self, frame: &[u8]) {
        let t = &mut self.telemetry;

        let voltage = decode_field(frame, 4, 2, false, 0.01);
        // The BMS reports charge current as positive.
        let current = 0.0 - decode_field(frame, 6, 2, true, 0.01);
        let mos = decode_uint(frame, 24, 1) as u8;
        let num_cell = decode_uint(frame, 25, 1) as u32;
        let num_temp = decode_uint(frame, 26, 1) as usize;

        t.voltage.total = Some(voltage);
        t.current_load = Some(current);
        t.power_load = Some(round2(current * voltage));
        t.capacity.remaining = Some(decode_field(frame, 8, 2, false, 0.01));
        t.capacity.total = Some(decode_field(frame, 10, 2, false, 0.01));
        t.cycles_count = Some(decode_uint(frame, 12, 2) as u32);
        t.state_of_charge = Some(decode_uint(frame, 23, 1));
        t.mosfet = Some(MosfetStatus {
            charging: mos & 0b01 != 0,
            discharging: mos & 0b10 != 0,
        });
        if num_cell > 0 {
            t.cells_count = Some(num_cell);
        }
        t.temperatures = Some(
            (0..num_temp)
                .map(|i| round2(decode_field(frame, 27 + i * 2, 2, false, 0.1) - KELVIN_OFFSET))
                .collect(),
        );
    }

    fn parse_cell_voltages(&mut self, frame: &[u8]) {
        let num_cell = decode_uint(frame, 3, 1) as usize / 2;
        let cells = (0..num_cell)
            .map(|i| decode_uint(frame, 4 + i * 2, 2))
            .collect();

        self.telemetry.voltage.cells = Some(cells);
        if num_cell > 0 {
            self.telemetry.cells_count = Some(num_cell as u32);
        }
    }
}

impl DeviceAdapter for JbdBms {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Jbd
    }

    fn characteristics(&self) -> Characteristics {
        Characteristics {
            notify: NOTIFY_UUID,
            write: WRITE_UUID,
        }
    }

    fn default_plan(&self) -> CommandPlan {
        CommandPlan::new(vec![
            CommandSpec::new(OP_BASIC_INFO, 0, "basic_info"),
            CommandSpec::new(OP_CELL_VOLTAGES, 0, "cell_voltages"),
        ])
    }

    fn encode(&self, command: &CommandSpec) -> Result<RequestFrame> {
        let opcode = u8::try_from(command.code).map_err(|_| {
            Error::InvalidCommand(format!(
                "{}: JBD opcode {:#06x} does not fit in one byte",
                command.name, command.code
            ))
        })?;
        Ok(RequestFrame::from(&codec::jbd_request(opcode)[..]))
    }

    fn classify(&self, buffer: &[u8], pending: &CommandSpec) -> Result<Classification> {
        if buffer.last() != Some(&JBD_END) || buffer.len() < FRAME_OVERHEAD {
            return Ok(Classification::Incomplete);
        }
        if buffer[0] != JBD_START {
            return Err(Error::MalformedResponse(format!(
                "unexpected start byte {:#04x}",
                buffer[0]
            )));
        }

        // 0x77 can also occur inside the payload.
        let declared = usize::from(buffer[3]) + FRAME_OVERHEAD;
        if buffer.len() < declared {
            return Ok(Classification::Incomplete);
        }
        if buffer.len() > declared {
            return Err(Error::MalformedResponse(format!(
                "frame is {} bytes, header declares {declared}",
                buffer.len()
            )));
        }

        if buffer[2] != 0x00 {
            return Err(Error::MalformedResponse(format!(
                "BMS reported status {:#04x}",
                buffer[2]
            )));
        }

        let opcode = u16::from(buffer[1]);
        if opcode != pending.code {
            return Err(Error::MalformedResponse(format!(
                "response to opcode {opcode:#04x} while awaiting {:#04x}",
                pending.code
            )));
        }

        match opcode {
            OP_BASIC_INFO => Ok(Classification::Complete(FrameKind::BatteryMetrics)),
            OP_CELL_VOLTAGES => Ok(Classification::Complete(FrameKind::CellVoltages)),
            other => Err(Error::MalformedResponse(format!(
                "unrecognized opcode {other:#04x}"
            ))),
        }
    }

    fn decode(&mut self, kind: FrameKind, frame: &[u8]) {
        match kind {
            FrameKind::BatteryMetrics => self.parse_metrics(frame),
            FrameKind::CellVoltages => self.parse_cell_voltages(frame),
            _ => {}
        }
    }

    fn telemetry(&self) -> &dyn TelemetrySource {
        &self.telemetry
    }
}
