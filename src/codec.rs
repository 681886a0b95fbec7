//! Byte-level encoding and decoding shared by the device adapters.
//!
//! Field extraction is lenient: a field that does not lie within the buffer
//! decodes as `0` rather than failing the whole response.

use crc16::{State, MODBUS};

/// Start byte of a JBD request frame.
pub const JBD_START: u8 = 0xDD;
/// Marks a JBD frame as a read request.
pub const JBD_READ: u8 = 0xA5;
/// Trailing byte of every JBD frame, request and response alike.
pub const JBD_END: u8 = 0x77;

/// Modbus function code for "read holding registers".
pub const MODBUS_READ_HOLDING: u8 = 0x03;

/// Extract an integer field from `buf` and scale it.
///
/// A positive `length` reads that many bytes big-endian starting at `offset`.
/// A negative `length` reads `|length|` bytes little-endian ending at (and
/// including) `offset`. The result is `value * scale` rounded to two decimals.
/// Returns `0.0` when the field does not lie entirely within `buf`.
pub fn decode_field(buf: &[u8], offset: usize, length: i32, signed: bool, scale: f64) -> f64 {
    let width = length.unsigned_abs() as usize;
    if width == 0 || width > 8 {
        return 0.0;
    }

    let range = if length > 0 {
        offset.checked_add(width).map(|end| offset..end)
    } else {
        offset
            .checked_add(1)
            .and_then(|end| end.checked_sub(width).map(|start| start..end))
    };
    let Some(bytes) = range.and_then(|r| buf.get(r)) else {
        return 0.0;
    };

    let raw = if length > 0 {
        bytes.iter().fold(0u64, |acc, &b| acc << 8 | u64::from(b))
    } else {
        bytes.iter().rev().fold(0u64, |acc, &b| acc << 8 | u64::from(b))
    };

    let value = if signed {
        let shift = 64 - width * 8;
        ((raw << shift) as i64 >> shift) as f64
    } else {
        raw as f64
    };

    round2(value * scale)
}

/// Unsigned, unscaled big-endian field.
pub fn decode_uint(buf: &[u8], offset: usize, length: i32) -> f64 {
    decode_field(buf, offset, length, false, 1.0)
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Build the 7 byte JBD read request for `opcode`.
///
/// Bytes 4 and 5 form the big-endian checksum `0x10000 - opcode`, which for a
/// request without payload reduces to `0xFF, 0xFF - (opcode - 1)`.
pub fn jbd_request(opcode: u8) -> [u8; 7] {
    [
        JBD_START,
        JBD_READ,
        opcode,
        0x00,
        0xFF,
        0xFFu8.wrapping_sub(opcode.wrapping_sub(1)),
        JBD_END,
    ]
}

/// Build an 8 byte Modbus RTU read request with its CRC trailer.
pub fn modbus_read_request(device_id: u8, function: u8, register: u16, words: u16) -> [u8; 8] {
    let [reg_hi, reg_lo] = register.to_be_bytes();
    let [words_hi, words_lo] = words.to_be_bytes();
    let head = [device_id, function, reg_hi, reg_lo, words_hi, words_lo];
    let [crc_lo, crc_hi] = crc16_modbus(&head);
    [
        head[0], head[1], head[2], head[3], head[4], head[5], crc_lo, crc_hi,
    ]
}

/// CRC-16/MODBUS of `data`, in wire order (little-endian).
pub fn crc16_modbus(data: &[u8]) -> [u8; 2] {
    State::<MODBUS>::calculate(data).to_le_bytes()
}

/// Check the trailing two byte CRC of a Modbus frame.
pub fn modbus_crc_ok(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, crc) = frame.split_at(frame.len() - 2);
    crc == crc16_modbus(body)
}

#[test]
fn test_crc_golden_vector() {
    let crc = crc16_modbus(&[0xFF, 0x03, 0x00, 0x0C, 0x00, 0x08]);
    assert_eq!(crc, [0x91, 0xD1]);
}

#[test]
fn test_crc_known_request() {
    // Request trailer captured from a li-gen BMS.
    let crc = crc16_modbus(&[0x01, 0x03, 0xd0, 0x26, 0x00, 0x19]);
    assert_eq!(crc, [0x5d, 0x0b]);
}

#[test]
fn test_modbus_read_request() {
    assert_eq!(
        modbus_read_request(0xFF, MODBUS_READ_HOLDING, 12, 8),
        [0xFF, 0x03, 0x00, 0x0C, 0x00, 0x08, 0x91, 0xD1]
    );
    assert_eq!(
        modbus_read_request(0xFF, MODBUS_READ_HOLDING, 57348, 1),
        [0xFF, 0x03, 0xE0, 0x04, 0x00, 0x01, 0xE7, 0xD5]
    );
}

#[test]
fn test_modbus_crc_ok() {
    let request = modbus_read_request(0xFF, MODBUS_READ_HOLDING, 256, 34);
    assert!(modbus_crc_ok(&request));

    let mut corrupted = request;
    corrupted[7] ^= 0x01;
    assert!(!modbus_crc_ok(&corrupted));
    assert!(!modbus_crc_ok(&[0x01, 0x02]));
}

#[test]
fn test_jbd_request() {
    assert_eq!(jbd_request(0x03), [0xDD, 0xA5, 0x03, 0x00, 0xFF, 0xFD, 0x77]);
    assert_eq!(jbd_request(0x04), [0xDD, 0xA5, 0x04, 0x00, 0xFF, 0xFC, 0x77]);
}

#[test]
fn test_decode_field_big_endian() {
    let buf = [0x00, 0x0B, 0xA7, 0x10];
    assert_eq!(decode_field(&buf, 1, 2, false, 0.1), 298.3);
    assert_eq!(decode_uint(&buf, 3, 1), 16.0);
}

#[test]
fn test_decode_field_temperature() {
    let buf = 2983u16.to_be_bytes();
    let kelvin = decode_field(&buf, 0, 2, false, 0.1);
    assert_eq!(round2(kelvin - 273.1), 25.2);
}

#[test]
fn test_decode_field_little_endian() {
    // Two bytes ending at offset 2: [0x34, 0x12] read little-endian.
    let buf = [0xAA, 0x34, 0x12, 0xBB];
    assert_eq!(decode_uint(&buf, 2, -2), 4660.0);
    // Would start before the buffer.
    assert_eq!(decode_uint(&buf, 0, -2), 0.0);
}

#[test]
fn test_decode_field_signed() {
    let buf = (-150i16).to_be_bytes();
    assert_eq!(decode_field(&buf, 0, 2, true, 0.01), -1.5);
    assert_eq!(decode_field(&buf, 0, 2, false, 0.01), 653.86);
}

#[test]
fn test_decode_field_out_of_range_is_zero() {
    let buf = [0x01, 0x02, 0x03];
    assert_eq!(decode_uint(&buf, 10, 2), 0.0);
    assert_eq!(decode_uint(&buf, 2, 2), 0.0);
    assert_eq!(decode_uint(&buf, usize::MAX, 2), 0.0);
    assert_eq!(decode_uint(&[], 0, 1), 0.0);
    assert_eq!(decode_uint(&buf, 0, 0), 0.0);
}
