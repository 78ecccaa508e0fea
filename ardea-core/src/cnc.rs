//! Command-and-control payloads.
//!
//! The 40-byte CNC payload rides the SPI link in both directions and is also
//! handed verbatim to the main board's local peripheral dispatcher. The
//! original firmware overlaid a C union on the value region; here the wire
//! form is explicit and writes go through [`CncValue`], which zeroes the
//! unused tail so the frame CRC is deterministic.

use crate::link::{ShortResponse, PAYLOAD_SIZE};
use heapless::String;
use num_enum::TryFromPrimitive;

/// Bytes of the value region after the header and result word.
pub const VALUE_SIZE: usize = 28;

/// `result` placeholder set on outgoing requests; any response must
/// overwrite it.
pub const RESULT_UNSET: u32 = 0xFF;

/// Peripheral selector. Most address sensor-board hardware; `Mcu`, `Fan`,
/// `Dbg` and `Power` are also served locally when the destination is the
/// main board.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum Peripheral {
    Nop = 0,
    Dac0Excitation,
    Dac0Compensation,
    Dac1Excitation,
    Dac1Compensation,
    Dds0A,
    Dds0B,
    Dds0C,
    Dds1A,
    Dds1B,
    Dds1C,
    Adc,
    Imu0,
    Imu1,
    Mcu,
    Gpio,
    Eeprom,
    TestMsg,
    Fan,
    Log,
    Dbg,
    Power,
}

pub const PERIPHERAL_COUNT: usize = 22;

impl Peripheral {
    /// Control-plane name, also used when enumerating `allowed` values.
    pub fn name(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::Dac0Excitation => "DAC_0_EXCITATION",
            Self::Dac0Compensation => "DAC_0_COMPENSATION",
            Self::Dac1Excitation => "DAC_1_EXCITATION",
            Self::Dac1Compensation => "DAC_1_COMPENSATION",
            Self::Dds0A => "DDS0_A",
            Self::Dds0B => "DDS0_B",
            Self::Dds0C => "DDS0_C",
            Self::Dds1A => "DDS1_A",
            Self::Dds1B => "DDS1_B",
            Self::Dds1C => "DDS1_C",
            Self::Adc => "ADC",
            Self::Imu0 => "IMU0",
            Self::Imu1 => "IMU1",
            Self::Mcu => "MCU",
            Self::Gpio => "GPIO",
            Self::Eeprom => "EEPROM",
            Self::TestMsg => "TEST_MSG",
            Self::Fan => "FAN",
            Self::Log => "LOG",
            Self::Dbg => "DBG",
            Self::Power => "POWER",
        }
    }

    pub fn all() -> impl Iterator<Item = Peripheral> {
        (0..PERIPHERAL_COUNT as u8).filter_map(|v| Peripheral::try_from(v).ok())
    }

    /// Case-insensitive lookup by control-plane name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().find(|p| p.name().eq_ignore_ascii_case(name))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum CncAction {
    Read = 0,
    Write = 1,
    /// Stage a large diagnostic read; `result_or_size` returns the byte
    /// count of the follow-up transfer.
    ReadLargeBuffer = 2,
}

impl CncAction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::ReadLargeBuffer => "READ_LARGE_BUFFER",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [Self::Read, Self::Write, Self::ReadLargeBuffer]
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(name))
    }
}

/// A typed value for the write path. Exactly one variant occupies the
/// 28-byte value region; the rest is zeroed.
#[derive(Clone, PartialEq, Debug)]
pub enum CncValue {
    None,
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    Str(String<VALUE_SIZE>),
}

impl CncValue {
    pub fn str(s: &str) -> Option<Self> {
        String::try_from(s).ok().map(Self::Str)
    }

    fn fill(&self, out: &mut [u8; VALUE_SIZE]) {
        *out = [0; VALUE_SIZE];
        match self {
            Self::None => {}
            Self::U32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Self::I32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Self::F32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Self::Bool(v) => out[0] = *v as u8,
            Self::Str(s) => out[..s.len()].copy_from_slice(s.as_bytes()),
        }
    }
}

/// The 40-byte CNC payload in wire order: an 8-byte header (peripheral,
/// action, short id, address), the result-or-size word, then the value
/// region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CncWirePayload {
    pub peripheral: u8,
    pub action: u8,
    pub short_id: u16,
    pub addr: u32,
    pub result_or_size: u32,
    pub value: [u8; VALUE_SIZE],
}

impl Default for CncWirePayload {
    fn default() -> Self {
        Self {
            peripheral: Peripheral::Nop as u8,
            action: CncAction::Read as u8,
            short_id: 0,
            addr: 0,
            result_or_size: 0,
            value: [0; VALUE_SIZE],
        }
    }
}

impl CncWirePayload {
    pub fn request(peripheral: Peripheral, action: CncAction, addr: u32, value: CncValue) -> Self {
        let mut region = [0u8; VALUE_SIZE];
        value.fill(&mut region);
        Self {
            peripheral: peripheral as u8,
            action: action as u8,
            short_id: 0,
            addr,
            result_or_size: RESULT_UNSET,
            value: region,
        }
    }

    pub fn to_bytes(&self) -> [u8; PAYLOAD_SIZE] {
        let mut out = [0u8; PAYLOAD_SIZE];
        out[0] = self.peripheral;
        out[1] = self.action;
        out[2..4].copy_from_slice(&self.short_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.result_or_size.to_le_bytes());
        out[12..40].copy_from_slice(&self.value);
        out
    }

    pub fn from_bytes(bytes: &[u8; PAYLOAD_SIZE]) -> Self {
        let mut value = [0u8; VALUE_SIZE];
        value.copy_from_slice(&bytes[12..40]);
        Self {
            peripheral: bytes[0],
            action: bytes[1],
            short_id: u16::from_le_bytes([bytes[2], bytes[3]]),
            addr: u32::from_le_bytes(bytes[4..8].try_into().unwrap_or([0; 4])),
            result_or_size: u32::from_le_bytes(bytes[8..12].try_into().unwrap_or([0; 4])),
            value,
        }
    }

    pub fn value_u32(&self) -> u32 {
        u32::from_le_bytes(self.value[..4].try_into().unwrap_or([0; 4]))
    }

    pub fn value_i32(&self) -> i32 {
        self.value_u32() as i32
    }

    pub fn value_f32(&self) -> f32 {
        f32::from_le_bytes(self.value[..4].try_into().unwrap_or([0; 4]))
    }

    pub fn value_bool(&self) -> bool {
        self.value[0] != 0
    }

    /// The value region as a NUL-terminated string, lossy on non-UTF8.
    pub fn value_str(&self) -> &str {
        let end = self
            .value
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(VALUE_SIZE);
        core::str::from_utf8(&self.value[..end]).unwrap_or("")
    }

    pub fn set_value(&mut self, value: CncValue) {
        value.fill(&mut self.value);
    }

    pub fn set_str(&mut self, s: &str) {
        self.value = [0; VALUE_SIZE];
        let n = s.len().min(VALUE_SIZE);
        self.value[..n].copy_from_slice(&s.as_bytes()[..n]);
    }
}

/// Response to one accepted CNC request, as seen by the caller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CncReply {
    pub payload: CncWirePayload,
    pub short: ShortResponse,
}

/// Terminal result of a CNC request. Exactly one of these is delivered for
/// every request the router accepts.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum CncOutcome {
    Ok(CncReply),
    /// The response arrived under a key other than the one reserved; the
    /// payload is still delivered, flagged, and the caller decides.
    Mismatch(CncReply),
    /// The board answered with a non-zero result code.
    DeviceReported { code: u32, reply: CncReply },
    Timeout,
}

impl CncOutcome {
    /// Fold the in-payload result code into the outcome, as done at the
    /// router boundary before handing the reply to a caller.
    pub fn normalized(self) -> Self {
        match self {
            Self::Ok(reply) if reply.payload.result_or_size != 0 => Self::DeviceReported {
                code: reply.payload.result_or_size,
                reply,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let req = CncWirePayload::request(
            Peripheral::Adc,
            CncAction::Write,
            0x20,
            CncValue::U32(0xDEAD_BEEF),
        );
        let decoded = CncWirePayload::from_bytes(&req.to_bytes());
        assert_eq!(decoded, req);
        assert_eq!(decoded.value_u32(), 0xDEAD_BEEF);
        assert_eq!(decoded.result_or_size, RESULT_UNSET);
    }

    #[test]
    fn unused_tail_is_zeroed() {
        // Re-encoding a payload whose region previously held a long string
        // must not leak stale bytes past the new value.
        let mut p = CncWirePayload::request(
            Peripheral::Mcu,
            CncAction::Write,
            1,
            CncValue::str("abcdefghijklmnopqrstuvwx").unwrap(),
        );
        p.set_value(CncValue::Bool(true));
        let bytes = p.to_bytes();
        assert_eq!(bytes[12], 1);
        assert!(bytes[13..40].iter().all(|&b| b == 0));
    }

    #[test]
    fn string_value_round_trip() {
        let p = CncWirePayload::request(
            Peripheral::Mcu,
            CncAction::Write,
            0,
            CncValue::str("SN-0042").unwrap(),
        );
        assert_eq!(p.value_str(), "SN-0042");
        // 29 chars exceeds the region
        assert!(CncValue::str("0123456789012345678901234567x").is_none());
    }

    #[test]
    fn peripheral_names_round_trip() {
        for p in Peripheral::all() {
            assert_eq!(Peripheral::from_name(p.name()), Some(p));
        }
        assert_eq!(Peripheral::from_name("power"), Some(Peripheral::Power));
        assert_eq!(Peripheral::from_name("bogus"), None);
    }

    #[test]
    fn nonzero_result_normalizes_to_device_reported() {
        let mut payload = CncWirePayload::default();
        payload.result_or_size = 3;
        let reply = CncReply {
            payload,
            short: ShortResponse::NONE,
        };
        match CncOutcome::Ok(reply).normalized() {
            CncOutcome::DeviceReported { code, .. } => assert_eq!(code, 3),
            other => panic!("unexpected {other:?}"),
        }
    }
}
