//! SPI link-frame codec.
//!
//! Every bus tick exchanges one fixed 48-byte frame with the addressed
//! board, full duplex: command byte, `xinfo` (sensor UID on data frames,
//! match key on CNC), an inline short-command response, a 40-byte payload
//! and a trailing CRC16 over everything before it.
//!
//! The `CMD_SHORT_RESPONSE` high bit a board may OR into `STREAM_SENSOR`
//! is folded into [`Inbound::SensorWithShortAck`] here and never leaks
//! above the link layer.

use crate::cnc::CncWirePayload;
use crate::crc16::{crc16_ccitt, INITIAL_CRC16_CCITT};
use num_enum::TryFromPrimitive;

/// Total frame size on the wire, CRC included.
pub const FRAME_SIZE: usize = 48;

/// Payload bytes carried by every frame.
pub const PAYLOAD_SIZE: usize = 40;

/// High bit of the command byte: the frame also carries a short CNC ack.
pub const CMD_SHORT_RESPONSE: u8 = 0x80;

/// `cmd_uid` value meaning "no short response in this frame".
pub const CMD_UID_DONT_CARE: u16 = 0;

/// Short-response result codes.
pub const RESULT_NO_ERROR: u16 = 0;
pub const RESULT_VALUE_ERROR: u16 = 0xFE;
pub const RESULT_UNKNOWN_COMMAND: u16 = 0xFF;

/// Base command byte values (short-response bit masked off).
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum SpiCmd {
    Nop = 0,
    Trigger = 1,
    StreamSensor = 2,
    Cnc = 3,
    CncShort = 4,
    RespCnc = 5,
    DdsTrig = 6,
}

/// Inline acknowledgment of a short CNC command, riding a sensor frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ShortResponse {
    pub cmd_uid: u16,
    pub cmd_result: u16,
}

impl ShortResponse {
    pub const NONE: Self = Self {
        cmd_uid: CMD_UID_DONT_CARE,
        cmd_result: RESULT_UNKNOWN_COMMAND,
    };

    pub fn is_present(&self) -> bool {
        self.cmd_uid != CMD_UID_DONT_CARE
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkError {
    /// CRC over the first 46 bytes did not match the trailer.
    Crc { expected: u16, got: u16 },
    /// Command byte (short-ack bit masked) is not in the command set.
    UnknownCmd(u8),
}

/// One frame, either direction, in decoded form.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Frame {
    pub cmd: SpiCmd,
    /// Set when the command byte carried `CMD_SHORT_RESPONSE`.
    pub short_ack: bool,
    pub xinfo: u8,
    pub short: ShortResponse,
    pub payload: [u8; PAYLOAD_SIZE],
}

impl Frame {
    pub fn new(cmd: SpiCmd, xinfo: u8, short: ShortResponse, payload: [u8; PAYLOAD_SIZE]) -> Self {
        Self {
            cmd,
            short_ack: false,
            xinfo,
            short,
            payload,
        }
    }

    /// The steady-state poll: a NOP carrying the last seen sensor UID so
    /// the board can detect missed deliveries.
    pub fn poll(last_sensor_uid: u8) -> Self {
        Self::new(
            SpiCmd::Nop,
            last_sensor_uid,
            ShortResponse::NONE,
            [0; PAYLOAD_SIZE],
        )
    }

    /// A CNC request frame. `xinfo` is the match key echoed by the long
    /// response; `cmd_uid` keys the short-response path.
    pub fn cnc(cmd: SpiCmd, xinfo: u8, cmd_uid: u16, payload: &CncWirePayload) -> Self {
        Self::new(
            cmd,
            xinfo,
            ShortResponse {
                cmd_uid,
                cmd_result: RESULT_NO_ERROR,
            },
            payload.to_bytes(),
        )
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut out = [0u8; FRAME_SIZE];
        let mut cmd = self.cmd as u8;
        if self.short_ack {
            cmd |= CMD_SHORT_RESPONSE;
        }
        out[0] = cmd;
        out[1] = self.xinfo;
        out[2..4].copy_from_slice(&self.short.cmd_uid.to_le_bytes());
        out[4..6].copy_from_slice(&self.short.cmd_result.to_le_bytes());
        out[6..46].copy_from_slice(&self.payload);
        let crc = crc16_ccitt(&out[..46], INITIAL_CRC16_CCITT);
        out[46..48].copy_from_slice(&crc.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; FRAME_SIZE]) -> Result<Self, LinkError> {
        let expected = crc16_ccitt(&bytes[..46], INITIAL_CRC16_CCITT);
        let got = u16::from_le_bytes([bytes[46], bytes[47]]);
        if expected != got {
            return Err(LinkError::Crc { expected, got });
        }
        let raw_cmd = bytes[0];
        let cmd = SpiCmd::try_from(raw_cmd & !CMD_SHORT_RESPONSE)
            .map_err(|_| LinkError::UnknownCmd(raw_cmd))?;
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&bytes[6..46]);
        Ok(Self {
            cmd,
            short_ack: raw_cmd & CMD_SHORT_RESPONSE != 0,
            xinfo: bytes[1],
            short: ShortResponse {
                cmd_uid: u16::from_le_bytes([bytes[2], bytes[3]]),
                cmd_result: u16::from_le_bytes([bytes[4], bytes[5]]),
            },
            payload,
        })
    }
}

/// A received frame classified for the per-board driver.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Inbound {
    /// Fresh sensor data; `uid` rolls with every new conversion.
    StreamSensor { uid: u8, payload: [u8; PAYLOAD_SIZE] },
    /// Sensor data with an inline short-command acknowledgment.
    SensorWithShortAck {
        uid: u8,
        payload: [u8; PAYLOAD_SIZE],
        ack: ShortResponse,
    },
    /// Long-form CNC response; `xinfo` echoes the request match key.
    CncResponse { xinfo: u8, payload: [u8; PAYLOAD_SIZE] },
    /// DDS synchronization marker, no payload of interest.
    DdsTrig,
    /// Anything else a board should not be sending upstream.
    Unexpected(SpiCmd),
}

impl Inbound {
    pub fn classify(frame: &Frame) -> Self {
        match frame.cmd {
            SpiCmd::StreamSensor if frame.short_ack => Self::SensorWithShortAck {
                uid: frame.xinfo,
                payload: frame.payload,
                ack: frame.short,
            },
            SpiCmd::StreamSensor => Self::StreamSensor {
                uid: frame.xinfo,
                payload: frame.payload,
            },
            SpiCmd::RespCnc => Self::CncResponse {
                xinfo: frame.xinfo,
                payload: frame.payload,
            },
            SpiCmd::DdsTrig => Self::DdsTrig,
            other => Self::Unexpected(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(fill: u8) -> [u8; PAYLOAD_SIZE] {
        let mut p = [0u8; PAYLOAD_SIZE];
        for (i, b) in p.iter_mut().enumerate() {
            *b = fill.wrapping_add(i as u8);
        }
        p
    }

    #[test]
    fn encode_decode_round_trip() {
        let frame = Frame::new(
            SpiCmd::Cnc,
            0x5A,
            ShortResponse {
                cmd_uid: 77,
                cmd_result: RESULT_NO_ERROR,
            },
            payload_of(3),
        );
        let bytes = frame.encode();
        assert_eq!(bytes.len(), FRAME_SIZE);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn any_single_bit_flip_is_rejected() {
        let bytes = Frame::poll(9).encode();
        for byte in 0..FRAME_SIZE {
            let mut corrupt = bytes;
            corrupt[byte] ^= 0x40;
            // Depending on where the flip lands we get a CRC error or, never,
            // a clean decode of different content.
            match Frame::decode(&corrupt) {
                Err(LinkError::Crc { .. }) => {}
                Err(LinkError::UnknownCmd(_)) => panic!("cmd decode before CRC check"),
                Ok(_) => panic!("corruption at byte {byte} not detected"),
            }
        }
    }

    #[test]
    fn short_ack_bit_folds_into_typed_variant() {
        let mut frame = Frame::new(
            SpiCmd::StreamSensor,
            12,
            ShortResponse {
                cmd_uid: 41,
                cmd_result: RESULT_NO_ERROR,
            },
            payload_of(0),
        );
        frame.short_ack = true;
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert!(decoded.short_ack);
        match Inbound::classify(&decoded) {
            Inbound::SensorWithShortAck { uid, ack, .. } => {
                assert_eq!(uid, 12);
                assert_eq!(ack.cmd_uid, 41);
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn plain_sensor_frame_classifies_without_ack() {
        let frame = Frame::new(SpiCmd::StreamSensor, 7, ShortResponse::NONE, payload_of(1));
        match Inbound::classify(&frame) {
            Inbound::StreamSensor { uid, .. } => assert_eq!(uid, 7),
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_surfaced() {
        let mut bytes = Frame::poll(0).encode();
        bytes[0] = 0x17;
        let crc = crc16_ccitt(&bytes[..46], INITIAL_CRC16_CCITT);
        bytes[46..48].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(
            Frame::decode(&bytes).unwrap_err(),
            LinkError::UnknownCmd(0x17)
        );
    }
}
