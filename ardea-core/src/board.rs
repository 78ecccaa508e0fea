//! Sensor-board variants and the byte layouts they produce: the 40-byte SPI
//! sensor payload coming up the link, and the per-board records laid into the
//! outgoing stream packet.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Layout version stamped into every record and the stream-packet header.
pub const RECORD_VERSION: u8 = 2;

/// 24-bit ADC readings per board (4 per sensor, 2 sensors).
pub const ADC_READINGS_PER_BOARD: usize = 8;

/// Bytes of one packed 24-bit ADC reading.
pub const ADC24_SIZE: usize = 3;

/// Sensors on one board. IMU boards carry two IMUs; ADC boards feed two
/// sensor front-ends into one reading block.
pub const SENSORS_PER_BOARD: usize = 2;

pub const IMU_PER_BOARD: usize = 2;

/// Most IMU boards a packet layout can carry (two records each).
pub const IMU_MAX_BOARD: usize = 12;

/// Coil drive settings echoed back by an MCG board, per sensor.
pub const COIL_CTRL_SIZE: usize = 8;

/// Common header in front of every record in the stream packet.
pub const RECORD_HEADER_SIZE: usize = 8;

/// Assembled IMU sample: quaternion form, or 4-byte blank prefix + Euler.
pub const IMU_DATA_SIZE: usize = 48;

pub const MCG_RECORD_SIZE: usize =
    RECORD_HEADER_SIZE + ADC_READINGS_PER_BOARD * ADC24_SIZE + SENSORS_PER_BOARD * COIL_CTRL_SIZE;
pub const ECG_RECORD_SIZE: usize = RECORD_HEADER_SIZE + ADC_READINGS_PER_BOARD * ADC24_SIZE;
pub const IMU_RECORD_SIZE: usize = RECORD_HEADER_SIZE + IMU_DATA_SIZE;

/// Record flags: bit 7 = data is fresh since the last buffer swap.
pub const NEW_DATA_FLAG: u8 = 0x80;

/// Record flags: low bits carry the board-type tag.
pub const BOARD_TYPE_MASK: u8 = 0x07;

pub fn has_new_data(flags: u8) -> bool {
    flags & NEW_DATA_FLAG != 0
}

/// Board variant stored in the `SENSOR_BOARD_x` registers and tagged into
/// record flags. The empty slot marker was moved off 3 when `Unknown` was
/// introduced; 3 must never be written to a slot register.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BoardType {
    Mcg = 0,
    Ecg = 1,
    ImuCoil = 2,
    Unknown = 3,
    Ecg12 = 4,
    Empty = 7,
}

impl BoardType {
    /// Records this board contributes to the stream packet.
    pub fn record_count(self) -> usize {
        match self {
            Self::ImuCoil => IMU_PER_BOARD,
            Self::Empty | Self::Unknown => 0,
            _ => 1,
        }
    }

    pub fn record_size(self) -> usize {
        match self {
            Self::Mcg => MCG_RECORD_SIZE,
            Self::Ecg | Self::Ecg12 => ECG_RECORD_SIZE,
            Self::ImuCoil => IMU_RECORD_SIZE,
            Self::Empty | Self::Unknown => 0,
        }
    }

    pub fn is_populated(self) -> bool {
        !matches!(self, Self::Empty | Self::Unknown)
    }
}

/// Header written in front of every record in the stream packet.
///
/// `sample_uid` is the link-level sensor UID (`xinfo`) the data arrived
/// under, letting the server spot dropped or repeated conversions per slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub sensor_id: u8,
    pub board_id: u8,
    pub flags: u8,
    pub sample_uid: u32,
}

impl RecordHeader {
    pub fn new(sensor_id: u8, board_id: u8, board_type: BoardType, sample_uid: u32) -> Self {
        Self {
            version: RECORD_VERSION,
            sensor_id,
            board_id,
            flags: NEW_DATA_FLAG | (u8::from(board_type) & BOARD_TYPE_MASK),
            sample_uid,
        }
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[0] = self.version;
        out[1] = self.sensor_id;
        out[2] = self.board_id;
        out[3] = self.flags;
        out[4..8].copy_from_slice(&self.sample_uid.to_le_bytes());
    }
}

/// Byte offset of the flags field within a record.
pub const RECORD_FLAGS_OFFSET: usize = 3;

/// View over the 40-byte sensor payload of an ADC board (MCG/ECG/ECG12).
/// Layout: 8 packed 24-bit readings, then two coil-control blocks (only
/// meaningful on MCG boards).
pub struct AdcPayload<'a>(pub &'a [u8; 40]);

impl<'a> AdcPayload<'a> {
    /// Reading for one channel, widened from 24 bits.
    pub fn reading(&self, ch: usize) -> u32 {
        let off = ch * ADC24_SIZE;
        u32::from(self.0[off]) | u32::from(self.0[off + 1]) << 8 | u32::from(self.0[off + 2]) << 16
    }

    /// The ADC reading block as raw bytes.
    pub fn readings_raw(&self) -> &'a [u8] {
        &self.0[..ADC_READINGS_PER_BOARD * ADC24_SIZE]
    }

    /// Readings plus coil-control data, as copied into an MCG record.
    pub fn readings_and_coil_raw(&self) -> &'a [u8] {
        self.0
    }
}

/// Write one 24-bit reading into a payload buffer. Values are clamped to
/// 24 bits; the loopback generator feeds full-scale step functions through
/// here.
pub fn write_adc24(payload: &mut [u8; 40], ch: usize, value: u32) {
    let off = ch * ADC24_SIZE;
    let v = value & 0x00FF_FFFF;
    payload[off] = v as u8;
    payload[off + 1] = (v >> 8) as u8;
    payload[off + 2] = (v >> 16) as u8;
}

pub fn read_adc24(payload: &[u8; 40], ch: usize) -> u32 {
    AdcPayload(payload).reading(ch)
}

/// Tribble fragment length: one third of an assembled IMU sample.
pub const IMU_FRAGMENT_SIZE: usize = IMU_DATA_SIZE / 3;

/// View over the 40-byte sensor payload of an IMU/coil-driver board.
/// Layout: per-IMU 2-bit tribble flags in byte 0, pad to 8, then one
/// 16-byte fragment per IMU.
pub struct ImuPayload<'a>(pub &'a [u8; 40]);

impl<'a> ImuPayload<'a> {
    const FRAG_BASE: usize = 8;

    /// Raw 2-bit tribble index for `imu` (0 or 1).
    pub fn flag_bits(&self, imu: usize) -> u8 {
        (self.0[0] >> (imu as u8 * 2)) & 0x03
    }

    pub fn fragment(&self, imu: usize) -> &'a [u8] {
        let off = Self::FRAG_BASE + imu * IMU_FRAGMENT_SIZE;
        &self.0[off..off + IMU_FRAGMENT_SIZE]
    }
}

/// Compose an IMU payload; used by tests and the loopback path.
pub fn write_imu_payload(
    payload: &mut [u8; 40],
    flags: [u8; IMU_PER_BOARD],
    frags: [&[u8]; IMU_PER_BOARD],
) {
    payload[0] = (flags[0] & 0x03) | (flags[1] & 0x03) << 2;
    for imu in 0..IMU_PER_BOARD {
        let off = 8 + imu * IMU_FRAGMENT_SIZE;
        payload[off..off + IMU_FRAGMENT_SIZE].copy_from_slice(frags[imu]);
    }
}
