//! M24C64 EEPROM driver backing the persistent registers.
//!
//! The part is addressed with 16-bit offsets and 32-byte pages. Each
//! register id owns one 64-byte cell: a type tag, a length byte, then the
//! value bytes. The I2C bus is shared with the fan controller, so the bus
//! handle is passed per call and guarded by the callers' resource lock.

use ardea_core::regmap::{RegType, RegValue, RegisterMap};
use cortex_m::asm;
use hal::i2c::I2c;
use hal::pac::I2C1;
use hal::prelude::*;

/// 7-bit device address (E2..E0 strapped low).
const DEVICE_ADDR: u8 = 0x50;

const CELL_SIZE: usize = 64;
const PAGE_SIZE: usize = 32;

/// Spin cycles between write-poll attempts (~5 ms worst-case write time).
const WRITE_POLL_SPINS: u32 = 4_000;
const WRITE_POLL_TRIES: u32 = 200;

const TAG_UINT: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_STR: u8 = 2;
/// Erased or never-written cells read back as 0xFF.
const TAG_BLANK: u8 = 0xFF;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    Bus,
    /// Cell contents do not decode to the register's type.
    Corrupt,
    TooLarge,
}

pub struct Eeprom {
    _priv: (),
}

impl Eeprom {
    pub fn new() -> Self {
        Self { _priv: () }
    }

    fn cell_offset(id: u32) -> u16 {
        (id as u16) * CELL_SIZE as u16
    }

    fn read_at(&self, i2c: &mut I2c<I2C1>, offset: u16, out: &mut [u8]) -> Result<(), Error> {
        i2c.write_read(DEVICE_ADDR, &offset.to_be_bytes(), out)
            .map_err(|_| Error::Bus)
    }

    fn write_page(&self, i2c: &mut I2c<I2C1>, offset: u16, data: &[u8]) -> Result<(), Error> {
        let mut buf = [0u8; 2 + PAGE_SIZE];
        buf[..2].copy_from_slice(&offset.to_be_bytes());
        buf[2..2 + data.len()].copy_from_slice(data);
        i2c.write(DEVICE_ADDR, &buf[..2 + data.len()])
            .map_err(|_| Error::Bus)?;
        // Ack-poll until the internal write cycle finishes.
        for _ in 0..WRITE_POLL_TRIES {
            asm::delay(WRITE_POLL_SPINS);
            if i2c.write(DEVICE_ADDR, &offset.to_be_bytes()).is_ok() {
                return Ok(());
            }
        }
        Err(Error::Bus)
    }

    /// Persist one register value into its cell.
    pub fn store(&self, i2c: &mut I2c<I2C1>, id: u32, value: &RegValue) -> Result<(), Error> {
        let mut cell = [0u8; CELL_SIZE];
        let used = encode_value(value, &mut cell).ok_or(Error::TooLarge)?;
        let base = Self::cell_offset(id);
        let mut off = 0;
        while off < used {
            let n = (used - off).min(PAGE_SIZE);
            self.write_page(i2c, base + off as u16, &cell[off..off + n])?;
            off += n;
        }
        Ok(())
    }

    /// Load one register value, if a valid cell is present.
    pub fn load(
        &self,
        i2c: &mut I2c<I2C1>,
        id: u32,
        ty: RegType,
    ) -> Result<Option<RegValue>, Error> {
        let mut cell = [0u8; CELL_SIZE];
        self.read_at(i2c, Self::cell_offset(id), &mut cell)?;
        if cell[0] == TAG_BLANK {
            return Ok(None);
        }
        decode_value(ty, &cell).map(Some).ok_or(Error::Corrupt)
    }

    /// Populate the register table from EEPROM at boot; missing or corrupt
    /// cells keep their defaults.
    pub fn load_registers(&self, i2c: &mut I2c<I2C1>, regs: &mut RegisterMap) {
        let ids: heapless::Vec<_, { ardea_core::regmap::MB_REG_COUNT }> =
            regs.persistent_ids().collect();
        for id in ids {
            let Ok(ty) = regs.type_of(id as u32) else {
                continue;
            };
            match self.load(i2c, id as u32, ty) {
                Ok(Some(value)) => {
                    let _ = regs.write_force(id as u32, value);
                }
                Ok(None) => {}
                Err(_) => defmt::warn!("eeprom cell {} unreadable", id as u32),
            }
        }
    }
}

fn encode_value(value: &RegValue, cell: &mut [u8; CELL_SIZE]) -> Option<usize> {
    match value {
        RegValue::Uint(v) => {
            cell[0] = TAG_UINT;
            cell[1] = 4;
            cell[2..6].copy_from_slice(&v.to_le_bytes());
            Some(6)
        }
        RegValue::Int(v) => {
            cell[0] = TAG_INT;
            cell[1] = 4;
            cell[2..6].copy_from_slice(&v.to_le_bytes());
            Some(6)
        }
        RegValue::Str(s) => {
            let bytes = s.as_bytes();
            if bytes.len() > CELL_SIZE - 2 {
                return None;
            }
            cell[0] = TAG_STR;
            cell[1] = bytes.len() as u8;
            cell[2..2 + bytes.len()].copy_from_slice(bytes);
            Some(2 + bytes.len())
        }
    }
}

fn decode_value(ty: RegType, cell: &[u8; CELL_SIZE]) -> Option<RegValue> {
    let len = cell[1] as usize;
    match (ty, cell[0]) {
        (RegType::Uint, TAG_UINT) if len == 4 => Some(RegValue::Uint(u32::from_le_bytes(
            cell[2..6].try_into().ok()?,
        ))),
        (RegType::Int, TAG_INT) if len == 4 => Some(RegValue::Int(i32::from_le_bytes(
            cell[2..6].try_into().ok()?,
        ))),
        (RegType::Str, TAG_STR) if len <= CELL_SIZE - 2 => {
            let s = core::str::from_utf8(&cell[2..2 + len]).ok()?;
            Some(RegValue::str_value(s))
        }
        _ => None,
    }
}
