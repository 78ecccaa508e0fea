//! MAX31760 fan controller, shared I2C bus with the EEPROM.
//!
//! CNC addresses map mostly straight onto device registers; a few virtual
//! addresses above the device map compose multi-register reads (combined
//! temperature, tach counts) and the manual-mode control bit.

use ardea_core::router::{RESULT_ERR_PARAM, RESULT_ERR_RESOURCE};
use hal::i2c::I2c;
use hal::pac::I2C1;
use hal::prelude::*;

const DEVICE_ADDR: u8 = 0x51;

// Device register map (subset this board uses).
const REG_CTRL1: u8 = 0x00;
const REG_PWM_TARGET: u8 = 0x50;
const REG_TACH1_MSB: u8 = 0x52;
const REG_TACH2_MSB: u8 = 0x54;
const REG_TEMP_MSB: u8 = 0x58;
const REG_TEMP_LSB: u8 = 0x59;
const REG_MAX: u8 = 0x5B;

// Virtual addresses composed by this driver.
const VREG_MANUAL_MODE: u32 = 0x5C;
const VREG_TEMPERATURE: u32 = 0x5D;
const VREG_TACH_1: u32 = 0x5E;
const VREG_TACH_2: u32 = 0x5F;
const VREG_SPEED_CTRL: u32 = 0x60;

/// CTRL1 bit selecting direct PWM control instead of the lookup table.
const CTRL1_MANUAL: u8 = 1 << 1;

pub struct FanController {
    /// FAN_POP register image: bit0 = fan 1 fitted, bit1 = fan 2.
    populated: u8,
}

impl FanController {
    pub fn new(populated: u8) -> Self {
        Self { populated }
    }

    pub fn set_population(&mut self, populated: u8) {
        self.populated = populated;
    }

    pub fn populated(&self) -> u8 {
        self.populated
    }

    fn reg_read(&self, i2c: &mut I2c<I2C1>, reg: u8) -> Result<u8, u32> {
        let mut out = [0u8; 1];
        i2c.write_read(DEVICE_ADDR, &[reg], &mut out)
            .map_err(|_| RESULT_ERR_RESOURCE)?;
        Ok(out[0])
    }

    fn reg_write(&self, i2c: &mut I2c<I2C1>, reg: u8, value: u8) -> Result<(), u32> {
        i2c.write(DEVICE_ADDR, &[reg, value])
            .map_err(|_| RESULT_ERR_RESOURCE)
    }

    fn tach(&self, i2c: &mut I2c<I2C1>, msb_reg: u8) -> Result<u32, u32> {
        let msb = self.reg_read(i2c, msb_reg)?;
        let lsb = self.reg_read(i2c, msb_reg + 1)?;
        Ok(u32::from(msb) << 8 | u32::from(lsb))
    }

    /// Serve a FAN-peripheral CNC read.
    pub fn read(&self, i2c: &mut I2c<I2C1>, addr: u32) -> Result<u32, u32> {
        match addr {
            VREG_MANUAL_MODE => Ok(u32::from(self.reg_read(i2c, REG_CTRL1)? & CTRL1_MANUAL != 0)),
            VREG_TEMPERATURE => {
                // 11-bit signed temperature, MSB-aligned across two regs.
                let msb = self.reg_read(i2c, REG_TEMP_MSB)?;
                let lsb = self.reg_read(i2c, REG_TEMP_LSB)?;
                Ok(u32::from(msb) << 3 | u32::from(lsb >> 5))
            }
            VREG_TACH_1 => self.tach(i2c, REG_TACH1_MSB),
            VREG_TACH_2 => self.tach(i2c, REG_TACH2_MSB),
            VREG_SPEED_CTRL => self.reg_read(i2c, REG_PWM_TARGET).map(u32::from),
            a if a <= u32::from(REG_MAX) => self.reg_read(i2c, a as u8).map(u32::from),
            _ => Err(RESULT_ERR_PARAM),
        }
    }

    /// Serve a FAN-peripheral CNC write.
    pub fn write(&self, i2c: &mut I2c<I2C1>, addr: u32, value: u8) -> Result<(), u32> {
        match addr {
            VREG_MANUAL_MODE => {
                let ctrl = self.reg_read(i2c, REG_CTRL1)?;
                let ctrl = if value != 0 {
                    ctrl | CTRL1_MANUAL
                } else {
                    ctrl & !CTRL1_MANUAL
                };
                self.reg_write(i2c, REG_CTRL1, ctrl)
            }
            VREG_SPEED_CTRL => self.reg_write(i2c, REG_PWM_TARGET, value),
            VREG_TEMPERATURE | VREG_TACH_1 | VREG_TACH_2 => Err(RESULT_ERR_PARAM),
            a if a <= u32::from(REG_MAX) => self.reg_write(i2c, a as u8, value),
            _ => Err(RESULT_ERR_PARAM),
        }
    }
}
