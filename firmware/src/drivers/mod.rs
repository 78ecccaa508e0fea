//! I2C peripheral drivers on the main board.

pub mod eeprom_m24;
pub mod fan_max31760;
