//! Hardware-independent core of the chassis main-controller firmware.
//!
//! Everything that does not touch a peripheral register lives here: the SPI
//! link-frame codec, the command-and-control payloads, the per-board driver
//! state machine, the stream-packet gather engine, the register map and the
//! CNC router. The `ardea` firmware crate wires these to the STM32H743; the
//! host test suite drives them directly.

#![cfg_attr(not(test), no_std)]

pub mod board;
pub mod cnc;
pub mod crc16;
pub mod dbcomm;
pub mod gather;
pub mod imu;
pub mod link;
pub mod loopback;
pub mod regmap;
pub mod router;

/// Sensor-board slots in the chassis, spread over four SPI buses.
pub const MAX_BOARDS: usize = 24;

/// Chip selects per SPI bus; slot = bus * BOARDS_PER_BUS + cs.
pub const BOARDS_PER_BUS: usize = 6;

/// Number of SPI buses wired to sensor-board slots.
pub const SPI_BUS_COUNT: usize = MAX_BOARDS / BOARDS_PER_BUS;

/// Destination id addressing the main board itself rather than a slot.
pub const MAIN_BOARD_ID: u8 = 0xFE;

/// Consecutive unanswered ticks on an in-flight CNC before the one-shot
/// resend (and, after a second round, a `Timeout` completion).
pub const DB_MAX_UNANSWERED_RESPONSE: u32 = 5;

/// Consecutive silent polls before a board is declared gone: a reboot
/// command is emitted once and the slot is disabled.
pub const DB_MAX_UNANSWERED_RESPONSE_DISABLE: u32 = 10;

/// Budget for a transient caller blocked on a CNC completion. The driver is
/// required to complete first, so expiry here is a hard fault of the router.
pub const TRANSIENT_TIMEOUT_MS: u32 = 5_000;

/// Default period of both the sensor-poll tick and the stream tick.
pub const DEFAULT_TICK_INTERVAL_US: u32 = 1_000;

/// SPI bus serving a given slot.
pub fn bus_of_slot(slot: usize) -> usize {
    slot / BOARDS_PER_BUS
}
