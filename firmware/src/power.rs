//! Sensor-rail power sequencing.
//!
//! The reference clock to the sensor boards must be stable before the rail
//! comes up, and the rail must drop before the clock on the way down. The
//! settle delay is short enough to block through.

use cortex_m::asm;
use hal::gpio::{ErasedPin, Output};

const CLK_SETTLE_TIME_MS: u32 = 3;

pub struct PowerRail {
    ref_clk_en: ErasedPin<Output>,
    pwr_sw_en: ErasedPin<Output>,
    enabled: bool,
    cycles_per_ms: u32,
}

impl PowerRail {
    pub fn new(
        ref_clk_en: ErasedPin<Output>,
        pwr_sw_en: ErasedPin<Output>,
        sysclk_hz: u32,
    ) -> Self {
        Self {
            ref_clk_en,
            pwr_sw_en,
            enabled: false,
            cycles_per_ms: sysclk_hz / 1_000,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn settle(&self) {
        asm::delay(CLK_SETTLE_TIME_MS * self.cycles_per_ms);
    }

    /// Sequence the rail. Returns whether the state changed, so the caller
    /// can re-enable or park the board drivers.
    pub fn set(&mut self, on: bool) -> bool {
        if self.enabled == on {
            return false;
        }
        if on {
            self.ref_clk_en.set_high();
            self.settle();
            self.pwr_sw_en.set_high();
        } else {
            self.pwr_sw_en.set_low();
            self.settle();
            self.ref_clk_en.set_low();
        }
        self.enabled = on;
        defmt::info!("sensor rail {}", if on { "up" } else { "down" });
        true
    }
}
