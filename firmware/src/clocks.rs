//! Conversion-clock outputs for the sensor backplane.
//!
//! TIM4 channel 1 carries the ADC conversion clock, channel 2 the DDS
//! update clock. Rate and duty are register-driven at runtime, so the
//! prescaler/reload math is done here against the timer kernel clock
//! rather than through a fixed-frequency PWM abstraction.

use hal::pac;

const MAX_ARR: u32 = 0xFFFF;

#[derive(Clone, Copy)]
pub enum ClockOutput {
    /// TIM4 CH1: ADC conversion clock.
    Adc,
    /// TIM4 CH2: DDS update clock.
    Dds,
}

pub struct ClockGen {
    tim_clk_hz: u32,
    adc: (u32, u32), // rate Hz, duty percent
    dds: (u32, u32),
}

impl ClockGen {
    /// `tim_clk_hz` is the APB1 timer kernel clock feeding TIM4.
    pub fn new(tim_clk_hz: u32) -> Self {
        Self {
            tim_clk_hz,
            adc: (4_000, 50),
            dds: (25_000, 50),
        }
    }

    pub fn set_rate(&mut self, output: ClockOutput, rate_hz: u32) {
        match output {
            ClockOutput::Adc => self.adc.0 = rate_hz.max(1),
            ClockOutput::Dds => self.dds.0 = rate_hz.max(1),
        }
        self.apply(output);
    }

    pub fn set_duty(&mut self, output: ClockOutput, duty_pct: u32) {
        let duty = duty_pct.min(100);
        match output {
            ClockOutput::Adc => self.adc.1 = duty,
            ClockOutput::Dds => self.dds.1 = duty,
        }
        self.apply(output);
    }

    /// Both channels share TIM4, so they share PSC/ARR; the slower rate
    /// wins the base and each duty maps onto its own compare register.
    fn apply(&mut self, _changed: ClockOutput) {
        let rate = self.adc.0.min(self.dds.0).max(1);
        let ticks = (self.tim_clk_hz / rate).max(2);
        let psc = ticks / (MAX_ARR + 1);
        let arr = ticks / (psc + 1) - 1;

        let tim = unsafe { &*pac::TIM4::ptr() };
        tim.psc.write(|w| unsafe { w.psc().bits(psc as u16) });
        tim.arr.write(|w| unsafe { w.arr().bits(arr) });
        let ccr = |duty: u32| arr * duty / 100;
        tim.ccr1.write(|w| unsafe { w.ccr().bits(ccr(self.adc.1)) });
        tim.ccr2.write(|w| unsafe { w.ccr().bits(ccr(self.dds.1)) });
        // Force the new reload immediately.
        tim.egr.write(|w| w.ug().set_bit());
    }

    /// One-time TIM4 bring-up: PWM mode 1 on CH1/CH2, then apply the
    /// register defaults.
    pub fn init(&mut self) {
        let tim = unsafe { &*pac::TIM4::ptr() };
        tim.ccmr1_output().modify(|_, w| unsafe {
            w.oc1m().bits(0b110).oc1pe().set_bit().oc2m().bits(0b110).oc2pe().set_bit()
        });
        tim.ccer.modify(|_, w| w.cc1e().set_bit().cc2e().set_bit());
        tim.cr1.modify(|_, w| w.arpe().set_bit().cen().set_bit());
        self.apply(ClockOutput::Adc);
    }
}
