//! Board bring-up: clock tree, pins, SPI/DMA/timer/I2C/Ethernet blocks.
//! Everything here runs once from `init` with interrupts masked.

use crate::clocks::ClockGen;
use crate::drivers::eeprom_m24::Eeprom;
use crate::power::PowerRail;
use crate::spi::{self, CsPins};
use ardea_core::regmap::{MbRegId, RegisterMap};
use ardea_core::{MAX_BOARDS, SPI_BUS_COUNT};
use hal::ethernet::{self, PHY};
use hal::gpio::{ErasedPin, Output, Speed};
use hal::i2c::I2c;
use hal::pac;
use hal::prelude::*;
use hal::timer::{Event, Timer};
use smoltcp::wire::EthernetAddress;

/// Ethernet DMA descriptor rings; must live in D2 SRAM3 where the MAC can
/// see them.
#[link_section = ".sram3"]
static mut DES_RING: ethernet::DesRing<4, 4> = ethernet::DesRing::new();

pub struct Board {
    pub cs: CsPins,
    pub eth_device: crate::net::Device,
    pub phy: ethernet::phy::LAN8742A<ethernet::EthernetMAC>,
    pub i2c1: I2c<pac::I2C1>,
    pub tim2: Timer<pac::TIM2>,
    pub tim3: Timer<pac::TIM3>,
    pub clockgen: ClockGen,
    pub green_led: ErasedPin<Output>,
    pub red_led: ErasedPin<Output>,
    pub power: PowerRail,
    pub sysclk_hz: u32,
    pub mac: EthernetAddress,
}

/// Bring the board up. The persistent registers are loaded as soon as the
/// I2C bus exists, because the network configuration (including the MAC
/// derived from `UNIQUE_ID`) depends on them.
pub fn setup(dp: pac::Peripherals, regs: &mut RegisterMap) -> Board {
    let pwr = dp.PWR.constrain();
    let pwrcfg = pwr.freeze();

    let rcc = dp.RCC.constrain();
    let ccdr = rcc
        .sys_ck(400.MHz())
        .hclk(200.MHz())
        .pll1_q_ck(100.MHz())
        .freeze(pwrcfg, &dp.SYSCFG);

    let gpioa = dp.GPIOA.split(ccdr.peripheral.GPIOA);
    let gpiob = dp.GPIOB.split(ccdr.peripheral.GPIOB);
    let gpioc = dp.GPIOC.split(ccdr.peripheral.GPIOC);
    let gpiod = dp.GPIOD.split(ccdr.peripheral.GPIOD);
    let gpioe = dp.GPIOE.split(ccdr.peripheral.GPIOE);
    let gpiof = dp.GPIOF.split(ccdr.peripheral.GPIOF);
    let gpiog = dp.GPIOG.split(ccdr.peripheral.GPIOG);

    // SPI bus pins, one SCK/MISO/MOSI set per backplane bus. The blocks
    // themselves are register-driven from `spi`, so the pin handles are
    // not kept.
    let _ = gpiob.pb3.into_alternate::<5>().speed(Speed::VeryHigh); // SPI1 SCK
    let _ = gpiob.pb4.into_alternate::<5>().speed(Speed::VeryHigh); // SPI1 MISO
    let _ = gpiob.pb5.into_alternate::<5>().speed(Speed::VeryHigh); // SPI1 MOSI
    let _ = gpiob.pb13.into_alternate::<5>().speed(Speed::VeryHigh); // SPI2 SCK
    let _ = gpiob.pb14.into_alternate::<5>().speed(Speed::VeryHigh); // SPI2 MISO
    let _ = gpiob.pb15.into_alternate::<5>().speed(Speed::VeryHigh); // SPI2 MOSI
    let _ = gpioc.pc10.into_alternate::<6>().speed(Speed::VeryHigh); // SPI3 SCK
    let _ = gpioc.pc11.into_alternate::<6>().speed(Speed::VeryHigh); // SPI3 MISO
    let _ = gpioc.pc12.into_alternate::<6>().speed(Speed::VeryHigh); // SPI3 MOSI
    let _ = gpioe.pe12.into_alternate::<5>().speed(Speed::VeryHigh); // SPI4 SCK
    let _ = gpioe.pe13.into_alternate::<5>().speed(Speed::VeryHigh); // SPI4 MISO
    let _ = gpioe.pe14.into_alternate::<5>().speed(Speed::VeryHigh); // SPI4 MOSI

    // Chip selects, active low, parked high: slots 0..11 on port D,
    // 12..19 on port G, 20..23 on port F.
    let cs: [ErasedPin<Output>; MAX_BOARDS] = [
        gpiod.pd0.into_push_pull_output().erase(),
        gpiod.pd1.into_push_pull_output().erase(),
        gpiod.pd2.into_push_pull_output().erase(),
        gpiod.pd3.into_push_pull_output().erase(),
        gpiod.pd4.into_push_pull_output().erase(),
        gpiod.pd5.into_push_pull_output().erase(),
        gpiod.pd6.into_push_pull_output().erase(),
        gpiod.pd7.into_push_pull_output().erase(),
        gpiod.pd8.into_push_pull_output().erase(),
        gpiod.pd9.into_push_pull_output().erase(),
        gpiod.pd10.into_push_pull_output().erase(),
        gpiod.pd11.into_push_pull_output().erase(),
        gpiog.pg0.into_push_pull_output().erase(),
        gpiog.pg1.into_push_pull_output().erase(),
        gpiog.pg2.into_push_pull_output().erase(),
        gpiog.pg3.into_push_pull_output().erase(),
        gpiog.pg4.into_push_pull_output().erase(),
        gpiog.pg5.into_push_pull_output().erase(),
        gpiog.pg6.into_push_pull_output().erase(),
        gpiog.pg7.into_push_pull_output().erase(),
        gpiof.pf4.into_push_pull_output().erase(),
        gpiof.pf5.into_push_pull_output().erase(),
        gpiof.pf6.into_push_pull_output().erase(),
        gpiof.pf7.into_push_pull_output().erase(),
    ];
    let mut cs = CsPins(cs);
    for pin in cs.0.iter_mut() {
        pin.set_high();
    }

    // SPI and DMA kernel clocks on, then the register-level bus setup.
    ccdr.peripheral.SPI1.enable();
    ccdr.peripheral.SPI2.enable();
    ccdr.peripheral.SPI3.enable();
    ccdr.peripheral.SPI4.enable();
    ccdr.peripheral.DMA1.enable();
    for bus in 0..SPI_BUS_COUNT {
        spi::init_bus(bus);
    }

    // EEPROM and fan controller share I2C1. The persistent registers are
    // pulled in right away; everything after this sees real settings.
    let scl = gpiob.pb6.into_alternate_open_drain::<4>();
    let sda = gpiob.pb7.into_alternate_open_drain::<4>();
    let mut i2c1 = dp
        .I2C1
        .i2c((scl, sda), 100.kHz(), ccdr.peripheral.I2C1, &ccdr.clocks);
    Eeprom::new().load_registers(&mut i2c1, regs);

    let env = crate::control::SysEnv {
        uptime_sec: 0,
        trigger_mask: 0,
    };
    let uid = regs
        .read(MbRegId::UniqueId as u32, &env)
        .ok()
        .and_then(|v| v.as_uint())
        .unwrap_or(0);
    // Locally administered address, stable per chassis.
    let mac = EthernetAddress([
        0x02,
        0xA4,
        (uid >> 24) as u8,
        (uid >> 16) as u8,
        (uid >> 8) as u8,
        uid as u8,
    ]);

    // RMII Ethernet.
    let rmii_ref_clk = gpioa.pa1.into_alternate::<11>().speed(Speed::VeryHigh);
    let rmii_mdio = gpioa.pa2.into_alternate::<11>().speed(Speed::VeryHigh);
    let rmii_mdc = gpioc.pc1.into_alternate::<11>().speed(Speed::VeryHigh);
    let rmii_crs_dv = gpioa.pa7.into_alternate::<11>().speed(Speed::VeryHigh);
    let rmii_rxd0 = gpioc.pc4.into_alternate::<11>().speed(Speed::VeryHigh);
    let rmii_rxd1 = gpioc.pc5.into_alternate::<11>().speed(Speed::VeryHigh);
    let rmii_tx_en = gpiog.pg11.into_alternate::<11>().speed(Speed::VeryHigh);
    let rmii_txd0 = gpiog.pg13.into_alternate::<11>().speed(Speed::VeryHigh);
    let rmii_txd1 = gpiog.pg12.into_alternate::<11>().speed(Speed::VeryHigh);

    let (eth_device, eth_mac) = unsafe {
        ethernet::new(
            dp.ETHERNET_MAC,
            dp.ETHERNET_MTL,
            dp.ETHERNET_DMA,
            (
                rmii_ref_clk,
                rmii_mdio,
                rmii_mdc,
                rmii_crs_dv,
                rmii_rxd0,
                rmii_rxd1,
                rmii_tx_en,
                rmii_txd0,
                rmii_txd1,
            ),
            &mut DES_RING,
            mac,
            ccdr.peripheral.ETH1MAC,
            &ccdr.clocks,
        )
    };

    let mut phy = ethernet::phy::LAN8742A::new(eth_mac.set_phy_addr(0));
    phy.phy_reset();
    phy.phy_init();
    unsafe {
        ethernet::enable_interrupt();
    }

    // Sensor-poll and stream ticks. Periods are reprogrammed from the
    // registers once those are loaded.
    let mut tim2 = dp.TIM2.timer(1.kHz(), ccdr.peripheral.TIM2, &ccdr.clocks);
    tim2.listen(Event::TimeOut);
    let mut tim3 = dp.TIM3.timer(1.kHz(), ccdr.peripheral.TIM3, &ccdr.clocks);
    tim3.listen(Event::TimeOut);

    // Conversion clocks to the backplane on TIM4 CH1/CH2.
    let _ = gpiod.pd12.into_alternate::<2>();
    let _ = gpiod.pd13.into_alternate::<2>();
    ccdr.peripheral.TIM4.enable();
    let mut clockgen = ClockGen::new(ccdr.clocks.timx_ker_ck().raw());
    clockgen.init();

    let green_led = gpioe.pe0.into_push_pull_output().erase();
    let red_led = gpioe.pe1.into_push_pull_output().erase();

    let sysclk_hz = ccdr.clocks.sys_ck().raw();
    let power = PowerRail::new(
        gpiof.pf2.into_push_pull_output().erase(),
        gpiof.pf3.into_push_pull_output().erase(),
        sysclk_hz,
    );

    Board {
        cs,
        eth_device,
        phy,
        i2c1,
        tim2,
        tim3,
        clockgen,
        green_led,
        red_led,
        power,
        sysclk_hz,
        mac,
    }
}
