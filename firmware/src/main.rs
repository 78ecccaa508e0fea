//! Main-controller firmware for the 24-slot sensor acquisition chassis.
//!
//! Data plane: TIM2 fans a poll tick out to every enabled slot driver, the
//! four SPI bus engines run the exchanges over DMA, and received sensor
//! frames land in the active stream-packet buffer. TIM3 swaps the packet
//! buffers and ships the frozen one over UDP or TCP. Control plane: typed
//! requests come down a channel, become CNC exchanges with a slot (or a
//! local peripheral dispatch), and the caller is woken with the outcome or
//! a timeout.

#![no_main]
#![no_std]

use core::sync::atomic::{AtomicU32, Ordering};

use defmt_rtt as _;
use panic_probe as _;

use rtic_monotonics::systick::prelude::*;

mod clocks;
mod control;
mod dbg;
mod drivers;
mod net;
mod power;
mod setup;
mod spi;
mod status;
mod time;

systick_monotonic!(Mono, 1_000);

/// One bit per slot; set bits receive a poll on every sensor tick. The
/// tick ISR only reads it, so enable/disable is a store away from any
/// context.
static TRIGGER_MASK: AtomicU32 = AtomicU32::new(0);

const ALL_BOARDS_MASK: u32 = 0x00FF_FFFF;

pub fn trigger_mask() -> u32 {
    TRIGGER_MASK.load(Ordering::Relaxed)
}

pub fn trigger_set(mask: u32) {
    TRIGGER_MASK.store(mask & ALL_BOARDS_MASK, Ordering::Relaxed);
}

pub fn trigger_enable(slot: usize, on: bool) {
    if on {
        TRIGGER_MASK.fetch_or(1 << slot, Ordering::Relaxed);
    } else {
        TRIGGER_MASK.fetch_and(!(1 << slot), Ordering::Relaxed);
    }
}

fn mono_secs() -> f64 {
    Mono::now().duration_since_epoch().to_micros() as f64 / 1e6
}

fn mono_millis() -> i64 {
    Mono::now().duration_since_epoch().to_millis() as i64
}

#[rtic::app(device = hal::pac, peripherals = true, dispatchers = [EXTI0, EXTI1, EXTI2])]
mod app {
    use super::*;
    use crate::control::{
        AllowedValues, BoardConfigEntry, ControlOp, ControlReply, ControlRequest, ReplyValue,
        SysEnv, REPLY_QUEUE_DEPTH, REQUEST_QUEUE_DEPTH,
    };
    use crate::drivers::eeprom_m24::Eeprom;
    use crate::drivers::fan_max31760::FanController;
    use ardea_core::board::BoardType;
    use ardea_core::cnc::{CncAction, CncOutcome, CncValue, CncWirePayload, Peripheral};
    use ardea_core::dbcomm::{BoardDriver, CncKind, CncRequest, Output, Outputs};
    use ardea_core::gather::{GatherEngine, PacketLayout};
    use ardea_core::link::{Inbound, LinkError};
    use ardea_core::regmap::{MbRegId, RegValue, RegisterMap, SbRegId, WriteEffect};
    use ardea_core::router::{self, CncError, Destination, LocalPeripherals};
    use ardea_core::{bus_of_slot, MAX_BOARDS, SPI_BUS_COUNT, TRANSIENT_TIMEOUT_MS};
    use hal::ethernet::PHY as _;
    use hal::gpio::{ErasedPin, Output as PinOutput};
    use hal::i2c::I2c;
    use hal::pac;
    use hal::prelude::*;
    use heapless::Vec as HVec;
    use rtic_sync::channel::{Receiver, Sender};
    use rtic_sync::make_channel;

    const FW_VERSION: (u32, u32, u32, u32) = (2, 1, 0, 0);

    /// Rounds of settling we give the sensor boards to come up at boot.
    const DB_UP_RETRY_MAX: u32 = 5;

    const DONE_QUEUE_DEPTH: usize = 8;

    type DoneSender = Sender<'static, (u32, CncOutcome), DONE_QUEUE_DEPTH>;
    type DoneReceiver = Receiver<'static, (u32, CncOutcome), DONE_QUEUE_DEPTH>;
    type CtrlSender = Sender<'static, ControlRequest, REQUEST_QUEUE_DEPTH>;
    type CtrlReceiver = Receiver<'static, ControlRequest, REQUEST_QUEUE_DEPTH>;

    /// The four bus engines plus the chip-select bank they share.
    pub struct Link {
        pub buses: [spi::BusEngine; SPI_BUS_COUNT],
        pub cs: spi::CsPins,
    }

    #[shared]
    struct Shared {
        link: Link,
        boards: [BoardDriver; MAX_BOARDS],
        gather: GatherEngine,
        regs: RegisterMap,
        i2c1: I2c<pac::I2C1>,
        fan: FanController,
        power: crate::power::PowerRail,
        diag: dbg::DiagBuffer,
        net: net::Net,
        wall: crate::time::WallClock,
        tim2: hal::timer::Timer<pac::TIM2>,
        tim3: hal::timer::Timer<pac::TIM3>,
        clockgen: clocks::ClockGen,
        done_tx: DoneSender,
        /// Entry point for the control-plane front end (HTTP/CLI, served
        /// elsewhere): clone, send a request, await the reply channel.
        ctrl_tx: CtrlSender,
    }

    #[local]
    struct Local {
        green_led: ErasedPin<PinOutput>,
        red_led: ErasedPin<PinOutput>,
        phy: hal::ethernet::phy::LAN8742A<hal::ethernet::EthernetMAC>,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local) {
        let mut regs = RegisterMap::new(FW_VERSION);
        defmt::assert!(regs.verify(), "register table out of order");

        let board = setup::setup(cx.device, &mut regs);
        Mono::start(cx.core.SYST, board.sysclk_hz);

        let env = SysEnv {
            uptime_sec: 0,
            trigger_mask: 0,
        };
        let reg_uint = |regs: &RegisterMap, id: MbRegId, dflt: u32| {
            regs.read(id as u32, &env)
                .ok()
                .and_then(|v| v.as_uint())
                .unwrap_or(dflt)
        };

        // Packet layout is computed once, from the slot registers.
        let layout = PacketLayout::compute(&regs.board_population());
        if layout.oversize {
            defmt::error!("stream layout exceeds one MTU; extra records are dropped");
        }
        defmt::info!(
            "stream layout: {} mcg, {} ecg, {} ecg12, {} imu, {} bytes",
            layout.counts.mcg,
            layout.counts.ecg,
            layout.counts.ecg12,
            layout.counts.imu,
            layout.packet_len(),
        );
        let mut gather = GatherEngine::new(layout);

        let stream_us = reg_uint(&regs, MbRegId::StreamIntervalUs, 1_000);
        let spi_us = reg_uint(&regs, MbRegId::DbSpiIntervalUs, 1_000);
        gather.set_interval_us(stream_us);
        let mut tim2 = board.tim2;
        let mut tim3 = board.tim3;
        tim2.set_timeout(spi_us.micros());
        tim3.set_timeout(stream_us.micros());

        let boards: [BoardDriver; MAX_BOARDS] =
            core::array::from_fn(|slot| BoardDriver::new(slot as u8));
        let buses: [spi::BusEngine; SPI_BUS_COUNT] = core::array::from_fn(spi::BusEngine::new);

        let net_config = net::NetConfig {
            ip: reg_uint(&regs, MbRegId::IpAddr, 0),
            netmask: reg_uint(&regs, MbRegId::Netmask, 0),
            gateway: reg_uint(&regs, MbRegId::Gateway, 0),
            udp_server_ip: reg_uint(&regs, MbRegId::UdpServerIp, 0),
            udp_server_port: reg_uint(&regs, MbRegId::UdpServerPort, 5_005) as u16,
            udp_tx_port: reg_uint(&regs, MbRegId::UdpTxPort, 5_004) as u16,
            tcp_port: reg_uint(&regs, MbRegId::TcpClientPort, 5_006) as u16,
            mode: ardea_core::regmap::IpType::try_from(reg_uint(&regs, MbRegId::IpTxDataType, 0))
                .unwrap_or(ardea_core::regmap::IpType::Udp),
        };
        static mut NET_STORAGE: net::NetStorage = net::NetStorage::new();
        let net = net::Net::new(
            board.eth_device,
            board.mac,
            unsafe { &mut NET_STORAGE },
            net_config,
            0,
        );

        let fan = FanController::new(reg_uint(&regs, MbRegId::FanPop, 0x3) as u8);

        let (ctrl_tx, ctrl_rx) = make_channel!(ControlRequest, REQUEST_QUEUE_DEPTH);
        let (done_tx, done_rx) = make_channel!((u32, CncOutcome), DONE_QUEUE_DEPTH);

        cnc_service::spawn(ctrl_rx, done_rx).ok();
        bringup::spawn(ctrl_tx.clone()).ok();
        net_watch::spawn().ok();
        led_blink::spawn().ok();

        (
            Shared {
                link: Link {
                    buses,
                    cs: board.cs,
                },
                boards,
                gather,
                regs,
                i2c1: board.i2c1,
                fan,
                power: board.power,
                diag: dbg::DiagBuffer::new(),
                net,
                wall: crate::time::WallClock::new(),
                tim2,
                tim3,
                clockgen: board.clockgen,
                done_tx,
                ctrl_tx,
            },
            Local {
                green_led: board.green_led,
                red_led: board.red_led,
                phy: board.phy,
            },
        )
    }

    #[idle]
    fn idle(_cx: idle::Context) -> ! {
        loop {
            cortex_m::asm::wfi();
        }
    }

    /// Route one driver's outputs: frames to its bus, sensor data to the
    /// packet, completions to the CNC service, state changes everywhere
    /// they matter.
    fn drain_outputs(
        slot: usize,
        outputs: Outputs,
        buses: &mut [spi::BusEngine; SPI_BUS_COUNT],
        gather: &mut GatherEngine,
        done_tx: &mut DoneSender,
    ) {
        for output in outputs {
            match output {
                Output::Send(frame) => buses[bus_of_slot(slot)].enqueue(slot as u8, frame),
                Output::Sensor(update) => gather.write_sensor(slot, &update),
                Output::Cnc(token, outcome) => {
                    if done_tx.try_send((token, outcome)).is_err() {
                        // The waiting caller is gone and the queue backed
                        // up; the completion is stale.
                        defmt::warn!("dropped stale CNC completion from slot {}", slot);
                    }
                }
                Output::StateChange { enabled } => {
                    defmt::info!("slot {} {}", slot, if enabled { "up" } else { "down" });
                    gather.set_board_state(slot, enabled);
                    trigger_enable(slot, enabled);
                }
                Output::DdsSync => {}
            }
        }
    }

    /// Sensor tick: one poll per enabled slot, then start the bus queues.
    #[task(binds = TIM2, priority = 5, shared = [link, boards, gather, done_tx])]
    fn sensor_tick(cx: sensor_tick::Context) {
        unsafe { (*pac::TIM2::ptr()).sr.modify(|_, w| w.uif().clear_bit()) }

        (
            cx.shared.link,
            cx.shared.boards,
            cx.shared.gather,
            cx.shared.done_tx,
        )
            .lock(|link, boards, gather, done_tx| {
                let mask = trigger_mask();
                let Link { buses, cs } = link;
                for slot in 0..MAX_BOARDS {
                    if mask & (1 << slot) != 0 {
                        let outputs = boards[slot].on_tick();
                        drain_outputs(slot, outputs, buses, gather, done_tx);
                    }
                }
                for (i, bus) in buses.iter_mut().enumerate() {
                    let on_bus = mask >> (i * ardea_core::BOARDS_PER_BUS);
                    bus.set_enabled_slots((on_bus & 0x3F).count_ones());
                    bus.service(cs);
                }
            });
    }

    fn bus_rx_complete(
        bus: usize,
        link: &mut Link,
        boards: &mut [BoardDriver; MAX_BOARDS],
        gather: &mut GatherEngine,
        done_tx: &mut DoneSender,
    ) {
        let Link { buses, cs } = link;
        if let Some((slot, result)) = buses[bus].complete(cs) {
            match result {
                Ok(frame) => {
                    let inbound = Inbound::classify(&frame);
                    let outputs = boards[slot as usize].on_inbound(&inbound);
                    drain_outputs(slot as usize, outputs, buses, gather, done_tx);
                }
                Err(LinkError::Crc { .. }) => {
                    boards[slot as usize].on_crc_error();
                    buses[bus].note_crc_error();
                }
                Err(LinkError::UnknownCmd(_)) => {
                    // Bus noise or a board talking garbage; already counted
                    // as a hardware error by the engine.
                }
            }
        }
        buses[bus].service(cs);
    }

    #[task(binds = DMA1_STR0, priority = 5, shared = [link, boards, gather, done_tx])]
    fn bus0_rx(cx: bus0_rx::Context) {
        (
            cx.shared.link,
            cx.shared.boards,
            cx.shared.gather,
            cx.shared.done_tx,
        )
            .lock(|link, boards, gather, done_tx| {
                bus_rx_complete(0, link, boards, gather, done_tx);
            });
    }

    #[task(binds = DMA1_STR2, priority = 5, shared = [link, boards, gather, done_tx])]
    fn bus1_rx(cx: bus1_rx::Context) {
        (
            cx.shared.link,
            cx.shared.boards,
            cx.shared.gather,
            cx.shared.done_tx,
        )
            .lock(|link, boards, gather, done_tx| {
                bus_rx_complete(1, link, boards, gather, done_tx);
            });
    }

    #[task(binds = DMA1_STR4, priority = 5, shared = [link, boards, gather, done_tx])]
    fn bus2_rx(cx: bus2_rx::Context) {
        (
            cx.shared.link,
            cx.shared.boards,
            cx.shared.gather,
            cx.shared.done_tx,
        )
            .lock(|link, boards, gather, done_tx| {
                bus_rx_complete(2, link, boards, gather, done_tx);
            });
    }

    #[task(binds = DMA1_STR6, priority = 5, shared = [link, boards, gather, done_tx])]
    fn bus3_rx(cx: bus3_rx::Context) {
        (
            cx.shared.link,
            cx.shared.boards,
            cx.shared.gather,
            cx.shared.done_tx,
        )
            .lock(|link, boards, gather, done_tx| {
                bus_rx_complete(3, link, boards, gather, done_tx);
            });
    }

    /// Stream tick: freeze, stamp and ship the packet. Runs above
    /// everything else so the swap always makes progress.
    #[task(binds = TIM3, priority = 6, shared = [gather, net, wall])]
    fn stream_tick(cx: stream_tick::Context) {
        unsafe { (*pac::TIM3::ptr()).sr.modify(|_, w| w.uif().clear_bit()) }

        (cx.shared.gather, cx.shared.net, cx.shared.wall).lock(|gather, net, wall| {
            let bytes = gather.ship(|| wall.now(mono_secs()));
            net.ship(bytes);
            net.poll(mono_millis());
        });
    }

    #[task(binds = ETH, priority = 3, shared = [net])]
    fn eth_irq(mut cx: eth_irq::Context) {
        unsafe { hal::ethernet::interrupt_handler() }
        cx.shared.net.lock(|net| {
            net.poll(mono_millis());
        });
    }

    /// Network housekeeping: PHY link supervision and periodic socket
    /// polling for timers and retransmits.
    #[task(priority = 1, shared = [net], local = [phy])]
    async fn net_watch(mut cx: net_watch::Context) {
        let mut link_up = false;
        loop {
            let up = cx.local.phy.poll_link();
            if up != link_up {
                link_up = up;
                if up {
                    defmt::info!("ethernet link up");
                    status::network_error_clear();
                } else {
                    defmt::warn!("ethernet link down");
                    status::network_error_raise();
                }
            }
            cx.shared.net.lock(|net| {
                net.poll(mono_millis());
            });
            Mono::delay(100.millis()).await;
        }
    }

    /// LED supervision: green steady or slow-blinking per its register,
    /// red blinking at the highest-priority issue rate.
    #[task(priority = 1, shared = [regs], local = [green_led, red_led])]
    async fn led_blink(mut cx: led_blink::Context) {
        const SLICE_MS: u32 = 50;
        let mut elapsed: u32 = 0;
        let mut green_phase = false;
        let mut red_phase = false;
        loop {
            let (green_solid, red_forced) = cx.shared.regs.lock(|regs| {
                let env = SysEnv {
                    uptime_sec: mono_secs() as u32,
                    trigger_mask: trigger_mask(),
                };
                let read = |id: MbRegId| {
                    regs.read(id as u32, &env)
                        .ok()
                        .and_then(|v| v.as_uint())
                        .unwrap_or(0)
                };
                (read(MbRegId::GreenLedOn) != 0, read(MbRegId::RedLedOn) != 0)
            });

            if green_solid {
                cx.local.green_led.set_high();
            } else if elapsed % 1_000 == 0 {
                green_phase = !green_phase;
                cx.local.green_led.set_state(green_phase.into());
            }

            if red_forced {
                cx.local.red_led.set_high();
            } else {
                match status::red_blink_half_period_ms(status::highest_issue()) {
                    Some(half) => {
                        if elapsed % half == 0 {
                            red_phase = !red_phase;
                            cx.local.red_led.set_state(red_phase.into());
                        }
                    }
                    None => cx.local.red_led.set_low(),
                }
            }

            elapsed = elapsed.wrapping_add(SLICE_MS);
            Mono::delay(SLICE_MS.millis()).await;
        }
    }

    /// Delayed system reset, armed by a REBOOT_FLAG write.
    #[task(priority = 1)]
    async fn reboot(_cx: reboot::Context, delay_ms: u32) {
        defmt::warn!("rebooting in {} ms", delay_ms);
        Mono::delay(delay_ms.millis()).await;
        cortex_m::peripheral::SCB::sys_reset();
    }

    /// Boot orchestration: rail up, drivers enabled, wait for the expected
    /// population to answer, then verify configured against reported board
    /// types.
    #[task(priority = 1, shared = [power, gather, boards])]
    async fn bringup(mut cx: bringup::Context, mut ctrl_tx: CtrlSender) {
        cx.shared.power.lock(|power| {
            power.set(true);
        });

        let expected = cx.shared.gather.lock(|g| g.layout().expected_mask());
        let enable_expected = |boards: &mut [BoardDriver; MAX_BOARDS],
                               gather: &mut GatherEngine| {
            for slot in 0..MAX_BOARDS {
                if expected & (1 << slot) != 0 {
                    boards[slot].set_enabled(true);
                    gather.set_board_state(slot, true);
                }
            }
        };
        (&mut cx.shared.boards, &mut cx.shared.gather).lock(|b, g| enable_expected(b, g));
        trigger_set(expected);

        // ECG12 boards take the longest to boot; retry the population a few
        // times before flagging anything.
        let mut present = 0u32;
        for round in 0..=DB_UP_RETRY_MAX {
            Mono::delay(2_000.millis()).await;
            present = cx.shared.boards.lock(|boards| {
                boards
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| b.is_present())
                    .fold(0u32, |m, (i, _)| m | 1 << i)
            });
            if present & expected == expected {
                break;
            }
            defmt::info!(
                "bring-up round {}: present {:#08x}, expected {:#08x}",
                round,
                present,
                expected
            );
            (&mut cx.shared.boards, &mut cx.shared.gather).lock(|b, g| enable_expected(b, g));
            trigger_set(expected);
        }
        if present & expected != expected {
            defmt::error!("boards missing after bring-up: {:#08x}", !present & expected);
        }

        // Probe each populated slot's hardware type over CNC and compare
        // with the configured slot register.
        let (reply_tx, mut reply_rx) = make_channel!(ControlReply, REPLY_QUEUE_DEPTH);
        let mut all_match = true;
        for slot in 0..MAX_BOARDS {
            if expected & (1 << slot) == 0 {
                continue;
            }
            let request = ControlRequest {
                uid: slot as u32,
                op: ControlOp::Cnc {
                    destination: slot as i32,
                    peripheral: Peripheral::Mcu,
                    action: CncAction::Read,
                    addr: SbRegId::HwType as u32,
                    value: CncValue::None,
                    kind: CncKind::Long,
                },
                reply: reply_tx.clone(),
            };
            if ctrl_tx.send(request).await.is_err() {
                break;
            }
            let Ok(reply) = reply_rx.recv().await else {
                break;
            };
            let hw = match (reply.is_success(), &reply.value) {
                (true, ReplyValue::Uint(v)) => {
                    BoardType::try_from(*v as u8).unwrap_or(BoardType::Unknown)
                }
                _ => BoardType::Unknown,
            };
            let matches = cx.shared.gather.lock(|gather| {
                gather.record_hw_type(slot, hw);
                gather.config_matches(slot)
            });
            if !matches {
                all_match = false;
                defmt::warn!("slot {} reports type {} != configured", slot, hw as u8);
            }
        }
        if all_match {
            status::configuration_error_clear();
        } else {
            status::configuration_error_raise();
        }
        defmt::info!("bring-up complete");
    }

    /// The CNC service: executes control operations, owning the
    /// suspend-on-completion contract with the slot drivers.
    #[task(priority = 2, shared = [link, boards, gather, regs, i2c1, fan, power, diag, wall, tim2, tim3, clockgen])]
    async fn cnc_service(
        mut cx: cnc_service::Context,
        mut ctrl_rx: CtrlReceiver,
        mut done_rx: DoneReceiver,
    ) {
        let mut seq: u32 = 0;
        while let Ok(mut request) = ctrl_rx.recv().await {
            let uid = request.uid;
            let reply = match request.op {
                ControlOp::Cnc {
                    destination,
                    peripheral,
                    action,
                    addr,
                    value,
                    kind,
                } => {
                    execute_cnc(
                        &mut cx,
                        &mut seq,
                        &mut done_rx,
                        uid,
                        destination,
                        peripheral,
                        action,
                        addr,
                        value,
                        kind,
                    )
                    .await
                }
                ControlOp::PowerGet => {
                    let on = cx.shared.power.lock(|p| p.is_enabled());
                    ControlReply::ok(
                        uid,
                        i32::from(ardea_core::MAIN_BOARD_ID),
                        ReplyValue::Bool(on),
                    )
                }
                ControlOp::PowerSet(on) => {
                    let changed = cx.shared.power.lock(|p| p.set(on));
                    if changed {
                        if on {
                            let expected = cx.shared.gather.lock(|g| g.layout().expected_mask());
                            cx.shared.boards.lock(|boards| {
                                for slot in 0..MAX_BOARDS {
                                    if expected & (1 << slot) != 0 {
                                        boards[slot].set_enabled(true);
                                    }
                                }
                            });
                            trigger_set(expected);
                        } else {
                            trigger_set(0);
                        }
                    }
                    ControlReply::ok(
                        uid,
                        i32::from(ardea_core::MAIN_BOARD_ID),
                        ReplyValue::Bool(on),
                    )
                }
                ControlOp::LoopbackGet { destination } => {
                    match Destination::parse(destination, false) {
                        Ok(Destination::Board(slot)) => {
                            let (on, offset) = cx
                                .shared
                                .boards
                                .lock(|boards| boards[slot as usize].loopback_params());
                            ControlReply::ok(uid, destination, ReplyValue::Loopback { on, offset })
                        }
                        _ => destination_error(uid, destination),
                    }
                }
                ControlOp::LoopbackSet {
                    destination,
                    on,
                    offset,
                } => match Destination::parse(destination, false) {
                    Ok(Destination::Board(slot)) => {
                        cx.shared
                            .boards
                            .lock(|boards| boards[slot as usize].set_loopback(on, offset));
                        if on {
                            // Loopback frames are synthesized off the tick,
                            // so the slot must be polled even with no board
                            // fitted.
                            trigger_enable(slot as usize, true);
                        }
                        ControlReply::ok(uid, destination, ReplyValue::Loopback { on, offset })
                    }
                    _ => destination_error(uid, destination),
                },
                ControlOp::ConfigStatus { destination } => {
                    config_status(&mut cx, destination, uid)
                }
                ControlOp::ConfigSet {
                    destination,
                    board_type,
                } => config_set(&mut cx, destination, board_type, uid),
                ControlOp::SetWallClock { epoch_secs } => {
                    cx.shared.wall.lock(|wall| wall.set(epoch_secs, mono_secs()));
                    ControlReply::ok(uid, i32::from(ardea_core::MAIN_BOARD_ID), ReplyValue::None)
                }
                ControlOp::TestFill { quaternion_form } => {
                    cx.shared.gather.lock(|gather| gather.test_fill(quaternion_form));
                    ControlReply::ok(uid, i32::from(ardea_core::MAIN_BOARD_ID), ReplyValue::None)
                }
            };
            let _ = request.reply.try_send(reply);
        }
    }

    fn destination_error(uid: u32, destination: i32) -> ControlReply {
        defmt::warn!("destination {} out of range", destination);
        ControlReply::error(
            uid,
            400,
            "destination value error",
            AllowedValues::Destinations { include_all: false },
        )
    }

    /// Serve one CNC verb, fanning out when the destination is ALL.
    #[allow(clippy::too_many_arguments)]
    async fn execute_cnc(
        cx: &mut cnc_service::Context<'_>,
        seq: &mut u32,
        done_rx: &mut DoneReceiver,
        uid: u32,
        destination: i32,
        peripheral: Peripheral,
        action: CncAction,
        addr: u32,
        value: CncValue,
        kind: CncKind,
    ) -> ControlReply {
        let dest = match Destination::parse(destination, true) {
            Ok(d) => d,
            Err(_) => return destination_error(uid, destination),
        };
        if !router::peripheral_allowed(dest, peripheral) {
            return ControlReply::error(
                uid,
                400,
                "peripheral value error on main board",
                AllowedValues::Peripherals,
            );
        }
        let payload = CncWirePayload::request(peripheral, action, addr, value);

        match dest {
            Destination::MainBoard => dispatch_main_board(cx, uid, &payload),
            Destination::Board(slot) => {
                board_exchange(cx, seq, done_rx, uid, slot, kind, &payload).await
            }
            Destination::All => {
                // Strictly sequential: each slot's exchange completes (or
                // times out) before the next begins.
                let mut ok_count = 0u32;
                let mut last_err: Option<ControlReply> = None;
                for slot in 0..MAX_BOARDS as u8 {
                    let reply =
                        board_exchange(cx, seq, done_rx, uid, slot, kind, &payload).await;
                    if reply.is_success() {
                        ok_count += 1;
                    } else if reply.code != 412 {
                        last_err = Some(reply);
                    }
                }
                match last_err {
                    Some(err) if ok_count == 0 => err,
                    _ => {
                        ControlReply::ok(uid, router::DESTINATION_ALL, ReplyValue::Uint(ok_count))
                    }
                }
            }
        }
    }

    /// Local dispatcher access bundle for MCU/FAN/PWR/DBG requests.
    struct MainPeriph<'a> {
        regs: &'a mut RegisterMap,
        i2c: &'a mut I2c<pac::I2C1>,
        fan: &'a mut FanController,
        power: &'a mut crate::power::PowerRail,
        diag: &'a mut dbg::DiagBuffer,
        gather: &'a mut GatherEngine,
        boards: &'a [BoardDriver; MAX_BOARDS],
        buses: &'a [spi::BusEngine; SPI_BUS_COUNT],
        tim2: &'a mut hal::timer::Timer<pac::TIM2>,
        tim3: &'a mut hal::timer::Timer<pac::TIM3>,
        clockgen: &'a mut clocks::ClockGen,
        env: SysEnv,
    }

    impl<'a> LocalPeripherals for MainPeriph<'a> {
        fn reg_type(
            &self,
            addr: u32,
        ) -> Result<ardea_core::regmap::RegType, ardea_core::regmap::RegError> {
            self.regs.type_of(addr)
        }

        fn reg_read(&mut self, addr: u32) -> Result<RegValue, ardea_core::regmap::RegError> {
            self.regs.read(addr, &self.env)
        }

        fn reg_write(
            &mut self,
            addr: u32,
            value: RegValue,
        ) -> Result<RegValue, ardea_core::regmap::RegError> {
            let outcome = self.regs.write(addr, value)?;
            if let Some((id, ref value)) = outcome.persist {
                if Eeprom::new().store(self.i2c, id as u32, value).is_err() {
                    defmt::error!("eeprom persist failed for register {}", id as u32);
                    status::hardware_failure(Peripheral::Eeprom);
                }
            }
            if let Some(effect) = outcome.effect {
                self.apply_effect(effect);
            }
            self.regs.read(addr, &self.env)
        }

        fn fan_read(&mut self, addr: u32) -> Result<u32, u32> {
            self.fan.read(self.i2c, addr)
        }

        fn fan_write(&mut self, addr: u32, value: u8) -> Result<(), u32> {
            self.fan.write(self.i2c, addr, value)
        }

        fn power_enabled(&self) -> bool {
            self.power.is_enabled()
        }

        fn power_set(&mut self, on: bool) {
            if self.power.set(on) {
                trigger_set(if on {
                    self.gather.layout().expected_mask()
                } else {
                    0
                });
            }
        }

        fn debug_fill(&mut self, addr: u32) -> Result<u32, u32> {
            match addr {
                dbg::DBG_SYSTEM_STATUS => dbg::fill_system_status(self.diag),
                dbg::DBG_REGISTER_LIST => dbg::fill_register_list(self.diag, self.regs, &self.env),
                a if (dbg::DBG_BUS_BASE..dbg::DBG_BUS_BASE + SPI_BUS_COUNT as u32)
                    .contains(&a) =>
                {
                    let bus = (a - dbg::DBG_BUS_BASE) as usize;
                    dbg::fill_bus_stats(self.diag, bus, &self.buses[bus].stats);
                }
                a if (dbg::DBG_BOARD_BASE..dbg::DBG_BOARD_BASE + MAX_BOARDS as u32)
                    .contains(&a) =>
                {
                    let slot = (a - dbg::DBG_BOARD_BASE) as usize;
                    dbg::fill_board_stats(self.diag, &self.boards[slot], &self.gather.stats);
                }
                _ => return Err(router::RESULT_ERR_RESOURCE),
            }
            Ok(self.diag.len() as u32)
        }
    }

    impl<'a> MainPeriph<'a> {
        fn apply_effect(&mut self, effect: WriteEffect) {
            let read_uint = |regs: &RegisterMap, env: &SysEnv, id: MbRegId, dflt: u32| {
                regs.read(id as u32, env)
                    .ok()
                    .and_then(|v| v.as_uint())
                    .unwrap_or(dflt)
            };
            match effect {
                WriteEffect::StreamInterval => {
                    let us = read_uint(self.regs, &self.env, MbRegId::StreamIntervalUs, 1_000);
                    self.tim3.set_timeout(us.micros());
                    self.gather.set_interval_us(us);
                    defmt::info!("stream interval {} us", us);
                }
                WriteEffect::SpiInterval => {
                    let us = read_uint(self.regs, &self.env, MbRegId::DbSpiIntervalUs, 1_000);
                    self.tim2.set_timeout(us.micros());
                    defmt::info!("sensor poll interval {} us", us);
                }
                WriteEffect::AdcClockRate => {
                    let v = read_uint(self.regs, &self.env, MbRegId::AdcReadRate, 4_000);
                    self.clockgen.set_rate(clocks::ClockOutput::Adc, v);
                }
                WriteEffect::AdcClockDuty => {
                    let v = read_uint(self.regs, &self.env, MbRegId::AdcReadDuty, 50);
                    self.clockgen.set_duty(clocks::ClockOutput::Adc, v);
                }
                WriteEffect::DdsClockRate => {
                    let v = read_uint(self.regs, &self.env, MbRegId::DdsClkRate, 25_000);
                    self.clockgen.set_rate(clocks::ClockOutput::Dds, v);
                }
                WriteEffect::DdsClockDuty => {
                    let v = read_uint(self.regs, &self.env, MbRegId::DdsClkDuty, 50);
                    self.clockgen.set_duty(clocks::ClockOutput::Dds, v);
                }
                // The LED task re-reads its registers every slice.
                WriteEffect::GreenLed | WriteEffect::RedLed => {}
                WriteEffect::RebootFlag => {
                    let flag = read_uint(self.regs, &self.env, MbRegId::RebootFlag, 0);
                    if flag != 0 {
                        let delay = read_uint(self.regs, &self.env, MbRegId::RebootDelayMs, 1_000);
                        reboot::spawn(delay).ok();
                    }
                }
                WriteEffect::RebootDelay => {}
                WriteEffect::TriggerMask => {
                    // The new mask was just written into the table; read it
                    // back and apply.
                    let mask = read_uint(self.regs, &self.env, MbRegId::TriggerMask0, 0);
                    trigger_set(mask);
                }
                WriteEffect::FanPopulation => {
                    let v = read_uint(self.regs, &self.env, MbRegId::FanPop, 0x3);
                    self.fan.set_population(v as u8);
                }
            }
        }
    }

    fn dispatch_main_board(
        cx: &mut cnc_service::Context<'_>,
        uid: u32,
        payload: &CncWirePayload,
    ) -> ControlReply {
        let response = (
            &mut cx.shared.regs,
            &mut cx.shared.i2c1,
            &mut cx.shared.fan,
            &mut cx.shared.power,
            &mut cx.shared.diag,
            &mut cx.shared.gather,
            &mut cx.shared.boards,
            &mut cx.shared.link,
            &mut cx.shared.tim2,
            &mut cx.shared.tim3,
            &mut cx.shared.clockgen,
        )
            .lock(
                |regs, i2c, fan, power, diag, gather, boards, link, tim2, tim3, clockgen| {
                    let mut periph = MainPeriph {
                        regs,
                        i2c,
                        fan,
                        power,
                        diag,
                        gather,
                        boards,
                        buses: &link.buses,
                        tim2,
                        tim3,
                        clockgen,
                        env: SysEnv {
                            uptime_sec: mono_secs() as u32,
                            trigger_mask: trigger_mask(),
                        },
                    };
                    router::dispatch_local(payload, &mut periph)
                },
            );

        let dbg_read = response.peripheral == Peripheral::Dbg as u8;
        if response.result_or_size == router::RESULT_OK || dbg_read {
            reply_from_payload(uid, i32::from(ardea_core::MAIN_BOARD_ID), &response)
        } else {
            let code = if response.result_or_size == router::RESULT_ERR_STATE {
                412
            } else {
                400
            };
            ControlReply::error(uid, code, "cnc error", AllowedValues::None)
        }
    }

    fn reply_from_payload(uid: u32, destination: i32, payload: &CncWirePayload) -> ControlReply {
        ControlReply::ok(uid, destination, ReplyValue::Uint(payload.value_u32()))
    }

    /// One CNC exchange with a slot: reserve, submit, suspend on the
    /// completion channel, normalize the outcome.
    async fn board_exchange(
        cx: &mut cnc_service::Context<'_>,
        seq: &mut u32,
        done_rx: &mut DoneReceiver,
        uid: u32,
        slot: u8,
        kind: CncKind,
        payload: &CncWirePayload,
    ) -> ControlReply {
        *seq = seq.wrapping_add(1);
        let token = *seq;

        let submitted = cx.shared.boards.lock(|boards| {
            let board = &mut boards[slot as usize];
            if !board.is_present() {
                return Err(CncError::DeviceAbsent);
            }
            board
                .submit_cnc(CncRequest {
                    kind,
                    payload: *payload,
                    token,
                })
                .map_err(|_| CncError::OsResource)
        });
        if let Err(err) = submitted {
            return cnc_error_reply(uid, err);
        }

        // The driver always completes every accepted request, so the outer
        // timeout only fires if something is badly wrong; the reservation
        // then goes stale and late completions are discarded by token.
        let outcome = loop {
            match Mono::timeout_after(TRANSIENT_TIMEOUT_MS.millis(), done_rx.recv()).await {
                Ok(Ok((tok, outcome))) if tok == token => break Ok(outcome),
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => break Err(CncError::OsResource),
                Err(_) => {
                    defmt::error!("CNC completion overdue for slot {}", slot);
                    break Err(CncError::Timeout);
                }
            }
        };

        match outcome.and_then(control::outcome_result) {
            Ok(CncOutcome::Ok(reply)) => reply_from_payload(uid, i32::from(slot), &reply.payload),
            Ok(CncOutcome::Mismatch(reply)) => {
                let mut r = reply_from_payload(uid, i32::from(slot), &reply.payload);
                let _ = r.detail.push_str("mismatched response key");
                r
            }
            Ok(_) => cnc_error_reply(uid, CncError::Timeout),
            Err(err) => cnc_error_reply(uid, err),
        }
    }

    fn cnc_error_reply(uid: u32, err: CncError) -> ControlReply {
        let detail = match err {
            CncError::ParamRange => "parameter out of range",
            CncError::DeviceAbsent => "board absent",
            CncError::Timeout => "no response from board",
            CncError::OsResource => "no resources for request",
            CncError::DeviceReported(_) => "board reported error",
        };
        ControlReply::error(uid, control::error_code(err), detail, AllowedValues::None)
    }

    /// Configuration status for one slot or the whole chassis.
    fn config_status(cx: &mut cnc_service::Context<'_>, destination: i32, uid: u32) -> ControlReply {
        let range = match Destination::parse(destination, true) {
            Ok(Destination::All) => 0..MAX_BOARDS,
            Ok(Destination::Board(b)) => b as usize..b as usize + 1,
            _ => return destination_error(uid, destination),
        };
        let entries = (&mut cx.shared.gather, &mut cx.shared.boards).lock(|gather, boards| {
            let mut entries: HVec<BoardConfigEntry, MAX_BOARDS> = HVec::new();
            for slot in range {
                let hw = gather.hw_type(slot);
                let _ = entries.push(BoardConfigEntry {
                    destination: slot as u8,
                    cfg_type: gather.layout().slots[slot].kind as u8,
                    present: boards[slot].is_present(),
                    hw_type: (hw != BoardType::Unknown).then_some(hw as u32),
                    matches: gather.config_matches(slot),
                });
            }
            entries
        });
        ControlReply::ok(uid, destination, ReplyValue::Config(entries))
    }

    /// Update a slot's configured type; the packet layout only changes on
    /// the next boot.
    fn config_set(
        cx: &mut cnc_service::Context<'_>,
        destination: i32,
        board_type: u32,
        uid: u32,
    ) -> ControlReply {
        let slots: HVec<usize, MAX_BOARDS> = match Destination::parse(destination, true) {
            Ok(Destination::All) => (0..MAX_BOARDS).collect(),
            Ok(Destination::Board(b)) => core::iter::once(b as usize).collect(),
            _ => return destination_error(uid, destination),
        };
        let result = (&mut cx.shared.regs, &mut cx.shared.i2c1).lock(|regs, i2c| {
            for slot in slots {
                let Some(id) = MbRegId::sensor_board(slot) else {
                    continue;
                };
                let outcome = regs.write(id as u32, RegValue::Uint(board_type))?;
                if let Some((id, ref value)) = outcome.persist {
                    if Eeprom::new().store(i2c, id as u32, value).is_err() {
                        status::hardware_failure(Peripheral::Eeprom);
                    }
                }
            }
            Ok(())
        });
        match result {
            Ok(()) => ControlReply::ok(uid, destination, ReplyValue::Uint(board_type)),
            Err(ardea_core::regmap::RegError::WriteProtected) => ControlReply::error(
                uid,
                412,
                "manufacturing write lock is closed",
                AllowedValues::None,
            ),
            Err(_) => {
                ControlReply::error(uid, 400, "board type value error", AllowedValues::None)
            }
        }
    }
}
