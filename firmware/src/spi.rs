//! Four-bus SPI link engine.
//!
//! Each bus serves six chip-selected slots. An exchange is one 48-byte
//! full-duplex frame, moved by a DMA stream pair (tx on stream 2b+1, rx on
//! stream 2b); the rx transfer-complete interrupt finishes the exchange
//! and starts the next one queued on that bus. The SPI and DMA blocks are
//! driven at register level; pins and kernel clocks are set up in `setup`.

use ardea_core::link::{Frame, LinkError, FRAME_SIZE};
use ardea_core::{BOARDS_PER_BUS, MAX_BOARDS, SPI_BUS_COUNT};
use hal::gpio::{ErasedPin, Output};
use hal::pac;
use heapless::Deque;

/// Outstanding exchanges a bus will hold: a poll plus a CNC frame for each
/// of its six slots.
pub const BUS_QUEUE_DEPTH: usize = 2 * BOARDS_PER_BUS;

/// SPI kernel-clock divider: /32 keeps the edge rate comfortable on the
/// backplane flex harness.
const MBR_DIV32: u8 = 0b100;

// DMAMUX1 request lines (RM0433, DMAMUX request table).
const DMAREQ: [(u8, u8); SPI_BUS_COUNT] = [
    (37, 38), // SPI1 rx, tx
    (39, 40), // SPI2
    (61, 62), // SPI3
    (83, 84), // SPI4
];

// One frame buffer pair per bus, DMA1-reachable (AXI SRAM).
static mut TX_BUF: [[u8; FRAME_SIZE]; SPI_BUS_COUNT] = [[0; FRAME_SIZE]; SPI_BUS_COUNT];
static mut RX_BUF: [[u8; FRAME_SIZE]; SPI_BUS_COUNT] = [[0; FRAME_SIZE]; SPI_BUS_COUNT];

pub fn rx_stream(bus: usize) -> usize {
    2 * bus
}

pub fn tx_stream(bus: usize) -> usize {
    2 * bus + 1
}

fn spi_regs(bus: usize) -> &'static pac::spi1::RegisterBlock {
    // All four bus SPIs share one register layout.
    unsafe {
        match bus {
            0 => &*pac::SPI1::ptr(),
            1 => &*pac::SPI2::ptr(),
            2 => &*pac::SPI3::ptr(),
            _ => &*pac::SPI4::ptr(),
        }
    }
}

/// Clear all event flags of one DMA1 stream.
fn clear_dma_flags(stream: usize) {
    let dma = unsafe { &*pac::DMA1::ptr() };
    let shift = match stream % 4 {
        0 => 0,
        1 => 6,
        2 => 16,
        _ => 22,
    };
    let mask = 0b11_1101u32 << shift;
    if stream < 4 {
        dma.lifcr.write(|w| unsafe { w.bits(mask) });
    } else {
        dma.hifcr.write(|w| unsafe { w.bits(mask) });
    }
}

fn stream_enable(stream: usize, enable: bool) {
    let dma = unsafe { &*pac::DMA1::ptr() };
    dma.st[stream].cr.modify(|_, w| w.en().bit(enable));
    if !enable {
        while dma.st[stream].cr.read().en().bit_is_set() {}
    }
}

/// One-time configuration of a bus: SPI block in master mode with software
/// slave management, DMA streams pointed at the data registers.
pub fn init_bus(bus: usize) {
    let spi = spi_regs(bus);
    let dma = unsafe { &*pac::DMA1::ptr() };
    let mux = unsafe { &*pac::DMAMUX1::ptr() };

    spi.cr1.modify(|_, w| w.spe().clear_bit());
    spi.cfg1.modify(|_, w| unsafe {
        w.mbr()
            .bits(MBR_DIV32)
            .dsize()
            .bits(7) // 8-bit words
            .txdmaen()
            .set_bit()
            .rxdmaen()
            .set_bit()
    });
    spi.cfg2
        .modify(|_, w| w.master().set_bit().ssm().set_bit().afcntr().set_bit());
    spi.cr1.modify(|_, w| w.ssi().set_bit());

    let (rx_req, tx_req) = DMAREQ[bus];
    let (rxs, txs) = (rx_stream(bus), tx_stream(bus));

    mux.ccr[rxs].modify(|_, w| unsafe { w.dmareq_id().bits(rx_req) });
    mux.ccr[txs].modify(|_, w| unsafe { w.dmareq_id().bits(tx_req) });

    dma.st[rxs].par.write(|w| unsafe { w.bits(spi.rxdr.as_ptr() as u32) });
    dma.st[txs].par.write(|w| unsafe { w.bits(spi.txdr.as_ptr() as u32) });

    // rx: peripheral-to-memory, memory increment, transfer-complete irq
    dma.st[rxs].cr.write(|w| unsafe {
        w.dir().bits(0b00).minc().set_bit().tcie().set_bit().pl().bits(0b10)
    });
    // tx: memory-to-peripheral, memory increment
    dma.st[txs]
        .cr
        .write(|w| unsafe { w.dir().bits(0b01).minc().set_bit().pl().bits(0b10) });
}

fn start_transfer(bus: usize) {
    let spi = spi_regs(bus);
    let dma = unsafe { &*pac::DMA1::ptr() };
    let (rxs, txs) = (rx_stream(bus), tx_stream(bus));

    clear_dma_flags(rxs);
    clear_dma_flags(txs);
    unsafe {
        dma.st[rxs].m0ar.write(|w| w.bits(RX_BUF[bus].as_ptr() as u32));
        dma.st[txs].m0ar.write(|w| w.bits(TX_BUF[bus].as_ptr() as u32));
        dma.st[rxs].ndtr.write(|w| w.bits(FRAME_SIZE as u32));
        dma.st[txs].ndtr.write(|w| w.bits(FRAME_SIZE as u32));
    }
    stream_enable(rxs, true);
    stream_enable(txs, true);

    spi.ifcr.write(|w| w.eotc().set_bit().txtfc().set_bit());
    spi.cr2.modify(|_, w| unsafe { w.tsize().bits(FRAME_SIZE as u16) });
    spi.cr1.modify(|_, w| w.spe().set_bit());
    spi.cr1.modify(|_, w| w.cstart().set_bit());
}

fn stop_transfer(bus: usize) {
    let spi = spi_regs(bus);
    stream_enable(rx_stream(bus), false);
    stream_enable(tx_stream(bus), false);
    spi.cr1.modify(|_, w| w.spe().clear_bit());
    spi.ifcr.write(|w| w.eotc().set_bit().txtfc().set_bit());
}

#[derive(Clone, Copy, Default, Debug)]
pub struct BusStats {
    pub transfers: u32,
    pub crc_errors: u32,
    pub hw_errors: u32,
    pub queue_drops: u32,
    pub enabled_slots: u32,
}

/// All 24 chip selects, indexed by slot.
pub struct CsPins(pub [ErasedPin<Output>; MAX_BOARDS]);

impl CsPins {
    fn select(&mut self, slot: usize, active: bool) {
        // Active low.
        if active {
            self.0[slot].set_low();
        } else {
            self.0[slot].set_high();
        }
    }
}

/// Software side of one bus: the exchange queue and the slot currently on
/// the wire.
pub struct BusEngine {
    bus: usize,
    queue: Deque<(u8, Frame), BUS_QUEUE_DEPTH>,
    in_flight: Option<u8>,
    pub stats: BusStats,
}

impl BusEngine {
    /// The hardware side is configured by `init_bus` during board setup.
    pub fn new(bus: usize) -> Self {
        Self {
            bus,
            queue: Deque::new(),
            in_flight: None,
            stats: BusStats::default(),
        }
    }

    pub fn bus(&self) -> usize {
        self.bus
    }

    /// Queue one exchange. Overflow drops the frame and counts it; the
    /// next tick will retry the poll anyway.
    pub fn enqueue(&mut self, slot: u8, frame: Frame) {
        if self.queue.push_back((slot, frame)).is_err() {
            self.stats.queue_drops += 1;
        }
    }

    /// Start the next queued exchange if the wire is idle.
    pub fn service(&mut self, cs: &mut CsPins) {
        if self.in_flight.is_some() {
            return;
        }
        let Some((slot, frame)) = self.queue.pop_front() else {
            return;
        };
        unsafe {
            TX_BUF[self.bus] = frame.encode();
        }
        cs.select(slot as usize, true);
        self.in_flight = Some(slot);
        self.stats.transfers += 1;
        start_transfer(self.bus);
    }

    /// Handle the rx transfer-complete interrupt: close the exchange and
    /// hand back the decoded frame (or the link error).
    pub fn complete(&mut self, cs: &mut CsPins) -> Option<(u8, Result<Frame, LinkError>)> {
        let slot = self.in_flight.take()?;
        stop_transfer(self.bus);
        cs.select(slot as usize, false);
        let decoded = Frame::decode(unsafe { &RX_BUF[self.bus] });
        if matches!(decoded, Err(LinkError::UnknownCmd(_))) {
            self.stats.hw_errors += 1;
        }
        Some((slot, decoded))
    }

    pub fn note_crc_error(&mut self) {
        self.stats.crc_errors += 1;
    }

    pub fn set_enabled_slots(&mut self, count: u32) {
        self.stats.enabled_slots = count;
    }
}
