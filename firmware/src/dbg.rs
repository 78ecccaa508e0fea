//! Shared diagnostic buffer for DBG-peripheral CNC reads.
//!
//! Status text for the control plane is staged here; the CNC response
//! carries the staged length and the follow-up large-buffer read drains
//! it.

use ardea_core::dbcomm::{BoardDriver, DelayBin};
use ardea_core::gather::GatherStats;
use ardea_core::regmap::{RegEnv, RegisterMap};
use ardea_core::MAX_BOARDS;
use core::fmt::Write;

pub const LARGE_BUF_SIZE: usize = 4096;

/// Debug addresses served by the main board.
pub const DBG_SYSTEM_STATUS: u32 = 0;
pub const DBG_REGISTER_LIST: u32 = 1;
pub const DBG_BUS_BASE: u32 = 2; // ..= 5, one per SPI bus
pub const DBG_BOARD_BASE: u32 = 16; // ..= 39, one per slot

pub struct DiagBuffer {
    buf: [u8; LARGE_BUF_SIZE],
    len: usize,
}

impl DiagBuffer {
    pub const fn new() -> Self {
        Self {
            buf: [0; LARGE_BUF_SIZE],
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn contents(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Write for DiagBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let room = LARGE_BUF_SIZE - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        // Truncation is acceptable for diagnostics output.
        Ok(())
    }
}

pub fn fill_board_stats(out: &mut DiagBuffer, driver: &BoardDriver, gather: &GatherStats) {
    out.clear();
    let id = driver.board_id() as usize;
    let s = &driver.stats;
    let g = &gather.slots[id.min(MAX_BOARDS - 1)];
    let _ = writeln!(out, "DB Task {}:", id);
    let _ = writeln!(out, "\tenabled               = {}", driver.is_enabled());
    let _ = writeln!(out, "\trxDataCnt             = {}", s.rx_data_cnt);
    let _ = writeln!(out, "\trxCmdsCnt             = {}", s.rx_cmds_cnt);
    let _ = writeln!(out, "\tCRC Error Count       = {}", s.crc_errors);
    let _ = writeln!(out, "\tRetry Cmd Count       = {}", s.resend_cnc_cnt);
    let _ = writeln!(out, "\tEnable Count          = {}", s.enabled_cnt);
    let _ = writeln!(out, "\tMismatch Count        = {}", s.mismatch_cnt);
    let _ = writeln!(
        out,
        "\tDelay bins (=, -1, +1, >) = {} {} {} {}",
        s.delay_bins[DelayBin::Target as usize],
        s.delay_bins[DelayBin::Less1 as usize],
        s.delay_bins[DelayBin::Greater1 as usize],
        s.delay_bins[DelayBin::Greater as usize],
    );
    let _ = writeln!(out, "\tsentPkts              = {} {}", g.sent_pkts[0], g.sent_pkts[1]);
    let _ = writeln!(out, "\tmissedData            = {}", g.missed_data);
    let _ = writeln!(out, "\toverwrittenData       = {}", g.overwritten_data);
    let _ = writeln!(out, "\talignmentData         = {}", g.alignment_data);
}

pub fn fill_bus_stats(out: &mut DiagBuffer, bus: usize, stats: &crate::spi::BusStats) {
    out.clear();
    let _ = writeln!(out, "SPI bus {}:", bus);
    let _ = writeln!(out, "\ttransfers    = {}", stats.transfers);
    let _ = writeln!(out, "\tcrc errors   = {}", stats.crc_errors);
    let _ = writeln!(out, "\thw errors    = {}", stats.hw_errors);
    let _ = writeln!(out, "\tqueue drops  = {}", stats.queue_drops);
    let _ = writeln!(out, "\tenabled slots= {}", stats.enabled_slots);
}

pub fn fill_register_list(out: &mut DiagBuffer, regs: &RegisterMap, env: &impl RegEnv) {
    out.clear();
    for id in 0..ardea_core::regmap::MB_REG_COUNT as u32 {
        let Ok(name) = regs.name_of(id) else { continue };
        match regs.read(id, env) {
            Ok(ardea_core::regmap::RegValue::Uint(v)) => {
                let _ = writeln!(out, "{:2} {:<24} = {}", id, name, v);
            }
            Ok(ardea_core::regmap::RegValue::Int(v)) => {
                let _ = writeln!(out, "{:2} {:<24} = {}", id, name, v);
            }
            Ok(ardea_core::regmap::RegValue::Str(s)) => {
                let _ = writeln!(out, "{:2} {:<24} = {}", id, name, s.as_str());
            }
            Err(_) => {}
        }
    }
}

pub fn fill_system_status(out: &mut DiagBuffer) {
    out.clear();
    if crate::status::any_peripheral_error() {
        let _ = writeln!(out, "Peripheral Error Present");
        let _ = writeln!(out, "\tfail mask = {:#010x}", crate::status::peripheral_fail_mask());
    } else {
        let _ = writeln!(out, "No Errors");
    }
    if crate::status::configuration_error() {
        let _ = writeln!(out, "Sensor configuration mismatch");
    }
    if crate::status::network_error() {
        let _ = writeln!(out, "Network error");
    }
}
