//! System-issue tracking: a latched peripheral-error bitmap plus the
//! configuration and network error flags, and the red-LED blink mapping
//! they drive. Peripheral errors only clear on reboot.

use ardea_core::cnc::Peripheral;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

static PERIPHERAL_ERRORS: AtomicU32 = AtomicU32::new(0);
static CONFIGURATION_ERROR: AtomicBool = AtomicBool::new(false);
static NETWORK_ERROR: AtomicBool = AtomicBool::new(false);

/// Latch a hardware failure for the given peripheral.
pub fn hardware_failure(peripheral: Peripheral) {
    PERIPHERAL_ERRORS.fetch_or(1 << (peripheral as u32), Ordering::Relaxed);
    defmt::error!("hardware failure latched: {}", peripheral as u8);
}

pub fn peripheral_fail_mask() -> u32 {
    PERIPHERAL_ERRORS.load(Ordering::Relaxed)
}

pub fn any_peripheral_error() -> bool {
    peripheral_fail_mask() != 0
}

pub fn configuration_error_raise() {
    CONFIGURATION_ERROR.store(true, Ordering::Relaxed);
}

pub fn configuration_error_clear() {
    CONFIGURATION_ERROR.store(false, Ordering::Relaxed);
}

pub fn configuration_error() -> bool {
    CONFIGURATION_ERROR.load(Ordering::Relaxed)
}

pub fn network_error_raise() {
    NETWORK_ERROR.store(true, Ordering::Relaxed);
}

pub fn network_error_clear() {
    NETWORK_ERROR.store(false, Ordering::Relaxed);
}

pub fn network_error() -> bool {
    NETWORK_ERROR.load(Ordering::Relaxed)
}

/// Issue classes in display priority order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IssueLevel {
    Hardware,
    Configuration,
    Network,
    None,
}

pub fn highest_issue() -> IssueLevel {
    if any_peripheral_error() {
        IssueLevel::Hardware
    } else if configuration_error() {
        IssueLevel::Configuration
    } else if network_error() {
        IssueLevel::Network
    } else {
        IssueLevel::None
    }
}

/// Red-LED half-period for the current issue level; `None` means the LED
/// stays off (or solid, if forced by its register).
pub fn red_blink_half_period_ms(level: IssueLevel) -> Option<u32> {
    match level {
        IssueLevel::Hardware => Some(100),
        IssueLevel::Configuration => Some(250),
        IssueLevel::Network => Some(500),
        IssueLevel::None => None,
    }
}
