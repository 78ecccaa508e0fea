//! Typed control-plane seam.
//!
//! The HTTP/JSON front end is not part of this firmware; whatever serves
//! it builds a [`ControlRequest`], pushes it down the request channel and
//! awaits the reply, exactly like the boot-time bring-up task does. The
//! types here carry enough structure (status code, detail, allowed values)
//! for the front end to render a useful response without re-deriving
//! anything.

use ardea_core::cnc::{CncAction, CncOutcome, CncValue, Peripheral};
use ardea_core::dbcomm::CncKind;
use ardea_core::router::CncError;
use heapless::{String, Vec};
use rtic_sync::channel::Sender;

pub const REQUEST_QUEUE_DEPTH: usize = 4;
pub const REPLY_QUEUE_DEPTH: usize = 2;

pub type ReplySender = Sender<'static, ControlReply, REPLY_QUEUE_DEPTH>;

/// One operation from the control plane.
pub struct ControlRequest {
    pub uid: u32,
    pub op: ControlOp,
    pub reply: ReplySender,
}

pub enum ControlOp {
    /// The generic CNC verb: peripheral/action/address/value at a
    /// destination (a slot, the main board, or ALL). `kind` selects the
    /// full-response exchange or the short inline acknowledgment.
    Cnc {
        destination: i32,
        peripheral: Peripheral,
        action: CncAction,
        addr: u32,
        value: CncValue,
        kind: CncKind,
    },
    PowerGet,
    PowerSet(bool),
    LoopbackGet { destination: i32 },
    LoopbackSet { destination: i32, on: bool, offset: i32 },
    /// Per-slot configuration status: configured type, presence, reported
    /// hardware type.
    ConfigStatus { destination: i32 },
    /// Change a slot's configured board type; takes effect after reboot.
    ConfigSet { destination: i32, board_type: u32 },
    /// Anchor the stream timestamp wall clock.
    SetWallClock { epoch_secs: f64 },
    /// Fill both stream buffers with the incrementing placement pattern.
    TestFill { quaternion_form: bool },
}

/// Reply values, shaped for straightforward serialization upstream.
#[derive(Clone, Debug)]
pub enum ReplyValue {
    None,
    Uint(u32),
    Bool(bool),
    Text(String<64>),
    Loopback { on: bool, offset: i32 },
    Config(Vec<BoardConfigEntry, { ardea_core::MAX_BOARDS }>),
}

#[derive(Clone, Copy, Debug)]
pub struct BoardConfigEntry {
    pub destination: u8,
    pub cfg_type: u8,
    pub present: bool,
    /// Hardware-reported type, when the board answered.
    pub hw_type: Option<u32>,
    pub matches: bool,
}

/// Values the control plane may offer for a rejected field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllowedValues {
    None,
    Destinations { include_all: bool },
    Peripherals,
    Actions,
}

#[derive(Clone, Debug)]
pub struct ControlReply {
    pub uid: u32,
    pub code: u16,
    pub destination: i32,
    pub value: ReplyValue,
    pub detail: String<64>,
    pub allowed: AllowedValues,
}

impl ControlReply {
    pub fn ok(uid: u32, destination: i32, value: ReplyValue) -> Self {
        Self {
            uid,
            code: 200,
            destination,
            value,
            detail: String::new(),
            allowed: AllowedValues::None,
        }
    }

    pub fn error(uid: u32, code: u16, detail: &str, allowed: AllowedValues) -> Self {
        let mut d = String::new();
        let _ = d.push_str(&detail[..detail.len().min(64)]);
        Self {
            uid,
            code,
            destination: -1,
            value: ReplyValue::None,
            detail: d,
            allowed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 200
    }
}

/// HTTP-style status for a failed CNC exchange.
pub fn error_code(err: CncError) -> u16 {
    match err {
        CncError::ParamRange => 400,
        CncError::DeviceReported(_) => 400,
        CncError::DeviceAbsent => 412,
        CncError::Timeout | CncError::OsResource => 500,
    }
}

/// Fold a driver outcome into the caller-facing result.
pub fn outcome_result(outcome: CncOutcome) -> Result<CncOutcome, CncError> {
    match outcome.normalized() {
        CncOutcome::Timeout => Err(CncError::Timeout),
        CncOutcome::DeviceReported { code, .. } => Err(CncError::DeviceReported(code)),
        ok => Ok(ok),
    }
}

/// Register-map environment snapshot used while serving MCU reads.
pub struct SysEnv {
    pub uptime_sec: u32,
    pub trigger_mask: u32,
}

impl ardea_core::regmap::RegEnv for SysEnv {
    fn uptime_sec(&self) -> u32 {
        self.uptime_sec
    }

    fn peripheral_fail_mask(&self) -> u32 {
        crate::status::peripheral_fail_mask()
    }

    fn trigger_mask(&self) -> u32 {
        self.trigger_mask
    }
}
