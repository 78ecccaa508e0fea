//! CNC request routing.
//!
//! Validates the destination, splits local main-board requests from
//! per-slot driver requests, and hosts the local peripheral dispatcher
//! (register map, fan controller, power switch, diagnostic buffer). The
//! suspend/wake plumbing around driver requests is the firmware's job;
//! everything decidable without an RTOS lives here.

use crate::cnc::{CncAction, CncWirePayload, Peripheral};
use crate::regmap::{RegError, RegType, RegValue};
use crate::{MAIN_BOARD_ID, MAX_BOARDS};

/// Raw control-plane destination value addressing every slot in turn.
pub const DESTINATION_ALL: i32 = -1;

/// Local dispatch result codes carried in `result_or_size`.
pub const RESULT_OK: u32 = 0;
pub const RESULT_ERR_PARAM: u32 = 1;
pub const RESULT_ERR_VALUE: u32 = 2;
pub const RESULT_ERR_RESOURCE: u32 = 3;
/// Write refused by state, e.g. manufacturing lock not open.
pub const RESULT_ERR_STATE: u32 = 4;

/// Terminal failures surfaced to a CNC caller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CncError {
    /// No queue slot / completion channel available.
    OsResource,
    /// Destination, peripheral or address out of range.
    ParamRange,
    /// Slot is disabled; nothing will answer.
    DeviceAbsent,
    Timeout,
    /// The device answered with a non-zero result code.
    DeviceReported(u32),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Destination {
    Board(u8),
    MainBoard,
    All,
}

/// Values accepted by [`Destination::parse`]; rendered into the control
/// plane's `allowed` array on rejection.
pub fn allowed_destinations(include_all: bool) -> impl Iterator<Item = i32> {
    let base = (0..MAX_BOARDS as i32).chain(core::iter::once(i32::from(MAIN_BOARD_ID)));
    let all = include_all.then_some(DESTINATION_ALL);
    all.into_iter().chain(base)
}

impl Destination {
    /// Validate a raw control-plane destination. `ALL` is only legal for
    /// operations that fan out.
    pub fn parse(raw: i32, allow_all: bool) -> Result<Self, CncError> {
        match raw {
            DESTINATION_ALL if allow_all => Ok(Self::All),
            v if v == i32::from(MAIN_BOARD_ID) => Ok(Self::MainBoard),
            v if (0..MAX_BOARDS as i32).contains(&v) => Ok(Self::Board(v as u8)),
            _ => Err(CncError::ParamRange),
        }
    }
}

/// Peripherals the main board answers for itself.
pub fn locally_handled(peripheral: Peripheral) -> bool {
    matches!(
        peripheral,
        Peripheral::Mcu | Peripheral::Fan | Peripheral::Dbg | Peripheral::Power
    )
}

/// On the main board only the MCU peripheral is addressable from the
/// control plane; sensor boards accept the full set.
pub fn peripheral_allowed(dest: Destination, peripheral: Peripheral) -> bool {
    match dest {
        Destination::MainBoard => peripheral == Peripheral::Mcu,
        _ => true,
    }
}

fn reg_error_code(err: RegError) -> u32 {
    match err {
        RegError::UnknownId => RESULT_ERR_PARAM,
        RegError::TypeMismatch | RegError::BadValue => RESULT_ERR_VALUE,
        RegError::ReadOnly => RESULT_ERR_VALUE,
        RegError::WriteProtected => RESULT_ERR_STATE,
    }
}

/// The local peripherals the dispatcher drives. The firmware implements
/// this over the real register map, fan IC, power rail and diagnostic
/// buffer; tests implement it over plain state.
pub trait LocalPeripherals {
    fn reg_type(&self, addr: u32) -> Result<RegType, RegError>;
    fn reg_read(&mut self, addr: u32) -> Result<RegValue, RegError>;
    /// Write and apply any register side effects before returning.
    fn reg_write(&mut self, addr: u32, value: RegValue) -> Result<RegValue, RegError>;

    fn fan_read(&mut self, addr: u32) -> Result<u32, u32>;
    fn fan_write(&mut self, addr: u32, value: u8) -> Result<(), u32>;

    fn power_enabled(&self) -> bool;
    fn power_set(&mut self, on: bool);

    /// Fill the shared diagnostic buffer for the given debug address and
    /// return the byte count, or an error code.
    fn debug_fill(&mut self, addr: u32) -> Result<u32, u32>;
}

/// Serve a main-board CNC request. Always returns a response payload; the
/// result code inside tells the caller how it went.
pub fn dispatch_local(
    request: &CncWirePayload,
    periph: &mut impl LocalPeripherals,
) -> CncWirePayload {
    let mut response = *request;
    response.result_or_size = RESULT_OK;

    let Ok(peripheral) = Peripheral::try_from(request.peripheral) else {
        response.result_or_size = RESULT_ERR_PARAM;
        return response;
    };
    if !locally_handled(peripheral) {
        response.result_or_size = RESULT_ERR_VALUE;
        return response;
    }
    let Ok(action) = CncAction::try_from(request.action) else {
        response.result_or_size = RESULT_ERR_PARAM;
        return response;
    };

    match peripheral {
        Peripheral::Mcu => dispatch_registers(request, action, periph, &mut response),
        Peripheral::Power => match action {
            CncAction::Read => {
                response.set_value(crate::cnc::CncValue::Bool(periph.power_enabled()));
            }
            CncAction::Write => periph.power_set(request.value_bool()),
            CncAction::ReadLargeBuffer => response.result_or_size = RESULT_ERR_PARAM,
        },
        Peripheral::Fan => match action {
            CncAction::Read => match periph.fan_read(request.addr) {
                Ok(v) => response.set_value(crate::cnc::CncValue::U32(v)),
                Err(code) => response.result_or_size = code,
            },
            CncAction::Write => {
                if let Err(code) = periph.fan_write(request.addr, request.value_u32() as u8) {
                    response.result_or_size = code;
                }
            }
            CncAction::ReadLargeBuffer => response.result_or_size = RESULT_ERR_PARAM,
        },
        Peripheral::Dbg => match periph.debug_fill(request.addr) {
            // Size of the staged diagnostic blob rides the result word.
            Ok(len) => response.result_or_size = len,
            Err(code) => response.result_or_size = code,
        },
        _ => response.result_or_size = RESULT_ERR_VALUE,
    }
    response
}

fn dispatch_registers(
    request: &CncWirePayload,
    action: CncAction,
    periph: &mut impl LocalPeripherals,
    response: &mut CncWirePayload,
) {
    let addr = request.addr;
    let ty = match periph.reg_type(addr) {
        Ok(ty) => ty,
        Err(err) => {
            response.result_or_size = reg_error_code(err);
            return;
        }
    };
    match action {
        CncAction::Read => match periph.reg_read(addr) {
            Ok(RegValue::Uint(v)) => response.set_value(crate::cnc::CncValue::U32(v)),
            Ok(RegValue::Int(v)) => response.set_value(crate::cnc::CncValue::I32(v)),
            Ok(RegValue::Str(s)) => response.set_str(s.as_str()),
            Err(err) => response.result_or_size = reg_error_code(err),
        },
        CncAction::Write => {
            let value = match ty {
                RegType::Uint => RegValue::Uint(request.value_u32()),
                RegType::Int => RegValue::Int(request.value_i32()),
                RegType::Str => RegValue::str_value(request.value_str()),
            };
            match periph.reg_write(addr, value) {
                Ok(RegValue::Uint(v)) => response.set_value(crate::cnc::CncValue::U32(v)),
                Ok(RegValue::Int(v)) => response.set_value(crate::cnc::CncValue::I32(v)),
                Ok(RegValue::Str(s)) => response.set_str(s.as_str()),
                Err(err) => response.result_or_size = reg_error_code(err),
            }
        }
        CncAction::ReadLargeBuffer => response.result_or_size = RESULT_ERR_PARAM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnc::CncValue;
    use crate::regmap::tests::FixedEnv;
    use crate::regmap::{MbRegId, RegisterMap};

    struct TestPeripherals {
        regs: RegisterMap,
        env: FixedEnv,
        power: bool,
        fan_pwm: u8,
        debug_len: u32,
    }

    impl TestPeripherals {
        fn new() -> Self {
            Self {
                regs: RegisterMap::new((1, 0, 0, 0)),
                env: FixedEnv::default(),
                power: false,
                fan_pwm: 0,
                debug_len: 0,
            }
        }
    }

    impl LocalPeripherals for TestPeripherals {
        fn reg_type(&self, addr: u32) -> Result<RegType, RegError> {
            self.regs.type_of(addr)
        }

        fn reg_read(&mut self, addr: u32) -> Result<RegValue, RegError> {
            self.regs.read(addr, &self.env)
        }

        fn reg_write(&mut self, addr: u32, value: RegValue) -> Result<RegValue, RegError> {
            self.regs.write(addr, value)?;
            self.regs.read(addr, &self.env)
        }

        fn fan_read(&mut self, addr: u32) -> Result<u32, u32> {
            if addr > 0x60 {
                return Err(RESULT_ERR_PARAM);
            }
            Ok(u32::from(self.fan_pwm))
        }

        fn fan_write(&mut self, addr: u32, value: u8) -> Result<(), u32> {
            if addr > 0x60 {
                return Err(RESULT_ERR_PARAM);
            }
            self.fan_pwm = value;
            Ok(())
        }

        fn power_enabled(&self) -> bool {
            self.power
        }

        fn power_set(&mut self, on: bool) {
            self.power = on;
        }

        fn debug_fill(&mut self, addr: u32) -> Result<u32, u32> {
            if addr > 40 {
                return Err(RESULT_ERR_RESOURCE);
            }
            self.debug_len = 128 + addr;
            Ok(self.debug_len)
        }
    }

    #[test]
    fn destination_bounds() {
        for v in 0..24 {
            assert_eq!(Destination::parse(v, false), Ok(Destination::Board(v as u8)));
        }
        assert_eq!(Destination::parse(254, false), Ok(Destination::MainBoard));
        for v in [24, 100, 253, 255, -2] {
            assert_eq!(Destination::parse(v, false), Err(CncError::ParamRange));
        }
        assert_eq!(Destination::parse(-1, false), Err(CncError::ParamRange));
        assert_eq!(Destination::parse(-1, true), Ok(Destination::All));

        let allowed: std::vec::Vec<i32> = allowed_destinations(false).collect();
        assert_eq!(allowed.len(), 25);
        assert_eq!(allowed[0], 0);
        assert_eq!(*allowed.last().unwrap(), 254);
    }

    #[test]
    fn main_board_only_accepts_mcu_from_control_plane() {
        assert!(peripheral_allowed(Destination::MainBoard, Peripheral::Mcu));
        assert!(!peripheral_allowed(Destination::MainBoard, Peripheral::Fan));
        assert!(peripheral_allowed(Destination::Board(0), Peripheral::Dds0A));
    }

    #[test]
    fn register_read_write_round_trip() {
        let mut p = TestPeripherals::new();
        let req = CncWirePayload::request(
            Peripheral::Mcu,
            CncAction::Write,
            MbRegId::UdpServerPort as u32,
            CncValue::U32(9_000),
        );
        let resp = dispatch_local(&req, &mut p);
        assert_eq!(resp.result_or_size, RESULT_OK);
        assert_eq!(resp.value_u32(), 9_000);

        let req = CncWirePayload::request(
            Peripheral::Mcu,
            CncAction::Read,
            MbRegId::UdpServerPort as u32,
            CncValue::None,
        );
        let resp = dispatch_local(&req, &mut p);
        assert_eq!(resp.value_u32(), 9_000);
    }

    #[test]
    fn string_register_through_the_dispatcher() {
        let mut p = TestPeripherals::new();
        let req = CncWirePayload::request(
            Peripheral::Mcu,
            CncAction::Read,
            MbRegId::SerialNumber as u32,
            CncValue::None,
        );
        let resp = dispatch_local(&req, &mut p);
        assert_eq!(resp.result_or_size, RESULT_OK);
        assert_eq!(resp.value_str(), "UNSET");
    }

    #[test]
    fn mfg_locked_write_reports_state_error() {
        let mut p = TestPeripherals::new();
        let req = CncWirePayload::request(
            Peripheral::Mcu,
            CncAction::Write,
            MbRegId::SerialNumber as u32,
            CncValue::str("SN-77").unwrap(),
        );
        let resp = dispatch_local(&req, &mut p);
        assert_eq!(resp.result_or_size, RESULT_ERR_STATE);

        let unlock = CncWirePayload::request(
            Peripheral::Mcu,
            CncAction::Write,
            MbRegId::MfgWriteEn as u32,
            CncValue::U32(1),
        );
        assert_eq!(dispatch_local(&unlock, &mut p).result_or_size, RESULT_OK);
        let resp = dispatch_local(&req, &mut p);
        assert_eq!(resp.result_or_size, RESULT_OK);
        assert_eq!(resp.value_str(), "SN-77");
    }

    #[test]
    fn unknown_register_is_a_param_error() {
        let mut p = TestPeripherals::new();
        let req = CncWirePayload::request(
            Peripheral::Mcu,
            CncAction::Read,
            0xFFFF,
            CncValue::None,
        );
        assert_eq!(dispatch_local(&req, &mut p).result_or_size, RESULT_ERR_PARAM);
    }

    #[test]
    fn power_round_trip() {
        let mut p = TestPeripherals::new();
        let on = CncWirePayload::request(Peripheral::Power, CncAction::Write, 0, CncValue::Bool(true));
        assert_eq!(dispatch_local(&on, &mut p).result_or_size, RESULT_OK);
        assert!(p.power);

        let get = CncWirePayload::request(Peripheral::Power, CncAction::Read, 0, CncValue::None);
        let resp = dispatch_local(&get, &mut p);
        assert!(resp.value_bool());
    }

    #[test]
    fn fan_and_debug_paths() {
        let mut p = TestPeripherals::new();
        let set = CncWirePayload::request(Peripheral::Fan, CncAction::Write, 0x50, CncValue::U32(180));
        assert_eq!(dispatch_local(&set, &mut p).result_or_size, RESULT_OK);
        assert_eq!(p.fan_pwm, 180);

        let bad = CncWirePayload::request(Peripheral::Fan, CncAction::Read, 0x99, CncValue::None);
        assert_eq!(dispatch_local(&bad, &mut p).result_or_size, RESULT_ERR_PARAM);

        let dbg = CncWirePayload::request(
            Peripheral::Dbg,
            CncAction::ReadLargeBuffer,
            7,
            CncValue::None,
        );
        assert_eq!(dispatch_local(&dbg, &mut p).result_or_size, 135);
    }

    #[test]
    fn remote_only_peripheral_is_rejected_locally() {
        let mut p = TestPeripherals::new();
        let req = CncWirePayload::request(Peripheral::Adc, CncAction::Read, 0, CncValue::None);
        assert_eq!(dispatch_local(&req, &mut p).result_or_size, RESULT_ERR_VALUE);
    }
}
