//! Typed register map.
//!
//! A flat table of named, typed entries addressed by id, where the id is
//! also the table index. Some entries are plain runtime storage, some are
//! backed by EEPROM, some have read hooks (live values) or write effects
//! (side effects the firmware applies after the table mutation, e.g.
//! reprogramming a timer). Hooks run while the caller holds the table and
//! must not reach back into it.

use crate::board::BoardType;
use crate::MAX_BOARDS;
use heapless::String;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Longest string value a register can hold.
pub const DATA_STRING_SZ: usize = 30;

/// Main-board register ids. The table is indexed by these values; the
/// id-equals-index invariant is checked at construction.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum MbRegId {
    RegFirst = 0,
    FwVersionMaj,
    FwVersionMin,
    FwVersionMaint,
    FwVersionBuild,
    HwType,
    HwVersion,
    RebootFlag,
    RebootDelayMs,
    UptimeSec,
    AdcReadRate,
    AdcReadDuty,
    SerialNumber,
    IpAddr,
    HttpPort,
    UdpTxPort,
    Gateway,
    Netmask,
    UdpServerIp,
    UdpServerPort,
    DeprecatedTcpClientIp,
    TcpClientPort,
    IpTxDataType,
    UniqueId,
    AdcMode,
    StreamIntervalUs,
    DbSpiIntervalUs,
    DbRetryIntervalS,
    TriggerMask0,
    SensorBoard0,
    SensorBoard1,
    SensorBoard2,
    SensorBoard3,
    SensorBoard4,
    SensorBoard5,
    SensorBoard6,
    SensorBoard7,
    SensorBoard8,
    SensorBoard9,
    SensorBoard10,
    SensorBoard11,
    SensorBoard12,
    SensorBoard13,
    SensorBoard14,
    SensorBoard15,
    SensorBoard16,
    SensorBoard17,
    SensorBoard18,
    SensorBoard19,
    SensorBoard20,
    SensorBoard21,
    SensorBoard22,
    SensorBoard23,
    MfgWriteEn,
    DdsClkRate,
    DdsClkDuty,
    GreenLedOn,
    RedLedOn,
    PeripheralFailMask,
    FanPop,
}

pub const MB_REG_COUNT: usize = MbRegId::FanPop as usize + 1;

impl MbRegId {
    pub fn sensor_board(slot: usize) -> Option<Self> {
        if slot < MAX_BOARDS {
            Self::try_from(Self::SensorBoard0 as u32 + slot as u32).ok()
        } else {
            None
        }
    }
}

/// Sensor-board register ids, as addressed through `MCU`-peripheral CNC
/// commands. The main board never holds this table; it only needs the ids.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum SbRegId {
    RegFirst = 0,
    FwVersionMaj,
    FwVersionMin,
    FwVersionMaint,
    FwVersionBuild,
    HwType,
    HwVersion,
    SerialNumber,
    RebootFlag,
    RebootDelayMs,
    UptimeSec,
    AdcMode,
    GreenLedOn,
    RedLedOn,
    LoopbackSensor,
    LoopbackSensorInterval,
    PeripheralFailMask,
    Imu0Present,
    Imu1Present,
    ImuBaud,
    CfgAllowed,
    EcgStatData,
    EcgLegLeadConnect,
}

/// Stream transport selection held in `IP_TX_DATA_TYPE`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum IpType {
    Udp = 0,
    Tcp = 1,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegType {
    Uint,
    Int,
    Str,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RegValue {
    Uint(u32),
    Int(i32),
    Str(String<DATA_STRING_SZ>),
}

impl RegValue {
    pub fn ty(&self) -> RegType {
        match self {
            Self::Uint(_) => RegType::Uint,
            Self::Int(_) => RegType::Int,
            Self::Str(_) => RegType::Str,
        }
    }

    pub fn as_uint(&self) -> Option<u32> {
        match self {
            Self::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Build a string value, truncating at the storage size (on a char
    /// boundary; values may arrive as arbitrary UTF-8 off the wire).
    pub fn str_value(s: &str) -> Self {
        let mut end = s.len().min(DATA_STRING_SZ);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut out = String::new();
        let _ = out.push_str(&s[..end]);
        Self::Str(out)
    }
}

/// Live values resolved at read time instead of from table storage.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReadHook {
    Uptime,
    PeripheralFailMask,
    TriggerMask,
}

/// Side effect the firmware must apply after a successful write.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteEffect {
    StreamInterval,
    SpiInterval,
    AdcClockRate,
    AdcClockDuty,
    DdsClockRate,
    DdsClockDuty,
    GreenLed,
    RedLed,
    RebootFlag,
    RebootDelay,
    TriggerMask,
    FanPopulation,
}

/// Read-time context for hook-backed entries.
pub trait RegEnv {
    fn uptime_sec(&self) -> u32;
    fn peripheral_fail_mask(&self) -> u32;
    fn trigger_mask(&self) -> u32;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegError {
    UnknownId,
    TypeMismatch,
    ReadOnly,
    /// Manufacturing-protected entry and `MFG_WRITE_EN` is clear.
    WriteProtected,
    BadValue,
}

/// Result of a successful write: what the firmware still has to do.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct WriteOutcome {
    pub effect: Option<WriteEffect>,
    /// Entry is EEPROM-backed; persist this value.
    pub persist: Option<(MbRegId, RegValue)>,
}

struct Entry {
    id: MbRegId,
    name: &'static str,
    value: RegValue,
    persistent: bool,
    /// Writes refused unless MFG_WRITE_EN is set.
    protected: bool,
    read_only: bool,
    read_hook: Option<ReadHook>,
    write_effect: Option<WriteEffect>,
}

impl Entry {
    fn plain(id: MbRegId, name: &'static str, value: RegValue) -> Self {
        Self {
            id,
            name,
            value,
            persistent: false,
            protected: false,
            read_only: false,
            read_hook: None,
            write_effect: None,
        }
    }

    fn eeprom(id: MbRegId, name: &'static str, value: RegValue) -> Self {
        Self {
            persistent: true,
            ..Self::plain(id, name, value)
        }
    }

    fn mfg(id: MbRegId, name: &'static str, value: RegValue) -> Self {
        Self {
            protected: true,
            ..Self::eeprom(id, name, value)
        }
    }

    fn read_only(id: MbRegId, name: &'static str, value: RegValue) -> Self {
        Self {
            read_only: true,
            ..Self::plain(id, name, value)
        }
    }

    fn hooked(id: MbRegId, name: &'static str, hook: ReadHook) -> Self {
        Self {
            read_only: true,
            read_hook: Some(hook),
            ..Self::plain(id, name, RegValue::Uint(0))
        }
    }

    fn effect(mut self, effect: WriteEffect) -> Self {
        self.write_effect = Some(effect);
        self
    }
}

/// The main-board register table.
pub struct RegisterMap {
    entries: heapless::Vec<Entry, MB_REG_COUNT>,
}

fn ip(a: u8, b: u8, c: u8, d: u8) -> u32 {
    u32::from_le_bytes([a, b, c, d])
}

impl RegisterMap {
    pub fn new(fw_version: (u32, u32, u32, u32)) -> Self {
        use MbRegId as R;
        use RegValue::{Int, Uint};

        let mut entries: heapless::Vec<Entry, MB_REG_COUNT> = heapless::Vec::new();
        let mut push = |e: Entry| {
            // Table order is the id order; a mismatch here is a programming
            // error caught by the constructor test.
            let _ = entries.push(e);
        };

        push(Entry::read_only(R::RegFirst, "REG_FIRST", Uint(0)));
        push(Entry::read_only(R::FwVersionMaj, "FW_VERSION_MAJ", Uint(fw_version.0)));
        push(Entry::read_only(R::FwVersionMin, "FW_VERSION_MIN", Uint(fw_version.1)));
        push(Entry::read_only(R::FwVersionMaint, "FW_VERSION_MAINT", Uint(fw_version.2)));
        push(Entry::read_only(R::FwVersionBuild, "FW_VERSION_BUILD", Uint(fw_version.3)));
        push(Entry::mfg(R::HwType, "HW_TYPE", Uint(0)));
        push(Entry::mfg(R::HwVersion, "HW_VERSION", Uint(0)));
        push(Entry::plain(R::RebootFlag, "REBOOT_FLAG", Uint(0)).effect(WriteEffect::RebootFlag));
        push(
            Entry::plain(R::RebootDelayMs, "REBOOT_DELAY_MS", Uint(1_000))
                .effect(WriteEffect::RebootDelay),
        );
        push(Entry::hooked(R::UptimeSec, "UPTIME_SEC", ReadHook::Uptime));
        push(
            Entry::plain(R::AdcReadRate, "ADC_READ_RATE", Uint(4_000))
                .effect(WriteEffect::AdcClockRate),
        );
        push(
            Entry::plain(R::AdcReadDuty, "ADC_READ_DUTY", Uint(50))
                .effect(WriteEffect::AdcClockDuty),
        );
        push(Entry::mfg(R::SerialNumber, "SERIAL_NUMBER", RegValue::str_value("UNSET")));
        push(Entry::eeprom(R::IpAddr, "IP_ADDR", Uint(ip(192, 168, 1, 100))));
        push(Entry::eeprom(R::HttpPort, "HTTP_PORT", Uint(80)));
        push(Entry::eeprom(R::UdpTxPort, "UDP_TX_PORT", Uint(5_004)));
        push(Entry::eeprom(R::Gateway, "GATEWAY", Uint(ip(192, 168, 1, 1))));
        push(Entry::eeprom(R::Netmask, "NETMASK", Uint(ip(255, 255, 255, 0))));
        push(Entry::eeprom(R::UdpServerIp, "UDP_SERVER_IP", Uint(ip(192, 168, 1, 10))));
        push(Entry::eeprom(R::UdpServerPort, "UDP_SERVER_PORT", Uint(5_005)));
        push(Entry::eeprom(R::DeprecatedTcpClientIp, "DEPRECATED_TCP_CLIENT_IP", Uint(0)));
        push(Entry::eeprom(R::TcpClientPort, "TCP_CLIENT_PORT", Uint(5_006)));
        push(Entry::eeprom(R::IpTxDataType, "IP_TX_DATA_TYPE", Uint(IpType::Udp as u32)));
        push(Entry::mfg(R::UniqueId, "UNIQUE_ID", Uint(0)));
        push(Entry::eeprom(R::AdcMode, "ADC_MODE", Uint(0)));
        push(
            Entry::eeprom(R::StreamIntervalUs, "STREAM_INTERVAL_US", Uint(1_000))
                .effect(WriteEffect::StreamInterval),
        );
        push(
            Entry::eeprom(R::DbSpiIntervalUs, "DB_SPI_INTERVAL_US", Uint(1_000))
                .effect(WriteEffect::SpiInterval),
        );
        push(Entry::eeprom(R::DbRetryIntervalS, "DB_RETRY_INTERVAL_S", Int(5)));
        push(
            Entry::hooked(R::TriggerMask0, "TRIGGER_MASK_0", ReadHook::TriggerMask)
                .effect(WriteEffect::TriggerMask),
        );
        for slot in 0..MAX_BOARDS {
            // Names are static; index math mirrors the id layout.
            push(Entry::eeprom(
                MbRegId::sensor_board(slot).unwrap_or(R::SensorBoard0),
                SENSOR_BOARD_NAMES[slot],
                Uint(BoardType::Empty as u32),
            ));
        }
        push(Entry::plain(R::MfgWriteEn, "MFG_WRITE_EN", Uint(0)));
        push(
            Entry::plain(R::DdsClkRate, "DDS_CLK_RATE", Uint(25_000))
                .effect(WriteEffect::DdsClockRate),
        );
        push(
            Entry::plain(R::DdsClkDuty, "DDS_CLK_DUTY", Uint(50))
                .effect(WriteEffect::DdsClockDuty),
        );
        push(Entry::eeprom(R::GreenLedOn, "GREEN_LED_ON", Uint(1)).effect(WriteEffect::GreenLed));
        push(Entry::eeprom(R::RedLedOn, "RED_LED_ON", Uint(0)).effect(WriteEffect::RedLed));
        push(Entry::hooked(
            R::PeripheralFailMask,
            "PERIPHERAL_FAIL_MASK",
            ReadHook::PeripheralFailMask,
        ));
        push(Entry::eeprom(R::FanPop, "FAN_POP", Uint(0x3)).effect(WriteEffect::FanPopulation));

        Self { entries }
    }

    /// Id-equals-index invariant; also proves the table is complete.
    pub fn verify(&self) -> bool {
        self.entries.len() == MB_REG_COUNT
            && self
                .entries
                .iter()
                .enumerate()
                .all(|(i, e)| e.id as usize == i)
    }

    pub fn type_of(&self, id: u32) -> Result<RegType, RegError> {
        let entry = self.entry(id)?;
        Ok(entry.value.ty())
    }

    pub fn name_of(&self, id: u32) -> Result<&'static str, RegError> {
        Ok(self.entry(id)?.name)
    }

    pub fn find_by_name(&self, name: &str) -> Option<MbRegId> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.id)
    }

    pub fn read(&self, id: u32, env: &impl RegEnv) -> Result<RegValue, RegError> {
        let entry = self.entry(id)?;
        match entry.read_hook {
            Some(ReadHook::Uptime) => Ok(RegValue::Uint(env.uptime_sec())),
            Some(ReadHook::PeripheralFailMask) => Ok(RegValue::Uint(env.peripheral_fail_mask())),
            Some(ReadHook::TriggerMask) => Ok(RegValue::Uint(env.trigger_mask())),
            None => Ok(entry.value.clone()),
        }
    }

    pub fn write(&mut self, id: u32, value: RegValue) -> Result<WriteOutcome, RegError> {
        let mfg_unlocked = self.mfg_write_enabled();
        let entry = self.entry_mut(id)?;
        if entry.read_only {
            return Err(RegError::ReadOnly);
        }
        if entry.protected && !mfg_unlocked {
            return Err(RegError::WriteProtected);
        }
        if entry.value.ty() != value.ty() {
            return Err(RegError::TypeMismatch);
        }
        let idx = entry.id as u32;
        if (MbRegId::SensorBoard0 as u32..=MbRegId::SensorBoard23 as u32).contains(&idx) {
            let raw = value.as_uint().ok_or(RegError::TypeMismatch)?;
            let ty = BoardType::try_from(raw as u8).map_err(|_| RegError::BadValue)?;
            if ty == BoardType::Unknown {
                return Err(RegError::BadValue);
            }
        }
        entry.value = value.clone();
        Ok(WriteOutcome {
            effect: entry.write_effect,
            persist: entry.persistent.then(|| (entry.id, value)),
        })
    }

    /// Write bypassing hooks and protection; used when loading persisted
    /// values at boot.
    pub fn write_force(&mut self, id: u32, value: RegValue) -> Result<(), RegError> {
        let entry = self.entry_mut(id)?;
        if entry.value.ty() != value.ty() {
            return Err(RegError::TypeMismatch);
        }
        entry.value = value;
        Ok(())
    }

    pub fn mfg_write_enabled(&self) -> bool {
        self.entries[MbRegId::MfgWriteEn as usize]
            .value
            .as_uint()
            .unwrap_or(0)
            != 0
    }

    /// Ids of all EEPROM-backed entries, for the boot-time load.
    pub fn persistent_ids(&self) -> impl Iterator<Item = MbRegId> + '_ {
        self.entries
            .iter()
            .filter(|e| e.persistent)
            .map(|e| e.id)
    }

    /// Configured board type for a slot, defaulting hard to `Empty` on any
    /// table damage so the gather layout stays consistent.
    pub fn board_type(&self, slot: usize) -> BoardType {
        MbRegId::sensor_board(slot)
            .and_then(|id| self.entries.get(id as usize))
            .and_then(|e| e.value.as_uint())
            .and_then(|v| BoardType::try_from(v as u8).ok())
            .unwrap_or(BoardType::Empty)
    }

    pub fn board_population(&self) -> [BoardType; MAX_BOARDS] {
        core::array::from_fn(|slot| self.board_type(slot))
    }

    fn entry(&self, id: u32) -> Result<&Entry, RegError> {
        self.entries.get(id as usize).ok_or(RegError::UnknownId)
    }

    fn entry_mut(&mut self, id: u32) -> Result<&mut Entry, RegError> {
        self.entries.get_mut(id as usize).ok_or(RegError::UnknownId)
    }
}

static SENSOR_BOARD_NAMES: [&str; MAX_BOARDS] = [
    "SENSOR_BOARD_0",
    "SENSOR_BOARD_1",
    "SENSOR_BOARD_2",
    "SENSOR_BOARD_3",
    "SENSOR_BOARD_4",
    "SENSOR_BOARD_5",
    "SENSOR_BOARD_6",
    "SENSOR_BOARD_7",
    "SENSOR_BOARD_8",
    "SENSOR_BOARD_9",
    "SENSOR_BOARD_10",
    "SENSOR_BOARD_11",
    "SENSOR_BOARD_12",
    "SENSOR_BOARD_13",
    "SENSOR_BOARD_14",
    "SENSOR_BOARD_15",
    "SENSOR_BOARD_16",
    "SENSOR_BOARD_17",
    "SENSOR_BOARD_18",
    "SENSOR_BOARD_19",
    "SENSOR_BOARD_20",
    "SENSOR_BOARD_21",
    "SENSOR_BOARD_22",
    "SENSOR_BOARD_23",
];
