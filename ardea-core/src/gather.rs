//! Stream-packet assembly.
//!
//! Two packet buffers alternate: the drivers fill the active one as sensor
//! frames arrive; every stream tick the engine swaps buffers, stamps the
//! frozen one and hands it to the transport. The internal layout of the
//! `data_readings` region is computed once at boot from the slot population
//! and never changes during a run.

use crate::board::{
    has_new_data, AdcPayload, BoardType, ImuPayload, RecordHeader, IMU_DATA_SIZE, IMU_MAX_BOARD,
    IMU_PER_BOARD, RECORD_FLAGS_OFFSET, RECORD_HEADER_SIZE, RECORD_VERSION, SENSORS_PER_BOARD,
};
use crate::dbcomm::SensorUpdate;
use crate::imu::{FeedOutcome, ImuAssembler, TribbleFlag};
use crate::MAX_BOARDS;

/// Ethernet payload budget: one packet must never fragment.
pub const MAX_ETHERNET_SIZE_BYTES: usize = 1_500;

/// Fixed stream-packet header: uid, version, four counts, pad, timestamp.
pub const PKT_HEADER_SIZE: usize = 20;

pub const MAX_DATA_READINGS: usize = MAX_ETHERNET_SIZE_BYTES - PKT_HEADER_SIZE;

/// Buffers kept; one is shipped while the other fills.
pub const STREAM_BUFFER_COUNT: usize = 2;

/// Per-type record counts in slot-register order (MCG, ECG, ECG12, IMU).
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct TypeCounts {
    pub mcg: u8,
    pub ecg: u8,
    pub ecg12: u8,
    pub imu: u8,
}

/// Where one slot's records live inside `data_readings`.
#[derive(Clone, Copy, Debug)]
pub struct SlotDesc {
    pub kind: BoardType,
    /// Offset per sensor; IMU boards use both, ADC boards the first. A
    /// populated slot with `None` did not fit the MTU budget (degraded).
    pub offsets: [Option<u16>; SENSORS_PER_BOARD],
    /// Index of this board within its type region (also the IMU assembly
    /// scratch index for IMU boards).
    pub type_idx: u8,
}

impl SlotDesc {
    const EMPTY: Self = Self {
        kind: BoardType::Empty,
        offsets: [None; SENSORS_PER_BOARD],
        type_idx: 0,
    };
}

/// Boot-time layout of the stream packet, derived from the 24 slot
/// registers. Identical population always yields identical offsets.
pub struct PacketLayout {
    pub counts: TypeCounts,
    pub slots: [SlotDesc; MAX_BOARDS],
    /// Bytes of `data_readings` actually used by records that fit.
    pub data_len: usize,
    /// Some configured records did not fit the MTU budget; they are
    /// dropped from the stream but the system keeps running.
    pub oversize: bool,
}

impl PacketLayout {
    pub fn compute(population: &[BoardType; MAX_BOARDS]) -> Self {
        let mut counts = TypeCounts::default();
        for ty in population {
            match ty {
                BoardType::Mcg => counts.mcg += 1,
                BoardType::Ecg => counts.ecg += 1,
                BoardType::Ecg12 => counts.ecg12 += 1,
                BoardType::ImuCoil => counts.imu += 1,
                _ => {}
            }
        }

        // Region bases, in fixed order: MCG, ECG, ECG12, IMU.
        let mcg_base = 0usize;
        let ecg_base = mcg_base + counts.mcg as usize * BoardType::Mcg.record_size();
        let ecg12_base = ecg_base + counts.ecg as usize * BoardType::Ecg.record_size();
        let imu_base = ecg12_base + counts.ecg12 as usize * BoardType::Ecg12.record_size();
        let full_len =
            imu_base + counts.imu as usize * IMU_PER_BOARD * BoardType::ImuCoil.record_size();

        let mut next = [mcg_base, ecg_base, ecg12_base, imu_base];
        let mut type_seen = [0u8; 4];
        let mut slots = [SlotDesc::EMPTY; MAX_BOARDS];
        let mut data_len = 0usize;
        let mut oversize = full_len > MAX_DATA_READINGS;

        for (slot, &kind) in population.iter().enumerate() {
            let region = match kind {
                BoardType::Mcg => 0,
                BoardType::Ecg => 1,
                BoardType::Ecg12 => 2,
                BoardType::ImuCoil => 3,
                _ => {
                    slots[slot].kind = kind;
                    continue;
                }
            };
            let mut desc = SlotDesc {
                kind,
                offsets: [None; SENSORS_PER_BOARD],
                type_idx: type_seen[region],
            };
            type_seen[region] += 1;

            let records = kind.record_count();
            let size = kind.record_size();
            let degraded_imu = kind == BoardType::ImuCoil && desc.type_idx as usize >= IMU_MAX_BOARD;
            for sensor in 0..records {
                let off = next[region];
                if off + size <= MAX_DATA_READINGS && !degraded_imu {
                    desc.offsets[sensor] = Some(off as u16);
                    data_len = data_len.max(off + size);
                } else {
                    oversize = true;
                }
                next[region] += size;
            }
            slots[slot] = desc;
        }

        Self {
            counts,
            slots,
            data_len,
            oversize,
        }
    }

    /// Bitmask of slots expected to answer polls.
    pub fn expected_mask(&self) -> u32 {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, d)| d.kind.is_populated())
            .fold(0, |mask, (slot, _)| mask | 1 << slot)
    }

    pub fn packet_len(&self) -> usize {
        PKT_HEADER_SIZE + self.data_len
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct SlotGatherStats {
    pub status_en: bool,
    pub missed_data: u32,
    pub sent_pkts: [u32; IMU_PER_BOARD],
    pub overwritten_data: u32,
    pub alignment_data: u32,
    pub access_blocked: u32,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct GatherStats {
    pub slots: [SlotGatherStats; MAX_BOARDS],
    pub access_block_cnt: u32,
    pub notify_timeout_cnt: u32,
    pub sent_pkts: u32,
}

/// One stream packet buffer. Sized for the worst legal layout; the used
/// prefix is what goes on the wire.
pub struct StreamPacket {
    bytes: [u8; MAX_ETHERNET_SIZE_BYTES],
}

impl StreamPacket {
    const fn zeroed() -> Self {
        Self {
            bytes: [0; MAX_ETHERNET_SIZE_BYTES],
        }
    }

    fn clear(&mut self) {
        self.bytes = [0; MAX_ETHERNET_SIZE_BYTES];
    }

    fn stamp_header(&mut self, uid: u32, counts: TypeCounts, timestamp: f64) {
        self.bytes[0..4].copy_from_slice(&uid.to_le_bytes());
        self.bytes[4] = RECORD_VERSION;
        self.bytes[5] = counts.mcg;
        self.bytes[6] = counts.ecg;
        self.bytes[7] = counts.ecg12;
        self.bytes[8] = counts.imu;
        // bytes 9..12 stay zero (alignment pad)
        self.bytes[12..20].copy_from_slice(&timestamp.to_le_bytes());
    }

    fn record(&mut self, offset: u16, len: usize) -> &mut [u8] {
        let start = PKT_HEADER_SIZE + offset as usize;
        &mut self.bytes[start..start + len]
    }

    fn record_flags(&self, offset: u16) -> u8 {
        self.bytes[PKT_HEADER_SIZE + offset as usize + RECORD_FLAGS_OFFSET]
    }
}

/// The gather engine: layout, both buffers, the IMU reassembly scratch and
/// the streaming statistics.
pub struct GatherEngine {
    layout: PacketLayout,
    bufs: [StreamPacket; STREAM_BUFFER_COUNT],
    active: usize,
    uid: u32,
    timestamp: f64,
    ts_delta: f64,
    ticks_since_resync: u32,
    resync_period_ticks: u32,
    imu_asm: [[ImuAssembler; IMU_PER_BOARD]; IMU_MAX_BOARD],
    /// Last fully assembled IMU sample per position, kept for diagnostics.
    last_imu: [[u8; IMU_DATA_SIZE]; IMU_PER_BOARD],
    /// Hardware-reported board type per slot, filled in at bring-up.
    hw_types: [BoardType; MAX_BOARDS],
    pub stats: GatherStats,
}

impl GatherEngine {
    pub fn new(layout: PacketLayout) -> Self {
        let mut engine = Self {
            layout,
            bufs: [StreamPacket::zeroed(), StreamPacket::zeroed()],
            active: 0,
            uid: 0,
            timestamp: 0.0,
            ts_delta: 0.001,
            ticks_since_resync: u32::MAX,
            resync_period_ticks: 1_000,
            imu_asm: [[ImuAssembler::default(); IMU_PER_BOARD]; IMU_MAX_BOARD],
            last_imu: [[0; IMU_DATA_SIZE]; IMU_PER_BOARD],
            hw_types: [BoardType::Unknown; MAX_BOARDS],
            stats: GatherStats::default(),
        };
        engine.set_interval_us(crate::DEFAULT_TICK_INTERVAL_US);
        engine
    }

    pub fn layout(&self) -> &PacketLayout {
        &self.layout
    }

    /// Reconfigure the stream period: adjusts the timestamp extrapolation
    /// step and the ~1 s wall-clock resync cadence.
    pub fn set_interval_us(&mut self, interval_us: u32) {
        self.ts_delta = f64::from(interval_us) / 1e6;
        self.resync_period_ticks = (1_000_000 / interval_us.max(1)).max(1);
        self.ticks_since_resync = u32::MAX;
    }

    pub fn ts_delta(&self) -> f64 {
        self.ts_delta
    }

    pub fn set_board_state(&mut self, slot: usize, enabled: bool) {
        if let Some(s) = self.stats.slots.get_mut(slot) {
            s.status_en = enabled;
        }
    }

    pub fn last_imu(&self, sensor: usize) -> &[u8; IMU_DATA_SIZE] {
        &self.last_imu[sensor]
    }

    /// Record the hardware-reported type for a slot (bring-up probe).
    pub fn record_hw_type(&mut self, slot: usize, hw: BoardType) {
        if slot < MAX_BOARDS {
            self.hw_types[slot] = hw;
        }
    }

    pub fn hw_type(&self, slot: usize) -> BoardType {
        self.hw_types[slot]
    }

    /// Whether the configured slot type matches the reported hardware.
    /// Empty slots trivially match; an unprobed populated slot does not.
    pub fn config_matches(&self, slot: usize) -> bool {
        let cfg = self.layout.slots[slot].kind;
        !cfg.is_populated() || self.hw_types[slot] == cfg
    }

    /// Place fresh sensor data from one slot into the active buffer.
    pub fn write_sensor(&mut self, slot: usize, update: &SensorUpdate) {
        if slot >= MAX_BOARDS {
            return;
        }
        let desc = self.layout.slots[slot];
        match desc.kind {
            BoardType::Mcg => {
                let view = AdcPayload(&update.payload);
                self.write_adc_record(slot, &desc, update, view.readings_and_coil_raw());
            }
            BoardType::Ecg | BoardType::Ecg12 => {
                let view = AdcPayload(&update.payload);
                self.write_adc_record(slot, &desc, update, view.readings_raw());
            }
            BoardType::ImuCoil => self.write_imu_fragments(slot, &desc, update),
            _ => {}
        }
    }

    fn write_adc_record(
        &mut self,
        slot: usize,
        desc: &SlotDesc,
        update: &SensorUpdate,
        data: &[u8],
    ) {
        let Some(offset) = desc.offsets[0] else {
            return;
        };
        let buf = &mut self.bufs[self.active];
        if has_new_data(buf.record_flags(offset)) {
            self.stats.slots[slot].overwritten_data += 1;
        }
        let record = buf.record(offset, desc.kind.record_size());
        RecordHeader::new(0, slot as u8, desc.kind, u32::from(update.uid))
            .write_to(record);
        record[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + data.len()].copy_from_slice(data);
    }

    fn write_imu_fragments(&mut self, slot: usize, desc: &SlotDesc, update: &SensorUpdate) {
        let scratch = desc.type_idx as usize;
        if scratch >= IMU_MAX_BOARD {
            return;
        }
        let view = ImuPayload(&update.payload);
        for imu in 0..IMU_PER_BOARD {
            let Ok(flag) = TribbleFlag::try_from(view.flag_bits(imu)) else {
                continue;
            };
            match self.imu_asm[scratch][imu].feed(flag, view.fragment(imu)) {
                FeedOutcome::Stored | FeedOutcome::Ignored => {}
                FeedOutcome::OverwrittenRestart => {
                    self.stats.slots[slot].overwritten_data += 1;
                }
                FeedOutcome::Misaligned => {
                    self.stats.slots[slot].alignment_data += 1;
                }
                FeedOutcome::Committed(data) => {
                    self.commit_imu_record(slot, desc, imu, update.uid, &data);
                }
            }
        }
    }

    fn commit_imu_record(
        &mut self,
        slot: usize,
        desc: &SlotDesc,
        imu: usize,
        uid: u8,
        data: &[u8; IMU_DATA_SIZE],
    ) {
        self.last_imu[imu] = *data;
        let Some(offset) = desc.offsets[imu] else {
            return;
        };
        let buf = &mut self.bufs[self.active];
        if has_new_data(buf.record_flags(offset)) {
            self.stats.slots[slot].overwritten_data += 1;
        }
        let record = buf.record(offset, BoardType::ImuCoil.record_size());
        RecordHeader::new(imu as u8, slot as u8, BoardType::ImuCoil, u32::from(uid))
            .write_to(record);
        record[RECORD_HEADER_SIZE..].copy_from_slice(data);
        self.stats.slots[slot].sent_pkts[imu] += 1;
    }

    /// Stream tick: freeze the filled buffer, open the other one, stamp the
    /// header and return the wire bytes. `now` provides seconds since epoch
    /// and is consulted only when the timestamp resyncs.
    pub fn ship(&mut self, now: impl FnOnce() -> f64) -> &[u8] {
        if self.ticks_since_resync >= self.resync_period_ticks {
            self.timestamp = now();
            self.ticks_since_resync = 0;
        } else {
            self.timestamp += self.ts_delta;
            self.ticks_since_resync += 1;
        }

        let sending = self.active;
        self.active = (self.active + 1) % STREAM_BUFFER_COUNT;
        self.bufs[self.active].clear();

        let uid = self.uid;
        self.uid = self.uid.wrapping_add(1);
        self.bufs[sending].stamp_header(uid, self.layout.counts, self.timestamp);

        self.account_shipped(sending);
        self.stats.sent_pkts += 1;

        &self.bufs[sending].bytes[..self.layout.packet_len()]
    }

    /// The stream tick fired but the cycle was lost (blocked or notify
    /// timeout); extrapolation is no longer safe, so resync next time.
    pub fn mark_lost_cycle(&mut self, timed_out: bool) {
        if timed_out {
            self.stats.notify_timeout_cnt += 1;
        } else {
            self.stats.access_block_cnt += 1;
        }
        self.ticks_since_resync = u32::MAX;
    }

    fn account_shipped(&mut self, sending: usize) {
        for slot in 0..MAX_BOARDS {
            let desc = self.layout.slots[slot];
            match desc.kind {
                BoardType::Mcg | BoardType::Ecg | BoardType::Ecg12 => {
                    let Some(offset) = desc.offsets[0] else {
                        continue;
                    };
                    if has_new_data(self.bufs[sending].record_flags(offset)) {
                        self.stats.slots[slot].sent_pkts[0] += 1;
                    } else {
                        self.stats.slots[slot].missed_data += 1;
                    }
                }
                BoardType::ImuCoil => {
                    // IMU samples legitimately span several stream periods;
                    // absence is not a miss. Commits were already counted.
                }
                _ => {}
            }
        }
    }

    /// Fill every record of both buffers with a recognizable incrementing
    /// pattern; lets the data server verify slot placement end to end
    /// without sensor boards attached.
    pub fn test_fill(&mut self, quaternion_form: bool) {
        for buf_idx in 0..STREAM_BUFFER_COUNT {
            let mut counter = 0u8;
            for slot in 0..MAX_BOARDS {
                let desc = self.layout.slots[slot];
                if !desc.kind.is_populated() {
                    continue;
                }
                for sensor in 0..desc.kind.record_count() {
                    let Some(offset) = desc.offsets[sensor] else {
                        continue;
                    };
                    let size = desc.kind.record_size();
                    let buf = &mut self.bufs[buf_idx];
                    let record = buf.record(offset, size);
                    RecordHeader::new(sensor as u8, slot as u8, desc.kind, u32::from(counter))
                        .write_to(record);
                    for (i, b) in record[RECORD_HEADER_SIZE..].iter_mut().enumerate() {
                        *b = counter.wrapping_add(i as u8);
                    }
                    if desc.kind == BoardType::ImuCoil && !quaternion_form {
                        // Euler form carries the 4-byte blank prefix.
                        record[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + 4].fill(0);
                    }
                    counter = counter.wrapping_add(1);
                }
            }
        }
    }

    /// Read-only view of the buffer currently being filled (diagnostics).
    pub fn active_bytes(&self) -> &[u8] {
        &self.bufs[self.active].bytes[..self.layout.packet_len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{
        write_adc24, write_imu_payload, ADC_READINGS_PER_BOARD, ECG_RECORD_SIZE, IMU_RECORD_SIZE,
        MCG_RECORD_SIZE,
    };

    fn population(slots: &[(usize, BoardType)]) -> [BoardType; MAX_BOARDS] {
        let mut pop = [BoardType::Empty; MAX_BOARDS];
        for &(slot, ty) in slots {
            pop[slot] = ty;
        }
        pop
    }

    fn update(uid: u8, payload: [u8; 40]) -> SensorUpdate {
        SensorUpdate { uid, payload }
    }

    fn adc_update(uid: u8, base: u32) -> SensorUpdate {
        let mut payload = [0u8; 40];
        for ch in 0..ADC_READINGS_PER_BOARD {
            write_adc24(&mut payload, ch, base + ch as u32);
        }
        update(uid, payload)
    }

    #[test]
    fn layout_matches_mixed_population() {
        // S5: {MCG x4, ECG x2, ECG12 x1, IMU x3, rest empty}.
        let pop = population(&[
            (0, BoardType::Mcg),
            (1, BoardType::Mcg),
            (2, BoardType::Ecg),
            (3, BoardType::Ecg12),
            (4, BoardType::ImuCoil),
            (7, BoardType::Mcg),
            (9, BoardType::Ecg),
            (10, BoardType::ImuCoil),
            (12, BoardType::Mcg),
            (20, BoardType::ImuCoil),
        ]);
        let layout = PacketLayout::compute(&pop);
        assert_eq!(
            layout.counts,
            TypeCounts {
                mcg: 4,
                ecg: 2,
                ecg12: 1,
                imu: 3
            }
        );
        assert_eq!(
            layout.data_len,
            4 * MCG_RECORD_SIZE + 2 * ECG_RECORD_SIZE + ECG_RECORD_SIZE + 3 * 2 * IMU_RECORD_SIZE
        );
        assert!(!layout.oversize);

        // Offsets are monotonic within the MCG, ECG, ECG12, IMU region
        // order and never overlap.
        let mut spans: std::vec::Vec<(usize, usize)> = std::vec::Vec::new();
        for desc in layout.slots.iter().filter(|d| d.kind.is_populated()) {
            for sensor in 0..desc.kind.record_count() {
                let off = desc.offsets[sensor].unwrap() as usize;
                spans.push((off, off + desc.kind.record_size()));
            }
        }
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap: {pair:?}");
        }
        // MCG slots occupy the front of the region.
        assert_eq!(layout.slots[0].offsets[0], Some(0));
        assert_eq!(layout.slots[1].offsets[0], Some(MCG_RECORD_SIZE as u16));
        // First ECG starts where the MCG region ends.
        assert_eq!(
            layout.slots[2].offsets[0],
            Some((4 * MCG_RECORD_SIZE) as u16)
        );
        assert_eq!(layout.expected_mask(), 0b1_0000_0001_0110_1001_1111);
    }

    #[test]
    fn layout_is_deterministic() {
        let pop = population(&[(5, BoardType::Mcg), (6, BoardType::ImuCoil)]);
        let a = PacketLayout::compute(&pop);
        let b = PacketLayout::compute(&pop);
        for slot in 0..MAX_BOARDS {
            assert_eq!(a.slots[slot].offsets, b.slots[slot].offsets);
        }
        assert_eq!(a.data_len, b.data_len);
    }

    #[test]
    fn full_chassis_fits_one_mtu() {
        let layout = PacketLayout::compute(&[BoardType::Mcg; MAX_BOARDS]);
        assert!(!layout.oversize);
        assert!(layout.packet_len() <= MAX_ETHERNET_SIZE_BYTES);
    }

    #[test]
    fn all_imu_population_degrades_instead_of_overflowing() {
        let layout = PacketLayout::compute(&[BoardType::ImuCoil; MAX_BOARDS]);
        assert!(layout.oversize);
        assert!(layout.packet_len() <= MAX_ETHERNET_SIZE_BYTES);
        // The slots that fit keep valid descriptors.
        assert!(layout.slots[0].offsets[0].is_some());
        assert!(layout.slots[MAX_BOARDS - 1].offsets[1].is_none());
    }

    #[test]
    fn write_then_ship_sets_and_clears_new_data() {
        let pop = population(&[(0, BoardType::Ecg)]);
        let mut engine = GatherEngine::new(PacketLayout::compute(&pop));

        engine.write_sensor(0, &adc_update(1, 1_000));
        let pkt = engine.ship(|| 100.0);
        let flags = pkt[PKT_HEADER_SIZE + RECORD_FLAGS_OFFSET];
        assert!(has_new_data(flags));
        assert_eq!(flags & 0x07, BoardType::Ecg as u8);
        assert_eq!(engine.stats.slots[0].sent_pkts[0], 1);

        // Nothing written this cycle: the record ships zeroed and counts
        // as missed.
        let pkt = engine.ship(|| 100.0);
        assert!(!has_new_data(pkt[PKT_HEADER_SIZE + RECORD_FLAGS_OFFSET]));
        assert_eq!(engine.stats.slots[0].missed_data, 1);
    }

    #[test]
    fn packet_header_carries_uid_counts_timestamp() {
        let pop = population(&[(0, BoardType::Mcg), (1, BoardType::ImuCoil)]);
        let mut engine = GatherEngine::new(PacketLayout::compute(&pop));
        let pkt = engine.ship(|| 1234.5);
        assert_eq!(u32::from_le_bytes(pkt[0..4].try_into().unwrap()), 0);
        assert_eq!(pkt[4], RECORD_VERSION);
        assert_eq!(pkt[5..9], [1, 0, 0, 1]);
        assert_eq!(
            f64::from_le_bytes(pkt[12..20].try_into().unwrap()),
            1234.5
        );
        let pkt = engine.ship(|| 1234.5);
        assert_eq!(u32::from_le_bytes(pkt[0..4].try_into().unwrap()), 1);
    }

    #[test]
    fn overwrite_before_ship_is_counted() {
        let pop = population(&[(0, BoardType::Ecg)]);
        let mut engine = GatherEngine::new(PacketLayout::compute(&pop));
        engine.write_sensor(0, &adc_update(1, 10));
        engine.write_sensor(0, &adc_update(2, 20));
        assert_eq!(engine.stats.slots[0].overwritten_data, 1);
        // Last writer wins.
        let pkt = engine.ship(|| 0.0);
        let data = &pkt[PKT_HEADER_SIZE + RECORD_HEADER_SIZE..];
        assert_eq!(
            u32::from(data[0]) | u32::from(data[1]) << 8 | u32::from(data[2]) << 16,
            20
        );
    }

    #[test]
    fn timestamp_extrapolates_between_resyncs() {
        let pop = population(&[(0, BoardType::Ecg)]);
        let mut engine = GatherEngine::new(PacketLayout::compute(&pop));
        engine.set_interval_us(1_000);

        let wall = 5_000.25;
        let mut stamps = std::vec::Vec::new();
        for _ in 0..1_000 {
            let pkt = engine.ship(|| wall);
            stamps.push(f64::from_le_bytes(pkt[12..20].try_into().unwrap()));
        }
        for (k, ts) in stamps.iter().enumerate() {
            let expected = wall + k as f64 * 0.001;
            assert!(
                (ts - expected).abs() < 1e-9 + 0.001,
                "tick {k}: {ts} vs {expected}"
            );
        }
        // Exactly one resync in the window: the first ship.
        assert!((stamps[999] - (wall + 0.999)).abs() < 1e-6);
    }

    #[test]
    fn lost_cycle_forces_a_resync() {
        let pop = population(&[(0, BoardType::Ecg)]);
        let mut engine = GatherEngine::new(PacketLayout::compute(&pop));
        engine.ship(|| 10.0);
        engine.mark_lost_cycle(true);
        assert_eq!(engine.stats.notify_timeout_cnt, 1);
        let pkt = engine.ship(|| 99.0);
        assert_eq!(f64::from_le_bytes(pkt[12..20].try_into().unwrap()), 99.0);
    }

    #[test]
    fn imu_fragments_assemble_into_the_packet() {
        let pop = population(&[(3, BoardType::ImuCoil)]);
        let mut engine = GatherEngine::new(PacketLayout::compute(&pop));

        let frags = [[0xA1u8; 16], [0xB2; 16], [0xC3; 16]];
        let idle = [0u8; 16];
        for (i, flag) in [TribbleFlag::High, TribbleFlag::Mid, TribbleFlag::Low]
            .into_iter()
            .enumerate()
        {
            let mut payload = [0u8; 40];
            // IMU0 streams the sequence; IMU1 stays idle.
            write_imu_payload(&mut payload, [flag as u8, TribbleFlag::New as u8], [&frags[i], &idle]);
            engine.write_sensor(3, &update(i as u8, payload));
        }
        assert_eq!(engine.stats.slots[3].sent_pkts[0], 1);
        assert_eq!(engine.stats.slots[3].alignment_data, 0);

        let layout_off = engine.layout().slots[3].offsets[0].unwrap() as usize;
        let pkt = engine.ship(|| 0.0);
        let record = &pkt[PKT_HEADER_SIZE + layout_off..PKT_HEADER_SIZE + layout_off + IMU_RECORD_SIZE];
        assert!(has_new_data(record[RECORD_FLAGS_OFFSET]));
        assert_eq!(&record[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + 16], &frags[0]);
        assert_eq!(&record[RECORD_HEADER_SIZE + 32..], &frags[2]);
        // Debug cache mirrors the last assembled sample.
        assert_eq!(&engine.last_imu(0)[..16], &frags[0]);
    }

    #[test]
    fn imu_misalignment_counts_and_resets() {
        let pop = population(&[(3, BoardType::ImuCoil)]);
        let mut engine = GatherEngine::new(PacketLayout::compute(&pop));
        let frag = [1u8; 16];
        let idle = [0u8; 16];
        for flag in [TribbleFlag::Mid, TribbleFlag::Low] {
            let mut payload = [0u8; 40];
            write_imu_payload(&mut payload, [flag as u8, TribbleFlag::New as u8], [&frag, &idle]);
            engine.write_sensor(3, &update(0, payload));
        }
        assert_eq!(engine.stats.slots[3].alignment_data, 2);
        assert_eq!(engine.stats.slots[3].sent_pkts[0], 0);
    }

    #[test]
    fn test_fill_populates_every_record() {
        let pop = population(&[(0, BoardType::Mcg), (1, BoardType::ImuCoil)]);
        let mut engine = GatherEngine::new(PacketLayout::compute(&pop));
        engine.test_fill(true);
        let bytes = engine.active_bytes();
        let mcg_off = PKT_HEADER_SIZE + engine.layout().slots[0].offsets[0].unwrap() as usize;
        assert!(has_new_data(bytes[mcg_off + RECORD_FLAGS_OFFSET]));
        let imu1_off = PKT_HEADER_SIZE + engine.layout().slots[1].offsets[1].unwrap() as usize;
        assert!(has_new_data(bytes[imu1_off + RECORD_FLAGS_OFFSET]));
    }
}
