//! Per-slot driver state machine.
//!
//! One of these runs for each of the 24 sensor-board slots. It consumes
//! timer ticks, classified inbound frames and CNC requests, and emits the
//! frames to put on the bus plus the completions and sensor updates the
//! rest of the system acts on. It owns every per-board protocol decision:
//! polling, CNC in-flight tracking with the one-shot resend, the silence
//! threshold that disables a board, and the loopback test mode.

use crate::cnc::{CncAction, CncOutcome, CncReply, CncValue, CncWirePayload, Peripheral};
use crate::link::{Frame, Inbound, ShortResponse, SpiCmd, CMD_UID_DONT_CARE, PAYLOAD_SIZE};
use crate::loopback::Loopback;
use crate::regmap::SbRegId;
use crate::{DB_MAX_UNANSWERED_RESPONSE, DB_MAX_UNANSWERED_RESPONSE_DISABLE};
use heapless::{Deque, Vec};

/// Value written to a board's reboot register when it goes silent, in case
/// it is alive but misaligned on the bus.
const INITIATE_RESET: u32 = 1;

/// Pending CNC requests a slot will queue while one is in flight.
pub const CNC_QUEUE_DEPTH: usize = 2;

/// Outputs emitted per event. A tick can produce at most a completion, a
/// frame (or synthetic sensor data), a state change and a queued CNC send.
pub const MAX_OUTPUTS: usize = 4;

/// Expected sensor-UID advance between two polls.
const UID_STRIDE: u8 = 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CncKind {
    /// Full 40-byte response frame comes back later.
    Long,
    /// Acknowledged inline in the next sensor frame.
    Short,
}

impl CncKind {
    fn spi_cmd(self) -> SpiCmd {
        match self {
            Self::Long => SpiCmd::Cnc,
            Self::Short => SpiCmd::CncShort,
        }
    }
}

/// A command-and-control request handed down from the router. `token` is
/// the caller's reservation cookie, returned with the completion.
#[derive(Clone, Copy, Debug)]
pub struct CncRequest {
    pub kind: CncKind,
    pub payload: CncWirePayload,
    pub token: u32,
}

/// Poll-to-poll sensor UID delta histogram.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DelayBin {
    Target = 0,
    Less,
    Less1,
    Greater1,
    Greater,
}

pub const DELAY_BIN_COUNT: usize = 5;

#[derive(Clone, Copy, Default, Debug)]
pub struct DbStats {
    pub rx_data_cnt: u32,
    pub rx_cmds_cnt: u32,
    pub crc_errors: u32,
    pub resend_cnc_cnt: u32,
    pub disable_events: u32,
    pub enabled_cnt: u32,
    pub mismatch_cnt: u32,
    pub delay_bins: [u32; DELAY_BIN_COUNT],
}

/// Fresh sensor data to place into the active stream packet.
#[derive(Clone, Copy, Debug)]
pub struct SensorUpdate {
    pub uid: u8,
    pub payload: [u8; PAYLOAD_SIZE],
}

#[derive(Clone, Debug)]
pub enum Output {
    /// Schedule one full-duplex exchange with this slot.
    Send(Frame),
    /// New sensor data for the gather engine.
    Sensor(SensorUpdate),
    /// Complete the reservation identified by the token.
    Cnc(u32, CncOutcome),
    /// The slot was enabled or disabled; gather and status care.
    StateChange { enabled: bool },
    /// DDS synchronization marker from the board.
    DdsSync,
}

pub type Outputs = Vec<Output, MAX_OUTPUTS>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SubmitError {
    /// The slot's pending queue is full.
    QueueFull,
}

/// Driver state for one slot.
pub struct BoardDriver {
    board_id: u8,
    enabled: bool,
    ticks: u32,
    enabled_at_tick: u32,

    /// Last sensor UID seen; polls echo it back to the board.
    sensor_uid: u8,
    /// Consecutive silent polls; any received frame clears it.
    disable_cnt: u32,

    waiting_for_cnc: bool,
    wait_kind: CncKind,
    wait_token: u32,
    xinfo_match: u8,
    cmd_uid: u16,
    response_delay_cnt: u32,
    resend_cnt: u32,
    saved_last_cmd: Option<CncRequest>,
    pending: Deque<CncRequest, CNC_QUEUE_DEPTH>,

    loopback_enabled: bool,
    loopback: Loopback,

    pub stats: DbStats,
}

impl BoardDriver {
    pub fn new(board_id: u8) -> Self {
        Self {
            board_id,
            enabled: false,
            ticks: 0,
            enabled_at_tick: 0,
            sensor_uid: 0xFF,
            disable_cnt: 0,
            waiting_for_cnc: false,
            wait_kind: CncKind::Long,
            wait_token: 0,
            xinfo_match: 0,
            cmd_uid: CMD_UID_DONT_CARE.wrapping_add(1),
            response_delay_cnt: 0,
            resend_cnt: 0,
            saved_last_cmd: None,
            pending: Deque::new(),
            loopback_enabled: false,
            loopback: Loopback::new(0),
            stats: DbStats::default(),
        }
    }

    pub fn board_id(&self) -> u8 {
        self.board_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// A board is reported present once it has answered at least once, is
    /// enabled, and is not already sliding toward a disable.
    pub fn is_present(&self) -> bool {
        self.enabled
            && self.disable_cnt <= 1
            && (self.stats.rx_data_cnt > 0 || self.stats.rx_cmds_cnt > 0)
    }

    pub fn set_enabled(&mut self, enabled: bool) -> Option<Output> {
        self.disable_cnt = 0;
        if self.enabled == enabled {
            return None;
        }
        self.enabled = enabled;
        if enabled {
            self.stats.enabled_cnt += 1;
            self.enabled_at_tick = self.ticks;
        }
        Some(Output::StateChange { enabled })
    }

    pub fn loopback_params(&self) -> (bool, i32) {
        (self.loopback_enabled, self.loopback.offset())
    }

    pub fn set_loopback(&mut self, enabled: bool, offset: i32) {
        self.loopback_enabled = enabled;
        self.loopback.set_offset(offset);
    }

    pub fn enabled_at_tick(&self) -> u32 {
        self.enabled_at_tick
    }

    /// Queue a CNC request. It goes out on the next tick with no exchange
    /// in flight.
    pub fn submit_cnc(&mut self, req: CncRequest) -> Result<(), SubmitError> {
        self.pending
            .push_back(req)
            .map_err(|_| SubmitError::QueueFull)
    }

    /// The link layer saw a corrupt frame from this slot: count it and move
    /// on; the data is gone but the next poll is unaffected.
    pub fn on_crc_error(&mut self) {
        self.stats.crc_errors += 1;
    }

    /// One sensor-poll tick for this slot.
    pub fn on_tick(&mut self) -> Outputs {
        let mut out = Outputs::new();
        self.ticks = self.ticks.wrapping_add(1);

        if self.waiting_for_cnc {
            self.response_delay_cnt += 1;
            if self.response_delay_cnt >= DB_MAX_UNANSWERED_RESPONSE {
                if self.resend_cnt == 0 {
                    // The response (or the command itself) was lost once;
                    // retry exactly once from the saved copy. The resend
                    // replaces this tick's poll.
                    if let Some(saved) = self.saved_last_cmd {
                        self.resend_cnt = 1;
                        self.stats.resend_cnc_cnt += 1;
                        self.waiting_for_cnc = false;
                        let frame = self.start_cnc(&saved, true);
                        let _ = out.push(Output::Send(frame));
                        return out;
                    }
                } else {
                    let _ = out.push(Output::Cnc(self.wait_token, CncOutcome::Timeout));
                    self.waiting_for_cnc = false;
                    self.response_delay_cnt = 0;
                    self.advance_cmd_uid();
                }
            }
        }

        if self.loopback_enabled {
            self.disable_cnt = 0;
            let (uid, payload) = self.loopback.next_frame();
            self.accept_sensor(uid, &payload, &mut out);
        } else if self.enabled {
            self.disable_cnt += 1;
            if self.disable_cnt >= DB_MAX_UNANSWERED_RESPONSE_DISABLE {
                // Board has gone quiet. Fire a reboot at it in case it is
                // alive but misaligned, then stop polling it.
                let _ = out.push(Output::Send(Self::reboot_frame()));
                self.enabled = false;
                self.stats.disable_events += 1;
                let _ = out.push(Output::StateChange { enabled: false });
            } else {
                let _ = out.push(Output::Send(Frame::poll(self.sensor_uid)));
            }
        }

        if !self.waiting_for_cnc {
            if let Some(req) = self.pending.pop_front() {
                let frame = self.start_cnc(&req, false);
                let _ = out.push(Output::Send(frame));
            }
        }
        out
    }

    /// A good frame arrived from this slot.
    pub fn on_inbound(&mut self, inbound: &Inbound) -> Outputs {
        let mut out = Outputs::new();
        match *inbound {
            Inbound::StreamSensor { uid, ref payload } => {
                self.mark_alive(&mut out);
                self.accept_sensor(uid, payload, &mut out);
            }
            Inbound::SensorWithShortAck {
                uid,
                ref payload,
                ack,
            } => {
                self.mark_alive(&mut out);
                self.accept_sensor(uid, payload, &mut out);
                self.accept_short_ack(ack, payload, &mut out);
            }
            Inbound::CncResponse { xinfo, ref payload } => {
                self.mark_alive(&mut out);
                self.stats.rx_cmds_cnt += 1;
                self.accept_cnc_response(xinfo, payload, &mut out);
            }
            Inbound::DdsTrig => {
                let _ = out.push(Output::DdsSync);
            }
            Inbound::Unexpected(_) => {}
        }
        out
    }

    /// Any decodable frame proves the board is there: clear the silence
    /// count and re-enable a slot that was given up on.
    fn mark_alive(&mut self, out: &mut Outputs) {
        self.disable_cnt = 0;
        if !self.enabled {
            if let Some(change) = self.set_enabled(true) {
                let _ = out.push(change);
            }
        }
    }

    fn accept_sensor(&mut self, uid: u8, payload: &[u8; PAYLOAD_SIZE], out: &mut Outputs) {
        self.stats.rx_data_cnt += 1;
        let delta = uid.wrapping_sub(self.sensor_uid);
        let bin = match delta {
            UID_STRIDE => DelayBin::Target,
            0 => DelayBin::Less1,
            d if d == UID_STRIDE + 1 => DelayBin::Greater1,
            _ => DelayBin::Greater,
        };
        self.stats.delay_bins[bin as usize] += 1;

        // Same UID means the board had no new conversion; don't disturb
        // the packet slot.
        if uid != self.sensor_uid {
            let _ = out.push(Output::Sensor(SensorUpdate {
                uid,
                payload: *payload,
            }));
        }
        self.sensor_uid = uid;
    }

    fn accept_short_ack(&mut self, ack: ShortResponse, payload: &[u8; PAYLOAD_SIZE], out: &mut Outputs) {
        if !self.waiting_for_cnc || self.wait_kind != CncKind::Short {
            return;
        }
        if ack.cmd_uid == self.cmd_uid {
            self.stats.rx_cmds_cnt += 1;
            self.advance_cmd_uid();
            self.waiting_for_cnc = false;
            self.response_delay_cnt = 0;
            let reply = CncReply {
                payload: CncWirePayload::from_bytes(payload),
                short: ack,
            };
            let _ = out.push(Output::Cnc(self.wait_token, CncOutcome::Ok(reply)));
        } else {
            // Stale ack (e.g. for the first transmission of a resent
            // command); the in-flight wait stands until the right UID or
            // the timeout path resolves it.
            self.stats.mismatch_cnt += 1;
        }
    }

    fn accept_cnc_response(&mut self, xinfo: u8, payload: &[u8; PAYLOAD_SIZE], out: &mut Outputs) {
        if !self.waiting_for_cnc {
            return;
        }
        let reply = CncReply {
            payload: CncWirePayload::from_bytes(payload),
            short: ShortResponse::NONE,
        };
        let outcome = if xinfo == self.xinfo_match {
            CncOutcome::Ok(reply)
        } else {
            self.stats.mismatch_cnt += 1;
            CncOutcome::Mismatch(reply)
        };
        self.waiting_for_cnc = false;
        self.response_delay_cnt = 0;
        let _ = out.push(Output::Cnc(self.wait_token, outcome));
    }

    fn start_cnc(&mut self, req: &CncRequest, resend: bool) -> Frame {
        let mut payload = req.payload;
        payload.short_id = self.cmd_uid;

        // Fresh requests reset the retry budget; a resend keeps it spent.
        if !resend {
            self.resend_cnt = 0;
        }
        self.saved_last_cmd = Some(*req);

        self.wait_kind = req.kind;
        self.wait_token = req.token;
        self.waiting_for_cnc = true;
        self.response_delay_cnt = 0;
        self.xinfo_match = self.xinfo_match.wrapping_add(1);

        Frame::cnc(req.kind.spi_cmd(), self.xinfo_match, self.cmd_uid, &payload)
    }

    fn advance_cmd_uid(&mut self) {
        self.cmd_uid = self.cmd_uid.wrapping_add(1);
        if self.cmd_uid == CMD_UID_DONT_CARE {
            self.cmd_uid = CMD_UID_DONT_CARE.wrapping_add(1);
        }
    }

    fn reboot_frame() -> Frame {
        let payload = CncWirePayload::request(
            Peripheral::Mcu,
            CncAction::Write,
            SbRegId::RebootFlag as u32,
            CncValue::U32(INITIATE_RESET),
        );
        Frame::cnc(SpiCmd::Cnc, 0, CMD_UID_DONT_CARE, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::SINE_TABLE;

    fn enabled_driver() -> BoardDriver {
        let mut d = BoardDriver::new(3);
        d.set_enabled(true);
        d
    }

    fn sensor_inbound(uid: u8) -> Inbound {
        Inbound::StreamSensor {
            uid,
            payload: [0; PAYLOAD_SIZE],
        }
    }

    fn cnc_request(token: u32) -> CncRequest {
        CncRequest {
            kind: CncKind::Long,
            payload: CncWirePayload::request(
                Peripheral::Mcu,
                CncAction::Read,
                SbRegId::HwType as u32,
                CncValue::None,
            ),
            token,
        }
    }

    fn sent_frames(out: &Outputs) -> std::vec::Vec<Frame> {
        out.iter()
            .filter_map(|o| match o {
                Output::Send(f) => Some(*f),
                _ => None,
            })
            .collect()
    }

    fn completions(out: &Outputs) -> std::vec::Vec<(u32, CncOutcome)> {
        out.iter()
            .filter_map(|o| match o {
                Output::Cnc(t, r) => Some((*t, *r)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn idle_tick_emits_poll_with_last_uid() {
        let mut d = enabled_driver();
        d.on_inbound(&sensor_inbound(7));
        let out = d.on_tick();
        let frames = sent_frames(&out);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].cmd, SpiCmd::Nop);
        assert_eq!(frames[0].xinfo, 7);
    }

    #[test]
    fn crc_error_counts_without_escalation() {
        // S2: a corrupt frame is a statistic, nothing else.
        let mut d = enabled_driver();
        d.on_inbound(&sensor_inbound(1));
        let rx_before = d.stats.rx_data_cnt;
        d.on_crc_error();
        assert_eq!(d.stats.crc_errors, 1);
        assert_eq!(d.stats.rx_data_cnt, rx_before);
        assert!(d.is_enabled());
        // Next cycle proceeds normally.
        assert_eq!(sent_frames(&d.on_tick()).len(), 1);
    }

    #[test]
    fn silent_board_disables_once_with_one_reboot() {
        // S3: silence for the disable threshold emits exactly one reboot
        // CNC and one disable transition.
        let mut d = enabled_driver();
        d.on_inbound(&sensor_inbound(1));
        let mut reboots = 0;
        let mut disables = 0;
        for _ in 0..(DB_MAX_UNANSWERED_RESPONSE_DISABLE + 5) {
            let out = d.on_tick();
            for o in out.iter() {
                match o {
                    Output::Send(f) if f.cmd == SpiCmd::Cnc => reboots += 1,
                    Output::StateChange { enabled: false } => disables += 1,
                    _ => {}
                }
            }
        }
        assert_eq!(reboots, 1);
        assert_eq!(disables, 1);
        assert!(!d.is_enabled());
        assert_eq!(d.stats.disable_events, 1);
        assert!(!d.is_present());
    }

    #[test]
    fn received_data_resets_the_silence_count() {
        let mut d = enabled_driver();
        for round in 0..3 {
            for _ in 0..(DB_MAX_UNANSWERED_RESPONSE_DISABLE - 1) {
                d.on_tick();
            }
            d.on_inbound(&sensor_inbound(round as u8 + 1));
            assert!(d.is_enabled(), "round {round}");
        }
    }

    #[test]
    fn cnc_retry_exactly_once_then_timeout() {
        // S4 without a reply at all: one retransmit, then Timeout.
        let mut d = enabled_driver();
        d.on_inbound(&sensor_inbound(1));
        d.submit_cnc(cnc_request(0xAB)).unwrap();
        let out = d.on_tick();
        let first: std::vec::Vec<_> = sent_frames(&out)
            .into_iter()
            .filter(|f| f.cmd == SpiCmd::Cnc)
            .collect();
        assert_eq!(first.len(), 1);
        let first_xinfo = first[0].xinfo;

        let mut resends = std::vec::Vec::new();
        let mut outcome = None;
        for _ in 0..(3 * DB_MAX_UNANSWERED_RESPONSE) {
            let out = d.on_tick();
            if let Some((token, res)) = completions(&out).first().copied() {
                // The timeout tick may also carry the silence-threshold
                // reboot command; only frames before it are retransmits.
                assert_eq!(token, 0xAB);
                outcome = Some(res);
                break;
            }
            resends.extend(
                sent_frames(&out)
                    .into_iter()
                    .filter(|f| f.cmd == SpiCmd::Cnc),
            );
        }
        assert_eq!(resends.len(), 1, "exactly one retransmit");
        // The resend re-keys the match window.
        assert_eq!(resends[0].xinfo, first_xinfo.wrapping_add(1));
        assert_eq!(outcome, Some(CncOutcome::Timeout));
        assert_eq!(d.stats.resend_cnc_cnt, 1);
    }

    #[test]
    fn cnc_retry_can_still_succeed() {
        // S4, reply arrives for the retransmission.
        let mut d = enabled_driver();
        d.submit_cnc(cnc_request(7)).unwrap();
        d.on_tick();
        let mut resend_xinfo = None;
        for _ in 0..DB_MAX_UNANSWERED_RESPONSE {
            for o in d.on_tick().iter() {
                if let Output::Send(f) = o {
                    if f.cmd == SpiCmd::Cnc {
                        resend_xinfo = Some(f.xinfo);
                    }
                }
            }
        }
        let xinfo = resend_xinfo.expect("retransmit expected");
        let mut payload = CncWirePayload::default();
        payload.result_or_size = 0;
        let out = d.on_inbound(&Inbound::CncResponse {
            xinfo,
            payload: payload.to_bytes(),
        });
        match completions(&out).as_slice() {
            [(7, CncOutcome::Ok(_))] => {}
            other => panic!("unexpected completions {other:?}"),
        }
    }

    #[test]
    fn matched_response_completes_ok() {
        let mut d = enabled_driver();
        d.submit_cnc(cnc_request(1)).unwrap();
        let out = d.on_tick();
        let frame = sent_frames(&out)
            .into_iter()
            .find(|f| f.cmd == SpiCmd::Cnc)
            .unwrap();
        let out = d.on_inbound(&Inbound::CncResponse {
            xinfo: frame.xinfo,
            payload: CncWirePayload::default().to_bytes(),
        });
        assert!(matches!(
            completions(&out).as_slice(),
            [(1, CncOutcome::Ok(_))]
        ));
        assert_eq!(d.stats.rx_cmds_cnt, 1);
    }

    #[test]
    fn mismatched_xinfo_still_delivers_flagged() {
        let mut d = enabled_driver();
        d.submit_cnc(cnc_request(2)).unwrap();
        let frame = sent_frames(&d.on_tick())
            .into_iter()
            .find(|f| f.cmd == SpiCmd::Cnc)
            .unwrap();
        let out = d.on_inbound(&Inbound::CncResponse {
            xinfo: frame.xinfo.wrapping_add(9),
            payload: CncWirePayload::default().to_bytes(),
        });
        assert!(matches!(
            completions(&out).as_slice(),
            [(2, CncOutcome::Mismatch(_))]
        ));
        assert_eq!(d.stats.mismatch_cnt, 1);
        // The wait state is cleared either way.
        assert!(sent_frames(&d.on_tick())
            .iter()
            .all(|f| f.cmd == SpiCmd::Nop));
    }

    #[test]
    fn short_response_matches_cmd_uid_and_advances_it() {
        let mut d = enabled_driver();
        let req = CncRequest {
            kind: CncKind::Short,
            ..cnc_request(9)
        };
        d.submit_cnc(req).unwrap();
        let frame = sent_frames(&d.on_tick())
            .into_iter()
            .find(|f| f.cmd == SpiCmd::CncShort)
            .unwrap();
        let sent_uid = frame.short.cmd_uid;

        // Wrong-uid ack leaves the wait in place.
        let out = d.on_inbound(&Inbound::SensorWithShortAck {
            uid: 1,
            payload: [0; PAYLOAD_SIZE],
            ack: ShortResponse {
                cmd_uid: sent_uid.wrapping_add(1),
                cmd_result: 0,
            },
        });
        assert!(completions(&out).is_empty());

        let out = d.on_inbound(&Inbound::SensorWithShortAck {
            uid: 2,
            payload: [0; PAYLOAD_SIZE],
            ack: ShortResponse {
                cmd_uid: sent_uid,
                cmd_result: 0,
            },
        });
        match completions(&out).as_slice() {
            [(9, CncOutcome::Ok(reply))] => assert_eq!(reply.short.cmd_uid, sent_uid),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cmd_uid_skips_dont_care_on_wrap() {
        let mut d = enabled_driver();
        d.cmd_uid = u16::MAX;
        d.advance_cmd_uid();
        assert_eq!(d.cmd_uid, CMD_UID_DONT_CARE.wrapping_add(1));
    }

    #[test]
    fn queue_depth_is_bounded() {
        let mut d = enabled_driver();
        d.submit_cnc(cnc_request(1)).unwrap();
        d.submit_cnc(cnc_request(2)).unwrap();
        assert_eq!(d.submit_cnc(cnc_request(3)), Err(SubmitError::QueueFull));
    }

    #[test]
    fn loopback_feeds_sensor_data_without_spi_traffic() {
        // S6: loopback on slot 1, channel 2 follows the sine table and no
        // frames are emitted toward the bus.
        let mut d = BoardDriver::new(1);
        d.set_enabled(true);
        d.set_loopback(true, 0);
        for k in 0..SINE_TABLE.len() {
            let out = d.on_tick();
            assert!(sent_frames(&out).is_empty(), "no SPI traffic in loopback");
            let update = out
                .iter()
                .find_map(|o| match o {
                    Output::Sensor(u) => Some(*u),
                    _ => None,
                })
                .expect("sensor data every tick");
            assert_eq!(
                crate::board::read_adc24(&update.payload, 2),
                SINE_TABLE[(k + 1) % SINE_TABLE.len()]
            );
            assert_eq!(d.stats.rx_data_cnt, k as u32 + 1);
        }
    }

    #[test]
    fn duplicate_sensor_uid_is_not_rewritten() {
        let mut d = enabled_driver();
        let out = d.on_inbound(&sensor_inbound(5));
        assert_eq!(out.iter().filter(|o| matches!(o, Output::Sensor(_))).count(), 1);
        let out = d.on_inbound(&sensor_inbound(5));
        assert_eq!(out.iter().filter(|o| matches!(o, Output::Sensor(_))).count(), 0);
        assert_eq!(d.stats.delay_bins[DelayBin::Less1 as usize], 1);
        assert_eq!(d.stats.rx_data_cnt, 2);
    }

    #[test]
    fn late_frame_reenables_a_disabled_slot() {
        let mut d = enabled_driver();
        d.on_inbound(&sensor_inbound(1));
        for _ in 0..=DB_MAX_UNANSWERED_RESPONSE_DISABLE {
            d.on_tick();
        }
        assert!(!d.is_enabled());
        let out = d.on_inbound(&sensor_inbound(2));
        assert!(out
            .iter()
            .any(|o| matches!(o, Output::StateChange { enabled: true })));
        assert!(d.is_enabled());
        assert_eq!(d.stats.enabled_cnt, 2);
    }
}
