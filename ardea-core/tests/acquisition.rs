//! End-to-end exercises of the acquisition pipeline: slot drivers polling
//! a simulated chassis over the frame codec, sensor data landing in the
//! gather engine, packets shipping, and CNC exchanges riding the same
//! link.

use ardea_core::board::{
    has_new_data, write_adc24, write_imu_payload, BoardType, ECG_RECORD_SIZE, IMU_RECORD_SIZE,
    RECORD_FLAGS_OFFSET, RECORD_HEADER_SIZE,
};
use ardea_core::cnc::{CncAction, CncOutcome, CncValue, CncWirePayload, Peripheral};
use ardea_core::dbcomm::{BoardDriver, CncKind, CncRequest, Output};
use ardea_core::gather::{GatherEngine, PacketLayout, PKT_HEADER_SIZE};
use ardea_core::imu::TribbleFlag;
use ardea_core::link::{Frame, Inbound, ShortResponse, SpiCmd, FRAME_SIZE};
use ardea_core::regmap::SbRegId;
use ardea_core::MAX_BOARDS;

/// A pretend sensor board on the far end of the wire: answers polls with
/// rolling ADC data and CNC requests with a canned register file.
struct FakeBoard {
    board_type: BoardType,
    uid: u8,
    sample: u32,
    /// Queued long-form CNC response, sent on the exchange after the
    /// request (the reply direction of an exchange is already in flight
    /// when the request arrives).
    pending_resp: Option<Frame>,
    /// Ignore the next `drop_n` incoming CNC requests, as if they were
    /// corrupted on the way down.
    drop_n: u32,
}

impl FakeBoard {
    fn new(board_type: BoardType) -> Self {
        Self {
            board_type,
            uid: 0,
            sample: 1_000,
            pending_resp: None,
            drop_n: 0,
        }
    }

    /// Process one exchanged frame, producing the simultaneous reply.
    fn exchange(&mut self, wire: &[u8; FRAME_SIZE]) -> Option<[u8; FRAME_SIZE]> {
        // Whatever was staged after the previous exchange goes out now.
        let reply_now = self.pending_resp.take();

        let frame = Frame::decode(wire).expect("controller sent a bad frame");
        if frame.cmd == SpiCmd::Cnc {
            if self.drop_n > 0 {
                // Request corrupted on the way down; the board never saw it.
                self.drop_n -= 1;
            } else {
                let mut payload = CncWirePayload::from_bytes(&frame.payload);
                payload.result_or_size = 0;
                if payload.addr == SbRegId::HwType as u32 {
                    payload.set_value(CncValue::U32(self.board_type as u32));
                }
                self.pending_resp = Some(Frame::new(
                    SpiCmd::RespCnc,
                    frame.xinfo,
                    ShortResponse::NONE,
                    payload.to_bytes(),
                ));
            }
        }

        if let Some(resp) = reply_now {
            return Some(resp.encode());
        }

        // Default reply: fresh sensor data.
        self.uid = self.uid.wrapping_add(1);
        self.sample += 1;
        let mut payload = [0u8; 40];
        for ch in 0..8 {
            write_adc24(&mut payload, ch, self.sample + ch as u32);
        }
        Some(Frame::new(SpiCmd::StreamSensor, self.uid, ShortResponse::NONE, payload).encode())
    }
}

/// One controller tick against the fake chassis: drivers poll, boards
/// answer in the same exchange, replies feed back through the drivers into
/// the gather engine. Completions are collected for the caller.
fn run_tick(
    drivers: &mut [BoardDriver],
    boards: &mut [Option<FakeBoard>],
    gather: &mut GatherEngine,
    completions: &mut Vec<(u32, CncOutcome)>,
) {
    for slot in 0..drivers.len() {
        let outputs = drivers[slot].on_tick();
        let mut replies = Vec::new();
        for output in outputs {
            match output {
                Output::Send(frame) => {
                    if let Some(board) = boards[slot].as_mut() {
                        if let Some(reply) = board.exchange(&frame.encode()) {
                            replies.push(reply);
                        }
                    }
                }
                Output::Sensor(update) => gather.write_sensor(slot, &update),
                Output::Cnc(token, outcome) => completions.push((token, outcome)),
                Output::StateChange { .. } | Output::DdsSync => {}
            }
        }
        for reply in replies {
            match Frame::decode(&reply) {
                Ok(frame) => {
                    for output in drivers[slot].on_inbound(&Inbound::classify(&frame)) {
                        match output {
                            Output::Sensor(update) => gather.write_sensor(slot, &update),
                            Output::Cnc(token, outcome) => completions.push((token, outcome)),
                            _ => {}
                        }
                    }
                }
                Err(_) => drivers[slot].on_crc_error(),
            }
        }
    }
}

fn chassis(
    population: &[(usize, BoardType)],
) -> (
    Vec<BoardDriver>,
    Vec<Option<FakeBoard>>,
    GatherEngine,
) {
    let mut pop = [BoardType::Empty; MAX_BOARDS];
    for &(slot, ty) in population {
        pop[slot] = ty;
    }
    let gather = GatherEngine::new(PacketLayout::compute(&pop));
    let mut drivers: Vec<BoardDriver> = (0..MAX_BOARDS)
        .map(|slot| BoardDriver::new(slot as u8))
        .collect();
    let mut boards: Vec<Option<FakeBoard>> = (0..MAX_BOARDS).map(|_| None).collect();
    for &(slot, ty) in population {
        drivers[slot].set_enabled(true);
        boards[slot] = Some(FakeBoard::new(ty));
    }
    (drivers, boards, gather)
}

#[test]
fn steady_state_streams_every_populated_slot() {
    let (mut drivers, mut boards, mut gather) =
        chassis(&[(0, BoardType::Mcg), (1, BoardType::Ecg), (5, BoardType::Ecg12)]);
    let mut completions = Vec::new();

    for _ in 0..10 {
        run_tick(&mut drivers, &mut boards, &mut gather, &mut completions);
        let pkt = gather.ship(|| 1.0).to_vec();
        assert_eq!(pkt[5..9], [1, 1, 1, 0]);
        // Every populated record went out fresh.
        let mcg_off = PKT_HEADER_SIZE;
        assert!(has_new_data(pkt[mcg_off + RECORD_FLAGS_OFFSET]));
    }
    for slot in [0usize, 1, 5] {
        assert_eq!(drivers[slot].stats.rx_data_cnt, 10, "slot {slot}");
        assert_eq!(gather.stats.slots[slot].missed_data, 0, "slot {slot}");
        assert!(drivers[slot].is_present());
    }
    assert!(completions.is_empty());
}

#[test]
fn hw_type_query_round_trips_over_the_link() {
    // A board-type read against slot 0: request rides the poll stream and
    // the response carries the register value back.
    let (mut drivers, mut boards, mut gather) = chassis(&[(0, BoardType::Mcg)]);
    let mut completions = Vec::new();

    // Establish presence first.
    run_tick(&mut drivers, &mut boards, &mut gather, &mut completions);
    assert!(drivers[0].is_present());

    let payload = CncWirePayload::request(
        Peripheral::Mcu,
        CncAction::Read,
        SbRegId::HwType as u32,
        CncValue::None,
    );
    drivers[0]
        .submit_cnc(CncRequest {
            kind: CncKind::Long,
            payload,
            token: 42,
        })
        .unwrap();

    for _ in 0..3 {
        run_tick(&mut drivers, &mut boards, &mut gather, &mut completions);
        if !completions.is_empty() {
            break;
        }
    }
    match completions.as_slice() {
        [(42, CncOutcome::Ok(reply))] => {
            assert_eq!(reply.payload.result_or_size, 0);
            assert_eq!(reply.payload.value_u32(), BoardType::Mcg as u32);
        }
        other => panic!("unexpected completions {other:?}"),
    }
}

#[test]
fn lost_response_is_resent_once_and_succeeds() {
    let (mut drivers, mut boards, mut gather) = chassis(&[(2, BoardType::Ecg)]);
    let mut completions = Vec::new();
    run_tick(&mut drivers, &mut boards, &mut gather, &mut completions);

    // The first request is lost on the link; only the retransmit gets
    // through.
    boards[2].as_mut().unwrap().drop_n = 1;

    let payload = CncWirePayload::request(Peripheral::Mcu, CncAction::Read, 1, CncValue::None);
    drivers[2]
        .submit_cnc(CncRequest {
            kind: CncKind::Long,
            payload,
            token: 7,
        })
        .unwrap();

    for _ in 0..(4 * ardea_core::DB_MAX_UNANSWERED_RESPONSE) {
        run_tick(&mut drivers, &mut boards, &mut gather, &mut completions);
        if !completions.is_empty() {
            break;
        }
    }
    assert_eq!(drivers[2].stats.resend_cnc_cnt, 1);
    match completions.as_slice() {
        [(7, CncOutcome::Ok(_))] => {}
        other => panic!("unexpected completions {other:?}"),
    }
}

#[test]
fn absent_board_disables_and_stops_consuming_packets() {
    let (mut drivers, mut boards, mut gather) =
        chassis(&[(3, BoardType::Ecg), (4, BoardType::Ecg)]);
    let mut completions = Vec::new();

    run_tick(&mut drivers, &mut boards, &mut gather, &mut completions);
    // Slot 4 is yanked out of the chassis.
    boards[4] = None;

    for _ in 0..(2 * ardea_core::DB_MAX_UNANSWERED_RESPONSE_DISABLE) {
        run_tick(&mut drivers, &mut boards, &mut gather, &mut completions);
    }
    assert!(!drivers[4].is_present());
    assert!(drivers[3].is_present());
    assert_eq!(drivers[4].stats.disable_events, 1);
    // The healthy neighbor keeps streaming.
    let before = drivers[3].stats.rx_data_cnt;
    run_tick(&mut drivers, &mut boards, &mut gather, &mut completions);
    assert_eq!(drivers[3].stats.rx_data_cnt, before + 1);
}

#[test]
fn imu_board_fragments_reassemble_through_the_pipeline() {
    let (mut drivers, _boards, mut gather) = chassis(&[(6, BoardType::ImuCoil)]);

    // Drive the driver inbound path directly with a fragment sequence for
    // IMU 0 while IMU 1 idles.
    let sample: Vec<u8> = (0u8..48).collect();
    let idle = [0u8; 16];
    for (i, flag) in [TribbleFlag::High, TribbleFlag::Mid, TribbleFlag::Low]
        .into_iter()
        .enumerate()
    {
        let mut payload = [0u8; 40];
        write_imu_payload(
            &mut payload,
            [flag as u8, TribbleFlag::New as u8],
            [&sample[16 * i..16 * (i + 1)], &idle],
        );
        let outputs = drivers[6].on_inbound(&Inbound::StreamSensor {
            uid: i as u8 + 1,
            payload,
        });
        for output in outputs {
            if let Output::Sensor(update) = output {
                gather.write_sensor(6, &update);
            }
        }
    }

    let imu0_off = gather.layout().slots[6].offsets[0].unwrap() as usize;
    let pkt = gather.ship(|| 0.0);
    let record = &pkt[PKT_HEADER_SIZE + imu0_off..PKT_HEADER_SIZE + imu0_off + IMU_RECORD_SIZE];
    assert!(has_new_data(record[RECORD_FLAGS_OFFSET]));
    assert_eq!(&record[RECORD_HEADER_SIZE..], &sample[..]);
}

#[test]
fn packet_shape_tracks_population_and_uid_is_monotonic() {
    let (mut drivers, mut boards, mut gather) = chassis(&[
        (0, BoardType::Mcg),
        (1, BoardType::Mcg),
        (2, BoardType::Ecg),
        (3, BoardType::ImuCoil),
    ]);
    let mut completions = Vec::new();

    let expected_len =
        PKT_HEADER_SIZE + 2 * 48 + ECG_RECORD_SIZE + 2 * IMU_RECORD_SIZE;
    let mut last_uid = None;
    for _ in 0..5 {
        run_tick(&mut drivers, &mut boards, &mut gather, &mut completions);
        let pkt = gather.ship(|| 2.0).to_vec();
        assert_eq!(pkt.len(), expected_len);
        let uid = u32::from_le_bytes(pkt[0..4].try_into().unwrap());
        if let Some(prev) = last_uid {
            assert_eq!(uid, prev + 1);
        }
        last_uid = Some(uid);
    }
}
