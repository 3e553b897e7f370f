use std::sync::Arc;

use assert_matches::assert_matches;
use onesided_transport::{Memory, ALIGNMENT};

use crate::{align_up, Log, Parsed, ReadSizePredictor, Slot, LOG_HEADER, SLOT_HEADER};

fn test_log(size: usize) -> Log {
    let mem = Arc::new(Memory::new(size));
    Log::new(mem, 0, size).unwrap()
}

#[test]
fn slot_round_trip() {
    let slot = Slot::new(7, 128, b"hello".to_vec());
    let raw = slot.encode();
    assert_eq!(raw.len() as u64, slot.footprint());
    assert_eq!(raw.len() % ALIGNMENT, 0);

    let parsed = Slot::parse(&raw, u64::MAX);
    assert_matches!(parsed, Parsed::Slot(decoded) => {
        assert_eq!(decoded.proposal, 7);
        assert_eq!(decoded.fuo_snapshot, 128);
        assert_eq!(decoded.payload, b"hello");
    });
}

#[test]
fn slot_parse_edge_cases() {
    // All zeroes: not populated.
    assert_eq!(Slot::parse(&[0; 64], u64::MAX), Parsed::Empty);
    // Too short to even hold a header.
    assert_eq!(Slot::parse(&[1; 8], u64::MAX), Parsed::Empty);

    // Populated but cut off mid-payload: report the needed footprint.
    let slot = Slot::new(3, 0, vec![9; 100]);
    let raw = slot.encode();
    assert_matches!(
        Slot::parse(&raw[..SLOT_HEADER + 10], u64::MAX),
        Parsed::Truncated { footprint } => assert_eq!(footprint, slot.footprint())
    );

    // A length claiming more than the capacity limit is garbage.
    assert_eq!(Slot::parse(&raw, 64), Parsed::Empty);
}

#[test]
fn recycle_request_marker() {
    let req = Slot::recycle_request(5, 4096);
    assert!(req.is_recycle_request());
    assert_eq!(req.fuo_snapshot, 0);

    let round_tripped = match Slot::parse(&req.encode(), u64::MAX) {
        Parsed::Slot(s) => s,
        other => panic!("expected a slot, got {other:?}"),
    };
    assert!(round_tripped.is_recycle_request());

    // An ordinary slot at offset zero is not mistaken for a request.
    let plain = Slot::new(5, 0, b"data".to_vec());
    assert!(!plain.is_recycle_request());
}

#[test]
fn append_advances_and_aligns() {
    let log = test_log(1 << 20);
    assert_eq!(log.header_first_undecided_offset(), 0);

    let a = log.append(1, 0, b"first");
    log.update_header_first_undecided_offset(a.offset + a.size);
    let b = log.append(1, a.offset + a.size, &[7; 200]);
    log.update_header_first_undecided_offset(b.offset + b.size);

    assert_eq!(a.offset, 0);
    assert_eq!(b.offset, a.size);
    assert_eq!(a.region_offset, LOG_HEADER);
    for loc in [a, b] {
        assert_eq!(loc.size, align_up(loc.size));
    }
    let fuo = log.header_first_undecided_offset();
    assert_eq!(fuo, a.size + b.size);
    assert_eq!(fuo, align_up(fuo));
}

#[test]
fn fuo_never_decreases() {
    let log = test_log(1 << 20);
    log.update_header_first_undecided_offset(128);
    // Stale updates are ignored; the header only moves forward.
    log.update_header_first_undecided_offset(64);
    assert_eq!(log.header_first_undecided_offset(), 128);
}

#[test]
fn cursors_follow_appends() {
    let log = test_log(1 << 20);
    let mut accept = log.blocking_iterator();
    let mut commit = log.live_iterator();

    assert!(accept.sample_next().is_none());

    let a = log.append(2, 0, b"one");
    let (at, slot) = accept.sample_next().unwrap();
    assert_eq!(at, a.offset);
    assert_eq!(slot.payload, b"one");
    // Nothing further yet.
    assert!(accept.sample_next().is_none());

    // Not decided until the FUO moves past it.
    assert!(!commit.has_next(log.header_first_undecided_offset()));
    log.update_header_first_undecided_offset(a.offset + a.size);
    let fuo = log.header_first_undecided_offset();
    assert!(commit.has_next(fuo));
    let (_, delivered) = commit.next().unwrap();
    assert_eq!(delivered.payload, b"one");
    assert!(!commit.has_next(fuo));
    assert_eq!(commit.delivered(), fuo);
}

#[test]
fn adopt_overwrites_proposal() {
    let log = test_log(1 << 20);
    let remote = Slot::new(3, 512, b"adopted".to_vec());
    let size = log.adopt(0, &remote, 9);
    assert_eq!(size, remote.footprint());

    assert_matches!(log.parse_at(0), Parsed::Slot(slot) => {
        assert_eq!(slot.proposal, 9);
        assert_eq!(slot.fuo_snapshot, 512);
        assert_eq!(slot.payload, b"adopted");
    });
}

#[test]
fn recycling_resets_state() {
    let log = test_log(1 << 20);
    let a = log.append(1, 0, b"gone soon");
    log.update_header_first_undecided_offset(a.offset + a.size);
    log.set_min_proposal(11);

    log.reset_fuo();
    log.bzero();

    assert_eq!(log.header_first_undecided_offset(), 0);
    assert_eq!(log.parse_at(0), Parsed::Empty);
    // The proposal floor survives recycling.
    assert_eq!(log.min_proposal(), 11);
}

#[test]
fn space_critical_near_capacity() {
    let log = test_log(64 * 1024);
    assert!(!log.space_left_critical());
    let mut fuo = 0;
    while !log.space_left_critical() {
        let loc = log.append(1, fuo, &[0x5a; 1000]);
        fuo = loc.offset + loc.size;
        log.update_header_first_undecided_offset(fuo);
    }
    // Critical, yet the reserve still fits a recycle request slot.
    assert!(log.entry_capacity() - fuo >= Slot::recycle_request(1, fuo).footprint());
}

#[test]
fn predictor_tracks_recent_footprints() {
    let mut p = ReadSizePredictor::new(1024);
    assert_eq!(p.predict(), 1024);

    for _ in 0..4 {
        p.adjust(64);
    }
    assert_eq!(p.predict(), 64);

    // A single large sample pulls the average up, aligned.
    p.adjust(4096);
    let predicted = p.predict();
    assert_eq!(predicted, align_up(predicted));
    assert!(predicted > 64 && predicted <= 4096);
}
