//! Performance benchmarks for the protocol hot paths

use assert_approx_eq::assert_approx_eq;
use shared::payload::{pack_cells, unpack_cells};
use shared::rtt::RttEstimator;
use shared::wire::{encode, internet_checksum, try_decode};
use shared::{ArqLink, Grid, Message, MessageType};
use std::time::{Duration, Instant};

fn report(name: &str, iterations: u32, duration: Duration) {
    println!(
        "{}: {} iterations in {:?} ({:.2} ns/iter)",
        name,
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );
}

/// Benchmarks header encoding and validation of a full board snapshot
#[test]
fn benchmark_snapshot_encode_decode() {
    let cells: Vec<u8> = (0..400).map(|i| (i % 5) as u8).collect();
    let snapshot = Message::BoardSnapshot {
        snapshot_id: 77,
        packed: pack_cells(&cells),
    };
    let payload = snapshot.to_payload();

    let iterations = 20_000;
    let start = Instant::now();

    for seq in 0..iterations {
        let bytes = encode(MessageType::BoardSnapshot, seq, 0, 77, &payload).unwrap();
        let packet = try_decode(&bytes).unwrap();
        assert_eq!(packet.payload.len(), payload.len());
    }

    let duration = start.elapsed();
    report("Snapshot encode/decode", iterations, duration);

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks the checksum over a maximum-size grid payload
#[test]
fn benchmark_checksum() {
    let data: Vec<u8> = (0..32_768u32).map(|i| (i * 31) as u8).collect();

    let iterations = 200;
    let start = Instant::now();

    let mut last = 0u16;
    for _ in 0..iterations {
        last = internet_checksum(&data);
    }

    let duration = start.elapsed();
    report("Checksum (32 KiB)", iterations, duration);

    assert_eq!(last, internet_checksum(&data));
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks cell packing for the default grid
#[test]
fn benchmark_cell_packing() {
    let cells: Vec<u8> = (0..400).map(|i| (i % 16) as u8).collect();

    let iterations = 50_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let packed = pack_cells(&cells);
        let unpacked = unpack_cells(&packed, 20, 20).unwrap();
        assert_eq!(unpacked.len(), 400);
    }

    let duration = start.elapsed();
    report("Cell pack/unpack", iterations, duration);

    assert!(duration.as_millis() < 2000);
}

/// Stress tests claim resolution on a single grid
#[test]
fn stress_test_many_claims() {
    let mut grid = Grid::new(20, 20);

    let iterations = 200_000u32;
    let start = Instant::now();

    for i in 0..iterations {
        let player = (i % 15 + 1) as u8;
        let cell = (i % 400) as usize;
        grid.apply_claim(cell / 20, cell % 20, player, u64::from(i) + 1);
    }

    let duration = start.elapsed();
    report("Claim resolution", iterations, duration);

    // The last 400 claims each won their cell.
    let total: usize = (1..=15).map(|p| grid.count_owned_by(p)).sum();
    assert_eq!(total, 400);
    assert!(duration.as_millis() < 1000);
}

/// Pushes messages through two links that deliver to each other directly
#[test]
fn benchmark_arq_link_pair() {
    let now = Instant::now();
    let mut sender = ArqLink::new(6, now);
    let mut receiver = ArqLink::new(6, now);

    let messages = 10_000u32;
    let mut sent = 0;
    let mut delivered = 0;
    let start = Instant::now();

    while delivered < messages {
        if sent < messages && sender.can_send() {
            let payload = sent.to_be_bytes();
            assert!(sender.send(MessageType::ClaimRequest, &payload, now).is_sent());
            sent += 1;
        }
        for bytes in sender.drain_outgoing() {
            let packet = try_decode(&bytes).unwrap();
            for packet in receiver.on_receive(packet, now).delivered {
                assert_eq!(packet.header.seq, delivered);
                delivered += 1;
            }
        }
        for bytes in receiver.drain_outgoing() {
            sender.on_receive(try_decode(&bytes).unwrap(), now);
        }
    }

    let duration = start.elapsed();
    report("ARQ link pair", messages, duration);

    assert_eq!(sender.in_flight(), 0);
    assert_eq!(sender.stats().retransmitted, 0);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks RTT estimation and checks where it settles
#[test]
fn benchmark_rtt_estimator() {
    let mut rtt = RttEstimator::new();

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        rtt.record_sample(Duration::from_millis(40));
    }

    let duration = start.elapsed();
    report("RTT sample", iterations, duration);

    assert_approx_eq!(rtt.estimated_ms(), 40.0, 1e-6);
    assert_approx_eq!(rtt.dev_ms(), 0.0, 1e-6);
    // Clamped to the floor once the deviation has decayed.
    assert_approx_eq!(rtt.rto_ms(), 50.0, 1e-6);
    assert!(duration.as_millis() < 1000);
}
