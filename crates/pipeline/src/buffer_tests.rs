// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn accel(ts: u64) -> SensorReading {
    SensorReading::Accel { timestamp: ts, x: 0.0, y: 0.0, z: 0.0 }
}

#[test]
fn push_then_swap_returns_contents_in_order() {
    let mut buf = DoubleBuffer::new();
    buf.push(accel(1));
    buf.push(accel(2));
    buf.push(accel(3));
    assert_eq!(buf.len(), 3);

    let drained = buf.swap();
    let timestamps: Vec<u64> = drained.iter().map(|r| r.timestamp()).collect();
    assert_eq!(timestamps, vec![1, 2, 3]);
    assert_eq!(buf.len(), 0);
}

#[test]
fn swap_on_empty_returns_empty() {
    let mut buf = DoubleBuffer::new();
    assert!(buf.is_empty());
    assert!(buf.swap().is_empty());
}

#[test]
fn pushes_after_swap_land_in_other_half() {
    let mut buf = DoubleBuffer::new();
    buf.push(accel(1));
    let first = buf.swap();
    assert_eq!(first.len(), 1);

    buf.push(accel(2));
    buf.push(accel(3));
    let second = buf.swap();
    let timestamps: Vec<u64> = second.iter().map(|r| r.timestamp()).collect();
    assert_eq!(timestamps, vec![2, 3]);
}

#[test]
fn alternating_swaps_never_duplicate_or_drop() {
    let mut buf = DoubleBuffer::with_capacity(8);
    let mut seen = Vec::new();
    let mut next = 0u64;
    for round in 0..10 {
        for _ in 0..=round {
            buf.push(accel(next));
            next += 1;
        }
        seen.extend(buf.swap().iter().map(|r| r.timestamp()));
    }
    let expected: Vec<u64> = (0..next).collect();
    assert_eq!(seen, expected);
}

proptest::proptest! {
    /// For any split of a push sequence into flush windows, concatenating
    /// swap results reproduces the original order exactly.
    #[test]
    fn swap_preserves_global_order(windows in proptest::collection::vec(0usize..50, 1..20)) {
        let mut buf = DoubleBuffer::new();
        let mut pushed = 0u64;
        let mut collected = Vec::new();
        for window in windows {
            for _ in 0..window {
                buf.push(accel(pushed));
                pushed += 1;
            }
            collected.extend(buf.swap().iter().map(|r| r.timestamp()));
        }
        let expected: Vec<u64> = (0..pushed).collect();
        proptest::prop_assert_eq!(collected, expected);
    }
}
