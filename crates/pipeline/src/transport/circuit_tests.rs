// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn starts_closed_and_allows_requests() {
    let mut breaker = CircuitBreaker::new();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.allows_request());
}

#[test]
fn opens_exactly_at_threshold() {
    let mut breaker = CircuitBreaker::new();
    for _ in 0..OPEN_THRESHOLD - 1 {
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.allows_request());
}

#[test]
fn success_resets_failure_streak() {
    let mut breaker = CircuitBreaker::new();
    for _ in 0..OPEN_THRESHOLD - 1 {
        breaker.record_failure();
    }
    breaker.record_success();
    for _ in 0..OPEN_THRESHOLD - 1 {
        breaker.record_failure();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn cooldown_admits_one_trial_as_half_open() {
    let mut breaker = CircuitBreaker::with_policy(2, Duration::from_millis(20), 2);
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.allows_request());

    std::thread::sleep(Duration::from_millis(30));
    assert!(breaker.allows_request());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[test]
fn two_half_open_successes_close() {
    let mut breaker = CircuitBreaker::with_policy(1, Duration::from_millis(10), 2);
    breaker.record_failure();
    std::thread::sleep(Duration::from_millis(20));
    assert!(breaker.allows_request());

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn half_open_failure_restarts_cooldown() {
    let mut breaker = CircuitBreaker::with_policy(1, Duration::from_millis(30), 2);
    breaker.record_failure();
    std::thread::sleep(Duration::from_millis(40));
    assert!(breaker.allows_request());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.allows_request(), "cooldown restarted");
}

#[test]
fn background_policy_closes_after_single_success() {
    let mut breaker = CircuitBreaker::with_policy(5, Duration::from_millis(10), 1);
    for _ in 0..5 {
        breaker.record_failure();
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    std::thread::sleep(Duration::from_millis(20));
    assert!(breaker.allows_request());
    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn state_names() {
    assert_eq!(CircuitState::Closed.as_str(), "closed");
    assert_eq!(CircuitState::Open.as_str(), "open");
    assert_eq!(CircuitState::HalfOpen.as_str(), "half_open");
}
