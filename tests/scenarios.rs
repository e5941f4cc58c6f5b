//! End-to-end scenarios driven through the public API.
//!
//! Time-sensitive cases use the `_at` variants with explicit
//! timestamps on the registry's own clock, so window boundaries are
//! exercised without sleeping.

use std::sync::Arc;
use std::thread;

use tollgate::{Limit, RateLimiter};

fn limiter() -> RateLimiter {
    RateLimiter::new(1024).unwrap()
}

#[test]
fn fixed_window_burst_then_fresh_window() {
    let rl = limiter();
    rl.create_limiter("k1", Limit::new(3, 1000)).unwrap();
    let t = rl.now_ms();

    let results: Vec<bool> = (0..4).map(|_| rl.try_request_at("k1", None, t)).collect();
    assert_eq!(results, vec![true, true, true, false]);

    assert!(rl.try_request_at("k1", None, t + 1100));
}

#[test]
fn fixed_window_admits_exactly_capacity_after_window() {
    let rl = limiter();
    rl.create_limiter("k", Limit::new(5, 1000)).unwrap();
    let t = rl.now_ms();

    for _ in 0..5 {
        assert!(rl.try_request_at("k", None, t));
    }

    // A burst far larger than the capacity, one window later: exactly
    // five admissions regardless of burst size.
    let admitted = (0..40)
        .filter(|_| rl.try_request_at("k", None, t + 1000))
        .count();
    assert_eq!(admitted, 5);
}

#[test]
fn sliding_window_refills_half_after_half_a_window() {
    let rl = limiter();
    rl.create_limiter("k2", Limit::new(10, 1000).sliding()).unwrap();
    let t = rl.now_ms();

    for i in 0..10 {
        assert!(rl.try_request_at("k2", None, t), "request {} of warm bucket", i);
    }
    assert!(!rl.try_request_at("k2", None, t));

    let admitted = (0..10)
        .filter(|_| rl.try_request_at("k2", None, t + 500))
        .count();
    assert!(
        (4..=6).contains(&admitted),
        "expected about half the bucket back, got {}",
        admitted
    );
}

#[test]
fn block_cooldown_denies_then_lifts() {
    let rl = limiter();
    rl.create_limiter("k3", Limit::new(2, 1000).with_block_ms(500))
        .unwrap();
    let t = rl.now_ms();

    assert!(rl.try_request_at("k3", None, t));
    assert!(rl.try_request_at("k3", None, t));
    assert!(!rl.try_request_at("k3", None, t)); // arms the cooldown

    assert!(!rl.try_request_at("k3", None, t + 100));
    assert!(!rl.try_request_at("k3", None, t + 250));

    assert!(rl.try_request_at("k3", None, t + 550));
}

#[test]
fn penalties_step_the_limit_down_and_back() {
    let rl = limiter();
    rl.create_limiter("k4", Limit::new(100, 1000).with_max_penalty(10))
        .unwrap();

    rl.add_penalty("k4", 5);
    assert_eq!(rl.get_current_limit("k4"), 50);

    rl.add_penalty("k4", 5);
    assert_eq!(rl.get_current_limit("k4"), 10);

    rl.remove_penalty("k4", 7);
    assert_eq!(rl.get_current_limit("k4"), 70);
}

#[test]
fn penalty_round_trip_restores_prior_limit() {
    let rl = limiter();
    rl.create_limiter("k", Limit::new(60, 1000).with_max_penalty(6))
        .unwrap();
    let before = rl.get_current_limit("k");

    rl.add_penalty("k", 4);
    assert_ne!(rl.get_current_limit("k"), before);

    rl.remove_penalty("k", 4);
    assert_eq!(rl.get_current_limit("k"), before);
}

#[test]
fn dynamic_limit_stays_within_bounds() {
    let rl = limiter();
    rl.create_limiter("k", Limit::new(47, 1000).with_max_penalty(9))
        .unwrap();

    for points in 0..20 {
        rl.add_penalty("k", points);
        let limit = rl.get_current_limit("k");
        assert!(limit >= 5, "limit {} fell below a tenth of base", limit);
        assert!(limit <= 47, "limit {} exceeded base", limit);
    }
}

#[test]
fn blocked_key_reports_retry_after() {
    let rl = limiter();
    rl.create_limiter("k5", Limit::new(5, 5000).with_block_ms(2000))
        .unwrap();
    let t = rl.now_ms();

    for _ in 0..5 {
        assert!(rl.try_request_at("k5", None, t));
    }
    assert!(!rl.try_request_at("k5", None, t)); // denial arms the block

    let info = rl.get_rate_limit_info_at("k5", t + 10);
    assert!(info.blocked);
    assert_eq!(info.remaining, 0);
    assert!(
        (1..=2).contains(&info.retry_after_s),
        "retry_after {} out of range",
        info.retry_after_s
    );
}

#[test]
fn tokens_decrease_monotonically_under_successes() {
    let rl = limiter();
    rl.create_limiter("k", Limit::new(8, 60_000)).unwrap();
    let t = rl.now_ms();

    let mut last = rl.get_tokens("k");
    while rl.try_request_at("k", None, t) {
        let current = rl.get_tokens("k");
        assert!(current < last);
        last = current;
    }
    assert_eq!(last, 0);
}

#[test]
fn capacity_is_never_exceeded() {
    let rl = limiter();
    rl.create_limiter("k", Limit::new(12, 100).sliding().with_max_penalty(4))
        .unwrap();
    let mut t = rl.now_ms();

    // Mix refills, penalties, and requests; the token count must stay
    // inside [0, current limit] and the limit inside [ceil(base/10), base].
    for round in 0..50 {
        t += 37;
        rl.try_request_at("k", None, t);
        if round % 7 == 0 {
            rl.add_penalty("k", 1);
        }
        if round % 11 == 0 {
            rl.remove_penalty("k", 2);
        }

        let tokens = rl.get_tokens("k");
        let limit = rl.get_current_limit("k");
        assert!(tokens >= 0);
        assert!(tokens <= limit, "tokens {} above limit {}", tokens, limit);
        assert!(limit <= 12);
        assert!(limit >= 2);
    }
}

#[test]
fn allow_list_bypasses_exhausted_bucket() {
    let rl = limiter();
    rl.create_limiter("k", Limit::new(1, 60_000)).unwrap();
    rl.add_to_whitelist("1.2.3.4");
    let t = rl.now_ms();

    assert!(rl.try_request_at("k", None, t));
    assert!(!rl.try_request_at("k", None, t));
    assert_eq!(rl.get_tokens("k"), 0);

    assert!(rl.try_request_at("k", Some("1.2.3.4"), t));
}

#[test]
fn deny_list_vetoes_regardless_of_bucket_state() {
    let rl = limiter();
    rl.create_limiter("k", Limit::new(100, 60_000)).unwrap();
    rl.add_to_blacklist("6.6.6.6");

    assert!(!rl.try_request("k", Some("6.6.6.6")));
    assert_eq!(rl.get_tokens("k"), 100);
}

#[test]
fn stats_add_up_across_a_mixed_run() {
    let rl = limiter();
    rl.create_limiter("a", Limit::new(3, 60_000).with_max_penalty(5))
        .unwrap();
    rl.add_to_blacklist("bad");
    rl.add_to_whitelist("good");
    rl.add_penalty("a", 1);
    let t = rl.now_ms();

    for _ in 0..6 {
        rl.try_request_at("a", None, t);
    }
    rl.try_request_at("a", Some("bad"), t);
    rl.try_request_at("a", Some("good"), t);
    rl.try_request_at("missing", None, t);

    let stats = rl.get_stats();
    assert_eq!(stats.total, 9);
    assert_eq!(stats.allowed + stats.blocked, stats.total);
    assert!(stats.penalized <= stats.allowed);
    assert!(stats.penalized >= 1);
}

#[test]
fn operations_on_one_key_leave_others_untouched() {
    let rl = limiter();
    rl.create_limiter("a", Limit::new(4, 1000).with_block_ms(300))
        .unwrap();
    rl.create_limiter("b", Limit::new(9, 1000).with_max_penalty(3))
        .unwrap();
    let t = rl.now_ms();

    // Exhaust and block "a"; penalize "b".
    for _ in 0..5 {
        rl.try_request_at("a", None, t);
    }
    rl.add_penalty("b", 1);

    assert_eq!(rl.get_tokens("b"), 6);
    assert_eq!(rl.get_current_limit("b"), 6);
    assert!(!rl.get_rate_limit_info_at("b", t).blocked);
    assert!(rl.get_rate_limit_info_at("a", t + 10).blocked);
}

#[test]
fn concurrent_requests_admit_exactly_the_capacity() {
    let rl = Arc::new(limiter());
    rl.create_limiter("shared", Limit::new(100, 60_000)).unwrap();
    let t = rl.now_ms();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let rl = Arc::clone(&rl);
        handles.push(thread::spawn(move || {
            (0..50)
                .filter(|_| rl.try_request_at("shared", None, t))
                .count()
        }));
    }

    let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(admitted, 100);

    let stats = rl.get_stats();
    assert_eq!(stats.total, 400);
    assert_eq!(stats.allowed, 100);
    assert_eq!(stats.blocked, 300);
}

#[test]
fn recreating_a_key_under_load_stays_consistent() {
    let rl = Arc::new(limiter());
    rl.create_limiter("hot", Limit::new(1_000_000, 60_000)).unwrap();
    let t = rl.now_ms();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let rl = Arc::clone(&rl);
        handles.push(thread::spawn(move || {
            for _ in 0..2_000 {
                rl.try_request_at("hot", None, t);
            }
        }));
    }
    for i in 0..20 {
        rl.create_limiter("hot", Limit::new(1_000_000 + i, 60_000))
            .unwrap();
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // The key survived every replacement with the newest policy.
    assert_eq!(rl.get_current_limit("hot"), 1_000_019);
    assert_eq!(rl.len(), 1);
    let stats = rl.get_stats();
    assert_eq!(stats.total, 8_000);
}
