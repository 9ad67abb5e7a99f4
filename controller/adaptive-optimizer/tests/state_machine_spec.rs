use adaptive_optimizer::aggregator::{LatencyPercentiles, WindowSummary};
use adaptive_optimizer::health::{HealthMonitor, HealthThresholds};
use adaptive_optimizer::model::{ConnectionParameters, IntegrationPoint, IntegrationStatus};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

fn monitor() -> HealthMonitor {
    HealthMonitor::new(HealthThresholds {
        min_throughput: 100.0,
        max_latency: Duration::from_secs(2),
        degraded_windows_before_failure: 3,
    })
}

fn random_summary(rng: &mut StdRng, k: i64) -> WindowSummary {
    let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::minutes(k);
    let sample_count = if rng.gen_bool(0.1) { 0 } else { rng.gen_range(1..20_000) };
    let p95 = Duration::from_millis(rng.gen_range(10..4_000));
    WindowSummary {
        point_id: "orders".into(),
        window_start: start,
        window_end: start + ChronoDuration::minutes(1),
        throughput: sample_count as f64 / 60.0,
        latency: (sample_count > 0).then_some(LatencyPercentiles {
            p50: p95 / 2,
            p95,
            p99: p95,
        }),
        error_rate: if rng.gen_bool(0.2) { rng.gen_range(0.0..0.5) } else { 0.0 },
        sample_count,
    }
}

#[test]
fn given_random_window_sequences_when_evaluated_then_only_legal_edges_are_taken() {
    let monitor = monitor();

    for seed in 0..50 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut point = IntegrationPoint::new(
            "orders",
            "ingest",
            "warehouse",
            ConnectionParameters::default(),
            Utc::now(),
        );

        for k in 0..200 {
            let summary = random_summary(&mut rng, k);
            let before = point.status();
            let transition = monitor.evaluate(&mut point, &summary, Utc::now()).unwrap();

            if let Some(t) = &transition {
                assert!(t.from.can_transition_to(t.to), "{} -> {}", t.from, t.to);
                assert_eq!(t.from, before);
            }
            assert!(
                !(before == IntegrationStatus::Pending && point.status() == IntegrationStatus::Failed),
                "PENDING must never fail directly"
            );

            // occasionally act on optimizable points, or recover failed ones
            if point.status().is_optimizable() && rng.gen_bool(0.3) {
                let t = monitor.begin_optimizing(&mut point, Utc::now()).unwrap();
                assert!(t.from.can_transition_to(t.to));
            } else if point.status() == IntegrationStatus::Failed && rng.gen_bool(0.2) {
                let t = monitor.recover(&mut point, Utc::now()).unwrap();
                assert_eq!(t.to, IntegrationStatus::Pending);
            }
        }
    }
}

#[test]
fn given_optimizing_point_when_window_is_evaluated_then_it_always_settles() {
    let monitor = monitor();
    let mut rng = StdRng::seed_from_u64(99);

    for k in 0..100 {
        let mut point = IntegrationPoint::new(
            "orders",
            "ingest",
            "warehouse",
            ConnectionParameters::default(),
            Utc::now(),
        );
        let healthy = WindowSummary {
            throughput: 200.0,
            latency: Some(LatencyPercentiles {
                p50: Duration::from_millis(50),
                p95: Duration::from_millis(100),
                p99: Duration::from_millis(150),
            }),
            error_rate: 0.0,
            sample_count: 12_000,
            ..random_summary(&mut rng, k)
        };
        monitor.evaluate(&mut point, &healthy, Utc::now()).unwrap();
        monitor.begin_optimizing(&mut point, Utc::now()).unwrap();

        let summary = random_summary(&mut rng, k);
        let transition = monitor.evaluate(&mut point, &summary, Utc::now()).unwrap();

        assert_eq!(transition.unwrap().from, IntegrationStatus::Optimizing);
        assert_ne!(point.status(), IntegrationStatus::Optimizing);
        assert!(point.resume_status().is_none());
    }
}

#[test]
fn given_maintenance_when_exited_then_point_returns_to_entry_status() {
    let monitor = monitor();
    let mut point = IntegrationPoint::new(
        "orders",
        "ingest",
        "warehouse",
        ConnectionParameters::default(),
        Utc::now(),
    );
    let degraded = WindowSummary {
        point_id: "orders".into(),
        window_start: Utc::now(),
        window_end: Utc::now(),
        throughput: 10.0,
        latency: None,
        error_rate: 0.0,
        sample_count: 0,
    };

    monitor.enter_maintenance(&mut point, Utc::now()).unwrap();
    // health evaluation leaves MAINTENANCE alone
    assert!(monitor
        .evaluate(&mut point, &degraded, Utc::now())
        .unwrap()
        .is_none());

    let t = monitor.exit_maintenance(&mut point, Utc::now()).unwrap();
    assert_eq!(t.to, IntegrationStatus::Pending);
}
