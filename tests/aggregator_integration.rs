//! Integration tests for status reporting and subscriptions

use std::time::Duration;

use futures_lite::StreamExt;
use sysward::client::FakeManager;
use sysward::{ActionHint, ActiveState, Config, Outcome, SessionStatus, SubscribeError, Supervisor, TargetState};
use tokio_test::assert_ok;

const UNITS: usize = 10;

fn fleet(buffer: usize) -> Supervisor<FakeManager> {
    let units: Vec<String> = (0..UNITS).map(|i| format!("worker{}", i)).collect();
    let content = format!(
        "[Supervisor]\nSubscriberBuffer={}\n\n[Target fleet]\nUnits={}\n\n[Target db]\nUnits=postgres\n",
        buffer,
        units.join(" ")
    );
    let config = assert_ok!(Config::parse(&content, "fleet.conf"));
    let sup = Supervisor::new(config, FakeManager::new());
    for unit in &units {
        sup.manager().inner().add_unit(&format!("{}.service", unit), ActiveState::Active);
    }
    sup
}

#[tokio::test(start_paused = true)]
async fn test_report_starts_empty() {
    let sup = fleet(16);
    let report = sup.report();
    assert!(report.is_empty());
    assert_eq!(report.outcome(), Outcome::Converged);
}

#[tokio::test(start_paused = true)]
async fn test_slow_consumer_is_detached_without_affecting_others() {
    let sup = fleet(4);
    sup.manager().inner().add_unit("postgres.service", ActiveState::Inactive);

    let mut slow = sup.subscribe();
    let mut fast = sup.subscribe().into_stream().boxed();

    // Each round is Pending, InFlight, Converged: within the buffer for a
    // reader that keeps up, far beyond it for one that never reads
    for round in 0..6 {
        let target = if round % 2 == 0 {
            TargetState::Active
        } else {
            TargetState::Inactive
        };
        let handle = assert_ok!(sup.request_desired_state("db", target, ActionHint::None));
        assert!(handle.wait(Duration::from_secs(30)).await.all_converged());

        let mut statuses = Vec::new();
        loop {
            let event = assert_ok!(fast.next().await.expect("feed ended early"));
            statuses.push(event.status);
            if event.status.is_terminal() {
                break;
            }
        }
        assert_eq!(
            statuses,
            vec![SessionStatus::Pending, SessionStatus::InFlight, SessionStatus::Converged]
        );
    }

    match slow.recv().await {
        Err(SubscribeError::SlowConsumer { missed }) => assert_eq!(missed, 18 - 4),
        other => panic!("expected slow consumer error, got {:?}", other),
    }
    assert!(slow.is_detached());
    assert_eq!(slow.recv().await, Ok(None));

    // The table itself is unaffected
    assert_eq!(sup.report().len(), 1);
    assert_eq!(
        sup.manager().inner().actions("postgres.service").len(),
        6
    );
}

#[tokio::test(start_paused = true)]
async fn test_subscriber_follows_one_unit() {
    let sup = fleet(64);
    sup.manager().inner().add_unit("postgres.service", ActiveState::Inactive);
    sup.manager().inner().set_job_delay(Duration::from_secs(2));

    let mut events = sup.subscribe();
    let handle = assert_ok!(sup.request_desired_state("db", TargetState::Active, ActionHint::None));

    let mut statuses = Vec::new();
    while let Some(event) = assert_ok!(events.recv().await) {
        assert_eq!(event.unit, "postgres.service");
        statuses.push(event.status);
        if event.status.is_terminal() {
            break;
        }
    }

    assert_eq!(
        statuses,
        vec![SessionStatus::Pending, SessionStatus::InFlight, SessionStatus::Converged]
    );
    let report = handle.report();
    let unit = report.get("postgres.service").unwrap();
    assert_eq!(unit.observed.as_ref().unwrap().active, ActiveState::Active);
    assert_eq!(unit.logical, "db");
}

#[tokio::test(start_paused = true)]
async fn test_report_mixes_outcomes() {
    let sup = fleet(64);
    sup.manager().inner().set_sticky("worker0.service", true);
    sup.manager().inner().set_state("worker0.service", ActiveState::Failed);

    let handle = assert_ok!(sup.request_desired_state("fleet", TargetState::Active, ActionHint::None));
    let report = handle.wait(Duration::from_secs(300)).await;

    assert!(report.any_failed());
    assert!(!report.all_converged());
    assert_eq!(report.outcome(), Outcome::Failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        report.units.values().filter(|u| u.status == SessionStatus::Converged).count(),
        UNITS - 1
    );

    let observed_times: Vec<_> = report
        .units
        .values()
        .filter_map(|u| u.observed.as_ref().map(|o| o.since))
        .collect();
    assert_eq!(observed_times.len(), UNITS);
    assert!(report.taken_at >= *observed_times.iter().min().unwrap());
}
