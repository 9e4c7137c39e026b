//! up / down / restart / reload / enable / disable

use std::time::Duration;

use sysward::client::BusKind;
use sysward::{ActionHint, Config, TargetState};

/// Submit the request and wait. With `settle` false, only wait until every
/// unit has been dispatched; anything not yet converged then exits 2.
pub async fn converge(
    config: Config,
    bus: BusKind,
    names: &[String],
    target: TargetState,
    hint: ActionHint,
    timeout: Duration,
    settle: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let supervisor = super::supervisor(config, bus).await?;
    let handle = supervisor.request_all(names, target, hint)?;

    let report = if settle {
        handle.wait(timeout).await
    } else {
        let report = handle.wait_dispatched(timeout).await;
        println!("Submitted {} unit(s)", handle.units().count());
        report
    };

    super::print_report(&report);
    if report.exit_code() == 2 && settle {
        log::warn!("Timed out with units still settling");
    }
    Ok(report.exit_code())
}
