mod converge;
mod list;
mod status;
mod watch;

pub use converge::converge;
pub use list::list;
pub use status::status;
pub use watch::watch;

use sysward::client::{BusKind, SystemdClient};
use sysward::{ActiveState, AggregateReport, Config, ServiceManager, SessionStatus, Supervisor, UnitReport};

async fn supervisor(config: Config, bus: BusKind) -> Result<Supervisor<SystemdClient>, Box<dyn std::error::Error>> {
    let client = SystemdClient::connect(bus, config.settings.reconnect_backoff).await?;
    Ok(Supervisor::new(config, client))
}

/// The names given on the command line, or every configured target
fn target_names<M: ServiceManager>(supervisor: &Supervisor<M>, names: &[String]) -> Vec<String> {
    if names.is_empty() {
        supervisor.targets().into_iter().map(String::from).collect()
    } else {
        names.to_vec()
    }
}

fn active_symbol(active: ActiveState) -> &'static str {
    match active {
        ActiveState::Active => "●",
        ActiveState::Inactive => "○",
        ActiveState::Failed => "×",
        _ => "◐",
    }
}

fn print_unit(report: &UnitReport) {
    let symbol = report.observed.as_ref().map(|o| active_symbol(o.active)).unwrap_or("?");
    let state = report
        .observed
        .as_ref()
        .map(|o| format!("{} ({})", o.active, o.sub))
        .unwrap_or_else(|| "unknown".to_string());

    println!(
        "{} {:<32} {:<24} {}",
        symbol, report.unit, state, report.status
    );
    if report.retries > 0 {
        println!("    Retries: {}", report.retries);
    }
    if let Some(err) = &report.last_error {
        if !matches!(report.status, SessionStatus::Converged) {
            println!("      Error: {}", err);
        }
    }
}

fn print_report(report: &AggregateReport) {
    for unit in report.units.values() {
        print_unit(unit);
    }
}
