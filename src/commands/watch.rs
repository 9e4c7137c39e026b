//! Drive targets to their configured state and print changes as they happen

use sysward::client::{BusKind, SystemdClient};
use sysward::{Config, SubscribeError, Supervisor};

pub async fn watch(config: Config, bus: BusKind, names: &[String]) -> Result<i32, Box<dyn std::error::Error>> {
    // Sessions retry while the manager is unreachable, so don't insist on a connection up front
    let client = SystemdClient::lazy(bus, config.settings.reconnect_backoff);
    let job_timeout = config.settings.job_timeout;
    let supervisor = Supervisor::new(config, client);
    if !supervisor.manager().inner().is_connected() {
        log::info!("Waiting for the service manager");
    }

    let names = super::target_names(&supervisor, names);
    let mut events = supervisor.subscribe();
    let handle = supervisor.request_expected(&names)?;

    loop {
        if handle.is_done(&handle.report()) {
            break;
        }

        tokio::select! {
            event = events.recv() => match event {
                Ok(Some(event)) => {
                    if let Some(report) = handle.report().get(&event.unit) {
                        super::print_unit(report);
                    }
                }
                Ok(None) => break,
                Err(SubscribeError::SlowConsumer { missed }) => {
                    log::warn!("Missed {} update(s), showing current state", missed);
                    events = supervisor.subscribe();
                    super::print_report(&handle.report());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, cancelling and waiting for outstanding jobs");
                for name in &names {
                    supervisor.cancel(name)?;
                }
                handle.wait(job_timeout).await;
                break;
            }
        }
    }

    let report = handle.report();
    println!();
    super::print_report(&report);
    Ok(report.exit_code())
}
