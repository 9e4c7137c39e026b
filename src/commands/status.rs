//! Show the current state of configured units

use sysward::client::BusKind;
use sysward::{ActionHint, ActiveState, Config, DesiredState};

pub async fn status(config: Config, bus: BusKind, names: &[String]) -> Result<i32, Box<dyn std::error::Error>> {
    let supervisor = super::supervisor(config, bus).await?;
    let names = super::target_names(&supervisor, names);
    let results = supervisor.observe(&names).await?;

    let mut code = 0;
    for (spec, result) in results {
        let observed = match result {
            Ok(observed) => observed,
            Err(e) => {
                println!("? {:<32} {}", spec.unit, e);
                code = 1;
                continue;
            }
        };

        let expected = DesiredState::new(spec.expect, ActionHint::None).satisfied_by(&observed);
        let note = if expected {
            String::new()
        } else {
            format!("  (expected {})", spec.expect)
        };
        println!(
            "{} {:<32} {} ({}){}",
            super::active_symbol(observed.active),
            spec.unit,
            observed.active,
            observed.sub,
            note
        );

        if observed.active == ActiveState::Failed {
            code = 1;
        } else if !expected && code == 0 {
            code = 2;
        }
    }
    Ok(code)
}
