//! List configured targets

use sysward::resolver::resolve;
use sysward::Config;

pub fn list(config: &Config) {
    let names = config.logical_names();
    if names.is_empty() {
        println!("No targets configured");
        return;
    }

    for name in names {
        match resolve(name, config) {
            Ok(specs) => {
                let expect = specs.first().map(|s| s.expect.as_str()).unwrap_or("-");
                let units: Vec<&str> = specs.iter().map(|s| s.unit.as_str()).collect();
                println!("{:<20} {:<9} {}", name, expect, units.join(" "));
            }
            Err(e) => println!("{:<20} error     {}", name, e),
        }
    }
}
