//! Logical name resolution
//!
//! Maps an operator-facing name ("web") to the concrete units configured
//! for it. Pure: depends only on the name and the loaded [`Config`].

use std::collections::BTreeMap;

use crate::config::{Config, TargetDef};
use crate::state::TargetState;
use crate::units::{normalize_name, UnitType};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no target named '{0}' is configured")]
    NotFound(String),

    #[error("target '{logical}' is ambiguous: {detail}")]
    AmbiguousSpec { logical: String, detail: String },
}

/// A concrete unit to supervise, plus what configuration says about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    /// Name the operator used
    pub logical: String,
    /// Full unit name as the manager knows it
    pub unit: String,
    pub unit_type: UnitType,
    /// Expected active state
    pub expect: TargetState,
    /// Restart policy hint
    pub restart: Option<String>,
}

/// Resolve a logical name to its unit specs, ordered by unit name
pub fn resolve(logical: &str, config: &Config) -> Result<Vec<UnitSpec>, ResolveError> {
    let mut resolved: Option<(BTreeMap<String, UnitSpec>, &TargetDef)> = None;

    for def in config.definitions(logical) {
        let specs = specs_for(def)?;
        match &resolved {
            None => resolved = Some((specs, def)),
            Some((first, first_def)) => {
                if *first != specs {
                    return Err(ResolveError::AmbiguousSpec {
                        logical: logical.to_string(),
                        detail: format!(
                            "{} and {} define different units ({} vs {})",
                            first_def.origin,
                            def.origin,
                            join_names(first),
                            join_names(&specs),
                        ),
                    });
                }
            }
        }
    }

    let (specs, _) = resolved.ok_or_else(|| ResolveError::NotFound(logical.to_string()))?;
    Ok(specs.into_values().collect())
}

/// Resolve several names, keeping the first occurrence of each unit
pub fn resolve_all<S: AsRef<str>>(logicals: &[S], config: &Config) -> Result<Vec<UnitSpec>, ResolveError> {
    let mut seen = BTreeMap::new();
    for logical in logicals {
        for spec in resolve(logical.as_ref(), config)? {
            seen.entry(spec.unit.clone()).or_insert(spec);
        }
    }
    Ok(seen.into_values().collect())
}

fn specs_for(def: &TargetDef) -> Result<BTreeMap<String, UnitSpec>, ResolveError> {
    let default_type = def.unit_type.unwrap_or_default();
    let mut specs = BTreeMap::new();

    for raw in &def.units {
        let unit = normalize_name(raw, default_type);
        let unit_type = UnitType::from_unit_name(&unit).unwrap_or(default_type);

        if let Some(declared) = def.unit_type {
            if declared != unit_type {
                return Err(ResolveError::AmbiguousSpec {
                    logical: def.logical.clone(),
                    detail: format!("{} is a {} but the target declares Type={}", unit, unit_type, declared),
                });
            }
        }

        specs.entry(unit.clone()).or_insert_with(|| UnitSpec {
            logical: def.logical.clone(),
            unit,
            unit_type,
            expect: def.expect,
            restart: def.restart.clone(),
        });
    }

    Ok(specs)
}

fn join_names(specs: &BTreeMap<String, UnitSpec>) -> String {
    specs.keys().cloned().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units;

    fn config(content: &str) -> Config {
        Config::parse(content, "test.conf").unwrap()
    }

    #[test]
    fn test_resolve_sorted_and_normalized() {
        let config = config("[Target web]\nUnits=php-fpm nginx.service apache2\n");
        let specs = resolve("web", &config).unwrap();
        let names: Vec<&str> = specs.iter().map(|s| s.unit.as_str()).collect();
        assert_eq!(names, vec!["apache2.service", "nginx.service", "php-fpm.service"]);
        assert!(specs.iter().all(|s| s.logical == "web"));
        assert!(specs.iter().all(|s| s.unit_type == UnitType::Service));
    }

    #[test]
    fn test_resolve_not_found() {
        let config = config("[Target web]\nUnits=nginx\n");
        assert_eq!(
            resolve("db", &config),
            Err(ResolveError::NotFound("db".into()))
        );
    }

    #[test]
    fn test_resolve_mixed_suffixes() {
        let config = config("[Target docker]\nUnits=docker.socket docker\n");
        let specs = resolve("docker", &config).unwrap();
        assert_eq!(specs[0].unit, "docker.service");
        assert_eq!(specs[1].unit, "docker.socket");
        assert_eq!(specs[1].unit_type, UnitType::Socket);
    }

    #[test]
    fn test_resolve_type_completes_bare_names() {
        let config = config("[Target trim]\nUnits=fstrim\nType=timer\n");
        let specs = resolve("trim", &config).unwrap();
        assert_eq!(specs[0].unit, "fstrim.timer");
    }

    #[test]
    fn test_type_conflict_is_ambiguous() {
        let config = config("[Target trim]\nUnits=fstrim.service\nType=timer\n");
        assert!(matches!(
            resolve("trim", &config),
            Err(ResolveError::AmbiguousSpec { .. })
        ));
    }

    #[test]
    fn test_duplicate_units_deduplicated() {
        let config = config("[Target web]\nUnits=nginx nginx.service\n");
        assert_eq!(resolve("web", &config).unwrap().len(), 1);
    }

    #[test]
    fn test_conflicting_definitions_are_ambiguous() {
        let mut config = config("[Target web]\nUnits=nginx\n");
        let drop_in = units::parse_file("[Target web]\nUnits=caddy\n").unwrap();
        config.extend_from(&drop_in, "override.conf").unwrap();

        match resolve("web", &config) {
            Err(ResolveError::AmbiguousSpec { logical, detail }) => {
                assert_eq!(logical, "web");
                assert!(detail.contains("override.conf"));
            }
            other => panic!("expected AmbiguousSpec, got {:?}", other),
        }
    }

    #[test]
    fn test_identical_definitions_accepted() {
        let mut config = config("[Target web]\nUnits=nginx\n");
        let drop_in = units::parse_file("[Target web]\nUnits=nginx.service\n").unwrap();
        config.extend_from(&drop_in, "same.conf").unwrap();
        assert_eq!(resolve("web", &config).unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_carries_properties() {
        let config = config("[Target db]\nUnits=postgresql\nExpect=inactive\nRestart=always\n");
        let spec = &resolve("db", &config).unwrap()[0];
        assert_eq!(spec.expect, TargetState::Inactive);
        assert_eq!(spec.restart.as_deref(), Some("always"));
    }

    #[test]
    fn test_resolve_all_merges() {
        let config = config("[Target a]\nUnits=x y\n[Target b]\nUnits=y z\n");
        let specs = resolve_all(&["b", "a"], &config).unwrap();
        let names: Vec<&str> = specs.iter().map(|s| s.unit.as_str()).collect();
        assert_eq!(names, vec!["x.service", "y.service", "z.service"]);
        // first occurrence wins
        assert_eq!(specs[1].logical, "b");
    }
}
