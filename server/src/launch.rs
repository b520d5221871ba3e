//! Profile launch planning
//!
//! Turns a profile (driver labels, remote driver specs, rule scripts) into
//! the ordered driver list handed to [`IndiServer::start`](crate::IndiServer::start).

use crate::driver::{DriverDescriptor, DriverRegistry, LifecycleRule};

/// Decode a profile's rule-script JSON; invalid JSON yields no rules
pub fn parse_rules(json: &str) -> Vec<LifecycleRule> {
    if json.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<LifecycleRule>>(json) {
        Ok(rules) => rules,
        Err(e) => {
            tracing::warn!("Failed to parse profile scripts: {}", e);
            Vec::new()
        }
    }
}

/// Resolve a profile into the drivers to start, in start order.
///
/// Rules are attached to the registry first. Unknown labels are logged and
/// skipped. Each remote spec may list several comma-separated drivers.
/// Drivers carrying a rule start first, then remote drivers, then the rest;
/// the order is otherwise preserved.
pub fn plan_profile_launch(
    registry: &mut DriverRegistry,
    labels: &[String],
    remote_specs: &[String],
    rules: &[LifecycleRule],
) -> Vec<DriverDescriptor> {
    registry.apply_rules(rules);

    let mut drivers = Vec::new();
    for label in labels {
        match registry.by_label(label) {
            Some(driver) => {
                tracing::info!("Adding local driver: {}", label);
                drivers.push(driver.clone());
            }
            None => tracing::warn!(
                "Driver {} is not found on the system. Install the driver.",
                label
            ),
        }
    }

    let remotes = remote_specs
        .iter()
        .flat_map(|spec| spec.split(','))
        .map(str::trim)
        .filter(|spec| !spec.is_empty());
    for spec in remotes {
        let mut driver = DriverDescriptor::remote(spec);
        driver.rule = rules
            .iter()
            .find(|rule| rule.driver.as_deref() == Some(spec))
            .cloned();
        tracing::info!("Adding remote driver: {}", spec);
        drivers.push(driver);
    }

    drivers.sort_by_key(|d| (d.rule.is_none(), !d.is_remote()));
    drivers
}
