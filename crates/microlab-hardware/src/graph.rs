//! Dependency graph over configured devices.
//!
//! Kahn's algorithm with ties broken by declaration order, so the same
//! configuration always brings devices up in the same order.

use crate::config::DeviceConfig;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("device '{device}' depends on unknown device '{dependency}'")]
    UnknownDependency { device: String, dependency: String },

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Topological order of device ids: every device comes after all of its
/// dependencies.
pub fn topological_order(devices: &[DeviceConfig]) -> Result<Vec<String>, GraphError> {
    let index: HashMap<&str, usize> = devices
        .iter()
        .enumerate()
        .map(|(i, d)| (d.id.as_str(), i))
        .collect();

    // dependents[i] = devices that depend on device i
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); devices.len()];
    let mut in_degree = vec![0usize; devices.len()];

    for (i, device) in devices.iter().enumerate() {
        for dependency in &device.dependencies {
            let &j = index
                .get(dependency.as_str())
                .ok_or_else(|| GraphError::UnknownDependency {
                    device: device.id.clone(),
                    dependency: dependency.clone(),
                })?;
            dependents[j].push(i);
            in_degree[i] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..devices.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(devices.len());

    while let Some(i) = ready.pop_first() {
        order.push(devices[i].id.clone());
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() == devices.len() {
        return Ok(order);
    }

    Err(GraphError::Cycle(find_cycle(devices, &index, &in_degree)))
}

/// Walk dependency edges among the unresolved devices until one repeats.
fn find_cycle(
    devices: &[DeviceConfig],
    index: &HashMap<&str, usize>,
    in_degree: &[usize],
) -> Vec<String> {
    let Some(start) = (0..devices.len()).find(|&i| in_degree[i] > 0) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut position: HashMap<usize, usize> = HashMap::new();
    let mut current = start;

    loop {
        if let Some(&at) = position.get(&current) {
            let mut cycle: Vec<String> = path[at..].iter().map(|&i| devices[i].id.clone()).collect();
            cycle.push(devices[current].id.clone());
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);

        // Every unresolved device has at least one unresolved dependency.
        let next = devices[current]
            .dependencies
            .iter()
            .filter_map(|d| index.get(d.as_str()).copied())
            .find(|&j| in_degree[j] > 0);
        match next {
            Some(j) => current = j,
            None => {
                return path.iter().map(|&i| devices[i].id.clone()).collect();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microlab_core::DeviceType;

    fn device(id: &str, deps: &[&str]) -> DeviceConfig {
        let mut d = DeviceConfig::new(id, DeviceType::Thermometer, "simulated");
        d.dependencies = deps.iter().map(|s| s.to_string()).collect();
        d
    }

    fn assert_consistent(devices: &[DeviceConfig], order: &[String]) {
        assert_eq!(order.len(), devices.len());
        let pos: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        for d in devices {
            for dep in &d.dependencies {
                assert!(pos[dep.as_str()] < pos[d.id.as_str()], "{dep} after {}", d.id);
            }
        }
    }

    #[test]
    fn dependencies_come_first() {
        let devices = vec![
            device("ctrl", &["thermo"]),
            device("stirrer", &[]),
            device("thermo", &[]),
        ];
        let order = topological_order(&devices).unwrap();
        assert_eq!(order, vec!["stirrer", "thermo", "ctrl"]);
        assert_consistent(&devices, &order);
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let devices = vec![device("b", &[]), device("a", &[]), device("c", &["a", "b"])];
        assert_eq!(topological_order(&devices).unwrap(), vec!["b", "a", "c"]);
    }

    #[test]
    fn diamond() {
        let devices = vec![
            device("d", &["b", "c"]),
            device("b", &["a"]),
            device("c", &["a"]),
            device("a", &[]),
        ];
        let order = topological_order(&devices).unwrap();
        assert_consistent(&devices, &order);
        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));
    }

    #[test]
    fn two_cycle_is_rejected_with_ids() {
        let devices = vec![device("a", &["b"]), device("b", &["a"])];
        match topological_order(&devices) {
            Err(GraphError::Cycle(ids)) => {
                assert!(ids.contains(&"a".to_string()));
                assert!(ids.contains(&"b".to_string()));
                assert_eq!(ids.first(), ids.last());
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn cycles_of_any_length_and_position_are_rejected() {
        for len in 2..8 {
            for offset in 0..3 {
                let mut devices: Vec<DeviceConfig> =
                    (0..offset).map(|i| device(&format!("free{i}"), &[])).collect();
                for i in 0..len {
                    let next = format!("n{}", (i + 1) % len);
                    devices.push(device(&format!("n{i}"), &[next.as_str()]));
                }
                devices.push(device("tail", &["n0"]));
                assert!(
                    matches!(topological_order(&devices), Err(GraphError::Cycle(_))),
                    "cycle of length {len} not detected"
                );
            }
        }
    }

    #[test]
    fn unknown_dependency() {
        let devices = vec![device("ctrl", &["ghost"])];
        assert_eq!(
            topological_order(&devices),
            Err(GraphError::UnknownDependency {
                device: "ctrl".into(),
                dependency: "ghost".into()
            })
        );
    }
}
