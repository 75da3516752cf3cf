//! Destination network selection.
//!
//! A context's mappings are tagged as production or test. Resolution never
//! crosses tags: a live failover only sees production mappings and a test
//! failover only sees test mappings. When nothing matches, the configured
//! default network is used and a warning is logged.

use serde::Serialize;
use tracing::warn;

use crate::model::{ContextId, NetworkMapping};

/// Outcome of resolving one source network.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkResolution {
    /// Source network name, empty when the VM reported none.
    pub source_network: String,
    /// Selected destination network.
    pub destination_network_id: String,
    /// `true` when the default network was used.
    pub used_default: bool,
}

/// Resolves the destination network for `source_network`.
///
/// Preference order: a mapping with the same name and tag, then any mapping
/// with the same tag, then `default_network_id`.
#[must_use]
pub fn resolve_network(
    mappings: &[NetworkMapping],
    source_network: &str,
    test_network: bool,
    default_network_id: &str,
) -> NetworkResolution {
    let tagged = || {
        mappings
            .iter()
            .filter(move |mapping| mapping.is_test_network == test_network)
    };
    let selected = tagged()
        .find(|mapping| mapping.source_network_name == source_network)
        .or_else(|| tagged().next());

    match selected {
        Some(mapping) => NetworkResolution {
            source_network: source_network.to_owned(),
            destination_network_id: mapping.destination_network_id.clone(),
            used_default: false,
        },
        None => {
            warn!(
                source_network,
                test_network,
                default_network_id,
                "no tagged network mapping found; using default network"
            );
            NetworkResolution {
                source_network: source_network.to_owned(),
                destination_network_id: default_network_id.to_owned(),
                used_default: true,
            }
        }
    }
}

/// Resolves every source network of a VM, in NIC order.
///
/// A VM that reports no networks still gets one NIC on the default path.
#[must_use]
pub fn resolve_all(
    mappings: &[NetworkMapping],
    source_networks: &[String],
    test_network: bool,
    default_network_id: &str,
) -> Vec<NetworkResolution> {
    if source_networks.is_empty() {
        return vec![resolve_network(
            mappings,
            "",
            test_network,
            default_network_id,
        )];
    }
    source_networks
        .iter()
        .map(|name| resolve_network(mappings, name, test_network, default_network_id))
        .collect()
}

/// Completeness report for a context's mappings.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NetworkValidationResult {
    /// Audited context.
    pub context_id: ContextId,
    /// Number of mappings.
    pub total_mappings: usize,
    /// At least one production mapping exists.
    pub has_production: bool,
    /// At least one test mapping exists.
    pub has_test: bool,
    /// Every source network has both mappings.
    pub is_complete: bool,
    /// Missing mapping descriptions.
    pub missing_mappings: Vec<String>,
    /// Operator recommendations.
    pub recommendations: Vec<String>,
}

/// Audits `mappings` against the VM's source networks.
#[must_use]
pub fn audit(
    context_id: &ContextId,
    source_networks: &[String],
    mappings: &[NetworkMapping],
) -> NetworkValidationResult {
    let has_production = mappings.iter().any(|mapping| !mapping.is_test_network);
    let has_test = mappings.iter().any(|mapping| mapping.is_test_network);

    let mut missing_mappings = Vec::new();
    for network in source_networks {
        let mapped = |test: bool| {
            mappings.iter().any(|mapping| {
                &mapping.source_network_name == network && mapping.is_test_network == test
            })
        };
        if !mapped(false) {
            missing_mappings.push(format!("Production mapping for {network}"));
        }
        if !mapped(true) {
            missing_mappings.push(format!("Test mapping for {network}"));
        }
    }

    let mut recommendations = Vec::new();
    if mappings.is_empty() {
        recommendations.push(String::from(
            "Configure network mappings for this VM to enable proper failover operations",
        ));
    }
    if !has_production {
        recommendations.push(String::from(
            "Add production network mappings to enable live failover",
        ));
    }
    if !has_test {
        recommendations.push(String::from(
            "Add test network mappings to enable test failover",
        ));
    }
    if !missing_mappings.is_empty() {
        recommendations.push(String::from(
            "Complete dual network mappings for all source networks",
        ));
    }

    NetworkValidationResult {
        context_id: context_id.clone(),
        total_mappings: mappings.len(),
        has_production,
        has_test,
        is_complete: has_production && has_test && missing_mappings.is_empty(),
        missing_mappings,
        recommendations,
    }
}

/// Mapping counts per tag.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MappingSummary {
    /// All mappings.
    pub total: usize,
    /// Production-tagged mappings.
    pub production_count: usize,
    /// Test-tagged mappings.
    pub test_count: usize,
}

/// Counts mappings per tag.
#[must_use]
pub fn summarize(mappings: &[NetworkMapping]) -> MappingSummary {
    let test_count = mappings
        .iter()
        .filter(|mapping| mapping.is_test_network)
        .count();
    MappingSummary {
        total: mappings.len(),
        production_count: mappings.len() - test_count,
        test_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    fn mapping(source: &str, destination: &str, test: bool) -> NetworkMapping {
        NetworkMapping {
            context_id: ContextId::from("ctx"),
            source_network_name: source.to_owned(),
            destination_network_id: destination.to_owned(),
            is_test_network: test,
        }
    }

    #[fixture]
    fn dual() -> Vec<NetworkMapping> {
        vec![
            mapping("VM Network", "prod-a", false),
            mapping("VM Network", "test-a", true),
            mapping("Backup", "prod-b", false),
            mapping("Backup", "test-b", true),
        ]
    }

    #[rstest]
    #[case("VM Network", false, "prod-a")]
    #[case("VM Network", true, "test-a")]
    #[case("Backup", false, "prod-b")]
    #[case("Backup", true, "test-b")]
    fn exact_name_and_tag_wins(
        dual: Vec<NetworkMapping>,
        #[case] source: &str,
        #[case] test: bool,
        #[case] expected: &str,
    ) {
        let resolution = resolve_network(&dual, source, test, "default");
        assert_eq!(resolution.destination_network_id, expected);
        assert!(!resolution.used_default);
    }

    #[rstest]
    fn falls_back_to_any_mapping_with_the_same_tag() {
        let mappings = vec![
            mapping("Other", "prod-x", false),
            mapping("Other", "test-x", true),
        ];
        let resolution = resolve_network(&mappings, "Unmapped", true, "default");
        assert_eq!(resolution.destination_network_id, "test-x");
    }

    #[rstest]
    fn never_crosses_tags() {
        let production_only = vec![mapping("VM Network", "prod-a", false)];
        let resolution = resolve_network(&production_only, "VM Network", true, "sandbox");
        assert_eq!(resolution.destination_network_id, "sandbox");
        assert!(resolution.used_default);
    }

    #[rstest]
    fn disjoint_sets_resolve_within_their_own_tag() {
        let networks: Vec<String> = (0..6).map(|n| format!("net-{n}")).collect();
        let mappings: Vec<NetworkMapping> = networks
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let test = index % 2 == 1;
                let destination = if test {
                    format!("test-{name}")
                } else {
                    format!("prod-{name}")
                };
                mapping(name, &destination, test)
            })
            .collect();

        for test in [false, true] {
            for resolution in resolve_all(&mappings, &networks, test, "default") {
                let prefix = if test { "test-" } else { "prod-" };
                assert!(
                    resolution.destination_network_id.starts_with(prefix),
                    "{resolution:?} crossed tags"
                );
            }
        }
    }

    #[rstest]
    fn vm_without_networks_gets_the_default() {
        let resolved = resolve_all(&[], &[], false, "default");
        assert_eq!(resolved.len(), 1);
        assert!(resolved.iter().all(|r| r.used_default));
    }

    #[rstest]
    fn audit_reports_missing_dual_mappings() {
        let mappings = vec![mapping("VM Network", "prod-a", false)];
        let networks = vec![String::from("VM Network"), String::from("Backup")];
        let result = audit(&ContextId::from("ctx"), &networks, &mappings);

        assert!(result.has_production);
        assert!(!result.has_test);
        assert!(!result.is_complete);
        assert_eq!(
            result.missing_mappings,
            vec![
                String::from("Test mapping for VM Network"),
                String::from("Production mapping for Backup"),
                String::from("Test mapping for Backup"),
            ]
        );
        assert!(
            result
                .recommendations
                .contains(&String::from("Add test network mappings to enable test failover"))
        );
    }

    #[rstest]
    fn audit_of_complete_mappings_is_clean(dual: Vec<NetworkMapping>) {
        let networks = vec![String::from("VM Network"), String::from("Backup")];
        let result = audit(&ContextId::from("ctx"), &networks, &dual);
        assert!(result.is_complete);
        assert!(result.recommendations.is_empty());
    }

    #[rstest]
    fn summary_counts_tags(dual: Vec<NetworkMapping>) {
        let summary = summarize(&dual);
        assert_eq!(
            summary,
            MappingSummary {
                total: 4,
                production_count: 2,
                test_count: 2,
            }
        );
    }
}
