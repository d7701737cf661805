//! Cluster accounting.
//!
//! Kubernetes nodes are reported as agents with a slot inventory. Slots are
//! filled first by the pods of tracked jobs, then by the resource requests of
//! pods the resource manager does not own, and the remainder are free.
//!
//! Nodes are mapped to resource pools by taints and tolerations: a node
//! belongs to a pool if the pool tolerates every taint of the node and the
//! node satisfies the pool's node selectors and affinities.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::NodeSelector;
use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use k8s_openapi::api::core::v1::NodeSelectorTerm;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use serde::Serialize;
use tracing::warn;

use crate::config::ResourcePoolsConfig;
use crate::config::SlotType;
use crate::job::PodNodeInfo;
use crate::labels::NO_SCHEDULE_NODE_LABEL_VALUE;
use crate::labels::RESOURCE_TYPE_NVIDIA;
use crate::labels::cluster_id_node_label;

/// The state reported for containers the resource manager does not track.
const RUNNING: &str = "RUNNING";

/// The container occupying a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotContainer {
    /// The container identifier.
    pub id: String,
    /// The state of the container.
    pub state: String,
    /// A description of the container, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A slot of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSummary {
    /// The slot identifier.
    pub id: String,
    /// The kind of device.
    pub device: SlotType,
    /// Whether the slot accepts new work.
    pub enabled: bool,
    /// Whether the slot is draining.
    pub draining: bool,
    /// The container occupying the slot.
    pub container: Option<SlotContainer>,
}

/// An agent: a Kubernetes node or a resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    /// The agent identifier.
    pub id: String,
    /// When the agent was registered.
    pub registered_time: Option<DateTime<Utc>>,
    /// The slots of the agent, keyed by slot identifier.
    pub slots: BTreeMap<String, SlotSummary>,
    /// The number of containers on the agent.
    pub num_containers: usize,
    /// The resource pools the agent belongs to.
    pub resource_pools: Vec<String>,
    /// The addresses of the agent.
    pub addresses: Vec<String>,
    /// Whether the agent accepts new work.
    pub enabled: bool,
    /// Whether the agent is draining.
    pub draining: bool,
}

/// Formats the identifier of a node slot.
pub fn slot_id(index: usize) -> String {
    format!("{index:03}")
}

/// Parses a Kubernetes quantity into thousandths of a unit.
///
/// Decimal (`n` to `E`) and binary (`Ki` to `Ei`) suffixes are supported, as
/// are decimal exponents such as `1e3`. Fractions of a thousandth round up.
///
/// Returns `None` for malformed quantities.
pub fn quantity_millis(quantity: &Quantity) -> Option<i64> {
    let value = quantity.0.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier = match suffix {
        "" => 1e3,
        "n" => 1e-6,
        "u" => 1e-3,
        "m" => 1.0,
        "k" => 1e6,
        "M" => 1e9,
        "G" => 1e12,
        "T" => 1e15,
        "P" => 1e18,
        "E" => 1e21,
        "Ki" => 1e3 * 2f64.powi(10),
        "Mi" => 1e3 * 2f64.powi(20),
        "Gi" => 1e3 * 2f64.powi(30),
        "Ti" => 1e3 * 2f64.powi(40),
        "Pi" => 1e3 * 2f64.powi(50),
        "Ei" => 1e3 * 2f64.powi(60),
        _ => {
            let exponent: i32 = suffix
                .strip_prefix(['e', 'E'])
                .filter(|e| !e.is_empty())?
                .parse()
                .ok()?;
            1e3 * 10f64.powi(exponent)
        }
    };

    let millis = (number * multiplier).ceil();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }

    Some(millis as i64)
}

/// Determines if a toleration tolerates a taint.
pub fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    let effect = toleration.effect.as_deref().unwrap_or_default();
    if !effect.is_empty() && effect != taint.effect {
        return false;
    }

    let key = toleration.key.as_deref().unwrap_or_default();
    if !key.is_empty() && key != taint.key {
        return false;
    }

    match toleration.operator.as_deref().unwrap_or_default() {
        "" | "Equal" => {
            toleration.value.as_deref().unwrap_or_default()
                == taint.value.as_deref().unwrap_or_default()
        }
        "Exists" => true,
        _ => false,
    }
}

/// Determines if every taint is tolerated by at least one toleration.
pub fn all_taints_tolerated(taints: &[Taint], tolerations: &[Toleration]) -> bool {
    taints
        .iter()
        .all(|taint| tolerations.iter().any(|t| tolerates(t, taint)))
}

/// Determines if a node satisfies a node selector requirement.
fn requirement_matches(
    requirement: &NodeSelectorRequirement,
    value: Option<&str>,
) -> bool {
    let values = requirement.values.as_deref().unwrap_or_default();
    match requirement.operator.as_str() {
        "In" => value.is_some_and(|v| values.iter().any(|x| x == v)),
        "NotIn" => value.is_none_or(|v| values.iter().all(|x| x != v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        op @ ("Gt" | "Lt") => {
            let (Some(value), [bound]) = (value.and_then(|v| v.parse::<i64>().ok()), values)
            else {
                return false;
            };

            let Ok(bound) = bound.parse::<i64>() else {
                return false;
            };

            if op == "Gt" { value > bound } else { value < bound }
        }
        _ => false,
    }
}

/// Determines if a node matches a node selector term.
///
/// A term without requirements matches no node.
fn term_matches(term: &NodeSelectorTerm, node: &Node) -> bool {
    let expressions = term.match_expressions.as_deref().unwrap_or_default();
    let fields = term.match_fields.as_deref().unwrap_or_default();
    if expressions.is_empty() && fields.is_empty() {
        return false;
    }

    let labels = node.labels();
    let name = node.name_any();

    expressions
        .iter()
        .all(|r| requirement_matches(r, labels.get(&r.key).map(String::as_str)))
        && fields.iter().all(|r| {
            let value = (r.key == "metadata.name").then_some(name.as_str());
            requirement_matches(r, value)
        })
}

/// Determines if pods with the given node selector can be scheduled on a
/// node.
///
/// A missing or empty selector matches every node; otherwise any one term
/// must match.
pub fn node_selector_matches(selector: Option<&NodeSelector>, node: &Node) -> bool {
    match selector {
        None => true,
        Some(selector) if selector.node_selector_terms.is_empty() => true,
        Some(selector) => selector
            .node_selector_terms
            .iter()
            .any(|t| term_matches(t, node)),
    }
}

/// Extracts the node selectors and required node affinities of a pod.
///
/// Each `nodeSelector` entry becomes an `In` requirement whose values are the
/// comma-separated parts of the entry's value.
pub fn extract_node_selectors(pod: &Pod) -> (Option<NodeSelector>, Option<NodeSelector>) {
    let Some(spec) = &pod.spec else {
        return (None, None);
    };

    let affinities = spec
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|a| a.required_during_scheduling_ignored_during_execution.clone());

    let selectors = spec.node_selector.as_ref().map(|selector| NodeSelector {
        node_selector_terms: vec![NodeSelectorTerm {
            match_expressions: Some(
                selector
                    .iter()
                    .map(|(key, value)| NodeSelectorRequirement {
                        key: key.clone(),
                        operator: "In".to_string(),
                        values: Some(value.split(',').map(str::to_string).collect()),
                    })
                    .collect(),
            ),
            match_fields: None,
        }],
    });

    (selectors, affinities)
}

/// Gets the number and kind of slots of an agent.
///
/// CUDA slots take precedence over CPU slots.
pub fn slot_info(summary: Option<&AgentSummary>) -> (usize, SlotType) {
    let (mut cuda, mut cpu) = (0, 0);
    for slot in summary.into_iter().flat_map(|s| s.slots.values()) {
        match slot.device {
            SlotType::Cuda => cuda += 1,
            SlotType::Cpu => cpu += 1,
        }
    }

    if cuda > 0 {
        (cuda, SlotType::Cuda)
    } else {
        (cpu, SlotType::Cpu)
    }
}

/// Counts the slots of a summary, preferring CUDA slots.
pub fn num_slots(slots: &BTreeMap<String, SlotSummary>) -> usize {
    let cuda = slots
        .values()
        .filter(|s| s.device == SlotType::Cuda)
        .count();
    if cuda > 0 {
        return cuda;
    }

    slots.values().filter(|s| s.device == SlotType::Cpu).count()
}

/// Gets the tolerations of a pod spec.
fn pod_tolerations(pod: &Pod) -> Vec<Toleration> {
    pod.spec
        .as_ref()
        .and_then(|s| s.tolerations.clone())
        .unwrap_or_default()
}

/// Maps nodes to the resource pools they belong to.
///
/// Returns the nodes of each pool and the pools of each node.
pub fn pool_mapping(
    nodes: &BTreeMap<String, Node>,
    summaries: &BTreeMap<String, AgentSummary>,
    config: &ResourcePoolsConfig,
) -> (BTreeMap<String, Vec<String>>, BTreeMap<String, Vec<String>>) {
    // Nvidia taints GPU nodes itself, so pools without customizations tolerate
    // that taint
    let default_tolerations = vec![Toleration {
        key: Some(RESOURCE_TYPE_NVIDIA.to_string()),
        value: Some("present".to_string()),
        operator: Some("Equal".to_string()),
        ..Default::default()
    }];

    let (base_cpu, base_gpu) = config
        .task_container_defaults
        .as_ref()
        .map(|d| d.tolerations())
        .unwrap_or_default();

    let pools = config.pools();
    let mut pools_to_nodes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut nodes_to_pools: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (name, node) in nodes {
        let (_, slot_type) = slot_info(summaries.get(name));

        for (pool, defaults) in &pools {
            let mut tolerations = Vec::new();
            let mut selectors = None;
            let mut affinities = None;

            let customized =
                defaults.is_some_and(|d| d.cpu_pod_spec.is_some() || d.gpu_pod_spec.is_some());

            if config.resource_pools.len() <= 1 && !customized {
                tolerations.extend(default_tolerations.iter().cloned());
                match slot_type {
                    SlotType::Cuda => tolerations.extend(base_gpu.iter().cloned()),
                    SlotType::Cpu => tolerations.extend(base_cpu.iter().cloned()),
                }
            } else if let Some(defaults) = defaults {
                let pod = match (slot_type, &defaults.gpu_pod_spec, &defaults.cpu_pod_spec) {
                    (SlotType::Cuda, Some(gpu), _) => Some((gpu, &base_gpu)),
                    (_, _, Some(cpu)) => Some((cpu, &base_cpu)),
                    _ => None,
                };

                if let Some((pod, base)) = pod {
                    tolerations.extend(pod_tolerations(pod));
                    tolerations.extend(base.iter().cloned());
                    (selectors, affinities) = extract_node_selectors(pod);
                }
            }

            // Nodes being scaled down by the autoscaler still count
            tolerations.push(Toleration {
                key: Some("DeletionCandidateOfClusterAutoscaler".to_string()),
                operator: Some("Exists".to_string()),
                effect: Some("PreferNoSchedule".to_string()),
                ..Default::default()
            });

            let taints = node
                .spec
                .as_ref()
                .and_then(|s| s.taints.as_deref())
                .unwrap_or_default();

            if all_taints_tolerated(taints, &tolerations)
                && node_selector_matches(selectors.as_ref(), node)
                && node_selector_matches(affinities.as_ref(), node)
            {
                pools_to_nodes
                    .entry(pool.clone())
                    .or_default()
                    .push(name.clone());
                nodes_to_pools
                    .entry(name.clone())
                    .or_default()
                    .push(pool.clone());
            }
        }
    }

    (pools_to_nodes, nodes_to_pools)
}

/// The cluster state a node summary is computed from.
#[derive(Debug)]
pub struct ClusterView<'a> {
    /// The current nodes, keyed by name.
    pub nodes: &'a BTreeMap<String, Node>,
    /// The pods of tracked jobs.
    pub pods: Vec<PodNodeInfo>,
    /// Bound pods the resource manager does not own.
    pub foreign_pods: &'a [Pod],
    /// The kind of slots of the cluster.
    pub slot_type: SlotType,
    /// The number of CPUs per CPU slot.
    pub cpu_per_slot: f32,
    /// The identifier of the cluster.
    pub cluster_id: &'a str,
    /// The CPU millicores reserved by system pods on each node.
    pub system_reservations: &'a HashMap<String, i64>,
}

impl ClusterView<'_> {
    /// Computes the slots requested by a foreign pod.
    fn foreign_pod_slots(&self, pod: &Pod) -> i64 {
        let containers = pod.spec.iter().flat_map(|s| s.containers.iter());
        containers
            .map(|c| {
                let requests = c.resources.as_ref().and_then(|r| r.requests.as_ref());
                match self.slot_type {
                    SlotType::Cpu => requests
                        .and_then(|r| r.get("cpu"))
                        .and_then(quantity_millis)
                        .map(|m| (m as f32 / (1000.0 * self.cpu_per_slot)) as i64)
                        .unwrap_or_default(),
                    SlotType::Cuda => requests
                        .and_then(|r| r.get(RESOURCE_TYPE_NVIDIA))
                        .and_then(quantity_millis)
                        .map(|m| m / 1000)
                        .unwrap_or_default(),
                }
            })
            .sum()
    }

    /// Computes the number of slots of a node.
    fn node_slots(&self, node: &Node) -> i64 {
        let allocatable = node.status.as_ref().and_then(|s| s.allocatable.as_ref());
        match self.slot_type {
            SlotType::Cpu => {
                let millis = allocatable
                    .and_then(|a| a.get("cpu"))
                    .and_then(quantity_millis)
                    .unwrap_or_default()
                    - self
                        .system_reservations
                        .get(&node.name_any())
                        .copied()
                        .unwrap_or_default();
                (millis as f32 / (1000.0 * self.cpu_per_slot)) as i64
            }
            SlotType::Cuda => {
                allocatable
                    .and_then(|a| a.get(RESOURCE_TYPE_NVIDIA))
                    .and_then(quantity_millis)
                    .unwrap_or_default()
                    / 1000
            }
        }
    }

    /// Summarizes every node with at least one slot.
    pub fn summarize_by_nodes(&self) -> BTreeMap<String, AgentSummary> {
        let mut pods_by_node: HashMap<&str, Vec<&PodNodeInfo>> = HashMap::new();
        for pod in &self.pods {
            // Pods without a node are not yet bound
            if !pod.node_name.is_empty() {
                pods_by_node.entry(&pod.node_name).or_default().push(pod);
            }
        }

        let mut foreign_by_node: HashMap<String, Vec<(String, i64)>> = HashMap::new();
        for pod in self.foreign_pods {
            let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
                continue;
            };

            if !self.nodes.contains_key(node) {
                continue;
            }

            let slots = self.foreign_pod_slots(pod);
            if slots > 0 {
                foreign_by_node
                    .entry(node.to_string())
                    .or_default()
                    .push((pod.name_any(), slots));
            }
        }

        let label = cluster_id_node_label(self.cluster_id);
        let mut summaries = BTreeMap::new();
        for (name, node) in self.nodes {
            let disabled = node.labels().get(&label);
            let enabled = disabled.is_none();
            let draining = disabled.is_some_and(|v| v == NO_SCHEDULE_NODE_LABEL_VALUE);

            let num_slots = self.node_slots(node);
            if num_slots < 1 {
                continue;
            }

            let num_slots = num_slots as usize;
            let slot = |index: usize, container: Option<SlotContainer>| SlotSummary {
                id: slot_id(index),
                device: self.slot_type,
                enabled,
                draining,
                container,
            };

            let tracked = pods_by_node.get(name.as_str()).map(Vec::as_slice).unwrap_or_default();
            let foreign = foreign_by_node.get(name).map(Vec::as_slice).unwrap_or_default();

            let occupants = tracked
                .iter()
                .flat_map(|p| {
                    std::iter::repeat_n(
                        SlotContainer {
                            id: p.container_id.clone(),
                            state: p.state.to_string(),
                            description: None,
                        },
                        p.num_slots,
                    )
                })
                .chain(foreign.iter().flat_map(|(pod, slots)| {
                    std::iter::repeat_n(
                        SlotContainer {
                            id: pod.clone(),
                            state: RUNNING.to_string(),
                            description: Some("unknown".to_string()),
                        },
                        *slots as usize,
                    )
                }));

            let mut slots = BTreeMap::new();
            for (index, container) in occupants.enumerate() {
                if index >= num_slots {
                    warn!("too many pods mapping to node `{name}`");
                    break;
                }

                slots.insert(slot_id(index), slot(index, Some(container)));
            }

            for index in slots.len()..num_slots {
                slots.insert(slot_id(index), slot(index, None));
            }

            let addresses = node
                .status
                .as_ref()
                .and_then(|s| s.addresses.as_ref())
                .map(|a| a.iter().map(|a| a.address.clone()).collect())
                .unwrap_or_default();

            summaries.insert(
                name.clone(),
                AgentSummary {
                    id: name.clone(),
                    registered_time: node.metadata.creation_timestamp.as_ref().map(|t| t.0),
                    slots,
                    num_containers: tracked.len() + foreign.len(),
                    resource_pools: Vec::new(),
                    addresses,
                    enabled,
                    draining,
                },
            );
        }

        summaries
    }
}

/// Summarizes each resource pool as a single agent.
///
/// Each pool's slots are enumerated across its nodes; as many slots as the
/// pool has pods are marked as occupied.
pub fn summarize_pools(
    summaries: &BTreeMap<String, AgentSummary>,
    pools_to_nodes: &BTreeMap<String, Vec<String>>,
    pods_per_pool: &HashMap<String, usize>,
    registered_time: DateTime<Utc>,
) -> BTreeMap<String, AgentSummary> {
    let mut pools = BTreeMap::new();
    for (pool, nodes) in pools_to_nodes {
        let num_containers = pods_per_pool.get(pool).copied().unwrap_or_default();
        let mut slots = BTreeMap::new();

        for node in nodes {
            let (count, slot_type) = slot_info(summaries.get(node));
            for index in 0..count {
                let id = format!("{pool}/{node}/{slot_type}/{index}");
                let container = (slots.len() < num_containers).then(|| SlotContainer {
                    id: id.clone(),
                    state: RUNNING.to_string(),
                    description: None,
                });

                slots.insert(
                    id.clone(),
                    SlotSummary {
                        id,
                        device: slot_type,
                        enabled: true,
                        draining: false,
                        container,
                    },
                );
            }
        }

        pools.insert(
            pool.clone(),
            AgentSummary {
                id: pool.clone(),
                registered_time: Some(registered_time),
                slots,
                num_containers,
                resource_pools: vec![pool.clone()],
                addresses: Vec::new(),
                enabled: true,
                draining: false,
            },
        );
    }

    pools
}
