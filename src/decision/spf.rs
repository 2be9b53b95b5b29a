//! Shortest-path computation over the replicated link state.
//!
//! Everything here is pure and iterates over sorted maps only: two nodes
//! given identical inputs produce byte-identical route databases.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::net::IpAddr;

use tracing::{debug, warn};

use crate::network::IpPrefix;
use crate::types::{
    AdjacencyDatabase, AreaId, ForwardingAlgorithm, ForwardingType, Label, MplsAction, NextHop,
    NodeName, PrefixDatabase, PrefixEntry, RouteDatabase,
};

/// Metric penalty steering paths away from overloaded transit nodes while
/// keeping them reachable as origins and destinations.
const OVERLOAD_PENALTY: u64 = 1 << 28;

/// One usable directed edge: both endpoints advertise the adjacency and
/// neither marked it overloaded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Edge {
    pub from: NodeName,
    pub to: NodeName,
    pub metric: u32,
    pub local_iface: String,
    pub remote_iface: String,
    pub v4_nexthop: Option<std::net::Ipv4Addr>,
    pub v6_nexthop: Option<std::net::Ipv6Addr>,
    pub adj_label: Label,
    pub weight: u32,
}

/// Validated topology for one area.
#[derive(Debug, Default)]
pub struct Topology {
    pub edges: BTreeMap<NodeName, Vec<Edge>>,
    pub overloaded: BTreeSet<NodeName>,
    pub node_labels: BTreeMap<NodeName, Label>,
}

impl Topology {
    pub fn nodes(&self) -> impl Iterator<Item = &NodeName> {
        self.edges.keys()
    }
}

/// Build the topology from every node's AdjacencyDatabase. An edge u->v
/// requires v to advertise the mirror adjacency on the same interface
/// pair.
pub fn build_topology(adj_dbs: &BTreeMap<NodeName, AdjacencyDatabase>) -> Topology {
    let mut topology = Topology::default();
    for (node, db) in adj_dbs {
        topology.node_labels.insert(node.clone(), db.node_label);
        if db.is_overloaded {
            topology.overloaded.insert(node.clone());
        }
        let mut edges = Vec::new();
        for adj in &db.adjacencies {
            if adj.is_overloaded {
                continue;
            }
            let confirmed = adj_dbs.get(&adj.remote_node).map(|remote_db| {
                remote_db.adjacencies.iter().any(|back| {
                    back.remote_node == *node
                        && back.local_iface == adj.remote_iface
                        && !back.is_overloaded
                })
            });
            if confirmed != Some(true) {
                debug!(
                    node = %node,
                    neighbor = %adj.remote_node,
                    iface = %adj.local_iface,
                    "skipping unidirectional adjacency"
                );
                continue;
            }
            edges.push(Edge {
                from: node.clone(),
                to: adj.remote_node.clone(),
                metric: adj.metric,
                local_iface: adj.local_iface.clone(),
                remote_iface: adj.remote_iface.clone(),
                v4_nexthop: adj.v4_nexthop,
                v6_nexthop: adj.v6_nexthop,
                adj_label: adj.adj_label,
                weight: adj.weight,
            });
        }
        edges.sort();
        topology.edges.insert(node.clone(), edges);
    }
    topology
}

/// Dijkstra from `root` keeping every equal-cost predecessor.
#[derive(Debug, Default)]
pub struct SpfResult {
    pub dist: BTreeMap<NodeName, u64>,
    pub preds: BTreeMap<NodeName, BTreeSet<NodeName>>,
    /// Equal-cost first-hop edges out of the root toward each node.
    pub first_hops: BTreeMap<NodeName, BTreeSet<Edge>>,
}

pub fn run_spf(topology: &Topology, root: &str) -> SpfResult {
    run_spf_excluding(topology, root, &BTreeSet::new())
}

/// SPF with an edge set removed; the removal set is what makes the
/// second KSP2 pass edge-disjoint.
pub fn run_spf_excluding(
    topology: &Topology,
    root: &str,
    excluded: &BTreeSet<(NodeName, String)>,
) -> SpfResult {
    let mut result = SpfResult::default();
    if !topology.edges.contains_key(root) {
        return result;
    }
    result.dist.insert(root.to_string(), 0);

    let mut heap: BinaryHeap<Reverse<(u64, NodeName)>> = BinaryHeap::new();
    heap.push(Reverse((0, root.to_string())));
    let mut settled: BTreeSet<NodeName> = BTreeSet::new();

    while let Some(Reverse((dist_u, u))) = heap.pop() {
        if !settled.insert(u.clone()) {
            continue;
        }
        let penalty = if u != root && topology.overloaded.contains(&u) {
            OVERLOAD_PENALTY
        } else {
            0
        };
        let Some(edges) = topology.edges.get(&u) else {
            continue;
        };
        for edge in edges {
            if excluded.contains(&(edge.from.clone(), edge.local_iface.clone())) {
                continue;
            }
            let next = dist_u + edge.metric as u64 + penalty;
            let entry = result.dist.get(&edge.to).copied();
            match entry {
                Some(best) if next > best => {}
                Some(best) if next == best => {
                    result
                        .preds
                        .entry(edge.to.clone())
                        .or_default()
                        .insert(u.clone());
                }
                _ => {
                    result.dist.insert(edge.to.clone(), next);
                    let preds = result.preds.entry(edge.to.clone()).or_default();
                    preds.clear();
                    preds.insert(u.clone());
                    heap.push(Reverse((next, edge.to.clone())));
                }
            }
        }
    }

    // derive first hops by folding predecessor sets from the root out
    let mut order: Vec<(&u64, &NodeName)> =
        result.dist.iter().map(|(n, d)| (d, n)).collect();
    order.sort();
    for (_, node) in order {
        if node == root {
            continue;
        }
        let mut hops: BTreeSet<Edge> = BTreeSet::new();
        for pred in result.preds.get(node).cloned().unwrap_or_default() {
            if pred == root {
                // direct edges on a shortest path
                if let Some(edges) = topology.edges.get(root) {
                    for edge in edges {
                        if edge.to == *node
                            && !excluded
                                .contains(&(edge.from.clone(), edge.local_iface.clone()))
                            && edge.metric as u64 == result.dist[node]
                        {
                            hops.insert(edge.clone());
                        }
                    }
                }
            } else if let Some(pred_hops) = result.first_hops.get(&pred) {
                hops.extend(pred_hops.iter().cloned());
            }
        }
        result.first_hops.insert(node.clone(), hops);
    }
    result
}

/// One concrete shortest path as an edge sequence, picking the
/// lexicographically smallest predecessor at every step.
pub fn extract_path(
    topology: &Topology,
    spf: &SpfResult,
    root: &str,
    dest: &str,
    excluded: &BTreeSet<(NodeName, String)>,
) -> Vec<Edge> {
    let mut rev: Vec<Edge> = Vec::new();
    let mut cursor = dest.to_string();
    while cursor != root {
        let Some(preds) = spf.preds.get(&cursor) else {
            return Vec::new();
        };
        let Some(pred) = preds.iter().next().cloned() else {
            return Vec::new();
        };
        let Some(edges) = topology.edges.get(&pred) else {
            return Vec::new();
        };
        let Some(edge) = edges
            .iter()
            .find(|e| {
                e.to == cursor
                    && !excluded.contains(&(e.from.clone(), e.local_iface.clone()))
                    && spf.dist.get(&pred).copied().unwrap_or(u64::MAX)
                        + e.metric as u64
                        == spf.dist.get(&cursor).copied().unwrap_or(u64::MAX)
            })
            .cloned()
        else {
            return Vec::new();
        };
        rev.push(edge);
        cursor = pred;
    }
    rev.reverse();
    rev
}

/// Up to two edge-disjoint shortest paths toward `dest`.
pub fn ksp2_paths(topology: &Topology, root: &str, dest: &str) -> Vec<Vec<Edge>> {
    let spf = run_spf(topology, root);
    let none = BTreeSet::new();
    let first = extract_path(topology, &spf, root, dest, &none);
    if first.is_empty() {
        return Vec::new();
    }
    // remove both directions of every edge on the first path
    let mut excluded: BTreeSet<(NodeName, String)> = BTreeSet::new();
    for edge in &first {
        excluded.insert((edge.from.clone(), edge.local_iface.clone()));
        excluded.insert((edge.to.clone(), edge.remote_iface.clone()));
    }
    let second_spf = run_spf_excluding(topology, root, &excluded);
    let second = extract_path(topology, &second_spf, root, dest, &excluded);
    if second.is_empty() {
        vec![first]
    } else {
        vec![first, second]
    }
}

/// The per-area inputs Decision computes from.
#[derive(Debug, Default, Clone)]
pub struct LinkState {
    pub adj_dbs: BTreeMap<NodeName, AdjacencyDatabase>,
    pub prefix_dbs: BTreeMap<NodeName, PrefixDatabase>,
}

/// Compute the full RouteDatabase for one area.
pub fn compute_routes(area: &AreaId, my_node: &str, state: &LinkState) -> RouteDatabase {
    let mut routes = RouteDatabase::default();
    let topology = build_topology(&state.adj_dbs);
    let spf = run_spf(&topology, my_node);

    // prefix -> advertising origins
    let mut advertisers: BTreeMap<IpPrefix, BTreeMap<NodeName, PrefixEntry>> = BTreeMap::new();
    for (node, db) in &state.prefix_dbs {
        for entry in &db.entries {
            advertisers
                .entry(entry.prefix.trimmed())
                .or_default()
                .insert(node.clone(), entry.clone());
        }
    }

    for (prefix, origins) in advertisers {
        let Some((nexthops, entry)) =
            route_for_prefix(area, my_node, &topology, &spf, prefix, &origins)
        else {
            continue;
        };
        if let Some(min) = entry.min_nexthops {
            if nexthops.len() < min {
                warn!(
                    prefix = %prefix,
                    available = nexthops.len(),
                    required = min,
                    "withholding route below min_nexthops"
                );
                continue;
            }
        }
        if !nexthops.is_empty() {
            routes.unicast.insert(prefix, nexthops);
        }
    }

    build_mpls_routes(area, my_node, &topology, &spf, &state.adj_dbs, &mut routes);
    routes
}

/// Best-origin selection plus next-hop set construction for one prefix.
fn route_for_prefix(
    area: &AreaId,
    my_node: &str,
    topology: &Topology,
    spf: &SpfResult,
    prefix: IpPrefix,
    origins: &BTreeMap<NodeName, PrefixEntry>,
) -> Option<(BTreeSet<NextHop>, PrefixEntry)> {
    // deterministic preference order over reachable origins
    let mut ranked: Vec<(&NodeName, &PrefixEntry, u64)> = origins
        .iter()
        .filter_map(|(node, entry)| {
            let dist = if node == my_node {
                Some(0)
            } else {
                spf.dist.get(node).copied()
            };
            dist.map(|d| (node, entry, d))
        })
        .collect();
    if ranked.is_empty() {
        return None;
    }
    ranked.sort_by(|(an, ae, ad), (bn, be, bd)| {
        be.metrics
            .path_preference
            .cmp(&ae.metrics.path_preference)
            .then(be.metrics.source_preference.cmp(&ae.metrics.source_preference))
            .then(ad.cmp(bd))
            .then(an.cmp(bn))
    });
    let (best_node, best_entry, best_dist) = ranked[0];
    if origins.contains_key(my_node) && *best_node == *my_node {
        // locally originated; nothing to program
        return None;
    }
    let best: Vec<(&NodeName, &PrefixEntry, u64)> = ranked
        .iter()
        .filter(|(_, e, d)| {
            e.metrics.path_preference == best_entry.metrics.path_preference
                && e.metrics.source_preference == best_entry.metrics.source_preference
                && *d == best_dist
        })
        .cloned()
        .collect();

    let mut nexthops: BTreeSet<NextHop> = BTreeSet::new();
    for (origin, entry, dist) in best {
        if *origin == *my_node {
            continue;
        }
        match entry.forwarding_algorithm {
            ForwardingAlgorithm::SpEcmp => {
                for edge in spf.first_hops.get(origin).into_iter().flatten() {
                    if let Some(nexthop) =
                        edge_to_nexthop(area, edge, &prefix, dist, entry, topology, origin)
                    {
                        nexthops.insert(nexthop);
                    }
                }
            }
            ForwardingAlgorithm::Ksp2EdEcmp => {
                for path in ksp2_paths(topology, my_node, origin) {
                    let cost: u64 = path.iter().map(|e| e.metric as u64).sum();
                    let Some(first) = path.first() else { continue };
                    let labels = path_label_stack(&path, topology, origin);
                    if let Some(mut nexthop) =
                        edge_to_nexthop(area, first, &prefix, cost, entry, topology, origin)
                    {
                        nexthop.mpls_action = Some(MplsAction::Push { labels });
                        nexthops.insert(nexthop);
                    }
                }
            }
        }
    }
    Some((nexthops, best_entry.clone()))
}

fn edge_to_nexthop(
    area: &AreaId,
    edge: &Edge,
    prefix: &IpPrefix,
    total_metric: u64,
    entry: &PrefixEntry,
    topology: &Topology,
    origin: &NodeName,
) -> Option<NextHop> {
    let address: IpAddr = if prefix.is_v4() {
        IpAddr::V4(edge.v4_nexthop?)
    } else {
        IpAddr::V6(edge.v6_nexthop?)
    };
    let mpls_action = match (entry.forwarding_type, entry.forwarding_algorithm) {
        (ForwardingType::SrMpls, ForwardingAlgorithm::SpEcmp) => {
            let label = topology.node_labels.get(origin).copied().unwrap_or(0);
            (label != 0).then(|| MplsAction::Push {
                labels: vec![label],
            })
        }
        // KSP2 stacks are attached by the caller per path
        _ => None,
    };
    Some(NextHop {
        address,
        iface: edge.local_iface.clone(),
        weight: edge.weight,
        metric: total_metric.min(u32::MAX as u64) as u32,
        area: area.clone(),
        mpls_action,
        neighbor_node: Some(edge.to.clone()),
    })
}

/// Label stack steering a packet along an explicit path: adjacency labels
/// hop by hop past the first edge when available, the egress node label
/// otherwise.
fn path_label_stack(path: &[Edge], topology: &Topology, origin: &NodeName) -> Vec<Label> {
    let tail = &path[1..];
    if !tail.is_empty() && tail.iter().all(|e| e.adj_label != 0) {
        return tail.iter().map(|e| e.adj_label).collect();
    }
    topology
        .node_labels
        .get(origin)
        .copied()
        .filter(|l| *l != 0)
        .map(|l| vec![l])
        .unwrap_or_default()
}

/// Node-segment swap routes for remote nodes plus pop routes for local
/// adjacency labels.
fn build_mpls_routes(
    area: &AreaId,
    my_node: &str,
    topology: &Topology,
    spf: &SpfResult,
    adj_dbs: &BTreeMap<NodeName, AdjacencyDatabase>,
    routes: &mut RouteDatabase,
) {
    for (node, label) in &topology.node_labels {
        if *label == 0 || node == my_node {
            continue;
        }
        let Some(hops) = spf.first_hops.get(node) else {
            continue;
        };
        let mut nexthops: BTreeSet<NextHop> = BTreeSet::new();
        for edge in hops {
            let Some(v6) = edge.v6_nexthop else { continue };
            let action = if edge.to == *node {
                MplsAction::Php
            } else {
                MplsAction::Swap { label: *label }
            };
            nexthops.insert(NextHop {
                address: IpAddr::V6(v6),
                iface: edge.local_iface.clone(),
                weight: edge.weight,
                metric: spf.dist.get(node).copied().unwrap_or(0).min(u32::MAX as u64) as u32,
                area: area.clone(),
                mpls_action: Some(action),
                neighbor_node: Some(edge.to.clone()),
            });
        }
        if !nexthops.is_empty() {
            routes.mpls.insert(*label, nexthops);
        }
    }

    if let Some(my_db) = adj_dbs.get(my_node) {
        for adj in &my_db.adjacencies {
            if adj.adj_label == 0 {
                continue;
            }
            let Some(v6) = adj.v6_nexthop else { continue };
            let mut nexthops = BTreeSet::new();
            nexthops.insert(NextHop {
                address: IpAddr::V6(v6),
                iface: adj.local_iface.clone(),
                weight: adj.weight,
                metric: adj.metric,
                area: area.clone(),
                mpls_action: Some(MplsAction::Php),
                neighbor_node: Some(adj.remote_node.clone()),
            });
            routes.mpls.insert(adj.adj_label, nexthops);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Adjacency, PrefixType};

    fn adjacency(
        remote: &str,
        local_iface: &str,
        remote_iface: &str,
        nexthop: &str,
        metric: u32,
    ) -> Adjacency {
        Adjacency {
            remote_node: remote.to_string(),
            local_iface: local_iface.to_string(),
            remote_iface: remote_iface.to_string(),
            v4_nexthop: None,
            v6_nexthop: Some(nexthop.parse().unwrap()),
            metric,
            adj_label: 0,
            weight: 0,
            timestamp_ms: 0,
            is_overloaded: false,
        }
    }

    fn adj_db(node: &str, label: Label, adjacencies: Vec<Adjacency>) -> AdjacencyDatabase {
        AdjacencyDatabase {
            node: node.to_string(),
            area: "0".to_string(),
            node_label: label,
            is_overloaded: false,
            version: 1,
            adjacencies,
        }
    }

    /// Ring 1-2-4-3-1 (nodes 1..4), all metrics 1.
    fn ring_state() -> LinkState {
        let mut state = LinkState::default();
        let links = [
            ("1", "1/2", "2", "2/1"),
            ("2", "2/4", "4", "4/2"),
            ("4", "4/3", "3", "3/4"),
            ("3", "3/1", "1", "1/3"),
        ];
        let mut adjs: BTreeMap<String, Vec<Adjacency>> = BTreeMap::new();
        for (a, a_if, b, b_if) in links {
            adjs.entry(a.to_string()).or_default().push(adjacency(
                b,
                a_if,
                b_if,
                &format!("fe80::{}", b),
                1,
            ));
            adjs.entry(b.to_string()).or_default().push(adjacency(
                a,
                b_if,
                a_if,
                &format!("fe80::{}", a),
                1,
            ));
        }
        for (node, adjacencies) in adjs {
            let label = 100 + node.parse::<u32>().unwrap();
            state
                .adj_dbs
                .insert(node.clone(), adj_db(&node, label, adjacencies));
        }
        // every node advertises a loopback prefix fd00::<n>/128
        for n in ["1", "2", "3", "4"] {
            let prefix: IpPrefix = format!("fd00::{}/128", n).parse().unwrap();
            state.prefix_dbs.insert(
                n.to_string(),
                PrefixDatabase {
                    node: n.to_string(),
                    area: "0".to_string(),
                    version: 1,
                    entries: vec![PrefixEntry::new(prefix, PrefixType::Loopback)],
                },
            );
        }
        state
    }

    #[test]
    fn test_ring_multipath() {
        let state = ring_state();
        let routes = compute_routes(&"0".to_string(), "1", &state);

        // direct neighbor 2: one next hop over 1/2, metric 1
        let to_2 = &routes.unicast[&"fd00::2/128".parse().unwrap()];
        assert_eq!(to_2.len(), 1);
        let hop = to_2.iter().next().unwrap();
        assert_eq!(hop.iface, "1/2");
        assert_eq!(hop.metric, 1);

        // node 4 is two hops away via both 1/2 and 1/3
        let to_4 = &routes.unicast[&"fd00::4/128".parse().unwrap()];
        assert_eq!(to_4.len(), 2);
        let ifaces: BTreeSet<&str> = to_4.iter().map(|h| h.iface.as_str()).collect();
        assert_eq!(ifaces, BTreeSet::from(["1/2", "1/3"]));
        assert!(to_4.iter().all(|h| h.metric == 2));

        // own loopback is not programmed
        assert!(!routes
            .unicast
            .contains_key(&"fd00::1/128".parse().unwrap()));
    }

    #[test]
    fn test_spf_determinism() {
        let state = ring_state();
        let a = compute_routes(&"0".to_string(), "1", &state);
        let b = compute_routes(&"0".to_string(), "1", &state.clone());
        assert_eq!(
            bincode::serialize(&a).unwrap(),
            bincode::serialize(&b).unwrap()
        );
    }

    #[test]
    fn test_unidirectional_adjacency_excluded() {
        let mut state = ring_state();
        // node 2 stops confirming the 1-2 link
        let db2 = state.adj_dbs.get_mut("2").unwrap();
        db2.adjacencies.retain(|a| a.remote_node != "1");

        let routes = compute_routes(&"0".to_string(), "1", &state);
        let to_2 = &routes.unicast[&"fd00::2/128".parse().unwrap()];
        // still reachable, but only the long way around
        let hop = to_2.iter().next().unwrap();
        assert_eq!(hop.iface, "1/3");
        assert_eq!(hop.metric, 3);
    }

    #[test]
    fn test_overloaded_node_avoided_as_transit() {
        let mut state = ring_state();
        state.adj_dbs.get_mut("2").unwrap().is_overloaded = true;

        let routes = compute_routes(&"0".to_string(), "1", &state);
        // node 4 now only via 3 (through-2 pays the overload penalty)
        let to_4 = &routes.unicast[&"fd00::4/128".parse().unwrap()];
        assert_eq!(to_4.len(), 1);
        assert_eq!(to_4.iter().next().unwrap().iface, "1/3");

        // overloaded node itself stays reachable directly
        let to_2 = &routes.unicast[&"fd00::2/128".parse().unwrap()];
        assert_eq!(to_2.iter().next().unwrap().iface, "1/2");
    }

    #[test]
    fn test_min_nexthops_withholds_route() {
        let mut state = ring_state();
        for db in state.prefix_dbs.values_mut() {
            for entry in &mut db.entries {
                entry.min_nexthops = Some(2);
            }
        }
        let routes = compute_routes(&"0".to_string(), "1", &state);
        // neighbors have a single path: withheld
        assert!(!routes
            .unicast
            .contains_key(&"fd00::2/128".parse().unwrap()));
        // node 4 has two: programmed
        assert!(routes
            .unicast
            .contains_key(&"fd00::4/128".parse().unwrap()));
    }

    #[test]
    fn test_best_origin_selection_prefers_path_preference_then_distance() {
        let mut state = ring_state();
        let anycast: IpPrefix = "fd00:aa::/64".parse().unwrap();
        // nodes 2 (1 hop) and 4 (2 hops) advertise the same prefix
        for n in ["2", "4"] {
            let db = state.prefix_dbs.get_mut(n).unwrap();
            db.entries.push(PrefixEntry::new(anycast, PrefixType::Config));
        }
        let routes = compute_routes(&"0".to_string(), "1", &state);
        let hops = &routes.unicast[&anycast];
        // closest origin (node 2) wins on distance
        assert!(hops.iter().all(|h| h.metric == 1));

        // bump node 4's path preference; it must win despite the distance
        let db4 = state.prefix_dbs.get_mut("4").unwrap();
        db4.entries.last_mut().unwrap().metrics.path_preference = 2000;
        let routes = compute_routes(&"0".to_string(), "1", &state);
        let hops = &routes.unicast[&anycast];
        assert!(hops.iter().all(|h| h.metric == 2));
        assert_eq!(hops.len(), 2);
    }

    #[test]
    fn test_ksp2_two_edge_disjoint_paths() {
        let state = ring_state();
        let topology = build_topology(&state.adj_dbs);
        let paths = ksp2_paths(&topology, "1", "4");
        assert_eq!(paths.len(), 2);
        // both end at node 4 and share no edge
        for path in &paths {
            assert_eq!(path.last().unwrap().to, "4");
        }
        let first_edges: BTreeSet<(String, String)> = paths[0]
            .iter()
            .map(|e| (e.from.clone(), e.local_iface.clone()))
            .collect();
        assert!(paths[1]
            .iter()
            .all(|e| !first_edges.contains(&(e.from.clone(), e.local_iface.clone()))));
    }

    #[test]
    fn test_ksp2_single_path_fallback() {
        // line topology 1-2-4: only one edge-disjoint path to 4
        let mut state = ring_state();
        state.adj_dbs.get_mut("1").unwrap().adjacencies.retain(|a| a.remote_node != "3");
        state.adj_dbs.get_mut("3").unwrap().adjacencies.retain(|a| a.remote_node != "1");

        let topology = build_topology(&state.adj_dbs);
        let paths = ksp2_paths(&topology, "1", "4");
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].len(), 2);
    }

    #[test]
    fn test_mpls_swap_and_php_routes() {
        let state = ring_state();
        let routes = compute_routes(&"0".to_string(), "1", &state);

        // direct neighbor 2 (label 102): php
        let to_2 = &routes.mpls[&102];
        assert!(matches!(
            to_2.iter().next().unwrap().mpls_action,
            Some(MplsAction::Php)
        ));
        // two-hop node 4 (label 104): swap on both paths
        let to_4 = &routes.mpls[&104];
        assert_eq!(to_4.len(), 2);
        assert!(to_4
            .iter()
            .all(|h| matches!(h.mpls_action, Some(MplsAction::Swap { label: 104 }))));
    }
}
