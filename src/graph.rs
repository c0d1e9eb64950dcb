//! Entity graph assembly and hierarchical community detection
//!
//! The graph is always rebuilt in memory from the relationship table; only
//! the flat tables are persisted. Clustering is deterministic: node order is
//! fixed by sorting, the only randomness is a seeded shuffle, and ties always
//! resolve toward the smallest label, so a fixed `(input, seed)` pair yields
//! a bit-stable result.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::{Bfs, EdgeRef};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::CommunityDetectionConfig;
use crate::store::{CommunityRecord, RelationshipRecord};

/// Undirected entity graph with coalesced, weight-summed edges
pub struct EntityGraph {
    graph: UnGraph<String, f64>,
    index: BTreeMap<String, NodeIndex>,
}

impl EntityGraph {
    /// Build the graph from the relationship table
    ///
    /// Nodes are entity names, edges are relationships; parallel edges
    /// collapse into one with their weights summed. Self-loops are dropped.
    #[must_use]
    pub fn from_relationships(relationships: &[RelationshipRecord]) -> Self {
        let mut names = BTreeSet::new();
        for rel in relationships {
            names.insert(rel.source.clone());
            names.insert(rel.target.clone());
        }

        let mut graph = UnGraph::new_undirected();
        let mut index = BTreeMap::new();
        for name in names {
            let node = graph.add_node(name.clone());
            index.insert(name, node);
        }

        let mut edges: BTreeMap<(NodeIndex, NodeIndex), f64> = BTreeMap::new();
        for rel in relationships {
            if rel.source == rel.target {
                continue;
            }
            let a = index[&rel.source];
            let b = index[&rel.target];
            let key = if a < b { (a, b) } else { (b, a) };
            *edges.entry(key).or_insert(0.0) += rel.weight.max(0.0);
        }
        for ((a, b), weight) in edges {
            graph.add_edge(a, b, weight);
        }

        Self { graph, index }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Node names of the largest connected component
    ///
    /// Components of equal size tie-break toward the one containing the
    /// lexicographically smallest name, so the choice is stable.
    #[must_use]
    pub fn largest_connected_component(&self) -> Vec<String> {
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut best: Vec<String> = Vec::new();

        for &start in self.index.values() {
            if visited.contains(&start) {
                continue;
            }
            let mut component = Vec::new();
            let mut bfs = Bfs::new(&self.graph, start);
            while let Some(node) = bfs.next(&self.graph) {
                if visited.insert(node) {
                    component.push(self.graph[node].clone());
                }
            }
            component.sort();
            if component.len() > best.len() {
                best = component;
            }
        }
        best
    }

    fn weighted_neighbors(&self, name: &str) -> Vec<(String, f64)> {
        let Some(&node) = self.index.get(name) else {
            return Vec::new();
        };
        let mut neighbors: Vec<(String, f64)> = self
            .graph
            .edges(node)
            .map(|edge| {
                let other = if edge.source() == node {
                    edge.target()
                } else {
                    edge.source()
                };
                (self.graph[other].clone(), *edge.weight())
            })
            .collect();
        neighbors.sort_by(|a, b| a.0.cmp(&b.0));
        neighbors
    }
}

/// Hierarchically cluster the relationship graph into communities
///
/// Level 0 partitions the clustered node set (the LCC when `use_lcc`);
/// each further level refines the previous one by subdividing clusters
/// larger than `max_cluster_size`. Clusters within the size budget carry
/// over with fresh ids so every level remains a complete partition, and
/// every community's `parent_cluster` points at the community it refines
/// (`-1` at level 0).
#[must_use]
pub fn cluster_graph(
    relationships: &[RelationshipRecord],
    config: &CommunityDetectionConfig,
) -> Vec<CommunityRecord> {
    let graph = EntityGraph::from_relationships(relationships);
    if graph.node_count() == 0 {
        debug!("graph has no nodes for clustering");
        return Vec::new();
    }

    let nodes: Vec<String> = if config.use_lcc {
        graph.largest_connected_component()
    } else {
        graph.index.keys().cloned().collect()
    };

    // Dense ids over the clustered node set, in sorted-name order
    let ids: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();
    let adjacency: Vec<Vec<(usize, f64)>> = nodes
        .iter()
        .map(|name| {
            graph
                .weighted_neighbors(name)
                .into_iter()
                .filter_map(|(nbr, w)| ids.get(nbr.as_str()).map(|&i| (i, w)))
                .collect()
        })
        .collect();

    let mut records = Vec::new();
    let mut next_id: i64 = 0;

    // Level 0: full partition
    let all: Vec<usize> = (0..nodes.len()).collect();
    let mut current: Vec<(i64, Vec<usize>)> = Vec::new();
    for members in propagate_labels_subset(&adjacency, &all, config.seed) {
        current.push((next_id, members));
        next_id += 1;
    }
    push_level(&mut records, 0, &current, &BTreeMap::new(), &nodes);

    // Terminates: every subdivision yields strictly smaller parts, and the
    // even-split fallback caps parts at max_cluster_size outright.
    let mut level: i64 = 0;
    while current
        .iter()
        .any(|(_, members)| members.len() > config.max_cluster_size)
    {
        level += 1;
        let mut next: Vec<(i64, Vec<usize>)> = Vec::new();
        let mut parents: BTreeMap<i64, i64> = BTreeMap::new();

        for (cluster_id, members) in &current {
            if members.len() <= config.max_cluster_size {
                parents.insert(next_id, *cluster_id);
                next.push((next_id, members.clone()));
                next_id += 1;
                continue;
            }

            let sub_seed = config
                .seed
                .wrapping_add((level as u64) << 32)
                .wrapping_add(*cluster_id as u64);
            let mut parts = propagate_labels_subset(&adjacency, members, sub_seed);
            if parts.len() == 1 {
                parts = split_evenly(members, config.max_cluster_size);
            }
            for part in parts {
                parents.insert(next_id, *cluster_id);
                next.push((next_id, part));
                next_id += 1;
            }
        }

        push_level(&mut records, level, &next, &parents, &nodes);
        current = next;
    }

    info!(
        nodes = nodes.len(),
        communities = records.len(),
        levels = level + 1,
        "graph clustered"
    );
    records
}

fn push_level(
    records: &mut Vec<CommunityRecord>,
    level: i64,
    clusters: &[(i64, Vec<usize>)],
    parents: &BTreeMap<i64, i64>,
    names: &[String],
) {
    for (cluster_id, members) in clusters {
        records.push(CommunityRecord {
            level,
            cluster_id: *cluster_id,
            parent_cluster: parents.get(cluster_id).copied().unwrap_or(-1),
            nodes: members.iter().map(|&i| names[i].clone()).collect(),
        });
    }
}

/// Weighted label propagation restricted to `subset`
///
/// Each node adopts the label carrying the most neighbor weight; ties pick
/// the smallest label. Returns member lists sorted internally and ordered by
/// their smallest member.
fn propagate_labels_subset(
    adjacency: &[Vec<(usize, f64)>],
    subset: &[usize],
    seed: u64,
) -> Vec<Vec<usize>> {
    let members: HashSet<usize> = subset.iter().copied().collect();
    let mut labels: HashMap<usize, usize> = subset.iter().map(|&n| (n, n)).collect();

    let mut order = subset.to_vec();
    order.sort_unstable();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    for _ in 0..50 {
        let mut changed = false;
        for &node in &order {
            let mut tally: BTreeMap<usize, f64> = BTreeMap::new();
            for &(neighbor, weight) in &adjacency[node] {
                if members.contains(&neighbor) {
                    *tally.entry(labels[&neighbor]).or_insert(0.0) += weight;
                }
            }
            if tally.is_empty() {
                continue;
            }
            // Ascending label order makes the smallest label win ties
            let mut best_label = labels[&node];
            let mut best_weight = f64::NEG_INFINITY;
            for (&label, &weight) in &tally {
                if weight > best_weight {
                    best_weight = weight;
                    best_label = label;
                }
            }
            if best_label != labels[&node] {
                labels.insert(node, best_label);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &node in subset {
        groups.entry(labels[&node]).or_default().push(node);
    }
    let mut clusters: Vec<Vec<usize>> = groups
        .into_values()
        .map(|mut members| {
            members.sort_unstable();
            members
        })
        .collect();
    clusters.sort_by_key(|members| members[0]);
    clusters
}

/// Deterministic fallback when propagation cannot split an oversized cluster
fn split_evenly(members: &[usize], max_size: usize) -> Vec<Vec<usize>> {
    let mut sorted = members.to_vec();
    sorted.sort_unstable();
    sorted
        .chunks(max_size.max(1))
        .map(<[usize]>::to_vec)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(source: &str, target: &str) -> RelationshipRecord {
        RelationshipRecord {
            id: format!("{source}-{target}"),
            source: source.to_string(),
            target: target.to_string(),
            rel_type: "related".to_string(),
            description: String::new(),
            weight: 1.0,
        }
    }

    fn config(max_cluster_size: usize, use_lcc: bool) -> CommunityDetectionConfig {
        CommunityDetectionConfig {
            max_cluster_size,
            use_lcc,
            seed: 42,
        }
    }

    fn chain(n: usize) -> Vec<RelationshipRecord> {
        (0..n - 1)
            .map(|i| rel(&format!("n{i:03}"), &format!("n{:03}", i + 1)))
            .collect()
    }

    #[test]
    fn test_multi_edges_coalesce() {
        let rels = vec![rel("a", "b"), rel("a", "b"), rel("b", "a")];
        let graph = EntityGraph::from_relationships(&rels);
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert!((graph.weighted_neighbors("a")[0].1 - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_lcc_picks_largest_component() {
        let rels = vec![rel("a", "b"), rel("b", "c"), rel("x", "y")];
        let graph = EntityGraph::from_relationships(&rels);
        let lcc = graph.largest_connected_component();
        assert_eq!(lcc, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_levels_partition_the_node_set() {
        let records = cluster_graph(&chain(12), &config(4, true));
        assert!(!records.is_empty());

        let all_nodes: BTreeSet<String> = chain(12)
            .iter()
            .flat_map(|r| [r.source.clone(), r.target.clone()])
            .collect();

        let mut levels: BTreeMap<i64, Vec<&CommunityRecord>> = BTreeMap::new();
        for record in &records {
            levels.entry(record.level).or_default().push(record);
        }
        for (level, communities) in levels {
            let mut seen = BTreeSet::new();
            for community in communities {
                for node in &community.nodes {
                    assert!(seen.insert(node.clone()), "overlap at level {level}: {node}");
                }
            }
            assert_eq!(seen, all_nodes, "level {level} does not cover the node set");
        }
    }

    #[test]
    fn test_children_are_subsets_of_parents() {
        let records = cluster_graph(&chain(12), &config(4, true));
        let by_id: HashMap<i64, &CommunityRecord> =
            records.iter().map(|r| (r.cluster_id, r)).collect();

        for record in &records {
            if record.parent_cluster < 0 {
                continue;
            }
            let parent = by_id[&record.parent_cluster];
            let parent_nodes: BTreeSet<_> = parent.nodes.iter().collect();
            for node in &record.nodes {
                assert!(parent_nodes.contains(node));
            }
        }
    }

    #[test]
    fn test_deepest_level_respects_max_cluster_size() {
        let records = cluster_graph(&chain(20), &config(4, true));
        let deepest = records.iter().map(|r| r.level).max().unwrap();
        for record in records.iter().filter(|r| r.level == deepest) {
            assert!(record.nodes.len() <= 4);
        }
    }

    #[test]
    fn test_clustering_is_deterministic() {
        let rels = chain(15);
        let first = cluster_graph(&rels, &config(5, true));
        let second = cluster_graph(&rels, &config(5, true));
        assert_eq!(first, second);
    }

    #[test]
    fn test_lcc_restriction_excludes_satellites() {
        let mut rels = chain(6);
        rels.push(rel("zz1", "zz2"));
        let records = cluster_graph(&rels, &config(10, true));

        let clustered: BTreeSet<&String> = records.iter().flat_map(|r| r.nodes.iter()).collect();
        assert!(!clustered.iter().any(|n| n.starts_with("zz")));
    }

    #[test]
    fn test_without_lcc_everything_is_clustered() {
        let mut rels = chain(6);
        rels.push(rel("zz1", "zz2"));
        let records = cluster_graph(&rels, &config(10, false));

        let level0: BTreeSet<&String> = records
            .iter()
            .filter(|r| r.level == 0)
            .flat_map(|r| r.nodes.iter())
            .collect();
        assert!(level0.iter().any(|n| n.starts_with("zz")));
    }

    #[test]
    fn test_empty_relationships_yield_no_communities() {
        assert!(cluster_graph(&[], &config(10, true)).is_empty());
    }
}
