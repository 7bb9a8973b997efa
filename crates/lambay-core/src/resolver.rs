//! Transitive dependency resolution.
//!
//! The resolver expands a root requirement set breadth-first in concurrent
//! waves: every wave resolves its batch of `(name, spec)` requirements
//! through the registry in parallel, then queues the children those
//! resolutions declare. A visited set keyed by `(name, spec)` makes each
//! requirement resolve at most once, and nodes are deduplicated by
//! `(name, resolved)` so two requirements landing on the same version share
//! one node.
//!
//! Per-requirement failures are recorded and never abort sibling work; the
//! orchestrator decides how severe a partially resolved graph is.

use crate::error::EngineError;
use crate::registry::RegistryClient;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// A resolved package node in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepNode {
    /// Package name as requested.
    pub name: String,
    /// The raw specifier that first produced this node.
    pub spec: String,
    /// Exact resolved version.
    pub resolved: String,
    /// Tarball URL for the resolved version.
    pub tarball_url: String,
    /// Declared child requirements (dependencies merged with
    /// optionalDependencies).
    pub raw_child_deps: BTreeMap<String, String>,
    /// Graph keys of resolved children.
    pub children: BTreeSet<String>,
}

impl DepNode {
    /// Graph key of this node.
    #[must_use]
    pub fn key(&self) -> String {
        node_key(&self.name, &self.resolved)
    }
}

/// Graph key for a `(name, resolved)` pair.
#[must_use]
pub fn node_key(name: &str, resolved: &str) -> String {
    format!("{name}@{resolved}")
}

/// The resolved dependency graph: `(name, resolved)` key to node.
///
/// Backed by a sorted map so iteration order (and therefore the cycle
/// appendix of [`topo_order`]) is deterministic.
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    pub nodes: BTreeMap<String, DepNode>,
}

impl DepGraph {
    /// Number of resolved nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node by graph key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&DepNode> {
        self.nodes.get(key)
    }
}

/// A requirement that could not be resolved.
#[derive(Debug)]
pub struct ResolveFailure {
    pub name: String,
    pub spec: String,
    pub error: EngineError,
}

/// Result of building a graph: the nodes that resolved plus the
/// requirements that did not.
#[derive(Debug)]
pub struct ResolveOutcome {
    pub graph: DepGraph,
    pub failures: Vec<ResolveFailure>,
}

/// Concurrent dependency resolver.
#[derive(Debug, Clone)]
pub struct Resolver {
    registry: RegistryClient,
    concurrency: usize,
}

impl Resolver {
    /// Create a resolver over a registry client with the given worker bound.
    #[must_use]
    pub fn new(registry: RegistryClient, concurrency: usize) -> Self {
        Self {
            registry,
            concurrency: concurrency.max(1),
        }
    }

    /// Build the transitive dependency graph for a root requirement set.
    ///
    /// Cycles are tolerated: a requirement already seen is simply not
    /// re-expanded, so `A → B → A` terminates with both nodes present.
    pub async fn build_graph(&self, roots: &BTreeMap<String, String>) -> ResolveOutcome {
        // (name, spec) requirements already submitted.
        let mut visited: HashSet<String> = HashSet::new();
        // (name, spec) requirement -> graph key it resolved to.
        let mut memo: HashMap<String, String> = HashMap::new();
        let mut nodes: BTreeMap<String, DepNode> = BTreeMap::new();
        let mut failures: Vec<ResolveFailure> = Vec::new();

        let mut pending: Vec<(String, String)> = roots
            .iter()
            .map(|(n, s)| (n.clone(), s.clone()))
            .collect();

        while !pending.is_empty() {
            let batch: Vec<(String, String)> = pending
                .drain(..)
                .filter(|(name, spec)| visited.insert(format!("{name}@{spec}")))
                .collect();
            if batch.is_empty() {
                break;
            }

            debug!(requirements = batch.len(), "resolving wave");
            let results: Vec<(String, String, Result<crate::registry::VersionEntry, EngineError>)> =
                stream::iter(batch)
                    .map(|(name, spec)| {
                        let registry = self.registry.clone();
                        async move {
                            let entry = registry.get_version_entry(&name, &spec).await;
                            (name, spec, entry)
                        }
                    })
                    .buffer_unordered(self.concurrency)
                    .collect()
                    .await;

            for (name, spec, result) in results {
                match result {
                    Ok(entry) => {
                        let key = node_key(&name, &entry.version);
                        memo.insert(format!("{name}@{spec}"), key.clone());

                        let raw_child_deps = entry.child_specs();
                        for (child_name, child_spec) in &raw_child_deps {
                            pending.push((child_name.clone(), child_spec.clone()));
                        }

                        nodes.entry(key).or_insert_with(|| DepNode {
                            name,
                            spec,
                            resolved: entry.version,
                            tarball_url: entry.dist.tarball,
                            raw_child_deps,
                            children: BTreeSet::new(),
                        });
                    }
                    Err(error) => {
                        warn!(package = %name, spec = %spec, %error, "resolve failed");
                        failures.push(ResolveFailure { name, spec, error });
                    }
                }
            }
        }

        // Attach child edges now that every requirement has a memo entry.
        let mut edges: Vec<(String, String)> = Vec::new();
        for (key, node) in &nodes {
            for (child_name, child_spec) in &node.raw_child_deps {
                if let Some(child_key) = memo.get(&format!("{child_name}@{child_spec}")) {
                    if child_key != key {
                        edges.push((key.clone(), child_key.clone()));
                    }
                }
            }
        }
        for (parent, child) in edges {
            if let Some(node) = nodes.get_mut(&parent) {
                node.children.insert(child);
            }
        }

        ResolveOutcome {
            graph: DepGraph { nodes },
            failures,
        }
    }
}

/// Normalize a raw manifest specifier.
///
/// - empty, `*`, `latest` become `latest`
/// - a leading `^`, `~`, `>=`, `<=`, `>`, `<` is stripped
/// - a whitespace-separated compound keeps its first token
/// - trailing `.x` / `.*` suffixes are stripped
///
/// The function is idempotent: `normalize(normalize(s)) == normalize(s)`.
#[must_use]
pub fn normalize_version(spec: &str) -> String {
    let mut s = spec.trim();

    for op in [">=", "<=", "^", "~", ">", "<"] {
        if let Some(rest) = s.strip_prefix(op) {
            s = rest.trim_start();
            break;
        }
    }

    s = s.split_whitespace().next().unwrap_or("");

    loop {
        if let Some(rest) = s.strip_suffix(".x").or_else(|| s.strip_suffix(".*")) {
            s = rest;
        } else {
            break;
        }
    }

    if s.is_empty() || s == "*" || s == "latest" {
        return "latest".to_string();
    }

    s.to_string()
}

/// Produce a deterministic dependency-first install order.
///
/// Kahn's algorithm over the child edges: nodes with no parents are emitted
/// first, children follow as their parents drain. When a cycle leaves nodes
/// unemitted, they are appended in sorted key order instead of failing, so
/// the output always contains every node exactly once.
#[must_use]
pub fn topo_order(graph: &DepGraph) -> Vec<&DepNode> {
    let mut indegree: BTreeMap<&str, usize> =
        graph.nodes.keys().map(|k| (k.as_str(), 0)).collect();
    for node in graph.nodes.values() {
        for child in &node.children {
            if let Some(degree) = indegree.get_mut(child.as_str()) {
                *degree += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&key, _)| key)
        .collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let mut order: Vec<&str> = Vec::with_capacity(graph.nodes.len());

    while let Some(key) = queue.pop_front() {
        if !seen.insert(key) {
            continue;
        }
        order.push(key);
        if let Some(node) = graph.nodes.get(key) {
            for child in &node.children {
                if let Some(degree) = indegree.get_mut(child.as_str()) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }
    }

    // Cycle remainder, in sorted key order.
    for key in graph.nodes.keys() {
        if seen.insert(key.as_str()) {
            order.push(key.as_str());
        }
    }

    order
        .into_iter()
        .filter_map(|key| graph.nodes.get(key))
        .collect()
}
