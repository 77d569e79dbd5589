//! Refresh dependency graph: validation, ordering and execution waves.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use sqp_core::{DependencyKind, RefreshConfig, RefreshDependency, TableId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("dependency {parent} -> {dependent} references unknown table {missing}")]
    UnknownTable {
        parent: TableId,
        dependent: TableId,
        missing: TableId,
    },
    #[error("table {0} depends on itself")]
    SelfDependency(TableId),
    #[error("dependency cycle detected among: {}", format_tables(.0))]
    Cycle(Vec<TableId>),
}

fn format_tables(tables: &[TableId]) -> String {
    tables
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Heap entry ordered so that the highest priority, then the smallest name,
/// pops first.
#[derive(Debug, PartialEq, Eq)]
struct Ready {
    priority: i32,
    table: Reverse<TableId>,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.table.cmp(&other.table))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    priorities: BTreeMap<TableId, i32>,
    parents: BTreeMap<TableId, Vec<(TableId, DependencyKind)>>,
    children: BTreeMap<TableId, Vec<TableId>>,
    order: Vec<TableId>,
    depth: BTreeMap<TableId, usize>,
}

impl DependencyGraph {
    /// Build and validate the graph. Every edge endpoint must be a known
    /// config and the edges must be acyclic.
    pub fn build(
        configs: &[RefreshConfig],
        dependencies: &[RefreshDependency],
    ) -> Result<Self, GraphError> {
        let mut graph = Self {
            priorities: configs
                .iter()
                .map(|c| (c.table.clone(), c.priority))
                .collect(),
            ..Self::default()
        };

        for dep in dependencies {
            for endpoint in [&dep.parent, &dep.dependent] {
                if !graph.priorities.contains_key(endpoint) {
                    return Err(GraphError::UnknownTable {
                        parent: dep.parent.clone(),
                        dependent: dep.dependent.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
            if dep.parent == dep.dependent {
                return Err(GraphError::SelfDependency(dep.parent.clone()));
            }
            graph
                .parents
                .entry(dep.dependent.clone())
                .or_default()
                .push((dep.parent.clone(), dep.kind));
            graph
                .children
                .entry(dep.parent.clone())
                .or_default()
                .push(dep.dependent.clone());
        }

        graph.order = graph.kahn()?;
        for table in &graph.order {
            let depth = graph
                .parents_of(table)
                .map(|(parent, _)| graph.depth.get(parent).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            graph.depth.insert(table.clone(), depth);
        }
        Ok(graph)
    }

    fn kahn(&self) -> Result<Vec<TableId>, GraphError> {
        let mut indegree: BTreeMap<&TableId, usize> = self
            .priorities
            .keys()
            .map(|t| (t, self.parents.get(t).map_or(0, Vec::len)))
            .collect();
        let mut ready: BinaryHeap<Ready> = indegree
            .iter()
            .filter(|(_, &n)| n == 0)
            .map(|(t, _)| self.ready(t))
            .collect();

        let mut order = Vec::with_capacity(self.priorities.len());
        while let Some(Ready { table, .. }) = ready.pop() {
            let table = table.0;
            for child in self.children.get(&table).into_iter().flatten() {
                if let Some(n) = indegree.get_mut(child) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(self.ready(child));
                    }
                }
            }
            order.push(table);
        }

        if order.len() < self.priorities.len() {
            let done: BTreeSet<&TableId> = order.iter().collect();
            let stuck = self
                .priorities
                .keys()
                .filter(|t| !done.contains(t))
                .cloned()
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(order)
    }

    fn ready(&self, table: &TableId) -> Ready {
        Ready {
            priority: self.priorities.get(table).copied().unwrap_or_default(),
            table: Reverse(table.clone()),
        }
    }

    pub fn contains(&self, table: &TableId) -> bool {
        self.priorities.contains_key(table)
    }

    pub fn parents_of(&self, table: &TableId) -> impl Iterator<Item = &(TableId, DependencyKind)> {
        self.parents.get(table).into_iter().flatten()
    }

    pub fn hard_parents(&self, table: &TableId) -> impl Iterator<Item = &TableId> {
        self.parents_of(table)
            .filter(|(_, kind)| *kind == DependencyKind::Hard)
            .map(|(parent, _)| parent)
    }

    /// Topological order of every table with (priority desc, name asc)
    /// tie-breaks.
    pub fn topological_order(&self) -> &[TableId] {
        &self.order
    }

    /// Split `subset` into waves. A table's wave is its depth in the full
    /// graph, so ordering through tables outside the subset is preserved.
    pub fn waves(&self, subset: &[TableId]) -> Vec<Vec<TableId>> {
        let wanted: BTreeSet<&TableId> = subset.iter().collect();
        let mut by_depth: BTreeMap<usize, Vec<TableId>> = BTreeMap::new();
        for table in &self.order {
            if wanted.contains(table) {
                let depth = self.depth.get(table).copied().unwrap_or(0);
                by_depth.entry(depth).or_default().push(table.clone());
            }
        }
        by_depth
            .into_values()
            .map(|mut wave| {
                wave.sort_by(|a, b| {
                    let pa = self.priorities.get(a).copied().unwrap_or_default();
                    let pb = self.priorities.get(b).copied().unwrap_or_default();
                    pb.cmp(&pa).then_with(|| a.cmp(b))
                });
                wave
            })
            .collect()
    }
}
