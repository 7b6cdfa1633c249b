//! Dependency graph construction and ordering algorithms

use std::collections::{BTreeMap, BTreeSet, HashMap};

use cadre_core::{CadreError, Result};
use glob::Pattern;
use tracing::debug;

/// One registered agent in the graph
#[derive(Debug, Clone)]
pub struct AgentNode {
    pub name: String,
    /// Names of agents that must complete before this one
    pub dependencies: BTreeSet<String>,
    /// Glob patterns mapping changed files to this agent
    pub file_patterns: Vec<Pattern>,
}

/// Traversal colors for cycle-detecting depth-first search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not yet visited
    White,
    /// On the current DFS path
    Gray,
    /// Fully explored
    Black,
}

/// Dependency graph over registered agents
///
/// Read-heavy: registration mutates, every query recomputes from the node
/// table. Callers must not register agents while an execution plan derived
/// from this graph is in flight.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, AgentNode>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent with its dependencies and file patterns
    ///
    /// Re-registering with an identical dependency set is a no-op update;
    /// a conflicting dependency set fails unless `overwrite` is passed.
    pub fn add_agent(
        &mut self,
        name: impl Into<String>,
        dependencies: &[&str],
        file_patterns: &[&str],
        overwrite: bool,
    ) -> Result<()> {
        let name = name.into();
        let dependencies: BTreeSet<String> =
            dependencies.iter().map(|d| d.to_string()).collect();

        if let Some(existing) = self.nodes.get(&name) {
            if existing.dependencies != dependencies && !overwrite {
                return Err(CadreError::DuplicateAgent(name));
            }
        }

        let mut patterns = Vec::with_capacity(file_patterns.len());
        for raw in file_patterns {
            let pattern = Pattern::new(raw).map_err(|e| {
                CadreError::Configuration(format!("invalid pattern {:?} for {}: {}", raw, name, e))
            })?;
            patterns.push(pattern);
        }

        debug!(
            "Registering agent {} ({} deps, {} patterns)",
            name,
            dependencies.len(),
            patterns.len()
        );

        self.nodes.insert(
            name.clone(),
            AgentNode {
                name,
                dependencies,
                file_patterns: patterns,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn node(&self, name: &str) -> Option<&AgentNode> {
        self.nodes.get(name)
    }

    /// Derived reverse edges: for each agent, the agents that depend on it
    pub fn dependents(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut dependents: BTreeMap<String, BTreeSet<String>> = self
            .nodes
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();

        for node in self.nodes.values() {
            for dep in &node.dependencies {
                if let Some(entry) = dependents.get_mut(dep) {
                    entry.insert(node.name.clone());
                }
            }
        }
        dependents
    }

    /// Depth-first topological sort over all registered agents
    ///
    /// Three-color traversal; a gray node reached twice names the cycle in
    /// the returned error. O(V+E).
    pub fn build_execution_order(&self) -> Result<Vec<String>> {
        let mut colors: HashMap<&str, Color> = self
            .nodes
            .keys()
            .map(|name| (name.as_str(), Color::White))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut path = Vec::new();

        for name in self.nodes.keys() {
            if colors[name.as_str()] == Color::White {
                self.visit(name, &mut colors, &mut order, &mut path)?;
            }
        }

        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        colors: &mut HashMap<&'a str, Color>,
        order: &mut Vec<String>,
        path: &mut Vec<String>,
    ) -> Result<()> {
        match colors.get(name) {
            Some(Color::Black) => return Ok(()),
            Some(Color::Gray) => {
                // Back edge: everything on the path since the first visit
                // of `name` is part of the cycle
                let start = path.iter().position(|p| p == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].to_vec();
                cycle.push(name.to_string());
                return Err(CadreError::CircularDependency { cycle });
            }
            Some(Color::White) => {}
            None => unreachable!("colors seeded from node table"),
        }

        colors.insert(name, Color::Gray);
        path.push(name.to_string());

        let node = &self.nodes[name];
        for dep in &node.dependencies {
            let dep = self.nodes.get(dep).map(|n| n.name.as_str()).ok_or_else(|| {
                CadreError::UnknownDependency {
                    agent: name.to_string(),
                    dependency: dep.clone(),
                }
            })?;
            self.visit(dep, colors, order, path)?;
        }

        path.pop();
        colors.insert(name, Color::Black);
        order.push(name.to_string());
        Ok(())
    }

    /// Level per agent: 0 without dependencies, otherwise
    /// `1 + max(level of each dependency)`
    pub fn levels(&self) -> Result<BTreeMap<String, usize>> {
        let order = self.build_execution_order()?;
        let mut levels = BTreeMap::new();

        // Topological order guarantees dependency levels exist before use
        for name in &order {
            let node = &self.nodes[name];
            let level = node
                .dependencies
                .iter()
                .map(|dep| levels[dep] + 1)
                .max()
                .unwrap_or(0);
            levels.insert(name.clone(), level);
        }

        Ok(levels)
    }

    /// Ordered level groups: every agent's dependencies lie in strictly
    /// earlier groups; agents within a group may run concurrently
    pub fn parallel_groups(&self) -> Result<Vec<Vec<String>>> {
        let levels = self.levels()?;
        let depth = levels.values().max().map_or(0, |max| max + 1);

        let mut groups = vec![Vec::new(); depth];
        for (name, level) in levels {
            groups[level].push(name);
        }
        Ok(groups)
    }

    /// Agents whose patterns match any changed file, plus every transitive
    /// dependent (downstream work must rerun when upstream output changes)
    pub fn affected_agents(&self, changed_files: &[String]) -> BTreeSet<String> {
        let mut affected: BTreeSet<String> = self
            .nodes
            .values()
            .filter(|node| {
                node.file_patterns
                    .iter()
                    .any(|p| changed_files.iter().any(|f| p.matches(f)))
            })
            .map(|node| node.name.clone())
            .collect();

        // Closure over the dependent edges
        let dependents = self.dependents();
        let mut frontier: Vec<String> = affected.iter().cloned().collect();
        while let Some(name) = frontier.pop() {
            if let Some(downstream) = dependents.get(&name) {
                for dependent in downstream {
                    if affected.insert(dependent.clone()) {
                        frontier.push(dependent.clone());
                    }
                }
            }
        }

        affected
    }

    /// Non-throwing cycle probe for pre-flight validation
    pub fn has_circular_dependencies(&self) -> bool {
        matches!(
            self.build_execution_order(),
            Err(CadreError::CircularDependency { .. })
        )
    }
}
