use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::{self, Display},
};

#[allow(unused_imports)]
use log::debug;
use thiserror::Error;

use crate::test::TestName;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    // A cycle existed containing the test with this name. `graph` renders the
    // whole graph since the cycle might be long.
    #[error("found dependency loop containing {node}: {graph}")]
    Cycle { node: TestName, graph: String },
}

// Dependency graph over the set of tests that a run is considering. Nodes live
// in an arena and are referred to by index, names are only used at the edges
// of the API.
#[derive(Debug)]
pub struct TestGraph {
    // Sorted, so that scheduling order is stable.
    names: Vec<TestName>,
    // Maps names to their index in `names`.
    name_to_idx: HashMap<TestName, usize>,
    // deps[i] contains the indices of the tests that test i depends on.
    deps: Vec<Vec<usize>>,
}

impl TestGraph {
    // Build the graph for `tests`, looking up dependencies with `deps_of`.
    // Dependencies on tests that aren't in `tests` are dropped: the test then
    // runs as if it didn't have them.
    pub fn new<F>(tests: impl IntoIterator<Item = TestName>, deps_of: F) -> Result<Self, DagError>
    where
        F: Fn(&TestName) -> Vec<TestName>,
    {
        let mut names: Vec<TestName> = tests.into_iter().collect();
        names.sort();
        names.dedup();
        let name_to_idx: HashMap<TestName, usize> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();

        let mut deps = vec![Vec::new(); names.len()];
        for (idx, name) in names.iter().enumerate() {
            for dep in deps_of(name) {
                match name_to_idx.get(&dep) {
                    Some(&dep_idx) if !deps[idx].contains(&dep_idx) => deps[idx].push(dep_idx),
                    Some(_) => {}
                    None => debug!("{name}: dropping dependency {dep}, it's not being run"),
                }
            }
        }

        let graph = Self {
            names,
            name_to_idx,
            deps,
        };
        graph.check_cycles()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    // All the tests in the graph, in lexicographic order.
    pub fn tests(&self) -> &[TestName] {
        &self.names
    }

    // Direct dependencies of `test`, or None if the test isn't in the graph.
    pub fn dependencies(&self, test: &str) -> Option<impl Iterator<Item = &TestName>> {
        let idx = *self.name_to_idx.get(test)?;
        Some(self.deps[idx].iter().map(|&d| &self.names[d]))
    }

    // Everything that transitively depends on `test`, sorted. Empty if the test
    // isn't in the graph.
    pub fn dependents_of(&self, test: &str) -> Vec<&TestName> {
        let Some(&start) = self.name_to_idx.get(test) else {
            return Vec::new();
        };
        let mut rdeps = vec![Vec::new(); self.len()];
        for (idx, deps) in self.deps.iter().enumerate() {
            for &dep in deps {
                rdeps[dep].push(idx);
            }
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for &rdep in &rdeps[idx] {
                if seen.insert(rdep) {
                    queue.push_back(rdep);
                }
            }
        }
        let mut dependents: Vec<&TestName> = seen.into_iter().map(|i| &self.names[i]).collect();
        dependents.sort();
        dependents
    }

    // Depth-first search from every node, in name order. This is the iterative
    // version of the usual recursive algorithm: a node is pushed once when it's
    // discovered and stays on the stack as a marker while its dependencies are
    // explored, then it's popped again once they are all done.
    fn check_cycles(&self) -> Result<(), DagError> {
        let mut colors = vec![Color::White; self.len()];
        for source in 0..self.len() {
            if colors[source] != Color::White {
                continue;
            }
            let mut stack = vec![source];
            while let Some(v) = stack.pop() {
                match colors[v] {
                    Color::White => {
                        colors[v] = Color::Gray;
                        // Don't actually pop yet.
                        stack.push(v);
                        // Any Gray dependency is an ancestor on the current
                        // path, including v itself for a self-loop.
                        if self.deps[v].iter().any(|&d| colors[d] == Color::Gray) {
                            return Err(DagError::Cycle {
                                node: self.names[v].clone(),
                                graph: self.to_string(),
                            });
                        }
                        stack.extend(
                            self.deps[v]
                                .iter()
                                .copied()
                                .filter(|&d| colors[d] == Color::White),
                        );
                    }
                    Color::Gray => colors[v] = Color::Black,
                    Color::Black => {}
                }
            }
        }
        Ok(())
    }
}

// Renders as {a: [], b: [a]}.
impl Display for TestGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, name) in self.names.iter().enumerate() {
            if idx != 0 {
                write!(f, ", ")?;
            }
            let deps: Vec<&str> = self.deps[idx]
                .iter()
                .map(|&d| self.names[d].as_str())
                .collect();
            write!(f, "{}: [{}]", name, deps.join(", "))?;
        }
        write!(f, "}}")
    }
}

// Traversal state of a node during the DFS.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White, // Not discovered yet.
    Gray,  // On the DFS path, some dependencies not yet finished.
    Black, // This node and everything it depends on has been explored.
}
