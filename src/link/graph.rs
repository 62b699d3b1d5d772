//! Dependency graph between contracts and the deployment order derived from it

use crate::error::LinkError;

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Contract -> set of contracts it references
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a contract with no dependencies (no-op if already present)
    pub fn add_contract(&mut self, contract: impl Into<String>) {
        self.edges.entry(contract.into()).or_insert_with(BTreeSet::new);
    }

    /// Record that `contract` references `dependency`
    pub fn add_dependency(&mut self, contract: impl Into<String>, dependency: impl Into<String>) {
        self.edges
            .entry(contract.into())
            .or_insert_with(BTreeSet::new)
            .insert(dependency.into());
    }

    pub fn contains(&self, contract: &str) -> bool {
        self.edges.contains_key(contract)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Direct dependencies of a contract
    pub fn dependencies(&self, contract: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(contract)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Contracts that directly reference `contract`
    pub fn dependents(&self, contract: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.contains(contract))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Topological order: every contract appears after all of its dependencies.
    ///
    /// Ties are broken by name so the order is stable across runs.
    pub fn order(&self) -> Result<Vec<String>, LinkError> {
        for (contract, deps) in &self.edges {
            if let Some(missing) = deps.iter().find(|d| !self.edges.contains_key(*d)) {
                return Err(LinkError::UnknownDependency {
                    contract: contract.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let mut marks = HashMap::with_capacity(self.edges.len());
        let mut stack = Vec::new();
        let mut order = Vec::with_capacity(self.edges.len());

        for contract in self.edges.keys() {
            self.visit(contract, &mut marks, &mut stack, &mut order)?;
        }

        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        contract: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), LinkError> {
        match marks.get(contract) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|c| *c == contract).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|c| c.to_string()).collect();
                cycle.push(contract.to_string());
                return Err(LinkError::CyclicDependency { cycle });
            }
            None => {}
        }

        marks.insert(contract, Mark::Visiting);
        stack.push(contract);

        for dependency in self.dependencies(contract) {
            self.visit(dependency, marks, stack, order)?;
        }

        stack.pop();
        marks.insert(contract, Mark::Done);
        order.push(contract.to_string());
        Ok(())
    }
}
