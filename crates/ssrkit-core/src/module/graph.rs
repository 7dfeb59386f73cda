//! Reverse dependency edges: importee URL → importer URLs.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct DependencyGraph {
    importers: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `importer` imports `importee`.
    pub fn record_edge(&mut self, importer: &str, importee: &str) {
        self.importers
            .entry(importee.to_string())
            .or_default()
            .insert(importer.to_string());
    }

    /// Importers recorded for `url`, sorted.
    #[must_use]
    pub fn importers_of(&self, url: &str) -> Vec<String> {
        let mut importers: Vec<String> = self
            .importers
            .get(url)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        importers.sort();
        importers
    }

    /// Remove the entry for `url` and return its importers.
    pub fn take_importers(&mut self, url: &str) -> Option<HashSet<String>> {
        self.importers.remove(url)
    }

    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.importers.contains_key(url)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.importers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.importers.is_empty()
    }

    pub fn clear(&mut self) {
        self.importers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_take() {
        let mut graph = DependencyGraph::new();
        graph.record_edge("/b.mod", "/a.mod");
        graph.record_edge("/c.mod", "/a.mod");
        graph.record_edge("/b.mod", "/a.mod");

        assert_eq!(graph.importers_of("/a.mod"), vec!["/b.mod", "/c.mod"]);
        assert!(graph.contains("/a.mod"));
        assert!(!graph.contains("/b.mod"));

        let taken = graph.take_importers("/a.mod").unwrap();
        assert_eq!(taken.len(), 2);
        assert!(graph.is_empty());
        assert!(graph.take_importers("/a.mod").is_none());
    }
}
