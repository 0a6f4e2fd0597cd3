//! The per-domain multi-level segment index.
//!
//! Nodes form a tree keyed by path segment, with one sentinel key for fuzzy
//! segments. A node that terminates a registered path (leaf) or that is fuzzy
//! carries an ordered entry list. Entries registered below a fuzzy node are
//! additionally linked into that fuzzy node's list, so a request match at any
//! depth sees deeper and wildcard registrations without a second index pass.

use std::collections::HashMap;
use std::sync::Arc;

use crate::pattern::{is_fuzzy_segment, segments};

use super::priority::outranks;
use super::HandlerEntry;

/// Child key under which all fuzzy segments of one node collapse.
const FUZZY_KEY: &str = "*";

#[derive(Default)]
struct Node {
    children: HashMap<String, usize>,
    list: Vec<Arc<HandlerEntry>>,
}

/// Segment tree for one routing domain. Built during registration, read-only
/// once the router is sealed.
pub struct DomainIndex {
    nodes: Vec<Node>,
    entries: Vec<Arc<HandlerEntry>>,
}

impl Default for DomainIndex {
    fn default() -> Self {
        Self {
            nodes: vec![Node::default()],
            entries: Vec::new(),
        }
    }
}

impl DomainIndex {
    /// Links `entry` into the tree: walks/creates nodes for its path, then
    /// insertion-sorts the entry into the terminal leaf list and into every
    /// fuzzy list touched along the walk.
    pub fn insert(&mut self, entry: Arc<HandlerEntry>) {
        let path = entry.pattern().path().to_owned();
        let mut node = 0usize;
        let mut touched: Vec<usize> = Vec::new();

        for seg in segments(&path) {
            let key = if is_fuzzy_segment(seg) {
                FUZZY_KEY.to_owned()
            } else {
                seg.to_owned()
            };
            let next = match self.nodes[node].children.get(&key) {
                Some(&idx) => idx,
                None => {
                    let idx = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[node].children.insert(key.clone(), idx);
                    idx
                }
            };
            if key == FUZZY_KEY {
                touched.push(next);
            }
            node = next;
        }

        if touched.last() != Some(&node) {
            touched.push(node);
        }

        for idx in touched {
            let list = &mut self.nodes[idx].list;
            let pos = list
                .iter()
                .position(|existing| outranks(&entry, existing))
                .unwrap_or(list.len());
            list.insert(pos, entry.clone());
        }
        self.entries.push(entry);
    }

    /// Unlinks the entry with `id` from every list it joined.
    pub fn remove(&mut self, id: u64) {
        for node in &mut self.nodes {
            node.list.retain(|e| e.id() != id);
        }
        self.entries.retain(|e| e.id() != id);
    }

    /// Walks the tree for a request path and returns every leaf/fuzzy list
    /// encountered, shallowest first. Callers consult the result in reverse
    /// so deeper registrations win.
    pub fn candidate_lists(&self, segs: &[&str]) -> Vec<&Vec<Arc<HandlerEntry>>> {
        let mut lists = Vec::new();
        let mut node = 0usize;

        if !self.nodes[node].list.is_empty() {
            lists.push(&self.nodes[node].list);
        }

        for seg in segs {
            if let Some(&fuzzy) = self.nodes[node].children.get(FUZZY_KEY) {
                if !self.nodes[fuzzy].list.is_empty() {
                    lists.push(&self.nodes[fuzzy].list);
                }
            }
            match self.nodes[node].children.get(*seg) {
                Some(&child) => {
                    node = child;
                    if !self.nodes[node].list.is_empty() {
                        lists.push(&self.nodes[node].list);
                    }
                }
                None => match self.nodes[node].children.get(FUZZY_KEY) {
                    // The fuzzy node's list is already collected; keep walking
                    // through it for deeper literal segments.
                    Some(&fuzzy) => node = fuzzy,
                    None => break,
                },
            }
        }

        lists
    }

    /// Distinct registered entries, in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &Arc<HandlerEntry>> {
        self.entries.iter()
    }

    /// Number of distinct registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::route::Router;

    fn noop() -> impl Fn(Context) -> std::future::Ready<()> + Send + Sync + 'static {
        |_ctx| std::future::ready(())
    }

    fn paths_of(lists: &[&Vec<Arc<HandlerEntry>>]) -> Vec<Vec<String>> {
        lists
            .iter()
            .map(|l| l.iter().map(|e| e.pattern().path().to_owned()).collect())
            .collect()
    }

    #[test]
    fn root_registration_lands_in_root_list() {
        let mut router = Router::new();
        router.bind("/", noop()).unwrap();
        let index = router.domain("default").unwrap();
        let lists = index.candidate_lists(&[]);
        assert_eq!(paths_of(&lists), [["/"]]);
        // The root list is on every request's path.
        let deeper = index.candidate_lists(&["a", "b"]);
        assert_eq!(paths_of(&deeper), [["/"]]);
    }

    #[test]
    fn intermediate_leaf_lists_are_visible_on_deeper_walks() {
        let mut router = Router::new();
        router.bind("/test", noop()).unwrap();
        router.bind("/test/test", noop()).unwrap();
        let index = router.domain("default").unwrap();
        let lists = index.candidate_lists(&["test", "test"]);
        assert_eq!(paths_of(&lists), [vec!["/test"], vec!["/test/test"]]);
    }

    #[test]
    fn entry_below_fuzzy_node_linked_into_fuzzy_list() {
        let mut router = Router::new();
        router.bind("/a/:x/deep", noop()).unwrap();
        let index = router.domain("default").unwrap();
        // Request diverging at the fuzzy level still sees the deep entry.
        let lists = index.candidate_lists(&["a", "anything"]);
        assert_eq!(paths_of(&lists), [["/a/:x/deep"]]);
        // And the walk continues through the fuzzy node to the leaf.
        let deep = index.candidate_lists(&["a", "anything", "deep"]);
        assert_eq!(
            paths_of(&deep),
            [vec!["/a/:x/deep"], vec!["/a/:x/deep"]]
        );
    }

    #[test]
    fn literal_descent_preferred_but_fuzzy_list_still_collected() {
        let mut router = Router::new();
        router.bind("/a/lit", noop()).unwrap();
        router.bind("/a/:x", noop()).unwrap();
        let index = router.domain("default").unwrap();
        let lists = index.candidate_lists(&["a", "lit"]);
        assert_eq!(paths_of(&lists), [vec!["/a/:x"], vec!["/a/lit"]]);
    }

    #[test]
    fn removal_unlinks_everywhere() {
        let mut router = Router::new();
        router.bind("/f/:x/leaf", noop()).unwrap();
        let id = {
            let index = router.domain("default").unwrap();
            index.entries().next().unwrap().id()
        };
        // Removal goes through the router's override path in production; here
        // exercise the index directly.
        let index_mut = router.domain_mut_for_tests("default");
        index_mut.remove(id);
        assert!(index_mut.is_empty());
        assert!(index_mut.candidate_lists(&["f", "1"]).is_empty());
        assert!(index_mut.candidate_lists(&["f", "1", "leaf"]).is_empty());
    }
}
