// Copyright 2011 Google Inc. All Rights Reserved.
// Copyright 2018 The Majak Project Developers. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use crate::eval_env::{BindingEnv, Rule};
use crate::graph::{Edge, EdgeIndex, Node, NodeIndex};
use crate::utils::spellcheck_string;

pub const PHONY_RULE_NAME: &str = "phony";
pub const CONSOLE_POOL_NAME: &str = "console";

/// A pool for delayed edges.
/// Pools are scoped to a State.  Edges within a State will share Pools.  A
/// Pool will keep a count of the total 'weight' of the currently scheduled
/// edges.  If a Plan attempts to schedule an Edge which would cause the
/// total weight to exceed the depth of the Pool, the Pool will enqueue the
/// Edge instead of allowing the Plan to schedule it.  The Pool will
/// relinquish queued Edges when the total scheduled weight diminishes
/// enough (i.e. when a scheduled edge completes).
pub struct Pool {
    name: String,

    /// current_use is the total of the weights of the edges which are
    /// currently scheduled in the Plan (i.e. the edges in Plan's ready set).
    current_use: isize,
    depth: isize,

    /// Queued edges, in weight order then insertion (index) order.
    delayed: BTreeSet<(usize, EdgeIndex)>,
}

impl Pool {
    pub fn new(name: &str, depth: isize) -> Self {
        Pool {
            name: name.to_owned(),
            current_use: 0,
            depth,
            delayed: BTreeSet::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        // A depth of 0 is infinite.
        self.depth >= 0
    }

    pub fn depth(&self) -> isize {
        self.depth
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_use(&self) -> isize {
        self.current_use
    }

    /// True if the Pool might delay this edge.
    pub fn should_delay_edge(&self) -> bool {
        self.depth != 0
    }

    /// Informs this Pool that the given edge is committed to be run.
    /// Pool will count this edge as using resources from this pool.
    pub fn edge_scheduled(&mut self, weight: usize) {
        if self.depth != 0 {
            self.current_use += weight as isize;
        }
    }

    /// Informs this Pool that the given edge is no longer runnable, and
    /// should relinquish its resources back to the pool.
    pub fn edge_finished(&mut self, weight: usize) {
        if self.depth != 0 {
            self.current_use -= weight as isize;
        }
    }

    /// Adds the given edge to this Pool to be delayed.
    pub fn delay_edge(&mut self, weight: usize, edge: EdgeIndex) {
        debug_assert!(self.depth != 0);
        self.delayed.insert((weight, edge));
    }

    /// Pool will add zero or more edges to the ready queue.
    pub fn retrieve_ready_edges(&mut self, ready: &mut BTreeSet<EdgeIndex>) {
        while let Some(&(weight, edge)) = self.delayed.iter().next() {
            if self.current_use + weight as isize > self.depth {
                break;
            }
            self.delayed.remove(&(weight, edge));
            ready.insert(edge);
            self.edge_scheduled(weight);
        }
    }
}

pub struct NodeState {
    /// All the nodes of the graph.
    nodes: Vec<Node>,

    /// Mapping of path -> Node.
    paths: HashMap<String, NodeIndex>,
}

impl NodeState {
    pub fn new() -> Self {
        NodeState {
            nodes: Vec::new(),
            paths: HashMap::new(),
        }
    }

    /// Return the node for |path|, creating it if necessary.
    pub fn prepare_node(&mut self, path: &str, slash_bits: u64) -> NodeIndex {
        if let Some(node_idx) = self.lookup_node(path) {
            return node_idx;
        }

        let node_idx = NodeIndex(self.nodes.len());
        self.nodes.push(Node::new(path, slash_bits));
        self.paths.insert(path.to_owned(), node_idx);
        node_idx
    }

    pub fn lookup_node(&self, path: &str) -> Option<NodeIndex> {
        self.paths.get(path).cloned()
    }

    pub fn get_node(&self, idx: NodeIndex) -> &Node {
        self.nodes.get(idx.0).expect("node index out of range")
    }

    pub fn get_node_mut(&mut self, idx: NodeIndex) -> &mut Node {
        self.nodes.get_mut(idx.0).expect("node index out of range")
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn paths(&self) -> &HashMap<String, NodeIndex> {
        &self.paths
    }
}

pub struct EdgeState {
    /// All the edges of the graph.
    edges: Vec<Edge>,
}

impl EdgeState {
    pub fn new() -> Self {
        EdgeState { edges: Vec::new() }
    }

    pub fn get_edge(&self, idx: EdgeIndex) -> &Edge {
        self.edges.get(idx.0).expect("edge index out of range")
    }

    pub fn get_edge_mut(&mut self, idx: EdgeIndex) -> &mut Edge {
        self.edges.get_mut(idx.0).expect("edge index out of range")
    }

    pub fn make_edge(
        &mut self,
        rule: Rc<Rule>,
        pool: Rc<RefCell<Pool>>,
        env: Rc<RefCell<BindingEnv>>,
    ) -> EdgeIndex {
        let idx = EdgeIndex(self.edges.len());
        self.edges.push(Edge::new(rule, pool, env));
        idx
    }

    /// Remove an edge that turned out to be fully shadowed by earlier
    /// edges.  Only the most recently created edge can be revoked.
    pub fn revoke_latest_edge(&mut self, idx: EdgeIndex) {
        if self.edges.len() != idx.0 + 1 {
            panic!("trying to revoke an edge that is not the latest one");
        }
        self.edges.pop();
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn indices(&self) -> impl Iterator<Item = EdgeIndex> {
        (0..self.edges.len()).map(EdgeIndex)
    }
}

pub struct PoolState {
    /// All the pools used in the graph.
    pools: HashMap<String, Rc<RefCell<Pool>>>,
}

impl PoolState {
    pub fn new() -> Self {
        PoolState {
            pools: HashMap::new(),
        }
    }

    pub fn add_pool(&mut self, pool: Pool) {
        debug_assert!(self.lookup_pool(pool.name()).is_none());
        self.pools
            .insert(pool.name().to_owned(), Rc::new(RefCell::new(pool)));
    }

    pub fn lookup_pool(&self, pool_name: &str) -> Option<&Rc<RefCell<Pool>>> {
        self.pools.get(pool_name)
    }
}

/// Global state (file status) for a single run.
pub struct State {
    pub node_state: NodeState,
    pub edge_state: EdgeState,
    pub pool_state: PoolState,

    pub bindings: Rc<RefCell<BindingEnv>>,
    defaults: Vec<NodeIndex>,
}

impl State {
    pub fn new() -> Self {
        let mut state = State {
            node_state: NodeState::new(),
            edge_state: EdgeState::new(),
            pool_state: PoolState::new(),
            bindings: Rc::new(RefCell::new(BindingEnv::new())),
            defaults: Vec::new(),
        };

        state
            .bindings
            .borrow_mut()
            .add_rule(Rc::new(Rule::new(PHONY_RULE_NAME.to_owned())));
        state.pool_state.add_pool(Pool::new("", 0));
        state.pool_state.add_pool(Pool::new(CONSOLE_POOL_NAME, 1));
        state
    }

    pub fn get_env(&self) -> Rc<RefCell<BindingEnv>> {
        self.bindings.clone()
    }

    pub fn phony_rule(&self) -> Rc<Rule> {
        self.bindings
            .borrow()
            .lookup_rule(PHONY_RULE_NAME)
            .expect("built-in phony rule always exists")
    }

    pub fn default_pool(&self) -> Rc<RefCell<Pool>> {
        self.pool_state
            .lookup_pool("")
            .expect("built-in default pool always exists")
            .clone()
    }

    pub fn connect_edge_to_in_node(
        edge: &mut Edge,
        edge_idx: EdgeIndex,
        node: &mut Node,
        node_idx: NodeIndex,
    ) {
        edge.inputs.push(node_idx);
        node.add_out_edge(edge_idx);
    }

    /// Returns false if the node already has an in-edge (multiple rules
    /// generate the same output).
    pub fn connect_edge_to_out_node(
        edge: &mut Edge,
        edge_idx: EdgeIndex,
        node: &mut Node,
        node_idx: NodeIndex,
    ) -> bool {
        if node.in_edge().is_some() {
            return false;
        }
        edge.outputs.push(node_idx);
        node.set_in_edge(Some(edge_idx));
        true
    }

    pub fn add_default(&mut self, path: &str) -> Result<(), String> {
        match self.node_state.lookup_node(path) {
            Some(node_idx) => {
                self.defaults.push(node_idx);
                Ok(())
            }
            None => Err(format!("unknown target '{}'", path)),
        }
    }

    /// The root node(s) of the graph (nodes with no output edges).
    pub fn root_nodes(&self) -> Result<Vec<NodeIndex>, String> {
        let mut root_nodes = Vec::new();
        for edge_idx in self.edge_state.indices() {
            for &out_idx in &self.edge_state.get_edge(edge_idx).outputs {
                if self.node_state.get_node(out_idx).out_edges().is_empty() {
                    root_nodes.push(out_idx);
                }
            }
        }

        if self.edge_state.edge_count() != 0 && root_nodes.is_empty() {
            return Err("could not determine root nodes of build graph".to_owned());
        }
        Ok(root_nodes)
    }

    pub fn default_nodes(&self) -> Result<Vec<NodeIndex>, String> {
        if self.defaults.is_empty() {
            self.root_nodes()
        } else {
            Ok(self.defaults.clone())
        }
    }

    /// Find the node whose path is closest to |path|, for "did you mean"
    /// suggestions.
    pub fn spellcheck_node(&self, path: &str) -> Option<String> {
        let paths: Vec<&str> = self
            .node_state
            .paths()
            .keys()
            .map(|k| k.as_str())
            .collect();
        spellcheck_string(path, &paths).map(|s| s.to_owned())
    }

    /// Reset state.  Keeps all nodes and edges, but restores them to the
    /// state where we haven't yet examined the disk for dirty state.
    pub fn reset(&mut self) {
        for idx in 0..self.node_state.node_count() {
            self.node_state.get_node_mut(NodeIndex(idx)).reset_state();
        }
        for edge_idx in self.edge_state.indices().collect::<Vec<_>>() {
            let edge = self.edge_state.get_edge_mut(edge_idx);
            edge.outputs_ready = false;
            edge.deps_missing = false;
            edge.mark = crate::graph::EdgeVisitMark::VisitNone;
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

#[cfg(test)]
impl State {
    pub fn verify_graph(&self) {
        use std::collections::HashSet;

        for edge_idx in self.edge_state.indices() {
            let edge = self.edge_state.get_edge(edge_idx);

            // All edges need at least one output.
            assert!(!edge.outputs.is_empty());

            // Check that the edge's inputs have the edge as out-edge.
            for in_node_idx in &edge.inputs {
                let in_node = self.node_state.get_node(*in_node_idx);
                assert!(in_node.out_edges().contains(&edge_idx));
            }

            // Check that the edge's outputs have the edge as in-edge.
            for out_node_idx in &edge.outputs {
                let out_node = self.node_state.get_node(*out_node_idx);
                assert_eq!(out_node.in_edge(), Some(edge_idx));
            }
        }

        // The union of all in- and out-edges of each node should be
        // exactly the edge set.
        assert_eq!(self.node_state.paths().len(), self.node_state.node_count());
        let mut node_edge_set = HashSet::new();
        for idx in 0..self.node_state.node_count() {
            let node = self.node_state.get_node(NodeIndex(idx));
            if let Some(in_edge) = node.in_edge() {
                node_edge_set.insert(in_edge);
            }
            node_edge_set.extend(node.out_edges().iter().cloned());
        }
        let edge_set: HashSet<_> = self.edge_state.indices().collect();
        assert_eq!(node_edge_set, edge_set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeVisitMark;

    #[test]
    fn state_basic() {
        let mut state = State::new();

        let mut rule = Rule::new("cat".to_owned());
        {
            let mut command = crate::eval_env::EvalString::new();
            command.add_text("cat ");
            command.add_special("in");
            command.add_text(" > ");
            command.add_special("out");
            rule.add_binding("command", &command);
        }
        let rule = Rc::new(rule);
        state.bindings.borrow_mut().add_rule(rule.clone());

        let pool = state.default_pool();
        let env = state.bindings.clone();
        let edge_idx = state.edge_state.make_edge(rule, pool, env);

        let in1 = state.node_state.prepare_node("in1", 0);
        let in2 = state.node_state.prepare_node("in2", 0);
        let out = state.node_state.prepare_node("out", 0);
        {
            let edge = state.edge_state.get_edge_mut(edge_idx);
            edge.inputs.push(in1);
            edge.inputs.push(in2);
            edge.outputs.push(out);
        }
        state.node_state.get_node_mut(in1).add_out_edge(edge_idx);
        state.node_state.get_node_mut(in2).add_out_edge(edge_idx);
        state.node_state.get_node_mut(out).set_in_edge(Some(edge_idx));

        assert_eq!(
            "cat in1 in2 > out",
            state
                .edge_state
                .get_edge(edge_idx)
                .evaluate_command(&state.node_state)
        );

        // Quiet state.
        assert!(!state.node_state.get_node(in1).is_dirty());
        assert!(!state.node_state.get_node(out).is_dirty());
    }

    #[test]
    fn state_reset_clears_per_run_flags() {
        let mut state = State::new();
        let phony = state.phony_rule();
        let pool = state.default_pool();
        let env = state.bindings.clone();
        let edge_idx = state.edge_state.make_edge(phony, pool, env);
        let out = state.node_state.prepare_node("out", 0);
        {
            let edge = state.edge_state.get_edge_mut(edge_idx);
            edge.outputs.push(out);
            edge.outputs_ready = true;
            edge.mark = EdgeVisitMark::VisitDone;
        }
        state.node_state.get_node_mut(out).set_in_edge(Some(edge_idx));
        state.node_state.get_node_mut(out).mark_dirty();

        state.reset();

        let edge = state.edge_state.get_edge(edge_idx);
        assert!(!edge.outputs_ready);
        assert!(matches!(edge.mark, EdgeVisitMark::VisitNone));
        assert!(!state.node_state.get_node(out).is_dirty());
        assert!(!state.node_state.get_node(out).status_known());
    }

    #[test]
    fn pool_delays_and_releases_in_order() {
        let mut pool = Pool::new("link", 2);
        assert!(pool.should_delay_edge());

        pool.edge_scheduled(1);
        pool.edge_scheduled(1);
        assert_eq!(2, pool.current_use());

        pool.delay_edge(1, EdgeIndex(7));
        pool.delay_edge(1, EdgeIndex(3));

        let mut ready = BTreeSet::new();
        pool.retrieve_ready_edges(&mut ready);
        assert!(ready.is_empty());

        pool.edge_finished(1);
        pool.retrieve_ready_edges(&mut ready);
        // Only one slot freed; the lowest-keyed delayed edge runs first.
        assert_eq!(1, ready.len());
        assert!(ready.contains(&EdgeIndex(3)));

        pool.edge_finished(1);
        pool.retrieve_ready_edges(&mut ready);
        assert!(ready.contains(&EdgeIndex(7)));
        assert_eq!(2, pool.current_use());
    }

    #[test]
    fn default_pool_never_delays() {
        let pool = Pool::new("", 0);
        assert!(!pool.should_delay_edge());
        assert!(pool.is_valid());
    }
}
