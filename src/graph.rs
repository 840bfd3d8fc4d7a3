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

use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::ops::Range;
use std::rc::Rc;

use crate::build_log::{hash_command, BuildLog};
use crate::depfile_parser::DepfileParser;
use crate::disk_interface::{DiskInterface, FileReaderError};
use crate::eval_env::{BindingEnv, Env, Rule};
use crate::state::{NodeState, Pool, State, CONSOLE_POOL_NAME, PHONY_RULE_NAME};
use crate::timestamp::TimeStamp;
use crate::utils::{
    canonicalize_path, decanonicalize_path, get_shell_escaped_string, get_win32_escaped_string,
    WINDOWS_PATH,
};

#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Debug)]
pub struct NodeIndex(pub(crate) usize);

#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Debug)]
pub struct EdgeIndex(pub(crate) usize);

/// Information about a node in the dependency graph: the file, whether
/// it's dirty, its mtime, etc.
pub struct Node {
    path: String,

    /// Set bits starting from lowest for backslashes that were normalized
    /// to forward slashes by canonicalize_path.  Only used on Windows.
    slash_bits: u64,

    /// The Edge that produces this Node, or None when there is no known
    /// edge to produce it.
    in_edge: Option<EdgeIndex>,

    /// All Edges that use this Node as an input.
    out_edges: Vec<EdgeIndex>,

    /// A dense integer id for the node, assigned and used by the build log.
    id: isize,

    /// See TimeStamp for the meaning of the -1/0/>0 values.
    mtime: TimeStamp,

    /// Dirty is true when the underlying file is out-of-date.
    /// But note that Edge's outputs_ready is also used in judging which
    /// edges to build.
    dirty: bool,
}

impl Node {
    pub fn new(path: &str, slash_bits: u64) -> Self {
        Node {
            path: path.to_owned(),
            slash_bits,
            in_edge: None,
            out_edges: Vec::new(),
            id: -1,
            mtime: TimeStamp::unknown(),
            dirty: false,
        }
    }

    pub fn id(&self) -> isize {
        self.id
    }

    pub fn set_id(&mut self, id: isize) {
        self.id = id;
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn slash_bits(&self) -> u64 {
        self.slash_bits
    }

    pub fn mtime(&self) -> TimeStamp {
        self.mtime
    }

    pub fn set_mtime(&mut self, mtime: TimeStamp) {
        self.mtime = mtime;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Mark as not-yet-stat()ed and not dirty.
    pub fn reset_state(&mut self) {
        self.mtime = TimeStamp::unknown();
        self.dirty = false;
    }

    /// Mark the Node as already-stat()ed and missing.
    pub fn mark_missing(&mut self) {
        self.mtime = TimeStamp::missing();
    }

    pub fn exists(&self) -> bool {
        self.mtime.0 != 0
    }

    pub fn status_known(&self) -> bool {
        self.mtime.0 != -1
    }

    pub fn in_edge(&self) -> Option<EdgeIndex> {
        self.in_edge
    }

    pub fn set_in_edge(&mut self, edge: Option<EdgeIndex>) {
        self.in_edge = edge;
    }

    pub fn out_edges(&self) -> &[EdgeIndex] {
        &self.out_edges
    }

    pub fn add_out_edge(&mut self, edge: EdgeIndex) {
        self.out_edges.push(edge);
    }

    /// path() but with slash_bits applied to restore original separators.
    pub fn path_decanonicalized(&self) -> String {
        decanonicalize_path(&self.path, self.slash_bits)
    }

    pub fn stat(&mut self, disk_interface: &dyn DiskInterface) -> Result<(), String> {
        self.mtime = disk_interface.stat(&self.path)?;
        Ok(())
    }

    /// Stat the node's file if it hasn't been seen this run yet; each node
    /// is examined at most once per build.
    pub fn stat_if_necessary(&mut self, disk_interface: &dyn DiskInterface) -> Result<(), String> {
        if self.status_known() {
            return Ok(());
        }
        self.stat(disk_interface)
    }
}

#[derive(Clone, Copy)]
pub enum EdgeVisitMark {
    VisitNone,
    VisitInStack,
    VisitDone,
}

/// An edge in the dependency graph; links between Nodes using Rules.
pub struct Edge {
    rule: Rc<Rule>,
    pub pool: Rc<RefCell<Pool>>,
    pub inputs: Vec<NodeIndex>,
    pub outputs: Vec<NodeIndex>,
    pub env: Rc<RefCell<BindingEnv>>,
    pub mark: EdgeVisitMark,
    pub outputs_ready: bool,
    pub deps_missing: bool,
    pub implicit_deps: usize,
    pub order_only_deps: usize,
    pub implicit_outs: usize,
}

impl Edge {
    pub fn new(rule: Rc<Rule>, pool: Rc<RefCell<Pool>>, env: Rc<RefCell<BindingEnv>>) -> Self {
        Edge {
            rule,
            pool,
            inputs: Vec::new(),
            outputs: Vec::new(),
            env,
            mark: EdgeVisitMark::VisitNone,
            outputs_ready: false,
            deps_missing: false,
            implicit_deps: 0,
            order_only_deps: 0,
            implicit_outs: 0,
        }
    }

    pub fn rule(&self) -> &Rc<Rule> {
        &self.rule
    }

    pub fn pool(&self) -> &Rc<RefCell<Pool>> {
        &self.pool
    }

    pub fn weight(&self) -> usize {
        1
    }

    pub fn outputs_ready(&self) -> bool {
        self.outputs_ready
    }

    // There are three types of inputs.
    // 1) explicit deps, which show up as $in on the command line;
    // 2) implicit deps, which the target depends on implicitly (e.g. C
    //    headers), and changes in them cause the target to rebuild;
    // 3) order-only deps, which are needed before the target builds but
    //    which don't cause the target to rebuild.
    // These are stored in inputs in that order, and we keep counts of
    // #2 and #3 when we need to access the various subsets.
    pub fn explicit_deps_range(&self) -> Range<usize> {
        0..(self.inputs.len() - self.implicit_deps - self.order_only_deps)
    }

    pub fn implicit_deps_range(&self) -> Range<usize> {
        (self.inputs.len() - self.implicit_deps - self.order_only_deps)
            ..(self.inputs.len() - self.order_only_deps)
    }

    pub fn non_order_only_deps_range(&self) -> Range<usize> {
        0..(self.inputs.len() - self.order_only_deps)
    }

    pub fn order_only_deps_range(&self) -> Range<usize> {
        (self.inputs.len() - self.order_only_deps)..self.inputs.len()
    }

    // There are two types of outputs.
    // 1) explicit outs, which show up as $out on the command line;
    // 2) implicit outs, which the target generates but are not part of $out.
    // These are stored in outputs in that order, and we keep a count of
    // #2 to use when we need to access the various subsets.
    pub fn explicit_outs_range(&self) -> Range<usize> {
        0..(self.outputs.len() - self.implicit_outs)
    }

    pub fn implicit_outs_range(&self) -> Range<usize> {
        (self.outputs.len() - self.implicit_outs)..self.outputs.len()
    }

    /// Returns the shell-escaped value of |key|.
    pub fn get_binding(&self, node_state: &NodeState, key: &str) -> String {
        let env = EdgeEnv::new(self, node_state, EdgeEnvEscapeKind::ShellEscape);
        env.lookup_variable(key).into_owned()
    }

    pub fn get_binding_bool(&self, node_state: &NodeState, key: &str) -> bool {
        !self.get_binding(node_state, key).is_empty()
    }

    /// Like get_binding("depfile"), but without shell escaping.
    pub fn get_unescaped_depfile(&self, node_state: &NodeState) -> String {
        let env = EdgeEnv::new(self, node_state, EdgeEnvEscapeKind::DoNotEscape);
        env.lookup_variable("depfile").into_owned()
    }

    /// Like get_binding("rspfile"), but without shell escaping.
    pub fn get_unescaped_rspfile(&self, node_state: &NodeState) -> String {
        let env = EdgeEnv::new(self, node_state, EdgeEnvEscapeKind::DoNotEscape);
        env.lookup_variable("rspfile").into_owned()
    }

    pub fn is_phony(&self) -> bool {
        self.rule.name() == PHONY_RULE_NAME
    }

    pub fn use_console(&self) -> bool {
        self.pool().borrow().name() == CONSOLE_POOL_NAME
    }

    /// Expand all variables in a command and return it as a string.
    pub fn evaluate_command(&self, node_state: &NodeState) -> String {
        self.evaluate_command_with_rsp_file(node_state, false)
    }

    /// If incl_rsp_file is enabled, the result also contains the full
    /// contents of a response file (if applicable), so that a change in
    /// the response file contents changes the command hash.
    pub fn evaluate_command_with_rsp_file(
        &self,
        node_state: &NodeState,
        incl_rsp_file: bool,
    ) -> String {
        let mut command = self.get_binding(node_state, "command");
        if incl_rsp_file {
            let rspfile_content = self.get_binding(node_state, "rspfile_content");
            if !rspfile_content.is_empty() {
                command.push_str(";rspfile=");
                command.push_str(&rspfile_content);
            }
        }
        command
    }

    pub fn maybe_phonycycle_diagnostic(&self) -> bool {
        // CMake 2.8.12.x and 3.0.x produced self-referencing phony rules
        // of the form "build a: phony ... a ...".  Restrict our
        // "phonycycle" diagnostic option to the form it used.
        self.is_phony()
            && self.outputs.len() == 1
            && self.implicit_outs == 0
            && self.implicit_deps == 0
    }

    /// Return true if all inputs' in-edges are ready.
    pub fn all_inputs_ready(&self, state: &State) -> bool {
        for input_idx in &self.inputs {
            if let Some(in_edge) = state.node_state.get_node(*input_idx).in_edge() {
                if !state.edge_state.get_edge(in_edge).outputs_ready() {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Clone, Copy, PartialEq)]
enum EdgeEnvEscapeKind {
    ShellEscape,
    DoNotEscape,
}

/// An Env for an Edge, providing $in and $out.
struct EdgeEnv<'a, 'b> {
    lookups: RefCell<Vec<String>>,
    edge: &'a Edge,
    node_state: &'b NodeState,
    escape_in_out: EdgeEnvEscapeKind,
    recursive: Cell<bool>,
}

impl<'a, 'b> EdgeEnv<'a, 'b> {
    fn new(edge: &'a Edge, node_state: &'b NodeState, escape: EdgeEnvEscapeKind) -> Self {
        EdgeEnv {
            lookups: RefCell::new(Vec::new()),
            edge,
            node_state,
            escape_in_out: escape,
            recursive: Cell::new(false),
        }
    }

    /// Given a span of Nodes, construct a list of paths suitable for a
    /// command line.
    fn make_path_list(
        node_state: &NodeState,
        nodes: &[NodeIndex],
        sep: char,
        escape_in_out: EdgeEnvEscapeKind,
    ) -> String {
        let mut result = String::new();
        for node_idx in nodes {
            if !result.is_empty() {
                result.push(sep);
            }
            let path = node_state.get_node(*node_idx).path_decanonicalized();
            match escape_in_out {
                EdgeEnvEscapeKind::ShellEscape => {
                    if WINDOWS_PATH {
                        get_win32_escaped_string(&path, &mut result);
                    } else {
                        get_shell_escaped_string(&path, &mut result);
                    }
                }
                EdgeEnvEscapeKind::DoNotEscape => result.push_str(&path),
            }
        }
        result
    }
}

impl<'a, 'b> Env for EdgeEnv<'a, 'b> {
    fn lookup_variable(&self, var: &str) -> Cow<str> {
        if var == "in" || var == "in_newline" {
            let sep = if var == "in" { ' ' } else { '\n' };
            let explicit_deps_range = self.edge.explicit_deps_range();
            return Cow::Owned(EdgeEnv::make_path_list(
                self.node_state,
                &self.edge.inputs[explicit_deps_range],
                sep,
                self.escape_in_out,
            ));
        }
        if var == "out" {
            let explicit_outs_range = self.edge.explicit_outs_range();
            return Cow::Owned(EdgeEnv::make_path_list(
                self.node_state,
                &self.edge.outputs[explicit_outs_range],
                ' ',
                self.escape_in_out,
            ));
        }

        if self.recursive.get() {
            let lookups = self.lookups.borrow();
            if let Some(pos) = lookups.iter().position(|v| v == var) {
                let mut cycle = String::new();
                for it in &lookups[pos..] {
                    cycle.push_str(it);
                    cycle.push_str(" -> ");
                }
                cycle.push_str(var);
                fatal!("cycle in rule variables: {}", cycle);
            }
        }

        // See notes on BindingEnv::lookup_with_fallback.
        let eval = self.edge.rule.get_binding(var);
        if self.recursive.get() && eval.is_some() {
            self.lookups.borrow_mut().push(var.to_owned());
        }

        // In practice, variables defined on rules never use another rule
        // variable.  For performance, only start checking for cycles after
        // the first lookup.
        self.recursive.set(true);
        Cow::Owned(self.edge.env.borrow().lookup_with_fallback(var, eval, self))
    }
}

/// ImplicitDepLoader loads implicit dependencies, as referenced via the
/// "depfile" attribute in build files or recorded deps in the build log.
pub struct ImplicitDepLoader<'a> {
    build_log: Option<&'a BuildLog>,
    disk_interface: &'a dyn DiskInterface,
    explain: bool,
}

impl<'a> ImplicitDepLoader<'a> {
    pub fn new(
        build_log: Option<&'a BuildLog>,
        disk_interface: &'a dyn DiskInterface,
        explain: bool,
    ) -> Self {
        ImplicitDepLoader {
            build_log,
            disk_interface,
            explain,
        }
    }

    pub fn build_log(&self) -> Option<&'a BuildLog> {
        self.build_log
    }

    /// Load implicit dependencies for |edge_idx|.
    /// Returns Ok(false) when info is just missing or out of date: the
    /// edge must be rebuilt to regenerate it.
    pub fn load_deps(&self, state: &mut State, edge_idx: EdgeIndex) -> Result<bool, String> {
        let deps_type = {
            let edge = state.edge_state.get_edge(edge_idx);
            edge.get_binding(&state.node_state, "deps")
        };
        if !deps_type.is_empty() {
            return self.load_deps_from_log(state, edge_idx);
        }

        let depfile = {
            let edge = state.edge_state.get_edge(edge_idx);
            edge.get_unescaped_depfile(&state.node_state)
        };
        if !depfile.is_empty() {
            return self.load_dep_file(state, edge_idx, &depfile);
        }

        // No deps to load.
        Ok(true)
    }

    /// Load implicit dependencies for |edge_idx| from a depfile attribute.
    fn load_dep_file(
        &self,
        state: &mut State,
        edge_idx: EdgeIndex,
        path: &str,
    ) -> Result<bool, String> {
        // Read depfile content.  Treat a missing depfile as empty.
        let mut content = Vec::new();
        match self.disk_interface.read_file(path, &mut content) {
            Ok(()) => {}
            Err(FileReaderError::NotFound(_)) => content.clear(),
            Err(FileReaderError::OtherError(err)) => {
                return Err(format!("loading '{}': {}", path, err));
            }
        }
        if content.is_empty() {
            explain!(self.explain, "depfile '{}' is missing", path);
            return Ok(false);
        }

        let content = String::from_utf8_lossy(&content);
        let depfile =
            DepfileParser::parse(&content).map_err(|err| format!("{}: {}", path, err))?;

        let first_out = match depfile.outs.first() {
            Some(out) => {
                canonicalize_path(out)
                    .map_err(|err| format!("{}: {}", path, err))?
                    .0
            }
            None => String::new(),
        };

        // Check that this depfile matches the edge's output; if not the
        // edge is dirty.
        let opath = {
            let output_idx = state.edge_state.get_edge(edge_idx).outputs[0];
            state.node_state.get_node(output_idx).path().to_owned()
        };
        if opath != first_out {
            explain!(
                self.explain,
                "expected depfile '{}' to mention '{}', got '{}'",
                path,
                opath,
                first_out
            );
            return Ok(false);
        }

        let mut dep_nodes = Vec::with_capacity(depfile.ins.len());
        for input in &depfile.ins {
            let (canonical, slash_bits) =
                canonicalize_path(input).map_err(|err| format!("{}: {}", path, err))?;
            dep_nodes.push(state.node_state.prepare_node(&canonical, slash_bits));
        }

        self.insert_implicit_deps(state, edge_idx, &dep_nodes);
        Ok(true)
    }

    /// Load implicit dependencies for |edge_idx| from the build log.
    fn load_deps_from_log(&self, state: &mut State, edge_idx: EdgeIndex) -> Result<bool, String> {
        // NOTE: deps are only supported for single-target edges.
        let output_idx = state.edge_state.get_edge(edge_idx).outputs[0];
        let deps = {
            let output = state.node_state.get_node(output_idx);
            let deps = self.build_log.and_then(|log| log.get_deps(output));
            let deps = match deps {
                None => {
                    explain!(self.explain, "deps for '{}' are missing", output.path());
                    return Ok(false);
                }
                Some(deps) => deps,
            };

            // Deps are invalid if the output is newer than the deps.
            if output.mtime() > deps.mtime {
                explain!(
                    self.explain,
                    "stored deps info out of date for '{}' ({} vs {})",
                    output.path(),
                    deps.mtime,
                    output.mtime()
                );
                return Ok(false);
            }

            deps.nodes.clone()
        };

        self.insert_implicit_deps(state, edge_idx, &deps);
        Ok(true)
    }

    /// Append |deps| to the edge's implicit input range, wiring up node
    /// back-references and phony in-edges for previously unknown files.
    fn insert_implicit_deps(&self, state: &mut State, edge_idx: EdgeIndex, deps: &[NodeIndex]) {
        let insert_at = {
            let edge = state.edge_state.get_edge(edge_idx);
            edge.inputs.len() - edge.order_only_deps
        };
        {
            let edge = state.edge_state.get_edge_mut(edge_idx);
            edge.inputs.splice(insert_at..insert_at, deps.iter().cloned());
            edge.implicit_deps += deps.len();
        }
        for &dep in deps {
            state.node_state.get_node_mut(dep).add_out_edge(edge_idx);
            self.create_phony_in_edge(state, dep);
        }
    }

    /// If we don't have an edge that generates this input already, create
    /// one; this makes us not abort if the input is missing, but instead
    /// will rebuild in that circumstance.
    fn create_phony_in_edge(&self, state: &mut State, node_idx: NodeIndex) {
        if state.node_state.get_node(node_idx).in_edge().is_some() {
            return;
        }

        let phony_rule = state.phony_rule();
        let pool = state.default_pool();
        let env = state.bindings.clone();
        let phony_edge_idx = state.edge_state.make_edge(phony_rule, pool, env);
        state
            .node_state
            .get_node_mut(node_idx)
            .set_in_edge(Some(phony_edge_idx));
        let edge = state.edge_state.get_edge_mut(phony_edge_idx);
        edge.outputs.push(node_idx);

        // recompute_dirty might not visit phony_edge if a previous call
        // had already caused the file to be stat'ed.  Because previous
        // invocations would have seen this node without an in-edge (and
        // therefore ready), set outputs_ready to true to avoid a
        // potential stuck build.  If recompute_dirty does visit this
        // edge, it will simply overwrite the value.
        edge.outputs_ready = true;
    }
}

/// DependencyScan manages the process of scanning the files in a graph
/// and updating the dirty/outputs_ready state of all the nodes and edges.
pub struct DependencyScan<'a> {
    build_log: Option<&'a BuildLog>,
    disk_interface: &'a dyn DiskInterface,
    dep_loader: ImplicitDepLoader<'a>,
    explain: bool,
}

impl<'a> DependencyScan<'a> {
    pub fn new(
        build_log: Option<&'a BuildLog>,
        disk_interface: &'a dyn DiskInterface,
        explain: bool,
    ) -> Self {
        DependencyScan {
            build_log,
            disk_interface,
            dep_loader: ImplicitDepLoader::new(build_log, disk_interface, explain),
            explain,
        }
    }

    pub fn build_log(&self) -> Option<&'a BuildLog> {
        self.build_log
    }

    /// Update the dirty state of the given node by inspecting its input
    /// edge.  Examine inputs, outputs, and command lines to judge whether
    /// an edge needs to be re-run, and update outputs_ready and each
    /// output's dirty state accordingly.
    pub fn recompute_dirty(&self, state: &mut State, node_idx: NodeIndex) -> Result<(), String> {
        let mut stack = Vec::new();
        self.recompute_dirty_inner(state, node_idx, &mut stack)
    }

    fn recompute_dirty_inner(
        &self,
        state: &mut State,
        node_idx: NodeIndex,
        stack: &mut Vec<NodeIndex>,
    ) -> Result<(), String> {
        let edge_idx = match state.node_state.get_node(node_idx).in_edge() {
            None => {
                let node = state.node_state.get_node_mut(node_idx);
                // If we already visited this leaf node then we are done.
                if node.status_known() {
                    return Ok(());
                }
                // This node has no in-edge; it is dirty if it is missing.
                node.stat_if_necessary(self.disk_interface)?;
                if !node.exists() {
                    explain!(
                        self.explain,
                        "{} has no in-edge and is missing",
                        node.path()
                    );
                }
                let dirty = !node.exists();
                node.set_dirty(dirty);
                return Ok(());
            }
            Some(edge_idx) => edge_idx,
        };

        // If we already finished this edge then we are done.
        if let EdgeVisitMark::VisitDone = state.edge_state.get_edge(edge_idx).mark {
            return Ok(());
        }

        // If we encountered this edge earlier in the call stack we have a
        // cycle.
        self.verify_dag(state, node_idx, stack)?;

        let mut dirty = false;
        let mut outputs_ready = true;
        let mut deps_missing = false;

        // Mark the edge temporarily while in the call stack.
        state.edge_state.get_edge_mut(edge_idx).mark = EdgeVisitMark::VisitInStack;
        stack.push(node_idx);

        // Load output mtimes so we can compare them to the most recent
        // input below.
        for o_idx in state.edge_state.get_edge(edge_idx).outputs.clone() {
            state
                .node_state
                .get_node_mut(o_idx)
                .stat_if_necessary(self.disk_interface)?;
        }

        if !self.dep_loader.load_deps(state, edge_idx)? {
            // Failed to load dependency info: rebuild to regenerate it.
            // load_deps() explained already, no need to do it here.
            dirty = true;
            deps_missing = true;
        }

        let mut most_recent_input: Option<NodeIndex> = None;
        {
            let (order_only_range, inputs) = {
                let edge = state.edge_state.get_edge(edge_idx);
                (edge.order_only_deps_range(), edge.inputs.clone())
            };

            for (i, i_idx) in inputs.into_iter().enumerate() {
                // Visit this input.
                self.recompute_dirty_inner(state, i_idx, stack)?;

                // If an input is not ready, neither are our outputs.
                if let Some(in_edge) = state.node_state.get_node(i_idx).in_edge() {
                    if !state.edge_state.get_edge(in_edge).outputs_ready {
                        outputs_ready = false;
                    }
                }

                if !order_only_range.contains(&i) {
                    // If a regular input is dirty (or missing), we're
                    // dirty.  Otherwise consider mtime.
                    let i_node = state.node_state.get_node(i_idx);
                    if i_node.is_dirty() {
                        explain!(self.explain, "{} is dirty", i_node.path());
                        dirty = true;
                    } else {
                        let newer = match most_recent_input {
                            Some(prev_idx) => {
                                i_node.mtime() > state.node_state.get_node(prev_idx).mtime()
                            }
                            None => true,
                        };
                        if newer {
                            most_recent_input = Some(i_idx);
                        }
                    }
                }
            }
        }

        // We may also be dirty due to output state: missing outputs, out
        // of date outputs, etc.  Visit all outputs and determine whether
        // they're dirty.
        if !dirty {
            dirty = self.recompute_outputs_dirty(state, edge_idx, most_recent_input)?;
        }

        if dirty {
            // Finally, visit each output and update their dirty state if
            // necessary.
            for o_idx in state.edge_state.get_edge(edge_idx).outputs.clone() {
                state.node_state.get_node_mut(o_idx).mark_dirty();
            }

            // If an edge is dirty, its outputs are normally not ready.
            // (It's possible to be clean but still not be ready in the
            // presence of order-only inputs.)  But phony edges with no
            // inputs have nothing to do, so are always ready.
            let edge = state.edge_state.get_edge(edge_idx);
            if !(edge.is_phony() && edge.inputs.is_empty()) {
                outputs_ready = false;
            }
        }

        let edge = state.edge_state.get_edge_mut(edge_idx);
        edge.deps_missing = deps_missing;
        edge.outputs_ready = outputs_ready;

        // Mark the edge as finished during this walk now that it will no
        // longer be in the call stack.
        edge.mark = EdgeVisitMark::VisitDone;
        debug_assert!(stack.last() == Some(&node_idx));
        stack.pop();
        Ok(())
    }

    fn verify_dag(
        &self,
        state: &State,
        node_idx: NodeIndex,
        stack: &mut Vec<NodeIndex>,
    ) -> Result<(), String> {
        let edge_idx = state
            .node_state
            .get_node(node_idx)
            .in_edge()
            .expect("verify_dag is only called for nodes with in-edges");

        // If we have no temporary mark on the edge then we do not yet have
        // a cycle.
        match state.edge_state.get_edge(edge_idx).mark {
            EdgeVisitMark::VisitInStack => {}
            _ => return Ok(()),
        }

        // We have this edge earlier in the call stack.  Find it.
        let mut start = 0;
        while start < stack.len() {
            if state.node_state.get_node(stack[start]).in_edge() == Some(edge_idx) {
                break;
            }
            start += 1;
        }
        assert!(start < stack.len());

        // Make the cycle clear by reporting its start as the node at its
        // end instead of some other output of the starting edge.  For
        // example, running 'majak b' on
        //   build a b: cat c
        //   build c: cat a
        // should report a -> c -> a instead of b -> c -> a.
        stack[start] = node_idx;

        // Construct the error message rejecting the cycle.
        let mut err = "dependency cycle: ".to_owned();
        for iter_idx in &stack[start..] {
            err += state.node_state.get_node(*iter_idx).path();
            err += " -> ";
        }
        err += state.node_state.get_node(node_idx).path();

        if start + 1 == stack.len()
            && state
                .edge_state
                .get_edge(edge_idx)
                .maybe_phonycycle_diagnostic()
        {
            // The manifest parser would have filtered out the
            // self-referencing input if it were not configured to allow
            // the error.
            err += " [-w phonycycle=err]";
        }

        Err(err)
    }

    /// Recompute whether any output of the edge is dirty.
    /// Public so that restat cleanliness propagation can re-check outputs
    /// against a refreshed most recent input.
    pub fn recompute_outputs_dirty(
        &self,
        state: &State,
        edge_idx: EdgeIndex,
        most_recent_input: Option<NodeIndex>,
    ) -> Result<bool, String> {
        let edge = state.edge_state.get_edge(edge_idx);
        let command = edge.evaluate_command_with_rsp_file(&state.node_state, true);
        for output in &edge.outputs {
            if self.recompute_output_dirty(state, edge, most_recent_input, &command, *output) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Recompute whether a given single output should be marked dirty.
    fn recompute_output_dirty(
        &self,
        state: &State,
        edge: &Edge,
        most_recent_input: Option<NodeIndex>,
        command: &str,
        output_idx: NodeIndex,
    ) -> bool {
        let output = state.node_state.get_node(output_idx);

        if edge.is_phony() {
            // Phony edges don't write any output.  Outputs are only dirty
            // if there are no inputs and we're missing the output.
            if edge.inputs.is_empty() && !output.exists() {
                explain!(
                    self.explain,
                    "output {} of phony edge with no inputs doesn't exist",
                    output.path()
                );
                return true;
            }
            return false;
        }

        // Dirty if we're missing the output.
        if !output.exists() {
            explain!(self.explain, "output {} doesn't exist", output.path());
            return true;
        }

        let mut entry = None;
        let mut looked_up_entry = false;

        // Dirty if the output is older than the input.
        if let Some(most_recent_input_idx) = most_recent_input {
            let most_recent_input = state.node_state.get_node(most_recent_input_idx);
            if output.mtime() < most_recent_input.mtime() {
                let mut output_mtime = output.mtime();

                // If this is a restat rule, we may have cleaned the output
                // with a restat rule in a previous run and stored the most
                // recent input mtime in the build log.  Use that mtime
                // instead, so that the file will only be considered dirty
                // if an input was modified since the previous run.
                let mut used_restat = false;
                if edge.get_binding_bool(&state.node_state, "restat") {
                    if let Some(build_log) = self.build_log {
                        entry = build_log.lookup_by_output(output.path());
                        looked_up_entry = true;
                        if let Some(found_entry) = entry {
                            output_mtime = found_entry.mtime;
                            used_restat = true;
                        }
                    }
                }

                if output_mtime < most_recent_input.mtime() {
                    explain!(
                        self.explain,
                        "{}output {} older than most recent input {} ({} vs {})",
                        if used_restat { "restat of " } else { "" },
                        output.path(),
                        most_recent_input.path(),
                        output_mtime,
                        most_recent_input.mtime()
                    );
                    return true;
                }
            }
        }

        if let Some(build_log) = self.build_log {
            let generator = edge.get_binding_bool(&state.node_state, "generator");
            if !looked_up_entry {
                entry = build_log.lookup_by_output(output.path());
            }
            if let Some(found_entry) = entry {
                if !generator && hash_command(command) != found_entry.command_hash {
                    // May also be dirty due to the command changing since
                    // the last build.  But if this is a generator rule,
                    // the command changing does not make us dirty.
                    explain!(self.explain, "command line changed for {}", output.path());
                    return true;
                }
            }
            if entry.is_none() && !generator {
                explain!(
                    self.explain,
                    "command line not found in log for {}",
                    output.path()
                );
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::TestWithStateAndVFS;

    struct GraphTest {
        t: TestWithStateAndVFS,
    }

    impl GraphTest {
        fn new() -> Self {
            GraphTest {
                t: TestWithStateAndVFS::new_with_builtin_rule(),
            }
        }

        fn recompute_dirty(&mut self, path: &str) -> Result<(), String> {
            let node_idx = self.t.node(path);
            let scan = DependencyScan::new(None, &self.t.fs, false);
            scan.recompute_dirty(&mut self.t.state, node_idx)
        }

        fn dirty(&self, path: &str) -> bool {
            let node_idx = self
                .t
                .state
                .node_state
                .lookup_node(path)
                .expect("node exists");
            self.t.state.node_state.get_node(node_idx).is_dirty()
        }
    }

    #[test]
    fn graph_missing_implicit() {
        let mut g = GraphTest::new();
        g.t.assert_parse("build out: cat in | implicit\n");
        g.t.fs.create("in", "");
        g.t.fs.create("out", "");

        g.recompute_dirty("out").unwrap();

        // A missing implicit dep *should* make the output dirty.
        // (In fact, a build will fail.)
        assert!(g.dirty("out"));
    }

    #[test]
    fn graph_modified_implicit() {
        let mut g = GraphTest::new();
        g.t.assert_parse("build out: cat in | implicit\n");
        g.t.fs.create("in", "");
        g.t.fs.create("out", "");
        g.t.fs.tick();
        g.t.fs.create("implicit", "");

        g.recompute_dirty("out").unwrap();

        // A modified implicit dep should make the output dirty.
        assert!(g.dirty("out"));
    }

    #[test]
    fn graph_funky_makefile_path() {
        let mut g = GraphTest::new();
        g.t.assert_parse(concat!(
            "rule catdep\n",
            "  depfile = $out.d\n",
            "  command = cat $in > $out\n",
            "build out.o: catdep foo.cc\n",
        ));
        g.t.fs.create("foo.cc", "");
        g.t.fs.create("out.o.d", "out.o: ./foo/../implicit.h\n");
        g.t.fs.create("out.o", "");
        g.t.fs.tick();
        g.t.fs.create("implicit.h", "");

        g.recompute_dirty("out.o").unwrap();

        // implicit.h has changed, though our depfile refers to it with a
        // non-canonical path; we should still find it.
        assert!(g.dirty("out.o"));
    }

    #[test]
    fn graph_explicit_implicit() {
        let mut g = GraphTest::new();
        g.t.assert_parse(concat!(
            "rule catdep\n",
            "  depfile = $out.d\n",
            "  command = cat $in > $out\n",
            "build implicit.h: cat data\n",
            "build out.o: catdep foo.cc || implicit.h\n",
        ));
        g.t.fs.create("implicit.h", "");
        g.t.fs.create("foo.cc", "");
        g.t.fs.create("out.o.d", "out.o: implicit.h\n");
        g.t.fs.create("out.o", "");
        g.t.fs.tick();
        g.t.fs.create("data", "");

        g.recompute_dirty("out.o").unwrap();

        // We have both an implicit and an explicit dep on implicit.h.
        // The implicit dep should "win" (in the sense that it should cause
        // the output to be dirty).
        assert!(g.dirty("out.o"));
    }

    #[test]
    fn graph_implicit_output_parse() {
        let mut g = GraphTest::new();
        g.t.assert_parse("build out | out.imp: cat in\n");

        let out = g.t.node("out");
        let edge_idx = g.t.state.node_state.get_node(out).in_edge().unwrap();
        let edge = g.t.state.edge_state.get_edge(edge_idx);
        assert_eq!(2, edge.outputs.len());
        assert_eq!("out", g.t.state.node_state.get_node(edge.outputs[0]).path());
        assert_eq!(
            "out.imp",
            g.t.state.node_state.get_node(edge.outputs[1]).path()
        );
        assert_eq!(1, edge.implicit_outs);
        let out_imp = g.t.node("out.imp");
        assert_eq!(
            Some(edge_idx),
            g.t.state.node_state.get_node(out_imp).in_edge()
        );
    }

    #[test]
    fn graph_implicit_output_out_of_date() {
        let mut g = GraphTest::new();
        g.t.assert_parse("build out | out.imp: cat in\n");
        g.t.fs.create("out.imp", "");
        g.t.fs.tick();
        g.t.fs.create("in", "");
        g.t.fs.create("out", "");

        g.recompute_dirty("out").unwrap();

        assert!(g.dirty("out"));
        assert!(g.dirty("out.imp"));
    }

    #[test]
    fn graph_path_with_current_directory() {
        let mut g = GraphTest::new();
        g.t.assert_parse(concat!(
            "rule catdep\n",
            "  depfile = $out.d\n",
            "  command = cat $in > $out\n",
            "build ./out.o: catdep ./foo.cc\n",
        ));
        g.t.fs.create("foo.cc", "");
        g.t.fs.create("out.o.d", "out.o: foo.cc\n");
        g.t.fs.create("out.o", "");

        g.recompute_dirty("out.o").unwrap();

        assert!(!g.dirty("out.o"));
    }

    #[test]
    fn graph_root_nodes() {
        let mut g = GraphTest::new();
        g.t.assert_parse(concat!(
            "build out1: cat in1\n",
            "build mid1: cat in1\n",
            "build out2: cat mid1\n",
            "build out3 out4: cat mid1\n",
        ));

        let root_nodes = g.t.state.root_nodes().unwrap();
        assert_eq!(4, root_nodes.len());
        for idx in root_nodes {
            let name = g.t.state.node_state.get_node(idx).path();
            assert!(name.starts_with("out"));
        }
    }

    #[cfg(not(windows))]
    #[test]
    fn graph_var_in_out_path_escaping() {
        let mut g = GraphTest::new();
        g.t.assert_parse("build a$ b: cat no'space with$ space$$ no\"space2\n");

        let out = g.t.node("a b");
        let edge_idx = g.t.state.node_state.get_node(out).in_edge().unwrap();
        let edge = g.t.state.edge_state.get_edge(edge_idx);
        assert_eq!(
            "cat 'no'\\''space' 'with space$' 'no\"space2' > 'a b'",
            edge.evaluate_command(&g.t.state.node_state)
        );
    }

    #[test]
    fn graph_depfile_with_canonicalizable_path() {
        let mut g = GraphTest::new();
        g.t.assert_parse(concat!(
            "rule catdep\n",
            "  depfile = $out.d\n",
            "  command = cat $in > $out\n",
            "build ./out.o: catdep ./foo.cc\n",
        ));
        g.t.fs.create("foo.cc", "");
        g.t.fs.create("out.o.d", "out.o: bar/../foo.cc\n");
        g.t.fs.create("out.o", "");

        g.recompute_dirty("out.o").unwrap();

        assert!(!g.dirty("out.o"));
    }

    #[test]
    fn graph_depfile_removed() {
        let mut g = GraphTest::new();
        g.t.assert_parse(concat!(
            "rule catdep\n",
            "  depfile = $out.d\n",
            "  command = cat $in > $out\n",
            "build ./out.o: catdep ./foo.cc\n",
        ));
        g.t.fs.create("foo.h", "");
        g.t.fs.create("foo.cc", "");
        g.t.fs.tick();
        g.t.fs.create("out.o.d", "out.o: foo.h\n");
        g.t.fs.create("out.o", "");

        g.recompute_dirty("out.o").unwrap();
        assert!(!g.dirty("out.o"));

        g.t.state.reset();
        g.t.fs.remove_file("out.o.d").unwrap();
        g.recompute_dirty("out.o").unwrap();
        assert!(g.dirty("out.o"));
    }

    #[test]
    fn graph_rule_variables_in_scope() {
        let mut g = GraphTest::new();
        g.t.assert_parse(concat!(
            "rule r\n",
            "  depfile = x\n",
            "  command = depfile is $depfile\n",
            "build out: r in\n",
        ));
        let out = g.t.node("out");
        let edge_idx = g.t.state.node_state.get_node(out).in_edge().unwrap();
        let edge = g.t.state.edge_state.get_edge(edge_idx);
        assert_eq!(
            "depfile is x",
            edge.evaluate_command(&g.t.state.node_state)
        );
    }

    #[test]
    fn graph_depfile_override() {
        let mut g = GraphTest::new();
        g.t.assert_parse(concat!(
            "rule r\n",
            "  depfile = x\n",
            "  command = unused\n",
            "build out: r in\n",
            "  depfile = y\n",
        ));
        let out = g.t.node("out");
        let edge_idx = g.t.state.node_state.get_node(out).in_edge().unwrap();
        let edge = g.t.state.edge_state.get_edge(edge_idx);
        assert_eq!("y", edge.get_binding(&g.t.state.node_state, "depfile"));
    }

    #[test]
    fn graph_depfile_override_parent() {
        let mut g = GraphTest::new();
        g.t.assert_parse(concat!(
            "rule r\n",
            "  depfile = x\n",
            "  command = depfile is $depfile\n",
            "build out: r in\n",
            "  depfile = y\n",
        ));
        let out = g.t.node("out");
        let edge_idx = g.t.state.node_state.get_node(out).in_edge().unwrap();
        let edge = g.t.state.edge_state.get_edge(edge_idx);
        assert_eq!(
            "depfile is y",
            edge.get_binding(&g.t.state.node_state, "command")
        );
    }

    #[test]
    fn graph_dependency_cycle() {
        let mut g = GraphTest::new();
        g.t.assert_parse(concat!(
            "build out: cat mid\n",
            "build mid: cat in\n",
            "build in: cat pre\n",
            "build pre: cat out\n",
        ));

        assert_eq!(
            Err("dependency cycle: out -> mid -> in -> pre -> out".to_owned()),
            g.recompute_dirty("out")
        );
    }

    #[test]
    fn graph_cycle_in_edges_but_not_in_nodes() {
        let mut g = GraphTest::new();
        g.t.assert_parse("build a b: cat a\n");
        assert_eq!(
            Err("dependency cycle: a -> a".to_owned()),
            g.recompute_dirty("b")
        );

        let mut g = GraphTest::new();
        g.t.assert_parse("build b a: cat a\n");
        assert_eq!(
            Err("dependency cycle: a -> a".to_owned()),
            g.recompute_dirty("b")
        );

        let mut g = GraphTest::new();
        g.t.assert_parse("build a b: cat c\nbuild c: cat a\n");
        assert_eq!(
            Err("dependency cycle: a -> c -> a".to_owned()),
            g.recompute_dirty("b")
        );

        let mut g = GraphTest::new();
        g.t.assert_parse(concat!(
            "build d: cat c\n",
            "build c: cat b\n",
            "build b: cat a\n",
            "build a e: cat d\n",
            "build f: cat e\n",
        ));
        assert_eq!(
            Err("dependency cycle: a -> d -> c -> b -> a".to_owned()),
            g.recompute_dirty("f")
        );
    }

    #[test]
    fn graph_cycle_with_length_zero_from_depfile() {
        let mut g = GraphTest::new();
        g.t.assert_parse(concat!(
            "rule deprule\n",
            "   depfile = dep.d\n",
            "   command = unused\n",
            "build a b: deprule\n",
        ));
        g.t.fs.create("dep.d", "a: b\n");

        assert_eq!(
            Err("dependency cycle: b -> b".to_owned()),
            g.recompute_dirty("a")
        );

        // Despite the depfile causing the edge to be a cycle (it has
        // outputs a and b, but the depfile also adds b as an input), the
        // deps should have been loaded only once.
        let a = g.t.node("a");
        let edge_idx = g.t.state.node_state.get_node(a).in_edge().unwrap();
        let edge = g.t.state.edge_state.get_edge(edge_idx);
        assert_eq!(1, edge.inputs.len());
        assert_eq!("b", g.t.state.node_state.get_node(edge.inputs[0]).path());
    }

    #[test]
    fn graph_cycle_with_length_one_from_depfile() {
        let mut g = GraphTest::new();
        g.t.assert_parse(concat!(
            "rule deprule\n",
            "   depfile = dep.d\n",
            "   command = unused\n",
            "rule r\n",
            "   command = unused\n",
            "build a b: deprule\n",
            "build c: r b\n",
        ));
        g.t.fs.create("dep.d", "a: c\n");

        assert_eq!(
            Err("dependency cycle: b -> c -> b".to_owned()),
            g.recompute_dirty("a")
        );

        let a = g.t.node("a");
        let edge_idx = g.t.state.node_state.get_node(a).in_edge().unwrap();
        let edge = g.t.state.edge_state.get_edge(edge_idx);
        assert_eq!(1, edge.inputs.len());
        assert_eq!("c", g.t.state.node_state.get_node(edge.inputs[0]).path());
    }

    #[test]
    fn graph_phony_self_reference_error() {
        use crate::manifest_parser::{ManifestParserOptions, PhonyCycleAction};

        let mut g = GraphTest::new();
        let options = ManifestParserOptions {
            phony_cycle_action: PhonyCycleAction::Error,
            ..Default::default()
        };
        g.t.assert_parse_with_options("build a: phony a\n", options);

        assert_eq!(
            Err("dependency cycle: a -> a [-w phonycycle=err]".to_owned()),
            g.recompute_dirty("a")
        );
    }
}
