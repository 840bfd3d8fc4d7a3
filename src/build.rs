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

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use crate::build_log::BuildLog;
use crate::clparser::CLParser;
use crate::depfile_parser::DepfileParser;
use crate::disk_interface::{DiskInterface, FileReaderError};
use crate::exit_status::ExitStatus;
use crate::graph::{DependencyScan, EdgeIndex, NodeIndex};
use crate::line_printer::{LinePrinter, LinePrinterLineType};
use crate::metrics::Stopwatch;
use crate::state::State;
use crate::timestamp::TimeStamp;
use crate::utils::{canonicalize_path, get_load_average, strip_ansi_escape_codes};

#[derive(Clone, Copy, PartialEq)]
pub enum BuildConfigVerbosity {
    Normal,
    /// No output -- used when testing.
    Quiet,
    Verbose,
}

/// Options (e.g. verbosity, parallelism) passed to a build.
pub struct BuildConfig {
    pub verbosity: BuildConfigVerbosity,
    pub dry_run: bool,
    pub parallelism: usize,
    pub failures_allowed: usize,
    /// The maximum load average we must not exceed.  A negative or zero
    /// value means that we do not have any limit.
    pub max_load_average: f64,
    // Per-run debug switches (-d explain, -d keeprsp, -d keepdepfile).
    pub explain: bool,
    pub keep_rsp: bool,
    pub keep_depfile: bool,
}

impl BuildConfig {
    pub fn new() -> Self {
        BuildConfig {
            verbosity: BuildConfigVerbosity::Normal,
            dry_run: false,
            parallelism: 1,
            failures_allowed: 1,
            max_load_average: -0.0,
            explain: false,
            keep_rsp: false,
            keep_depfile: false,
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig::new()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum EdgeStatus {
    Started,
    Running,
    Finished,
}

struct RateInfo {
    rate: f64,
    stopwatch: Stopwatch,
}

impl RateInfo {
    fn new() -> Self {
        RateInfo {
            rate: -1.0,
            stopwatch: Stopwatch::new(),
        }
    }

    fn restart(&mut self) {
        self.stopwatch.restart()
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn update_rate(&mut self, update_hint: usize) {
        let elapsed = self.stopwatch.elapsed();
        if elapsed > 0.0 {
            self.rate = update_hint as f64 / elapsed;
        }
    }
}

struct SlidingRateInfo {
    rate: f64,
    max_len: usize,
    times: VecDeque<f64>,
    last_update: Option<usize>,
    stopwatch: Stopwatch,
}

impl SlidingRateInfo {
    fn new(n: usize) -> Self {
        SlidingRateInfo {
            rate: -1.0,
            max_len: n.max(1),
            times: VecDeque::new(),
            last_update: None,
            stopwatch: Stopwatch::new(),
        }
    }

    fn restart(&mut self) {
        self.stopwatch.restart()
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn update_rate(&mut self, update_hint: usize) {
        if self.last_update == Some(update_hint) {
            return;
        }
        self.last_update = Some(update_hint);

        if self.times.len() == self.max_len {
            self.times.pop_front();
        }
        self.times.push_back(self.stopwatch.elapsed());
        let (front, back) = (
            *self.times.front().unwrap(),
            *self.times.back().unwrap(),
        );
        if back != front {
            self.rate = self.times.len() as f64 / (back - front);
        }
    }
}

/// Tracks the status of a build: completion fraction, printing updates.
pub struct BuildStatus {
    verbosity: BuildConfigVerbosity,
    start_time: Instant,
    started_edges: usize,
    finished_edges: usize,
    total_edges: usize,

    /// Map of running edge to time the edge started running.
    running_edges: HashMap<EdgeIndex, i32>,

    /// The custom progress status format to use.
    progress_status_format: String,

    overall_rate: RateInfo,
    current_rate: SlidingRateInfo,

    printer: LinePrinter,
}

impl BuildStatus {
    pub fn new(config: &BuildConfig) -> Self {
        let mut printer = LinePrinter::new();
        // Don't do anything fancy in verbose mode.
        if config.verbosity != BuildConfigVerbosity::Normal {
            printer.set_smart_terminal(false);
        }

        let progress_status_format =
            std::env::var("MAJAK_STATUS").unwrap_or_else(|_| "[%f/%t] ".to_owned());

        BuildStatus {
            verbosity: config.verbosity,
            start_time: Instant::now(),
            started_edges: 0,
            finished_edges: 0,
            total_edges: 0,
            running_edges: HashMap::new(),
            progress_status_format,
            overall_rate: RateInfo::new(),
            current_rate: SlidingRateInfo::new(config.parallelism),
            printer,
        }
    }

    pub fn plan_has_total_edges(&mut self, total: usize) {
        self.total_edges = total;
    }

    fn elapsed_millis(&self) -> i32 {
        self.start_time.elapsed().as_millis() as i32
    }

    pub fn build_started(&mut self) {
        self.overall_rate.restart();
        self.current_rate.restart();
    }

    pub fn build_finished(&mut self) {
        self.printer.set_console_locked(false);
        self.printer.print_on_new_line("");
    }

    pub fn build_edge_started(&mut self, state: &State, edge_idx: EdgeIndex) {
        let start_time = self.elapsed_millis();
        self.running_edges.insert(edge_idx, start_time);
        self.started_edges += 1;

        let use_console = state.edge_state.get_edge(edge_idx).use_console();
        if use_console || self.printer.is_smart_terminal() {
            self.print_status(state, edge_idx, EdgeStatus::Started);
        }
        if use_console {
            self.printer.set_console_locked(true);
        }
    }

    /// Returns the (start, end) times of the edge, in milliseconds since
    /// the start of the build.
    pub fn build_edge_finished(
        &mut self,
        state: &State,
        edge_idx: EdgeIndex,
        success: bool,
        output: &str,
    ) -> (i32, i32) {
        self.finished_edges += 1;

        let start_time = self
            .running_edges
            .remove(&edge_idx)
            .unwrap_or_else(|| self.elapsed_millis());
        let end_time = self.elapsed_millis();

        let edge = state.edge_state.get_edge(edge_idx);
        if edge.use_console() {
            self.printer.set_console_locked(false);
        }

        if self.verbosity == BuildConfigVerbosity::Quiet {
            return (start_time, end_time);
        }

        if !edge.use_console() {
            self.print_status(state, edge_idx, EdgeStatus::Finished);
        }

        if self.printer.is_smart_terminal() {
            // Print the oldest still-running edge, so the status line
            // tracks the longest-lived work.
            let oldest = self
                .running_edges
                .iter()
                .min_by_key(|&(_, &start)| start)
                .map(|(&running_edge, _)| running_edge);
            if let Some(oldest) = oldest {
                self.print_status(state, oldest, EdgeStatus::Running);
            }
        }

        // Print the command that is spewing before printing its output.
        if !success {
            let mut outputs = String::new();
            for &out_idx in &edge.outputs {
                outputs += state.node_state.get_node(out_idx).path();
                outputs.push(' ');
            }
            self.printer
                .print_on_new_line(&format!("FAILED: {}\n", outputs));
            self.printer
                .print_on_new_line(&format!("{}\n", edge.evaluate_command(&state.node_state)));
        }

        if !output.is_empty() {
            // Subprocess output goes through a pipe, so some tools (e.g.
            // clang) disable their colored output.  When majak's own
            // output is piped onward, strip any color escape codes that
            // did make it through.
            let final_output = if !self.printer.is_smart_terminal() {
                strip_ansi_escape_codes(output)
            } else {
                output.to_owned()
            };
            self.printer.print_on_new_line(&final_output);
        }

        (start_time, end_time)
    }

    pub fn format_progress_status(&mut self, format: &str, status: EdgeStatusArg) -> String {
        let mut out = String::new();
        let mut chars = format.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => out.push('%'),
                // Started edges.
                Some('s') => out += &self.started_edges.to_string(),
                // Total edges.
                Some('t') => out += &self.total_edges.to_string(),
                // Running edges.
                Some('r') => {
                    let mut running = self.started_edges - self.finished_edges;
                    // Count an edge that just finished as a running edge.
                    if status == EdgeStatusArg::Finished {
                        running += 1;
                    }
                    out += &running.to_string();
                }
                // Unstarted edges.
                Some('u') => {
                    out += &(self.total_edges.saturating_sub(self.started_edges)).to_string()
                }
                // Finished edges.
                Some('f') => out += &self.finished_edges.to_string(),
                // Overall finished edges per second.
                Some('o') => {
                    self.overall_rate.update_rate(self.finished_edges);
                    out += &format_rate(self.overall_rate.rate());
                }
                // Current rate, average over the last '-j' jobs.
                Some('c') => {
                    self.current_rate.update_rate(self.finished_edges);
                    out += &format_rate(self.current_rate.rate());
                }
                // Percentage.
                Some('p') => {
                    let percent = if self.total_edges > 0 {
                        100 * self.finished_edges / self.total_edges
                    } else {
                        0
                    };
                    out += &format!("{:3}%", percent);
                }
                Some('e') => {
                    out += &format!("{:.3}", self.overall_rate.stopwatch.elapsed());
                }
                other => {
                    fatal!(
                        "unknown placeholder '%{}' in $MAJAK_STATUS",
                        other.map(String::from).unwrap_or_default()
                    );
                }
            }
        }
        out
    }

    fn print_status(&mut self, state: &State, edge_idx: EdgeIndex, status: EdgeStatus) {
        if self.verbosity == BuildConfigVerbosity::Quiet {
            return;
        }

        let force_full_command = self.verbosity == BuildConfigVerbosity::Verbose;

        let edge = state.edge_state.get_edge(edge_idx);
        let mut to_print = edge.get_binding(&state.node_state, "description");
        if to_print.is_empty() || force_full_command {
            to_print = edge.get_binding(&state.node_state, "command");
        }

        let status_arg = match status {
            EdgeStatus::Finished => EdgeStatusArg::Finished,
            _ => EdgeStatusArg::Other,
        };
        let format = self.progress_status_format.clone();
        let to_print = self.format_progress_status(&format, status_arg) + &to_print;

        self.printer.print(
            &to_print,
            if force_full_command {
                LinePrinterLineType::Full
            } else {
                LinePrinterLineType::Elide
            },
        );
    }
}

/// Whether the edge being formatted just finished; affects the %r count.
#[derive(Clone, Copy, PartialEq)]
pub enum EdgeStatusArg {
    Finished,
    Other,
}

fn format_rate(rate: f64) -> String {
    if rate == -1.0 {
        "?".to_owned()
    } else {
        format!("{:.1}", rate)
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum Want {
    /// We do not want to build the edge, but we might want to build one of
    /// its dependents.
    Nothing,
    /// We want to build the edge, but have not yet scheduled it.
    ToStart,
    /// We want to build the edge, have scheduled it, and are waiting for
    /// it to complete.
    ToFinish,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum EdgeResult {
    Failed,
    Succeeded,
}

/// Plan stores the state of a build plan: what we intend to build,
/// which steps we're ready to execute.
pub struct Plan {
    /// Keep track of which edges we want to build in this plan.  If the
    /// entry maps to Nothing, we do not want to build the edge itself, but
    /// we might want to build one of its dependents.
    want: HashMap<EdgeIndex, Want>,

    ready: BTreeSet<EdgeIndex>,

    /// Total number of edges that have commands (not phony).
    command_edges: usize,

    /// Total remaining number of wanted edges.
    wanted_edges: usize,
}

impl Plan {
    pub fn new() -> Self {
        Plan {
            want: HashMap::new(),
            ready: BTreeSet::new(),
            command_edges: 0,
            wanted_edges: 0,
        }
    }

    pub fn reset(&mut self) {
        self.want.clear();
        self.ready.clear();
        self.command_edges = 0;
        self.wanted_edges = 0;
    }

    /// Number of edges with commands to run.
    pub fn command_edge_count(&self) -> usize {
        self.command_edges
    }

    /// Returns true if there's more work to be done.
    pub fn more_to_do(&self) -> bool {
        self.wanted_edges > 0 && self.command_edges > 0
    }

    /// Add a target to our plan (including all its dependencies).
    /// Returns Ok(false) if the target is already up to date.
    pub fn add_target(&mut self, state: &State, node_idx: NodeIndex) -> Result<bool, String> {
        self.add_sub_target(state, node_idx, None)
    }

    fn add_sub_target(
        &mut self,
        state: &State,
        node_idx: NodeIndex,
        dependent: Option<NodeIndex>,
    ) -> Result<bool, String> {
        let node = state.node_state.get_node(node_idx);
        let edge_idx = match node.in_edge() {
            // Leaf node.
            None => {
                if node.is_dirty() {
                    let referenced = match dependent {
                        Some(dependent_idx) => format!(
                            ", needed by '{}',",
                            state.node_state.get_node(dependent_idx).path()
                        ),
                        None => String::new(),
                    };
                    return Err(format!(
                        "'{}'{} missing and no known rule to make it",
                        node.path(),
                        referenced
                    ));
                }
                return Ok(false);
            }
            Some(edge_idx) => edge_idx,
        };

        if state.edge_state.get_edge(edge_idx).outputs_ready() {
            // Don't need to do anything.
            return Ok(false);
        }

        // If an entry in want does not already exist for the edge, create
        // an entry which maps to Nothing, indicating that we do not want
        // to build this entry itself.
        let newly_inserted = !self.want.contains_key(&edge_idx);
        if newly_inserted {
            self.want.insert(edge_idx, Want::Nothing);
        }

        // If we do need to build the edge and we haven't already marked it
        // as wanted, mark it now.
        if node.is_dirty() && self.want[&edge_idx] == Want::Nothing {
            self.want.insert(edge_idx, Want::ToStart);
            self.wanted_edges += 1;
            let edge = state.edge_state.get_edge(edge_idx);
            if edge.all_inputs_ready(state) {
                self.schedule_work(state, edge_idx);
            }
            if !edge.is_phony() {
                self.command_edges += 1;
            }
        }

        if !newly_inserted {
            // We've already processed the inputs.
            return Ok(true);
        }

        for &input_idx in &state.edge_state.get_edge(edge_idx).inputs {
            self.add_sub_target(state, input_idx, Some(node_idx))?;
        }

        Ok(true)
    }

    /// Pop a ready edge off the queue of edges to build.
    /// Returns None if there's no work to do.
    pub fn find_work(&mut self) -> Option<EdgeIndex> {
        let edge_idx = self.ready.iter().next().copied()?;
        self.ready.remove(&edge_idx);
        Some(edge_idx)
    }

    /// Submits a ready edge as a candidate for execution.
    /// The edge may be delayed from running, for example if it's a member
    /// of a currently-full pool.
    fn schedule_work(&mut self, state: &State, edge_idx: EdgeIndex) {
        let want = self
            .want
            .get_mut(&edge_idx)
            .expect("scheduled edges are always wanted");
        if *want == Want::ToFinish {
            // This edge has already been scheduled.  We can get here again
            // if an edge and one of its dependencies share an order-only
            // input, or if a node duplicates an out edge.  Avoid scheduling
            // the work again.
            return;
        }
        assert_eq!(*want, Want::ToStart);
        *want = Want::ToFinish;

        let edge = state.edge_state.get_edge(edge_idx);
        let pool = edge.pool().clone();
        let mut pool = pool.borrow_mut();
        if pool.should_delay_edge() {
            pool.delay_edge(edge.weight(), edge_idx);
            pool.retrieve_ready_edges(&mut self.ready);
        } else {
            pool.edge_scheduled(edge.weight());
            self.ready.insert(edge_idx);
        }
    }

    /// Mark an edge as done building (whether it succeeded or failed).
    pub fn edge_finished(&mut self, state: &mut State, edge_idx: EdgeIndex, result: EdgeResult) {
        let want_e = *self
            .want
            .get(&edge_idx)
            .expect("finished edges are always tracked");
        let directly_wanted = want_e != Want::Nothing;

        // See if this job frees up any delayed jobs.
        {
            let weight = state.edge_state.get_edge(edge_idx).weight();
            let pool = state.edge_state.get_edge(edge_idx).pool().clone();
            let mut pool = pool.borrow_mut();
            if directly_wanted {
                pool.edge_finished(weight);
            }
            pool.retrieve_ready_edges(&mut self.ready);
        }

        self.want.remove(&edge_idx);

        // The rest only applies to successful commands.
        if result != EdgeResult::Succeeded {
            return;
        }

        if directly_wanted {
            self.wanted_edges -= 1;
        }
        state.edge_state.get_edge_mut(edge_idx).outputs_ready = true;

        // Check off any nodes we were waiting for with this edge.
        for out_idx in state.edge_state.get_edge(edge_idx).outputs.clone() {
            self.node_finished(state, out_idx);
        }
    }

    fn node_finished(&mut self, state: &mut State, node_idx: NodeIndex) {
        // See if we want any edges from this node.
        for out_edge_idx in state.node_state.get_node(node_idx).out_edges().to_vec() {
            let want_e = match self.want.get(&out_edge_idx) {
                None => continue,
                Some(want) => *want,
            };

            // See if the edge is now ready.
            if state
                .edge_state
                .get_edge(out_edge_idx)
                .all_inputs_ready(state)
            {
                if want_e != Want::Nothing {
                    self.schedule_work(state, out_edge_idx);
                } else {
                    // We do not need to build this edge, but we might need
                    // to build one of its dependents.
                    self.edge_finished(state, out_edge_idx, EdgeResult::Succeeded);
                }
            }
        }
    }

    /// Clean the given node during the build.
    /// Used when a restat edge's output did not change its mtime; demotes
    /// downstream edges whose outputs turn out to be clean after all.
    pub fn clean_node(
        &mut self,
        scan: &DependencyScan,
        state: &mut State,
        node_idx: NodeIndex,
    ) -> Result<(), String> {
        state.node_state.get_node_mut(node_idx).set_dirty(false);

        for out_edge_idx in state.node_state.get_node(node_idx).out_edges().to_vec() {
            // Don't process edges that we don't actually want.
            match self.want.get(&out_edge_idx) {
                Some(&want) if want != Want::Nothing => {}
                _ => continue,
            }

            // Don't attempt to clean an edge if it failed to load deps.
            if state.edge_state.get_edge(out_edge_idx).deps_missing {
                continue;
            }

            // If all non-order-only inputs for this edge are now clean,
            // we might have changed the dirty state of the outputs.
            let (all_clean, most_recent_input) = {
                let edge = state.edge_state.get_edge(out_edge_idx);
                let non_order_only = &edge.inputs[edge.non_order_only_deps_range()];
                let mut all_clean = true;
                let mut most_recent_input: Option<NodeIndex> = None;
                for &input_idx in non_order_only {
                    let input = state.node_state.get_node(input_idx);
                    if input.is_dirty() {
                        all_clean = false;
                        break;
                    }
                    let newer = match most_recent_input {
                        Some(prev) => {
                            input.mtime() > state.node_state.get_node(prev).mtime()
                        }
                        None => true,
                    };
                    if newer {
                        most_recent_input = Some(input_idx);
                    }
                }
                (all_clean, most_recent_input)
            };
            if !all_clean {
                continue;
            }

            // Now the edge is dirty if any of the outputs are dirty.
            // If the edge isn't dirty, clean the outputs and mark the edge
            // as not wanted.
            let outputs_dirty =
                scan.recompute_outputs_dirty(state, out_edge_idx, most_recent_input)?;
            if !outputs_dirty {
                for out_idx in state.edge_state.get_edge(out_edge_idx).outputs.clone() {
                    self.clean_node(scan, state, out_idx)?;
                }

                *self.want.get_mut(&out_edge_idx).unwrap() = Want::Nothing;
                self.wanted_edges -= 1;
                if !state.edge_state.get_edge(out_edge_idx).is_phony() {
                    self.command_edges -= 1;
                }
            }
        }
        Ok(())
    }
}

impl Default for Plan {
    fn default() -> Self {
        Plan::new()
    }
}

/// The result of waiting for one command.
pub struct CommandRunnerResult {
    pub edge: EdgeIndex,
    pub status: ExitStatus,
    pub output: String,
}

impl CommandRunnerResult {
    pub fn success(&self) -> bool {
        self.status == ExitStatus::ExitSuccess
    }
}

/// CommandRunner is an interface that wraps running the build
/// subcommands.  It can use a fake implementation for testing and a
/// dry-run implementation that doesn't actually run the commands.
pub trait CommandRunner {
    fn can_run_more(&self) -> bool;
    fn start_command(&mut self, state: &State, edge_idx: EdgeIndex) -> bool;

    /// Wait for a command to complete; returns None on interruption.
    fn wait_for_command(&mut self) -> Option<CommandRunnerResult>;

    fn get_active_edges(&self) -> Vec<EdgeIndex> {
        Vec::new()
    }
    fn abort(&mut self) {}
}

/// A CommandRunner that doesn't actually run the commands.
struct DryRunCommandRunner {
    finished: VecDeque<EdgeIndex>,
}

impl DryRunCommandRunner {
    fn new() -> Self {
        DryRunCommandRunner {
            finished: VecDeque::new(),
        }
    }
}

impl CommandRunner for DryRunCommandRunner {
    fn can_run_more(&self) -> bool {
        true
    }

    fn start_command(&mut self, _state: &State, edge_idx: EdgeIndex) -> bool {
        self.finished.push_back(edge_idx);
        true
    }

    fn wait_for_command(&mut self) -> Option<CommandRunnerResult> {
        let edge = self.finished.pop_front()?;
        Some(CommandRunnerResult {
            edge,
            status: ExitStatus::ExitSuccess,
            output: String::new(),
        })
    }
}

struct RealCommandRunner<'a> {
    config: &'a BuildConfig,
    subprocs: crate::subprocess::SubprocessSet<EdgeIndex>,
}

impl<'a> RealCommandRunner<'a> {
    fn new(config: &'a BuildConfig) -> Self {
        RealCommandRunner {
            config,
            subprocs: crate::subprocess::SubprocessSet::new(),
        }
    }
}

impl<'a> CommandRunner for RealCommandRunner<'a> {
    fn can_run_more(&self) -> bool {
        let subproc_number = self.subprocs.running().len() + self.subprocs.finished().len();
        subproc_number < self.config.parallelism
            && (self.subprocs.running().is_empty()
                || self.config.max_load_average <= 0.0
                || get_load_average()
                    .map(|load| load < self.config.max_load_average)
                    .unwrap_or(true))
    }

    fn start_command(&mut self, state: &State, edge_idx: EdgeIndex) -> bool {
        let edge = state.edge_state.get_edge(edge_idx);
        let command = edge.evaluate_command(&state.node_state);
        self.subprocs
            .add(&command, edge.use_console(), edge_idx)
            .is_some()
    }

    fn wait_for_command(&mut self) -> Option<CommandRunnerResult> {
        loop {
            if let Some((mut subproc, edge)) = self.subprocs.next_finished() {
                let status = subproc.finish();
                let output = String::from_utf8_lossy(subproc.output()).into_owned();
                return Some(CommandRunnerResult {
                    edge,
                    status,
                    output,
                });
            }

            if self.subprocs.do_work() {
                // Interrupted.
                return None;
            }
        }
    }

    fn get_active_edges(&self) -> Vec<EdgeIndex> {
        self.subprocs
            .running()
            .iter()
            .map(|(_, edge)| *edge)
            .collect()
    }

    fn abort(&mut self) {
        self.subprocs.clear();
    }
}

/// Builder wraps the build process: starting commands, updating status.
pub struct Builder<'a> {
    state: &'a mut State,
    config: &'a BuildConfig,
    plan: Plan,
    disk_interface: &'a dyn DiskInterface,
    build_log: &'a mut BuildLog,
    pub status: BuildStatus,
    command_runner: Option<Box<dyn CommandRunner + 'a>>,
}

impl<'a> Builder<'a> {
    pub fn new(
        state: &'a mut State,
        config: &'a BuildConfig,
        build_log: &'a mut BuildLog,
        disk_interface: &'a dyn DiskInterface,
    ) -> Self {
        let status = BuildStatus::new(config);
        Builder {
            state,
            config,
            plan: Plan::new(),
            disk_interface,
            build_log,
            status,
            command_runner: None,
        }
    }

    /// Add a target to the build, scanning dependencies.
    /// Returns Ok(false) if the target is already up to date.
    pub fn add_target(&mut self, node_idx: NodeIndex) -> Result<bool, String> {
        {
            let scan = DependencyScan::new(
                Some(&*self.build_log),
                self.disk_interface,
                self.config.explain,
            );
            scan.recompute_dirty(self.state, node_idx)?;
        }

        if let Some(in_edge) = self.state.node_state.get_node(node_idx).in_edge() {
            if self.state.edge_state.get_edge(in_edge).outputs_ready() {
                // Nothing to do.
                return Ok(false);
            }
        }

        self.plan.add_target(self.state, node_idx)?;
        Ok(true)
    }

    /// Returns true if the build targets are already up to date.
    pub fn is_already_up_to_date(&self) -> bool {
        !self.plan.more_to_do()
    }

    /// Run the build.  Returns an error if the build fails.
    /// It is an error to call this function when is_already_up_to_date()
    /// is true.
    pub fn build(&mut self) -> Result<(), String> {
        assert!(!self.is_already_up_to_date());

        self.status.plan_has_total_edges(self.plan.command_edge_count());
        let mut pending_commands = 0usize;
        let mut failures_allowed = self.config.failures_allowed;

        // Set up the command runner if we haven't done so already.
        if self.command_runner.is_none() {
            let runner: Box<dyn CommandRunner + 'a> = if self.config.dry_run {
                Box::new(DryRunCommandRunner::new())
            } else {
                Box::new(RealCommandRunner::new(self.config))
            };
            self.command_runner = Some(runner);
        }

        self.status.build_started();

        // This main loop runs the entire build process.
        // First we attempt to start as many commands as allowed by the
        // command runner; second we attempt to wait for / reap the next
        // finished command.
        while self.plan.more_to_do() {
            // See if we can start any more commands.
            if failures_allowed > 0 && self.command_runner.as_ref().unwrap().can_run_more() {
                if let Some(edge_idx) = self.plan.find_work() {
                    if let Err(err) = self.start_edge(edge_idx) {
                        self.cleanup();
                        self.status.build_finished();
                        return Err(err);
                    }

                    if self.state.edge_state.get_edge(edge_idx).is_phony() {
                        self.plan
                            .edge_finished(self.state, edge_idx, EdgeResult::Succeeded);
                    } else {
                        pending_commands += 1;
                    }

                    // We made some progress; go back to the main loop.
                    continue;
                }
            }

            // See if we can reap any finished commands.
            if pending_commands > 0 {
                let result = self.command_runner.as_mut().unwrap().wait_for_command();
                let mut result = match result {
                    Some(result) if result.status != ExitStatus::ExitInterrupted => result,
                    _ => {
                        self.cleanup();
                        self.status.build_finished();
                        return Err("interrupted by user".to_owned());
                    }
                };

                pending_commands -= 1;
                let finished = self.finish_command(&mut result);
                if let Err(err) = finished {
                    self.cleanup();
                    self.status.build_finished();
                    return Err(err);
                }

                if !result.success() && failures_allowed > 0 {
                    failures_allowed -= 1;
                }

                // We made some progress; start the main loop over.
                continue;
            }

            // If we get here, we cannot make any more progress.
            self.status.build_finished();
            if failures_allowed == 0 {
                if self.config.failures_allowed > 1 {
                    return Err("subcommands failed".to_owned());
                }
                return Err("subcommand failed".to_owned());
            }
            if failures_allowed < self.config.failures_allowed {
                return Err("cannot make progress due to previous errors".to_owned());
            }
            return Err("stuck [this is a bug]".to_owned());
        }

        self.status.build_finished();
        Ok(())
    }

    fn start_edge(&mut self, edge_idx: EdgeIndex) -> Result<(), String> {
        if self.state.edge_state.get_edge(edge_idx).is_phony() {
            return Ok(());
        }

        self.status.build_edge_started(&*self.state, edge_idx);

        // Create directories necessary for outputs.
        let outputs = self.state.edge_state.get_edge(edge_idx).outputs.clone();
        for out_idx in outputs {
            let path = self.state.node_state.get_node(out_idx).path().to_owned();
            self.disk_interface
                .make_dirs(&path)
                .map_err(|err| format!("creating directories for {}: {}", path, err))?;
        }

        // Create the response file, if needed.
        let rspfile = {
            let edge = self.state.edge_state.get_edge(edge_idx);
            edge.get_unescaped_rspfile(&self.state.node_state)
        };
        if !rspfile.is_empty() {
            let content = {
                let edge = self.state.edge_state.get_edge(edge_idx);
                edge.get_binding(&self.state.node_state, "rspfile_content")
            };
            self.disk_interface.write_file(&rspfile, content.as_bytes())?;
        }

        // Start the command.
        if !self
            .command_runner
            .as_mut()
            .unwrap()
            .start_command(&*self.state, edge_idx)
        {
            let command = self
                .state
                .edge_state
                .get_edge(edge_idx)
                .evaluate_command(&self.state.node_state);
            return Err(format!("command '{}' failed.", command));
        }

        Ok(())
    }

    /// Update the status, the plan, and the log with a command's result.
    fn finish_command(&mut self, result: &mut CommandRunnerResult) -> Result<(), String> {
        let edge_idx = result.edge;

        // First try to extract dependencies from the result, if any.
        // This must happen first as it filters the command output (we want
        // to filter /showIncludes output, even on compile failure) and
        // extraction itself can fail, which makes the command fail from a
        // build perspective.
        let (deps_type, deps_prefix) = {
            let edge = self.state.edge_state.get_edge(edge_idx);
            (
                edge.get_binding(&self.state.node_state, "deps"),
                edge.get_binding(&self.state.node_state, "msvc_deps_prefix"),
            )
        };
        let mut deps_nodes = Vec::new();
        if !deps_type.is_empty() {
            match self.extract_deps(result, &deps_type, &deps_prefix) {
                Ok(nodes) => deps_nodes = nodes,
                Err(extract_err) => {
                    if result.success() {
                        if !result.output.is_empty() {
                            result.output.push('\n');
                        }
                        result.output.push_str(&extract_err);
                        result.status = ExitStatus::ExitFailure;
                    }
                }
            }
        }

        let (start_time, end_time) = self.status.build_edge_finished(
            &*self.state,
            edge_idx,
            result.success(),
            &result.output,
        );

        // The rest of this function only applies to successful commands.
        if !result.success() {
            self.plan
                .edge_finished(self.state, edge_idx, EdgeResult::Failed);
            return Ok(());
        }

        // Restat the edge outputs.  Without restat, record mtime 0; with
        // restat and untouched outputs, record the most recent input mtime
        // so that later runs still notice input edits.
        let mut output_mtime = TimeStamp(0);
        let restat = {
            let edge = self.state.edge_state.get_edge(edge_idx);
            edge.get_binding_bool(&self.state.node_state, "restat")
        };
        if restat && !self.config.dry_run {
            let mut node_cleaned = false;

            let outputs = self.state.edge_state.get_edge(edge_idx).outputs.clone();
            for out_idx in outputs {
                let old_mtime = self.state.node_state.get_node(out_idx).mtime();
                self.state
                    .node_state
                    .get_node_mut(out_idx)
                    .stat(self.disk_interface)?;
                if self.state.node_state.get_node(out_idx).mtime() == old_mtime {
                    // The rule command did not change the output.
                    // Propagate the clean state through the build graph.
                    // Note that this also applies to nonexistent outputs
                    // (mtime == 0).
                    let scan = DependencyScan::new(
                        Some(&*self.build_log),
                        self.disk_interface,
                        self.config.explain,
                    );
                    self.plan.clean_node(&scan, self.state, out_idx)?;
                    node_cleaned = true;
                }
            }

            if node_cleaned {
                let mut restat_mtime = TimeStamp(0);
                // If any output was cleaned, find the most recent mtime of
                // any (existing) non-order-only input or the depfile.
                let inputs = {
                    let edge = self.state.edge_state.get_edge(edge_idx);
                    edge.inputs[edge.non_order_only_deps_range()].to_vec()
                };
                for in_idx in inputs {
                    let path = self.state.node_state.get_node(in_idx).path().to_owned();
                    let input_mtime = self.disk_interface.stat(&path)?;
                    if input_mtime > restat_mtime {
                        restat_mtime = input_mtime;
                    }
                }

                let depfile = {
                    let edge = self.state.edge_state.get_edge(edge_idx);
                    edge.get_unescaped_depfile(&self.state.node_state)
                };
                if restat_mtime.0 != 0 && deps_type.is_empty() && !depfile.is_empty() {
                    let depfile_mtime = self.disk_interface.stat(&depfile)?;
                    if depfile_mtime > restat_mtime {
                        restat_mtime = depfile_mtime;
                    }
                }

                // The total number of edges in the plan may have changed
                // as a result of the restat.
                self.status.plan_has_total_edges(self.plan.command_edge_count());

                output_mtime = restat_mtime;
            }
        }

        self.plan
            .edge_finished(self.state, edge_idx, EdgeResult::Succeeded);

        // Delete any leftover response file.
        let rspfile = {
            let edge = self.state.edge_state.get_edge(edge_idx);
            edge.get_unescaped_rspfile(&self.state.node_state)
        };
        if !rspfile.is_empty() && !self.config.keep_rsp {
            let _ = self.disk_interface.remove_file(&rspfile);
        }

        self.build_log
            .record_command(&*self.state, edge_idx, start_time, end_time, output_mtime)
            .map_err(|err| format!("Error writing to build log: {}", err))?;

        if !deps_type.is_empty() && !self.config.dry_run {
            let outputs = &self.state.edge_state.get_edge(edge_idx).outputs;
            assert_eq!(1, outputs.len(), "should have been rejected by parser");
            let out_idx = outputs[0];
            let out_path = self.state.node_state.get_node(out_idx).path().to_owned();
            let deps_mtime = self.disk_interface.stat(&out_path)?;
            self.build_log
                .record_deps(self.state, out_idx, deps_mtime, &deps_nodes)
                .map_err(|err| format!("Error writing to deps log: {}", err))?;
        }

        Ok(())
    }

    fn extract_deps(
        &mut self,
        result: &mut CommandRunnerResult,
        deps_type: &str,
        deps_prefix: &str,
    ) -> Result<Vec<NodeIndex>, String> {
        if deps_type == "msvc" {
            let mut parser = CLParser::new();
            let mut filtered_output = String::new();
            parser.parse(&result.output, deps_prefix, &mut filtered_output)?;
            result.output = filtered_output;

            let mut deps_nodes = Vec::new();
            for include in &parser.includes {
                // !0 assumes that with MSVC-parsed headers, it's ok to
                // always make all backslashes (as some of the slashes will
                // certainly be backslashes anyway).
                deps_nodes.push(self.state.node_state.prepare_node(include, !0u64));
            }
            Ok(deps_nodes)
        } else if deps_type == "gcc" {
            let depfile = {
                let edge = self.state.edge_state.get_edge(result.edge);
                edge.get_unescaped_depfile(&self.state.node_state)
            };
            if depfile.is_empty() {
                return Err("edge with deps=gcc but no depfile makes no sense".to_owned());
            }

            // Read the depfile content.  Treat a missing depfile as empty.
            let mut content = Vec::new();
            match self.disk_interface.read_file(&depfile, &mut content) {
                Ok(()) => {}
                Err(FileReaderError::NotFound(_)) => content.clear(),
                Err(FileReaderError::OtherError(err)) => return Err(err),
            }
            if content.is_empty() {
                return Ok(Vec::new());
            }

            let content = String::from_utf8_lossy(&content);
            let deps = DepfileParser::parse(&content)?;

            let mut deps_nodes = Vec::with_capacity(deps.ins.len());
            for input in &deps.ins {
                let (path, slash_bits) = canonicalize_path(input)?;
                deps_nodes.push(self.state.node_state.prepare_node(&path, slash_bits));
            }

            if !self.config.keep_depfile {
                self.disk_interface
                    .remove_file(&depfile)
                    .map_err(|err| format!("deleting depfile: {}", err))?;
            }
            Ok(deps_nodes)
        } else {
            fatal!("unknown deps type '{}'", deps_type);
        }
    }

    /// Clean up after interrupted commands by deleting output files that
    /// cannot be trusted.
    pub fn cleanup(&mut self) {
        let runner = match &mut self.command_runner {
            Some(runner) => runner,
            None => return,
        };
        let active_edges = runner.get_active_edges();
        runner.abort();

        for edge_idx in active_edges {
            let depfile = {
                let edge = self.state.edge_state.get_edge(edge_idx);
                edge.get_unescaped_depfile(&self.state.node_state)
            };
            for out_idx in self.state.edge_state.get_edge(edge_idx).outputs.clone() {
                // Only delete this output if it was actually modified.
                // This is important for things like the generator where we
                // don't want to delete the manifest file if we can avoid
                // it.  But if the rule uses a depfile, always delete.
                // (Consider the case where we need to rebuild an output
                // because of a modified header file mentioned in a
                // depfile, and the command touches its depfile but is
                // interrupted before it touches its output file.)
                let (path, old_mtime) = {
                    let node = self.state.node_state.get_node(out_idx);
                    (node.path().to_owned(), node.mtime())
                };
                match self.disk_interface.stat(&path) {
                    Ok(new_mtime) => {
                        if !depfile.is_empty() || old_mtime != new_mtime {
                            let _ = self.disk_interface.remove_file(&path);
                        }
                    }
                    // Log and ignore stat errors.
                    Err(err) => error!("{}", err),
                }
            }
            if !depfile.is_empty() {
                let _ = self.disk_interface.remove_file(&depfile);
            }
        }
    }
}
