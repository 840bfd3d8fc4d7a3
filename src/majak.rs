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

use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::build::{BuildConfig, BuildConfigVerbosity, Builder};
use crate::build_log::{dump_records, BuildLog, BuildLogUser, BUILD_LOG_FILE_NAME};
use crate::disk_interface::{DiskInterface, RealDiskInterface};
use crate::eval_env::Env;
use crate::graph::NodeIndex;
use crate::manifest_parser::{
    DupeEdgeAction, ManifestParser, ManifestParserOptions, PhonyCycleAction,
};
use crate::metrics::Metrics;
use crate::state::State;
use crate::timestamp::TimeStamp;
use crate::utils::{canonicalize_path, decanonicalize_path, get_processor_count};
use crate::version::MAJAK_VERSION;

const INPUT_FILE: &str = "build.ninja";

/// Answers the build log's liveness questions from the loaded manifest
/// plus the disk.
struct ManifestLogUser<'a> {
    disk_interface: &'a RealDiskInterface,
}

impl<'a> BuildLogUser for ManifestLogUser<'a> {
    fn is_path_dead(&self, state: &State, path: &str) -> bool {
        let has_in_edge = state
            .node_state
            .lookup_node(path)
            .map(|idx| state.node_state.get_node(idx).in_edge().is_some())
            .unwrap_or(false);
        if !has_in_edge {
            return false;
        }
        // Do keep entries around for files which still exist on disk, for
        // generators that want to use this information.
        match self.disk_interface.stat(path) {
            Ok(mtime) => mtime == TimeStamp(0),
            Err(err) => {
                // Log and ignore stat errors.
                error!("{}", err);
                false
            }
        }
    }
}

/// The `majak build` entry point loads up a series of data structures;
/// various stages need to poke into these, so store them as fields.
struct MajakMain<'a> {
    /// Build configuration set from flags (e.g. parallelism).
    config: &'a BuildConfig,
    /// Loaded state (rules, nodes).
    state: State,
    /// Functions for accessing the disk.
    disk_interface: RealDiskInterface,
    /// The build directory, used for storing the build log.
    build_dir: String,
    build_log: BuildLog,
}

impl<'a> MajakMain<'a> {
    fn new(config: &'a BuildConfig) -> Self {
        MajakMain {
            config,
            state: State::new(),
            disk_interface: RealDiskInterface {},
            build_dir: String::new(),
            build_log: BuildLog::new(),
        }
    }

    fn build_log_path(&self) -> String {
        if self.build_dir.is_empty() {
            BUILD_LOG_FILE_NAME.to_owned()
        } else {
            format!("{}/{}", self.build_dir, BUILD_LOG_FILE_NAME)
        }
    }

    /// Ensure the build directory exists, creating it if necessary.
    fn ensure_build_dir_exists(&mut self) -> Result<(), ()> {
        self.build_dir = self
            .state
            .bindings
            .borrow()
            .lookup_variable("builddir")
            .into_owned();
        if !self.build_dir.is_empty() && !self.config.dry_run {
            let probe = format!("{}/.", self.build_dir);
            self.disk_interface.make_dirs(&probe).map_err(|err| {
                error!("creating build directory {}: {}", self.build_dir, err);
            })?;
        }
        Ok(())
    }

    /// Load the build log and open it for appending.
    fn open_build_log(&mut self, recompact_only: bool) -> Result<(), ()> {
        let log_path = self.build_log_path();

        match self.build_log.load(&log_path, &mut self.state) {
            Ok(None) => {}
            Ok(Some(warn)) => warning!("{}", warn),
            Err(err) => {
                error!("loading build log {}: {}", log_path, err);
                return Err(());
            }
        }

        let user = ManifestLogUser {
            disk_interface: &self.disk_interface,
        };

        if recompact_only {
            return self
                .build_log
                .recompact(&log_path, &user, &mut self.state)
                .map_err(|err| {
                    error!("failed recompaction: {}", err);
                });
        }

        if !self.config.dry_run {
            self.build_log
                .open_for_write(&log_path, &user, &mut self.state)
                .map_err(|err| {
                    error!("opening build log: {}", err);
                })?;
        }

        Ok(())
    }

    /// Rebuild the manifest, if necessary.
    /// Returns Ok(true) if the manifest was rebuilt, requiring a restart.
    fn rebuild_manifest(&mut self, input_file: &str) -> Result<bool, String> {
        let (path, _slash_bits) = canonicalize_path(input_file)?;
        let node_idx = match self.state.node_state.lookup_node(&path) {
            None => return Ok(false),
            Some(node_idx) => node_idx,
        };

        {
            let mut builder = Builder::new(
                &mut self.state,
                self.config,
                &mut self.build_log,
                &self.disk_interface,
            );
            if !builder.add_target(node_idx)? {
                // Not an error, but we didn't rebuild.
                return Ok(false);
            }
            if builder.is_already_up_to_date() {
                return Ok(false);
            }
            builder.build()?;
        }

        // The manifest was only rebuilt if it is now dirty (it may have
        // been cleaned by a restat).
        if !self.state.node_state.get_node(node_idx).is_dirty() {
            // Reset the state to prevent problems like stale mtimes
            // leaking into the real build.
            self.state.reset();
            return Ok(false);
        }

        Ok(true)
    }

    /// Get the node for a given command-line path, handling features like
    /// spell correction.
    fn collect_target(&self, cpath: &str) -> Result<NodeIndex, String> {
        let (mut path, slash_bits) = canonicalize_path(cpath)?;

        // Special syntax: "foo.cc^" means "the first output of foo.cc".
        let mut first_dependent = false;
        if path.ends_with('^') {
            path.pop();
            first_dependent = true;
        }

        let node_idx = match self.state.node_state.lookup_node(&path) {
            Some(node_idx) => node_idx,
            None => {
                let mut err = format!(
                    "unknown target '{}'",
                    decanonicalize_path(&path, slash_bits)
                );
                if let Some(suggestion) = self.state.spellcheck_node(&path) {
                    err += &format!(", did you mean '{}'?", suggestion);
                }
                return Err(err);
            }
        };

        if first_dependent {
            let out_edge_idx = self
                .state
                .node_state
                .get_node(node_idx)
                .out_edges()
                .first()
                .cloned()
                .ok_or_else(|| format!("'{}' has no out edge", path))?;
            let edge = self.state.edge_state.get_edge(out_edge_idx);
            return edge
                .outputs
                .first()
                .cloned()
                .ok_or_else(|| "edge has no outputs".to_owned());
        }
        Ok(node_idx)
    }

    fn collect_targets_from_args(&self, args: &[String]) -> Result<Vec<NodeIndex>, String> {
        if args.is_empty() {
            return self.state.default_nodes();
        }
        let mut targets = Vec::with_capacity(args.len());
        for arg in args {
            targets.push(self.collect_target(arg)?);
        }
        Ok(targets)
    }

    /// Build the targets listed on the command line.  Returns an exit
    /// code.
    fn run_build(&mut self, args: &[String]) -> i32 {
        let targets = match self.collect_targets_from_args(args) {
            Ok(targets) => targets,
            Err(err) => {
                error!("{}", err);
                return 1;
            }
        };

        let mut builder = Builder::new(
            &mut self.state,
            self.config,
            &mut self.build_log,
            &self.disk_interface,
        );

        for target in targets {
            if let Err(err) = builder.add_target(target) {
                error!("{}", err);
                return 1;
            }
        }

        if builder.is_already_up_to_date() {
            println!("majak: no work to do.");
            return 0;
        }

        if let Err(err) = builder.build() {
            println!("majak: build stopped: {}.", err);
            if err.contains("interrupted by user") {
                return 2;
            }
            return 1;
        }

        0
    }
}

/// Choose a default value for the -j (parallelism) flag.
fn guess_parallelism() -> usize {
    match get_processor_count() {
        0 | 1 => 2,
        2 => 3,
        processors => processors + 2,
    }
}

/// Enable a debugging mode.  Returns Err if we should exit instead of
/// continuing.
fn debug_enable(name: &str, config: &mut BuildConfig, stats: &mut bool) -> Result<(), i32> {
    match name {
        "list" => {
            println!(
                "debugging modes:\n\
                 \x20 stats        print operation counts/timing info\n\
                 \x20 explain      explain what caused a command to execute\n\
                 \x20 keepdepfile  don't delete depfiles after they're read\n\
                 \x20 keeprsp      don't delete @response files on success\n\
                 multiple modes can be enabled via -d FOO -d BAR"
            );
            Err(0)
        }
        "stats" => {
            *stats = true;
            Ok(())
        }
        "explain" => {
            config.explain = true;
            Ok(())
        }
        "keepdepfile" => {
            config.keep_depfile = true;
            Ok(())
        }
        "keeprsp" => {
            config.keep_rsp = true;
            Ok(())
        }
        _ => {
            let suggestion = crate::utils::spellcheck_string(
                name,
                &["stats", "explain", "keepdepfile", "keeprsp"],
            );
            match suggestion {
                Some(suggestion) => {
                    error!("unknown debug setting '{}', did you mean '{}'?", name, suggestion)
                }
                None => error!("unknown debug setting '{}'", name),
            }
            Err(1)
        }
    }
}

/// Set a warning flag.  Returns Err if we should exit instead of
/// continuing.
fn warning_enable(name: &str, options: &mut ManifestParserOptions) -> Result<(), i32> {
    match name {
        "list" => {
            println!(
                "warning flags:\n\
                 \x20 dupbuild={{err,warn}}  multiple build lines for one target\n\
                 \x20 phonycycle={{err,warn}}  phony build statement references itself"
            );
            Err(0)
        }
        "dupbuild=err" => {
            options.dupe_edge_action = DupeEdgeAction::Error;
            Ok(())
        }
        "dupbuild=warn" => {
            options.dupe_edge_action = DupeEdgeAction::Warn;
            Ok(())
        }
        "phonycycle=err" => {
            options.phony_cycle_action = PhonyCycleAction::Error;
            Ok(())
        }
        "phonycycle=warn" => {
            options.phony_cycle_action = PhonyCycleAction::Warn;
            Ok(())
        }
        _ => {
            let suggestion = crate::utils::spellcheck_string(
                name,
                &[
                    "dupbuild=err",
                    "dupbuild=warn",
                    "phonycycle=err",
                    "phonycycle=warn",
                ],
            );
            match suggestion {
                Some(suggestion) => {
                    error!("unknown warning flag '{}', did you mean '{}'?", name, suggestion)
                }
                None => error!("unknown warning flag '{}'", name),
            }
            Err(1)
        }
    }
}

fn cli() -> Command {
    Command::new("majak")
        .version(MAJAK_VERSION)
        .about("A small, fast incremental build executor in the ninja family.")
        .disable_help_subcommand(true)
        .arg(
            Arg::new("dir")
                .short('C')
                .value_name("DIR")
                .global(true)
                .help("change to DIR before doing anything else"),
        )
        .subcommand(
            Command::new("build")
                .about("build given targets")
                .arg(
                    Arg::new("jobs")
                        .short('j')
                        .value_name("N")
                        .help("run N jobs in parallel [default derived from CPUs available]"),
                )
                .arg(
                    Arg::new("keep_going")
                        .short('k')
                        .value_name("N")
                        .help("keep going until N jobs fail (0 means infinity) [default=1]"),
                )
                .arg(
                    Arg::new("load_limit")
                        .short('l')
                        .value_name("N")
                        .help("do not start new jobs if the load average is greater than N"),
                )
                .arg(
                    Arg::new("dry_run")
                        .short('n')
                        .action(ArgAction::SetTrue)
                        .help("dry run (don't run commands but act like they succeeded)"),
                )
                .arg(
                    Arg::new("verbose")
                        .short('v')
                        .action(ArgAction::SetTrue)
                        .help("show all command lines while building"),
                )
                .arg(
                    Arg::new("debug_mode")
                        .short('d')
                        .value_name("MODE")
                        .action(ArgAction::Append)
                        .help("enable debugging (use -d list to list modes)"),
                )
                .arg(
                    Arg::new("warning")
                        .short('w')
                        .value_name("FLAG")
                        .action(ArgAction::Append)
                        .help("adjust warnings (use -w list to list warnings)"),
                )
                .arg(
                    Arg::new("targets")
                        .value_name("TARGETS")
                        .num_args(0..)
                        .help("targets to build; defaults to the manifest's defaults"),
                ),
        )
        .subcommand(Command::new("version").about("print majak version"))
        .subcommand(
            Command::new("debug")
                .about("debug commands")
                .subcommand(Command::new("dump-build-log").about("dump the build log"))
                .subcommand(
                    Command::new("recompact").about("recompact the build log in place"),
                ),
        )
}

fn parse_positive_int(value: &str, what: &str) -> usize {
    match value.parse::<isize>() {
        Ok(parsed) if parsed > 0 => parsed as usize,
        _ => fatal!("invalid {} parameter", what),
    }
}

fn command_build(working_dir: Option<&str>, matches: &ArgMatches) -> i32 {
    let mut config = BuildConfig::new();
    config.parallelism = guess_parallelism();
    let mut parser_options = ManifestParserOptions {
        dupe_edge_action: DupeEdgeAction::Error,
        phony_cycle_action: PhonyCycleAction::Error,
    };
    let mut stats = false;

    if let Some(jobs) = matches.get_one::<String>("jobs") {
        config.parallelism = parse_positive_int(jobs, "-j");
    }
    if let Some(keep_going) = matches.get_one::<String>("keep_going") {
        // We want to go until N jobs fail, which means we should allow N
        // failures and then stop.  For N <= 0, usize::MAX is close enough
        // to infinite for most sane builds.
        config.failures_allowed = match keep_going.parse::<isize>() {
            Ok(parsed) if parsed > 0 => parsed as usize,
            Ok(_) => usize::MAX,
            Err(_) => fatal!("-k parameter not numeric; did you mean -k 0?"),
        };
    }
    if let Some(load_limit) = matches.get_one::<String>("load_limit") {
        config.max_load_average = match load_limit.parse::<f64>() {
            Ok(parsed) => parsed,
            Err(_) => fatal!("-l parameter not numeric: did you mean -l 0.0?"),
        };
    }
    if matches.get_flag("dry_run") {
        config.dry_run = true;
    }
    if matches.get_flag("verbose") {
        config.verbosity = BuildConfigVerbosity::Verbose;
    }
    if let Some(modes) = matches.get_many::<String>("debug_mode") {
        for mode in modes {
            if let Err(code) = debug_enable(mode, &mut config, &mut stats) {
                return code;
            }
        }
    }
    if let Some(warnings) = matches.get_many::<String>("warning") {
        for warning in warnings {
            if let Err(code) = warning_enable(warning, &mut parser_options) {
                return code;
            }
        }
    }

    let targets: Vec<String> = matches
        .get_many::<String>("targets")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    // If build.ninja is not found in the current working directory, walk
    // up the directory hierarchy until one is found.
    let mut working_dir: Option<PathBuf> = working_dir.map(PathBuf::from);
    if working_dir.is_none() {
        let disk_interface = RealDiskInterface {};
        if disk_interface.stat(INPUT_FILE) == Ok(TimeStamp(0)) {
            if let Ok(cwd) = std::env::current_dir() {
                let mut dir = cwd.as_path();
                while let Some(parent) = dir.parent() {
                    if parent.join(INPUT_FILE).is_file() {
                        working_dir = Some(parent.to_path_buf());
                        break;
                    }
                    dir = parent;
                }
            }
        }
    }

    if let Some(dir) = &working_dir {
        // The formatting of this string, complete with funny quotes, is
        // so Emacs can properly identify that the cwd has changed for
        // subsequent commands.
        println!("majak: Entering directory `{}'", dir.display());
        if let Err(err) = std::env::set_current_dir(dir) {
            fatal!("chdir to '{}' - {}", dir.display(), err);
        }
    }

    let mut metrics = Metrics::new();

    const CYCLE_LIMIT: usize = 100;
    for _cycle in 0..CYCLE_LIMIT {
        let mut majak = MajakMain::new(&config);

        {
            let mut parser = ManifestParser::new(
                &mut majak.state,
                &majak.disk_interface,
                parser_options.clone(),
            );
            let loaded = metrics.measure("manifest parse", || parser.load(INPUT_FILE));
            if let Err(err) = loaded {
                error!("{}", err);
                return 1;
            }
        }

        if majak.ensure_build_dir_exists().is_err() {
            return 1;
        }
        let opened = metrics.measure("build log load", || majak.open_build_log(false));
        if opened.is_err() {
            return 1;
        }

        // Attempt to rebuild the manifest before building anything else.
        match majak.rebuild_manifest(INPUT_FILE) {
            Ok(false) => {}
            Ok(true) => {
                // In dry_run mode the regeneration will succeed without
                // changing the manifest forever.  Better to return.
                if config.dry_run {
                    return 0;
                }
                // Start the build over with the new manifest.
                continue;
            }
            Err(err) => {
                error!("rebuilding '{}': {}", INPUT_FILE, err);
                return 1;
            }
        }

        let result = metrics.measure("build", || majak.run_build(&targets));
        if stats {
            metrics.report();
        }
        return result;
    }

    error!(
        "manifest '{}' still dirty after {} tries",
        INPUT_FILE, CYCLE_LIMIT
    );
    1
}

fn command_version() -> i32 {
    println!("majak {}", MAJAK_VERSION);
    0
}

fn command_debug_dump_build_log(working_dir: Option<&str>) -> i32 {
    if let Some(dir) = working_dir {
        if let Err(err) = std::env::set_current_dir(dir) {
            fatal!("chdir to '{}' - {}", dir, err);
        }
    }

    // Parse the manifest only to find builddir.
    let log_path = {
        let mut state = State::new();
        let disk_interface = RealDiskInterface {};
        let mut parser = ManifestParser::new(
            &mut state,
            &disk_interface,
            ManifestParserOptions::default(),
        );
        if let Err(err) = parser.load(INPUT_FILE) {
            error!("loading manifest failed: {}", err);
            return 1;
        }
        let build_dir = state.bindings.borrow().lookup_variable("builddir").into_owned();
        if build_dir.is_empty() {
            BUILD_LOG_FILE_NAME.to_owned()
        } else {
            format!("{}/{}", build_dir, BUILD_LOG_FILE_NAME)
        }
    };

    match dump_records(&log_path, |entry| println!("{:?}", entry)) {
        Ok(true) => 0,
        Ok(false) => {
            println!("<missing>");
            0
        }
        Err(err) => {
            error!("failed to open build log: {}", err);
            1
        }
    }
}

fn command_debug_recompact(working_dir: Option<&str>) -> i32 {
    if let Some(dir) = working_dir {
        if let Err(err) = std::env::set_current_dir(dir) {
            fatal!("chdir to '{}' - {}", dir, err);
        }
    }

    let config = BuildConfig::new();
    let mut majak = MajakMain::new(&config);

    {
        let mut parser = ManifestParser::new(
            &mut majak.state,
            &majak.disk_interface,
            ManifestParserOptions::default(),
        );
        if let Err(err) = parser.load(INPUT_FILE) {
            error!("{}", err);
            return 1;
        }
    }

    if majak.ensure_build_dir_exists().is_err() {
        return 1;
    }
    if majak.open_build_log(/* recompact_only= */ true).is_err() {
        return 1;
    }
    0
}

/// Parse the command line and dispatch.  Returns the process exit code.
pub fn majak_entry() -> i32 {
    let mut command = cli();
    let matches = command.clone().get_matches();
    let working_dir = matches.get_one::<String>("dir").map(|s| s.as_str());

    match matches.subcommand() {
        Some(("build", sub_matches)) => command_build(working_dir, sub_matches),
        Some(("version", _)) => command_version(),
        Some(("debug", sub_matches)) => match sub_matches.subcommand() {
            Some(("dump-build-log", _)) => command_debug_dump_build_log(working_dir),
            Some(("recompact", _)) => command_debug_recompact(working_dir),
            _ => {
                let _ = command
                    .find_subcommand_mut("debug")
                    .expect("debug subcommand exists")
                    .print_help();
                0
            }
        },
        _ => {
            let _ = command.print_help();
            0
        }
    }
}
