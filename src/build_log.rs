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

// Implementation details:
// Each run's log appends to the log file.
// To load, we run through all log entries in series, throwing away
// older runs.
// Once the number of redundant entries exceeds a threshold, we write
// out a new file and replace the existing one with it.
//
// As build commands run they can also output extra dependency information
// (e.g. header dependencies for C source) dynamically; that information is
// collected in the same stream.  Numbering path records in file order
// gives paths dense integer ids, and deps records map an output id to a
// list of input ids.  A record that references an id always appears after
// the path record that assigned it.

use std::collections::HashMap;
use std::convert::TryInto;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};

use prost::Message;

use crate::graph::{EdgeIndex, Node, NodeIndex};
use crate::log_schema::{self, Entry, EntryHolder};
use crate::state::State;
use crate::timestamp::TimeStamp;

pub const CURRENT_VERSION: u32 = 1;
pub const OLDEST_SUPPORTED_VERSION: u32 = 1;
pub const BUILD_LOG_FILE_NAME: &str = ".majak_log";

// Record size is limited to well under the full 32 bits so that a corrupt
// length prefix can't make us allocate gigabytes.
const MAX_RECORD_SIZE: u32 = (1 << 20) - 1;

// 64bit MurmurHash2, by Austin Appleby.  This hash is part of the on-disk
// format; it must produce bit-identical values forever.
fn murmur_hash_64a(data: &[u8]) -> u64 {
    const SEED: u64 = 0xDECAFBADDECAFBAD;
    const M: u64 = 0xc6a4a7935bd1e995;
    const R: u32 = 47;

    let mut h: u64 = SEED ^ (data.len() as u64).wrapping_mul(M);

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, &b) in tail.iter().enumerate() {
            h ^= (b as u64) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// Hash of an evaluated command line, used to detect when the command for
/// an output changed between runs.
pub fn hash_command(command: &str) -> u64 {
    murmur_hash_64a(command.as_bytes())
}

/// The in-memory copy of a BuildEntry record.
#[derive(Clone, PartialEq, Debug)]
pub struct LogEntry {
    pub output: String,
    pub command_hash: u64,
    pub start_time: i32,
    pub end_time: i32,
    pub mtime: TimeStamp,
}

/// The recorded deps of one output.
#[derive(Clone, PartialEq, Debug)]
pub struct Deps {
    pub mtime: TimeStamp,
    pub nodes: Vec<NodeIndex>,
}

/// Can answer questions about the manifest for the BuildLog.
pub trait BuildLogUser {
    /// Return whether a given output is no longer part of the build
    /// manifest.  This is only called during recompaction and doesn't
    /// have to be fast.
    fn is_path_dead(&self, state: &State, path: &str) -> bool;
}

fn encode_record(entry: Entry) -> Vec<u8> {
    let holder = EntryHolder { entry: Some(entry) };
    let body = holder.encode_to_vec();
    debug_assert!(body.len() < MAX_RECORD_SIZE as usize);
    let mut record = Vec::with_capacity(4 + body.len());
    record.extend_from_slice(&(body.len() as u32).to_le_bytes());
    record.extend_from_slice(&body);
    record
}

enum ReadStatus {
    Success(Entry),
    Finished,
    Failed,
}

fn read_record<R: Read>(reader: &mut R) -> (ReadStatus, u64) {
    let mut size_buf = [0u8; 4];
    let mut filled = 0usize;
    while filled < size_buf.len() {
        match reader.read(&mut size_buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return (ReadStatus::Failed, 0),
        }
    }
    if filled == 0 {
        return (ReadStatus::Finished, 0);
    }
    if filled < size_buf.len() {
        return (ReadStatus::Failed, 0);
    }

    let size = u32::from_le_bytes(size_buf);
    if size == 0 || size > MAX_RECORD_SIZE {
        return (ReadStatus::Failed, 0);
    }

    let mut body = vec![0u8; size as usize];
    if reader.read_exact(&mut body).is_err() {
        return (ReadStatus::Failed, 0);
    }

    match EntryHolder::decode(body.as_slice()) {
        Ok(EntryHolder { entry: Some(entry) }) => (ReadStatus::Success(entry), 4 + size as u64),
        _ => (ReadStatus::Failed, 0),
    }
}

/// Store a log of every command ran for every build, combined with the
/// dynamically discovered dependencies of each output.
///
/// It has a few uses:
///
/// 1) (hashes of) command lines for existing output files, so we know
///    when we need to rebuild due to the command changing
/// 2) timing information, perhaps for generating reports
/// 3) restat information
/// 4) discovered header dependencies from previous runs
pub struct BuildLog {
    /// Maps output path -> latest entry.
    entries: HashMap<String, LogEntry>,
    /// Maps id -> Node.
    nodes: Vec<NodeIndex>,
    /// Maps id -> deps of that id.
    deps: Vec<Option<Deps>>,
    log_file: Option<File>,
    needs_recompaction: bool,
}

impl BuildLog {
    pub fn new() -> Self {
        BuildLog {
            entries: HashMap::new(),
            nodes: Vec::new(),
            deps: Vec::new(),
            log_file: None,
            needs_recompaction: false,
        }
    }

    pub fn entries(&self) -> &HashMap<String, LogEntry> {
        &self.entries
    }

    /// Used for tests and tools.
    pub fn nodes(&self) -> &[NodeIndex] {
        &self.nodes
    }

    pub fn needs_recompaction(&self) -> bool {
        self.needs_recompaction
    }

    /// Open the log for appending, recompacting it first if a previous
    /// load flagged the need.  An empty file gets the version record.
    pub fn open_for_write(
        &mut self,
        path: &str,
        user: &dyn BuildLogUser,
        state: &mut State,
    ) -> Result<(), String> {
        if self.needs_recompaction {
            self.recompact(path, user, state)?;
            self.needs_recompaction = false;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| format!("opening {}: {}", path, err))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            crate::utils::set_close_on_exec(file.as_raw_fd());
        }

        let len = file
            .metadata()
            .map_err(|err| format!("stat {}: {}", path, err))?
            .len();
        self.log_file = Some(file);

        if len == 0 {
            // Write the version entry as the first record.
            self.write_record(Entry::Version(log_schema::VersionEntry {
                version: CURRENT_VERSION,
            }))?;
        }

        Ok(())
    }

    pub fn close(&mut self) {
        self.log_file = None;
    }

    fn write_record(&mut self, entry: Entry) -> Result<(), String> {
        let file = match &mut self.log_file {
            Some(file) => file,
            None => return Ok(()),
        };
        let record = encode_record(entry);
        let write = |file: &mut File| -> io::Result<()> {
            file.write_all(&record)?;
            // Records must never be partially visible; flush each one.
            file.flush()
        };
        write(file).map_err(|err| format!("writing to build log: {}", err))
    }

    /// Record a finished command for every output of |edge_idx|.
    pub fn record_command(
        &mut self,
        state: &State,
        edge_idx: EdgeIndex,
        start_time: i32,
        end_time: i32,
        mtime: TimeStamp,
    ) -> Result<(), String> {
        let edge = state.edge_state.get_edge(edge_idx);
        let command = edge.evaluate_command_with_rsp_file(&state.node_state, true);
        let command_hash = hash_command(&command);
        for &out_idx in &edge.outputs {
            let path = state.node_state.get_node(out_idx).path().to_owned();
            self.record_command_for_path(&path, command_hash, start_time, end_time, mtime)?;
        }
        Ok(())
    }

    fn record_command_for_path(
        &mut self,
        path: &str,
        command_hash: u64,
        start_time: i32,
        end_time: i32,
        mtime: TimeStamp,
    ) -> Result<(), String> {
        let entry = self
            .entries
            .entry(path.to_owned())
            .or_insert_with(|| LogEntry {
                output: path.to_owned(),
                command_hash: 0,
                start_time: 0,
                end_time: 0,
                mtime: TimeStamp(0),
            });
        entry.command_hash = command_hash;
        entry.start_time = start_time;
        entry.end_time = end_time;
        entry.mtime = mtime;

        self.write_record(Entry::Build(log_schema::BuildEntry {
            output: path.to_owned(),
            command_hash,
            start_time,
            end_time,
            mtime: mtime.0,
        }))
    }

    /// Record the discovered deps of |node_idx|, interning ids as needed.
    /// Writes nothing when the recorded set is unchanged.
    pub fn record_deps(
        &mut self,
        state: &mut State,
        node_idx: NodeIndex,
        mtime: TimeStamp,
        deps: &[NodeIndex],
    ) -> Result<(), String> {
        // Track whether there's any new data to be recorded.
        let mut made_change = false;

        // Assign ids to all nodes that are missing one.
        if state.node_state.get_node(node_idx).id() < 0 {
            self.record_id(state, node_idx)?;
            made_change = true;
        }
        for &dep in deps {
            if state.node_state.get_node(dep).id() < 0 {
                self.record_id(state, dep)?;
                made_change = true;
            }
        }

        // See if the new data is different than the existing data, if any.
        if !made_change {
            match self.get_deps(state.node_state.get_node(node_idx)) {
                Some(existing) if existing.mtime == mtime && existing.nodes == deps => {}
                _ => made_change = true,
            }
        }

        // Don't write anything if there's no new info.
        if !made_change {
            return Ok(());
        }

        let out_id = state.node_state.get_node(node_idx).id() as u32;
        let dep_ids = deps
            .iter()
            .map(|&dep| state.node_state.get_node(dep).id() as u32)
            .collect();
        self.write_record(Entry::Deps(log_schema::DepsEntry {
            output: out_id,
            mtime: mtime.0,
            deps: dep_ids,
        }))?;

        // Update the in-memory representation.
        self.update_deps(
            out_id as usize,
            Deps {
                mtime,
                nodes: deps.to_vec(),
            },
        );
        Ok(())
    }

    /// Write a path record, assigning the node the next dense id.
    fn record_id(&mut self, state: &mut State, node_idx: NodeIndex) -> Result<(), String> {
        let id = self.nodes.len();
        let path = state.node_state.get_node(node_idx).path().to_owned();

        self.write_record(Entry::Path(log_schema::PathEntry {
            path,
            checksum: !(id as u32),
        }))?;

        state.node_state.get_node_mut(node_idx).set_id(id as isize);
        self.nodes.push(node_idx);
        Ok(())
    }

    /// Returns true if a prior deps record was replaced.
    fn update_deps(&mut self, out_id: usize, deps: Deps) -> bool {
        if out_id >= self.deps.len() {
            self.deps.resize(out_id + 1, None);
        }
        let was_there = self.deps[out_id].is_some();
        self.deps[out_id] = Some(deps);
        was_there
    }

    /// Load an existing log file.  Returns Ok(Some(warning)) when the log
    /// was readable but damaged or outdated; the build can still proceed.
    pub fn load(&mut self, path: &str, state: &mut State) -> Result<Option<String>, String> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(format!("opening {}: {}", path, err)),
        };
        let mut reader = BufReader::new(file);

        // Try to read the version entry first.
        let (version_status, version_consumed) = read_record(&mut reader);
        let log_version = match version_status {
            ReadStatus::Success(Entry::Version(version_entry)) => Some(version_entry.version),
            _ => None,
        };
        let version_valid = matches!(
            log_version,
            Some(v) if (OLDEST_SUPPORTED_VERSION..=CURRENT_VERSION).contains(&v)
        );
        if !version_valid {
            let mut warning = match log_version {
                None => "missing log version entry".to_owned(),
                Some(version) => format!(
                    "log version {} too {} (current {})",
                    version,
                    if version < OLDEST_SUPPORTED_VERSION {
                        "old"
                    } else {
                        "new"
                    },
                    CURRENT_VERSION
                ),
            };
            warning += "; starting over";
            drop(reader);
            if let Err(err) = fs::remove_file(path) {
                return Err(format!("failed to remove invalid build log: {}", err));
            }
            // Don't report this as a failure.  An empty build log will
            // cause us to rebuild the outputs anyway.
            return Ok(Some(warning));
        }

        let mut offset: u64 = version_consumed;
        let mut unique_entry_count = 0usize;
        let mut total_entry_count = 0usize;
        let mut unique_dep_record_count = 0usize;
        let mut total_dep_record_count = 0usize;

        let mut truncate_and_warn = false;
        loop {
            let (status, consumed) = read_record(&mut reader);
            let entry = match status {
                ReadStatus::Finished => break,
                ReadStatus::Failed => {
                    truncate_and_warn = true;
                    break;
                }
                ReadStatus::Success(entry) => entry,
            };

            match entry {
                Entry::Build(build_entry) => {
                    let log_entry = self
                        .entries
                        .entry(build_entry.output.clone())
                        .or_insert_with(|| {
                            unique_entry_count += 1;
                            LogEntry {
                                output: build_entry.output.clone(),
                                command_hash: 0,
                                start_time: 0,
                                end_time: 0,
                                mtime: TimeStamp(0),
                            }
                        });
                    total_entry_count += 1;
                    log_entry.command_hash = build_entry.command_hash;
                    log_entry.start_time = build_entry.start_time;
                    log_entry.end_time = build_entry.end_time;
                    log_entry.mtime = TimeStamp(build_entry.mtime);
                }
                Entry::Path(path_entry) => {
                    // It is not necessary to pass in correct slash_bits
                    // here.  The path is either a Node from the manifest
                    // (which already has correct slash_bits) or an
                    // implicit dependency from a depfile which does not
                    // affect the build command.
                    let node_idx = state.node_state.prepare_node(&path_entry.path, 0);
                    let expected_id = !path_entry.checksum;
                    let id = self.nodes.len();
                    if id as u32 != expected_id
                        || state.node_state.get_node(node_idx).id() >= 0
                    {
                        // Another process has been writing to the log
                        // concurrently; recover from here.
                        truncate_and_warn = true;
                        break;
                    }
                    state
                        .node_state
                        .get_node_mut(node_idx)
                        .set_id(id as isize);
                    self.nodes.push(node_idx);
                }
                Entry::Deps(deps_entry) => {
                    let mut nodes = Vec::with_capacity(deps_entry.deps.len());
                    let mut out_of_range = false;
                    for dep_id in &deps_entry.deps {
                        match self.nodes.get(*dep_id as usize) {
                            Some(&dep_node) => nodes.push(dep_node),
                            None => {
                                out_of_range = true;
                                break;
                            }
                        }
                    }
                    if out_of_range || self.nodes.get(deps_entry.output as usize).is_none() {
                        truncate_and_warn = true;
                        break;
                    }

                    total_dep_record_count += 1;
                    let was_there = self.update_deps(
                        deps_entry.output as usize,
                        Deps {
                            mtime: TimeStamp(deps_entry.mtime),
                            nodes,
                        },
                    );
                    if !was_there {
                        unique_dep_record_count += 1;
                    }
                }
                // A stray version record mid-file carries no data.
                Entry::Version(_) => {}
            }

            offset += consumed;
        }

        drop(reader);

        if truncate_and_warn {
            // An error occurred while loading; try to recover by
            // truncating the file to the last fully-read record.
            let truncate = OpenOptions::new()
                .write(true)
                .open(path)
                .and_then(|file| file.set_len(offset));
            if let Err(err) = truncate {
                return Err(format!("truncating {}: {}", path, err));
            }
            // The truncate succeeded; report the load error as a warning
            // because the build can proceed.
            return Ok(Some("premature end of file; recovering".to_owned()));
        }

        // Decide whether it's time to rebuild the log:
        // - if we're upgrading versions
        // - if it's getting large
        const MIN_COMPACTION_ENTRY_COUNT: usize = 100;
        const MIN_COMPACTION_DEPS_ENTRY_COUNT: usize = 1000;
        const COMPACTION_RATIO: usize = 3;
        if log_version.unwrap_or(0) < CURRENT_VERSION {
            self.needs_recompaction = true;
        } else if total_entry_count > MIN_COMPACTION_ENTRY_COUNT
            && total_entry_count > unique_entry_count * COMPACTION_RATIO
        {
            self.needs_recompaction = true;
        } else if total_dep_record_count > MIN_COMPACTION_DEPS_ENTRY_COUNT
            && total_dep_record_count > unique_dep_record_count * COMPACTION_RATIO
        {
            self.needs_recompaction = true;
        }

        Ok(None)
    }

    /// Lookup a previously-run command by its output path.
    pub fn lookup_by_output(&self, path: &str) -> Option<&LogEntry> {
        self.entries.get(path)
    }

    /// The recorded deps for a node, if any.
    pub fn get_deps(&self, node: &Node) -> Option<&Deps> {
        // A node with no id was never referenced in a deps record.
        let id = node.id();
        if id < 0 || id as usize >= self.deps.len() {
            return None;
        }
        self.deps[id as usize].as_ref()
    }

    /// Returns whether the deps entry for a node is still reachable from
    /// the manifest.
    ///
    /// The log can contain deps entries for files that were built in the
    /// past but are no longer part of the manifest.  Without the check for
    /// a "deps" binding, a chain of two or more nodes that each had deps
    /// wouldn't be collected in a single recompaction.
    pub fn is_deps_entry_live_for(&self, state: &State, node_idx: NodeIndex) -> bool {
        match state.node_state.get_node(node_idx).in_edge() {
            Some(edge_idx) => !state
                .edge_state
                .get_edge(edge_idx)
                .get_binding(&state.node_state, "deps")
                .is_empty(),
            None => false,
        }
    }

    /// Rewrite the known log entries, throwing away old data.
    pub fn recompact(
        &mut self,
        path: &str,
        user: &dyn BuildLogUser,
        state: &mut State,
    ) -> Result<(), String> {
        self.close();
        let temp_path = format!("{}.recompact", path);

        // open_for_write() opens for append.  Make sure it's not appending
        // to a left-over file from a previous recompaction attempt that
        // crashed somehow.
        let _ = fs::remove_file(&temp_path);

        let mut new_log = BuildLog::new();
        new_log.open_for_write(&temp_path, user, state)?;

        // Write out all entries but skip dead paths.
        for entry in self.entries.values() {
            if user.is_path_dead(state, &entry.output) {
                continue;
            }
            if let Err(err) = new_log.record_command_for_path(
                &entry.output,
                entry.command_hash,
                entry.start_time,
                entry.end_time,
                entry.mtime,
            ) {
                let _ = fs::remove_file(&temp_path);
                return Err(err);
            }
        }

        // Clear all known ids so that new ones can be reassigned.  The new
        // indices will refer to the ordering in the new log, not this one.
        for &node_idx in &self.nodes {
            state.node_state.get_node_mut(node_idx).set_id(-1);
        }

        // Write out all deps again, dropping entries whose edges no longer
        // declare deps.
        for old_id in 0..self.deps.len() {
            let deps = match &self.deps[old_id] {
                // If the node at this id is a leaf, it has no deps.
                None => continue,
                Some(deps) => deps,
            };
            if !self.is_deps_entry_live_for(state, self.nodes[old_id]) {
                continue;
            }
            let dep_nodes = deps.nodes.clone();
            if let Err(err) =
                new_log.record_deps(state, self.nodes[old_id], deps.mtime, &dep_nodes)
            {
                let _ = fs::remove_file(&temp_path);
                return Err(err);
            }
        }

        new_log.close();

        // Steal the new log's in-memory state.
        self.entries = new_log.entries;
        self.nodes = new_log.nodes;
        self.deps = new_log.deps;

        fs::rename(&temp_path, path).map_err(|err| format!("renaming {}: {}", temp_path, err))
    }
}

impl Default for BuildLog {
    fn default() -> Self {
        BuildLog::new()
    }
}

/// Stream the raw records of a log file, for `majak debug dump-build-log`.
/// Returns Ok(false) if the file does not exist.  Dumping is best-effort:
/// it stops quietly at the first damaged record.
pub fn dump_records(
    path: &str,
    mut callback: impl FnMut(&Entry),
) -> Result<bool, String> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(ref err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(format!("opening {}: {}", path, err)),
    };
    let mut reader = BufReader::new(file);
    loop {
        match read_record(&mut reader) {
            (ReadStatus::Success(entry), _) => callback(&entry),
            (ReadStatus::Finished, _) | (ReadStatus::Failed, _) => break,
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::TestWithStateAndVFS;

    struct NothingIsDead;
    impl BuildLogUser for NothingIsDead {
        fn is_path_dead(&self, _state: &State, _path: &str) -> bool {
            false
        }
    }

    struct DeadPaths(Vec<String>);
    impl BuildLogUser for DeadPaths {
        fn is_path_dead(&self, _state: &State, path: &str) -> bool {
            self.0.iter().any(|p| p == path)
        }
    }

    fn manifest_fixture() -> TestWithStateAndVFS {
        let mut t = TestWithStateAndVFS::new_with_builtin_rule();
        t.assert_parse(concat!(
            "rule catdep\n",
            "  deps = gcc\n",
            "  depfile = $out.d\n",
            "  command = cat $in > $out\n",
            "build out: cat mid\n",
            "build mid: cat in\n",
            "build out.o: catdep out.c\n",
        ));
        t
    }

    fn log_path(dir: &tempfile::TempDir) -> String {
        dir.path()
            .join(BUILD_LOG_FILE_NAME)
            .to_str()
            .unwrap()
            .to_owned()
    }

    #[test]
    fn hash_command_is_pinned() {
        // The hash is part of the on-disk format; these values must never
        // change.
        assert_eq!(0x825e3d38f2a7975b, hash_command("cat in > out"));
        assert_ne!(hash_command("cat in > out"), hash_command("cat in > out2"));
        assert_eq!(hash_command("command"), hash_command("command"));
    }

    #[test]
    fn build_log_write_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let mut t = manifest_fixture();

        {
            let mut log = BuildLog::new();
            log.open_for_write(&path, &NothingIsDead, &mut t.state)
                .unwrap();
            let out = t.node("out");
            let edge_idx = t.state.node_state.get_node(out).in_edge().unwrap();
            log.record_command(&t.state, edge_idx, 15, 18, TimeStamp(1234))
                .unwrap();
            log.close();
        }

        let mut t2 = manifest_fixture();
        let mut log = BuildLog::new();
        assert_eq!(Ok(None), log.load(&path, &mut t2.state));

        let entry = log.lookup_by_output("out").expect("entry for out");
        assert_eq!("out", entry.output);
        assert_eq!(hash_command("cat mid > out"), entry.command_hash);
        assert_eq!(15, entry.start_time);
        assert_eq!(18, entry.end_time);
        assert_eq!(TimeStamp(1234), entry.mtime);
    }

    #[test]
    fn build_log_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let mut t = manifest_fixture();

        {
            let mut log = BuildLog::new();
            log.open_for_write(&path, &NothingIsDead, &mut t.state)
                .unwrap();
            log.record_command_for_path("out", 1, 0, 1, TimeStamp(10))
                .unwrap();
            log.record_command_for_path("out", 2, 2, 3, TimeStamp(20))
                .unwrap();
            log.close();
        }

        let mut t2 = manifest_fixture();
        let mut log = BuildLog::new();
        assert_eq!(Ok(None), log.load(&path, &mut t2.state));
        assert_eq!(1, log.entries().len());
        let entry = log.lookup_by_output("out").unwrap();
        assert_eq!(2, entry.command_hash);
        assert_eq!(TimeStamp(20), entry.mtime);
    }

    #[test]
    fn build_log_deps_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let mut t = manifest_fixture();
        let out_o = t.node("out.o");
        let out_c = t.node("out.c");
        let header = t.state.node_state.prepare_node("inc.h", 0);

        {
            let mut log = BuildLog::new();
            log.open_for_write(&path, &NothingIsDead, &mut t.state)
                .unwrap();
            log.record_deps(&mut t.state, out_o, TimeStamp(100), &[out_c, header])
                .unwrap();
            log.close();
        }

        let mut t2 = manifest_fixture();
        let mut log = BuildLog::new();
        assert_eq!(Ok(None), log.load(&path, &mut t2.state));

        let out_o2 = t2.node("out.o");
        let deps = log
            .get_deps(t2.state.node_state.get_node(out_o2))
            .expect("deps for out.o");
        assert_eq!(TimeStamp(100), deps.mtime);
        let dep_paths: Vec<&str> = deps
            .nodes
            .iter()
            .map(|&idx| t2.state.node_state.get_node(idx).path())
            .collect();
        assert_eq!(vec!["out.c", "inc.h"], dep_paths);
    }

    #[test]
    fn build_log_record_deps_skips_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let mut t = manifest_fixture();
        let out_o = t.node("out.o");
        let out_c = t.node("out.c");

        let mut log = BuildLog::new();
        log.open_for_write(&path, &NothingIsDead, &mut t.state)
            .unwrap();
        log.record_deps(&mut t.state, out_o, TimeStamp(100), &[out_c])
            .unwrap();
        let size_after_first = fs::metadata(&path).unwrap().len();

        // The same deps again: no new record.
        log.record_deps(&mut t.state, out_o, TimeStamp(100), &[out_c])
            .unwrap();
        assert_eq!(size_after_first, fs::metadata(&path).unwrap().len());

        // A different mtime does write.
        log.record_deps(&mut t.state, out_o, TimeStamp(200), &[out_c])
            .unwrap();
        assert!(fs::metadata(&path).unwrap().len() > size_after_first);
    }

    #[test]
    fn build_log_truncated_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let mut t = manifest_fixture();

        {
            let mut log = BuildLog::new();
            log.open_for_write(&path, &NothingIsDead, &mut t.state)
                .unwrap();
            log.record_command_for_path("first", 11, 0, 1, TimeStamp(1))
                .unwrap();
            log.record_command_for_path("second", 22, 1, 2, TimeStamp(2))
                .unwrap();
            log.close();
        }

        // Chop two bytes off the end, wounding the last record.
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 2)
            .unwrap();

        let mut t2 = manifest_fixture();
        let mut log = BuildLog::new();
        let warning = log.load(&path, &mut t2.state).unwrap();
        assert_eq!(
            Some("premature end of file; recovering".to_owned()),
            warning
        );
        assert!(log.lookup_by_output("first").is_some());
        assert!(log.lookup_by_output("second").is_none());

        // The file was truncated to the last valid boundary, so a second
        // load is clean.
        let mut t3 = manifest_fixture();
        let mut log = BuildLog::new();
        assert_eq!(Ok(None), log.load(&path, &mut t3.state));
        assert!(log.lookup_by_output("first").is_some());
    }

    #[test]
    fn build_log_truncate_anywhere_never_corrupts(){
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let mut t = manifest_fixture();
        let out_o = t.node("out.o");
        let out_c = t.node("out.c");

        {
            let mut log = BuildLog::new();
            log.open_for_write(&path, &NothingIsDead, &mut t.state)
                .unwrap();
            log.record_command_for_path("out", 7, 0, 1, TimeStamp(5))
                .unwrap();
            log.record_deps(&mut t.state, out_o, TimeStamp(9), &[out_c])
                .unwrap();
            log.close();
        }
        let full = fs::read(&path).unwrap();

        for cut in 0..full.len() {
            fs::write(&path, &full[..cut]).unwrap();
            let mut state = manifest_fixture();
            let mut log = BuildLog::new();
            // Either a clean load or a recovered one; never an error.
            log.load(&path, &mut state.state).unwrap();
        }
    }

    #[test]
    fn build_log_concurrent_writer_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let mut t = manifest_fixture();
        let out_o = t.node("out.o");
        let out_c = t.node("out.c");

        {
            let mut log = BuildLog::new();
            log.open_for_write(&path, &NothingIsDead, &mut t.state)
                .unwrap();
            log.record_deps(&mut t.state, out_o, TimeStamp(9), &[out_c])
                .unwrap();
            log.close();
        }

        // A second process that loaded an older copy of the log would
        // append a path entry with a stale expected id.  Fake one.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            let record = encode_record(Entry::Path(log_schema::PathEntry {
                path: "stale".to_owned(),
                checksum: !5u32,
            }));
            file.write_all(&record).unwrap();
        }

        let mut t2 = manifest_fixture();
        let mut log = BuildLog::new();
        let warning = log.load(&path, &mut t2.state).unwrap();
        assert_eq!(
            Some("premature end of file; recovering".to_owned()),
            warning
        );
        // The good prefix survived; the conflicting record is gone.
        assert_eq!(2, log.nodes().len());
        assert!(t2.state.node_state.lookup_node("stale").is_none() || {
            let idx = t2.state.node_state.lookup_node("stale").unwrap();
            t2.state.node_state.get_node(idx).id() < 0
        });
    }

    #[test]
    fn build_log_missing_version_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        fs::write(&path, b"this is not a log file").unwrap();

        let mut t = manifest_fixture();
        let mut log = BuildLog::new();
        let warning = log.load(&path, &mut t.state).unwrap().unwrap();
        assert!(warning.contains("starting over"), "got: {}", warning);
        assert!(log.entries().is_empty());
        // The invalid file is gone; the next load sees nothing.
        assert!(!dir.path().join(BUILD_LOG_FILE_NAME).exists());
    }

    #[test]
    fn build_log_recompact_drops_dead_and_duplicate_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let mut t = manifest_fixture();
        let out_o = t.node("out.o");
        let out_c = t.node("out.c");

        {
            let mut log = BuildLog::new();
            log.open_for_write(&path, &NothingIsDead, &mut t.state)
                .unwrap();
            for round in 0..4 {
                log.record_command_for_path("out", round, 0, 1, TimeStamp(round as i64))
                    .unwrap();
                log.record_command_for_path("gone", round, 0, 1, TimeStamp(round as i64))
                    .unwrap();
            }
            log.record_deps(&mut t.state, out_o, TimeStamp(50), &[out_c])
                .unwrap();
            log.close();
        }

        let mut log = BuildLog::new();
        let mut t2 = manifest_fixture();
        assert_eq!(Ok(None), log.load(&path, &mut t2.state));
        log.recompact(&path, &DeadPaths(vec!["gone".to_owned()]), &mut t2.state)
            .unwrap();

        assert!(log.lookup_by_output("gone").is_none());
        assert_eq!(3, log.lookup_by_output("out").unwrap().command_hash);

        // Reload from disk: the same state, and compaction is idempotent.
        let mut t3 = manifest_fixture();
        let mut reloaded = BuildLog::new();
        assert_eq!(Ok(None), reloaded.load(&path, &mut t3.state));
        assert_eq!(1, reloaded.entries().len());
        let out_o3 = t3.node("out.o");
        assert!(reloaded
            .get_deps(t3.state.node_state.get_node(out_o3))
            .is_some());

        let before = fs::read(&path).unwrap();
        reloaded
            .recompact(&path, &DeadPaths(Vec::new()), &mut t3.state)
            .unwrap();
        let after = fs::read(&path).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn build_log_recompact_drops_ids_for_edges_without_deps() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let mut t = manifest_fixture();
        // "out" is produced by plain cat (no deps binding); "out.o" by
        // catdep (deps = gcc).
        let out = t.node("out");
        let out_o = t.node("out.o");
        let out_c = t.node("out.c");
        let mid = t.node("mid");

        {
            let mut log = BuildLog::new();
            log.open_for_write(&path, &NothingIsDead, &mut t.state)
                .unwrap();
            log.record_deps(&mut t.state, out, TimeStamp(10), &[mid])
                .unwrap();
            log.record_deps(&mut t.state, out_o, TimeStamp(10), &[out_c])
                .unwrap();
            log.close();
        }

        let mut log = BuildLog::new();
        let mut t2 = manifest_fixture();
        assert_eq!(Ok(None), log.load(&path, &mut t2.state));
        log.recompact(&path, &NothingIsDead, &mut t2.state).unwrap();

        // The node whose edge lost (never had) a deps binding loses its
        // id and its recorded deps; the deps=gcc one keeps them.
        let out2 = t2.node("out");
        let out_o2 = t2.node("out.o");
        assert_eq!(-1, t2.state.node_state.get_node(out2).id());
        assert!(log.get_deps(t2.state.node_state.get_node(out2)).is_none());
        assert!(log.get_deps(t2.state.node_state.get_node(out_o2)).is_some());
    }
}
