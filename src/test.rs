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

//! Support utilities for tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;

use crate::disk_interface::{DiskInterface, FileReader, FileReaderError};
use crate::graph::NodeIndex;
use crate::manifest_parser::{ManifestParser, ManifestParserOptions};
use crate::state::State;
use crate::timestamp::TimeStamp;

/// A base test fixture: a State plus a virtual file system, optionally
/// with a built-in "cat" rule.
pub struct TestWithStateAndVFS {
    pub state: State,
    pub fs: VirtualFileSystem,
}

impl TestWithStateAndVFS {
    pub fn new_minimal() -> Self {
        TestWithStateAndVFS {
            state: State::new(),
            fs: VirtualFileSystem::new(),
        }
    }

    pub fn new_with_builtin_rule() -> Self {
        let mut test = Self::new_minimal();
        test.assert_parse("rule cat\n  command = cat $in > $out\n");
        test
    }

    pub fn assert_parse_with_options(&mut self, input: &str, options: ManifestParserOptions) {
        {
            let mut parser = ManifestParser::new(&mut self.state, &self.fs, options);
            assert_eq!(Ok(()), parser.parse_test(input));
        }
        self.state.verify_graph();
    }

    pub fn assert_parse(&mut self, input: &str) {
        self.assert_parse_with_options(input, Default::default());
    }

    pub fn assert_parse_error(&mut self, input: &str, err: &str) {
        let mut parser =
            ManifestParser::new(&mut self.state, &self.fs, Default::default());
        assert_eq!(Err(err.to_owned()), parser.parse_test(input));
    }

    pub fn assert_parse_error_containing(&mut self, input: &str, fragment: &str) {
        let mut parser =
            ManifestParser::new(&mut self.state, &self.fs, Default::default());
        let err = parser.parse_test(input).unwrap_err();
        assert!(
            err.contains(fragment),
            "error {:?} does not mention {:?}",
            err,
            fragment
        );
    }

    /// Short way to get a node by its path.
    pub fn node(&self, path: &str) -> NodeIndex {
        self.state
            .node_state
            .lookup_node(path)
            .unwrap_or_else(|| panic!("no node with path {:?}", path))
    }
}

/// An entry for a single in-memory file.
struct VirtualFileSystemEntry {
    mtime: TimeStamp,
    contents: Vec<u8>,
}

/// An implementation of DiskInterface that uses an in-memory
/// representation of disk state.  It also logs file accesses and
/// directory creations so it can be used by tests to verify disk access
/// patterns.
pub struct VirtualFileSystem {
    directories_made: RefCell<Vec<String>>,
    pub files_read: RefCell<Vec<String>>,
    files: RefCell<HashMap<String, VirtualFileSystemEntry>>,
    files_removed: RefCell<HashSet<String>>,
    files_created: RefCell<HashSet<String>>,
    /// A simple fake timestamp for file operations.
    now: Cell<i64>,
}

impl VirtualFileSystem {
    pub fn new() -> Self {
        VirtualFileSystem {
            directories_made: RefCell::new(Vec::new()),
            files_read: RefCell::new(Vec::new()),
            files: RefCell::new(HashMap::new()),
            files_removed: RefCell::new(HashSet::new()),
            files_created: RefCell::new(HashSet::new()),
            now: Cell::new(1),
        }
    }

    /// Tick "time" forwards; subsequent file operations will be newer than
    /// previous ones.
    pub fn tick(&self) -> i64 {
        self.now.set(self.now.get() + 1);
        self.now.get()
    }

    /// "Create" a file with contents.
    pub fn create(&self, path: &str, contents: &str) {
        self.files.borrow_mut().insert(
            path.to_owned(),
            VirtualFileSystemEntry {
                mtime: TimeStamp(self.now.get()),
                contents: contents.as_bytes().to_owned(),
            },
        );
        self.files_created.borrow_mut().insert(path.to_owned());
    }

    pub fn directories_made(&self) -> Vec<String> {
        self.directories_made.borrow().clone()
    }

    pub fn was_removed(&self, path: &str) -> bool {
        self.files_removed.borrow().contains(path)
    }

    pub fn was_created(&self, path: &str) -> bool {
        self.files_created.borrow().contains(path)
    }
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        VirtualFileSystem::new()
    }
}

impl FileReader for VirtualFileSystem {
    fn read_file(&self, path: &str, contents: &mut Vec<u8>) -> Result<(), FileReaderError> {
        self.files_read.borrow_mut().push(path.to_owned());
        match self.files.borrow().get(path) {
            Some(entry) => {
                *contents = entry.contents.clone();
                Ok(())
            }
            None => Err(FileReaderError::NotFound(
                "No such file or directory".to_owned(),
            )),
        }
    }
}

impl DiskInterface for VirtualFileSystem {
    fn stat(&self, path: &str) -> Result<TimeStamp, String> {
        match self.files.borrow().get(path) {
            Some(entry) => Ok(entry.mtime),
            None => Ok(TimeStamp(0)),
        }
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), String> {
        self.files.borrow_mut().insert(
            path.to_owned(),
            VirtualFileSystemEntry {
                mtime: TimeStamp(self.now.get()),
                contents: contents.to_owned(),
            },
        );
        self.files_created.borrow_mut().insert(path.to_owned());
        Ok(())
    }

    fn make_dir(&self, path: &str) -> io::Result<()> {
        self.directories_made.borrow_mut().push(path.to_owned());
        Ok(())
    }

    fn make_dirs(&self, path: &str) -> io::Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            let parent = parent.to_string_lossy();
            if !parent.is_empty() {
                self.directories_made.borrow_mut().push(parent.into_owned());
            }
        }
        Ok(())
    }

    fn remove_file(&self, path: &str) -> Result<bool, String> {
        if self.directories_made.borrow().iter().any(|d| d == path) {
            return Err(format!("remove({}): is a directory", path));
        }
        if self.files.borrow_mut().remove(path).is_some() {
            self.files_removed.borrow_mut().insert(path.to_owned());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn truncate(&self, path: &str, size: u64) -> Result<(), String> {
        match self.files.borrow_mut().get_mut(path) {
            Some(entry) => {
                entry.contents.truncate(size as usize);
                Ok(())
            }
            None => Err(format!("truncate({}): missing file", path)),
        }
    }
}
