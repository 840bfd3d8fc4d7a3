// Copyright 2011 Google Inc. All Rights Reserved.
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

use std::fs;
use std::io::{self, ErrorKind, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::timestamp::TimeStamp;

/// Result of read_file.
#[derive(Debug)]
pub enum FileReaderError {
    NotFound(String),
    OtherError(String),
}

impl FileReaderError {
    pub fn message(&self) -> &str {
        match self {
            FileReaderError::NotFound(message) => message,
            FileReaderError::OtherError(message) => message,
        }
    }
}

/// Interface for reading files from disk.  See DiskInterface for details.
/// This base offers the minimum interface needed just to read files.
pub trait FileReader {
    /// Read a file and store its contents in the given buffer.
    fn read_file(&self, path: &str, contents: &mut Vec<u8>) -> Result<(), FileReaderError>;
}

/// Interface for accessing the disk.
///
/// Abstract so it can be mocked out for tests.  The real implementation
/// is RealDiskInterface.
pub trait DiskInterface: FileReader {
    /// stat() a file, returning the mtime, 0 if the file doesn't exist,
    /// or an error.
    fn stat(&self, path: &str) -> Result<TimeStamp, String>;

    /// Create a file with the given contents.
    fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), String>;

    /// Create a directory.
    fn make_dir(&self, path: &str) -> io::Result<()>;

    /// Create all the parent directories of path; like `mkdir -p
    /// $(dirname path)`.  Idempotent.
    fn make_dirs(&self, path: &str) -> io::Result<()>;

    /// Remove the file named path.  Returns Ok(true) if the file was
    /// removed and Ok(false) if it did not exist.
    fn remove_file(&self, path: &str) -> Result<bool, String>;

    /// Truncate the file named path to the given size.
    fn truncate(&self, path: &str, size: u64) -> Result<(), String>;
}

/// Implementation of DiskInterface that actually hits the disk.
pub struct RealDiskInterface {}

impl FileReader for RealDiskInterface {
    fn read_file(&self, path: &str, contents: &mut Vec<u8>) -> Result<(), FileReaderError> {
        let mut file = fs::File::open(path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                FileReaderError::NotFound(format!("{}", err))
            } else {
                FileReaderError::OtherError(format!("{}", err))
            }
        })?;
        file.read_to_end(contents)
            .map_err(|err| FileReaderError::OtherError(format!("{}", err)))?;
        Ok(())
    }
}

#[cfg(unix)]
fn is_missing_error(err: &io::Error) -> bool {
    err.kind() == ErrorKind::NotFound || err.raw_os_error() == Some(libc::ENOTDIR)
}

#[cfg(not(unix))]
fn is_missing_error(err: &io::Error) -> bool {
    err.kind() == ErrorKind::NotFound
}

impl DiskInterface for RealDiskInterface {
    fn stat(&self, path: &str) -> Result<TimeStamp, String> {
        match fs::metadata(path) {
            Ok(metadata) => {
                let modified = metadata
                    .modified()
                    .map_err(|err| format!("stat({}): {}", path, err))?;
                let nanos = match modified.duration_since(UNIX_EPOCH) {
                    Ok(duration) => duration.as_nanos() as i64,
                    // Pre-epoch mtimes would read as "missing"; clamp them
                    // to the oldest representable time instead.
                    Err(_) => 1,
                };
                Ok(TimeStamp(nanos))
            }
            Err(ref err) if is_missing_error(err) => Ok(TimeStamp(0)),
            Err(err) => Err(format!("stat({}): {}", path, err)),
        }
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), String> {
        fs::write(path, contents).map_err(|err| format!("writing {}: {}", path, err))
    }

    fn make_dir(&self, path: &str) -> io::Result<()> {
        fs::DirBuilder::new().recursive(false).create(path)
    }

    fn make_dirs(&self, path: &str) -> io::Result<()> {
        match Path::new(path).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::DirBuilder::new().recursive(true).create(parent)
            }
            _ => Ok(()),
        }
    }

    fn remove_file(&self, path: &str) -> Result<bool, String> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(ref err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(format!("remove({}): {}", path, err)),
        }
    }

    fn truncate(&self, path: &str, size: u64) -> Result<(), String> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|err| format!("truncate({}): {}", path, err))?;
        file.set_len(size)
            .map_err(|err| format!("truncate({}): {}", path, err))
    }
}
