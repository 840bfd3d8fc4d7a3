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

use std::fmt;

/// When considering file modification times we only care about a total
/// order between them, so they are carried around as an opaque value.
///
/// Possible values:
///   -1: file hasn't been examined yet
///    0: we looked, and the file doesn't exist
///   >0: the file's actual mtime, nanoseconds packed into an i64
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct TimeStamp(pub i64);

impl TimeStamp {
    pub fn unknown() -> TimeStamp {
        TimeStamp(-1)
    }

    pub fn missing() -> TimeStamp {
        TimeStamp(0)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}
