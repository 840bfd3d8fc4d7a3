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

//! The record schema of the build log.  The on-disk file is a sequence of
//! `{u32 le size; body}` records where each body is an EntryHolder with
//! exactly one of the entry variants set.  Field tags are part of the
//! on-disk format and must never be renumbered.

/// Must be the first record of every log file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VersionEntry {
    #[prost(uint32, tag = "1")]
    pub version: u32,
}

/// One command execution, per output.  The latest record for an output
/// string wins.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BuildEntry {
    #[prost(string, tag = "1")]
    pub output: ::prost::alloc::string::String,
    #[prost(fixed64, tag = "2")]
    pub command_hash: u64,
    #[prost(int32, tag = "3")]
    pub start_time: i32,
    #[prost(int32, tag = "4")]
    pub end_time: i32,
    #[prost(int64, tag = "5")]
    pub mtime: i64,
}

/// Interns a path, implicitly assigning it the next dense integer id.
/// The checksum is the one's complement of the expected id, used to detect
/// concurrent writers appending to the same log.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PathEntry {
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
    #[prost(fixed32, tag = "2")]
    pub checksum: u32,
}

/// The dynamically discovered inputs of one output, by path id.  All ids
/// referenced here appear earlier in the file.  The latest record for an
/// output id wins.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DepsEntry {
    #[prost(uint32, tag = "1")]
    pub output: u32,
    #[prost(int64, tag = "2")]
    pub mtime: i64,
    #[prost(uint32, repeated, tag = "3")]
    pub deps: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntryHolder {
    #[prost(oneof = "Entry", tags = "1, 2, 3, 4")]
    pub entry: ::core::option::Option<Entry>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Entry {
    #[prost(message, tag = "1")]
    Version(VersionEntry),
    #[prost(message, tag = "2")]
    Build(BuildEntry),
    #[prost(message, tag = "3")]
    Path(PathEntry),
    #[prost(message, tag = "4")]
    Deps(DepsEntry),
}
