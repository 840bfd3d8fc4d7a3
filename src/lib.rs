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

#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod utils;
#[cfg(test)]
pub mod test;
pub mod build;
pub mod build_log;
pub mod clparser;
pub mod depfile_parser;
pub mod disk_interface;
pub mod eval_env;
pub mod exit_status;
pub mod graph;
pub mod lexer;
pub mod line_printer;
pub mod log_schema;
pub mod majak;
pub mod manifest_parser;
pub mod metrics;
pub mod state;
pub mod subprocess;
pub mod timestamp;
pub mod version;
