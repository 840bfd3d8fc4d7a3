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

use std::collections::BTreeSet;

/// Visual Studio's cl.exe requires some massaging to work with majak;
/// for example, it emits include information on stderr in a funny format
/// when building with /showIncludes.  This class wraps a CommandRunner
/// result to extract the dependency information.
#[derive(Default)]
pub struct CLParser {
    /// Dependency paths parsed out of the output.
    pub includes: BTreeSet<String>,
}

impl CLParser {
    pub fn new() -> Self {
        Default::default()
    }

    /// Return a pointer past the prefix if |line| starts with it.
    fn filter_show_includes<'a>(line: &'a str, deps_prefix: &str) -> Option<&'a str> {
        const DEPS_PREFIX_ENGLISH: &str = "Note: including file: ";
        let prefix = if deps_prefix.is_empty() {
            DEPS_PREFIX_ENGLISH
        } else {
            deps_prefix
        };
        line.strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches(' '))
    }

    /// Return true if a mentioned include file is a system path.
    /// Filtering these out reduces dependency information considerably.
    fn is_system_include(normalized_path: &str) -> bool {
        // TODO: this is a heuristic, perhaps there's a better way?
        normalized_path.contains("program files") || normalized_path.contains("microsoft visual studio")
    }

    /// Return true if a line of output from the compiler is just the name
    /// of an input file, which cl.exe echoes unasked.
    fn filter_input_filename(line: &str) -> bool {
        let line = line.to_ascii_lowercase();
        // TODO: other extensions, like .asm?
        line.ends_with(".c")
            || line.ends_with(".cc")
            || line.ends_with(".cxx")
            || line.ends_with(".cpp")
    }

    /// Dedup key for an include path.  Windows paths compare
    /// case-insensitively.
    fn normalize_include(include: &str) -> Result<String, String> {
        let (canonical, _slash_bits) = crate::utils::canonicalize_path(include)?;
        if crate::utils::WINDOWS_PATH {
            Ok(canonical.to_ascii_lowercase())
        } else {
            Ok(canonical)
        }
    }

    /// Parse the full output of cl, filling filtered_output with the text
    /// that should be printed (if any).  Returns an error on unexpected
    /// output.
    pub fn parse(
        &mut self,
        output: &str,
        deps_prefix: &str,
        filtered_output: &mut String,
    ) -> Result<(), String> {
        // Loop over all lines in the output to process them.
        let mut seen_show_includes = false;
        let bytes = output.as_bytes();
        let mut start = 0usize;
        while start < output.len() {
            let end = bytes[start..]
                .iter()
                .position(|&c| c == b'\r' || c == b'\n')
                .map(|pos| start + pos)
                .unwrap_or_else(|| output.len());
            let line = &output[start..end];

            if let Some(include) = Self::filter_show_includes(line, deps_prefix) {
                seen_show_includes = true;
                let normalized = Self::normalize_include(include)?;
                if !Self::is_system_include(&normalized) {
                    self.includes.insert(normalized);
                }
            } else if !seen_show_includes && Self::filter_input_filename(line) {
                // Drop it.
            } else {
                filtered_output.push_str(line);
                filtered_output.push('\n');
            }

            let mut next = end;
            if next < output.len() && bytes[next] == b'\r' {
                next += 1;
            }
            if next < output.len() && bytes[next] == b'\n' {
                next += 1;
            }
            start = next;
        }

        Ok(())
    }
}
