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

/// The version of the executable, reported by `majak version` and checked
/// against the manifest's `ninja_required_version` binding.
pub const MAJAK_VERSION: &str = clap::crate_version!();

pub fn parse_version(version: &str) -> (u32, u32) {
    let mut split = version.split('.');
    let major = split
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);
    let minor = split
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);
    (major, minor)
}

/// Check whether the manifest's required version is compatible with this
/// executable.  A newer requirement than we provide is fatal.
pub fn check_version(version: &str) {
    let (bin_major, bin_minor) = parse_version(MAJAK_VERSION);
    let (file_major, file_minor) = parse_version(version);

    if bin_major > file_major {
        warning!(
            "majak executable version ({}) greater than build file ninja_required_version \
             ({}); versions may be incompatible.",
            MAJAK_VERSION,
            version
        );
        return;
    }

    if (bin_major == file_major && bin_minor < file_minor) || bin_major < file_major {
        fatal!(
            "majak version ({}) incompatible with build file ninja_required_version \
             version ({}).",
            MAJAK_VERSION,
            version
        );
    }
}
