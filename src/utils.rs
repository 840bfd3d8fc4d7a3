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

/// Log an explanation of why a command must be re-run, when explaining
/// is enabled (-d explain).  The flag lives in the caller's config rather
/// than in process-global state.
#[macro_export]
macro_rules! explain {
    ($enabled:expr, $fmt:expr) =>
        (if $enabled {
            eprint!(concat!("majak explain: ", $fmt, "\n"))
        });
    ($enabled:expr, $fmt:expr, $($arg:tt)*) =>
        (if $enabled {
            eprint!(concat!("majak explain: ", $fmt, "\n"), $($arg)*)
        });
}

/// Log a fatal message and exit.
#[macro_export]
macro_rules! fatal {
    ($fmt:expr) =>
        ({
            eprint!(concat!("majak fatal: ", $fmt, "\n"));
            $crate::utils::exit();
        });
    ($fmt:expr, $($arg:tt)*) =>
        ({
            eprint!(concat!("majak fatal: ", $fmt, "\n"), $($arg)*);
            $crate::utils::exit();
        });
}

/// Log a warning message.
#[macro_export]
macro_rules! warning {
    ($fmt:expr) =>
        (eprint!(concat!("majak warning: ", $fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) =>
        (eprint!(concat!("majak warning: ", $fmt, "\n"), $($arg)*));
}

/// Log an error message.
#[macro_export]
macro_rules! error {
    ($fmt:expr) =>
        (eprint!(concat!("majak error: ", $fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) =>
        (eprint!(concat!("majak error: ", $fmt, "\n"), $($arg)*));
}

pub fn exit() -> ! {
    use std::io::Write;

    // Some tools may inject extra threads; flush explicitly rather than
    // relying on runtime teardown.
    let _ = std::io::stderr().flush();
    let _ = std::io::stdout().flush();
    std::process::exit(1);
}

pub fn get_processor_count() -> usize {
    num_cpus::get()
}

#[cfg(windows)]
pub const WINDOWS_PATH: bool = true;
#[cfg(not(windows))]
pub const WINDOWS_PATH: bool = false;

fn is_path_separator(c: u8) -> bool {
    c == b'/' || WINDOWS_PATH && c == b'\\'
}

const MAX_PATH_COMPONENTS: usize = 60;

/// Canonicalize a path like "foo/../bar.h" into just "bar.h".
/// Returns the canonical path and the slash bits: bits set starting from
/// lowest for a backslash that was normalized to a forward slash (only
/// meaningful on Windows).
pub fn canonicalize_path(path: &str) -> Result<(String, u64), String> {
    // WARNING: this function is performance-critical; please benchmark
    // any changes you make to it.
    if path.is_empty() {
        return Err("empty path".to_owned());
    }

    let src = path.as_bytes();
    let len = src.len();
    let mut dst: Vec<u8> = Vec::with_capacity(len);

    let mut components = [0usize; MAX_PATH_COMPONENTS];
    let mut component_count = 0usize;

    let mut i = 0usize;
    if is_path_separator(src[0]) {
        // A leading "//" is a network path on Windows and must survive.
        if WINDOWS_PATH && len > 1 && is_path_separator(src[1]) {
            dst.push(src[0]);
            dst.push(src[1]);
            i = 2;
        } else {
            dst.push(src[0]);
            i = 1;
        }
    }

    while i < len {
        if src[i] == b'.' {
            if i + 1 == len || is_path_separator(src[i + 1]) {
                // '.' component; eliminate.
                i += 2;
                continue;
            }
            if src[i + 1] == b'.' && (i + 2 == len || is_path_separator(src[i + 2])) {
                // '..' component.  Back up if possible.
                if component_count > 0 {
                    dst.truncate(components[component_count - 1]);
                    component_count -= 1;
                } else {
                    dst.push(b'.');
                    dst.push(b'.');
                    if i + 2 < len {
                        dst.push(src[i + 2]);
                    }
                }
                i += 3;
                continue;
            }
        }

        if is_path_separator(src[i]) {
            i += 1;
            continue;
        }

        if component_count == MAX_PATH_COMPONENTS {
            return Err(format!("path has too many components : {}", path));
        }
        components[component_count] = dst.len();
        component_count += 1;

        while i < len && !is_path_separator(src[i]) {
            dst.push(src[i]);
            i += 1;
        }
        if i < len {
            // Copy the trailing separator as well.
            dst.push(src[i]);
            i += 1;
        }
    }

    if dst.is_empty() {
        dst.push(b'.');
    } else if is_path_separator(*dst.last().unwrap())
        && !(WINDOWS_PATH && dst.len() == 2 && is_path_separator(dst[0]))
    {
        dst.pop();
    }

    if dst.is_empty() {
        return Err("empty path".to_owned());
    }

    let mut slash_bits = 0u64;
    if WINDOWS_PATH {
        let mut mask = 1u64;
        for c in dst.iter_mut() {
            if *c == b'\\' {
                slash_bits |= mask;
                *c = b'/';
                mask <<= 1;
            } else if *c == b'/' {
                mask <<= 1;
            }
        }
    }

    // The input was valid UTF-8 and we only dropped or copied whole bytes
    // of it, plus ASCII '.' and separators.
    let canonical = String::from_utf8(dst).map_err(|_| "invalid utf-8 in path".to_owned())?;
    Ok((canonical, slash_bits))
}

/// Undo the slash normalization of canonicalize_path(), using the recorded
/// slash bits to restore the separators the manifest originally used.
pub fn decanonicalize_path(path: &str, slash_bits: u64) -> String {
    if !WINDOWS_PATH || slash_bits == 0 {
        return path.to_owned();
    }
    let mut result: Vec<u8> = path.as_bytes().to_owned();
    let mut mask = 1u64;
    for c in result.iter_mut() {
        if *c == b'/' {
            if (slash_bits & mask) != 0 {
                *c = b'\\';
            }
            mask <<= 1;
        }
    }
    String::from_utf8(result).unwrap_or_else(|_| path.to_owned())
}

fn is_known_shell_safe_char(ch: u8) -> bool {
    match ch {
        b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' => true,
        b'_' | b'+' | b'-' | b'.' | b'/' => true,
        _ => false,
    }
}

fn is_known_win32_safe_char(ch: u8) -> bool {
    !matches!(ch, b' ' | b'"')
}

/// Append |input| to |result|, escaping according to the whims of Bash.
/// Appends the string unmodified if it contains no problematic characters.
pub fn get_shell_escaped_string(input: &str, result: &mut String) {
    if input.bytes().all(is_known_shell_safe_char) {
        result.push_str(input);
        return;
    }

    const QUOTE: char = '\'';
    result.push(QUOTE);
    for c in input.chars() {
        if c == QUOTE {
            result.push_str("'\\'");
        }
        result.push(c);
    }
    result.push(QUOTE);
}

/// Append |input| to |result|, escaping according to Win32's
/// CommandLineToArgvW().
pub fn get_win32_escaped_string(input: &str, result: &mut String) {
    if input.bytes().all(is_known_win32_safe_char) {
        result.push_str(input);
        return;
    }

    const QUOTE: char = '"';
    const BACKSLASH: char = '\\';

    result.push(QUOTE);
    let mut consecutive_backslash_count = 0usize;
    for c in input.chars() {
        match c {
            BACKSLASH => consecutive_backslash_count += 1,
            QUOTE => {
                for _ in 0..consecutive_backslash_count + 1 {
                    result.push(BACKSLASH);
                }
                consecutive_backslash_count = 0;
            }
            _ => consecutive_backslash_count = 0,
        }
        result.push(c);
    }
    for _ in 0..consecutive_backslash_count {
        result.push(BACKSLASH);
    }
    result.push(QUOTE);
}

fn is_latin_alpha(c: u8) -> bool {
    // u8::is_ascii_alphabetic would also admit nothing more; keep the CSI
    // final-byte check explicit.
    (b'a'..=b'z').contains(&c) || (b'A'..=b'Z').contains(&c)
}

/// Remove all ANSI escape codes (http://www.termsys.demon.co.uk/vtansi.htm).
pub fn strip_ansi_escape_codes(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut stripped = Vec::with_capacity(bytes.len());

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != 0x1b {
            // Not an escape code.
            stripped.push(bytes[i]);
            i += 1;
            continue;
        }

        // Only strip CSIs for now.
        if i + 1 >= bytes.len() {
            break;
        }
        if bytes[i + 1] != b'[' {
            i += 1;
            continue;
        }
        i += 2;

        // Skip everything up to and including the next [a-zA-Z].
        while i < bytes.len() && !is_latin_alpha(bytes[i]) {
            i += 1;
        }
        i += 1;
    }
    String::from_utf8_lossy(&stripped).into_owned()
}

/// Elide the given string with '...' in the middle if its length exceeds
/// |width|.
pub fn elide_middle(text: &str, width: usize) -> String {
    const MARGIN: usize = 3; // Space for "...".
    if text.len() + MARGIN <= width {
        return text.to_owned();
    }
    let elide_size = width.saturating_sub(MARGIN) / 2;
    format!(
        "{}...{}",
        &text[..elide_size],
        &text[text.len() - elide_size..]
    )
}

/// Compute the Levenshtein distance between |s1| and |s2|, giving up once
/// it exceeds |max_edit_distance| (0 disables the cap).
pub fn edit_distance(
    s1: &str,
    s2: &str,
    allow_replacements: bool,
    max_edit_distance: usize,
) -> usize {
    // The classic dynamic-programming algorithm, keeping only one row plus
    // one element live at a time.
    let s1 = s1.as_bytes();
    let s2 = s2.as_bytes();
    let m = s1.len();
    let n = s2.len();

    let mut row: Vec<usize> = (0..=n).collect();

    for y in 1..=m {
        row[0] = y;
        let mut best_this_row = row[0];

        let mut previous = y - 1;
        for x in 1..=n {
            let old_row = row[x];
            if allow_replacements {
                let subst = previous + if s1[y - 1] == s2[x - 1] { 0 } else { 1 };
                row[x] = subst.min(row[x - 1].min(row[x]) + 1);
            } else if s1[y - 1] == s2[x - 1] {
                row[x] = previous;
            } else {
                row[x] = row[x - 1].min(row[x]) + 1;
            }
            previous = old_row;
            best_this_row = best_this_row.min(row[x]);
        }

        if max_edit_distance != 0 && best_this_row > max_edit_distance {
            return max_edit_distance + 1;
        }
    }

    row[n]
}

/// Given a misspelled string and a list of correct spellings, return the
/// closest match or None if nothing is close enough.
pub fn spellcheck_string<'a>(text: &str, words: &[&'a str]) -> Option<&'a str> {
    const ALLOW_REPLACEMENTS: bool = true;
    const MAX_VALID_EDIT_DISTANCE: usize = 3;

    let mut min_distance = MAX_VALID_EDIT_DISTANCE + 1;
    let mut result = None;
    for word in words {
        let distance = edit_distance(word, text, ALLOW_REPLACEMENTS, MAX_VALID_EDIT_DISTANCE);
        if distance < min_distance {
            min_distance = distance;
            result = Some(*word);
        }
    }
    result
}

/// Mark a file descriptor to not be inherited on exec()s.
#[cfg(unix)]
pub fn set_close_on_exec(fd: libc::c_int) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            warning!("fcntl(F_GETFD): {}", errno::errno());
        } else if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            warning!("fcntl(F_SETFD): {}", errno::errno());
        }
    }
}

/// The 1-minute load average, or None if it cannot be determined.
#[cfg(unix)]
pub fn get_load_average() -> Option<f64> {
    let mut load_avg = [0.0f64; 3];
    let ret = unsafe { libc::getloadavg(load_avg.as_mut_ptr(), 3) };
    if ret < 1 {
        return None;
    }
    Some(load_avg[0])
}

#[cfg(windows)]
pub fn get_load_average() -> Option<f64> {
    use std::sync::Mutex;
    use winapi::shared::minwindef::FILETIME;
    use winapi::um::processthreadsapi::GetSystemTimes;

    #[derive(Default)]
    struct CpuTicks {
        idle: u64,
        total: u64,
        load: Option<f64>,
    }

    lazy_static! {
        static ref PREVIOUS: Mutex<CpuTicks> = Mutex::new(CpuTicks::default());
    }

    fn filetime_to_ticks(ft: &FILETIME) -> u64 {
        ((ft.dwHighDateTime as u64) << 32) | (ft.dwLowDateTime as u64)
    }

    unsafe {
        let mut idle_time: FILETIME = std::mem::zeroed();
        let mut kernel_time: FILETIME = std::mem::zeroed();
        let mut user_time: FILETIME = std::mem::zeroed();
        if GetSystemTimes(&mut idle_time, &mut kernel_time, &mut user_time) == 0 {
            return None;
        }

        let idle_ticks = filetime_to_ticks(&idle_time);
        // kernel_time from GetSystemTimes already includes idle_time.
        let total_ticks = filetime_to_ticks(&kernel_time) + filetime_to_ticks(&user_time);

        let mut prev = PREVIOUS.lock().unwrap();
        let idle_since = idle_ticks.wrapping_sub(prev.idle);
        let total_since = total_ticks.wrapping_sub(prev.total);

        if prev.total != 0 && total_since != 0 {
            let load_since = 1.0 - idle_since as f64 / total_since as f64;
            // Smooth the reported value when there is history to smooth with.
            prev.load = Some(match prev.load {
                Some(previous_load) => 0.9 * previous_load + 0.1 * load_since,
                None => load_since,
            });
        }
        prev.idle = idle_ticks;
        prev.total = total_ticks;

        prev.load.map(|l| l * get_processor_count() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(path: &str) -> String {
        canonicalize_path(path).unwrap().0
    }

    #[test]
    fn canonicalize_path_samples() {
        assert_eq!(canonicalize_path(""), Err("empty path".to_owned()));

        assert_eq!("foo.h", canon("foo.h"));
        assert_eq!("foo.h", canon("./foo.h"));
        assert_eq!("foo/bar.h", canon("./foo/./bar.h"));
        assert_eq!("x/bar.h", canon("./x/foo/../bar.h"));
        assert_eq!("bar.h", canon("./x/foo/../../bar.h"));
        assert_eq!("foo/bar", canon("foo//bar"));
        assert_eq!("bar", canon("foo//.//..///bar"));
        assert_eq!("../bar.h", canon("./x/../foo/../../bar.h"));
        assert_eq!("foo", canon("foo/./."));
        assert_eq!("foo", canon("foo/bar/.."));
        assert_eq!("foo/.hidden_bar", canon("foo/.hidden_bar"));
        assert_eq!("/foo", canon("/foo"));
        assert_eq!(".", canon("."));
        assert_eq!(".", canon("./."));
        assert_eq!(".", canon("foo/.."));
    }

    #[test]
    fn canonicalize_path_updir() {
        assert_eq!("../../foo/bar.h", canon("../../foo/bar.h"));
        assert_eq!("../foo/bar.h", canon("test/../../foo/bar.h"));
    }

    #[test]
    fn canonicalize_path_absolute() {
        assert_eq!("/usr/include/stdio.h", canon("/usr/include/stdio.h"));
    }

    #[test]
    fn canonicalize_path_trailing_slash() {
        assert_eq!("foo", canon("foo/"));
        assert_eq!("foo/bar", canon("foo/bar/"));
    }

    #[test]
    fn canonicalize_path_idempotent() {
        for path in &["foo/../bar/./baz.h", "../x/y", "a//b///c", "./."] {
            let (once, _) = canonicalize_path(path).unwrap();
            let (twice, _) = canonicalize_path(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn canonicalize_path_too_many_components() {
        let mut path = String::new();
        for _ in 0..61 {
            path.push_str("a/");
        }
        path.push_str("x.h");
        assert!(canonicalize_path(&path)
            .unwrap_err()
            .starts_with("path has too many components"));
    }

    #[cfg(windows)]
    #[test]
    fn canonicalize_path_slash_tracking() {
        assert_eq!(("foo.h".to_owned(), 0), canonicalize_path("foo.h").unwrap());
        assert_eq!(
            ("a/foo.h".to_owned(), 1),
            canonicalize_path("a\\foo.h").unwrap()
        );
        assert_eq!(
            ("a/bcd/efh/foo.h".to_owned(), 4),
            canonicalize_path("a/bcd/efh\\foo.h").unwrap()
        );
        assert_eq!(
            ("a/bcd/efh/foo.h".to_owned(), 5),
            canonicalize_path("a\\bcd/efh\\foo.h").unwrap()
        );
        assert_eq!(
            ("a/bcd/efh/foo.h".to_owned(), 7),
            canonicalize_path("a\\bcd\\efh\\foo.h").unwrap()
        );
        assert_eq!(
            ("efh/foo.h".to_owned(), 1),
            canonicalize_path("a\\../efh\\foo.h").unwrap()
        );
        assert_eq!(
            ("g/foo.h".to_owned(), 1),
            canonicalize_path("a\\b\\c\\..\\..\\..\\g\\foo.h").unwrap()
        );
    }

    #[cfg(windows)]
    #[test]
    fn decanonicalize_restores_slashes() {
        let (path, bits) = canonicalize_path("out\\dir/sub\\x.obj").unwrap();
        assert_eq!("out/dir/sub/x.obj", path);
        assert_eq!("out\\dir/sub\\x.obj", decanonicalize_path(&path, bits));
    }

    #[test]
    fn path_escaping_torture_test() {
        let mut result = String::new();
        get_win32_escaped_string("foo bar\\\"'$@d!st!c'\\path'\\", &mut result);
        assert_eq!("\"foo bar\\\\\\\"'$@d!st!c'\\path'\\\\\"", result);

        let mut result = String::new();
        get_shell_escaped_string("foo bar\"/'$@d!st!c'/path'", &mut result);
        assert_eq!("'foo bar\"/'\\''$@d!st!c'\\''/path'\\'''", result);
    }

    #[test]
    fn path_escaping_sensible_paths_untouched() {
        let path = "some/sensible/path/without/crazy/characters.c++";
        let mut result = String::new();
        get_shell_escaped_string(path, &mut result);
        assert_eq!(path, result);

        let mut result = String::new();
        get_win32_escaped_string(path, &mut result);
        assert_eq!(path, result);
    }

    #[test]
    fn strip_ansi_escape_codes_at_end() {
        assert_eq!("foo", strip_ansi_escape_codes("foo\x1b"));
        assert_eq!("foo", strip_ansi_escape_codes("foo\x1b["));
    }

    #[test]
    fn strip_ansi_escape_codes_colors() {
        // An actual clang warning.
        let input = "\x1b[1maffixmgr.cxx:286:15: \x1b[0m\x1b[0;1;35mwarning: \
                     \x1b[0m\x1b[1musing the result... [-Wparentheses]\x1b[0m";
        assert_eq!(
            "affixmgr.cxx:286:15: warning: using the result... [-Wparentheses]",
            strip_ansi_escape_codes(input)
        );
    }

    #[test]
    fn elide_middle_nothing_to_elide() {
        let input = "Nothing to elide in this short string.";
        assert_eq!(input, elide_middle(input, 80));
    }

    #[test]
    fn elide_middle_in_the_middle() {
        assert_eq!("012...789", elide_middle("01234567890123456789", 10));
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(0, edit_distance("abc", "abc", true, 0));
        assert_eq!(1, edit_distance("abc", "abd", true, 0));
        assert_eq!(3, edit_distance("abc", "", true, 0));
        // With a cap, anything worse comes back as cap + 1.
        assert_eq!(3, edit_distance("zzzzzz", "aaaaaa", true, 2));
    }

    #[test]
    fn spellcheck_suggests_close_words() {
        assert_eq!(
            Some("phony"),
            spellcheck_string("phnoy", &["phony", "build", "rule"])
        );
        assert_eq!(None, spellcheck_string("qqqqqqqq", &["phony", "build"]));
    }
}
