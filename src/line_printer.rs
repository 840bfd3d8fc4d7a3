// Copyright 2013 Google Inc. All Rights Reserved.
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

use std::cell::{Cell, RefCell};
use std::io::{self, Write};

use crate::utils::elide_middle;

#[derive(Clone, Copy, PartialEq)]
pub enum LinePrinterLineType {
    Full,
    Elide,
}

#[cfg(not(windows))]
mod term {
    /// Whether output is a terminal that understands control codes.
    pub fn should_be_smart() -> bool {
        if unsafe { libc::isatty(1) } == 0 {
            return false;
        }
        match std::env::var_os("TERM") {
            Some(term) => term != *"dumb",
            None => false,
        }
    }

    /// The terminal width, if it can be determined.
    pub fn width() -> Option<usize> {
        unsafe {
            let mut size: libc::winsize = std::mem::zeroed();
            if libc::ioctl(0, libc::TIOCGWINSZ, &mut size) == 0 && size.ws_col > 0 {
                Some(size.ws_col as usize)
            } else {
                None
            }
        }
    }
}

#[cfg(windows)]
mod term {
    use winapi::um::processenv::GetStdHandle;
    use winapi::um::winbase::STD_OUTPUT_HANDLE;
    use winapi::um::wincon::{GetConsoleScreenBufferInfo, CONSOLE_SCREEN_BUFFER_INFO};

    pub fn should_be_smart() -> bool {
        unsafe {
            let console = GetStdHandle(STD_OUTPUT_HANDLE);
            let mut csbi: CONSOLE_SCREEN_BUFFER_INFO = std::mem::zeroed();
            GetConsoleScreenBufferInfo(console, &mut csbi) != 0
        }
    }

    pub fn width() -> Option<usize> {
        unsafe {
            let console = GetStdHandle(STD_OUTPUT_HANDLE);
            let mut csbi: CONSOLE_SCREEN_BUFFER_INFO = std::mem::zeroed();
            if GetConsoleScreenBufferInfo(console, &mut csbi) != 0 {
                Some(csbi.dwSize.X as usize)
            } else {
                None
            }
        }
    }
}

/// Prints lines of text, possibly overprinting previously printed lines
/// if the terminal supports it.
pub struct LinePrinter {
    /// Whether we can do fancy terminal control codes.
    smart_terminal: bool,

    /// Whether the caret is at the beginning of a blank line.
    have_blank_line: Cell<bool>,

    /// Whether the console is locked.
    console_locked: bool,

    /// Buffered current line while the console is locked.
    line_buffer: RefCell<String>,

    /// Buffered line type while the console is locked.
    line_type: Cell<LinePrinterLineType>,

    /// Buffered console output while the console is locked.
    output_buffer: RefCell<String>,
}

impl LinePrinter {
    pub fn new() -> Self {
        LinePrinter {
            smart_terminal: term::should_be_smart(),
            have_blank_line: Cell::new(true),
            console_locked: false,
            line_buffer: RefCell::new(String::new()),
            line_type: Cell::new(LinePrinterLineType::Full),
            output_buffer: RefCell::new(String::new()),
        }
    }

    pub fn is_smart_terminal(&self) -> bool {
        self.smart_terminal
    }

    pub fn set_smart_terminal(&mut self, smart: bool) {
        self.smart_terminal = smart;
    }

    /// Overprints the current line.  If type is Elide, elides to_print to
    /// fit on one line.
    pub fn print(&self, to_print: &str, line_type: LinePrinterLineType) {
        if self.console_locked {
            *self.line_buffer.borrow_mut() = to_print.to_owned();
            self.line_type.set(line_type);
            return;
        }

        let stdout = io::stdout();
        let mut handle = stdout.lock();

        if self.smart_terminal {
            // Print over the previous line, if any.
            let _ = handle.write_all(b"\r");
        }

        if self.smart_terminal && line_type == LinePrinterLineType::Elide {
            // Limit output to the terminal width so we don't cause
            // line-wrapping.
            let to_print = match term::width() {
                Some(width) => elide_middle(to_print, width),
                None => to_print.to_owned(),
            };
            let _ = handle.write_all(to_print.as_bytes());
            // Clear to end of line.
            let _ = handle.write_all(b"\x1b[K");
            let _ = handle.flush();

            self.have_blank_line.set(false);
        } else {
            let _ = handle.write_all(to_print.as_bytes());
            let _ = handle.write_all(b"\n");
        }
    }

    /// Print the given data to the console, or buffer it if it is locked.
    fn print_or_buffer(&self, to_print: &str) {
        if self.console_locked {
            self.output_buffer.borrow_mut().push_str(to_print);
        } else {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            let _ = handle.write_all(to_print.as_bytes());
        }
    }

    /// Prints a string on a new line, not overprinting previous output.
    pub fn print_on_new_line(&self, to_print: &str) {
        if self.console_locked && !self.line_buffer.borrow().is_empty() {
            let mut line_buffer = self.line_buffer.borrow_mut();
            let mut output_buffer = self.output_buffer.borrow_mut();
            output_buffer.push_str(&line_buffer);
            output_buffer.push('\n');
            line_buffer.clear();
        }

        if !self.have_blank_line.get() {
            self.print_or_buffer("\n");
        }
        if !to_print.is_empty() {
            self.print_or_buffer(to_print);
        }
        self.have_blank_line
            .set(to_print.is_empty() || to_print.ends_with('\n'));
    }

    /// Lock or unlock the console.  Any output sent to the LinePrinter
    /// while the console is locked will not be printed until it is
    /// unlocked.
    pub fn set_console_locked(&mut self, locked: bool) {
        if self.console_locked == locked {
            return;
        }

        if locked {
            self.print_on_new_line("");
        }

        self.console_locked = locked;

        if !locked {
            let output_buffer = std::mem::take(&mut *self.output_buffer.borrow_mut());
            let line_buffer = std::mem::take(&mut *self.line_buffer.borrow_mut());
            self.print_on_new_line(&output_buffer);
            if !line_buffer.is_empty() {
                self.print(&line_buffer, self.line_type.get());
            }
        }
    }
}

impl Default for LinePrinter {
    fn default() -> Self {
        LinePrinter::new()
    }
}
