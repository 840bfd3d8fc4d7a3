// Copyright 2012 Google Inc. All Rights Reserved.
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

use std::collections::VecDeque;

use crate::exit_status::ExitStatus;

#[cfg(unix)]
pub use self::posix::{Subprocess, SubprocessSet};
#[cfg(windows)]
pub use self::win32::{Subprocess, SubprocessSet};

#[cfg(unix)]
mod posix {
    use super::*;
    use crate::utils::set_close_on_exec;
    use std::ffi::CString;
    use std::sync::atomic::{AtomicI32, Ordering};

    /// The signal that interrupted us, or 0.  A signal handler can only
    /// communicate through process-global state.
    static INTERRUPTED: AtomicI32 = AtomicI32::new(0);

    extern "C" fn set_interrupted_flag(signum: libc::c_int) {
        INTERRUPTED.store(signum, Ordering::Relaxed);
    }

    extern "C" {
        static environ: *const *mut libc::c_char;
    }

    fn check_spawn(func: &str, err: libc::c_int) {
        // The posix_spawn family returns the error number directly.
        if err != 0 {
            fatal!("{}: {}", func, errno::Errno(err));
        }
    }

    /// Subprocess wraps a single async subprocess.  It is entirely
    /// passive: it expects the caller to notify it when its fds are ready
    /// for reading, as well as call finish() to reap the child once done()
    /// is true.
    pub struct Subprocess {
        fd: libc::c_int,
        pid: libc::pid_t,
        buf: Vec<u8>,
        use_console: bool,
    }

    impl Subprocess {
        fn new(use_console: bool) -> Self {
            Subprocess {
                fd: -1,
                pid: -1,
                buf: Vec::new(),
                use_console,
            }
        }

        fn start(&mut self, old_mask: &libc::sigset_t, command: &str) -> bool {
            unsafe {
                let mut output_pipe: [libc::c_int; 2] = [0; 2];
                if libc::pipe(output_pipe.as_mut_ptr()) < 0 {
                    fatal!("pipe: {}", errno::errno());
                }
                self.fd = output_pipe[0];
                // We use pselect in do_work() and so must avoid
                // overly-large FDs.
                if self.fd >= libc::FD_SETSIZE as libc::c_int {
                    fatal!("pipe: {}", errno::Errno(libc::EMFILE));
                }
                set_close_on_exec(self.fd);

                let mut action: libc::posix_spawn_file_actions_t = std::mem::zeroed();
                check_spawn(
                    "posix_spawn_file_actions_init",
                    libc::posix_spawn_file_actions_init(&mut action),
                );
                check_spawn(
                    "posix_spawn_file_actions_addclose",
                    libc::posix_spawn_file_actions_addclose(&mut action, output_pipe[0]),
                );

                let mut attr: libc::posix_spawnattr_t = std::mem::zeroed();
                check_spawn("posix_spawnattr_init", libc::posix_spawnattr_init(&mut attr));

                let mut flags: libc::c_short = 0;

                flags |= libc::POSIX_SPAWN_SETSIGMASK as libc::c_short;
                check_spawn(
                    "posix_spawnattr_setsigmask",
                    libc::posix_spawnattr_setsigmask(&mut attr, old_mask),
                );
                // Signals which are set to be caught in the calling
                // process image are set to default action in the new
                // process image, so no explicit POSIX_SPAWN_SETSIGDEF
                // parameter is needed.

                if !self.use_console {
                    // Put the child in its own process group, so ctrl-c
                    // won't reach it.
                    flags |= libc::POSIX_SPAWN_SETPGROUP as libc::c_short;
                    // posix_spawnattr_setpgroup(&attr, 0) is the default.

                    // Open /dev/null over stdin.
                    check_spawn(
                        "posix_spawn_file_actions_addopen",
                        libc::posix_spawn_file_actions_addopen(
                            &mut action,
                            0,
                            b"/dev/null\0".as_ptr() as *const libc::c_char,
                            libc::O_RDONLY,
                            0,
                        ),
                    );
                    check_spawn(
                        "posix_spawn_file_actions_adddup2",
                        libc::posix_spawn_file_actions_adddup2(&mut action, output_pipe[1], 1),
                    );
                    check_spawn(
                        "posix_spawn_file_actions_adddup2",
                        libc::posix_spawn_file_actions_adddup2(&mut action, output_pipe[1], 2),
                    );
                    check_spawn(
                        "posix_spawn_file_actions_addclose",
                        libc::posix_spawn_file_actions_addclose(&mut action, output_pipe[1]),
                    );
                    // In the console case, output_pipe is still inherited
                    // by the child and closed when the subprocess
                    // finishes, which then notifies us.
                }

                check_spawn(
                    "posix_spawnattr_setflags",
                    libc::posix_spawnattr_setflags(&mut attr, flags),
                );

                let shell = b"/bin/sh\0".as_ptr() as *const libc::c_char;
                let command_nul = match CString::new(command) {
                    Ok(c) => c,
                    Err(_) => fatal!("command contains a nul byte"),
                };
                let argv: [*mut libc::c_char; 4] = [
                    shell as *mut libc::c_char,
                    b"-c\0".as_ptr() as *mut libc::c_char,
                    command_nul.as_ptr() as *mut libc::c_char,
                    std::ptr::null_mut(),
                ];

                let mut pid: libc::pid_t = 0;
                check_spawn(
                    "posix_spawn",
                    libc::posix_spawn(
                        &mut pid,
                        shell,
                        &action,
                        &attr,
                        argv.as_ptr() as *const *mut libc::c_char,
                        environ,
                    ),
                );
                self.pid = pid;

                check_spawn(
                    "posix_spawnattr_destroy",
                    libc::posix_spawnattr_destroy(&mut attr),
                );
                check_spawn(
                    "posix_spawn_file_actions_destroy",
                    libc::posix_spawn_file_actions_destroy(&mut action),
                );

                libc::close(output_pipe[1]);
            }
            true
        }

        fn on_pipe_ready(&mut self) {
            let mut buf = [0u8; 4 << 10];
            let len = unsafe {
                libc::read(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if len > 0 {
                self.buf.extend_from_slice(&buf[..len as usize]);
            } else {
                if len < 0 {
                    fatal!("read: {}", errno::errno());
                }
                unsafe {
                    libc::close(self.fd);
                }
                self.fd = -1;
            }
        }

        /// Returns ExitSuccess on successful process exit, ExitInterrupted
        /// if the process was interrupted, ExitFailure if it otherwise
        /// failed.
        pub fn finish(&mut self) -> ExitStatus {
            assert!(self.pid != -1);
            let mut status: libc::c_int = 0;
            if unsafe { libc::waitpid(self.pid, &mut status, 0) } < 0 {
                fatal!("waitpid({}): {}", self.pid, errno::errno());
            }
            self.pid = -1;

            if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
                return ExitStatus::ExitSuccess;
            }
            if libc::WIFSIGNALED(status) {
                let sig = libc::WTERMSIG(status);
                if sig == libc::SIGINT || sig == libc::SIGTERM || sig == libc::SIGHUP {
                    return ExitStatus::ExitInterrupted;
                }
            }
            ExitStatus::ExitFailure
        }

        pub fn done(&self) -> bool {
            self.fd == -1
        }

        pub fn output(&self) -> &[u8] {
            &self.buf
        }

        pub fn use_console(&self) -> bool {
            self.use_console
        }
    }

    impl Drop for Subprocess {
        fn drop(&mut self) {
            if self.fd >= 0 {
                unsafe {
                    libc::close(self.fd);
                }
            }
            // Reap the child if forgotten.
            if self.pid != -1 {
                self.finish();
            }
        }
    }

    /// SubprocessSet runs a pselect() loop around a set of Subprocesses.
    /// do_work() waits for any state change in subprocesses; finished is
    /// a queue of subprocesses as they finish.
    pub struct SubprocessSet<Data = ()> {
        running: Vec<(Subprocess, Data)>,
        finished: VecDeque<(Subprocess, Data)>,
        old_mask: libc::sigset_t,
        old_int_act: libc::sigaction,
        old_term_act: libc::sigaction,
        old_hup_act: libc::sigaction,
    }

    impl<Data> SubprocessSet<Data> {
        pub fn new() -> Self {
            unsafe {
                let mut set: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut set);
                libc::sigaddset(&mut set, libc::SIGINT);
                libc::sigaddset(&mut set, libc::SIGTERM);
                libc::sigaddset(&mut set, libc::SIGHUP);
                let mut old_mask: libc::sigset_t = std::mem::zeroed();
                if libc::sigprocmask(libc::SIG_BLOCK, &set, &mut old_mask) < 0 {
                    fatal!("sigprocmask: {}", errno::errno());
                }

                let mut act: libc::sigaction = std::mem::zeroed();
                let handler: extern "C" fn(libc::c_int) = set_interrupted_flag;
                act.sa_sigaction = handler as usize;
                let mut old_int_act: libc::sigaction = std::mem::zeroed();
                let mut old_term_act: libc::sigaction = std::mem::zeroed();
                let mut old_hup_act: libc::sigaction = std::mem::zeroed();
                if libc::sigaction(libc::SIGINT, &act, &mut old_int_act) < 0 {
                    fatal!("sigaction: {}", errno::errno());
                }
                if libc::sigaction(libc::SIGTERM, &act, &mut old_term_act) < 0 {
                    fatal!("sigaction: {}", errno::errno());
                }
                if libc::sigaction(libc::SIGHUP, &act, &mut old_hup_act) < 0 {
                    fatal!("sigaction: {}", errno::errno());
                }

                SubprocessSet {
                    running: Vec::new(),
                    finished: VecDeque::new(),
                    old_mask,
                    old_int_act,
                    old_term_act,
                    old_hup_act,
                }
            }
        }

        pub fn running(&self) -> &[(Subprocess, Data)] {
            &self.running
        }

        pub fn finished(&self) -> &VecDeque<(Subprocess, Data)> {
            &self.finished
        }

        fn is_interrupted() -> bool {
            INTERRUPTED.load(Ordering::Relaxed) != 0
        }

        /// A signal may have been delivered while it was blocked; pick it
        /// up before waiting.
        fn handle_pending_interruption() {
            unsafe {
                let mut pending: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut pending);
                if libc::sigpending(&mut pending) == -1 {
                    error!("sigpending: {}", errno::errno());
                    return;
                }
                if libc::sigismember(&pending, libc::SIGINT) == 1 {
                    INTERRUPTED.store(libc::SIGINT, Ordering::Relaxed);
                } else if libc::sigismember(&pending, libc::SIGTERM) == 1 {
                    INTERRUPTED.store(libc::SIGTERM, Ordering::Relaxed);
                } else if libc::sigismember(&pending, libc::SIGHUP) == 1 {
                    INTERRUPTED.store(libc::SIGHUP, Ordering::Relaxed);
                }
            }
        }

        pub fn add(
            &mut self,
            command: &str,
            use_console: bool,
            data: Data,
        ) -> Option<&mut (Subprocess, Data)> {
            let mut subprocess = Subprocess::new(use_console);
            if !subprocess.start(&self.old_mask, command) {
                return None;
            }
            self.running.push((subprocess, data));
            self.running.last_mut()
        }

        /// Wait for any state change in our subprocesses.  Returns true on
        /// interruption.
        pub fn do_work(&mut self) -> bool {
            unsafe {
                let mut fds: libc::fd_set = std::mem::zeroed();
                libc::FD_ZERO(&mut fds);
                let mut nfds = 0;
                for (subprocess, _) in &self.running {
                    if subprocess.fd >= 0 {
                        libc::FD_SET(subprocess.fd, &mut fds);
                        if nfds < subprocess.fd + 1 {
                            nfds = subprocess.fd + 1;
                        }
                    }
                }

                INTERRUPTED.store(0, Ordering::Relaxed);
                let ret = libc::pselect(
                    nfds,
                    &mut fds,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    std::ptr::null(),
                    &self.old_mask,
                );
                if ret == -1 {
                    if errno::errno().0 != libc::EINTR {
                        error!("pselect: {}", errno::errno());
                        return false;
                    }
                    return Self::is_interrupted();
                }

                Self::handle_pending_interruption();
                if Self::is_interrupted() {
                    return true;
                }

                let mut i = 0;
                while i < self.running.len() {
                    let fd = self.running[i].0.fd;
                    if fd >= 0 && libc::FD_ISSET(fd, &fds) {
                        self.running[i].0.on_pipe_ready();
                        if self.running[i].0.done() {
                            let pair = self.running.remove(i);
                            self.finished.push_back(pair);
                            continue;
                        }
                    }
                    i += 1;
                }

                Self::is_interrupted()
            }
        }

        pub fn next_finished(&mut self) -> Option<(Subprocess, Data)> {
            self.finished.pop_front()
        }

        /// Forward the interrupting signal (if any) to all non-console
        /// children and drop them; dropping reaps.
        pub fn clear(&mut self) {
            let signum = INTERRUPTED.load(Ordering::Relaxed);
            for (subprocess, _) in &self.running {
                // Since the foreground process is in our process group, it
                // will receive the interruption signal at the same time as
                // us.
                if !subprocess.use_console && subprocess.pid != -1 {
                    unsafe {
                        libc::kill(-subprocess.pid, signum);
                    }
                }
            }
            self.running.clear();
        }
    }

    impl<Data> Drop for SubprocessSet<Data> {
        fn drop(&mut self) {
            self.clear();
            unsafe {
                if libc::sigaction(libc::SIGINT, &self.old_int_act, std::ptr::null_mut()) < 0 {
                    error!("sigaction: {}", errno::errno());
                }
                if libc::sigaction(libc::SIGTERM, &self.old_term_act, std::ptr::null_mut()) < 0 {
                    error!("sigaction: {}", errno::errno());
                }
                if libc::sigaction(libc::SIGHUP, &self.old_hup_act, std::ptr::null_mut()) < 0 {
                    error!("sigaction: {}", errno::errno());
                }
                if libc::sigprocmask(libc::SIG_SETMASK, &self.old_mask, std::ptr::null_mut()) < 0 {
                    error!("sigprocmask: {}", errno::errno());
                }
            }
        }
    }
}

#[cfg(windows)]
mod win32 {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use winapi::shared::minwindef::{DWORD, FALSE, TRUE};
    use winapi::shared::winerror::{ERROR_BROKEN_PIPE, ERROR_FILE_NOT_FOUND, ERROR_IO_PENDING};
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::fileapi::{CreateFileA, ReadFile, OPEN_EXISTING};
    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::ioapiset::{
        CreateIoCompletionPort, GetOverlappedResult, GetQueuedCompletionStatus,
        PostQueuedCompletionStatus,
    };
    use winapi::um::minwinbase::{OVERLAPPED, SECURITY_ATTRIBUTES};
    use winapi::um::namedpipeapi::ConnectNamedPipe;
    use winapi::um::processthreadsapi::{
        CreateProcessA, GetCurrentProcessId, GetExitCodeProcess, GetProcessId,
        PROCESS_INFORMATION, STARTUPINFOA,
    };
    use winapi::um::synchapi::WaitForSingleObject;
    use winapi::um::winbase::{
        CreateNamedPipeA, CREATE_NEW_PROCESS_GROUP, FILE_FLAG_OVERLAPPED, INFINITE,
        PIPE_ACCESS_INBOUND, PIPE_TYPE_BYTE, PIPE_UNLIMITED_INSTANCES, STARTF_USESTDHANDLES,
    };
    use winapi::um::wincon::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT, CTRL_C_EVENT};
    use winapi::um::consoleapi::SetConsoleCtrlHandler;
    use winapi::um::winnt::{FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, GENERIC_READ, GENERIC_WRITE, HANDLE};

    const STATUS_CONTROL_C_EXIT: DWORD = 0xC000013A;

    /// The completion port shared by the console ctrl handler, which has
    /// no other channel to reach us.
    static IOPORT: AtomicUsize = AtomicUsize::new(0);

    fn win32_fatal(function: &str) -> ! {
        fatal!("{}: error {}", function, unsafe { GetLastError() });
    }

    unsafe extern "system" fn notify_interrupted(ctrl_type: DWORD) -> i32 {
        if ctrl_type == CTRL_C_EVENT || ctrl_type == CTRL_BREAK_EVENT {
            let ioport = IOPORT.load(Ordering::Relaxed) as HANDLE;
            if PostQueuedCompletionStatus(ioport, 0, 0, std::ptr::null_mut()) == 0 {
                win32_fatal("PostQueuedCompletionStatus");
            }
            return TRUE;
        }
        FALSE
    }

    pub struct Subprocess {
        child: HANDLE,
        pipe: HANDLE,
        overlapped: Box<OVERLAPPED>,
        overlapped_buf: Box<[u8; 4 << 10]>,
        is_reading: bool,
        buf: Vec<u8>,
        use_console: bool,
    }

    impl Subprocess {
        fn new(use_console: bool) -> Self {
            Subprocess {
                child: std::ptr::null_mut(),
                pipe: std::ptr::null_mut(),
                overlapped: Box::new(unsafe { std::mem::zeroed() }),
                overlapped_buf: Box::new([0; 4 << 10]),
                is_reading: false,
                buf: Vec::new(),
                use_console,
            }
        }

        /// Set up the parent-side pipe of the subprocess; return the other
        /// end of the pipe, usable in the child process.
        unsafe fn setup_pipe(&mut self, ioport: HANDLE) -> HANDLE {
            let pipe_name = format!(
                "\\\\.\\pipe\\majak_pid{}_sp{:p}\0",
                GetCurrentProcessId(),
                self as *const _
            );

            self.pipe = CreateNamedPipeA(
                pipe_name.as_ptr() as *const i8,
                PIPE_ACCESS_INBOUND | FILE_FLAG_OVERLAPPED,
                PIPE_TYPE_BYTE,
                PIPE_UNLIMITED_INSTANCES,
                0,
                0,
                INFINITE,
                std::ptr::null_mut(),
            );
            if self.pipe == INVALID_HANDLE_VALUE {
                win32_fatal("CreateNamedPipe");
            }

            if CreateIoCompletionPort(self.pipe, ioport, self as *const _ as usize, 0).is_null() {
                win32_fatal("CreateIoCompletionPort");
            }

            *self.overlapped = std::mem::zeroed();
            if ConnectNamedPipe(self.pipe, &mut *self.overlapped) == 0
                && GetLastError() != ERROR_IO_PENDING
            {
                win32_fatal("ConnectNamedPipe");
            }

            // Get the write end of the pipe as a handle inheritable across
            // processes.
            let output_write_handle = CreateFileA(
                pipe_name.as_ptr() as *const i8,
                GENERIC_WRITE,
                0,
                std::ptr::null_mut(),
                OPEN_EXISTING,
                0,
                std::ptr::null_mut(),
            );
            let mut output_write_child: HANDLE = std::ptr::null_mut();
            let this_process = winapi::um::processthreadsapi::GetCurrentProcess();
            if winapi::um::handleapi::DuplicateHandle(
                this_process,
                output_write_handle,
                this_process,
                &mut output_write_child,
                0,
                TRUE,
                winapi::um::winnt::DUPLICATE_SAME_ACCESS,
            ) == 0
            {
                win32_fatal("DuplicateHandle");
            }
            CloseHandle(output_write_handle);

            output_write_child
        }

        fn start(&mut self, ioport: HANDLE, command: &str) -> bool {
            unsafe {
                let child_pipe = self.setup_pipe(ioport);

                let mut security_attributes: SECURITY_ATTRIBUTES = std::mem::zeroed();
                security_attributes.nLength = std::mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD;
                // Must be inheritable so subprocesses can dup to children.
                security_attributes.bInheritHandle = TRUE;
                let nul = CreateFileA(
                    b"NUL\0".as_ptr() as *const i8,
                    GENERIC_READ,
                    FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                    &mut security_attributes,
                    OPEN_EXISTING,
                    0,
                    std::ptr::null_mut(),
                );
                if nul == INVALID_HANDLE_VALUE {
                    fatal!("couldn't open nul");
                }

                let mut startup_info: STARTUPINFOA = std::mem::zeroed();
                startup_info.cb = std::mem::size_of::<STARTUPINFOA>() as DWORD;
                if !self.use_console {
                    startup_info.dwFlags = STARTF_USESTDHANDLES;
                    startup_info.hStdInput = nul;
                    startup_info.hStdOutput = child_pipe;
                    startup_info.hStdError = child_pipe;
                }
                // In the console case, child_pipe is still inherited by
                // the child and closed when the subprocess finishes, which
                // then notifies us.

                let mut process_info: PROCESS_INFORMATION = std::mem::zeroed();

                // We handle ctrl-c, except for subprocesses in console
                // pools.
                let process_flags = if self.use_console {
                    0
                } else {
                    CREATE_NEW_PROCESS_GROUP
                };

                // Do not prepend 'cmd /c'; it limits command lines to
                // 8,191 chars.
                let mut command_nul = command.as_bytes().to_vec();
                command_nul.push(0);
                let created = CreateProcessA(
                    std::ptr::null_mut(),
                    command_nul.as_mut_ptr() as *mut i8,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    /* inherit handles */ TRUE,
                    process_flags,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    &mut startup_info,
                    &mut process_info,
                );
                if created == 0 {
                    let error = GetLastError();
                    // Close the pipe channel only used by the child.
                    if !child_pipe.is_null() {
                        CloseHandle(child_pipe);
                    }
                    CloseHandle(nul);
                    if error == ERROR_FILE_NOT_FOUND {
                        // A file (program) not found error is treated as a
                        // normal build action failure.
                        CloseHandle(self.pipe);
                        self.pipe = std::ptr::null_mut();
                        // child is already null.
                        self.buf = b"CreateProcess failed: The system cannot find the file specified.\n"
                            .to_vec();
                        return true;
                    }
                    win32_fatal("CreateProcess");
                }

                // Close the pipe channel only used by the child.
                if !child_pipe.is_null() {
                    CloseHandle(child_pipe);
                }
                CloseHandle(nul);
                CloseHandle(process_info.hThread);
                self.child = process_info.hProcess;
            }
            true
        }

        fn on_pipe_ready(&mut self) {
            unsafe {
                let mut bytes: DWORD = 0;
                if GetOverlappedResult(self.pipe, &mut *self.overlapped, &mut bytes, TRUE) == 0 {
                    if GetLastError() == ERROR_BROKEN_PIPE {
                        CloseHandle(self.pipe);
                        self.pipe = std::ptr::null_mut();
                        return;
                    }
                    win32_fatal("GetOverlappedResult");
                }

                if self.is_reading && bytes > 0 {
                    self.buf
                        .extend_from_slice(&self.overlapped_buf[..bytes as usize]);
                }

                *self.overlapped = std::mem::zeroed();
                self.is_reading = true;
                if ReadFile(
                    self.pipe,
                    self.overlapped_buf.as_mut_ptr() as *mut _,
                    (4 << 10) as DWORD,
                    &mut bytes,
                    &mut *self.overlapped,
                ) == 0
                {
                    if GetLastError() == ERROR_BROKEN_PIPE {
                        CloseHandle(self.pipe);
                        self.pipe = std::ptr::null_mut();
                        return;
                    }
                    if GetLastError() != ERROR_IO_PENDING {
                        win32_fatal("ReadFile");
                    }
                }

                // Even if we read any bytes in the ReadFile call, we'll
                // enter this function again later and get them then.
            }
        }

        pub fn finish(&mut self) -> ExitStatus {
            if self.child.is_null() {
                return ExitStatus::ExitFailure;
            }
            unsafe {
                WaitForSingleObject(self.child, INFINITE);
                let mut exit_code: DWORD = 0;
                GetExitCodeProcess(self.child, &mut exit_code);
                CloseHandle(self.child);
                self.child = std::ptr::null_mut();

                match exit_code {
                    0 => ExitStatus::ExitSuccess,
                    STATUS_CONTROL_C_EXIT => ExitStatus::ExitInterrupted,
                    _ => ExitStatus::ExitFailure,
                }
            }
        }

        pub fn done(&self) -> bool {
            self.pipe.is_null()
        }

        pub fn output(&self) -> &[u8] {
            &self.buf
        }

        pub fn use_console(&self) -> bool {
            self.use_console
        }
    }

    impl Drop for Subprocess {
        fn drop(&mut self) {
            unsafe {
                if !self.pipe.is_null() {
                    CloseHandle(self.pipe);
                }
            }
            // Reap the child if forgotten.
            if !self.child.is_null() {
                self.finish();
            }
        }
    }

    pub struct SubprocessSet<Data = ()> {
        running: Vec<(Box<Subprocess>, Data)>,
        finished: VecDeque<(Box<Subprocess>, Data)>,
        ioport: HANDLE,
    }

    impl<Data> SubprocessSet<Data> {
        pub fn new() -> Self {
            let ioport = unsafe {
                CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 1)
            };
            if ioport.is_null() {
                win32_fatal("CreateIoCompletionPort");
            }
            IOPORT.store(ioport as usize, Ordering::Relaxed);
            if unsafe { SetConsoleCtrlHandler(Some(notify_interrupted), TRUE) } == 0 {
                win32_fatal("SetConsoleCtrlHandler");
            }
            SubprocessSet {
                running: Vec::new(),
                finished: VecDeque::new(),
                ioport,
            }
        }

        pub fn running(&self) -> &[(Box<Subprocess>, Data)] {
            &self.running
        }

        pub fn finished(&self) -> &VecDeque<(Box<Subprocess>, Data)> {
            &self.finished
        }

        pub fn add(
            &mut self,
            command: &str,
            use_console: bool,
            data: Data,
        ) -> Option<&mut (Box<Subprocess>, Data)> {
            let mut subprocess = Box::new(Subprocess::new(use_console));
            if !subprocess.start(self.ioport, command) {
                return None;
            }
            if subprocess.child.is_null() && subprocess.pipe.is_null() {
                // CreateProcess failed in the file-not-found way; the
                // subprocess is already finished.
                self.finished.push_back((subprocess, data));
                self.finished.back_mut()
            } else {
                self.running.push((subprocess, data));
                self.running.last_mut()
            }
        }

        pub fn do_work(&mut self) -> bool {
            unsafe {
                let mut bytes_read: DWORD = 0;
                let mut subproc_key: usize = 0;
                let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();

                if GetQueuedCompletionStatus(
                    self.ioport,
                    &mut bytes_read,
                    &mut subproc_key,
                    &mut overlapped,
                    INFINITE,
                ) == 0
                    && GetLastError() != ERROR_BROKEN_PIPE
                {
                    win32_fatal("GetQueuedCompletionStatus");
                }

                if subproc_key == 0 {
                    // A null key indicates that we were interrupted, posted
                    // by notify_interrupted above.
                    return true;
                }

                let position = self
                    .running
                    .iter()
                    .position(|(s, _)| &**s as *const Subprocess as usize == subproc_key);
                if let Some(position) = position {
                    self.running[position].0.on_pipe_ready();
                    if self.running[position].0.done() {
                        let pair = self.running.remove(position);
                        self.finished.push_back(pair);
                    }
                }

                false
            }
        }

        pub fn next_finished(&mut self) -> Option<(Box<Subprocess>, Data)> {
            self.finished.pop_front()
        }

        pub fn clear(&mut self) {
            unsafe {
                for (subprocess, _) in &self.running {
                    // The foreground process is in our process group and
                    // receives the ctrl event with us.
                    if !subprocess.child.is_null() && !subprocess.use_console {
                        if GenerateConsoleCtrlEvent(
                            CTRL_BREAK_EVENT,
                            GetProcessId(subprocess.child),
                        ) == 0
                        {
                            win32_fatal("GenerateConsoleCtrlEvent");
                        }
                    }
                }
            }
            self.running.clear();
        }
    }

    impl<Data> Drop for SubprocessSet<Data> {
        fn drop(&mut self) {
            self.clear();
            unsafe {
                SetConsoleCtrlHandler(Some(notify_interrupted), FALSE);
                CloseHandle(self.ioport);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::exit_status::ExitStatus::*;

    const SIMPLE_COMMAND: &str = "ls /";

    #[test]
    fn subprocess_bad_command_sets_output_and_fails() {
        let mut subprocs: SubprocessSet<()> = SubprocessSet::new();
        subprocs.add("majak_no_such_command", false, ()).unwrap();

        while subprocs.finished().is_empty() {
            subprocs.do_work();
        }

        let (mut subproc, ()) = subprocs.next_finished().unwrap();
        assert_eq!(ExitFailure, subproc.finish());
        assert!(!subproc.output().is_empty());
    }

    #[test]
    fn subprocess_set_with_single() {
        let mut subprocs: SubprocessSet<()> = SubprocessSet::new();
        subprocs.add(SIMPLE_COMMAND, false, ()).unwrap();

        while subprocs.finished().is_empty() {
            subprocs.do_work();
        }

        let (mut subproc, ()) = subprocs.next_finished().unwrap();
        assert_eq!(ExitSuccess, subproc.finish());
        assert!(!subproc.output().is_empty());
    }

    #[test]
    fn subprocess_set_with_multi() {
        let mut subprocs: SubprocessSet<usize> = SubprocessSet::new();
        for (i, command) in [SIMPLE_COMMAND, "id -u", "pwd"].iter().enumerate() {
            subprocs.add(command, false, i).unwrap();
        }

        assert_eq!(3, subprocs.running().len());
        while subprocs.finished().len() < 3 {
            assert!(!subprocs.running().is_empty() );
            subprocs.do_work();
        }
        assert_eq!(0, subprocs.running().len());

        while let Some((mut subproc, _)) = subprocs.next_finished() {
            assert_eq!(ExitSuccess, subproc.finish());
            assert!(!subproc.output().is_empty());
        }
    }

    #[test]
    fn subprocess_interrupted_child() {
        let mut subprocs: SubprocessSet<()> = SubprocessSet::new();
        subprocs.add("kill -INT $$", false, ()).unwrap();

        while subprocs.finished().is_empty() {
            subprocs.do_work();
        }

        let (mut subproc, ()) = subprocs.next_finished().unwrap();
        assert_eq!(ExitInterrupted, subproc.finish());
    }

    #[test]
    fn subprocess_read_stdin_sees_eof() {
        // A command that reads stdin must see it closed immediately.
        let mut subprocs: SubprocessSet<()> = SubprocessSet::new();
        subprocs.add("cat -", false, ()).unwrap();
        while subprocs.finished().is_empty() {
            subprocs.do_work();
        }
        let (mut subproc, ()) = subprocs.next_finished().unwrap();
        assert_eq!(ExitSuccess, subproc.finish());
    }
}
