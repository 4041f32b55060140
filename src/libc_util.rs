use alloc_counter::no_alloc;
use std::ffi::{c_int, c_void};
use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd};

/// Get the topmost valid stack pointer inside a segment of stack memory.
#[cfg_attr(debug_assertions, no_alloc)]
pub unsafe fn get_topmost_stack_pointer(stack: &mut [u8]) -> *mut c_void {
    let top_addr = stack.as_mut_ptr().add(stack.len()) as *mut c_void;

    // Align downwards, multiple of 16.
    let top_addr = top_addr as usize & !0xf;

    top_addr as *mut c_void
}

/// Create a pipe, returning `(read_end, write_end)`. `flags` are passed to `pipe2(2)`.
pub fn pipe(flags: c_int) -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    let 0.. = (unsafe { libc::pipe2(fds.as_mut_ptr(), flags) }) else {
        return Err(io::Error::last_os_error());
    };
    let [rx, tx] = fds;
    Ok(unsafe { (OwnedFd::from_raw_fd(rx), OwnedFd::from_raw_fd(tx)) })
}

/// Send a value, interpretable as bytes, to a file descriptor in a single write.
#[cfg_attr(debug_assertions, no_alloc)]
pub unsafe fn fd_send<T: Copy>(fd: c_int, value: T) -> io::Result<()> {
    let size = mem::size_of::<T>();

    loop {
        let result = libc::write(fd, (&value) as *const T as *const c_void, size);
        if result == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if (result as usize) != size {
            return Err(io::ErrorKind::WriteZero.into());
        }
        return Ok(());
    }
}

/// Receive a value, interpretable as bytes, from a file descriptor in a single read.
#[cfg_attr(debug_assertions, no_alloc)]
pub unsafe fn fd_recv<T: Copy>(fd: c_int) -> io::Result<T> {
    let size = mem::size_of::<T>();

    let mut output_slot = mem::MaybeUninit::<T>::uninit();
    loop {
        let result = libc::read(fd, output_slot.as_mut_ptr().cast(), size);

        if result == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        // EOF, or a short read: either way there's no value for us.
        if (result as usize) != size {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        return Ok(output_slot.assume_init());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(c_int),
    Signal(c_int),
}

impl ExitStatus {
    pub fn from_wait_status(wait_status: c_int) -> io::Result<ExitStatus> {
        if libc::WIFEXITED(wait_status) {
            return Ok(ExitStatus::Code(libc::WEXITSTATUS(wait_status)));
        }
        if libc::WIFSIGNALED(wait_status) {
            return Ok(ExitStatus::Signal(libc::WTERMSIG(wait_status)));
        }

        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid wait status",
        ))
    }

    /// The status as a shell would report it: the exit code, or 128 plus the signal number.
    pub fn code(&self) -> c_int {
        match *self {
            ExitStatus::Code(code) => code,
            ExitStatus::Signal(sig) => 128 + sig,
        }
    }
}

/// Block until `pid` terminates, retrying when interrupted by a signal.
pub fn waitpid(pid: c_int) -> io::Result<ExitStatus> {
    let mut status: c_int = 0;
    loop {
        let 0.. = (unsafe { libc::waitpid(pid, &mut status as *mut c_int, 0) }) else {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        };
        return ExitStatus::from_wait_status(status);
    }
}
