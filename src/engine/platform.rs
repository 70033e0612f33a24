//! One-shot discovery of kernel/filesystem AIO capabilities.
//!
//! Run once per target directory, before any `FileHandle` is created for it.
//! The engine consults the resulting [`Capabilities`] and otherwise has no
//! conditional paths on the literal platform — the probe is where platform
//! knowledge lives, using the same direct `libc::syscall` style the rest
//! of the engine uses to talk to the kernel.

use crate::engine::aio::{self, AioContext, RWF_DSYNC, RWF_NOWAIT};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

const SYS_PWRITEV2: libc::c_long = 328; // x86_64

/// Capability record resolved once per target filesystem.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Whether `io_submit` honours `RWF_NOWAIT` by returning `EAGAIN`
    /// instead of blocking or returning `EOPNOTSUPP`. The engine's fast path
    /// is only eligible when this is true.
    pub async_capable: bool,
    /// Whether `O_DIRECT` can be enabled on this filesystem.
    pub direct_capable: bool,
    /// Whether the kernel honours the per-request `RWF_DSYNC` flag. When
    /// false, `create` falls back to opening the file with `O_DSYNC`.
    pub dsync_capable: bool,
    /// Filesystem block size, used to size and align direct-I/O buffers.
    pub block_size: u64,
}

/// Probes `dir` (the directory a log file will live in) for AIO
/// capabilities by creating and immediately removing a small scratch file.
pub fn probe(dir: &Path) -> io::Result<Capabilities> {
    let block_size = statfs_block_size(dir)?;

    let scratch_path = dir.join(format!(".durafile-probe-{}", std::process::id()));
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&scratch_path)?;
    let _remove_guard = RemoveOnDrop(&scratch_path);

    let direct_capable = probe_direct_io(&scratch_path);

    unsafe {
        libc::ftruncate(file.as_raw_fd(), block_size as libc::off_t);
    }

    let async_capable = probe_nowait(&file, block_size)?;
    let dsync_capable = probe_dsync(&file, block_size);

    Ok(Capabilities {
        async_capable,
        direct_capable,
        dsync_capable,
        block_size,
    })
}

struct RemoveOnDrop<'a>(&'a Path);
impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.0);
    }
}

fn statfs_block_size(dir: &Path) -> io::Result<u64> {
    let c_path = CString::new(dir.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))?;
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    let rv = unsafe { libc::statfs(c_path.as_ptr(), &mut stat) };
    if rv != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_bsize as u64)
}

fn probe_direct_io(path: &Path) -> bool {
    let c_path = match CString::new(path.as_os_str().as_bytes()) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_DIRECT) };
    if fd < 0 {
        return false;
    }
    unsafe {
        libc::close(fd);
    }
    true
}

/// Submits one `RWF_NOWAIT` write and observes whether the kernel returns
/// `EAGAIN` (async-capable, the contract this engine's fast path relies on)
/// as opposed to succeeding outright or returning `EOPNOTSUPP`.
fn probe_nowait(file: &fs::File, block_size: u64) -> io::Result<bool> {
    let ctx = match AioContext::setup(1) {
        Ok(ctx) => ctx,
        Err(_) => return Ok(false),
    };

    let buf = vec![0u8; block_size as usize];
    let iov = [libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    }];

    let mut iocb = aio::build_pwritev_iocb(file.as_raw_fd(), &iov, 0, 1);
    iocb.aio_rw_flags |= RWF_NOWAIT;

    match ctx.submit_one(&mut iocb) {
        Ok(()) => {
            // Submission succeeded without blocking; drain the completion
            // so the context can be torn down cleanly.
            let mut events = [aio::IoEvent::zeroed()];
            let _ = ctx.get_events(1, &mut events);
            Ok(false)
        }
        Err(errno) if errno == libc::EAGAIN => Ok(true),
        Err(errno) if errno == libc::EOPNOTSUPP => Ok(false),
        Err(errno) => Err(io::Error::from_raw_os_error(errno)),
    }
}

/// Issues a plain (non-AIO) `pwritev2(2)` with `RWF_DSYNC` and observes
/// whether the kernel accepts the flag. Called directly via syscall, like
/// the rest of this crate's kernel bindings, rather than through `libaio`.
fn probe_dsync(file: &fs::File, block_size: u64) -> bool {
    let buf = vec![0u8; block_size as usize];
    let iov = [libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    }];
    let offset = 0i64 as u64;
    let pos_l = (offset & 0xffff_ffff) as libc::c_long;
    let pos_h = (offset >> 32) as libc::c_long;
    let rv = unsafe {
        libc::syscall(
            SYS_PWRITEV2,
            file.as_raw_fd() as libc::c_long,
            iov.as_ptr(),
            1 as libc::c_long,
            pos_l,
            pos_h,
            RWF_DSYNC as libc::c_long,
        )
    };
    rv >= 0
}
