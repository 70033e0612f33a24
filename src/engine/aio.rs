//! Raw Linux kernel AIO bindings.
//!
//! `libaio` itself is LGPL, so these bindings call the four syscalls
//! directly via `libc::syscall` rather than linking the C library.
//! This module only knows about `iocb`/`io_event` layout and the raw
//! `io_setup`/`io_submit`/`io_getevents`/`io_destroy` calls; the write-path
//! policy (fast path, fallback, completion dispatch) lives in `super::handle`.

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;

/// Opaque kernel AIO context handle. `0` means "not set up".
pub type AioContextRaw = libc::c_ulong;

const SYS_IO_SETUP: libc::c_long = 206;
const SYS_IO_DESTROY: libc::c_long = 207;
const SYS_IO_GETEVENTS: libc::c_long = 208;
const SYS_IO_SUBMIT: libc::c_long = 209;

pub const IOCB_CMD_PWRITEV: u16 = 8;

/// Request completion be signalled on an eventfd rather than only through
/// `io_getevents`.
pub const IOCB_FLAG_RESFD: u32 = 1 << 0;

/// `preadv2`/`pwritev2` flags, present since Linux 4.1/4.14 respectively.
pub const RWF_HIPRI: i32 = 0x00000001;
pub const RWF_DSYNC: i32 = 0x00000002;
pub const RWF_NOWAIT: i32 = 0x00000008;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IoControlBlock {
    pub aio_data: u64,
    aio_key: u32,
    pub aio_rw_flags: u32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

impl IoControlBlock {
    pub fn zeroed() -> Self {
        unsafe { MaybeUninit::zeroed().assume_init() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IoEvent {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

impl IoEvent {
    pub fn zeroed() -> Self {
        unsafe { MaybeUninit::zeroed().assume_init() }
    }
}

unsafe fn io_setup(maxevents: libc::c_int, ctx: *mut AioContextRaw) -> libc::c_long {
    libc::syscall(SYS_IO_SETUP, maxevents as libc::c_long, ctx)
}

unsafe fn io_destroy(ctx: AioContextRaw) -> libc::c_long {
    libc::syscall(SYS_IO_DESTROY, ctx)
}

unsafe fn io_submit(ctx: AioContextRaw, nr: libc::c_long, iocbpp: *mut *mut IoControlBlock) -> libc::c_long {
    libc::syscall(SYS_IO_SUBMIT, ctx, nr, iocbpp)
}

unsafe fn io_getevents(
    ctx: AioContextRaw,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_long {
    libc::syscall(SYS_IO_GETEVENTS, ctx, min_nr, nr, events, timeout)
}

/// Sets up a raw context sized for `max_events` concurrent requests. Callers
/// that need RAII cleanup should prefer [`AioContext::setup`]; the raw form
/// exists for the slow-path worker body, which sets up and tears down its
/// private single-slot context entirely within one blocking-thread call and
/// has no `Drop` glue to run across the `spawn_blocking` boundary.
pub fn setup_raw(max_events: usize) -> io::Result<AioContextRaw> {
    let mut raw: AioContextRaw = 0;
    let rv = unsafe { io_setup(max_events as libc::c_int, &mut raw) };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(raw)
}

/// Tears down a context obtained from [`setup_raw`].
pub fn destroy_raw(ctx: AioContextRaw) {
    if ctx != 0 {
        unsafe {
            io_destroy(ctx);
        }
    }
}

/// Submits a single request. Returns the raw `io_submit` errno on failure
/// (the caller distinguishes `EAGAIN`/`EOPNOTSUPP` from other errors).
pub fn submit_one(ctx: AioContextRaw, iocb: &mut IoControlBlock) -> Result<(), i32> {
    let mut ptr: *mut IoControlBlock = iocb;
    let rv = unsafe { io_submit(ctx, 1, &mut ptr) };
    if rv < 0 {
        return Err(-rv as i32);
    }
    Ok(())
}

/// Fetches completions. With `min == 0` this never blocks, appropriate for
/// the loop thread after the counter descriptor has signalled readiness.
/// With `min >= 1` and no other pending submissions this blocks the calling
/// thread until that many completions arrive — only the slow-path worker
/// body, never the loop thread, should pass `min >= 1`.
pub fn get_events(ctx: AioContextRaw, min: usize, buf: &mut [IoEvent]) -> io::Result<usize> {
    loop {
        let rv = unsafe {
            io_getevents(
                ctx,
                min as libc::c_long,
                buf.len() as libc::c_long,
                buf.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rv as usize);
    }
}

/// An owned kernel AIO context, destroyed on drop. Used for the main,
/// loop-thread-owned context sized to `max_writes`.
pub struct AioContext {
    raw: AioContextRaw,
}

impl AioContext {
    /// Sets up a context sized for `max_events` concurrent requests.
    pub fn setup(max_events: usize) -> io::Result<Self> {
        Ok(AioContext {
            raw: setup_raw(max_events)?,
        })
    }

    pub fn raw(&self) -> AioContextRaw {
        self.raw
    }

    pub fn submit_one(&self, iocb: &mut IoControlBlock) -> Result<(), i32> {
        submit_one(self.raw, iocb)
    }

    pub fn get_events(&self, min: usize, buf: &mut [IoEvent]) -> io::Result<usize> {
        get_events(self.raw, min, buf)
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        destroy_raw(self.raw);
    }
}

/// Builds an `iocb` for a vectored write at `offset`, targeting `fd`, with
/// `token` smuggled through `aio_data` to be recovered on completion.
pub fn build_pwritev_iocb(
    fd: RawFd,
    iov: &[libc::iovec],
    offset: u64,
    token: u64,
) -> IoControlBlock {
    let mut iocb = IoControlBlock::zeroed();
    iocb.aio_data = token;
    iocb.aio_lio_opcode = IOCB_CMD_PWRITEV;
    iocb.aio_fildes = fd as u32;
    iocb.aio_buf = iov.as_ptr() as u64;
    iocb.aio_nbytes = iov.len() as u64;
    iocb.aio_offset = offset as i64;
    iocb
}
