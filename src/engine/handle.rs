//! The file handle: the durable write endpoint and the central object of
//! this crate.
//!
//! Owns the file descriptor, the kernel AIO context, the event-counter
//! descriptor and its poller, and the queue of in-flight writes. All
//! mutation happens on one loop thread — `Inner` lives behind `Rc<RefCell<_>>`
//! and is deliberately `!Send`, pinning a handle to a single
//! `tokio::task::LocalSet` to a single event-loop thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tokio::io::unix::AsyncFd;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::engine::aio::{self, AioContext, AioContextRaw, IoEvent, IOCB_FLAG_RESFD, RWF_DSYNC, RWF_HIPRI, RWF_NOWAIT};
use crate::engine::platform::Capabilities;
use crate::engine::state::FileState;
use crate::error::{Error, Result};
use crate::runtime::{self, EventCounter};
use crate::worker::{TokioWorkerPool, WorkerPool};

const PATH_MAX_LEN: usize = 4096;

/// A raw pointer/length pair into the caller's buffers, smuggled across the
/// `spawn_blocking` boundary for the slow path. Sound because the `write`
/// future that owns the buffers is never dropped before the corresponding
/// queue entry resolves (see the safety note on [`FileHandle::write`]).
#[derive(Clone, Copy)]
struct SendIov(*const libc::iovec, usize);
unsafe impl Send for SendIov {}

#[derive(Clone)]
struct ResubmitInfo {
    fd: RawFd,
    iov: SendIov,
    offset: u64,
}

struct QueuedWrite {
    sender: oneshot::Sender<Result<usize>>,
    resubmit: ResubmitInfo,
}

struct Inner<W: WorkerPool> {
    path: PathBuf,
    fd: Option<OwnedFd>,
    direct: bool,
    async_capable: bool,
    dsync_capable: bool,
    max_writes: usize,
    aio_ctx: Option<AioContext>,
    event_fd_raw: RawFd,
    poller: Option<AsyncFd<EventCounter>>,
    events_buf: Vec<IoEvent>,
    queue: HashMap<u64, QueuedWrite>,
    next_token: u64,
    state: FileState,
    closing: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
    poll_task: Option<JoinHandle<()>>,
    worker: W,
}

/// The durable write endpoint for one pre-allocated file.
///
/// `W` is the worker-offload pool used for the slow path; it defaults to
/// [`TokioWorkerPool`]. Not `Send`/`Sync` by design — see the module docs.
pub struct FileHandle<W: WorkerPool = TokioWorkerPool> {
    inner: Rc<RefCell<Inner<W>>>,
}

impl<W: WorkerPool> Clone for FileHandle<W> {
    fn clone(&self) -> Self {
        FileHandle {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl FileHandle<TokioWorkerPool> {
    /// Creates a fresh file at `path` sized exactly `size` bytes, ready for
    /// up to `max_writes` concurrent writes, using the default
    /// [`TokioWorkerPool`] for slow-path offload.
    pub async fn create(
        path: impl AsRef<Path>,
        size: u64,
        max_writes: usize,
        want_direct: bool,
        caps: Capabilities,
    ) -> Result<Self> {
        Self::create_with_worker(TokioWorkerPool::new(), path, size, max_writes, want_direct, caps).await
    }
}

impl<W: WorkerPool> FileHandle<W> {
    /// Same as [`FileHandle::create`] but with an explicit worker pool.
    pub async fn create_with_worker(
        worker: W,
        path: impl AsRef<Path>,
        size: u64,
        max_writes: usize,
        want_direct: bool,
        caps: Capabilities,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if size == 0 {
            return Err(Error::InvalidArgument("size must be greater than zero"));
        }
        if max_writes == 0 {
            return Err(Error::InvalidArgument("max_writes must be at least 1"));
        }
        if path.as_os_str().len() > PATH_MAX_LEN {
            return Err(Error::InvalidArgument("path exceeds the maximum length"));
        }

        // Allocate the event counter and register the poller now, but do
        // not start it until creation has fully succeeded.
        let counter = EventCounter::new().map_err(Error::ResourceExhausted)?;
        let event_fd_raw = counter.as_raw_fd();
        let poller = runtime::register(counter).map_err(Error::ResourceExhausted)?;

        let direct = want_direct && caps.direct_capable;

        let inner = Rc::new(RefCell::new(Inner {
            path: path.clone(),
            fd: None,
            direct,
            async_capable: caps.async_capable,
            dsync_capable: caps.dsync_capable,
            max_writes,
            aio_ctx: None,
            event_fd_raw,
            poller: Some(poller),
            events_buf: vec![IoEvent::zeroed(); max_writes],
            queue: HashMap::new(),
            next_token: 1,
            state: FileState::Creating,
            closing: false,
            close_waiters: Vec::new(),
            poll_task: None,
            worker,
        }));

        let handle = FileHandle { inner };
        handle.run_create(path, size, max_writes, caps.dsync_capable).await?;
        Ok(handle)
    }

    async fn run_create(&self, path: PathBuf, size: u64, max_writes: usize, dsync_capable: bool) -> Result<()> {
        let worker = self.inner.borrow().worker.clone();

        let mut open_flags = libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL;
        if !dsync_capable {
            open_flags |= libc::O_DSYNC;
        }

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::InvalidArgument("path contains a NUL byte"))?;

        let fd = unsafe { libc::open(c_path.as_ptr(), open_flags, 0o600 as libc::mode_t) };
        if fd < 0 {
            return Err(Error::Open(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let aio_ctx = match AioContext::setup(max_writes) {
            Ok(ctx) => ctx,
            Err(e) => {
                unsafe { libc::unlink(c_path.as_ptr()) };
                return Err(Error::ResourceExhausted(e));
            }
        };

        {
            let mut inner = self.inner.borrow_mut();
            inner.fd = Some(fd);
            inner.aio_ctx = Some(aio_ctx);
        }

        let direct = self.inner.borrow().direct;
        let worker_path = path.clone();
        let raw_fd = self.inner.borrow().fd.as_ref().unwrap().as_raw_fd();
        let work_result = worker
            .dispatch(move || run_create_work(raw_fd, &worker_path, size, direct))
            .await;

        // The worker has returned; back on the loop thread now.
        let closing = self.inner.borrow().closing;
        if closing {
            unsafe { libc::unlink(c_path.as_ptr()) };
            self.inner.borrow_mut().state = FileState::Errored;
            finalize_if_ready(&self.inner);
            return Err(Error::Cancelled);
        }

        match work_result {
            Ok(()) => {
                let poller = self.inner.borrow_mut().poller.take();
                let poller = match poller {
                    Some(p) => p,
                    None => unreachable!("poller registered at init and not yet taken"),
                };
                let task = tokio::task::spawn_local(run_poll_loop(Rc::clone(&self.inner), poller));
                self.inner.borrow_mut().poll_task = Some(task);
                self.inner.borrow_mut().state = FileState::Ready;
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.borrow_mut();
                inner.state = FileState::Errored;
                inner.aio_ctx = None;
                if let Some(fd) = inner.fd.take() {
                    drop(fd);
                }
                drop(inner);
                unsafe { libc::unlink(c_path.as_ptr()) };
                finalize_if_ready(&self.inner);
                Err(e)
            }
        }
    }

    /// Submits a vectored write at `offset`. Returns ownership of `bufs`
    /// alongside the result, following the owned-buffer convention used for
    /// completion-based I/O (the buffers must remain valid and unmoved for
    /// the lifetime of the kernel operation, so the future — not a borrow —
    /// is what keeps them alive).
    ///
    /// If the handle was created with direct I/O enabled, `bufs`, `offset`
    /// and each buffer's length must already satisfy the filesystem's block
    /// alignment ([`Capabilities::block_size`]); this call does not align
    /// them. [`crate::util::buffer::AlignedBuffer`] builds buffers that
    /// satisfy this.
    ///
    /// # Safety contract
    /// The returned future must be driven to completion (polled until it
    /// resolves). Dropping it before the kernel (or worker) completion
    /// fires leaves a dangling pointer registered with the kernel/worker:
    /// a write request must outlive its operation.
    pub async fn write(&self, bufs: Vec<Vec<u8>>, offset: u64) -> (Result<usize>, Vec<Vec<u8>>) {
        if bufs.is_empty() {
            return (Err(Error::InvalidArgument("no buffers supplied")), bufs);
        }

        {
            let inner = self.inner.borrow();
            if inner.closing {
                return (Err(Error::Precondition("close already requested")), bufs);
            }
            if inner.state != FileState::Ready {
                return (Err(Error::Precondition("handle is not in the Ready state")), bufs);
            }
            if inner.max_writes == 1 && !inner.queue.is_empty() {
                return (
                    Err(Error::Precondition(
                        "max_writes == 1: a write is already outstanding",
                    )),
                    bufs,
                );
            }
            if inner.queue.len() >= inner.max_writes {
                return (Err(Error::Precondition("write queue at capacity")), bufs);
            }
        }

        let fd = match self.inner.borrow().fd.as_ref().map(|f| f.as_raw_fd()) {
            Some(fd) => fd,
            None => return (Err(Error::Precondition("handle has no open descriptor")), bufs),
        };

        let iov: Vec<libc::iovec> = bufs
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.as_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            })
            .collect();

        let (token, receiver) = {
            let mut inner = self.inner.borrow_mut();
            let token = inner.next_token;
            inner.next_token = inner.next_token.wrapping_add(1).max(1);
            let (tx, rx) = oneshot::channel();
            inner.queue.insert(
                token,
                QueuedWrite {
                    sender: tx,
                    resubmit: ResubmitInfo {
                        fd,
                        iov: SendIov(iov.as_ptr(), iov.len()),
                        offset,
                    },
                },
            );
            (token, rx)
        };

        let (async_capable, dsync_capable) = {
            let inner = self.inner.borrow();
            (inner.async_capable, inner.dsync_capable)
        };

        if async_capable {
            let mut iocb = aio::build_pwritev_iocb(fd, &iov, offset, token);
            iocb.aio_rw_flags |= RWF_HIPRI | RWF_NOWAIT;
            if dsync_capable {
                // Otherwise the file was opened O_DSYNC in `run_create`,
                // which already makes every write on this descriptor
                // synchronous; a kernel that doesn't honour RWF_DSYNC would
                // reject the submission outright if it were set here.
                iocb.aio_rw_flags |= RWF_DSYNC;
            }
            iocb.aio_flags |= IOCB_FLAG_RESFD;
            iocb.aio_resfd = self.inner.borrow().event_fd_raw as u32;

            let submit_result = {
                let inner = self.inner.borrow();
                inner.aio_ctx.as_ref().unwrap().submit_one(&mut iocb)
            };

            match submit_result {
                Ok(()) => { /* in flight; resolved via the poller */ }
                Err(errno) if errno == libc::EAGAIN => {
                    dispatch_slow_path(Rc::clone(&self.inner), token);
                }
                Err(errno) if errno == libc::EOPNOTSUPP => {
                    self.inner.borrow_mut().queue.remove(&token);
                    return (
                        Err(Error::Precondition(
                            "kernel rejected RWF_NOWAIT with EOPNOTSUPP despite a successful probe",
                        )),
                        bufs,
                    );
                }
                Err(errno) => {
                    self.inner.borrow_mut().queue.remove(&token);
                    return (Err(Error::Submission(io::Error::from_raw_os_error(errno))), bufs);
                }
            }
        } else {
            dispatch_slow_path(Rc::clone(&self.inner), token);
        }

        let outcome = receiver.await.unwrap_or(Err(Error::Cancelled));
        (outcome, bufs)
    }

    /// Requests the handle be closed. Idempotent: calling it more than once
    /// just awaits the same drain. Resolves once every accepted write and
    /// the create callback (if still pending) have resolved and all
    /// resources are released.
    pub async fn close(&self) {
        let rx = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == FileState::Closed {
                return;
            }
            inner.closing = true;
            // Close the descriptor immediately, as the kernel completes or
            // fails any outstanding AIO operations referencing it on their
            // own schedule; their callbacks still fire via the poller or
            // the worker pool.
            if let Some(fd) = inner.fd.take() {
                drop(fd);
            }
            let (tx, rx) = oneshot::channel();
            inner.close_waiters.push(tx);
            rx
        };
        finalize_if_ready(&self.inner);
        let _ = rx.await;
    }

    pub fn state(&self) -> FileState {
        self.inner.borrow().state
    }

    /// The path this handle was created with.
    pub fn path(&self) -> PathBuf {
        self.inner.borrow().path.clone()
    }
}

/// Runs on a worker thread: pre-allocates, syncs the file and its
/// directory, and optionally switches the descriptor to direct I/O.
/// Blocking by design: fallocate and fsync are synchronous syscalls, so
/// this body only ever runs off the loop thread.
fn run_create_work(fd: RawFd, path: &Path, size: u64, direct: bool) -> Result<()> {
    let rv = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
    if rv != 0 {
        return Err(Error::from_errno("allocate", rv));
    }

    let rv = unsafe { libc::fsync(fd) };
    if rv != 0 {
        return Err(Error::from_errno("sync", io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fsync_dir(dir)?;

    if direct {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(Error::from_errno("sync", io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
        }
        let rv = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_DIRECT) };
        if rv != 0 {
            return Err(Error::from_errno("sync", io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
        }
    }

    Ok(())
}

fn fsync_dir(dir: &Path) -> Result<()> {
    let c_path = CString::new(dir.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument("directory path contains a NUL byte"))?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return Err(Error::Durability(io::Error::last_os_error()));
    }
    let rv = unsafe { libc::fsync(fd) };
    let err = io::Error::last_os_error();
    unsafe {
        libc::close(fd);
    }
    if rv != 0 {
        return Err(Error::Durability(err));
    }
    Ok(())
}

/// Spawns a task that runs the slow path on the worker pool and resolves
/// the request's queue entry once the worker returns.
fn dispatch_slow_path<W: WorkerPool>(inner_rc: Rc<RefCell<Inner<W>>>, token: u64) {
    let (worker, resubmit, shared_ctx, dsync_capable) = {
        let inner = inner_rc.borrow();
        let qw = inner
            .queue
            .get(&token)
            .expect("dispatch_slow_path called with a token that is still queued");
        let shared_ctx = if inner.max_writes == 1 {
            inner.aio_ctx.as_ref().map(|c| c.raw())
        } else {
            None
        };
        (inner.worker.clone(), qw.resubmit.clone(), shared_ctx, inner.dsync_capable)
    };

    tokio::task::spawn_local(async move {
        let status = worker
            .dispatch(move || {
                run_slow_path_sync(resubmit.fd, resubmit.iov, resubmit.offset, shared_ctx, dsync_capable)
            })
            .await;

        let closing = inner_rc.borrow().closing;
        let outcome = if closing { Err(Error::Cancelled) } else { status };

        if let Some(qw) = inner_rc.borrow_mut().queue.remove(&token) {
            let _ = qw.sender.send(outcome);
        }
        finalize_if_ready(&inner_rc);
    });
}

/// Runs entirely on a worker thread: submits the write and blocks on
/// `io_getevents` for its single completion.
fn run_slow_path_sync(
    fd: RawFd,
    iov: SendIov,
    offset: u64,
    shared_ctx: Option<AioContextRaw>,
    dsync_capable: bool,
) -> Result<usize> {
    let (ctx, owns_private) = match shared_ctx {
        Some(ctx) => (ctx, false),
        None => match aio::setup_raw(1) {
            Ok(ctx) => (ctx, true),
            Err(e) => return Err(Error::ResourceExhausted(e)),
        },
    };

    let iov_slice = unsafe { std::slice::from_raw_parts(iov.0, iov.1) };
    let mut iocb = aio::build_pwritev_iocb(fd, iov_slice, offset, 0);
    // As in the fast path: only set RWF_DSYNC where the probe found it
    // honoured. Where it isn't, the descriptor was opened O_DSYNC instead,
    // which already makes this submission synchronous.
    if dsync_capable {
        iocb.aio_rw_flags |= RWF_DSYNC;
    }

    let result = (|| -> Result<usize> {
        aio::submit_one(ctx, &mut iocb)
            .map_err(|errno| Error::Submission(io::Error::from_raw_os_error(errno)))?;
        let mut events = [IoEvent::zeroed()];
        let n = aio::get_events(ctx, 1, &mut events).map_err(Error::Io)?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "io_getevents returned no completions for a submitted write",
            )));
        }
        let res = events[0].res;
        if res >= 0 {
            Ok(res as usize)
        } else {
            Err(Error::Io(io::Error::from_raw_os_error((-res) as i32)))
        }
    })();

    if owns_private {
        aio::destroy_raw(ctx);
    }
    result
}

/// The poller task: reads the counter descriptor, drains completions, and
/// dispatches each one to its queued request. Spawned once, when the file
/// transitions to `Ready`; exits once `close` has drained the queue.
async fn run_poll_loop<W: WorkerPool>(inner_rc: Rc<RefCell<Inner<W>>>, mut poller: AsyncFd<EventCounter>) {
    loop {
        let mut guard = match poller.readable_mut().await {
            Ok(guard) => guard,
            Err(_) => break,
        };

        match guard.try_io(|fd| fd.get_ref().try_read_count()) {
            Ok(Ok(Some(_count))) => {
                process_completions(&inner_rc);
            }
            Ok(Ok(None)) => {
                guard.clear_ready();
            }
            Ok(Err(io_err)) => {
                // The counter descriptor's read contract was violated (a
                // successful read of the wrong length). This is not a
                // transient condition; the handle cannot be trusted to
                // observe further completions, so every in-flight write is
                // failed and the handle is driven to Errored.
                fail_all_queued(&inner_rc, io_err);
                break;
            }
            Err(_would_block) => {}
        }

        if inner_rc.borrow().state == FileState::Closed {
            break;
        }
    }
}

/// Fails every write currently in the queue with `err` (cloned per write via
/// its raw OS error where available) and transitions the handle to
/// `Errored`, unless it is already `Closed`. Used when the kernel's
/// completion-notification contract itself is violated, since at that point
/// individual completions can no longer be trusted to be dispatched.
fn fail_all_queued<W: WorkerPool>(inner_rc: &Rc<RefCell<Inner<W>>>, err: io::Error) {
    let queued: Vec<_> = {
        let mut inner = inner_rc.borrow_mut();
        if inner.state != FileState::Closed {
            inner.state = FileState::Errored;
        }
        inner.queue.drain().collect()
    };
    let code = err.raw_os_error().unwrap_or(libc::EIO);
    for (_, qw) in queued {
        let _ = qw
            .sender
            .send(Err(Error::Io(io::Error::from_raw_os_error(code))));
    }
    finalize_if_ready(inner_rc);
}

/// Drains whatever completions are ready and dispatches each to its queued
/// request. A zero count (see DESIGN.md) is a no-op rather than an error.
fn process_completions<W: WorkerPool>(inner_rc: &Rc<RefCell<Inner<W>>>) {
    let ctx_raw = match inner_rc.borrow().aio_ctx.as_ref() {
        Some(ctx) => ctx.raw(),
        None => return,
    };

    let n = {
        let mut inner = inner_rc.borrow_mut();
        match aio::get_events(ctx_raw, 0, &mut inner.events_buf) {
            Ok(n) => n,
            Err(_) => return,
        }
    };
    if n == 0 {
        return;
    }
    let events = inner_rc.borrow().events_buf[..n].to_vec();

    for event in &events {
        let token = event.data;
        let closing = inner_rc.borrow().closing;

        if closing {
            if let Some(qw) = inner_rc.borrow_mut().queue.remove(&token) {
                let _ = qw.sender.send(Err(Error::Cancelled));
            }
            continue;
        }

        if event.res == -(libc::EAGAIN as i64) {
            // Direct-I/O non-blocking refusal: downgrade and resubmit on
            // the worker pool. The entry remains in the queue.
            dispatch_slow_path(Rc::clone(inner_rc), token);
            continue;
        }

        let outcome = if event.res >= 0 {
            Ok(event.res as usize)
        } else {
            Err(Error::Io(io::Error::from_raw_os_error((-event.res) as i32)))
        };

        if let Some(qw) = inner_rc.borrow_mut().queue.remove(&token) {
            let _ = qw.sender.send(outcome);
        }
    }

    finalize_if_ready(inner_rc);
}

/// Closes out the handle once `closing` is set, the create step has
/// returned, and the write queue has drained. Tears down the AIO context,
/// aborts the poller task (a no-op if it already exited on its own),
/// transitions to `Closed`, and wakes every `close()` caller.
fn finalize_if_ready<W: WorkerPool>(inner_rc: &Rc<RefCell<Inner<W>>>) {
    let mut inner = inner_rc.borrow_mut();
    if !inner.closing || inner.state == FileState::Closed || inner.state == FileState::Creating {
        return;
    }
    if !inner.queue.is_empty() {
        return;
    }

    inner.aio_ctx = None;
    inner.state = FileState::Closed;
    if let Some(task) = inner.poll_task.take() {
        task.abort();
    }
    inner.poller = None;
    // Normally already closed by `close()`; still taken here defensively
    // for the create-failure path, which never goes through `close()`.
    if let Some(fd) = inner.fd.take() {
        drop(fd);
    }
    let waiters = std::mem::take(&mut inner.close_waiters);
    drop(inner);
    for w in waiters {
        let _ = w.send(());
    }
}
