//! POSIX backend: page size, aligned allocation, page protection, ucontext
//! based stack switching, signal handlers, and the virtual interval timer.

use std::ffi::c_void;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;

use crate::error::InitError;

/// A saved machine context. Opaque outside of `arch`.
pub type Context = libc::ucontext_t;

/// Reads the host page size. Cached by the caller; this queries `sysconf`
/// directly, mirroring `sysconf(_SC_PAGE_SIZE)` in the original.
pub fn page_size() -> Result<usize, InitError> {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret <= 0 {
        Err(InitError::PageSize(io::Error::last_os_error()))
    } else {
        Ok(ret as usize)
    }
}

/// Allocates `size` bytes aligned to `align` (the page size), the
/// replacement for `memalign` in the original. Freed with [`free_aligned`].
pub fn alloc_aligned(size: usize, align: usize) -> Result<*mut u8, InitError> {
    let mut ptr: *mut c_void = std::ptr::null_mut();
    let rc = unsafe { libc::posix_memalign(&mut ptr, align, size) };
    if rc != 0 {
        return Err(InitError::ArenaAlloc {
            size,
            source: io::Error::from_raw_os_error(rc),
        });
    }
    Ok(ptr.cast())
}

/// Frees memory obtained from [`alloc_aligned`].
///
/// # Safety
/// `ptr` must have been returned by [`alloc_aligned`] and not freed already.
pub unsafe fn free_aligned(ptr: *mut u8) {
    libc::free(ptr.cast());
}

/// Makes `len` pages starting at `addr` inaccessible (`PROT_NONE`).
pub fn protect_none(addr: *mut u8, len: usize) -> Result<(), InitError> {
    mprotect(addr, len, libc::PROT_NONE)
}

/// Makes `len` pages starting at `addr` readable and writable.
pub fn protect_rw(addr: *mut u8, len: usize) -> Result<(), InitError> {
    mprotect(addr, len, libc::PROT_READ | libc::PROT_WRITE)
}

fn mprotect(addr: *mut u8, len: usize, prot: i32) -> Result<(), InitError> {
    let rc = unsafe { libc::mprotect(addr.cast(), len, prot) };
    if rc != 0 {
        return Err(InitError::Mprotect {
            pages: len,
            addr: addr as usize,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Initializes `ctx` with the calling thread's current context.
pub fn getcontext(ctx: &mut Context) {
    let rc = unsafe { libc::getcontext(ctx) };
    debug_assert_eq!(rc, 0, "getcontext failed");
}

/// Prepares `ctx` (already `getcontext`-initialized, with `uc_stack` and
/// `uc_link` set) to begin executing `entry(arg)` the next time it is
/// switched into. `entry` must never return normally — the original's
/// trampoline always ends by calling `exit`.
///
/// # Safety
/// `ctx.uc_stack` must describe a valid, writable stack that outlives the
/// context.
pub unsafe fn makecontext_trampoline(ctx: &mut Context, entry: extern "C" fn(u32, u32), arg: u64) {
    let hi = (arg >> 32) as u32;
    let lo = (arg & 0xffff_ffff) as u32;
    // `makecontext`'s variadic arguments are `int`s; splitting a 64-bit
    // pointer into two 32-bit halves is the standard portable trick (the
    // same one `my_pthread.c`'s single-argument call relies on being
    // pointer-sized on its target, made explicit and 64-bit-safe here).
    libc::makecontext(
        ctx,
        std::mem::transmute::<extern "C" fn(u32, u32), extern "C" fn()>(entry),
        2,
        hi,
        lo,
    );
}

/// Saves the calling context into `from` and switches to `to`.
pub fn swapcontext(from: &mut Context, to: &Context) {
    let rc = unsafe { libc::swapcontext(from, to) };
    debug_assert_eq!(rc, 0, "swapcontext failed");
}

/// Switches to `to` without saving the calling context anywhere.
pub fn setcontext(to: &Context) -> ! {
    unsafe {
        libc::setcontext(to);
    }
    unreachable!("setcontext does not return on success");
}

/// Installs `handler` as the process's `SIGSEGV` action, `SA_SIGINFO` style
/// so the faulting address is available (the fault handler needs it to
/// compute which logical page was touched). `SIGVTALRM` is blocked for the
/// duration of the handler, so a timer tick can never interrupt a page
/// swap (`evict`/`swap_in`) that `SIGSEGV` triggered.
pub fn install_segv_handler(
    handler: extern "C" fn(i32, *mut libc::siginfo_t, *mut c_void),
) -> Result<(), InitError> {
    install_siginfo_handler(libc::SIGSEGV, handler, &[libc::SIGVTALRM]).map_err(InitError::SigactionSegv)
}

/// Installs `handler` as the process's `SIGVTALRM` action (the scheduler's
/// preemption tick).
pub fn install_timer_handler(handler: extern "C" fn(i32)) -> Result<(), InitError> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        if libc::sigaction(libc::SIGVTALRM, &sa, std::ptr::null_mut()) == -1 {
            return Err(InitError::SigactionTimer(io::Error::last_os_error()));
        }
    }
    Ok(())
}

fn install_siginfo_handler(
    signum: i32,
    handler: extern "C" fn(i32, *mut libc::siginfo_t, *mut c_void),
    also_block: &[i32],
) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        for &sig in also_block {
            libc::sigaddset(&mut sa.sa_mask, sig);
        }
        if libc::sigaction(signum, &sa, std::ptr::null_mut()) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Arms `ITIMER_VIRTUAL` to fire every `interval_micros` microseconds of
/// process (user CPU) time — virtual time, not wall-clock, per spec.md §5.
pub fn arm_virtual_timer(interval_micros: u64) -> Result<(), InitError> {
    let interval = libc::timeval {
        tv_sec: (interval_micros / 1_000_000) as libc::time_t,
        tv_usec: (interval_micros % 1_000_000) as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: interval,
        it_value: interval,
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_VIRTUAL, &timer, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(InitError::Setitimer(io::Error::last_os_error()));
    }
    Ok(())
}

/// Disarms `ITIMER_VIRTUAL`. Used by `Runtime::shutdown`.
pub fn disarm_virtual_timer() {
    unsafe {
        let zero = libc::itimerval {
            it_interval: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            it_value: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        libc::setitimer(libc::ITIMER_VIRTUAL, &zero, std::ptr::null_mut());
    }
}

/// A swap file: `numSwapPages * pageSize` bytes of backing storage for
/// evicted pages. Unlinked immediately after creation (spec.md §9's
/// "Swap-file lifecycle" recommendation) so it cannot outlive the process
/// even on a crash.
pub struct SwapFile {
    fd: RawFd,
}

impl SwapFile {
    pub fn create(path: &str, size: u64) -> Result<Self, InitError> {
        let c_path = std::ffi::CString::new(path).expect("swap file path has no interior NUL");
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC,
                0o600,
            )
        };
        if fd == -1 {
            return Err(InitError::SwapFileOpen {
                path: path.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        // Unlink right away: the directory entry is no longer needed once
        // we hold an open fd, and this guarantees cleanup even on abort.
        unsafe {
            libc::unlink(c_path.as_ptr());
        }
        let file = Self { fd };
        file.resize(size)?;
        Ok(file)
    }

    fn resize(&self, size: u64) -> Result<(), InitError> {
        if unsafe { libc::ftruncate(self.fd, size as libc::off_t) } == -1 {
            return Err(InitError::SwapFileResize {
                size,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Reads exactly one page at `offset` into `buf`. Exits-on-error in the
    /// original; here we just propagate, since by the time this runs we're
    /// well past initialization (this is only ever called from the fault
    /// handler or under the scheduler guard).
    pub fn read_page_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(offset)?;
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n as usize != buf.len() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn write_page_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.seek(offset)?;
        let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        if n as usize != buf.len() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn seek(&self, offset: u64) -> io::Result<()> {
        if unsafe { libc::lseek(self.fd, offset as libc::off_t, libc::SEEK_SET) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for SwapFile {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Reads `sig`'s faulting address out of a `siginfo_t`, as the SIGSEGV
/// handler needs to compute which logical page was touched.
pub fn fault_address(info: *const libc::siginfo_t) -> *mut u8 {
    unsafe { (*info).si_addr().cast() }
}

pub fn zeroed_context() -> Context {
    unsafe { MaybeUninit::zeroed().assume_init() }
}
