//! The literal scenarios from the runtime's test plan (S1, S2, S4, S5):
//! shared-memory handoff through `shalloc`, a private multi-page working
//! set through `thread_allocate`, mutex-protected counting, and a working
//! set that spans two logical pages.
//!
//! Every test brings its own `Runtime` up and tears it down, since the
//! runtime is process-wide singleton state reached through a single
//! `static mut` (see `src/runtime.rs`) — `#[serial]` keeps two of these
//! tests from ever running concurrently in the same process.

use serial_test::serial;
use uthreads::{mem, thread, Mutex, Runtime, RuntimeConfig};

unsafe fn read_cstr(ptr: *mut u8, max_len: usize) -> String {
    let mut bytes = Vec::new();
    for i in 0..max_len {
        let b = *ptr.add(i);
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).expect("test fixtures only ever write ASCII")
}

/// S1: two threads each write a distinct string into their own `shalloc`
/// region and exit with the pointer; main joins both and can read back what
/// each thread wrote.
#[test]
#[serial]
fn two_threads_exchange_strings_through_shalloc() {
    Runtime::init_with_config(RuntimeConfig::small_for_tests()).unwrap();

    let t1 = thread::spawn(|| {
        let ptr = mem::shalloc(40);
        assert!(!ptr.is_null());
        unsafe { std::ptr::copy_nonoverlapping(b"in test\0".as_ptr(), ptr, 8) };
        ptr as usize
    });
    let t2 = thread::spawn(|| {
        let ptr = mem::shalloc(40);
        assert!(!ptr.is_null());
        unsafe { std::ptr::copy_nonoverlapping(b"in test2\0".as_ptr(), ptr, 9) };
        ptr as usize
    });

    let p1 = t1.join() as *mut u8;
    let p2 = t2.join() as *mut u8;

    let s1 = unsafe { read_cstr(p1, 40) };
    let s2 = unsafe { read_cstr(p2, 40) };
    println!("in main: {s1} / {s2}");

    assert_eq!(s1, "in test");
    assert_eq!(s2, "in test2");

    Runtime::shutdown();
}

/// S2: a single thread allocates a large private region via
/// `thread_allocate`, writes into it, frees it, re-allocates a small
/// region, and writes again — exercising growth across several logical
/// pages and reuse of freed space within the same thread's partition.
#[test]
#[serial]
fn thread_allocate_write_free_reallocate() {
    Runtime::init_with_config(RuntimeConfig::default()).unwrap();

    let handle = thread::spawn(|| {
        let big = mem::thread_allocate(4096 * 800);
        assert!(!big.is_null());
        unsafe { std::ptr::copy_nonoverlapping(b"in test\0".as_ptr(), big, 8) };
        let seen = unsafe { read_cstr(big, 8) };
        println!("{seen}");
        assert_eq!(seen, "in test");
        mem::thread_deallocate(big);

        let small = mem::thread_allocate(40);
        assert!(!small.is_null());
        unsafe { std::ptr::copy_nonoverlapping(b"in test1\0".as_ptr(), small, 9) };
        let seen1 = unsafe { read_cstr(small, 9) };
        println!("{seen1}");
        seen1
    });

    assert_eq!(handle.join(), "in test1");

    Runtime::shutdown();
}

/// S4: two threads lock/unlock the same mutex 10,000 times each around
/// incrementing a shared counter kept in the shared partition — final
/// value must be exactly the sum of both threads' increments.
#[test]
#[serial]
fn mutex_protected_counter_reaches_twenty_thousand() {
    Runtime::init_with_config(RuntimeConfig::small_for_tests()).unwrap();

    static LOCK: Mutex = Mutex::new();
    let counter_ptr = mem::shalloc(std::mem::size_of::<i64>()) as *mut i64;
    assert!(!counter_ptr.is_null());
    unsafe { *counter_ptr = 0 };
    let counter_addr = counter_ptr as usize;

    let spawn_incrementer = || {
        thread::spawn(move || {
            let counter = counter_addr as *mut i64;
            for _ in 0..10_000 {
                LOCK.lock();
                unsafe { *counter += 1 };
                LOCK.unlock();
            }
        })
    };

    let a = spawn_incrementer();
    let b = spawn_incrementer();
    a.join();
    b.join();

    assert_eq!(unsafe { *counter_ptr }, 20_000);
    assert!(LOCK.destroy());

    Runtime::shutdown();
}

/// S5: a thread whose working set exceeds one logical page forces growth
/// into a second page; both pages must remain independently readable and
/// writable from that thread, and a second thread touching its own first
/// page (which forces the first thread's frames to be swapped out and back
/// in across several round trips) must not corrupt either page's contents.
#[test]
#[serial]
fn working_set_spanning_two_pages_survives_interleaving() {
    Runtime::init_with_config(RuntimeConfig::small_for_tests()).unwrap();

    let wide = thread::spawn(|| {
        // `small_for_tests`'s page size is the host page size (4 KiB on
        // the vast majority of targets); asking for comfortably more than
        // one page's worth forces at least two logical pages to be mapped.
        let ptr = mem::thread_allocate(6000);
        assert!(!ptr.is_null());
        unsafe {
            std::ptr::write_bytes(ptr, 0xAB, 10);
            std::ptr::write_bytes(ptr.add(5000), 0xCD, 10);
        }
        for _ in 0..20 {
            thread::yield_now();
            let first = unsafe { std::slice::from_raw_parts(ptr, 10) };
            let second = unsafe { std::slice::from_raw_parts(ptr.add(5000), 10) };
            assert!(first.iter().all(|&b| b == 0xAB));
            assert!(second.iter().all(|&b| b == 0xCD));
        }
    });

    let narrow = thread::spawn(|| {
        let ptr = mem::thread_allocate(64);
        assert!(!ptr.is_null());
        unsafe { std::ptr::write_bytes(ptr, 0xEF, 64) };
        for _ in 0..20 {
            thread::yield_now();
            let slice = unsafe { std::slice::from_raw_parts(ptr, 64) };
            assert!(slice.iter().all(|&b| b == 0xEF));
        }
    });

    wide.join();
    narrow.join();

    Runtime::shutdown();
}
