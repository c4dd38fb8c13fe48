//! C callback ABI
//!
//! Defines every `__tsan_*` entry point the pass emits. Access checks and
//! routine entry/exit go to the process [`Runtime`]; atomic hooks perform the
//! operation themselves with the requested ordering and then notify the
//! detector.
//!
//! The runtime is created on first use (or by `__tsan_init`) with a
//! [`NullDetector`]; embedders call [`install`] beforehand to plug in a real
//! detector.

use std::borrow::Cow;
use std::ffi::{c_char, c_void, CStr};
use std::sync::atomic::{self, AtomicU16, AtomicU32, AtomicU64, AtomicU8};
use std::sync::{Mutex, OnceLock};

use crate::config::{RuntimeConfig, LOG_ENV};
use crate::debug_info::UNKNOWN_VARIABLE;
use crate::ordering::MemoryOrder;
use crate::runtime::{Access, AccessType, NullDetector, Runtime, SyncEvent, ThreadHandle};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Serializes 128-bit atomics, which have no native support
static WIDE_ATOMICS: Mutex<()> = Mutex::new(());

/// Install the process runtime; fails if one is already in place
pub fn install(runtime: Runtime) -> Result<(), Runtime> {
    RUNTIME.set(runtime)
}

/// The process runtime, created with defaults on first use
pub fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| Runtime::new(Box::new(NullDetector), RuntimeConfig::from_env()))
}

/// Borrow a C string; null becomes the unknown placeholder
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn c_str<'a>(ptr: *const c_char) -> Cow<'a, str> {
    if ptr.is_null() {
        Cow::Borrowed(UNKNOWN_VARIABLE)
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy()
    }
}

unsafe fn check_access(
    addr: *const c_void,
    size: u32,
    kind: AccessType,
    line: u32,
    var: *const c_char,
    file: *const c_char,
) {
    let variable = unsafe { c_str(var) };
    let file = unsafe { c_str(file) };
    runtime().on_access(&Access {
        address: addr as usize,
        size,
        kind,
        line,
        variable: &variable,
        file: &file,
    });
}

fn note_atomic(address: usize, order: MemoryOrder) {
    runtime().on_sync(SyncEvent::Atomic { address, order });
}

#[no_mangle]
pub extern "C" fn __tsan_init() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    let runtime = runtime();
    tracing::debug!(policy = ?runtime.config().report_policy, "racewatch runtime initialized");
}

macro_rules! access_hooks {
    ($($size:literal => $read:ident, $write:ident, $unaligned_read:ident, $unaligned_write:ident;)*) => {
        $(
            /// # Safety
            ///
            /// `var` and `file` must be null or NUL-terminated strings.
            #[no_mangle]
            pub unsafe extern "C" fn $read(addr: *const c_void, line: u32, var: *const c_char, file: *const c_char) {
                unsafe { check_access(addr, $size, AccessType::Read, line, var, file) }
            }

            /// # Safety
            ///
            /// `var` and `file` must be null or NUL-terminated strings.
            #[no_mangle]
            pub unsafe extern "C" fn $write(addr: *const c_void, line: u32, var: *const c_char, file: *const c_char) {
                unsafe { check_access(addr, $size, AccessType::Write, line, var, file) }
            }

            /// # Safety
            ///
            /// `var` and `file` must be null or NUL-terminated strings.
            #[no_mangle]
            pub unsafe extern "C" fn $unaligned_read(
                addr: *const c_void,
                line: u32,
                var: *const c_char,
                file: *const c_char,
            ) {
                unsafe { check_access(addr, $size, AccessType::Read, line, var, file) }
            }

            /// # Safety
            ///
            /// `var` and `file` must be null or NUL-terminated strings.
            #[no_mangle]
            pub unsafe extern "C" fn $unaligned_write(
                addr: *const c_void,
                line: u32,
                var: *const c_char,
                file: *const c_char,
            ) {
                unsafe { check_access(addr, $size, AccessType::Write, line, var, file) }
            }
        )*
    };
}

access_hooks! {
    1 => __tsan_read1, __tsan_write1, __tsan_unaligned_read1, __tsan_unaligned_write1;
    2 => __tsan_read2, __tsan_write2, __tsan_unaligned_read2, __tsan_unaligned_write2;
    4 => __tsan_read4, __tsan_write4, __tsan_unaligned_read4, __tsan_unaligned_write4;
    8 => __tsan_read8, __tsan_write8, __tsan_unaligned_read8, __tsan_unaligned_write8;
    16 => __tsan_read16, __tsan_write16, __tsan_unaligned_read16, __tsan_unaligned_write16;
}

/// # Safety
///
/// `addr` must be null or a valid, aligned pointer slot.
#[no_mangle]
pub unsafe extern "C" fn __tsan_vptr_update(
    addr: *mut *mut c_void,
    new: *mut c_void,
    line: u32,
    var: *const c_char,
    file: *const c_char,
) {
    // Re-storing the same vptr (constructor chains) is not a write that matters
    if addr.is_null() || unsafe { addr.read_volatile() } == new {
        return;
    }
    let size = std::mem::size_of::<*mut c_void>() as u32;
    unsafe { check_access(addr as *const c_void, size, AccessType::Write, line, var, file) }
}

/// # Safety
///
/// `var` and `file` must be null or NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn __tsan_vptr_read(
    addr: *const *mut c_void,
    line: u32,
    var: *const c_char,
    file: *const c_char,
) {
    let size = std::mem::size_of::<*mut c_void>() as u32;
    unsafe { check_access(addr as *const c_void, size, AccessType::Read, line, var, file) }
}

macro_rules! atomic_hooks {
    (@rmw $ty:ty, $atomic:ty, $name:ident, $method:ident) => {
        /// # Safety
        ///
        /// `a` must be valid and suitably aligned for an atomic access.
        #[no_mangle]
        pub unsafe extern "C" fn $name(a: *mut $ty, v: $ty, mo: i32) -> $ty {
            let order = MemoryOrder::from_code(mo);
            let old = unsafe { <$atomic>::from_ptr(a) }.$method(v, order.for_rmw());
            note_atomic(a as usize, order);
            old
        }
    };
    ($($ty:ty, $atomic:ty => $load:ident, $store:ident, $exchange:ident, $fetch_add:ident,
       $fetch_sub:ident, $fetch_and:ident, $fetch_or:ident, $fetch_xor:ident,
       $fetch_nand:ident, $compare_exchange:ident;)*) => {
        $(
            /// # Safety
            ///
            /// `a` must be valid and suitably aligned for an atomic access.
            #[no_mangle]
            pub unsafe extern "C" fn $load(a: *const $ty, mo: i32) -> $ty {
                let order = MemoryOrder::from_code(mo);
                let value = unsafe { <$atomic>::from_ptr(a as *mut $ty) }.load(order.for_load());
                note_atomic(a as usize, order);
                value
            }

            /// # Safety
            ///
            /// `a` must be valid and suitably aligned for an atomic access.
            #[no_mangle]
            pub unsafe extern "C" fn $store(a: *mut $ty, v: $ty, mo: i32) {
                let order = MemoryOrder::from_code(mo);
                note_atomic(a as usize, order);
                unsafe { <$atomic>::from_ptr(a) }.store(v, order.for_store());
            }

            atomic_hooks!(@rmw $ty, $atomic, $exchange, swap);
            atomic_hooks!(@rmw $ty, $atomic, $fetch_add, fetch_add);
            atomic_hooks!(@rmw $ty, $atomic, $fetch_sub, fetch_sub);
            atomic_hooks!(@rmw $ty, $atomic, $fetch_and, fetch_and);
            atomic_hooks!(@rmw $ty, $atomic, $fetch_or, fetch_or);
            atomic_hooks!(@rmw $ty, $atomic, $fetch_xor, fetch_xor);
            atomic_hooks!(@rmw $ty, $atomic, $fetch_nand, fetch_nand);

            /// Returns the previous value; the caller compares it with `c`
            ///
            /// # Safety
            ///
            /// `a` must be valid and suitably aligned for an atomic access.
            #[no_mangle]
            pub unsafe extern "C" fn $compare_exchange(a: *mut $ty, c: $ty, v: $ty, mo: i32, fmo: i32) -> $ty {
                let order = MemoryOrder::from_code(mo);
                let failure = MemoryOrder::from_code(fmo).for_failure();
                let atomic = unsafe { <$atomic>::from_ptr(a) };
                let old = match atomic.compare_exchange(c, v, order.for_rmw(), failure) {
                    Ok(old) | Err(old) => old,
                };
                note_atomic(a as usize, order);
                old
            }
        )*
    };
}

atomic_hooks! {
    u8, AtomicU8 => __tsan_atomic8_load, __tsan_atomic8_store, __tsan_atomic8_exchange,
        __tsan_atomic8_fetch_add, __tsan_atomic8_fetch_sub, __tsan_atomic8_fetch_and,
        __tsan_atomic8_fetch_or, __tsan_atomic8_fetch_xor, __tsan_atomic8_fetch_nand,
        __tsan_atomic8_compare_exchange_val;
    u16, AtomicU16 => __tsan_atomic16_load, __tsan_atomic16_store, __tsan_atomic16_exchange,
        __tsan_atomic16_fetch_add, __tsan_atomic16_fetch_sub, __tsan_atomic16_fetch_and,
        __tsan_atomic16_fetch_or, __tsan_atomic16_fetch_xor, __tsan_atomic16_fetch_nand,
        __tsan_atomic16_compare_exchange_val;
    u32, AtomicU32 => __tsan_atomic32_load, __tsan_atomic32_store, __tsan_atomic32_exchange,
        __tsan_atomic32_fetch_add, __tsan_atomic32_fetch_sub, __tsan_atomic32_fetch_and,
        __tsan_atomic32_fetch_or, __tsan_atomic32_fetch_xor, __tsan_atomic32_fetch_nand,
        __tsan_atomic32_compare_exchange_val;
    u64, AtomicU64 => __tsan_atomic64_load, __tsan_atomic64_store, __tsan_atomic64_exchange,
        __tsan_atomic64_fetch_add, __tsan_atomic64_fetch_sub, __tsan_atomic64_fetch_and,
        __tsan_atomic64_fetch_or, __tsan_atomic64_fetch_xor, __tsan_atomic64_fetch_nand,
        __tsan_atomic64_compare_exchange_val;
}

/// Run `f` on a 128-bit cell under the global wide-atomics lock
unsafe fn with_wide<R>(a: *mut u128, mo: i32, f: impl FnOnce(&mut u128) -> R) -> R {
    let order = MemoryOrder::from_code(mo);
    let result = {
        let _guard = WIDE_ATOMICS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(unsafe { &mut *a })
    };
    note_atomic(a as usize, order);
    result
}

macro_rules! wide_rmw {
    ($($name:ident => |$old:ident, $v:ident| $new:expr;)*) => {
        $(
            /// # Safety
            ///
            /// `a` must be valid for reads and writes of a `u128`.
            #[no_mangle]
            #[allow(improper_ctypes_definitions)]
            pub unsafe extern "C" fn $name(a: *mut u128, $v: u128, mo: i32) -> u128 {
                unsafe {
                    with_wide(a, mo, |cell| {
                        let $old = *cell;
                        *cell = $new;
                        $old
                    })
                }
            }
        )*
    };
}

wide_rmw! {
    __tsan_atomic128_exchange => |old, v| v;
    __tsan_atomic128_fetch_add => |old, v| old.wrapping_add(v);
    __tsan_atomic128_fetch_sub => |old, v| old.wrapping_sub(v);
    __tsan_atomic128_fetch_and => |old, v| old & v;
    __tsan_atomic128_fetch_or => |old, v| old | v;
    __tsan_atomic128_fetch_xor => |old, v| old ^ v;
    __tsan_atomic128_fetch_nand => |old, v| !(old & v);
}

/// # Safety
///
/// `a` must be valid for reads of a `u128`.
#[no_mangle]
#[allow(improper_ctypes_definitions)]
pub unsafe extern "C" fn __tsan_atomic128_load(a: *const u128, mo: i32) -> u128 {
    unsafe { with_wide(a as *mut u128, mo, |cell| *cell) }
}

/// # Safety
///
/// `a` must be valid for writes of a `u128`.
#[no_mangle]
#[allow(improper_ctypes_definitions)]
pub unsafe extern "C" fn __tsan_atomic128_store(a: *mut u128, v: u128, mo: i32) {
    unsafe { with_wide(a, mo, |cell| *cell = v) }
}

/// # Safety
///
/// `a` must be valid for reads and writes of a `u128`.
#[no_mangle]
#[allow(improper_ctypes_definitions)]
pub unsafe extern "C" fn __tsan_atomic128_compare_exchange_val(
    a: *mut u128,
    c: u128,
    v: u128,
    mo: i32,
    _fmo: i32,
) -> u128 {
    unsafe {
        with_wide(a, mo, |cell| {
            let old = *cell;
            if old == c {
                *cell = v;
            }
            old
        })
    }
}

#[no_mangle]
pub extern "C" fn __tsan_atomic_thread_fence(mo: i32) {
    let order = MemoryOrder::from_code(mo);
    if let Some(ordering) = order.for_fence() {
        atomic::fence(ordering);
    }
    runtime().on_sync(SyncEvent::Fence(order));
}

#[no_mangle]
pub extern "C" fn __tsan_atomic_signal_fence(mo: i32) {
    if let Some(ordering) = MemoryOrder::from_code(mo).for_fence() {
        atomic::compiler_fence(ordering);
    }
}

/// # Safety
///
/// `name` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn __tsan_func_entry(name: *const c_char) {
    let name = unsafe { c_str(name) };
    runtime().func_entry(&name);
}

/// # Safety
///
/// `name` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn __tsan_func_exit(name: *const c_char) {
    let name = unsafe { c_str(name) };
    runtime().func_exit(&name);
}

/// # Safety
///
/// `name` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn __tsan_main_func_exit(name: *const c_char) {
    let name = unsafe { c_str(name) };
    runtime().main_func_exit(&name);
}

#[no_mangle]
pub extern "C" fn __tsan_ignore_thread_begin() {
    runtime().ignore_begin();
}

#[no_mangle]
pub extern "C" fn __tsan_ignore_thread_end() {
    runtime().ignore_end();
}

/// Called after `pthread_create` returned
///
/// # Safety
///
/// `handle` must be null or point to the `pthread_t` the call filled in.
#[no_mangle]
pub unsafe extern "C" fn __tsan_thread_create(handle: *const libc::pthread_t) {
    if handle.is_null() {
        return;
    }
    let handle = unsafe { handle.read() };
    runtime().on_sync(SyncEvent::ThreadCreate(ThreadHandle(handle as u64)));
}

#[no_mangle]
pub extern "C" fn __tsan_thread_join(handle: libc::pthread_t) {
    runtime().on_sync(SyncEvent::ThreadJoin(ThreadHandle(handle as u64)));
}

#[no_mangle]
pub extern "C" fn __tsan_thread_lock(lock: *mut c_void) {
    runtime().on_sync(SyncEvent::Acquire(lock as usize));
}

#[no_mangle]
pub extern "C" fn __tsan_thread_unlock(lock: *mut c_void) {
    runtime().on_sync(SyncEvent::Release(lock as usize));
}

/// Entry point for detectors reporting a racing read on the calling thread
///
/// # Safety
///
/// `var` and `file` must be null or NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn racewatch_report_race_on_read(line: u32, var: *const c_char, file: *const c_char) {
    let variable = unsafe { c_str(var) };
    let file = unsafe { c_str(file) };
    runtime().recorder().report_race_on_read(line, &variable, &file);
}

/// Entry point for detectors reporting a racing write on the calling thread
///
/// # Safety
///
/// `var` and `file` must be null or NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn racewatch_report_race_on_write(line: u32, var: *const c_char, file: *const c_char) {
    let variable = unsafe { c_str(var) };
    let file = unsafe { c_str(file) };
    runtime().recorder().report_race_on_write(line, &variable, &file);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_hooks_perform_operation() {
        let mut cell: u32 = 5;
        unsafe {
            assert_eq!(__tsan_atomic32_fetch_add(&mut cell, 3, 5), 5);
            assert_eq!(__tsan_atomic32_load(&cell, 2), 8);
            __tsan_atomic32_store(&mut cell, 1, 3);
            assert_eq!(__tsan_atomic32_exchange(&mut cell, 9, 0), 1);
            assert_eq!(__tsan_atomic32_compare_exchange_val(&mut cell, 9, 10, 4, 0), 9);
            assert_eq!(__tsan_atomic32_compare_exchange_val(&mut cell, 9, 11, 4, 0), 10);
            assert_eq!(__tsan_atomic32_fetch_nand(&mut cell, 0b1111, 5), 10);
        }
        assert_eq!(cell, !(10 & 0b1111));
    }

    #[test]
    fn test_wide_atomics() {
        let mut cell: u128 = u128::MAX;
        unsafe {
            assert_eq!(__tsan_atomic128_fetch_add(&mut cell, 1, 5), u128::MAX);
            assert_eq!(__tsan_atomic128_load(&cell, 5), 0);
            assert_eq!(__tsan_atomic128_compare_exchange_val(&mut cell, 0, 7, 5, 5), 0);
        }
        assert_eq!(cell, 7);
    }

    #[test]
    fn test_release_code_on_load_does_not_panic() {
        let cell: u64 = 11;
        assert_eq!(unsafe { __tsan_atomic64_load(&cell, 3) }, 11);
        assert_eq!(unsafe { __tsan_atomic64_load(&cell, 4) }, 11);
        __tsan_atomic_thread_fence(0);
        __tsan_atomic_signal_fence(5);
    }

    #[test]
    fn test_null_strings_become_placeholder() {
        let text = unsafe { c_str(std::ptr::null()) };
        assert_eq!(text, UNKNOWN_VARIABLE);
    }
}
