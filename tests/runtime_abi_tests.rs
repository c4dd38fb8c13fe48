//! Integration tests for the C callback ABI against the process runtime
//!
//! The runtime is process-wide, so every test installs the same detector
//! once and runs serially.

use racewatch::config::{ReportPolicy, RuntimeConfig};
use racewatch::ffi;
use racewatch::runtime::{Access, AccessType, RaceDetector, Recorder, Runtime, SyncEvent, ThreadId};
use serial_test::serial;
use std::collections::HashMap;
use std::ffi::CString;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn take(&self) -> String {
        let bytes = std::mem::take(&mut *self.0.lock().unwrap());
        String::from_utf8(bytes).unwrap()
    }
}

/// Races when another thread wrote the address last
#[derive(Clone, Default)]
struct LastWriter {
    last: Arc<Mutex<HashMap<usize, ThreadId>>>,
    syncs: Arc<Mutex<Vec<SyncEvent>>>,
}

impl RaceDetector for LastWriter {
    fn on_access(&self, thread: ThreadId, access: &Access<'_>) -> bool {
        let mut last = self.last.lock().unwrap();
        let previous = last.get(&access.address).copied();
        if access.kind == AccessType::Write {
            last.insert(access.address, thread);
        }
        matches!(previous, Some(other) if other != thread)
    }

    fn on_sync(&self, _thread: ThreadId, event: SyncEvent) {
        self.syncs.lock().unwrap().push(event);
    }
}

struct Harness {
    out: SharedBuf,
    detector: LastWriter,
}

fn harness() -> &'static Harness {
    static HARNESS: OnceLock<Harness> = OnceLock::new();
    HARNESS.get_or_init(|| {
        let out = SharedBuf::default();
        let detector = LastWriter::default();
        let config = RuntimeConfig {
            report_policy: ReportPolicy::NewOnly,
            report_at_exit: true,
        };
        let recorder = Recorder::with_sink(config.report_policy, Box::new(out.clone()));
        let runtime = Runtime::with_recorder(recorder, Box::new(detector.clone()), config);
        assert!(ffi::install(runtime).is_ok());
        Harness { out, detector }
    })
}

fn c(text: &str) -> CString {
    CString::new(text).unwrap()
}

#[test]
#[serial]
fn test_detector_reports_only_the_second_writer() {
    let h = harness();
    h.out.take();

    let counter = Box::leak(Box::new(0u32)) as *mut u32 as usize;
    for line in [10u32, 20] {
        thread::spawn(move || {
            let worker = c("worker");
            let var = c("counter");
            let file = c("counter.c");
            unsafe {
                ffi::__tsan_func_entry(worker.as_ptr());
                ffi::__tsan_write4(counter as *const _, line, var.as_ptr(), file.as_ptr());
                ffi::__tsan_func_exit(worker.as_ptr());
            }
        })
        .join()
        .unwrap();
    }

    let report = h.out.take();
    assert!(report.starts_with("racewatch: races:\n"));
    assert!(report.contains(", write, counter, counter.c:20}"));
    assert!(!report.contains("counter.c:10}"));
    assert!(report.contains(" '--->worker(...)\n"));
}

#[test]
#[serial]
fn test_two_threads_reporting_write_races_are_both_kept() {
    let h = harness();
    h.out.take();

    let mut threads = Vec::new();
    for line in [10u32, 20] {
        let thread = thread::spawn(move || {
            let worker = c("worker");
            let var = c("counter");
            let file = c("counter_pair.c");
            unsafe {
                ffi::__tsan_func_entry(worker.as_ptr());
                ffi::racewatch_report_race_on_write(line, var.as_ptr(), file.as_ptr());
                ffi::__tsan_func_exit(worker.as_ptr());
            }
            ThreadId::current()
        })
        .join()
        .unwrap();
        threads.push(thread);
    }
    assert_ne!(threads[0], threads[1]);

    let races: Vec<_> = ffi::runtime()
        .recorder()
        .races()
        .into_iter()
        .filter(|race| race.file == "counter_pair.c")
        .collect();
    assert_eq!(races.len(), 2);
    for (thread, line) in threads.iter().zip([10u32, 20]) {
        let race = races.iter().find(|race| race.line == line).unwrap();
        assert_eq!(race.thread, *thread);
        assert_eq!(race.access, AccessType::Write);
        assert_eq!(race.variable, "counter");
        assert_eq!(race.stack.len(), 1);
        assert_eq!(&*race.stack[0], "worker");
    }

    // Each new race printed its own block as it arrived
    let live = h.out.take();
    assert!(live.contains(&format!("{{{}, write, counter, counter_pair.c:10}}", threads[0])));
    assert!(live.contains(&format!("{{{}, write, counter, counter_pair.c:20}}", threads[1])));

    let main = c("main");
    unsafe {
        ffi::__tsan_main_func_exit(main.as_ptr());
    }
    let at_exit = h.out.take();
    assert_eq!(at_exit.matches("racewatch: races:").count(), 1);
    assert!(at_exit.starts_with("racewatch: races:\n"));
    for (thread, line) in threads.iter().zip([10u32, 20]) {
        let entry = format!("{{{}, write, counter, counter_pair.c:{}}}\n '--->worker(...)\n", thread, line);
        assert!(at_exit.contains(&entry), "missing {:?} in {}", entry, at_exit);
    }
}

#[test]
#[serial]
fn test_same_thread_accesses_do_not_race() {
    let h = harness();
    h.out.take();

    let cell = Box::leak(Box::new(0u64)) as *mut u64;
    let var = c("local_total");
    let file = c("sum.c");
    unsafe {
        ffi::__tsan_write8(cell as *const _, 3, var.as_ptr(), file.as_ptr());
        ffi::__tsan_read8(cell as *const _, 4, var.as_ptr(), file.as_ptr());
        ffi::__tsan_unaligned_write8(cell as *const _, 5, var.as_ptr(), file.as_ptr());
    }

    assert!(h.out.take().is_empty());
}

#[test]
#[serial]
fn test_thread_markers_reach_detector() {
    let h = harness();
    h.detector.syncs.lock().unwrap().clear();

    let handle: libc::pthread_t = 42 as libc::pthread_t;
    let mut lock = 0u8;
    unsafe {
        ffi::__tsan_thread_create(&handle);
        ffi::__tsan_thread_create(std::ptr::null());
    }
    ffi::__tsan_thread_join(handle);
    ffi::__tsan_thread_lock(&mut lock as *mut u8 as *mut _);
    ffi::__tsan_thread_unlock(&mut lock as *mut u8 as *mut _);

    let syncs = h.detector.syncs.lock().unwrap().clone();
    assert_eq!(syncs.len(), 4);
    assert!(matches!(syncs[0], SyncEvent::ThreadCreate(t) if t.0 == 42));
    assert!(matches!(syncs[1], SyncEvent::ThreadJoin(t) if t.0 == 42));
    assert!(matches!(syncs[2], SyncEvent::Acquire(_)));
    assert!(matches!(syncs[3], SyncEvent::Release(_)));
}

#[test]
#[serial]
fn test_direct_reports_dedupe_and_flush_at_main_exit() {
    let h = harness();
    h.out.take();

    let var = c("flag");
    let file = c("flags.c");
    let main = c("main");
    unsafe {
        ffi::__tsan_func_entry(main.as_ptr());
        ffi::racewatch_report_race_on_read(7, var.as_ptr(), file.as_ptr());
        ffi::racewatch_report_race_on_read(7, var.as_ptr(), file.as_ptr());
    }
    let printed = h.out.take();
    assert_eq!(printed.matches("read, flag, flags.c:7}").count(), 1);
    assert!(printed.contains(" '--->main(...)\n"));

    unsafe {
        ffi::__tsan_func_exit(main.as_ptr());
        ffi::__tsan_main_func_exit(main.as_ptr());
    }
    let at_exit = h.out.take();
    assert!(at_exit.starts_with("racewatch: races:\n"));
    assert!(at_exit.contains("read, flag, flags.c:7}"));
}

#[test]
#[serial]
fn test_ignore_region_suppresses_reports() {
    let h = harness();
    h.out.take();

    let var = c("ignored");
    let file = c("quiet.c");
    ffi::__tsan_ignore_thread_begin();
    unsafe {
        ffi::racewatch_report_race_on_write(1, var.as_ptr(), file.as_ptr());
    }
    ffi::__tsan_ignore_thread_end();

    assert!(h.out.take().is_empty());
    assert!(!ffi::runtime()
        .recorder()
        .races()
        .iter()
        .any(|race| race.variable == "ignored"));
}

#[test]
#[serial]
fn test_atomics_notify_detector() {
    let h = harness();
    h.detector.syncs.lock().unwrap().clear();

    let mut cell = 0u16;
    unsafe {
        ffi::__tsan_atomic16_fetch_add(&mut cell, 2, 5);
        ffi::__tsan_atomic16_store(&mut cell, 9, 3);
    }
    ffi::__tsan_atomic_thread_fence(2);

    assert_eq!(cell, 9);
    let syncs = h.detector.syncs.lock().unwrap().clone();
    assert_eq!(syncs.len(), 3);
    assert!(matches!(syncs[0], SyncEvent::Atomic { .. }));
    assert!(matches!(syncs[2], SyncEvent::Fence(_)));
}
