// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! Log records are emitted after the manager lock is released, so a logger may allocate from the
//! very manager that produced the record.

use log::LevelFilter;
use log::Log;
use log::Metadata;
use log::Record;
use seqfit::Error;
use seqfit::SegmentAllocator;
use seqfit::SegmentManager;
use std::cell::Cell;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Copies every record into a block of its own manager before keeping it.
struct AllocatingLogger {
    manager: Arc<SegmentManager<'static>>,
    messages: spin::Mutex<Vec<String>>,
}

thread_local! {
    static LOGGING: Cell<bool> = const { Cell::new(false) };
}

impl Log for AllocatingLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.target().starts_with("seqfit")
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("{}", record.args());

        // Records produced by the allocation below are kept, but do not allocate again.
        if !LOGGING.replace(true) {
            let ptr = self
                .manager
                .alloc(message.len())
                .expect("allocation from the logger failed");
            unsafe {
                ptr.as_ptr()
                    .copy_from_nonoverlapping(message.as_ptr(), message.len())
            };
            unsafe { self.manager.free(ptr.as_ptr()) }.expect("free from the logger failed");
            LOGGING.set(false);
        }

        self.messages.lock().push(message);
    }

    fn flush(&self) {}
}

/// Tests share the logger and its manager, so they must not run at the same time.
static SERIAL: spin::Mutex<()> = spin::Mutex::new(());

fn logger() -> &'static AllocatingLogger {
    static LOGGER: OnceLock<&'static AllocatingLogger> = OnceLock::new();
    LOGGER.get_or_init(|| {
        let manager =
            SegmentManager::with_capacity(64 * 1024, true).expect("construction failed");
        let logger: &'static AllocatingLogger = Box::leak(Box::new(AllocatingLogger {
            manager: Arc::new(manager),
            messages: spin::Mutex::new(Vec::new()),
        }));
        log::set_logger(logger).expect("a logger is already installed");
        log::set_max_level(LevelFilter::Debug);
        logger
    })
}

fn logged(needle: &str) -> bool {
    logger()
        .messages
        .lock()
        .iter()
        .any(|message| message.contains(needle))
}

fn with_timeout<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(10))
        .expect("manager deadlocked while logging")
}

#[test]
fn logger_allocates_from_the_same_manager() {
    let _serial = SERIAL.lock();
    let manager = Arc::clone(&logger().manager);

    let (foreign, first, second) = with_timeout(move || {
        let ptr = manager.alloc(100).expect("allocation failed");
        let mut local = 0u64;
        let foreign = unsafe { manager.free(std::ptr::addr_of_mut!(local).cast()) };
        let first = unsafe { manager.free(ptr.as_ptr()) };
        let second = unsafe { manager.free(ptr.as_ptr()) };
        (foreign, first, second)
    });

    assert_eq!(foreign, Err(Error::InvalidPointer));
    assert_eq!(first, Ok(()));
    assert_eq!(second, Err(Error::DoubleFree));

    assert!(logged("alloc 100 bytes"));
    assert!(logged("pointer does not belong to the segment"));
    assert!(logged("block is already free"));
    assert_eq!(logger().manager.usage().objects, 0);
}

#[test]
fn allocator_logs_byte_counts() {
    let _serial = SERIAL.lock();
    logger();

    let ints = SegmentAllocator::<u32>::with_capacity(1024, true).expect("construction failed");
    let result = with_timeout(move || {
        let ptr = ints.allocate(16).expect("allocation failed");
        unsafe { ints.deallocate(ptr, 16) }.expect("deallocation failed");
        ints.allocate(usize::MAX).err()
    });
    assert_eq!(result, Some(Error::CapacityOverflow));

    assert!(logged("allocating 16 objects, 64 bytes are required"));
    assert!(logged("deallocating 16 objects, 64 bytes to be freed"));
    assert!(logged("required bytes overflow"));
    assert!(!logged("Some("));
}
