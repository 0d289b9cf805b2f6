//! Deferred note-off scheduling.
//!
//! Every note-on the engine emits is paired with exactly one note-off.
//! [`NoteScheduler`] sends the note-on immediately, queues the off by
//! absolute deadline, and a worker thread delivers it. On shutdown
//! every outstanding off is flushed synchronously so no note is ever
//! left hanging.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::output::MidiSink;

/// A queued note-off. Ordered by deadline, ties broken by schedule
/// order so overlapping schedules of the same pitch release in
/// schedule order.
#[derive(Debug)]
struct PendingOff {
    due: Instant,
    seq: u64,
    note: u8,
    channel: u8,
}

impl PartialEq for PendingOff {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for PendingOff {}

impl PartialOrd for PendingOff {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingOff {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Schedules the note-off for every emitted note-on.
pub struct NoteScheduler {
    sink: Arc<dyn MidiSink>,
    queue: Arc<(Mutex<BinaryHeap<PendingOff>>, Condvar)>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_seq: AtomicU64,
}

impl NoteScheduler {
    pub fn new(sink: Arc<dyn MidiSink>) -> Self {
        Self {
            sink,
            queue: Arc::new((Mutex::new(BinaryHeap::new()), Condvar::new())),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Start the worker thread.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let queue = self.queue.clone();
        let running = self.running.clone();
        let sink = self.sink.clone();

        let handle = std::thread::Builder::new()
            .name("nocturne-noteoff".to_string())
            .spawn(move || {
                let (heap, cvar) = &*queue;
                let mut guard = heap.lock().unwrap();
                while running.load(Ordering::Relaxed) {
                    let now = Instant::now();
                    match guard.peek() {
                        Some(top) if top.due <= now => {
                            let off = guard.pop().unwrap();
                            drop(guard);
                            send_off(&*sink, off.note, off.channel);
                            guard = heap.lock().unwrap();
                        }
                        Some(top) => {
                            let wait = top.due - now;
                            let (g, _) = cvar.wait_timeout(guard, wait).unwrap();
                            guard = g;
                        }
                        None => {
                            let (g, _) = cvar
                                .wait_timeout(guard, Duration::from_millis(100))
                                .unwrap();
                            guard = g;
                        }
                    }
                }
            })
            .expect("failed to spawn note-off worker");

        *self.worker.lock().unwrap() = Some(handle);
        log::debug!("note_scheduler_started");
    }

    /// Emit a note-on now and schedule its note-off.
    ///
    /// Overlapping schedules for the same pitch are fine; each one
    /// produces its own off.
    pub fn schedule_note(&self, note: u8, velocity: u8, channel: u8, duration_seconds: f64) {
        self.sink.note_on(note, velocity, channel);

        let due = Instant::now() + Duration::from_secs_f64(duration_seconds.max(0.001));
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (heap, cvar) = &*self.queue;
        heap.lock().unwrap().push(PendingOff {
            due,
            seq,
            note,
            channel,
        });
        cvar.notify_one();
    }

    /// Outstanding note-offs not yet delivered.
    pub fn pending(&self) -> usize {
        self.queue.0.lock().unwrap().len()
    }

    /// Stop the worker and synchronously emit every outstanding
    /// note-off before returning. Idempotent.
    pub fn shutdown(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        let (heap, cvar) = &*self.queue;
        cvar.notify_all();

        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }

        let mut guard = heap.lock().unwrap();
        let outstanding = guard.len();
        while let Some(off) = guard.pop() {
            send_off(&*self.sink, off.note, off.channel);
        }
        drop(guard);

        if was_running && outstanding > 0 {
            log::info!("note_scheduler_drained outstanding={outstanding}");
        }
    }
}

impl Drop for NoteScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A sink that panics on note-off must not take the worker down with
/// it; the event is logged and dropped.
fn send_off(sink: &dyn MidiSink, note: u8, channel: u8) {
    let result = catch_unwind(AssertUnwindSafe(|| sink.note_off(note, channel)));
    if result.is_err() {
        log::error!("note_off_sink_panicked note={note} channel={channel}");
    }
}
