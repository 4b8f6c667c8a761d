//! Scheduler integration tests.
//!
//! These exercise the real thing: processes on allocator-provided stacks,
//! context switches through the arch back-end, reclamation after deletion.
//! The scheduler and its allocator are process-wide singletons, so each test
//! serializes on a gate and re-initializes both before touching them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use nanokern_kernel::{memory, task};

static GATE: Mutex<()> = Mutex::new(());

/// One test at a time; a panicked predecessor must not wedge the rest.
fn serialize() -> MutexGuard<'static, ()> {
    GATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Points the allocator at a fresh region of `words` u64 words and installs
/// the calling test as the bootstrap process. The backing storage is
/// returned so the caller keeps it alive for the duration.
fn boot(words: usize) -> Vec<u64> {
    let mut backing = vec![0u64; words];
    unsafe { memory::init(backing.as_mut_ptr().cast(), words * 8) };
    task::init();
    backing
}

// ── Two writers, strict round-robin ─────────────────────────────

/// Interleaved (writer id, value) records standing in for console output.
static TRACE: Mutex<Vec<(u8, i32)>> = Mutex::new(Vec::new());

fn writer_one() -> i32 {
    task::create(writer_two).expect("spawning the second writer");
    for i in 0..10 {
        TRACE.lock().unwrap().push((1, i));
        task::yield_now();
    }
    0 // returning retires the process via the trampoline
}

fn writer_two() -> i32 {
    for i in (1..=10).rev() {
        TRACE.lock().unwrap().push((2, i));
        task::yield_now();
    }
    let pid = task::current_pid().expect("a running process has a pid");
    let _ = task::delete(pid);
    0
}

#[test]
fn two_processes_round_robin_and_reclaim() {
    let _gate = serialize();
    let _backing = boot((1 << 20) / 8); // 1 MiB: two stacks and change
    TRACE.lock().unwrap().clear();

    let baseline = memory::allocated_bytes();
    task::create(writer_one).expect("spawning the first writer");

    // Keep offering the CPU until both writers retired and every byte of
    // theirs is back in the region.
    let mut spins = 0;
    while (memory::allocated_bytes() != baseline || task::ready_count() != 0) && spins < 1_000 {
        task::yield_now();
        spins += 1;
    }

    assert_eq!(memory::allocated_bytes(), baseline);
    assert_eq!(task::ready_count(), 0);
    assert_eq!(task::current_pid(), Some(0));
    memory::check_consistency();

    let trace = TRACE.lock().unwrap();
    assert_eq!(trace.len(), 20, "unexpected trace: {trace:?}");
    // Strict alternation between the two writers, start to finish.
    for pair in trace.windows(2) {
        assert_ne!(pair[0].0, pair[1].0, "round-robin order broke: {trace:?}");
    }
    // And each writer's records appear in its own program order.
    let ones: Vec<i32> = trace.iter().filter(|(w, _)| *w == 1).map(|&(_, v)| v).collect();
    let twos: Vec<i32> = trace.iter().filter(|(w, _)| *w == 2).map(|&(_, v)| v).collect();
    assert_eq!(ones, (0..10).collect::<Vec<_>>());
    assert_eq!(twos, (1..=10).rev().collect::<Vec<_>>());
}

// ── Self-deletion from inside the child ─────────────────────────

static RUNS: AtomicU32 = AtomicU32::new(0);

fn quitter() -> i32 {
    RUNS.fetch_add(1, Ordering::Relaxed);
    let pid = task::current_pid().expect("a running process has a pid");
    let _ = task::delete(pid);
    // Not reached: the parent is always schedulable in this test, so the
    // deletion above switches away for good.
    0
}

#[test]
fn self_deleting_child_returns_control_to_parent() {
    let _gate = serialize();
    let _backing = boot((1 << 19) / 8); // 512 KiB
    RUNS.store(0, Ordering::Relaxed);

    let baseline = memory::allocated_bytes();
    let pid = task::create(quitter).expect("spawning the quitter");

    // The child ran to its own deletion before create returned here.
    assert_eq!(RUNS.load(Ordering::Relaxed), 1);
    assert_ne!(task::current_pid(), Some(pid));

    // The next scheduler entry reaps the dead child's stack and record.
    task::yield_now();
    assert_eq!(memory::allocated_bytes(), baseline);
    assert_eq!(task::ready_count(), 0);

    // And it is never scheduled again.
    for _ in 0..5 {
        task::yield_now();
    }
    assert_eq!(RUNS.load(Ordering::Relaxed), 1);
    memory::check_consistency();
}

// ── Deleting a ready process from outside ───────────────────────

fn idler() -> i32 {
    loop {
        task::yield_now();
    }
}

#[test]
fn deleting_a_ready_process_reclaims_it_immediately() {
    let _gate = serialize();
    let _backing = boot((1 << 19) / 8);

    let baseline = memory::allocated_bytes();
    let pid = task::create(idler).expect("spawning the idler");
    assert!(memory::allocated_bytes() > baseline);
    assert_eq!(task::ready_count(), 1);

    task::delete(pid).expect("the idler sits in the ready queue");
    assert_eq!(memory::allocated_bytes(), baseline);
    assert_eq!(task::ready_count(), 0);

    // Gone means gone.
    assert_eq!(task::delete(pid), Err(task::DeleteError::NoSuchProcess));
    assert_eq!(task::delete(4242), Err(task::DeleteError::NoSuchProcess));
    memory::check_consistency();
}

// ── Creation under memory pressure ──────────────────────────────

#[test]
fn create_without_stack_memory_fails_cleanly() {
    let _gate = serialize();
    // 64 KiB: plenty for records, nowhere near a 128 KiB stack.
    let _backing = boot((1 << 16) / 8);

    let baseline = memory::allocated_bytes();
    assert_eq!(task::create(idler), Err(task::CreateError::OutOfMemory));

    // The record allocated before the stack attempt was rolled back.
    assert_eq!(memory::allocated_bytes(), baseline);
    assert_eq!(task::ready_count(), 0);
    memory::check_consistency();
}
