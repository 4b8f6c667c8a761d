//! Process management — PCBs, the ready queue, and cooperative scheduling.
//!
//! A process here is nothing more than a stack and a record describing it.
//! The scheduler multiplexes the CPU by rewriting the hardware stack pointer
//! at explicit hand-off points (`yield_now`, `create`, `delete`); between
//! hand-offs a process owns the CPU outright. There is no preemption and no
//! parallelism, only a FIFO of stacks waiting for their next turn.
//!
//! Every byte the scheduler needs at runtime — records and stacks alike —
//! comes from the region allocator in [`crate::memory`].

use core::ptr;

use spin::Mutex;

use crate::arch;
use crate::memory;

/// Process identifier. Assigned from a monotonic counter; a workload that
/// creates enough processes to wrap it is out of scope.
pub type Pid = u64;

/// Body of a process: a nullary function whose integer result is discarded
/// (processes terminate by deleting themselves, or by returning into the
/// trampoline, which deletes them).
pub type ProcessEntry = fn() -> i32;

/// Size of each created process's stack (128 KiB).
///
/// Needs to be large enough for whatever the process body calls, including
/// the scheduler frames active at every yield. The bootstrapping process is
/// exempt — it runs on the embedding program's own stack.
pub const STACK_SIZE: usize = 128 * 1024;

/// Magic tag identifying a record as a PCB.
const MAGIC_PCB: u32 = 0x5441_534B; // "TASK"

/// The possible states of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Ready to be scheduled.
    Ready,
    /// Currently executing on the CPU.
    Running,
    /// Blocked until a timer expires.
    Sleeping,
    /// Blocked waiting for an event.
    Waiting,
}

/// `create` failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    /// The region allocator could not supply the record or the stack.
    OutOfMemory,
}

/// `delete` failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteError {
    /// No ready or running process carries the given pid.
    NoSuchProcess,
}

/// Process control block. Allocated from the region allocator; the ready
/// queue and the zombie list thread through `next`.
#[repr(C)]
struct Pcb {
    /// Ready-queue / zombie-list link.
    next: *mut Pcb,
    /// [`MAGIC_PCB`].
    magic: u32,
    /// Process identifier.
    pid: Pid,
    /// Current scheduling state.
    state: ProcessState,
    /// The allocator-owned stack, or null for the bootstrapping process.
    stack_base: *mut u8,
    /// Saved hardware stack pointer while the process is not running.
    stack_pointer: usize,
    /// The process body; None for the bootstrapping process.
    entry: Option<ProcessEntry>,
}

/// Scheduler state: the ready FIFO, the running slot, and the two-stage
/// holding area for self-deleted processes.
struct Scheduler {
    /// Head of the ready queue (next to run).
    ready_head: *mut Pcb,
    /// Tail of the ready queue (enqueue point).
    ready_tail: *mut Pcb,
    /// The single running process, or null.
    running: *mut Pcb,
    /// A self-deleted process still executing on its own stack. Promoted to
    /// `zombies` by the context switch that leaves the stack.
    dying: *mut Pcb,
    /// Self-deleted processes that have been switched away from; their
    /// stacks and records are freed at the next scheduler entry.
    zombies: *mut Pcb,
    /// Monotonic pid counter.
    next_pid: Pid,
}

// SAFETY: the PCB pointers target region-allocator memory; the structure is
// only ever mutated behind `SCHEDULER`.
unsafe impl Send for Scheduler {}

impl Scheduler {
    const fn new() -> Self {
        Self {
            ready_head: ptr::null_mut(),
            ready_tail: ptr::null_mut(),
            running: ptr::null_mut(),
            dying: ptr::null_mut(),
            zombies: ptr::null_mut(),
            next_pid: 0,
        }
    }

    fn alloc_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    /// Appends a PCB to the ready-queue tail. Created and yielded processes
    /// alike join at the back: one uniform FIFO.
    unsafe fn enqueue(&mut self, pcb: *mut Pcb) {
        // SAFETY: `pcb` is a live PCB owned by the queue from here on.
        unsafe { (*pcb).next = ptr::null_mut() };
        if self.ready_tail.is_null() {
            self.ready_head = pcb;
        } else {
            // SAFETY: a non-null tail is a live queue member.
            unsafe { (*self.ready_tail).next = pcb };
        }
        self.ready_tail = pcb;
    }

    /// Pops the ready-queue head, or null when the queue is empty.
    fn dequeue(&mut self) -> *mut Pcb {
        let head = self.ready_head;
        if !head.is_null() {
            // SAFETY: a non-null head is a live queue member.
            self.ready_head = unsafe { (*head).next };
            if self.ready_head.is_null() {
                self.ready_tail = ptr::null_mut();
            }
        }
        head
    }

    /// Unlinks the ready process with the given pid, or returns null after
    /// a fruitless walk.
    unsafe fn unlink(&mut self, pid: Pid) -> *mut Pcb {
        let mut prev: *mut Pcb = ptr::null_mut();
        let mut cur = self.ready_head;
        // SAFETY: the walk stays on live queue members.
        unsafe {
            while !cur.is_null() && (*cur).pid != pid {
                prev = cur;
                cur = (*cur).next;
            }
            if cur.is_null() {
                return cur;
            }
            debug_assert!((*cur).magic == MAGIC_PCB);
            if prev.is_null() {
                self.ready_head = (*cur).next;
            } else {
                (*prev).next = (*cur).next;
            }
            if self.ready_tail == cur {
                self.ready_tail = prev;
            }
            (*cur).next = ptr::null_mut();
        }
        cur
    }

    /// Returns every parked zombie's stack and record to the allocator.
    ///
    /// Only processes that have been switched *away from* are parked here,
    /// so none of the freed stacks can be the one currently executing.
    unsafe fn reap_zombies(&mut self) {
        let mut zombie = self.zombies;
        self.zombies = ptr::null_mut();
        while !zombie.is_null() {
            // SAFETY: zombies are unreferenced outside this list; read the
            // fields before the record's memory goes back to the allocator.
            unsafe {
                let next = (*zombie).next;
                let pid = (*zombie).pid;
                memory::free((*zombie).stack_base);
                memory::free(zombie.cast());
                log::trace!("reaped process {pid}");
                zombie = next;
            }
        }
    }
}

/// The process-wide scheduler, behind a lock for the same reason the
/// allocator is: cooperative execution is serial, the lock merely enforces
/// it. No code path holds the lock across a context switch.
static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Installs the caller as the initial process (pid 0, `Running`), executing
/// on the caller's current stack. Discards any prior scheduler state.
///
/// The initial process never sits in the ready queue at birth; its stack
/// pointer is captured here and kept current by later context switches.
///
/// # Panics
/// If the region allocator cannot supply the bootstrap record. Call
/// [`memory::init`] first.
pub fn init() {
    let mut sched = SCHEDULER.lock();
    *sched = Scheduler::new();

    let pcb = memory::alloc(size_of::<Pcb>()).cast::<Pcb>();
    assert!(
        !pcb.is_null(),
        "region allocator exhausted during scheduler init"
    );
    let pid = sched.alloc_pid();
    // SAFETY: `pcb` is a fresh allocation of the right size.
    unsafe {
        pcb.write(Pcb {
            next: ptr::null_mut(),
            magic: MAGIC_PCB,
            pid,
            state: ProcessState::Running,
            stack_base: ptr::null_mut(),
            stack_pointer: arch::stack_pointer(),
            entry: None,
        });
    }
    sched.running = pcb;
    drop(sched);

    log::debug!("scheduler online, bootstrap process is pid {pid}");
}

/// Creates a process that will begin executing `entry` on a fresh
/// [`STACK_SIZE`] stack, enqueues it, and runs the scheduler.
///
/// Because the scheduler runs immediately, the new process — and others
/// after it — may execute before this returns in the parent.
pub fn create(entry: ProcessEntry) -> Result<Pid, CreateError> {
    let pid = {
        let mut sched = SCHEDULER.lock();

        let pcb = memory::alloc(size_of::<Pcb>()).cast::<Pcb>();
        if pcb.is_null() {
            return Err(CreateError::OutOfMemory);
        }
        let stack = memory::alloc(STACK_SIZE);
        if stack.is_null() {
            // SAFETY: the record just came out of the allocator and nothing
            // else references it.
            unsafe { memory::free(pcb.cast()) };
            return Err(CreateError::OutOfMemory);
        }

        let pid = sched.alloc_pid();
        // SAFETY: `pcb` and `stack` are fresh allocations of the right
        // sizes; the forged frame makes the first switch into this stack
        // land in the trampoline.
        unsafe {
            let sp = arch::boot_frame(stack.add(STACK_SIZE), process_entry_trampoline);
            pcb.write(Pcb {
                next: ptr::null_mut(),
                magic: MAGIC_PCB,
                pid,
                state: ProcessState::Ready,
                stack_base: stack,
                stack_pointer: sp,
                entry: Some(entry),
            });
            sched.enqueue(pcb);
        }
        pid
    };

    log::debug!("created process {pid}");
    schedule();
    Ok(pid)
}

/// Deletes a process and runs the scheduler.
///
/// A ready process is unlinked and its stack and record go straight back to
/// the allocator. The running process (self-deletion) cannot be freed while
/// its stack is the one executing; it is parked and reclaimed after the
/// next switch away — self-deletion therefore only returns if nothing else
/// is schedulable. An unknown pid is reported after the queue walk, and the
/// scheduler still runs.
pub fn delete(pid: Pid) -> Result<(), DeleteError> {
    let outcome = {
        let mut sched = SCHEDULER.lock();

        // SAFETY: the queue holds live PCBs.
        let queued = unsafe { sched.unlink(pid) };
        if !queued.is_null() {
            // SAFETY: unlinked above; nothing references the record now.
            unsafe {
                memory::free((*queued).stack_base);
                memory::free(queued.cast());
            }
            Ok(())
        } else if !sched.running.is_null()
            // SAFETY: `running` is a live PCB.
            && unsafe { (*sched.running).pid } == pid
        {
            debug_assert!(sched.dying.is_null());
            sched.dying = sched.running;
            sched.running = ptr::null_mut();
            Ok(())
        } else {
            Err(DeleteError::NoSuchProcess)
        }
    };

    if outcome.is_ok() {
        log::debug!("deleted process {pid}");
    }
    schedule();
    outcome
}

/// Offers the CPU to the next ready process. Returns when this process is
/// scheduled again (immediately, if the ready queue is empty).
pub fn yield_now() {
    schedule();
}

/// Pid of the running process. None only between a self-deletion and the
/// next successful switch.
pub fn current_pid() -> Option<Pid> {
    let sched = SCHEDULER.lock();
    if sched.running.is_null() {
        None
    } else {
        // SAFETY: `running` is a live PCB.
        Some(unsafe { (*sched.running).pid })
    }
}

/// Number of processes waiting in the ready queue (the running process not
/// included).
pub fn ready_count() -> usize {
    let sched = SCHEDULER.lock();
    let mut count = 0;
    let mut cur = sched.ready_head;
    while !cur.is_null() {
        // SAFETY: the walk stays on live queue members.
        unsafe {
            debug_assert!((*cur).magic == MAGIC_PCB && (*cur).state == ProcessState::Ready);
            count += 1;
            cur = (*cur).next;
        }
    }
    count
}

/// The scheduler: rotate the ready queue and switch stacks.
///
/// Everything is decided under the lock, but the lock is released before
/// the switch — the incoming process will want it at its own next yield,
/// and a fresh process takes it in the trampoline.
fn schedule() {
    // Where the outgoing stack pointer goes when the outgoing context will
    // never be resumed (its owner self-deleted).
    static mut DISCARDED_SP: usize = 0;

    let (save, load) = {
        let mut sched = SCHEDULER.lock();

        // SAFETY: parked zombies were switched away from; none of their
        // stacks is the executing one.
        unsafe { sched.reap_zombies() };

        let next = sched.dequeue();
        if next.is_null() {
            // Nothing to schedule. The current process continues.
            return;
        }

        let outgoing = sched.running;
        if !outgoing.is_null() {
            // SAFETY: the outgoing PCB stays alive on the ready queue.
            unsafe {
                (*outgoing).state = ProcessState::Ready;
                sched.enqueue(outgoing);
            }
        }

        // SAFETY: `next` came off the ready queue with a valid saved stack
        // pointer.
        unsafe {
            (*next).state = ProcessState::Running;
            (*next).next = ptr::null_mut();
            log::trace!("switching to process {}", (*next).pid);
        }
        sched.running = next;

        // The switch below is what makes a self-deleted process's stack
        // cold; promote it so the next scheduler entry can reap it.
        if !sched.dying.is_null() {
            let dying = sched.dying;
            sched.dying = ptr::null_mut();
            // SAFETY: `dying` is unreferenced outside this list.
            unsafe { (*dying).next = sched.zombies };
            sched.zombies = dying;
        }

        let save = if outgoing.is_null() {
            // SAFETY: the slot is only ever written by the switch routine.
            unsafe { &raw mut DISCARDED_SP }
        } else {
            // SAFETY: `outgoing` lives on the ready queue past the switch.
            unsafe { &raw mut (*outgoing).stack_pointer }
        };
        // SAFETY: `next` is the installed running process.
        let load = unsafe { (*next).stack_pointer };
        (save, load)
        // The guard drops here, before the switch.
    };

    // SAFETY: `load` was produced by a previous switch out of a live stack
    // or forged by `boot_frame`; `save` outlives the switch. Control
    // continues on the incoming stack — either where its last switch left
    // off, or at the trampoline.
    unsafe { arch::switch_context(save, load) };
}

/// First stop of every created process: the frame forged by
/// [`arch::boot_frame`] returns here.
extern "C" fn process_entry_trampoline() -> ! {
    let (pid, entry) = {
        let sched = SCHEDULER.lock();
        let running = sched.running;
        assert!(!running.is_null(), "trampoline: no running process");
        // SAFETY: `running` is a live PCB.
        unsafe { ((*running).pid, (*running).entry) }
    };
    log::trace!("process {pid} entered");

    if let Some(entry) = entry {
        let _ = entry();
    }

    // The body returned instead of self-deleting; retire the process here.
    // When nothing else is schedulable the deletion leaves us undead, so
    // keep offering the CPU until somebody takes it.
    let _ = delete(pid);
    loop {
        yield_now();
    }
}

// =============================================================================
// Tests
// =============================================================================
