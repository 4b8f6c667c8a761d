//! Task scheduler and process management.
//!
//! Lock ordering: the scheduler lock is the outermost — code holding it may
//! take the allocator lock (freeing a stack), never the other way around.

pub mod process;

pub use process::{
    CreateError, DeleteError, Pid, ProcessEntry, ProcessState, STACK_SIZE, create, current_pid,
    delete, init, ready_count, yield_now,
};
