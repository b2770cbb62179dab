//! Worker runtime: applies CPU affinity/priority on entry and guarantees
//! release of attached resources (ring databufs, status buffer) on every
//! exit path via an RAII guard.

use std::sync::Arc;
use std::sync::Mutex;

use crate::databuf::RingDatabuf;
use crate::error::Result;
use crate::registry::{self, Finished, ThreadArgs};
use crate::status::StatusBuffer;

/// Owns a worker's attached resources for the duration of its `run`
/// function. Dropping the guard detaches everything regardless of which
/// exit path (normal return, early `?`, panic unwind) was taken.
pub struct WorkerGuard {
    pub args: ThreadArgs,
    pub input: Option<RingDatabuf>,
    pub output: Option<RingDatabuf>,
}

impl WorkerGuard {
    /// Applies affinity/priority and attaches the status buffer plus, for
    /// each of `input_buf`/`output_buf` that is `Some`, the ring databuf at
    /// that index (already created during the supervisor's build step via
    /// the descriptor's `ibuf_create`/`obuf_create`).
    pub fn enter(
        instance_id: i32,
        cpu_mask: u32,
        priority: i32,
        input_buf: Option<i32>,
        output_buf: Option<i32>,
    ) -> Result<Self> {
        registry::set_cpu_affinity(cpu_mask)?;
        registry::set_priority(priority)?;
        let status = Arc::new(Mutex::new(StatusBuffer::attach(instance_id)?));
        let input = input_buf
            .map(|idx| RingDatabuf::attach(instance_id, idx))
            .transpose()?;
        let output = output_buf
            .map(|idx| RingDatabuf::attach(instance_id, idx))
            .transpose()?;
        let args = ThreadArgs {
            instance_id,
            input_buffer: input_buf,
            output_buffer: output_buf,
            cpu_mask,
            priority,
            finished: Finished::new(),
            status,
            cursor: std::sync::atomic::AtomicU64::new(0),
        };
        Ok(WorkerGuard {
            args,
            input,
            output,
        })
    }

    pub fn finished(&self) -> Finished {
        self.args.finished.clone()
    }

    pub fn mark_finished(&self) {
        self.args.finished.set();
    }
}

// Dropping `input`/`output`/`args.status` releases the SysV shared memory
// attachments (see `RingDatabuf::drop` and `StatusBuffer::drop`); no
// explicit cleanup is needed here beyond letting the fields drop in
// declaration order.
impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.mark_finished();
    }
}

/// Runs a worker's `init` then `run` callback inside a `WorkerGuard`,
/// checking the global shutdown flag between blocking operations is the
/// responsibility of `run` itself (it holds the input/output databuf
/// references it needs to call `wait_filled`/`wait_free` against).
pub fn run_worker<F>(guard: &WorkerGuard, body: F) -> Result<()>
where
    F: FnOnce(&ThreadArgs, Option<&RingDatabuf>, Option<&RingDatabuf>) -> Result<()>,
{
    body(&guard.args, guard.input.as_ref(), guard.output.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_marks_finished_on_drop() {
        let guard = WorkerGuard::enter(
            (std::process::id() as i32) & 0x3f,
            0,
            0,
            None,
            None,
        )
        .expect("enter");
        let finished = guard.finished();
        assert!(!finished.is_finished());
        drop(guard);
        assert!(finished.is_finished());
    }
}
