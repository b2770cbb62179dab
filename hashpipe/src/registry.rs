//! Thread/plugin registry and the process-wide shutdown flag.
//!
//! Threads are registered statically at process start (dynamic `.so`
//! loading is an out-of-scope implementation detail; static registration
//! preserves the same external `find`/`list` contract). Lookup is
//! case-sensitive, matching the original's `strcmp`-based search.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use crate::databuf::RingDatabuf;
use crate::error::Result;
use crate::status::StatusBuffer;

pub const MAX_HASHPIPE_THREADS: usize = 1024;

pub type InitFn = fn(&ThreadArgs) -> Result<()>;
/// A worker's per-block processing step. Called repeatedly by the
/// supervisor's run loop for as long as `run_threads()` stays set; each
/// call is expected to wait for, process, and release exactly one block
/// (or propagate a `Transient`/`Signal` error so the caller retries).
pub type RunFn = fn(&ThreadArgs, Option<&RingDatabuf>, Option<&RingDatabuf>) -> Result<()>;
pub type DatabufCreateFn = fn(instance_id: i32, databuf_id: i32) -> Result<()>;

#[derive(Clone, Copy)]
pub struct ThreadDesc {
    pub name: &'static str,
    pub skey: &'static str,
    pub init: Option<InitFn>,
    pub run: RunFn,
    pub ibuf_create: Option<DatabufCreateFn>,
    pub obuf_create: Option<DatabufCreateFn>,
}

impl ThreadDesc {
    pub fn has_input(&self) -> bool {
        self.ibuf_create.is_some()
    }

    pub fn has_output(&self) -> bool {
        self.obuf_create.is_some()
    }
}

static REGISTRY: OnceLock<Mutex<Vec<ThreadDesc>>> = OnceLock::new();

fn registry() -> &'static Mutex<Vec<ThreadDesc>> {
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Registers a thread descriptor. Returns an error once
/// `MAX_HASHPIPE_THREADS` registrations have been made.
pub fn register(desc: ThreadDesc) -> Result<()> {
    let mut g = registry().lock().unwrap();
    if g.len() >= MAX_HASHPIPE_THREADS {
        return Err(crate::error::HpError::fatal(
            "thread registry is full",
        ));
    }
    g.push(desc);
    Ok(())
}

/// Case-sensitive lookup by name.
pub fn find(name: &str) -> Option<ThreadDesc> {
    registry().lock().unwrap().iter().find(|d| d.name == name).copied()
}

/// Prints the known-worker catalog grouped by input/output taxonomy, as
/// the supervisor does when invoked with no worker names or with `--list`.
pub fn list(out: &mut dyn std::io::Write) -> std::io::Result<()> {
    let g = registry().lock().unwrap();
    writeln!(out, "Known input-only thread modules:")?;
    for d in g.iter().filter(|d| !d.has_input() && d.has_output()) {
        writeln!(out, "  {}", d.name)?;
    }
    writeln!(out, "Known input/output thread modules:")?;
    for d in g.iter().filter(|d| d.has_input() && d.has_output()) {
        writeln!(out, "  {}", d.name)?;
    }
    writeln!(out, "Known output-only thread modules:")?;
    for d in g.iter().filter(|d| d.has_input() && !d.has_output()) {
        writeln!(out, "  {}", d.name)?;
    }
    Ok(())
}

static RUN_THREADS: AtomicBool = AtomicBool::new(true);

pub fn run_threads() -> bool {
    RUN_THREADS.load(Ordering::SeqCst)
}

pub fn set_run_threads() {
    RUN_THREADS.store(true, Ordering::SeqCst);
}

pub fn clear_run_threads() {
    RUN_THREADS.store(false, Ordering::SeqCst);
}

/// Per-worker finished flag/condvar pair, the Rust analogue of the
/// original's `pthread_cond_t`+`pthread_mutex_t` lifecycle primitive.
#[derive(Clone)]
pub struct Finished(Arc<(Mutex<bool>, Condvar)>);

impl Default for Finished {
    fn default() -> Self {
        Finished(Arc::new((Mutex::new(false), Condvar::new())))
    }
}

impl Finished {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let (lock, cvar) = &*self.0;
        let mut done = lock.lock().unwrap();
        *done = true;
        cvar.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        *self.0 .0.lock().unwrap()
    }

    /// Waits up to `timeout` for the flag to be set, returning its value.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.0;
        let done = lock.lock().unwrap();
        if *done {
            return true;
        }
        let (done, _) = cvar.wait_timeout(done, timeout).unwrap();
        *done
    }
}

/// Arguments passed to a worker thread's `init`/`run` functions.
pub struct ThreadArgs {
    pub instance_id: i32,
    pub input_buffer: Option<i32>,
    pub output_buffer: Option<i32>,
    pub cpu_mask: u32,
    pub priority: i32,
    pub finished: Finished,
    pub status: Arc<Mutex<StatusBuffer>>,
    /// Monotonically increasing block counter a `run` callback can use to
    /// track which ring block it's on across successive calls.
    pub cursor: AtomicU64,
}

impl ThreadArgs {
    /// Records this worker's lifecycle state (`"init"`, `"waiting"`,
    /// `"blocked*"`, `"processing"`, `"exiting"`) under its descriptor's
    /// status key. Logs rather than propagating a failure here: a status
    /// write hiccup shouldn't bring down an otherwise-healthy worker.
    pub fn set_lifecycle(&self, skey: &str, state: &str) {
        match self.status.lock() {
            Ok(mut s) => {
                if let Err(e) = s.put_str(skey, state) {
                    log::warn!("failed to update status key '{skey}' to '{state}': {e}");
                }
            }
            Err(e) => log::warn!("status buffer lock poisoned: {e}"),
        }
    }
}

/// Applies `mask` (bit N => core N, first 32 cores only) via
/// `sched_setaffinity`. A mask of 0 leaves the inherited affinity as-is.
pub fn set_cpu_affinity(mask: u32) -> Result<()> {
    if mask == 0 {
        return Ok(());
    }
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        for i in 0..32u32 {
            if (mask >> i) & 1 == 1 {
                libc::CPU_SET(i as usize, &mut cpuset);
            }
        }
        let rv = libc::sched_setaffinity(
            0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &cpuset,
        );
        if rv < 0 {
            return Err(crate::error::last_os_error().into());
        }
    }
    Ok(())
}

pub fn get_cpu_affinity() -> Result<u32> {
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        let rv = libc::sched_getaffinity(
            0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &mut cpuset,
        );
        if rv < 0 {
            return Err(crate::error::last_os_error().into());
        }
        let mut mask = 0u32;
        for i in 0..32usize {
            if libc::CPU_ISSET(i, &cpuset) {
                mask |= 1 << i;
            }
        }
        Ok(mask)
    }
}

pub fn set_priority(priority: i32) -> Result<()> {
    let rv = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) };
    if rv < 0 {
        return Err(crate::error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_run(_: &ThreadArgs, _: Option<&RingDatabuf>, _: Option<&RingDatabuf>) -> Result<()> {
        Ok(())
    }

    #[test]
    fn find_is_case_sensitive() {
        register(ThreadDesc {
            name: "net_thread",
            skey: "NETST",
            init: None,
            run: dummy_run,
            ibuf_create: None,
            obuf_create: None,
        })
        .unwrap();
        assert!(find("net_thread").is_some());
        assert!(find("NET_THREAD").is_none());
    }

    #[test]
    fn finished_flag_round_trips() {
        let f = Finished::new();
        assert!(!f.is_finished());
        f.set();
        assert!(f.is_finished());
        assert!(f.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn run_threads_flag_defaults_true_and_clears() {
        set_run_threads();
        assert!(run_threads());
        clear_run_threads();
        assert!(!run_threads());
        set_run_threads();
    }
}
