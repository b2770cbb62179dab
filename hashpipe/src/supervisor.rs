//! Pipeline supervisor: parses the worker-chain command line, builds and
//! commits the pipeline, spawns workers in reverse order, and tears it all
//! down again on SIGINT/SIGTERM or normal completion.
//!
//! The CLI grammar interleaves positional worker names with per-"next
//! worker" stateful options (`-c`/`-m` set a pending CPU mask, `-I` sets a
//! pending instance id, `-o` accumulates status-buffer options), so it is
//! parsed by a small hand-rolled state machine rather than `clap`'s
//! derive/builder model, which does not have a natural way to express
//! "this flag applies to the next positional argument".

use std::thread;
use std::time::Duration;

use log::info;

use crate::config::Config;
use crate::error::{HpError, Result};
use crate::registry::{self, ThreadDesc};
use crate::status::StatusBuffer;

#[derive(Debug, Clone, Default)]
pub struct WorkerSpec {
    pub name: String,
    pub cpu_mask: u32,
    pub instance_id: Option<i32>,
    pub options: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct ParsedArgs {
    pub workers: Vec<WorkerSpec>,
    pub show_help: bool,
    pub show_list: bool,
}

/// Parses `argv` (excluding argv[0]) into a pipeline description.
///
/// `-c`/`--cpu N`, `-m`/`--mask MASK`, `-I`/`--instance N` set pending
/// state that is attached to the *next* positional worker name and then
/// reset. `-o`/`--option KEY[=VALUE]` accumulates into the pending
/// worker's option list (missing `=` stores an empty-string value).
pub fn parse_args(argv: &[String]) -> Result<ParsedArgs> {
    let mut out = ParsedArgs::default();
    let mut pending = WorkerSpec::default();
    let mut have_pending_worker = false;

    let mut flush = |pending: &mut WorkerSpec, have: &mut bool, out: &mut ParsedArgs| {
        if *have {
            out.workers.push(std::mem::take(pending));
            *have = false;
        }
    };

    let mut i = 0;
    while i < argv.len() {
        let arg = &argv[i];
        match arg.as_str() {
            "-h" | "--help" => out.show_help = true,
            "-l" | "--list" => out.show_list = true,
            "-c" | "--cpu" => {
                i += 1;
                let v = argv
                    .get(i)
                    .ok_or_else(|| HpError::parameter(format!("{arg} requires a value")))?;
                let n: u32 = v
                    .parse()
                    .map_err(|_| HpError::parameter(format!("{arg} value not an integer: {v}")))?;
                pending.cpu_mask = 1u32 << n;
            }
            "-m" | "--mask" => {
                i += 1;
                let v = argv
                    .get(i)
                    .ok_or_else(|| HpError::parameter(format!("{arg} requires a value")))?;
                let mask = if let Some(hex) = v.strip_prefix("0x") {
                    u32::from_str_radix(hex, 16)
                } else {
                    v.parse()
                }
                .map_err(|_| HpError::parameter(format!("{arg} value not a mask: {v}")))?;
                pending.cpu_mask = mask;
            }
            "-I" | "--instance" => {
                i += 1;
                let v = argv
                    .get(i)
                    .ok_or_else(|| HpError::parameter(format!("{arg} requires a value")))?;
                let mut n: i32 = v
                    .parse()
                    .map_err(|_| HpError::parameter(format!("{arg} value not an integer: {v}")))?;
                if !(0..=63).contains(&n) {
                    log::warn!("instance id {n} out of range [0,63], masking to low 6 bits");
                    n &= 0x3f;
                }
                pending.instance_id = Some(n);
            }
            "-o" | "--option" => {
                i += 1;
                let v = argv
                    .get(i)
                    .ok_or_else(|| HpError::parameter(format!("{arg} requires a value")))?;
                match v.split_once('=') {
                    Some((k, val)) => pending.options.push((k.to_string(), val.to_string())),
                    None => pending.options.push((v.clone(), String::new())),
                }
            }
            positional => {
                flush(&mut pending, &mut have_pending_worker, &mut out);
                tracing::trace!(worker = positional, "resolved positional worker name");
                pending.name = positional.to_string();
                have_pending_worker = true;
            }
        }
        i += 1;
    }
    flush(&mut pending, &mut have_pending_worker, &mut out);
    Ok(out)
}

/// A built pipeline: resolved descriptors ready to commit and run.
pub struct Pipeline {
    pub specs: Vec<WorkerSpec>,
    pub descs: Vec<ThreadDesc>,
    pub default_instance_id: i32,
    /// Buffer index assigned to each worker's input/output ring, parallel
    /// to `specs`/`descs`. Worker `i` gets input buffer `i` and output
    /// buffer `i+1`, matching the adjacent-worker handoff in a linear
    /// pipeline; a worker's descriptor decides which (if either) it uses.
    pub input_bufs: Vec<i32>,
    pub output_bufs: Vec<i32>,
}

/// Resolves every worker name against the registry, assigns each worker's
/// input/output buffer index (monotonically increasing across the whole
/// pipeline per spec.md §4.E step 1), and invokes the descriptor's
/// databuf-create callbacks so the rings exist before any thread is
/// spawned. Returns a Parameter error (before any thread is spawned) if a
/// name is unknown or a create callback fails.
pub fn build(specs: Vec<WorkerSpec>, default_instance_id: i32) -> Result<Pipeline> {
    let mut descs = Vec::with_capacity(specs.len());
    let mut input_bufs = Vec::with_capacity(specs.len());
    let mut output_bufs = Vec::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        let desc = registry::find(&spec.name)
            .ok_or_else(|| HpError::parameter(format!("unknown worker '{}'", spec.name)))?;
        let instance_id = spec.instance_id.unwrap_or(default_instance_id);
        let input_buf = i as i32;
        let output_buf = i as i32 + 1;
        if let Some(create) = desc.ibuf_create {
            create(instance_id, input_buf).map_err(|e| {
                HpError::parameter(format!(
                    "'{}' failed to create input databuf {input_buf}: {e}",
                    spec.name
                ))
            })?;
        }
        if let Some(create) = desc.obuf_create {
            create(instance_id, output_buf).map_err(|e| {
                HpError::parameter(format!(
                    "'{}' failed to create output databuf {output_buf}: {e}",
                    spec.name
                ))
            })?;
        }
        descs.push(desc);
        input_bufs.push(input_buf);
        output_bufs.push(output_buf);
    }
    Ok(Pipeline {
        specs,
        descs,
        default_instance_id,
        input_bufs,
        output_bufs,
    })
}

impl Pipeline {
    /// Writes every worker's `-o` options to its status buffer.
    pub fn commit(&self) -> Result<()> {
        for spec in &self.specs {
            let instance_id = spec.instance_id.unwrap_or(self.default_instance_id);
            let mut status = StatusBuffer::attach(instance_id)?;
            for (k, v) in &spec.options {
                status.put_str(k, v)?;
            }
        }
        Ok(())
    }

    /// Spawns every worker thread in reverse pipeline order (consumers
    /// before producers), pausing `spawn_delay` between each spawn, and
    /// blocks until shutdown is requested (SIGINT/SIGTERM or all workers
    /// exiting on their own), then tears the pipeline down in reverse
    /// spawn order.
    pub fn run(&self, cfg: &Config) -> Result<()> {
        raise_memlock_limit();
        registry::set_run_threads();
        let run_threads_flag_guard = install_signal_handler()?;

        let mut handles = Vec::with_capacity(self.specs.len());
        let indices = self.specs.iter().enumerate().rev();
        for (i, spec) in indices {
            let desc = self.descs[i];
            let instance_id = spec.instance_id.unwrap_or(self.default_instance_id);
            let cpu_mask = spec.cpu_mask;
            let input_buf = desc.has_input().then_some(self.input_bufs[i]);
            let output_buf = desc.has_output().then_some(self.output_bufs[i]);
            let name = spec.name.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    run_one_worker(&name, desc, instance_id, cpu_mask, input_buf, output_buf)
                })
                .map_err(|e| HpError::fatal(format!("spawn '{name}' failed: {e}")))?;
            handles.push((spec.name.clone(), handle));
            thread::sleep(Duration::from_millis(cfg.runtime.spawn_delay_ms));
        }
        // handles were pushed in reverse spawn order; reverse again so
        // index 0 is the first-spawned (last-in-pipeline) worker, matching
        // the join order below.
        handles.reverse();

        while registry::run_threads() {
            thread::sleep(Duration::from_millis(200));
        }

        for (name, handle) in handles.into_iter().rev() {
            match handle.join() {
                Ok(Ok(())) => info!("Joined thread '{name}'"),
                Ok(Err(e)) => log::error!("thread '{name}' exited with error: {e}"),
                Err(_) => log::error!("thread '{name}' panicked"),
            }
        }

        drop(run_threads_flag_guard);
        Ok(())
    }
}

fn run_one_worker(
    name: &str,
    desc: ThreadDesc,
    instance_id: i32,
    cpu_mask: u32,
    input_buf: Option<i32>,
    output_buf: Option<i32>,
) -> Result<()> {
    let guard = crate::runtime::WorkerGuard::enter(instance_id, cpu_mask, 0, input_buf, output_buf)?;
    guard.args.set_lifecycle(desc.skey, "init");
    if let Some(init) = desc.init {
        init(&guard.args)?;
    }
    guard.args.set_lifecycle(desc.skey, "processing");
    let result = loop {
        if !registry::run_threads() {
            break Ok(());
        }
        match crate::runtime::run_worker(&guard, desc.run) {
            Ok(()) => continue,
            Err(e) if e.is_retryable() => continue,
            Err(e) => {
                log::error!("worker '{name}' run error: {e}");
                registry::clear_run_threads();
                break Err(e);
            }
        }
    };
    guard.args.set_lifecycle(desc.skey, "exiting");
    result
}

/// Raises `RLIMIT_MEMLOCK` to its hard maximum so ring buffers and (for the
/// IBV capture worker) registered packet memory regions can be pinned with
/// `mlock`/`SHM_LOCK`. Best-effort: a failure here is logged, not fatal,
/// since a privileged or already-unlimited process commonly has nothing to
/// raise.
fn raise_memlock_limit() {
    let mut rl = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rl) };
    if rc != 0 {
        log::warn!("getrlimit(RLIMIT_MEMLOCK) failed: {}", crate::error::last_os_error());
        return;
    }
    rl.rlim_cur = rl.rlim_max;
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rl) };
    if rc != 0 {
        log::warn!(
            "setrlimit(RLIMIT_MEMLOCK, {}) failed: {}",
            rl.rlim_max,
            crate::error::last_os_error()
        );
    }
}

/// Installs the SIGINT/SIGTERM handler that clears the global run flag.
/// Returned guard exists only so callers can express "keep the handler
/// alive for the pipeline's run duration" in code; `ctrlc`'s handler is
/// process-global and cannot itself be uninstalled.
#[must_use]
pub struct SignalGuard(());

pub fn install_signal_handler() -> Result<SignalGuard> {
    ctrlc::set_handler(move || {
        log::info!("received shutdown signal");
        registry::clear_run_threads();
    })
    .map_err(|e| HpError::fatal(format!("failed to install signal handler: {e}")))?;
    Ok(SignalGuard(()))
}

/// Prints the no-workers-specified message and the known-worker catalog,
/// matching scenario S1 (empty pipeline exits 1 after printing catalog).
pub fn print_empty_pipeline_catalog() {
    eprintln!("No threads specified!");
    let mut out = std::io::stdout();
    let _ = registry::list(&mut out);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_plain_worker_chain() {
        let parsed = parse_args(&args(&["net_thread", "fluff_thread"])).unwrap();
        assert_eq!(parsed.workers.len(), 2);
        assert_eq!(parsed.workers[0].name, "net_thread");
        assert_eq!(parsed.workers[1].name, "fluff_thread");
    }

    #[test]
    fn cpu_and_mask_apply_to_next_worker_only() {
        let parsed = parse_args(&args(&[
            "-c", "2", "net_thread", "fluff_thread",
        ]))
        .unwrap();
        assert_eq!(parsed.workers[0].cpu_mask, 1 << 2);
        assert_eq!(parsed.workers[1].cpu_mask, 0);
    }

    #[test]
    fn option_without_equals_stores_empty_value() {
        let parsed = parse_args(&args(&["-o", "DEBUG", "net_thread"])).unwrap();
        assert_eq!(parsed.workers[0].options, vec![("DEBUG".to_string(), String::new())]);
    }

    #[test]
    fn option_with_equals_splits_key_value() {
        let parsed = parse_args(&args(&["-o", "BINDHOST=10.0.0.1", "net_thread"])).unwrap();
        assert_eq!(
            parsed.workers[0].options,
            vec![("BINDHOST".to_string(), "10.0.0.1".to_string())]
        );
    }

    #[test]
    fn instance_out_of_range_is_masked_not_rejected() {
        let parsed = parse_args(&args(&["-I", "200", "net_thread"])).unwrap();
        assert_eq!(parsed.workers[0].instance_id, Some(200 & 0x3f));
    }

    #[test]
    fn list_and_help_flags_are_detected() {
        let parsed = parse_args(&args(&["--list"])).unwrap();
        assert!(parsed.show_list);
        assert!(parsed.workers.is_empty());
    }

    #[test]
    fn empty_argv_yields_no_workers() {
        let parsed = parse_args(&[]).unwrap();
        assert!(parsed.workers.is_empty());
        assert!(!parsed.show_help);
    }

    #[test]
    fn build_rejects_unknown_worker_name() {
        let specs = vec![WorkerSpec {
            name: "definitely_not_registered_xyz".to_string(),
            ..Default::default()
        }];
        assert!(build(specs, 0).is_err());
    }
}
