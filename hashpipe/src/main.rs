use std::process::ExitCode;

use anyhow::{Context, Result};
use hashpipe::config::Config;
use hashpipe::{registry, supervisor, workers};

fn main() -> Result<ExitCode> {
    let cfg = Config::load();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cfg.logging.level))
        .init();

    workers::register_builtin().context("registering built-in worker modules")?;

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let parsed = supervisor::parse_args(&argv).context("parsing command line")?;

    if parsed.show_help {
        print_usage();
        return Ok(ExitCode::SUCCESS);
    }

    if parsed.show_list {
        let mut out = std::io::stdout();
        registry::list(&mut out).context("listing known workers")?;
        return Ok(ExitCode::SUCCESS);
    }

    if parsed.workers.is_empty() {
        supervisor::print_empty_pipeline_catalog();
        return Ok(ExitCode::FAILURE);
    }

    let pipeline = supervisor::build(parsed.workers, cfg.runtime.default_instance_id)
        .context("building pipeline")?;
    pipeline.commit().context("committing status options")?;
    pipeline.run(&cfg).context("running pipeline")?;

    Ok(ExitCode::SUCCESS)
}

fn print_usage() {
    println!(
        "Usage: hashpipe [options] worker [options] worker ...\n\n\
         Options (apply to the next worker name):\n  \
         -c, --cpu N        set CPU affinity mask to 1<<N\n  \
         -m, --mask MASK     set CPU affinity mask directly (decimal or 0x-hex)\n  \
         -I, --instance N    set instance id (0-63)\n  \
         -o, --option KEY[=VALUE]  set a status buffer key for this worker\n\n\
         Other options:\n  \
         -l, --list          list known worker modules and exit\n  \
         -h, --help          show this message and exit"
    );
}
