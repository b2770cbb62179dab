use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hashpipe::databuf::RingDatabuf;
use hashpipe::status::StatusBuffer;

/// Administrative CLI for inspecting and cleaning up hashpipe shared
/// memory segments. The idiomatic Rust rendition of the historical
/// per-purpose C programs (`hashpipe_check_databuf`,
/// `hashpipe_check_status`, `hashpipe_clean_shmem`,
/// `hashpipe_dump_databuf`): one binary, several subcommands.
#[derive(Parser)]
#[command(name = "hashpipe-admin", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dump every key/value pair in an instance's status buffer.
    CheckStatus {
        #[arg(short, long, default_value_t = 0)]
        instance: i32,
    },
    /// Print header fields and per-block status for a databuf.
    CheckDatabuf {
        #[arg(short, long, default_value_t = 0)]
        instance: i32,
        #[arg(short, long)]
        databuf: i32,
    },
    /// Hex dump `bytes` of one databuf block's contents, starting `skip`
    /// bytes into the block.
    DumpDatabuf {
        #[arg(short, long, default_value_t = 0)]
        instance: i32,
        #[arg(short, long)]
        databuf: i32,
        #[arg(short, long)]
        block: usize,
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long, default_value_t = 256)]
        bytes: usize,
    },
    /// Remove the shared memory segment(s) for an instance.
    CleanShmem {
        #[arg(short, long, default_value_t = 0)]
        instance: i32,
        #[arg(short, long)]
        databuf: Option<i32>,
        #[arg(long)]
        status: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::CheckStatus { instance } => check_status(instance),
        Command::CheckDatabuf { instance, databuf } => check_databuf(instance, databuf),
        Command::DumpDatabuf {
            instance,
            databuf,
            block,
            skip,
            bytes,
        } => dump_databuf(instance, databuf, block, skip, bytes),
        Command::CleanShmem {
            instance,
            databuf,
            status,
        } => clean_shmem(instance, databuf, status),
    }
}

fn check_status(instance: i32) -> Result<()> {
    let status = StatusBuffer::attach(instance).context("attaching status buffer")?;
    for (key, value) in status.dump().context("dumping status buffer")? {
        println!("{key:<8}= {value}");
    }
    Ok(())
}

fn check_databuf(instance: i32, databuf: i32) -> Result<()> {
    let db = RingDatabuf::attach(instance, databuf).context("attaching databuf")?;
    let header = db.header();
    let data_type = String::from_utf8_lossy(&header.data_type);
    println!("data_type:   {}", data_type.trim_end_matches('\0'));
    println!("header_size: {}", header.header_size);
    println!("block_size:  {}", header.block_size);
    println!("n_block:     {}", header.n_block);
    for b in 0..db.n_block() {
        let state = match db.block_status(b) {
            0 => "free",
            1 => "filled",
            _ => "unknown",
        };
        println!("block[{b}]: {state}");
    }
    Ok(())
}

fn dump_databuf(instance: i32, databuf: i32, block: usize, skip: usize, bytes: usize) -> Result<()> {
    let db = RingDatabuf::attach(instance, databuf).context("attaching databuf")?;
    let data = db.data(block).context("reading block")?;
    let start = skip.min(data.len());
    let n = start + bytes.min(data.len() - start);
    for (i, chunk) in data[start..n].chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        println!("{:08x}: {}", start + i * 16, hex.join(" "));
    }
    Ok(())
}

fn clean_shmem(instance: i32, databuf: Option<i32>, status: bool) -> Result<()> {
    if let Some(id) = databuf {
        let db = RingDatabuf::attach(instance, id).context("attaching databuf")?;
        db.remove().context("removing databuf shared memory")?;
        println!("removed databuf {id} for instance {instance}");
    }
    if status {
        let s = StatusBuffer::attach(instance).context("attaching status buffer")?;
        s.remove().context("removing status buffer shared memory")?;
        println!("removed status buffer for instance {instance}");
    }
    if databuf.is_none() && !status {
        anyhow::bail!("specify --databuf <ID> and/or --status");
    }
    Ok(())
}
