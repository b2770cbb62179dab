use anyhow::{Context, Result};
use std::process::Command;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: cargo xtask <command>");
        eprintln!("Commands:");
        eprintln!("  list-workers    Build the supervisor and list known worker modules");
        std::process::exit(1);
    }

    match args[1].as_str() {
        "list-workers" => list_workers(),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            std::process::exit(1);
        }
    }
}

fn list_workers() -> Result<()> {
    let status = Command::new("cargo")
        .args(["run", "--package", "hashpipe", "--bin", "hashpipe", "--", "--list"])
        .status()
        .context("Failed to execute cargo run for hashpipe --list")?;

    if !status.success() {
        anyhow::bail!("hashpipe --list failed with exit code: {}", status);
    }

    Ok(())
}
