use crate::cmd::{init_logger, Args};
use anyhow::Result;
use clap::Parser;

mod abi;
mod archive;
mod builder;
mod cache;
mod cmd;
mod common;
mod config;
mod manifest;
mod platform;
mod registry;
mod resolver;
mod sbom;
mod spec;
/// Test code that should only be compiled when running tests.
#[cfg(test)]
mod test;
mod tools;
mod triplet;
mod version;

/// `anyhow` prints a nicely formatted error message with `Debug`, so we can
/// return a result from the `main` function.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.log_level);
    cmd::run(args).await
}
