//! `dutctl`: the client binary. Parses the command line into a `Policy`
//! (or a one-shot query) and drives the session against a server spawned
//! over `ssh`, or a local override binary for testing.

use anyhow::Context;
use clap::Parser;
use dutctl::client::{self, session::Policy};
use std::path::PathBuf;
use std::time::Duration;

/// Remote board control harness.
#[derive(Parser, Debug)]
#[command(name = "dutctl", about = "Drive a remote board over a cdba-style harness")]
struct Cli {
    /// Board name (required for Boot and Info modes).
    #[arg(short = 'b')]
    board: Option<String>,

    /// Remote host to ssh into.
    #[arg(short = 'h')]
    host: String,

    /// Total session timeout in seconds.
    #[arg(short = 't', default_value_t = 600)]
    total_timeout: u64,

    /// Inactivity timeout in seconds; 0 disables it.
    #[arg(short = 'T', default_value_t = 0)]
    inactivity_timeout: u64,

    /// Power-cycle budget; cycles on any timeout kind.
    #[arg(short = 'c')]
    cycle_budget_lower: Option<u32>,

    /// Power-cycle budget; refuses to cycle on a total timeout.
    #[arg(short = 'C')]
    cycle_budget_upper: Option<u32>,

    /// Print board info and exit.
    #[arg(short = 'i')]
    info: bool,

    /// List accessible boards and exit.
    #[arg(short = 'l')]
    list: bool,

    /// Re-stream the image on every re-entry to flashing mode.
    #[arg(short = 'R')]
    repeat_image: bool,

    /// Spawn PATH directly instead of `ssh HOST dutctl-serverd`.
    #[arg(short = 'S')]
    server_override: Option<String>,

    /// Boot image path (required unless -i or -l is given).
    image: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let (process, stdin, stdout) = client::connect(&cli.host, cli.server_override.as_deref())
        .with_context(|| format!("connecting to {}", cli.host))?;

    let exit_code = if cli.list {
        client::run_list(process, stdin, stdout)?
    } else if cli.info {
        let board = cli.board.context("-i requires -b NAME")?;
        client::run_info(process, stdin, stdout, &board)?
    } else {
        let board = cli.board.context("boot mode requires -b NAME")?;
        let image = cli.image.context("boot mode requires a boot image path")?;
        let (cycle_budget, cycle_on_timeout) = match (cli.cycle_budget_lower, cli.cycle_budget_upper) {
            (Some(_), Some(_)) => anyhow::bail!("-c and -C are mutually exclusive"),
            (Some(n), None) => (n, true),
            (None, Some(n)) => (n, false),
            (None, None) => (0, true),
        };
        let policy = Policy {
            board,
            image_path: image,
            total_timeout: Duration::from_secs(cli.total_timeout),
            inactivity_timeout: if cli.inactivity_timeout == 0 {
                None
            } else {
                Some(Duration::from_secs(cli.inactivity_timeout))
            },
            cycle_budget,
            cycle_on_timeout,
            repeat_image: cli.repeat_image,
        };
        client::run_boot(process, stdin, stdout, policy)?
    };

    std::process::exit(exit_code);
}
