//! Guardian binary: hook mode by default, subcommands for operators.
//!
//! Exit behavior:
//!   - 0 with a JSON decision on stdout in hook mode
//!   - `kill_switch.exit_code` (default 2) after a kill-switch termination
//!   - 1 for CLI errors

use clap::Parser;
use guardian::cli::{self, Cli};
use guardian::hook;

fn main() {
    hook::configure_colors();

    let cli = Cli::parse();
    if cli.command.is_some() {
        if let Err(e) = cli::run_command(cli) {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
        return;
    }

    // No subcommand: hook mode.
    let code = hook::run();
    std::process::exit(code);
}
