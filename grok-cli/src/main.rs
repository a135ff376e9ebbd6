use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use grok_cli::Cli;

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    grok_cli::init_tracing(cli.verbose);

    let output = grok_cli::run(&cli)?;
    std::io::stdout().lock().write_all(output.text.as_bytes())?;
    Ok(if output.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
