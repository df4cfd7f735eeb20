use crate::{cli, commands, exit_codes, output};
use clap::{ColorChoice, CommandFactory, FromArgMatches, error::ErrorKind as ClapErrorKind};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

pub struct AppContext {
    pub output_mode: output::OutputMode,
    pub config: Option<PathBuf>,
}

pub fn run() -> ExitCode {
    init_tracing();

    let cli = match parse_cli() {
        Ok(cli) => cli,
        Err(code) => return code,
    };

    let output_mode = output::OutputMode {
        json: cli.json,
        quiet: cli.quiet,
    };

    let Some(command) = cli.command else {
        let mut cmd = configure_command_colors(cli::Cli::command());
        cmd.print_help().expect("help to be printed");
        println!();
        return ExitCode::from(exit_codes::EXIT_USAGE);
    };

    let ctx = AppContext {
        output_mode,
        config: cli.config,
    };

    commands::dispatch(command, &ctx)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "clusterkey=warn".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn parse_cli() -> Result<cli::Cli, ExitCode> {
    let cmd = configure_command_colors(cli::Cli::command());

    let matches = match cmd.try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            let kind = err.kind();
            if matches!(
                kind,
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion
            ) {
                let _ = err.print();
                return Err(ExitCode::SUCCESS);
            }

            let _ = err.print();
            return Err(ExitCode::from(exit_codes::EXIT_USAGE));
        }
    };

    match cli::Cli::from_arg_matches(&matches) {
        Ok(cli) => Ok(cli),
        Err(err) => {
            let _ = err.print();
            Err(ExitCode::from(exit_codes::EXIT_USAGE))
        }
    }
}

fn configure_command_colors(mut cmd: clap::Command) -> clap::Command {
    let no_color = std::env::var_os("NO_COLOR").is_some();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let stderr_is_tty = std::io::stderr().is_terminal();

    if no_color || !(stdout_is_tty && stderr_is_tty) {
        cmd = cmd.color(ColorChoice::Never);
    }

    cmd
}
