use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "clusterkey",
    author,
    version,
    about = "Cluster key manager: bootstrap, inspect, and rotate the wrapped data-encryption keys."
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Configuration file (defaults to the CLUSTERKEY_CONFIG path)."
    )]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Emit machine-readable JSON output.")]
    pub json: bool,

    #[arg(long, global = true, help = "Print values only, no prose.")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Create the keystore for a new cluster.")]
    Bootstrap(BootstrapArgs),

    #[command(about = "Rotate the cluster passphrase; internal keys are unchanged.")]
    Rotate(RotateArgs),

    #[command(about = "Report the keystore state without running the passphrase command.")]
    Status(StatusArgs),

    #[command(about = "Check that the configured passphrase command unlocks the keystore.")]
    Verify(VerifyArgs),
}

#[derive(Debug, Args)]
pub struct DataDirArg {
    #[arg(
        long = "data-dir",
        value_name = "DIR",
        help = "Cluster data directory holding the keystore."
    )]
    pub data_dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct BootstrapArgs {
    #[command(flatten)]
    pub data_dir: DataDirArg,

    #[arg(
        long,
        value_name = "TEMPLATE",
        help = "Passphrase command template; %p expands to the prompt. \
                Falls back to the configured value."
    )]
    pub command: Option<String>,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Record the enabled feature and command template in the configuration file."
    )]
    pub save_config: bool,
}

#[derive(Debug, Args)]
pub struct RotateArgs {
    #[command(flatten)]
    pub data_dir: DataDirArg,

    #[arg(
        long,
        value_name = "TEMPLATE",
        help = "Passphrase command template for the new passphrase. \
                Falls back to the configured value."
    )]
    pub command: Option<String>,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Record the new command template in the configuration file after rotating."
    )]
    pub save_config: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub data_dir: DataDirArg,
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub data_dir: DataDirArg,

    #[arg(
        long,
        value_name = "TEMPLATE",
        help = "Passphrase command template to verify. Falls back to the configured value."
    )]
    pub command: Option<String>,
}
