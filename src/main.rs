use std::process::ExitCode;

fn main() -> ExitCode {
    clusterkey::app::run()
}
