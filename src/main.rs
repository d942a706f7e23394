use clap::error::ErrorKind;
use clap::Parser;

use kinesistap::app;
use kinesistap::cli::{exit, Cli, Command};

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let code = match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit::OK,
                _ => exit::INVALID_ARGUMENT,
            };
            error.print().ok();
            std::process::exit(code);
        }
    };

    app::init_tracing();

    let config_dir = cli.resolved_config_dir();
    let code = match cli.command {
        None | Some(Command::Run) => app::run(&config_dir).await,
        Some(Command::Validate { path }) => app::validate(&config_dir, &path).await,
        Some(Command::Status) => app::status(&config_dir),
    };
    std::process::exit(code);
}
