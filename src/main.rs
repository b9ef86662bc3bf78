use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use sluiced::config::Config;
use sluiced::remote::NullRemote;
use sluiced::server::Server;

fn main() -> ExitCode {
    // Set up the command-line interface.
    let cmd = clap::Command::new("sluiced")
        .version(env!("SLUICE_BUILD_VERSION"))
        .next_line_help(true)
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("/etc/sluice/config.toml")
                .help("The configuration file to load"),
        )
        .arg(
            clap::Arg::new("check_config")
                .long("check-config")
                .action(clap::ArgAction::SetTrue)
                .help("Check the configuration and exit"),
        );
    let matches = cmd.get_matches();

    // Construct the configuration.
    let path = Utf8PathBuf::from(matches.get_one::<String>("config").unwrap());
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Sluice couldn't be configured: {error}");
            return ExitCode::FAILURE;
        }
    };

    if matches.get_flag("check_config") {
        return ExitCode::SUCCESS;
    }

    let logger = sluiced::log::Logger::launch(&config.log);
    if let Err(error) = logger {
        eprintln!("Sluice couldn't set up logging: {error}");
        return ExitCode::FAILURE;
    }

    // Bring the server up and let the event machinery run.  The transport
    // stack registers its backend here; without one, outbound operations
    // time out and are retried per event policy.
    let server = match Server::launch(config, Arc::new(NullRemote)) {
        Ok(server) => server,
        Err(error) => {
            tracing::error!("Sluice couldn't start: {error}");
            return ExitCode::FAILURE;
        }
    };

    server.wait();
    ExitCode::SUCCESS
}
