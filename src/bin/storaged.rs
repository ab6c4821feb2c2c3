use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{crate_version, Arg, ArgAction, Command};

use storaged::acceptor::Acceptor;
use storaged::{Config, Service};

fn main() -> ExitCode {
    let matches = Command::new("storaged")
        .version(crate_version!())
        .about("In-memory file storage service over a local Unix domain socket")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("Path to a KEY=VALUE configuration file"),
        )
        .arg(
            Arg::new("foreground")
                .long("foreground")
                .action(ArgAction::SetTrue)
                .help("Stay attached to the terminal and mirror log lines to stderr"),
        )
        .get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => match Config::load(&PathBuf::from(path)) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("storaged: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    let foreground = matches.get_flag("foreground");
    let service = match if foreground {
        Service::new_foreground(config)
    } else {
        Service::new(config)
    } {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("storaged: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = storaged::signals::install() {
        eprintln!("storaged: failed to install signal handlers: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = storaged::logsink::install_global_logger(Arc::clone(&service.log)) {
        eprintln!("storaged: failed to install logger: {e}");
        return ExitCode::FAILURE;
    }

    let (mut acceptor, return_pipe) = match Acceptor::bind(service.socket_path()) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("storaged: {e}");
            return ExitCode::FAILURE;
        }
    };

    service.log.server_started();
    let workers = storaged::worker::spawn_pool(Arc::clone(&service), return_pipe);
    acceptor.run(&service);

    service.registry.set_quit();
    for handle in workers {
        let _ = handle.join();
    }
    service.log.server_terminated();
    let _ = std::fs::remove_file(service.socket_path());

    ExitCode::SUCCESS
}
