//! Process entry point: parses CLI flags, optionally layers a TOML config file under them,
//! wires up logging, the registries, the worker pool, the dispatcher, and the acceptor.
//! Modeled on `authenticator::main` (`examples/SleepingPills-bushhammer/server/services/authenticator/src/main.rs`)
//! for the `clap::App`/`Arg::with_name` shape, with `flux::logging::init()` replaced by
//! `relay_server::logging::init(level)`.

use std::sync::Arc;

use clap::{App, Arg};

use relay_core::{ChannelRegistry, ClientRegistry};
use relay_server::{acceptor::Acceptor, config::Config, dispatcher::Dispatcher, logging, worker::ThreadPool};

fn main() {
    let matches = App::new("relay-server")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the multi-tenant chat relay.")
        .arg(Arg::with_name("config").long("config").value_name("FILE").help("Path to a TOML config file").takes_value(true))
        .arg(Arg::with_name("bind").long("bind").value_name("ADDRESS").help("Address to bind").takes_value(true))
        .arg(Arg::with_name("port").long("port").value_name("PORT").help("Port to bind").takes_value(true))
        .arg(Arg::with_name("max-clients").long("max-clients").value_name("N").help("Maximum concurrent clients").takes_value(true))
        .arg(Arg::with_name("max-channels").long("max-channels").value_name("N").help("Maximum concurrent channels").takes_value(true))
        .arg(Arg::with_name("workers").long("workers").value_name("N").help("Worker pool size").takes_value(true))
        .arg(Arg::with_name("log-level").long("log-level").value_name("LEVEL").help("critical|error|warn|info|debug|trace").takes_value(true))
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => Config::load(path).unwrap_or_else(|err| {
            eprintln!("error reading config file {path}: {err}");
            std::process::exit(2);
        }),
        None => Config::default(),
    };

    if let Some(bind) = matches.value_of("bind") {
        config.bind_address = bind.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.port = port.parse().unwrap_or_else(|_| {
            eprintln!("invalid --port value: {port}");
            std::process::exit(2);
        });
    }
    if let Some(max_clients) = matches.value_of("max-clients") {
        config.max_clients = max_clients.parse().unwrap_or_else(|_| {
            eprintln!("invalid --max-clients value: {max_clients}");
            std::process::exit(2);
        });
    }
    if let Some(max_channels) = matches.value_of("max-channels") {
        config.max_channels = max_channels.parse().unwrap_or_else(|_| {
            eprintln!("invalid --max-channels value: {max_channels}");
            std::process::exit(2);
        });
    }
    if let Some(workers) = matches.value_of("workers") {
        config.workers = workers.parse().unwrap_or_else(|_| {
            eprintln!("invalid --workers value: {workers}");
            std::process::exit(2);
        });
    }
    if let Some(log_level) = matches.value_of("log-level") {
        config.log_level = log_level.to_string();
    }

    let log = logging::init(&config.log_level);

    let clients = Arc::new(ClientRegistry::new(config.max_clients));
    let channels = Arc::new(ChannelRegistry::new(config.max_channels));
    let workers = Arc::new(ThreadPool::new(config.workers));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&clients), Arc::clone(&channels), Arc::clone(&workers), log.clone()));

    let mut acceptor = Acceptor::bind(&config.socket_addr(), clients, dispatcher, workers, log);
    acceptor.run();
}
