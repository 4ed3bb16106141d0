//! The session daemon binary.

use clap::Parser;

/// Well-known rendezvous daemon mapping session ids to session servers.
#[derive(Parser)]
#[command(name = "dsmd", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = dsm::net::DAEMON_PORT)]
    port: u16,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(err) = dsm::daemon::run(args.port) {
        eprintln!("dsmd: {}", err);
        std::process::exit(1);
    }
}
