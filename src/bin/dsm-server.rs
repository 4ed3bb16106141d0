//! The session server binary, spawned by the daemon.

use clap::Parser;

use dsm::msg::SessionId;
use dsm::server::{self, ServerOpts};

/// Global coordinator for one DSM session.
#[derive(Parser)]
#[command(name = "dsm-server", version)]
struct Args {
    /// Session identifier (at most 32 bytes).
    #[arg(long)]
    sid: String,

    /// Expected number of participants (at least 2).
    #[arg(long)]
    nproc: u32,

    /// Address of the session daemon to report back to.
    #[arg(long, default_value = dsm::net::LOOPBACK)]
    daemon_addr: String,

    /// Port of the session daemon.
    #[arg(long, default_value_t = dsm::net::DAEMON_PORT)]
    daemon_port: u16,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let Some(sid) = SessionId::new(&args.sid) else {
        eprintln!("dsm-server: invalid session id \"{}\"", args.sid);
        std::process::exit(1);
    };
    if args.nproc < 2 {
        eprintln!("dsm-server: --nproc must be at least 2");
        std::process::exit(1);
    }

    let opts = ServerOpts {
        sid,
        nproc: args.nproc,
        daemon_addr: args.daemon_addr,
        daemon_port: args.daemon_port,
    };
    if let Err(err) = server::run(&opts) {
        eprintln!("dsm-server: {}", err);
        std::process::exit(1);
    }
}
