mod cgi;
mod config;
mod fd;
mod handler;
mod http;
mod multipart;
mod response;
mod routing;
mod server;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

use crate::config::Config;
use crate::server::Server;

const DEFAULT_CONFIG_PATH: &str = "conf/selfserv.conf";

// One tick's upper bound; poll_once clamps it further to the earliest
// connection deadline.
const POLL_TICK_MS: i32 = 1000;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

fn usage(argv0: &str) {
    print!(
        "usage:\t{} [/path/to/selfserv.conf]\n\n\
        \tServes the virtual hosts described by the configuration file\n\
        \t(default: {}).\n",
        argv0, DEFAULT_CONFIG_PATH
    );
}

fn main() -> Result<()> {
    println!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args();
    let argv0 = args.next().unwrap_or_else(|| "selfserv".to_string());
    let config_path = match args.next().as_deref() {
        Some("--help") => {
            usage(&argv0);
            return Ok(());
        }
        Some(path) => path.to_string(),
        None => DEFAULT_CONFIG_PATH.to_string(),
    };
    if args.next().is_some() {
        usage(&argv0);
        return Err(anyhow!("too many arguments"));
    }

    let config = Config::load(Path::new(&config_path))?;

    // A client or CGI child disappearing mid-write is an I/O error here,
    // not a reason to die.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    let mut server = Server::new(config);
    server.init()?;

    while is_running() {
        server.poll_once(POLL_TICK_MS)?;
        server.process_events();
    }

    server.shutdown();
    Ok(())
}
