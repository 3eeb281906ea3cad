use std::process;
use std::sync::Arc;

use clap::Parser;
use llmnrd::error::Result;
use llmnrd::hostname;
use llmnrd::interfaces::{InterfaceListener, InterfaceTable};
use llmnrd::netlink::NetlinkSource;
use llmnrd::responder::Responder;
use llmnrd::signals;
use llmnrd::socket::LlmnrSocket;
use llmnrd::wire::LLMNR_PORT;
use nix::sys::signal::Signal;

#[derive(Debug, Parser)]
#[clap(author, version, name = "llmnrd")]
/// Respond to LLMNR name queries for this host.
///
/// Joins the IPv6 LLMNR multicast group on every interface that has an
/// address, and answers A/AAAA queries for the host's short name with the
/// addresses configured on the interface each query arrived on.
struct Cli {
    /// UDP port to listen on
    #[arg(short, long, default_value_t = LLMNR_PORT)]
    port: u16,

    /// Signal number used to unblock the netlink worker on shutdown
    #[arg(short, long, default_value_t = libc::SIGUSR1)]
    interrupt_signal: i32,
}

fn main() {
    if let Err(err) = run() {
        log::error!("{}", err);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    pretty_env_logger::try_init()?;
    let args = Cli::parse();

    let interrupt = Signal::try_from(args.interrupt_signal)
        .map_err(|e| format!("invalid interrupt signal {}: {}", args.interrupt_signal, e))?;

    let host_name = hostname::short_host_name()?;
    log::info!(
        "responding for '{}' on port {}",
        String::from_utf8_lossy(&host_name),
        args.port
    );

    let table = Arc::new(InterfaceTable::new());
    let mut source = NetlinkSource::open(Some(interrupt))?;
    let socket = LlmnrSocket::open(args.port)?;

    let responder = Arc::new(Responder::new(socket, table.clone(), host_name));
    let listener: Arc<dyn InterfaceListener> = responder.clone();
    table.add_listener(listener.clone());
    signals::install_termination_handlers(responder.clone())?;

    // With the responder subscribed, the initial enumeration joins the
    // multicast group on every interface that already has addresses.
    source.start(table.clone())?;
    source.refresh()?;

    responder.run();

    log::info!("shutting down");
    source.stop();
    table.remove_listener(&listener);
    table.clear();
    Ok(())
}
