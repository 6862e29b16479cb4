//! Tether session node.
//!
//! Opens one connection described by a URL and pumps the event loop until
//! every connection is gone, printing lifecycle events and incoming RMIs.
//!
//! # Usage
//!
//! ```sh
//! tether-node 'tcp://:11111?listen=true&multiple=true&handshake=app-1.0.renderingbackend.gl'
//! tether-node 'tcp://localhost:11111?handshake=app-1.0.renderingbackend.gl&timeout=30'
//! ```

use std::time::Duration;

use tether::control::RmiCall;
use tether::network::ConnectionUrl;
use tether::{
    ControllerId, EventStatus, NetworkAccessManager, NetworkConfig, NetworkEvent, RmiTag,
};

/// Tag on which incoming RMIs are printed.
const PRINT_TAG: RmiTag = RmiTag::new(1);

#[derive(Debug, thiserror::Error)]
enum NodeError {
    #[error("{0}")]
    Usage(String),
    #[error("invalid url: {0}")]
    Url(#[from] tether::network::UrlError),
    #[error("could not open connection to {0}")]
    Connect(String),
}

struct Options {
    url: String,
    poll_timeout: Option<Duration>,
}

fn main() {
    tether::init_tracing();
    if let Err(e) = run() {
        eprintln!("tether-node: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), NodeError> {
    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;
    let url: ConnectionUrl = options.url.parse()?;

    let mut manager = NetworkAccessManager::with_config(NetworkConfig::default());
    let first = manager
        .new_connection(&options.url)
        .ok_or_else(|| NodeError::Connect(options.url.clone()))?;
    watch(&mut manager, first);
    report_events(&mut manager, &url);

    loop {
        match manager.process_events(options.poll_timeout) {
            EventStatus::Failed => break,
            EventStatus::TimedOut => {}
            EventStatus::Processed => report_events(&mut manager, &url),
        }
    }

    report_events(&mut manager, &url);
    eprintln!("tether-node: no connections left");
    Ok(())
}

fn watch(manager: &mut NetworkAccessManager, id: ControllerId) {
    if let Some(controller) = manager.controller_mut(id) {
        controller.add_rmi_callback(PRINT_TAG, move |call: &RmiCall<'_>| {
            eprintln!(
                "tether-node: {id} rmi tag {} ({} bytes): {}",
                call.tag,
                call.data.len(),
                String::from_utf8_lossy(call.data)
            );
        });
    }
}

/// Prints queued events; accepts pending clients when the URL allows several.
fn report_events(manager: &mut NetworkAccessManager, url: &ConnectionUrl) {
    let events: Vec<NetworkEvent> = manager.drain_events().collect();
    for event in events {
        match event {
            NetworkEvent::ConnectionCreated { controller, peer } => {
                let peer = peer.map_or_else(|| "unknown peer".to_owned(), |p| p.to_string());
                eprintln!("tether-node: {controller} connected to {peer}");
            }
            NetworkEvent::ConnectionClosed { controller } => {
                eprintln!("tether-node: {controller} closed");
            }
            NetworkEvent::HandshakeFailed { port, error } => {
                eprintln!("tether-node: client on port {port} rejected: {}", error.user_message());
            }
            NetworkEvent::ConnectionPending { port } if url.multiple => {
                if let Some(id) = manager.wait_for_connection(port, false, &url.handshake, true) {
                    watch(manager, id);
                    eprintln!("tether-node: {id} accepted on port {port}");
                }
            }
            NetworkEvent::ConnectionPending { port } => {
                eprintln!("tether-node: ignoring client on port {port}");
            }
        }
    }
}

fn parse_args(args: &[String]) -> Result<Options, NodeError> {
    let mut url = None;
    let mut poll_timeout = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--poll-ms" | "-p" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| NodeError::Usage("missing value for --poll-ms".into()))?;
                let ms: u64 = value
                    .parse()
                    .map_err(|_| NodeError::Usage(format!("invalid --poll-ms '{value}'")))?;
                poll_timeout = Some(Duration::from_millis(ms));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg if url.is_none() && !arg.starts_with('-') => url = Some(arg.to_owned()),
            arg => return Err(NodeError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    let url = url.ok_or_else(|| NodeError::Usage("missing connection url".into()))?;
    Ok(Options { url, poll_timeout })
}

fn print_usage() {
    eprintln!(
        r#"tether-node - open a tether connection and service it

USAGE:
    tether-node [OPTIONS] <URL>

URL:
    tcp://[host]:port[?listen=BOOL&multiple=BOOL&nonblocking=BOOL&handshake=STR&timeout=SECS]

OPTIONS:
    -p, --poll-ms <MS>      Event loop poll timeout (default: wait indefinitely)
    -h, --help              Print this help message

EXAMPLE:
    tether-node 'tcp://:11111?listen=true&multiple=true&handshake=app-1.0.renderingbackend.gl'
    tether-node 'tcp://localhost:11111?handshake=app-1.0.renderingbackend.gl'
"#
    );
}
