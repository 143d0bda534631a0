//! vnetgwd - the virtual network gateway daemon.
//!
//! Launched by the supervisor with the guest link fd inherited:
//!
//!   vnetgwd --fd 3 --mtu 1500 \
//!       --control-socket /tmp/vnetgw.sock \
//!       --forward "tcp:127.0.0.1:2222->tcp:22"
//!
//! The supervisor keeps the other end of the socket pair wired to the
//! hypervisor's virtio-net device.

use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use gateway_protocol::forward::ForwardSpec;
use tracing_subscriber::EnvFilter;

use vnet_gateway::{Gateway, GatewayConfig};

#[derive(Parser, Debug)]
#[command(name = "vnetgwd", about = "User-space virtual network gateway")]
struct Args {
    /// Inherited datagram socket-pair fd carrying one Ethernet frame per
    /// datagram.
    #[arg(long, conflicts_with = "stream_fd")]
    fd: Option<i32>,

    /// Inherited stream fd carrying length-prefixed frames (QEMU mode).
    #[arg(long)]
    stream_fd: Option<i32>,

    /// Link MTU: 1500 or 65520.
    #[arg(long, default_value_t = 1500)]
    mtu: usize,

    /// Write every link frame to this pcap file.
    #[arg(long)]
    pcap: Option<PathBuf>,

    /// Directory for config.json / state.json.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Control RPC unix socket path.
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Control RPC loopback TCP port.
    #[arg(long)]
    control_port: Option<u16>,

    /// Forward spec "from->to", repeatable.
    /// Example: "tcp:127.0.0.1:2222->tcp:22"
    #[arg(long = "forward")]
    forwards: Vec<String>,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(log_file: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| {
                    eprintln!("cannot open log file {}: {e}", path.display());
                    process::exit(1);
                });
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

fn parse_forwards(raw: &[String]) -> Result<Vec<ForwardSpec>, String> {
    raw.iter()
        .map(|s| {
            let (from, to) = s
                .split_once("->")
                .ok_or_else(|| format!("forward '{s}' is missing '->'"))?;
            ForwardSpec::parse(from.trim(), to.trim()).map_err(|e| format!("forward '{s}': {e}"))
        })
        .collect()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _log_guard = init_logging(args.log_file.as_ref());

    let forwards = match parse_forwards(&args.forwards) {
        Ok(forwards) => forwards,
        Err(e) => {
            eprintln!("{e}");
            process::exit(2);
        }
    };

    let mut config = GatewayConfig {
        mtu: args.mtu,
        pcap_path: args.pcap,
        control_unix: args.control_socket,
        control_tcp: args
            .control_port
            .map(|port| format!("127.0.0.1:{port}").parse().expect("loopback addr")),
        forwards,
        ..GatewayConfig::default()
    };
    if let Some(dir) = args.config_dir {
        config.config_dir = dir;
    }

    let mut builder = Gateway::builder(config);
    builder = match (args.fd, args.stream_fd) {
        (Some(fd), None) => {
            let std_sock = unsafe { std::os::unix::net::UnixDatagram::from_raw_fd(fd) };
            if let Err(e) = std_sock.set_nonblocking(true) {
                eprintln!("fd {fd}: {e}");
                process::exit(1);
            }
            match tokio::net::UnixDatagram::from_std(std_sock) {
                Ok(sock) => builder.datagram_link(sock),
                Err(e) => {
                    eprintln!("fd {fd}: {e}");
                    process::exit(1);
                }
            }
        }
        (None, Some(fd)) => {
            let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
            if let Err(e) = std_stream.set_nonblocking(true) {
                eprintln!("fd {fd}: {e}");
                process::exit(1);
            }
            match tokio::net::UnixStream::from_std(std_stream) {
                Ok(stream) => builder.stream_link(stream),
                Err(e) => {
                    eprintln!("fd {fd}: {e}");
                    process::exit(1);
                }
            }
        }
        _ => {
            eprintln!("exactly one of --fd or --stream-fd is required");
            process::exit(2);
        }
    };

    let gateway = match builder.build() {
        Ok(gateway) => gateway,
        Err(e) => {
            eprintln!("gateway setup failed: {e}");
            process::exit(1);
        }
    };

    let handle = match gateway.start().await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("gateway start failed: {e}");
            process::exit(1);
        }
    };

    let trigger = handle.trigger();
    tokio::spawn(async move {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("signal handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        trigger.shutdown();
    });

    handle.wait().await;
}
