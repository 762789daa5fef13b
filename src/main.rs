mod config;
mod exchange;
mod exchange_pool;
mod local_server;
mod port_hopper;
mod socks_ingress;
mod stealth_packet;
mod tunnel_cipher;

use std::io::Write;
use std::sync::Arc;

use tokio::runtime::Builder;
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::exchange_pool::{DEFAULT_NUM_WORKERS, ExchangePool};
use crate::local_server::run_local_server;
use crate::port_hopper::PortHopper;
use crate::tunnel_cipher::TunnelCipher;

fn print_usage_and_exit(arg0: String) -> ! {
    eprintln!("Usage: {arg0} --server/-s <ip:port> --psk/-k <32-byte key> [--threads/-t N]");
    std::process::exit(1);
}

fn main() {
    env_logger::builder()
        .format(|buf, record| {
            let timestamp = buf.timestamp();
            let level_style = buf.default_level_style(record.level());
            let sanitized_args = format!("{}", record.args())
                .chars()
                .map(|c| {
                    if c.is_ascii_graphic() || c == ' ' {
                        c
                    } else {
                        '?'
                    }
                })
                .collect::<String>();

            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}] {}",
                timestamp,
                record.level(),
                record.target(),
                sanitized_args
            )
        })
        .init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    let mut server = None;
    let mut psk = None;
    let mut num_threads = 0usize;

    while !args.is_empty() {
        if args[0] == "--server" || args[0] == "-s" {
            args.remove(0);
            if args.is_empty() {
                eprintln!("Missing server address argument.");
                print_usage_and_exit(arg0);
            }
            server = Some(args.remove(0));
        } else if args[0] == "--psk" || args[0] == "-k" {
            args.remove(0);
            if args.is_empty() {
                eprintln!("Missing pre-shared key argument.");
                print_usage_and_exit(arg0);
            }
            psk = Some(args.remove(0));
        } else if args[0] == "--threads" || args[0] == "-t" {
            args.remove(0);
            if args.is_empty() {
                eprintln!("Missing threads argument.");
                print_usage_and_exit(arg0);
            }
            num_threads = match args.remove(0).parse::<usize>() {
                Ok(n) => n,
                Err(e) => {
                    eprintln!("Invalid thread count: {e}");
                    print_usage_and_exit(arg0);
                }
            };
        } else {
            eprintln!("Invalid argument: {}", args[0]);
            print_usage_and_exit(arg0);
        }
    }

    let (Some(server), Some(psk)) = (server, psk) else {
        eprintln!("Both --server and --psk are required.");
        print_usage_and_exit(arg0);
    };

    // Fatal configuration errors happen here, before any socket opens.
    let config = match ClientConfig::new(&server, &psk, num_threads) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let cipher = match TunnelCipher::new(&config.psk) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let num_threads = if config.num_threads == 0 {
        std::cmp::max(
            2,
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        )
    } else {
        config.num_threads
    };

    let mut builder = if num_threads == 1 {
        Builder::new_current_thread()
    } else {
        let mut mt = Builder::new_multi_thread();
        mt.worker_threads(num_threads);
        mt
    };

    let runtime = builder
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not build tokio runtime");

    runtime.block_on(async move {
        let hopper = PortHopper::new(config.server_addr);

        // The sender lives for the whole process; dropping it on exit
        // stops the hop loop, which drops its socket.
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(hopper.clone().run(stop_rx));

        let pool = Arc::new(ExchangePool::new(DEFAULT_NUM_WORKERS));

        if let Err(e) = run_local_server(hopper, cipher, pool).await {
            eprintln!("{e}");
            std::process::exit(1);
        }
    });
}
