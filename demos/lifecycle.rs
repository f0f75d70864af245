/// This example creates (or opens) a Wintun adapter, starts a session and prints a line for every
/// packet the system routes into the adapter until Ctrl-C is pressed. The session is ended from
/// the main thread, which unblocks the receive loop, and the adapter is closed afterwards. Pass
/// `--uninstall` to remove the driver once the adapter is gone.
///
/// Run with `RUST_LOG=debug` to see lifecycle transitions and the driver's own log lines.
use clap::Parser;

#[derive(Parser)]
#[cfg_attr(not(windows), allow(dead_code))]
struct Cli {
    /// Adapter name
    #[clap(short, long, default_value = "Demo")]
    name: String,
    /// Tunnel type shared by the application's adapters
    #[clap(short, long, default_value = "Wintun")]
    tunnel_type: String,
    /// Open an existing adapter instead of creating one
    #[clap(short, long)]
    open: bool,
    /// Ring capacity in bytes (power of two between 128 KiB and 64 MiB)
    #[clap(short, long, default_value_t = wintunapi::DEFAULT_RING_CAPACITY)]
    ring_capacity: u32,
    /// Uninstall the driver when done
    #[clap(short, long)]
    uninstall: bool,
}

#[cfg(windows)]
fn main() -> wintunapi::Result<()> {
    use std::{ops::ControlFlow, sync::mpsc, thread};
    use wintunapi::{Lifecycle, LifecycleConfig, LoopExit, Wintun};

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = if cli.open {
        LifecycleConfig::open(cli.name)
    } else {
        LifecycleConfig::create(cli.name, cli.tunnel_type)
    }
    .with_ring_capacity(cli.ring_capacity)
    .with_uninstall(cli.uninstall);

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .expect("Error setting Ctrl-C handler");

    let mut wintun = Wintun::new()?;
    let received = Lifecycle::new(config).run(&mut wintun, |session| {
        println!(
            "Session started on {} (LUID {}), press Ctrl-C to stop",
            session.adapter().name(),
            session.adapter().luid()?
        );

        thread::scope(|s| {
            let receiver = s.spawn(|| -> wintunapi::Result<usize> {
                let mut count = 0usize;
                let exit = session.receive_loop(|packet| {
                    count += 1;
                    println!(
                        "packet #{count}: {} bytes, IP version {}",
                        packet.len(),
                        packet.first().map_or(0, |b| b >> 4)
                    );
                    ControlFlow::Continue(())
                })?;
                debug_assert_eq!(exit, LoopExit::SessionEnded);
                Ok(count)
            });

            let _ = stop_rx.recv();
            session.end()?;
            receiver.join().expect("receive thread panicked")
        })
    })?;

    println!("Received {received} packets");
    Ok(())
}

#[cfg(not(windows))]
fn main() {
    let _ = Cli::parse();
    println!("This example requires Windows and wintun.dll");
}
