mod cli;

use std::fs;
use std::io::Write;
use std::process;
use std::rc::Rc;
use std::sync::OnceLock;

use clap::Parser;
use cli::Cli;
use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use iomux::conf::{self, Config};
use iomux::json::{JsonFormatter, LogValue, TimeFormat};
use iomux::mux::{Mux, Waker};
use iomux::pcap;
use iomux::pktsrc::PktSrcHandle;
use iomux::plugin::PluginRegistry;
use iomux::source::SourceHandle;

static WAKER: OnceLock<Waker> = OnceLock::new();

extern "C" fn handle_shutdown(_signo: libc::c_int) {
    conf::set_terminating();
    if let Some(waker) = WAKER.get() {
        waker.wakeup_from_signal();
    }
}

fn install_signal_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = signal::sigaction(Signal::SIGINT, &action);
        let _ = signal::sigaction(Signal::SIGTERM, &action);
    }
}

fn load_config(cli: &Cli) -> Config {
    match fs::read_to_string(&cli.config) {
        Ok(raw) => toml::from_str(&raw).unwrap_or_else(|e| {
            eprintln!("failed to parse {}: {e}", cli.config.display());
            process::exit(1);
        }),
        Err(_) => Config::default(),
    }
}

fn write_summary(config: &Config, sources: &[(PktSrcHandle, SourceHandle)]) {
    let Some(path) = &config.summary_log else {
        return;
    };

    let formatter = JsonFormatter::new(TimeFormat::Iso8601);
    let mut out = String::new();
    for (src, _) in sources {
        let src = src.borrow();
        let stats = src.stats();
        let last_ts = if stats.received > 0 {
            Some(LogValue::Time(src.current_time()))
        } else {
            None
        };
        out.push_str(&formatter.describe(&[
            ("path", Some(LogValue::Str(src.path().to_string()))),
            ("packets", Some(LogValue::Count(stats.received))),
            ("dropped", Some(LogValue::Count(stats.dropped))),
            ("last_packet", last_ts),
        ]));
        out.push('\n');
    }

    if let Err(e) = fs::File::create(path).and_then(|mut f| f.write_all(out.as_bytes())) {
        warn!(path = %path.display(), error = %e, "failed to write run summary");
    }
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(&cli);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut registry = PluginRegistry::new();
    pcap::register_components(&mut registry);

    let mut mux = Mux::new(&config, registry);
    WAKER.set(mux.waker()).ok();
    install_signal_handlers();

    let dumper = cli.write.as_deref().map(|path| mux.open_pkt_dumper(path, false));
    if let Some(pd) = &dumper {
        if let Some(msg) = pd.borrow().error_msg() {
            eprintln!("packet dumper '{}': {msg}", pd.borrow().path());
            process::exit(1);
        }
    }

    let mut pkt_srcs: Vec<(PktSrcHandle, SourceHandle)> = Vec::new();
    for path in &cli.traces {
        let src = mux.open_pkt_src(path, false);
        if let Some(msg) = src.borrow().error_msg() {
            eprintln!("packet source '{}': {msg}", src.borrow().path());
        }
        let handle: SourceHandle = src.clone();
        pkt_srcs.push((src, handle));
    }

    info!(sources = pkt_srcs.len(), "entering main loop");

    // === Event loop ===
    let mut ready: Vec<SourceHandle> = Vec::new();
    loop {
        mux.find_ready_sources(&mut ready);

        for src in &ready {
            // Packet sources feed the dumper; everything else just runs.
            if let Some((ps, _)) = pkt_srcs.iter().find(|(_, h)| Rc::ptr_eq(h, src)) {
                if let Some(pkt) = ps.borrow_mut().next_packet() {
                    if let Some(pd) = &dumper {
                        if let Err(e) = pd.borrow_mut().dump(&pkt) {
                            warn!(error = %e, "failed to dump packet");
                        }
                    }
                }
            } else {
                src.borrow_mut().process();
            }
        }

        if conf::terminating() {
            mux.remove_all();
        }

        if mux.should_exit() {
            break;
        }
    }

    write_summary(&config, &pkt_srcs);
    info!("all sources dry, shutting down cleanly");
}
