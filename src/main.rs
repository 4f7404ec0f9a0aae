// main.rs
//
// CLI entry point (§6): parses flags, loads and validates a config, and
// either prints its expanded canonical form (`-e`) or wires up the
// listener/arbiter/worker threads and runs the gateway until a fatal
// error or a `/_reload` exits the process (an external supervisor is
// expected to restart it, making reload equivalent to shutdown+rebuild).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;

use clap::Parser;

use modbus_fims_gateway::arbiter::Arbiter;
use modbus_fims_gateway::bus::{Message, MessageBus, UnixSocketBus};
use modbus_fims_gateway::cache::DecodedCache;
use modbus_fims_gateway::clock::SystemClock;
use modbus_fims_gateway::config::{expand, loader};
use modbus_fims_gateway::error::fatal;
use modbus_fims_gateway::events::Event;
use modbus_fims_gateway::listener::Listener;
use modbus_fims_gateway::logging::glog;
use modbus_fims_gateway::modbus_io::{ModbusIo, ModbusTransport};
use modbus_fims_gateway::queue::{MainQueues, WorkerQueues};
use modbus_fims_gateway::router::Router;
use modbus_fims_gateway::worker::Worker;
use modbus_fims_gateway::workspace::Workspace;

/// Default message-bus socket; override with the `FIMS_SOCKET` env var.
/// The bus wire protocol is an external system this gateway dials into,
/// not something this crate ships, so there is no config key for it.
const DEFAULT_BUS_SOCKET: &str = "/run/fims.sock";

#[derive(Parser)]
#[command(
    name = "modbus-fims-gateway",
    about = "Modbus TCP/RTU gateway daemon bridging a FIMS-style message bus to polled register maps."
)]
struct Cli {
    /// Fetch config via a message-bus `get` on <uri> with a 5s timeout.
    #[arg(short = 'u', long = "uri", value_name = "URI")]
    uri: Option<String>,

    /// Parse the config at <path>, print its expanded canonical form to
    /// stdout, and exit.
    #[arg(short = 'e', long = "expand", value_name = "PATH")]
    expand: Option<PathBuf>,

    /// Load config from <path> (extension normalized to .json).
    #[arg(short = 'f', long = "file", value_name = "PATH")]
    file: Option<PathBuf>,

    /// Bare config path, equivalent to `-f <path>`.
    #[arg(value_name = "PATH")]
    path: Option<PathBuf>,

    /// Mirror every log line into a timestamped file under this directory
    /// (plus a `gateway.log` symlink to the latest one).
    #[arg(long = "log-dir", value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

fn normalize_json_path(path: &Path) -> PathBuf {
    if path.extension().map(|ext| ext == "json").unwrap_or(false) {
        path.to_path_buf()
    } else {
        path.with_extension("json")
    }
}

fn main() {
    let cli = Cli::parse();

    if let Some(log_dir) = &cli.log_dir {
        if let Err(e) = modbus_fims_gateway::logging::init_file_logging(log_dir) {
            fatal(format!("failed to start file logging in {}: {}", log_dir.display(), e));
        }
    }

    if let Some(path) = &cli.expand {
        let path = normalize_json_path(path);
        let (cfg, _warnings) = loader::load_file(&path)
            .unwrap_or_else(|e| fatal(format!("failed to load config {}: {}", path.display(), e)));
        let expanded = expand::expand(&cfg);
        println!("{}", serde_json::to_string_pretty(&expanded).expect("config json always serializes"));
        return;
    }

    let (cfg, warnings) = if let Some(uri) = &cli.uri {
        loader::load_uri(uri).unwrap_or_else(|e| fatal(format!("failed to load config from {}: {}", uri, e)))
    } else {
        let path = cli
            .file
            .as_deref()
            .or(cli.path.as_deref())
            .unwrap_or_else(|| fatal("no config source given: pass a path, -f <path>, or -u <uri>"));
        let path = normalize_json_path(path);
        loader::load_file(&path).unwrap_or_else(|e| fatal(format!("failed to load config {}: {}", path.display(), e)))
    };
    for warning in &warnings {
        glog!("[config] {}", warning);
    }

    let workspace = Arc::new(Workspace::build(cfg));
    let router = Arc::new(Router::build(&workspace));
    let cache = Arc::new(Mutex::new(DecodedCache::new_for(&workspace)));
    let stats = Arc::new(Mutex::new(HashMap::new()));
    let clock: Arc<dyn modbus_fims_gateway::clock::MonotonicClock> = Arc::new(SystemClock::new());
    let reload_requested = Arc::new(AtomicBool::new(false));

    let bus_socket = std::env::var("FIMS_SOCKET").unwrap_or_else(|_| DEFAULT_BUS_SOCKET.to_string());
    let bus: Arc<dyn MessageBus> = Arc::new(
        UnixSocketBus::connect(Path::new(&bus_socket))
            .unwrap_or_else(|e| fatal(format!("failed to connect to message bus at {}: {}", bus_socket, e))),
    );
    for comp in &workspace.components {
        if let Err(e) = bus.subscribe(&format!("/components/{}", comp.id)) {
            fatal(format!("failed to subscribe to component \"{}\": {}", comp.id, e));
        }
    }

    let worker_count = workspace.effective_worker_count();
    glog!(
        "starting {} component(s) across {} register map(s) on {} worker thread(s)",
        workspace.components.len(),
        workspace.total_register_maps(),
        worker_count
    );

    let main_queues = Arc::new(MainQueues::default());
    let worker_queues: Vec<Arc<WorkerQueues>> =
        (0..worker_count).map(|_| Arc::new(WorkerQueues::default())).collect();

    for (worker_id, queues) in worker_queues.iter().cloned().enumerate() {
        let connection = workspace.connection.clone();
        let connector = Box::new(move || {
            ModbusIo::connect(&connection).map(|io| Box::new(io) as Box<dyn ModbusTransport>)
        });
        let workspace = workspace.clone();
        let cache = cache.clone();
        let pub_q = main_queues.pub_q.clone();
        let clock = clock.clone();
        let stats = stats.clone();
        let connection_cfg = workspace.connection.clone();
        thread::Builder::new()
            .name(format!("modbus-worker-{}", worker_id))
            .spawn(move || {
                Worker::new(worker_id, &connection_cfg, connector, workspace, cache, queues, pub_q, clock, stats).run()
            })
            .expect("failed to spawn worker thread");
    }

    {
        let bus = bus.clone();
        let router = router.clone();
        let workspace = workspace.clone();
        let main_queues = main_queues.clone();
        let reload_requested = reload_requested.clone();
        thread::Builder::new()
            .name("modbus-listener".to_string())
            .spawn(move || Listener::new(bus, router, workspace, main_queues, reload_requested).run())
            .expect("failed to spawn listener thread");
    }

    let _ = bus.send(&Message::post(
        modbus_fims_gateway::events::EVENTS_URI,
        Event::info("Modbus gateway started.").to_body(),
    ));

    let mut arbiter = Arbiter::new(workspace, cache, bus, main_queues, worker_queues, stats, clock, reload_requested);
    arbiter.run();
}
