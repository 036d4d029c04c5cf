use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::signal::{SigSet, Signal};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};

use enrolld_core::{Config, EnrollmentValidator, Keystore};

use crate::cluster::{ClusterClient, NoopClusterClient};
use crate::db::{DbClient, InMemoryDbClient};
use crate::dispatcher::{build_tls_config, Dispatcher};
use crate::error::ServerError;
use crate::key_request::{KeyRequestSource, KeyRequestWorker, NoopKeyRequestSource};
use crate::local_control::LocalControlListener;
use crate::pidfile::PidFile;
use crate::queue::ClientQueue;
use crate::state::SharedState;
use crate::writer::Writer;
use enrolld_transport::Acceptor;

/// The service's lifecycle state machine (spec.md §4.7):
/// `INIT -> CONFIGURED -> LISTENING -> DRAINING -> STOPPED`, with a
/// `TERMINATED` branch for fatal startup/runtime errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Init,
    Configured,
    Listening,
    Draining,
    Stopped,
    Terminated(String),
}

/// Global, once-constructed context shared by every worker thread
/// (DESIGN.md "Global context... becomes a single `Service` value
/// constructed once in the supervisor and passed to workers by
/// reference; no process-wide mutable singletons").
pub struct Service {
    pub config: Config,
    pub state: Arc<SharedState>,
    pub queue: Arc<ClientQueue>,
    pub validator: Arc<EnrollmentValidator>,
    pub tls_config: Arc<rustls::ServerConfig>,
    pub cluster: Arc<dyn ClusterClient>,
    pub db: Arc<dyn DbClient>,
    pub key_request_source: Arc<dyn KeyRequestSource>,
    pub running: Arc<AtomicBool>,
}

impl Service {
    pub fn build(config: Config, password: Option<String>) -> Result<Self, ServerError> {
        let keys_file = config.keys_file.clone();
        let keystore = if keys_file.exists() {
            let file = std::fs::File::open(&keys_file)?;
            Keystore::load(std::io::BufReader::new(file), config.clear_removed)
                .map_err(|e| ServerError::Other(e.to_string()))?
        } else {
            Keystore::new()
        };

        let tls_config = build_tls_config(&config)?;
        let validator = Arc::new(EnrollmentValidator::new(&config, password));
        let queue = Arc::new(ClientQueue::new(config.queue_capacity));
        let state = Arc::new(SharedState::new(keystore));

        Ok(Self {
            config,
            state,
            queue,
            validator,
            tls_config,
            cluster: Arc::new(NoopClusterClient),
            db: Arc::new(InMemoryDbClient::new()),
            key_request_source: Arc::new(NoopKeyRequestSource),
            running: Arc::new(AtomicBool::new(true)),
        })
    }
}

/// Owns lifecycle: startup, signal handling, graceful drain, worker join
/// (spec.md C7). Construction never spawns anything; [`Supervisor::run`]
/// does, and blocks until the service reaches `STOPPED` or `TERMINATED`.
pub struct Supervisor {
    service: Arc<Service>,
    state: ServiceState,
}

impl Supervisor {
    pub fn new(service: Service) -> Self {
        Self {
            service: Arc::new(service),
            state: ServiceState::Init,
        }
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    /// Runs until a shutdown signal (or the local control socket) clears
    /// `running`, then drains and returns. Blocks worker threads from
    /// handling TERM/INT/HUP directly (spec.md §4.7 "block these signals
    /// in all worker threads so only the supervisor delivers them") by
    /// setting the process signal mask before spawning them; the signal
    /// thread then unblocks the same three signals on itself so
    /// `signal_hook`'s handler has somewhere it can actually fire.
    pub fn run(&mut self) -> Result<(), ServerError> {
        self.state = ServiceState::Configured;

        let bind_addr: SocketAddr = self
            .service
            .config
            .bind_addr
            .parse()
            .map_err(|_| ServerError::Other(format!("invalid bind_addr {}", self.service.config.bind_addr)))?;
        let acceptor = Acceptor::bind(bind_addr)?;
        self.state = ServiceState::Listening;
        info!(addr = %bind_addr, "listening for agent enrollment");

        block_shutdown_signals();

        let pid_file = PidFile::create(&self.service.config.run_dir)?;
        let _pid_file = pid_file;

        let signal_running = self.service.running.clone();
        let signal_thread = spawn_signal_thread(signal_running);

        let mut local_control = None;
        let control_path = self.service.config.run_dir.join("enrolld.sock");
        match LocalControlListener::bind(&control_path) {
            Ok(listener) => {
                let running = self.service.running.clone();
                local_control = Some(thread::spawn(move || listener.run(running)));
            }
            Err(err) => warn!(%err, "failed to bind local control socket, continuing without it"),
        }

        let is_worker = self.service.config.cluster.role == enrolld_core::config::ClusterRole::Worker;
        let is_master_or_standalone = !is_worker;

        let mut dispatchers = Vec::new();
        for worker_id in 0..self.service.config.pool_size {
            dispatchers.push(spawn_dispatcher(self.service.clone(), is_worker, worker_id));
        }

        let acceptor_handle = spawn_acceptor(self.service.clone(), acceptor);

        let writer_handle = if is_master_or_standalone {
            Some(spawn_writer(self.service.clone()))
        } else {
            None
        };

        let key_request_handle = if self.service.config.key_request.enabled {
            Some(spawn_key_request(self.service.clone()))
        } else {
            None
        };

        // Block this thread (the supervisor) until shutdown is requested,
        // either by a signal or the local control socket.
        while self.service.running.load(Ordering::Acquire) {
            std::thread::sleep(std::time::Duration::from_millis(200));
        }
        self.state = ServiceState::Draining;
        info!("shutdown requested, draining workers");

        if let Err(err) = acceptor_handle.join() {
            error!(?err, "acceptor thread panicked");
        }
        for handle in dispatchers {
            if let Err(err) = handle.join() {
                error!(?err, "dispatcher thread panicked");
            }
        }
        if let Some(writer_handle) = writer_handle {
            // Wake the writer unconditionally so it observes `running ==
            // 0` even if no change is pending (spec.md §4.7 "Before
            // joining the writer, acquire the lock and signal the
            // condition unconditionally").
            {
                let _guard = self.service.state.guarded.lock().unwrap_or_else(|e| e.into_inner());
                self.service.state.changed.notify_all();
            }
            if let Err(err) = writer_handle.join() {
                error!(?err, "writer thread panicked");
            }
        }
        if let Some(key_request_handle) = key_request_handle {
            if let Err(err) = key_request_handle.join() {
                error!(?err, "key-request worker thread panicked");
            }
        }
        if let Some(local_control) = local_control {
            let _ = local_control.join();
        }
        let _ = signal_thread.join();

        self.state = ServiceState::Stopped;
        info!("stopped");
        Ok(())
    }
}

fn spawn_dispatcher(service: Arc<Service>, is_worker: bool, worker_id: usize) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("dispatcher-{worker_id}"))
        .spawn(move || {
            block_shutdown_signals();
            let dispatcher = Dispatcher {
                validator: service.validator.clone(),
                tls_config: service.tls_config.clone(),
                state: service.state.clone(),
                queue: service.queue.clone(),
                cluster: service.cluster.clone(),
                verify_host: service.config.verify_host,
                is_worker,
            };
            dispatcher.run(&service.running);
        })
        .expect("failed to spawn dispatcher thread")
}

fn spawn_acceptor(service: Arc<Service>, acceptor: Acceptor) -> JoinHandle<()> {
    thread::Builder::new()
        .name("acceptor".to_string())
        .spawn(move || {
            block_shutdown_signals();
            let socket_timeout = Some(std::time::Duration::from_secs(60));
            while service.running.load(Ordering::Acquire) {
                let Some(handoff) = acceptor.accept_with_shutdown(&service.running, socket_timeout) else {
                    break;
                };
                if let Err(rejected) = service.queue.try_push(handoff) {
                    warn!(peer = %rejected.peer_addr, "client queue full, dropping connection");
                }
            }
        })
        .expect("failed to spawn acceptor thread")
}

fn spawn_writer(service: Arc<Service>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("writer".to_string())
        .spawn(move || {
            block_shutdown_signals();
            let writer = Writer {
                state: service.state.clone(),
                keys_file: service.config.keys_file.clone(),
                db: service.db.clone(),
                is_clustered: service.config.cluster.role == enrolld_core::config::ClusterRole::Master,
            };
            writer.run(&service.running);
        })
        .expect("failed to spawn writer thread")
}

/// Spawned only when `config.key_request.enabled` (spec.md §4.7 "key-
/// request worker (if enabled)"). The fourth cooperating worker spec.md
/// §2 names; its transport is an external collaborator not designed
/// here (see `key_request::KeyRequestSource`).
fn spawn_key_request(service: Arc<Service>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("key-request".to_string())
        .spawn(move || {
            block_shutdown_signals();
            let worker = KeyRequestWorker {
                state: service.state.clone(),
                source: service.key_request_source.clone(),
            };
            worker.run(&service.running);
        })
        .expect("failed to spawn key-request thread")
}

/// Blocks `SIGTERM`/`SIGINT`/`SIGHUP` on the calling thread so only the
/// dedicated signal-handling thread ever observes them (spec.md §4.7).
fn block_shutdown_signals() {
    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGINT);
    set.add(Signal::SIGHUP);
    if let Err(err) = set.thread_block() {
        warn!(%err, "failed to block shutdown signals on worker thread");
    }
}

/// Unblocks `SIGTERM`/`SIGINT`/`SIGHUP` on the calling thread. A signal
/// masked out on every thread in the process is never delivered to any
/// `sigaction` handler, so the one thread that is supposed to observe
/// these through `signal_hook` must carry an unblocked mask — otherwise
/// `run`'s call to `block_shutdown_signals` before the signal thread is
/// spawned leaves them blocked everywhere and the handler never fires.
fn unblock_shutdown_signals() {
    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGINT);
    set.add(Signal::SIGHUP);
    if let Err(err) = set.thread_unblock() {
        warn!(%err, "failed to unblock shutdown signals on signal thread");
    }
}

/// How often the signal thread polls for a pending signal and re-checks
/// `running`. `Signals::forever()` would block until a signal actually
/// arrives, which would leave this thread stuck forever when shutdown is
/// instead triggered by the local control socket (or, as here, a test) —
/// the same bounded-poll idiom the acceptor and dispatchers use so every
/// wait stays under spec.md §5's 1-second ceiling.
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Dedicated signal-handling thread (DESIGN notes: "Signal handling
/// belongs on a dedicated supervisor thread that reads from a signal
/// source"). `SIGPIPE` is ignored process-wide by `signal_hook`'s default
/// disposition being left alone on platforms where writes to a closed
/// socket already return `EPIPE` instead of raising it; TLS writes here
/// go through `rustls`/`std::net`, which surface that as an `io::Error`.
fn spawn_signal_thread(running: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            unblock_shutdown_signals();
            match Signals::new([SIGTERM, SIGINT, SIGHUP]) {
                Ok(mut signals) => {
                    while running.load(Ordering::Acquire) {
                        if let Some(signal) = signals.pending().next() {
                            info!(signal, "received shutdown signal");
                            running.store(false, Ordering::Release);
                            break;
                        }
                        thread::sleep(SIGNAL_POLL_INTERVAL);
                    }
                }
                Err(err) => {
                    error!(%err, "failed to install signal handlers");
                }
            }
        })
        .expect("failed to spawn signal thread")
}
