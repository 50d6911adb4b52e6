use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::time::Instant;

use sitesync_core::config::load_at;
use sitesync_core::file_store::{content_key_for_path, sites_root_at};
use sitesync_publish::Engine;

use crate::error::{io_err, DaemonError};
use crate::paths::{run_dir, socket_path, DEBOUNCE_WINDOW, QUEUE_DEPTH, WORKER_COUNT};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::task::Task;

type JobResult = Result<Value, String>;

struct Job {
    task: Task,
    source: &'static str,
    /// `None` for fire-and-forget jobs (watcher, timer).
    respond_to: Option<oneshot::Sender<JobResult>>,
}

/// Counters shown by `status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub completed: u64,
    pub failed: u64,
    pub last_task: Option<String>,
    pub last_source: Option<String>,
    pub last_finished_at_unix: u64,
}

impl JobStats {
    fn record(&mut self, label: String, source: &str, ok: bool) {
        if ok {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.last_task = Some(label);
        self.last_source = Some(source.to_string());
        self.last_finished_at_unix = unix_seconds_now();
    }
}

type SharedStats = Arc<RwLock<JobStats>>;

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Load configuration under `home`, wire the engine, and serve.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let config = load_at(&home)?;
    let engine = Engine::from_config(&home, config)?;
    serve(home, engine).await
}

/// Run workers, watcher, reconcile timer and socket server until `stop`
/// or ctrl-c.
pub async fn serve(home: PathBuf, engine: Engine) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let stats: SharedStats = Arc::new(RwLock::new(JobStats::default()));
    let started_at_unix = unix_seconds_now();
    let reconcile_every = engine.config().publish.reconcile_interval();

    let (job_tx, job_rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let workers: Vec<_> = (0..WORKER_COUNT)
        .map(|index| {
            let shutdown = shutdown_tx.clone();
            let engine = engine.clone();
            let jobs = job_rx.clone();
            let stats = stats.clone();
            tokio::spawn(async move {
                let result = worker_task(index, engine, jobs, stats, shutdown.subscribe()).await;
                let _ = shutdown.send(());
                result
            })
        })
        .collect();

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result = watcher_task(home, job_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let reconcile_handle = {
        let shutdown = shutdown_tx.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result = reconcile_timer_task(reconcile_every, job_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let engine = engine.clone();
        let stats = stats.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                engine,
                stats,
                job_tx,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at_unix,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };
    drop(job_tx);

    let (watcher_result, reconcile_result, socket_result, signal_result) =
        tokio::join!(watcher_handle, reconcile_handle, socket_handle, signal_handle);

    handle_join("watcher", watcher_result)?;
    handle_join("reconcile_timer", reconcile_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    for worker in workers {
        handle_join("worker", worker.await)?;
    }
    Ok(())
}

async fn worker_task(
    index: usize,
    engine: Engine,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    stats: SharedStats,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        let job = tokio::select! {
            _ = shutdown_rx.recv() => break,
            job = async { jobs.lock().await.recv().await } => job,
        };
        let Some(job) = job else { break };

        let label = job.task.label();
        let started = Instant::now();
        let result = job.task.run(engine.clone()).await.map_err(|e| e.to_string());
        match &result {
            Ok(_) => tracing::info!(
                worker = index,
                task = %label,
                source = job.source,
                duration_ms = started.elapsed().as_millis() as u64,
                "task completed",
            ),
            Err(err) => tracing::error!(
                worker = index,
                task = %label,
                source = job.source,
                error = %err,
                "task failed",
            ),
        }
        stats.write().await.record(label, job.source, result.is_ok());

        if let Some(respond_to) = job.respond_to {
            let _ = respond_to.send(result);
        }
    }
    Ok(())
}

async fn watcher_task(
    home: PathBuf,
    job_tx: mpsc::Sender<Job>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    // Events arrive with real paths (e.g. /private/var/... on macOS).
    let home = fs::canonicalize(&home).unwrap_or(home);
    let sites = sites_root_at(&home);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut _watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;

    let mut watched_dirs = HashSet::new();
    register_tree(&mut _watcher, &mut watched_dirs, &sites)?;

    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                for path in event.paths {
                    // New site and content directories need their own watch.
                    if let Some(watch_dir) = directory_to_watch(&path) {
                        if watch_dir.starts_with(&sites) && watch_dir.exists() {
                            register_tree(&mut _watcher, &mut watched_dirs, &watch_dir)?;
                        }
                    }

                    let Some(task) = task_for_path(&home, &path) else {
                        continue;
                    };
                    if !should_process_event(&mut debounce, &path, Instant::now()) {
                        continue;
                    }

                    tracing::debug!(path = %path.display(), task = %task.label(), "content file changed");
                    let job = Job { task, source: "watcher", respond_to: None };
                    if job_tx.send(job).await.is_err() {
                        return Err(DaemonError::ChannelClosed("job queue"));
                    }
                }
            }
        }
    }

    Ok(())
}

async fn reconcile_timer_task(
    every: Duration,
    job_tx: mpsc::Sender<Job>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let job = Job { task: Task::Reconcile, source: "timer", respond_to: None };
                if job_tx.send(job).await.is_err() {
                    return Err(DaemonError::ChannelClosed("job queue"));
                }
            }
        }
    }
    Ok(())
}

async fn socket_server_task(
    home: PathBuf,
    engine: Engine,
    stats: SharedStats,
    job_tx: mpsc::Sender<Job>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), workers = WORKER_COUNT, "daemon listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let engine = engine.clone();
                let stats = stats.clone();
                let job_tx = job_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(
                        stream,
                        home,
                        engine,
                        stats,
                        job_tx,
                        shutdown_tx,
                        started_at_unix,
                    ).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    engine: Engine,
    stats: SharedStats,
    job_tx: mpsc::Sender<Job>,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: Result<DaemonRequest, _> = serde_json::from_str(&line);
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let cmd = request.cmd.clone();
        let response = match (cmd.as_str(), request.task) {
            ("status", _) => {
                let payload = build_status_payload(&home, &engine, stats.clone(), started_at_unix).await;
                DaemonResponse::ok(payload)
            }
            ("run", Some(task)) => match enqueue(&job_tx, task, "socket").await {
                Ok(data) => DaemonResponse::ok(data),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            ("run", None) => DaemonResponse::error("'run' requires a task"),
            ("stop", _) => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            (other, _) => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(
    home: &Path,
    engine: &Engine,
    stats: SharedStats,
    started_at_unix: u64,
) -> Value {
    let jobs = stats.read().await.clone();

    let names = {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.site_names()).await
    };
    let sites = match names {
        Ok(Ok(names)) => names,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "listing sites for status failed");
            Vec::new()
        }
        Err(err) => {
            tracing::warn!(error = %err, "status join error");
            Vec::new()
        }
    };

    json!({
        "running": true,
        "label": crate::paths::DAEMON_LABEL,
        "started_at_unix": started_at_unix,
        "workers": WORKER_COUNT,
        "jobs": jobs,
        "sites": sites,
        "socket": socket_path(home).display().to_string(),
        "sites_root": sites_root_at(home).display().to_string(),
    })
}

async fn enqueue(
    job_tx: &mpsc::Sender<Job>,
    task: Task,
    source: &'static str,
) -> Result<Value, DaemonError> {
    let (tx, rx) = oneshot::channel();
    job_tx
        .send(Job {
            task,
            source,
            respond_to: Some(tx),
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("job queue"))?;

    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("job response"))?;
    outcome.map_err(DaemonError::Protocol)
}

/// A content file of the file store maps to a single-item sync.
fn task_for_path(home: &Path, path: &Path) -> Option<Task> {
    let (site, id) = content_key_for_path(home, path)?;
    Some(Task::SyncContentItem {
        site: site.0,
        content_id: id.0,
    })
}

fn register_tree(
    watcher: &mut RecommendedWatcher,
    watched_dirs: &mut HashSet<PathBuf>,
    root: &Path,
) -> Result<(), DaemonError> {
    if !root.exists() {
        fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
    }
    for dir in collect_dirs(root)? {
        let canonical = match fs::canonicalize(&dir) {
            Ok(path) => path,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&dir, err)),
        };
        if watched_dirs.insert(canonical.clone()) {
            watcher.watch(&canonical, RecursiveMode::NonRecursive)?;
            tracing::debug!(path = %canonical.display(), "watching directory");
        }
    }
    Ok(())
}

fn collect_dirs(root: &Path) -> Result<Vec<PathBuf>, DaemonError> {
    let mut dirs = vec![root.to_path_buf()];
    let mut cursor = 0;
    while cursor < dirs.len() {
        let current = dirs[cursor].clone();
        cursor += 1;
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&current, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
            if ty.is_dir() {
                dirs.push(entry.path());
            }
        }
    }
    dirs.sort();
    dirs.dedup();
    Ok(dirs)
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn directory_to_watch(path: &Path) -> Option<PathBuf> {
    if path.is_dir() {
        Some(path.to_path_buf())
    } else {
        path.parent().map(Path::to_path_buf)
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [sites_root_at(home), run_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `RUST_LOG` filters (default `info`); `SITESYNC_LOG_FORMAT=json` switches
/// to JSON lines.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SITESYNC_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        let _ = fmt().json().with_env_filter(filter).try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
