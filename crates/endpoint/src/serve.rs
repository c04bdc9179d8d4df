//! Endpoint orchestrator
//!
//! Drives one endpoint over one duplex connection: performs the
//! initialization handshake, then serves control requests, outbound
//! rsync transfers, watch events, and staging state concurrently over
//! the multiplexed channels. The first serving task to fail wins; the
//! others are cancelled and the wrapped failure is returned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info};

use tandem_core::cache::{Cache, CacheError};
use tandem_core::delta::{compress_operations, Engine, Signature};
use tandem_core::digest::Algorithm;
use tandem_core::ignore::{IgnoreCache, IgnoreMatcher};
use tandem_core::model::Change;
use tandem_core::scan::{probe_executability_preservation, scan, SymlinkMode};
use tandem_core::stage::{Stager, StagingSlot};
use tandem_core::transition::transition;
use tandem_core::version::Version;

use crate::codec::MessageStream;
use crate::messages::{
    EndpointRequest, InitializeRequest, InitializeResponse, ScanResponse, StageResponse,
    TransitionResponse,
};
use crate::mux::multiplex;
use crate::transfer::{self, StagingClient};
use crate::{paths, watch};

/// Host-side knobs; everything else arrives in the initialization
/// request.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Override the state directory (defaults to `$TANDEM_STATE_DIR` or
    /// `~/.tandem`)
    pub state_dir: Option<PathBuf>,
    /// Liveness floor for the watch channel
    pub watch_poll_interval: Duration,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            state_dir: None,
            watch_poll_interval: Duration::from_secs(5),
        }
    }
}

/// Scan-related state shared between control dispatch and the background
/// cache persister. The mutex is held across persistence, which
/// serializes the next scan behind the previous scan's durability.
struct ScanState {
    cache: Cache,
    ignore_cache: IgnoreCache,
    cache_write_error: Option<CacheError>,
}

/// Serve one endpoint over a duplex connection with default options.
///
/// # Errors
/// Returns once any serving task fails, wrapping the failure with the
/// task's identity. Connection closure surfaces here as a task failure.
pub async fn serve<R, W>(reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    serve_with_options(reader, writer, EndpointOptions::default()).await
}

/// Serve one endpoint over a duplex connection.
///
/// # Errors
/// See [`serve`]. Initialization failures (empty session, unsupported
/// version, unresolvable root) are returned before any task is spawned.
pub async fn serve_with_options<R, W>(
    reader: R,
    writer: W,
    options: EndpointOptions,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let channels = multiplex(reader, writer);
    let mut control = MessageStream::new(channels.control);

    // Initialization handshake.
    let request: InitializeRequest = control
        .recv()
        .await
        .wrap_err("unable to receive initialization request")?;
    if request.session.is_empty() {
        return Err(eyre!("empty session identifier"));
    }
    let Some(version) = Version::from_wire(request.version) else {
        return Err(eyre!("unsupported session version {}", request.version));
    };
    if request.root.is_empty() {
        return Err(eyre!("empty root path"));
    }

    let root = paths::normalize_root(&request.root).wrap_err("unable to normalize root path")?;
    let state_dir = match options.state_dir {
        Some(dir) => dir,
        None => paths::default_state_dir()?,
    };
    let algorithm = version.algorithm();
    let cache_path = paths::cache_path(&state_dir, &request.session, request.alpha)
        .wrap_err("unable to compute cache path")?;
    let cache = Cache::load_or_empty(&cache_path, algorithm.digest_length());
    let matcher = Arc::new(
        IgnoreMatcher::new(&request.ignores).wrap_err("invalid ignore patterns")?,
    );
    let stager = Arc::new(
        Stager::new(
            paths::staging_root(&state_dir, &request.session, request.alpha),
            algorithm,
        )
        .wrap_err("unable to create staging coordinator")?,
    );

    control
        .send(&InitializeResponse {
            preserves_executability: probe_executability_preservation(&root),
        })
        .await
        .wrap_err("unable to send initialization response")?;

    info!(
        session = %request.session,
        root = %root.display(),
        alpha = request.alpha,
        "endpoint initialized"
    );

    let engine = Engine::new(algorithm);
    let (staging_client, staging_state) = StagingClient::new(
        MessageStream::new(channels.rsync_client),
        root.clone(),
        stager.clone(),
        engine.clone(),
    );

    let server = ControlServer {
        root: root.clone(),
        algorithm,
        symlink_mode: version.default_symlink_mode(),
        engine: engine.clone(),
        matcher,
        scan_state: Arc::new(Mutex::new(ScanState {
            cache,
            ignore_cache: IgnoreCache::new(),
            cache_write_error: None,
        })),
        cache_path,
        stager,
        staging_client,
    };

    // The watch task is the only one that blocks outside connection I/O,
    // so it gets an explicit cancellation signal; everything else is
    // unblocked by connection closure.
    let cancel = Arc::new(Notify::new());

    let (rsync_tx, mut rsync_rx) = mpsc::channel::<Result<()>>(1);
    let rsync_handle = tokio::spawn({
        let fut = transfer::serve_transmitter(
            MessageStream::new(channels.rsync_server),
            root.clone(),
            engine,
        );
        async move {
            let _ = rsync_tx.send(fut.await).await;
        }
    });

    let (watch_tx, mut watch_rx) = mpsc::channel::<Result<()>>(1);
    let watch_handle = tokio::spawn({
        let fut = watch::serve_watch(
            MessageStream::new(channels.watch_events),
            root,
            options.watch_poll_interval,
            cancel.clone(),
        );
        async move {
            let _ = watch_tx.send(fut.await).await;
        }
    });

    let (state_tx, mut state_rx) = mpsc::channel::<Result<()>>(1);
    let state_handle = tokio::spawn({
        let fut = transfer::transmit_staging_state(
            MessageStream::new(channels.rsync_state),
            staging_state,
        );
        async move {
            let _ = state_tx.send(fut.await).await;
        }
    });

    let (control_tx, mut control_rx) = mpsc::channel::<Result<()>>(1);
    let control_handle = tokio::spawn({
        let fut = serve_control(control, server);
        async move {
            let _ = control_tx.send(fut.await).await;
        }
    });

    let failure = tokio::select! {
        Some(result) = rsync_rx.recv() => task_failure("rsync server", result),
        Some(result) = watch_rx.recv() => task_failure("watch server", result),
        Some(result) = state_rx.recv() => task_failure("staging state transmission", result),
        Some(result) = control_rx.recv() => task_failure("control server", result),
    };

    cancel.notify_one();
    rsync_handle.abort();
    watch_handle.abort();
    state_handle.abort();
    control_handle.abort();

    Err(failure)
}

fn task_failure(task: &str, result: Result<()>) -> color_eyre::Report {
    match result {
        Ok(()) => eyre!("{task} terminated unexpectedly"),
        Err(e) => e.wrap_err(format!("{task} failure")),
    }
}

struct ControlServer {
    root: PathBuf,
    algorithm: Algorithm,
    symlink_mode: SymlinkMode,
    engine: Engine,
    matcher: Arc<IgnoreMatcher>,
    scan_state: Arc<Mutex<ScanState>>,
    cache_path: PathBuf,
    stager: Arc<Stager>,
    staging_client: StagingClient,
}

/// Serve control requests in FIFO order until the connection fails.
async fn serve_control(mut stream: MessageStream, mut server: ControlServer) -> Result<()> {
    loop {
        let request: EndpointRequest =
            stream.recv().await.wrap_err("unable to decode request")?;
        match request {
            EndpointRequest::Scan { base_signature } => {
                let response = server
                    .handle_scan(&base_signature)
                    .await
                    .wrap_err("unable to perform scan")?;
                stream
                    .send(&response)
                    .await
                    .wrap_err("unable to send scan response")?;
            }
            EndpointRequest::Stage { transitions } => {
                let response = server
                    .handle_stage(transitions)
                    .await
                    .wrap_err("unable to perform staging")?;
                stream
                    .send(&response)
                    .await
                    .wrap_err("unable to send stage response")?;
            }
            EndpointRequest::Transition { transitions } => {
                let response = server
                    .handle_transition(transitions)
                    .await
                    .wrap_err("unable to perform transition")?;
                stream
                    .send(&response)
                    .await
                    .wrap_err("unable to send transition response")?;
            }
        }
    }
}

impl ControlServer {
    /// Run a scan and reply with a delta of the snapshot encoding against
    /// the controller's base signature.
    ///
    /// The scan lock is acquired here and released by the background
    /// persistence task, so at most one scan is in flight and a scan
    /// response implies the previous cache write finished.
    async fn handle_scan(&mut self, base_signature: &Signature) -> Result<ScanResponse> {
        let mut guard = self.scan_state.clone().lock_owned().await;

        // A failed background cache write poisons all later scans until
        // restart.
        if let Some(e) = &guard.cache_write_error {
            return Err(eyre!("unable to save cache to disk: {e}"));
        }

        let root = self.root.clone();
        let algorithm = self.algorithm;
        let symlink_mode = self.symlink_mode;
        let matcher = self.matcher.clone();
        let previous_cache = guard.cache.clone();
        let previous_ignores = guard.ignore_cache.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            scan(
                &root,
                algorithm,
                &previous_cache,
                &matcher,
                &previous_ignores,
                symlink_mode,
            )
        })
        .await
        .wrap_err("scan task panicked")?;

        // Scan failures are presumed concurrent modification: suggest a
        // retry rather than failing the session.
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("scan failed transiently: {e}");
                return Ok(ScanResponse {
                    try_again: true,
                    snapshot_delta: Vec::new(),
                });
            }
        };

        guard.cache = outcome.cache;
        guard.ignore_cache = outcome.ignore_cache;

        let snapshot_bytes =
            serde_json::to_vec(&outcome.snapshot).wrap_err("unable to marshal snapshot")?;
        let ops = self.engine.deltify(&snapshot_bytes, base_signature);
        let snapshot_delta =
            compress_operations(&ops).wrap_err("unable to compress snapshot delta")?;

        // Persist in the background while still holding the scan lock:
        // the next scan proceeds only once this cache is durable.
        let cache_path = self.cache_path.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = guard.cache.save(&cache_path) {
                guard.cache_write_error = Some(e);
            }
        });

        Ok(ScanResponse {
            try_again: false,
            snapshot_delta,
        })
    }

    /// Derive the file slots a set of transitions needs, filter out
    /// already-staged content, and drive the rsync client to receive the
    /// remainder.
    async fn handle_stage(&mut self, transitions: Vec<Change>) -> Result<StageResponse> {
        let mut slots = Vec::new();
        for change in &transitions {
            if let Some(new) = &change.new {
                let mut files = Vec::new();
                new.collect_files(&change.path, &mut files);
                for (path, digest, _) in files {
                    slots.push(StagingSlot { path, digest });
                }
            }
        }

        // An interrupted staging run leaves content behind; only the
        // missing remainder is transferred.
        let missing = self.stager.missing(&slots);
        if missing.is_empty() {
            return Ok(StageResponse::default());
        }

        self.staging_client
            .stage(missing)
            .await
            .wrap_err("unable to stage files")?;
        Ok(StageResponse::default())
    }

    /// Apply transitions, reply with applied changes and problems, and
    /// wipe the stager unconditionally.
    async fn handle_transition(
        &mut self,
        transitions: Vec<Change>,
    ) -> Result<TransitionResponse> {
        let guard = self.scan_state.clone().lock_owned().await;
        let root = self.root.clone();
        let algorithm = self.algorithm;
        let stager = self.stager.clone();

        let (changes, problems) = tokio::task::spawn_blocking(move || {
            let result = transition(&root, &transitions, &guard.cache, algorithm, &stager);
            drop(guard);
            result
        })
        .await
        .wrap_err("transition task panicked")?;

        // Wipe failures are swallowed: the response must carry the
        // changes and problems regardless, and the next scan surfaces
        // any residue.
        let _ = self.stager.wipe();

        Ok(TransitionResponse { changes, problems })
    }
}
