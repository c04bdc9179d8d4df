//! Full-session tests: a controller driving one endpoint over an
//! in-process duplex connection.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;

use tandem_core::delta::{decompress_operations, Engine, Operation, Signature};
use tandem_core::digest::Algorithm;
use tandem_core::model::{Change, Entry};
use tandem_endpoint::messages::{
    EndpointRequest, InitializeRequest, InitializeResponse, ScanResponse, StageResponse,
    StagingStatus, TransferFrame, TransferRequest, TransitionResponse, WatchEvent,
};
use tandem_endpoint::mux::multiplex;
use tandem_endpoint::{serve_with_options, EndpointOptions, MessageStream};

const SESSION: &str = "test-session";

struct Controller {
    control: MessageStream,
    rsync_client_peer: Option<MessageStream>,
    watch_events: MessageStream,
    rsync_state: MessageStream,
    serve: JoinHandle<color_eyre::Result<()>>,
    engine: Engine,
}

async fn start(root: &Path, state_dir: &Path, ignores: Vec<String>) -> Controller {
    let (near, far) = tokio::io::duplex(1 << 20);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, far_write) = tokio::io::split(far);

    let serve = tokio::spawn(serve_with_options(
        far_read,
        far_write,
        EndpointOptions {
            state_dir: Some(state_dir.to_path_buf()),
            watch_poll_interval: Duration::from_millis(50),
        },
    ));

    let channels = multiplex(near_read, near_write);
    let mut control = MessageStream::new(channels.control);

    control
        .send(&InitializeRequest {
            session: SESSION.to_owned(),
            version: 1,
            root: root.to_str().unwrap().to_owned(),
            ignores,
            alpha: true,
        })
        .await
        .unwrap();
    let response: InitializeResponse = control.recv().await.unwrap();
    #[cfg(unix)]
    assert!(response.preserves_executability);
    #[cfg(not(unix))]
    let _ = response;

    Controller {
        control,
        rsync_client_peer: Some(MessageStream::new(channels.rsync_client)),
        watch_events: MessageStream::new(channels.watch_events),
        rsync_state: MessageStream::new(channels.rsync_state),
        serve,
        engine: Engine::new(Algorithm::Sha1),
    }
}

impl Controller {
    async fn scan(&mut self) -> ScanResponse {
        self.control
            .send(&EndpointRequest::Scan {
                base_signature: Signature::default(),
            })
            .await
            .unwrap();
        self.control.recv().await.unwrap()
    }

    async fn scan_snapshot(&mut self) -> Entry {
        let response = self.scan().await;
        assert!(!response.try_again, "scan asked for a retry");
        let ops = decompress_operations(&response.snapshot_delta).unwrap();
        let snapshot_bytes = self.engine.patch(&[], &ops).unwrap();
        serde_json::from_slice(&snapshot_bytes).unwrap()
    }

    /// Answer the endpoint's next transfer requests with literal content.
    /// Must be spawned before the Stage request is sent.
    fn respond_transfers(
        &mut self,
        contents: Vec<Vec<u8>>,
    ) -> JoinHandle<MessageStream> {
        let mut peer = self.rsync_client_peer.take().unwrap();
        tokio::spawn(async move {
            for content in contents {
                let _request: TransferRequest = peer.recv().await.unwrap();
                peer.send(&TransferFrame::Op(Operation::Data {
                    data: Bytes::from(content),
                }))
                .await
                .unwrap();
                peer.send(&TransferFrame::End { error: None }).await.unwrap();
            }
            peer
        })
    }

    async fn stage(&mut self, transitions: Vec<Change>) -> StageResponse {
        self.control
            .send(&EndpointRequest::Stage { transitions })
            .await
            .unwrap();
        self.control.recv().await.unwrap()
    }

    async fn transition(&mut self, transitions: Vec<Change>) -> TransitionResponse {
        self.control
            .send(&EndpointRequest::Transition { transitions })
            .await
            .unwrap();
        self.control.recv().await.unwrap()
    }
}

fn file_entry(content: &[u8], executable: bool) -> Entry {
    Entry::File {
        digest: Algorithm::Sha1.digest(content),
        executable,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

fn fixture() -> (tempfile::TempDir, PathBuf, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    fs::create_dir(&root).unwrap();
    let state = dir.path().join("state");
    (dir, root, state)
}

#[tokio::test]
async fn empty_tree_scan() {
    let (_dir, root, state) = fixture();
    let mut controller = start(&root, &state, Vec::new()).await;

    let snapshot = controller.scan_snapshot().await;
    assert_eq!(snapshot, Entry::empty_directory());

    // The cache is persisted in the background after the response.
    let cache_path = state.join("caches").join(format!("{SESSION}-alpha"));
    wait_for("cache persistence", || cache_path.exists()).await;
}

#[tokio::test]
async fn single_file_scan_reconstructs_from_empty_base() {
    let (_dir, root, state) = fixture();
    fs::write(root.join("hello.txt"), b"hi\n").unwrap();
    let mut controller = start(&root, &state, Vec::new()).await;

    let snapshot = controller.scan_snapshot().await;
    let Entry::Directory { children } = &snapshot else {
        panic!("snapshot is not a directory");
    };
    let Entry::File { digest, executable } = &children["hello.txt"] else {
        panic!("hello.txt is not a file");
    };
    assert_eq!(digest.to_hex(), "55ca6286e3e4f4fba5d0448333fa99fc5a404a73");
    assert!(!executable);
}

#[tokio::test]
async fn ignores_from_initialization_are_honored() {
    let (_dir, root, state) = fixture();
    fs::write(root.join("keep.txt"), b"keep").unwrap();
    fs::write(root.join("drop.log"), b"drop").unwrap();
    let mut controller = start(&root, &state, vec!["*.log".to_owned()]).await;

    let snapshot = controller.scan_snapshot().await;
    let Entry::Directory { children } = &snapshot else {
        panic!("snapshot is not a directory");
    };
    assert!(children.contains_key("keep.txt"));
    assert!(!children.contains_key("drop.log"));
}

#[tokio::test]
async fn stage_then_transition_creates_the_file() {
    let (_dir, root, state) = fixture();
    let mut controller = start(&root, &state, Vec::new()).await;

    let content = b"staged and applied".to_vec();
    let changes = vec![
        Change {
            path: "a".to_owned(),
            old: None,
            new: Some(Entry::empty_directory()),
        },
        Change {
            path: "a/b.txt".to_owned(),
            old: None,
            new: Some(file_entry(&content, false)),
        },
    ];

    let responder = controller.respond_transfers(vec![content.clone()]);
    let _: StageResponse = controller.stage(changes.clone()).await;
    controller.rsync_client_peer = Some(responder.await.unwrap());

    // Staging progress was published with a monotonic index.
    let status: StagingStatus = controller.rsync_state.recv().await.unwrap();
    assert_eq!(status.index, 1);
    assert_eq!(status.path, "a/b.txt");
    assert_eq!(status.received, 1);
    assert_eq!(status.total, 1);

    let response = controller.transition(changes).await;
    assert!(response.problems.is_empty(), "problems: {:?}", response.problems);
    assert_eq!(response.changes.len(), 2);
    assert_eq!(fs::read(root.join("a/b.txt")).unwrap(), content);

    // The stager was wiped after the transition.
    let staging = state.join("staging").join(format!("{SESSION}-alpha"));
    assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
}

#[tokio::test]
async fn staging_is_recoverable_and_idempotent() {
    let (_dir, root, state) = fixture();
    let mut controller = start(&root, &state, Vec::new()).await;

    let content = b"only transferred once".to_vec();
    let changes = vec![Change {
        path: "f.txt".to_owned(),
        old: None,
        new: Some(file_entry(&content, false)),
    }];

    let responder = controller.respond_transfers(vec![content.clone()]);
    let _: StageResponse = controller.stage(changes.clone()).await;
    controller.rsync_client_peer = Some(responder.await.unwrap());

    // A second stage of the same changes finds everything present and
    // requests no transfers at all.
    let _: StageResponse = controller.stage(changes).await;
}

#[tokio::test]
async fn precondition_mismatch_yields_a_problem() {
    let (_dir, root, state) = fixture();
    fs::write(root.join("x"), b"disk content the controller never saw").unwrap();
    let mut controller = start(&root, &state, Vec::new()).await;

    let response = controller
        .transition(vec![Change {
            path: "x".to_owned(),
            old: Some(file_entry(b"controller's stale view", false)),
            new: Some(file_entry(b"desired", false)),
        }])
        .await;

    assert!(response.changes.is_empty());
    assert_eq!(response.problems.len(), 1);
    assert_eq!(response.problems[0].path, "x");
}

#[tokio::test]
async fn transient_scan_failure_suggests_retry() {
    let (_dir, root, state) = fixture();
    let mut controller = start(&root, &state, Vec::new()).await;

    // Remove the root out from under the endpoint: the scan races a
    // "concurrent modification" and asks for a retry.
    fs::remove_dir(&root).unwrap();
    let response = controller.scan().await;
    assert!(response.try_again);
    assert!(response.snapshot_delta.is_empty());

    // Once the root is back, scans succeed again.
    fs::create_dir(&root).unwrap();
    let snapshot = controller.scan_snapshot().await;
    assert_eq!(snapshot, Entry::empty_directory());
}

#[tokio::test]
async fn cache_persistence_failure_is_sticky_and_fatal() {
    let (_dir, root, state) = fixture();
    fs::write(root.join("f"), b"content").unwrap();
    let mut controller = start(&root, &state, Vec::new()).await;

    // First scan persists fine.
    let _ = controller.scan_snapshot().await;
    let cache_path = state.join("caches").join(format!("{SESSION}-alpha"));
    wait_for("cache persistence", || cache_path.exists()).await;

    // Sabotage persistence: replace the caches directory with a file.
    fs::remove_dir_all(state.join("caches")).unwrap();
    fs::write(state.join("caches"), b"in the way").unwrap();

    // The next scan still succeeds; its background persistence fails.
    let _ = controller.scan_snapshot().await;

    // The scan after that hits the stored write error and the control
    // task fails, tearing the session down.
    controller
        .control
        .send(&EndpointRequest::Scan {
            base_signature: Signature::default(),
        })
        .await
        .unwrap();
    let response: Result<ScanResponse, _> = controller.control.recv().await;
    assert!(response.is_err(), "expected the session to fail");

    let failure = controller.serve.await.unwrap().unwrap_err();
    assert!(format!("{failure:#}").contains("unable to save cache"));
}

#[tokio::test]
async fn watch_channel_ticks() {
    let (_dir, root, state) = fixture();
    let mut controller = start(&root, &state, Vec::new()).await;

    // The 50ms poll floor alone guarantees a tick.
    let _: WatchEvent = controller.watch_events.recv().await.unwrap();

    // Ticks keep coming.
    let _: WatchEvent = controller.watch_events.recv().await.unwrap();
}

#[tokio::test]
async fn invalid_initialization_closes_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state");

    let (near, far) = tokio::io::duplex(1 << 16);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, far_write) = tokio::io::split(far);
    let serve = tokio::spawn(serve_with_options(
        far_read,
        far_write,
        EndpointOptions {
            state_dir: Some(state),
            watch_poll_interval: Duration::from_secs(5),
        },
    ));

    let channels = multiplex(near_read, near_write);
    let mut control = MessageStream::new(channels.control);
    control
        .send(&InitializeRequest {
            session: String::new(),
            version: 1,
            root: "/tmp".to_owned(),
            ignores: Vec::new(),
            alpha: true,
        })
        .await
        .unwrap();

    let failure = serve.await.unwrap().unwrap_err();
    assert!(format!("{failure:#}").contains("empty session identifier"));

    let response: Result<InitializeResponse, _> = control.recv().await;
    assert!(response.is_err());
}

#[tokio::test]
async fn unsupported_version_is_rejected() {
    let (_dir, root, state) = fixture();

    let (near, far) = tokio::io::duplex(1 << 16);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, far_write) = tokio::io::split(far);
    let serve = tokio::spawn(serve_with_options(
        far_read,
        far_write,
        EndpointOptions {
            state_dir: Some(state),
            watch_poll_interval: Duration::from_secs(5),
        },
    ));

    let channels = multiplex(near_read, near_write);
    let mut control = MessageStream::new(channels.control);
    control
        .send(&InitializeRequest {
            session: SESSION.to_owned(),
            version: 99,
            root: root.to_str().unwrap().to_owned(),
            ignores: Vec::new(),
            alpha: false,
        })
        .await
        .unwrap();

    let failure = serve.await.unwrap().unwrap_err();
    assert!(format!("{failure:#}").contains("unsupported session version"));
}
