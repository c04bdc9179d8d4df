//! Rsync substream protocol
//!
//! The transmitter side serves file content as deltas against the
//! receiver's base signatures; the receiver side drives transfers for the
//! local stager and publishes progress snapshots for the state channel.

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tokio::sync::watch;
use tracing::debug;

use tandem_core::delta::Engine;
use tandem_core::stage::{Stager, StagingSlot};

use crate::codec::MessageStream;
use crate::messages::{StagingStatus, TransferFrame, TransferRequest};

/// Serve transfer requests from the peer: for each requested path, read
/// it beneath `root`, deltify against the supplied base signature, and
/// stream the operations back.
///
/// Runs until the connection fails. A file that cannot be read produces
/// an error end-marker for that transfer, not a task failure; the tree
/// may legitimately race the peer's view of it.
pub async fn serve_transmitter(
    mut stream: MessageStream,
    root: PathBuf,
    engine: Engine,
) -> Result<()> {
    loop {
        let request: TransferRequest = stream
            .recv()
            .await
            .wrap_err("unable to receive transfer request")?;

        match tokio::fs::read(root.join(&request.path)).await {
            Ok(content) => {
                for op in engine.deltify(&content, &request.base_signature) {
                    stream
                        .send(&TransferFrame::Op(op))
                        .await
                        .wrap_err("unable to transmit delta operation")?;
                }
                stream
                    .send(&TransferFrame::End { error: None })
                    .await
                    .wrap_err("unable to transmit end marker")?;
            }
            Err(e) => {
                debug!(path = %request.path, "transfer source unreadable: {e}");
                stream
                    .send(&TransferFrame::End {
                        error: Some(e.to_string()),
                    })
                    .await
                    .wrap_err("unable to transmit error marker")?;
            }
        }
    }
}

/// The local stager's receiving client. Owned by the control task and
/// driven by Stage dispatch; progress lands in a watch channel that the
/// state-transmission task drains.
pub struct StagingClient {
    stream: MessageStream,
    root: PathBuf,
    stager: Arc<Stager>,
    engine: Engine,
    state: watch::Sender<StagingStatus>,
}

impl StagingClient {
    pub fn new(
        stream: MessageStream,
        root: PathBuf,
        stager: Arc<Stager>,
        engine: Engine,
    ) -> (Self, watch::Receiver<StagingStatus>) {
        let (state, state_rx) = watch::channel(StagingStatus::default());
        (
            Self {
                stream,
                root,
                stager,
                engine,
                state,
            },
            state_rx,
        )
    }

    /// Receive every slot's content into the stager.
    ///
    /// For each slot the current root content (if any) serves as the
    /// delta base, so small edits transfer small deltas. Content is
    /// verified against the slot's digest before installation.
    ///
    /// # Errors
    /// Any failure is terminal for the whole staging request; the
    /// controller retries. Already-received slots stay staged.
    pub async fn stage(&mut self, slots: Vec<StagingSlot>) -> Result<()> {
        let total = slots.len() as u64;
        for (position, slot) in slots.into_iter().enumerate() {
            let base = tokio::fs::read(self.root.join(&slot.path))
                .await
                .unwrap_or_default();
            let base_signature = self.engine.signature(&base, 0);

            self.stream
                .send(&TransferRequest {
                    path: slot.path.clone(),
                    base_signature,
                })
                .await
                .wrap_err("unable to request transfer")?;

            let mut ops = Vec::new();
            loop {
                match self
                    .stream
                    .recv::<TransferFrame>()
                    .await
                    .wrap_err("unable to receive transfer frame")?
                {
                    TransferFrame::Op(op) => ops.push(op),
                    TransferFrame::End { error: None } => break,
                    TransferFrame::End { error: Some(e) } => {
                        return Err(eyre!("peer failed to transmit {:?}: {e}", slot.path));
                    }
                }
            }

            let content = self
                .engine
                .patch(&base, &ops)
                .wrap_err_with(|| format!("unable to patch {:?}", slot.path))?;
            self.stager
                .store(&slot, &mut content.as_slice())
                .wrap_err_with(|| format!("unable to stage {:?}", slot.path))?;

            let index = self.state.borrow().index + 1;
            let _ = self.state.send(StagingStatus {
                path: slot.path,
                index,
                received: position as u64 + 1,
                total,
            });
        }
        Ok(())
    }
}

/// Transmit each staging state change on the state channel, tagged by its
/// monotonic index. Ends cleanly if the state source goes away.
pub async fn transmit_staging_state(
    mut stream: MessageStream,
    mut state: watch::Receiver<StagingStatus>,
) -> Result<()> {
    loop {
        if state.changed().await.is_err() {
            return Ok(());
        }
        let status = state.borrow_and_update().clone();
        stream
            .send(&status)
            .await
            .wrap_err("unable to transmit staging state")?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::multiplex;
    use tandem_core::digest::Algorithm;
    use tokio::io::duplex;

    fn transfer_streams() -> (MessageStream, MessageStream) {
        let (near, far) = duplex(1 << 16);
        let (near_read, near_write) = tokio::io::split(near);
        let (far_read, far_write) = tokio::io::split(far);
        let near = multiplex(near_read, near_write);
        let far = multiplex(far_read, far_write);
        (
            MessageStream::new(near.rsync_client),
            MessageStream::new(far.rsync_client),
        )
    }

    #[tokio::test]
    async fn stage_receives_and_installs_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let serve_root = root.clone();

        let algorithm = Algorithm::Sha1;
        let stager =
            Arc::new(Stager::new(dir.path().join("staging"), algorithm).unwrap());

        let (client_stream, server_stream) = transfer_streams();

        // The peer's transmitter side, serving from its own root.
        let peer_root = dir.path().join("peer");
        std::fs::create_dir(&peer_root).unwrap();
        std::fs::write(peer_root.join("a.txt"), b"transferred content").unwrap();
        let transmitter = tokio::spawn(serve_transmitter(
            server_stream,
            peer_root,
            Engine::new(algorithm),
        ));

        let (mut client, mut state_rx) = StagingClient::new(
            client_stream,
            serve_root,
            stager.clone(),
            Engine::new(algorithm),
        );

        let slot = StagingSlot {
            path: "a.txt".to_owned(),
            digest: algorithm.digest(b"transferred content"),
        };
        client.stage(vec![slot.clone()]).await.unwrap();

        assert!(stager.contains(&slot.digest));
        assert!(state_rx.has_changed().unwrap());
        let status = state_rx.borrow_and_update().clone();
        assert_eq!(status.index, 1);
        assert_eq!(status.received, 1);
        assert_eq!(status.total, 1);

        transmitter.abort();
    }

    #[tokio::test]
    async fn missing_peer_file_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();

        let algorithm = Algorithm::Sha1;
        let stager =
            Arc::new(Stager::new(dir.path().join("staging"), algorithm).unwrap());

        let (client_stream, server_stream) = transfer_streams();
        let peer_root = dir.path().join("peer");
        std::fs::create_dir(&peer_root).unwrap();
        let transmitter = tokio::spawn(serve_transmitter(
            server_stream,
            peer_root,
            Engine::new(algorithm),
        ));

        let (mut client, _state_rx) = StagingClient::new(
            client_stream,
            root,
            stager,
            Engine::new(algorithm),
        );

        let slot = StagingSlot {
            path: "never-there.txt".to_owned(),
            digest: algorithm.digest(b"whatever"),
        };
        assert!(client.stage(vec![slot]).await.is_err());

        transmitter.abort();
    }
}
