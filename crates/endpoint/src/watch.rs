//! Filesystem watch task
//!
//! Emits a coalesced "something changed" tick on the watch channel
//! whenever the native watcher fires, with a polling interval as a
//! liveness floor. When native watching is unavailable the poll ticks
//! alone. Events are at-least-once: a burst of changes produces one or
//! more ticks, never none.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::codec::MessageStream;
use crate::messages::WatchEvent;

/// Debounce window for native watcher events.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(250);

/// Serve the watch channel until cancelled or the connection fails.
pub async fn serve_watch(
    mut stream: MessageStream,
    root: PathBuf,
    poll_interval: Duration,
    cancel: Arc<Notify>,
) -> Result<()> {
    // Capacity-1 channel plus try_send coalesces bursts into one pending
    // tick.
    let (tick_tx, mut tick_rx) = mpsc::channel::<()>(1);

    let debouncer = new_debouncer(
        DEBOUNCE_WINDOW,
        None,
        move |result: DebounceEventResult| {
            if let Ok(events) = result {
                if !events.is_empty() {
                    let _ = tick_tx.try_send(());
                }
            }
        },
    );
    let _debouncer = match debouncer {
        Ok(mut debouncer) => match debouncer.watch(&root, RecursiveMode::Recursive) {
            Ok(()) => {
                debug!(root = %root.display(), "native filesystem watching active");
                Some(debouncer)
            }
            Err(e) => {
                warn!("native watching unavailable, polling only: {e}");
                None
            }
        },
        Err(e) => {
            warn!("unable to create watcher, polling only: {e}");
            None
        }
    };

    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first interval tick fires immediately; consume it so the poll
    // floor starts one interval out.
    poll.tick().await;

    loop {
        tokio::select! {
            _ = cancel.notified() => return Ok(()),
            _ = tick_rx.recv() => {}
            _ = poll.tick() => {}
        }
        stream
            .send(&WatchEvent {})
            .await
            .wrap_err("unable to transmit watch event")?;
    }
}
