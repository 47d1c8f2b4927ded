use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::migration::{MigrationReport, StorageMigrationEngine};

/// Fired right before the app window navigates to `http://127.0.0.1:<port>/`.
#[derive(Debug)]
pub struct BeforeLoadUrl {
    pub port: u16,
    /// Set when the server is restarted in place and the previous page may
    /// still be using its storage.
    pub last_port: Option<u16>,
    pub done: Option<oneshot::Sender<MigrationReport>>,
}

#[derive(Clone)]
pub struct EventsBus {
    tx: mpsc::Sender<BeforeLoadUrl>,
}

impl EventsBus {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BeforeLoadUrl>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Emits the event and waits for the migration to settle.
    ///
    /// Returns `None` when nobody is subscribed; the caller should load the
    /// URL anyway.
    pub async fn before_load_url(
        &self,
        port: u16,
        last_port: Option<u16>,
    ) -> Option<MigrationReport> {
        let (done_tx, done_rx) = oneshot::channel();
        let event = BeforeLoadUrl {
            port,
            last_port,
            done: Some(done_tx),
        };
        if self.tx.send(event).await.is_err() {
            warn!(port, "no storage migrator subscribed; loading url without migration");
            return None;
        }
        done_rx.await.ok()
    }
}

/// Subscribes `engine` to the bus. Events are handled one at a time; the task
/// ends when every [`EventsBus`] handle has been dropped.
pub fn spawn_storage_migrator(
    engine: Arc<StorageMigrationEngine>,
    mut rx: mpsc::Receiver<BeforeLoadUrl>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let report = engine.migrate(event.port, event.last_port).await;
            debug!(
                port = event.port,
                success = report.is_success(),
                "before load url handled"
            );
            if let Some(done) = event.done {
                let _ = done.send(report);
            }
        }
    })
}
