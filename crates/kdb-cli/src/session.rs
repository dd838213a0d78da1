//! The open database, shared behind an async mutex, with load and save
//! running on the blocking pool

use anyhow::Context;
use kdb_core::{Credentials, Database, NewDatabase, ProgressListener, ProgressStatus};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Forwards pipeline status from a blocking task to the printer
struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressStatus>,
}

impl ProgressListener for ChannelProgress {
    fn on_status(&mut self, status: ProgressStatus) {
        // the printer may already be gone
        let _ = self.tx.send(status);
    }
}

/// Print status lines to stderr until every sender is dropped
fn spawn_printer(mut rx: mpsc::UnboundedReceiver<ProgressStatus>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interactive = std::io::stderr().is_terminal();
        let mut last_percent = None;
        while let Some(status) = rx.recv().await {
            tracing::debug!(?status, "progress");
            if !interactive {
                continue;
            }
            match status {
                ProgressStatus::DerivingKey { done, total } if total > 0 => {
                    let percent = done.saturating_mul(100) / total;
                    if last_percent != Some(percent) {
                        last_percent = Some(percent);
                        eprint!("\rDeriving key... {:>3}%", percent);
                    }
                }
                ProgressStatus::DerivingKey { .. } => {}
                other => {
                    if last_percent.take().is_some() {
                        eprintln!();
                    }
                    eprintln!("{}...", other);
                }
            }
        }
        if interactive && last_percent.is_some() {
            eprintln!();
        }
    })
}

/// Run `task` on the blocking pool with a progress channel attached
async fn run_blocking<T, F>(task: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn ProgressListener) -> kdb_core::Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = spawn_printer(rx);
    let result = tokio::task::spawn_blocking(move || {
        let mut listener = ChannelProgress { tx };
        task(&mut listener)
    })
    .await
    .context("Background task panicked")?;
    // the sender is dropped with the task, so the printer drains and stops
    let _ = printer.await;
    Ok(result?)
}

/// A database file opened for this invocation
pub struct DatabaseSession {
    path: PathBuf,
    db: Arc<Mutex<Database>>,
}

impl DatabaseSession {
    pub async fn open(path: &Path, credentials: Credentials) -> anyhow::Result<Self> {
        let owned = path.to_path_buf();
        let db = run_blocking(move |progress| {
            Database::open_path(&owned, &credentials, progress)
        })
        .await?;
        Ok(Self::wrap(path, db))
    }

    /// Create a database and write it to `path`, which must not exist yet
    pub async fn create(
        path: &Path,
        options: NewDatabase,
        credentials: Credentials,
    ) -> anyhow::Result<Self> {
        if path.exists() {
            anyhow::bail!("{} already exists", path.display());
        }
        let db = Database::create(options, credentials)?;
        let session = Self::wrap(path, db);
        session.save().await?;
        Ok(session)
    }

    fn wrap(path: &Path, db: Database) -> Self {
        Self {
            path: path.to_path_buf(),
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read-only closure against the database
    pub async fn read<R>(&self, f: impl FnOnce(&Database) -> R) -> R {
        let db = self.db.lock().await;
        f(&*db)
    }

    /// Apply a change and persist it on the blocking pool.
    ///
    /// The lock is held until the file is written.
    pub async fn commit<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database, &Path, &mut dyn ProgressListener) -> kdb_core::Result<T>
            + Send
            + 'static,
    {
        let mut db = self.db.clone().lock_owned().await;
        let path = self.path.clone();
        run_blocking(move |progress| f(&mut *db, &path, progress)).await
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        self.commit(|db, path, progress| db.save_to_path(path, progress))
            .await
    }
}
