//! Loading and saving databases, and committing single edits to disk

use crate::database::Database;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::format;
use crate::key::Credentials;
use crate::progress::{ProgressListener, ProgressStatus, TaskResult};
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

/// Knobs for [`Database::save_to_path_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Stop after the temporary file is written and synced, leaving the
    /// target untouched and returning [`Error::SaveFailed`]
    pub fail_before_rename: bool,
}

impl Database {
    /// Read a database, detecting KDB or KDBX from the signature
    pub fn open<R: Read>(
        mut reader: R,
        credentials: &Credentials,
        progress: &mut dyn ProgressListener,
    ) -> Result<Self> {
        let result = read_all(&mut reader)
            .and_then(|data| format::read(&data, credentials.clone(), progress));
        progress.on_finish(&TaskResult::from_result(&result));

        let db = result?;
        info!(
            "Opened {} database: {} groups, {} entries",
            db.format().name(),
            db.groups().count(),
            db.entries().count()
        );
        Ok(db)
    }

    pub fn open_path(
        path: impl AsRef<Path>,
        credentials: &Credentials,
        progress: &mut dyn ProgressListener,
    ) -> Result<Self> {
        let path = path.as_ref();
        debug!("Opening {}", path.display());
        let file = std::fs::File::open(path)?;
        Self::open(std::io::BufReader::new(file), credentials, progress)
    }

    /// Encode the database and write it to `writer`
    pub fn save<W: Write>(&self, mut writer: W, progress: &mut dyn ProgressListener) -> Result<()> {
        let result = format::write(self, progress).and_then(|data| {
            progress.on_status(ProgressStatus::Writing);
            writer.write_all(&data)?;
            writer.flush()?;
            Ok(())
        });
        progress.on_finish(&TaskResult::from_result(&result));
        result
    }

    /// Replace the file at `path` atomically
    pub fn save_to_path(
        &self,
        path: impl AsRef<Path>,
        progress: &mut dyn ProgressListener,
    ) -> Result<()> {
        self.save_to_path_with(path, SaveOptions::default(), progress)
    }

    /// Write to a temporary file beside `path`, sync it, then rename it over
    /// the target. The target is either the old file or the new one.
    pub fn save_to_path_with(
        &self,
        path: impl AsRef<Path>,
        options: SaveOptions,
        progress: &mut dyn ProgressListener,
    ) -> Result<()> {
        let path = path.as_ref();
        let result = self.write_atomic(path, options, progress);
        progress.on_finish(&TaskResult::from_result(&result));
        if result.is_ok() {
            info!(
                "Saved {} database to {}: {} entries",
                self.format().name(),
                path.display(),
                self.entries().count()
            );
        }
        result
    }

    fn write_atomic(
        &self,
        path: &Path,
        options: SaveOptions,
        progress: &mut dyn ProgressListener,
    ) -> Result<()> {
        let data = format::write(self, progress)?;
        progress.on_status(ProgressStatus::Writing);

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp = NamedTempFile::new_in(dir).map_err(save_failed)?;
        temp.write_all(&data).map_err(save_failed)?;
        temp.flush().map_err(save_failed)?;
        temp.as_file().sync_all().map_err(save_failed)?;
        debug!("Wrote {} bytes to {}", data.len(), temp.path().display());

        if options.fail_before_rename {
            return Err(Error::SaveFailed(
                "Stopped before replacing the target file".to_string(),
            ));
        }
        temp.persist(path).map_err(|e| save_failed(e.error))?;
        Ok(())
    }

    /// Replace an entry and save. On failure the database is left as it was.
    pub fn commit_entry_update(
        &mut self,
        path: impl AsRef<Path>,
        uuid: &Uuid,
        entry: Entry,
        options: SaveOptions,
        progress: &mut dyn ProgressListener,
    ) -> Result<Entry> {
        self.commit(path.as_ref(), options, progress, |db| {
            db.update_entry(uuid, entry)
        })
    }

    /// Add an entry and save. On failure the database is left as it was.
    pub fn commit_add_entry(
        &mut self,
        path: impl AsRef<Path>,
        entry: Entry,
        options: SaveOptions,
        progress: &mut dyn ProgressListener,
    ) -> Result<Uuid> {
        self.commit(path.as_ref(), options, progress, |db| db.add_entry(entry))
    }

    /// Delete an entry and save. On failure the database is left as it was.
    pub fn commit_delete_entry(
        &mut self,
        path: impl AsRef<Path>,
        uuid: &Uuid,
        options: SaveOptions,
        progress: &mut dyn ProgressListener,
    ) -> Result<Entry> {
        self.commit(path.as_ref(), options, progress, |db| db.delete_entry(uuid))
    }

    /// Move an entry to the recycle bin (or delete it) and save.
    ///
    /// Returns true when the entry was recycled.
    pub fn commit_recycle_entry(
        &mut self,
        path: impl AsRef<Path>,
        uuid: &Uuid,
        options: SaveOptions,
        progress: &mut dyn ProgressListener,
    ) -> Result<bool> {
        self.commit(path.as_ref(), options, progress, |db| db.recycle_entry(uuid))
    }

    fn commit<T>(
        &mut self,
        path: &Path,
        options: SaveOptions,
        progress: &mut dyn ProgressListener,
        apply: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let checkpoint = self.checkpoint();
        let result = apply(self)
            .and_then(|value| self.save_to_path_with(path, options, progress).map(|_| value));
        if let Err(e) = &result {
            debug!("Commit failed, rolling back: {}", e);
            self.restore(checkpoint);
        }
        result
    }
}

fn read_all(reader: &mut dyn Read) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    Ok(data)
}

fn save_failed(e: std::io::Error) -> Error {
    Error::SaveFailed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseFormat;
    use crate::entry::EntryBuilder;
    use crate::progress::NoProgress;
    use tempfile::tempdir;

    fn small_db() -> Database {
        let mut db = Database::new("Persist", Credentials::from_password("pw"));
        db.crypto.kdf = crate::crypto::kdf::KdfParameters::aes(10);
        db
    }

    #[test]
    fn test_save_and_open_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.kdbx");
        let mut db = small_db();
        db.add_entry(EntryBuilder::new("Mail").password("secret").build())
            .unwrap();
        db.save_to_path(&path, &mut NoProgress).unwrap();

        let reopened =
            Database::open_path(&path, &Credentials::from_password("pw"), &mut NoProgress)
                .unwrap();
        assert!(reopened.format().is_kdbx());
        assert_eq!(reopened.entries().count(), 1);
        // no temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[derive(Default)]
    struct Recorder {
        statuses: Vec<ProgressStatus>,
        finished: Option<TaskResult>,
    }

    impl ProgressListener for Recorder {
        fn on_status(&mut self, status: ProgressStatus) {
            self.statuses.push(status);
        }

        fn on_finish(&mut self, result: &TaskResult) {
            self.finished = Some(result.clone());
        }
    }

    #[test]
    fn test_open_reports_finish() {
        let mut recorder = Recorder::default();
        let result = Database::open(
            &b"not a database at all"[..],
            &Credentials::from_password("pw"),
            &mut recorder,
        );
        assert!(result.is_err());
        let finished = recorder.finished.unwrap();
        assert!(!finished.success);
        assert!(finished.error_kind.is_some());
    }

    #[test]
    fn test_save_reports_writing() {
        let mut recorder = Recorder::default();
        let mut out = Vec::new();
        small_db().save(&mut out, &mut recorder).unwrap();
        assert!(recorder.statuses.contains(&ProgressStatus::Writing));
        assert_eq!(recorder.finished, Some(TaskResult::ok()));
        assert!(!out.is_empty());
    }

    #[test]
    fn test_failed_commit_rolls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.kdbx");
        let mut db = small_db();
        let uuid = db
            .add_entry(EntryBuilder::new("Before").password("one").build())
            .unwrap();
        db.save_to_path(&path, &mut NoProgress).unwrap();
        let on_disk = std::fs::read(&path).unwrap();

        let mut edited = db.get_entry(&uuid).unwrap().clone();
        edited.title = "After".into();
        let result = db.commit_entry_update(
            &path,
            &uuid,
            edited,
            SaveOptions {
                fail_before_rename: true,
            },
            &mut NoProgress,
        );

        assert!(matches!(result, Err(Error::SaveFailed(_))));
        assert_eq!(std::fs::read(&path).unwrap(), on_disk);
        let entry = db.get_entry(&uuid).unwrap();
        assert_eq!(entry.title.reveal().as_str(), "Before");
        assert!(entry.history.is_empty());
    }

    #[test]
    fn test_commit_add_and_delete() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.kdbx");
        let mut db = small_db();
        let uuid = db
            .commit_add_entry(
                &path,
                EntryBuilder::new("Bank").build(),
                SaveOptions::default(),
                &mut NoProgress,
            )
            .unwrap();

        let creds = Credentials::from_password("pw");
        let reopened = Database::open_path(&path, &creds, &mut NoProgress).unwrap();
        assert!(reopened.get_entry(&uuid).is_some());

        db.commit_delete_entry(&path, &uuid, SaveOptions::default(), &mut NoProgress)
            .unwrap();
        let reopened = Database::open_path(&path, &creds, &mut NoProgress).unwrap();
        assert!(reopened.get_entry(&uuid).is_none());
        assert_eq!(reopened.format(), DatabaseFormat::Kdbx(crate::KdbxVersion::Kdbx31));
    }

    #[test]
    fn test_commit_of_missing_entry_leaves_file_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.kdbx");
        let mut db = small_db();
        let result = db.commit_delete_entry(
            &path,
            &Uuid::new_v4(),
            SaveOptions::default(),
            &mut NoProgress,
        );
        assert!(matches!(result, Err(Error::EntryNotFound(_))));
        assert!(!path.exists());
    }
}
