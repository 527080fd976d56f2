//! File-per-mail queue directories.
//!
//! One mail is one JSON file named `<epochMillis>-<uuid>.json`; the
//! millisecond prefix makes a lexicographic sort a FIFO order, with the UUID
//! breaking same-millisecond ties. Producers write a temporary sibling and
//! rename in; consumers list, sort, and read-then-unlink. Files that fail to
//! read or parse move to a `poison/` subdirectory and are never retried.

use std::path::{Path, PathBuf};

use apiary_core::{HiveError, HiveResult, Mail};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Quarantine subdirectory for unreadable or unparseable files.
pub const POISON_DIR: &str = "poison";

/// Queue file name for a mail: epoch millis (zero-padded for sort
/// stability) plus the mail id.
pub fn mail_file_name(mail: &Mail) -> String {
    format!("{:013}-{}.json", mail.timestamp.timestamp_millis(), mail.id)
}

/// Write a mail into `dir` under the queue naming contract.
///
/// The write goes to a hidden temporary sibling first and is renamed into
/// place, so directory listers never observe a partial file.
pub async fn write_mail(dir: &Path, mail: &Mail) -> HiveResult<PathBuf> {
    fs::create_dir_all(dir).await?;
    let name = mail_file_name(mail);
    let target = dir.join(&name);
    let tmp = dir.join(format!(".{name}.tmp"));

    let json = serde_json::to_vec_pretty(mail)
        .map_err(|e| HiveError::Validation(format!("mail serialization failed: {e}")))?;
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&json).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, &target).await?;
    Ok(target)
}

/// List queue files in FIFO order. Only `.json` entries count; the
/// temporary-sibling and `poison/` conventions keep everything else out.
pub async fn list_queue(dir: &Path) -> HiveResult<Vec<PathBuf>> {
    if !fs::try_exists(dir).await? {
        return Ok(Vec::new());
    }
    let mut entries = fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        if entry.file_type().await?.is_dir() {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

/// Number of pending mails in a queue directory.
pub async fn queue_len(dir: &Path) -> HiveResult<usize> {
    Ok(list_queue(dir).await?.len())
}

/// Read one mail file without consuming it.
pub async fn read_mail(path: &Path) -> HiveResult<Mail> {
    let bytes = fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(|e| HiveError::MailCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Read all mails in a queue in FIFO order, skipping nothing; a corrupt
/// entry fails the whole enumeration (callers that want quarantine use
/// [`poison`] at consume time instead).
pub async fn read_queue(dir: &Path) -> HiveResult<Vec<Mail>> {
    let mut mails = Vec::new();
    for path in list_queue(dir).await? {
        mails.push(read_mail(&path).await?);
    }
    Ok(mails)
}

/// Move a bad file into the directory's `poison/` quarantine and append a
/// line to the error log. The file is never retried.
pub async fn poison(path: &Path, reason: &str) -> HiveResult<PathBuf> {
    let dir = path
        .parent()
        .ok_or_else(|| HiveError::validation("poison", "queue file has no parent directory"))?;
    let poison_dir = dir.join(POISON_DIR);
    fs::create_dir_all(&poison_dir).await?;

    let name = path
        .file_name()
        .ok_or_else(|| HiveError::validation("poison", "queue file has no name"))?;
    let target = poison_dir.join(name);
    fs::rename(path, &target).await?;

    let log_line = format!(
        "{} {} {}\n",
        chrono::Utc::now().to_rfc3339(),
        target.display(),
        reason
    );
    let mut log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(poison_dir.join("errors.log"))
        .await?;
    log.write_all(log_line.as_bytes()).await?;

    tracing::warn!(file = %target.display(), reason, "poisoned mail file");
    Ok(target)
}

/// Atomically move a queue file into another directory, preserving its name.
pub async fn move_into(path: &Path, dest_dir: &Path) -> HiveResult<PathBuf> {
    fs::create_dir_all(dest_dir).await?;
    let name = path
        .file_name()
        .ok_or_else(|| HiveError::validation("move", "queue file has no name"))?;
    let target = dest_dir.join(name);
    fs::rename(path, &target).await?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_core::MailType;
    use chrono::{Duration, Utc};

    fn mail_at(offset_ms: i64) -> Mail {
        let mut mail = Mail::new("a", "b", "s", "b", MailType::Agent);
        mail.timestamp = Utc::now() + Duration::milliseconds(offset_ms);
        mail
    }

    #[tokio::test]
    async fn test_write_then_list_fifo() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();

        let mails = [mail_at(2), mail_at(0), mail_at(1)];
        for mail in &mails {
            write_mail(dir, mail).await.unwrap();
        }

        let listed = read_queue(dir).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].id, mails[1].id);
        assert_eq!(listed[1].id, mails[2].id);
        assert_eq!(listed[2].id, mails[0].id);
    }

    #[tokio::test]
    async fn test_same_millisecond_ties_break_by_uuid() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();

        let base = mail_at(0);
        let mut other = mail_at(0);
        other.timestamp = base.timestamp;
        write_mail(dir, &base).await.unwrap();
        write_mail(dir, &other).await.unwrap();

        let files = list_queue(dir).await.unwrap();
        assert_eq!(files.len(), 2);
        let mut names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        let sorted = names.clone();
        names.sort();
        assert_eq!(names, sorted);
    }

    #[tokio::test]
    async fn test_no_partial_files_visible() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        // A stray temp sibling must not appear in listings.
        fs::write(dir.join(".0000000000001-x.json.tmp"), b"{")
            .await
            .unwrap();
        write_mail(dir, &mail_at(0)).await.unwrap();
        assert_eq!(list_queue(dir).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_poison_moves_file_and_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let bad = dir.join("0000000000001-junk.json");
        fs::write(&bad, b"{not json").await.unwrap();

        let err = read_mail(&bad).await.unwrap_err();
        match &err {
            HiveError::MailCorrupt { .. } => {}
            other => panic!("expected MailCorrupt, got {other:?}"),
        }

        let target = poison(&bad, &err.to_string()).await.unwrap();
        assert!(target.starts_with(dir.join(POISON_DIR)));
        assert!(!bad.exists());
        let log = fs::read_to_string(dir.join(POISON_DIR).join("errors.log"))
            .await
            .unwrap();
        assert!(log.contains("junk"));

        // Quarantined files do not show up as queue entries.
        assert!(list_queue(dir).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_move_into_preserves_name() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("outbox");
        let dst = tmp.path().join("inflight");
        let mail = mail_at(0);
        let written = write_mail(&src, &mail).await.unwrap();
        let moved = move_into(&written, &dst).await.unwrap();
        assert_eq!(
            moved.file_name().unwrap(),
            written.file_name().unwrap()
        );
        assert!(list_queue(&src).await.unwrap().is_empty());
        assert_eq!(list_queue(&dst).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_fields_survive_store_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let mut mail = mail_at(0);
        mail.extra
            .insert("xCustom".to_string(), serde_json::json!({"n": 7}));
        write_mail(dir, &mail).await.unwrap();
        let back = read_queue(dir).await.unwrap().remove(0);
        assert_eq!(back.extra["xCustom"]["n"], 7);
    }
}
