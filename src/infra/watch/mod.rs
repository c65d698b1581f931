//! Resource directories turned into attachment maps, once or continuously.

pub mod debounce;
pub mod less;

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use futures::future::join_all;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::{fs, sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::domain::Attachment;

use self::debounce::ScheduledTasks;

pub use debounce::DEFAULT_DEBOUNCE_MS;

/// Extensions picked up from resource directories.
pub const KNOWN_EXTENSIONS: &[&str] = &["js", "html", "css", "less", "eot", "svg", "ttf", "woff"];

pub type AttachmentMap = BTreeMap<String, Attachment>;

/// Reads every file with a known extension directly inside `dir`.
pub async fn scan(dir: &Path, prefix: Option<&str>) -> io::Result<AttachmentMap> {
    let mut entries = fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            paths.push(entry.path());
        }
    }

    let prepared = join_all(paths.iter().map(|path| scan_file(path, prefix))).await;
    let mut attachments = AttachmentMap::new();
    for item in prepared {
        if let Some((name, attachment)) = item? {
            attachments.insert(name, attachment);
        }
    }
    debug!(
        target = "staticplus::infra::watch",
        dir = %dir.display(),
        count = attachments.len(),
        "directory scanned"
    );
    Ok(attachments)
}

/// One file as a named attachment; `None` for unknown extensions.
///
/// `.less` sources are compiled and renamed to `.css`. A compile failure
/// becomes the file content so the broken stylesheet is visible on the site.
pub async fn scan_file(
    path: &Path,
    prefix: Option<&str>,
) -> io::Result<Option<(String, Attachment)>> {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return Ok(None);
    };
    let Some((stem, ext)) = file_name.rsplit_once('.') else {
        return Ok(None);
    };
    let ext = ext.to_ascii_lowercase();
    if !KNOWN_EXTENSIONS.contains(&ext.as_str()) {
        return Ok(None);
    }

    let bytes = fs::read(path).await?;
    let (name, content_type, body) = if ext == "less" {
        let source = String::from_utf8_lossy(&bytes);
        let css = less::compile(&source).unwrap_or_else(|err| {
            warn!(
                target = "staticplus::infra::watch",
                file = %path.display(),
                error = %err,
                "less compile failed"
            );
            format!("/* {file_name}: {err} */\n")
        });
        (format!("{stem}.css"), "text/css".to_string(), css.into_bytes())
    } else {
        let content_type = mime_guess::from_ext(&ext)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string();
        (file_name.to_string(), content_type, bytes)
    };

    let name = match prefix {
        Some(prefix) => format!("{prefix}/{name}"),
        None => name,
    };
    Ok(Some((name, Attachment::inline(content_type, body))))
}

/// Watches one directory and yields single-file attachment maps as files
/// settle after changes.
pub struct DirectoryWatcher {
    _watcher: RecommendedWatcher,
    updates: mpsc::Receiver<AttachmentMap>,
    task: JoinHandle<()>,
}

impl DirectoryWatcher {
    pub fn start(
        dir: &Path,
        prefix: Option<String>,
        debounce: Duration,
    ) -> Result<Self, notify::Error> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<PathBuf>(100);
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                // Removals are left alone; only changed content is republished.
                Ok(event) if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) => {
                    for path in event.paths {
                        let _ = raw_tx.blocking_send(path);
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(
                    target = "staticplus::infra::watch",
                    error = %err,
                    "watch error"
                ),
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        let (updates_tx, updates) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            let (mut scheduled, mut fired) = ScheduledTasks::new(debounce);
            loop {
                tokio::select! {
                    Some(path) = raw_rx.recv() => scheduled.schedule(path),
                    Some(path) = fired.recv() => {
                        scheduled.settle(&path);
                        match scan_file(&path, prefix.as_deref()).await {
                            Ok(Some((name, attachment))) => {
                                debug!(
                                    target = "staticplus::infra::watch",
                                    attachment = %name,
                                    "file changed"
                                );
                                let update = AttachmentMap::from([(name, attachment)]);
                                if updates_tx.send(update).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                            Err(err) => warn!(
                                target = "staticplus::infra::watch",
                                file = %path.display(),
                                error = %err,
                                "failed to read changed file"
                            ),
                        }
                    }
                    else => break,
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            updates,
            task,
        })
    }

    /// Next settled change, or `None` once the watcher has shut down.
    pub async fn next(&mut self) -> Option<AttachmentMap> {
        self.updates.recv().await
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
