use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{OutputError, OutputHandle, PageTask, PageWriter};

/// Writes each page to `<root>/<id>.html`.
#[derive(Debug)]
pub struct DirectoryWriter {
    root: PathBuf,
}

impl DirectoryWriter {
    /// Creates `root`, or empties it when it already exists.
    pub async fn prepare(root: &Path) -> Result<Self, OutputError> {
        if root.as_os_str().is_empty() {
            return Err(OutputError::validation("Need an output directory"));
        }

        match fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {
                debug!(
                    target = "staticplus::infra::output::directory",
                    path = %root.display(),
                    "clearing existing output directory"
                );
                fs::remove_dir_all(root)
                    .await
                    .map_err(|err| OutputError::io(root, err))?;
            }
            Ok(_) => {
                return Err(OutputError::validation(format!(
                    "Output path {} exists and is not a directory",
                    root.display()
                )));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(OutputError::io(root, err)),
        }

        fs::create_dir_all(root)
            .await
            .map_err(|err| OutputError::io(root, err))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn page_path(&self, id: &str) -> Result<PathBuf, OutputError> {
        let relative = page_file_name(id);
        let path = Path::new(&relative);
        if path
            .components()
            .any(|part| !matches!(part, Component::Normal(_)))
        {
            return Err(OutputError::validation(format!(
                "Page id `{id}` escapes the output directory"
            )));
        }
        Ok(self.root.join(path))
    }
}

/// `""` -> `index.html`, `about` -> `about.html`, `site.css` unchanged.
pub fn page_file_name(id: &str) -> String {
    let trimmed = id.trim_matches('/');
    if trimmed.is_empty() {
        return "index.html".to_string();
    }
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    if last.contains('.') {
        trimmed.to_string()
    } else {
        format!("{trimmed}.html")
    }
}

#[async_trait]
impl PageWriter for DirectoryWriter {
    async fn write(&self, page: &PageTask) -> Result<(), OutputError> {
        let path = self.page_path(&page.id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| OutputError::io(parent, err))?;
        }
        fs::write(&path, &page.body)
            .await
            .map_err(|err| OutputError::io(&path, err))
    }

    async fn remove(&self, id: &str) -> Result<(), OutputError> {
        let path = self.page_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(OutputError::io(&path, err)),
        }
    }

    fn handle(&self) -> OutputHandle {
        OutputHandle::Directory(self.root.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_ids_map_to_file_names() {
        assert_eq!(page_file_name(""), "index.html");
        assert_eq!(page_file_name("/"), "index.html");
        assert_eq!(page_file_name("foo"), "foo.html");
        assert_eq!(page_file_name("blog/first"), "blog/first.html");
        assert_eq!(page_file_name("site.css"), "site.css");
    }

    #[tokio::test]
    async fn prepare_clears_previous_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("out");
        std::fs::create_dir_all(root.join("old")).expect("mkdir");
        std::fs::write(root.join("stale.html"), "stale").expect("write");

        let writer = DirectoryWriter::prepare(&root).await.expect("prepare");
        assert!(!root.join("stale.html").exists());
        assert!(!root.join("old").exists());

        writer
            .write(&PageTask::html("blog/first", "<p>1</p>"))
            .await
            .expect("nested write");
        assert_eq!(
            std::fs::read_to_string(root.join("blog/first.html")).expect("read"),
            "<p>1</p>"
        );
    }

    #[tokio::test]
    async fn prepare_rejects_files_and_empty_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("taken");
        std::fs::write(&file, "x").expect("write");

        assert!(matches!(
            DirectoryWriter::prepare(&file).await,
            Err(OutputError::Validation(_))
        ));
        assert!(matches!(
            DirectoryWriter::prepare(Path::new("")).await,
            Err(OutputError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn rejects_ids_that_escape_the_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = DirectoryWriter::prepare(dir.path()).await.expect("prepare");
        let err = writer
            .write(&PageTask::html("../evil", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, OutputError::Validation(_)));
        writer.remove("missing").await.expect("removing nothing is fine");
    }
}
