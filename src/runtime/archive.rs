// ABOUTME: Tar packing and unpacking for copies between the host and a container.
// ABOUTME: Local paths become single-root archives; archives unpack under a directory.

use super::error::ContainerError;
use bytes::Bytes;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Pack a local file or directory into a tar archive rooted at its base name.
pub fn pack(path: &Path) -> Result<Bytes, ContainerError> {
    let name = path
        .file_name()
        .ok_or_else(|| transfer(path, "path has no file name"))?;
    let meta = std::fs::metadata(path).map_err(|e| io_failure(path, e))?;

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    let appended = if meta.is_dir() {
        builder.append_dir_all(name, path)
    } else {
        builder.append_path_with_name(path, name)
    };
    appended.map_err(|e| io_failure(path, e))?;
    let bytes = builder.into_inner().map_err(|e| io_failure(path, e))?;
    Ok(Bytes::from(bytes))
}

/// Unpack `archive` under `dest`, returning the top-level paths it created.
///
/// Entries that would land outside `dest` are skipped.
pub fn unpack(archive: &[u8], dest: &Path) -> Result<Vec<PathBuf>, ContainerError> {
    let mut roots: Vec<PathBuf> = Vec::new();
    let mut reader = tar::Archive::new(archive);
    let entries = reader.entries().map_err(|e| io_failure(dest, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| io_failure(dest, e))?;
        let root = entry
            .path()
            .ok()
            .and_then(|p| first_component(&p))
            .map(|c| dest.join(c));
        let unpacked = entry.unpack_in(dest).map_err(|e| io_failure(dest, e))?;
        if unpacked
            && let Some(root) = root
            && !roots.contains(&root)
        {
            roots.push(root);
        }
    }
    Ok(roots)
}

fn first_component(path: &Path) -> Option<PathBuf> {
    path.components().find_map(|c| match c {
        Component::Normal(part) => Some(PathBuf::from(part)),
        _ => None,
    })
}

fn transfer(path: &Path, reason: &str) -> ContainerError {
    ContainerError::Transfer(format!("{}: {reason}", path.display()))
}

fn io_failure(path: &Path, err: io::Error) -> ContainerError {
    ContainerError::Transfer(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_round_trips_under_its_base_name() {
        let src = tempfile::tempdir().unwrap();
        let file = src.path().join("app.conf");
        std::fs::write(&file, "port = 80\n").unwrap();

        let archive = pack(&file).unwrap();
        let dest = tempfile::tempdir().unwrap();
        let roots = unpack(&archive, dest.path()).unwrap();

        assert_eq!(roots, vec![dest.path().join("app.conf")]);
        assert_eq!(
            std::fs::read_to_string(dest.path().join("app.conf")).unwrap(),
            "port = 80\n"
        );
    }

    #[test]
    fn directory_keeps_its_layout() {
        let src = tempfile::tempdir().unwrap();
        let dir = src.path().join("site");
        std::fs::create_dir_all(dir.join("css")).unwrap();
        std::fs::write(dir.join("index.html"), "<h1>hi</h1>").unwrap();
        std::fs::write(dir.join("css/main.css"), "body {}").unwrap();

        let archive = pack(&dir).unwrap();
        let dest = tempfile::tempdir().unwrap();
        let roots = unpack(&archive, dest.path()).unwrap();

        assert_eq!(roots, vec![dest.path().join("site")]);
        assert!(dest.path().join("site/css/main.css").is_file());
    }

    #[test]
    fn missing_source_is_a_transfer_error() {
        let err = pack(Path::new("/definitely/not/here.txt")).unwrap_err();
        assert!(matches!(err, ContainerError::Transfer(_)), "{err}");
    }
}
