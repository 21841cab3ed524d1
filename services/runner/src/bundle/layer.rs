//! Layer tarball extraction.
//!
//! Layers are gzip-compressed or plain tar, told apart by their magic bytes.
//! Whiteout entries are either applied to the tree being built (a flattened
//! root filesystem) or converted to the form overlayfs understands (a layer
//! directory that will sit in a lowerdir stack).

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, warn};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Extended attribute marking an overlay directory as opaque.
const OVERLAY_OPAQUE_XATTR: &str = "trusted.overlay.opaque";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// How whiteout entries are handled during extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whiteouts {
    /// Delete the whited-out paths from the destination.
    Apply,
    /// Record whiteouts as overlayfs whiteout devices and opaque xattrs.
    Overlay,
}

/// Extract the layer blob at `layer` into `dest`.
pub fn extract_layer(layer: &Path, dest: &Path, whiteouts: Whiteouts) -> io::Result<()> {
    let mut file = File::open(layer)?;
    let mut magic = [0u8; 4];
    let read = read_prefix(&mut file, &mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    let reader = BufReader::new(file);
    if read >= 2 && magic[..2] == GZIP_MAGIC {
        unpack(Archive::new(GzDecoder::new(reader)), dest, whiteouts)
    } else if read == 4 && magic == ZSTD_MAGIC {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "zstd-compressed layers are not supported",
        ))
    } else {
        unpack(Archive::new(reader), dest, whiteouts)
    }
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match file.read(&mut buf[n..])? {
            0 => break,
            m => n += m,
        }
    }
    Ok(n)
}

fn unpack<R: Read>(mut archive: Archive<R>, dest: &Path, whiteouts: Whiteouts) -> io::Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);
    archive.set_preserve_ownerships(nix::unistd::geteuid().is_root());

    fs::create_dir_all(dest)?;
    let root = dest.canonicalize()?;
    // Paths this layer has written; an opaque marker only hides lower layers.
    let mut written = HashSet::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();

        let Some(path) = relative(&raw) else {
            warn!(path = %raw.display(), "Skipping path with parent directory");
            continue;
        };

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        if file_name == OPAQUE_WHITEOUT {
            let dir = match path.parent() {
                Some(parent) => root.join(parent),
                None => root.clone(),
            };
            if !inside(&root, &dir) {
                warn!(path = %raw.display(), "Skipping whiteout outside the root");
                continue;
            }
            match whiteouts {
                Whiteouts::Apply => clear_dir(&dir, &written)?,
                Whiteouts::Overlay => {
                    fs::create_dir_all(&dir)?;
                    xattr::set(&dir, OVERLAY_OPAQUE_XATTR, b"y")?;
                }
            }
            continue;
        }

        if let Some(target_name) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            if matches!(target_name, "" | "." | "..") {
                warn!(path = %raw.display(), "Skipping whiteout without a target");
                continue;
            }
            let parent = match path.parent() {
                Some(parent) => root.join(parent),
                None => root.clone(),
            };
            if !inside(&root, &parent) {
                warn!(path = %raw.display(), "Skipping whiteout outside the root");
                continue;
            }
            let target = parent.join(target_name);
            match whiteouts {
                Whiteouts::Apply => remove_path(&target)?,
                Whiteouts::Overlay => {
                    fs::create_dir_all(&parent)?;
                    remove_path(&target)?;
                    make_whiteout(&target)?;
                }
            }
            continue;
        }

        // unpack_in refuses entries that would land outside `root`, including
        // through symlinks created by earlier entries.
        if entry.unpack_in(&root)? {
            let full = root.join(&path);
            for ancestor in full.ancestors().take_while(|a| *a != root.as_path()) {
                if !written.insert(ancestor.to_path_buf()) {
                    break;
                }
            }
        } else {
            debug!(path = %raw.display(), "Entry skipped by tar");
        }
    }

    Ok(())
}

/// `path` with root and `.` components dropped, or `None` if it climbs out
/// with `..`.
fn relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    Some(out)
}

/// Whether `path`, with symlinks resolved, stays under `root`. Paths that
/// don't exist yet are judged by their nearest existing ancestor.
fn inside(root: &Path, path: &Path) -> bool {
    let mut nearest = path;
    loop {
        match nearest.canonicalize() {
            Ok(resolved) => return resolved.starts_with(root),
            Err(_) => match nearest.parent() {
                Some(parent) => nearest = parent,
                None => return false,
            },
        }
    }
}

/// Empty `dir` of everything not in `keep`. Kept directories are cleared
/// recursively, since they may hold lower-layer entries too.
fn clear_dir(dir: &Path, keep: &HashSet<PathBuf>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !keep.contains(&path) {
            remove_path(&path)?;
        } else if entry.file_type()?.is_dir() {
            clear_dir(&path, keep)?;
        }
    }
    Ok(())
}

/// Remove a file, symlink or directory tree. Missing paths are fine.
pub(crate) fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Create an overlayfs whiteout: a 0/0 character device.
#[cfg(target_os = "linux")]
pub(crate) fn make_whiteout(path: &Path) -> io::Result<()> {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    mknod(path, SFlag::S_IFCHR, Mode::empty(), makedev(0, 0)).map_err(io::Error::from)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn make_whiteout(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "overlay whiteouts require Linux",
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    /// Build a tar layer from `(path, contents)` pairs. A `None` body makes a
    /// directory.
    pub(crate) fn tar_layer(entries: &[(&str, Option<&str>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, body) in entries {
            let mut header = tar::Header::new_gnu();
            match body {
                Some(data) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(data.len() as u64);
                    header.set_mode(0o755);
                    header.set_uid(0);
                    header.set_gid(0);
                    header.set_mtime(0);
                    builder.append_data(&mut header, path, data.as_bytes()).unwrap();
                }
                None => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_uid(0);
                    header.set_gid(0);
                    header.set_mtime(0);
                    builder.append_data(&mut header, path, std::io::empty()).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn write_layer(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_extract_plain_and_gzip() {
        let tmp = tempfile::tempdir().unwrap();
        let tar = tar_layer(&[("etc", None), ("etc/hostname", Some("fn"))]);
        let plain = write_layer(tmp.path(), "plain", &tar);
        let gz = write_layer(tmp.path(), "gz", &gzip(&tar));

        for layer in [plain, gz] {
            let dest = tempfile::tempdir().unwrap();
            extract_layer(&layer, dest.path(), Whiteouts::Apply).unwrap();
            assert_eq!(fs::read(dest.path().join("etc/hostname")).unwrap(), b"fn");
        }
    }

    #[test]
    fn test_apply_whiteouts() {
        let tmp = tempfile::tempdir().unwrap();
        let base = write_layer(
            tmp.path(),
            "base",
            &tar_layer(&[
                ("a.txt", Some("a")),
                ("b.txt", Some("b")),
                ("dir", None),
                ("dir/x", Some("x")),
                ("dir/y", Some("y")),
            ]),
        );
        let top = write_layer(
            tmp.path(),
            "top",
            &tar_layer(&[
                (".wh.a.txt", Some("")),
                ("dir/z", Some("z")),
                ("dir/.wh..wh..opq", Some("")),
            ]),
        );

        let dest = tempfile::tempdir().unwrap();
        extract_layer(&base, dest.path(), Whiteouts::Apply).unwrap();
        extract_layer(&top, dest.path(), Whiteouts::Apply).unwrap();

        assert!(!dest.path().join("a.txt").exists());
        assert!(!dest.path().join(".wh.a.txt").exists());
        assert!(dest.path().join("b.txt").exists());
        assert!(!dest.path().join("dir/x").exists());
        assert!(!dest.path().join("dir/y").exists());
        assert_eq!(fs::read(dest.path().join("dir/z")).unwrap(), b"z");
    }

    #[test]
    fn test_opaque_keeps_implicit_parents_from_same_layer() {
        let tmp = tempfile::tempdir().unwrap();
        let base = write_layer(
            tmp.path(),
            "base",
            &tar_layer(&[
                ("dir", None),
                ("dir/old", Some("old")),
                ("dir/sub", None),
                ("dir/sub/lower", Some("lower")),
            ]),
        );
        let top = write_layer(
            tmp.path(),
            "top",
            &tar_layer(&[("dir/sub/file", Some("new")), ("dir/.wh..wh..opq", Some(""))]),
        );

        let dest = tempfile::tempdir().unwrap();
        extract_layer(&base, dest.path(), Whiteouts::Apply).unwrap();
        extract_layer(&top, dest.path(), Whiteouts::Apply).unwrap();

        assert_eq!(fs::read(dest.path().join("dir/sub/file")).unwrap(), b"new");
        assert!(!dest.path().join("dir/old").exists());
        assert!(!dest.path().join("dir/sub/lower").exists());
    }

    #[test]
    fn test_whiteout_without_target_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let base = write_layer(
            tmp.path(),
            "base",
            &tar_layer(&[("keep", Some("k")), ("dir", None), ("dir/keep", Some("k"))]),
        );
        let top = write_layer(
            tmp.path(),
            "top",
            &tar_layer(&[(".wh.", Some("")), ("dir/.wh..", Some(""))]),
        );

        let dest = tempfile::tempdir().unwrap();
        extract_layer(&base, dest.path(), Whiteouts::Apply).unwrap();
        extract_layer(&top, dest.path(), Whiteouts::Apply).unwrap();

        assert!(dest.path().join("keep").exists());
        assert!(dest.path().join("dir/keep").exists());
    }

    #[test]
    fn test_rejects_zstd() {
        let tmp = tempfile::tempdir().unwrap();
        let layer = write_layer(tmp.path(), "zst", &[0x28, 0xb5, 0x2f, 0xfd, 0, 0]);
        let dest = tempfile::tempdir().unwrap();
        let err = extract_layer(&layer, dest.path(), Whiteouts::Apply).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_relative_paths() {
        assert_eq!(relative(Path::new("/etc/passwd")), Some(PathBuf::from("etc/passwd")));
        assert_eq!(relative(Path::new("./bin/sh")), Some(PathBuf::from("bin/sh")));
        assert_eq!(relative(Path::new("a/../../etc")), None);
    }

    #[test]
    fn test_whiteout_through_symlink_stays_inside() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("victim"), b"keep").unwrap();

        let dest = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dest.path().join("escape")).unwrap();

        let layer = write_layer(
            tmp.path(),
            "evil",
            &tar_layer(&[("escape/.wh.victim", Some(""))]),
        );
        extract_layer(&layer, dest.path(), Whiteouts::Apply).unwrap();
        assert!(outside.path().join("victim").exists());
    }
}
