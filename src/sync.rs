// Bidirectional host <-> guest directory synchronization, keyed off the high
// byte of each file's V6 modtime. Files the guest touched come down; newer
// host files go up, either straight through the filesystem engine or by
// driving the guest shell over the TTY.

use crate::terminal::Terminal;
use crate::v6fs::{FsError, INode, V6FileSystem, CREATED_STAMP, SYNCED_STAMP};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{TimeZone, UTC};
use log::{debug, info};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

const TMP_FILENAME: &str = "tmp.b64";
const TIME_DELTA: i64 = 60;
// constant skew observed between host stat times and the guest clock
const TIME_ERROR_S: i64 = 47;
const TZ_OFFSET: i64 = 18000;

struct UItem {
    name: String,
    path: String,
    is_dir: bool,
    node: INode,
}

struct LItem {
    name: String,
    path: PathBuf,
    is_dir: bool,
}

fn unix_join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn mtime_secs(path: &Path) -> Result<i64, FsError> {
    let t = fs::metadata(path)?.modified()?;
    Ok(t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0) as i64)
}

fn set_file_times(path: &Path, actime: i64, modtime: i64) -> io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in path"))?;
    let buf = libc::utimbuf { actime, modtime };
    if unsafe { libc::utime(cpath.as_ptr(), &buf) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The modtime stamp for a freshly synced file. Host mtimes that do not
/// fall on a minute are truncated to one so later comparisons agree.
pub fn synctime(path: &Path) -> Result<u32, FsError> {
    let mut lmtime = mtime_secs(path)?;
    if lmtime % 60 != 0 {
        let latime = fs::metadata(path)?
            .accessed()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0) as i64;
        lmtime -= lmtime % 60;
        set_file_times(path, latime, lmtime)?;
    }
    Ok(SYNCED_STAMP | (lmtime as u32 & 0xFFFFFF))
}

/// Set a guest file's modtime through the shell: wind the guest clock to
/// the stamp, then touch.
pub fn mark_synced_via_terminal(local: &Path, unix_fn: &str, term: &Terminal) -> Result<(), FsError> {
    let modtime = synctime(local)?;
    let stamp = UTC.timestamp(modtime as i64 - TZ_OFFSET, 0);
    term.command_wait(&format!("date {}", stamp.format("%m%d%H%M%y")));
    term.command_wait(&format!("touch \"{}\"", unix_fn));
    Ok(())
}

/// Recreate a host file inside the live guest with echo lines, falling back
/// to base64 when the content will not survive shell quoting.
pub fn upload_via_terminal(src: &Path, dst: &str, term: &Terminal) -> Result<(), FsError> {
    let contents = fs::read(src)?;
    let lines: Vec<&[u8]> = contents.split(|&b| b == b'\n').collect();
    let max_len = 255usize.saturating_sub(" echo \"\" >> \n".len() + dst.len());
    let allowed = |b: u8| {
        b.is_ascii_alphanumeric() || b" .,;:\"'`+-*/%=!?~$^&|\\()[]{}<>\n".contains(&b)
    };
    let text_file = contents.last() == Some(&b'\n')
        && lines.iter().all(|l| l.len() <= max_len)
        && !lines.iter().any(|l| l.contains(&b'\'') && l.contains(&b'"'))
        && contents.iter().copied().all(allowed);

    let send: Vec<Vec<u8>> = if text_file {
        lines[..lines.len() - 1].iter().map(|l| l.to_vec()).collect()
    } else {
        BASE64
            .encode(&contents)
            .into_bytes()
            .chunks(64)
            .map(|c| c.to_vec())
            .collect()
    };

    let mut first = true;
    for line in &send {
        let q = if line.contains(&b'"') { '\'' } else { '"' };
        term.command_wait(&format!(
            "echo {q}{line}{q} {arrow} {file}",
            q = q,
            line = String::from_utf8_lossy(line),
            arrow = if first { ">" } else { ">>" },
            file = if text_file { dst } else { TMP_FILENAME },
        ));
        first = false;
    }
    if !text_file && !send.is_empty() {
        term.command_wait(&format!("base64 -D -i \"{}\" -o \"{}\"", TMP_FILENAME, dst));
    }
    mark_synced_via_terminal(src, dst, term)
}

fn download(
    fs_: &mut V6FileSystem,
    item: &UItem,
    local_dir: &Path,
    terminal: Option<&Terminal>,
    via_terminal: &mut bool,
) -> Result<(), FsError> {
    info!("DOWNLOAD: {} into {}", item.path, local_dir.display());
    let local_fn = local_dir.join(&item.name);
    fs_.download_file(&item.node, &local_fn)?;
    match terminal {
        Some(t) if t.prompt_count() > 0 => {
            *via_terminal = true;
            mark_synced_via_terminal(&local_fn, &item.path, t)?;
        }
        _ => {
            let mut node = item.node.clone();
            node.modtime = synctime(&local_fn)?;
            fs_.write_i_node(&node)?;
        }
    }
    Ok(())
}

fn upload(
    fs_: &mut V6FileSystem,
    item: &LItem,
    unix_dir: &str,
    terminal: Option<&Terminal>,
    via_terminal: &mut bool,
) -> Result<(), FsError> {
    info!("UPLOAD: {} into {}", item.path.display(), unix_dir);
    let dst = unix_join(unix_dir, &item.name);
    match terminal {
        Some(t) if t.prompt_count() > 0 => {
            *via_terminal = true;
            upload_via_terminal(&item.path, &dst, t)?;
        }
        _ => {
            let mut node = fs_.upload_file(&item.path, &dst)?;
            node.modtime = synctime(&item.path)?;
            fs_.write_i_node(&node)?;
        }
    }
    Ok(())
}

/// Synchronize a guest directory with a host directory, recursing into
/// matching subdirectories. Returns the number of entries walked.
pub fn sync_dirs(
    fs_: &mut V6FileSystem,
    unix_dir: &str,
    local_dir: &Path,
    terminal: Option<&Terminal>,
) -> Result<usize, FsError> {
    let (cnt, via_terminal) = sync_inner(fs_, unix_dir, local_dir, terminal, true)?;
    if let Some(t) = terminal {
        if via_terminal {
            t.command_wait(&format!("rm \"{}\" 2>/dev/null", TMP_FILENAME));
            t.command_wait("sync");
        }
    }
    Ok(cnt)
}

fn sync_inner(
    fs_: &mut V6FileSystem,
    unix_dir: &str,
    local_dir: &Path,
    terminal: Option<&Terminal>,
    _root: bool,
) -> Result<(usize, bool), FsError> {
    let dnode = fs_
        .path_i_node(unix_dir)?
        .ok_or_else(|| FsError::Sync(format!("\"{}\" not found in filesystem", unix_dir)))?;
    if !dnode.is_dir() {
        return Err(FsError::Sync(format!("\"{}\" is not a directory", unix_dir)));
    }
    if !local_dir.exists() {
        info!("creating: {}", local_dir.display());
        fs::create_dir(local_dir)?;
    } else if !local_dir.is_dir() {
        return Err(FsError::Sync(format!("local directory \"{}\" not found", local_dir.display())));
    }

    let mut ufs: Vec<UItem> = Vec::new();
    for (inum, name) in fs_.list_dir(&dnode)? {
        if name.starts_with('.') {
            continue;
        }
        let node = fs_.read_i_node(inum)?;
        ufs.push(UItem { path: unix_join(unix_dir, &name), is_dir: node.is_dir(), node, name });
    }
    ufs.sort_by(|a, b| a.name.cmp(&b.name));

    let mut lfs: Vec<LItem> = Vec::new();
    for entry in fs::read_dir(local_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        lfs.push(LItem { is_dir: entry.file_type()?.is_dir(), path: entry.path(), name });
    }
    lfs.sort_by(|a, b| a.name.cmp(&b.name));

    let mut via_terminal = false;
    let mut sync_subdirs: Vec<(String, PathBuf)> = Vec::new();
    let (mut ui, mut li, mut cnt) = (0, 0, 0);
    while ui < ufs.len() && li < lfs.len() {
        let u = &ufs[ui];
        let l = &lfs[li];
        if u.name == l.name {
            if u.is_dir != l.is_dir {
                return Err(FsError::Sync(format!(
                    "type mismatch: {} and {}",
                    u.path,
                    l.path.display()
                )));
            }
            if u.is_dir {
                sync_subdirs.push((u.path.clone(), l.path.clone()));
            } else {
                let umtime = u.node.modtime;
                let lmtime = mtime_secs(&l.path)?;
                let stamp = umtime & 0xFF00_0000;
                if stamp != CREATED_STAMP && stamp != SYNCED_STAMP {
                    // the guest modified it; the host copy is stale
                    download(fs_, u, local_dir, terminal, &mut via_terminal)?;
                } else if ((umtime as i64 & 0xFFFFFF) - (lmtime & 0xFFFFFF) + TIME_ERROR_S).abs()
                    > TIME_DELTA
                {
                    debug!(
                        "time difference {}",
                        (umtime as i64 & 0xFFFFFF) - (lmtime & 0xFFFFFF)
                    );
                    upload(fs_, l, unix_dir, terminal, &mut via_terminal)?;
                }
            }
            ui += 1;
            li += 1;
        } else if u.name < l.name {
            if u.is_dir {
                sync_subdirs.push((u.path.clone(), local_dir.join(&u.name)));
            } else {
                download(fs_, u, local_dir, terminal, &mut via_terminal)?;
            }
            ui += 1;
        } else {
            if l.is_dir {
                sync_subdirs.push((unix_join(unix_dir, &l.name), l.path.clone()));
            } else {
                upload(fs_, l, unix_dir, terminal, &mut via_terminal)?;
            }
            li += 1;
        }
        cnt += 1;
    }
    while ui < ufs.len() {
        let u = &ufs[ui];
        if u.is_dir {
            sync_subdirs.push((u.path.clone(), local_dir.join(&u.name)));
        } else {
            download(fs_, u, local_dir, terminal, &mut via_terminal)?;
        }
        ui += 1;
        cnt += 1;
    }
    while li < lfs.len() {
        let l = &lfs[li];
        if l.is_dir {
            sync_subdirs.push((unix_join(unix_dir, &l.name), l.path.clone()));
        } else {
            upload(fs_, l, unix_dir, terminal, &mut via_terminal)?;
        }
        li += 1;
        cnt += 1;
    }

    for (udir, ldir) in sync_subdirs {
        let (c, via) = sync_inner(fs_, &udir, &ldir, terminal, false)?;
        cnt += c;
        via_terminal = via_terminal || via;
    }
    Ok((cnt, via_terminal))
}

/// Synchronize against the live machine: flush the guest's buffers, work on
/// a snapshot of the disk, and swap the result in only when no system is
/// running.
pub fn sync_disk(
    disk: &Arc<Mutex<Vec<u8>>>,
    unix_dir: &str,
    local_dir: &Path,
    terminal: &Terminal,
) -> Result<usize, FsError> {
    if terminal.prompt_count() > 0 {
        terminal.command_wait("sync");
    }
    let snapshot = disk.lock().unwrap().clone();
    let mut fs_ = V6FileSystem::new(snapshot.clone());
    let cnt = sync_dirs(&mut fs_, unix_dir, local_dir, Some(terminal))?;
    if terminal.prompt_count() == 0 && fs_.disk != snapshot {
        *disk.lock().unwrap() = fs_.disk;
        debug!("disk image replaced with the synced one");
    }
    info!("guest directory {} synced with {}", unix_dir, local_dir.display());
    Ok(cnt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v6fs::test_image;

    #[test]
    fn upload_stamps_synced_modtime() {
        let mut fs_ = test_image();
        fs_.mkdir("/tmp").unwrap();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), b"abc\n").unwrap();
        sync_dirs(&mut fs_, "/tmp", dir.path(), None).unwrap();
        let node = fs_.path_i_node("/tmp/hello.txt").unwrap().unwrap();
        assert_eq!(fs_.read_file(&node).unwrap(), b"abc\n");
        assert_eq!(node.modtime >> 24, 0x15);
    }

    #[test]
    fn second_sync_is_a_no_op() {
        let mut fs_ = test_image();
        fs_.mkdir("/tmp").unwrap();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), b"abc\n").unwrap();
        sync_dirs(&mut fs_, "/tmp", dir.path(), None).unwrap();
        let before = fs_.disk.clone();
        sync_dirs(&mut fs_, "/tmp", dir.path(), None).unwrap();
        assert_eq!(before, fs_.disk);
    }

    #[test]
    fn guest_only_file_downloads() {
        let mut fs_ = test_image();
        fs_.mkdir("/tmp").unwrap();
        let f = tempfile::NamedTempFile::new().unwrap();
        fs::write(f.path(), b"from the guest\n").unwrap();
        fs_.upload_file(f.path(), "/tmp/guest.txt").unwrap();
        let dir = tempfile::tempdir().unwrap();
        sync_dirs(&mut fs_, "/tmp", dir.path(), None).unwrap();
        assert_eq!(fs::read(dir.path().join("guest.txt")).unwrap(), b"from the guest\n");
        // the download restamped the guest copy as synced
        let node = fs_.path_i_node("/tmp/guest.txt").unwrap().unwrap();
        assert_eq!(node.modtime >> 24, 0x15);
    }

    #[test]
    fn subdirectories_recurse() {
        let mut fs_ = test_image();
        fs_.mkdir("/tmp").unwrap();
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner.txt"), b"deep\n").unwrap();
        sync_dirs(&mut fs_, "/tmp", dir.path(), None).unwrap();
        let node = fs_.path_i_node("/tmp/sub/inner.txt").unwrap().unwrap();
        assert_eq!(fs_.read_file(&node).unwrap(), b"deep\n");
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let mut fs_ = test_image();
        fs_.mkdir("/tmp").unwrap();
        fs_.mkdir("/tmp/x").unwrap();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x"), b"not a dir").unwrap();
        assert!(matches!(
            sync_dirs(&mut fs_, "/tmp", dir.path(), None),
            Err(FsError::Sync(_))
        ));
    }

    #[test]
    fn dot_files_are_ignored() {
        let mut fs_ = test_image();
        fs_.mkdir("/tmp").unwrap();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".hidden"), b"shh").unwrap();
        sync_dirs(&mut fs_, "/tmp", dir.path(), None).unwrap();
        assert!(!fs_.path_exists("/tmp/.hidden").unwrap());
    }
}
