use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyStatfs, ReplyXattr, Request,
};
use log::{debug, warn};
use reqwest::StatusCode;
use serde::Serialize;

use crate::cache::{BlobCache, DirectoryCache, MemoryCache};
use crate::config::{Config, MEMORY_CACHE_TYPE};
use crate::error::{Result, SnapshotError};
use crate::remote::{RemoteBlob, Resolver, Transport};
use crate::stargz::{Archive, EntryKind, Node, PREFETCH_LANDMARK};
use crate::task::BackgroundTaskManager;

/// Labels carrying the image reference and layer digest down from the
/// snapshotter to the filesystem plugin.
pub const TARGET_REF_LABEL: &str = "containerd.io/snapshot/remote/stargz.reference";
pub const TARGET_DIGEST_LABEL: &str = "containerd.io/snapshot/remote/stargz.digest";

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";
const OPAQUE_XATTR: &str = "trusted.overlay.opaque";
const OPAQUE_XATTR_VALUE: &[u8] = b"y";
const STATE_DIR_NAME: &str = ".stargz-snapshotter";

const BLOCK_SIZE: u32 = 512;
const TTL: Duration = Duration::from_secs(1);

/// Synthesized nodes live in an inode range disjoint from TOC entries.
const STATE_DIR_INO: u64 = 1 << 62;
const STATE_FILE_INO: u64 = STATE_DIR_INO + 1;

const BACKGROUND_WORKERS: usize = 2;
const QUIESCENCE: Duration = Duration::from_secs(5);

/// A mountable remote-layer filesystem. The snapshotter walks an ordered
/// chain of these when preparing remote snapshots.
pub trait FileSystem: Send + Sync {
    fn mount(&self, mountpoint: &Path, labels: &HashMap<String, String>) -> Result<()>;
    fn check(&self, mountpoint: &Path) -> Result<()>;
    fn unmount(&self, mountpoint: &Path) -> Result<()>;
}

/// Per-layer status surfaced through `.stargz-snapshotter/<digest>.json`.
/// The JSON body is regenerated from the live fetched-bytes counter on
/// every read; the error field keeps the most recent read-path failure.
pub struct LayerState {
    digest: String,
    size: u64,
    remote: Arc<RemoteBlob>,
    error: Mutex<String>,
}

#[derive(Serialize)]
struct StatJson<'a> {
    digest: &'a str,
    size: u64,
    #[serde(rename = "fetchedSize")]
    fetched_size: u64,
    #[serde(rename = "fetchedPercent")]
    fetched_percent: f64,
    #[serde(skip_serializing_if = "str::is_empty")]
    error: &'a str,
}

impl LayerState {
    pub fn new(digest: &str, size: u64, remote: Arc<RemoteBlob>) -> Self {
        Self {
            digest: digest.to_string(),
            size,
            remote,
            error: Mutex::new(String::new()),
        }
    }

    pub fn report(&self, err: &SnapshotError) {
        *self.error.lock().unwrap() = err.to_string();
    }

    fn file_name(&self) -> String {
        format!("{}.json", self.digest)
    }

    fn render(&self) -> Vec<u8> {
        let fetched = self.remote.fetched_size();
        let percent = if self.size == 0 {
            0.0
        } else {
            fetched as f64 * 100.0 / self.size as f64
        };
        let error = self.error.lock().unwrap();
        let stat = StatJson {
            digest: &self.digest,
            size: self.size,
            fetched_size: fetched,
            fetched_percent: percent,
            error: &error,
        };
        let mut body = serde_json::to_vec(&stat).unwrap_or_default();
        body.push(b'\n');
        body
    }
}

/// Result of resolving a name within a directory, following the whiteout
/// and state-directory presentation rules.
enum Resolved {
    Entry(usize),
    Whiteout(usize),
    StateDir,
    NotFound,
}

/// FUSE view of one mounted layer.
pub struct StargzLayer {
    archive: Arc<Archive>,
    state: Arc<LayerState>,
    tasks: Arc<BackgroundTaskManager>,
}

impl StargzLayer {
    fn new(archive: Arc<Archive>, state: Arc<LayerState>) -> Self {
        let tasks = Arc::clone(archive.remote().tasks());
        Self {
            archive,
            state,
            tasks,
        }
    }

    fn ino_of(&self, idx: usize) -> u64 {
        idx as u64 + 1
    }

    fn idx_of(&self, ino: u64) -> Option<usize> {
        if ino == 0 || ino >= STATE_DIR_INO {
            return None;
        }
        let idx = (ino - 1) as usize;
        (idx < self.archive.node_count()).then_some(idx)
    }

    fn node(&self, ino: u64) -> Option<&Node> {
        self.archive.node(self.idx_of(ino)?)
    }

    /// Presentation attribute for a TOC entry. Entries named `.wh.*` are
    /// never exposed under their own name; when their inode is visible at
    /// all it stands for the synthesized overlayfs whiteout device.
    fn attr_of(&self, idx: usize) -> FileAttr {
        let node = self.archive.node(idx).expect("interned index");
        if node.name.starts_with(WHITEOUT_PREFIX) {
            return self.whiteout_attr(idx);
        }
        let size = node.size;
        FileAttr {
            ino: self.ino_of(idx),
            size,
            blocks: size.div_ceil(BLOCK_SIZE as u64),
            atime: systime(node.mtime),
            mtime: systime(node.mtime),
            ctime: systime(node.mtime),
            crtime: systime(node.mtime),
            kind: file_type(node.kind),
            perm: (node.mode & 0o7777) as u16,
            nlink: node.nlink.max(1),
            uid: node.uid,
            gid: node.gid,
            rdev: nix::sys::stat::makedev(node.dev_major as u64, node.dev_minor as u64) as u32,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Overlayfs-compliant whiteout: a character device with device
    /// number 0:0, owned by root.
    fn whiteout_attr(&self, idx: usize) -> FileAttr {
        let node = self.archive.node(idx).expect("interned index");
        FileAttr {
            ino: self.ino_of(idx),
            size: 0,
            blocks: 0,
            atime: systime(node.mtime),
            mtime: systime(node.mtime),
            ctime: systime(node.mtime),
            crtime: systime(node.mtime),
            kind: FileType::CharDevice,
            perm: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn state_dir_attr(&self) -> FileAttr {
        synthesized_attr(STATE_DIR_INO, 0, FileType::Directory, 0o500)
    }

    fn state_file_attr(&self) -> FileAttr {
        let len = self.state.render().len() as u64;
        synthesized_attr(STATE_FILE_INO, len, FileType::RegularFile, 0o400)
    }

    /// Builds the visible listing of a directory: landmark and opaque
    /// markers are dropped, `.wh.<x>` children become whiteout devices
    /// named `<x>` unless a real `<x>` exists, and the root gains the
    /// state directory. Sorted by name.
    fn dir_entries(&self, idx: usize) -> Vec<(u64, FileType, String)> {
        let node = self.archive.node(idx).expect("interned index");
        let is_root = idx == self.archive.root();
        let mut entries: Vec<(u64, FileType, String)> = Vec::new();
        let mut whiteouts: Vec<(u64, String)> = Vec::new();
        for (name, child_idx) in node.children() {
            if is_root && name == PREFETCH_LANDMARK {
                continue;
            }
            if let Some(stripped) = name.strip_prefix(WHITEOUT_PREFIX) {
                if name != WHITEOUT_OPAQUE_DIR {
                    whiteouts.push((self.ino_of(child_idx), stripped.to_string()));
                }
                continue;
            }
            let child = self.archive.node(child_idx).expect("interned index");
            entries.push((self.ino_of(child_idx), file_type(child.kind), name.to_string()));
        }
        for (ino, name) in whiteouts {
            if node.child(&name).is_none() {
                entries.push((ino, FileType::CharDevice, name));
            }
        }
        if is_root {
            entries.push((STATE_DIR_INO, FileType::Directory, STATE_DIR_NAME.to_string()));
        }
        entries.sort_by(|a, b| a.2.cmp(&b.2));
        entries
    }

    /// Mirror of the listing rules for a single name.
    fn resolve_child(&self, idx: usize, name: &str) -> Resolved {
        let is_root = idx == self.archive.root();
        if is_root && name == PREFETCH_LANDMARK {
            return Resolved::NotFound;
        }
        if name.starts_with(WHITEOUT_PREFIX) {
            return Resolved::NotFound;
        }
        if is_root && name == STATE_DIR_NAME {
            return Resolved::StateDir;
        }
        let node = match self.archive.node(idx) {
            Some(n) => n,
            None => return Resolved::NotFound,
        };
        if let Some(child) = node.child(name) {
            return Resolved::Entry(child);
        }
        if let Some(wh) = node.child(&format!("{WHITEOUT_PREFIX}{name}")) {
            return Resolved::Whiteout(wh);
        }
        Resolved::NotFound
    }

    fn xattr_of(&self, idx: usize, name: &str) -> Option<Vec<u8>> {
        let node = self.archive.node(idx)?;
        if name == OPAQUE_XATTR && node.opaque {
            return Some(OPAQUE_XATTR_VALUE.to_vec());
        }
        node.xattrs.get(name).cloned()
    }

    fn xattr_names(&self, idx: usize) -> Vec<String> {
        let Some(node) = self.archive.node(idx) else {
            return Vec::new();
        };
        let mut names = Vec::new();
        if node.opaque {
            names.push(OPAQUE_XATTR.to_string());
        }
        names.extend(node.xattrs.keys().cloned());
        names
    }
}

/// Permission check for a 3-bit access mask against an entry's mode,
/// selecting the owner/group/other field by uid/gid match. Root may do
/// anything; a mask of zero requires nothing.
fn allowed(mask: i32, uid: u32, gid: u32, node_uid: u32, node_gid: u32, mode: u32) -> bool {
    if uid == 0 {
        return true;
    }
    if mask == 0 {
        return true;
    }
    let shift = if uid == node_uid {
        6
    } else if gid == node_gid {
        3
    } else {
        0
    };
    (mask as u32) << shift & mode != 0
}

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Dir => FileType::Directory,
        EntryKind::Reg => FileType::RegularFile,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::Char => FileType::CharDevice,
        EntryKind::Block => FileType::BlockDevice,
        EntryKind::Fifo => FileType::NamedPipe,
    }
}

fn systime(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn synthesized_attr(ino: u64, size: u64, kind: FileType, perm: u16) -> FileAttr {
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(BLOCK_SIZE as u64),
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind,
        perm,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn reply_xattr(reply: ReplyXattr, data: &[u8], size: u32) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() > size as usize {
        reply.error(libc::ERANGE);
    } else {
        reply.data(data);
    }
}

impl Filesystem for StargzLayer {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        if parent == STATE_DIR_INO {
            if name == self.state.file_name() {
                reply.entry(&TTL, &self.state_file_attr(), 0);
            } else {
                reply.error(libc::ENOENT);
            }
            return;
        }
        let Some(idx) = self.idx_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.resolve_child(idx, name) {
            Resolved::Entry(child) => reply.entry(&TTL, &self.attr_of(child), 0),
            Resolved::Whiteout(wh) => reply.entry(&TTL, &self.whiteout_attr(wh), 0),
            Resolved::StateDir => reply.entry(&TTL, &self.state_dir_attr(), 0),
            Resolved::NotFound => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match ino {
            STATE_DIR_INO => reply.attr(&TTL, &self.state_dir_attr()),
            STATE_FILE_INO => reply.attr(&TTL, &self.state_file_attr()),
            _ => match self.idx_of(ino) {
                Some(idx) => reply.attr(&TTL, &self.attr_of(idx)),
                None => reply.error(libc::ENOENT),
            },
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = if ino == STATE_DIR_INO {
            vec![(
                STATE_FILE_INO,
                FileType::RegularFile,
                self.state.file_name(),
            )]
        } else {
            let Some(idx) = self.idx_of(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            self.dir_entries(idx)
        };
        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, i as i64 + 1, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if ino == STATE_FILE_INO {
            let body = self.state.render();
            let start = (offset as usize).min(body.len());
            let end = (start + size as usize).min(body.len());
            reply.data(&body[start..end]);
            return;
        }
        let Some(idx) = self.idx_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        // On-demand reads preempt the background fetchers for their
        // whole duration.
        let _prioritized = self.tasks.prioritized();
        let mut buf = vec![0u8; size as usize];
        match self.archive.read_file_at(idx, &mut buf, offset as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => {
                warn!("failed to read inode {ino} at {offset}: {e}");
                self.state.report(&e);
                reply.error(libc::EIO);
            }
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.node(ino) {
            Some(node) if node.kind == EntryKind::Symlink => {
                reply.data(node.link_name.as_bytes())
            }
            Some(_) => reply.error(libc::EINVAL),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENODATA);
            return;
        };
        let Some(idx) = self.idx_of(ino) else {
            reply.error(libc::ENODATA);
            return;
        };
        match self.xattr_of(idx, name) {
            Some(value) => reply_xattr(reply, &value, size),
            None => reply.error(libc::ENODATA),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(idx) = self.idx_of(ino) else {
            reply_xattr(reply, &[], size);
            return;
        };
        let mut data = Vec::new();
        for name in self.xattr_names(idx) {
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }
        reply_xattr(reply, &data, size);
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let (node_uid, node_gid, mode) = match ino {
            STATE_DIR_INO => (0, 0, 0o500),
            STATE_FILE_INO => (0, 0, 0o400),
            _ => match self.node(ino) {
                Some(node) => (node.uid, node.gid, node.mode & 0o7777),
                None => {
                    reply.error(libc::ENOENT);
                    return;
                }
            },
        };
        if allowed(mask, req.uid(), req.gid(), node_uid, node_gid, mode) {
            reply.ok();
        } else {
            reply.error(libc::EPERM);
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // The lazy read-only tree has no meaningful usage accounting.
        reply.statfs(0, 0, 0, 0, 0, BLOCK_SIZE, u32::MAX, BLOCK_SIZE);
    }
}

/// Liveness record for one mounted layer. Dropping the record drops the
/// FUSE session handle, which tears the kernel mount down.
struct Connection {
    url: String,
    transport: Transport,
    last_check: Instant,
    session: Option<fuser::BackgroundSession>,
}

/// The stargz filesystem plugin: resolves layers, constructs the remote
/// reader / archive / FUSE chain and tracks live mounts.
pub struct StargzFs {
    chunk_size: u64,
    layer_valid_interval: Duration,
    noprefetch: bool,
    default_prefetch_size: u64,
    http_cache: Arc<dyn BlobCache>,
    fs_cache: Arc<dyn BlobCache>,
    resolver: Resolver,
    tasks: Arc<BackgroundTaskManager>,
    connections: Mutex<HashMap<PathBuf, Connection>>,
}

fn build_cache(kind: &str, dir: PathBuf, max_entries: usize) -> Result<Arc<dyn BlobCache>> {
    if kind == MEMORY_CACHE_TYPE {
        Ok(Arc::new(MemoryCache::new(max_entries)?))
    } else {
        Ok(Arc::new(DirectoryCache::new(&dir, max_entries)?))
    }
}

impl StargzFs {
    pub fn new(root: &Path, config: &Config) -> Result<Self> {
        let max_entries = config.lru_max_entry();
        Ok(Self {
            chunk_size: config.chunk_size(),
            layer_valid_interval: config.layer_valid_interval(),
            noprefetch: config.noprefetch,
            default_prefetch_size: config.default_prefetch_size,
            http_cache: build_cache(&config.http_cache_type, root.join("httpcache"), max_entries)?,
            fs_cache: build_cache(
                &config.filesystem_cache_type,
                root.join("fscache"),
                max_entries,
            )?,
            resolver: Resolver::new(&config.insecure)?,
            tasks: Arc::new(BackgroundTaskManager::new(BACKGROUND_WORKERS, QUIESCENCE)),
            connections: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

impl FileSystem for StargzFs {
    fn mount(&self, mountpoint: &Path, labels: &HashMap<String, String>) -> Result<()> {
        // Mount is a prioritized task so background fetches of other
        // layers do not compete for the registry while it runs.
        let _prioritized = self.tasks.prioritized();

        let reference = labels.get(TARGET_REF_LABEL).ok_or_else(|| {
            SnapshotError::InvalidArgument("reference hasn't been passed".into())
        })?;
        let digest = labels.get(TARGET_DIGEST_LABEL).ok_or_else(|| {
            SnapshotError::InvalidArgument("digest hasn't been passed".into())
        })?;

        let (url, transport) = self.resolver.resolve(reference, digest)?;
        let size = transport.head_size(&url)?;

        let remote = Arc::new(RemoteBlob::new(
            url.clone(),
            transport.clone(),
            size,
            self.chunk_size,
            Arc::clone(&self.http_cache),
            Arc::clone(&self.tasks),
        ));
        let archive = Arc::new(Archive::open(
            Arc::clone(&remote),
            Arc::clone(&self.fs_cache),
            digest,
        )?);
        let state = Arc::new(LayerState::new(digest, size, remote));

        if !self.noprefetch {
            archive.prefetch(self.default_prefetch_size)?;
            debug!("prefetch completed for {digest} ({url})");
        }

        // Fetch the whole layer in the background; prioritized tasks
        // (mount, check, on-demand reads) interrupt it between chunks.
        {
            let archive = Arc::clone(&archive);
            let digest = digest.clone();
            let url = url.clone();
            std::thread::spawn(move || match archive.cache_all() {
                Ok(()) => debug!("fetched all layer data of {digest} ({url})"),
                Err(e) => warn!("background fetch of {digest} ({url}) failed: {e}"),
            });
        }

        let layer = StargzLayer::new(archive, state);
        let options = [
            MountOption::RO,
            MountOption::AllowOther,
            MountOption::FSName("stargz".to_string()),
        ];
        // spawn_mount2 returns once the kernel has confirmed the mount;
        // the session handle keeps the mount alive until the connection
        // record is dropped.
        let session = fuser::spawn_mount2(layer, mountpoint, &options)?;

        self.connections.lock().unwrap().insert(
            mountpoint.to_path_buf(),
            Connection {
                url,
                transport,
                last_check: Instant::now(),
                session: Some(session),
            },
        );
        Ok(())
    }

    fn check(&self, mountpoint: &Path) -> Result<()> {
        let _prioritized = self.tasks.prioritized();

        let (url, transport, last_check) = {
            let connections = self.connections.lock().unwrap();
            let conn = connections.get(mountpoint).ok_or_else(|| {
                SnapshotError::NotFound(format!("connection for {mountpoint:?} not registered"))
            })?;
            (conn.url.clone(), conn.transport.clone(), conn.last_check)
        };

        if self.layer_valid_interval > Duration::ZERO
            && last_check.elapsed() < self.layer_valid_interval
        {
            debug!("skipping liveness probe for {mountpoint:?}");
            return Ok(());
        }

        let resp = transport.get_range(&url, 0, 1)?;
        let status = resp.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(SnapshotError::Http(format!(
                "liveness probe of {url} failed with code {status}"
            )));
        }

        if let Some(conn) = self.connections.lock().unwrap().get_mut(mountpoint) {
            conn.last_check = Instant::now();
        }
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> Result<()> {
        let removed = self.connections.lock().unwrap().remove(mountpoint);
        match removed {
            // Dropped outside the lock: tearing down the FUSE session
            // unmounts and joins its serving thread.
            Some(conn) => drop(conn),
            None => debug!("no connection registered for {mountpoint:?}"),
        }
        Ok(())
    }
}
