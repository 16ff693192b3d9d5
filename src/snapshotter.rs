use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use containerd_snapshots::{api, Info, Kind, Snapshotter, Usage};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tonic::Status;

use crate::error::{Result, SnapshotError};
use crate::fs::FileSystem;
use crate::store::{MetaStore, Snapshot};

/// Commit name of a snapshot that may be prepared as a remote snapshot.
pub const TARGET_SNAPSHOT_LABEL: &str = "containerd.io/snapshot.ref";
/// Index of the filesystem plugin that mounted a remote snapshot; read
/// back during availability checks.
pub const FILESYSTEM_ID_LABEL: &str = "containerd.io/snapshot/filesystem.id";

/// Overlay snapshotter that can serve unpacked remote layers as
/// snapshots. When a Prepare call carries the remote-snapshot label and a
/// filesystem plugin manages to mount the layer, the snapshot is
/// committed on the spot and `AlreadyExists` is reported so the caller
/// skips downloading the layer.
pub struct RemoteSnapshotter {
    root: PathBuf,
    store: Mutex<MetaStore>,
    fs_chain: Vec<Arc<dyn FileSystem>>,
    async_remove: bool,
}

impl RemoteSnapshotter {
    pub fn new(
        root: &Path,
        fs_chain: Vec<Arc<dyn FileSystem>>,
        async_remove: bool,
    ) -> Result<Self> {
        if fs_chain.is_empty() {
            return Err(SnapshotError::InvalidArgument(
                "no filesystem plugin found, check the installation".into(),
            ));
        }
        fs::create_dir_all(root)?;
        fs::set_permissions(root, fs::Permissions::from_mode(0o700))?;
        let snapshots = root.join("snapshots");
        if !snapshots.exists() {
            fs::create_dir(&snapshots)?;
            fs::set_permissions(&snapshots, fs::Permissions::from_mode(0o700))?;
        }
        if !supports_d_type(root)? {
            return Err(SnapshotError::InvalidArgument(format!(
                "{root:?} does not support d_type; reformat the backing filesystem",
            )));
        }
        let store = MetaStore::open(&root.join("metadata.db"))?;
        Ok(Self {
            root: root.to_path_buf(),
            store: Mutex::new(store),
            fs_chain,
            async_remove,
        })
    }

    fn upper_path(&self, id: &str) -> PathBuf {
        self.root.join("snapshots").join(id).join("fs")
    }

    fn work_path(&self, id: &str) -> PathBuf {
        self.root.join("snapshots").join(id).join("work")
    }

    async fn create_snapshot(
        &self,
        kind: Kind,
        key: &str,
        parent: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<api::types::Mount>> {
        let mut store = self.store.lock().await;

        let snapshot_dir = self.root.join("snapshots");
        let td = prepare_directory(&snapshot_dir, &kind)?;
        let snap = match store.create_snapshot(kind, key, parent, labels) {
            Ok(snap) => snap,
            Err(e) => {
                cleanup_snapshot_directory(&td);
                return Err(e);
            }
        };

        let finalized: Result<()> = (|| {
            if let Some(parent_id) = snap.parent_ids.first() {
                let st = nix::sys::stat::stat(&self.upper_path(parent_id))
                    .map_err(|e| SnapshotError::Io(e.into()))?;
                nix::unistd::chown(
                    &td.join("fs"),
                    Some(nix::unistd::Uid::from_raw(st.st_uid)),
                    Some(nix::unistd::Gid::from_raw(st.st_gid)),
                )
                .map_err(|e| SnapshotError::Io(e.into()))?;
            }
            fs::rename(&td, snapshot_dir.join(&snap.id))?;
            Ok(())
        })();
        if let Err(e) = finalized {
            // The record is already visible; take it back out before
            // reporting the failure.
            if let Err(remove_err) = store.remove(key) {
                warn!("failed to roll back snapshot record {key}: {remove_err}");
            }
            cleanup_snapshot_directory(&td);
            return Err(e);
        }

        self.mounts_of(&mut store, &snap, parent)
    }

    /// Assembles the mounts for a snapshot, first verifying that every
    /// remote layer below `check_key` is still available.
    fn mounts_of(
        &self,
        store: &mut MetaStore,
        snap: &Snapshot,
        check_key: &str,
    ) -> Result<Vec<api::types::Mount>> {
        if !check_key.is_empty() && !self.check_availability(store, check_key) {
            return Err(SnapshotError::Unavailable(format!(
                "layer {} unavailable",
                snap.id
            )));
        }

        if snap.parent_ids.is_empty() {
            // A single layer is served as a bind mount; overlay needs at
            // least one lower layer.
            let mode = if snap.kind == Kind::View { "ro" } else { "rw" };
            return Ok(vec![api::types::Mount {
                r#type: "bind".into(),
                source: self.upper_path(&snap.id).to_string_lossy().into(),
                target: String::new(),
                options: vec![mode.into(), "rbind".into()],
            }]);
        }

        let mut options = Vec::new();
        if snap.kind == Kind::Active {
            options.push(format!(
                "workdir={}",
                self.work_path(&snap.id).to_string_lossy()
            ));
            options.push(format!(
                "upperdir={}",
                self.upper_path(&snap.id).to_string_lossy()
            ));
        } else if snap.parent_ids.len() == 1 {
            return Ok(vec![api::types::Mount {
                r#type: "bind".into(),
                source: self.upper_path(&snap.parent_ids[0]).to_string_lossy().into(),
                target: String::new(),
                options: vec!["ro".into(), "rbind".into()],
            }]);
        }

        let lowerdir: Vec<String> = snap
            .parent_ids
            .iter()
            .map(|id| self.upper_path(id).to_string_lossy().into_owned())
            .collect();
        options.push(format!("lowerdir={}", lowerdir.join(":")));

        Ok(vec![api::types::Mount {
            r#type: "overlay".into(),
            source: "overlay".into(),
            target: String::new(),
            options,
        }])
    }

    /// Walks the chain from `key` to the bottom layer. A layer without a
    /// filesystem id is a plain overlay layer and counts as available; a
    /// remote layer is probed through the plugin that mounted it.
    fn check_availability(&self, store: &mut MetaStore, key: &str) -> bool {
        debug!("checking layer availability of {key}");
        let mut next = key.to_string();
        loop {
            let (id, info, _) = match store.get_info(&next) {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to get info of {next}: {e}");
                    return false;
                }
            };
            match info.labels.get(FILESYSTEM_ID_LABEL) {
                None => debug!("layer {next} is a normal snapshot (overlayfs)"),
                Some(label) => {
                    let fsid = match label.parse::<usize>() {
                        Ok(fsid) => fsid,
                        Err(e) => {
                            warn!("failed to parse filesystem ID {label:?} of {next}: {e}");
                            return false;
                        }
                    };
                    let Some(plugin) = self.fs_chain.get(fsid) else {
                        warn!("invalid filesystem ID {fsid} of {next}");
                        return false;
                    };
                    if let Err(e) = plugin.check(&self.upper_path(&id)) {
                        warn!("layer {next} is unavailable: {e}");
                        return false;
                    }
                }
            }
            if info.parent.is_empty() {
                return true;
            }
            next = info.parent;
        }
    }

    /// Tries each filesystem plugin in priority order against the
    /// snapshot's upper directory. Returns the index of the first plugin
    /// that mounts the layer.
    async fn prepare_remote_snapshot(
        &self,
        key: &str,
        labels: &HashMap<String, String>,
    ) -> Result<usize> {
        let id = {
            let mut store = self.store.lock().await;
            store.get_info(key)?.0
        };
        let mountpoint = self.upper_path(&id);
        for (fsid, plugin) in self.fs_chain.iter().enumerate() {
            let plugin = Arc::clone(plugin);
            let mp = mountpoint.clone();
            let labels = labels.clone();
            let mounted = tokio::task::spawn_blocking(move || plugin.mount(&mp, &labels))
                .await
                .map_err(|e| SnapshotError::Unknown(format!("mount task failed: {e}")))?;
            match mounted {
                Ok(()) => {
                    info!("mounted remote snapshot {key} with filesystem {fsid}");
                    return Ok(fsid);
                }
                Err(e) => debug!("filesystem {fsid} could not mount {key}: {e}"),
            }
        }
        Err(SnapshotError::NotFound(
            "mountable remote layer not found".into(),
        ))
    }

    async fn commit_inner(
        &self,
        name: &str,
        key: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        let mut store = self.store.lock().await;
        let (id, info, _) = store.get_info(key)?;
        // Walking a mounted remote snapshot for disk usage would pull the
        // whole layer; remote snapshots report zero usage instead.
        let usage = if info.labels.contains_key(TARGET_SNAPSHOT_LABEL) {
            Usage { size: 0, inodes: 0 }
        } else {
            disk_usage(&self.upper_path(&id))?
        };
        store.commit_active(key, name, usage, labels)?;
        Ok(())
    }

    async fn remove_inner(&self, key: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        store.remove(key)?;

        if !self.async_remove {
            let removals = self.cleanup_directories(&mut store)?;
            drop(store);
            // The record is gone either way; directory removal failures
            // are only logged.
            for dir in removals {
                cleanup_snapshot_directory(&dir);
            }
        }
        Ok(())
    }

    fn cleanup_directories(&self, store: &mut MetaStore) -> Result<Vec<PathBuf>> {
        let ids = store.id_map()?;
        let snapshot_dir = self.root.join("snapshots");
        let mut cleanup = Vec::new();
        for entry in fs::read_dir(&snapshot_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !ids.contains(&name) {
                cleanup.push(snapshot_dir.join(name));
            }
        }
        Ok(cleanup)
    }

    /// Collects directories of removed or abandoned snapshots.
    pub async fn cleanup(&self) -> Result<()> {
        let removals = {
            let mut store = self.store.lock().await;
            self.cleanup_directories(&mut store)?
        };
        for dir in removals {
            cleanup_snapshot_directory(&dir);
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[tonic::async_trait]
impl Snapshotter for RemoteSnapshotter {
    type Error = Status;

    async fn stat(&self, key: String) -> std::result::Result<Info, Self::Error> {
        info!("stat({key})");
        let (_, info, _) = self.store.lock().await.get_info(&key)?;
        Ok(info)
    }

    async fn update(
        &self,
        info: Info,
        fieldpaths: Option<Vec<String>>,
    ) -> std::result::Result<Info, Self::Error> {
        info!("update({}, {fieldpaths:?})", info.name);
        let updated = self
            .store
            .lock()
            .await
            .update_info(&info, fieldpaths.as_deref())?;
        Ok(updated)
    }

    async fn usage(&self, key: String) -> std::result::Result<Usage, Self::Error> {
        debug!("usage({key})");
        let (id, info, usage) = self.store.lock().await.get_info(&key)?;
        if info.kind == Kind::Active {
            // Scan the overlay upper; committed snapshots return the
            // value recorded at commit time.
            return Ok(disk_usage(&self.upper_path(&id))?);
        }
        Ok(usage)
    }

    async fn mounts(&self, key: String) -> std::result::Result<Vec<api::types::Mount>, Self::Error> {
        debug!("mounts({key})");
        let mut store = self.store.lock().await;
        let snap = store.get_snapshot(&key)?;
        let mounts = self.mounts_of(&mut store, &snap, &key).map_err(|e| {
            error!("mounts({key}) failed: {e}");
            Status::from(e)
        })?;
        Ok(mounts)
    }

    async fn prepare(
        &self,
        key: String,
        parent: String,
        labels: HashMap<String, String>,
    ) -> std::result::Result<Vec<api::types::Mount>, Status> {
        info!("prepare({key}, {parent}, {labels:?})");

        if let Some(target) = labels.get(TARGET_SNAPSHOT_LABEL) {
            // The target may already have been prepared as a remote
            // snapshot by an earlier Prepare.
            if self.store.lock().await.get_info(target).is_ok() {
                return Err(Status::already_exists(format!(
                    "target snapshot {target:?}"
                )));
            }
        }

        let mounts = self
            .create_snapshot(Kind::Active, &key, &parent, &labels)
            .await
            .map_err(|e| {
                error!("prepare({key}) failed: {e}");
                Status::from(e)
            })?;

        if let Some(target) = labels.get(TARGET_SNAPSHOT_LABEL) {
            match self.prepare_remote_snapshot(&key, &labels).await {
                Ok(fsid) => {
                    let mut commit_labels = labels.clone();
                    commit_labels.insert(FILESYSTEM_ID_LABEL.to_string(), fsid.to_string());
                    match self.commit_inner(target, &key, &commit_labels).await {
                        Ok(()) => {
                            // Signal the caller that the layer is already
                            // materialized and needs no download.
                            return Err(Status::already_exists(format!(
                                "target snapshot {target:?}"
                            )));
                        }
                        Err(e) => warn!("failed to commit remote snapshot {target:?}: {e}"),
                    }
                }
                Err(e) => debug!("remote snapshot is not available for {key}: {e}"),
            }
        }

        Ok(mounts)
    }

    async fn view(
        &self,
        key: String,
        parent: String,
        labels: HashMap<String, String>,
    ) -> std::result::Result<Vec<api::types::Mount>, Self::Error> {
        info!("view({key}, {parent})");
        let mounts = self
            .create_snapshot(Kind::View, &key, &parent, &labels)
            .await
            .map_err(|e| {
                error!("view({key}) failed: {e}");
                Status::from(e)
            })?;
        Ok(mounts)
    }

    async fn commit(
        &self,
        name: String,
        key: String,
        labels: HashMap<String, String>,
    ) -> std::result::Result<(), Self::Error> {
        info!("commit({name}, {key})");
        self.commit_inner(&name, &key, &labels).await.map_err(|e| {
            error!("commit({name}, {key}) failed: {e}");
            Status::from(e)
        })
    }

    async fn remove(&self, key: String) -> std::result::Result<(), Self::Error> {
        info!("remove({key})");
        self.remove_inner(&key).await.map_err(|e| {
            error!("remove({key}) failed: {e}");
            Status::from(e)
        })
    }

    type InfoStream = impl tokio_stream::Stream<Item = std::result::Result<Info, Self::Error>>
        + Send
        + 'static;
    async fn list(
        &self,
        _: String,
        _: Vec<String>,
    ) -> std::result::Result<Self::InfoStream, Self::Error> {
        info!("list()");
        let infos = self.store.lock().await.walk()?;
        Ok(tokio_stream::iter(infos.into_iter().map(Ok)))
    }
}

fn prepare_directory(snapshot_dir: &Path, kind: &Kind) -> Result<PathBuf> {
    let td = tempfile::Builder::new()
        .prefix("new-")
        .tempdir_in(snapshot_dir)?
        .into_path();
    let upper = td.join("fs");
    fs::create_dir(&upper)?;
    fs::set_permissions(&upper, fs::Permissions::from_mode(0o755))?;
    if kind == Kind::Active {
        let work = td.join("work");
        fs::create_dir(&work)?;
        fs::set_permissions(&work, fs::Permissions::from_mode(0o711))?;
    }
    Ok(td)
}

/// Unmounts whatever may be mounted on `<dir>/fs` and removes the
/// directory. The unmount is best-effort; the directory may hold a plain
/// overlay upper rather than a FUSE mount.
fn cleanup_snapshot_directory(dir: &Path) {
    let _ = nix::mount::umount(&dir.join("fs"));
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove directory {dir:?}: {e}");
        }
    }
}

/// Whether the backing filesystem reports entry types in its dirents.
/// Overlayfs requires d_type support on the lower layers.
fn supports_d_type(path: &Path) -> Result<bool> {
    let mut dir = nix::dir::Dir::open(
        path,
        nix::fcntl::OFlag::O_RDONLY | nix::fcntl::OFlag::O_DIRECTORY,
        nix::sys::stat::Mode::empty(),
    )
    .map_err(|e| SnapshotError::Io(e.into()))?;
    for entry in dir.iter() {
        let entry = entry.map_err(|e| SnapshotError::Io(e.into()))?;
        let name = entry.file_name().to_bytes();
        if name == b"." || name == b".." {
            continue;
        }
        return Ok(entry.file_type().is_some());
    }
    Ok(true)
}

fn disk_usage(path: &Path) -> Result<Usage> {
    let mut usage = Usage { size: 0, inodes: 0 };
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            usage.inodes += 1;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                usage.size += meta.len() as i64;
            }
        }
    }
    Ok(usage)
}
