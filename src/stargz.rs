use std::collections::{BTreeMap, HashMap};
use std::io::{BufReader, Read};
use std::sync::Arc;

use base64::prelude::{Engine, BASE64_STANDARD};
use flate2::read::GzDecoder;
use log::warn;
use serde::Deserialize;

use crate::cache::BlobCache;
use crate::error::{Result, SnapshotError};
use crate::remote::{BackgroundStream, RemoteBlob};

pub const PREFETCH_LANDMARK: &str = ".prefetch.landmark";

const FOOTER_SIZE: u64 = 47;
const TOC_TAR_NAME: &str = "stargz.index.json";

/// Whole-layer background fetches stream through a large buffer to keep
/// the request count against the registry low.
const BACKGROUND_BUFFER_SIZE: u64 = 2 << 28;

/// One record of the archive's table of contents, as serialized in
/// `stargz.index.json`. Xattr values are base64 in the JSON form.
#[derive(Debug, Clone, Default, Deserialize)]
struct TocEntry {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    toc_type: String,
    #[serde(default)]
    size: u64,
    #[serde(default, rename = "modtime")]
    mod_time: String,
    #[serde(default, rename = "linkName")]
    link_name: String,
    #[serde(default)]
    mode: u32,
    #[serde(default)]
    uid: u32,
    #[serde(default)]
    gid: u32,
    #[serde(default, rename = "devMajor")]
    dev_major: u32,
    #[serde(default, rename = "devMinor")]
    dev_minor: u32,
    #[serde(default)]
    xattrs: HashMap<String, String>,
    #[serde(default)]
    offset: u64,
    #[serde(default, rename = "chunkOffset")]
    chunk_offset: u64,
    #[serde(default, rename = "chunkSize")]
    chunk_size: u64,
}

#[derive(Debug, Deserialize)]
struct TocIndex {
    version: u32,
    entries: Vec<TocEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    Reg,
    Symlink,
    Char,
    Block,
    Fifo,
}

/// Span of one file chunk: `[file_offset, file_offset+size)` of the
/// decompressed file, stored as a gzip member at `blob_offset` whose
/// compressed form extends `compressed_size` bytes into the blob.
#[derive(Debug, Clone, Copy)]
pub struct FileChunk {
    pub file_offset: u64,
    pub size: u64,
    pub blob_offset: u64,
    pub compressed_size: u64,
}

/// An interned TOC entry. The index of a node within [`Archive::nodes`]
/// is its stable identity for the lifetime of the mount and seeds its
/// inode number.
#[derive(Debug)]
pub struct Node {
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub link_name: String,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub nlink: u32,
    pub opaque: bool,
    toc_offset: u64,
    children: BTreeMap<String, usize>,
    chunks: Vec<FileChunk>,
}

impl Node {
    fn new(path: String, kind: EntryKind) -> Self {
        let name = match path.rsplit_once('/') {
            Some((_, base)) => base.to_string(),
            None => path.clone(),
        };
        Self {
            path,
            name,
            kind,
            size: 0,
            mode: if kind == EntryKind::Dir { 0o755 } else { 0o644 },
            uid: 0,
            gid: 0,
            mtime: 0,
            link_name: String::new(),
            dev_major: 0,
            dev_minor: 0,
            xattrs: BTreeMap::new(),
            nlink: 1,
            opaque: false,
            toc_offset: 0,
            children: BTreeMap::new(),
            chunks: Vec::new(),
        }
    }

    /// Children by base name, in lexicographic order.
    pub fn children(&self) -> impl Iterator<Item = (&str, usize)> {
        self.children.iter().map(|(name, idx)| (name.as_str(), *idx))
    }

    pub fn child(&self, name: &str) -> Option<usize> {
        self.children.get(name).copied()
    }
}

/// A parsed seekable archive bound to its remote blob and a cache of
/// decompressed file chunks.
pub struct Archive {
    nodes: Vec<Node>,
    remote: Arc<RemoteBlob>,
    cache: Arc<dyn BlobCache>,
    blob_id: String,
    toc_offset: u64,
}

impl Archive {
    /// Reads the footer and TOC from the remote blob and builds the
    /// interned entry tree.
    pub fn open(
        remote: Arc<RemoteBlob>,
        cache: Arc<dyn BlobCache>,
        blob_id: &str,
    ) -> Result<Self> {
        let size = remote.size();
        if size < FOOTER_SIZE {
            return Err(SnapshotError::Archive(format!(
                "blob of {size} bytes is too small for a stargz footer"
            )));
        }
        let mut footer = [0u8; FOOTER_SIZE as usize];
        remote.read_exact_at(&mut footer, size - FOOTER_SIZE)?;
        let toc_offset = parse_footer(&footer)?;
        if toc_offset >= size - FOOTER_SIZE {
            return Err(SnapshotError::Archive(format!(
                "TOC offset {toc_offset} out of bounds"
            )));
        }

        let mut toc_gz = vec![0u8; (size - FOOTER_SIZE - toc_offset) as usize];
        remote.read_exact_at(&mut toc_gz, toc_offset)?;
        let index = parse_toc(&toc_gz)?;

        let mut archive = Self {
            nodes: vec![Node::new(String::new(), EntryKind::Dir)],
            remote,
            cache,
            blob_id: blob_id.to_string(),
            toc_offset,
        };
        archive.build(index)?;
        Ok(archive)
    }

    pub fn root(&self) -> usize {
        0
    }

    pub fn node(&self, idx: usize) -> Option<&Node> {
        self.nodes.get(idx)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn remote(&self) -> &Arc<RemoteBlob> {
        &self.remote
    }

    /// Looks up an absolute path ("" is the root).
    pub fn lookup(&self, path: &str) -> Option<usize> {
        let mut idx = self.root();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            idx = self.nodes[idx].child(part)?;
        }
        Some(idx)
    }

    /// Reads decompressed file bytes, truncated to the file size.
    pub fn read_file_at(&self, idx: usize, dst: &mut [u8], off: u64) -> Result<usize> {
        let node = self
            .node(idx)
            .ok_or_else(|| SnapshotError::NotFound(format!("entry {idx}")))?;
        if node.kind != EntryKind::Reg {
            return Err(SnapshotError::InvalidArgument(format!(
                "{} is not a regular file",
                node.path
            )));
        }
        if off >= node.size || dst.is_empty() {
            return Ok(0);
        }
        let want = (dst.len() as u64).min(node.size - off) as usize;
        let mut filled = 0usize;
        let mut pos = off;
        while filled < want {
            let ci = node
                .chunks
                .partition_point(|c| c.file_offset + c.size <= pos);
            let chunk = node.chunks.get(ci).ok_or_else(|| {
                SnapshotError::Archive(format!("{}: no chunk covers offset {pos}", node.path))
            })?;
            let data = self.chunk_bytes(node, chunk)?;
            let begin = (pos - chunk.file_offset) as usize;
            let n = (want - filled).min(data.len() - begin);
            dst[filled..filled + n].copy_from_slice(&data[begin..begin + n]);
            filled += n;
            pos += n as u64;
        }
        Ok(filled)
    }

    /// Archive offset of the prefetch landmark, if the layer carries one.
    pub fn landmark_offset(&self) -> Option<u64> {
        let idx = self.nodes[self.root()].child(PREFETCH_LANDMARK)?;
        Some(self.nodes[idx].toc_offset)
    }

    /// Prioritized read of `[0, landmark)` filling the HTTP chunk cache.
    /// Falls back to `default_size` when no landmark is present.
    pub fn prefetch(&self, default_size: u64) -> Result<()> {
        let end = self
            .landmark_offset()
            .unwrap_or(default_size)
            .min(self.remote.size());
        let mut buf = vec![0u8; 1 << 20];
        let mut off = 0u64;
        while off < end {
            let n = (buf.len() as u64).min(end - off) as usize;
            self.remote.read_exact_at(&mut buf[..n], off)?;
            off += n as u64;
        }
        Ok(())
    }

    /// Streams the whole layer through the background cursor, populating
    /// both the HTTP chunk cache and the decompressed-chunk cache. Pauses
    /// between chunks whenever a prioritized task is active.
    pub fn cache_all(&self) -> Result<()> {
        let mut spans: Vec<(usize, FileChunk)> = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.kind == EntryKind::Reg {
                spans.extend(node.chunks.iter().map(|c| (idx, *c)));
            }
        }
        spans.sort_by_key(|(_, c)| c.blob_offset);

        let capacity = self.remote.size().min(BACKGROUND_BUFFER_SIZE) as usize;
        let mut reader = BufReader::with_capacity(capacity, BackgroundStream::new(self.remote.background()));
        let mut pos = 0u64;
        for (idx, chunk) in spans {
            skip_bytes(&mut reader, chunk.blob_offset - pos)?;
            let mut compressed = vec![0u8; chunk.compressed_size as usize];
            reader.read_exact(&mut compressed)?;
            pos = chunk.blob_offset + chunk.compressed_size;

            let node = &self.nodes[idx];
            let key = self.chunk_key(node, &chunk);
            if self.cache.fetch(&key).is_some() {
                continue;
            }
            let data = decompress_chunk(&compressed, chunk.size, &node.path)?;
            self.cache.add(&key, &data);
        }
        Ok(())
    }

    fn chunk_key(&self, node: &Node, chunk: &FileChunk) -> String {
        format!("{}:{}:{}", self.blob_id, node.path, chunk.file_offset)
    }

    fn chunk_bytes(&self, node: &Node, chunk: &FileChunk) -> Result<Vec<u8>> {
        let key = self.chunk_key(node, chunk);
        if let Some(data) = self.cache.fetch(&key) {
            return Ok(data);
        }
        let mut compressed = vec![0u8; chunk.compressed_size as usize];
        self.remote.read_exact_at(&mut compressed, chunk.blob_offset)?;
        let data = decompress_chunk(&compressed, chunk.size, &node.path)?;
        self.cache.add(&key, &data);
        Ok(data)
    }

    fn build(&mut self, index: TocIndex) -> Result<()> {
        if index.version != 1 {
            return Err(SnapshotError::Archive(format!(
                "unsupported TOC version {}",
                index.version
            )));
        }
        let mut by_path: HashMap<String, usize> = HashMap::new();
        by_path.insert(String::new(), self.root());

        for entry in &index.entries {
            let path = clean_name(&entry.name);
            match entry.toc_type.as_str() {
                "chunk" => {
                    let idx = *by_path.get(&path).ok_or_else(|| {
                        SnapshotError::Archive(format!("chunk for unknown entry {path:?}"))
                    })?;
                    self.nodes[idx].chunks.push(FileChunk {
                        file_offset: entry.chunk_offset,
                        size: entry.chunk_size,
                        blob_offset: entry.offset,
                        compressed_size: 0,
                    });
                }
                "hardlink" => {
                    let target = clean_name(&entry.link_name);
                    let target_idx = *by_path.get(&target).ok_or_else(|| {
                        SnapshotError::Archive(format!(
                            "hardlink {path:?} to unknown target {target:?}"
                        ))
                    })?;
                    self.nodes[target_idx].nlink += 1;
                    let parent = self.ensure_parent(&path, &mut by_path)?;
                    let base = base_name(&path).to_string();
                    self.nodes[parent].children.insert(base, target_idx);
                    by_path.insert(path, target_idx);
                }
                kind => {
                    let kind = match kind {
                        "dir" => EntryKind::Dir,
                        "reg" => EntryKind::Reg,
                        "symlink" => EntryKind::Symlink,
                        "char" => EntryKind::Char,
                        "block" => EntryKind::Block,
                        "fifo" => EntryKind::Fifo,
                        other => {
                            warn!("skipping TOC entry {path:?} of unsupported type {other:?}");
                            continue;
                        }
                    };
                    let idx = self.intern(&path, kind, &mut by_path)?;
                    let node = &mut self.nodes[idx];
                    node.kind = kind;
                    node.size = entry.size;
                    node.mode = entry.mode & 0o7777;
                    node.uid = entry.uid;
                    node.gid = entry.gid;
                    node.mtime = parse_mod_time(&entry.mod_time);
                    node.link_name = entry.link_name.clone();
                    node.dev_major = entry.dev_major;
                    node.dev_minor = entry.dev_minor;
                    node.toc_offset = entry.offset;
                    for (name, value) in &entry.xattrs {
                        let decoded = BASE64_STANDARD.decode(value).map_err(|e| {
                            SnapshotError::Archive(format!(
                                "bad xattr {name:?} on {path:?}: {e}"
                            ))
                        })?;
                        node.xattrs.insert(name.clone(), decoded);
                    }
                    if kind == EntryKind::Reg && entry.size > 0 {
                        node.chunks.push(FileChunk {
                            file_offset: entry.chunk_offset,
                            size: entry.chunk_size,
                            blob_offset: entry.offset,
                            compressed_size: 0,
                        });
                    }
                }
            }
        }

        self.finish_chunks();
        self.mark_opaque_dirs();
        Ok(())
    }

    /// Interns a node for `path`, creating implicit parent directories.
    fn intern(
        &mut self,
        path: &str,
        kind: EntryKind,
        by_path: &mut HashMap<String, usize>,
    ) -> Result<usize> {
        if let Some(idx) = by_path.get(path) {
            return Ok(*idx);
        }
        let parent = self.ensure_parent(path, by_path)?;
        let idx = self.nodes.len();
        self.nodes.push(Node::new(path.to_string(), kind));
        self.nodes[parent]
            .children
            .insert(base_name(path).to_string(), idx);
        by_path.insert(path.to_string(), idx);
        Ok(idx)
    }

    fn ensure_parent(
        &mut self,
        path: &str,
        by_path: &mut HashMap<String, usize>,
    ) -> Result<usize> {
        match path.rsplit_once('/') {
            None => Ok(self.root()),
            Some((parent, _)) => self.intern(parent, EntryKind::Dir, by_path),
        }
    }

    /// Resolves implicit chunk sizes and compressed extents. A chunk size
    /// of zero means "to the end of the file"; a chunk's compressed bytes
    /// extend to the next data chunk in the blob, or to the TOC.
    fn finish_chunks(&mut self) {
        let mut offsets: Vec<u64> = Vec::new();
        for node in &mut self.nodes {
            if node.kind != EntryKind::Reg {
                continue;
            }
            node.chunks.sort_by_key(|c| c.file_offset);
            for i in 0..node.chunks.len() {
                if node.chunks[i].size == 0 {
                    let next = node
                        .chunks
                        .get(i + 1)
                        .map(|c| c.file_offset)
                        .unwrap_or(node.size);
                    node.chunks[i].size = next - node.chunks[i].file_offset;
                }
            }
            offsets.extend(node.chunks.iter().map(|c| c.blob_offset));
        }
        offsets.sort_unstable();
        let toc_offset = self.toc_offset;
        for node in &mut self.nodes {
            for chunk in &mut node.chunks {
                let next = match offsets.binary_search(&chunk.blob_offset) {
                    Ok(i) => offsets.get(i + 1).copied().unwrap_or(toc_offset),
                    Err(_) => toc_offset,
                };
                chunk.compressed_size = next - chunk.blob_offset;
            }
        }
    }

    fn mark_opaque_dirs(&mut self) {
        let opaque: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                n.kind == EntryKind::Dir && n.children.contains_key(crate::fs::WHITEOUT_OPAQUE_DIR)
            })
            .map(|(i, _)| i)
            .collect();
        for idx in opaque {
            self.nodes[idx].opaque = true;
        }
    }
}

fn decompress_chunk(compressed: &[u8], size: u64, path: &str) -> Result<Vec<u8>> {
    let mut out = vec![0u8; size as usize];
    GzDecoder::new(compressed)
        .read_exact(&mut out)
        .map_err(|e| SnapshotError::Archive(format!("failed to decompress chunk of {path}: {e}")))?;
    Ok(out)
}

fn skip_bytes(reader: &mut impl Read, mut n: u64) -> Result<()> {
    let mut scratch = [0u8; 8192];
    while n > 0 {
        let take = (scratch.len() as u64).min(n) as usize;
        reader.read_exact(&mut scratch[..take])?;
        n -= take as u64;
    }
    Ok(())
}

/// Extracts the TOC offset from the 47-byte footer: an empty gzip member
/// whose EXTRA field is 16 hex digits followed by "STARGZ".
fn parse_footer(footer: &[u8]) -> Result<u64> {
    let bad = |msg: &str| SnapshotError::Archive(format!("bad stargz footer: {msg}"));
    if footer.len() != FOOTER_SIZE as usize {
        return Err(bad("wrong length"));
    }
    if footer[0] != 0x1f || footer[1] != 0x8b {
        return Err(bad("not a gzip stream"));
    }
    if footer[3] & 0x04 == 0 {
        return Err(bad("missing EXTRA field"));
    }
    let xlen = u16::from_le_bytes([footer[10], footer[11]]) as usize;
    if xlen != 22 || footer.len() < 12 + xlen {
        return Err(bad("unexpected EXTRA length"));
    }
    let extra = &footer[12..12 + xlen];
    if &extra[16..22] != b"STARGZ" {
        return Err(bad("missing STARGZ magic"));
    }
    let hex = std::str::from_utf8(&extra[..16]).map_err(|_| bad("non-ASCII TOC offset"))?;
    u64::from_str_radix(hex, 16).map_err(|_| bad("malformed TOC offset"))
}

/// Decompresses the TOC member and deserializes `stargz.index.json` out
/// of its tar wrapping.
fn parse_toc(toc_gz: &[u8]) -> Result<TocIndex> {
    let mut archive = tar::Archive::new(GzDecoder::new(toc_gz));
    for entry in archive.entries()? {
        let entry = entry?;
        if entry.path()?.as_os_str() == TOC_TAR_NAME {
            return Ok(serde_json::from_reader(entry)?);
        }
    }
    Err(SnapshotError::Archive(format!(
        "TOC does not contain {TOC_TAR_NAME}"
    )))
}

fn clean_name(name: &str) -> String {
    name.trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/')
        .to_string()
}

fn base_name(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((_, base)) => base,
        None => path,
    }
}

fn parse_mod_time(raw: &str) -> i64 {
    if raw.is_empty() {
        return 0;
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|t| t.timestamp())
        .unwrap_or(0)
}
