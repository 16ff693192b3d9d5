//! Shared helpers for unit tests: a minimal HTTP byte-range origin and a
//! stargz fixture builder.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use base64::prelude::{Engine, BASE64_STANDARD};
use flate2::write::GzEncoder;
use flate2::Compression;

/// Serves one blob over HTTP with byte-range support, counting GETs so
/// tests can assert fetch bounds.
pub fn serve_blob(data: Vec<u8>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let gets = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&gets);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let data = data.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || serve_connection(stream, &data, &counter));
        }
    });
    (format!("http://{addr}"), gets)
}

fn serve_connection(stream: TcpStream, data: &[u8], gets: &AtomicUsize) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut stream = stream;
    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
            return;
        }
        let mut range = None;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).unwrap_or(0) == 0 {
                return;
            }
            let header = header.trim_end().to_ascii_lowercase();
            if header.is_empty() {
                break;
            }
            if let Some(spec) = header.strip_prefix("range: bytes=") {
                let (a, b) = spec.split_once('-').unwrap();
                range = Some((a.parse::<u64>().unwrap(), b.parse::<u64>().unwrap()));
            }
        }
        let method = request_line
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string();
        match (method.as_str(), range) {
            ("HEAD", _) => {
                write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                    data.len()
                )
                .unwrap();
            }
            ("GET", Some((start, end))) => {
                gets.fetch_add(1, Ordering::SeqCst);
                let end = end.min(data.len() as u64 - 1);
                let body = &data[start as usize..=end as usize];
                write!(
                    stream,
                    "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\n\r\n",
                    body.len()
                )
                .unwrap();
                stream.write_all(body).unwrap();
            }
            ("GET", None) => {
                gets.fetch_add(1, Ordering::SeqCst);
                write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                    data.len()
                )
                .unwrap();
                stream.write_all(data).unwrap();
            }
            _ => {
                write!(
                    stream,
                    "HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n"
                )
                .unwrap();
            }
        }
    }
}

pub fn test_blob(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Declarative description of one archive entry for [`StargzFixture`].
pub enum FixtureEntry {
    Dir {
        name: &'static str,
        mode: u32,
    },
    File {
        name: &'static str,
        data: Vec<u8>,
        chunk_size: usize,
        mode: u32,
        uid: u32,
        gid: u32,
        xattrs: BTreeMap<&'static str, &'static [u8]>,
    },
    Symlink {
        name: &'static str,
        target: &'static str,
    },
    Hardlink {
        name: &'static str,
        target: &'static str,
    },
    CharDev {
        name: &'static str,
        major: u32,
        minor: u32,
    },
}

impl FixtureEntry {
    pub fn file(name: &'static str, data: &[u8]) -> Self {
        FixtureEntry::File {
            name,
            data: data.to_vec(),
            chunk_size: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            xattrs: BTreeMap::new(),
        }
    }

    pub fn chunked_file(name: &'static str, data: &[u8], chunk_size: usize) -> Self {
        FixtureEntry::File {
            name,
            data: data.to_vec(),
            chunk_size,
            mode: 0o644,
            uid: 0,
            gid: 0,
            xattrs: BTreeMap::new(),
        }
    }

    pub fn dir(name: &'static str) -> Self {
        FixtureEntry::Dir { name, mode: 0o755 }
    }
}

/// Builds a stargz blob: per-entry gzip members, a tar-wrapped TOC and the
/// 47-byte footer carrying the TOC offset.
pub fn build_stargz(entries: &[FixtureEntry]) -> Vec<u8> {
    let mut blob: Vec<u8> = Vec::new();
    let mut toc = Vec::new();

    for entry in entries {
        match entry {
            FixtureEntry::Dir { name, mode } => {
                blob.extend(gzip_member(&tar_header_block(name, 0, b'5')));
                toc.push(serde_json::json!({
                    "name": name, "type": "dir", "mode": mode,
                }));
            }
            FixtureEntry::Symlink { name, target } => {
                blob.extend(gzip_member(&tar_header_block(name, 0, b'2')));
                toc.push(serde_json::json!({
                    "name": name, "type": "symlink", "linkName": target, "mode": 0o777,
                }));
            }
            FixtureEntry::Hardlink { name, target } => {
                blob.extend(gzip_member(&tar_header_block(name, 0, b'1')));
                toc.push(serde_json::json!({
                    "name": name, "type": "hardlink", "linkName": target,
                }));
            }
            FixtureEntry::CharDev { name, major, minor } => {
                blob.extend(gzip_member(&tar_header_block(name, 0, b'3')));
                toc.push(serde_json::json!({
                    "name": name, "type": "char", "devMajor": major, "devMinor": minor,
                    "mode": 0o644,
                }));
            }
            FixtureEntry::File {
                name,
                data,
                chunk_size,
                mode,
                uid,
                gid,
                xattrs,
            } => {
                blob.extend(gzip_member(&tar_header_block(name, data.len(), b'0')));
                let xattrs: BTreeMap<&str, String> = xattrs
                    .iter()
                    .map(|(k, v)| (*k, BASE64_STANDARD.encode(v)))
                    .collect();
                if data.is_empty() {
                    toc.push(serde_json::json!({
                        "name": name, "type": "reg", "size": 0, "mode": mode,
                        "uid": uid, "gid": gid, "xattrs": xattrs,
                    }));
                    continue;
                }
                let step = if *chunk_size == 0 {
                    data.len()
                } else {
                    *chunk_size
                };
                let mut file_off = 0usize;
                while file_off < data.len() {
                    let end = (file_off + step).min(data.len());
                    let offset = blob.len();
                    blob.extend(gzip_member(&data[file_off..end]));
                    // The final chunk records size zero, meaning "to the
                    // end of the file".
                    let chunk_size = if end == data.len() { 0 } else { step };
                    if file_off == 0 {
                        toc.push(serde_json::json!({
                            "name": name, "type": "reg", "size": data.len(), "mode": mode,
                            "uid": uid, "gid": gid, "xattrs": xattrs,
                            "offset": offset,
                            "chunkSize": chunk_size,
                        }));
                    } else {
                        toc.push(serde_json::json!({
                            "name": name, "type": "chunk", "offset": offset,
                            "chunkOffset": file_off,
                            "chunkSize": chunk_size,
                        }));
                    }
                    file_off = end;
                }
            }
        }
    }

    let toc_offset = blob.len();
    let index = serde_json::to_vec(&serde_json::json!({
        "version": 1,
        "entries": toc,
    }))
    .unwrap();

    let mut tarball = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(index.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tarball
        .append_data(&mut header, "stargz.index.json", &index[..])
        .unwrap();
    let tar_bytes = tarball.into_inner().unwrap();
    blob.extend(gzip_member(&tar_bytes));

    blob.extend(footer_bytes(toc_offset as u64));
    blob
}

fn gzip_member(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn tar_header_block(name: &str, size: usize, entry_type: u8) -> Vec<u8> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name).unwrap();
    header.set_size(size as u64);
    header.set_entry_type(tar::EntryType::new(entry_type));
    header.set_cksum();
    header.as_bytes().to_vec()
}

/// The stargz footer: an empty gzip member whose EXTRA field records the
/// TOC offset as 16 hex digits followed by "STARGZ". Written out by hand
/// so the fixture is byte-for-byte deterministic.
pub fn footer_bytes(toc_offset: u64) -> Vec<u8> {
    let mut footer = Vec::with_capacity(47);
    // Gzip header with FEXTRA set, zero mtime, unknown OS.
    footer.extend_from_slice(&[0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0x00, 0xff]);
    footer.extend_from_slice(&22u16.to_le_bytes());
    footer.extend_from_slice(format!("{toc_offset:016x}STARGZ").as_bytes());
    // Final stored deflate block of length zero, then CRC32 and ISIZE of
    // the empty payload.
    footer.extend_from_slice(&[0x01, 0x00, 0x00, 0xff, 0xff]);
    footer.extend_from_slice(&0u32.to_le_bytes());
    footer.extend_from_slice(&0u32.to_le_bytes());
    footer
}
