use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docker_credential::{CredentialRetrievalError, DockerCredential};
use log::{debug, warn};
use oci_client::Reference;
use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{LOCATION, RANGE};
use reqwest::{Method, StatusCode};

use crate::cache::BlobCache;
use crate::error::{Result, SnapshotError};
use crate::task::BackgroundTaskManager;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client bound to one registry plus the credentials to use against it.
#[derive(Clone)]
pub struct Transport {
    client: Client,
    auth: Option<(String, String)>,
}

impl Transport {
    #[cfg(test)]
    pub(crate) fn new_anonymous() -> Result<Self> {
        Self::new(None)
    }

    fn new(auth: Option<(String, String)>) -> Result<Self> {
        // Redirects are followed manually, once, at resolve time.
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, auth })
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.auth {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }

    /// Ranged GET for `[start, end]` (inclusive, per RFC 7233).
    pub fn get_range(&self, url: &str, start: u64, end: u64) -> Result<Response> {
        Ok(self
            .request(Method::GET, url)
            .header(RANGE, format!("bytes={start}-{end}"))
            .send()?)
    }

    /// HEADs the blob and returns its size from `Content-Length`.
    pub fn head_size(&self, url: &str) -> Result<u64> {
        let resp = self.request(Method::HEAD, url).send()?;
        if resp.status() != StatusCode::OK {
            return Err(SnapshotError::Http(format!(
                "HEAD {url} failed with code {}",
                resp.status()
            )));
        }
        resp.content_length()
            .ok_or_else(|| SnapshotError::Http(format!("HEAD {url} returned no Content-Length")))
    }
}

/// Translates (image reference, layer digest) into a blob URL plus an
/// authenticated transport, caching transports per reference name.
pub struct Resolver {
    insecure: Vec<Regex>,
    transports: Mutex<HashMap<String, Transport>>,
}

impl Resolver {
    pub fn new(insecure: &[String]) -> Result<Self> {
        let insecure = insecure
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    SnapshotError::InvalidArgument(format!("bad insecure pattern {p:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            insecure,
            transports: Mutex::new(HashMap::new()),
        })
    }

    fn is_insecure(&self, host: &str) -> bool {
        self.insecure.iter().any(|re| re.is_match(host))
    }

    /// Builds the blob URL for a reference/digest pair without touching the
    /// network. Returns (url, host, repository).
    fn blob_url(&self, reference: &str, digest: &str) -> Result<(String, String, String)> {
        let parsed: Reference = reference.parse().map_err(|e| {
            SnapshotError::InvalidArgument(format!("failed to parse reference {reference:?}: {e}"))
        })?;
        let mut host = parsed.registry().to_string();
        if host == "docker.io" || host == "index.docker.io" {
            host = "registry-1.docker.io".to_string();
        }
        let scheme = if self.is_insecure(&host) { "http" } else { "https" };
        let repository = parsed.repository().to_string();
        let url = format!("{scheme}://{host}/v2/{repository}/blobs/{digest}");
        Ok((url, host, repository))
    }

    /// Resolves a reference to a (possibly redirected) blob URL and a live
    /// transport. A cached transport is probed first and refreshed on
    /// failure.
    pub fn resolve(&self, reference: &str, digest: &str) -> Result<(String, Transport)> {
        let (url, host, repository) = self.blob_url(reference, digest)?;
        let name = format!("{host}/{repository}");

        let mut transports = self.transports.lock().unwrap();
        if let Some(transport) = transports.get(&name).cloned() {
            match check_and_redirect(&url, &transport) {
                Ok(resolved) => return Ok((resolved, transport)),
                Err(e) => {
                    debug!("cached transport for {name:?} is stale: {e}");
                    transports.remove(&name);
                }
            }
        }

        let transport = refresh_transport(&host)?;
        let resolved = check_and_redirect(&url, &transport)?;
        transports.insert(name, transport.clone());
        Ok((resolved, transport))
    }

    #[cfg(test)]
    fn cached_transports(&self) -> usize {
        self.transports.lock().unwrap().len()
    }
}

/// Builds a fresh transport for `host`, authenticating from the local
/// docker credential store when possible.
fn refresh_transport(host: &str) -> Result<Transport> {
    let auth = match docker_credential::get_credential(host) {
        Ok(DockerCredential::UsernamePassword(user, pass)) => Some((user, pass)),
        Ok(DockerCredential::IdentityToken(_)) => {
            warn!("identity tokens are not supported, using anonymous access for {host}");
            None
        }
        Err(CredentialRetrievalError::ConfigNotFound)
        | Err(CredentialRetrievalError::NoCredentialConfigured) => None,
        Err(e) => {
            debug!("no credentials for {host}: {e}");
            None
        }
    };
    Transport::new(auth)
}

/// Probes `url` with a 2-byte ranged GET, following a `Location` header
/// once iff the response class is 3xx.
fn check_and_redirect(url: &str, transport: &Transport) -> Result<String> {
    let resp = transport.get_range(url, 0, 1)?;
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(SnapshotError::Unauthenticated(format!(
            "registry rejected probe of {url}"
        )));
    }
    if status.as_u16() >= 400 {
        return Err(SnapshotError::Http(format!(
            "probe of {url} failed with code {status}"
        )));
    }
    if status.is_redirection() {
        if let Some(redirected) = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            return Ok(redirected.to_string());
        }
    }
    Ok(url.to_string())
}

/// Random-access view of a remote HTTP object.
///
/// Reads are decomposed into aligned chunks, each chunk is fetched at most
/// once into the blob cache, and every cache fill bumps the fetched-bytes
/// counter surfaced in the layer state file.
pub struct RemoteBlob {
    url: String,
    transport: Transport,
    size: u64,
    chunk_size: u64,
    cache: Arc<dyn BlobCache>,
    tasks: Arc<BackgroundTaskManager>,
    fetched: AtomicU64,
}

impl RemoteBlob {
    pub fn new(
        url: String,
        transport: Transport,
        size: u64,
        chunk_size: u64,
        cache: Arc<dyn BlobCache>,
        tasks: Arc<BackgroundTaskManager>,
    ) -> Self {
        Self {
            url,
            transport,
            size,
            chunk_size,
            cache,
            tasks,
            fetched: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn tasks(&self) -> &Arc<BackgroundTaskManager> {
        &self.tasks
    }

    /// Bytes written to the chunk cache so far (not bytes handed out).
    pub fn fetched_size(&self) -> u64 {
        self.fetched.load(Ordering::Relaxed)
    }

    pub fn read_at(&self, dst: &mut [u8], off: u64) -> Result<usize> {
        splice_chunks(dst, off, self.size, self.chunk_size, |idx| self.chunk(idx))
    }

    /// Like `read_at` but fails instead of returning a short read.
    pub fn read_exact_at(&self, dst: &mut [u8], off: u64) -> Result<()> {
        let n = self.read_at(dst, off)?;
        if n != dst.len() {
            return Err(SnapshotError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read of {}: {n}/{} bytes at {off}", self.url, dst.len()),
            )));
        }
        Ok(())
    }

    /// Low-priority sequential cursor over the same blob and cache.
    pub fn background(self: &Arc<Self>) -> BackgroundBlob {
        BackgroundBlob {
            blob: Arc::clone(self),
        }
    }

    /// Returns the chunk at `idx`, from cache or origin.
    fn chunk(&self, idx: u64) -> Result<Vec<u8>> {
        let key = format!("{}:{}", self.url, idx);
        if let Some(data) = self.cache.fetch(&key) {
            return Ok(data);
        }

        let start = idx * self.chunk_size;
        let end = ((idx + 1) * self.chunk_size).min(self.size); // exclusive
        let resp = self.transport.get_range(&self.url, start, end - 1)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SnapshotError::Http(format!(
                "GET {} (chunk {idx}) failed with code {status}",
                self.url
            )));
        }
        let body = resp.bytes()?;
        let expected = (end - start) as usize;
        if body.len() != expected {
            return Err(SnapshotError::Http(format!(
                "GET {} (chunk {idx}) returned {} bytes, expected {expected}",
                self.url,
                body.len()
            )));
        }
        self.cache.add(&key, &body);
        self.fetched.fetch_add(body.len() as u64, Ordering::Relaxed);
        Ok(body.to_vec())
    }
}

/// Background counterpart of [`RemoteBlob::read_at`]: every chunk fetch
/// goes through the task manager, so the cursor starts only when no
/// prioritized task is active and yields at each chunk boundary.
pub struct BackgroundBlob {
    blob: Arc<RemoteBlob>,
}

impl BackgroundBlob {
    pub fn read_at(&self, dst: &mut [u8], off: u64) -> Result<usize> {
        splice_chunks(dst, off, self.blob.size, self.blob.chunk_size, |idx| {
            self.blob
                .tasks
                .invoke_background_task(|_| self.blob.chunk(idx))
        })
    }

    pub fn size(&self) -> u64 {
        self.blob.size
    }
}

/// Sequential `Read` adapter over the background cursor, used for
/// whole-layer prefetch.
pub struct BackgroundStream {
    blob: BackgroundBlob,
    pos: u64,
}

impl BackgroundStream {
    pub fn new(blob: BackgroundBlob) -> Self {
        Self { blob, pos: 0 }
    }
}

impl Read for BackgroundStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.blob.size() || buf.is_empty() {
            return Ok(0);
        }
        let n = self
            .blob
            .read_at(buf, self.pos)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Decomposes `[off, off+dst.len())` into aligned chunk indices, fetches
/// each through `fetch`, and splices the pieces into `dst`. Returns the
/// number of bytes written, truncated to the object size.
fn splice_chunks(
    dst: &mut [u8],
    off: u64,
    size: u64,
    chunk_size: u64,
    mut fetch: impl FnMut(u64) -> Result<Vec<u8>>,
) -> Result<usize> {
    if off >= size || dst.is_empty() {
        return Ok(0);
    }
    let want = (dst.len() as u64).min(size - off);
    let first = off / chunk_size;
    let last = (off + want - 1) / chunk_size;
    for idx in first..=last {
        let chunk = fetch(idx)?;
        let chunk_start = idx * chunk_size;
        let begin = off.max(chunk_start);
        let end = (off + want).min(chunk_start + chunk.len() as u64);
        let src = &chunk[(begin - chunk_start) as usize..(end - chunk_start) as usize];
        let at = (begin - off) as usize;
        dst[at..at + src.len()].copy_from_slice(src);
    }
    Ok(want as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::testutil::{serve_blob, test_blob};
    use std::thread;

    fn remote_for(url: &str, size: u64, chunk_size: u64) -> Arc<RemoteBlob> {
        Arc::new(RemoteBlob::new(
            url.to_string(),
            Transport::new(None).unwrap(),
            size,
            chunk_size,
            Arc::new(MemoryCache::new(64).unwrap()),
            Arc::new(BackgroundTaskManager::new(2, Duration::from_millis(5))),
        ))
    }

    #[test]
    fn read_across_chunk_boundary() {
        let data = test_blob(120000);
        let (base, gets) = serve_blob(data.clone());
        let url = format!("{base}/v2/foo/blobs/sha256:x");
        let remote = remote_for(&url, 120000, 50000);

        let mut buf = vec![0u8; 30];
        let n = remote.read_at(&mut buf, 49990).unwrap();
        assert_eq!(n, 30);
        assert_eq!(&buf[..], &data[49990..50020]);
        // One GET per touched chunk.
        assert_eq!(gets.load(Ordering::SeqCst), 2);
        assert_eq!(remote.fetched_size(), 100000);

        // Both chunks are now cached; re-reading issues no new requests.
        let n = remote.read_at(&mut buf, 49990).unwrap();
        assert_eq!(n, 30);
        assert_eq!(gets.load(Ordering::SeqCst), 2);
        assert_eq!(remote.fetched_size(), 100000);
    }

    #[test]
    fn read_final_partial_chunk() {
        let data = test_blob(120000);
        let (base, _gets) = serve_blob(data.clone());
        let remote = remote_for(&format!("{base}/blob"), 120000, 50000);

        let mut buf = vec![0u8; 50000];
        let n = remote.read_at(&mut buf, 100000).unwrap();
        assert_eq!(n, 20000);
        assert_eq!(&buf[..n], &data[100000..]);

        // Reading past the end yields nothing.
        assert_eq!(remote.read_at(&mut buf, 120000).unwrap(), 0);
    }

    #[test]
    fn whole_blob_matches_origin() {
        let data = test_blob(9973);
        let (base, gets) = serve_blob(data.clone());
        let remote = remote_for(&format!("{base}/blob"), 9973, 1000);

        let mut buf = vec![0u8; 9973];
        remote.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(buf, data);
        assert_eq!(gets.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn head_reports_size() {
        let (base, _gets) = serve_blob(test_blob(4242));
        let transport = Transport::new(None).unwrap();
        assert_eq!(transport.head_size(&format!("{base}/blob")).unwrap(), 4242);
    }

    #[test]
    fn background_cursor_shares_cache_and_yields_to_prioritized() {
        let data = test_blob(4000);
        let (base, gets) = serve_blob(data.clone());
        let remote = remote_for(&format!("{base}/blob"), 4000, 1000);
        let tasks = Arc::clone(remote.tasks());

        let guard = tasks.prioritized();
        let bg = remote.background();
        let handle = thread::spawn(move || {
            let mut buf = vec![0u8; 4000];
            bg.read_at(&mut buf, 0).map(|n| (n, buf))
        });

        // No background request may start while the prioritized task runs.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(gets.load(Ordering::SeqCst), 0);
        drop(guard);

        let (n, buf) = handle.join().unwrap().unwrap();
        assert_eq!(n, 4000);
        assert_eq!(buf, data);

        // Foreground reads now hit the shared cache.
        let mut buf = vec![0u8; 4000];
        remote.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(gets.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn blob_url_respects_insecure_and_docker_alias() {
        let resolver =
            Resolver::new(&["^reg\\.local(:.*)?$".to_string()]).unwrap();

        let (url, _, _) = resolver
            .blob_url("reg.local:5000/ubuntu:18.04", "sha256:deadbeef")
            .unwrap();
        assert_eq!(
            url,
            "http://reg.local:5000/v2/ubuntu/blobs/sha256:deadbeef"
        );

        let (url, _, _) = resolver
            .blob_url("index.docker.io/library/alpine:latest", "sha256:deadbeef")
            .unwrap();
        assert_eq!(
            url,
            "https://registry-1.docker.io/v2/library/alpine/blobs/sha256:deadbeef"
        );
    }

    #[test]
    fn resolve_probes_and_caches_transport() {
        let (base, gets) = serve_blob(test_blob(100));
        let host = base.strip_prefix("http://").unwrap().to_string();
        let resolver = Resolver::new(&["^127\\.0\\.0\\.1(:.*)?$".to_string()]).unwrap();

        let reference = format!("{host}/foo/bar:latest");
        let (url, _t) = resolver.resolve(&reference, "sha256:abc").unwrap();
        assert_eq!(url, format!("http://{host}/v2/foo/bar/blobs/sha256:abc"));
        assert_eq!(gets.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cached_transports(), 1);

        // Second resolve reuses the cached transport (one more probe).
        let (_url, _t) = resolver.resolve(&reference, "sha256:abc").unwrap();
        assert_eq!(gets.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.cached_transports(), 1);
    }
}
