//! Caller-side half of the broker.
//!
//! A [`FsClient`] owns the request sender plus one pending-operation
//! arena per response kind; the correlation index of an outgoing request
//! is the arena slot its completion sender is parked in, and a router
//! task completes the slot when the matching response arrives. [`File`]
//! wraps an issued descriptor and speaks `tokio::io::AsyncRead` and
//! `AsyncWrite`; dropping one that was not closed sends the
//! fire-and-forget `Drop` request.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::arena::Arena;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::protocol::{OpenFlags, Opened, ReadDone, Request, Response, Written};
use crate::storage::StorageBackend;

type Slot<T> = oneshot::Sender<Result<T, Error>>;
type Completion<T> = oneshot::Receiver<Result<T, Error>>;

/// Pending completion slots, one arena per response kind. A response is
/// matched by (kind, index) exactly as the wire format keys it.
#[derive(Default)]
struct Pending {
    open: Arena<Slot<Opened>>,
    read: Arena<Slot<ReadDone>>,
    write: Arena<Slot<Written>>,
    flush: Arena<Slot<()>>,
    close: Arena<Slot<()>>,
    truncate: Arena<Slot<()>>,
}

struct Shared<F> {
    requests: mpsc::UnboundedSender<Request<F>>,
    pending: Mutex<Pending>,
}

impl<F> Shared<F> {
    fn complete(&self, response: Response) {
        let mut pending = self.pending.lock().unwrap();
        match response {
            Response::Open { index, result } => finish(pending.open.remove(index), index, result),
            Response::Read { index, result } => finish(pending.read.remove(index), index, result),
            Response::Write { index, result } => finish(pending.write.remove(index), index, result),
            Response::Flush { index, result } => finish(pending.flush.remove(index), index, result),
            Response::Close { index, result } => finish(pending.close.remove(index), index, result),
            Response::Truncate { index, result } => {
                finish(pending.truncate.remove(index), index, result)
            }
        }
    }
}

fn finish<T>(slot: Option<Slot<T>>, index: usize, result: Result<T, Error>) {
    match slot {
        // the waiter may have given up; that is not our problem
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => warn!(index, "response with no matching pending operation"),
    }
}

/// Clonable handle to a running broker.
pub struct FsClient<F> {
    shared: Arc<Shared<F>>,
}

impl<F> Clone for FsClient<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<F: Send + 'static> FsClient<F> {
    /// Wires a client to an already running dispatcher.
    ///
    /// The router task matching responses to pending operations holds
    /// only a weak reference to the client state, so dropping the last
    /// `FsClient` (and every `File`) closes the request channel, lets
    /// the dispatcher tear down, and ends the router.
    pub fn new(
        requests: mpsc::UnboundedSender<Request<F>>,
        mut responses: mpsc::UnboundedReceiver<Response>,
    ) -> Self {
        let shared = Arc::new(Shared {
            requests,
            pending: Mutex::new(Pending::default()),
        });
        let router = Arc::downgrade(&shared);
        tokio::spawn(async move {
            while let Some(response) = responses.recv().await {
                let Some(shared) = router.upgrade() else { break };
                shared.complete(response);
            }
        });
        Self { shared }
    }
}

impl<F> FsClient<F> {
    fn send(&self, request: Request<F>) -> Result<(), Error> {
        self.shared
            .requests
            .send(request)
            .map_err(|_| Error::Closed)
    }

    /// Opens `file` with explicit flags. Suspends while the broker waits
    /// for the file's lock.
    pub async fn open_with(&self, file: F, flags: OpenFlags) -> Result<File<F>, Error> {
        let (tx, rx) = oneshot::channel();
        let index = self.shared.pending.lock().unwrap().open.insert(tx);
        if let Err(e) = self.send(Request::Open { flags, file, index }) {
            self.shared.pending.lock().unwrap().open.remove(index);
            return Err(e);
        }
        let opened = rx.await.map_err(|_| Error::Closed)??;
        Ok(File {
            client: self.clone(),
            fd: opened.fd,
            released: false,
            pending_read: None,
            pending_write: None,
            pending_flush: None,
            pending_close: None,
        })
    }

    /// Read-only open of an existing file.
    pub async fn open(&self, file: F) -> Result<File<F>, Error> {
        self.open_with(file, OpenFlags::READ).await
    }

    /// Opens read-write, creating the file if it is missing.
    pub async fn create(&self, file: F) -> Result<File<F>, Error> {
        self.open_with(file, OpenFlags::CREATE | OpenFlags::WRITE)
            .await
    }

    /// Opens read-write, failing if the file already exists.
    pub async fn create_new(&self, file: F) -> Result<File<F>, Error> {
        self.open_with(file, OpenFlags::CREATE_NEW | OpenFlags::WRITE)
            .await
    }

    fn start_read(&self, fd: usize, size: usize) -> Result<Completion<ReadDone>, Error> {
        let (tx, rx) = oneshot::channel();
        let index = self.shared.pending.lock().unwrap().read.insert(tx);
        match self.send(Request::Read { fd, size, index }) {
            Ok(()) => Ok(rx),
            Err(e) => {
                self.shared.pending.lock().unwrap().read.remove(index);
                Err(e)
            }
        }
    }

    fn start_write(&self, fd: usize, buf: Bytes) -> Result<Completion<Written>, Error> {
        let (tx, rx) = oneshot::channel();
        let index = self.shared.pending.lock().unwrap().write.insert(tx);
        match self.send(Request::Write { fd, buf, index }) {
            Ok(()) => Ok(rx),
            Err(e) => {
                self.shared.pending.lock().unwrap().write.remove(index);
                Err(e)
            }
        }
    }

    fn start_flush(&self, fd: usize) -> Result<Completion<()>, Error> {
        let (tx, rx) = oneshot::channel();
        let index = self.shared.pending.lock().unwrap().flush.insert(tx);
        match self.send(Request::Flush { fd, index }) {
            Ok(()) => Ok(rx),
            Err(e) => {
                self.shared.pending.lock().unwrap().flush.remove(index);
                Err(e)
            }
        }
    }

    fn start_close(&self, fd: usize) -> Result<Completion<()>, Error> {
        let (tx, rx) = oneshot::channel();
        let index = self.shared.pending.lock().unwrap().close.insert(tx);
        match self.send(Request::Close { fd, index }) {
            Ok(()) => Ok(rx),
            Err(e) => {
                self.shared.pending.lock().unwrap().close.remove(index);
                Err(e)
            }
        }
    }

    fn start_truncate(&self, fd: usize, size: u64) -> Result<Completion<()>, Error> {
        let (tx, rx) = oneshot::channel();
        let index = self.shared.pending.lock().unwrap().truncate.insert(tx);
        match self.send(Request::Truncate { fd, size, index }) {
            Ok(()) => Ok(rx),
            Err(e) => {
                self.shared.pending.lock().unwrap().truncate.remove(index);
                Err(e)
            }
        }
    }
}

/// Spawns a dispatcher over `backend` and returns a client wired to it.
pub fn connect<B: StorageBackend>(backend: B) -> FsClient<B::FileRef> {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (resp_tx, resp_rx) = mpsc::unbounded_channel();
    tokio::spawn(Dispatcher::new(backend, req_rx, resp_tx).run());
    FsClient::new(req_tx, resp_rx)
}

/// An open descriptor on the broker.
///
/// Reads and writes go through the broker at the handle's own position;
/// there is no client-side cursor. If the `File` is dropped without
/// [`File::close`] (or `shutdown`), it sends the fire-and-forget `Drop`
/// request so the descriptor is still released.
pub struct File<F> {
    client: FsClient<F>,
    fd: usize,
    released: bool,
    pending_read: Option<Completion<ReadDone>>,
    pending_write: Option<Completion<Written>>,
    pending_flush: Option<Completion<()>>,
    pending_close: Option<Completion<()>>,
}

impl<F> File<F> {
    /// The descriptor issued by the broker.
    pub fn fd(&self) -> usize {
        self.fd
    }

    /// Releases the descriptor. The broker vacates the slot whatever the
    /// outcome, so after this returns the `File` will not send a `Drop`
    /// on drop.
    pub async fn close(&mut self) -> Result<(), Error> {
        let rx = self.client.start_close(self.fd)?;
        let result = rx.await.map_err(|_| Error::Closed)?;
        self.released = true;
        result
    }

    /// Sets the file length, zero-filling on growth. Requires a
    /// read-write handle.
    pub async fn set_len(&mut self, size: u64) -> Result<(), Error> {
        let rx = self.client.start_truncate(self.fd, size)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Asks the handle to persist buffered state.
    pub async fn sync_all(&mut self) -> Result<(), Error> {
        let rx = self.client.start_flush(self.fd)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn sync_data(&mut self) -> Result<(), Error> {
        self.sync_all().await
    }
}

impl<F> std::fmt::Debug for File<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("fd", &self.fd)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<F> Drop for File<F> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self
                .client
                .shared
                .requests
                .send(Request::Drop { fd: self.fd });
        }
    }
}

impl<F> AsyncRead for File<F> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut rx = match this.pending_read.take() {
            Some(rx) => rx,
            None => this
                .client
                .start_read(this.fd, buf.remaining())
                .map_err(io::Error::from)?,
        };
        match Pin::new(&mut rx).poll(cx) {
            Poll::Pending => {
                this.pending_read = Some(rx);
                Poll::Pending
            }
            Poll::Ready(received) => {
                let done = received
                    .map_err(|_| Error::Closed)
                    .and_then(|r| r)
                    .map_err(io::Error::from)?;
                let n = done.size.min(buf.remaining());
                buf.put_slice(&done.buf[..n]);
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl<F> AsyncWrite for File<F> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut rx = match this.pending_write.take() {
            Some(rx) => rx,
            None => this
                .client
                .start_write(this.fd, Bytes::copy_from_slice(buf))
                .map_err(io::Error::from)?,
        };
        match Pin::new(&mut rx).poll(cx) {
            Poll::Pending => {
                this.pending_write = Some(rx);
                Poll::Pending
            }
            Poll::Ready(received) => {
                let written = received
                    .map_err(|_| Error::Closed)
                    .and_then(|r| r)
                    .map_err(io::Error::from)?;
                Poll::Ready(Ok(written.size))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut rx = match this.pending_flush.take() {
            Some(rx) => rx,
            None => this.client.start_flush(this.fd).map_err(io::Error::from)?,
        };
        match Pin::new(&mut rx).poll(cx) {
            Poll::Pending => {
                this.pending_flush = Some(rx);
                Poll::Pending
            }
            Poll::Ready(received) => {
                let result = received.map_err(|_| Error::Closed).and_then(|r| r);
                Poll::Ready(result.map_err(io::Error::from))
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut rx = match this.pending_close.take() {
            Some(rx) => rx,
            None if this.released => return Poll::Ready(Ok(())),
            None => this.client.start_close(this.fd).map_err(io::Error::from)?,
        };
        match Pin::new(&mut rx).poll(cx) {
            Poll::Pending => {
                this.pending_close = Some(rx);
                Poll::Pending
            }
            Poll::Ready(received) => {
                this.released = true;
                let result = received.map_err(|_| Error::Closed).and_then(|r| r);
                Poll::Ready(result.map_err(io::Error::from))
            }
        }
    }
}

/// std-style builder over [`OpenFlags`].
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions(OpenFlags);

impl OpenOptions {
    pub fn new() -> Self {
        Self(OpenFlags::empty())
    }

    fn set(&mut self, flag: OpenFlags, value: bool) -> &mut Self {
        self.0.set(flag, value);
        self
    }

    pub fn append(&mut self, append: bool) -> &mut Self {
        self.set(OpenFlags::APPEND, append)
    }

    pub fn create(&mut self, create: bool) -> &mut Self {
        self.set(OpenFlags::CREATE, create)
    }

    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.set(OpenFlags::CREATE_NEW, create_new)
    }

    pub fn read(&mut self, read: bool) -> &mut Self {
        self.set(OpenFlags::READ, read)
    }

    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.set(OpenFlags::TRUNCATE, truncate)
    }

    pub fn write(&mut self, write: bool) -> &mut Self {
        self.set(OpenFlags::WRITE, write)
    }

    pub fn flags(&self) -> OpenFlags {
        self.0
    }

    pub async fn open<F>(&self, client: &FsClient<F>, file: F) -> Result<File<F>, Error> {
        client.open_with(file, self.0).await
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}
