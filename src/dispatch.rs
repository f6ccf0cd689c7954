//! The dispatcher: a single task that receives requests, drives them
//! against the descriptor table and the storage backend, and emits
//! exactly one response per correlated request.
//!
//! Only `Open` can suspend, waiting for the backend to grant access. It
//! runs as a future in an unordered in-flight set polled by the same
//! task, so later requests are served while it waits and every table
//! mutation still happens on the dispatcher task. All other handlers
//! contain no await point and therefore run atomically with respect to
//! each other.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::arena::Arena;
use crate::error::Error;
use crate::protocol::{OpenFlags, Opened, ReadDone, Request, Response, Written};
use crate::storage::{FileHandle, StorageBackend};

type PendingOpen<H> = BoxFuture<'static, (usize, io::Result<H>)>;

enum Step<F, H> {
    Request(Option<Request<F>>),
    Opened(usize, io::Result<H>),
}

/// Single-actor request dispatcher owning the descriptor table.
///
/// The table lives and dies with the dispatcher; on teardown every
/// handle still registered is closed and in-flight opens are settled
/// with an error, so no lock outlives the broker.
pub struct Dispatcher<B: StorageBackend> {
    backend: Arc<B>,
    table: Arena<B::Handle>,
    requests: mpsc::UnboundedReceiver<Request<B::FileRef>>,
    responses: mpsc::UnboundedSender<Response>,
    pending_opens: FuturesUnordered<PendingOpen<B::Handle>>,
}

impl<B: StorageBackend> Dispatcher<B> {
    pub fn new(
        backend: B,
        requests: mpsc::UnboundedReceiver<Request<B::FileRef>>,
        responses: mpsc::UnboundedSender<Response>,
    ) -> Self {
        Self {
            backend: Arc::new(backend),
            table: Arena::new(),
            requests,
            responses,
            pending_opens: FuturesUnordered::new(),
        }
    }

    /// Serves requests until every request sender is dropped, then tears
    /// down: handles left in the table are closed, in-flight opens are
    /// settled (their handle closed, their caller answered with a
    /// shutdown error).
    pub async fn run(mut self) {
        loop {
            let step = {
                let requests = &mut self.requests;
                let pending = &mut self.pending_opens;
                tokio::select! {
                    request = requests.recv() => Step::Request(request),
                    Some((index, result)) = pending.next(), if !pending.is_empty() => {
                        Step::Opened(index, result)
                    }
                }
            };
            match step {
                Step::Request(Some(request)) => self.handle(request),
                Step::Request(None) => break,
                Step::Opened(index, result) => self.finish_open(index, result),
            }
        }
        self.shutdown().await;
    }

    fn handle(&mut self, request: Request<B::FileRef>) {
        match request {
            Request::Open { flags, file, index } => self.start_open(flags, file, index),
            Request::Drop { fd } => self.drop_fd(fd),
            Request::Read { fd, size, index } => {
                let result = self.read(fd, size);
                self.respond(Response::Read { index, result });
            }
            Request::Write { fd, buf, index } => {
                let result = self.write(fd, &buf);
                self.respond(Response::Write { index, result });
            }
            Request::Flush { fd, index } => {
                let result = self.flush(fd);
                self.respond(Response::Flush { index, result });
            }
            Request::Close { fd, index } => {
                let result = self.close(fd);
                self.respond(Response::Close { index, result });
            }
            Request::Truncate { fd, size, index } => {
                let result = self.truncate(fd, size);
                self.respond(Response::Truncate { index, result });
            }
        }
    }

    fn start_open(&mut self, flags: OpenFlags, file: B::FileRef, index: usize) {
        let backend = Arc::clone(&self.backend);
        self.pending_opens.push(Box::pin(async move {
            (index, backend.acquire(&file, flags).await)
        }));
    }

    /// Runs on the dispatcher task once an acquisition resolves; this is
    /// the only place descriptors are inserted, so two in-flight opens
    /// can never race on a slot.
    fn finish_open(&mut self, index: usize, result: io::Result<B::Handle>) {
        let result = result
            .map(|handle| Opened {
                fd: self.table.insert(handle),
            })
            .map_err(Error::from);
        if let Ok(opened) = &result {
            debug!(fd = opened.fd, index, "descriptor opened");
        }
        self.respond(Response::Open { index, result });
    }

    fn read(&mut self, fd: usize, size: usize) -> Result<ReadDone, Error> {
        let handle = self.table.get_mut(fd).ok_or(Error::UnknownFd(fd))?;
        let mut buf = BytesMut::zeroed(size);
        let size = handle.read(&mut buf)?;
        Ok(ReadDone {
            buf: buf.freeze(),
            size,
        })
    }

    fn write(&mut self, fd: usize, buf: &[u8]) -> Result<Written, Error> {
        let handle = self.table.get_mut(fd).ok_or(Error::UnknownFd(fd))?;
        let size = handle.write(buf)?;
        Ok(Written { size })
    }

    fn flush(&mut self, fd: usize) -> Result<(), Error> {
        let handle = self.table.get_mut(fd).ok_or(Error::UnknownFd(fd))?;
        handle.flush()?;
        Ok(())
    }

    /// Close vacates the slot before releasing the handle: the
    /// descriptor is gone even if the release itself fails, and may be
    /// reused by a later open.
    fn close(&mut self, fd: usize) -> Result<(), Error> {
        let handle = self.table.remove(fd).ok_or(Error::UnknownFd(fd))?;
        handle.close()?;
        Ok(())
    }

    fn truncate(&mut self, fd: usize, size: u64) -> Result<(), Error> {
        let handle = self.table.get_mut(fd).ok_or(Error::UnknownFd(fd))?;
        handle.truncate(size)?;
        Ok(())
    }

    fn drop_fd(&mut self, fd: usize) {
        match self.table.remove(fd) {
            Some(handle) => {
                if let Err(error) = handle.close() {
                    warn!(fd, %error, "releasing dropped descriptor failed");
                }
            }
            None => warn!(fd, "drop for unknown descriptor ignored"),
        }
    }

    fn respond(&self, response: Response) {
        if self.responses.send(response).is_err() {
            debug!("response channel closed, reply discarded");
        }
    }

    async fn shutdown(mut self) {
        let live = self.table.len();
        if live > 0 {
            debug!(live, "closing descriptors left in the table");
        }
        for handle in self.table.drain() {
            if let Err(error) = handle.close() {
                warn!(%error, "closing leftover handle failed");
            }
        }
        // settle stragglers after the table released its locks
        while let Some((index, result)) = self.pending_opens.next().await {
            let result = match result {
                Ok(handle) => {
                    let _ = handle.close();
                    Err(Error::Closed)
                }
                Err(error) => Err(Error::from(error)),
            };
            self.respond(Response::Open { index, result });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    type ReqTx = mpsc::UnboundedSender<Request<String>>;
    type RespRx = mpsc::UnboundedReceiver<Response>;

    fn spawn_memory() -> (ReqTx, RespRx) {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        tokio::spawn(Dispatcher::new(MemoryBackend::new(), req_rx, resp_tx).run());
        (req_tx, resp_rx)
    }

    const RW: OpenFlags = OpenFlags::CREATE.union(OpenFlags::WRITE);

    #[tokio::test]
    async fn end_to_end_scenario() {
        let (req, mut resp) = spawn_memory();

        req.send(Request::Open {
            flags: RW,
            file: "f".into(),
            index: 1,
        })
        .unwrap();
        match resp.recv().await.unwrap() {
            Response::Open { index: 1, result } => assert_eq!(result.unwrap().fd, 0),
            other => panic!("unexpected response: {other:?}"),
        }

        req.send(Request::Write {
            fd: 0,
            buf: Bytes::from_static(b"hi"),
            index: 2,
        })
        .unwrap();
        match resp.recv().await.unwrap() {
            Response::Write { index: 2, result } => assert_eq!(result.unwrap().size, 2),
            other => panic!("unexpected response: {other:?}"),
        }

        req.send(Request::Flush { fd: 0, index: 3 }).unwrap();
        match resp.recv().await.unwrap() {
            Response::Flush { index: 3, result } => result.unwrap(),
            other => panic!("unexpected response: {other:?}"),
        }

        req.send(Request::Close { fd: 0, index: 4 }).unwrap();
        match resp.recv().await.unwrap() {
            Response::Close { index: 4, result } => result.unwrap(),
            other => panic!("unexpected response: {other:?}"),
        }

        // close vacated the slot, the drop is a logged no-op
        req.send(Request::Drop { fd: 0 }).unwrap();

        // the vacated descriptor is reused by the next open
        req.send(Request::Open {
            flags: OpenFlags::WRITE,
            file: "f".into(),
            index: 5,
        })
        .unwrap();
        match resp.recv().await.unwrap() {
            Response::Open { index: 5, result } => assert_eq!(result.unwrap().fd, 0),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_descriptor_reports_instead_of_crashing() {
        let (req, mut resp) = spawn_memory();

        req.send(Request::Read {
            fd: 7,
            size: 16,
            index: 10,
        })
        .unwrap();
        req.send(Request::Write {
            fd: 7,
            buf: Bytes::from_static(b"x"),
            index: 11,
        })
        .unwrap();
        req.send(Request::Flush { fd: 7, index: 12 }).unwrap();
        req.send(Request::Close { fd: 7, index: 13 }).unwrap();
        req.send(Request::Truncate {
            fd: 7,
            size: 0,
            index: 14,
        })
        .unwrap();

        for expected in 10..=14 {
            let response = resp.recv().await.unwrap();
            assert_eq!(response.index(), expected);
            assert!(response.is_err(), "fd 7 was never issued: {response:?}");
        }

        // the dispatcher survived all five failures
        req.send(Request::Open {
            flags: RW,
            file: "alive".into(),
            index: 15,
        })
        .unwrap();
        match resp.recv().await.unwrap() {
            Response::Open { index: 15, result } => assert_eq!(result.unwrap().fd, 0),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_vacates_the_slot() {
        let (req, mut resp) = spawn_memory();

        req.send(Request::Open {
            flags: RW,
            file: "c".into(),
            index: 1,
        })
        .unwrap();
        let fd = match resp.recv().await.unwrap() {
            Response::Open { result, .. } => result.unwrap().fd,
            other => panic!("unexpected response: {other:?}"),
        };

        req.send(Request::Close { fd, index: 2 }).unwrap();
        match resp.recv().await.unwrap() {
            Response::Close { index: 2, result } => result.unwrap(),
            other => panic!("unexpected response: {other:?}"),
        }

        req.send(Request::Write {
            fd,
            buf: Bytes::from_static(b"stale"),
            index: 3,
        })
        .unwrap();
        match resp.recv().await.unwrap() {
            Response::Write { index: 3, result } => {
                assert!(matches!(result, Err(Error::UnknownFd(f)) if f == fd));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn drop_of_unknown_descriptor_is_a_noop() {
        let (req, mut resp) = spawn_memory();

        req.send(Request::Drop { fd: 42 }).unwrap();
        // no response for the drop; the next correlated request answers
        req.send(Request::Flush { fd: 0, index: 1 }).unwrap();
        let response = resp.recv().await.unwrap();
        assert_eq!(response.index(), 1);
        assert!(matches!(response, Response::Flush { .. }));
    }

    #[tokio::test]
    async fn delayed_open_lets_later_requests_overtake() {
        let (req, mut resp) = spawn_memory();

        req.send(Request::Open {
            flags: RW,
            file: "a".into(),
            index: 1,
        })
        .unwrap();
        match resp.recv().await.unwrap() {
            Response::Open { index: 1, result } => assert_eq!(result.unwrap().fd, 0),
            other => panic!("unexpected response: {other:?}"),
        }

        // fd 0 holds the exclusive lock on "a", so this open suspends
        req.send(Request::Open {
            flags: OpenFlags::WRITE,
            file: "a".into(),
            index: 2,
        })
        .unwrap();
        // while this one resolves immediately
        req.send(Request::Open {
            flags: RW,
            file: "b".into(),
            index: 3,
        })
        .unwrap();

        match resp.recv().await.unwrap() {
            Response::Open { index: 3, result } => assert_eq!(result.unwrap().fd, 1),
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(
            timeout(Duration::from_millis(50), resp.recv()).await.is_err(),
            "the open of a locked file must stay pending"
        );

        // releasing fd 0 unblocks the suspended open, which reuses slot 0
        req.send(Request::Drop { fd: 0 }).unwrap();
        match resp.recv().await.unwrap() {
            Response::Open { index: 2, result } => assert_eq!(result.unwrap().fd, 0),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_continues_at_the_position_a_short_write_left() {
        use async_trait::async_trait;

        // writes at most four bytes per call
        struct ShortWriteBackend;
        struct ShortWriteHandle {
            data: Vec<u8>,
            pos: usize,
        }

        #[async_trait]
        impl StorageBackend for ShortWriteBackend {
            type FileRef = ();
            type Handle = ShortWriteHandle;

            async fn acquire(&self, _file: &(), _flags: OpenFlags) -> io::Result<ShortWriteHandle> {
                Ok(ShortWriteHandle {
                    data: Vec::new(),
                    pos: 0,
                })
            }
        }

        impl FileHandle for ShortWriteHandle {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let pos = self.pos.min(self.data.len());
                let n = buf.len().min(self.data.len() - pos);
                buf[..n].copy_from_slice(&self.data[pos..pos + n]);
                self.pos = pos + n;
                Ok(n)
            }
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                let n = buf.len().min(4);
                let end = self.pos + n;
                if self.data.len() < end {
                    self.data.resize(end, 0);
                }
                self.data[self.pos..end].copy_from_slice(&buf[..n]);
                self.pos = end;
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
            fn truncate(&mut self, size: u64) -> io::Result<()> {
                self.data.resize(size as usize, 0);
                self.pos = self.pos.min(size as usize);
                Ok(())
            }
            fn close(self) -> io::Result<()> {
                Ok(())
            }
        }

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, mut resp) = mpsc::unbounded_channel();
        tokio::spawn(Dispatcher::new(ShortWriteBackend, req_rx, resp_tx).run());

        req_tx
            .send(Request::Open {
                flags: OpenFlags::WRITE,
                file: (),
                index: 1,
            })
            .unwrap();
        match resp.recv().await.unwrap() {
            Response::Open { index: 1, result } => assert_eq!(result.unwrap().fd, 0),
            other => panic!("unexpected response: {other:?}"),
        }

        // ten bytes submitted, only four accepted
        req_tx
            .send(Request::Write {
                fd: 0,
                buf: Bytes::from_static(b"0123456789"),
                index: 2,
            })
            .unwrap();
        match resp.recv().await.unwrap() {
            Response::Write { index: 2, result } => assert_eq!(result.unwrap().size, 4),
            other => panic!("unexpected response: {other:?}"),
        }

        // the handle position moved past the written prefix, so a read
        // directly after sees end-of-stream rather than the prefix
        req_tx
            .send(Request::Read {
                fd: 0,
                size: 16,
                index: 3,
            })
            .unwrap();
        match resp.recv().await.unwrap() {
            Response::Read { index: 3, result } => assert_eq!(result.unwrap().size, 0),
            other => panic!("unexpected response: {other:?}"),
        }

        // truncating back to zero clamps the position for the next write
        req_tx
            .send(Request::Truncate {
                fd: 0,
                size: 0,
                index: 4,
            })
            .unwrap();
        match resp.recv().await.unwrap() {
            Response::Truncate { index: 4, result } => result.unwrap(),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
