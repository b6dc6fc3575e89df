// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Accounting and shutdown of accepted slave connections
//!
//! The tokio-modbus server spawns one task per accepted connection and keeps
//! it alive until the peer closes the socket. Wrapping each stream in a
//! [`TrackedStream`] lets the slave end those tasks when it stops: once the
//! run's cancellation token fires, the next read reports end-of-stream, the
//! connection task returns and the socket is dropped.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use super::modbus_server::Diagnostics;
use super::status::{ClientEvent, StatusEvent, StatusNotifier};

/// Admits connections up to a limit and counts the live ones
#[derive(Debug, Clone)]
pub(crate) struct ConnectionTracker {
    active: Arc<AtomicUsize>,
    next_client_id: Arc<AtomicU64>,
    max_connections: usize,
    status: StatusNotifier,
    diagnostics: Arc<Diagnostics>,
}

impl ConnectionTracker {
    pub(crate) fn new(
        active: Arc<AtomicUsize>,
        next_client_id: Arc<AtomicU64>,
        max_connections: usize,
        status: StatusNotifier,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            active,
            next_client_id,
            max_connections,
            status,
            diagnostics,
        }
    }

    /// Register a new connection, or refuse it when the limit is reached
    pub(crate) fn admit(&self, peer: SocketAddr) -> Option<ConnectionGuard> {
        let previous = self.active.fetch_add(1, Ordering::SeqCst);
        if previous >= self.max_connections {
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.diagnostics.record_refused_connection();
            warn!(
                "Refusing connection from {}: {} connection(s) already open",
                peer, previous
            );
            return None;
        }

        let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Client {} connected from {}", client_id, peer);
        self.status.publish(StatusEvent::Client(ClientEvent {
            client_id,
            peer,
            connected: true,
            at: Utc::now(),
        }));

        Some(ConnectionGuard {
            client_id,
            peer,
            active: self.active.clone(),
            status: self.status.clone(),
        })
    }
}

/// Live connection slot, released on drop
#[derive(Debug)]
pub(crate) struct ConnectionGuard {
    client_id: u64,
    peer: SocketAddr,
    active: Arc<AtomicUsize>,
    status: StatusNotifier,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        info!("Client {} ({}) disconnected", self.client_id, self.peer);
        self.status.publish(StatusEvent::Client(ClientEvent {
            client_id: self.client_id,
            peer: self.peer,
            connected: false,
            at: Utc::now(),
        }));
    }
}

/// TCP stream that reads as closed once the slave run is cancelled
pub(crate) struct TrackedStream {
    stream: TcpStream,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    _guard: ConnectionGuard,
}

impl TrackedStream {
    pub(crate) fn new(stream: TcpStream, token: CancellationToken, guard: ConnectionGuard) -> Self {
        let cancelled = Box::pin(token.clone().cancelled_owned());
        Self {
            stream,
            token,
            cancelled,
            _guard: guard,
        }
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // Leaving `buf` untouched signals end-of-stream
        if this.token.is_cancelled() || this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max: usize) -> (ConnectionTracker, Arc<AtomicUsize>, Arc<Diagnostics>) {
        let active = Arc::new(AtomicUsize::new(0));
        let diagnostics = Arc::new(Diagnostics::default());
        let tracker = ConnectionTracker::new(
            active.clone(),
            Arc::new(AtomicU64::new(0)),
            max,
            StatusNotifier::new(),
            diagnostics.clone(),
        );
        (tracker, active, diagnostics)
    }

    #[test]
    fn test_admit_respects_limit() {
        let (tracker, active, diagnostics) = tracker(2);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let first = tracker.admit(peer).unwrap();
        let _second = tracker.admit(peer).unwrap();
        assert!(tracker.admit(peer).is_none());
        assert_eq!(active.load(Ordering::SeqCst), 2);
        assert_eq!(diagnostics.snapshot(0).refused_connections, 1);

        drop(first);
        assert_eq!(active.load(Ordering::SeqCst), 1);
        assert!(tracker.admit(peer).is_some());
    }

    #[tokio::test]
    async fn test_client_events_are_published() {
        let (tracker, _, _) = tracker(1);
        let mut events = tracker.status.subscribe();
        let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();

        let guard = tracker.admit(peer).unwrap();
        drop(guard);

        match events.recv().await.unwrap() {
            StatusEvent::Client(event) => {
                assert!(event.connected);
                assert_eq!(event.peer, peer);
                assert_eq!(event.client_id, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match events.recv().await.unwrap() {
            StatusEvent::Client(event) => assert!(!event.connected),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_stream_reads_as_closed() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();

        let (tracker, active, _) = tracker(1);
        let token = CancellationToken::new();
        let guard = tracker.admit(peer).unwrap();
        let mut stream = TrackedStream::new(server_side, token.clone(), guard);

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await.unwrap();
            drop(stream);
            n
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        token.cancel();

        let n = tokio::time::timeout(std::time::Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
