//! UDP serve loop: receive a datagram, dispatch it on its own task, send the reply to the sender.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use chute_core::{encode_reply, ErrorReason, Reply, MAX_DATAGRAM};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

use crate::dispatch::Dispatcher;

pub struct Server {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl Server {
    /// Bind the listen socket. `max_in_flight` bounds how many datagrams are handled at once.
    pub async fn bind(
        addr: SocketAddr,
        dispatcher: Dispatcher,
        max_in_flight: usize,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let cap = Semaphore::MAX_PERMITS.min(u32::MAX as usize);
        let max_in_flight = max_in_flight.clamp(1, cap);
        Ok(Self {
            socket: Arc::new(socket),
            dispatcher: Arc::new(dispatcher),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until the task is dropped.
    pub async fn run(self) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes, then wait for in-flight requests to be answered.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(addr = %self.local_addr()?, "listening");
        tokio::pin!(shutdown);
        // One byte of slack so an oversized datagram is not silently truncated to a valid one.
        let mut buf = vec![0u8; MAX_DATAGRAM + 1];
        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                p = self.permits.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let (n, from) = tokio::select! {
                _ = &mut shutdown => break,
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(e) => {
                        // e.g. ICMP port unreachable surfacing from a previous send.
                        tracing::warn!(error = %e, "recv failed");
                        continue;
                    }
                },
            };
            let datagram = buf[..n].to_vec();
            let socket = self.socket.clone();
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                let reply = respond(dispatcher, datagram).await;
                send_reply(&socket, &reply, from).await;
                drop(permit);
            });
        }

        tracing::info!("shutting down; waiting for in-flight requests");
        let all = u32::try_from(self.max_in_flight).unwrap_or(u32::MAX);
        let _ = self.permits.acquire_many(all).await;
        let open = self.dispatcher.sessions().len().await;
        if open > 0 {
            tracing::warn!(open, "sessions left open at shutdown");
        }
        Ok(())
    }
}

/// Run the dispatcher on a separate task so a panic becomes `ERR|INTERNAL` instead of a lost reply.
async fn respond(dispatcher: Arc<Dispatcher>, datagram: Vec<u8>) -> Reply {
    if datagram.len() > MAX_DATAGRAM {
        return Reply::error(ErrorReason::Malformed, ["datagram too large".to_string()]);
    }
    let handled = tokio::spawn(async move { dispatcher.handle_datagram(&datagram).await });
    match handled.await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!(error = %e, "request handler panicked");
            Reply::error(ErrorReason::Internal, [])
        }
    }
}

async fn send_reply(socket: &UdpSocket, reply: &Reply, to: SocketAddr) {
    let bytes = match encode_reply(reply) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, ?reply, "reply not encodable");
            match encode_reply(&Reply::error(ErrorReason::Malformed, [])) {
                Ok(b) => b,
                Err(_) => return,
            }
        }
    };
    if let Err(e) = socket.send_to(&bytes, to).await {
        tracing::warn!(%to, error = %e, "send failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialStore, FileCredentialStore};
    use crate::ledger::JsonLinesLedger;
    use chute_core::{decode_reply, encode_request, Request};
    use std::time::Duration;

    async fn start_server(dir: &std::path::Path) -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
        start_server_with(dir, Arc::new(FileCredentialStore::in_memory())).await
    }

    async fn start_server_with(
        dir: &std::path::Path,
        credentials: Arc<dyn CredentialStore>,
    ) -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
        let storage = dir.join("storage");
        std::fs::create_dir_all(&storage).unwrap();
        let dispatcher = Dispatcher::new(
            storage,
            1 << 20,
            credentials,
            Arc::new(JsonLinesLedger::new(dir.join("t.jsonl"))),
        );
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), dispatcher, 4)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));
        (addr, tx)
    }

    async fn exchange(sock: &UdpSocket, bytes: &[u8]) -> Reply {
        sock.send(bytes).await.unwrap();
        let mut buf = vec![0u8; 2048];
        let n = tokio::time::timeout(Duration::from_secs(5), sock.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        decode_reply(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn replies_go_to_sender() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _stop) = start_server(dir.path()).await;
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.connect(addr).await.unwrap();
        let reg = encode_request(&Request::Register {
            username: "alice".into(),
            password: "pw".into(),
        })
        .unwrap();
        assert_eq!(exchange(&sock, &reg).await, Reply::RegisterOk);
        assert_eq!(
            exchange(&sock, b"garbage").await,
            Reply::error(ErrorReason::NoHeader, [])
        );
    }

    struct PanickingCredentials;

    impl CredentialStore for PanickingCredentials {
        fn authenticate(&self, _: &str, _: &str) -> bool {
            panic!("credential backend crashed")
        }

        fn create(&self, _: &str, _: &str) -> bool {
            panic!("credential backend crashed")
        }
    }

    #[tokio::test]
    async fn loop_survives_a_panicking_handler() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _stop) = start_server_with(dir.path(), Arc::new(PanickingCredentials)).await;
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.connect(addr).await.unwrap();
        let login = encode_request(&Request::Login {
            username: "alice".into(),
            password: "pw".into(),
        })
        .unwrap();
        let start = encode_request(&Request::Start {
            filename: "a.bin".into(),
            fragment_count: 1,
            total_size: 3,
            uploader: "alice".into(),
        })
        .unwrap();
        for _ in 0..3 {
            assert_eq!(
                exchange(&sock, &login).await,
                Reply::error(ErrorReason::Internal, [])
            );
        }
        assert_eq!(
            exchange(&sock, &start).await,
            Reply::StartAck {
                filename: "a.bin".into()
            }
        );
        assert_eq!(
            exchange(&sock, b"garbage").await,
            Reply::error(ErrorReason::NoHeader, [])
        );
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("storage");
        std::fs::create_dir_all(&storage).unwrap();
        let dispatcher = Dispatcher::new(
            storage,
            1 << 20,
            Arc::new(FileCredentialStore::in_memory()),
            Arc::new(JsonLinesLedger::new(dir.path().join("t.jsonl"))),
        );
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), dispatcher, 1)
            .await
            .unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        let r = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert!(matches!(r, Ok(Ok(Ok(())))));
    }
}
