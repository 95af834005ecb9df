//! Router server
//!
//! Accepts client connections and keeps them open; every request is answered
//! asynchronously once its write or read completes, so one connection may
//! have many requests in flight.

use crate::common::decision_log::DecisionLog;
use crate::common::protocol::{ClientRequest, ClientResponse};
use crate::common::transport::{read_frame, write_frame};
use crate::common::types::ClientId;
use crate::common::utils::lock;
use crate::common::{Config, Result};
use crate::coordinator::router::{Outcomes, Router};
use crate::coordinator::shard_client::{RemoteShards, ShardClient};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// One connected client: its response channel and the requests still owed
/// an answer
struct ClientEntry {
    sender: mpsc::UnboundedSender<ClientResponse>,
    outstanding: usize,
    closing: bool,
}

/// Response channels of connected clients
#[derive(Default)]
struct Clients {
    entries: Mutex<HashMap<ClientId, ClientEntry>>,
    next_id: AtomicU64,
}

impl Clients {
    fn register(&self) -> (ClientId, mpsc::UnboundedReceiver<ClientResponse>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, rx) = mpsc::unbounded_channel();
        let entry = ClientEntry {
            sender,
            outstanding: 0,
            closing: false,
        };
        lock(&self.entries).insert(id, entry);
        (id, rx)
    }

    /// Count a request that will be answered through [`send`](Self::send).
    fn accept(&self, id: ClientId) {
        if let Some(entry) = lock(&self.entries).get_mut(&id) {
            entry.outstanding += 1;
        }
    }

    /// The client sent its last request. Its channel closes once every
    /// accepted request has been answered.
    fn close(&self, id: ClientId) {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get_mut(&id) {
            entry.closing = true;
            if entry.outstanding == 0 {
                entries.remove(&id);
            }
        }
    }

    fn send(&self, id: ClientId, response: ClientResponse) {
        let client_tx_id = response.client_tx_id();
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(&id) else {
            tracing::debug!(
                "Client {} gone, dropping response for client tx {}",
                id,
                client_tx_id
            );
            return;
        };

        entry.outstanding = entry.outstanding.saturating_sub(1);
        if entry.sender.send(response).is_err() {
            tracing::debug!("Client {} stopped reading, response for {} lost", id, client_tx_id);
        }
        if entry.closing && entry.outstanding == 0 {
            entries.remove(&id);
        }
    }
}

pub struct RouterServer<C> {
    router: Arc<Router<C>>,
    outcomes: Outcomes,
    listener: TcpListener,
    clients: Arc<Clients>,
}

impl RouterServer<RemoteShards> {
    /// Build the router against the configured shards, recover unfinished
    /// writes from the coordinator log and bind the client address.
    pub async fn open(config: &Config) -> Result<Self> {
        let cluster = Arc::new(config.cluster.clone());
        let router_config = &config.router;

        tracing::info!("Starting router");
        tracing::info!("  Listen: {}", cluster.router_addr);
        tracing::info!("  Shards: {:?}", cluster.shards);
        tracing::info!("  Read timeout: {:?}", router_config.read_timeout());

        let log = match &router_config.log_path {
            Some(path) => {
                tracing::info!("  Decision log: {}", path.display());
                Some(DecisionLog::open(path, router_config.log_sync)?)
            }
            None => None,
        };

        let shards = Arc::new(RemoteShards::new(
            cluster.clone(),
            router_config.connect_timeout(),
        ));
        let (router, outcomes) = Router::new(cluster.clone(), shards, router_config, log)?;

        let resumed = router.recover()?;
        if resumed > 0 {
            tracing::info!("Resumed {} unfinished transactions", resumed);
        }

        Self::bind(cluster.router_addr, router, outcomes).await
    }
}

impl<C: ShardClient> RouterServer<C> {
    pub async fn bind(
        addr: SocketAddr,
        router: Arc<Router<C>>,
        outcomes: Outcomes,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            router,
            outcomes,
            listener,
            clients: Arc::new(Clients::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn router(&self) -> Arc<Router<C>> {
        self.router.clone()
    }

    /// Accept clients and deliver outcomes until the listener fails.
    pub async fn serve(self) -> Result<()> {
        let Self {
            router,
            outcomes,
            listener,
            clients,
        } = self;

        tokio::spawn(deliver(outcomes, clients.clone()));
        tracing::info!("✓ Router ready on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            let router = router.clone();
            let clients = clients.clone();
            tokio::spawn(async move {
                let (client, responses) = clients.register();
                tracing::debug!("Client {} connected from {}", client, peer);
                if let Err(e) = handle_client(&router, &clients, client, stream, responses).await {
                    tracing::debug!("Client {} disconnected: {}", client, e);
                }
            });
        }
    }
}

/// Route completed writes and reads back to the client that asked.
async fn deliver(mut outcomes: Outcomes, clients: Arc<Clients>) {
    loop {
        let (client, response) = tokio::select! {
            Some(write) = outcomes.writes.recv() => (
                write.client,
                ClientResponse::Put {
                    success: write.success,
                    client_tx_id: write.client_tx_id,
                },
            ),
            Some(read) = outcomes.reads.recv() => (
                read.client,
                ClientResponse::Get {
                    client_tx_id: read.client_tx_id,
                    values: read.values,
                },
            ),
            else => break,
        };
        clients.send(client, response);
    }
}

async fn handle_client<C: ShardClient>(
    router: &Router<C>,
    clients: &Clients,
    client: ClientId,
    stream: TcpStream,
    mut responses: mpsc::UnboundedReceiver<ClientResponse>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let writer_task = tokio::spawn(async move {
        while let Some(response) = responses.recv().await {
            if let Err(e) = write_frame(&mut writer, &response).await {
                tracing::debug!("Write to client failed: {}", e);
                break;
            }
        }
    });

    let result: Result<()> = async {
        while let Some(request) = read_frame::<_, ClientRequest>(&mut reader).await? {
            // Answered if the router refuses it, so every request gets
            // exactly one response.
            let refusal = match &request {
                ClientRequest::Put { client_tx_id, .. } => ClientResponse::Put {
                    success: false,
                    client_tx_id: *client_tx_id,
                },
                ClientRequest::Get { client_tx_id, .. } => ClientResponse::Get {
                    client_tx_id: *client_tx_id,
                    values: Default::default(),
                },
            };
            clients.accept(client);
            if let Err(e) = router.handle(client, request) {
                tracing::warn!("Client {} request rejected: {}", client, e);
                clients.send(client, refusal);
            }
        }
        Ok(())
    }
    .await;

    // A half-closed client still gets the answers it is owed; the writer
    // stops once they are all sent.
    clients.close(client);
    if let Err(e) = writer_task.await {
        tracing::debug!("Client {} writer failed: {}", client, e);
    }
    result
}
