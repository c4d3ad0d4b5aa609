pub mod config;
pub mod handler;
pub mod server;
pub mod statistics;

use self::{
    config::Config,
    handler::Handler,
    server::{Command, Sockets, Workers},
    statistics::{Counts, Statistics},
};

use std::{net::SocketAddr, sync::Arc, time::Instant};

use anyhow::Result;
use bytes::Bytes;
use service::{CandidateDescriptor, ConnectionHandle, LocalDescription, ServiceOptions};
use tokio::{net::UdpSocket, sync::mpsc::channel, task::JoinSet};

pub type Service = service::Service<Handler>;

/// queued commands of one peer task before datagrams are dropped.
const WORKER_QUEUE_SIZE: usize = 512;

/// The restreaming engine bound to its sockets.
///
/// This is the surface the signaling collaborator drives: it creates a
/// peer connection for every browser, relays the local description and
/// trickles the remote candidates in. Media starts flowing to a peer on
/// its own once ICE and DTLS completed.
#[derive(Clone)]
pub struct Restream {
    config: Arc<Config>,
    service: Service,
    workers: Workers,
    sockets: Sockets,
    upstream: Arc<UdpSocket>,
    statistics: Statistics,
}

impl Restream {
    /// Bind the upstream socket and every peer-facing interface.
    pub async fn bind(config: Config) -> Result<Self> {
        let workers = Workers::default();
        let statistics = Statistics::default();
        let service = service::Service::new(ServiceOptions {
            interfaces: config.interfaces(),
            peer: config.peer_options(),
            pool_capacity: config.pool.buffers,
            buffer_size: config.pool.buffer_size,
            handler: Handler::new(workers.clone(), statistics.clone()),
        })?;

        Ok(Self {
            upstream: Arc::new(UdpSocket::bind(config.server.upstream).await?),
            sockets: Sockets::bind(&config.interfaces()).await?,
            config: Arc::new(config),
            statistics,
            workers,
            service,
        })
    }

    /// Run the receive loops until one of them fails.
    pub async fn run(&self) -> Result<()> {
        let mut workers = JoinSet::new();

        workers.spawn(server::upstream::start(
            self.upstream.clone(),
            self.config.server.mtu,
            self.workers.clone(),
            self.statistics.clone(),
        ));

        for (listen, socket) in self.sockets.iter() {
            workers.spawn(server::listen(
                *listen,
                socket.clone(),
                self.config.server.mtu,
                self.service.clone(),
                self.workers.clone(),
            ));
        }

        if let Some(res) = workers.join_next().await {
            workers.abort_all();

            return res?;
        }

        Ok(())
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn upstream_addr(&self) -> Result<SocketAddr> {
        Ok(self.upstream.local_addr()?)
    }

    /// Create a peer connection for a browser and start its task.
    pub fn create_peer_connection(&self, remote_fingerprint: &str) -> Result<ConnectionHandle> {
        let handle = self
            .service
            .create_peer_connection(remote_fingerprint, Instant::now())?;

        let (sender, receiver) = channel(WORKER_QUEUE_SIZE);
        self.workers.insert(handle, sender);
        self.statistics.register(handle);

        tokio::spawn(server::worker::run(
            handle,
            self.service.clone(),
            self.sockets.clone(),
            self.statistics.get_reporter(handle),
            receiver,
        ));

        Ok(handle)
    }

    pub fn local_description(&self, handle: ConnectionHandle) -> Result<LocalDescription> {
        Ok(self.service.local_description(handle)?)
    }

    pub fn set_remote_credentials(
        &self,
        handle: ConnectionHandle,
        ufrag: &str,
        pwd: &str,
    ) -> Result<()> {
        self.service.set_remote_credentials(handle, ufrag, pwd)?;
        self.wake(handle);
        Ok(())
    }

    pub fn add_remote_candidate(
        &self,
        handle: ConnectionHandle,
        descriptor: &CandidateDescriptor,
    ) -> Result<()> {
        self.service
            .add_remote_candidate(handle, descriptor, Instant::now())?;
        self.wake(handle);
        Ok(())
    }

    pub fn send_data(
        &self,
        handle: ConnectionHandle,
        stream: u16,
        data: Bytes,
        binary: bool,
    ) -> Result<()> {
        self.service
            .send_data(handle, stream, data, binary, Instant::now())?;
        self.wake(handle);
        Ok(())
    }

    pub fn open_channel(&self, handle: ConnectionHandle, stream: u16, label: &str) -> Result<()> {
        self.service
            .open_channel(handle, stream, label, Instant::now())?;
        self.wake(handle);
        Ok(())
    }

    /// Close a peer connection, idempotent.
    ///
    /// The last datagrams of the connection are sent before returning.
    pub async fn close_connection(&self, handle: ConnectionHandle) -> Result<()> {
        for transmit in self.service.close_connection(handle) {
            self.sockets.send(&transmit).await?;
        }

        Ok(())
    }

    pub fn peer_statistics(&self, handle: ConnectionHandle) -> Option<Counts<usize>> {
        self.statistics.get(handle)
    }

    fn wake(&self, handle: ConnectionHandle) {
        self.workers.dispatch(handle, Command::Wake);
    }
}

/// In order to let the integration test directly use the crate and start
/// the server, a function is opened to replace the main function to
/// directly start the server.
pub async fn start_server(config: Config) -> Result<()> {
    Restream::bind(config).await?.run().await
}
