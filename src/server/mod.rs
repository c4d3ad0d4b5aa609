pub mod upstream;
pub mod worker;

use std::{io::ErrorKind, net::SocketAddr, sync::Arc};

use ahash::{HashMap, HashMapExt};
use anyhow::Result;
use bytes::{Bytes, BytesMut};
use codec::PacketKind;
use parking_lot::RwLock;
use service::{ConnectionHandle, Transmit};
use tokio::{net::UdpSocket, sync::mpsc::Sender};

use crate::Service;

/// Work handed to the task of one peer connection.
#[derive(Debug)]
pub enum Command {
    /// a datagram received from the browser.
    Input {
        source: SocketAddr,
        destination: SocketAddr,
        bytes: Bytes,
    },
    /// one validated upstream RTP or RTCP datagram.
    Media(Bytes),
    /// state was changed from outside the task, transmits and the next
    /// timeout need to be looked at again.
    Wake,
}

struct Worker {
    sender: Sender<Command>,
    connected: bool,
}

/// The tasks of all live peer connections.
///
/// The media fan-out set is the subset of workers whose connection was
/// last reported `Connected`.
#[derive(Clone, Default)]
pub struct Workers(Arc<RwLock<HashMap<ConnectionHandle, Worker>>>);

impl Workers {
    pub fn insert(&self, handle: ConnectionHandle, sender: Sender<Command>) {
        self.0.write().insert(
            handle,
            Worker {
                connected: false,
                sender,
            },
        );
    }

    /// Dropping the sender ends the task once its queue is drained.
    pub fn remove(&self, handle: ConnectionHandle) {
        self.0.write().remove(&handle);
    }

    pub fn set_connected(&self, handle: ConnectionHandle, connected: bool) {
        if let Some(worker) = self.0.write().get_mut(&handle) {
            worker.connected = connected;
        }
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Queue a command without waiting, `false` when the task is gone or
    /// its queue is full.
    pub fn dispatch(&self, handle: ConnectionHandle, command: Command) -> bool {
        self.0
            .read()
            .get(&handle)
            .map(|it| it.sender.try_send(command).is_ok())
            .unwrap_or(false)
    }

    /// Hand one upstream datagram to every connected peer.
    ///
    /// Never waits on a peer, a peer with a full queue loses the packet.
    /// Returns the number of peers that did not take it.
    pub fn fan_out(&self, bytes: &Bytes) -> usize {
        let mut dropped = 0;

        for worker in self.0.read().values().filter(|it| it.connected) {
            if worker.sender.try_send(Command::Media(bytes.clone())).is_err() {
                dropped += 1;
            }
        }

        dropped
    }
}

/// Peer-facing sockets by the address they were configured to listen on,
/// which is also the base of the host candidates gathered on them.
#[derive(Clone, Default)]
pub struct Sockets(Arc<HashMap<SocketAddr, Arc<UdpSocket>>>);

impl Sockets {
    pub async fn bind(interfaces: &[service::Interface]) -> Result<Self> {
        let mut sockets = HashMap::with_capacity(interfaces.len());
        for interface in interfaces {
            let socket = UdpSocket::bind(interface.listen).await?;

            log::info!(
                "peer interface listening: listen={}, external={}, local addr={}",
                interface.listen,
                interface.external,
                socket.local_addr()?
            );

            sockets.insert(interface.listen, Arc::new(socket));
        }

        Ok(Self(Arc::new(sockets)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SocketAddr, &Arc<UdpSocket>)> {
        self.0.iter()
    }

    pub async fn send(&self, transmit: &Transmit) -> Result<()> {
        let Some(socket) = self.0.get(&transmit.source) else {
            log::warn!("transmit dropped: no socket for source={}", transmit.source);
            return Ok(());
        };

        if let Err(e) = socket
            .send_to(&transmit.contents, transmit.destination)
            .await
        {
            // Note: An error will also be reported when the remote host is
            // shut down, which is not processed yet, but a
            // warning will be issued.
            if e.kind() != ErrorKind::ConnectionReset {
                return Err(e.into());
            }
        }

        Ok(())
    }
}

/// Receive loop of one peer-facing socket.
///
/// Every datagram is routed to the task of its connection, nothing is
/// processed on this loop.
pub async fn listen(
    listen: SocketAddr,
    socket: Arc<UdpSocket>,
    mtu: usize,
    service: Service,
    workers: Workers,
) -> Result<()> {
    let mut buffer = BytesMut::zeroed(mtu);

    loop {
        let (size, source) = match socket.recv_from(&mut buffer).await {
            Ok(it) => it,
            Err(e) => {
                if e.kind() != ErrorKind::ConnectionReset {
                    log::error!("peer interface recv_from error: listen={listen}, err={e}");

                    return Err(e.into());
                } else {
                    continue;
                }
            }
        };

        let bytes = &buffer[..size];
        if size < 4 || PacketKind::classify(bytes) == PacketKind::Unknown {
            continue;
        }

        let Some(handle) = service.route(source, bytes) else {
            log::trace!("peer datagram dropped: source={source}, size={size}");
            continue;
        };

        let command = Command::Input {
            bytes: Bytes::copy_from_slice(bytes),
            destination: listen,
            source,
        };

        if !workers.dispatch(handle, command) {
            log::debug!("peer datagram dropped: handle={handle}, queue full");
        }
    }
}
