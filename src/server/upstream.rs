use std::{io::ErrorKind, sync::Arc};

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use service::validate_upstream;
use tokio::net::UdpSocket;

use crate::{
    server::Workers,
    statistics::{Statistics, Stats},
};

/// Ingest loop of the upstream RTP feed.
///
/// This is the only ordered path of the process: each datagram is
/// validated once, then handed to the task of every connected peer
/// without waiting on any of them. Encryption and transmission happen on
/// the peer tasks.
pub async fn start(
    socket: Arc<UdpSocket>,
    mtu: usize,
    workers: Workers,
    statistics: Statistics,
) -> Result<()> {
    let local_addr = socket.local_addr()?;
    let mut buffer = BytesMut::zeroed(mtu);

    log::info!("upstream listening: local addr={local_addr}");

    loop {
        let size = match socket.recv_from(&mut buffer).await {
            Ok((size, _)) => size,
            Err(e) => {
                if e.kind() != ErrorKind::ConnectionReset {
                    log::error!("upstream recv_from error: err={e}");

                    return Err(e.into());
                } else {
                    continue;
                }
            }
        };

        statistics.report_upstream(&[Stats::ReceivedBytes(size), Stats::ReceivedPkts(1)]);

        if let Err(e) = validate_upstream(&buffer, 0, size) {
            statistics.report_upstream(&[Stats::ErrorPkts(1)]);
            log::debug!("upstream datagram dropped: size={size}, err={e}");

            continue;
        }

        let bytes = Bytes::copy_from_slice(&buffer[..size]);
        let dropped = workers.fan_out(&bytes);
        if dropped > 0 {
            statistics.report_upstream(&[Stats::DroppedPkts(dropped)]);
            log::trace!("upstream datagram not queued: peers={dropped}");
        }
    }
}
