use std::time::Instant;

use service::ConnectionHandle;
use tokio::{sync::mpsc::Receiver, time::sleep_until};

use crate::{
    Service,
    server::{Command, Sockets},
    statistics::{Stats, StatisticsReporter},
};

/// Task of one peer connection.
///
/// Owns the order of everything that happens to the connection: browser
/// datagrams, upstream media and timers are processed one after another,
/// and every transmit the connection produced is flushed to the sockets
/// before the next one is looked at. The task ends when the connection
/// left the service or its sender was dropped, a connection still alive
/// at that point is closed so that it never outlives its task.
pub async fn run(
    handle: ConnectionHandle,
    service: Service,
    sockets: Sockets,
    reporter: StatisticsReporter,
    mut receiver: Receiver<Command>,
) {
    log::info!("peer worker started: handle={handle}");

    loop {
        let deadline = service.poll_timeout(handle);

        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else {
                    break;
                };

                match command {
                    Command::Input { source, destination, bytes } => {
                        reporter.send(&[Stats::ReceivedBytes(bytes.len()), Stats::ReceivedPkts(1)]);

                        if let Err(e) = service.handle_input(source, destination, &bytes, Instant::now()) {
                            reporter.send(&[Stats::ErrorPkts(1)]);
                            log::debug!("peer datagram rejected: handle={handle}, source={source}, err={e}");
                        }
                    }
                    Command::Media(bytes) => {
                        match service.on_inbound_media(handle, &bytes, 0, bytes.len()) {
                            Ok(Some(transmit)) => {
                                match sockets.send(&transmit).await {
                                    Ok(()) => reporter.send(&[Stats::SendBytes(transmit.contents.len()), Stats::SendPkts(1)]),
                                    Err(e) => {
                                        reporter.send(&[Stats::ErrorPkts(1)]);
                                        log::warn!("peer media send failed: handle={handle}, err={e}");
                                    }
                                }
                            }
                            Ok(None) => reporter.send(&[Stats::DroppedPkts(1)]),
                            Err(e) => {
                                reporter.send(&[Stats::ErrorPkts(1)]);
                                log::debug!("peer media dropped: handle={handle}, err={e}");
                            }
                        }
                    }
                    Command::Wake => (),
                }
            }
            _ = sleep_until(deadline.map(Into::into).unwrap_or_else(far_future)), if deadline.is_some() => {
                if let Err(e) = service.handle_timeout(handle, Instant::now()) {
                    log::debug!("peer timeout not handled: handle={handle}, err={e}");
                }
            }
        }

        while let Some(transmit) = service.poll_transmit(handle) {
            if let Err(e) = sockets.send(&transmit).await {
                log::warn!("peer send failed: handle={handle}, err={e}");
                break;
            }

            reporter.send(&[Stats::SendBytes(transmit.contents.len()), Stats::SendPkts(1)]);
        }

        if service.state(handle).is_none() {
            break;
        }
    }

    for transmit in service.close_connection(handle) {
        if let Err(e) = sockets.send(&transmit).await {
            log::debug!("peer close not sent: handle={handle}, err={e}");
        }
    }

    log::info!("peer worker stopped: handle={handle}");
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + std::time::Duration::from_secs(86400)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use service::{ServiceOptions, peer::PeerOptions};
    use tokio::{sync::mpsc::channel, time::timeout};

    use crate::{
        handler::Handler,
        server::{Sockets, Workers},
        statistics::Statistics,
    };

    #[tokio::test]
    async fn test_dropped_sender_closes_connection() -> anyhow::Result<()> {
        let workers = Workers::default();
        let statistics = Statistics::default();
        let service = service::Service::new(ServiceOptions {
            interfaces: Vec::new(),
            peer: PeerOptions::default(),
            pool_capacity: 4,
            buffer_size: 1500,
            handler: Handler::new(workers.clone(), statistics.clone()),
        })?;

        let handle = service.create_peer_connection("sha-256 00:11", Instant::now())?;
        let (sender, receiver) = channel(4);
        workers.insert(handle, sender.clone());
        statistics.register(handle);

        let task = tokio::spawn(super::run(
            handle,
            service.clone(),
            Sockets::default(),
            statistics.get_reporter(handle),
            receiver,
        ));

        // the table entry and the local handle are the last senders.
        workers.remove(handle);
        drop(sender);

        timeout(Duration::from_secs(5), task).await??;

        assert_eq!(service.state(handle), None);
        assert!(statistics.get(handle).is_none());

        Ok(())
    }
}
