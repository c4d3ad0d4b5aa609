use service::{
    ConnectionHandle, ServiceHandler, ice::candidate::Candidate, peer::ConnectionState,
};

use crate::{server::Workers, statistics::Statistics};

#[derive(Clone)]
pub struct Handler {
    workers: Workers,
    statistics: Statistics,
}

impl Handler {
    pub fn new(workers: Workers, statistics: Statistics) -> Self {
        Self {
            workers,
            statistics,
        }
    }
}

impl ServiceHandler for Handler {
    /// A peer joins the media fan-out when it becomes connected and
    /// leaves it on any other state.
    fn on_state_changed(&self, handle: ConnectionHandle, state: ConnectionState) {
        log::info!("peer state: handle={handle}, state={state:?}");

        self.workers
            .set_connected(handle, state == ConnectionState::Connected);
    }

    fn on_local_candidate(&self, handle: ConnectionHandle, candidate: &Candidate) {
        log::info!("local candidate: handle={handle}, candidate={candidate}");
    }

    fn on_data_channel(&self, handle: ConnectionHandle, stream: u16, label: &str) {
        log::info!("data channel opened: handle={handle}, stream={stream}, label={label}");
    }

    fn on_message(&self, handle: ConnectionHandle, stream: u16, ppid: u32, data: &[u8]) {
        log::debug!(
            "data channel message: handle={handle}, stream={stream}, ppid={ppid}, size={}",
            data.len()
        );
    }

    fn on_closed(&self, handle: ConnectionHandle, reason: &str) {
        log::info!("peer closed: handle={handle}, reason={reason}");

        self.workers.remove(handle);
        self.statistics.unregister(handle);
    }
}
