use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use service::ConnectionHandle;

/// The type of information passed in the statisticsing channel
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(usize),
    SendBytes(usize),
    ReceivedPkts(usize),
    SendPkts(usize),
    ErrorPkts(usize),
    DroppedPkts(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters of one peer connection, or of the upstream feed.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counts<T> {
    pub received_bytes: T,
    pub send_bytes: T,
    pub received_pkts: T,
    pub send_pkts: T,
    pub error_pkts: T,
    pub dropped_pkts: T,
}

impl<T: Number> Counts<T> {
    /// # Example
    ///
    /// ```
    /// use rtp_restream::statistics::*;
    ///
    /// let counts = Counts::<Count>::default();
    ///
    /// counts.add(&Stats::ReceivedBytes(1));
    /// assert_eq!(counts.received_bytes.get(), 1);
    ///
    /// counts.add(&Stats::ReceivedPkts(1));
    /// assert_eq!(counts.received_pkts.get(), 1);
    ///
    /// counts.add(&Stats::SendBytes(1));
    /// assert_eq!(counts.send_bytes.get(), 1);
    ///
    /// counts.add(&Stats::SendPkts(1));
    /// assert_eq!(counts.send_pkts.get(), 1);
    ///
    /// counts.add(&Stats::DroppedPkts(2));
    /// assert_eq!(counts.dropped_pkts.get(), 2);
    /// ```
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::ReceivedPkts(v) => self.received_pkts.add(*v),
            Stats::SendBytes(v) => self.send_bytes.add(*v),
            Stats::SendPkts(v) => self.send_pkts.add(*v),
            Stats::ErrorPkts(v) => self.error_pkts.add(*v),
            Stats::DroppedPkts(v) => self.dropped_pkts.add(*v),
        }
    }

    fn snapshot(&self) -> Counts<usize> {
        Counts {
            received_bytes: self.received_bytes.get(),
            received_pkts: self.received_pkts.get(),
            send_bytes: self.send_bytes.get(),
            send_pkts: self.send_pkts.get(),
            error_pkts: self.error_pkts.get(),
            dropped_pkts: self.dropped_pkts.get(),
        }
    }
}

type Table = HashMap<ConnectionHandle, Arc<Counts<Count>>>;

/// process statistics
///
/// One set of counters for the upstream feed and one for every peer
/// connection, the counters are updated without holding the table lock.
#[derive(Clone)]
pub struct Statistics {
    upstream: Arc<Counts<Count>>,
    peers: Arc<RwLock<Table>>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            upstream: Default::default(),
            peers: Arc::new(RwLock::new(HashMap::with_capacity(1024))),
        }
    }
}

impl Statistics {
    /// get signal sender
    ///
    /// The signal sender can notify the statisticsing instance to update
    /// internal statistics.
    ///
    /// # Example
    ///
    /// ```
    /// use rtp_restream::statistics::*;
    /// use service::ConnectionHandle;
    ///
    /// let statistics = Statistics::default();
    /// statistics.register(ConnectionHandle(1));
    ///
    /// let reporter = statistics.get_reporter(ConnectionHandle(1));
    /// reporter.send(&[Stats::ReceivedBytes(100), Stats::ReceivedPkts(1)]);
    ///
    /// let counts = statistics.get(ConnectionHandle(1)).unwrap();
    /// assert_eq!(counts.received_bytes, 100);
    /// assert_eq!(counts.received_pkts, 1);
    /// ```
    pub fn get_reporter(&self, handle: ConnectionHandle) -> StatisticsReporter {
        StatisticsReporter {
            counts: self.peers.read().get(&handle).cloned(),
        }
    }

    /// Add a connection to the watch list
    ///
    /// # Example
    ///
    /// ```
    /// use rtp_restream::statistics::*;
    /// use service::ConnectionHandle;
    ///
    /// let statistics = Statistics::default();
    ///
    /// statistics.register(ConnectionHandle(1));
    /// assert_eq!(statistics.get(ConnectionHandle(1)).is_some(), true);
    /// ```
    pub fn register(&self, handle: ConnectionHandle) {
        self.peers.write().insert(handle, Default::default());
    }

    /// Remove a connection from the watch list
    ///
    /// # Example
    ///
    /// ```
    /// use rtp_restream::statistics::*;
    /// use service::ConnectionHandle;
    ///
    /// let statistics = Statistics::default();
    ///
    /// statistics.register(ConnectionHandle(1));
    /// statistics.unregister(ConnectionHandle(1));
    /// assert_eq!(statistics.get(ConnectionHandle(1)).is_some(), false);
    /// ```
    pub fn unregister(&self, handle: ConnectionHandle) {
        self.peers.write().remove(&handle);
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<Counts<usize>> {
        self.peers.read().get(&handle).map(|it| it.snapshot())
    }

    /// counters of the upstream ingest socket.
    pub fn upstream(&self) -> Counts<usize> {
        self.upstream.snapshot()
    }

    pub(crate) fn report_upstream(&self, reports: &[Stats]) {
        for item in reports {
            self.upstream.add(item);
        }
    }
}

/// statistics reporter
///
/// It is held by each worker, and status information can be sent to the
/// statisticsing instance through this instance to update the internal
/// statistical information of the statistics.
#[derive(Clone)]
pub struct StatisticsReporter {
    counts: Option<Arc<Counts<Count>>>,
}

impl StatisticsReporter {
    pub fn send(&self, reports: &[Stats]) {
        if let Some(counts) = &self.counts {
            for item in reports {
                counts.add(item);
            }
        }
    }
}
