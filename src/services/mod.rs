//! Replay services: channels, traffic distribution, case sharing and results

pub mod channel;
pub mod distributor;
pub mod report;
pub mod resource_cache;

pub use channel::{Channel, ChannelMessage, ChannelSetup, ChannelTransport, CorrelationTag, NumberCursor};
pub use distributor::{bind_udp, Distributor, DistributorStats, UdpTransport};
pub use report::{DialogReport, FileResultSink, FlowStep, MemorySink, ResultSink, RunStatistics, Verdict};
pub use resource_cache::{CacheCommand, CacheHandle, ResourceController};
