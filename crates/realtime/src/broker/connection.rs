use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

/// Outcome of pushing one frame to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The connection's outbound queue is full; the frame was discarded.
    Dropped,
    /// The transport is gone; the connection should be unregistered.
    Closed,
}

/// Handle to one live realtime transport. `send` must never block.
pub trait Connection: Send + Sync {
    fn send(&self, frame: Arc<str>) -> Delivery;
    fn is_closed(&self) -> bool;
}
