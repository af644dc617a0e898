//! Callbacks a session uses to reach its owner

use super::TunnelError;
use bytes::Bytes;

/// Receiver of inbound tunnel data and of the session's end.
///
/// Both methods run on a carrier's receive task or on the session's send
/// task. They must return quickly.
pub trait TunnelHandler: Send + Sync + 'static {
    /// One inbound DATA payload, in wire order
    fn on_data(&self, data: Bytes);

    /// The session became terminal. Called exactly once.
    /// `None` means the session was closed locally.
    fn on_close(&self, error: Option<TunnelError>);
}

/// [`TunnelHandler`] built from two closures
pub struct FnHandler<D, C> {
    on_data: D,
    on_close: C,
}

/// Build a handler from a data closure and a close closure
pub fn handler_fn<D, C>(on_data: D, on_close: C) -> FnHandler<D, C>
where
    D: Fn(Bytes) + Send + Sync + 'static,
    C: Fn(Option<TunnelError>) + Send + Sync + 'static,
{
    FnHandler { on_data, on_close }
}

impl<D, C> TunnelHandler for FnHandler<D, C>
where
    D: Fn(Bytes) + Send + Sync + 'static,
    C: Fn(Option<TunnelError>) + Send + Sync + 'static,
{
    fn on_data(&self, data: Bytes) {
        (self.on_data)(data)
    }

    fn on_close(&self, error: Option<TunnelError>) {
        (self.on_close)(error)
    }
}
