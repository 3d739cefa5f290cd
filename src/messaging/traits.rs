//! Adapter contract for chat platforms, plus an object-safe mirror for
//! storing mixed adapters behind `Arc<dyn MessagingDyn>`.

use crate::error::Result;
use crate::{InboundMessage, OutboundResponse, StatusUpdate};

use futures::Stream;
use std::future::Future;
use std::pin::Pin;

/// Inbound messages produced by one adapter (or the merged set).
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A chat platform Tara can listen on and reply through.
pub trait Messaging: Send + Sync + 'static {
    /// Adapter name; every message it yields carries this as `source`.
    fn name(&self) -> &str;

    /// Connect and hand back the inbound stream.
    ///
    /// The stream ends when the platform connection is gone for good.
    fn start(&self) -> impl Future<Output = Result<InboundStream>> + Send;

    /// Longest text a single outbound message may carry, in characters.
    fn max_message_length(&self) -> usize;

    /// Deliver one outbound message to the chat `message` came from.
    fn respond(
        &self,
        message: &InboundMessage,
        response: OutboundResponse,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Show or clear a typing indicator. Platforms without one ignore it.
    fn send_status(
        &self,
        _message: &InboundMessage,
        _status: StatusUpdate,
    ) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    fn health_check(&self) -> impl Future<Output = Result<()>> + Send;

    fn shutdown(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Boxed-future form of [`Messaging`], implemented for every adapter.
pub trait MessagingDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn start(&self) -> BoxFuture<'_, Result<InboundStream>>;

    fn max_message_length(&self) -> usize;

    fn respond<'a>(
        &'a self,
        message: &'a InboundMessage,
        response: OutboundResponse,
    ) -> BoxFuture<'a, Result<()>>;

    fn send_status<'a>(
        &'a self,
        message: &'a InboundMessage,
        status: StatusUpdate,
    ) -> BoxFuture<'a, Result<()>>;

    fn health_check(&self) -> BoxFuture<'_, Result<()>>;

    fn shutdown(&self) -> BoxFuture<'_, Result<()>>;
}

impl<T: Messaging> MessagingDyn for T {
    fn name(&self) -> &str {
        Messaging::name(self)
    }

    fn start(&self) -> BoxFuture<'_, Result<InboundStream>> {
        Box::pin(Messaging::start(self))
    }

    fn max_message_length(&self) -> usize {
        Messaging::max_message_length(self)
    }

    fn respond<'a>(
        &'a self,
        message: &'a InboundMessage,
        response: OutboundResponse,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(Messaging::respond(self, message, response))
    }

    fn send_status<'a>(
        &'a self,
        message: &'a InboundMessage,
        status: StatusUpdate,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(Messaging::send_status(self, message, status))
    }

    fn health_check(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(Messaging::health_check(self))
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(Messaging::shutdown(self))
    }
}
