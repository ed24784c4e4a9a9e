//! The write side of a transport, abstracted so the output pump doesn't
//! need to know the transport's underlying reader/writer types.

use crate::error::TransportError;
use crate::transport::Transport;
use async_trait::async_trait;
use sies_wire::Message;
use tokio::io::AsyncWrite;

#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn send(&self, msg: &Message) -> Result<(), TransportError>;
}

#[async_trait]
impl<W> OutputSink for Transport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        Transport::send(self, msg).await
    }
}
