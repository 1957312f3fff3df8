//! Background task draining the socket into the router.

use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use wisprclaw_core::message;

use crate::router::ResponseRouter;
use crate::Error;

/// Spawn the receive loop for one connection.
///
/// The loop ends when the socket closes or errors; it then fails every
/// waiter on `router`. Frames that do not decode are dropped.
pub fn spawn<S>(stream: S, router: Arc<ResponseRouter>) -> JoinHandle<()>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let reason = run(stream, &router).await;
        tracing::debug!(error = %reason, "Receive loop finished");
        router.fail_all(reason);
    })
}

async fn run<S>(mut stream: S, router: &ResponseRouter) -> Error
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = match stream.next().await {
            Some(Ok(Message::Text(text))) => message::decode(text.as_str()),
            Some(Ok(Message::Binary(data))) => message::decode_bytes(&data),
            Some(Ok(Message::Close(close))) => {
                let reason = close
                    .map(|c| format!("gateway closed the connection ({}): {}", c.code, c.reason.as_str()))
                    .unwrap_or_else(|| "gateway closed the connection".to_string());
                return Error::Closed(reason);
            }
            // Ping/pong are answered by tungstenite.
            Some(Ok(_)) => continue,
            Some(Err(e)) => return e.into(),
            None => return Error::Closed("stream ended".to_string()),
        };

        if let Some(frame) = frame {
            router.deliver(frame);
        }
    }
}
