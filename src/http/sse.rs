//! Server-sent event framing and a channel-backed event-stream body.

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream;
use thiserror::Error;
use tokio::sync::mpsc;

use super::response::BoxError;
use super::{EVENT_STREAM, Response, StatusCode};

/// Returned when the receiving side of an event stream is gone.
#[derive(Debug, Error)]
#[error("event stream is closed")]
pub struct StreamClosed;

/// One server-sent event.
///
/// # Examples
///
/// ```
/// use sessiongate::http::SseEvent;
///
/// let event = SseEvent::new("line one\nline two").event("message").id("7");
/// assert_eq!(
///     &event.to_bytes()[..],
///     b"id: 7\nevent: message\ndata: line one\ndata: line two\n\n"
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    id: Option<String>,
    event: Option<String>,
    data: String,
}

impl SseEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn event(mut self, name: impl Into<String>) -> Self {
        self.event = Some(name.into());
        self
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Encodes the event in `text/event-stream` wire format.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.data.len() + 32);
        if let Some(id) = &self.id {
            buf.put(format!("id: {id}\n").as_bytes());
        }
        if let Some(event) = &self.event {
            buf.put(format!("event: {event}\n").as_bytes());
        }
        for line in self.data.split('\n') {
            buf.put(&b"data: "[..]);
            buf.put(line.as_bytes());
            buf.put_u8(b'\n');
        }
        buf.put_u8(b'\n');
        buf.freeze()
    }
}

/// Producer half of an event-stream response.
///
/// Dropping every sender ends the stream, which in turn lets the emitter
/// close the connection.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Result<Bytes, BoxError>>,
}

impl EventSender {
    /// Queues one event, waiting if the channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`StreamClosed`] once the response stream has been dropped.
    pub async fn send(&self, event: SseEvent) -> Result<(), StreamClosed> {
        self.send_raw(event.to_bytes()).await
    }

    /// Queues pre-encoded bytes verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`StreamClosed`] once the response stream has been dropped.
    pub async fn send_raw(&self, chunk: impl Into<Bytes>) -> Result<(), StreamClosed> {
        self.tx.send(Ok(chunk.into())).await.map_err(|_| StreamClosed)
    }

    /// Ends the stream early with a producer error.
    ///
    /// The client is not told; the connection is simply closed after the
    /// chunks already queued.
    pub async fn fail(&self, error: impl Into<BoxError>) {
        let _ = self.tx.send(Err(error.into())).await;
    }

    /// Returns `true` once the response stream has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Response {
    /// Creates a `200 OK` event-stream response fed by the returned sender.
    ///
    /// `capacity` bounds how many chunks may be queued ahead of the socket.
    pub fn event_stream(capacity: usize) -> (EventSender, Response) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let body = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let response = Response::new(StatusCode::Ok)
            .header("Content-Type", EVENT_STREAM)
            .stream(body);
        (EventSender { tx }, response)
    }
}
