//! Stream relay: drains a session's handoff channel toward a transport.
//!
//! Two consumers are provided. [`StreamRelay`] drives an HTTP body: it waits
//! for the first event before the response is committed, so a failure that
//! happens before any output becomes a proper error response. [`Fragments`]
//! is the synchronous iterator handed to interactive front ends.

use crate::errors::{CancelReason, StreamError};
use crate::inference::session::{EndOfStream, Fragment, StreamEvent, StreamSession};
use bytes::Bytes;
use futures::stream::{self, Stream};

/// What the first event of a session says about the response to send.
pub enum RelayStart {
    /// Generation produced output: stream it, starting with this fragment.
    Streaming(RelayBody),
    /// Generation finished without producing any text.
    Empty,
}

/// Async relay for one session.
pub struct StreamRelay {
    session: StreamSession,
}

impl StreamRelay {
    pub fn new(session: StreamSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    /// Wait for the first event. Errors here happen before any byte was sent.
    pub async fn start(mut self) -> Result<RelayStart, StreamError> {
        match self.session.recv().await {
            Some(StreamEvent::Fragment(first)) => Ok(RelayStart::Streaming(RelayBody {
                session: self.session,
                pending: Some(first),
            })),
            Some(StreamEvent::End(end)) => match end {
                EndOfStream::Completed { .. } => Ok(RelayStart::Empty),
                EndOfStream::Failed { error, .. } => Err(StreamError::Generation(error)),
                EndOfStream::Cancelled { reason, .. } => Err(StreamError::Cancelled(reason)),
            },
            None => Ok(RelayStart::Empty),
        }
    }
}

/// The committed part of a relay: a lazy sequence of fragment bytes.
pub struct RelayBody {
    session: StreamSession,
    pending: Option<Fragment>,
}

impl RelayBody {
    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    /// Fragments as body chunks, in arrival order.
    ///
    /// A failure or timeout after output has started yields an error item,
    /// which aborts the transport stream; bytes already sent stay sent.
    /// Dropping the stream (client disconnect) cancels the worker.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, StreamError>> + Send {
        stream::unfold(Some(self), |body| async move {
            let mut body = body?;
            if let Some(fragment) = body.pending.take() {
                return Some((Ok(Bytes::from(fragment.text)), Some(body)));
            }
            loop {
                match body.session.recv().await? {
                    StreamEvent::Fragment(f) if f.text.is_empty() => continue,
                    StreamEvent::Fragment(f) => {
                        return Some((Ok(Bytes::from(f.text)), Some(body)));
                    }
                    StreamEvent::End(EndOfStream::Completed { .. }) => return None,
                    StreamEvent::End(EndOfStream::Failed { error, .. }) => {
                        tracing::error!(
                            session = body.session.id(),
                            "aborting stream after partial output: {}",
                            error
                        );
                        return Some((Err(StreamError::Generation(error)), None));
                    }
                    StreamEvent::End(EndOfStream::Cancelled { reason, .. }) => {
                        if reason == CancelReason::ClientDisconnected {
                            return None;
                        }
                        tracing::warn!(
                            session = body.session.id(),
                            "aborting stream after partial output: {}",
                            reason
                        );
                        return Some((Err(StreamError::Cancelled(reason)), None));
                    }
                }
            }
        })
    }
}

/// Synchronous fragment iterator for interactive front ends.
///
/// Yields fragments until the end marker; a failed or cancelled session
/// yields one final `Err`. Dropping the iterator early cancels the worker.
pub struct Fragments {
    session: StreamSession,
    done: bool,
}

impl Fragments {
    pub fn new(session: StreamSession) -> Self {
        Self {
            session,
            done: false,
        }
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    /// Render cumulative text: each item is everything generated so far.
    pub fn cumulative(self) -> Cumulative<Self> {
        Cumulative::new(self)
    }
}

impl Iterator for Fragments {
    type Item = Result<Fragment, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match self.session.blocking_recv()? {
            StreamEvent::Fragment(f) => return Some(Ok(f)),
            StreamEvent::End(EndOfStream::Completed { .. }) => None,
            StreamEvent::End(EndOfStream::Failed { error, .. }) => {
                Some(Err(StreamError::Generation(error)))
            }
            StreamEvent::End(EndOfStream::Cancelled { reason, .. }) => {
                Some(Err(StreamError::Cancelled(reason)))
            }
        };
        self.done = true;
        self.session.join();
        item
    }
}

/// Turns a fragment iterator into a running concatenation.
pub struct Cumulative<I> {
    inner: I,
    text: String,
}

impl<I> Cumulative<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            text: String::new(),
        }
    }
}

impl<I> Iterator for Cumulative<I>
where
    I: Iterator<Item = Result<Fragment, StreamError>>,
{
    type Item = Result<String, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok(f) => {
                self.text.push_str(&f.text);
                Some(Ok(self.text.clone()))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cumulative_concatenates() {
        let frags = vec![
            Ok(Fragment {
                index: 0,
                text: "Tavuk ".into(),
            }),
            Ok(Fragment {
                index: 1,
                text: "sote".into(),
            }),
        ];
        let out: Vec<String> = Cumulative::new(frags.into_iter())
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(out, vec!["Tavuk ".to_string(), "Tavuk sote".to_string()]);
    }
}
