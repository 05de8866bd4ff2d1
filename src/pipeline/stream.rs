use crate::budget::ReservationGuard;
use crate::pipeline::{GenerateParams, ShieldCore, StreamChunk, Usage};
use crate::tokens::TokenEncoder;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Counts output tokens as chunks pass through the stream tap. A
/// provider-reported usage (usually on the final chunk) overrides the
/// running estimate. The tracker lives outside the inner stream so its
/// totals survive a consumer abort.
pub struct StreamTokenTracker {
    encoder: Arc<dyn TokenEncoder>,
    text: String,
    chunks: usize,
    reported: Option<Usage>,
}

impl StreamTokenTracker {
    pub fn new(encoder: Arc<dyn TokenEncoder>) -> Self {
        Self {
            encoder,
            text: String::new(),
            chunks: 0,
            reported: None,
        }
    }

    pub fn observe(&mut self, chunk: &StreamChunk) {
        self.chunks += 1;
        self.text.push_str(&chunk.delta);
        if let Some(usage) = chunk.usage {
            self.reported = Some(usage);
        }
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Final usage: provider-reported when available, otherwise the
    /// accumulated estimate against the given input size.
    pub fn usage(&self, estimated_input_tokens: u32) -> Usage {
        self.reported.unwrap_or(Usage {
            input_tokens: estimated_input_tokens,
            output_tokens: self.encoder.encode(&self.text),
            cached_tokens: 0,
        })
    }
}

/// Everything the post-stream hook needs, carried alongside the stream so
/// it runs on `end`, on an error item, or on drop — exactly once.
pub(crate) struct StreamFinalizer {
    pub(crate) shield: Arc<ShieldCore>,
    pub(crate) params: GenerateParams,
    pub(crate) prompt: String,
    pub(crate) probe_model: String,
    pub(crate) original_model: Option<String>,
    pub(crate) trimmed_tokens: u32,
    pub(crate) reservation: Option<ReservationGuard>,
    pub(crate) coalesce_key: Option<String>,
}

enum StreamInner<S> {
    Live(S),
    /// Cache hits stream the stored response as a single chunk.
    Cached(Option<String>),
}

/// Transducer around a provider stream: passes chunks through while
/// accumulating token counts, then runs the pipeline post-hook when the
/// stream ends. Dropping a partially-consumed stream releases the budget
/// reservation and records the partial usage.
pub struct ShieldedStream<S> {
    inner: StreamInner<S>,
    tracker: StreamTokenTracker,
    finalizer: Option<StreamFinalizer>,
    done: bool,
}

impl<S> std::fmt::Debug for ShieldedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShieldedStream")
            .field("done", &self.done)
            .finish()
    }
}

impl<S> ShieldedStream<S> {
    pub(crate) fn live(
        stream: S,
        tracker: StreamTokenTracker,
        finalizer: Option<StreamFinalizer>,
    ) -> Self {
        Self {
            inner: StreamInner::Live(stream),
            tracker,
            finalizer,
            done: false,
        }
    }

    pub(crate) fn cached(text: String, tracker: StreamTokenTracker) -> Self {
        Self {
            inner: StreamInner::Cached(Some(text)),
            tracker,
            finalizer: None,
            done: false,
        }
    }
}

impl<S> Stream for ShieldedStream<S>
where
    S: Stream<Item = anyhow::Result<StreamChunk>> + Unpin,
{
    type Item = anyhow::Result<StreamChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match &mut this.inner {
            StreamInner::Cached(text) => match text.take() {
                Some(t) => Poll::Ready(Some(Ok(StreamChunk {
                    delta: t,
                    usage: None,
                }))),
                None => {
                    this.done = true;
                    Poll::Ready(None)
                }
            },
            StreamInner::Live(stream) => match Pin::new(stream).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.tracker.observe(&chunk);
                    Poll::Ready(Some(Ok(chunk)))
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    if let Some(finalizer) = this.finalizer.take() {
                        ShieldCore::finish_stream_abort(finalizer, &this.tracker);
                    }
                    Poll::Ready(Some(Err(e)))
                }
                Poll::Ready(None) => {
                    this.done = true;
                    if let Some(finalizer) = this.finalizer.take() {
                        ShieldCore::finish_stream_complete(finalizer, &this.tracker);
                    }
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S> Drop for ShieldedStream<S> {
    fn drop(&mut self) {
        // Consumer abort: the post-hook still runs, with partial usage
        if let Some(finalizer) = self.finalizer.take() {
            ShieldCore::finish_stream_abort(finalizer, &self.tracker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicEncoder;

    fn chunk(delta: &str) -> StreamChunk {
        StreamChunk {
            delta: delta.into(),
            usage: None,
        }
    }

    #[test]
    fn tracker_accumulates_text() {
        let mut tracker = StreamTokenTracker::new(Arc::new(HeuristicEncoder));
        tracker.observe(&chunk("hello "));
        tracker.observe(&chunk("world"));
        assert_eq!(tracker.text(), "hello world");
        assert_eq!(tracker.chunks(), 2);
        // 11 chars -> 3 tokens via the heuristic
        assert_eq!(tracker.usage(42).output_tokens, 3);
        assert_eq!(tracker.usage(42).input_tokens, 42);
    }

    #[test]
    fn reported_usage_wins() {
        let mut tracker = StreamTokenTracker::new(Arc::new(HeuristicEncoder));
        tracker.observe(&chunk("some text"));
        tracker.observe(&StreamChunk {
            delta: String::new(),
            usage: Some(Usage {
                input_tokens: 100,
                output_tokens: 55,
                cached_tokens: 10,
            }),
        });
        let usage = tracker.usage(1);
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 55);
        assert_eq!(usage.cached_tokens, 10);
    }

    #[tokio::test]
    async fn cached_stream_yields_once() {
        use futures_util::StreamExt;
        let tracker = StreamTokenTracker::new(Arc::new(HeuristicEncoder));
        let mut stream: ShieldedStream<futures_util::stream::Empty<anyhow::Result<StreamChunk>>> =
            ShieldedStream::cached("stored answer".into(), tracker);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.delta, "stored answer");
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }
}
