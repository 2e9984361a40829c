use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::InferenceError;

/// One item of a streamed generation. A stream carries any number of
/// `Text` items followed by exactly one `End` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFragment {
    Text(String),
    End,
    Error(InferenceError),
}

impl StreamFragment {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamFragment::Text(_))
    }
}

/// Consumer side of a streamed generation.
///
/// Items arrive in production order. When the terminal item arrives the
/// stream first waits for the decode worker to exit, so a finished stream
/// never leaves a worker behind. Dropping the stream closes the channel,
/// which stops the worker at its next fragment.
pub struct FragmentStream {
    receiver: mpsc::UnboundedReceiver<StreamFragment>,
    worker: Option<JoinHandle<()>>,
    terminal: Option<StreamFragment>,
    done: bool,
}

impl FragmentStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<StreamFragment>, worker: JoinHandle<()>) -> Self {
        Self {
            receiver,
            worker: Some(worker),
            terminal: None,
            done: false,
        }
    }

    /// Drains the stream, returning the text and the terminal item.
    pub async fn collect_text(mut self) -> (String, StreamFragment) {
        use futures::StreamExt;

        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            match fragment {
                StreamFragment::Text(piece) => text.push_str(&piece),
                terminal => return (text, terminal),
            }
        }
        (text, StreamFragment::End)
    }
}

impl Stream for FragmentStream {
    type Item = StreamFragment;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.terminal.is_none() {
            match this.receiver.poll_recv(cx) {
                Poll::Ready(Some(fragment)) if !fragment.is_terminal() => {
                    return Poll::Ready(Some(fragment));
                }
                Poll::Ready(Some(terminal)) => this.terminal = Some(terminal),
                Poll::Ready(None) => {
                    this.terminal = Some(StreamFragment::Error(InferenceError::GenerationFailure(
                        "decode worker stopped without finishing the stream".to_string(),
                    )));
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        if let Some(worker) = this.worker.as_mut() {
            match Pin::new(worker).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => {
                    this.terminal = Some(StreamFragment::Error(InferenceError::GenerationFailure(
                        format!("decode worker panicked: {}", e),
                    )));
                }
            }
            this.worker = None;
        }

        this.done = true;
        Poll::Ready(this.terminal.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_terminal_is_last_and_single() {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::task::spawn_blocking(move || {
            tx.send(StreamFragment::Text("a".into())).unwrap();
            tx.send(StreamFragment::Text("b".into())).unwrap();
            tx.send(StreamFragment::End).unwrap();
        });
        let items: Vec<StreamFragment> = FragmentStream::new(rx, worker).collect().await;
        assert_eq!(
            items,
            vec![
                StreamFragment::Text("a".into()),
                StreamFragment::Text("b".into()),
                StreamFragment::End
            ]
        );
    }

    #[tokio::test]
    async fn test_worker_panic_becomes_error() {
        let (tx, rx) = mpsc::unbounded_channel::<StreamFragment>();
        let worker = tokio::task::spawn_blocking(move || {
            tx.send(StreamFragment::Text("partial".into())).unwrap();
            panic!("kernel fault");
        });
        let (text, terminal) = FragmentStream::new(rx, worker).collect_text().await;
        assert_eq!(text, "partial");
        assert!(matches!(terminal, StreamFragment::Error(InferenceError::GenerationFailure(_))));
    }
}
