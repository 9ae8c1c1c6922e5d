use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::future::FutureExt;
use tokio::sync::oneshot;

/// Broadcast a result to registered listeners using async oneshot channels.
///
/// Listeners registering after the result arrived get it immediately; the
/// result stays available for as long as the broadcast itself lives.
pub struct BroadcastData<R> {
    result: Option<R>,
    listeners: Vec<oneshot::Sender<R>>,
}

impl<R: Clone> Default for BroadcastData<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Clone> BroadcastData<R> {
    pub fn new() -> Self {
        Self {
            result: None,
            listeners: vec![],
        }
    }

    pub fn notify_listeners(&mut self, result: R) {
        self.result = Some(result.clone());

        while let Some(ch) = self.listeners.pop() {
            let _ = ch.send(result.clone());
        }
    }

    /// Returns a future resolving to the broadcast result, or `None` when
    /// the broadcast side went away without producing one.
    pub fn listen(&mut self) -> impl Future<Output = Option<R>> {
        use futures::future::{ready, Either};

        if let Some(result) = &self.result {
            return Either::Left(ready(Some(result.clone())));
        }

        let (tx, rx) = oneshot::channel::<R>();
        self.listeners.push(tx);

        Either::Right(rx.map(|res| res.ok()))
    }
}

type SourceFuture<R> = Pin<Box<dyn Future<Output = R> + Send>>;

struct BroadcastFutureBinding<R> {
    broadcast: BroadcastData<R>,
    future: Option<SourceFuture<R>>,
}

/// Broadcast the result of a future to multiple listeners.
///
/// The source future is spawned once, on the first `listen` call; its
/// outcome fans out to every listener past and future.
pub struct BroadcastFuture<R> {
    inner: Arc<Mutex<BroadcastFutureBinding<R>>>,
}

impl<R: Clone + Send + 'static> BroadcastFuture<R> {
    pub fn new(source: impl Future<Output = R> + Send + 'static) -> Self {
        let inner = BroadcastFutureBinding {
            broadcast: BroadcastData::new(),
            future: Some(Box::pin(source)),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn notify_listeners(inner: &Arc<Mutex<BroadcastFutureBinding<R>>>, result: R) {
        let mut data = inner.lock().unwrap();
        data.broadcast.notify_listeners(result);
    }

    fn spawn(inner: Arc<Mutex<BroadcastFutureBinding<R>>>) -> impl Future<Output = Option<R>> {
        let mut data = inner.lock().unwrap();

        if let Some(source) = data.future.take() {
            let inner1 = inner.clone();

            let task = source.map(move |value| Self::notify_listeners(&inner1, value));
            tokio::spawn(task);
        }

        data.broadcast.listen()
    }

    /// Register a listener.
    pub fn listen(&self) -> impl Future<Output = Option<R>> {
        let inner = self.inner.clone();
        async move { Self::spawn(inner).await }
    }
}
