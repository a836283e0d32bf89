use tokio::sync::watch;

/// Single-writer, many-reader value broadcaster.
///
/// Readers either grab the current value with [`Broadcaster::value`] or
/// follow publications through a [`Subscriber`]. Subscribers coalesce:
/// a slow reader never blocks the publisher, intermediate values may be
/// skipped, but the latest value is always eventually delivered.
pub struct Broadcaster<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> Broadcaster<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the current value and wake all subscribers.
    pub fn publish(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Current value, cloned.
    pub fn value(&self) -> T {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> Subscriber<T> {
        Subscriber {
            rx: self.tx.subscribe(),
            first: true,
        }
    }
}

/// Lazy, restartable sequence of published values.
///
/// The first [`Subscriber::wait`] yields the value current at call time;
/// each later call yields the next publication, skipping any the
/// subscriber slept through.
pub struct Subscriber<T> {
    rx: watch::Receiver<T>,
    first: bool,
}

impl<T: Clone> Subscriber<T> {
    /// Next value, or `None` once the broadcaster is gone.
    pub async fn wait(&mut self) -> Option<T> {
        if self.first {
            self.first = false;
            return Some(self.rx.borrow_and_update().clone());
        }

        match self.rx.changed().await {
            Ok(()) => Some(self.rx.borrow_and_update().clone()),
            Err(_) => None,
        }
    }
}
