use tokio::sync::watch;

/// Current-viewport network signal. The queue drains on the offline→online
/// edge; the state manager seeds its `is_online` flag from it.
///
/// Implementations wrap whatever the host platform exposes (browser
/// online/offline events, OS reachability callbacks); `ManualConnectivity`
/// covers tests and shells that push the signal in themselves.
pub trait ConnectivityMonitor: Send + Sync {
    fn is_online(&self) -> bool;

    /// A watch channel carrying the current online flag. Every transition
    /// is observable; the receiver starts at the current value.
    fn watch(&self) -> watch::Receiver<bool>;
}

/// Connectivity source driven by the embedding application.
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx }
    }

    pub fn set_online(&self, online: bool) {
        // send_replace never fails; the sender keeps the channel alive.
        self.tx.send_replace(online);
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_are_observable() {
        let monitor = ManualConnectivity::new(false);
        assert!(!monitor.is_online());

        let mut rx = monitor.watch();
        monitor.set_online(true);

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(monitor.is_online());
    }
}
