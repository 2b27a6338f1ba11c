use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Notify;
use crate::registry::Token;

/// Host I/O loop binding. Readiness for a watched descriptor is reported
/// back to the core by token.
pub trait Reactor<D> {
    fn watch(&mut self, token: Token, descriptor: D);

    /// After this returns, readiness for `token` is never reported again.
    fn unwatch(&mut self, token: Token);
}

type ReadyFuture = Pin<Box<dyn Future<Output = Token> + Send>>;

fn make_ready_future(token: Token, notify: Arc<Notify>) -> ReadyFuture {
    Box::pin(async move {
        notify.notified().await;
        token
    })
}

/// Tokio reactor over `Notify` descriptors.
///
/// Every watched descriptor has exactly one armed future in the wait set. A
/// future that fires for a token no longer watched is dropped without being
/// reported.
#[derive(Default)]
pub struct NotifyReactor {
    watched: HashMap<Token, Arc<Notify>>,
    armed: FuturesUnordered<ReadyFuture>,
}

impl NotifyReactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watched(&self) -> usize {
        self.watched.len()
    }

    /// Wait for the next watched descriptor to become ready. Cancel safe.
    pub async fn ready(&mut self) -> Token {
        loop {
            match self.armed.next().await {
                Some(token) => {
                    if let Some(notify) = self.watched.get(&token) {
                        self.armed.push(make_ready_future(token, notify.clone()));
                        return token;
                    }
                    tracing::trace!("Dropping readiness for released token {}", token);
                }
                None => std::future::pending::<()>().await,
            }
        }
    }
}

impl Reactor<Arc<Notify>> for NotifyReactor {
    fn watch(&mut self, token: Token, descriptor: Arc<Notify>) {
        self.armed.push(make_ready_future(token, descriptor.clone()));
        self.watched.insert(token, descriptor);
    }

    fn unwatch(&mut self, token: Token) {
        // Wake the armed future so it leaves the wait set
        if let Some(notify) = self.watched.remove(&token) {
            notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use std::time::Duration;

    fn tokens(n: usize) -> Vec<Token> {
        let mut reg = Registry::new();
        (0..n).map(|i| reg.insert(i)).collect()
    }

    #[tokio::test]
    async fn test_ready_reports_notified_token() {
        let t = tokens(2);
        let mut reactor = NotifyReactor::new();
        let a = Arc::new(Notify::new());
        let b = Arc::new(Notify::new());
        reactor.watch(t[0], a.clone());
        reactor.watch(t[1], b.clone());

        b.notify_one();
        let ready = tokio::time::timeout(Duration::from_secs(1), reactor.ready())
            .await
            .unwrap();
        assert_eq!(ready, t[1]);
    }

    #[tokio::test]
    async fn test_ready_rearms_after_report() {
        let t = tokens(1);
        let mut reactor = NotifyReactor::new();
        let a = Arc::new(Notify::new());
        reactor.watch(t[0], a.clone());

        a.notify_one();
        assert_eq!(reactor.ready().await, t[0]);
        a.notify_one();
        assert_eq!(reactor.ready().await, t[0]);
    }

    #[tokio::test]
    async fn test_unwatched_token_is_never_reported() {
        let t = tokens(1);
        let mut reactor = NotifyReactor::new();
        let a = Arc::new(Notify::new());
        reactor.watch(t[0], a.clone());
        a.notify_one();
        reactor.unwatch(t[0]);

        let result = tokio::time::timeout(Duration::from_millis(50), reactor.ready()).await;
        assert!(result.is_err(), "Released token must not be reported");
        assert_eq!(reactor.watched(), 0);
    }
}
