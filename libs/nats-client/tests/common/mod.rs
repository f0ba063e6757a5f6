#![allow(dead_code)]

pub mod creds;
pub mod server;

pub mod utils {
    use std::{
        future::Future,
        time::{Duration, Instant},
    };

    use futures::StreamExt;
    use nats_client::{Message, Subscriber};

    /// Poll `cond` until it holds or `timeout` runs out.
    pub async fn wait_for<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    /// Next message, or `None` if nothing arrives within `timeout`.
    pub async fn next_within(sub: &mut Subscriber, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, sub.next()).await.ok().flatten()
    }

    /// Run `fut` and fail the test if it takes longer than `timeout`.
    pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> T {
        tokio::time::timeout(timeout, fut)
            .await
            .expect("operation did not finish in time")
    }
}
