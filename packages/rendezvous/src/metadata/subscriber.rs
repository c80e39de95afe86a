use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime};

use rendezvous_types::SubscriptionEvent;
use tokio_util::sync::CancellationToken;

/// One long-poll consumer of newly opened tagged branches for a
/// (service, region) pair. Producers push from branch registration;
/// the reader drains from a blocking loop bridged into the HTTP stream.
pub struct Subscriber {
    refresh_interval: Duration,
    queue: Mutex<VecDeque<SubscriptionEvent>>,
    cond: Condvar,
    /// Refreshed on every reader wake so idle but connected subscribers
    /// survive the reaper.
    last_activity: Mutex<SystemTime>,
}

impl Subscriber {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            last_activity: Mutex::new(SystemTime::now()),
        }
    }

    pub fn push(&self, bid: impl Into<String>, tag: impl Into<String>) {
        let mut queue = self.queue.lock().expect("subscriber queue lock poisoned");
        tracing::debug!("adding subscribed branch");
        queue.push_back(SubscriptionEvent {
            bid: bid.into(),
            tag: tag.into(),
        });
        self.cond.notify_all();
    }

    /// Block until an event is available or `cancel` fires. Each wake
    /// refreshes the liveness timestamp.
    pub fn pop(&self, cancel: &CancellationToken) -> Option<SubscriptionEvent> {
        self.touch();
        let mut queue = self.queue.lock().expect("subscriber queue lock poisoned");
        while queue.is_empty() {
            self.touch();
            queue = self
                .cond
                .wait_timeout(queue, self.refresh_interval)
                .expect("subscriber queue lock poisoned")
                .0;
            if cancel.is_cancelled() {
                return None;
            }
        }
        queue.pop_front()
    }

    pub fn last_activity(&self) -> SystemTime {
        *self
            .last_activity
            .lock()
            .expect("subscriber activity lock poisoned")
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .expect("subscriber activity lock poisoned") = SystemTime::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn push_then_pop() {
        let subscriber = Subscriber::new(Duration::from_secs(1));
        subscriber.push("rv_a_0:rid", "write_post");
        let cancel = CancellationToken::new();
        let event = subscriber.pop(&cancel).unwrap();
        assert_eq!(event.bid, "rv_a_0:rid");
        assert_eq!(event.tag, "write_post");
    }

    #[test]
    fn pop_blocks_until_push() {
        let subscriber = Arc::new(Subscriber::new(Duration::from_millis(50)));
        let cancel = CancellationToken::new();
        let reader = {
            let subscriber = subscriber.clone();
            std::thread::spawn(move || subscriber.pop(&cancel))
        };
        std::thread::sleep(Duration::from_millis(150));
        subscriber.push("bid", "");
        let event = reader.join().unwrap().unwrap();
        assert_eq!(event.bid, "bid");
    }

    #[test]
    fn cancel_unblocks_reader() {
        let subscriber = Arc::new(Subscriber::new(Duration::from_millis(20)));
        let cancel = CancellationToken::new();
        let reader = {
            let subscriber = subscriber.clone();
            let cancel = cancel.clone();
            std::thread::spawn(move || subscriber.pop(&cancel))
        };
        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        assert!(reader.join().unwrap().is_none());
    }

    #[test]
    fn waiting_refreshes_liveness() {
        let subscriber = Arc::new(Subscriber::new(Duration::from_millis(10)));
        let before = subscriber.last_activity();
        let cancel = CancellationToken::new();
        let reader = {
            let subscriber = subscriber.clone();
            let cancel = cancel.clone();
            std::thread::spawn(move || subscriber.pop(&cancel))
        };
        std::thread::sleep(Duration::from_millis(80));
        cancel.cancel();
        reader.join().unwrap();
        assert!(subscriber.last_activity() > before);
    }
}
