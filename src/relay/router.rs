//! Per-run routing.
//!
//! Every run gets its own lane: a task that owns the run's accumulated state
//! and handles that run's messages one at a time, in arrival order. Lanes of
//! different runs run concurrently. A lane is opened by the first message for
//! its run and closed once the run's terminal message is routed; the task
//! finishes the queue and then drops the run state. Routing never waits on a
//! lane, so one slow run cannot hold up the others; a full lane drops.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Message that belongs to exactly one run.
pub trait Routed {
    fn run_id(&self) -> &str;
    /// Last message of its run
    fn is_terminal(&self) -> bool;
}

impl Routed for crate::document::Document {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn is_terminal(&self) -> bool {
        crate::document::Document::is_terminal(self)
    }
}

impl Routed for crate::document::StageMessage {
    fn run_id(&self) -> &str {
        crate::document::StageMessage::run_id(self)
    }

    fn is_terminal(&self) -> bool {
        crate::document::StageMessage::is_terminal(self)
    }
}

/// Sequential handler for one run's messages.
#[async_trait]
pub trait RunLane: Send + 'static {
    type Message: Routed + Send + 'static;

    async fn handle(&mut self, message: Self::Message);
}

type LaneFactory<L> = Box<dyn Fn(&str) -> L + Send + Sync>;

pub struct RunRouter<L: RunLane> {
    lanes: HashMap<String, mpsc::Sender<L::Message>>,
    tasks: JoinSet<String>,
    factory: LaneFactory<L>,
    capacity: usize,
}

impl<L: RunLane> RunRouter<L> {
    /// `factory` builds the lane for a newly seen run; `capacity` bounds each lane's queue.
    pub fn new(capacity: usize, factory: impl Fn(&str) -> L + Send + Sync + 'static) -> Self {
        Self {
            lanes: HashMap::new(),
            tasks: JoinSet::new(),
            factory: Box::new(factory),
            capacity: capacity.max(1),
        }
    }

    /// Queue `message` on its run's lane, opening the lane if needed.
    ///
    /// Never waits: a message for a lane whose queue is full is dropped and
    /// `false` is returned. A dropped terminal message still closes the lane.
    pub fn route(&mut self, message: L::Message) -> bool {
        self.reap();
        let run_id = message.run_id().to_string();
        let terminal = message.is_terminal();

        let sender = match self.lanes.get(&run_id) {
            Some(sender) => sender.clone(),
            None => self.open(&run_id),
        };
        let queued = match sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%run_id, capacity = self.capacity, terminal, "Run lane full; message dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                error!(%run_id, "Run lane is gone; message dropped");
                self.lanes.remove(&run_id);
                return false;
            }
        };
        if terminal {
            debug!(%run_id, "Run lane closing");
            self.lanes.remove(&run_id);
        }
        queued
    }

    /// Runs with an open lane
    pub fn active_runs(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_routing(&self, run_id: &str) -> bool {
        self.lanes.contains_key(run_id)
    }

    /// Close every lane and wait until each has handled its queued messages.
    pub async fn drain(&mut self) {
        for run_id in self.lanes.keys() {
            debug!(%run_id, "Run lane drained before its terminal message");
        }
        self.lanes.clear();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Run lane task failed");
            }
        }
    }

    fn open(&mut self, run_id: &str) -> mpsc::Sender<L::Message> {
        debug!(%run_id, "Run lane opening");
        let (tx, mut rx) = mpsc::channel(self.capacity);
        let mut lane = (self.factory)(run_id);
        let owned_run_id = run_id.to_string();
        self.tasks.spawn(async move {
            while let Some(message) = rx.recv().await {
                lane.handle(message).await;
            }
            owned_run_id
        });
        self.lanes.insert(run_id.to_string(), tx.clone());
        tx
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            match joined {
                Ok(run_id) => debug!(%run_id, "Run lane released"),
                Err(e) => warn!(error = %e, "Run lane task failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, DocumentKind};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    type Log = Arc<Mutex<Vec<(String, u64)>>>;

    struct Recording {
        log: Log,
        delay: Duration,
    }

    #[async_trait]
    impl RunLane for Recording {
        type Message = Document;

        async fn handle(&mut self, message: Document) {
            tokio::time::sleep(self.delay).await;
            self.log
                .lock()
                .await
                .push((message.run_id.clone(), message.sequence_number));
        }
    }

    fn router(log: &Log, slow_run: &'static str) -> RunRouter<Recording> {
        let log = log.clone();
        RunRouter::new(8, move |run_id| Recording {
            log: log.clone(),
            delay: if run_id == slow_run {
                Duration::from_millis(20)
            } else {
                Duration::ZERO
            },
        })
    }

    fn doc(run: &str, seq: u64, kind: DocumentKind) -> Document {
        Document::new(run, seq, kind)
    }

    #[tokio::test]
    async fn test_each_run_keeps_its_order() {
        let log: Log = Arc::default();
        let mut router = router(&log, "slow");

        router.route(doc("slow", 1, DocumentKind::Start));
        router.route(doc("fast", 1, DocumentKind::Start));
        for seq in 2..6 {
            router.route(doc("slow", seq, DocumentKind::Event));
            router.route(doc("fast", seq, DocumentKind::Event));
        }
        router.route(doc("slow", 6, DocumentKind::Stop));
        router.route(doc("fast", 6, DocumentKind::Stop));
        router.drain().await;

        let log = log.lock().await;
        for run in ["slow", "fast"] {
            let seqs: Vec<u64> = log.iter().filter(|(r, _)| r == run).map(|(_, s)| *s).collect();
            assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6], "run {run}");
        }
        // The fast run was not held up behind the slow one.
        let first_slow_end = log.iter().position(|e| e == &("slow".to_string(), 6)).unwrap();
        let fast_end = log.iter().position(|e| e == &("fast".to_string(), 6)).unwrap();
        assert!(fast_end < first_slow_end);
    }

    #[tokio::test]
    async fn test_lane_released_after_terminal_message() {
        let log: Log = Arc::default();
        let mut router = router(&log, "none");

        router.route(doc("R1", 1, DocumentKind::Start));
        router.route(doc("R2", 1, DocumentKind::Start));
        assert_eq!(router.active_runs(), 2);

        router.route(doc("R1", 2, DocumentKind::Stop));
        assert_eq!(router.active_runs(), 1);
        assert!(!router.is_routing("R1"));
        assert!(router.is_routing("R2"));

        router.drain().await;
        assert_eq!(router.active_runs(), 0);
        assert_eq!(log.lock().await.len(), 3);
    }

    struct Stuck;

    #[async_trait]
    impl RunLane for Stuck {
        type Message = Document;

        async fn handle(&mut self, _: Document) {
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_full_lane_drops_instead_of_blocking_other_runs() {
        let mut router = RunRouter::new(1, |_| Stuck);

        let accepted = (1..=4)
            .filter(|&seq| router.route(doc("stuck", seq, DocumentKind::Event)))
            .count();
        // One message in the handler at most, one in the queue.
        assert!(accepted >= 1 && accepted <= 2, "accepted {accepted}");

        assert!(router.route(doc("other", 1, DocumentKind::Start)));
        assert_eq!(router.active_runs(), 2);

        router.route(doc("stuck", 5, DocumentKind::Stop));
        assert!(!router.is_routing("stuck"));
    }
}
