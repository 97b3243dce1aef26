use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::DownloadTask;

/// Events a slow listener may fall behind by before it is dropped.
pub const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub model_id: String,
    pub task_id: String,
    pub data: DownloadTask,
}

impl ProgressEvent {
    pub fn download(task: &DownloadTask) -> Self {
        Self {
            kind: "download_progress".to_string(),
            model_id: task.model_id.clone(),
            task_id: task.task_id.clone(),
            data: task.clone(),
        }
    }
}

pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<ProgressEvent>,
}

/// Best-effort fan-out to live listeners. No replay for late joiners.
pub struct ProgressBroadcaster {
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<ProgressEvent>>>,
    buffer: usize,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(SUBSCRIBER_BUFFER)
    }
}

impl ProgressBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        self.subscribers.lock().await.insert(id, tx);
        debug!(subscriber=%id, "broadcast: subscribed");
        Subscription { id, receiver: rx }
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        if self.subscribers.lock().await.remove(&id).is_some() {
            debug!(subscriber=%id, "broadcast: unsubscribed");
        }
    }

    /// Deliver to every subscriber; any that is closed or full is removed.
    /// Returns how many received the event.
    pub async fn broadcast(&self, event: &ProgressEvent) -> usize {
        let mut subs = self.subscribers.lock().await;
        let mut dead = Vec::new();
        for (id, tx) in subs.iter() {
            if tx.try_send(event.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in &dead {
            subs.remove(id);
            debug!(subscriber=%id, "broadcast: dropped subscriber");
        }
        subs.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}
