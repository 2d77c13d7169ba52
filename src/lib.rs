pub mod api;
pub mod attachment;
pub mod bus;
pub mod chat;
pub mod config;
pub mod entity;
pub mod membership;
pub mod queue;
pub mod store;

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::attachment::LocalBlobStore;
use crate::bus::EventBus;
use crate::config::Config;
use crate::membership::Admissions;
use crate::queue::{MessageQueue, MessageTask, Worker};
use crate::store::Store;

/// The wired-up service: HTTP state plus the message worker and its queue.
pub struct Service {
    pub state: AppState,
    pub worker: Worker,
    pub tasks: mpsc::Receiver<MessageTask>,
}

pub fn build(store: Store, config: &Config) -> Service {
    let bus = Arc::new(EventBus::new(config.bus_channel_capacity));
    let gateway = Arc::new(store.clone());

    let admissions = Arc::new(Admissions::new(gateway.clone(), bus.clone()));
    let blobs = Arc::new(LocalBlobStore::new(
        &config.storage_dir,
        &config.storage_url_prefix,
    ));
    let (queue, tasks) = MessageQueue::new(config.queue_capacity, gateway.clone(), blobs);
    let worker = Worker::new(gateway, bus.clone(), config.retry);

    Service {
        state: AppState {
            store,
            bus,
            admissions,
            queue,
            storage_dir: config.storage_dir.clone(),
        },
        worker,
        tasks,
    }
}
