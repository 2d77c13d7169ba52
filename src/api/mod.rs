pub mod auth;
pub mod error;
pub mod server;

use crate::{bus::EventBus, membership::Admissions, queue::MessageQueue, store::Store};
use std::{path::PathBuf, sync::Arc};

pub use server::router;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub bus: Arc<EventBus>,
    pub admissions: Arc<Admissions>,
    pub queue: MessageQueue,
    /// Directory served under `/storage`
    pub storage_dir: PathBuf,
}
