use std::sync::Arc;

use tokio::sync::watch;

use crate::scheduler::{RefreshHandle, ScheduleSnapshot};
use crate::storage::queue::Broker;
use crate::storage::StoreHandle;

#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
    pub broker: Broker,
    pub schedule: watch::Receiver<Arc<ScheduleSnapshot>>,
    pub refresh: RefreshHandle,
}
