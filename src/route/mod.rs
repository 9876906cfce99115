use std::sync::Arc;

use crate::config::Config;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::upstream::UpstreamClient;

pub mod recording;
pub mod reservation;
pub mod series;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub upstream: Arc<UpstreamClient>,
    pub scheduler: Arc<Scheduler>,
}
