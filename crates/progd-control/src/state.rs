use std::{sync::Arc, time::Instant};

use progd_supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            started_at: Instant::now(),
        }
    }
}
