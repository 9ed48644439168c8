use std::sync::Arc;

use crate::pipeline::Pipeline;

pub struct AppState {
    pub pipeline: Pipeline,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Arc<Self> {
        Arc::new(AppState { pipeline })
    }
}
