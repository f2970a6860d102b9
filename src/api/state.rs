use crate::engine::OffloadEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: OffloadEngine,
}
