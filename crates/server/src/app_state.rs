use std::sync::Arc;

use session_engine::EngineContext;
use shared::protocol::RealtimeEvent;
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 1024;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) engine: EngineContext,
    pub(crate) events: broadcast::Sender<RealtimeEvent>,
}

impl AppState {
    /// Wires the engine's change sink to the websocket fan-out channel.
    pub(crate) fn new(engine: EngineContext) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let engine = engine.with_sink(Arc::new(events.clone()));
        Self { engine, events }
    }
}
