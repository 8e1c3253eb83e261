use std::sync::Arc;

use lasso_core::{EngineError, EngineEvent, SessionEngine};
use lasso_proto::protocol::{Command, SessionSnapshot};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::BroadcastMessage;

/// Run one client command against the engine.  Socket and HTTP clients both
/// go through here.
pub async fn dispatch(
    engine: &SessionEngine,
    command: Command,
) -> Result<SessionSnapshot, EngineError> {
    match command {
        Command::Start { username } => engine.start(&username).await,
        Command::Pause => engine.pause().await,
        Command::Resume => engine.resume().await,
        Command::Stop => engine.stop().await,
        Command::GetState => Ok(engine.snapshot().await),
    }
}

/// Turn engine events into client broadcasts until the engine goes away.
pub fn forward_events(
    engine: Arc<SessionEngine>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    let mut events = engine.subscribe();
    drop(engine);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::StateChanged { rev, state }) => {
                    debug!("state rev {} ({})", rev, state);
                    let _ = broadcast_tx.send(BroadcastMessage::StateUpdated);
                }
                Ok(EngineEvent::Scrobbled(event)) => {
                    debug!("relayed {} - {}", event.artist, event.title);
                }
                Ok(EngineEvent::CycleError(error)) => {
                    debug!("cycle error: {}", error.message);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event forwarder missed {} engine events", n);
                    let _ = broadcast_tx.send(BroadcastMessage::StateUpdated);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("engine event stream closed");
    })
}
