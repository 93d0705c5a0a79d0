//! Status reporting from long-lived tasks back to the main runtime loop.
//!
//! Tasks send a [`Status`] (wrapping a [`State`]) through a channel tagged
//! with a [`Sender`] so the central loop knows the origin and can decide
//! whether to keep running or shut the process down.

use crate::error::Error;

/// Identifies the component that originated a [`Status`] update.
#[derive(Debug, Clone)]
pub enum Sender {
    /// The TCP listener accepting miner connections.
    TcpServer(async_channel::Sender<Status>),
    /// A per-miner scheduler session.
    Miner(async_channel::Sender<Status>),
    /// The contract manager.
    ContractManager(async_channel::Sender<Status>),
}

impl Sender {
    pub async fn send(&self, status: Status) {
        let tx = match self {
            Self::TcpServer(tx) | Self::Miner(tx) | Self::ContractManager(tx) => tx,
        };
        // the main loop going away means we are shutting down anyway
        let _ = tx.send(status).await;
    }
}

/// The kind of event being reported by a task.
#[derive(Debug)]
pub enum State {
    /// The miner listener died; the process cannot serve without it.
    TcpServerShutdown(Error),
    /// One miner session ended. The miner is expected to reconnect.
    MinerShutdown(String, Error),
    /// The contract manager died.
    ContractManagerShutdown(Error),
    Healthy(String),
}

#[derive(Debug)]
pub struct Status {
    pub state: State,
}

/// Whether the task observing the error should keep going.
#[derive(Debug, PartialEq)]
pub enum ErrorBranch {
    Continue,
    Break,
}

/// Maps an error to a status update and the continue/break decision for the
/// reporting task. Miner errors never bring the process down: the policy is
/// to drop the session and let the miner reconnect.
pub async fn handle_error(sender: &Sender, miner_id: &str, e: Error) -> ErrorBranch {
    tracing::error!("error in {}: {}", miner_id, &e);
    match sender {
        Sender::TcpServer(_) => {
            sender
                .send(Status {
                    state: State::TcpServerShutdown(e),
                })
                .await;
            ErrorBranch::Break
        }
        Sender::Miner(_) => {
            sender
                .send(Status {
                    state: State::MinerShutdown(miner_id.to_string(), e),
                })
                .await;
            ErrorBranch::Continue
        }
        Sender::ContractManager(_) => {
            sender
                .send(Status {
                    state: State::ContractManagerShutdown(e),
                })
                .await;
            ErrorBranch::Break
        }
    }
}
