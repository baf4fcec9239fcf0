//! Single-writer dispatch of outgoing operations.
//!
//! Every message signed by the driver wallet goes through one bounded queue
//! drained by one [`Dispatcher`]. A message is only taken off the queue once
//! the previous one moved the wallet's seqno forward (or timed out), so two
//! sends never compete for the same seqno.
//!
//! ```text
//!  stake admission ──┐                        ┌──► stake responses ──► listen() ──► stakes
//!                    ├──► queue ──► Dispatcher ┤
//!  unstake admission ┘                        └──► unstake responses ─► listen() ──► unstakes
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chain::{ChainClient, OutgoingMessage, Signer};
use crate::error::DispatchError;
use crate::model::{Payload, RequestRef, RequestState};
use crate::store::RequestStore;

/// An outgoing operation and the request it serves.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: Uuid,
    pub request: RequestRef,
    pub message: OutgoingMessage,
}

/// Outcome of one dispatch, echoing the originating request.
#[derive(Debug, Clone)]
pub struct Response {
    pub id: Uuid,
    pub request: RequestRef,
    pub result: Result<(), DispatchError>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Sending half of the dispatch queue, shared by the admission passes.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    sender: mpsc::Sender<Envelope>,
}

impl DispatchQueue {
    /// Waits for room in the queue. Returns the envelope id.
    pub async fn enqueue(
        &self,
        request: impl Into<RequestRef>,
        message: OutgoingMessage,
    ) -> Result<Uuid, DispatchError> {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            request: request.into(),
            message,
        };
        let id = envelope.id;
        debug!(%id, hash = envelope.request.hash(), kind = %envelope.request.kind(), "enqueueing message");
        self.sender
            .send(envelope)
            .await
            .map_err(|_| DispatchError::QueueClosed)?;
        Ok(id)
    }
}

/// Creates the dispatch queue.
pub fn queue(capacity: usize) -> (DispatchQueue, mpsc::Receiver<Envelope>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (DispatchQueue { sender }, receiver)
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchTiming {
    /// How long to wait for the seqno to move after a send.
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DispatchTiming {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct Dispatcher {
    chain: Arc<dyn ChainClient>,
    signer: Arc<dyn Signer>,
    envelopes: mpsc::Receiver<Envelope>,
    stake_responses: mpsc::Sender<Response>,
    unstake_responses: mpsc::Sender<Response>,
    timing: DispatchTiming,
}

impl Dispatcher {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        signer: Arc<dyn Signer>,
        envelopes: mpsc::Receiver<Envelope>,
        stake_responses: mpsc::Sender<Response>,
        unstake_responses: mpsc::Sender<Response>,
    ) -> Self {
        Self {
            chain,
            signer,
            envelopes,
            stake_responses,
            unstake_responses,
            timing: DispatchTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: DispatchTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Drains the queue until shutdown or until every sender is gone.
    ///
    /// Shutdown is only observed between envelopes; a submitted message is
    /// always waited out and its response routed. Envelopes still queued at
    /// shutdown are dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("dispatcher started");
        loop {
            let envelope = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                envelope = self.envelopes.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let response = self.dispatch(envelope).await;
            self.route(response).await;
        }
        info!("dispatcher stopped");
    }

    /// Sends one message and waits for the signer's seqno to move past the
    /// value read before the send.
    pub async fn dispatch(&self, envelope: Envelope) -> Response {
        let Envelope {
            id,
            request,
            message,
        } = envelope;
        let result = self.send_and_confirm(&message).await;
        match &result {
            Ok(()) => info!(%id, hash = request.hash(), address = request.address(), "message confirmed"),
            Err(err) => warn!(%id, hash = request.hash(), address = request.address(), error = %err, "dispatch failed"),
        }
        Response { id, request, result }
    }

    async fn send_and_confirm(&self, message: &OutgoingMessage) -> Result<(), DispatchError> {
        let wallet = self.signer.address();
        let before = self
            .chain
            .get_seqno(&wallet)
            .await
            .map_err(|err| DispatchError::SeqnoQuery(format!("{err:#}")))?;

        self.signer
            .send(message)
            .await
            .map_err(|err| DispatchError::Submit(format!("{err:#}")))?;

        let poll = async {
            loop {
                time::sleep(self.timing.poll_interval).await;
                match self.chain.get_seqno(&wallet).await {
                    Ok(seqno) if seqno > before => return,
                    Ok(_) => {}
                    Err(err) => debug!(error = %err, "polling seqno failed"),
                }
            }
        };
        time::timeout(self.timing.timeout, poll)
            .await
            .map_err(|_| DispatchError::SeqnoTimeout {
                seqno: before,
                waited: self.timing.timeout,
            })
    }

    async fn route(&self, response: Response) {
        let responses = match &response.request {
            RequestRef::Stake(_) => &self.stake_responses,
            RequestRef::Unstake(_) => &self.unstake_responses,
        };
        if let Err(err) = responses.send(response).await {
            error!(hash = err.0.request.hash(), "response listener is gone, dropping response");
        }
    }
}

/// Applies dispatch outcomes to one request kind: success moves the request
/// to `sent`, failure to `error`.
///
/// Runs until the dispatcher is gone. It takes no shutdown signal of its own,
/// so the outcome of a send that was in flight at shutdown is still recorded.
pub async fn listen<P: Payload>(
    store: Arc<dyn RequestStore<P>>,
    mut responses: mpsc::Receiver<Response>,
) {
    let kind = P::KIND;
    while let Some(response) = responses.recv().await {
        let hash = response.request.hash();
        let outcome = match &response.result {
            Ok(()) => store.set_sent(hash, Utc::now()).await,
            Err(_) => store.set_state(hash, RequestState::Error).await,
        };
        if let Err(err) = outcome {
            error!(%kind, hash, error = %err, "recording dispatch outcome failed");
        }
    }
    debug!(%kind, "response listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::body::withdraw_message;
    use crate::model::{Request, TxInfo, Unstake};

    fn unstake() -> RequestRef {
        Request::new(
            "wallet".into(),
            Unstake { tokens: 1u8.into() },
            TxInfo {
                value: 0,
                time: Utc::now(),
                hash: "h".into(),
            },
        )
        .into()
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (queue, receiver) = queue(1);
        drop(receiver);
        let message = withdraw_message(Address::new(0, [1; 32]), 1).unwrap();

        assert_eq!(
            queue.enqueue(unstake(), message).await,
            Err(DispatchError::QueueClosed)
        );
    }

    #[tokio::test]
    async fn envelope_keeps_originating_request() {
        let (queue, mut receiver) = queue(1);
        let message = withdraw_message(Address::new(0, [1; 32]), 1).unwrap();

        let id = queue.enqueue(unstake(), message.clone()).await.unwrap();
        let envelope = receiver.recv().await.unwrap();

        assert_eq!(envelope.id, id);
        assert_eq!(envelope.request.hash(), "h");
        assert_eq!(envelope.message, message);
    }
}
