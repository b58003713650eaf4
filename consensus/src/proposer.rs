//! The Batch Proposer (SPEC_FULL.md §4.2): coalesces concurrent writes from
//! many callers into a single Raft entry, trading a small, bounded latency
//! for fewer, larger proposals. `store` is the sole owner of the inbound
//! channel created here (SPEC_FULL.md §9's channel-ownership rule); the
//! flusher thread is the sole owner of the outbound side.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{trace, warn};
use metastore_model::config::ProposerConfig;
use metastore_model::{CResult, Error};
use serde::{Deserialize, Serialize};

/// The wire shape of a coalesced proposal: each element is one caller's
/// already-encoded op payload (`storage::codec::encode_op` output). The
/// apply path unwraps this one level before decoding the individual ops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub items: Vec<Vec<u8>>,
}

struct Pending {
    payload: Vec<u8>,
    responder: Sender<CResult<()>>,
}

/// A function that hands a fully-formed entry payload to the Raft Node for
/// replication. Returns once the proposal has been accepted into the local
/// raft log's unstable tail, not once it has committed.
pub type ProposeFn = Arc<dyn Fn(Vec<u8>) -> CResult<()> + Send + Sync>;

pub struct BatchProposer {
    config: ProposerConfig,
    inbound: Option<Sender<Pending>>,
    propose_fn: ProposeFn,
    _flusher: Option<thread::JoinHandle<()>>,
}

impl BatchProposer {
    pub fn new(config: ProposerConfig, propose_fn: ProposeFn) -> Self {
        if !config.enabled {
            return BatchProposer {
                config,
                inbound: None,
                propose_fn,
                _flusher: None,
            };
        }

        let (tx, rx): (Sender<Pending>, Receiver<Pending>) = bounded(config.batch_max_size * 4);
        let batch_max_size = config.batch_max_size;
        let max_wait = Duration::from_millis(config.batch_max_wait_millis);
        let flush_propose_fn = propose_fn.clone();
        let handle = thread::Builder::new()
            .name("batch-proposer-flusher".to_string())
            .spawn(move || flusher_loop(rx, batch_max_size, max_wait, flush_propose_fn))
            .expect("failed to spawn batch-proposer-flusher thread");

        BatchProposer {
            config,
            inbound: Some(tx),
            propose_fn,
            _flusher: Some(handle),
        }
    }

    /// Submits `payload` for proposal, blocking until it has either been
    /// accepted into the raft log's unstable tail or `send_timeout` has
    /// elapsed. When batching is disabled this proposes immediately with no
    /// coalescing.
    pub fn propose(&self, payload: Vec<u8>) -> CResult<()> {
        let send_timeout = Duration::from_secs(self.config.send_timeout_secs);

        let inbound = match &self.inbound {
            Some(tx) => tx,
            None => {
                let encoded = bincode::serialize(&Batch {
                    items: vec![payload],
                })
                .map_err(|e| Error::Internal(format!("bincode: {}", e)))?;
                return (self.propose_fn)(encoded);
            }
        };

        let (resp_tx, resp_rx) = bounded(1);
        inbound
            .send_timeout(
                Pending {
                    payload,
                    responder: resp_tx,
                },
                send_timeout,
            )
            .map_err(|_| Error::ResourceExhausted("batch proposer queue is full".to_string()))?;

        resp_rx
            .recv_timeout(send_timeout)
            .map_err(|_| Error::Unavailable("timed out waiting for proposal to be accepted".to_string()))?
    }
}

fn flusher_loop(
    rx: Receiver<Pending>,
    batch_max_size: usize,
    max_wait: Duration,
    propose_fn: ProposeFn,
) {
    loop {
        let first = match rx.recv() {
            Ok(p) => p,
            Err(_) => return, // sender dropped: owning Store is shutting down.
        };

        let mut batch = vec![first];
        let deadline = Instant::now() + max_wait;
        while batch.len() < batch_max_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(p) => batch.push(p),
                Err(_) => break,
            }
        }

        trace!("batch proposer flushing {} item(s)", batch.len());
        let items: Vec<Vec<u8>> = batch.iter().map(|p| p.payload.clone()).collect();
        let encoded = bincode::serialize(&Batch { items });
        let result = match encoded {
            Ok(bytes) => (propose_fn)(bytes),
            Err(e) => Err(Error::Internal(format!("bincode: {}", e))),
        };

        for pending in batch {
            if pending.responder.send(result.clone()).is_err() {
                warn!("caller abandoned its proposal response channel");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_propose_fn(calls: Arc<AtomicUsize>) -> ProposeFn {
        Arc::new(move |_bytes| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn disabled_proposer_passes_through_without_a_flusher_thread() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = ProposerConfig {
            enabled: false,
            ..ProposerConfig::default()
        };
        let proposer = BatchProposer::new(config, counting_propose_fn(calls.clone()));
        proposer.propose(vec![1, 2, 3]).unwrap();
        proposer.propose(vec![4, 5, 6]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn enabled_proposer_coalesces_concurrent_callers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = ProposerConfig {
            enabled: true,
            batch_max_size: 100,
            batch_max_wait_millis: 20,
            send_timeout_secs: 5,
        };
        let proposer = Arc::new(BatchProposer::new(config, counting_propose_fn(calls.clone())));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let proposer = proposer.clone();
                thread::spawn(move || proposer.propose(vec![i]).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // All 8 callers should have been served by far fewer than 8 flushes.
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert!(calls.load(Ordering::SeqCst) <= 8);
    }
}
