//! Block-wise transfer: splitting oversized payloads and reassembling
//! them on the receiving side (RFC 7959 Block1 semantics).
//!
//! Reassembly state is keyed by token. Sequencing is strict: a block
//! whose number is not the next expected one aborts the transfer and
//! discards the state. Idle states are swept after a configurable
//! threshold so an abandoned transfer cannot pin its buffer forever.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::{Result, TransportError};
use crate::msg::BlockOption;

/// Split `payload` into `(BlockOption, chunk)` pairs of at most
/// `block_size` bytes. The final block carries `more == false`.
pub fn split_payload(payload: &[u8], block_size: usize) -> Vec<(BlockOption, Vec<u8>)> {
    assert!(block_size > 0, "block_size must be nonzero");

    if payload.is_empty() {
        return vec![(BlockOption::new(0, false, block_size), Vec::new())];
    }

    let mut blocks = Vec::with_capacity(payload.len().div_ceil(block_size));
    let mut offset = 0usize;
    let mut num = 0u32;
    while offset < payload.len() {
        let len = block_size.min(payload.len() - offset);
        let more = offset + len < payload.len();
        blocks.push((
            BlockOption::new(num, more, block_size),
            payload[offset..offset + len].to_vec(),
        ));
        offset += len;
        num += 1;
    }
    blocks
}

/// Outcome of feeding one block to the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    /// Block accepted; more blocks expected (reply 2.31 Continue).
    Continue,
    /// Final block accepted; the full payload is returned.
    Complete(Vec<u8>),
}

/// One in-progress transfer.
#[derive(Debug)]
struct TransferState {
    block_size: usize,
    next_expected_num: u32,
    buffer: Vec<u8>,
    last_activity: Instant,
}

/// Token-keyed reassembly of Block1 transfers.
#[derive(Debug)]
pub struct BlockReassembler {
    states: HashMap<Vec<u8>, TransferState>,
    /// Reassembled payloads may not exceed this.
    max_payload_size: usize,
    /// Idle states older than this are swept.
    idle_timeout: Duration,
}

impl BlockReassembler {
    pub fn new(max_payload_size: usize, idle_timeout: Duration) -> Self {
        Self {
            states: HashMap::new(),
            max_payload_size,
            idle_timeout,
        }
    }

    /// Feed one block for `token`.
    ///
    /// The first block (num 0) creates the state; subsequent blocks must
    /// arrive in order and with a consistent block size. Any violation
    /// aborts the transfer: the state is discarded and the caller gets a
    /// typed error to convert into a 4.00 response.
    pub fn accept(
        &mut self,
        token: &[u8],
        block: BlockOption,
        chunk: &[u8],
    ) -> Result<ReassemblyOutcome> {
        self.sweep_idle();

        if !self.states.contains_key(token) {
            if block.num != 0 {
                return Err(TransportError::Malformed(format!(
                    "transfer started at block {} instead of 0",
                    block.num
                )));
            }
            self.states.insert(
                token.to_vec(),
                TransferState {
                    block_size: block.size,
                    next_expected_num: 0,
                    buffer: Vec::new(),
                    last_activity: Instant::now(),
                },
            );
        }
        let state = self.states.get_mut(token).expect("state just ensured");

        if block.num != state.next_expected_num {
            let expected = state.next_expected_num;
            self.states.remove(token);
            warn!(
                got = block.num,
                expected, "Out-of-order block aborts transfer"
            );
            return Err(TransportError::Malformed(format!(
                "block {} received while expecting {expected}",
                block.num
            )));
        }

        if block.size != state.block_size {
            self.states.remove(token);
            return Err(TransportError::Malformed(
                "block size changed mid-transfer".into(),
            ));
        }

        if state.buffer.len() + chunk.len() > self.max_payload_size {
            self.states.remove(token);
            return Err(TransportError::ResourceExhausted(format!(
                "reassembled payload exceeds {} bytes",
                self.max_payload_size
            )));
        }

        state.buffer.extend_from_slice(chunk);
        state.next_expected_num += 1;
        state.last_activity = Instant::now();

        if block.more {
            debug!(
                num = block.num,
                buffered = state.buffer.len(),
                "Block accepted, transfer continues"
            );
            Ok(ReassemblyOutcome::Continue)
        } else {
            let state = self.states.remove(token).expect("state present");
            debug!(
                blocks = state.next_expected_num,
                total = state.buffer.len(),
                "Block transfer complete"
            );
            Ok(ReassemblyOutcome::Complete(state.buffer))
        }
    }

    /// Drop transfers idle past the threshold.
    pub fn sweep_idle(&mut self) {
        let idle_timeout = self.idle_timeout;
        let now = Instant::now();
        self.states
            .retain(|_, s| now.duration_since(s.last_activity) < idle_timeout);
    }

    /// Number of transfers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassembler() -> BlockReassembler {
        BlockReassembler::new(1024 * 1024, Duration::from_secs(120))
    }

    #[test]
    fn split_produces_exact_chunks() {
        let payload = vec![0xAB; 5000];
        let blocks = split_payload(&payload, 1024);
        assert_eq!(blocks.len(), 5);
        let sizes: Vec<usize> = blocks.iter().map(|(_, c)| c.len()).collect();
        assert_eq!(sizes, vec![1024, 1024, 1024, 1024, 904]);
        assert!(blocks[..4].iter().all(|(b, _)| b.more));
        assert!(!blocks[4].0.more);
        assert_eq!(blocks[4].0.num, 4);
    }

    #[test]
    fn split_of_small_payload_is_single_final_block() {
        let blocks = split_payload(b"hi", 1024);
        assert_eq!(blocks.len(), 1);
        assert!(!blocks[0].0.more);
        assert_eq!(blocks[0].1, b"hi");
    }

    #[test]
    fn reassembly_round_trip() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut r = reassembler();
        let token = b"tok1";

        let blocks = split_payload(&payload, 1024);
        let (last, rest) = blocks.split_last().unwrap();
        for (block, chunk) in rest {
            assert_eq!(
                r.accept(token, *block, chunk).unwrap(),
                ReassemblyOutcome::Continue
            );
        }
        match r.accept(token, last.0, &last.1).unwrap() {
            ReassemblyOutcome::Complete(result) => assert_eq!(result, payload),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn out_of_order_block_aborts_and_discards_state() {
        let mut r = reassembler();
        let token = b"tok2";
        r.accept(token, BlockOption::new(0, true, 1024), &[1; 1024])
            .unwrap();
        let err = r
            .accept(token, BlockOption::new(2, true, 1024), &[2; 1024])
            .unwrap_err();
        assert_eq!(err.kind_label(), "malformed");
        assert_eq!(r.in_flight(), 0);

        // The transfer can restart from block 0 after the abort.
        assert!(r
            .accept(token, BlockOption::new(0, true, 1024), &[3; 1024])
            .is_ok());
    }

    #[test]
    fn transfer_must_start_at_block_zero() {
        let mut r = reassembler();
        assert!(r
            .accept(b"tok3", BlockOption::new(1, true, 1024), &[0; 1024])
            .is_err());
    }

    #[test]
    fn block_size_change_mid_transfer_aborts() {
        let mut r = reassembler();
        let token = b"tok4";
        r.accept(token, BlockOption::new(0, true, 1024), &[0; 1024])
            .unwrap();
        assert!(r
            .accept(token, BlockOption::new(1, true, 512), &[0; 512])
            .is_err());
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn oversized_transfer_rejected() {
        let mut r = BlockReassembler::new(2000, Duration::from_secs(120));
        let token = b"tok5";
        r.accept(token, BlockOption::new(0, true, 1024), &[0; 1024])
            .unwrap();
        let err = r
            .accept(token, BlockOption::new(1, true, 1024), &[0; 1024])
            .unwrap_err();
        assert_eq!(err.kind_label(), "resource_exhausted");
    }

    #[test]
    fn idle_states_are_swept() {
        let mut r = BlockReassembler::new(1024, Duration::from_millis(5));
        r.accept(b"tok6", BlockOption::new(0, true, 16), &[0; 16])
            .unwrap();
        assert_eq!(r.in_flight(), 1);
        std::thread::sleep(Duration::from_millis(10));
        r.sweep_idle();
        assert_eq!(r.in_flight(), 0);
    }
}
