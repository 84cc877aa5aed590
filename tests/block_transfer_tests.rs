//! Integration tests for block-wise transfer: splitting, strict-order
//! reassembly, and state cleanup.

use std::time::Duration;

use raft_transport::block::{split_payload, BlockReassembler, ReassemblyOutcome};
use raft_transport::msg::BlockOption;

#[test]
fn test_5000_byte_payload_splits_into_5_blocks() {
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
    let blocks = split_payload(&payload, 1024);

    assert_eq!(blocks.len(), 5);
    let sizes: Vec<usize> = blocks.iter().map(|(_, chunk)| chunk.len()).collect();
    assert_eq!(sizes, vec![1024, 1024, 1024, 1024, 904]);

    for (i, (option, _)) in blocks.iter().enumerate() {
        assert_eq!(option.num, i as u32);
        assert_eq!(option.size, 1024);
        assert_eq!(option.more, i < 4);
    }

    println!("✅ 5000 bytes split into 1024 x4 + 904 with correct block options");
}

#[test]
fn test_split_then_reassemble_is_identity() {
    let payload: Vec<u8> = (0..5000u32).map(|i| (i.wrapping_mul(31) % 256) as u8).collect();
    let mut reassembler = BlockReassembler::new(1024 * 1024, Duration::from_secs(120));
    let token = b"s7-token";

    let blocks = split_payload(&payload, 1024);
    let total = blocks.len();
    for (i, (option, chunk)) in blocks.into_iter().enumerate() {
        match reassembler.accept(token, option, &chunk).unwrap() {
            ReassemblyOutcome::Continue => assert!(i < total - 1),
            ReassemblyOutcome::Complete(result) => {
                assert_eq!(i, total - 1);
                assert_eq!(result.len(), 5000);
                assert_eq!(result, payload);
            }
        }
    }
    assert_eq!(reassembler.in_flight(), 0);

    println!("✅ Server reassembled the exact 5000-byte payload in order");
}

#[test]
fn test_interleaved_transfers_use_independent_state() {
    let mut reassembler = BlockReassembler::new(1024 * 1024, Duration::from_secs(120));

    let payload_a = vec![0xAA; 2500];
    let payload_b = vec![0xBB; 1800];
    let blocks_a = split_payload(&payload_a, 1024);
    let blocks_b = split_payload(&payload_b, 1024);

    // Interleave the two transfers block by block.
    let mut done_a = None;
    let mut done_b = None;
    for i in 0..blocks_a.len().max(blocks_b.len()) {
        if let Some((option, chunk)) = blocks_a.get(i) {
            if let ReassemblyOutcome::Complete(p) =
                reassembler.accept(b"tok-a", *option, chunk).unwrap()
            {
                done_a = Some(p);
            }
        }
        if let Some((option, chunk)) = blocks_b.get(i) {
            if let ReassemblyOutcome::Complete(p) =
                reassembler.accept(b"tok-b", *option, chunk).unwrap()
            {
                done_b = Some(p);
            }
        }
    }

    assert_eq!(done_a.unwrap(), payload_a);
    assert_eq!(done_b.unwrap(), payload_b);

    println!("✅ Two token-keyed transfers reassembled independently");
}

#[test]
fn test_out_of_order_block_aborts_transfer() {
    let mut reassembler = BlockReassembler::new(1024 * 1024, Duration::from_secs(120));
    let token = b"ooo";

    reassembler
        .accept(token, BlockOption::new(0, true, 1024), &[1; 1024])
        .unwrap();
    reassembler
        .accept(token, BlockOption::new(1, true, 1024), &[2; 1024])
        .unwrap();

    // Skipping block 2 aborts and discards the state.
    let err = reassembler
        .accept(token, BlockOption::new(3, true, 1024), &[3; 1024])
        .unwrap_err();
    assert_eq!(err.kind_label(), "malformed");
    assert_eq!(reassembler.in_flight(), 0);

    // A retry of the aborted transfer must start over from block 0.
    assert!(reassembler
        .accept(token, BlockOption::new(1, true, 1024), &[0; 1024])
        .is_err());
    assert!(reassembler
        .accept(token, BlockOption::new(0, true, 1024), &[0; 1024])
        .is_ok());

    println!("✅ Out-of-order block aborted the transfer and freed its state");
}

#[test]
fn test_idle_transfers_are_swept() {
    let mut reassembler = BlockReassembler::new(1024 * 1024, Duration::from_millis(20));

    reassembler
        .accept(b"stale", BlockOption::new(0, true, 1024), &[0; 1024])
        .unwrap();
    reassembler
        .accept(b"fresh", BlockOption::new(0, true, 1024), &[0; 1024])
        .unwrap();
    assert_eq!(reassembler.in_flight(), 2);

    std::thread::sleep(Duration::from_millis(30));
    reassembler.sweep_idle();
    assert_eq!(reassembler.in_flight(), 0);

    println!("✅ Idle reassembly state was swept after the threshold");
}

#[test]
fn test_single_block_payload_completes_immediately() {
    let mut reassembler = BlockReassembler::new(1024, Duration::from_secs(120));
    let blocks = split_payload(b"small", 1024);
    assert_eq!(blocks.len(), 1);

    let (option, chunk) = &blocks[0];
    match reassembler.accept(b"one", *option, chunk).unwrap() {
        ReassemblyOutcome::Complete(p) => assert_eq!(p, b"small"),
        other => panic!("expected completion, got {other:?}"),
    }

    println!("✅ Single-block transfer completed in one step");
}

#[test]
fn test_oversized_reassembly_is_refused() {
    let mut reassembler = BlockReassembler::new(1500, Duration::from_secs(120));
    reassembler
        .accept(b"big", BlockOption::new(0, true, 1024), &[0; 1024])
        .unwrap();
    let err = reassembler
        .accept(b"big", BlockOption::new(1, true, 1024), &[0; 1024])
        .unwrap_err();
    assert_eq!(err.kind_label(), "resource_exhausted");
    assert_eq!(reassembler.in_flight(), 0);

    println!("✅ A transfer exceeding the request cap was refused");
}
