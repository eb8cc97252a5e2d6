// Copyright (c) 2025 Kestrel Foundation

//! End-to-end scenarios: several validator nodes on their own threads
//! talking through the in-process registry.

use kestrel::{
    genesis,
    network::{Registry, Request, Response},
    node::{LedgerNode, NodeHandle},
    script,
    transaction::{Input, Lock, Output, Transaction, TxType, Unlock},
    Block, Config, Hash, KeyPair,
};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

struct TestNet {
    registry: Registry,
    handles: Vec<Option<NodeHandle>>,
    keys: Vec<KeyPair>,
    user: KeyPair,
    genesis: Block,
    dirs: Vec<TempDir>,
    config: Config,
}

impl TestNet {
    /// Start `n` validators over a fresh genesis with `payment_count`
    /// outputs owned by a non-validator user key.
    fn start(n: usize, config: Config, payment_count: usize) -> Self {
        init_logging();
        let keys: Vec<KeyPair> = (0..n)
            .map(|i| KeyPair::from_seed(&[i as u8 + 1, 0xAB, 0xCD]))
            .collect();
        let user = KeyPair::from_seed(b"user-wallet");
        let genesis = genesis::test_genesis(
            &keys,
            50_000,
            config.validator_cycle,
            &user,
            1_000_000,
            payment_count,
        );
        let registry = Registry::new();
        let mut handles = Vec::with_capacity(n);
        let mut dirs = Vec::with_capacity(n);
        for kp in &keys {
            let dir = TempDir::new().expect("tempdir");
            let handle = LedgerNode::spawn(
                config.clone(),
                kp.clone(),
                dir.path(),
                &genesis,
                registry.clone(),
            )
            .expect("spawn node");
            handles.push(Some(handle));
            dirs.push(dir);
        }
        Self {
            registry,
            handles,
            keys,
            user,
            genesis,
            dirs,
            config,
        }
    }

    fn handle(&self, index: usize) -> &NodeHandle {
        self.handles[index].as_ref().expect("node running")
    }

    fn live_handles(&self) -> Vec<&NodeHandle> {
        self.handles.iter().filter_map(Option::as_ref).collect()
    }

    /// A payment spending the user's genesis output `index`.
    fn payment(&self, index: u32, fee: u64) -> Transaction {
        let payment_tx = self
            .genesis
            .txs
            .iter()
            .find(|tx| tx.tx_type == TxType::Payment)
            .expect("genesis payments");
        let amount = payment_tx.outputs[index as usize].amount;
        let mut tx = Transaction::new(
            TxType::Payment,
            vec![Input::new(payment_tx.hash(), index, Unlock::default())],
            vec![Output::new(amount - fee, Lock::Key(self.user.public()))],
        );
        let sig = self.user.sign(tx.signing_hash().as_ref());
        tx.inputs[0].unlock = script::key_unlock(&sig);
        tx
    }

    /// Wait until every live node reports at least `height`.
    fn wait_for_height(&self, height: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let done = self.live_handles().iter().all(|handle| {
                handle
                    .block_height()
                    .map(|h| h >= height)
                    .unwrap_or(false)
            });
            if done {
                return true;
            }
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    fn block_at(&self, node: usize, height: u64) -> Block {
        match self
            .handle(node)
            .request(Request::GetBlocksFrom { height, max: 1 })
        {
            Ok(Response::Blocks(mut blocks)) if !blocks.is_empty() => blocks.remove(0),
            other => panic!("no block at {height} from node {node}: {other:?}"),
        }
    }

    fn stop_node(&mut self, index: usize) {
        if let Some(handle) = self.handles[index].take() {
            handle.shutdown();
        }
    }

    fn restart_node(&mut self, index: usize) {
        let handle = LedgerNode::spawn(
            self.config.clone(),
            self.keys[index].clone(),
            self.dirs[index].path(),
            &self.genesis,
            self.registry.clone(),
        )
        .expect("respawn node");
        self.handles[index] = Some(handle);
    }

    fn shutdown(mut self) {
        for slot in self.handles.iter_mut() {
            if let Some(handle) = slot.take() {
                handle.shutdown();
            }
        }
    }
}

/// Six validators, eight payments against genesis outputs submitted to
/// validator 0: the chain reaches height 1 carrying all eight
/// transactions in canonical order, identically on every node.
#[test]
fn six_validator_baseline() {
    let config = Config::test_config();
    let net = TestNet::start(6, config, 8);

    let txs: Vec<Transaction> = (0..8).map(|i| net.payment(i, 1_000)).collect();
    let mut expected: Vec<Hash> = txs.iter().map(Transaction::hash).collect();
    expected.sort();

    for tx in txs {
        net.handle(0).submit_transaction(tx);
    }

    assert!(
        net.wait_for_height(1, Duration::from_secs(30)),
        "network did not reach height 1"
    );

    let reference = net.block_at(0, 1);
    assert_eq!(reference.txs.len(), 8);
    let hashes: Vec<Hash> = reference.txs.iter().map(Transaction::hash).collect();
    assert_eq!(hashes, expected, "block 1 must hold all eight payments");

    for node in 1..6 {
        let block = net.block_at(node, 1);
        assert_eq!(
            block.hash(),
            reference.hash(),
            "node {node} disagrees on block 1"
        );
    }

    net.shutdown();
}

/// With recurring enrollment on, the cycle boundary block carries a
/// fresh enrollment from every validator and the chain keeps going.
#[test]
fn recurring_reenrollment_at_cycle_end() {
    let mut config = Config::test_config();
    config.validator_cycle = 4;
    config.txs_to_nominate = 1;
    let net = TestNet::start(6, config, 6);

    // Three single-tx blocks walk the chain to the cycle boundary.
    for i in 0..3 {
        net.handle(0).submit_transaction(net.payment(i, 1_000));
    }
    assert!(
        net.wait_for_height(3, Duration::from_secs(45)),
        "network did not reach height 3"
    );

    // Block 4 closes the cycle: six renewals, no transactions needed.
    assert!(
        net.wait_for_height(4, Duration::from_secs(30)),
        "cycle-end block did not externalize"
    );
    let boundary = net.block_at(0, 4);
    assert_eq!(
        boundary.header.enrollments.len(),
        6,
        "every validator renews in the terminal block"
    );

    // The renewed set keeps producing blocks.
    net.handle(0).submit_transaction(net.payment(3, 1_000));
    assert!(
        net.wait_for_height(5, Duration::from_secs(30)),
        "chain did not continue after re-enrollment"
    );

    net.shutdown();
}

/// A validator that slept through blocks catches back up from its
/// peers, verifying each fetched block, and rejoins consensus.
#[test]
fn catchup_after_downtime() {
    let mut config = Config::test_config();
    config.txs_to_nominate = 1;
    let mut net = TestNet::start(6, config, 6);

    net.handle(0).submit_transaction(net.payment(0, 1_000));
    assert!(
        net.wait_for_height(1, Duration::from_secs(30)),
        "network did not reach height 1"
    );

    // Node 5 goes dark; the other five still form a quorum (80% of 6).
    net.stop_node(5);
    for i in 1..3 {
        net.handle(0).submit_transaction(net.payment(i, 1_000));
    }
    assert!(
        net.wait_for_height(3, Duration::from_secs(45)),
        "five-node network did not keep producing blocks"
    );
    let tip_hash = net.block_at(0, 3).hash();

    // On restart it converges to the majority tip via catchup.
    net.restart_node(5);
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if net.handle(5).block_height().map(|h| h >= 3).unwrap_or(false) {
            break;
        }
        assert!(Instant::now() < deadline, "node 5 never caught up");
        std::thread::sleep(Duration::from_millis(200));
    }
    assert_eq!(net.block_at(5, 3).hash(), tip_hash);

    // And it participates in the next block.
    net.handle(0).submit_transaction(net.payment(3, 1_000));
    assert!(
        net.wait_for_height(4, Duration::from_secs(30)),
        "rejoined network did not advance"
    );

    net.shutdown();
}

/// With renewal off, the not-enough-validators signal still forces
/// everyone to re-enroll at the cycle boundary.
#[test]
fn emergency_enrollment_when_renewal_is_off() {
    let mut config = Config::test_config();
    config.validator_cycle = 4;
    config.txs_to_nominate = 1;
    config.recurring_enrollment = false;
    config.quorum_threshold = 100;
    let net = TestNet::start(6, config, 6);

    for i in 0..3 {
        net.handle(0).submit_transaction(net.payment(i, 1_000));
    }
    assert!(
        net.wait_for_height(3, Duration::from_secs(45)),
        "network did not reach height 3"
    );

    // Nobody renews voluntarily, so the cry for help must fill the
    // terminal block with enrollments anyway.
    assert!(
        net.wait_for_height(4, Duration::from_secs(30)),
        "emergency enrollments did not externalize"
    );
    let boundary = net.block_at(0, 4);
    assert_eq!(boundary.header.enrollments.len(), 6);

    net.handle(0).submit_transaction(net.payment(3, 1_000));
    assert!(
        net.wait_for_height(5, Duration::from_secs(30)),
        "chain did not continue past the emergency enrollment"
    );

    net.shutdown();
}
