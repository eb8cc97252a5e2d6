// Copyright (c) 2025 Kestrel Foundation

//! Lock/unlock verification engine.
//!
//! The engine is a pure function of `(lock, unlock, tx)` and returns
//! `Ok` or a reason string, which is surfaced through the RPC layer.
//! Script execution is deliberately small: push, dup, hash, equality
//! and signature checks under an explicit stack budget. Anything
//! resembling general computation is out of scope.

use crate::{
    crypto::{self, Hash, PublicKey, Signature},
    transaction::{Lock, Transaction, Unlock},
};

/// Stack machine opcodes.
pub mod op {
    /// Push a length-prefixed constant.
    pub const PUSH: u8 = 0x01;
    /// Duplicate the top item.
    pub const DUP: u8 = 0x02;
    /// Replace the top item with its hash.
    pub const HASH: u8 = 0x03;
    /// Pop two items; fail unless they are equal.
    pub const EQUAL_VERIFY: u8 = 0x04;
    /// Pop a public key and a signature; fail unless the signature
    /// verifies over the transaction's signing hash.
    pub const CHECK_SIG_VERIFY: u8 = 0x05;
    /// Push the canonical true value.
    pub const TRUE: u8 = 0x06;
}

/// Budgeted script interpreter.
#[derive(Debug, Clone, Copy)]
pub struct Engine {
    /// Total bytes allowed on the stack.
    pub max_total_stack: usize,
    /// Largest single stack item.
    pub max_item_size: usize,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            max_total_stack: 16_384,
            max_item_size: 512,
        }
    }
}

impl Engine {
    pub fn new(max_total_stack: usize, max_item_size: usize) -> Self {
        Self {
            max_total_stack,
            max_item_size,
        }
    }

    /// Verify that `unlock` satisfies `lock` in the context of `tx`.
    pub fn execute(
        &self,
        lock: &Lock,
        unlock: &Unlock,
        tx: &Transaction,
    ) -> Result<(), String> {
        let signing_hash = tx.signing_hash();
        match lock {
            Lock::Key(public) => {
                let sig = parse_signature(&unlock.witness)?;
                if crypto::verify(public, signing_hash.as_ref(), &sig) {
                    Ok(())
                } else {
                    Err("signature does not verify against key lock".to_string())
                }
            }
            Lock::KeyHash(key_hash) => {
                if unlock.witness.len() != 96 {
                    return Err(format!(
                        "key-hash witness must be 96 bytes, got {}",
                        unlock.witness.len()
                    ));
                }
                let sig = parse_signature(&unlock.witness[..64])?;
                let mut key_bytes = [0u8; 32];
                key_bytes.copy_from_slice(&unlock.witness[64..]);
                let public = PublicKey(key_bytes);
                if Hash::digest(&public.0) != *key_hash {
                    return Err("revealed key does not match key hash".to_string());
                }
                if !public.is_valid_point() {
                    return Err("revealed key is not a valid point".to_string());
                }
                if crypto::verify(&public, signing_hash.as_ref(), &sig) {
                    Ok(())
                } else {
                    Err("signature does not verify against revealed key".to_string())
                }
            }
            Lock::Script(script) => {
                let stack = parse_witness_items(&unlock.witness)?;
                self.run(script, stack, &signing_hash)
            }
            Lock::Redeem(script_hash) => {
                let mut items = parse_witness_items(&unlock.witness)?;
                let script = items
                    .pop()
                    .ok_or_else(|| "redeem witness carries no script".to_string())?;
                if Hash::digest(&script) != *script_hash {
                    return Err("redeem script does not match its hash".to_string());
                }
                self.run(&script, items, &signing_hash)
            }
        }
    }

    fn run(
        &self,
        script: &[u8],
        mut stack: Vec<Vec<u8>>,
        signing_hash: &Hash,
    ) -> Result<(), String> {
        self.check_budget(&stack)?;
        let mut pc = 0usize;
        while pc < script.len() {
            let opcode = script[pc];
            pc += 1;
            match opcode {
                op::PUSH => {
                    if pc + 2 > script.len() {
                        return Err("truncated push length".to_string());
                    }
                    let len = u16::from_le_bytes([script[pc], script[pc + 1]]) as usize;
                    pc += 2;
                    if pc + len > script.len() {
                        return Err("truncated push data".to_string());
                    }
                    stack.push(script[pc..pc + len].to_vec());
                    pc += len;
                }
                op::DUP => {
                    let top = stack.last().ok_or("dup on empty stack")?.clone();
                    stack.push(top);
                }
                op::HASH => {
                    let top = stack.pop().ok_or("hash on empty stack")?;
                    stack.push(Hash::digest(&top).as_ref().to_vec());
                }
                op::EQUAL_VERIFY => {
                    let a = stack.pop().ok_or("equal-verify on empty stack")?;
                    let b = stack.pop().ok_or("equal-verify on short stack")?;
                    if a != b {
                        return Err("equal-verify failed".to_string());
                    }
                }
                op::CHECK_SIG_VERIFY => {
                    let key = stack.pop().ok_or("check-sig on empty stack")?;
                    let sig = stack.pop().ok_or("check-sig on short stack")?;
                    let key: [u8; 32] = key
                        .as_slice()
                        .try_into()
                        .map_err(|_| "check-sig key must be 32 bytes".to_string())?;
                    let sig = parse_signature(&sig)?;
                    if !crypto::verify(&PublicKey(key), signing_hash.as_ref(), &sig) {
                        return Err("check-sig failed".to_string());
                    }
                }
                op::TRUE => stack.push(vec![1]),
                other => return Err(format!("unknown opcode {other:#04x}")),
            }
            self.check_budget(&stack)?;
        }
        match stack.last() {
            Some(top) if top.iter().any(|b| *b != 0) => Ok(()),
            Some(_) => Err("script left false on the stack".to_string()),
            None => Err("script left an empty stack".to_string()),
        }
    }

    fn check_budget(&self, stack: &[Vec<u8>]) -> Result<(), String> {
        let total: usize = stack.iter().map(Vec::len).sum();
        if total > self.max_total_stack {
            return Err(format!(
                "stack size {total} exceeds budget {}",
                self.max_total_stack
            ));
        }
        if let Some(item) = stack.iter().find(|i| i.len() > self.max_item_size) {
            return Err(format!(
                "stack item of {} bytes exceeds limit {}",
                item.len(),
                self.max_item_size
            ));
        }
        Ok(())
    }
}

fn parse_signature(bytes: &[u8]) -> Result<Signature, String> {
    if bytes.len() != 64 {
        return Err(format!("signature must be 64 bytes, got {}", bytes.len()));
    }
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&bytes[..32]);
    s.copy_from_slice(&bytes[32..]);
    Ok(Signature { r, s })
}

/// Witness items are length-prefixed: `u16 le length` then the bytes.
pub fn parse_witness_items(witness: &[u8]) -> Result<Vec<Vec<u8>>, String> {
    let mut items = Vec::new();
    let mut pos = 0usize;
    while pos < witness.len() {
        if pos + 2 > witness.len() {
            return Err("truncated witness item length".to_string());
        }
        let len = u16::from_le_bytes([witness[pos], witness[pos + 1]]) as usize;
        pos += 2;
        if pos + len > witness.len() {
            return Err("truncated witness item".to_string());
        }
        items.push(witness[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(items)
}

/// Encode stack items into witness bytes.
pub fn encode_witness_items(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        out.extend_from_slice(&(item.len() as u16).to_le_bytes());
        out.extend_from_slice(item);
    }
    out
}

/// Witness for a plain key lock: the signature bytes.
pub fn key_unlock(sig: &Signature) -> Unlock {
    let mut witness = Vec::with_capacity(64);
    witness.extend_from_slice(&sig.r);
    witness.extend_from_slice(&sig.s);
    Unlock::new(witness)
}

/// Witness for a key-hash lock: signature then the revealed key.
pub fn key_hash_unlock(sig: &Signature, public: &PublicKey) -> Unlock {
    let mut witness = Vec::with_capacity(96);
    witness.extend_from_slice(&sig.r);
    witness.extend_from_slice(&sig.s);
    witness.extend_from_slice(&public.0);
    Unlock::new(witness)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::KeyPair,
        transaction::{Input, Output, Transaction, TxType},
    };

    fn dummy_tx(lock: Lock) -> Transaction {
        Transaction::new(
            TxType::Payment,
            vec![Input::new(Hash::digest(b"prev"), 0, Unlock::default())],
            vec![Output::new(10, lock)],
        )
    }

    #[test]
    fn key_lock_round_trip() {
        let kp = KeyPair::from_seed(b"owner");
        let tx = dummy_tx(Lock::Key(kp.public()));
        let sig = kp.sign(tx.signing_hash().as_ref());

        let engine = Engine::default();
        let lock = Lock::Key(kp.public());
        assert!(engine.execute(&lock, &key_unlock(&sig), &tx).is_ok());

        let wrong = KeyPair::from_seed(b"thief");
        let bad_sig = wrong.sign(tx.signing_hash().as_ref());
        assert!(engine.execute(&lock, &key_unlock(&bad_sig), &tx).is_err());
    }

    #[test]
    fn key_hash_lock_round_trip() {
        let kp = KeyPair::from_seed(b"owner");
        let lock = Lock::KeyHash(Hash::digest(&kp.public().0));
        let tx = dummy_tx(lock.clone());
        let sig = kp.sign(tx.signing_hash().as_ref());

        let engine = Engine::default();
        assert!(engine
            .execute(&lock, &key_hash_unlock(&sig, &kp.public()), &tx)
            .is_ok());

        // Revealing a different key fails the hash check.
        let other = KeyPair::from_seed(b"other");
        let err = engine
            .execute(&lock, &key_hash_unlock(&sig, &other.public()), &tx)
            .unwrap_err();
        assert!(err.contains("does not match"));
    }

    #[test]
    fn script_lock_check_sig() {
        let kp = KeyPair::from_seed(b"owner");
        // Script: push the key, check-sig, push true.
        let mut script = vec![op::PUSH];
        script.extend_from_slice(&32u16.to_le_bytes());
        script.extend_from_slice(&kp.public().0);
        script.push(op::CHECK_SIG_VERIFY);
        script.push(op::TRUE);

        let lock = Lock::Script(script);
        let tx = dummy_tx(lock.clone());
        let sig = kp.sign(tx.signing_hash().as_ref());
        let mut sig_bytes = sig.r.to_vec();
        sig_bytes.extend_from_slice(&sig.s);
        let unlock = Unlock::new(encode_witness_items(&[sig_bytes]));

        let engine = Engine::default();
        assert!(engine.execute(&lock, &unlock, &tx).is_ok());
    }

    #[test]
    fn redeem_lock_checks_script_hash() {
        let script = vec![op::TRUE];
        let lock = Lock::Redeem(Hash::digest(&script));
        let tx = dummy_tx(lock.clone());
        let unlock = Unlock::new(encode_witness_items(&[script]));

        let engine = Engine::default();
        assert!(engine.execute(&lock, &unlock, &tx).is_ok());

        let wrong = Unlock::new(encode_witness_items(&[vec![op::TRUE, op::TRUE]]));
        assert!(engine.execute(&lock, &wrong, &tx).is_err());
    }

    #[test]
    fn budget_is_enforced() {
        let engine = Engine::new(16, 8);
        // Push an item over the per-item limit.
        let mut script = vec![op::PUSH];
        script.extend_from_slice(&9u16.to_le_bytes());
        script.extend_from_slice(&[0xAA; 9]);
        let lock = Lock::Script(script);
        let tx = dummy_tx(lock.clone());
        let err = engine
            .execute(&lock, &Unlock::default(), &tx)
            .unwrap_err();
        assert!(err.contains("exceeds limit"));
    }

    #[test]
    fn unknown_opcode_fails() {
        let lock = Lock::Script(vec![0x7F]);
        let tx = dummy_tx(lock.clone());
        let engine = Engine::default();
        let err = engine.execute(&lock, &Unlock::default(), &tx).unwrap_err();
        assert!(err.contains("unknown opcode"));
    }
}
