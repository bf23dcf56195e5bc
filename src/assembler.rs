use std::collections::HashSet;
use std::mem;

use log::{debug, warn};
use ring::digest;

use crate::info_hash::InfoHash;
use crate::wire::BLOCK_LEN;

/// give up after this many whole-buffer hash mismatches
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// late, duplicate, out of range, or mis-sized; nothing changed
    Ignored,

    /// block landed; carries the completion percentage after it
    Accepted { percent: u8, buffer_full: bool },
}

#[derive(Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// sha-1 matched; the info dictionary is handed out
    Verified(Vec<u8>),

    /// mismatch with attempt budget left; state is already reset for a rerun
    Restarted,

    /// mismatch and the attempt budget is spent
    Exhausted,
}

/// Owns the metadata buffer and the completion set, and runs the sha-1 gate
/// once every block is down.
///
/// The buffer length is fixed by the first extended handshake that announces
/// a size and never moves afterwards; a verification failure zeroes the
/// bytes but keeps the length.
pub struct Assembler {
    info_hash: InfoHash,
    buffer: Vec<u8>,
    block_count: usize,
    completed: HashSet<usize>,
    attempt: u32,
}

impl Assembler {
    pub fn new(info_hash: InfoHash) -> Assembler {
        Assembler {
            info_hash,
            buffer: Vec::new(),
            block_count: 0,
            completed: HashSet::new(),
            attempt: 0,
        }
    }

    /// Fixes the metadata size and derives the block count in the same
    /// step. The engine calls this exactly once per download.
    pub fn install_size(&mut self, size: usize) -> usize {
        debug_assert!(!self.size_known());

        self.buffer = vec![0; size];
        self.block_count = (size + BLOCK_LEN - 1) / BLOCK_LEN;

        self.block_count
    }

    pub fn size_known(&self) -> bool {
        self.block_count != 0
    }

    pub fn metadata_size(&self) -> Option<usize> {
        self.size_known().then(|| self.buffer.len())
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn completed(&self) -> usize {
        self.completed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.size_known() && self.completed.len() >= self.block_count
    }

    pub fn has_block(&self, block: usize) -> bool {
        self.completed.contains(&block)
    }

    /// Copies one block into place. Blocks indexed past the end, already
    /// landed, or with the wrong length fall through as [`BlockOutcome::Ignored`].
    pub fn accept(&mut self, block: usize, data: &[u8]) -> BlockOutcome {
        if block >= self.block_count {
            return BlockOutcome::Ignored;
        }
        if self.is_complete() || self.completed.contains(&block) {
            debug!("ignoring late or duplicate metadata block {}", block);
            return BlockOutcome::Ignored;
        }

        let offset = block * BLOCK_LEN;
        let expected = BLOCK_LEN.min(self.buffer.len() - offset);
        if data.len() != expected {
            debug!(
                "ignoring block {} with {} bytes, expected {}",
                block,
                data.len(),
                expected
            );
            return BlockOutcome::Ignored;
        }

        self.buffer[offset..offset + expected].copy_from_slice(data);
        self.completed.insert(block);

        BlockOutcome::Accepted {
            percent: (100 * self.completed.len() / self.block_count) as u8,
            buffer_full: self.is_complete(),
        }
    }

    /// The sha-1 gate. On a match the buffer is moved out; on a mismatch
    /// the attempt counter decides between an in-place restart and giving
    /// up.
    pub fn verify(&mut self) -> VerifyOutcome {
        let sum = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &self.buffer);

        if sum.as_ref() == self.info_hash.as_bytes() {
            self.completed.clear();
            return VerifyOutcome::Verified(mem::take(&mut self.buffer));
        }

        self.attempt += 1;
        warn!(
            "metadata hash mismatch for {} (attempt {}/{})",
            self.info_hash, self.attempt, MAX_ATTEMPTS
        );

        if self.attempt < MAX_ATTEMPTS {
            self.completed.clear();
            self.buffer.fill(0);
            VerifyOutcome::Restarted
        } else {
            VerifyOutcome::Exhausted
        }
    }
}

/// sha-1 of an assembled info dictionary, for comparing against an
/// [`InfoHash`]
pub fn sha1(bytes: &[u8]) -> InfoHash {
    let sum = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, bytes);

    let mut hash = [0; InfoHash::LEN];
    hash.copy_from_slice(sum.as_ref());
    hash.into()
}
