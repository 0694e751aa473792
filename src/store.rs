//! The block store (C1): the single source of truth for which blocks this
//! peer owns, backed by one file per block on disk.
//!
//! All file I/O and hashing happens on the blocking thread pool via
//! `tokio::task::spawn_blocking`, never on the reactor. The owned-set is kept
//! in memory as a [`Bitfield`] behind a lock so a snapshot can be taken
//! without touching disk; disk is only consulted to read/write block bytes.

use std::fs;
use std::io::Write;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::{BlockIndex, BlockLayout, Bitfield};

enum Command {
    Has(BlockIndex, oneshot::Sender<bool>),
    Read(BlockIndex, oneshot::Sender<Result<Vec<u8>>>),
    Insert(BlockIndex, Vec<u8>, oneshot::Sender<Result<bool>>),
    Missing(oneshot::Sender<Vec<BlockIndex>>),
    Bitfield(oneshot::Sender<Bitfield>),
    Complete(oneshot::Sender<bool>),
    Assemble(oneshot::Sender<Result<()>>),
}

/// A cheaply cloneable handle to the block store actor.
///
/// Every clone talks to the same underlying owned-set and disk files; the
/// actor task serializes writes so two concurrent `insert`s for the same
/// index can't race each other onto disk.
#[derive(Clone)]
pub struct BlockStoreHandle {
    commands: mpsc::Sender<Command>,
}

impl BlockStoreHandle {
    /// Spawns the block store actor for `descriptor`, persisting block files
    /// under `layout`'s base directory, and returns a handle to it.
    ///
    /// `layout.base_dir()` is created if it doesn't exist. Any block files
    /// already present under it are adopted: their hash is checked against
    /// the descriptor and only matching ones are marked owned.
    pub fn spawn(descriptor: Arc<Descriptor>, layout: BlockLayout) -> Result<Self> {
        fs::create_dir_all(layout.base_dir())?;
        let owned = adopt_existing(&descriptor, &layout)?;
        let (tx, rx) = mpsc::channel(64);
        let actor = Actor {
            descriptor,
            layout,
            owned: Arc::new(RwLock::new(owned)),
        };
        tokio::spawn(actor.run(rx));
        Ok(Self { commands: tx })
    }

    /// Returns whether block `index` is fully owned and verified.
    pub async fn has(&self, index: BlockIndex) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.clone().send(Command::Has(index, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Reads the bytes of an owned block.
    ///
    /// Returns [`Error::NotOwned`] if the block hasn't been inserted yet, or
    /// [`Error::OutOfRange`] if `index` is outside the descriptor's range.
    pub async fn read(&self, index: BlockIndex) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .clone()
            .send(Command::Read(index, tx))
            .await
            .map_err(|_| Error::NotOwned)?;
        rx.await.map_err(|_| Error::NotOwned)?
    }

    /// Verifies `data` against the descriptor's expected hash for `index`
    /// and, on success, persists it to disk and marks the block owned.
    ///
    /// Returns `Ok(true)` if this call was the one that newly inserted the
    /// block, `Ok(false)` if the block was already owned and `data` matches
    /// what's already stored (idempotent resubmission, not rewritten),
    /// [`Error::BadHash`] if `data` doesn't match the expected hash on a
    /// first insert, or [`Error::AlreadyOwned`] if the block is already
    /// owned but `data` hashes to something other than the expected hash
    /// (a conflicting resubmission, distinct from the idempotent case).
    pub async fn insert(&self, index: BlockIndex, data: Vec<u8>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .clone()
            .send(Command::Insert(index, data, tx))
            .await
            .map_err(|_| Error::NotOwned)?;
        rx.await.map_err(|_| Error::NotOwned)?
    }

    /// Returns all block indices not yet owned, in ascending order.
    pub async fn missing(&self) -> Vec<BlockIndex> {
        let (tx, rx) = oneshot::channel();
        if self.commands.clone().send(Command::Missing(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Returns a snapshot of the owned-block bitfield, suitable for sending
    /// in a BITFIELD message.
    pub async fn bitfield(&self) -> Bitfield {
        let (tx, rx) = oneshot::channel();
        if self.commands.clone().send(Command::Bitfield(tx)).await.is_err() {
            return Bitfield::new();
        }
        rx.await.unwrap_or_else(|_| Bitfield::new())
    }

    /// Returns `true` once every block is owned.
    pub async fn is_complete(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.clone().send(Command::Complete(tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Concatenates every owned block, in order, into a single file at the
    /// layout's assembled path.
    ///
    /// Returns [`Error::Incomplete`] if any block is still missing.
    pub async fn assemble(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .clone()
            .send(Command::Assemble(tx))
            .await
            .map_err(|_| Error::Incomplete)?;
        rx.await.map_err(|_| Error::Incomplete)?
    }
}

/// Scans for block files already on disk and verifies each against the
/// descriptor's hash list, adopting the ones that match.
///
/// This lets a restarted peer resume a partial download without
/// re-transferring blocks it already has.
fn adopt_existing(descriptor: &Descriptor, layout: &BlockLayout) -> Result<Bitfield> {
    let mut owned = Bitfield::from_vec(vec![0u8; (layout.block_count() + 7) / 8]);
    owned.truncate(layout.block_count());
    for index in 0..layout.block_count() {
        let path = layout.block_path(index);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(_) => continue,
        };
        if let Some(expected) = descriptor.expected_hash(index) {
            let actual = Sha1::digest(&data);
            if actual.as_slice() == expected {
                owned.set(index, true);
            }
        }
    }
    Ok(owned)
}

struct Actor {
    descriptor: Arc<Descriptor>,
    layout: BlockLayout,
    owned: Arc<RwLock<Bitfield>>,
}

impl Actor {
    async fn run(self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Has(index, reply) => {
                    let owned = self.owned.read().await;
                    let has = index < owned.len() && owned[index];
                    let _ = reply.send(has);
                }
                Command::Read(index, reply) => {
                    let result = self.read_block(index).await;
                    let _ = reply.send(result);
                }
                Command::Insert(index, data, reply) => {
                    let result = self.insert_block(index, data).await;
                    let _ = reply.send(result);
                }
                Command::Missing(reply) => {
                    let owned = self.owned.read().await;
                    let missing = (0..self.layout.block_count())
                        .filter(|&i| !owned[i])
                        .collect();
                    let _ = reply.send(missing);
                }
                Command::Bitfield(reply) => {
                    let owned = self.owned.read().await;
                    let _ = reply.send(owned.clone());
                }
                Command::Complete(reply) => {
                    let owned = self.owned.read().await;
                    let _ = reply.send(owned.count_ones() == self.layout.block_count());
                }
                Command::Assemble(reply) => {
                    let result = self.assemble().await;
                    let _ = reply.send(result);
                }
            }
        }
    }

    async fn read_block(&self, index: BlockIndex) -> Result<Vec<u8>> {
        if !self.layout.contains(index) {
            return Err(Error::OutOfRange);
        }
        {
            let owned = self.owned.read().await;
            if !owned[index] {
                return Err(Error::NotOwned);
            }
        }
        let path = self.layout.block_path(index);
        let data = tokio::task::spawn_blocking(move || fs::read(&path))
            .await
            .expect("blocking read task panicked")?;
        Ok(data)
    }

    async fn insert_block(&self, index: BlockIndex, data: Vec<u8>) -> Result<bool> {
        if !self.layout.contains(index) {
            return Err(Error::OutOfRange);
        }
        let expected = self
            .descriptor
            .expected_hash(index)
            .ok_or(Error::OutOfRange)?;

        let verify_data = data.clone();
        let matches = tokio::task::spawn_blocking(move || {
            let digest = Sha1::digest(&verify_data);
            digest.as_slice() == expected
        })
        .await
        .expect("blocking hash task panicked");

        {
            let owned = self.owned.read().await;
            if owned[index] {
                // Already have this block. A resubmission that still hashes
                // correctly is a harmless duplicate; one that doesn't means
                // this insert disagrees with the bytes we already accepted.
                return if matches { Ok(false) } else { Err(Error::AlreadyOwned) };
            }
        }
        if !matches {
            return Err(Error::BadHash);
        }

        let path = self.layout.block_path(index);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = fs::File::create(&path)?;
            file.write_all(&data)?;
            Ok(())
        })
        .await
        .expect("blocking write task panicked")?;

        let mut owned = self.owned.write().await;
        if owned[index] {
            // Lost a race with a concurrent insert of the same block; the
            // winner already wrote identical, hash-verified bytes.
            return Ok(false);
        }
        owned.set(index, true);
        Ok(true)
    }

    async fn assemble(&self) -> Result<()> {
        {
            let owned = self.owned.read().await;
            if owned.count_ones() != self.layout.block_count() {
                return Err(Error::Incomplete);
            }
        }
        let block_count = self.layout.block_count();
        let layout = self.layout.clone();
        let name = self.descriptor.name.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut out = fs::File::create(layout.assembled_path(&name))?;
            for index in 0..block_count {
                let data = fs::read(layout.block_path(index))?;
                out.write_all(&data)?;
            }
            Ok(())
        })
        .await
        .expect("blocking assemble task panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> Descriptor {
        let data: Vec<u8> = (0..50u8).collect();
        Descriptor::from_bytes("sample.bin", &data, 16)
    }

    async fn fresh_store() -> (BlockStoreHandle, tempfile::TempDir, Descriptor) {
        let descriptor = descriptor();
        let dir = tempfile::tempdir().unwrap();
        let layout = BlockLayout::new(&descriptor, dir.path());
        let store = BlockStoreHandle::spawn(Arc::new(descriptor.clone()), layout).unwrap();
        (store, dir, descriptor)
    }

    #[tokio::test]
    async fn insert_then_read_round_trips() {
        let (store, _dir, _descriptor) = fresh_store().await;
        let block: Vec<u8> = (0..16u8).collect();
        assert!(store.insert(0, block.clone()).await.unwrap());
        assert!(store.has(0).await);
        assert_eq!(store.read(0).await.unwrap(), block);
    }

    #[tokio::test]
    async fn insert_rejects_bad_hash() {
        let (store, _dir, _descriptor) = fresh_store().await;
        let wrong = vec![0xFFu8; 16];
        assert!(matches!(store.insert(0, wrong).await, Err(Error::BadHash)));
        assert!(!store.has(0).await);
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let (store, _dir, _descriptor) = fresh_store().await;
        let block: Vec<u8> = (0..16u8).collect();
        assert!(store.insert(0, block.clone()).await.unwrap());
        assert!(!store.insert(0, block).await.unwrap());
    }

    #[tokio::test]
    async fn reinserting_different_bytes_for_an_owned_block_is_rejected() {
        let (store, _dir, _descriptor) = fresh_store().await;
        let block: Vec<u8> = (0..16u8).collect();
        assert!(store.insert(0, block).await.unwrap());
        let conflicting = vec![0xAAu8; 16];
        assert!(matches!(store.insert(0, conflicting).await, Err(Error::AlreadyOwned)));
    }

    #[tokio::test]
    async fn missing_shrinks_as_blocks_arrive() {
        let (store, _dir, descriptor) = fresh_store().await;
        assert_eq!(store.missing().await.len(), descriptor.block_count());
        let block: Vec<u8> = (0..16u8).collect();
        store.insert(0, block).await.unwrap();
        assert_eq!(store.missing().await.len(), descriptor.block_count() - 1);
    }

    #[tokio::test]
    async fn assemble_fails_until_complete_then_produces_original_bytes() {
        let (store, dir, descriptor) = fresh_store().await;
        assert!(matches!(store.assemble().await, Err(Error::Incomplete)));

        let original: Vec<u8> = (0..50u8).collect();
        for index in 0..descriptor.block_count() {
            let len = descriptor.block_len_at(index) as usize;
            let start = index * descriptor.block_len as usize;
            store
                .insert(index, original[start..start + len].to_vec())
                .await
                .unwrap();
        }
        assert!(store.is_complete().await);
        store.assemble().await.unwrap();

        let assembled = fs::read(dir.path().join(&descriptor.name)).unwrap();
        assert_eq!(assembled, original);
    }
}
