//! Pooled message buffers with explicit checkout/return.
//!
//! Block- and piece-sized buffers cycle through lock-free queues so the hot
//! receive path does not allocate per message. A buffer is checked out for
//! the lifetime of one message or one piece assembly and returned on every
//! exit path, including verification failure.

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use std::sync::Arc;

use crate::constants::BLOCK_SIZE;

const POOLED_BLOCK_BUFFERS: usize = 256;
const POOLED_PIECE_BUFFERS: usize = 16;

/// A pool of reusable block-sized and piece-sized buffers.
pub struct BufferPool {
    piece_size: usize,
    block_buffers: ArrayQueue<BytesMut>,
    piece_buffers: ArrayQueue<BytesMut>,
}

impl BufferPool {
    /// Creates a pool sized for the torrent's piece length.
    pub fn new(piece_size: usize) -> Arc<Self> {
        let pool = Arc::new(Self {
            piece_size,
            block_buffers: ArrayQueue::new(POOLED_BLOCK_BUFFERS),
            piece_buffers: ArrayQueue::new(POOLED_PIECE_BUFFERS),
        });

        for _ in 0..POOLED_BLOCK_BUFFERS {
            let _ = pool
                .block_buffers
                .push(BytesMut::with_capacity(BLOCK_SIZE as usize));
        }

        pool
    }

    /// Checks out a block-sized buffer.
    pub fn checkout_block(&self) -> BytesMut {
        self.block_buffers
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(BLOCK_SIZE as usize))
    }

    /// Returns a block buffer to the pool; dropped if the pool is full.
    pub fn return_block(&self, mut buf: BytesMut) {
        buf.clear();
        let _ = self.block_buffers.push(buf);
    }

    /// Checks out a buffer large enough for one full piece.
    pub fn checkout_piece(&self) -> BytesMut {
        if let Some(mut buf) = self.piece_buffers.pop() {
            if buf.capacity() < self.piece_size {
                buf.reserve(self.piece_size - buf.capacity());
            }
            return buf;
        }
        BytesMut::with_capacity(self.piece_size)
    }

    /// Returns a piece buffer to the pool; dropped if the pool is full.
    pub fn return_piece(&self, mut buf: BytesMut) {
        buf.clear();
        let _ = self.piece_buffers.push(buf);
    }

    /// Block buffers currently available without allocating.
    pub fn blocks_available(&self) -> usize {
        self.block_buffers.len()
    }
}
