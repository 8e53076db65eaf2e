//! Message dispatch against the torrent's active mode.
//!
//! Dispatch is a total function from message kind to handler. The active
//! mode gates which kinds are accepted: a kind the mode cannot handle is a
//! protocol violation fatal to the connection, while piece-indexed messages
//! in metadata mode are ignored because no piece count exists to validate
//! them against. Malformed tree-hash requests are answered with a reject
//! message instead of a disconnect.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::bitfield::Bitfield;
use crate::disk::DiskRequest;
use crate::peer::{Message, PeerError};
use crate::torrent::mode::Mode;
use crate::torrent::picker::{BlockOutcome, BlockRequest, RequestPipeline};
use crate::torrent::session::TorrentSession;
use crate::verify::{validate_hash_request, verify_layer_span, PieceTree};

/// Routes one decoded message from `addr` through the active mode.
///
/// An `Err` is a protocol violation: the caller tears the connection down.
pub(crate) fn handle_message(
    s: &mut TorrentSession,
    addr: SocketAddr,
    msg: Message,
    now: Instant,
) -> Result<(), PeerError> {
    if !s.mode.can_handle_messages() {
        return Err(PeerError::NotAcceptedInMode {
            message: msg.name(),
            mode: s.mode.name(),
        });
    }
    let Some(peer) = s.peers.get_mut(&addr) else {
        return Err(PeerError::ConnectionClosed);
    };
    peer.last_received = now;

    // Without a piece count there is nothing to index piece-wise traffic
    // against; metadata mode drops it on the floor.
    if !s.mode.knows_piece_count() && is_piece_indexed(&msg) {
        trace!(peer = %addr, message = msg.name(), "ignored before metadata");
        return Ok(());
    }

    match msg {
        Message::KeepAlive => Ok(()),

        Message::Choke => {
            let was_unchoked_to_us = !peer.flags.am_choking;
            peer.flags.peer_choking = true;
            let freed = s.pipeline.cancel_peer(&addr);
            if !freed.is_empty() {
                debug!(peer = %addr, blocks = freed.len(), "requests withdrawn on choke");
            }
            if was_unchoked_to_us {
                // A peer we upload to stopped reciprocating.
                s.choker.trigger();
            }
            Ok(())
        }

        Message::Unchoke => {
            peer.flags.peer_choking = false;
            s.fill_requests(addr, now);
            Ok(())
        }

        Message::Interested => {
            peer.flags.peer_interested = true;
            // An upload slot may be worth reviewing.
            s.choker.trigger();
            Ok(())
        }

        Message::NotInterested => {
            peer.flags.peer_interested = false;
            Ok(())
        }

        Message::Have { piece } => {
            let piece_count = s.info.piece_count;
            if piece >= piece_count {
                return Err(PeerError::InvalidMessage(format!(
                    "have {piece} out of {piece_count} pieces"
                )));
            }
            peer.record_have(now);
            peer.remote_bitfield
                .get_or_insert_with(|| Bitfield::new(piece_count as usize))
                .set(piece as usize, true);
            refresh_interest_for(s, addr, now);
            s.fill_requests(addr, now);
            Ok(())
        }

        Message::Bitfield(bytes) => {
            let remote = Bitfield::from_bytes(s.info.piece_count as usize, &bytes)?;
            peer.remote_bitfield = Some(remote);
            refresh_interest_for(s, addr, now);
            s.fill_requests(addr, now);
            Ok(())
        }

        Message::HaveAll => {
            if !peer.supports_fast {
                return Err(PeerError::InvalidMessage(
                    "have-all without fast extension".into(),
                ));
            }
            peer.remote_bitfield = Some(Bitfield::full(s.info.piece_count as usize));
            refresh_interest_for(s, addr, now);
            s.fill_requests(addr, now);
            Ok(())
        }

        Message::HaveNone => {
            if !peer.supports_fast {
                return Err(PeerError::InvalidMessage(
                    "have-none without fast extension".into(),
                ));
            }
            peer.remote_bitfield = Some(Bitfield::new(s.info.piece_count as usize));
            Ok(())
        }

        Message::Request {
            index,
            begin,
            length,
        } => {
            s.pipeline.validate_request(index, begin, length)?;
            let Some(peer) = s.peers.get_mut(&addr) else {
                return Ok(());
            };

            if peer.flags.am_choking && !peer.fast.should_serve_choked_request(index) {
                if peer.supports_fast {
                    peer.queue(
                        Message::Reject {
                            index,
                            begin,
                            length,
                        },
                        now,
                    );
                }
                // Without the fast extension a choked request is dropped.
                return Ok(());
            }

            peer.pending_serves.insert((index, begin));
            s.queue_disk(DiskRequest::ReadBlock {
                peer: addr,
                request: BlockRequest::new(index, begin, length),
            });
            Ok(())
        }

        Message::Piece { index, begin, data } => {
            s.pipeline
                .validate_request(index, begin, data.len() as u32)?;
            let Some(peer) = s.peers.get_mut(&addr) else {
                return Ok(());
            };
            peer.record_block(now, data.len() as u64);

            let (outcome, cancels) = s.pipeline.on_block_received(addr, index, begin);
            for (other, request) in cancels {
                if let Some(other_peer) = s.peers.get_mut(&other) {
                    other_peer.queue(
                        Message::Cancel {
                            index: request.piece,
                            begin: request.offset,
                            length: request.length,
                        },
                        now,
                    );
                }
            }

            match outcome {
                BlockOutcome::Dropped => {}
                BlockOutcome::Accepted => {
                    s.store_block(addr, index, begin, &data);
                }
                BlockOutcome::PieceComplete => {
                    s.store_block(addr, index, begin, &data);
                    s.complete_piece(index);
                }
            }
            s.fill_requests(addr, now);
            Ok(())
        }

        Message::Cancel { index, begin, .. } => {
            peer.pending_serves.remove(&(index, begin));
            Ok(())
        }

        // The port is the DHT collaborator's concern; the dispatcher only
        // routes it.
        Message::Port(_) => Ok(()),

        Message::Suggest { piece } => {
            if piece >= s.info.piece_count {
                return Err(PeerError::InvalidMessage(format!(
                    "suggest {piece} out of range"
                )));
            }
            peer.fast.add_suggested(piece);
            Ok(())
        }

        Message::AllowedFast { piece } => {
            if piece >= s.info.piece_count {
                return Err(PeerError::InvalidMessage(format!(
                    "allowed-fast {piece} out of range"
                )));
            }
            peer.fast.add_allowed_incoming(piece);
            // Fast grants make a choked peer request-eligible.
            s.fill_requests(addr, now);
            Ok(())
        }

        Message::Reject {
            index,
            begin,
            length: _,
        } => {
            if !peer.supports_fast {
                return Err(PeerError::InvalidMessage(
                    "reject without fast extension".into(),
                ));
            }
            s.pipeline.on_reject(&addr, index, begin);
            Ok(())
        }

        // Extended handshake and vendor messages are routed, not
        // interpreted; their payloads belong to outer layers.
        Message::Extended { .. } => Ok(()),

        Message::HashRequest {
            pieces_root,
            base_layer,
            index,
            length,
            proof_layers,
        } => {
            handle_hash_request(s, addr, pieces_root, base_layer, index, length, proof_layers, now);
            Ok(())
        }

        Message::Hashes {
            pieces_root,
            base_layer,
            index,
            length,
            proof_layers,
            hashes,
        } => {
            handle_hashes(
                s,
                pieces_root,
                base_layer,
                index,
                length,
                proof_layers,
                &hashes,
            );
            Ok(())
        }

        Message::HashReject { index, .. } => {
            s.release_hash_span(index);
            Ok(())
        }
    }
}

/// True for messages that carry or imply a piece index.
fn is_piece_indexed(msg: &Message) -> bool {
    matches!(
        msg,
        Message::Have { .. }
            | Message::Bitfield(_)
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone
            | Message::Request { .. }
            | Message::Piece { .. }
            | Message::Cancel { .. }
            | Message::Suggest { .. }
            | Message::AllowedFast { .. }
            | Message::Reject { .. }
            | Message::HashRequest { .. }
            | Message::Hashes { .. }
            | Message::HashReject { .. }
    )
}

/// Re-evaluates our interest in one peer after its availability changed.
fn refresh_interest_for(s: &mut TorrentSession, addr: SocketAddr, now: Instant) {
    let Some(peer) = s.peers.get_mut(&addr) else {
        return;
    };
    let interesting = peer
        .remote_bitfield
        .as_ref()
        .is_some_and(|remote| RequestPipeline::is_interesting(&s.bitfield, remote));
    if interesting != peer.flags.am_interested {
        peer.flags.am_interested = interesting;
        peer.queue(
            if interesting {
                Message::Interested
            } else {
                Message::NotInterested
            },
            now,
        );
    }
}

/// Serves a tree-hash request, or answers it with `HashReject`.
///
/// Invalid spans and unknown roots are rejected rather than treated as a
/// connection-fatal violation: the input is ambiguous enough that a
/// well-behaved peer must not be penalized.
#[allow(clippy::too_many_arguments)]
fn handle_hash_request(
    s: &mut TorrentSession,
    addr: SocketAddr,
    pieces_root: [u8; 32],
    base_layer: u32,
    index: u32,
    length: u32,
    proof_layers: u32,
    now: Instant,
) {
    let reject = Message::HashReject {
        pieces_root,
        base_layer,
        index,
        length,
        proof_layers,
    };

    let serveable = s.verifier.tree_root() == Some(pieces_root)
        && base_layer == s.piece_layer()
        && s.verifier.has_piece_roots()
        && validate_hash_request(s.info.piece_count, index, length, proof_layers).is_ok()
        && index < s.info.piece_count;

    let response = if serveable {
        s.verifier.piece_roots().and_then(|roots| {
            let tree = PieceTree::from_piece_roots(roots);
            let span = tree.span(index, length)?;
            let proof = tree.proof(index, length, proof_layers);
            let mut bytes = Vec::with_capacity((span.len() + proof.len()) * 32);
            for hash in span.iter().chain(proof.iter()) {
                bytes.extend_from_slice(hash);
            }
            Some(Message::Hashes {
                pieces_root,
                base_layer,
                index,
                length,
                proof_layers,
                hashes: Bytes::from(bytes),
            })
        })
    } else {
        None
    };

    if let Some(peer) = s.peers.get_mut(&addr) {
        match response {
            Some(message) => peer.queue(message, now),
            None => {
                debug!(peer = %addr, index, length, "rejecting hash request");
                peer.queue(reject, now);
            }
        }
    }
}

/// Applies a `Hashes` response while fetching the piece layer.
fn handle_hashes(
    s: &mut TorrentSession,
    pieces_root: [u8; 32],
    base_layer: u32,
    index: u32,
    length: u32,
    proof_layers: u32,
    hashes: &Bytes,
) {
    if s.mode != Mode::FetchingHashes {
        return;
    }
    let Some(root) = s.verifier.tree_root() else {
        return;
    };
    if root != pieces_root
        || base_layer != s.piece_layer()
        || validate_hash_request(s.info.piece_count, index, length, proof_layers).is_err()
    {
        s.release_hash_span(index);
        return;
    }

    let total = (hashes.len() / 32) as u32;
    if total < length {
        s.release_hash_span(index);
        return;
    }

    let all: Vec<[u8; 32]> = hashes
        .chunks_exact(32)
        .map(|chunk| {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();
    let (layer, proof) = all.split_at(length as usize);

    if verify_layer_span(&root, s.info.piece_count, index, layer, proof) {
        s.store_hash_span(index, layer);
    } else {
        debug!(index, length, "hash span failed verification");
        s.release_hash_span(index);
    }
}
