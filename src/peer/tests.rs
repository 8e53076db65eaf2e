use super::*;
use bytes::Bytes;

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(id1.client_id(), Some("RP0001"));
}

#[test]
fn test_handshake_encode_decode() {
    let info_hash = [1u8; 20];
    let peer_id = [2u8; 20];

    let handshake = Handshake::new(info_hash, peer_id);
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded.info_hash, info_hash);
    assert_eq!(decoded.peer_id, peer_id);
    assert!(decoded.supports_extension_protocol());
    assert!(decoded.supports_fast_extension());
}

#[test]
fn test_handshake_rejects_garbage() {
    assert!(Handshake::decode(&[0u8; 68]).is_err());
    assert!(Handshake::decode(&[19u8; 10]).is_err());
}

#[test]
fn test_message_encode_decode() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xA0])),
        Message::Request {
            index: 1,
            begin: 0,
            length: 16384,
        },
        Message::Piece {
            index: 1,
            begin: 16384,
            data: Bytes::from_static(b"block data"),
        },
        Message::Cancel {
            index: 1,
            begin: 0,
            length: 16384,
        },
        Message::Port(6881),
        Message::Suggest { piece: 9 },
        Message::HaveAll,
        Message::HaveNone,
        Message::Reject {
            index: 2,
            begin: 32768,
            length: 16384,
        },
        Message::AllowedFast { piece: 3 },
        Message::Extended {
            id: 1,
            payload: Bytes::from_static(b"d0:e"),
        },
    ];

    for msg in messages {
        let name = msg.name();
        let encoded = msg.encode();
        let decoded = Message::decode(encoded).unwrap();
        assert_eq!(decoded.name(), name);
    }
}

#[test]
fn test_hash_request_roundtrip() {
    let msg = Message::HashRequest {
        pieces_root: [0xCD; 32],
        base_layer: 7,
        index: 64,
        length: 8,
        proof_layers: 3,
    };
    let decoded = Message::decode(msg.encode()).unwrap();
    match decoded {
        Message::HashRequest {
            pieces_root,
            base_layer,
            index,
            length,
            proof_layers,
        } => {
            assert_eq!(pieces_root, [0xCD; 32]);
            assert_eq!(base_layer, 7);
            assert_eq!(index, 64);
            assert_eq!(length, 8);
            assert_eq!(proof_layers, 3);
        }
        other => panic!("decoded {:?}", other.name()),
    }
}

#[test]
fn test_hashes_roundtrip() {
    let hash_bytes = Bytes::from(vec![0x11u8; 3 * 32]);
    let msg = Message::Hashes {
        pieces_root: [0xEF; 32],
        base_layer: 0,
        index: 0,
        length: 2,
        proof_layers: 1,
        hashes: hash_bytes.clone(),
    };
    let decoded = Message::decode(msg.encode()).unwrap();
    match decoded {
        Message::Hashes { hashes, length, .. } => {
            assert_eq!(hashes, hash_bytes);
            assert_eq!(length, 2);
        }
        other => panic!("decoded {:?}", other.name()),
    }
}

#[test]
fn test_hashes_rejects_ragged_payload() {
    let msg = Message::Hashes {
        pieces_root: [0; 32],
        base_layer: 0,
        index: 0,
        length: 1,
        proof_layers: 0,
        hashes: Bytes::from(vec![0u8; 33]),
    };
    assert!(Message::decode(msg.encode()).is_err());
}

#[test]
fn test_hash_reject_roundtrip() {
    let msg = Message::HashReject {
        pieces_root: [0x01; 32],
        base_layer: 2,
        index: 512,
        length: 512,
        proof_layers: 0,
    };
    let decoded = Message::decode(msg.encode()).unwrap();
    assert_eq!(decoded.name(), "hash-reject");
}

#[test]
fn test_unknown_message_id_is_fatal() {
    let err = Message::decode(Bytes::from(vec![0u8, 0, 0, 1, 12])).unwrap_err();
    assert!(matches!(err, PeerError::InvalidMessageId(12)));
}

#[test]
fn test_truncated_message_rejected() {
    // Declared length runs past the buffer.
    let raw = Bytes::from_static(&[0, 0, 0, 13, 6, 0, 0]);
    assert!(Message::decode(raw).is_err());
}

#[tokio::test]
async fn test_transport_roundtrip() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut a = PeerTransport::new(client);
    let mut b = PeerTransport::new(server);

    let handshake = Handshake::new([7u8; 20], [8u8; 20]);
    a.send_handshake(&handshake).await.unwrap();
    let got = b.receive_handshake().await.unwrap();
    assert_eq!(got.info_hash, [7u8; 20]);

    a.send_message(&Message::Have { piece: 12 }).await.unwrap();
    a.send_message(&Message::KeepAlive).await.unwrap();

    match b.receive_message().await.unwrap() {
        Message::Have { piece } => assert_eq!(piece, 12),
        other => panic!("got {:?}", other.name()),
    }
    assert!(matches!(
        b.receive_message().await.unwrap(),
        Message::KeepAlive
    ));
}

#[tokio::test]
async fn test_transport_rejects_oversized_frame() {
    let (client, server) = tokio::io::duplex(1024);
    let mut b = PeerTransport::new(server);

    use tokio::io::AsyncWriteExt;
    let mut client = client;
    // 64 MiB declared length, over the frame cap.
    client.write_all(&(64u32 << 20).to_be_bytes()).await.unwrap();

    let err = b.receive_message().await.unwrap_err();
    assert!(matches!(err, PeerError::InvalidMessage(_)));
}
