//! Gossip wire protocol: length-prefixed JSON frames over TCP.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::event::Member;

/// Upper bound on a single gossip frame.
const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Messages exchanged between gossip nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Message {
    /// Introduction sent when dialling a peer; answered with `Members`.
    Join {
        /// The dialling node.
        member: Member,
    },
    /// Full member-list exchange.
    Members {
        /// Every member the sender believes alive, itself included.
        members: Vec<Member>,
    },
    /// Liveness probe.
    Ping {
        /// The probing node.
        from: Member,
    },
    /// Graceful departure announcement.
    Leave {
        /// Name of the departing node.
        name: String,
    },
    /// Application broadcast, flooded to every member.
    User {
        /// Name of the originating node.
        origin: String,
        /// Per-origin sequence number for de-duplication.
        seq: u64,
        /// Event name.
        name: String,
        /// Opaque payload.
        payload: Vec<u8>,
        /// Whether delivery may be dropped under backpressure.
        coalesce: bool,
    },
}

/// Write one frame: u32 big-endian length, then the JSON body.
pub(crate) async fn write_frame(stream: &mut TcpStream, message: &Message) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame written by [`write_frame`].
pub(crate) async fn read_frame(stream: &mut TcpStream) -> Result<Message> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    #[tokio::test]
    async fn frames_round_trip_over_a_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let sent = Message::User {
            origin: "127.0.0.1:7000".into(),
            seq: 3,
            name: "apply".into(),
            payload: b"{\"op\":\"set\"}".to_vec(),
            coalesce: false,
        };

        let send = sent.clone();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            write_frame(&mut stream, &send).await.unwrap();
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let received = read_frame(&mut stream).await.unwrap();
        client.await.unwrap();

        match received {
            Message::User {
                origin,
                seq,
                name,
                payload,
                coalesce,
            } => {
                assert_eq!(origin, "127.0.0.1:7000");
                assert_eq!(seq, 3);
                assert_eq!(name, "apply");
                assert_eq!(payload, b"{\"op\":\"set\"}");
                assert!(!coalesce);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn member_encoding_is_self_describing() {
        let member = Member::new(Address::new("127.0.0.1", 7000));
        let json = serde_json::to_string(&Message::Join {
            member: member.clone(),
        })
        .unwrap();
        assert!(json.contains("\"name\":\"127.0.0.1:7000\""));

        let decoded: Message = serde_json::from_str(&json).unwrap();
        match decoded {
            Message::Join { member: m } => assert_eq!(m, member),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
