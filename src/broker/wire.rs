//! Frames spoken between the embedded broker and its clients: length-delimited JSON.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};
use tracing::debug;

use crate::error::{MessagingError, MessagingResult};

pub(crate) const PROTOCOL_VERSION: u16 = 1;

/// Name the embedded broker answers a handshake with.
pub(crate) const BROKER_NAME: &str = "evaluation-broker";

const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub(crate) enum Frame {
    Hello {
        client: String,
        protocol: u16,
    },
    Welcome {
        broker: String,
        protocol: u16,
    },
    Subscribe {
        subscription: u64,
        exchange: String,
        binding: String,
    },
    Subscribed {
        subscription: u64,
    },
    Unsubscribe {
        subscription: u64,
    },
    Publish {
        exchange: String,
        routing_key: String,
        #[serde(with = "crate::messages::base64_bytes")]
        body: Vec<u8>,
    },
    Deliver {
        subscription: u64,
        routing_key: String,
        #[serde(with = "crate::messages::base64_bytes")]
        body: Vec<u8>,
    },
    Refused {
        reason: String,
    },
}

pub(crate) type FrameStream = Framed<TcpStream, FrameCodec>;

pub(crate) struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub(crate) fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MessagingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MessagingError> {
        match self.inner.decode(src)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| MessagingError::Protocol(format!("undecodable frame: {}", err))),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MessagingError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MessagingError> {
        let body = serde_json::to_vec(&frame)?;
        self.inner.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

pub(crate) fn framed(stream: TcpStream) -> FrameStream {
    Framed::new(stream, FrameCodec::new())
}

/// Connects and completes the `Hello`/`Welcome` handshake within `wait`.
pub(crate) async fn connect(host: &str, port: u16, client: &str, wait: Duration) -> MessagingResult<FrameStream> {
    tokio::time::timeout(wait, handshake(host, port, client))
        .await
        .map_err(|_| MessagingError::Connection(format!("no handshake from {}:{} within {:?}", host, port, wait)))?
}

async fn handshake(host: &str, port: u16, client: &str) -> MessagingResult<FrameStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    let mut frames = framed(stream);

    frames
        .send(Frame::Hello {
            client: client.to_string(),
            protocol: PROTOCOL_VERSION,
        })
        .await?;

    let reply = frames.next().await;
    match reply {
        Some(Ok(Frame::Welcome { protocol, .. })) if protocol == PROTOCOL_VERSION => Ok(frames),
        Some(Ok(Frame::Welcome { protocol, .. })) => Err(MessagingError::Protocol(format!(
            "broker speaks protocol {} but {} is required",
            protocol, PROTOCOL_VERSION
        ))),
        Some(Ok(Frame::Refused { reason })) => Err(MessagingError::Connection(reason)),
        Some(Ok(other)) => Err(MessagingError::Protocol(format!("expected a welcome, got {:?}", other))),
        Some(Err(err)) => Err(err),
        None => Err(MessagingError::Connection(format!(
            "{}:{} closed the connection during the handshake",
            host, port
        ))),
    }
}

/// Whether an embedded broker answers the handshake on `host:port`.
pub(crate) async fn probe(host: &str, port: u16, wait: Duration) -> bool {
    match connect(host, port, "probe", wait).await {
        Ok(_) => true,
        Err(err) => {
            debug!("embedded broker probe of {}:{} failed: {}", host, port, err);
            false
        }
    }
}
