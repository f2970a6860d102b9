//! Length-prefixed JSON framing for the stdio worker transport.

use std::marker::PhantomData;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{HostMessage, WorkerMessage};

/// Maximum frame payload size: 64 MiB, enough for a full chunk of particles.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame codec that encodes `E` and decodes `D`.
pub struct FrameCodec<E, D> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn(E) -> D>,
}

/// Host side: writes [`HostMessage`], reads [`WorkerMessage`].
pub type HostCodec = FrameCodec<HostMessage, WorkerMessage>;
/// Worker side: writes [`WorkerMessage`], reads [`HostMessage`].
pub type WorkerCodec = FrameCodec<WorkerMessage, HostMessage>;

impl<E, D> FrameCodec<E, D> {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_SIZE)
            .length_adjustment(0)
            .new_codec();

        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<E, D> Default for FrameCodec<E, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Serialize, D> Encoder<E> for FrameCodec<E, D> {
    type Error = anyhow::Error;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).context("failed to serialize message")?;
        self.inner
            .encode(Bytes::from(json), dst)
            .context("failed to frame message")
    }
}

impl<E, D: DeserializeOwned> Decoder for FrameCodec<E, D> {
    type Item = D;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src).context("invalid frame")? {
            Some(bytes) => {
                let msg = serde_json::from_slice(&bytes).context("failed to deserialize message")?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}
