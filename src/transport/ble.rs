//! BLE data-plane framing: the GATT message stream with MTU negotiation,
//! ident verification and chunked transfer, and the unchunked L2CAP stream.
//!
//! Control frames are exchanged once at connection time:
//! `0x01` MTU proposal/decision, `0x02` ident presentation, `0x03` ident
//! acknowledged, `0x04` ident mismatch. Data frames carry a leading
//! continuation byte: `1` for more chunks to follow, `0` for the last.
use super::Error;
use crate::transport::channel::Channel;

const CONTROL_MTU: u8 = 0x01;
const CONTROL_IDENT: u8 = 0x02;
const CONTROL_IDENT_OK: u8 = 0x03;
const CONTROL_IDENT_MISMATCH: u8 = 0x04;

/// Smallest MTU the protocol tolerates; enough for the continuation byte,
/// attribute overhead and one payload byte.
pub const MIN_MTU: u16 = 23;
pub const DEFAULT_MTU: u16 = 512;

/// The GATT server-to-client message stream and its mirror image, after
/// connection setup.
pub struct GattLink {
    channel: Box<dyn Channel>,
    mtu: u16,
}

impl GattLink {
    /// Connect as the GATT central: propose an MTU, accept the peripheral's
    /// decision, and present the expected ident for verification.
    pub async fn connect_central(
        mut channel: Box<dyn Channel>,
        preferred_mtu: u16,
        expected_ident: Option<[u8; 16]>,
    ) -> Result<Self, Error> {
        let proposed = preferred_mtu.max(MIN_MTU);
        channel
            .send_frame(&[&[CONTROL_MTU][..], &proposed.to_be_bytes()[..]].concat())
            .await?;
        let reply = channel.recv_frame().await?.ok_or(Error::ConnectionLost)?;
        let mtu = match reply.as_slice() {
            [CONTROL_MTU, hi, lo] => u16::from_be_bytes([*hi, *lo]),
            _ => return Err(Error::InvalidFrame("expected an MTU decision")),
        };
        if mtu < MIN_MTU || mtu > proposed {
            return Err(Error::InvalidFrame("unacceptable MTU decision"));
        }
        if let Some(ident) = expected_ident {
            channel
                .send_frame(&[&[CONTROL_IDENT][..], &ident[..]].concat())
                .await?;
            let reply = channel.recv_frame().await?.ok_or(Error::ConnectionLost)?;
            match reply.as_slice() {
                [CONTROL_IDENT_OK] => {}
                [CONTROL_IDENT_MISMATCH] => return Err(Error::IdentMismatch),
                _ => return Err(Error::InvalidFrame("expected an ident acknowledgement")),
            }
        }
        Ok(Self { channel, mtu })
    }

    /// Accept a central's connection as the GATT peripheral: decide the MTU
    /// and verify the presented ident against our own.
    pub async fn accept_peripheral(
        mut channel: Box<dyn Channel>,
        max_mtu: u16,
        our_ident: Option<[u8; 16]>,
    ) -> Result<Self, Error> {
        let frame = channel.recv_frame().await?.ok_or(Error::ConnectionLost)?;
        let proposed = match frame.as_slice() {
            [CONTROL_MTU, hi, lo] => u16::from_be_bytes([*hi, *lo]),
            _ => return Err(Error::InvalidFrame("expected an MTU proposal")),
        };
        let mtu = proposed.min(max_mtu).max(MIN_MTU);
        channel
            .send_frame(&[&[CONTROL_MTU][..], &mtu.to_be_bytes()[..]].concat())
            .await?;
        // The central only presents an ident if it has one to check.
        if let Some(ident) = our_ident {
            let frame = channel.recv_frame().await?.ok_or(Error::ConnectionLost)?;
            match frame.as_slice() {
                [CONTROL_IDENT, presented @ ..] if presented == ident.as_slice() => {
                    channel.send_frame(&[CONTROL_IDENT_OK]).await?;
                }
                [CONTROL_IDENT, ..] => {
                    channel.send_frame(&[CONTROL_IDENT_MISMATCH]).await?;
                    return Err(Error::IdentMismatch);
                }
                _ => return Err(Error::InvalidFrame("expected an ident presentation")),
            }
        }
        Ok(Self { channel, mtu })
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    fn chunk_len(&self) -> usize {
        // Three bytes of attribute overhead and the continuation byte.
        usize::from(self.mtu) - 4
    }

    pub async fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        let chunk_len = self.chunk_len().max(1);
        let mut chunks = message.chunks(chunk_len).peekable();
        if chunks.peek().is_none() {
            self.channel.send_frame(&[0]).await?;
            return Ok(());
        }
        while let Some(chunk) = chunks.next() {
            let more: u8 = chunks.peek().is_some().into();
            self.channel
                .send_frame(&[&[more][..], chunk].concat())
                .await?;
        }
        Ok(())
    }

    /// Reassemble the next message. An empty message is the
    /// transport-specific termination signal.
    pub async fn wait_for_message(&mut self) -> Result<Vec<u8>, Error> {
        let mut message = Vec::new();
        loop {
            let frame = self
                .channel
                .recv_frame()
                .await?
                .ok_or(Error::ConnectionLost)?;
            let (more, chunk) = frame
                .split_first()
                .ok_or(Error::InvalidFrame("empty data frame"))?;
            if frame.len() > usize::from(self.mtu).saturating_sub(3) {
                return Err(Error::InvalidFrame("frame exceeds negotiated MTU"));
            }
            message.extend_from_slice(chunk);
            match more {
                1 => continue,
                0 => return Ok(message),
                _ => return Err(Error::InvalidFrame("invalid continuation byte")),
            }
        }
    }

    /// Signal transport-specific termination and tear the link down.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.send_message(&[]).await?;
        self.channel.shutdown().await?;
        Ok(())
    }

    pub async fn abort(&mut self) -> Result<(), Error> {
        self.channel.shutdown().await?;
        Ok(())
    }
}

/// An L2CAP connection-oriented channel: messages map one-to-one onto
/// frames, no chunking.
pub struct L2capLink {
    channel: Box<dyn Channel>,
}

impl L2capLink {
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self { channel }
    }

    pub async fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        self.channel.send_frame(message).await?;
        Ok(())
    }

    pub async fn wait_for_message(&mut self) -> Result<Vec<u8>, Error> {
        self.channel
            .recv_frame()
            .await?
            .ok_or(Error::ConnectionLost)
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        self.channel.send_frame(&[]).await?;
        self.channel.shutdown().await?;
        Ok(())
    }

    pub async fn abort(&mut self) -> Result<(), Error> {
        self.channel.shutdown().await?;
        Ok(())
    }
}
