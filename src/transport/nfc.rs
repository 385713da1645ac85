//! The NFC data-exchange tunnel: a half-duplex command/response flow bounded
//! by the negotiated data field lengths.
//!
//! The poller (reader) drives all traffic. Messages towards the listener
//! travel as chained command frames; messages back are pulled one chunk per
//! poll. Frame tags: `0xA4` select/negotiate, `0x00`/`0x01` data chunk
//! (continuation in the tag), `0xB0` poll, `0x90` acknowledgement.
use super::Error;
use crate::definitions::device_engagement::NfcOptions;
use crate::transport::channel::Channel;

const TAG_SELECT: u8 = 0xA4;
const TAG_LAST: u8 = 0x00;
const TAG_MORE: u8 = 0x01;
const TAG_POLL: u8 = 0xB0;
const TAG_ACK: u8 = 0x90;

pub struct NfcLink {
    channel: Box<dyn Channel>,
    poller: bool,
    max_command: usize,
    max_response: usize,
}

fn negotiate_frame(options: &NfcOptions) -> Vec<u8> {
    let mut frame = vec![TAG_SELECT];
    frame.extend((options.max_command_len() as u16).to_be_bytes());
    frame.extend((options.max_response_len() as u32).to_be_bytes());
    frame
}

fn parse_negotiate_frame(frame: &[u8]) -> Result<(usize, usize), Error> {
    match frame {
        [TAG_SELECT, c0, c1, r0, r1, r2, r3] => Ok((
            u16::from_be_bytes([*c0, *c1]) as usize,
            u32::from_be_bytes([*r0, *r1, *r2, *r3]) as usize,
        )),
        _ => Err(Error::InvalidFrame("expected a select frame")),
    }
}

impl NfcLink {
    /// Connect as the poller: select the tunnel and settle the data field
    /// lengths to the minimum of both sides' limits.
    pub async fn connect_poller(
        mut channel: Box<dyn Channel>,
        options: &NfcOptions,
    ) -> Result<Self, Error> {
        channel.send_frame(&negotiate_frame(options)).await?;
        let reply = channel.recv_frame().await?.ok_or(Error::ConnectionLost)?;
        let (max_command, max_response) = parse_negotiate_frame(&reply)?;
        Ok(Self {
            channel,
            poller: true,
            max_command: max_command.min(options.max_command_len()),
            max_response: max_response.min(options.max_response_len()),
        })
    }

    /// Accept the poller's selection as the listener.
    pub async fn accept_listener(
        mut channel: Box<dyn Channel>,
        options: &NfcOptions,
    ) -> Result<Self, Error> {
        let frame = channel.recv_frame().await?.ok_or(Error::ConnectionLost)?;
        let (their_command, their_response) = parse_negotiate_frame(&frame)?;
        let max_command = their_command.min(options.max_command_len());
        let max_response = their_response.min(options.max_response_len());
        let mut reply = vec![TAG_SELECT];
        reply.extend((max_command as u16).to_be_bytes());
        reply.extend((max_response as u32).to_be_bytes());
        channel.send_frame(&reply).await?;
        Ok(Self {
            channel,
            poller: false,
            max_command,
            max_response,
        })
    }

    pub async fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        if self.poller {
            self.send_commands(message).await
        } else {
            self.answer_polls(message).await
        }
    }

    pub async fn wait_for_message(&mut self) -> Result<Vec<u8>, Error> {
        if self.poller {
            self.poll_for_message().await
        } else {
            self.receive_commands().await
        }
    }

    /// Poller to listener: chained command frames, each acknowledged.
    async fn send_commands(&mut self, message: &[u8]) -> Result<(), Error> {
        let chunk_len = self.max_command.saturating_sub(1).max(1);
        let mut chunks = message.chunks(chunk_len).peekable();
        if chunks.peek().is_none() {
            self.channel.send_frame(&[TAG_LAST]).await?;
            self.expect_ack().await?;
            return Ok(());
        }
        while let Some(chunk) = chunks.next() {
            let tag = if chunks.peek().is_some() {
                TAG_MORE
            } else {
                TAG_LAST
            };
            self.channel.send_frame(&[&[tag][..], chunk].concat()).await?;
            self.expect_ack().await?;
        }
        Ok(())
    }

    async fn expect_ack(&mut self) -> Result<(), Error> {
        let reply = self
            .channel
            .recv_frame()
            .await?
            .ok_or(Error::ConnectionLost)?;
        match reply.as_slice() {
            [TAG_ACK] => Ok(()),
            _ => Err(Error::InvalidFrame("expected an acknowledgement")),
        }
    }

    async fn receive_commands(&mut self) -> Result<Vec<u8>, Error> {
        let mut message = Vec::new();
        loop {
            let frame = self
                .channel
                .recv_frame()
                .await?
                .ok_or(Error::ConnectionLost)?;
            if frame.len() > self.max_command {
                return Err(Error::InvalidFrame("command exceeds negotiated length"));
            }
            let (tag, chunk) = frame
                .split_first()
                .ok_or(Error::InvalidFrame("empty command frame"))?;
            message.extend_from_slice(chunk);
            self.channel.send_frame(&[TAG_ACK]).await?;
            match *tag {
                TAG_MORE => continue,
                TAG_LAST => return Ok(message),
                _ => return Err(Error::InvalidFrame("unexpected command tag")),
            }
        }
    }

    /// Listener to poller: each poll pulls one response chunk.
    async fn answer_polls(&mut self, message: &[u8]) -> Result<(), Error> {
        let chunk_len = self.max_response.saturating_sub(1).max(1);
        let chunks: Vec<&[u8]> = if message.is_empty() {
            vec![&[]]
        } else {
            message.chunks(chunk_len).collect()
        };
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let poll = self
                .channel
                .recv_frame()
                .await?
                .ok_or(Error::ConnectionLost)?;
            if poll.as_slice() != [TAG_POLL] {
                return Err(Error::InvalidFrame("expected a poll"));
            }
            let tag = if i == last { TAG_LAST } else { TAG_MORE };
            self.channel
                .send_frame(&[&[tag][..], chunk].concat())
                .await?;
        }
        Ok(())
    }

    async fn poll_for_message(&mut self) -> Result<Vec<u8>, Error> {
        let mut message = Vec::new();
        loop {
            // A link dropped before any chunk arrives is the listener
            // leaving the field: the transport-specific close signal.
            let polled = match self.channel.send_frame(&[TAG_POLL]).await {
                Ok(()) => self.channel.recv_frame().await,
                Err(e) => Err(e),
            };
            let frame = match polled {
                Ok(Some(frame)) => frame,
                Ok(None) | Err(_) if message.is_empty() => return Ok(Vec::new()),
                Ok(None) => return Err(Error::ConnectionLost),
                Err(e) => return Err(e.into()),
            };
            if frame.len() > self.max_response {
                return Err(Error::InvalidFrame("response exceeds negotiated length"));
            }
            let (tag, chunk) = frame
                .split_first()
                .ok_or(Error::InvalidFrame("empty response frame"))?;
            message.extend_from_slice(chunk);
            match *tag {
                TAG_MORE => continue,
                TAG_LAST => return Ok(message),
                _ => return Err(Error::InvalidFrame("unexpected response tag")),
            }
        }
    }

    /// Transport-specific termination. The poller pushes an empty command
    /// chain; the listener cannot push, so it drops the link, the tunnel's
    /// equivalent of tag removal. Neither side waits on the peer.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.poller {
            self.send_message(&[]).await?;
        }
        self.channel.shutdown().await?;
        Ok(())
    }

    pub async fn abort(&mut self) -> Result<(), Error> {
        self.channel.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definitions::device_engagement::nfc_options::{
        CommandDataLength, ResponseDataLength,
    };
    use crate::transport::channel::memory_pair;

    fn small_options() -> NfcOptions {
        NfcOptions::new(
            CommandDataLength::new(255).unwrap(),
            ResponseDataLength::new(256).unwrap(),
        )
    }

    #[tokio::test]
    async fn chained_commands_roundtrip() {
        let (a, b) = memory_pair();
        let options = small_options();
        let (poller, listener) = tokio::join!(
            NfcLink::connect_poller(Box::new(a), &options),
            NfcLink::accept_listener(Box::new(b), &options),
        );
        let mut poller = poller.unwrap();
        let mut listener = listener.unwrap();

        let message = vec![0x5A; 1000];
        let (sent, received) =
            tokio::join!(poller.send_message(&message), listener.wait_for_message());
        sent.unwrap();
        assert_eq!(received.unwrap(), message);

        let reply = vec![0xC3; 900];
        let (sent, received) =
            tokio::join!(listener.send_message(&reply), poller.wait_for_message());
        sent.unwrap();
        assert_eq!(received.unwrap(), reply);
    }

    #[tokio::test]
    async fn negotiated_lengths_take_the_minimum() {
        let (a, b) = memory_pair();
        let poller_options = NfcOptions::default();
        let listener_options = small_options();
        let (poller, listener) = tokio::join!(
            NfcLink::connect_poller(Box::new(a), &poller_options),
            NfcLink::accept_listener(Box::new(b), &listener_options),
        );
        let poller = poller.unwrap();
        let listener = listener.unwrap();
        assert_eq!(poller.max_command, 255);
        assert_eq!(listener.max_command, 255);
        assert_eq!(poller.max_response, 256);
        assert_eq!(listener.max_response, 256);
    }
}
