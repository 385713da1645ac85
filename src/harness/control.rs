//! The out-of-band control protocol between the two harness processes.
//! Messages are CBOR over the same length-prefixed framing the data
//! channels use.
use serde::{Deserialize, Serialize};

use crate::cbor;
use crate::transport::channel::{Channel, TcpChannel};
use crate::transport::TerminationStyle;

use super::{IterationReport, TestPlan};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("control channel i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed control message: {0}")]
    Cbor(#[from] cbor::CborError),
    #[error("the peer closed the control channel")]
    Disconnected,
    #[error("unexpected control message: expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: String,
    },
    #[error("the peer aborted the run: {0}")]
    Aborted(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Both sides open with a hello carrying a protocol version.
    Hello { version: u32 },
    /// Server to client: the full plan, up front.
    Plan(TestPlan),
    /// Server to client: start one iteration against the given data port.
    Iteration {
        index: u32,
        data_port: u16,
        termination: TerminationStyle,
    },
    /// Client to server: the engagement for this iteration.
    Engagement { qr_uri: String },
    /// Client to server: the holder's measurements for one iteration.
    Report(IterationReport),
    /// Server to client: the plan is exhausted.
    Done,
    /// Either direction: give up.
    Abort(String),
}

impl ControlMessage {
    pub const VERSION: u32 = 1;

    fn name(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "Hello",
            ControlMessage::Plan(_) => "Plan",
            ControlMessage::Iteration { .. } => "Iteration",
            ControlMessage::Engagement { .. } => "Engagement",
            ControlMessage::Report(_) => "Report",
            ControlMessage::Done => "Done",
            ControlMessage::Abort(_) => "Abort",
        }
    }
}

pub struct ControlChannel {
    channel: TcpChannel,
}

impl ControlChannel {
    pub fn new(stream: tokio::net::TcpStream) -> Self {
        Self {
            channel: TcpChannel::new(stream),
        }
    }

    pub async fn send(&mut self, message: &ControlMessage) -> Result<(), Error> {
        let frame = cbor::to_vec(message)?;
        self.channel.send_frame(&frame).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<ControlMessage, Error> {
        let frame = self
            .channel
            .recv_frame()
            .await?
            .ok_or(Error::Disconnected)?;
        Ok(cbor::from_slice(&frame)?)
    }

    /// Receive, insisting on a particular message. An abort from the peer
    /// surfaces as [Error::Aborted].
    pub async fn expect(
        &mut self,
        expected: &'static str,
        matches: impl Fn(&ControlMessage) -> bool,
    ) -> Result<ControlMessage, Error> {
        let message = self.recv().await?;
        if let ControlMessage::Abort(reason) = message {
            return Err(Error::Aborted(reason));
        }
        if matches(&message) {
            Ok(message)
        } else {
            Err(Error::Unexpected {
                expected,
                got: message.name().to_string(),
            })
        }
    }

    /// Exchange hellos and check the protocol version.
    pub async fn handshake(&mut self) -> Result<(), Error> {
        self.send(&ControlMessage::Hello {
            version: ControlMessage::VERSION,
        })
        .await?;
        let hello = self
            .expect("Hello", |m| matches!(m, ControlMessage::Hello { .. }))
            .await?;
        match hello {
            ControlMessage::Hello { version } if version == ControlMessage::VERSION => Ok(()),
            ControlMessage::Hello { version } => Err(Error::Unexpected {
                expected: "Hello with a matching version",
                got: format!("Hello with version {version}"),
            }),
            _ => unreachable!("expect only returns the matched message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_and_plan_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut control = ControlChannel::new(stream);
            control.handshake().await.unwrap();
            control
                .send(&ControlMessage::Plan(TestPlan::all_styles()))
                .await
                .unwrap();
        });
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut control = ControlChannel::new(stream);
        control.handshake().await.unwrap();
        let plan = control
            .expect("Plan", |m| matches!(m, ControlMessage::Plan(_)))
            .await
            .unwrap();
        assert_eq!(plan, ControlMessage::Plan(TestPlan::all_styles()));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn abort_surfaces_as_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut control = ControlChannel::new(stream);
            control
                .send(&ControlMessage::Abort("out of fixtures".to_string()))
                .await
                .unwrap();
        });
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut control = ControlChannel::new(stream);
        let err = control
            .expect("Iteration", |m| matches!(m, ControlMessage::Iteration { .. }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted(reason) if reason == "out of fixtures"));
        server.await.unwrap();
    }
}
