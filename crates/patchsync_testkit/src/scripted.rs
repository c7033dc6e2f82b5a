//! A raw protocol client.
//!
//! Speaks the wire protocol directly so tests can assert on exactly what
//! the synchronizer sends, and answer however they like.

use crate::harness::within;
use patchsync_protocol::{
    Ack, ChannelError, FrameReader, FrameWriter, Goodbye, Hello, Message, PatchOp, PatchSetEnd,
    PathOutcome, Revision, SyncPlan, TreeDigest, Welcome,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use uuid::Uuid;

/// One patch set as received.
#[derive(Debug, Clone)]
pub struct ReceivedSet {
    /// Announcement.
    pub plan: SyncPlan,
    /// Operations in arrival order.
    pub ops: Vec<PatchOp>,
    /// Closing marker.
    pub end: PatchSetEnd,
}

impl ReceivedSet {
    /// A clean acknowledgment claiming the expected digest.
    pub fn clean_ack(&self) -> Ack {
        let results = self
            .ops
            .iter()
            .map(|op| (op.path.clone(), PathOutcome::Applied))
            .collect();
        Ack {
            to: self.end.to.clone(),
            results,
            actual_digest: self.end.expected_digest,
            current_revision: Some(self.end.to.clone()),
        }
    }

    /// An acknowledgment reporting `path` as failed.
    pub fn failed_ack(&self, path: &str, current: Option<Revision>, digest: TreeDigest) -> Ack {
        let mut results: BTreeMap<_, _> = self
            .ops
            .iter()
            .map(|op| (op.path.clone(), PathOutcome::Applied))
            .collect();
        results.insert(
            path.to_string(),
            PathOutcome::Failed {
                reason: "injected failure".into(),
            },
        );
        Ack {
            to: self.end.to.clone(),
            results,
            actual_digest: digest,
            current_revision: current,
        }
    }
}

/// A hand-driven agent connection.
pub struct ScriptedAgent {
    /// Identity used in `Hello`.
    pub agent_id: Uuid,
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl ScriptedAgent {
    /// Connects and sends `Hello`. The caller reads the answer.
    pub async fn connect(addr: SocketAddr, hello: Hello) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        let mut agent = Self {
            agent_id: hello.agent_id,
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
        };
        agent.send(Message::Hello(hello)).await?;
        Ok(agent)
    }

    /// Connects and completes the handshake.
    ///
    /// # Panics
    ///
    /// Panics if the synchronizer does not answer with `Welcome`.
    pub async fn handshake(addr: SocketAddr, hello: Hello) -> (Self, Welcome) {
        let mut agent = Self::connect(addr, hello).await.expect("Failed to connect");
        match agent.recv().await {
            Some(Message::Welcome(welcome)) => (agent, welcome),
            other => panic!("expected Welcome, got {other:?}"),
        }
    }

    /// Sends a message.
    pub async fn send(&mut self, message: Message) -> Result<(), ChannelError> {
        self.writer.send(&message).await
    }

    /// Next message other than a heartbeat; `None` at end of stream.
    ///
    /// # Panics
    ///
    /// Panics on a read error or when nothing arrives in time.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let message = within("next message", self.reader.next())
                .await
                .expect("Failed to read message")?;
            if !matches!(message, Message::Heartbeat(_)) {
                return Some(message);
            }
        }
    }

    /// Reads one complete patch set.
    ///
    /// # Panics
    ///
    /// Panics when the stream does not carry a well-formed patch set next.
    pub async fn next_set(&mut self) -> ReceivedSet {
        let plan = match self.recv().await {
            Some(Message::SyncPlan(plan)) => plan,
            other => panic!("expected SyncPlan, got {other:?}"),
        };
        let mut ops = Vec::with_capacity(plan.op_count as usize);
        loop {
            match self.recv().await {
                Some(Message::PatchOp(op)) => ops.push(op),
                Some(Message::PatchSetEnd(end)) => {
                    return ReceivedSet { plan, ops, end };
                }
                other => panic!("expected PatchOp or PatchSetEnd, got {other:?}"),
            }
        }
    }

    /// Sends an acknowledgment.
    pub async fn ack(&mut self, ack: Ack) -> Result<(), ChannelError> {
        self.send(Message::Ack(ack)).await
    }

    /// Says goodbye and closes the write half.
    pub async fn goodbye(mut self, reason: &str) -> Result<(), ChannelError> {
        self.send(Message::Goodbye(Goodbye {
            reason: reason.to_string(),
        }))
        .await?;
        self.writer.shutdown().await
    }
}
