//! In-process transport
//!
//! Wires a client engine and a server engine living in the same process
//! through a pair of bounded channels. Frames cross without serialization.
//! Exists for testing and embedded use.

use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::Frame;
use crate::error::Result;
use crate::transport::{
    closed_channel, CloseCause, ClosedNotifier, ClosedSignal, FrameReceiver, FrameSender,
    Transport, DEFAULT_SEND_BUFFER,
};

/// One side of an in-process pairing. Construct with [`pair`].
pub struct InProcessTransport {
    to_peer: tokio::sync::mpsc::Sender<Frame>,
    from_peer: Option<FrameReceiver>,
    closed: Arc<ClosedNotifier>,
}

/// Create a connected transport pair sharing bounded channels of the given
/// capacity. Closing either side surfaces `TransportClosed` to both peers.
pub fn pair(buffer: usize) -> (InProcessTransport, InProcessTransport) {
    let (a_to_b, from_a) = tokio::sync::mpsc::channel(buffer);
    let (b_to_a, from_b) = tokio::sync::mpsc::channel(buffer);
    let closed = Arc::new(closed_channel());

    let a = InProcessTransport {
        to_peer: a_to_b,
        from_peer: Some(from_b),
        closed: closed.clone(),
    };
    let b = InProcessTransport {
        to_peer: b_to_a,
        from_peer: Some(from_a),
        closed,
    };
    (a, b)
}

/// [`pair`] with the default buffer size.
pub fn default_pair() -> (InProcessTransport, InProcessTransport) {
    pair(DEFAULT_SEND_BUFFER)
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn start(&mut self) -> Result<()> {
        // The channels are wired at construction; nothing to spin up.
        Ok(())
    }

    fn sender(&self) -> FrameSender {
        FrameSender::new(self.to_peer.clone())
    }

    fn incoming(&mut self) -> Option<FrameReceiver> {
        self.from_peer.take()
    }

    fn closed(&self) -> ClosedSignal {
        self.closed.subscribe()
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.notify(CloseCause::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::JsonRpcNotification;

    fn frame() -> Frame {
        Frame::Notification(JsonRpcNotification::new("notifications/initialized"))
    }

    #[tokio::test]
    async fn test_frames_cross_between_peers() {
        let (mut a, mut b) = default_pair();
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.sender().send(frame()).unwrap();
        let mut rx = b.incoming().unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got, frame());
    }

    #[tokio::test]
    async fn test_close_signals_both_peers() {
        let (mut a, b) = default_pair();
        let a_signal = a.closed();
        let b_signal = b.closed();

        a.close().await.unwrap();
        assert!(matches!(a_signal.wait().await, Error::TransportClosed));
        assert!(matches!(b_signal.wait().await, Error::TransportClosed));
    }

    #[tokio::test]
    async fn test_bounded_buffer_backpressure() {
        let (a, _b) = pair(2);
        let sender = a.sender();
        sender.send(frame()).unwrap();
        sender.send(frame()).unwrap();
        assert!(matches!(
            sender.send(frame()),
            Err(Error::BackpressureFull)
        ));
    }

    #[tokio::test]
    async fn test_incoming_taken_once() {
        let (mut a, _b) = default_pair();
        assert!(a.incoming().is_some());
        assert!(a.incoming().is_none());
    }
}
