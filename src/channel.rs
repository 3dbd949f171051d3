//! The unreliable datagram channel the engine runs over.
//!
//! The engine never creates sockets itself. It talks to a [`DatagramChannel`]:
//! [`UdpChannel`] adapts a tokio UDP socket, and [`memory::MemoryChannel`] is
//! an in-process link with scripted loss, duplication, reordering and delay
//! for deterministic tests.

use crate::error::ChannelError;
use crate::Result;
use log::debug;
use parking_lot::Mutex;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};

/// A bidirectional, unreliable, unordered datagram channel to one peer.
///
/// Implementations must be cancel-safe in `recv`: dropping the future before
/// it completes must not lose a datagram.
pub trait DatagramChannel: Send + Sync + 'static {
    /// Hands one datagram to the channel. Delivery is not guaranteed.
    fn send(
        &self,
        datagram: &[u8],
    ) -> impl Future<Output = std::result::Result<(), ChannelError>> + Send;

    /// Waits up to `timeout` for the next datagram and copies it into `buf`.
    ///
    /// Returns the datagram length, `ChannelError::Timeout` when nothing
    /// arrived in time, or `ChannelError::Closed` once no datagram can ever
    /// arrive again.
    fn recv(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> impl Future<Output = std::result::Result<usize, ChannelError>> + Send;
}

/// [`DatagramChannel`] over a tokio UDP socket.
///
/// A connecting channel has a fixed peer and ignores datagrams from anyone
/// else. A bound channel learns its peer from incoming traffic and always
/// answers the most recent sender.
pub struct UdpChannel {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
    follow_sender: bool,
}

impl UdpChannel {
    /// Binds an ephemeral local port and targets `peer`.
    pub async fn connect(peer: SocketAddr) -> Result<Self> {
        let local = match peer.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).await?;
        debug!("UDP channel {} -> {}", socket.local_addr()?, peer);

        Ok(Self {
            socket,
            peer: Mutex::new(Some(peer)),
            follow_sender: false,
        })
    }

    /// Binds `local` and waits for a peer to show up.
    pub async fn bind(local: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        debug!("UDP channel listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            peer: Mutex::new(None),
            follow_sender: true,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Current peer, if one is known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }
}

impl DatagramChannel for UdpChannel {
    async fn send(&self, datagram: &[u8]) -> std::result::Result<(), ChannelError> {
        let peer = (*self.peer.lock()).ok_or(ChannelError::NoPeer)?;
        self.socket.send_to(datagram, peer).await?;
        Ok(())
    }

    async fn recv(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            let (len, from) = match time::timeout_at(deadline, self.socket.recv_from(buf)).await {
                Ok(result) => result?,
                Err(_) => return Err(ChannelError::Timeout),
            };

            if self.follow_sender {
                *self.peer.lock() = Some(from);
                return Ok(len);
            }
            let expected = *self.peer.lock();
            if expected == Some(from) {
                return Ok(len);
            }
            debug!("Ignoring {} bytes from unexpected sender {}", len, from);
        }
    }
}

pub mod memory {
    //! In-process datagram link with scripted impairments.
    //!
    //! Faults are keyed by the probe sequence number found in the first eight
    //! bytes of each datagram, so a test can say exactly which probe is lost,
    //! duplicated, corrupted or held back.
    //!
    //! # Examples
    //!
    //! ```
    //! use udpq::channel::memory::{LinkConfig, MemoryChannel};
    //!
    //! // Lose probe 5, deliver probe 3 after probe 4.
    //! let link = LinkConfig::new().drop(5).hold_until(3, 4);
    //! let channel = MemoryChannel::loopback(link);
    //! # drop(channel);
    //! ```

    use super::DatagramChannel;
    use crate::error::ChannelError;
    use crate::udp_packet::{peek_sequence, PROBE_HEADER_SIZE};
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;
    use tokio::sync::{mpsc, Mutex as AsyncMutex};
    use tokio::time::{self, Instant};

    /// Impairments applied to datagrams travelling in one direction.
    #[derive(Debug, Clone, Default)]
    pub struct LinkConfig {
        /// Fixed one-way delay for every datagram
        pub delay: Duration,
        /// Sequences that are silently lost
        pub drop: HashSet<u64>,
        /// Sequences delivered twice
        pub duplicate: HashSet<u64>,
        /// Sequences whose padding gets a flipped byte
        pub corrupt: HashSet<u64>,
        /// `held -> release`: `held` is delivered right after `release`
        pub hold: HashMap<u64, u64>,
    }

    impl LinkConfig {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn drop(mut self, sequence: u64) -> Self {
            self.drop.insert(sequence);
            self
        }

        pub fn drop_all(mut self, sequences: impl IntoIterator<Item = u64>) -> Self {
            self.drop.extend(sequences);
            self
        }

        pub fn duplicate(mut self, sequence: u64) -> Self {
            self.duplicate.insert(sequence);
            self
        }

        pub fn corrupt(mut self, sequence: u64) -> Self {
            self.corrupt.insert(sequence);
            self
        }

        /// Holds `held` back until `release` has gone through the link.
        pub fn hold_until(mut self, held: u64, release: u64) -> Self {
            self.hold.insert(held, release);
            self
        }
    }

    struct Frame {
        deliver_at: Instant,
        bytes: Vec<u8>,
    }

    struct Outbound {
        link: LinkConfig,
        parked: HashMap<u64, Vec<Vec<u8>>>,
        tx: Option<mpsc::UnboundedSender<Frame>>,
    }

    impl Outbound {
        fn deliver(&self, bytes: Vec<u8>) -> Result<(), ChannelError> {
            let tx = self.tx.as_ref().ok_or(ChannelError::Closed)?;
            let frame = Frame {
                deliver_at: Instant::now() + self.link.delay,
                bytes,
            };
            tx.send(frame).map_err(|_| ChannelError::Closed)
        }
    }

    struct Inbox {
        rx: mpsc::UnboundedReceiver<Frame>,
        /// Frame taken off the queue but not yet due
        peeked: Option<Frame>,
    }

    /// One endpoint of an in-memory link.
    pub struct MemoryChannel {
        outbound: Mutex<Outbound>,
        inbox: AsyncMutex<Inbox>,
    }

    impl MemoryChannel {
        fn endpoint(
            link: LinkConfig,
            tx: mpsc::UnboundedSender<Frame>,
            rx: mpsc::UnboundedReceiver<Frame>,
        ) -> Self {
            Self {
                outbound: Mutex::new(Outbound {
                    link,
                    parked: HashMap::new(),
                    tx: Some(tx),
                }),
                inbox: AsyncMutex::new(Inbox { rx, peeked: None }),
            }
        }

        /// Two connected endpoints. `a_to_b` impairs what `a` sends,
        /// `b_to_a` what `b` sends.
        pub fn pair(a_to_b: LinkConfig, b_to_a: LinkConfig) -> (Self, Self) {
            let (to_b, b_rx) = mpsc::unbounded_channel();
            let (to_a, a_rx) = mpsc::unbounded_channel();
            (
                Self::endpoint(a_to_b, to_b, a_rx),
                Self::endpoint(b_to_a, to_a, b_rx),
            )
        }

        /// A single endpoint whose sends come back to itself through `link`.
        pub fn loopback(link: LinkConfig) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self::endpoint(link, tx, rx)
        }

        /// Stops sending. The other side drains what is in flight and then
        /// sees `ChannelError::Closed`.
        pub fn close(&self) {
            self.outbound.lock().tx = None;
        }

        /// Pushes a raw datagram to the other side, bypassing the link.
        pub fn inject(&self, bytes: &[u8]) -> Result<(), ChannelError> {
            let out = self.outbound.lock();
            let tx = out.tx.as_ref().ok_or(ChannelError::Closed)?;
            tx.send(Frame {
                deliver_at: Instant::now(),
                bytes: bytes.to_vec(),
            })
            .map_err(|_| ChannelError::Closed)
        }

        fn transmit(&self, datagram: &[u8]) -> Result<(), ChannelError> {
            let mut guard = self.outbound.lock();
            let out = &mut *guard;
            let mut bytes = datagram.to_vec();

            let Some(sequence) = peek_sequence(datagram) else {
                return out.deliver(bytes);
            };

            if !out.link.drop.contains(&sequence) {
                if out.link.corrupt.contains(&sequence) {
                    if bytes.len() > PROBE_HEADER_SIZE {
                        if let Some(last) = bytes.last_mut() {
                            *last ^= 0xFF;
                        }
                    } else {
                        bytes.truncate(PROBE_HEADER_SIZE / 2);
                    }
                }

                if let Some(release) = out.link.hold.get(&sequence).copied() {
                    out.parked.entry(release).or_default().push(bytes);
                } else {
                    if out.link.duplicate.contains(&sequence) {
                        out.deliver(bytes.clone())?;
                    }
                    out.deliver(bytes)?;
                }
            }

            // Release whatever waited for this sequence, even if it was lost.
            if let Some(parked) = out.parked.remove(&sequence) {
                for held in parked {
                    out.deliver(held)?;
                }
            }
            Ok(())
        }
    }

    impl DatagramChannel for MemoryChannel {
        async fn send(&self, datagram: &[u8]) -> Result<(), ChannelError> {
            self.transmit(datagram)
        }

        async fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
            let deadline = Instant::now() + timeout;
            let mut inbox = time::timeout_at(deadline, self.inbox.lock())
                .await
                .map_err(|_| ChannelError::Timeout)?;

            let deliver_at = match &inbox.peeked {
                Some(frame) => frame.deliver_at,
                None => match time::timeout_at(deadline, inbox.rx.recv()).await {
                    Err(_) => return Err(ChannelError::Timeout),
                    Ok(None) => return Err(ChannelError::Closed),
                    Ok(Some(frame)) => {
                        let at = frame.deliver_at;
                        inbox.peeked = Some(frame);
                        at
                    }
                },
            };

            if deliver_at > deadline {
                time::sleep_until(deadline).await;
                return Err(ChannelError::Timeout);
            }
            time::sleep_until(deliver_at).await;

            let frame = inbox.peeked.take().ok_or(ChannelError::Timeout)?;
            let len = frame.bytes.len().min(buf.len());
            buf[..len].copy_from_slice(&frame.bytes[..len]);
            Ok(len)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::udp_packet::{decode, encode, ProbePacket};
        use crate::DecodeError;

        const POLL: Duration = Duration::from_millis(100);

        fn probe(seq: u64) -> Vec<u8> {
            encode(&ProbePacket::sized(seq, 0, 32))
        }

        async fn drain(channel: &MemoryChannel) -> Vec<u64> {
            let mut buf = [0u8; 64];
            let mut seen = Vec::new();
            while let Ok(len) = channel.recv(&mut buf, POLL).await {
                seen.push(peek_sequence(&buf[..len]).unwrap());
            }
            seen
        }

        #[tokio::test(start_paused = true)]
        async fn test_loopback_applies_drop_and_duplicate() {
            let channel = MemoryChannel::loopback(LinkConfig::new().drop(1).duplicate(2));
            for seq in 0..4 {
                channel.send(&probe(seq)).await.unwrap();
            }
            assert_eq!(drain(&channel).await, vec![0, 2, 2, 3]);
        }

        #[tokio::test(start_paused = true)]
        async fn test_hold_until_reorders() {
            let channel = MemoryChannel::loopback(LinkConfig::new().hold_until(1, 3));
            for seq in 0..5 {
                channel.send(&probe(seq)).await.unwrap();
            }
            assert_eq!(drain(&channel).await, vec![0, 2, 3, 1, 4]);
        }

        #[tokio::test(start_paused = true)]
        async fn test_delay_is_respected() {
            let (a, b) = MemoryChannel::pair(
                LinkConfig::new().with_delay(Duration::from_millis(30)),
                LinkConfig::new(),
            );
            let sent_at = Instant::now();
            a.send(&probe(0)).await.unwrap();

            let mut buf = [0u8; 64];
            b.recv(&mut buf, Duration::from_secs(1)).await.unwrap();
            assert_eq!(sent_at.elapsed(), Duration::from_millis(30));
        }

        #[tokio::test(start_paused = true)]
        async fn test_recv_timeout_keeps_pending_frame() {
            let (a, b) = MemoryChannel::pair(
                LinkConfig::new().with_delay(Duration::from_millis(250)),
                LinkConfig::new(),
            );
            a.send(&probe(7)).await.unwrap();

            let mut buf = [0u8; 64];
            let err = b.recv(&mut buf, POLL).await.unwrap_err();
            assert!(err.is_timeout());

            let len = b.recv(&mut buf, Duration::from_secs(1)).await.unwrap();
            assert_eq!(peek_sequence(&buf[..len]), Some(7));
        }

        #[tokio::test(start_paused = true)]
        async fn test_close_is_seen_after_drain() {
            let (a, b) = MemoryChannel::pair(LinkConfig::new(), LinkConfig::new());
            a.send(&probe(0)).await.unwrap();
            a.close();

            let mut buf = [0u8; 64];
            assert!(b.recv(&mut buf, POLL).await.is_ok());
            assert!(matches!(
                b.recv(&mut buf, POLL).await,
                Err(ChannelError::Closed)
            ));
            assert!(matches!(a.send(&probe(1)).await, Err(ChannelError::Closed)));
        }

        #[tokio::test(start_paused = true)]
        async fn test_corrupt_flips_padding() {
            let channel = MemoryChannel::loopback(LinkConfig::new().corrupt(0));
            channel.send(&probe(0)).await.unwrap();

            let mut buf = [0u8; 64];
            let len = channel.recv(&mut buf, POLL).await.unwrap();
            assert!(matches!(
                decode(&buf[..len]),
                Err(DecodeError::CorruptPadding { offset: 31 })
            ));
        }
    }
}
