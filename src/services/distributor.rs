//! Inbound traffic routing
//!
//! One shared signaling socket and one media socket per channel are polled
//! together. Signaling is routed by the correlation tag our own From tags
//! carry, media by the local port it arrived on. Only IVR payload types are
//! forwarded; plain audio from the system under test is dropped here.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, trace, warn};

use super::channel::{ChannelMessage, ChannelTransport, CorrelationTag};
use crate::protocols::rtp::{quick_payload_type, PT_IVR_PROMPTS, PT_IVR_RECORD_FILE};
use crate::{Error, Result};

pub const SIP_BUFFER_SIZE: usize = 2048;
pub const RTP_BUFFER_SIZE: usize = 1024;

const SIP_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Non-blocking UDP socket with address reuse, ready for mio or tokio.
pub fn bind_udp(addr: SocketAddrV4) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket
        .bind(&SocketAddr::V4(addr).into())
        .map_err(|e| Error::network(format!("Failed to bind to {}: {}", addr, e)))?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Sending half of the sockets a channel uses.
pub struct UdpTransport {
    sip: Arc<UdpSocket>,
    media: UdpSocket,
    sip_target: SocketAddr,
    destination: Ipv4Addr,
    media_port: u16,
}

impl UdpTransport {
    /// Must be called inside the runtime; `media` is a clone of the polled socket.
    pub fn new(
        sip: Arc<UdpSocket>,
        media: std::net::UdpSocket,
        destination: Ipv4Addr,
        remote_sip_port: u16,
    ) -> Result<Self> {
        let media_port = media.local_addr()?.port();
        Ok(Self {
            sip,
            media: UdpSocket::from_std(media)?,
            sip_target: SocketAddr::V4(SocketAddrV4::new(destination, remote_sip_port)),
            destination,
            media_port,
        })
    }
}

#[async_trait::async_trait]
impl ChannelTransport for UdpTransport {
    async fn send_sip(&self, message: &str) -> Result<()> {
        self.sip
            .send_to(message.as_bytes(), self.sip_target)
            .await
            .map_err(|e| Error::network(format!("SIP send to {} failed: {}", self.sip_target, e)))?;
        Ok(())
    }

    async fn send_media(&self, packet: &[u8], port: u16) -> Result<()> {
        let target = SocketAddrV4::new(self.destination, port);
        self.media
            .send_to(packet, target)
            .await
            .map_err(|e| Error::network(format!("RTP send to {} failed: {}", target, e)))?;
        Ok(())
    }

    fn local_media_port(&self) -> u16 {
        self.media_port
    }
}

/// Channel index carried by a signaling datagram, if it is one of ours.
pub fn route_signaling(text: &str, channel_count: usize) -> Option<usize> {
    let tag = CorrelationTag::find_in(text)?;
    (tag.channel < channel_count).then_some(tag.channel)
}

/// Whether a media datagram is worth handing to a channel.
pub fn is_routed_media(datagram: &[u8]) -> bool {
    matches!(
        quick_payload_type(datagram),
        Some(PT_IVR_RECORD_FILE) | Some(PT_IVR_PROMPTS)
    )
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DistributorStats {
    pub sip_routed: u64,
    pub sip_dropped: u64,
    pub media_routed: u64,
    pub media_dropped: u64,
}

pub struct Distributor {
    poll: Poll,
    sip: MioUdpSocket,
    media: HashMap<u16, (MioUdpSocket, usize)>,
    channels: Vec<mpsc::UnboundedSender<ChannelMessage>>,
    control: mpsc::UnboundedReceiver<ChannelMessage>,
    stats: DistributorStats,
}

impl Distributor {
    /// `media[i]` belongs to `channels[i]`.
    pub fn new(
        sip: std::net::UdpSocket,
        media: Vec<std::net::UdpSocket>,
        channels: Vec<mpsc::UnboundedSender<ChannelMessage>>,
        control: mpsc::UnboundedReceiver<ChannelMessage>,
    ) -> Result<Self> {
        if media.len() != channels.len() {
            return Err(Error::invalid_state(format!(
                "{} media sockets for {} channels",
                media.len(),
                channels.len()
            )));
        }

        let poll = Poll::new()?;
        let mut sip = MioUdpSocket::from_std(sip);
        poll.registry().register(&mut sip, SIP_TOKEN, Interest::READABLE)?;

        let mut by_port = HashMap::with_capacity(media.len());
        for (channel, socket) in media.into_iter().enumerate() {
            let port = socket.local_addr()?.port();
            let mut socket = MioUdpSocket::from_std(socket);
            poll.registry()
                .register(&mut socket, Token(port as usize), Interest::READABLE)?;
            by_port.insert(port, (socket, channel));
        }

        Ok(Self {
            poll,
            sip,
            media: by_port,
            channels,
            control,
            stats: DistributorStats::default(),
        })
    }

    /// Blocking poll loop, meant for `spawn_blocking`.
    pub fn run(mut self) -> Result<DistributorStats> {
        info!(
            "Distributor polling {} media socket(s) and the signaling socket",
            self.media.len()
        );
        let mut events = Events::with_capacity(256);
        let mut sip_buffer = vec![0u8; SIP_BUFFER_SIZE];
        let mut rtp_buffer = vec![0u8; RTP_BUFFER_SIZE];

        loop {
            match self.control.try_recv() {
                Ok(ChannelMessage::Shutdown) | Err(TryRecvError::Disconnected) => break,
                Ok(_) | Err(TryRecvError::Empty) => {}
            }

            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    SIP_TOKEN => self.drain_signaling(&mut sip_buffer),
                    Token(port) => self.drain_media(port as u16, &mut rtp_buffer),
                }
            }
        }

        info!("Distributor stopped: {:?}", self.stats);
        Ok(self.stats)
    }

    fn drain_signaling(&mut self, buffer: &mut [u8]) {
        loop {
            let (len, from) = match self.sip.recv_from(buffer) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("Signaling receive failed: {}", e);
                    return;
                }
            };

            let text = String::from_utf8_lossy(&buffer[..len]).into_owned();
            match route_signaling(&text, self.channels.len()) {
                Some(channel) => {
                    if self.channels[channel].send(ChannelMessage::Sip(text)).is_ok() {
                        self.stats.sip_routed += 1;
                    } else {
                        trace!("Channel {} is gone, SIP from {} dropped", channel, from);
                        self.stats.sip_dropped += 1;
                    }
                }
                None => {
                    debug!("Untagged SIP from {} dropped", from);
                    self.stats.sip_dropped += 1;
                }
            }
        }
    }

    fn drain_media(&mut self, port: u16, buffer: &mut [u8]) {
        let Some((socket, channel)) = self.media.get(&port) else {
            return;
        };
        loop {
            let len = match socket.recv_from(buffer) {
                Ok((len, _)) => len,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("Media receive on port {} failed: {}", port, e);
                    return;
                }
            };

            let datagram = &buffer[..len];
            if !is_routed_media(datagram) {
                self.stats.media_dropped += 1;
                continue;
            }
            let message = ChannelMessage::Rtp(Bytes::copy_from_slice(datagram));
            if self.channels[*channel].send(message).is_ok() {
                self.stats.media_routed += 1;
            } else {
                self.stats.media_dropped += 1;
            }
        }
    }
}
