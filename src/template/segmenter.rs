//! Splitting a trace into dialogs
//!
//! The segmenter follows the recorded call the way the caller saw it: an
//! INVITE opens a dialog, the 183 gives the far end's media port, the ACK
//! confirms it and a BYE from either side closes it. Media between the two
//! negotiated ports belongs to the open dialog.

use tracing::{debug, trace, warn};

use super::model::{DialogNumbers, DialogState, RawPacket, SipKind, UdpCategory};
use super::rewrite::{template_ack, template_bye, template_invite};
use super::Dialog;
use crate::capture::{DatagramKind, UdpDatagram};
use crate::ivr::{dedup_key, IvrDedup};
use crate::protocols::rtp::{PT_IVR_PROMPTS, PT_IVR_RECORD_FILE};
use crate::protocols::sip::{uri_user, StartLine};
use crate::protocols::{RtpPacket, SipMessage};
use crate::{Error, Result};

#[derive(Debug)]
pub struct DialogSegmenter {
    trace_name: String,
    state: DialogState,
    from_tag: String,
    to_tag: String,
    call_id: String,
    source_media_port: Option<u16>,
    destination_media_port: Option<u16>,
    telephone_event_pt: Option<u8>,
    base_timestamp_us: u64,
    current_dialog: Option<usize>,
    numbers: Vec<DialogNumbers>,
    packets: Vec<RawPacket>,
    dedup: IvrDedup,
}

impl DialogSegmenter {
    pub fn new<S: Into<String>>(trace_name: S) -> Self {
        Self {
            trace_name: trace_name.into(),
            state: DialogState::Idle,
            from_tag: String::new(),
            to_tag: String::new(),
            call_id: String::new(),
            source_media_port: None,
            destination_media_port: None,
            telephone_event_pt: None,
            base_timestamp_us: 0,
            current_dialog: None,
            numbers: Vec::new(),
            packets: Vec::new(),
            dedup: IvrDedup::new(),
        }
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn push(&mut self, datagram: &UdpDatagram) {
        match datagram.kind {
            DatagramKind::Signaling => {
                let text = String::from_utf8_lossy(&datagram.payload);
                match SipMessage::parse(&text) {
                    Ok(message) => self.on_sip(datagram, &message),
                    Err(e) => trace!("Packet {} is not SIP: {}", datagram.index, e),
                }
            }
            DatagramKind::Unknown if self.state >= DialogState::WaitingFor200 => {
                self.on_media(datagram)
            }
            DatagramKind::Unknown => {}
        }
    }

    /// Groups the collected packets by dialog.
    pub fn finish(self) -> Result<Vec<Dialog>> {
        if self.numbers.is_empty() {
            return Err(Error::no_dialog(self.trace_name));
        }

        let mut dialogs: Vec<Dialog> = self
            .numbers
            .into_iter()
            .enumerate()
            .map(|(index, numbers)| Dialog {
                index,
                numbers,
                packets: Vec::new(),
            })
            .collect();

        for packet in self.packets {
            if let Some(dialog) = packet.dialog_index.and_then(|i| dialogs.get_mut(i)) {
                dialog.packets.push(packet);
            }
        }

        debug!(
            "Trace {} holds {} dialog(s)",
            self.trace_name,
            dialogs.len()
        );
        Ok(dialogs)
    }

    fn on_sip(&mut self, datagram: &UdpDatagram, message: &SipMessage) {
        match (self.state, message.status_code()) {
            (DialogState::Idle, None) if message.is_request("INVITE") => {
                self.open_dialog(datagram, message)
            }
            (DialogState::WaitingFor183, Some(183)) => {
                if self.matches_caller(message) {
                    self.capture_answer(datagram, message);
                    self.state = DialogState::WaitingFor200;
                }
            }
            (DialogState::WaitingFor183, Some(200)) => {
                // Answered without session progress
                if self.matches_caller(message) {
                    self.capture_answer(datagram, message);
                    self.state = DialogState::BeforeAck;
                }
            }
            (DialogState::WaitingFor200, Some(200)) => {
                if self.matches_dialog(message) {
                    if self.telephone_event_pt.is_none() {
                        self.telephone_event_pt = message.telephone_event_pt();
                    }
                    if self.destination_media_port.is_none() {
                        self.destination_media_port = message.sdp_audio_port();
                    }
                    self.state = DialogState::BeforeAck;
                }
            }
            (DialogState::BeforeAck, None) if message.is_request("ACK") => {
                if self.matches_dialog(message) {
                    let templated = template_ack(message).to_wire();
                    self.push_sip(datagram, SipKind::Ack, templated.into_bytes(), false);
                    self.state = DialogState::AfterAck;
                }
            }
            (DialogState::AfterAck, None) if message.is_request("BYE") => self.close_dialog(datagram, message),
            _ => trace!(
                "Packet {} ignored in state {:?}: {}",
                datagram.index,
                self.state,
                message.start_line
            ),
        }
    }

    fn open_dialog(&mut self, datagram: &UdpDatagram, message: &SipMessage) {
        let (Some(from_tag), Some(call_id)) = (message.from_tag(), message.call_id()) else {
            warn!("INVITE in packet {} has no From tag or Call-ID", datagram.index);
            return;
        };

        self.from_tag = from_tag.to_string();
        self.to_tag.clear();
        self.call_id = call_id.to_string();
        self.source_media_port = message.sdp_audio_port();
        self.destination_media_port = None;
        self.telephone_event_pt = None;
        self.base_timestamp_us = datagram.timestamp_us;
        if self.source_media_port.is_none() {
            warn!("INVITE in packet {} carries no audio media line", datagram.index);
        }

        let called = match &message.start_line {
            StartLine::Request { uri, .. } => uri_user(uri),
            _ => None,
        };
        let calling = message
            .header("Contact")
            .and_then(uri_user)
            .or_else(|| message.header("From").and_then(uri_user));
        self.numbers.push(DialogNumbers {
            called: called.unwrap_or_default().to_string(),
            calling: calling.unwrap_or_default().to_string(),
        });
        self.current_dialog = Some(self.numbers.len() - 1);
        self.dedup.reset();

        let templated = template_invite(message).to_wire();
        self.push_sip(datagram, SipKind::Invite, templated.into_bytes(), false);
        self.state = DialogState::WaitingFor183;
        debug!(
            "Dialog {} opened by packet {}",
            self.numbers.len() - 1,
            datagram.index
        );
    }

    fn capture_answer(&mut self, datagram: &UdpDatagram, message: &SipMessage) {
        self.to_tag = message.to_tag().unwrap_or_default().to_string();
        self.destination_media_port = message.sdp_audio_port();
        self.telephone_event_pt = message.telephone_event_pt();
        self.base_timestamp_us = datagram.timestamp_us;
    }

    fn close_dialog(&mut self, datagram: &UdpDatagram, message: &SipMessage) {
        let from_tag = message.from_tag().unwrap_or_default();
        let to_tag = message.to_tag().unwrap_or_default();
        if message.call_id() != Some(self.call_id.as_str()) {
            warn!("BYE in packet {} belongs to another call", datagram.index);
            return;
        }

        if from_tag == self.from_tag && to_tag == self.to_tag {
            let templated = template_bye(message).to_wire();
            self.push_sip(datagram, SipKind::Bye, templated.into_bytes(), false);
        } else if from_tag == self.to_tag && to_tag == self.from_tag {
            self.push_sip(datagram, SipKind::Bye, Vec::new(), true);
        } else {
            warn!("BYE in packet {} does not match the dialog tags", datagram.index);
            return;
        }
        self.state = DialogState::Idle;
    }

    fn matches_caller(&self, message: &SipMessage) -> bool {
        let matched = message.from_tag() == Some(self.from_tag.as_str())
            && message.call_id() == Some(self.call_id.as_str());
        if !matched {
            warn!(
                "{}",
                Error::correlation(format!(
                    "response {} does not match From tag {} / Call-ID {}",
                    message.start_line, self.from_tag, self.call_id
                ))
            );
        }
        matched
    }

    fn matches_dialog(&self, message: &SipMessage) -> bool {
        self.matches_caller(message) && message.to_tag().unwrap_or_default() == self.to_tag
    }

    fn on_media(&mut self, datagram: &UdpDatagram) {
        let (Some(source_port), Some(destination_port)) =
            (self.source_media_port, self.destination_media_port)
        else {
            return;
        };

        let sent = datagram.src.port() == source_port && datagram.dst.port() == destination_port;
        let received = datagram.src.port() == destination_port && datagram.dst.port() == source_port;
        if !sent && !received {
            return;
        }

        let rtp = match RtpPacket::decode(datagram.payload.clone()) {
            Ok(rtp) => rtp,
            Err(e) => {
                debug!("Packet {} between media ports is not RTP: {}", datagram.index, e);
                return;
            }
        };

        if sent {
            let dtmf = rtp.dtmf_digit(self.telephone_event_pt);
            let is_event = self.telephone_event_pt == Some(rtp.payload_type);
            let mut packet = self.new_packet(datagram, if is_event { UdpCategory::RtpEvent } else { UdpCategory::Rtp });
            packet.data = datagram.payload.to_vec();
            packet.rtp_timestamp = Some(rtp.timestamp);
            packet.dtmf = dtmf;
            self.packets.push(packet);
            return;
        }

        if rtp.payload_type != PT_IVR_RECORD_FILE && rtp.payload_type != PT_IVR_PROMPTS {
            return;
        }
        let events = match rtp.ivr_events() {
            Ok(events) if !events.is_empty() => events,
            Ok(_) => return,
            Err(e) => {
                warn!("Packet {} carries an unreadable IVR event: {}", datagram.index, e);
                return;
            }
        };
        if self.dedup.is_duplicate(rtp.timestamp, &dedup_key(&events)) {
            trace!("Packet {} repeats the previous IVR event", datagram.index);
            return;
        }

        let is_twin = events.len() > 1;
        for event in events {
            let mut packet = self.new_packet(datagram, UdpCategory::for_ivr(event.kind));
            packet.received = true;
            packet.rtp_timestamp = Some(rtp.timestamp);
            packet.ivr_event = Some(event);
            packet.is_twin = is_twin;
            self.packets.push(packet);
        }
    }

    fn push_sip(&mut self, datagram: &UdpDatagram, kind: SipKind, data: Vec<u8>, received: bool) {
        let mut packet = self.new_packet(datagram, UdpCategory::Sip);
        packet.sip_kind = kind;
        packet.data = data;
        packet.received = received;
        self.packets.push(packet);
    }

    fn new_packet(&self, datagram: &UdpDatagram, category: UdpCategory) -> RawPacket {
        RawPacket {
            index: datagram.index,
            dialog_index: self.current_dialog,
            timestamp_us: datagram.timestamp_us,
            delay_us: datagram.timestamp_us as i64 - self.base_timestamp_us as i64,
            src: datagram.src,
            dst: datagram.dst,
            category,
            sip_kind: SipKind::None,
            data: Vec::new(),
            rtp_timestamp: None,
            dtmf: None,
            ivr_event: None,
            received: false,
            is_twin: false,
        }
    }
}

/// Segments every datagram of one trace.
pub fn segment<S: Into<String>>(trace_name: S, datagrams: &[UdpDatagram]) -> Result<Vec<Dialog>> {
    let mut segmenter = DialogSegmenter::new(trace_name);
    for datagram in datagrams {
        segmenter.push(datagram);
    }
    segmenter.finish()
}
