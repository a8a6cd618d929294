//! Replaying channels
//!
//! A channel is one simulated caller. It walks every case in order and, for
//! each dialog of a case, plays the caller's side of the recording against
//! the system under test while judging what the IVR sends back.
//!
//! The loop is cooperative: take one inbox message if there is one, otherwise
//! move the template cursor by one step and sleep for a short while.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use chrono::Local;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use super::report::{DialogReport, FlowStep, ResultSink, Verdict};
use super::resource_cache::CacheHandle;
use crate::cases::CaseConfig;
use crate::config::{DisplayNamePolicy, ReplayConfig};
use crate::ivr::{dedup_key, smart_judge, FuzzyPrompts, IvrDedup, Judgment};
use crate::protocols::rtp::{quick_payload_type, with_payload_type, PT_IVR_PROMPTS, PT_IVR_RECORD_FILE};
use crate::protocols::sip::{StartLine, SIP_VERSION};
use crate::protocols::{RtpPacket, SipMessage};
use crate::template::rewrite::{
    AUDIO_PORT, CALLED, CALLING, DESTINATION, FROM_DISPLAY, FROM_TAG, SOURCE, TO_TAG,
};
use crate::template::{render, CaseTemplate, DialogState, RawPacket, SipKind, Substitutions, UdpCategory};
use crate::{Error, Result};

/// Idle step while a dialog is running
pub const TICK: Duration = Duration::from_millis(5);
/// Idle step while waiting for a template or for the call to be answered
pub const WINK: Duration = Duration::from_millis(100);

/// Marks every From tag this tool generates.
pub const TAG_PREFIX: &str = "7A11FEED";

#[derive(Debug, Clone)]
pub enum ChannelMessage {
    StartWork,
    Sip(String),
    Rtp(Bytes),
    Shutdown,
}

/// Identity of a sent dialog, carried in its From tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationTag {
    pub channel: usize,
    pub case_index: usize,
    pub dialog_index: usize,
    pub millis: u64,
}

impl CorrelationTag {
    pub fn new(channel: usize, case_index: usize, dialog_index: usize) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            channel,
            case_index,
            dialog_index,
            millis,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}F{:05}C{:05}D{:05}A{}",
            TAG_PREFIX, self.channel, self.case_index, self.dialog_index, self.millis
        )
    }

    /// Finds and decodes the first tag embedded in `text`.
    pub fn find_in(text: &str) -> Option<Self> {
        let start = text.find(TAG_PREFIX)? + TAG_PREFIX.len();
        let rest = text.get(start..)?;

        let (channel, rest) = take_field(rest, 'F', 5)?;
        let (case_index, rest) = take_field(rest, 'C', 5)?;
        let (dialog_index, rest) = take_field(rest, 'D', 5)?;
        let millis_digits = rest.strip_prefix('A')?;
        let end = millis_digits
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(millis_digits.len());
        let millis = millis_digits[..end].parse().ok()?;

        Some(Self {
            channel: channel as usize,
            case_index: case_index as usize,
            dialog_index: dialog_index as usize,
            millis,
        })
    }
}

fn take_field(text: &str, marker: char, width: usize) -> Option<(u64, &str)> {
    let digits = text.strip_prefix(marker)?;
    let field = digits.get(..width)?;
    if !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((field.parse().ok()?, &digits[width..]))
}

/// Slice `[min, max]` of a number range owned by one channel.
///
/// With more numbers than channels every channel cycles through its own
/// contiguous slice; otherwise channels share numbers round robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberCursor {
    pub min: u32,
    pub max: u32,
    current: u32,
}

impl NumberCursor {
    pub fn disperse(channel: usize, channels: usize, count: u32) -> Self {
        let channels = channels.max(1) as u64;
        let channel = channel as u64;
        let (min, max) = if count == 0 {
            (0, 0)
        } else if count as u64 > channels {
            let count = count as u64;
            let min = channel * count / channels;
            let max = (channel + 1) * count / channels - 1;
            (min as u32, max as u32)
        } else {
            let index = (channel % count as u64) as u32;
            (index, index)
        };
        Self { min, max, current: min }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Moves to the next number, wrapping inside the slice.
    pub fn advance(&mut self) -> u32 {
        self.current = if self.current >= self.max {
            self.min
        } else {
            self.current + 1
        };
        self.current
    }
}

/// `base` increased by `offset`, keeping its zero padding.
pub fn offset_number(base: &str, offset: u32) -> String {
    if offset == 0 {
        return base.to_string();
    }
    match base.parse::<u64>() {
        Ok(value) => format!("{:0width$}", value + offset as u64, width = base.len()),
        Err(_) => base.to_string(),
    }
}

/// How a channel reaches the network.
#[async_trait::async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn send_sip(&self, message: &str) -> Result<()>;
    async fn send_media(&self, packet: &[u8], port: u16) -> Result<()>;
    fn local_media_port(&self) -> u16;
}

/// Everything channels share.
#[derive(Clone)]
pub struct ChannelSetup {
    pub config: Arc<ReplayConfig>,
    pub cases: Arc<Vec<PathBuf>>,
    pub cache: CacheHandle,
    pub sink: Arc<dyn ResultSink>,
    pub fuzzy: Arc<FuzzyPrompts>,
}

#[derive(Debug, Clone, Default)]
struct LiveNumbers {
    called: String,
    calling: String,
    redirect: String,
    reason: String,
}

struct ActiveDialog {
    template: Arc<CaseTemplate>,
    dialog_index: usize,
    from_tag: String,
    to_tag: String,
    invite: SipMessage,
    substitutions: Substitutions,
    remote_media_port: Option<u16>,
    telephone_event_pt: Option<u8>,
    send_cursor: usize,
    expect_cursor: usize,
    media_base: Option<Instant>,
    passed: bool,
    dedup: IvrDedup,
    started: chrono::DateTime<Local>,
    flow: Vec<FlowStep>,
    /// Decided when our BYE goes out, recorded once it is answered
    pending_verdict: Option<Verdict>,
}

impl ActiveDialog {
    fn packets(&self) -> &[RawPacket] {
        &self.template.dialogs[self.dialog_index].packets
    }

    fn next_expected(&self) -> Option<(usize, &RawPacket)> {
        self.packets()
            .iter()
            .enumerate()
            .skip(self.expect_cursor)
            .find(|(_, packet)| packet.received)
    }

    fn events_remaining(&self) -> bool {
        self.packets()
            .get(self.expect_cursor..)
            .unwrap_or(&[])
            .iter()
            .any(|packet| packet.received && !packet.is_bye())
    }

    fn closing_verdict(&self) -> Verdict {
        match (self.passed, self.events_remaining()) {
            (false, _) => Verdict::Fail,
            (true, false) => Verdict::Pass,
            (true, true) => Verdict::PassUncompleted,
        }
    }

    fn set_to_tag(&mut self, tag: &str) {
        self.to_tag = tag.to_string();
        self.substitutions = std::mem::take(&mut self.substitutions).set(TO_TAG, tag);
    }
}

pub struct Channel {
    index: usize,
    setup: ChannelSetup,
    transport: Arc<dyn ChannelTransport>,
    inbox: mpsc::UnboundedReceiver<ChannelMessage>,
    case_index: usize,
    case_key: Option<PathBuf>,
    template: Option<Arc<CaseTemplate>>,
    case_config: CaseConfig,
    next_dialog: usize,
    called_cursor: NumberCursor,
    redirect_cursor: NumberCursor,
    numbers: LiveNumbers,
    state: DialogState,
    dialog: Option<ActiveDialog>,
    /// Set once the first case was attempted
    visited: bool,
    resting: bool,
    finished: bool,
}

impl Channel {
    pub fn new(
        index: usize,
        setup: ChannelSetup,
        transport: Arc<dyn ChannelTransport>,
        inbox: mpsc::UnboundedReceiver<ChannelMessage>,
    ) -> Self {
        let run = &setup.config.run;
        let called_cursor = NumberCursor::disperse(index, run.channel_count, run.called_count);
        let redirect_cursor = NumberCursor::disperse(index, run.channel_count, run.redirect_count);
        Self {
            index,
            setup,
            transport,
            inbox,
            case_index: 0,
            case_key: None,
            template: None,
            case_config: CaseConfig::default(),
            next_dialog: 0,
            called_cursor,
            redirect_cursor,
            numbers: LiveNumbers::default(),
            state: DialogState::Idle,
            dialog: None,
            visited: false,
            resting: false,
            finished: false,
        }
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    /// Waits for the start signal, then replays until done or shut down.
    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.inbox.recv().await {
                Some(ChannelMessage::StartWork) => break,
                Some(ChannelMessage::Shutdown) | None => return Ok(()),
                Some(other) => trace!("Channel {} not started, dropped {:?}", self.index, other),
            }
        }

        let stagger = Duration::from_millis(self.setup.config.replay.start_stagger_ms) * self.index as u32;
        if !stagger.is_zero() {
            sleep(stagger).await;
        }
        info!("Channel {} started", self.index);

        let result = self.drive().await;
        if let Err(e) = &result {
            error!("Channel {} stopped: {}", self.index, e);
            self.setup.sink.diagnostic(self.index, &e.to_string()).await;
        }
        if let Some(key) = self.case_key.take() {
            self.setup.cache.release(key);
        }
        info!("Channel {} finished", self.index);
        result
    }

    async fn drive(&mut self) -> Result<()> {
        while !self.finished {
            match self.inbox.try_recv() {
                Ok(ChannelMessage::Shutdown) | Err(TryRecvError::Disconnected) => {
                    self.interrupt().await;
                    break;
                }
                Ok(message) => self.handle(message).await?,
                Err(TryRecvError::Empty) => {
                    let pause = self.step().await?;
                    if !pause.is_zero() {
                        sleep(pause).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle(&mut self, message: ChannelMessage) -> Result<()> {
        match message {
            ChannelMessage::Sip(text) => match SipMessage::parse(&text) {
                Ok(sip) => self.on_sip(sip).await,
                Err(e) => {
                    debug!("Channel {} dropped unparsable SIP: {}", self.index, e);
                    Ok(())
                }
            },
            ChannelMessage::Rtp(data) => self.on_rtp(data).await,
            ChannelMessage::StartWork => Ok(()),
            ChannelMessage::Shutdown => Ok(()),
        }
    }

    /// One unit of progress when the inbox is empty; returns how long to idle.
    async fn step(&mut self) -> Result<Duration> {
        if self.dialog.is_none() {
            if self.resting {
                self.resting = false;
                let rest = Duration::from_millis(self.setup.config.replay.rest_interval_ms);
                if !rest.is_zero() {
                    sleep(rest).await;
                }
                if self.drain_inbox() {
                    self.finished = true;
                    return Ok(Duration::ZERO);
                }
            }
            self.begin_dialog().await?;
            return Ok(if self.dialog.is_some() { TICK } else { WINK });
        }

        if self.state != DialogState::AfterAck {
            return Ok(WINK);
        }
        self.advance_cursor().await
    }

    /// Drops whatever arrived between dialogs; true if a shutdown was among it.
    fn drain_inbox(&mut self) -> bool {
        let mut dropped = 0usize;
        while let Ok(message) = self.inbox.try_recv() {
            if matches!(message, ChannelMessage::Shutdown) {
                return true;
            }
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Channel {} dropped {} stale message(s)", self.index, dropped);
        }
        false
    }

    async fn begin_dialog(&mut self) -> Result<()> {
        let needs_case = self
            .template
            .as_ref()
            .map_or(true, |template| self.next_dialog >= template.dialogs.len());
        if needs_case && !self.load_next_case().await? {
            return Ok(());
        }
        let Some(template) = self.template.clone() else {
            return Ok(());
        };

        let dialog_index = self.next_dialog;
        self.next_dialog += 1;
        let dialog = &template.dialogs[dialog_index];
        let case_name = template.info.trace_name();

        let Some(invite_text) = dialog.invite().and_then(RawPacket::sip_text) else {
            warn!("Channel {}: {} dialog {} has no INVITE", self.index, case_name, dialog_index);
            self.setup.sink.dialog_started(self.index, &case_name, dialog_index).await;
            let now = Local::now();
            self.record(DialogReport {
                channel: self.index,
                case_index: self.case_index,
                case_name,
                dialog_index,
                called: self.numbers.called.clone(),
                calling: self.numbers.calling.clone(),
                verdict: Verdict::Ignore,
                started: now,
                finished: now,
                flow: Vec::new(),
            })
            .await;
            self.resting = true;
            return Ok(());
        };

        let tag = CorrelationTag::new(self.index, self.case_index, dialog_index).encode();
        let substitutions = self.substitutions(&tag);
        let mut invite = render(invite_text, &substitutions)?;
        fresh_branch(&mut invite);
        self.decorate_invite(&mut invite);

        let mut active = ActiveDialog {
            template: template.clone(),
            dialog_index,
            from_tag: tag.clone(),
            to_tag: String::new(),
            invite: invite.clone(),
            substitutions,
            remote_media_port: None,
            telephone_event_pt: None,
            send_cursor: 0,
            expect_cursor: 0,
            media_base: None,
            passed: true,
            dedup: IvrDedup::new(),
            started: Local::now(),
            flow: Vec::new(),
            pending_verdict: None,
        };
        active.flow.push(FlowStep::sent("INVITE"));

        self.setup.sink.dialog_started(self.index, &case_name, dialog_index).await;
        self.send_sip(&invite).await;
        debug!(
            "Channel {} calls {} for {} dialog {}",
            self.index, self.numbers.called, case_name, dialog_index
        );
        self.dialog = Some(active);
        self.state = DialogState::WaitingFor183;
        Ok(())
    }

    /// Moves to the next case; false when the channel has nothing left to run.
    async fn load_next_case(&mut self) -> Result<bool> {
        let cases = self.setup.cases.clone();
        if cases.is_empty() {
            self.finished = true;
            return Ok(false);
        }

        let next = if self.visited { self.case_index + 1 } else { 0 };
        let next = if next < cases.len() {
            next
        } else if self.setup.config.run.stress_test {
            0
        } else {
            self.finished = true;
            return Ok(false);
        };

        if self.visited {
            self.called_cursor.advance();
            self.redirect_cursor.advance();
        }
        self.visited = true;

        let key = cases[next].clone();
        self.case_index = next;
        self.next_dialog = 0;
        match self.setup.cache.acquire(key.clone(), self.case_key.take()).await {
            Ok(template) => {
                self.template = Some(template);
                self.case_key = Some(key.clone());
            }
            Err(e) => {
                warn!("Channel {} cannot load {}: {}", self.index, key.display(), e);
                self.setup
                    .sink
                    .diagnostic(self.index, &format!("case {} skipped: {}", key.display(), e))
                    .await;
                self.template = None;
                return Ok(false);
            }
        }

        self.case_config = CaseConfig::load_for(&key).unwrap_or_else(|e| {
            warn!("Channel {}: {}", self.index, e);
            CaseConfig::default()
        });
        self.numbers = self.live_numbers();
        Ok(true)
    }

    fn live_numbers(&self) -> LiveNumbers {
        let run = &self.setup.config.run;
        let case = &self.case_config;

        let prefix = case.called_prefix.as_deref().unwrap_or(&run.called_prefix);
        let called = match &case.called {
            Some(called) => called.clone(),
            None if !self.setup.config.rotates_called() => run.called.clone(),
            None => offset_number(&run.called, self.called_cursor.current()),
        };
        let redirect = match &case.redirect {
            Some(redirect) => redirect.clone(),
            None if run.redirect.is_empty() => String::new(),
            None => offset_number(&run.redirect, self.redirect_cursor.current()),
        };

        LiveNumbers {
            called: format!("{}{}", prefix, called),
            calling: case.calling.clone().unwrap_or_else(|| run.calling.clone()),
            redirect,
            reason: case.reason.clone().unwrap_or_else(|| run.reason.clone()),
        }
    }

    fn substitutions(&self, from_tag: &str) -> Substitutions {
        let config = &self.setup.config;
        let privacy = config.replay.privacy;
        let calling = if privacy { "Anonymous" } else { self.numbers.calling.as_str() };
        let display = match (&config.replay.display_name, privacy) {
            (DisplayNamePolicy::Clear, _) => String::new(),
            (_, true) => "\"Anonymous\" ".to_string(),
            (DisplayNamePolicy::Caller, false) => format!("\"{}\" ", self.numbers.calling),
            (DisplayNamePolicy::Override(name), false) => format!("\"{}\" ", name),
        };

        Substitutions::new()
            .set(SOURCE, config.run.source.to_string())
            .set(DESTINATION, config.run.destination.to_string())
            .set(CALLED, self.numbers.called.clone())
            .set(CALLING, calling)
            .set(FROM_TAG, from_tag)
            .set(TO_TAG, "")
            .set(FROM_DISPLAY, display)
            .set(AUDIO_PORT, self.transport.local_media_port().to_string())
    }

    fn decorate_invite(&self, invite: &mut SipMessage) {
        let source = self.setup.config.run.source;
        if self.setup.config.replay.privacy {
            invite.push_header(
                "P-Asserted-Identity",
                format!("\"{0}\"<sip:{0}@{1}>", self.numbers.calling, source),
            );
            invite.push_header("Privacy", "id");
        }
        if !self.numbers.redirect.is_empty() {
            invite.push_header(
                "Diversion",
                format!(
                    "<sip:{}@{}:5060>;reason=\"{}\";counter=1",
                    self.numbers.redirect, source, self.numbers.reason
                ),
            );
        }
        // Content-Length stays last
        if let Some(position) = invite
            .headers
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case("Content-Length"))
        {
            let header = invite.headers.remove(position);
            invite.headers.push(header);
        }
    }

    async fn advance_cursor(&mut self) -> Result<Duration> {
        let Some(active) = self.dialog.as_mut() else {
            return Ok(WINK);
        };
        let Some(packet) = active.packets().get(active.send_cursor).cloned() else {
            // Recording ends without a BYE
            let verdict = if active.passed {
                Verdict::PassUncompleted
            } else {
                Verdict::Fail
            };
            self.send_bye(verdict).await?;
            return Ok(TICK);
        };

        if packet.received {
            // Already judged, or still waiting for it
            if active.send_cursor < active.expect_cursor {
                active.send_cursor += 1;
                return Ok(Duration::ZERO);
            }
            return Ok(TICK);
        }

        match (packet.category, packet.sip_kind) {
            (UdpCategory::Sip, SipKind::Bye) => {
                active.send_cursor += 1;
                let verdict = active.closing_verdict();
                self.send_bye(verdict).await?;
                Ok(TICK)
            }
            (UdpCategory::Rtp, _) | (UdpCategory::RtpEvent, _) => {
                let base = *active.media_base.get_or_insert_with(Instant::now);
                let due = base + Duration::from_micros(packet.delay_us.max(0) as u64);
                if Instant::now() < due {
                    return Ok(TICK);
                }
                active.send_cursor += 1;

                let Some(port) = active.remote_media_port else {
                    trace!("Channel {} has no media port, RTP dropped", self.index);
                    return Ok(Duration::ZERO);
                };
                let data = match (packet.category, active.telephone_event_pt) {
                    (UdpCategory::RtpEvent, Some(pt)) => with_payload_type(&packet.data, pt),
                    _ => packet.data.clone(),
                };
                if packet.category == UdpCategory::RtpEvent {
                    active.flow.push(FlowStep::sent(packet.describe()));
                }
                if let Err(e) = self.transport.send_media(&data, port).await {
                    warn!("Channel {} media send failed: {}", self.index, e);
                }
                Ok(Duration::ZERO)
            }
            _ => {
                // INVITE and ACK were sent while the call was set up
                active.send_cursor += 1;
                Ok(Duration::ZERO)
            }
        }
    }

    async fn on_sip(&mut self, message: SipMessage) -> Result<()> {
        if let Some(code) = message.status_code() {
            return self.on_response(code, message).await;
        }

        if message.is_request("BYE") {
            return self.on_remote_bye(message).await;
        }
        debug!(
            "Channel {} ignores request {}",
            self.index, message.start_line
        );
        Ok(())
    }

    async fn on_response(&mut self, code: u16, message: SipMessage) -> Result<()> {
        let Some(active) = self.dialog.as_mut() else {
            trace!("Channel {} has no dialog for {}", self.index, message.start_line);
            return Ok(());
        };

        let matches = message.from_tag() == Some(active.from_tag.as_str())
            && message.call_id() == Some(active.from_tag.as_str());
        if !matches {
            warn!(
                "Channel {}: {}",
                self.index,
                Error::correlation(format!(
                    "{} does not belong to dialog {}",
                    message.start_line, active.from_tag
                ))
            );
            return Ok(());
        }

        let method = message.cseq().map(|(_, method)| method.to_ascii_uppercase());
        if method.as_deref() == Some("BYE") {
            if self.state == DialogState::Byeing && code >= 200 {
                let verdict = active.pending_verdict.take().unwrap_or(Verdict::Interrupted);
                self.finish_dialog(verdict).await;
            }
            return Ok(());
        }

        match (self.state, code) {
            (_, 100) | (_, 180) => trace!("Channel {} got {}", self.index, code),
            (DialogState::WaitingFor183, 183) => {
                active.set_to_tag(message.to_tag().unwrap_or_default());
                capture_media(active, &message);
                active.flow.push(FlowStep::received("183 Session Progress"));
                self.state = DialogState::WaitingFor200;
            }
            (DialogState::WaitingFor183, 200) | (DialogState::WaitingFor200, 200) => {
                if let Some(tag) = message.to_tag() {
                    active.set_to_tag(tag);
                }
                capture_media(active, &message);
                active.flow.push(FlowStep::received("200 OK"));
                let delay = Duration::from_millis(self.setup.config.replay.media_start_delay_ms);
                active.media_base = Some(Instant::now() + delay);
                self.send_ack().await?;
                self.state = DialogState::AfterAck;
            }
            (DialogState::AfterAck, 200) => {
                debug!("Channel {} got a retransmitted 200, ACK again", self.index);
                self.send_ack().await?;
            }
            (state, code) if code >= 300 && state < DialogState::AfterAck => {
                if let Some(tag) = message.to_tag() {
                    active.set_to_tag(tag);
                }
                let reason = message.start_line.to_string();
                active.flow.push(FlowStep::received(reason.clone()));
                let ack = in_dialog_request("ACK", &active.invite, &active.to_tag, 1);
                self.send_sip(&ack).await;
                self.setup
                    .sink
                    .diagnostic(self.index, &format!("dialog rejected with {}", reason))
                    .await;
                self.finish_dialog(Verdict::FailSipError).await;
            }
            (state, code) => debug!(
                "Channel {} ignores {} in state {:?}",
                self.index, code, state
            ),
        }
        Ok(())
    }

    /// A BYE belongs to the dialog only when its tags cross-match ours.
    async fn on_remote_bye(&mut self, bye: SipMessage) -> Result<()> {
        let Some(active) = self.dialog.as_mut() else {
            debug!("Channel {} ignores a BYE outside any dialog", self.index);
            return Ok(());
        };
        let ours = bye.from_tag() == Some(active.to_tag.as_str())
            && bye.to_tag() == Some(active.from_tag.as_str())
            && bye.call_id() == Some(active.from_tag.as_str());
        if active.to_tag.is_empty() || !ours {
            warn!(
                "Channel {}: {}",
                self.index,
                Error::correlation(format!(
                    "BYE from tag {:?} to tag {:?} does not belong to dialog {}",
                    bye.from_tag(),
                    bye.to_tag(),
                    active.from_tag
                ))
            );
            return Ok(());
        }

        active.flow.push(FlowStep::received("BYE"));
        let passed = active.passed;
        let next = active
            .next_expected()
            .map(|(index, packet)| (index, packet.is_bye()));
        let verdict = match next {
            Some((index, true)) => {
                active.expect_cursor = index + 1;
                active.closing_verdict()
            }
            Some(_) if passed => Verdict::PassUncompleted,
            None if passed => Verdict::PassDefectiveCase,
            _ => Verdict::Fail,
        };

        let ok = SipMessage::response_to(&bye, 200, "OK");
        self.send_sip(&ok).await;
        self.finish_dialog(verdict).await;
        Ok(())
    }

    async fn on_rtp(&mut self, data: Bytes) -> Result<()> {
        if !matches!(
            self.state,
            DialogState::WaitingFor200 | DialogState::BeforeAck | DialogState::AfterAck
        ) {
            return Ok(());
        }
        let Some(active) = self.dialog.as_mut() else {
            return Ok(());
        };
        if !matches!(
            quick_payload_type(&data),
            Some(PT_IVR_RECORD_FILE) | Some(PT_IVR_PROMPTS)
        ) {
            return Ok(());
        }

        let rtp = match RtpPacket::decode(data) {
            Ok(rtp) => rtp,
            Err(e) => {
                debug!("Channel {} dropped bad RTP: {}", self.index, e);
                return Ok(());
            }
        };
        let events = match rtp.ivr_events() {
            Ok(events) => events,
            Err(e @ Error::UnsupportedPayloadType(_)) => return Err(e),
            Err(e) => {
                warn!("Channel {} dropped unreadable IVR event: {}", self.index, e);
                return Ok(());
            }
        };
        if events.is_empty() || active.dedup.is_duplicate(rtp.timestamp, &dedup_key(&events)) {
            return Ok(());
        }

        for event in events {
            let expected = match active.next_expected() {
                Some((index, packet)) if !packet.is_bye() => {
                    packet.ivr_event.clone().map(|expected| (index, expected))
                }
                _ => None,
            };
            let judgment = match &expected {
                Some((index, expected_event)) => {
                    active.expect_cursor = index + 1;
                    smart_judge(Some(expected_event), &event, &self.setup.fuzzy)
                }
                None => Judgment::Fail,
            };
            if !judgment.is_pass() {
                active.passed = false;
            }
            debug!(
                "Channel {} judged {} against {}: {}",
                self.index,
                event,
                expected
                    .as_ref()
                    .map_or_else(|| "(N/A)".to_string(), |(_, e)| e.to_string()),
                judgment.label()
            );
            active
                .flow
                .push(FlowStep::judged(&event, expected.as_ref().map(|(_, e)| e), judgment));
        }
        Ok(())
    }

    async fn send_ack(&mut self) -> Result<()> {
        let Some(active) = self.dialog.as_ref() else {
            return Ok(());
        };
        let dialog = &active.template.dialogs[active.dialog_index];
        let mut ack = match dialog.ack().and_then(RawPacket::sip_text) {
            Some(text) => render(text, &active.substitutions)?,
            None => in_dialog_request("ACK", &active.invite, &active.to_tag, 1),
        };
        fresh_branch(&mut ack);
        self.send_sip(&ack).await;
        if let Some(active) = self.dialog.as_mut() {
            active.flow.push(FlowStep::sent("ACK"));
        }
        Ok(())
    }

    /// Sends our BYE and keeps `verdict` until it is answered.
    async fn send_bye(&mut self, verdict: Verdict) -> Result<()> {
        let Some(active) = self.dialog.as_mut() else {
            return Ok(());
        };
        let bye = build_bye(active)?;
        active.pending_verdict = Some(verdict);
        active.flow.push(FlowStep::sent("BYE"));
        self.state = DialogState::Byeing;
        self.send_sip(&bye).await;
        Ok(())
    }

    /// Best effort hang up on shutdown.
    async fn interrupt(&mut self) {
        if self.dialog.is_none() {
            return;
        }
        if let Some(active) = self.dialog.as_mut() {
            match build_bye(active) {
                Ok(bye) => {
                    active.flow.push(FlowStep::sent("BYE"));
                    self.send_sip(&bye).await;
                }
                Err(e) => warn!("Channel {} could not build BYE: {}", self.index, e),
            }
        }
        self.finish_dialog(Verdict::Interrupted).await;
    }

    async fn finish_dialog(&mut self, verdict: Verdict) {
        let Some(active) = self.dialog.take() else {
            return;
        };
        self.state = DialogState::Idle;
        self.resting = true;

        let report = DialogReport {
            channel: self.index,
            case_index: self.case_index,
            case_name: active.template.info.trace_name(),
            dialog_index: active.dialog_index,
            called: self.numbers.called.clone(),
            calling: self.numbers.calling.clone(),
            verdict,
            started: active.started,
            finished: Local::now(),
            flow: active.flow,
        };
        info!(
            "Channel {} {} dialog {}: {}",
            self.index, report.case_name, report.dialog_index, verdict
        );
        self.record(report).await;
    }

    async fn record(&self, report: DialogReport) {
        if let Err(e) = self.setup.sink.record_verdict(report).await {
            warn!("Channel {} could not record verdict: {}", self.index, e);
        }
    }

    async fn send_sip(&self, message: &SipMessage) {
        if let Err(e) = self.transport.send_sip(&message.to_wire()).await {
            warn!("Channel {} SIP send failed: {}", self.index, e);
        }
    }
}

fn capture_media(active: &mut ActiveDialog, message: &SipMessage) {
    if let Some(port) = message.sdp_audio_port() {
        active.remote_media_port = Some(port);
    }
    if let Some(pt) = message.telephone_event_pt() {
        active.telephone_event_pt = Some(pt);
    }
}

fn build_bye(active: &ActiveDialog) -> Result<SipMessage> {
    let recorded = active
        .packets()
        .iter()
        .find(|packet| packet.is_bye() && !packet.received)
        .and_then(RawPacket::sip_text);
    let mut bye = match recorded {
        Some(text) => render(text, &active.substitutions)?,
        None => in_dialog_request("BYE", &active.invite, &active.to_tag, 2),
    };
    fresh_branch(&mut bye);
    Ok(bye)
}

/// Request inside the dialog of `invite`, for when the recording has none.
pub fn in_dialog_request(method: &str, invite: &SipMessage, to_tag: &str, cseq: u32) -> SipMessage {
    let uri = match &invite.start_line {
        StartLine::Request { uri, .. } => uri.clone(),
        StartLine::Response { .. } => String::new(),
    };
    let mut request = SipMessage {
        start_line: StartLine::Request {
            method: method.to_string(),
            uri,
            version: SIP_VERSION.to_string(),
        },
        headers: Vec::new(),
        body: String::new(),
    };

    if let Some(via) = invite.header("Via") {
        request.push_header("Via", via);
    }
    request.push_header("Max-Forwards", "70");
    if let Some(from) = invite.header("From") {
        request.push_header("From", from);
    }
    if let Some(to) = invite.header("To") {
        let to = if to_tag.is_empty() || to.contains(";tag=") {
            to.to_string()
        } else {
            format!("{};tag={}", to, to_tag)
        };
        request.push_header("To", to);
    }
    if let Some(call_id) = invite.header("Call-ID") {
        request.push_header("Call-ID", call_id);
    }
    request.push_header("CSeq", format!("{} {}", cseq, method));
    request.push_header("Content-Length", "0");
    request
}

/// Gives the top Via a new transaction branch.
pub fn fresh_branch(message: &mut SipMessage) {
    let branch = format!("z9hG4bK{:016x}", rand::random::<u64>());
    let Some(via) = message
        .headers
        .iter_mut()
        .find(|header| header.name.eq_ignore_ascii_case("Via") || header.name == "v")
    else {
        return;
    };

    via.value = match via.value.find("branch=") {
        Some(start) => {
            let value_start = start + "branch=".len();
            let end = via.value[value_start..]
                .find(|c| c == ';' || c == ',')
                .map_or(via.value.len(), |i| value_start + i);
            format!("{}{}{}", &via.value[..value_start], branch, &via.value[end..])
        }
        None => format!("{};branch={}", via.value, branch),
    };
}
