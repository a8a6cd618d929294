//! Run orchestration
//!
//! Prepares every case, then wires the cache controller, the distributor and
//! the channels together and drives them until the run is over.

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::cases::resolve_cases;
use crate::config::ReplayConfig;
use crate::ivr::{FuzzyPrompts, PromptBook};
use crate::services::channel::WINK;
use crate::services::{
    bind_udp, Channel, ChannelMessage, ChannelSetup, Distributor, FileResultSink, ResourceController,
    RunStatistics, UdpTransport,
};
use crate::template::{CaseCache, PreparedCase};
use crate::{Error, Result};

const MIN_SHUTDOWN_WAIT: Duration = Duration::from_secs(3);
const MAX_SHUTDOWN_WAIT: Duration = Duration::from_secs(15);

/// How long stopping tasks get before they are abandoned.
pub fn shutdown_timeout(channels: usize) -> Duration {
    (WINK * (channels as u32).saturating_mul(5)).clamp(MIN_SHUTDOWN_WAIT, MAX_SHUTDOWN_WAIT)
}

/// Resolves the inputs and makes sure each trace has a current cache.
///
/// A trace that fails to parse or holds no dialog is logged and skipped.
pub fn prepare_cases(config: &ReplayConfig, inputs: &[PathBuf], force: bool) -> Result<Vec<PreparedCase>> {
    let inputs = if inputs.is_empty() {
        vec![config.paths.case_dir.clone()]
    } else {
        inputs.to_vec()
    };
    let traces = resolve_cases(&inputs)?;
    let cache = CaseCache::from_config(config);

    let mut prepared = Vec::with_capacity(traces.len());
    for trace in traces {
        match cache.prepare(&trace, force) {
            Ok(case) if case.info.dialog_numbers.is_empty() => {
                warn!("{} holds no dialog, skipped", trace.display());
            }
            Ok(case) => prepared.push(case),
            Err(e) if e.is_fatal_for_trace() => warn!("Skipping {}: {}", trace.display(), e),
            Err(e) => error!("Skipping {} after unexpected failure: {}", trace.display(), e),
        }
    }

    if prepared.is_empty() {
        return Err(Error::invalid_state("no usable case to replay"));
    }
    info!("{} case(s) ready", prepared.len());
    Ok(prepared)
}

pub struct ReplayRunner {
    config: Arc<ReplayConfig>,
}

impl ReplayRunner {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Replays the given inputs and returns the final statistics.
    pub async fn run(&self, inputs: &[PathBuf]) -> Result<RunStatistics> {
        let config = self.config.clone();
        let force = config.replay.force_parse;
        let prepare_config = config.clone();
        let inputs = inputs.to_vec();
        let prepared = tokio::task::spawn_blocking(move || prepare_cases(&prepare_config, &inputs, force))
            .await
            .map_err(|e| Error::internal(format!("case preparation panicked: {}", e)))??;
        let cases: Vec<PathBuf> = prepared.into_iter().map(|case| case.trace).collect();

        let fuzzy = match &config.paths.fuzzy_prompts {
            Some(path) => FuzzyPrompts::load(path)?,
            None => FuzzyPrompts::new(),
        };
        let prompt_book = match &config.paths.prompt_book {
            Some(path) => Some(Arc::new(PromptBook::load(path)?)),
            None => None,
        };
        let sink = Arc::new(FileResultSink::create(
            &config.paths.result_dir,
            config.replay.draw_call_flow && !config.run.stress_test,
            prompt_book,
        )?);

        let (controller, cache) = ResourceController::new(Arc::new(CaseCache::from_config(&config)));
        let controller_task = tokio::spawn(controller.run());

        let channel_count = config.run.channel_count;
        let signaling = bind_udp(SocketAddrV4::new(config.run.source, config.sip.local_port))?;
        let signaling_send = Arc::new(UdpSocket::from_std(signaling.try_clone()?)?);

        let setup = ChannelSetup {
            config: config.clone(),
            cases: Arc::new(cases),
            cache: cache.clone(),
            sink: sink.clone(),
            fuzzy: Arc::new(fuzzy),
        };

        let mut inboxes = Vec::with_capacity(channel_count);
        let mut media_sockets = Vec::with_capacity(channel_count);
        let mut channels = JoinSet::new();
        for index in 0..channel_count {
            let media = bind_udp(SocketAddrV4::new(config.run.source, 0))?;
            let transport = UdpTransport::new(
                signaling_send.clone(),
                media.try_clone()?,
                config.run.destination,
                config.sip.remote_port,
            )?;
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.push(tx);
            media_sockets.push(media);
            channels.spawn(Channel::new(index, setup.clone(), Arc::new(transport), rx).run());
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let distributor = Distributor::new(signaling, media_sockets, inboxes.clone(), control_rx)?;
        let distributor_task = tokio::task::spawn_blocking(move || distributor.run());

        info!(
            "Replaying {} case(s) on {} channel(s) against {}",
            setup.cases.len(),
            channel_count,
            config.run.destination
        );
        for inbox in &inboxes {
            let _ = inbox.send(ChannelMessage::StartWork);
        }

        tokio::select! {
            _ = join_channels(&mut channels) => info!("All channels finished"),
            result = signal::ctrl_c() => match result {
                Ok(()) => info!("Received Ctrl+C, stopping the run"),
                Err(e) => error!("Unable to listen for shutdown signal: {}", e),
            },
        }

        for inbox in &inboxes {
            let _ = inbox.send(ChannelMessage::Shutdown);
        }
        let _ = control_tx.send(ChannelMessage::Shutdown);

        let wait = shutdown_timeout(channel_count);
        if timeout(wait, join_channels(&mut channels)).await.is_err() {
            warn!("Channels still busy after {:?}, aborting them", wait);
            channels.abort_all();
        }
        match timeout(wait, distributor_task).await {
            Ok(Ok(Err(e))) => warn!("Distributor failed: {}", e),
            Ok(Err(e)) => error!("Distributor task failed: {}", e),
            Err(_) => warn!("Distributor did not stop within {:?}", wait),
            Ok(Ok(Ok(_))) => {}
        }

        cache.shutdown();
        if timeout(wait, controller_task).await.is_err() {
            warn!("Resource controller did not stop within {:?}", wait);
        }

        let statistics = sink.close().await?;
        println!("{}", statistics.summary(&sink.run_id()));
        Ok(statistics)
    }
}

async fn join_channels(channels: &mut JoinSet<Result<()>>) {
    while let Some(result) = channels.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Channel ended with error: {}", e),
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!("Channel task failed: {}", e),
        }
    }
}
