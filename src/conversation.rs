//! The listen, transcribe, reply, speak loop
//!
//! One turn records an utterance, transcribes it, asks the responder for
//! a reply, synthesizes the reply, and hands the asset to the playback
//! controller without waiting for it to finish. The next turn starts
//! listening after a short settle delay, so speaking over the reply
//! preempts it on the following turn.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::assets::ReplyLog;
use crate::config::{Config, SETTLE_DELAY, SynthesisConfig};
use crate::responder::{OpenAiResponder, Responder};
use crate::voice::{
    FrameSource, PlaybackBackendKind, PlaybackController, RawFormat, StopSignal, Synthesizer,
    Transcriber, UtteranceRecorder,
};
use crate::{Error, Result};

/// Time spent in each stage of a turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimings {
    pub record: Duration,
    pub transcribe: Duration,
    pub respond: Duration,
    pub synthesize: Duration,
    /// Until the playback session reported its device open
    pub playback: Duration,
}

impl StageTimings {
    /// Sum of all stages
    #[must_use]
    pub fn total(&self) -> Duration {
        self.record + self.transcribe + self.respond + self.synthesize + self.playback
    }
}

/// A completed exchange
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub user_text: String,
    pub reply_text: String,
    /// Synthesized reply handed to playback, if any
    pub asset: Option<PathBuf>,
    pub timings: StageTimings,
}

/// Result of one pass through the loop
#[derive(Debug)]
pub enum TurnOutcome {
    Completed(ConversationTurn),
    /// Nothing was said (or the transcript was empty)
    NoSpeech,
}

/// Drives the conversation over a frame source
pub struct ConversationLoop<S: FrameSource> {
    recorder: UtteranceRecorder<S>,
    transcriber: Box<dyn Transcriber>,
    responder: Box<dyn Responder>,
    synthesizer: Option<Box<dyn Synthesizer>>,
    playback: Arc<PlaybackController>,
    playback_kind: PlaybackBackendKind,
    raw_format: RawFormat,
    synthesis: SynthesisConfig,
    system_prompt: String,
    reply_log: Option<ReplyLog>,
    settle_delay: Duration,
    stop: StopSignal,
}

impl<S: FrameSource> ConversationLoop<S> {
    /// Create a loop with text-only replies and default settings
    #[must_use]
    pub fn new(
        recorder: UtteranceRecorder<S>,
        transcriber: Box<dyn Transcriber>,
        responder: Box<dyn Responder>,
        playback: Arc<PlaybackController>,
    ) -> Self {
        Self {
            recorder,
            transcriber,
            responder,
            synthesizer: None,
            playback,
            playback_kind: PlaybackBackendKind::default(),
            raw_format: RawFormat::default(),
            synthesis: SynthesisConfig::default(),
            system_prompt: String::new(),
            reply_log: None,
            settle_delay: SETTLE_DELAY,
            stop: StopSignal::new(),
        }
    }

    /// Build every collaborator from `config`
    ///
    /// The recorder should already share `stop` so an interrupt also ends
    /// an in-progress listen.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a backend's key or engine is missing, or
    /// an IO error if the reply log directory cannot be prepared
    pub fn from_config(
        config: &Config,
        recorder: UtteranceRecorder<S>,
        playback: Arc<PlaybackController>,
        stop: StopSignal,
    ) -> Result<Self> {
        let openai_key = config.api_keys.openai.as_deref();

        let transcriber = config.transcription.backend.build(
            openai_key,
            config.api_keys.deepgram.as_deref(),
            config.transcription.model.as_deref(),
        )?;
        let responder = OpenAiResponder::new(
            openai_key.unwrap_or_default().to_string(),
            config.responder.model.clone(),
        )?;
        let synthesizer = config.synthesis.mode.build(&config.synthesis, openai_key)?;
        let reply_log = config.result_dir.as_ref().map(ReplyLog::open).transpose()?;

        tracing::info!(
            transcriber = transcriber.name(),
            synthesizer = synthesizer.as_ref().map_or("none", |s| s.name()),
            model = %config.responder.model,
            "conversation configured"
        );

        let mut this = Self::new(recorder, transcriber, Box::new(responder), playback)
            .with_synthesizer(synthesizer, config.synthesis.clone())
            .with_playback_backend(config.playback.backend, config.playback.raw_format)
            .with_system_prompt(config.responder.system_prompt.clone())
            .with_settle_delay(config.audio.settle_delay)
            .with_stop_signal(stop);
        this.reply_log = reply_log;
        Ok(this)
    }

    /// Speak replies through `synthesizer` using `settings`
    #[must_use]
    pub fn with_synthesizer(
        mut self,
        synthesizer: Option<Box<dyn Synthesizer>>,
        settings: SynthesisConfig,
    ) -> Self {
        self.synthesizer = synthesizer;
        self.synthesis = settings;
        self
    }

    #[must_use]
    pub const fn with_playback_backend(mut self, kind: PlaybackBackendKind, raw: RawFormat) -> Self {
        self.playback_kind = kind;
        self.raw_format = raw;
        self
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Write each reply to `log`
    #[must_use]
    pub fn with_reply_log(mut self, log: ReplyLog) -> Self {
        self.reply_log = Some(log);
        self
    }

    #[must_use]
    pub const fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// End the loop when `stop` is raised
    #[must_use]
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Handle to the loop's stop signal
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Borrow the recorder
    #[must_use]
    pub const fn recorder(&self) -> &UtteranceRecorder<S> {
        &self.recorder
    }

    /// Run one turn
    ///
    /// Recording blocks the calling thread; playback is dispatched to the
    /// blocking pool and not awaited beyond the device opening.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure; the utterance file is removed even
    /// when transcription fails
    #[allow(clippy::future_not_send)]
    pub async fn run_turn(&mut self) -> Result<TurnOutcome> {
        let mut timings = StageTimings::default();

        let started = Instant::now();
        let outcome = self.recorder.record()?;
        timings.record = started.elapsed();

        let Some(utterance) = outcome.into_utterance() else {
            return Ok(TurnOutcome::NoSpeech);
        };

        let started = Instant::now();
        let transcript = self.transcriber.transcribe(utterance.path()).await;
        timings.transcribe = started.elapsed();

        let path = utterance.path().to_path_buf();
        if let Err(e) = utterance.remove() {
            tracing::warn!(path = %path.display(), error = %e, "cannot remove utterance");
        }

        let user_text = transcript?.trim().to_string();
        if user_text.is_empty() {
            tracing::info!("empty transcript, listening again");
            return Ok(TurnOutcome::NoSpeech);
        }
        tracing::info!(text = %user_text, "you said");

        let started = Instant::now();
        let reply_text = self
            .responder
            .respond(&self.system_prompt, &user_text)
            .await?;
        timings.respond = started.elapsed();
        tracing::info!(text = %reply_text, "reply");

        if let Some(log) = &self.reply_log
            && let Err(e) = log.record(&reply_text)
        {
            tracing::warn!(error = %e, "cannot write reply log");
        }

        let asset = match &self.synthesizer {
            Some(synthesizer) => {
                let started = Instant::now();
                let request = self.synthesis.request(&reply_text);
                let asset = synthesizer.synthesize(&request).await?;
                timings.synthesize = started.elapsed();
                tracing::debug!(backend = synthesizer.name(), path = %asset.display(), "reply synthesized");

                let started = Instant::now();
                self.dispatch_playback(asset.clone()).await?;
                timings.playback = started.elapsed();
                Some(asset)
            }
            None => None,
        };

        if asset.is_some() && !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        Ok(TurnOutcome::Completed(ConversationTurn {
            user_text,
            reply_text,
            asset,
            timings,
        }))
    }

    /// Run turns until the stop signal is raised
    ///
    /// Failures inside a turn are logged and the next turn starts;
    /// configuration errors end the loop. Active playback is stopped on
    /// the way out.
    ///
    /// # Errors
    ///
    /// Returns the configuration error that ended the loop
    #[allow(clippy::future_not_send)]
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("conversation started, press Ctrl+C to stop");

        let result = loop {
            if self.stop.is_stopped() {
                break Ok(());
            }

            match self.run_turn().await {
                Ok(TurnOutcome::Completed(turn)) => log_turn(&turn),
                Ok(TurnOutcome::NoSpeech) => tracing::debug!("no speech, try again"),
                Err(e) if e.is_turn_recoverable() => {
                    tracing::warn!(error = %e, "turn abandoned");
                    if !self.settle_delay.is_zero() {
                        tokio::time::sleep(self.settle_delay).await;
                    }
                }
                Err(e) => break Err(e),
            }
        };

        tracing::info!("conversation ended");
        self.playback.stop();
        result
    }

    async fn dispatch_playback(&self, asset: PathBuf) -> Result<u64> {
        let controller = Arc::clone(&self.playback);
        let backend = self.playback_kind.resolve(&asset, self.raw_format);

        tokio::task::spawn_blocking(move || controller.play(&asset, backend))
            .await
            .map_err(|e| Error::Playback(format!("playback task failed: {e}")))?
    }
}

#[allow(clippy::cast_possible_truncation)]
fn log_turn(turn: &ConversationTurn) {
    let ms = |d: Duration| d.as_millis() as u64;
    let t = &turn.timings;
    tracing::info!(
        record_ms = ms(t.record),
        transcribe_ms = ms(t.transcribe),
        respond_ms = ms(t.respond),
        synthesize_ms = ms(t.synthesize),
        playback_ms = ms(t.playback),
        total_ms = ms(t.total()),
        spoken = turn.asset.is_some(),
        "turn complete"
    );
}
