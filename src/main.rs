use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use echoloop::voice::{
    MicrophoneSource, PlaybackBackend, PlaybackBackendKind, PlaybackController, RecordingOutcome,
    StopSignal, SynthesisMode, TranscriberKind, UtteranceRecorder, VadKind, VoiceActivityGate,
    samples_to_wav,
};
use echoloop::{Config, ConversationLoop, Overrides};

/// echoloop - talk to a chat model, hands-free
#[derive(Parser)]
#[command(name = "echoloop", version, about)]
struct Cli {
    /// Reply language (e.g. "english")
    #[arg(long)]
    language: Option<String>,

    /// Speech speed multiplier
    #[arg(long)]
    speed: Option<f32>,

    /// Voice sample file or voice name
    #[arg(long)]
    voice: Option<String>,

    /// Optional voice model
    #[arg(long)]
    model: Option<String>,

    /// How replies are spoken
    #[arg(long, value_enum)]
    synthesis: Option<SynthesisMode>,

    /// Speech-to-text backend
    #[arg(long, value_enum)]
    transcriber: Option<TranscriberKind>,

    /// Enable the narrator voice (AllTalk)
    #[arg(long)]
    narrator: bool,

    /// Narrator voice file (AllTalk)
    #[arg(long)]
    narrator_voice: Option<String>,

    /// Voice activity detector
    #[arg(long, value_enum)]
    vad: Option<VadKind>,

    /// How assets are decoded for playback
    #[arg(long, value_enum)]
    playback: Option<PlaybackBackendKind>,

    /// File holding the OpenAI API key
    #[arg(long, env = "ECHOLOOP_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// File holding the system prompt
    #[arg(long, env = "ECHOLOOP_PROMPT_FILE")]
    prompt_file: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Record one utterance and report it
    TestMic,
    /// Play a 440 Hz test tone
    TestSpeaker,
    /// Play an audio file
    Play {
        /// WAV, MP3, or raw PCM file
        file: PathBuf,
    },
    /// Synthesize text with the selected backend and play it
    Speak {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            language: self.language.clone(),
            speed: self.speed,
            voice: self.voice.clone(),
            model: self.model.clone(),
            synthesis: self.synthesis,
            transcriber: self.transcriber,
            narrator: self.narrator,
            narrator_voice: self.narrator_voice.clone(),
            vad: self.vad,
            playback: self.playback,
            key_file: self.key_file.clone(),
            prompt_file: self.prompt_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info",
        1 => "info,echoloop=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.overrides())?;
    tracing::debug!(audio = ?config.audio, synthesis = ?config.synthesis.mode, "loaded configuration");

    let stop = StopSignal::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            ctrl_c.stop();
        }
    });

    match cli.command {
        Some(Command::TestMic) => test_mic(&config, stop),
        Some(Command::TestSpeaker) => test_speaker(stop).await,
        Some(Command::Play { file }) => play_file(&config, file, stop).await,
        Some(Command::Speak { text }) => speak(&config, &text, stop).await,
        None => converse(&config, stop).await,
    }
}

fn recorder(config: &Config, stop: StopSignal) -> anyhow::Result<UtteranceRecorder<MicrophoneSource>> {
    let audio = &config.audio;
    let classifier = audio.vad.build(audio.sample_rate)?;
    let gate = VoiceActivityGate::new(classifier, audio.sample_rate);
    let source = MicrophoneSource::new(audio.sample_rate, audio.chunk);

    Ok(UtteranceRecorder::new(source, gate, audio.recorder_config()).with_stop_signal(stop))
}

#[allow(clippy::future_not_send)]
async fn converse(config: &Config, stop: StopSignal) -> anyhow::Result<()> {
    config.validate()?;

    let playback = Arc::new(
        PlaybackController::with_default_output()
            .remove_after_play(config.playback.remove_after_play),
    );
    let recorder = recorder(config, stop.clone())?;

    let mut conversation = ConversationLoop::from_config(config, recorder, playback, stop)?;
    conversation.run().await?;
    Ok(())
}

fn test_mic(config: &Config, stop: StopSignal) -> anyhow::Result<()> {
    println!("Speak into your microphone, then pause.\n");

    let mut recorder = recorder(config, stop)?;
    match recorder.record()? {
        RecordingOutcome::Done(utterance) => {
            println!(
                "Recorded {:.2}s ({} frames) to {}",
                utterance.duration().as_secs_f32(),
                utterance.frames(),
                utterance.path().display()
            );
        }
        RecordingOutcome::NoSpeech => {
            println!("No speech detected. Check that your mic is plugged in and unmuted.");
        }
    }

    Ok(())
}

/// Play one file on the default output, ending early on Ctrl+C
async fn play_blocking(
    path: PathBuf,
    backend: PlaybackBackend,
    remove: bool,
    stop: StopSignal,
) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let controller = PlaybackController::with_default_output().remove_after_play(remove);
        controller.play(&path, backend)?;
        controller.wait_done_or_stopped(&stop);
        Ok(())
    })
    .await??;
    Ok(())
}

async fn test_speaker(stop: StopSignal) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    // 2 seconds at 24kHz
    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    let num_samples = 48_000_usize;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    let tone = tempfile::Builder::new()
        .prefix("echoloop-tone-")
        .suffix(".wav")
        .tempfile()?;
    std::fs::write(tone.path(), samples_to_wav(&samples, sample_rate)?)?;

    play_blocking(tone.path().to_path_buf(), PlaybackBackend::Decoded, false, stop).await?;

    println!("If you heard the tone, your speakers are working!");
    Ok(())
}

async fn play_file(config: &Config, file: PathBuf, stop: StopSignal) -> anyhow::Result<()> {
    let backend = config
        .playback
        .backend
        .resolve(&file, config.playback.raw_format);

    // Never delete the user's own file
    play_blocking(file, backend, false, stop).await
}

async fn speak(config: &Config, text: &str, stop: StopSignal) -> anyhow::Result<()> {
    config.validate()?;

    let Some(synthesizer) = config
        .synthesis
        .mode
        .build(&config.synthesis, config.api_keys.openai.as_deref())?
    else {
        anyhow::bail!("synthesis mode \"none\" cannot speak; pick another --synthesis");
    };

    let asset = synthesizer.synthesize(&config.synthesis.request(text)).await?;
    tracing::info!(path = %asset.display(), backend = synthesizer.name(), "synthesized");

    let backend = config
        .playback
        .backend
        .resolve(&asset, config.playback.raw_format);
    play_blocking(asset, backend, config.playback.remove_after_play, stop).await
}
