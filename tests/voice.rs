//! Voice pipeline integration tests
//!
//! Tests recording and playback without requiring audio hardware

use std::sync::{Arc, Barrier};
use std::time::Duration;

use echoloop::Error;
use echoloop::voice::{
    EnergyClassifier, FrameSource, PlaybackBackend, PlaybackController, RecorderConfig,
    RecorderState, RecordingOutcome, RollingBuffer, SAMPLE_RATE, StopSignal, UtteranceRecorder,
    VoiceActivityGate,
};

mod common;

use common::{
    DeviceEvent, FRAME_LEN, RecordingDevice, ScriptedClassifier, ScriptedSource, write_tone,
};

fn recorder(
    source: ScriptedSource,
    speech_calls: usize,
    dir: &std::path::Path,
) -> UtteranceRecorder<ScriptedSource> {
    let gate = VoiceActivityGate::new(Box::new(ScriptedClassifier::new(speech_calls)), SAMPLE_RATE);
    let config = RecorderConfig {
        asset_dir: dir.to_path_buf(),
        ..RecorderConfig::default()
    };
    UtteranceRecorder::new(source, gate, config)
}

fn dir_entries(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[test]
fn test_recording_stops_after_silence_timeout() {
    let dir = tempfile::tempdir().unwrap();
    // 5 speech + 18 silence ends the utterance; 5 more are never read
    let source = ScriptedSource::speech_then_silence(5, 23);
    let mut recorder = recorder(source, 5, dir.path());

    let outcome = recorder.record().unwrap();
    let RecordingOutcome::Done(utterance) = outcome else {
        panic!("expected a finished utterance");
    };

    assert_eq!(utterance.frames(), 23);
    assert_eq!(utterance.samples(), 23 * FRAME_LEN);
    assert_eq!(recorder.state(), RecorderState::Done);
    assert_eq!(recorder.source().remaining(), 5);
    assert!(!recorder.source().is_active());
    assert_eq!(recorder.source().stops, 1);

    let reader = hound::WavReader::open(utterance.path()).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len() as usize, 23 * FRAME_LEN);

    let path = utterance.path().to_path_buf();
    utterance.remove().unwrap();
    assert!(!path.exists());
}

#[test]
fn test_seventeen_silent_frames_do_not_finish() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::speech_then_silence(5, 17);
    let mut recorder = recorder(source, 5, dir.path());

    let outcome = recorder.record().unwrap();
    assert!(matches!(outcome, RecordingOutcome::NoSpeech));
    assert_eq!(recorder.source().remaining(), 0);
}

#[test]
fn test_speech_after_pause_resets_silence_count() {
    let dir = tempfile::tempdir().unwrap();
    let mut script = vec![true; 5];
    script.extend([false; 10]);
    script.push(true);
    script.extend([false; 18]);

    let source = ScriptedSource::speech_then_silence(5, 34);
    let gate = VoiceActivityGate::new(Box::new(ScriptedClassifier::from_script(script)), SAMPLE_RATE);
    let config = RecorderConfig {
        asset_dir: dir.path().to_path_buf(),
        ..RecorderConfig::default()
    };
    let mut recorder = UtteranceRecorder::new(source, gate, config);

    let RecordingOutcome::Done(utterance) = recorder.record().unwrap() else {
        panic!("expected a finished utterance");
    };
    // 5 + 10 + 1 + 18; a counter that never reset would stop at frame 23
    assert_eq!(utterance.frames(), 34);
    assert_eq!(recorder.source().remaining(), 5);
    utterance.remove().unwrap();
}

#[test]
fn test_no_speech_leaves_no_asset() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::speech_then_silence(0, 50);
    let mut recorder = recorder(source, 0, dir.path());

    let outcome = recorder.record().unwrap();
    assert!(matches!(outcome, RecordingOutcome::NoSpeech));
    assert_eq!(recorder.state(), RecorderState::NoSpeech);
    assert!(!recorder.source().is_active());
    assert_eq!(dir_entries(dir.path()), 0);
}

#[test]
fn test_exhaustion_after_speech_is_abandoned() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::speech_then_silence(8, 10);
    let mut recorder = recorder(source, 8, dir.path());

    let outcome = recorder.record().unwrap();
    assert!(matches!(outcome, RecordingOutcome::NoSpeech));
    assert_eq!(recorder.source().stops, 1);
    assert_eq!(dir_entries(dir.path()), 0);
}

#[test]
fn test_stop_signal_ends_listening() {
    let dir = tempfile::tempdir().unwrap();
    let stop = StopSignal::new();
    let source = ScriptedSource::speech_then_silence(5, 30);
    let mut recorder = recorder(source, 5, dir.path()).with_stop_signal(stop.clone());

    stop.stop();
    let outcome = recorder.record().unwrap();
    assert!(matches!(outcome, RecordingOutcome::NoSpeech));
    assert_eq!(recorder.source().remaining(), 35);
    assert!(!recorder.source().is_active());
}

#[test]
fn test_capture_failure_surfaces() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = ScriptedSource::speech_then_silence(5, 30);
    source.fail_start = true;
    let mut recorder = recorder(source, 5, dir.path());

    let err = recorder.record().unwrap_err();
    assert!(matches!(err, Error::Capture(_)));
    assert!(err.is_turn_recoverable());
    assert_eq!(recorder.state(), RecorderState::Idle);
}

#[test]
fn test_recorder_is_reusable() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::speech_then_silence(5, 23);
    let mut recorder = recorder(source, 5, dir.path());

    let first = recorder.record().unwrap();
    let utterance = first.into_utterance().expect("first attempt records");

    // The leftover silence runs dry without speech
    let second = recorder.record().unwrap();
    assert!(matches!(second, RecordingOutcome::NoSpeech));
    assert_eq!(recorder.source().starts, 2);
    assert_eq!(recorder.source().stops, 2);
    assert_eq!(dir_entries(dir.path()), 1);

    utterance.remove().unwrap();
}

#[test]
fn test_energy_gate_finishes_utterance() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::speech_then_silence(10, 120);
    let gate = VoiceActivityGate::new(Box::new(EnergyClassifier::new()), SAMPLE_RATE);
    let config = RecorderConfig {
        asset_dir: dir.path().to_path_buf(),
        ..RecorderConfig::default()
    };
    let mut recorder = UtteranceRecorder::new(source, gate, config);

    let outcome = recorder.record().unwrap();
    let utterance = outcome.into_utterance().expect("speech should be detected");
    assert!(utterance.frames() > 10 + 17);
    assert!(recorder.source().remaining() > 0);
    utterance.remove().unwrap();
}

#[test]
fn test_rolling_buffer_keeps_latest_window() {
    let mut buffer = RollingBuffer::for_window(SAMPLE_RATE, Duration::from_millis(1500));
    assert_eq!(buffer.capacity(), 24000);

    for i in 0..100 {
        #[allow(clippy::cast_precision_loss)]
        buffer.extend(&vec![i as f32; FRAME_LEN]);
        assert!(buffer.len() <= buffer.capacity());
    }

    assert_eq!(buffer.len(), 24000);
    let samples = buffer.as_slice();
    assert!((samples[0] - 50.0).abs() < f32::EPSILON);
    assert!((samples[samples.len() - 1] - 99.0).abs() < f32::EPSILON);
}

#[test]
fn test_new_playback_preempts_old() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_tone(dir.path(), "a.wav");
    let b = write_tone(dir.path(), "b.wav");

    let device = RecordingDevice::new(Duration::from_secs(30));
    let controller = PlaybackController::new(Arc::new(device.clone()));

    let first = controller.play(&a, PlaybackBackend::Decoded).unwrap();
    assert_eq!(controller.active_session(), Some(first));

    let second = controller.play(&b, PlaybackBackend::Decoded).unwrap();
    assert_ne!(first, second);
    assert_eq!(controller.active_session(), Some(second));
    assert_eq!(
        device.events(),
        vec![
            DeviceEvent::Open(1),
            DeviceEvent::Release(1),
            DeviceEvent::Open(2)
        ]
    );
    assert_eq!(device.max_live(), 1);

    controller.stop();
    assert!(!controller.is_playing());
    assert_eq!(device.live(), 0);
    assert_eq!(device.events().last(), Some(&DeviceEvent::Release(2)));
}

#[test]
fn test_concurrent_play_keeps_one_session() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_tone(dir.path(), "a.wav");
    let b = write_tone(dir.path(), "b.wav");

    let device = RecordingDevice::new(Duration::from_secs(30));
    let controller = Arc::new(PlaybackController::new(Arc::new(device.clone())));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = [a, b]
        .into_iter()
        .map(|asset| {
            let controller = Arc::clone(&controller);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                controller.play(&asset, PlaybackBackend::Decoded).unwrap()
            })
        })
        .collect();
    let ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_ne!(ids[0], ids[1]);
    assert!(ids.contains(&controller.active_session().unwrap()));
    assert_eq!(device.max_live(), 1);

    controller.stop();
    let events = device.events();
    assert_eq!(events.len(), 4);
    // Every open is released before the next one
    for pair in events.chunks(2) {
        match pair {
            [DeviceEvent::Open(o), DeviceEvent::Release(r)] => assert_eq!(o, r),
            other => panic!("unexpected event order: {other:?}"),
        }
    }
}

#[test]
fn test_playback_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let asset = write_tone(dir.path(), "reply.wav");

    let device = RecordingDevice::new(Duration::from_millis(60));
    let controller = PlaybackController::new(Arc::new(device.clone())).remove_after_play(true);

    controller.play(&asset, PlaybackBackend::Decoded).unwrap();
    controller.wait_done();

    assert!(!controller.is_playing());
    assert_eq!(controller.active_session(), None);
    assert_eq!(
        device.events(),
        vec![DeviceEvent::Open(1), DeviceEvent::Release(1)]
    );
    assert!(!asset.exists());
}

#[test]
fn test_stop_signal_cuts_waiting_playback_short() {
    let dir = tempfile::tempdir().unwrap();
    let asset = write_tone(dir.path(), "long.wav");

    let device = RecordingDevice::new(Duration::from_secs(30));
    let controller = PlaybackController::new(Arc::new(device.clone()));
    controller.play(&asset, PlaybackBackend::Decoded).unwrap();

    let stop = StopSignal::new();
    let raiser = stop.clone();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        raiser.stop();
    });

    let started = std::time::Instant::now();
    controller.wait_done_or_stopped(&stop);
    stopper.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!controller.is_playing());
    assert_eq!(
        device.events(),
        vec![DeviceEvent::Open(1), DeviceEvent::Release(1)]
    );
}

#[test]
fn test_decode_failure_keeps_controller_usable() {
    let dir = tempfile::tempdir().unwrap();
    let broken = dir.path().join("broken.wav");
    std::fs::write(&broken, b"not a wav file").unwrap();
    let good = write_tone(dir.path(), "good.wav");

    let device = RecordingDevice::new(Duration::from_secs(30));
    let controller = PlaybackController::new(Arc::new(device.clone()));

    let playing = controller.play(&good, PlaybackBackend::Decoded).unwrap();

    let err = controller.play(&broken, PlaybackBackend::Decoded).unwrap_err();
    assert!(matches!(err, Error::Playback(_)));
    // The active session is untouched by a failed decode
    assert_eq!(controller.active_session(), Some(playing));

    let next = controller.play(&good, PlaybackBackend::Decoded).unwrap();
    assert_eq!(controller.active_session(), Some(next));
    assert_eq!(device.max_live(), 1);
}

#[test]
fn test_device_open_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let asset = write_tone(dir.path(), "reply.wav");

    let mut device = RecordingDevice::new(Duration::from_secs(1));
    device.fail_open = true;
    let controller = PlaybackController::new(Arc::new(device.clone()));

    let err = controller.play(&asset, PlaybackBackend::Decoded).unwrap_err();
    assert!(matches!(err, Error::Playback(_)));
    assert!(!controller.is_playing());
    assert!(device.events().is_empty());
}

#[test]
fn test_raw_backend_requires_whole_frames() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("reply.pcm");
    std::fs::write(&raw, [0u8, 1, 2]).unwrap();

    let device = RecordingDevice::new(Duration::from_millis(10));
    let controller = PlaybackController::new(Arc::new(device));
    let backend = echoloop::voice::PlaybackBackendKind::Auto
        .resolve(&raw, echoloop::voice::RawFormat::default());

    assert!(matches!(backend, PlaybackBackend::Raw(_)));
    assert!(controller.play(&raw, backend).is_err());
}

#[test]
fn test_synthesized_asset_plays() {
    use echoloop::voice::{PlaybackBackendKind, RawFormat, SynthesisRequest, Synthesizer};

    let dir = tempfile::tempdir().unwrap();
    let synthesizer = common::FakeSynthesizer::new(dir.path());
    let request = SynthesisRequest {
        text: "hello".to_string(),
        language: "en".to_string(),
        speed: 1.0,
        voice: None,
        model: None,
        narrator: false,
        narrator_voice: None,
    };

    let asset = tokio_test::block_on(synthesizer.synthesize(&request)).unwrap();
    let backend = PlaybackBackendKind::Auto.resolve(&asset, RawFormat::default());
    assert_eq!(backend, PlaybackBackend::Decoded);

    let device = RecordingDevice::new(Duration::from_millis(20));
    let controller = PlaybackController::new(Arc::new(device.clone()));
    controller.play(&asset, backend).unwrap();
    controller.wait_done();
    assert_eq!(device.events().len(), 2);
}
