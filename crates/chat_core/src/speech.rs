//! Microphone capture and batched speech recognition.
//!
//! Audio is read in fixed-size batches of 16 kHz mono samples. Each batch is
//! recognized on its own thread and the text is inserted into the composer
//! where the cursor was when the batch ended. Enough consecutive empty
//! batches count as the end of speech and may trigger an automatic send.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use services::speech::{
    find_whisper_binary, model_size_hint, CommandMicrophone, MicrophoneStream, WhisperCli,
    WhisperModels, SAMPLE_RATE,
};
use shared::{SpeechState, UiEvent, UiSender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::settings::Settings;

/// Samples per read from the audio source
pub const FRAME_SIZE: usize = 1024;

const ERROR_TITLE: &str = "Speech Recognition Error";

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("speech recognition is already running")]
    AlreadyActive,
    #[error("speech model '{0}' is not downloaded")]
    ModelNotDownloaded(String),
}

/// An open stream of signed 16-bit samples
pub trait AudioSource: Send {
    fn read_samples(&mut self, count: usize) -> Result<Vec<i16>>;

    fn close(&mut self) -> Result<()>;
}

/// Opens audio sources
pub trait AudioDevice: Send + Sync {
    fn open(&self) -> Result<Box<dyn AudioSource>>;
}

pub trait SpeechRecognizer: Send + Sync {
    /// Text spoken in `samples`; empty when nothing was said.
    fn recognize(&self, samples: &[f32], language: Option<&str>) -> Result<String>;
}

/// Finds, downloads and loads recognition models
pub trait SpeechModelLoader: Send + Sync {
    fn is_downloaded(&self, model: &str) -> bool;

    /// Load `model`, downloading it first if needed.
    fn load(
        &self,
        model: &str,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<Arc<dyn SpeechRecognizer>>;
}

/// The composer recognized text is written into
pub trait TranscriptSink: Send + Sync {
    /// Current end of the composer text
    fn cursor_position(&self) -> usize;

    fn insert(&self, position: usize, text: &str);

    fn has_text(&self) -> bool;

    /// Send whatever the composer holds.
    fn request_send(&self);
}

/// Composer mirror that forwards every change to the UI as events
pub struct ComposerSink {
    text: Mutex<String>,
    events: UiSender,
}

impl ComposerSink {
    pub fn new(events: UiSender) -> Self {
        Self {
            text: Mutex::new(String::new()),
            events,
        }
    }

    pub fn text(&self) -> String {
        self.text.lock().clone()
    }

    /// Replace the mirrored text after the user edits the composer.
    pub fn set_text(&self, text: &str) {
        *self.text.lock() = text.to_string();
    }
}

impl TranscriptSink for ComposerSink {
    fn cursor_position(&self) -> usize {
        self.text.lock().chars().count()
    }

    fn insert(&self, position: usize, text: &str) {
        {
            let mut current = self.text.lock();
            let byte = current
                .char_indices()
                .nth(position)
                .map(|(i, _)| i)
                .unwrap_or(current.len());
            current.insert_str(byte, text);
        }
        self.events.emit(UiEvent::TranscriptInsert {
            position,
            text: text.to_string(),
        });
    }

    fn has_text(&self) -> bool {
        !self.text.lock().is_empty()
    }

    fn request_send(&self) {
        self.events.emit(UiEvent::SendRequested);
    }
}

impl AudioSource for MicrophoneStream {
    fn read_samples(&mut self, count: usize) -> Result<Vec<i16>> {
        MicrophoneStream::read_samples(self, count)
    }

    fn close(&mut self) -> Result<()> {
        MicrophoneStream::close(self)
    }
}

impl AudioDevice for CommandMicrophone {
    fn open(&self) -> Result<Box<dyn AudioSource>> {
        Ok(Box::new(CommandMicrophone::open(self)?))
    }
}

impl SpeechRecognizer for WhisperCli {
    fn recognize(&self, samples: &[f32], language: Option<&str>) -> Result<String> {
        self.transcribe(samples, language)
    }
}

/// whisper.cpp models in the data dir
pub struct WhisperLoader {
    models: WhisperModels,
    binary: Option<PathBuf>,
}

impl WhisperLoader {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models: WhisperModels::new(models_dir),
            binary: find_whisper_binary(),
        }
    }
}

impl SpeechModelLoader for WhisperLoader {
    fn is_downloaded(&self, model: &str) -> bool {
        self.models.is_downloaded(model)
    }

    fn load(
        &self,
        model: &str,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<Arc<dyn SpeechRecognizer>> {
        let binary = self
            .binary
            .clone()
            .ok_or_else(|| anyhow!("whisper.cpp is not installed (set WHISPER_CPP_BIN)"))?;
        let path = if self.models.is_downloaded(model) {
            self.models.model_path(model)
        } else {
            tracing::info!("Downloading speech model {}", model);
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(self.models.download(model, |done, total| progress(done, total)))?
        };
        Ok(Arc::new(WhisperCli::new(binary, path)))
    }
}

/// Closes the audio source exactly once, however capture ends.
struct CaptureGuard {
    source: Option<Box<dyn AudioSource>>,
}

impl CaptureGuard {
    fn read(&mut self, count: usize) -> Result<Vec<i16>> {
        match self.source.as_mut() {
            Some(source) => source.read_samples(count),
            None => Err(anyhow!("audio source is closed")),
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if let Some(mut source) = self.source.take() {
            if let Err(e) = source.close() {
                tracing::warn!("Failed to close audio source: {}", e);
            }
        }
    }
}

#[derive(Clone)]
struct Shared {
    settings: Settings,
    device: Arc<dyn AudioDevice>,
    loader: Arc<dyn SpeechModelLoader>,
    events: UiSender,
    state: Arc<Mutex<SpeechState>>,
}

impl Shared {
    fn set_state(&self, state: SpeechState) {
        *self.state.lock() = state;
        self.events.emit(UiEvent::SpeechStateChanged(state));
    }
}

pub struct SpeechPipeline {
    shared: Shared,
    token: Mutex<Option<CancellationToken>>,
}

impl SpeechPipeline {
    pub fn new(
        settings: Settings,
        device: Arc<dyn AudioDevice>,
        loader: Arc<dyn SpeechModelLoader>,
        events: UiSender,
    ) -> Self {
        Self {
            shared: Shared {
                settings,
                device,
                loader,
                events,
                state: Arc::new(Mutex::new(SpeechState::Idle)),
            },
            token: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SpeechState {
        *self.shared.state.lock()
    }

    /// Start listening. A missing model is offered for download instead.
    pub fn activate(&self, sink: Arc<dyn TranscriptSink>) -> Result<(), SpeechError> {
        let model = self.shared.settings.mic_model();
        if self.state() != SpeechState::Idle {
            return Err(SpeechError::AlreadyActive);
        }
        if !self.shared.loader.is_downloaded(&model) {
            let size_hint = model_size_hint(&model).unwrap_or("~151mb").to_string();
            self.shared
                .events
                .emit(UiEvent::ConfirmSpeechModelDownload {
                    model: model.clone(),
                    size_hint,
                });
            return Err(SpeechError::ModelNotDownloaded(model));
        }
        self.start(model, sink)
    }

    /// Start listening, downloading the model first if needed.
    pub fn activate_with_download(&self, sink: Arc<dyn TranscriptSink>) -> Result<(), SpeechError> {
        let model = self.shared.settings.mic_model();
        self.start(model, sink)
    }

    /// Stop listening. Capture ends at the next frame boundary.
    pub fn deactivate(&self) {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
    }

    fn start(&self, model: String, sink: Arc<dyn TranscriptSink>) -> Result<(), SpeechError> {
        {
            let mut state = self.shared.state.lock();
            if *state != SpeechState::Idle {
                return Err(SpeechError::AlreadyActive);
            }
            *state = SpeechState::Loading;
        }
        self.shared
            .events
            .emit(UiEvent::SpeechStateChanged(SpeechState::Loading));

        let token = CancellationToken::new();
        if let Some(previous) = self.token.lock().replace(token.clone()) {
            previous.cancel();
        }
        let shared = self.shared.clone();
        std::thread::spawn(move || {
            run_capture(&shared, &model, sink, &token);
            shared.set_state(SpeechState::Idle);
        });
        Ok(())
    }
}

/// Whole frames in a batch of `seconds`, rounded down.
fn frames_per_batch(seconds: u32) -> usize {
    SAMPLE_RATE as usize * seconds as usize / FRAME_SIZE
}

fn run_capture(
    shared: &Shared,
    model: &str,
    sink: Arc<dyn TranscriptSink>,
    token: &CancellationToken,
) {
    let events = shared.events.clone();
    let progress_model = model.to_string();
    let mut progress = |downloaded: u64, total: Option<u64>| {
        events.emit(UiEvent::SpeechModelProgress {
            model: progress_model.clone(),
            downloaded,
            total,
        });
    };
    let recognizer = match shared.loader.load(model, &mut progress) {
        Ok(recognizer) => recognizer,
        Err(e) => {
            tracing::error!("Failed to load speech model {}: {}", model, e);
            shared.events.error_dialog(
                ERROR_TITLE,
                format!("An error occurred while pulling speech recognition model: {}", e),
            );
            return;
        }
    };
    if token.is_cancelled() {
        return;
    }

    let mut guard = match shared.device.open() {
        Ok(source) => CaptureGuard {
            source: Some(source),
        },
        Err(e) => {
            tracing::error!("Failed to open microphone: {}", e);
            shared.events.error_dialog(
                ERROR_TITLE,
                format!("An error occurred while using speech recognition: {}", e),
            );
            return;
        }
    };
    shared.set_state(SpeechState::Listening);

    let language = shared.settings.mic_language();
    let threshold = shared.settings.mic_silence_batches();
    let frames_per_batch = frames_per_batch(shared.settings.mic_batch_seconds());
    let empty_batches = Arc::new(AtomicU32::new(0));
    let sent = AtomicBool::new(false);
    tracing::info!(
        "Listening with model {} ({} frames per batch)",
        model,
        frames_per_batch
    );

    'capture: while !token.is_cancelled() {
        let mut batch = Vec::with_capacity(frames_per_batch * FRAME_SIZE);
        for _ in 0..frames_per_batch {
            if token.is_cancelled() {
                break 'capture;
            }
            match guard.read(FRAME_SIZE) {
                Ok(frame) => batch.extend(frame.into_iter().map(|s| f32::from(s) / 32768.0)),
                Err(e) => {
                    if !token.is_cancelled() {
                        tracing::error!("Microphone read failed: {}", e);
                        shared.events.error_dialog(
                            ERROR_TITLE,
                            format!("An error occurred while using speech recognition: {}", e),
                        );
                    }
                    break 'capture;
                }
            }
        }

        let position = sink.cursor_position();
        let recognizer = Arc::clone(&recognizer);
        let sink_for_batch = Arc::clone(&sink);
        let counter = Arc::clone(&empty_batches);
        let language = language.clone();
        std::thread::spawn(move || {
            match recognizer.recognize(&batch, language.as_deref()) {
                Ok(text) if !text.is_empty() => {
                    sink_for_batch.insert(position, &text);
                    counter.store(0, Ordering::SeqCst);
                }
                Ok(_) => {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    tracing::warn!("Speech recognition failed: {}", e);
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        if empty_batches.load(Ordering::SeqCst) >= threshold
            && shared.settings.mic_auto_send()
            && sink.has_text()
            && !sent.swap(true, Ordering::SeqCst)
        {
            tracing::debug!("Silence detected, sending");
            sink.request_send();
            break;
        }
    }
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::wait_for;
    use services::SqlStore;
    use shared::{ui_channel, UiQueue};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct SilentSource {
        closes: Arc<AtomicUsize>,
        fail_reads: bool,
    }

    impl AudioSource for SilentSource {
        fn read_samples(&mut self, count: usize) -> Result<Vec<i16>> {
            if self.fail_reads {
                anyhow::bail!("device unplugged");
            }
            std::thread::sleep(Duration::from_micros(200));
            Ok(vec![0; count])
        }

        fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeDevice {
        closes: Arc<AtomicUsize>,
        fail_reads: bool,
    }

    impl AudioDevice for FakeDevice {
        fn open(&self) -> Result<Box<dyn AudioSource>> {
            Ok(Box::new(SilentSource {
                closes: Arc::clone(&self.closes),
                fail_reads: self.fail_reads,
            }))
        }
    }

    /// Hears "hello" once, then silence
    struct OneWord {
        calls: AtomicUsize,
    }

    impl SpeechRecognizer for OneWord {
        fn recognize(&self, samples: &[f32], _language: Option<&str>) -> Result<String> {
            assert!(samples.iter().all(|s| *s == 0.0));
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok("hello".into())
            } else {
                Ok(String::new())
            }
        }
    }

    struct FakeLoader {
        downloaded: bool,
        fail: bool,
    }

    impl SpeechModelLoader for FakeLoader {
        fn is_downloaded(&self, _model: &str) -> bool {
            self.downloaded
        }

        fn load(
            &self,
            _model: &str,
            progress: &mut dyn FnMut(u64, Option<u64>),
        ) -> Result<Arc<dyn SpeechRecognizer>> {
            if self.fail {
                anyhow::bail!("checksum mismatch");
            }
            if !self.downloaded {
                progress(50, Some(100));
                progress(100, Some(100));
            }
            Ok(Arc::new(OneWord {
                calls: AtomicUsize::new(0),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        text: Mutex<String>,
        sends: AtomicUsize,
    }

    impl TranscriptSink for RecordingSink {
        fn cursor_position(&self) -> usize {
            self.text.lock().len()
        }
        fn insert(&self, _position: usize, text: &str) {
            self.text.lock().push_str(text);
        }
        fn has_text(&self) -> bool {
            !self.text.lock().is_empty()
        }
        fn request_send(&self) {
            self.sends.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Rig {
        pipeline: SpeechPipeline,
        closes: Arc<AtomicUsize>,
        queue: UiQueue,
    }

    fn rig(loader: FakeLoader, fail_reads: bool, auto_send: bool) -> Rig {
        let (tx, queue) = ui_channel();
        let settings = Settings::new(Arc::new(SqlStore::open_in_memory().unwrap()));
        settings.set_mic_auto_send(auto_send).unwrap();
        settings.set_mic_batch_seconds(1).unwrap();
        let closes = Arc::new(AtomicUsize::new(0));
        let device = Arc::new(FakeDevice {
            closes: Arc::clone(&closes),
            fail_reads,
        });
        Rig {
            pipeline: SpeechPipeline::new(settings, device, Arc::new(loader), tx),
            closes,
            queue,
        }
    }

    fn wait_idle(queue: &UiQueue) -> bool {
        wait_for(queue, |e| *e == UiEvent::SpeechStateChanged(SpeechState::Idle)).is_some()
    }

    #[test]
    fn test_auto_send_fires_once_and_stops() {
        let r = rig(
            FakeLoader {
                downloaded: true,
                fail: false,
            },
            false,
            true,
        );
        let sink = Arc::new(RecordingSink::default());
        r.pipeline.activate(sink.clone()).unwrap();

        assert!(wait_idle(&r.queue));
        assert_eq!(sink.sends.load(Ordering::SeqCst), 1);
        assert_eq!(sink.text.lock().as_str(), "hello");
        assert_eq!(r.closes.load(Ordering::SeqCst), 1);
        assert_eq!(r.pipeline.state(), SpeechState::Idle);
    }

    #[test]
    fn test_deactivate_closes_source_once() {
        let r = rig(
            FakeLoader {
                downloaded: true,
                fail: false,
            },
            false,
            false,
        );
        let sink = Arc::new(RecordingSink::default());
        r.pipeline.activate(sink.clone()).unwrap();
        assert!(matches!(
            r.pipeline.activate(sink.clone()),
            Err(SpeechError::AlreadyActive)
        ));
        assert!(wait_for(&r.queue, |e| *e
            == UiEvent::SpeechStateChanged(SpeechState::Listening))
        .is_some());

        r.pipeline.deactivate();
        assert!(wait_idle(&r.queue));
        assert_eq!(r.closes.load(Ordering::SeqCst), 1);
        assert_eq!(sink.sends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_model_asks_before_download() {
        let r = rig(
            FakeLoader {
                downloaded: false,
                fail: false,
            },
            false,
            false,
        );
        let sink = Arc::new(RecordingSink::default());
        let err = r.pipeline.activate(sink.clone()).unwrap_err();
        assert!(matches!(err, SpeechError::ModelNotDownloaded(m) if m == "base"));
        assert_eq!(
            r.queue.drain(),
            vec![UiEvent::ConfirmSpeechModelDownload {
                model: "base".into(),
                size_hint: "~142mb".into()
            }]
        );
        assert_eq!(r.pipeline.state(), SpeechState::Idle);

        r.pipeline.activate_with_download(sink).unwrap();
        let progress = wait_for(&r.queue, |e| matches!(e, UiEvent::SpeechModelProgress { .. }));
        assert!(matches!(
            progress,
            Some(UiEvent::SpeechModelProgress { downloaded: 50, total: Some(100), .. })
        ));
        r.pipeline.deactivate();
        assert!(wait_idle(&r.queue));
    }

    #[test]
    fn test_load_failure_reports_and_reverts() {
        let r = rig(
            FakeLoader {
                downloaded: true,
                fail: true,
            },
            false,
            false,
        );
        r.pipeline
            .activate(Arc::new(RecordingSink::default()))
            .unwrap();
        let dialog = wait_for(&r.queue, |e| matches!(e, UiEvent::ErrorDialog { .. }));
        assert!(matches!(
            dialog,
            Some(UiEvent::ErrorDialog { title, .. }) if title == "Speech Recognition Error"
        ));
        assert!(wait_idle(&r.queue));
        assert_eq!(r.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_read_error_closes_and_reports() {
        let r = rig(
            FakeLoader {
                downloaded: true,
                fail: false,
            },
            true,
            false,
        );
        r.pipeline
            .activate(Arc::new(RecordingSink::default()))
            .unwrap();
        assert!(wait_for(&r.queue, |e| matches!(e, UiEvent::ErrorDialog { .. })).is_some());
        assert!(wait_idle(&r.queue));
        assert_eq!(r.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_batch_frames_round_after_scaling() {
        assert_eq!(frames_per_batch(1), 15);
        assert_eq!(frames_per_batch(2), 31);
        assert_eq!(frames_per_batch(5), 78);
    }

    #[test]
    fn test_composer_sink_inserts_at_position() {
        let (tx, queue) = ui_channel();
        let sink = ComposerSink::new(tx);
        sink.set_text("héllo world");
        sink.insert(5, ",");
        assert_eq!(sink.text(), "héllo, world");
        assert_eq!(sink.cursor_position(), 12);
        sink.request_send();
        assert_eq!(
            queue.drain(),
            vec![
                UiEvent::TranscriptInsert {
                    position: 5,
                    text: ",".into()
                },
                UiEvent::SendRequested
            ]
        );
    }
}
