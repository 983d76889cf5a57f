//! Local speech recognition backed by the whisper.cpp command line tool.
//!
//! Models are ggml files kept in the app data dir and downloaded on demand.
//! Microphone audio is read from `parec` or `arecord` as raw 16 kHz mono
//! signed 16-bit samples.

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use crate::web::SHARED_HTTP;

pub const SAMPLE_RATE: u32 = 16_000;

const MODEL_BASE_URL: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

/// Known models with an approximate download size
pub const MODELS: &[(&str, &str)] = &[
    ("tiny", "~75mb"),
    ("base", "~142mb"),
    ("small", "~466mb"),
    ("medium", "~1.5gb"),
    ("large-v3", "~2.9gb"),
];

pub fn model_size_hint(name: &str) -> Option<&'static str> {
    MODELS.iter().find(|(n, _)| *n == name).map(|(_, size)| *size)
}

/// ggml model files on disk
#[derive(Debug, Clone)]
pub struct WhisperModels {
    dir: PathBuf,
}

impl WhisperModels {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn model_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("ggml-{}.bin", name))
    }

    pub fn is_downloaded(&self, name: &str) -> bool {
        self.model_path(name).is_file()
    }

    /// Download a model, reporting `(downloaded, total)` bytes as it goes.
    /// The file is written next to its final path and renamed when complete.
    pub async fn download(
        &self,
        name: &str,
        mut progress: impl FnMut(u64, Option<u64>),
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let target = self.model_path(name);
        let partial = target.with_extension("bin.part");

        let url = format!("{}/ggml-{}.bin", MODEL_BASE_URL, name);
        let response = SHARED_HTTP.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("model download failed with {}", response.status()));
        }

        let total = response.content_length();
        let mut file = fs::File::create(&partial)
            .with_context(|| format!("cannot create {}", partial.display()))?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| anyhow!("download read error: {}", e))?;
            file.write_all(&bytes)?;
            downloaded += bytes.len() as u64;
            progress(downloaded, total);
        }
        file.flush()?;
        drop(file);

        fs::rename(&partial, &target)?;
        tracing::info!("Downloaded speech model {} ({} bytes)", name, downloaded);
        Ok(target)
    }
}

/// Find a whisper.cpp binary on PATH.
pub fn find_whisper_binary() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("WHISPER_CPP_BIN") {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Some(path);
        }
    }
    ["whisper-cli", "whisper-cpp"]
        .into_iter()
        .find(|name| {
            Command::new(name)
                .arg("--help")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .is_ok()
        })
        .map(PathBuf::from)
}

/// Encode mono `f32` samples in [-1, 1] as a 16-bit PCM WAV file.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut wav = Vec::with_capacity(44 + data_len as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVEfmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        wav.extend_from_slice(&value.to_le_bytes());
    }
    wav
}

/// Drop whisper's non-speech markers such as `[BLANK_AUDIO]` or `(music)`.
pub(crate) fn clean_transcript(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty()
                && !(line.starts_with('[') && line.ends_with(']'))
                && !(line.starts_with('(') && line.ends_with(')'))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// One loaded model behind the whisper.cpp CLI
#[derive(Debug, Clone)]
pub struct WhisperCli {
    binary: PathBuf,
    model: PathBuf,
}

impl WhisperCli {
    pub fn new(binary: PathBuf, model: PathBuf) -> Self {
        Self { binary, model }
    }

    pub fn model(&self) -> &Path {
        &self.model
    }

    /// Transcribe 16 kHz mono samples. Silence yields an empty string.
    pub fn transcribe(&self, samples: &[f32], language: Option<&str>) -> Result<String> {
        let mut wav = tempfile::Builder::new()
            .prefix("corral-speech-")
            .suffix(".wav")
            .tempfile()?;
        wav.write_all(&encode_wav(samples, SAMPLE_RATE))?;
        wav.flush()?;

        let output = Command::new(&self.binary)
            .arg("-m")
            .arg(&self.model)
            .arg("-f")
            .arg(wav.path())
            .args(["-l", language.unwrap_or("auto"), "-nt", "-np"])
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {}", self.binary.display()))?;

        if !output.status.success() {
            return Err(anyhow!(
                "whisper exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(clean_transcript(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Recorder programs that can stream raw microphone audio to stdout
const RECORDERS: &[(&str, &[&str])] = &[
    (
        "parec",
        &["--raw", "--format=s16le", "--rate=16000", "--channels=1"],
    ),
    (
        "arecord",
        &["-q", "-t", "raw", "-f", "S16_LE", "-r", "16000", "-c", "1"],
    ),
];

/// Microphone opened through an external recorder process
#[derive(Debug, Clone, Default)]
pub struct CommandMicrophone;

impl CommandMicrophone {
    pub fn open(&self) -> Result<MicrophoneStream> {
        let mut last_error = None;
        for (program, args) in RECORDERS {
            match Command::new(program)
                .args(*args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(mut child) => {
                    let stdout = child
                        .stdout
                        .take()
                        .ok_or_else(|| anyhow!("{} has no stdout", program))?;
                    tracing::debug!("Microphone opened through {}", program);
                    return Ok(MicrophoneStream { child, stdout });
                }
                Err(e) => last_error = Some(format!("{}: {}", program, e)),
            }
        }
        Err(anyhow!(
            "no audio recorder available ({})",
            last_error.unwrap_or_default()
        ))
    }
}

/// Running recorder process
#[derive(Debug)]
pub struct MicrophoneStream {
    child: Child,
    stdout: ChildStdout,
}

impl MicrophoneStream {
    /// Block until `count` samples have been read.
    pub fn read_samples(&mut self, count: usize) -> Result<Vec<i16>> {
        let mut bytes = vec![0u8; count * 2];
        self.stdout
            .read_exact(&mut bytes)
            .context("microphone stream ended")?;
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Stop the recorder process.
    pub fn close(&mut self) -> Result<()> {
        if self.child.try_wait()?.is_none() {
            self.child.kill()?;
        }
        self.child.wait()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_wav_header() {
        let wav = encode_wav(&[0.0, 1.0, -1.0], SAMPLE_RATE);
        assert_eq!(wav.len(), 44 + 6);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..16], b"WAVEfmt ");
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16_000);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(i16::from_le_bytes([wav[46], wav[47]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([wav[48], wav[49]]), -i16::MAX);
    }

    #[test]
    fn test_clean_transcript_drops_markers() {
        assert_eq!(clean_transcript("[BLANK_AUDIO]\n"), "");
        assert_eq!(
            clean_transcript(" Hello there.\n(music)\n How are you?\n"),
            "Hello there. How are you?"
        );
    }

    #[test]
    fn test_model_paths() {
        let dir = TempDir::new().unwrap();
        let models = WhisperModels::new(dir.path());
        assert_eq!(models.model_path("base"), dir.path().join("ggml-base.bin"));
        assert!(!models.is_downloaded("base"));

        fs::write(models.model_path("base"), b"ggml").unwrap();
        assert!(models.is_downloaded("base"));
        assert_eq!(model_size_hint("base"), Some("~142mb"));
        assert_eq!(model_size_hint("huge"), None);
    }
}
