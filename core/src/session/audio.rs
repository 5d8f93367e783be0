use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::{debug, warn};

/// The worker only accepts 16kHz mono.
pub const SAMPLE_RATE: u32 = 16000;

/// Recordings shorter than this are rejected before inference.
pub const MIN_DURATION_MS: u64 = 500;

const WAV_SPEC: WavSpec = WavSpec {
    channels: 1,
    sample_rate: SAMPLE_RATE,
    bits_per_sample: 16,
    sample_format: SampleFormat::Int,
};

pub fn duration_ms(sample_count: usize) -> u64 {
    sample_count as u64 * 1000 / SAMPLE_RATE as u64
}

/// Write f32 samples in `[-1, 1]` as 16-bit PCM.
pub fn write_wav(path: &Path, samples: &[f32]) -> Result<(), hound::Error> {
    let mut writer = WavWriter::create(path, WAV_SPEC)?;
    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(scaled)?;
    }
    writer.finalize()
}

/// Load a 16kHz mono WAV file as f32 samples.
pub fn read_wav(path: &Path) -> Result<Vec<f32>, hound::Error> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    debug!(
        "Audio spec: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    if spec.sample_rate != SAMPLE_RATE || spec.channels != 1 {
        return Err(hound::Error::IoError(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "expected {} Hz mono audio, got {} Hz with {} channels",
                SAMPLE_RATE, spec.sample_rate, spec.channels
            ),
        )));
    }

    let samples = match spec.sample_format {
        SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|s| s as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()?
        }
        SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<Vec<_>, _>>()?,
    };
    Ok(samples)
}

/// A WAV file that is removed when dropped.
#[derive(Debug)]
pub struct TempAudioFile {
    path: PathBuf,
}

impl TempAudioFile {
    pub fn create(dir: &Path, samples: &[f32]) -> Result<Self, hound::Error> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("visperflow-{}.wav", uuid::Uuid::new_v4()));
        // Own the path before writing so a failed write is cleaned up too
        let file = Self { path };
        write_wav(&file.path, samples)?;
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempAudioFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove temp audio {:?}: {}", self.path, e);
            }
        }
    }
}
