//! Signal glue between the acoustic model, the vocoder and the outside
//! world: spectrogram scaling, time-axis interpolation, Griffin-Lim
//! inversion, silence trimming, resampling and WAV I/O.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::Deserialize;
use std::f32::consts::PI;
use std::path::Path;
use std::sync::Arc;

/// The `audio` section of a model config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub num_mels: usize,
    pub fft_size: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub mel_fmin: f32,
    pub mel_fmax: Option<f32>,
    pub spec_gain: f32,
    pub power: f32,
    pub griffin_lim_iters: usize,
    pub signal_norm: bool,
    pub symmetric_norm: bool,
    pub max_norm: f32,
    pub clip_norm: bool,
    pub min_level_db: f32,
    pub ref_level_db: f32,
    pub do_trim_silence: bool,
    pub trim_db: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            num_mels: 80,
            fft_size: 1024,
            hop_length: 256,
            win_length: 1024,
            mel_fmin: 0.0,
            mel_fmax: None,
            spec_gain: 20.0,
            power: 1.5,
            griffin_lim_iters: 60,
            signal_norm: true,
            symmetric_norm: true,
            max_norm: 4.0,
            clip_norm: true,
            min_level_db: -100.0,
            ref_level_db: 20.0,
            do_trim_silence: true,
            trim_db: 45.0,
        }
    }
}

/// Spectrogram frames, row-major `[frames][channels]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mel {
    pub frames: usize,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl Mel {
    pub fn new(frames: usize, channels: usize, data: Vec<f32>) -> Option<Self> {
        if frames * channels != data.len() {
            return None;
        }
        Some(Self {
            frames,
            channels,
            data,
        })
    }

    pub fn zeros(frames: usize, channels: usize) -> Self {
        Self {
            frames,
            channels,
            data: vec![0.0; frames * channels],
        }
    }

    #[inline]
    pub fn at(&self, frame: usize, channel: usize) -> f32 {
        self.data[frame * self.channels + channel]
    }

    /// Channel-major copy, `[channels][frames]`, the layout vocoders consume.
    pub fn transposed(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.data.len()];
        for t in 0..self.frames {
            for c in 0..self.channels {
                out[c * self.frames + t] = self.at(t, c);
            }
        }
        out
    }

    fn map(mut self, f: impl Fn(f32) -> f32) -> Self {
        self.data.iter_mut().for_each(|v| *v = f(*v));
        self
    }
}

/// Undoes the model-side normalisation, giving decibel-scaled frames.
pub fn denormalize(mel: Mel, cfg: &AudioConfig) -> Mel {
    if !cfg.signal_norm {
        return mel;
    }
    let max = cfg.max_norm;
    let min_db = cfg.min_level_db;
    let ref_db = cfg.ref_level_db;
    if cfg.symmetric_norm {
        mel.map(|v| {
            let v = if cfg.clip_norm { v.clamp(-max, max) } else { v };
            ((v + max) * -min_db / (2.0 * max)) + min_db + ref_db
        })
    } else {
        mel.map(|v| {
            let v = if cfg.clip_norm { v.clamp(0.0, max) } else { v };
            (v * -min_db / max) + min_db + ref_db
        })
    }
}

/// Scales decibel frames into the normalised range a model expects.
pub fn normalize(mel: Mel, cfg: &AudioConfig) -> Mel {
    if !cfg.signal_norm {
        return mel;
    }
    let max = cfg.max_norm;
    let min_db = cfg.min_level_db;
    let ref_db = cfg.ref_level_db;
    mel.map(|v| {
        let unit = ((v - ref_db) - min_db) / -min_db;
        if cfg.symmetric_norm {
            let s = (2.0 * max) * unit - max;
            if cfg.clip_norm {
                s.clamp(-max, max)
            } else {
                s
            }
        } else {
            let s = max * unit;
            if cfg.clip_norm {
                s.clamp(0.0, max)
            } else {
                s
            }
        }
    })
}

/// Stretches frames along time by `scale` with bilinear, half-pixel-centred
/// interpolation. The channel axis is left untouched. Output frame count is
/// `floor(frames * scale)`.
pub fn interpolate_vocoder_input(scale: f32, mel: &Mel) -> Mel {
    let out_frames = (mel.frames as f64 * scale as f64).floor() as usize;
    if mel.frames == 0 || out_frames == 0 {
        return Mel::zeros(out_frames, mel.channels);
    }
    let ratio = mel.frames as f64 / out_frames as f64;
    let mut data = Vec::with_capacity(out_frames * mel.channels);
    for t in 0..out_frames {
        let src = ((t as f64 + 0.5) * ratio - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(mel.frames - 1);
        let i1 = (i0 + 1).min(mel.frames - 1);
        let frac = (src - i0 as f64) as f32;
        for c in 0..mel.channels {
            data.push(mel.at(i0, c) * (1.0 - frac) + mel.at(i1, c) * frac);
        }
    }
    Mel {
        frames: out_frames,
        channels: mel.channels,
        data,
    }
}

/// Reconstructs a waveform from model frames without a vocoder: the frames
/// are denormalised, mapped back to a linear magnitude spectrogram through
/// the pseudo-inverse of the mel filterbank, and given a phase by
/// `griffin_lim_iters` rounds of STFT/ISTFT. Output is `(frames - 1) * hop`
/// samples long.
pub fn griffin_lim(mel: &Mel, cfg: &AudioConfig) -> Vec<f32> {
    if mel.frames == 0 || mel.channels == 0 {
        return Vec::new();
    }
    let db = denormalize(mel.clone(), cfg);
    let amplitude = Array2::from_shape_fn((mel.frames, mel.channels), |(t, c)| {
        10f64.powf(db.at(t, c) as f64 / cfg.spec_gain as f64)
    });
    let inverse_basis = pseudo_inverse(&mel_basis(cfg, mel.channels));
    let linear = amplitude.dot(&inverse_basis.t());
    let magnitude: Vec<Vec<f32>> = linear
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .map(|v| v.max(1e-10).powf(cfg.power as f64) as f32)
                .collect()
        })
        .collect();

    let stft = Stft::new(cfg);
    let mut rng = StdRng::seed_from_u64(0);
    let mut phases: Vec<Vec<Complex<f32>>> = magnitude
        .iter()
        .map(|row| {
            row.iter()
                .map(|_| Complex::from_polar(1.0, 2.0 * PI * rng.random::<f32>()))
                .collect()
        })
        .collect();

    let mut wav = stft.inverse(&with_phase(&magnitude, &phases));
    for _ in 0..cfg.griffin_lim_iters {
        phases = stft
            .forward(&wav)
            .into_iter()
            .map(|frame| frame.into_iter().map(unit_phase).collect())
            .collect();
        wav = stft.inverse(&with_phase(&magnitude, &phases));
    }
    wav
}

fn with_phase(magnitude: &[Vec<f32>], phases: &[Vec<Complex<f32>>]) -> Vec<Vec<Complex<f32>>> {
    magnitude
        .iter()
        .zip(phases)
        .map(|(mag, phase)| mag.iter().zip(phase).map(|(m, p)| *p * *m).collect())
        .collect()
}

fn unit_phase(c: Complex<f32>) -> Complex<f32> {
    let norm = c.norm();
    if norm > 0.0 {
        c / norm
    } else {
        Complex::new(1.0, 0.0)
    }
}

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

/// Slaney mel scale: linear below 1 kHz, logarithmic above.
pub fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

pub fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Area-normalised triangular filterbank, `[n_mels][fft_size / 2 + 1]`.
pub fn mel_basis(cfg: &AudioConfig, n_mels: usize) -> Array2<f64> {
    let n_freq = cfg.fft_size / 2 + 1;
    let sample_rate = cfg.sample_rate as f64;
    let fmax = cfg.mel_fmax.map(f64::from).unwrap_or(sample_rate / 2.0);
    let low = hz_to_mel(cfg.mel_fmin as f64);
    let high = hz_to_mel(fmax);
    let edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(low + (high - low) * i as f64 / (n_mels + 1) as f64))
        .collect();

    Array2::from_shape_fn((n_mels, n_freq), |(m, k)| {
        let hz = k as f64 * sample_rate / cfg.fft_size as f64;
        let (left, centre, right) = (edges[m], edges[m + 1], edges[m + 2]);
        let rising = (hz - left) / (centre - left);
        let falling = (right - hz) / (right - centre);
        rising.min(falling).max(0.0) * 2.0 / (right - left)
    })
}

/// `Mᵀ (M Mᵀ)⁻¹` for a wide filterbank, with a tiny ridge on the diagonal
/// so filters that cover no FFT bin do not make the system singular.
pub fn pseudo_inverse(basis: &Array2<f64>) -> Array2<f64> {
    let n = basis.nrows();
    let mut gram = basis.dot(&basis.t());
    let ridge = (1e-10 * gram.diag().sum() / n.max(1) as f64).max(f64::MIN_POSITIVE);
    for i in 0..n {
        gram[[i, i]] += ridge;
    }
    solve(gram, basis.clone()).reversed_axes()
}

/// Gauss-Jordan elimination with partial pivoting: returns `A⁻¹ B`.
fn solve(mut a: Array2<f64>, mut b: Array2<f64>) -> Array2<f64> {
    let n = a.nrows();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))
            .unwrap_or(col);
        if pivot != col {
            for k in 0..n {
                a.swap([col, k], [pivot, k]);
            }
            for k in 0..b.ncols() {
                b.swap([col, k], [pivot, k]);
            }
        }
        let p = a[[col, col]];
        if p.abs() < f64::EPSILON {
            continue;
        }
        for row in 0..n {
            let factor = a[[row, col]] / p;
            if row == col || factor == 0.0 {
                continue;
            }
            for k in 0..n {
                let v = a[[col, k]];
                a[[row, k]] -= factor * v;
            }
            for k in 0..b.ncols() {
                let v = b[[col, k]];
                b[[row, k]] -= factor * v;
            }
        }
    }
    for row in 0..n {
        let p = a[[row, row]];
        if p.abs() >= f64::EPSILON {
            b.row_mut(row).mapv_inplace(|v| v / p);
        }
    }
    b
}

/// Centred short-time Fourier transform with a periodic Hann window.
struct Stft {
    n_fft: usize,
    hop: usize,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl Stft {
    fn new(cfg: &AudioConfig) -> Self {
        let n_fft = cfg.fft_size.max(2);
        let win_length = cfg.win_length.clamp(1, n_fft);
        let offset = (n_fft - win_length) / 2;
        let mut window = vec![0.0f32; n_fft];
        for i in 0..win_length {
            window[offset + i] = 0.5 - 0.5 * (2.0 * PI * i as f32 / win_length as f32).cos();
        }
        let mut planner = FftPlanner::<f32>::new();
        Self {
            n_fft,
            hop: cfg.hop_length.max(1),
            window,
            forward: planner.plan_fft_forward(n_fft),
            inverse: planner.plan_fft_inverse(n_fft),
        }
    }

    fn forward(&self, wav: &[f32]) -> Vec<Vec<Complex<f32>>> {
        let padded = reflect_pad(wav, self.n_fft / 2);
        if padded.len() < self.n_fft {
            return Vec::new();
        }
        let n_frames = 1 + (padded.len() - self.n_fft) / self.hop;
        (0..n_frames)
            .map(|t| {
                let start = t * self.hop;
                let mut buf: Vec<Complex<f32>> = padded[start..start + self.n_fft]
                    .iter()
                    .zip(&self.window)
                    .map(|(s, w)| Complex::new(s * w, 0.0))
                    .collect();
                self.forward.process(&mut buf);
                buf.truncate(self.n_fft / 2 + 1);
                buf
            })
            .collect()
    }

    /// Weighted overlap-add of the inverse frames, with the centre padding
    /// removed again.
    fn inverse(&self, frames: &[Vec<Complex<f32>>]) -> Vec<f32> {
        if frames.is_empty() {
            return Vec::new();
        }
        let total = self.n_fft + self.hop * (frames.len() - 1);
        let mut wav = vec![0.0f32; total];
        let mut norm = vec![0.0f32; total];
        let half = self.n_fft / 2;

        for (t, frame) in frames.iter().enumerate() {
            let mut buf = vec![Complex::new(0.0, 0.0); self.n_fft];
            let bins = frame.len().min(half + 1);
            buf[..bins].copy_from_slice(&frame[..bins]);
            for k in 1..half.min(bins) {
                buf[self.n_fft - k] = frame[k].conj();
            }
            self.inverse.process(&mut buf);

            let start = t * self.hop;
            for (i, (c, w)) in buf.iter().zip(&self.window).enumerate() {
                wav[start + i] += c.re / self.n_fft as f32 * w;
                norm[start + i] += w * w;
            }
        }
        for (s, n) in wav.iter_mut().zip(&norm) {
            if *n > 1e-8 {
                *s /= n;
            }
        }
        wav[half..total - half].to_vec()
    }
}

fn reflect_pad(wav: &[f32], pad: usize) -> Vec<f32> {
    if wav.len() < 2 {
        let mut out = vec![0.0; pad];
        out.extend_from_slice(wav);
        out.resize(out.len() + pad, 0.0);
        return out;
    }
    let len = wav.len() as isize;
    let period = 2 * (len - 1);
    (-(pad as isize)..len + pad as isize)
        .map(|i| {
            let j = i.rem_euclid(period);
            let j = if j >= len { period - j } else { j };
            wav[j as usize]
        })
        .collect()
}

/// Drops leading and trailing silence. A 10 ms margin is cut from both ends
/// first, then frames quieter than `trim_db` below the loudest frame are
/// removed from the edges.
pub fn trim_silence(wav: &[f32], cfg: &AudioConfig) -> Vec<f32> {
    let margin = (cfg.sample_rate as f32 * 0.01) as usize;
    if wav.len() <= 2 * margin {
        return Vec::new();
    }
    let wav = &wav[margin..wav.len() - margin];

    let hop = cfg.hop_length.max(1);
    let frame_len = cfg.win_length.max(hop);
    let half = frame_len / 2;
    let n_frames = wav.len() / hop + 1;

    let rms: Vec<f32> = (0..n_frames)
        .map(|f| {
            let centre = f * hop;
            let start = centre.saturating_sub(half);
            let end = (centre + half).min(wav.len());
            if start >= end {
                return 0.0;
            }
            // Zero padding past the edges counts toward the frame length.
            let energy: f32 = wav[start..end].iter().map(|s| s * s).sum();
            (energy / frame_len as f32).sqrt()
        })
        .collect();

    let peak = rms.iter().cloned().fold(0.0f32, f32::max);
    if peak <= 0.0 {
        return Vec::new();
    }
    let threshold = peak * 10f32.powf(-cfg.trim_db / 20.0);
    let loud = |r: &f32| *r > threshold;

    match (rms.iter().position(loud), rms.iter().rposition(loud)) {
        (Some(first), Some(last)) => {
            let start = first * hop;
            let end = ((last + 1) * hop).min(wav.len());
            wav[start..end].to_vec()
        }
        _ => Vec::new(),
    }
}

/// Simple linear interpolation resampling
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (input.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 * ratio;
        let idx = src_idx as usize;
        let frac = (src_idx - idx as f64) as f32;

        let sample = if idx + 1 < input.len() {
            input[idx] * (1.0 - frac) + input[idx + 1] * frac
        } else if idx < input.len() {
            input[idx]
        } else {
            0.0
        };

        output.push(sample);
    }

    output
}

/// Writes a mono 16-bit WAV, peak-normalised to full scale.
pub fn save_wav(wav: &[f32], path: &Path, sample_rate: u32) -> Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let peak = wav.iter().fold(0.01f32, |m, s| m.max(s.abs()));
    let gain = i16::MAX as f32 / peak;

    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in wav {
        writer.write_sample((sample * gain) as i16)?;
    }
    writer.finalize()
}

/// Loads a WAV file as mono f32 samples plus its sample rate.
pub fn load_wav(path: &Path) -> Result<(Vec<f32>, u32), hound::Error> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    // Convert to mono if stereo
    let mono = if channels > 1 {
        samples
            .chunks(channels)
            .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        samples
    };

    Ok((mono, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_mel(frames: usize, channels: usize) -> Mel {
        let data = (0..frames * channels).map(|i| i as f32).collect();
        Mel::new(frames, channels, data).unwrap()
    }

    #[test]
    fn test_normalize_denormalize_inverse() {
        let cfg = AudioConfig::default();
        let db = Mel::new(1, 4, vec![-80.0, -40.0, 0.0, 10.0]).unwrap();
        let back = denormalize(normalize(db.clone(), &cfg), &cfg);
        for (a, b) in db.data.iter().zip(back.data.iter()) {
            assert!((a - b).abs() < 1e-3, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_normalize_clips_to_max_norm() {
        let cfg = AudioConfig::default();
        let loud = normalize(Mel::new(1, 1, vec![500.0]).unwrap(), &cfg);
        assert_eq!(loud.data[0], cfg.max_norm);
    }

    #[test]
    fn test_signal_norm_disabled_is_identity() {
        let cfg = AudioConfig {
            signal_norm: false,
            ..AudioConfig::default()
        };
        let mel = ramp_mel(3, 2);
        assert_eq!(normalize(mel.clone(), &cfg), mel);
        assert_eq!(denormalize(mel.clone(), &cfg), mel);
    }

    #[test]
    fn test_interpolate_doubles_frames() {
        let mel = ramp_mel(10, 3);
        let out = interpolate_vocoder_input(2.0, &mel);
        assert_eq!(out.frames, 20);
        assert_eq!(out.channels, 3);
        // Channels are never mixed.
        assert_eq!(out.at(0, 1), mel.at(0, 1));
    }

    #[test]
    fn test_interpolate_floor_of_scaled_length() {
        let mel = ramp_mel(7, 2);
        assert_eq!(interpolate_vocoder_input(24000.0 / 22050.0, &mel).frames, 7);
        assert_eq!(interpolate_vocoder_input(0.5, &mel).frames, 3);
    }

    #[test]
    fn test_transposed_layout() {
        let mel = ramp_mel(2, 3);
        assert_eq!(mel.transposed(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    fn griffin_lim_config() -> AudioConfig {
        AudioConfig {
            sample_rate: 8000,
            fft_size: 64,
            win_length: 64,
            hop_length: 16,
            griffin_lim_iters: 4,
            ..AudioConfig::default()
        }
    }

    #[test]
    fn test_griffin_lim_length_follows_frames() {
        let cfg = griffin_lim_config();
        let mel = Mel::new(10, 8, vec![1.0; 80]).unwrap();
        let wav = griffin_lim(&mel, &cfg);
        assert_eq!(wav.len(), 9 * cfg.hop_length);
        assert!(wav.iter().all(|s| s.is_finite()));
        assert!(wav.iter().any(|s| s.abs() > 0.0));
    }

    #[test]
    fn test_griffin_lim_empty_input() {
        let cfg = griffin_lim_config();
        assert!(griffin_lim(&Mel::zeros(0, 8), &cfg).is_empty());
    }

    #[test]
    fn test_filterbank_pseudo_inverse() {
        let basis = mel_basis(&griffin_lim_config(), 8);
        assert_eq!(basis.dim(), (8, 33));
        let identity = basis.dot(&pseudo_inverse(&basis));
        for i in 0..8 {
            for j in 0..8 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((identity[[i, j]] - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_mel_scale_round_trip() {
        for hz in [0.0, 440.0, 1000.0, 7600.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_trim_silence_removes_edges() {
        let cfg = AudioConfig {
            sample_rate: 1000,
            hop_length: 10,
            win_length: 20,
            ..AudioConfig::default()
        };
        let mut wav = vec![0.0f32; 300];
        wav.extend((0..200).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }));
        wav.extend(vec![0.0f32; 300]);

        let trimmed = trim_silence(&wav, &cfg);
        assert!(trimmed.len() < wav.len());
        assert!(trimmed.len() >= 200);
        assert!(trimmed.len() <= 240);
    }

    #[test]
    fn test_trim_silence_all_quiet() {
        let cfg = AudioConfig::default();
        assert!(trim_silence(&vec![0.0; 5000], &cfg).is_empty());
    }

    #[test]
    fn test_resample() {
        let input = vec![1.0, 2.0, 3.0, 4.0];
        let output = resample(&input, 8000, 16000);
        assert_eq!(output.len(), 8);
        assert_eq!(resample(&input, 16000, 16000), input);
    }

    #[test]
    fn test_wav_round_trip_normalises_peak() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        save_wav(&[0.0, 0.25, -0.5], &path, 22050).unwrap();

        let (samples, rate) = load_wav(&path).unwrap();
        assert_eq!(rate, 22050);
        assert_eq!(samples.len(), 3);
        assert!((samples[2] + 1.0).abs() < 1e-3);
        assert!((samples[1] - 0.5).abs() < 1e-3);
    }
}
