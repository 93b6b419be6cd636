use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Short-time magnitude spectra with a Hann window.
pub struct Stft {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    pub frame_size: usize,
    pub hop: usize,
}

impl Stft {
    pub fn new(frame_size: usize, hop: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(frame_size);
        let window = (0..frame_size)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / frame_size as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();
        Self {
            fft,
            window,
            frame_size,
            hop: hop.max(1),
        }
    }

    pub fn bins(&self) -> usize {
        self.frame_size / 2 + 1
    }

    pub fn bin_frequency(&self, bin: usize, sample_rate: u32) -> f32 {
        bin as f32 * sample_rate as f32 / self.frame_size as f32
    }

    /// Magnitude spectrum of the frame starting at `start`, zero-padded past
    /// the end of `samples`.
    pub fn magnitudes_at(&self, samples: &[f32], start: usize) -> Vec<f32> {
        let mut buf: Vec<Complex<f32>> = (0..self.frame_size)
            .map(|i| {
                let s = samples.get(start + i).copied().unwrap_or(0.0);
                Complex::new(s * self.window[i], 0.0)
            })
            .collect();
        self.fft.process(&mut buf);
        buf[..self.bins()].iter().map(|c| c.norm()).collect()
    }

    pub fn frame_count(&self, len: usize) -> usize {
        if len < self.frame_size {
            usize::from(len > 0)
        } else {
            (len - self.frame_size) / self.hop + 1
        }
    }

    pub fn frames(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        (0..self.frame_count(samples.len()))
            .map(|i| self.magnitudes_at(samples, i * self.hop))
            .collect()
    }
}
