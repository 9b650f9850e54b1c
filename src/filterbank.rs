//! Slaney-scale mel filterbank, matching librosa's construction.

use ndarray::Array2;

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;
const LOG_STEP: f64 = 0.068_751_777_420_949_12;

fn hz_to_mel(hz: f64) -> f64 {
    if hz < MIN_LOG_HZ {
        hz / F_SP
    } else {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / LOG_STEP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel < MIN_LOG_MEL {
        mel * F_SP
    } else {
        MIN_LOG_HZ * ((mel - MIN_LOG_MEL) * LOG_STEP).exp()
    }
}

/// Build a `(n_mels, n_fft / 2 + 1)` triangular filterbank with Slaney
/// area normalization, covering 0 Hz to Nyquist.
pub fn mel_filter_bank(n_fft: usize, n_mels: usize, sample_rate: usize) -> Array2<f32> {
    let freq_bins = n_fft / 2 + 1;
    let mut bank = Array2::<f32>::zeros((n_mels, freq_bins));

    let mel_min = hz_to_mel(0.0);
    let mel_max = hz_to_mel(sample_rate as f64 / 2.0);

    // n_mels + 2 band edges, evenly spaced on the mel scale.
    let edges: Vec<f64> = (0..=n_mels + 1)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();
    let widths: Vec<f64> = edges.windows(2).map(|w| w[1] - w[0]).collect();

    for m in 0..n_mels {
        let norm = 2.0 / (edges[m + 2] - edges[m]);
        for k in 0..freq_bins {
            let freq = k as f64 * sample_rate as f64 / n_fft as f64;
            let rising = (freq - edges[m]) / widths[m];
            let falling = (edges[m + 2] - freq) / widths[m + 1];
            bank[[m, k]] = (norm * rising.min(falling).max(0.0)) as f32;
        }
    }

    bank
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_matches_parameters() {
        let bank = mel_filter_bank(400, 128, 16_000);
        assert_eq!(bank.shape(), &[128, 201]);
    }

    #[test]
    fn filters_are_nonnegative_and_nonempty() {
        let bank = mel_filter_bank(400, 64, 16_000);
        assert!(bank.iter().all(|&v| v >= 0.0));
        for row in bank.outer_iter() {
            assert!(row.iter().any(|&v| v > 0.0));
        }
    }
}
