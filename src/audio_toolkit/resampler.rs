use rubato::{FftFixedIn, Resampler};

const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// Streaming mono sample-rate converter for the capture path.
///
/// Input is buffered into fixed chunks for the FFT resampler; `finish`
/// zero-pads and flushes whatever is left when the stream stops. When the
/// input rate already matches the output rate samples pass straight
/// through.
pub struct ChunkResampler {
    resampler: Option<FftFixedIn<f32>>,
    chunk_in: usize,
    in_buf: Vec<f32>,
}

impl ChunkResampler {
    pub fn new(in_hz: usize, out_hz: usize) -> Self {
        let chunk_in = RESAMPLER_CHUNK_SIZE;
        let resampler = (in_hz != out_hz).then(|| {
            FftFixedIn::<f32>::new(in_hz, out_hz, chunk_in, 1, 1)
                .expect("failed to create resampler")
        });

        Self {
            resampler,
            chunk_in,
            in_buf: Vec::with_capacity(chunk_in),
        }
    }

    pub fn push(&mut self, mut src: &[f32], mut emit: impl FnMut(&[f32])) {
        if self.resampler.is_none() {
            if !src.is_empty() {
                emit(src);
            }
            return;
        }

        while !src.is_empty() {
            let space = self.chunk_in - self.in_buf.len();
            let take = space.min(src.len());
            self.in_buf.extend_from_slice(&src[..take]);
            src = &src[take..];

            if self.in_buf.len() == self.chunk_in {
                if let Ok(out) = self
                    .resampler
                    .as_mut()
                    .unwrap()
                    .process(&[&self.in_buf[..]], None)
                {
                    emit(&out[0]);
                }
                self.in_buf.clear();
            }
        }
    }

    /// Flush buffered input, zero-padded to a full chunk.
    pub fn finish(&mut self, mut emit: impl FnMut(&[f32])) {
        if let Some(ref mut resampler) = self.resampler {
            if !self.in_buf.is_empty() {
                self.in_buf.resize(self.chunk_in, 0.0);
                if let Ok(out) = resampler.process(&[&self.in_buf[..]], None) {
                    emit(&out[0]);
                }
                self.in_buf.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(resampler: &mut ChunkResampler, input: &[f32]) -> Vec<f32> {
        let mut out = Vec::new();
        resampler.push(input, |chunk| out.extend_from_slice(chunk));
        out
    }

    #[test]
    fn equal_rates_pass_through_unchanged() {
        let mut resampler = ChunkResampler::new(16_000, 16_000);
        let input: Vec<f32> = (0..777).map(|i| i as f32).collect();
        let out = collect(&mut resampler, &input);
        assert_eq!(out, input);
    }

    #[test]
    fn downsampling_halves_the_sample_count_per_chunk() {
        let mut resampler = ChunkResampler::new(32_000, 16_000);
        let input = vec![0.5f32; RESAMPLER_CHUNK_SIZE * 8];
        let out = collect(&mut resampler, &input);
        assert_eq!(out.len(), RESAMPLER_CHUNK_SIZE / 2 * 8);
    }

    #[test]
    fn partial_chunk_is_flushed_by_finish() {
        let mut resampler = ChunkResampler::new(32_000, 16_000);
        let out = collect(&mut resampler, &vec![0.5f32; 500]);
        assert!(out.is_empty(), "below one chunk nothing is emitted yet");

        let mut tail = Vec::new();
        resampler.finish(|chunk| tail.extend_from_slice(chunk));
        assert_eq!(tail.len(), RESAMPLER_CHUNK_SIZE / 2);
    }
}
