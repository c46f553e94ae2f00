//! whisper.cpp speech recognition behind the `whisper` feature.
//!
//! Model loading is the expensive part; build one engine per session and let
//! the scheduler serialize calls. Timestamps come back in centiseconds.

use anyhow::{anyhow, Context, Result};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::transcribe::{RecognizedSegment, SpeechRecognizer};

pub struct WhisperEngine {
    context: WhisperContext,
    language: Option<String>,
    threads: i32,
}

impl WhisperEngine {
    pub fn load(model_path: &str, language: Option<&str>) -> Result<Self> {
        let context = WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
            .with_context(|| format!("failed to load whisper model from {model_path}"))?;
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(1)
            .saturating_sub(1)
            .max(1);
        Ok(Self {
            context,
            language: language.map(str::to_owned),
            threads,
        })
    }
}

impl SpeechRecognizer for WhisperEngine {
    fn recognize(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        prompt: Option<&str>,
    ) -> Result<Vec<RecognizedSegment>> {
        if sample_rate != crate::decoding::AUDIO_SAMPLE_RATE {
            return Err(anyhow!(
                "whisper expects {} Hz audio, got {sample_rate} Hz",
                crate::decoding::AUDIO_SAMPLE_RATE
            ));
        }

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_no_context(true);
        params.set_n_threads(self.threads);
        if let Some(language) = self.language.as_deref() {
            params.set_language(Some(language));
        }
        if let Some(prompt) = prompt {
            params.set_initial_prompt(prompt);
        }

        let mut state = self
            .context
            .create_state()
            .context("failed to create whisper state")?;
        state
            .full(params, samples)
            .context("whisper inference failed")?;

        let count = state.full_n_segments().context("whisper segment count")?;
        let mut segments = Vec::with_capacity(count as usize);
        for index in 0..count {
            let text = state
                .full_get_segment_text(index)
                .context("whisper segment text")?;
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            let start_seconds = state.full_get_segment_t0(index)? as f64 / 100.0;
            let end_seconds = state.full_get_segment_t1(index)? as f64 / 100.0;
            segments.push(RecognizedSegment {
                start_seconds,
                end_seconds,
                text: trimmed.to_owned(),
                confidence: 1.0,
                speaker: None,
            });
        }
        Ok(segments)
    }
}
