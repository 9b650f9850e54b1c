//! Streaming inference session.
//!
//! Coordinates the featurizer, the windowed encoder and the decode worker.
//! The feed path runs under a short critical section and never blocks on a
//! decode; a single long-lived worker thread consumes decode requests from a
//! bounded channel, so at most one pass is ever in flight. Lock order is
//! always `audio` before `shared`.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::decode::{self, DecodePass};
use crate::encoder::WindowedEncoder;
use crate::error::SessionError;
use crate::features::MelFeaturizer;
use crate::model::{SpeechModel, SAMPLE_RATE};
use crate::streaming::events::{
    EventSender, EventStream, MemoryProbe, NoopMemoryProbe, Stats, TranscriptionEvent,
    EVENT_CHANNEL_CAPACITY,
};
use crate::streaming::ledger::PromotionLedger;
use crate::streaming::{CancelToken, StreamingConfig};
use crate::text;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Active,
    Stopping,
    Ended,
    Cancelled,
}

/// Mutable state behind the session lock: the audio-sample and
/// encoder-window timelines, plus scheduling bookkeeping.
struct AudioFront<M: SpeechModel> {
    state: SessionState,
    featurizer: MelFeaturizer,
    encoder: WindowedEncoder<M>,
    total_samples_fed: usize,
    has_new_encoder_content: bool,
    last_decode_time: Option<Instant>,
    frozen_window_count: usize,
}

/// Mutable state behind the finer-grained shared lock: the decoder-token
/// timeline and the in-flight flag. Decode passes only take this lock when
/// merging results, never across a forward pass.
struct SharedState {
    ledger: PromotionLedger,
    is_decoding: bool,
}

struct SessionInner<M: SpeechModel> {
    model: Arc<M>,
    config: StreamingConfig,
    audio: Mutex<AudioFront<M>>,
    shared: Mutex<SharedState>,
    decode_done: Condvar,
    cancel: CancelToken,
    events: EventSender,
    probe: Box<dyn MemoryProbe>,
}

pub struct StreamingSession<M: SpeechModel> {
    inner: Arc<SessionInner<M>>,
    work_tx: Option<SyncSender<()>>,
    worker: Option<JoinHandle<()>>,
    events: Mutex<Option<EventStream>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy)]
struct StatsSnapshot {
    encoded_window_count: usize,
    total_samples_fed: usize,
}

impl<M: SpeechModel> StreamingSession<M> {
    pub fn new(model: Arc<M>, config: StreamingConfig) -> Result<Self, SessionError> {
        Self::with_memory_probe(model, config, Box::new(NoopMemoryProbe))
    }

    pub fn with_memory_probe(
        model: Arc<M>,
        config: StreamingConfig,
        probe: Box<dyn MemoryProbe>,
    ) -> Result<Self, SessionError> {
        let featurizer = MelFeaturizer::new(config.featurizer.clone(), model.mel_filterbank())?;
        let encoder = WindowedEncoder::new(
            Arc::clone(&model),
            config.window_frames,
            config.featurizer.num_mel_bins,
            config.max_cached_windows,
        );

        let (event_tx, event_rx) = sync_channel(EVENT_CHANNEL_CAPACITY);
        let (work_tx, work_rx) = sync_channel(1);

        let inner = Arc::new(SessionInner {
            model,
            config,
            audio: Mutex::new(AudioFront {
                state: SessionState::Active,
                featurizer,
                encoder,
                total_samples_fed: 0,
                has_new_encoder_content: false,
                last_decode_time: None,
                frozen_window_count: 0,
            }),
            shared: Mutex::new(SharedState {
                ledger: PromotionLedger::new(),
                is_decoding: false,
            }),
            decode_done: Condvar::new(),
            cancel: CancelToken::new(),
            events: EventSender::new(event_tx),
            probe,
        });

        let worker = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("streamscribe-decode".to_string())
                .spawn(move || worker_loop(inner, work_rx))?
        };

        log::info!("streaming session started");
        Ok(Self {
            inner,
            work_tx: Some(work_tx),
            worker: Some(worker),
            events: Mutex::new(Some(EventStream::new(event_rx))),
        })
    }

    /// Take the event stream. Yields `Some` exactly once.
    pub fn events(&self) -> Option<EventStream> {
        lock(&self.events).take()
    }

    /// Feed raw 16 kHz mono samples. Callable from any thread while the
    /// session is active; never blocks on a running decode pass.
    pub fn feed_audio(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let inner = &self.inner;
        let mut audio = lock(&inner.audio);
        if audio.state != SessionState::Active {
            return;
        }

        audio.total_samples_fed += samples.len();
        let mut new_windows = 0;
        if let Some(frames) = audio.featurizer.process(samples) {
            match audio.encoder.feed(frames.view()) {
                Ok(completed) => new_windows = completed,
                Err(err) => log::error!("encoder failed on {} mel frames: {err}", frames.nrows()),
            }
            audio.has_new_encoder_content = true;
        } else if audio.encoder.has_pending_frames() {
            audio.has_new_encoder_content = true;
        }

        let now = Instant::now();
        let boundary_finalize = inner.config.finalize_completed_windows && new_windows > 0;
        let interval_elapsed = audio
            .last_decode_time
            .is_some_and(|t| now.duration_since(t) >= inner.config.decode_interval());
        let first_content = audio.last_decode_time.is_none() && audio.has_new_encoder_content;
        let should_decode = boundary_finalize || interval_elapsed || first_content;

        if should_decode && audio.has_new_encoder_content {
            let mut shared = lock(&inner.shared);
            if !shared.is_decoding {
                shared.is_decoding = true;
                drop(shared);

                audio.has_new_encoder_content = false;
                if !boundary_finalize {
                    audio.last_decode_time = Some(now);
                }
                if let Some(tx) = &self.work_tx {
                    if tx.try_send(()).is_err() {
                        // Worker is gone; release the flag so stop() cannot hang.
                        lock(&inner.shared).is_decoding = false;
                    }
                }
            }
        }
    }

    /// Finish the stream: drain the in-flight pass, flush the featurizer,
    /// run the final decodes and emit `Ended` with the full transcript.
    pub fn stop(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        {
            let mut audio = lock(&inner.audio);
            match audio.state {
                SessionState::Active => audio.state = SessionState::Stopping,
                SessionState::Cancelled => return Err(SessionError::Cancelled),
                _ => return Ok(()),
            }
        }
        log::info!("stopping streaming session");

        // Drain the in-flight decode first so its work is not lost.
        {
            let mut shared = lock(&inner.shared);
            while shared.is_decoding {
                shared = inner
                    .decode_done
                    .wait(shared)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        if inner.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        let model = inner.model.as_ref();
        let mut audio = lock(&inner.audio);

        // Trailing frames from the featurizer residual.
        if let Some(frames) = audio.featurizer.flush() {
            if let Err(err) = audio.encoder.feed(frames.view()) {
                log::error!("encoder failed on flushed frames: {err}");
            }
        }

        if inner.config.finalize_completed_windows {
            let drained = audio.encoder.drain_newly_encoded_windows();
            for features in &drained {
                match decode::run_decode(model, features, &[], &inner.config, &inner.cancel) {
                    Ok(Some(pass)) => {
                        let window_text = detokenize_or_empty(model, &pass.tokens);
                        let confirmed = {
                            let mut shared = lock(&inner.shared);
                            shared.ledger.freeze(&window_text);
                            shared.ledger.completed_text().to_string()
                        };
                        audio.frozen_window_count += 1;
                        inner.events.emit(TranscriptionEvent::Confirmed {
                            text: confirmed.clone(),
                        });
                        inner.events.emit(TranscriptionEvent::DisplayUpdate {
                            confirmed_text: confirmed,
                            provisional_text: String::new(),
                        });
                    }
                    Ok(None) => return Err(SessionError::Cancelled),
                    Err(err) => log::error!("window decode failed during stop: {err}"),
                }
            }
        } else {
            // Freeze windows completed since the last streaming pass.
            let completed = audio.encoder.encoded_window_count();
            if completed > audio.frozen_window_count {
                audio.encoder.drain_newly_encoded_windows();
                let frozen = {
                    let mut shared = lock(&inner.shared);
                    freeze_ledger(model, &mut shared.ledger)
                        .then(|| shared.ledger.completed_text().to_string())
                };
                audio.frozen_window_count = completed;
                if let Some(text) = frozen {
                    inner.events.emit(TranscriptionEvent::Confirmed { text });
                }
            }
        }

        // One last decode over whatever is still pending.
        match audio.encoder.encode_pending() {
            Ok(Some(features)) => {
                let prefix = lock(&inner.shared).ledger.confirmed_tokens().to_vec();
                match decode::run_decode(model, &features, &prefix, &inner.config, &inner.cancel) {
                    Ok(Some(pass)) => {
                        let mut all = prefix;
                        all.extend_from_slice(&pass.tokens);
                        lock(&inner.shared).ledger.set_confirmed(all);
                        let snapshot = StatsSnapshot {
                            encoded_window_count: audio.encoder.encoded_window_count(),
                            total_samples_fed: audio.total_samples_fed,
                        };
                        inner.events.emit(stats_event(inner, snapshot, Some(&pass)));
                    }
                    Ok(None) => return Err(SessionError::Cancelled),
                    Err(err) => {
                        log::error!("final decode failed: {err}");
                        lock(&inner.shared).ledger.promote_all();
                    }
                }
            }
            Ok(None) => lock(&inner.shared).ledger.promote_all(),
            Err(err) => {
                log::error!("final pending encode failed: {err}");
                lock(&inner.shared).ledger.promote_all();
            }
        }

        if inner.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        let full_text = {
            let shared = lock(&inner.shared);
            confirmed_display_text(model, &shared.ledger)
        };
        inner.events.emit(TranscriptionEvent::Ended {
            full_text: full_text.clone(),
        });
        inner.events.close();
        audio.state = SessionState::Ended;
        log::info!("session ended ({} transcript chars)", full_text.len());
        Ok(())
    }

    /// Abort the session. Idempotent; no `Ended` event is emitted and the
    /// event stream closes immediately. An in-flight pass aborts at its
    /// next forward boundary without touching the ledger.
    pub fn cancel(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        log::info!("cancelling streaming session");
        self.inner.cancel.cancel();
        self.inner.events.close();

        let mut audio = lock(&self.inner.audio);
        audio.state = SessionState::Cancelled;
        audio.featurizer.reset();
        audio.encoder.reset();
    }
}

impl<M: SpeechModel> Drop for StreamingSession<M> {
    fn drop(&mut self) {
        self.work_tx.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop<M: SpeechModel>(inner: Arc<SessionInner<M>>, work_rx: Receiver<()>) {
    while work_rx.recv().is_ok() {
        if !inner.cancel.is_cancelled() {
            run_pass(&inner);
        }
        lock(&inner.shared).is_decoding = false;
        inner.decode_done.notify_all();
    }
    log::debug!("decode worker exiting");
}

fn run_pass<M: SpeechModel>(inner: &SessionInner<M>) {
    // An unbound tokenizer turns the whole pass into a no-op.
    if inner.model.detokenize(&[]).is_err() {
        log::warn!("tokenizer unavailable; skipping decode pass");
        return;
    }
    if inner.config.finalize_completed_windows {
        finalize_pass(inner);
    } else {
        streaming_pass(inner);
    }
}

fn streaming_pass<M: SpeechModel>(inner: &SessionInner<M>) {
    let model = inner.model.as_ref();

    // Freeze completed windows, then snapshot what the pass needs, all
    // under the session lock.
    let (pending, prefix, snapshot, freeze_event) = {
        let mut audio = lock(&inner.audio);
        let mut freeze_event = None;

        let completed = audio.encoder.encoded_window_count();
        if completed > audio.frozen_window_count {
            audio.encoder.drain_newly_encoded_windows();
            let mut shared = lock(&inner.shared);
            if freeze_ledger(model, &mut shared.ledger) {
                freeze_event = Some(TranscriptionEvent::Confirmed {
                    text: shared.ledger.completed_text().to_string(),
                });
            }
            audio.frozen_window_count = completed;
        }

        let pending = match audio.encoder.encode_pending() {
            Ok(pending) => pending,
            Err(err) => {
                log::error!("pending-window encode failed: {err}");
                if let Some(event) = freeze_event {
                    inner.events.emit(event);
                }
                return;
            }
        };
        let prefix = lock(&inner.shared).ledger.confirmed_tokens().to_vec();
        let snapshot = StatsSnapshot {
            encoded_window_count: audio.encoder.encoded_window_count(),
            total_samples_fed: audio.total_samples_fed,
        };
        (pending, prefix, snapshot, freeze_event)
    };

    if let Some(event) = freeze_event {
        inner.events.emit(event);
    }
    let Some(pending) = pending else {
        return;
    };

    // The heavy forward passes run outside every lock.
    let pass = match decode::run_decode(model, &pending, &prefix, &inner.config, &inner.cancel) {
        Ok(Some(pass)) => pass,
        Ok(None) => return,
        Err(err) => {
            log::error!("decode pass failed: {err}");
            return;
        }
    };

    let mut all = prefix;
    all.extend_from_slice(&pass.tokens);
    let now = Instant::now();

    let (confirmed_event, display_event) = {
        let mut shared = lock(&inner.shared);
        let promoted = shared
            .ledger
            .merge(&all, now, inner.config.delay_preset.delay());
        let confirmed_text = confirmed_display_text(model, &shared.ledger);
        let provisional_text = detokenize_or_empty(model, shared.ledger.provisional_tokens());
        let confirmed_event = (promoted > 0).then(|| TranscriptionEvent::Confirmed {
            text: confirmed_text.clone(),
        });
        (
            confirmed_event,
            TranscriptionEvent::DisplayUpdate {
                confirmed_text,
                provisional_text,
            },
        )
    };

    if let Some(event) = confirmed_event {
        inner.events.emit(event);
    }
    inner.events.emit(display_event);
    inner.events.emit(stats_event(inner, snapshot, Some(&pass)));
}

fn finalize_pass<M: SpeechModel>(inner: &SessionInner<M>) {
    let model = inner.model.as_ref();

    let (drained, snapshot) = {
        let mut audio = lock(&inner.audio);
        let snapshot = StatsSnapshot {
            encoded_window_count: audio.encoder.encoded_window_count(),
            total_samples_fed: audio.total_samples_fed,
        };
        (audio.encoder.drain_newly_encoded_windows(), snapshot)
    };
    if drained.is_empty() {
        return;
    }

    let mut last_pass: Option<DecodePass> = None;
    for (i, features) in drained.iter().enumerate() {
        if inner.cancel.is_cancelled() {
            return;
        }

        // The first drained window may reuse the text already streamed for
        // it instead of paying for a re-decode.
        let reused = if i == 0 {
            let mut shared = lock(&inner.shared);
            if shared.ledger.has_tokens() {
                match model.detokenize(&shared.ledger.all_tokens()) {
                    Ok(text) => {
                        shared.ledger.clear_tokens();
                        Some(text)
                    }
                    Err(err) => {
                        log::error!("detokenize failed for streamed window text: {err}");
                        None
                    }
                }
            } else {
                None
            }
        } else {
            None
        };

        let window_text = match reused {
            Some(text) => text,
            None => match decode::run_decode(model, features, &[], &inner.config, &inner.cancel) {
                Ok(Some(pass)) => {
                    let text = detokenize_or_empty(model, &pass.tokens);
                    last_pass = Some(pass);
                    text
                }
                Ok(None) => return,
                Err(err) => {
                    log::error!("window decode failed: {err}");
                    return;
                }
            },
        };

        let confirmed = {
            let mut shared = lock(&inner.shared);
            shared.ledger.freeze(&window_text);
            shared.ledger.completed_text().to_string()
        };
        lock(&inner.audio).frozen_window_count += 1;

        inner.events.emit(TranscriptionEvent::Confirmed {
            text: confirmed.clone(),
        });
        inner.events.emit(TranscriptionEvent::DisplayUpdate {
            confirmed_text: confirmed,
            provisional_text: String::new(),
        });
    }

    inner
        .events
        .emit(stats_event(inner, snapshot, last_pass.as_ref()));
}

/// Detokenize `confirmed ++ provisional` into the completed transcript and
/// clear the token state. Returns whether the completed text grew. Bypasses
/// the promotion delay on purpose: boundary freezes are irreversible, so
/// waiting out the delay buys nothing.
fn freeze_ledger<M: SpeechModel>(model: &M, ledger: &mut PromotionLedger) -> bool {
    if !ledger.has_tokens() {
        return false;
    }
    let text = match model.detokenize(&ledger.all_tokens()) {
        Ok(text) => text,
        Err(err) => {
            log::error!("detokenize failed at window freeze: {err}");
            return false;
        }
    };
    ledger.freeze(&text);
    !text.is_empty()
}

fn confirmed_display_text<M: SpeechModel>(model: &M, ledger: &PromotionLedger) -> String {
    text::concat(
        ledger.completed_text(),
        &detokenize_or_empty(model, ledger.confirmed_tokens()),
    )
}

fn detokenize_or_empty<M: SpeechModel>(model: &M, tokens: &[i32]) -> String {
    if tokens.is_empty() {
        return String::new();
    }
    match model.detokenize(tokens) {
        Ok(text) => text,
        Err(err) => {
            log::error!("detokenize failed: {err}");
            String::new()
        }
    }
}

fn stats_event<M: SpeechModel>(
    inner: &SessionInner<M>,
    snapshot: StatsSnapshot,
    pass: Option<&DecodePass>,
) -> TranscriptionEvent {
    let (tokens_per_second, real_time_factor) = match pass {
        Some(pass) if pass.decode_seconds > 0.0 => (
            pass.tokens.len() as f64 / pass.decode_seconds,
            if pass.windowed_seconds > 0.0 {
                pass.decode_seconds / pass.windowed_seconds
            } else {
                0.0
            },
        ),
        _ => (0.0, 0.0),
    };

    TranscriptionEvent::Stats(Stats {
        encoded_window_count: snapshot.encoded_window_count,
        total_audio_seconds: snapshot.total_samples_fed as f64 / SAMPLE_RATE as f64,
        tokens_per_second,
        real_time_factor,
        peak_memory_gb: inner.probe.peak_memory_gb(),
    })
}
