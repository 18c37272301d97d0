//! cpal-backed microphone input.
//!
//! `cpal::Stream` is not `Send`, so each capture session spins up a
//! dedicated audio thread that owns the stream and services commands.
//! Samples are mono-mixed and resampled to [`TARGET_SAMPLE_RATE`] inside
//! the data callback. Stopping replies over a oneshot only after the
//! stream has been torn down and the resampler flushed, so the caller's
//! `stop` future resolving *is* the hardware completion signal — there is
//! no fixed-delay wait racing the final data callback.

use crate::audio_toolkit::device::find_input_device;
use crate::audio_toolkit::resampler::ChunkResampler;
use crate::audio_toolkit::utils::{rms, TARGET_SAMPLE_RATE};
use crate::capture::machine::{AudioInput, AudioInputFactory};
use crate::error::CoreError;
use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tokio::sync::oneshot;

const LEVEL_WINDOW: usize = 1600; // 100 ms at 16 kHz

enum Command {
    Start,
    Stop { reply: oneshot::Sender<Vec<f32>> },
    Close,
}

/// Factory handed to the capture machine; `open` acquires the hardware
/// handle and surfaces permission/device failures as
/// [`CoreError::MicrophoneAccess`].
pub struct CpalInputFactory;

impl AudioInputFactory for CpalInputFactory {
    fn open(&self, device_name: Option<&str>) -> Result<Box<dyn AudioInput>, CoreError> {
        let input = CpalAudioInput::open(device_name)
            .map_err(|e| CoreError::MicrophoneAccess(e.to_string()))?;
        Ok(Box::new(input))
    }
}

pub struct CpalAudioInput {
    commands: mpsc::Sender<Command>,
    thread: Option<std::thread::JoinHandle<()>>,
    buffer: Arc<Mutex<Vec<f32>>>,
    closed: bool,
}

impl CpalAudioInput {
    pub fn open(device_name: Option<&str>) -> Result<Self> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let (commands, command_rx) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        let thread_buffer = buffer.clone();
        let requested_device = device_name.map(|s| s.to_string());
        let thread = std::thread::Builder::new()
            .name("parlo-audio".to_string())
            .spawn(move || {
                audio_thread(requested_device, thread_buffer, command_rx, ready_tx);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                thread: Some(thread),
                buffer,
                closed: false,
            }),
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(anyhow!(message))
            }
            Err(_) => {
                let _ = thread.join();
                Err(anyhow!("audio thread died during setup"))
            }
        }
    }
}

impl AudioInput for CpalAudioInput {
    fn start(&mut self) -> Result<()> {
        self.commands
            .send(Command::Start)
            .map_err(|_| anyhow!("audio thread is gone"))
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<Vec<f32>>> {
        let (reply, rx) = oneshot::channel();
        let send = self.commands.send(Command::Stop { reply });
        async move {
            send.map_err(|_| anyhow!("audio thread is gone"))?;
            rx.await
                .map_err(|_| anyhow!("audio thread exited before delivering samples"))
        }
        .boxed()
    }

    fn level(&self) -> f32 {
        let buffer = self.buffer.lock().unwrap();
        let start = buffer.len().saturating_sub(LEVEL_WINDOW);
        rms(&buffer[start..])
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.commands.send(Command::Close);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!("microphone handle released");
    }
}

impl Drop for CpalAudioInput {
    fn drop(&mut self) {
        // Safety net for callers torn down mid-recording.
        self.close();
    }
}

/// Owns the cpal stream for one capture session.
fn audio_thread(
    device_name: Option<String>,
    buffer: Arc<Mutex<Vec<f32>>>,
    commands: mpsc::Receiver<Command>,
    ready: mpsc::Sender<Result<(), String>>,
) {
    let armed = Arc::new(AtomicBool::new(false));
    let resampler: Arc<Mutex<Option<ChunkResampler>>> = Arc::new(Mutex::new(None));

    let mut stream = match build_stream(
        device_name.as_deref(),
        buffer.clone(),
        armed.clone(),
        resampler.clone(),
    ) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            Some(stream)
        }
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    while let Ok(command) = commands.recv() {
        match command {
            Command::Start => {
                buffer.lock().unwrap().clear();
                armed.store(true, Ordering::SeqCst);
                debug!("recording armed");
            }
            Command::Stop { reply } => {
                armed.store(false, Ordering::SeqCst);
                // Dropping the stream joins the data callback; after this
                // point every sample the hardware delivered is in the
                // buffer.
                stream.take();
                if let Some(resampler) = resampler.lock().unwrap().as_mut() {
                    let mut buf = buffer.lock().unwrap();
                    resampler.finish(|chunk| buf.extend_from_slice(chunk));
                }
                let samples = std::mem::take(&mut *buffer.lock().unwrap());
                debug!("recording stopped with {} samples", samples.len());
                let _ = reply.send(samples);
            }
            Command::Close => {
                stream.take();
                break;
            }
        }
    }
}

fn build_stream(
    device_name: Option<&str>,
    buffer: Arc<Mutex<Vec<f32>>>,
    armed: Arc<AtomicBool>,
    resampler_slot: Arc<Mutex<Option<ChunkResampler>>>,
) -> Result<cpal::Stream> {
    let device =
        find_input_device(device_name).ok_or_else(|| anyhow!("no input device available"))?;
    let supported = device.default_input_config()?;

    if supported.sample_format() != cpal::SampleFormat::F32 {
        return Err(anyhow!(
            "unsupported input sample format: {:?}",
            supported.sample_format()
        ));
    }

    let config = supported.config();
    let channels = config.channels as usize;
    let native_rate = config.sample_rate.0;
    info!(
        "opening input stream: {:?} at {native_rate} Hz, {channels} channel(s)",
        device.name().unwrap_or_else(|_| "<unnamed>".to_string())
    );

    *resampler_slot.lock().unwrap() = Some(ChunkResampler::new(
        native_rate as usize,
        TARGET_SAMPLE_RATE as usize,
    ));

    let mut mono_scratch: Vec<f32> = Vec::new();
    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            if !armed.load(Ordering::SeqCst) {
                return;
            }
            mono_scratch.clear();
            for frame in data.chunks(channels) {
                mono_scratch.push(frame.iter().sum::<f32>() / channels as f32);
            }
            let mut resampler = resampler_slot.lock().unwrap();
            if let Some(resampler) = resampler.as_mut() {
                let mut buf = buffer.lock().unwrap();
                resampler.push(&mono_scratch, |chunk| buf.extend_from_slice(chunk));
            }
        },
        |err| error!("input stream error: {err}"),
        None,
    )?;

    stream.play()?;
    Ok(stream)
}
