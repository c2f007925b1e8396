use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use super::error::{EngineError, EngineResult};
use super::exchange::PlanReceiver;
use super::messages::EngineMsg;
use super::synth::MorphSynth;

// events taken per callback, the rest waits for the next one
const MAX_DRAIN: usize = 24;
const MAX_CALLBACK_FRAMES: usize = 8192;

fn device_error(e: impl std::fmt::Display) -> EngineError { EngineError::Device(e.to_string()) }

fn pick_config(device: &cpal::Device) -> EngineResult<cpal::SupportedStreamConfig> {
  if let Ok(supported) = device.supported_output_configs() {
    let ranges: Vec<_> = supported.filter(|r| r.sample_format() == cpal::SampleFormat::F32).collect();
    // prefer 48 kHz, then 44.1 kHz, stereo first
    for sr in [48_000u32, 44_100] {
      for channels in [2u16, 1] {
        if let Some(r) = ranges.iter().find(|r| r.channels() == channels && r.min_sample_rate().0 <= sr && r.max_sample_rate().0 >= sr) {
          return Ok(r.clone().with_sample_rate(cpal::SampleRate(sr)));
        }
      }
    }
    if let Some(r) = ranges.into_iter().next() {
      return Ok(r.with_max_sample_rate());
    }
  }
  device.default_output_config().map_err(device_error)
}

/// Plays a [`MorphSynth`] on the default output device.
pub struct AudioEngine {
  tx: Sender<EngineMsg>,
  rx: Receiver<EngineMsg>,
  pub sr: f32,
  device: cpal::Device,
  config: cpal::SupportedStreamConfig,
  stream: Option<cpal::Stream>,
}

impl AudioEngine {
  /// Pick the device and its rate. Build the plan exchange with [`Self::sr`]
  /// before calling [`Self::start`].
  pub fn open() -> EngineResult<Self> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or_else(|| EngineError::Device("no output device".into()))?;
    let config = pick_config(&device)?;
    let sr = config.sample_rate().0 as f32;
    log::info!("output device {:?} at {} Hz, {} channels", device.name().ok(), sr, config.channels());
    let (tx, rx) = unbounded();
    Ok(Self { tx, rx, sr, device, config, stream: None })
  }

  pub fn sender(&self) -> Sender<EngineMsg> { self.tx.clone() }

  pub fn start(&mut self, receiver: PlanReceiver) -> EngineResult<()> {
    if self.stream.is_some() { return Ok(()); }
    let mut cfg: cpal::StreamConfig = self.config.clone().into();
    cfg.buffer_size = cpal::BufferSize::Fixed(1024);
    let channels = cfg.channels.max(1) as usize;

    let rx = self.rx.clone();
    let mut synth = MorphSynth::new(receiver);
    let mut mono = vec![0.0f32; MAX_CALLBACK_FRAMES];
    let err_fn = |e: cpal::StreamError| log::error!("stream error: {}", e);

    let stream = self.device.build_output_stream(&cfg, move |data: &mut [f32], _| {
      for _ in 0..MAX_DRAIN {
        match rx.try_recv() {
          Ok(msg) => { synth.add_event(0, msg); }
          Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
      }
      for block in data.chunks_mut(MAX_CALLBACK_FRAMES * channels) {
        let frames = block.len() / channels;
        let buf = &mut mono[..frames];
        synth.process(buf);
        for (frame, &s) in block.chunks_mut(channels).zip(buf.iter()) {
          frame.fill(s);
        }
      }
    }, err_fn, None).map_err(device_error)?;
    stream.play().map_err(device_error)?;
    self.stream = Some(stream);
    Ok(())
  }

  pub fn stop(&mut self) {
    self.stream.take();
  }
}

// Not Clone; the synth moves into the audio callback.
