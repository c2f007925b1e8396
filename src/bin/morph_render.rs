//! Offline renderer: plays notes through a morph plan and writes a WAV file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use specmorph::engine::exchange::{plan_exchange, VoiceLayout};
use specmorph::engine::frame::{Instrument, InstrumentRepo, PartialSet, Source, SourceMeta, NOISE_BANDS};
use specmorph::engine::messages::EngineMsg;
use specmorph::engine::plan::{OpKind, PlanDesc};
use specmorph::engine::synth::MorphSynth;

#[derive(Parser)]
#[command(name = "morph_render")]
#[command(about = "Spectral morphing synthesizer", long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render notes to a WAV file
    Render {
        /// Output WAV file path
        output: PathBuf,

        /// Plan file (JSON: {"ops": [...], "params": {...}}); built-in demo plan if omitted
        #[arg(short, long)]
        plan: Option<PathBuf>,

        /// Instrument as name=path to a JSON source, repeatable
        #[arg(short, long = "instrument")]
        instruments: Vec<String>,

        /// MIDI notes to play together
        #[arg(short, long, default_values_t = vec![57u8])]
        notes: Vec<u8>,

        #[arg(short, long, default_value = "100")]
        velocity: u8,

        /// Seconds the notes are held
        #[arg(short, long, default_value = "2.0")]
        duration: f32,

        /// Longest release tail in seconds
        #[arg(long, default_value = "3.0")]
        tail: f32,

        #[arg(short, long, default_value = "48000")]
        sample_rate: u32,

        #[arg(long, default_value = "8")]
        voices: usize,

        #[arg(short, long, default_value = "512")]
        block_size: usize,
    },

    /// Play notes on the default output device
    #[cfg(feature = "device")]
    Play {
        #[arg(short, long)]
        plan: Option<PathBuf>,

        #[arg(short, long = "instrument")]
        instruments: Vec<String>,

        #[arg(short, long, default_values_t = vec![57u8])]
        notes: Vec<u8>,

        #[arg(short, long, default_value = "3.0")]
        duration: f32,
    },
}

fn harmonic_source(partials: usize, odd_only: bool, noise: f32) -> Source {
    let meta = SourceMeta { fundamental_freq: 440.0, frame_step_ms: 1.0, ..SourceMeta::default() };
    let mut frame = PartialSet::with_capacity(partials);
    let mut k = 1;
    while frame.len() < partials {
        if !odd_only || k % 2 == 1 {
            frame.push(k as f32, 0.3 / k as f32, 0.0);
        }
        k += 1;
    }
    frame.noise = vec![noise; NOISE_BANDS];
    Source::new(meta, vec![frame; 4000])
}

fn demo_repo() -> InstrumentRepo {
    let mut repo = InstrumentRepo::new();
    repo.insert(Instrument::single("saw", harmonic_source(40, false, 0.0)));
    repo.insert(Instrument::single("square", harmonic_source(20, true, 0.002)));
    repo
}

fn demo_plan() -> PlanDesc {
    let mut d = PlanDesc::new();
    d.add_op("wobble", OpKind::Lfo).add_op("morph", OpKind::Linear).add_op("out", OpKind::Output);
    d.params.set_f32("wobble/frequency", 0.5);
    d.params.set_str("morph/left", "instrument:saw");
    d.params.set_str("morph/right", "instrument:square");
    d.params.set_str("morph/morphing/control", "op:wobble");
    d.params.set_str("out/source", "op:morph");
    d.params.set_bool("out/adsr", true);
    d.params.set_f32("out/adsr/skip", 0.0);
    d.params.set_bool("out/filter", true);
    d.params.set_f32("out/filter/cutoff", 2000.0);
    d
}

fn load_inputs(plan: Option<&Path>, instruments: &[String]) -> Result<(PlanDesc, InstrumentRepo)> {
    let mut repo = if instruments.is_empty() { demo_repo() } else { InstrumentRepo::new() };
    for arg in instruments {
        let Some((name, path)) = arg.split_once('=') else {
            bail!("instrument must be given as name=path, got '{}'", arg);
        };
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        let source: Source = serde_json::from_str(&text).with_context(|| format!("parsing source {}", path))?;
        log::info!("loaded instrument {} ({} frames)", name, source.len());
        repo.insert(Instrument::single(name, source));
    }
    let desc = match plan {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<PlanDesc>(&text).with_context(|| format!("parsing plan {}", path.display()))?
        }
        None => demo_plan(),
    };
    Ok((desc, repo))
}

#[allow(clippy::too_many_arguments)]
fn render(
    output: &Path,
    plan: Option<&Path>,
    instruments: &[String],
    notes: &[u8],
    velocity: u8,
    duration: f32,
    tail: f32,
    sample_rate: u32,
    voices: usize,
    block_size: usize,
) -> Result<()> {
    let (desc, repo) = load_inputs(plan, instruments)?;
    let layout = VoiceLayout { voices: voices.max(1), mix_freq: sample_rate as f32, seed: 0x5eed };
    let (_publisher, receiver) = plan_exchange(&desc, repo, layout).context("building plan")?;
    let mut synth = MorphSynth::new(receiver);

    let block = block_size.clamp(16, 8192);
    let hold = (duration.max(0.0) * sample_rate as f32) as usize;
    let max_len = hold + (tail.max(0.0) * sample_rate as f32) as usize;
    let mut samples = Vec::with_capacity(max_len);
    let mut buf = vec![0.0f32; block];

    for &note in notes {
        synth.add_event(0, EngineMsg::NoteOn { channel: 0, note, velocity });
    }
    let mut pos = 0;
    while pos < max_len {
        if pos <= hold && hold < pos + block {
            for &note in notes {
                synth.add_event(hold - pos, EngineMsg::NoteOff { channel: 0, note });
            }
        }
        synth.process(&mut buf);
        samples.extend_from_slice(&buf);
        pos += block;
        if pos > hold && synth.active_voice_count() == 0 {
            break;
        }
    }

    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    log::info!("rendered {:.2} s, peak {:.3}", samples.len() as f32 / sample_rate as f32, peak);

    let spec = hound::WavSpec { channels: 1, sample_rate, bits_per_sample: 32, sample_format: hound::SampleFormat::Float };
    let mut writer = hound::WavWriter::create(output, spec).with_context(|| format!("creating {}", output.display()))?;
    for s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    log::info!("wrote {}", output.display());
    Ok(())
}

#[cfg(feature = "device")]
fn play(plan: Option<&Path>, instruments: &[String], notes: &[u8], duration: f32) -> Result<()> {
    use specmorph::engine::audio::AudioEngine;

    let (desc, repo) = load_inputs(plan, instruments)?;
    let mut engine = AudioEngine::open()?;
    let layout = VoiceLayout { voices: 8, mix_freq: engine.sr, seed: 0x5eed };
    let (mut publisher, receiver) = plan_exchange(&desc, repo, layout)?;
    engine.start(receiver)?;
    let tx = engine.sender();
    for &note in notes {
        tx.send(EngineMsg::NoteOn { channel: 0, note, velocity: 100 })?;
    }
    std::thread::sleep(std::time::Duration::from_secs_f32(duration.max(0.0)));
    for &note in notes {
        tx.send(EngineMsg::NoteOff { channel: 0, note })?;
    }
    std::thread::sleep(std::time::Duration::from_secs(2));
    publisher.collect();
    engine.stop();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    simple_logger::SimpleLogger::new().with_level(cli.log_level).init()?;

    match cli.command {
        Commands::Render { output, plan, instruments, notes, velocity, duration, tail, sample_rate, voices, block_size } => {
            render(&output, plan.as_deref(), &instruments, &notes, velocity, duration, tail, sample_rate, voices, block_size)
        }
        #[cfg(feature = "device")]
        Commands::Play { plan, instruments, notes, duration } => play(plan.as_deref(), &instruments, &notes, duration),
    }
}
