//! Voice pool behavior across blocks: releases, plan updates and broken plans.

mod common;

use common::{amplitude_at, rms, single_partial, MIX_FREQ};
use specmorph::engine::exchange::{plan_exchange, PlanPublisher, UpdateKind, VoiceLayout};
use specmorph::engine::frame::{Instrument, InstrumentRepo};
use specmorph::engine::messages::EngineMsg;
use specmorph::engine::plan::{OpKind, PlanDesc};
use specmorph::engine::synth::MorphSynth;

const BLOCK: usize = 480;

fn repo() -> InstrumentRepo {
    let mut repo = InstrumentRepo::new();
    repo.insert(Instrument::single("tone", single_partial(0.5, 10_000)));
    repo
}

fn tone_plan() -> PlanDesc {
    let mut d = PlanDesc::new();
    d.add_op("src", OpKind::Source).add_op("out", OpKind::Output);
    d.params.set_str("src/instrument", "tone");
    d.params.set_str("out/source", "op:src");
    d.params.set_bool("out/noise", false);
    d
}

fn start(desc: &PlanDesc, voices: usize) -> (PlanPublisher, MorphSynth) {
    let layout = VoiceLayout { voices, mix_freq: MIX_FREQ, seed: 11 };
    let (publisher, receiver) = plan_exchange(desc, repo(), layout).unwrap();
    (publisher, MorphSynth::new(receiver))
}

#[test]
fn release_ends_with_the_envelope() {
    let mut d = tone_plan();
    d.params.set_bool("out/adsr", true);
    d.params.set_f32("out/adsr/skip", 0.0);
    d.params.set_f32("out/adsr/attack", 1.0);
    d.params.set_f32("out/adsr/decay", 1.0);
    d.params.set_f32("out/adsr/sustain", 80.0);
    // 200 ms of a 1000 ms envelope
    d.params.set_f32("out/adsr/release", 20.0);
    let (_publisher, mut synth) = start(&d, 2);

    let mut block = vec![0.0; BLOCK];
    synth.add_event(0, EngineMsg::NoteOn { channel: 0, note: 69, velocity: 127 });
    for _ in 0..10 {
        synth.process(&mut block);
    }
    assert!(rms(&block) > 0.1);

    synth.add_event(0, EngineMsg::NoteOff { channel: 0, note: 69 });
    let mut blocks = 0;
    let mut last_level = f32::MAX;
    while synth.active_voice_count() > 0 {
        synth.process(&mut block);
        blocks += 1;
        let level = rms(&block);
        assert!(level <= last_level + 1e-3, "release got louder after {} blocks", blocks);
        last_level = level;
        assert!(blocks <= 22, "voice still active after {} blocks", blocks);
    }
    // 20 blocks of release, then the voice is freed on the next render
    assert!(blocks >= 20, "voice freed after only {} blocks", blocks);
    assert!(last_level < 1e-3);
}

fn cyclic_plan(len: usize) -> PlanDesc {
    let mut d = PlanDesc::new();
    for k in 0..len {
        d.add_op(format!("m{}", k), OpKind::Linear);
    }
    d.add_op("out", OpKind::Output);
    for k in 0..len {
        d.params.set_str(format!("m{}/left", k), format!("op:m{}", (k + 1) % len));
        d.params.set_str(format!("m{}/right", k), "instrument:tone");
    }
    d.params.set_str("out/source", "op:m0");
    d
}

#[test]
fn cyclic_plans_render_silence() {
    for len in [2, 3] {
        let (publisher, mut synth) = start(&cyclic_plan(len), 2);
        assert!(publisher.current().has_cycle);
        let mut block = vec![1.0; BLOCK];
        synth.add_event(0, EngineMsg::NoteOn { channel: 0, note: 60, velocity: 100 });
        for _ in 0..4 {
            synth.process(&mut block);
            assert!(block.iter().all(|&v| v == 0.0), "{}-cycle produced sound", len);
        }
        assert_eq!(synth.active_voice_count(), 0);
    }
}

#[test]
fn cheap_update_keeps_voices_playing() {
    let (mut publisher, mut synth) = start(&tone_plan(), 2);
    let mut block = vec![0.0; BLOCK];
    synth.add_event(0, EngineMsg::NoteOn { channel: 0, note: 69, velocity: 127 });
    synth.process(&mut block);
    synth.process(&mut block);
    assert!(rms(&block) > 0.1);

    let mut d = tone_plan();
    d.params.set_bool("out/sines", false);
    assert_eq!(publisher.publish(&d).unwrap(), UpdateKind::Cheap);
    synth.process(&mut block);
    assert_eq!(synth.active_voice_count(), 1);
    assert!(block.iter().all(|&v| v == 0.0));

    assert_eq!(publisher.publish(&tone_plan()).unwrap(), UpdateKind::Cheap);
    synth.process(&mut block);
    assert!(rms(&block) > 0.1);
}

#[test]
fn full_update_cuts_voices() {
    let (mut publisher, mut synth) = start(&tone_plan(), 2);
    let mut block = vec![0.0; BLOCK];
    synth.add_event(0, EngineMsg::NoteOn { channel: 0, note: 69, velocity: 100 });
    synth.process(&mut block);
    assert_eq!(synth.active_voice_count(), 1);

    let mut d = tone_plan();
    d.add_op("wobble", OpKind::Lfo);
    assert_eq!(publisher.publish(&d).unwrap(), UpdateKind::Full);
    synth.process(&mut block);
    assert_eq!(synth.active_voice_count(), 0);
    assert!(block.iter().all(|&v| v == 0.0));
    // the replaced snapshot and graphs come back for dropping
    assert_eq!(publisher.collect(), 2);

    synth.add_event(0, EngineMsg::NoteOn { channel: 0, note: 69, velocity: 100 });
    synth.process(&mut block);
    synth.process(&mut block);
    assert!(rms(&block) > 0.1);
}

#[test]
fn pitch_bend_follows_range() {
    let mut d = tone_plan();
    d.params.set_i32("out/pitch_bend_range", 12);
    let (_publisher, mut synth) = start(&d, 1);
    // 2400 samples hold whole periods of 440 and 880 Hz
    let mut block = vec![0.0; 2400];
    synth.add_event(0, EngineMsg::NoteOn { channel: 0, note: 69, velocity: 127 });
    synth.process(&mut block);
    synth.process(&mut block);
    assert!((amplitude_at(&block, 440.0, MIX_FREQ) - 0.5).abs() < 0.01);

    synth.add_event(0, EngineMsg::PitchBend { channel: 0, value: 1.0 });
    synth.process(&mut block);
    synth.process(&mut block);
    assert!((amplitude_at(&block, 880.0, MIX_FREQ) - 0.5).abs() < 0.01);
    assert!(amplitude_at(&block, 440.0, MIX_FREQ) < 0.01);
}
