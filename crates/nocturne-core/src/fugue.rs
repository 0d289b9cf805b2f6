//! Contrapuntal fugue generation and playback.
//!
//! When the sequencer runs in fugue mode it swaps its gate chain for a
//! pre-rendered multi-voice score:
//!
//! - [`FugueNote`] / [`Phrase`] / [`Score`] - the score representation
//! - [`transpose`], [`invert`], [`retrograde`], [`time_scale`],
//!   [`shift_time`], [`slice_by_time`] - pure phrase transforms
//! - [`FugueEngine`] - renders a complete fugue from a seed and the
//!   current scale
//! - [`FuguePlayback`] - streams a rendered score out step by step,
//!   clock-driven so BPM changes apply immediately
//!
//! Rendering is deterministic: the same seed against the same scale
//! and parameters produces an identical score.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use crate::scale::ScaleMapper;

/// One note or rest, measured in quarter-note time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FugueNote {
    /// None denotes a rest.
    pub pitch: Option<i32>,
    /// Duration in quarter notes.
    pub duration: f64,
    /// Ignored for rests.
    pub velocity: u8,
}

impl FugueNote {
    pub fn note(pitch: i32, duration: f64, velocity: u8) -> Self {
        Self {
            pitch: Some(pitch),
            duration,
            velocity,
        }
    }

    pub fn rest(duration: f64) -> Self {
        Self {
            pitch: None,
            duration,
            velocity: 0,
        }
    }

    pub fn is_rest(&self) -> bool {
        self.pitch.is_none()
    }
}

/// An ordered sequence of notes and rests.
pub type Phrase = Vec<FugueNote>;

/// One phrase per voice, voice 0 first.
pub type Score = Vec<Phrase>;

/// Total duration of a phrase in quarter notes.
pub fn phrase_duration(phrase: &[FugueNote]) -> f64 {
    phrase.iter().map(|n| n.duration).sum()
}

/// Add `semitones` to every pitch; rests pass through unchanged.
pub fn transpose(phrase: &[FugueNote], semitones: i32) -> Phrase {
    phrase
        .iter()
        .map(|n| FugueNote {
            pitch: n.pitch.map(|p| p + semitones),
            ..*n
        })
        .collect()
}

/// Mirror every pitch around `axis_pitch`; rests pass through.
pub fn invert(phrase: &[FugueNote], axis_pitch: i32) -> Phrase {
    phrase
        .iter()
        .map(|n| FugueNote {
            pitch: n.pitch.map(|p| 2 * axis_pitch - p),
            ..*n
        })
        .collect()
}

/// Reverse the phrase in time.
pub fn retrograde(phrase: &[FugueNote]) -> Phrase {
    phrase.iter().rev().copied().collect()
}

/// Multiply every duration by `factor` (> 0).
pub fn time_scale(phrase: &[FugueNote], factor: f64) -> Phrase {
    phrase
        .iter()
        .map(|n| FugueNote {
            duration: n.duration * factor,
            ..*n
        })
        .collect()
}

/// Delay a phrase on a shared timeline by prepending a rest.
pub fn shift_time(phrase: &[FugueNote], offset_quarters: f64) -> Phrase {
    if offset_quarters <= 0.0 {
        return phrase.to_vec();
    }
    let mut shifted = Vec::with_capacity(phrase.len() + 1);
    shifted.push(FugueNote::rest(offset_quarters));
    shifted.extend_from_slice(phrase);
    shifted
}

/// Extract the sub-phrase covering `[t0, t1)`, clipping notes at the
/// boundaries and preserving rests.
pub fn slice_by_time(phrase: &[FugueNote], t0: f64, t1: f64) -> Phrase {
    let mut result = Vec::new();
    let mut time = 0.0;
    for note in phrase {
        let start = time;
        let end = time + note.duration;
        if start < t1 && end > t0 {
            let clipped = t1.min(end) - t0.max(start);
            if clipped > 1e-9 {
                result.push(FugueNote {
                    duration: clipped,
                    ..*note
                });
            }
        }
        time = end;
    }
    result
}

/// Parameters for one fugue rendering.
#[derive(Clone, Debug)]
pub struct FugueParams {
    pub n_voices: usize,
    /// Tonic MIDI pitch.
    pub key_root: i32,
    /// Overlap fraction of successive entries, 0..1.
    pub stretto_overlap: f64,
    pub use_tonal_answer: bool,
    pub allow_inversion: bool,
    pub allow_retrograde: bool,
    /// Per-voice pitch ranges relative to the tonic.
    pub voice_ranges: Vec<(i32, i32)>,
    // Counterpoint weights; negative rewards.
    pub w_parallel: f64,
    pub w_direct: f64,
    pub w_dissonance: f64,
    pub w_cross: f64,
    pub w_smooth: f64,
}

impl Default for FugueParams {
    fn default() -> Self {
        Self {
            n_voices: 3,
            key_root: 60,
            stretto_overlap: 0.0,
            use_tonal_answer: true,
            allow_inversion: false,
            allow_retrograde: false,
            voice_ranges: vec![(-5, 24), (-12, 19), (-24, 12), (-29, 7)],
            w_parallel: 5.0,
            w_direct: 2.5,
            w_dissonance: 3.0,
            w_cross: 1.0,
            w_smooth: -1.0,
        }
    }
}

impl FugueParams {
    /// Map the global density parameter onto stretto overlap.
    pub fn stretto_from_density(density: f64) -> f64 {
        (density - 0.3).clamp(0.0, 0.8)
    }
}

/// A planned subject or answer statement in the exposition.
#[derive(Clone, Debug)]
struct Entry {
    voice_index: usize,
    /// Quarter-note time of the entry.
    start_time: f64,
    material: Phrase,
}

/// Construction cap; playback additionally enforces the wall-clock cap.
const MAX_SCORE_QUARTERS: f64 = 240.0;

/// Renders complete fugues.
pub struct FugueEngine {
    seed: u64,
}

impl FugueEngine {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    /// Generate a one-bar (4 quarter-note) subject in the current
    /// scale: mostly stepwise motion with a leap or two, a distinctive
    /// rhythm, a cadential close, and occasional breathing rests.
    pub fn generate_subject(&self, mapper: &ScaleMapper, rng: &mut StdRng) -> Phrase {
        const TOTAL: f64 = 4.0;

        let rhythm_patterns: [&[f64]; 6] = [
            &[0.5, 0.5, 1.0, 2.0],
            &[1.0, 0.5, 0.5, 2.0],
            &[0.25, 0.25, 0.5, 1.0, 2.0],
            &[1.0, 1.0, 1.0, 1.0],
            &[0.5, 0.25, 0.25, 1.0, 2.0],
            &[1.0, 0.5, 0.5, 1.0, 1.0],
        ];
        let rest_patterns: [&[bool]; 6] = [
            &[false, false, true, false],
            &[false, true, false, false],
            &[true, false, false, false],
            &[false, false, false, true],
            &[false, true, false, true],
            &[false, false, true, false, false],
        ];

        let mut durations: Vec<f64> =
            rhythm_patterns[rng.gen_range(0..rhythm_patterns.len())].to_vec();
        let sum: f64 = durations.iter().sum();
        if (sum - TOTAL).abs() > 1e-9 {
            let factor = TOTAL / sum;
            for d in &mut durations {
                *d *= factor;
            }
        }

        let mut rests = if rng.gen_bool(0.3) {
            let mut pattern = rest_patterns[rng.gen_range(0..rest_patterns.len())].to_vec();
            pattern.resize(durations.len(), false);
            pattern
        } else {
            vec![false; durations.len()]
        };
        // The cadential final beat always sounds.
        if let Some(last) = rests.last_mut() {
            *last = false;
        }

        let mut degree: i32 = if rng.gen_bool(0.5) { 0 } else { 4 };
        let mut recent: Vec<i32> = Vec::new();
        let mut notes = Phrase::with_capacity(durations.len());
        let last_index = durations.len() - 1;

        for (i, (&duration, &is_rest)) in durations.iter().zip(rests.iter()).enumerate() {
            if is_rest {
                notes.push(FugueNote::rest(duration));
                continue;
            }

            if i == last_index {
                // Cadential gesture: close on the tonic (or dominant
                // when the line sits high).
                degree = if degree > 5 { 4 } else { 0 };
            }

            notes.push(FugueNote::note(mapper.note_at(degree, 0) as i32, duration, 96));

            let roll: f64 = rng.gen();
            let mut interval = if roll < 0.6 {
                if rng.gen_bool(0.5) { 1 } else { -1 }
            } else if roll < 0.9 {
                [-3, -2, 2, 3][rng.gen_range(0..4)]
            } else {
                [-5, -4, 4, 5][rng.gen_range(0..4)]
            };
            // No three leaps in the same direction in a row.
            if recent.len() >= 2 {
                let tail = &recent[recent.len() - 2..];
                if tail.iter().all(|d| *d > 0) && interval > 0
                    || tail.iter().all(|d| *d < 0) && interval < 0
                {
                    interval = -interval;
                }
            }
            recent.push(interval);
            degree = (degree + interval).clamp(-7, 14);
        }

        notes
    }

    /// Tonal answer: the subject on the dominant, with an opening
    /// tonic-to-dominant leap (+7) corrected to +5 to keep the answer
    /// in the tonic region.
    pub fn tonal_answer(&self, subject: &[FugueNote]) -> Phrase {
        let mut answer = transpose(subject, 7);

        let sounding: Vec<usize> = subject
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.is_rest())
            .map(|(i, _)| i)
            .collect();
        if sounding.len() >= 2 {
            let first = subject[sounding[0]].pitch.unwrap();
            let second = subject[sounding[1]].pitch.unwrap();
            if second - first == 7 {
                let answer_first = answer[sounding[0]].pitch.unwrap();
                answer[sounding[1]].pitch = Some(answer_first + 5);
            }
        }
        answer
    }

    /// Real answer: exact transposition to the dominant.
    pub fn real_answer(&self, subject: &[FugueNote]) -> Phrase {
        transpose(subject, 7)
    }

    /// Exposition plan: voice v enters at `v * gap` with the subject
    /// (even voices) or the answer (odd voices).
    fn make_entry_plan(&self, subject: &[FugueNote], params: &FugueParams) -> Vec<Entry> {
        let subject_len = phrase_duration(subject);
        let gap = subject_len * (1.0 - params.stretto_overlap.clamp(0.0, 1.0));

        (0..params.n_voices)
            .map(|v| Entry {
                voice_index: v,
                start_time: v as f64 * gap,
                material: if v % 2 == 0 {
                    subject.to_vec()
                } else if params.use_tonal_answer {
                    self.tonal_answer(subject)
                } else {
                    self.real_answer(subject)
                },
            })
            .collect()
    }

    /// An episode: a two-quarter subject fragment sequenced through
    /// fifth-related keys, with breathing rests and connecting steps.
    pub fn generate_episode(
        &self,
        subject: &[FugueNote],
        length_quarters: f64,
        rng: &mut StdRng,
    ) -> Phrase {
        if subject.is_empty() {
            return Phrase::new();
        }

        let subject_len = phrase_duration(subject);
        let candidates = [
            slice_by_time(subject, 0.0, 2.0f64.min(subject_len / 2.0)),
            slice_by_time(
                subject,
                subject_len / 3.0,
                (subject_len / 3.0 + 2.0).min(subject_len),
            ),
            slice_by_time(subject, (subject_len - 2.0).max(0.0), subject_len),
        ];
        let variety = |fragment: &Phrase| {
            let mut pitches: Vec<i32> = fragment.iter().filter_map(|n| n.pitch).collect();
            pitches.sort_unstable();
            pitches.dedup();
            pitches.len()
        };
        let fragment = candidates
            .iter()
            .max_by_key(|f| variety(f))
            .cloned()
            .unwrap_or_else(|| subject[..subject.len().min(2)].to_vec());

        // Circle-of-fifths flavored sequence.
        let sequence = [0, -3, 2, 7, 0, -5, 2];
        let mut episode = Phrase::new();
        let mut time = 0.0;

        for (i, &shift) in sequence.iter().enumerate() {
            if time >= length_quarters {
                break;
            }
            let mut stated = transpose(&fragment, shift);
            if i % 3 == 1 {
                stated = time_scale(&stated, 0.75);
            } else if i % 4 == 3 {
                stated = time_scale(&stated, 1.25);
            }
            time += phrase_duration(&stated);
            episode.extend(stated);

            let last = i == sequence.len() - 1;
            if !last && time < length_quarters - 0.5 {
                if rng.gen_bool(0.25) {
                    episode.push(FugueNote::rest(0.25));
                    time += 0.25;
                } else if let Some(anchor) = episode.iter().rev().find_map(|n| n.pitch) {
                    let step = [-2, -1, 1, 2][rng.gen_range(0..4)];
                    episode.push(FugueNote::note(anchor + step, 0.25, 70));
                    time += 0.25;
                }
            }
        }

        // Pre-cadential pause.
        if rng.gen_bool(0.3) {
            episode.push(FugueNote::rest(0.5));
        }
        episode
    }

    /// A countersubject with complementary rhythm: active against a
    /// sustained subject, sustained against an active one, with rests
    /// where the subject speaks.
    pub fn generate_countersubject(
        &self,
        subject: &[FugueNote],
        mapper: &ScaleMapper,
        rng: &mut StdRng,
    ) -> Phrase {
        if subject.is_empty() {
            return Phrase::new();
        }

        let subject_len = phrase_duration(subject);
        let sounding: Vec<&FugueNote> = subject.iter().filter(|n| !n.is_rest()).collect();
        let avg = sounding
            .iter()
            .map(|n| n.duration)
            .sum::<f64>()
            / sounding.len().max(1) as f64;

        let (mut rhythms, rest_slots): (Vec<f64>, Vec<bool>) = if avg > 0.75 {
            (
                vec![0.5, 0.5, 0.25, 0.25, 0.5, 1.0],
                vec![false, true, false, false, false, true],
            )
        } else {
            (vec![1.0, 1.0, 2.0], vec![false, true, false])
        };
        let total: f64 = rhythms.iter().sum();
        if total > subject_len {
            let factor = subject_len / total;
            for d in &mut rhythms {
                *d *= factor;
            }
        }

        let mut phrase = Phrase::new();
        let mut degree: i32 = 2;
        let mut time = 0.0;
        for (duration, is_rest) in rhythms.into_iter().zip(rest_slots) {
            if time >= subject_len {
                break;
            }
            if is_rest || rng.gen_bool(0.15) {
                phrase.push(FugueNote::rest(duration));
            } else {
                phrase.push(FugueNote::note(mapper.note_at(degree, 0) as i32, duration, 80));
                degree = (degree + [-2, -1, 1, 2][rng.gen_range(0..4)]).clamp(-5, 10);
            }
            time += duration;
        }
        phrase
    }

    /// The closing development: a multi-voice episode built from two
    /// subject fragments. The upper voice alternates the fragments
    /// through fifth-related keys, the middle voice answers with
    /// inversions after a one-quarter rest, and the lower voice moves
    /// in augmentation after half a bar, with rests spacing the slower
    /// material.
    pub fn generate_complex_episode(
        &self,
        subject: &[FugueNote],
        length_quarters: f64,
        rng: &mut StdRng,
    ) -> Vec<Phrase> {
        if subject.is_empty() {
            return Vec::new();
        }

        let subject_len = phrase_duration(subject);
        let fragment1 = slice_by_time(subject, 0.0, 2.0f64.min(subject_len / 2.0));
        let fragment2 = slice_by_time(subject, subject_len / 2.0, subject_len);
        if fragment1.is_empty() {
            return Vec::new();
        }

        // I-V-ii-IV-I flavored sequence.
        let key_sequence = [0, 7, 2, -5, 0];

        let mut upper = Phrase::new();
        let mut time = 0.0;
        for (i, &shift) in key_sequence.iter().enumerate() {
            if time >= length_quarters {
                break;
            }
            if i > 0 && rng.gen_bool(0.2) {
                upper.push(FugueNote::rest(0.5));
                time += 0.5;
            }
            let fragment = if i % 2 == 0 { &fragment1 } else { &fragment2 };
            let stated = transpose(fragment, shift);
            time += phrase_duration(&stated);
            upper.extend(stated);
        }
        let mut parts = vec![upper];

        let mut middle = Phrase::new();
        middle.push(FugueNote::rest(1.0));
        if let Some(axis) = fragment1.iter().find_map(|n| n.pitch) {
            let mut time = 1.0;
            for (i, &shift) in key_sequence[1..].iter().enumerate() {
                if time >= length_quarters {
                    break;
                }
                if i > 0 && rng.gen_bool(0.15) {
                    middle.push(FugueNote::rest(0.25));
                    time += 0.25;
                }
                let fragment = if i % 2 == 0 { &fragment2 } else { &fragment1 };
                let stated = transpose(&invert(fragment, axis), shift);
                time += phrase_duration(&stated);
                middle.extend(stated);
            }
        }
        parts.push(middle);

        let mut lower = Phrase::new();
        lower.push(FugueNote::rest(2.0));
        let augmented = time_scale(&fragment1, 2.0);
        for (i, &shift) in [0, 7, -5].iter().enumerate() {
            if phrase_duration(&lower) >= length_quarters {
                break;
            }
            if i > 0 && rng.gen_bool(0.3) {
                lower.push(FugueNote::rest(1.0));
            }
            lower.extend(transpose(&augmented, shift));
        }
        parts.push(lower);

        log::debug!(
            "complex_episode voices={} rests={}",
            parts.len(),
            parts
                .iter()
                .flatten()
                .filter(|n| n.is_rest())
                .count()
        );
        parts
    }

    /// A closing dominant-to-tonic gesture, sometimes with a breath
    /// before the resolution.
    pub fn generate_cadence(&self, mapper: &ScaleMapper, rng: &mut StdRng) -> Phrase {
        let mut cadence = Phrase::new();
        if rng.gen_bool(0.2) {
            cadence.push(FugueNote::rest(0.5));
        }
        cadence.push(FugueNote::note(mapper.note_at(4, 0) as i32, 1.0, 90));
        if rng.gen_bool(0.3) {
            cadence.push(FugueNote::rest(0.25));
        }
        cadence.push(FugueNote::note(mapper.note_at(0, 0) as i32, 2.0, 96));
        cadence
    }

    /// Overlapping subject/answer entries for the stretto section.
    fn stretto_entries(
        &self,
        subject: &[FugueNote],
        params: &FugueParams,
        rng: &mut StdRng,
    ) -> Vec<Entry> {
        let subject_len = phrase_duration(subject);
        let stride = subject_len * (1.0 - params.stretto_overlap);
        let mut entries = Vec::new();

        for i in 0..params.n_voices.min(4) {
            let mut material = if i % 2 == 0 {
                subject.to_vec()
            } else if params.use_tonal_answer {
                self.tonal_answer(subject)
            } else {
                self.real_answer(subject)
            };
            if i >= 2 {
                if params.allow_inversion && rng.gen_bool(0.4) {
                    if let Some(axis) = subject.iter().find_map(|n| n.pitch) {
                        material = invert(&material, axis);
                    }
                } else if rng.gen_bool(0.3) {
                    material = transpose(&material, if rng.gen_bool(0.5) { 12 } else { -12 });
                }
            }
            entries.push(Entry {
                voice_index: i % params.n_voices,
                start_time: i as f64 * stride,
                material,
            });
        }
        entries
    }

    /// Single-voice rendering: the subject developed into a flowing
    /// monophonic line with variations and a cadence.
    fn render_monophonic(
        &self,
        subject: &[FugueNote],
        mapper: &ScaleMapper,
        params: &FugueParams,
        rng: &mut StdRng,
    ) -> Score {
        let subject_len = phrase_duration(subject);
        let cap = MAX_SCORE_QUARTERS / 2.0;
        let mut voice = subject.to_vec();
        let mut time = subject_len;

        let mut variations: Vec<Phrase> = vec![
            transpose(subject, 7),
            transpose(subject, -5),
            transpose(subject, 2),
        ];
        if params.allow_inversion {
            if let Some(axis) = subject.iter().find_map(|n| n.pitch) {
                variations.push(invert(subject, axis));
            }
        }
        if params.allow_retrograde {
            variations.push(retrograde(subject));
        }

        for (i, variation) in variations.into_iter().enumerate() {
            if time >= cap - subject_len {
                break;
            }
            if i > 0 && time < cap - subject_len - 2.0 {
                let bridge = slice_by_time(subject, 0.0, 2.0f64.min(subject_len / 2.0));
                if !bridge.is_empty() {
                    let shift = [-5, -2, 2, 5][rng.gen_range(0..4)];
                    let bridge = transpose(&bridge, shift);
                    time += phrase_duration(&bridge);
                    voice.extend(bridge);
                }
            }
            time += phrase_duration(&variation);
            voice.extend(variation);
        }

        if time < cap - 4.0 {
            voice.extend(self.generate_cadence(mapper, rng));
        }
        vec![voice]
    }

    /// Render a complete fugue: exposition, episodes alternating with
    /// subject re-entries through related keys, optional stretto, and
    /// a final tonic statement with cadence. The counterpoint pass
    /// runs last.
    pub fn render(&self, mapper: &ScaleMapper, params: &FugueParams) -> Score {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let subject = self.generate_subject(mapper, &mut rng);
        log::info!(
            "fugue_render voices={} root={} subject_notes={}",
            params.n_voices,
            params.key_root,
            subject.len()
        );

        if params.n_voices <= 1 {
            return self.render_monophonic(&subject, mapper, params, &mut rng);
        }

        let subject_len = phrase_duration(&subject);
        let entries = self.make_entry_plan(&subject, params);

        let mut voices: Score = vec![Phrase::new(); params.n_voices];
        for entry in &entries {
            let voice = &mut voices[entry.voice_index];
            if entry.start_time > 0.0 {
                voice.push(FugueNote::rest(entry.start_time));
            }
            voice.extend(entry.material.iter().copied());
        }

        let longest = |voices: &Score| -> f64 {
            voices.iter().map(|v| phrase_duration(v)).fold(0.0, f64::max)
        };
        let mut time = longest(&voices);

        let countersubject = self.generate_countersubject(&subject, mapper, &mut rng);

        // First episode, distributed canonically: later voices answer
        // with fifth/third transpositions.
        if time < MAX_SCORE_QUARTERS - 32.0 {
            let episode = self.generate_episode(&subject, 16.0, &mut rng);
            if !episode.is_empty() {
                voices[0].extend(episode.iter().copied());
                for v in 1..params.n_voices.min(3) {
                    let shift = if v % 2 == 1 {
                        if rng.gen_bool(0.5) {
                            7
                        } else {
                            5
                        }
                    } else {
                        -3
                    };
                    voices[v].extend(transpose(&episode, shift));
                }
                time += phrase_duration(&episode);
            }
        }

        // Subject re-entries through related keys, countersubject in a
        // neighbor voice, mini episodes between.
        for (i, &shift) in [7, -5, 2, -10].iter().enumerate() {
            if time >= MAX_SCORE_QUARTERS - 16.0 {
                break;
            }
            let entry_voice = i % params.n_voices;
            voices[entry_voice].extend(transpose(&subject, shift));
            if params.n_voices > 1 {
                let counter_voice = (entry_voice + 1) % params.n_voices;
                voices[counter_voice].extend(transpose(&countersubject, shift));
            }
            time += subject_len + 2.0;

            if i < 3 && time < MAX_SCORE_QUARTERS - 20.0 {
                let mini = self.generate_episode(&subject, 8.0, &mut rng);
                if !mini.is_empty() {
                    let episode_voice = (entry_voice + 2) % params.n_voices;
                    time += phrase_duration(&mini);
                    voices[episode_voice].extend(mini);
                }
            }
        }

        if params.stretto_overlap > 0.1 && time < MAX_SCORE_QUARTERS - 20.0 {
            for entry in self.stretto_entries(&subject, params, &mut rng) {
                voices[entry.voice_index].extend(entry.material);
            }
            time += 12.0;
        }

        // Closing development: the multi-voice episode, one part per
        // voice, richer texture than the single-line episodes.
        if time < MAX_SCORE_QUARTERS - 16.0 {
            let episode_len = 12.0f64.min(MAX_SCORE_QUARTERS - time - 8.0);
            let parts = self.generate_complex_episode(&subject, episode_len, &mut rng);
            if !parts.is_empty() {
                for (v, part) in parts.into_iter().take(params.n_voices).enumerate() {
                    voices[v].extend(part);
                }
                time += episode_len;
            }
        }

        // Final statement in the home key.
        if time < MAX_SCORE_QUARTERS - subject_len {
            voices[0].extend(subject.iter().copied());
            if params.n_voices > 1 {
                voices[1].extend(countersubject);
            }
            let cadence = self.generate_cadence(mapper, &mut rng);
            let cadence_voice = if params.n_voices > 2 { 2 } else { 0 };
            voices[cadence_voice].extend(cadence);
        }

        counterpoint_pass(&mut voices, params);
        voices
    }
}

// --- Counterpoint -------------------------------------------------------

/// Onset list for one voice: (start time, note index, pitch).
fn onsets(phrase: &[FugueNote]) -> Vec<(f64, usize, i32)> {
    let mut result = Vec::new();
    let mut time = 0.0;
    for (i, note) in phrase.iter().enumerate() {
        if let Some(pitch) = note.pitch {
            result.push((time, i, pitch));
        }
        time += note.duration;
    }
    result
}

fn is_strong_beat(time: f64) -> bool {
    (time - time.round()).abs() < 1e-6 && (time.round() as i64) % 2 == 0
}

fn is_perfect(interval: i32) -> bool {
    let class = interval.rem_euclid(12);
    class == 0 || class == 7
}

fn is_dissonant(interval: i32) -> bool {
    matches!(interval.rem_euclid(12), 1 | 2 | 6 | 10 | 11)
}

/// Sounding segments of one voice: (start, end, pitch), time-ordered.
/// Built once per scoring pass so pitch lookups are a binary search.
type Grid = Vec<(f64, f64, i32)>;

fn sounding_grid(phrase: &[FugueNote]) -> Grid {
    let mut grid = Vec::new();
    let mut time = 0.0;
    for note in phrase {
        if let Some(pitch) = note.pitch {
            grid.push((time, time + note.duration, pitch));
        }
        time += note.duration;
    }
    grid
}

fn grid_pitch_at(grid: &Grid, time: f64) -> Option<i32> {
    let idx = grid.partition_point(|(start, _, _)| *start <= time + 1e-9);
    if idx == 0 {
        return None;
    }
    let (start, end, pitch) = grid[idx - 1];
    (time >= start - 1e-9 && time < end - 1e-9).then_some(pitch)
}

/// Soft-constraint score for a rendered fugue; lower is better.
/// Penalizes parallel and direct perfects and unprepared dissonance on
/// strong beats plus voice crossing, and rewards stepwise motion.
pub fn score_counterpoint(score: &Score, params: &FugueParams) -> f64 {
    let grids: Vec<Grid> = score.iter().map(|voice| sounding_grid(voice)).collect();
    score_with_grids(&grids, params)
}

fn score_with_grids(grids: &[Grid], params: &FugueParams) -> f64 {
    let mut total = 0.0;

    for a in 0..grids.len() {
        for b in (a + 1)..grids.len() {
            let upper = &grids[a];
            let lower = &grids[b];
            let strong: Vec<f64> = upper
                .iter()
                .map(|(start, _, _)| *start)
                .filter(|t| is_strong_beat(*t))
                .collect();

            let mut prev: Option<(i32, i32)> = None;
            for &t in &strong {
                let (Some(hi), Some(lo)) = (grid_pitch_at(upper, t), grid_pitch_at(lower, t))
                else {
                    prev = None;
                    continue;
                };
                let interval = hi - lo;

                if let Some((prev_hi, prev_lo)) = prev {
                    let prev_interval = prev_hi - prev_lo;
                    let hi_motion = hi - prev_hi;
                    let lo_motion = lo - prev_lo;
                    let similar = hi_motion.signum() == lo_motion.signum()
                        && hi_motion != 0
                        && lo_motion != 0;

                    if is_perfect(interval) && similar {
                        if is_perfect(prev_interval)
                            && prev_interval.rem_euclid(12) == interval.rem_euclid(12)
                        {
                            total += params.w_parallel;
                        } else {
                            total += params.w_direct;
                        }
                    }
                    if hi_motion.abs() <= 2 && hi_motion != 0 {
                        total += params.w_smooth;
                    }
                }

                if is_dissonant(interval) {
                    total += params.w_dissonance;
                }
                if interval < 0 {
                    total += params.w_cross;
                }
                prev = Some((hi, lo));
            }
        }
    }
    total
}

/// Local greedy cleanup. Hard constraints first (voice ranges, leap
/// cap), then strong-beat nudges wherever they lower the soft score.
/// Never fatal: the pass only ever improves or leaves the score as is.
fn counterpoint_pass(score: &mut Score, params: &FugueParams) {
    // Hard constraints per voice.
    for (v, voice) in score.iter_mut().enumerate() {
        let (lo, hi) = params
            .voice_ranges
            .get(v)
            .copied()
            .unwrap_or((-24, 24));
        let (range_lo, range_hi) = (params.key_root + lo, params.key_root + hi);

        let mut prev_pitch: Option<i32> = None;
        let sounding_total = voice.iter().filter(|n| !n.is_rest()).count();
        let mut sounding_seen = 0;
        for note in voice.iter_mut() {
            let Some(mut pitch) = note.pitch else { continue };
            sounding_seen += 1;
            let at_cadence = sounding_seen + 2 > sounding_total;

            while pitch < range_lo {
                pitch += 12;
            }
            while pitch > range_hi {
                pitch -= 12;
            }
            if let Some(prev) = prev_pitch {
                if !at_cadence {
                    while pitch - prev > 9 {
                        pitch -= 12;
                    }
                    while prev - pitch > 9 {
                        pitch += 12;
                    }
                }
            }
            note.pitch = Some(pitch.clamp(0, 127));
            prev_pitch = note.pitch;
        }
    }

    // Greedy nudge pass on strong-beat notes, scored against the
    // shared grids so each candidate is a cheap re-score.
    let mut grids: Vec<Grid> = score.iter().map(|voice| sounding_grid(voice)).collect();
    let baseline = score_with_grids(&grids, params);
    let mut best = baseline;
    for v in 0..score.len() {
        let strong: Vec<(usize, f64)> = onsets(&score[v])
            .iter()
            .filter(|(t, _, _)| is_strong_beat(*t))
            .map(|(t, i, _)| (*i, *t))
            .collect();
        for (i, t) in strong {
            let Some(pitch) = score[v][i].pitch else { continue };
            let Some(segment) = grids[v]
                .iter()
                .position(|(start, _, _)| (start - t).abs() < 1e-9)
            else {
                continue;
            };
            let mut chosen = pitch;
            for candidate in [pitch - 2, pitch - 1, pitch + 1, pitch + 2] {
                if !(0..=127).contains(&candidate) {
                    continue;
                }
                grids[v][segment].2 = candidate;
                let trial = score_with_grids(&grids, params);
                if trial < best {
                    best = trial;
                    chosen = candidate;
                }
            }
            grids[v][segment].2 = chosen;
            score[v][i].pitch = Some(chosen);
        }
    }
    if best < baseline {
        log::debug!("counterpoint_improved from={baseline:.1} to={best:.1}");
    }

    // Hard rule: no exact unison on simultaneous onsets between
    // different voices except at the close.
    for a in 0..score.len() {
        for b in (a + 1)..score.len() {
            let a_onsets = onsets(&score[a]);
            let ends = (phrase_duration(&score[a]), phrase_duration(&score[b]));
            for (t, _, pitch) in &a_onsets {
                if *t >= ends.0 - 4.0 || *t >= ends.1 - 4.0 {
                    continue;
                }
                let b_onsets = onsets(&score[b]);
                if let Some((_, idx, _)) = b_onsets
                    .iter()
                    .find(|(bt, _, bp)| (bt - t).abs() < 1e-6 && bp == pitch)
                {
                    score[b][*idx].pitch = Some((pitch - 12).max(0));
                }
            }
        }
    }
}

// --- Playback -----------------------------------------------------------

/// A note due on the current step, for one voice.
#[derive(Clone, Copy, Debug)]
pub struct VoiceNote {
    pub pitch: u8,
    pub velocity: u8,
    pub duration_seconds: f64,
    pub voice_index: usize,
}

struct ActiveFugue {
    score: Score,
    positions: Vec<usize>,
    next_times: Vec<f64>,
    musical_time: f64,
    started: Instant,
}

/// Streams rendered fugues out in lockstep with the clock.
///
/// One fugue plays for up to five minutes, then a ten-second silence,
/// then the next one renders against whatever the state says by then.
pub struct FuguePlayback {
    engine: FugueEngine,
    active: Option<ActiveFugue>,
    last_end: Option<Instant>,
    rest_duration: Duration,
    max_play_time: Duration,
    elapsed_sixteenths: u64,
}

impl FuguePlayback {
    pub fn new(seed: u64) -> Self {
        Self {
            engine: FugueEngine::new(seed),
            active: None,
            last_end: None,
            rest_duration: Duration::from_secs(10),
            max_play_time: Duration::from_secs(300),
            elapsed_sixteenths: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_rest_duration(mut self, rest: Duration) -> Self {
        self.rest_duration = rest;
        self
    }

    /// Elapsed quarter-note index since the current fugue started.
    pub fn quarter_index(&self) -> u64 {
        self.elapsed_sixteenths / 4
    }

    /// Drop the active fugue; the next step starts the inter-fugue
    /// rest.
    pub fn reset(&mut self) {
        if self.active.take().is_some() {
            self.last_end = Some(Instant::now());
        }
        self.elapsed_sixteenths = 0;
    }

    /// Re-seed the next render (the active fugue is unaffected).
    pub fn reseed(&mut self, seed: u64) {
        self.engine.set_seed(seed);
    }

    /// Advance one 16th step and return every voice's notes whose
    /// onset falls on it. `bpm` converts quarter durations to seconds
    /// at emission time, so tempo changes are effective immediately.
    pub fn on_step(&mut self, mapper: &ScaleMapper, params: &FugueParams, bpm: f64) -> Vec<VoiceNote> {
        if self.active.is_none() && !self.try_begin(mapper, params) {
            return Vec::new();
        }

        let quarter_seconds = 60.0 / bpm.max(1.0);
        let fugue = self.active.as_mut().expect("active fugue");
        fugue.musical_time += 0.25;
        self.elapsed_sixteenths += 1;

        let mut due = Vec::new();
        for (voice_index, voice) in fugue.score.iter().enumerate() {
            while fugue.positions[voice_index] < voice.len()
                && fugue.musical_time >= fugue.next_times[voice_index] - 1e-9
            {
                let note = voice[fugue.positions[voice_index]];
                fugue.next_times[voice_index] += note.duration;
                fugue.positions[voice_index] += 1;
                if let Some(pitch) = note.pitch {
                    due.push(VoiceNote {
                        pitch: pitch.clamp(0, 127) as u8,
                        velocity: note.velocity.max(1),
                        duration_seconds: note.duration * quarter_seconds,
                        voice_index,
                    });
                }
            }
        }

        let exhausted = fugue
            .positions
            .iter()
            .zip(&fugue.score)
            .all(|(pos, voice)| *pos >= voice.len());
        let timed_out = fugue.started.elapsed() >= self.max_play_time;
        if exhausted || timed_out {
            log::info!(
                "fugue_completed reason={} musical_time={:.1}",
                if exhausted { "exhausted" } else { "max_duration" },
                fugue.musical_time
            );
            self.active = None;
            self.last_end = Some(Instant::now());
        }

        due
    }

    /// Start a new fugue when the inter-fugue rest has elapsed.
    fn try_begin(&mut self, mapper: &ScaleMapper, params: &FugueParams) -> bool {
        if let Some(end) = self.last_end {
            if end.elapsed() < self.rest_duration {
                return false;
            }
        }

        let score = self.engine.render(mapper, params);
        let n = score.len();
        log::info!(
            "fugue_started voices={} total_notes={}",
            n,
            score.iter().map(|v| v.len()).sum::<usize>()
        );
        self.active = Some(ActiveFugue {
            score,
            positions: vec![0; n],
            next_times: vec![0.0; n],
            musical_time: 0.0,
            started: Instant::now(),
        });
        self.elapsed_sixteenths = 0;
        true
    }
}
