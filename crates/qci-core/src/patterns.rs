use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_COMPLEXITY: u8 = 1;
pub const MAX_COMPLEXITY: u8 = 10;
pub const MIN_DIMENSIONS: u8 = 1;
pub const MAX_DIMENSIONS: u8 = 12;

const GOLDEN_RATIO: f32 = 1.618_034;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Fractal,
    Mandala,
    Spiral,
    Constellation,
    Morphic,
}

impl PatternKind {
    pub const ALL: [PatternKind; 5] = [
        PatternKind::Fractal,
        PatternKind::Mandala,
        PatternKind::Spiral,
        PatternKind::Constellation,
        PatternKind::Morphic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Fractal => "fractal",
            PatternKind::Mandala => "mandala",
            PatternKind::Spiral => "spiral",
            PatternKind::Constellation => "constellation",
            PatternKind::Morphic => "morphic",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternKind {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PatternKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PatternError::UnknownKind(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Star {
    pub x: f32,
    pub y: f32,
    pub brightness: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum PatternGeometry {
    Fractal {
        depth: u8,
        branch_angle: f32,
        scale: f32,
    },
    Mandala {
        radius: f32,
        petals: u16,
        rings: u8,
    },
    Spiral {
        turns: f32,
        growth: f32,
    },
    Constellation {
        stars: Vec<Star>,
    },
    Morphic {
        field_strength: f32,
        harmonics: Vec<f32>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pattern {
    pub id: String,
    pub kind: PatternKind,
    pub complexity: u8,
    pub weight: f32,
    pub dimensions: u8,
    pub evolvable: bool,
    pub generation: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub geometry: PatternGeometry,
}

impl Pattern {
    pub fn lineage(&self) -> &str {
        self.id.split('~').next().unwrap_or(&self.id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("unknown pattern: {0}")]
    UnknownPattern(String),
    #[error("pattern {0} can no longer evolve")]
    NotEvolvable(String),
    #[error("unknown pattern kind: {0}")]
    UnknownKind(String),
}

fn derive_seed_bytes(seed_str: &str) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    let seed_bytes = seed_str.as_bytes();
    if seed_bytes.is_empty() {
        return bytes;
    }
    for (i, slot) in bytes.iter_mut().enumerate() {
        let value = seed_bytes[i % seed_bytes.len()];
        *slot = value.wrapping_add((i * 31) as u8);
    }
    bytes
}

fn clamp_complexity(value: u32) -> u8 {
    value.clamp(MIN_COMPLEXITY as u32, MAX_COMPLEXITY as u32) as u8
}

fn clamp_weight(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn clamp_dimensions(value: u32) -> u8 {
    value.clamp(MIN_DIMENSIONS as u32, MAX_DIMENSIONS as u32) as u8
}

fn is_evolvable(complexity: u8, weight: f32) -> bool {
    complexity < MAX_COMPLEXITY || weight < 1.0
}

pub struct PatternGenerator {
    rng: ChaCha8Rng,
    patterns: HashMap<String, Pattern>,
    next_seq: u32,
}

impl PatternGenerator {
    pub fn new(seed: &str) -> Self {
        PatternGenerator {
            rng: ChaCha8Rng::from_seed(derive_seed_bytes(seed)),
            patterns: HashMap::new(),
            next_seq: 1,
        }
    }

    pub fn generate(&mut self, kind: PatternKind, complexity: u32, weight: f32, dimensions: u32) -> Pattern {
        let complexity = clamp_complexity(complexity);
        let weight = clamp_weight(weight);
        let dimensions = clamp_dimensions(dimensions);
        let geometry = self.geometry_for(kind, complexity, weight, u32::from(dimensions));
        let id = format!("{}-{:04}", kind.as_str(), self.next_seq);
        self.next_seq += 1;
        self.store(Pattern {
            id,
            kind,
            complexity,
            weight,
            dimensions,
            evolvable: is_evolvable(complexity, weight),
            generation: 0,
            parent_id: None,
            geometry,
        })
    }

    pub fn generate_fractal(&mut self, depth: u32, weight: f32) -> Pattern {
        self.generate(PatternKind::Fractal, depth, weight, 2)
    }

    pub fn generate_mandala(&mut self, radius: f32, petal_count: u16, weight: f32) -> Pattern {
        let complexity = (petal_count as u32 / 3).max(1);
        let mut pattern = self.generate(PatternKind::Mandala, complexity, weight, 2);
        pattern.geometry = PatternGeometry::Mandala {
            radius: radius.max(1.0),
            petals: petal_count.max(3),
            rings: pattern.complexity.div_ceil(2),
        };
        self.store(pattern)
    }

    pub fn generate_spiral(&mut self, turns: f32, weight: f32) -> Pattern {
        let turns = if turns.is_finite() { turns.clamp(0.5, 20.0) } else { 3.0 };
        let complexity = (turns / 2.0).ceil() as u32;
        let mut pattern = self.generate(PatternKind::Spiral, complexity, weight, 2);
        pattern.geometry = PatternGeometry::Spiral {
            turns,
            growth: GOLDEN_RATIO,
        };
        self.store(pattern)
    }

    pub fn generate_constellation(&mut self, star_count: u32, weight: f32) -> Pattern {
        let complexity = (star_count / 4).max(1);
        let mut pattern = self.generate(PatternKind::Constellation, complexity, weight, 3);
        pattern.geometry = PatternGeometry::Constellation {
            stars: self.scatter_stars(star_count.clamp(1, 128) as usize, pattern.weight),
        };
        self.store(pattern)
    }

    pub fn generate_morphic(&mut self, dimensions: u32, weight: f32) -> Pattern {
        self.generate(PatternKind::Morphic, dimensions, weight, dimensions)
    }

    pub fn evolve(&mut self, id: &str, score: f32) -> Result<Pattern, PatternError> {
        let parent = self
            .patterns
            .get(id)
            .cloned()
            .ok_or_else(|| PatternError::UnknownPattern(id.to_string()))?;
        if !parent.evolvable {
            return Err(PatternError::NotEvolvable(id.to_string()));
        }
        let score = clamp_weight(score);
        let step = if score > 0.8 { 2 } else { 1 };
        let complexity = clamp_complexity(parent.complexity as u32 + step);
        let weight = clamp_weight(parent.weight + 0.05 + 0.1 * score);
        let generation = parent.generation + 1;
        let geometry = self.geometry_for(parent.kind, complexity, weight, parent.dimensions as u32);
        let child = Pattern {
            id: self.derive_id(parent.lineage(), generation),
            kind: parent.kind,
            complexity,
            weight,
            dimensions: parent.dimensions,
            evolvable: is_evolvable(complexity, weight),
            generation,
            parent_id: Some(parent.id.clone()),
            geometry,
        };
        Ok(self.store(child))
    }

    pub fn get(&self, id: &str) -> Option<&Pattern> {
        self.patterns.get(id)
    }

    pub fn patterns(&self) -> Vec<&Pattern> {
        let mut all: Vec<&Pattern> = self.patterns.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// `<root>~<generation>`, with a `.n` suffix for later siblings.
    fn derive_id(&self, root: &str, generation: u32) -> String {
        let base = format!("{root}~{generation}");
        if !self.patterns.contains_key(&base) {
            return base;
        }
        (2u32..)
            .map(|n| format!("{base}.{n}"))
            .find(|candidate| !self.patterns.contains_key(candidate))
            .unwrap_or(base)
    }

    fn store(&mut self, pattern: Pattern) -> Pattern {
        self.patterns.insert(pattern.id.clone(), pattern.clone());
        pattern
    }

    fn geometry_for(&mut self, kind: PatternKind, complexity: u8, weight: f32, dimensions: u32) -> PatternGeometry {
        let jitter: f32 = self.rng.gen_range(-0.05..0.05);
        match kind {
            PatternKind::Fractal => PatternGeometry::Fractal {
                depth: complexity,
                branch_angle: (25.0 + 20.0 * weight + jitter * 10.0).clamp(10.0, 60.0),
                scale: (0.5 + 0.2 * weight + jitter).clamp(0.3, 0.9),
            },
            PatternKind::Mandala => PatternGeometry::Mandala {
                radius: 40.0 + complexity as f32 * 8.0,
                petals: (complexity as u16) * 3 + 3,
                rings: complexity.div_ceil(2),
            },
            PatternKind::Spiral => PatternGeometry::Spiral {
                turns: complexity as f32 * 2.0,
                growth: GOLDEN_RATIO + jitter,
            },
            PatternKind::Constellation => PatternGeometry::Constellation {
                stars: self.scatter_stars(complexity as usize * 4, weight),
            },
            PatternKind::Morphic => {
                let count = dimensions.clamp(MIN_DIMENSIONS as u32, MAX_DIMENSIONS as u32) as usize;
                let harmonics = (1..=count)
                    .map(|n| {
                        let base = 1.0 / n as f32;
                        (base + self.rng.gen_range(-0.02..0.02)).max(0.0)
                    })
                    .collect();
                PatternGeometry::Morphic {
                    field_strength: (weight * complexity as f32 / MAX_COMPLEXITY as f32 + jitter).clamp(0.0, 1.0),
                    harmonics,
                }
            }
        }
    }

    fn scatter_stars(&mut self, count: usize, weight: f32) -> Vec<Star> {
        (0..count)
            .map(|_| Star {
                x: self.rng.gen::<f32>(),
                y: self.rng.gen::<f32>(),
                brightness: (0.3 + 0.7 * weight * self.rng.gen::<f32>()).clamp(0.0, 1.0),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_are_clamped() {
        let mut gen = PatternGenerator::new("clamp");
        let p = gen.generate(PatternKind::Fractal, 40, 3.5, 99);
        assert_eq!(p.complexity, MAX_COMPLEXITY);
        assert_eq!(p.weight, 1.0);
        assert_eq!(p.dimensions, MAX_DIMENSIONS);
        assert!(!p.evolvable);

        let p = gen.generate(PatternKind::Spiral, 0, -1.0, 0);
        assert_eq!(p.complexity, MIN_COMPLEXITY);
        assert_eq!(p.weight, 0.0);
        assert_eq!(p.dimensions, MIN_DIMENSIONS);
    }

    #[test]
    fn evolve_stays_within_bounds() {
        let mut gen = PatternGenerator::new("bounds");
        let mut current = gen.generate_mandala(60.0, 12, 0.7);
        let mut generations = 0;
        loop {
            match gen.evolve(&current.id, 1.7) {
                Ok(next) => {
                    assert!((MIN_COMPLEXITY..=MAX_COMPLEXITY).contains(&next.complexity));
                    assert!((0.0..=1.0).contains(&next.weight));
                    assert!(next.complexity >= current.complexity);
                    assert!(next.weight >= current.weight);
                    assert_eq!(next.parent_id.as_deref(), Some(current.id.as_str()));
                    current = next;
                    generations += 1;
                }
                Err(err) => {
                    assert_eq!(err, PatternError::NotEvolvable(current.id.clone()));
                    break;
                }
            }
            assert!(generations < 50, "evolution never saturated");
        }
        assert_eq!(current.complexity, MAX_COMPLEXITY);
        assert_eq!(current.weight, 1.0);
    }

    #[test]
    fn evolve_derives_new_id_and_keeps_parent() {
        let mut gen = PatternGenerator::new("lineage");
        let root = gen.generate_spiral(4.0, 0.2);
        let child = gen.evolve(&root.id, 0.3).unwrap();
        let grandchild = gen.evolve(&child.id, 0.9).unwrap();
        assert_eq!(child.id, format!("{}~1", root.id));
        assert_eq!(grandchild.id, format!("{}~2", root.id));
        assert_eq!(grandchild.complexity, child.complexity + 2);
        assert_eq!(gen.get(&root.id), Some(&root));
        assert_eq!(gen.len(), 3);
        assert_eq!(
            gen.evolve("ghost", 0.5),
            Err(PatternError::UnknownPattern("ghost".into()))
        );
    }

    #[test]
    fn sibling_evolutions_get_distinct_ids() {
        let mut gen = PatternGenerator::new("siblings");
        let root = gen.generate_spiral(4.0, 0.2);
        let first = gen.evolve(&root.id, 0.1).unwrap();
        let second = gen.evolve(&root.id, 0.9).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(second.id, format!("{}~1.2", root.id));
        assert_eq!(gen.len(), 3);
        assert_eq!(gen.get(&first.id), Some(&first));
        assert_eq!(gen.get(&second.id), Some(&second));
        assert_eq!(second.parent_id.as_deref(), Some(root.id.as_str()));

        let nephew = gen.evolve(&second.id, 0.1).unwrap();
        assert_eq!(nephew.id, format!("{}~2", root.id));
        assert_eq!(nephew.parent_id.as_deref(), Some(second.id.as_str()));
    }

    #[test]
    fn same_seed_replays_identically() {
        let mut a = PatternGenerator::new("stellar");
        let mut b = PatternGenerator::new("stellar");
        assert_eq!(a.generate_constellation(9, 0.5), b.generate_constellation(9, 0.5));
        assert_eq!(a.generate_morphic(5, 0.4), b.generate_morphic(5, 0.4));
    }

    #[test]
    fn kind_specific_generators_shape_geometry() {
        let mut gen = PatternGenerator::new("shapes");
        let mandala = gen.generate_mandala(80.0, 9, 0.5);
        assert!(matches!(mandala.geometry, PatternGeometry::Mandala { petals: 9, radius, .. } if radius == 80.0));
        let stars = gen.generate_constellation(7, 0.5);
        match stars.geometry {
            PatternGeometry::Constellation { stars } => assert_eq!(stars.len(), 7),
            other => panic!("unexpected geometry {other:?}"),
        }
        let morphic = gen.generate_morphic(6, 0.5);
        assert_eq!(morphic.dimensions, 6);
        let fractal = gen.generate_fractal(4, 0.5);
        assert!(matches!(fractal.geometry, PatternGeometry::Fractal { depth: 4, .. }));
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("Mandala".parse::<PatternKind>(), Ok(PatternKind::Mandala));
        assert!("hexagon".parse::<PatternKind>().is_err());
    }
}
