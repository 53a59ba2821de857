use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_THEME: &str = "quantum-void";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThemeError {
    #[error("unknown theme: {0}")]
    UnknownTheme(String),
    #[error("invalid colour: {0}")]
    InvalidColour(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Rgb { r, g, b }
    }

    /// Parses `#rrggbb` or `rrggbb`.
    pub fn from_hex(input: &str) -> Result<Self, ThemeError> {
        let digits = input.trim().trim_start_matches('#');
        if digits.len() != 6 || !digits.is_ascii() {
            return Err(ThemeError::InvalidColour(input.to_string()));
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&digits[range], 16).map_err(|_| ThemeError::InvalidColour(input.to_string()))
        };
        Ok(Rgb {
            r: channel(0..2)?,
            g: channel(2..4)?,
            b: channel(4..6)?,
        })
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn lerp(&self, other: Rgb, t: f32) -> Rgb {
        let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
        let mix = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * t).round() as u8;
        Rgb {
            r: mix(self.r, other.r),
            g: mix(self.g, other.g),
            b: mix(self.b, other.b),
        }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Rgb {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Rgb {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Rgb::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Palette {
    pub primary: Rgb,
    pub secondary: Rgb,
    pub accent: Rgb,
    pub background: Rgb,
    pub glow: Rgb,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Theme {
    pub name: String,
    pub palette: Palette,
    pub intensity: f32,
    pub glow_radius: f32,
}

impl Theme {
    fn builtin(name: &str, colours: [u32; 5], intensity: f32, glow_radius: f32) -> Theme {
        let rgb = |c: u32| Rgb::new((c >> 16) as u8, (c >> 8) as u8, c as u8);
        Theme {
            name: name.to_string(),
            palette: Palette {
                primary: rgb(colours[0]),
                secondary: rgb(colours[1]),
                accent: rgb(colours[2]),
                background: rgb(colours[3]),
                glow: rgb(colours[4]),
            },
            intensity,
            glow_radius,
        }
    }
}

pub struct ThemeEngine {
    themes: BTreeMap<String, Theme>,
    active: String,
}

impl ThemeEngine {
    pub fn with_builtin() -> Self {
        let builtin = [
            Theme::builtin("quantum-void", [0x6b46c1, 0x2d3748, 0x00d4ff, 0x0a0a1a, 0x9f7aea], 0.6, 12.0),
            Theme::builtin("cosmic-aurora", [0x38b2ac, 0x553c9a, 0xf687b3, 0x0d1b2a, 0x68d391], 0.7, 16.0),
            Theme::builtin("morphic-field", [0xed8936, 0x2c7a7b, 0xfaf089, 0x1a202c, 0xf6ad55], 0.5, 10.0),
            Theme::builtin("sacred-geometry", [0xd69e2e, 0x744210, 0xffffff, 0x1c1917, 0xfbd38d], 0.8, 20.0),
        ];
        let themes = builtin.into_iter().map(|t| (t.name.clone(), t)).collect();
        ThemeEngine {
            themes,
            active: DEFAULT_THEME.to_string(),
        }
    }

    pub fn register(&mut self, theme: Theme) {
        self.themes.insert(theme.name.clone(), theme);
    }

    pub fn set_active(&mut self, name: &str) -> Result<&Theme, ThemeError> {
        if !self.themes.contains_key(name) {
            return Err(ThemeError::UnknownTheme(name.to_string()));
        }
        self.active = name.to_string();
        self.get(name).ok_or_else(|| ThemeError::UnknownTheme(name.to_string()))
    }

    pub fn active(&self) -> &Theme {
        // `active` only ever names a registered theme and themes are never removed.
        &self.themes[&self.active]
    }

    pub fn get(&self, name: &str) -> Option<&Theme> {
        self.themes.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.themes.keys().cloned().collect()
    }

    pub fn modulated(&self, level: f32) -> Theme {
        let level = if level.is_finite() { level.clamp(0.0, 1.0) } else { 0.0 };
        let mut theme = self.active().clone();
        theme.intensity = (theme.intensity * (0.5 + level)).clamp(0.0, 1.0);
        theme.glow_radius *= 1.0 + level;
        theme.palette.glow = theme.palette.glow.lerp(theme.palette.accent, level);
        theme
    }
}

impl Default for ThemeEngine {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parses_and_formats() {
        let c = Rgb::from_hex("#00D4ff").unwrap();
        assert_eq!(c, Rgb::new(0x00, 0xd4, 0xff));
        assert_eq!(c.to_hex(), "#00d4ff");
        assert!(Rgb::from_hex("#12345").is_err());
        assert!(Rgb::from_hex("zzzzzz").is_err());
    }

    #[test]
    fn lerp_hits_endpoints() {
        let a = Rgb::new(0, 0, 0);
        let b = Rgb::new(200, 100, 50);
        assert_eq!(a.lerp(b, 0.0), a);
        assert_eq!(a.lerp(b, 1.0), b);
        assert_eq!(a.lerp(b, 0.5), Rgb::new(100, 50, 25));
        assert_eq!(a.lerp(b, 7.0), b);
    }

    #[test]
    fn builtins_are_registered() {
        let engine = ThemeEngine::with_builtin();
        assert_eq!(
            engine.names(),
            vec!["cosmic-aurora", "morphic-field", "quantum-void", "sacred-geometry"]
        );
        assert_eq!(engine.active().name, DEFAULT_THEME);
    }

    #[test]
    fn set_active_rejects_unknown() {
        let mut engine = ThemeEngine::with_builtin();
        assert_eq!(engine.set_active("cosmic-aurora").unwrap().name, "cosmic-aurora");
        assert_eq!(
            engine.set_active("disco").unwrap_err(),
            ThemeError::UnknownTheme("disco".into())
        );
        assert_eq!(engine.active().name, "cosmic-aurora");
    }

    #[test]
    fn modulation_tracks_level() {
        let engine = ThemeEngine::with_builtin();
        let calm = engine.modulated(0.0);
        let lit = engine.modulated(1.0);
        assert!(lit.intensity > calm.intensity);
        assert!(lit.glow_radius > calm.glow_radius);
        assert_eq!(lit.palette.glow, engine.active().palette.accent);
        assert_eq!(calm.palette.glow, engine.active().palette.glow);
    }

    #[test]
    fn palette_serializes_as_hex() {
        let engine = ThemeEngine::with_builtin();
        let json = serde_json::to_value(engine.active()).unwrap();
        assert_eq!(json["palette"]["accent"], "#00d4ff");
        let back: Theme = serde_json::from_value(json).unwrap();
        assert_eq!(&back, engine.active());
    }
}
