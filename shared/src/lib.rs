use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 3001;

pub const PIXEL_SIZE: u32 = 10;
pub const CANVAS_SIZE: u32 = 1080;
pub const GRID_SIZE: usize = (CANVAS_SIZE / PIXEL_SIZE) as usize;
pub const TOTAL_GRIDS: usize = 3;
pub const COOLDOWN: Duration = Duration::from_millis(500);

/// A 24-bit RGB color. Wire form is the canonical lowercase `#rrggbb` string;
/// parsing accepts either case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    /// Background color of every cell; also what `clear` restores.
    pub const WHITE: Color = Color::rgb(0xff, 0xff, 0xff);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorParseError {
    input: String,
}

impl fmt::Display for ColorParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid hex color {:?} (expected #rrggbb)", self.input)
    }
}

impl std::error::Error for ColorParseError {}

impl FromStr for Color {
    type Err = ColorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ColorParseError {
            input: s.to_string(),
        };

        let hex = s.strip_prefix('#').ok_or_else(err)?;
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(err());
        }

        let r = u8::from_str_radix(&hex[0..2], 16).map_err(|_| err())?;
        let g = u8::from_str_radix(&hex[2..4], 16).map_err(|_| err())?;
        let b = u8::from_str_radix(&hex[4..6], 16).map_err(|_| err())?;
        Ok(Color::rgb(r, g, b))
    }
}

// Colors travel as hex strings so the serialized canvas is the nested array
// of `#rrggbb` values every client renders directly.
impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// The full canvas: `TOTAL_GRIDS` grids of `GRID_SIZE` x `GRID_SIZE` cells.
/// Every cell always holds a valid color; fresh state is all white.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanvasState {
    grids: Vec<Vec<Vec<Color>>>,
}

impl CanvasState {
    pub fn new() -> Self {
        Self {
            grids: vec![vec![vec![Color::WHITE; GRID_SIZE]; GRID_SIZE]; TOTAL_GRIDS],
        }
    }

    pub fn in_bounds(grid_index: usize, row: usize, col: usize) -> bool {
        grid_index < TOTAL_GRIDS && row < GRID_SIZE && col < GRID_SIZE
    }

    pub fn get(&self, grid_index: usize, row: usize, col: usize) -> Option<Color> {
        self.grids
            .get(grid_index)
            .and_then(|g| g.get(row))
            .and_then(|r| r.get(col))
            .copied()
    }

    /// Sets one cell and returns its previous color, or `None` if the
    /// coordinates are out of range (state untouched).
    pub fn set_cell(
        &mut self,
        grid_index: usize,
        row: usize,
        col: usize,
        color: Color,
    ) -> Option<Color> {
        let cell = self
            .grids
            .get_mut(grid_index)?
            .get_mut(row)?
            .get_mut(col)?;
        Some(std::mem::replace(cell, color))
    }

    /// Resets every cell of every grid to white.
    pub fn clear(&mut self) {
        for grid in &mut self.grids {
            for row in grid {
                row.fill(Color::WHITE);
            }
        }
    }

    /// Checks that a deserialized canvas (e.g. loaded from disk) has the
    /// dimensions this build was compiled with.
    pub fn has_expected_dimensions(&self) -> bool {
        self.grids.len() == TOTAL_GRIDS
            && self
                .grids
                .iter()
                .all(|g| g.len() == GRID_SIZE && g.iter().all(|r| r.len() == GRID_SIZE))
    }

    /// Count of painted (non-white) cells per distinct color across all grids.
    pub fn tally(&self) -> HashMap<Color, usize> {
        let mut counts = HashMap::new();
        for grid in &self.grids {
            for row in grid {
                for &color in row {
                    if color != Color::WHITE {
                        *counts.entry(color).or_insert(0) += 1;
                    }
                }
            }
        }
        counts
    }

    /// Leaderboard projection of `tally`: descending by count. Colors with
    /// equal counts appear in no particular order.
    pub fn leaderboard(&self) -> Vec<(Color, usize)> {
        let mut entries: Vec<(Color, usize)> = self.tally().into_iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries
    }
}

impl Default for CanvasState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Reject {
    OutOfRange,
    Cooldown { remaining_ms: u64 },
    Persistence,
}

impl fmt::Display for Reject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reject::OutOfRange => write!(f, "cell coordinates out of range"),
            Reject::Cooldown { remaining_ms } => {
                write!(f, "cooldown active, {}ms remaining", remaining_ms)
            }
            Reject::Persistence => write!(f, "canvas could not be persisted, try again"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // client -> server
    Connect {
        protocol_version: u32,
        pixel_size: u32,
        canvas_size: u32,
        total_grids: u32,
        cooldown_ms: u64,
    },
    GetInitialGrid,
    Paint {
        grid_index: u32,
        row: u32,
        col: u32,
        color: Color,
    },
    Clear,
    Disconnect,

    // server -> client
    Connected {
        session_id: u64,
    },
    Grid {
        canvas: CanvasState,
    },
    Rejected {
        reason: Reject,
    },
    Disconnected {
        reason: String,
    },
}

impl Packet {
    /// The connect handshake for this build's constants. The server rejects
    /// the connection if any value differs from its own.
    pub fn handshake() -> Packet {
        Packet::Connect {
            protocol_version: PROTOCOL_VERSION,
            pixel_size: PIXEL_SIZE,
            canvas_size: CANVAS_SIZE,
            total_grids: TOTAL_GRIDS as u32,
            cooldown_ms: COOLDOWN.as_millis() as u64,
        }
    }
}
