use serde::{Deserialize, Serialize};

/// Axis-aligned box in image pixels (x grows right, y grows down).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Edges are inclusive.
    pub fn contains(&self, u: f32, v: f32) -> bool {
        u >= self.x1 && u <= self.x2 && v >= self.y1 && v <= self.y2
    }

    pub fn center_distance(&self, u: f32, v: f32) -> f32 {
        let (cx, cy) = self.center();
        ((u - cx).powi(2) + (v - cy).powi(2)).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2].iter().all(|c| c.is_finite())
    }
}

/// One tracked object as reported by the external perception tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: u32,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub class_id: i32,
    #[serde(default)]
    pub label: String,
    pub confidence: f32,
    #[serde(default)]
    pub ts_unix_ms: i64,
}

impl Track {
    /// Finite coordinates and confidence, and a box with a positive area.
    pub fn is_well_formed(&self) -> bool {
        self.bbox.is_finite() && self.confidence.is_finite() && self.bbox.area() > 0.0
    }
}

/// Full track list for one camera frame. Replaces the previous snapshot wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub frame_seq: u64,
    #[serde(default)]
    pub ts_unix_ms: i64,
    pub tracks: Vec<Track>,
}

impl TrackSnapshot {
    pub fn find(&self, id: u32) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.find(id).is_some()
    }

    /// First track that fails [`Track::is_well_formed`].
    pub fn malformed(&self) -> Option<&Track> {
        self.tracks.iter().find(|t| !t.is_well_formed())
    }
}
