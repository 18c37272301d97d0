//! Release-position policy for the press-and-hold record control.
//!
//! The cancel decision is taken from the pointer coordinates of the
//! release event itself, never from intermediate drag positions. Pointer
//! and touch releases are both reduced to a [`PointerPoint`] by the host,
//! so the rule is uniform across input kinds.

use serde::{Deserialize, Serialize};

/// On-screen bounding box of the record control at press time, in the same
/// coordinate space as the release events the host delivers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlBounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A release position (mouse pointer or primary touch point).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerPoint {
    pub x: f32,
    pub y: f32,
}

impl ControlBounds {
    /// Edge-inclusive containment: releasing exactly on the border still
    /// counts as inside (commit), matching platform hit-testing.
    pub fn contains(&self, point: PointerPoint) -> bool {
        point.x >= self.x
            && point.x <= self.x + self.width
            && point.y >= self.y
            && point.y <= self.y + self.height
    }

    /// Release outside the control cancels the capture.
    pub fn release_cancels(&self, point: PointerPoint) -> bool {
        !self.contains(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: ControlBounds = ControlBounds {
        x: 100.0,
        y: 400.0,
        width: 80.0,
        height: 80.0,
    };

    #[test]
    fn release_inside_commits() {
        assert!(!BOUNDS.release_cancels(PointerPoint { x: 140.0, y: 440.0 }));
    }

    #[test]
    fn release_on_the_edge_commits() {
        assert!(!BOUNDS.release_cancels(PointerPoint { x: 100.0, y: 400.0 }));
        assert!(!BOUNDS.release_cancels(PointerPoint { x: 180.0, y: 480.0 }));
    }

    #[test]
    fn release_outside_cancels_on_every_side() {
        assert!(BOUNDS.release_cancels(PointerPoint { x: 99.9, y: 440.0 }));
        assert!(BOUNDS.release_cancels(PointerPoint { x: 180.1, y: 440.0 }));
        assert!(BOUNDS.release_cancels(PointerPoint { x: 140.0, y: 399.0 }));
        assert!(BOUNDS.release_cancels(PointerPoint { x: 140.0, y: 480.5 }));
    }

    #[test]
    fn far_away_release_cancels() {
        assert!(BOUNDS.release_cancels(PointerPoint { x: -4.0, y: 0.0 }));
    }
}
