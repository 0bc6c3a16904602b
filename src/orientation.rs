//! Orientation resolution between sensor mounting and display rotation

use serde::{Deserialize, Serialize};

/// The four canonical display rotation states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum DisplayRotation {
    #[default]
    Rotation0,
    Rotation90,
    Rotation180,
    Rotation270,
}

impl DisplayRotation {
    pub const ALL: [DisplayRotation; 4] = [
        DisplayRotation::Rotation0,
        DisplayRotation::Rotation90,
        DisplayRotation::Rotation180,
        DisplayRotation::Rotation270,
    ];

    pub fn degrees(self) -> i32 {
        match self {
            DisplayRotation::Rotation0 => 0,
            DisplayRotation::Rotation90 => 90,
            DisplayRotation::Rotation180 => 180,
            DisplayRotation::Rotation270 => 270,
        }
    }
}

impl TryFrom<i32> for DisplayRotation {
    type Error = String;

    fn try_from(degrees: i32) -> Result<Self, Self::Error> {
        match degrees.rem_euclid(360) {
            0 => Ok(DisplayRotation::Rotation0),
            90 => Ok(DisplayRotation::Rotation90),
            180 => Ok(DisplayRotation::Rotation180),
            270 => Ok(DisplayRotation::Rotation270),
            _ => Err(format!("display rotation must be a multiple of 90, got {degrees}")),
        }
    }
}

impl From<DisplayRotation> for i32 {
    fn from(rotation: DisplayRotation) -> Self {
        rotation.degrees()
    }
}

/// Clockwise rotation applied to sensor pixels before presentation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Snaps an arbitrary angle to the nearest quarter turn
    pub fn from_degrees(degrees: i32) -> Self {
        match ((degrees.rem_euclid(360) + 45) / 90) % 4 {
            0 => Rotation::Deg0,
            1 => Rotation::Deg90,
            2 => Rotation::Deg180,
            _ => Rotation::Deg270,
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Number of clockwise quarter turns
    pub fn quarter_turns(self) -> usize {
        (self.degrees() / 90) as usize
    }
}

/// Rotation needed to present sensor output upright on the current display
pub fn resolve(sensor_mount_angle: i32, display: DisplayRotation) -> Rotation {
    Rotation::from_degrees((sensor_mount_angle - display.degrees()).rem_euclid(360))
}

/// Orientation of the active session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrientationState {
    pub sensor_mount_angle: i32,
    pub display: DisplayRotation,
    pub total: Rotation,
}

impl OrientationState {
    pub fn new(sensor_mount_angle: i32, display: DisplayRotation) -> Self {
        Self {
            sensor_mount_angle,
            display,
            total: resolve(sensor_mount_angle, display),
        }
    }

    /// Recomputes the total rotation for a new display rotation
    pub fn with_display(self, display: DisplayRotation) -> Self {
        Self::new(self.sensor_mount_angle, display)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_portrait_back_camera() {
        assert_eq!(resolve(90, DisplayRotation::Rotation0), Rotation::Deg90);
        assert_eq!(resolve(90, DisplayRotation::Rotation90), Rotation::Deg0);
        assert_eq!(resolve(90, DisplayRotation::Rotation270), Rotation::Deg180);
    }

    #[test]
    fn test_front_camera() {
        assert_eq!(resolve(270, DisplayRotation::Rotation0), Rotation::Deg270);
        assert_eq!(resolve(270, DisplayRotation::Rotation180), Rotation::Deg90);
    }

    #[test]
    fn test_snap_to_quarter_turn() {
        assert_eq!(Rotation::from_degrees(-90), Rotation::Deg270);
        assert_eq!(Rotation::from_degrees(44), Rotation::Deg0);
        assert_eq!(Rotation::from_degrees(46), Rotation::Deg90);
        assert_eq!(Rotation::from_degrees(359), Rotation::Deg0);
    }

    #[test]
    fn test_display_rotation_parse() {
        assert_eq!(DisplayRotation::try_from(180), Ok(DisplayRotation::Rotation180));
        assert_eq!(DisplayRotation::try_from(-90), Ok(DisplayRotation::Rotation270));
        assert!(DisplayRotation::try_from(45).is_err());
    }

    #[test]
    fn test_orientation_state_recompute() {
        let state = OrientationState::new(90, DisplayRotation::Rotation0);
        assert_eq!(state.total, Rotation::Deg90);
        let rotated = state.with_display(DisplayRotation::Rotation90);
        assert_eq!(rotated.total, Rotation::Deg0);
        assert_eq!(rotated.sensor_mount_angle, 90);
    }
}
