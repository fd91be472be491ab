//! # World Orientation
//!
//! Which way is up in the game's world, and where each cube face looks.
//!
//! ## Plain English
//!
//! Some engines point +Y at the sky, others +Z. The first view matrix we
//! detect tells us: invert it, and the camera's "up" basis vector leans
//! mostly along one of those two axes. That choice then picks one of two
//! fixed tables of six look directions.

use glam::{Mat4, Vec3};
use log::info;

use super::classifier::Handedness;
use super::CubeFace;

// ============================================
// WORLD UP
// ============================================

/// Detected world-up axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorldUp {
    #[default]
    PosY,
    NegY,
    PosZ,
    NegZ,
}

impl WorldUp {
    pub fn vector(self) -> Vec3 {
        match self {
            Self::PosY => Vec3::Y,
            Self::NegY => Vec3::NEG_Y,
            Self::PosZ => Vec3::Z,
            Self::NegZ => Vec3::NEG_Z,
        }
    }

    pub fn is_z_up(self) -> bool {
        matches!(self, Self::PosZ | Self::NegZ)
    }
}

/// Detects world-up from a canonical (row-major) view matrix.
///
/// Returns `None` if the view can't be inverted.
pub fn detect_world_up(view: &Mat4) -> Option<WorldUp> {
    let inverse = invert(view)?;
    let up = inverse.y_axis.truncate().try_normalize()?;

    Some(if up.z.abs() > up.y.abs() {
        if up.z > 0.0 {
            WorldUp::PosZ
        } else {
            WorldUp::NegZ
        }
    } else if up.y > 0.0 {
        WorldUp::PosY
    } else {
        WorldUp::NegY
    })
}

/// Inverse of a view matrix, or `None` if it is singular.
pub fn invert(m: &Mat4) -> Option<Mat4> {
    let det = m.determinant();
    if !det.is_finite() || det.abs() < 1e-8 {
        return None;
    }
    let inverse = m.inverse();
    inverse.is_finite().then_some(inverse)
}

// ============================================
// WORLD ORIENTATION
// ============================================

/// World-up and handedness, each fixed by the first matrix that reveals it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorldOrientation {
    up: Option<WorldUp>,
    handedness: Option<Handedness>,
}

impl WorldOrientation {
    /// World-up, `+Y` until a view has been seen.
    pub fn world_up(&self) -> WorldUp {
        self.up.unwrap_or_default()
    }

    /// Handedness, left-handed until a projection has been seen.
    pub fn handedness(&self) -> Handedness {
        self.handedness.unwrap_or_default()
    }

    pub fn up_detected(&self) -> bool {
        self.up.is_some()
    }

    pub fn handedness_detected(&self) -> bool {
        self.handedness.is_some()
    }

    /// Runs world-up detection if it hasn't succeeded yet.
    pub fn observe_view(&mut self, view: &Mat4) {
        if self.up.is_some() {
            return;
        }
        if let Some(up) = detect_world_up(view) {
            info!("Detected world up: {:?}", up);
            self.up = Some(up);
        }
    }

    /// Records handedness if it isn't known yet.
    pub fn observe_projection(&mut self, handedness: Handedness) {
        if self.handedness.is_none() {
            info!("Detected {:?}-handed projection", handedness);
            self.handedness = Some(handedness);
        }
    }

    /// Look direction and up-reference for one face.
    pub fn face_basis(&self, face: CubeFace) -> (Vec3, Vec3) {
        let up = self.world_up();

        let (right, vertical, front) = if up.is_z_up() {
            (Vec3::X, Vec3::Z, Vec3::Y)
        } else {
            let front = match self.handedness() {
                Handedness::Left => Vec3::Z,
                Handedness::Right => Vec3::NEG_Z,
            };
            (Vec3::X, Vec3::Y, front)
        };

        match face {
            CubeFace::Right => (right, up.vector()),
            CubeFace::Left => (-right, up.vector()),
            // Looking along the up axis, so the up-reference can't be world-up
            CubeFace::Up => (vertical, front),
            CubeFace::Down => (-vertical, -front),
            CubeFace::Front => (front, up.vector()),
            CubeFace::Back => (-front, up.vector()),
        }
    }
}

// ============================================
// TESTS
// ============================================
