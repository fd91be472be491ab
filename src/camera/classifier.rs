//! # Matrix Classifier
//!
//! Pattern tests that decide whether 16 floats look like a view or a
//! projection matrix.
//!
//! ## Plain English
//!
//! Games don't label their constant buffers. We look for the fingerprints a
//! camera leaves behind:
//!
//! ```text
//!   view (row-major)     view (transposed)    projection
//!   [ x x x 0 ]          [ x x x x ]          [ x x x 0 ]
//!   [ x x x 0 ]          [ x x x x ]          [ x x x 0 ]
//!   [ x x x 0 ]          [ x x x x ]          [ x x x ±1]
//!   [ x x x 1 ]          [ 0 0 0 1 ]          [ x x x 0 ]
//! ```
//!
//! A miss is the normal outcome, so everything here returns `Option`.
//!
//! Floats are read in native byte order (little-endian on every target the
//! adapters support).

// ============================================
// CONSTANTS
// ============================================

/// Floats in one 4×4 matrix.
pub const MATRIX_FLOATS: usize = 16;

/// Bytes in one 4×4 float matrix.
pub const MATRIX_BYTES: usize = MATRIX_FLOATS * 4;

/// Candidate windows start on every float4 boundary.
const SCAN_STRIDE: usize = 4;

// ============================================
// CLASSIFICATION RESULTS
// ============================================

/// How a view matrix is laid out in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatrixLayout {
    /// Translation in the last row (row-vector convention)
    RowMajor,
    /// Translation in the last column; transpose before use
    Transposed,
}

/// Handedness of a projection, and of every matrix we build for the game.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Handedness {
    #[default]
    Left,
    Right,
}

fn approx(value: f32, target: f32, eps: f32) -> bool {
    (value - target).abs() < eps
}

// ============================================
// SINGLE-MATRIX TESTS
// ============================================

/// Checks the view fingerprint.
///
/// When a block matches both layouts, row-major wins.
pub fn classify_view(m: &[f32; MATRIX_FLOATS], eps: f32) -> Option<MatrixLayout> {
    if !approx(m[15], 1.0, eps) {
        return None;
    }

    let row_major = approx(m[3], 0.0, eps) && approx(m[7], 0.0, eps) && approx(m[11], 0.0, eps);
    if row_major {
        return Some(MatrixLayout::RowMajor);
    }

    let transposed =
        approx(m[12], 0.0, eps) && approx(m[13], 0.0, eps) && approx(m[14], 0.0, eps);
    transposed.then_some(MatrixLayout::Transposed)
}

/// Checks the projection fingerprint and reports its handedness.
pub fn classify_projection(m: &[f32; MATRIX_FLOATS], eps: f32) -> Option<Handedness> {
    let zeros = approx(m[3], 0.0, eps) && approx(m[7], 0.0, eps) && approx(m[15], 0.0, eps);
    if !zeros {
        return None;
    }
    if !(approx(m[11], 1.0, eps) || approx(m[11], -1.0, eps)) {
        return None;
    }

    Some(if m[11] <= -0.9 {
        Handedness::Right
    } else {
        Handedness::Left
    })
}

// ============================================
// SCANNING
// ============================================

/// Float offsets of every candidate window, in increasing order.
///
/// Stops at `float_count - 16`, so a window never runs past the end.
fn candidate_offsets(float_count: usize) -> impl Iterator<Item = usize> {
    (0..)
        .step_by(SCAN_STRIDE)
        .take_while(move |offset| offset + MATRIX_FLOATS <= float_count)
}

fn window(floats: &[f32], offset: usize) -> Option<&[f32; MATRIX_FLOATS]> {
    floats.get(offset..offset + MATRIX_FLOATS)?.try_into().ok()
}

/// First view matrix in `floats`: `(float offset, layout)`.
pub fn find_view_matrix(floats: &[f32], eps: f32) -> Option<(usize, MatrixLayout)> {
    candidate_offsets(floats.len()).find_map(|offset| {
        window(floats, offset)
            .and_then(|m| classify_view(m, eps))
            .map(|layout| (offset, layout))
    })
}

/// First projection matrix in `floats`: `(float offset, handedness)`.
pub fn find_projection_matrix(floats: &[f32], eps: f32) -> Option<(usize, Handedness)> {
    find_projection_matrix_outside(floats, eps, None)
}

/// Like [`find_projection_matrix`], skipping windows that overlap the view
/// matrix at `view_offset`.
///
/// The tail of a view matrix followed by the head of the next one can carry
/// the projection fingerprint (`0, 0, 1, 0` at relative 3, 7, 11, 15).
pub fn find_projection_matrix_outside(
    floats: &[f32],
    eps: f32,
    view_offset: Option<usize>,
) -> Option<(usize, Handedness)> {
    let overlaps_view = |offset: usize| {
        view_offset.is_some_and(|view| {
            offset < view + MATRIX_FLOATS && view < offset + MATRIX_FLOATS
        })
    };

    candidate_offsets(floats.len())
        .filter(|&offset| !overlaps_view(offset))
        .find_map(|offset| {
            window(floats, offset)
                .and_then(|m| classify_projection(m, eps))
                .map(|handedness| (offset, handedness))
        })
}

// ============================================
// BYTE HELPERS
// ============================================

/// Reinterprets bytes as floats; a trailing partial float is ignored.
pub fn floats_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect()
}

/// Reads the matrix starting at `float_offset`, if it fits.
pub fn read_matrix(bytes: &[u8], float_offset: usize) -> Option<[f32; MATRIX_FLOATS]> {
    let start = float_offset.checked_mul(4)?;
    let chunk = bytes.get(start..start.checked_add(MATRIX_BYTES)?)?;
    Some(bytemuck::pod_read_unaligned(chunk))
}

/// Overwrites the matrix starting at `float_offset`. Returns false if it
/// doesn't fit.
pub fn write_matrix(bytes: &mut [u8], float_offset: usize, m: &[f32; MATRIX_FLOATS]) -> bool {
    let Some(start) = float_offset.checked_mul(4) else {
        return false;
    };
    match bytes.get_mut(start..start + MATRIX_BYTES) {
        Some(chunk) => {
            chunk.copy_from_slice(bytemuck::bytes_of(m));
            true
        }
        None => false,
    }
}

// ============================================
// TESTS
// ============================================
