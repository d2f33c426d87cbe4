//! Per-splat projection math shared by the view-data, selection and edit kernels.
//!
//! Conventions: view space is right-handed looking down -Z; screen-space
//! covariances are expressed in pixels with +Y up (NDC orientation).

use glam::{Mat3, Mat4, Quat, Vec2, Vec3, Vec4};

use crate::splat_asset::SH_COEFFS;

pub const SH_C1: f32 = 0.488_602_5;
pub const SH_C2: [f32; 5] = [1.092_548_4, -1.092_548_4, 0.315_391_6, -1.092_548_4, 0.546_274_2];
pub const SH_C3: [f32; 7] = [
    -0.590_043_6,
    2.890_611_4,
    -0.457_045_8,
    0.373_176_3,
    -0.457_045_8,
    1.445_305_7,
    -0.590_043_6,
];

/// Low-pass filter added to the 2D covariance diagonal (pixels^2)
const COVARIANCE_BLUR: f32 = 0.3;

/// Upper bound on a projected axis length in pixels
const MAX_AXIS_PIXELS: f32 = 4096.0;

/// Rotation-scale matrix M such that the 3D covariance is M * M^T
#[inline]
pub fn rotation_scale_matrix(rotation: Quat, scale: Vec3) -> Mat3 {
    let r = Mat3::from_quat(rotation);
    Mat3::from_cols(r.x_axis * scale.x, r.y_axis * scale.y, r.z_axis * scale.z)
}

#[inline]
pub fn covariance_3d(rotation: Quat, scale: Vec3) -> Mat3 {
    let m = rotation_scale_matrix(rotation, scale);
    m * m.transpose()
}

/// Project a local-space 3D covariance to a screen-space 2D covariance (a, b, c).
///
/// `model_view` maps splat-local space to view space. Returns `None` when the
/// center is behind the camera.
pub fn covariance_2d(
    local_pos: Vec3,
    cov3d: Mat3,
    model_view: Mat4,
    projection: Mat4,
    viewport: Vec2,
) -> Option<Vec3> {
    let view_pos = model_view.transform_point3(local_pos);
    let depth = -view_pos.z;
    if depth <= 1e-6 {
        return None;
    }

    let p00 = projection.x_axis.x;
    let p11 = projection.y_axis.y;
    let focal = Vec2::new(viewport.x * p00 * 0.5, viewport.y * p11 * 0.5);

    // Clamp the projected center to 1.3x the frustum to keep J well-behaved
    let lim_x = 1.3 / p00.abs().max(1e-6);
    let lim_y = 1.3 / p11.abs().max(1e-6);
    let tx = (view_pos.x / depth).clamp(-lim_x, lim_x) * depth;
    let ty = (view_pos.y / depth).clamp(-lim_y, lim_y) * depth;

    // Jacobian of (x, y, z) -> (fx * x / d, fy * y / d) with d = -z
    let d2 = depth * depth;
    let j = Mat3::from_cols(
        Vec3::new(focal.x / depth, 0.0, 0.0),
        Vec3::new(0.0, focal.y / depth, 0.0),
        Vec3::new(focal.x * tx / d2, focal.y * ty / d2, 0.0),
    );
    let w = Mat3::from_mat4(model_view);
    let t = j * w;
    let cov = t * cov3d * t.transpose();

    Some(Vec3::new(
        cov.x_axis.x + COVARIANCE_BLUR,
        cov.y_axis.x,
        cov.y_axis.y + COVARIANCE_BLUR,
    ))
}

/// Decompose a 2D covariance (a, b, c) into the two ellipse axes in pixels
pub fn decompose_covariance(cov2d: Vec3) -> (Vec2, Vec2) {
    let (a, b, c) = (cov2d.x, cov2d.y, cov2d.z);
    let mid = 0.5 * (a + c);
    let radius = Vec2::new((a - c) * 0.5, b).length();
    let lambda1 = mid + radius;
    let lambda2 = (mid - radius).max(0.1);

    let mut dir = Vec2::new(b, lambda1 - a);
    if dir.length_squared() < 1e-12 {
        dir = if a >= c { Vec2::X } else { Vec2::Y };
    }
    let dir = dir.normalize();

    let v1 = (2.0 * lambda1).sqrt().min(MAX_AXIS_PIXELS) * dir;
    let v2 = (2.0 * lambda2).sqrt().min(MAX_AXIS_PIXELS) * Vec2::new(dir.y, -dir.x);
    (v1, v2)
}

/// Evaluate view-dependent color from base color + SH bands.
///
/// `dir` is the normalized direction from the camera towards the splat in splat-local space.
pub fn shade_sh(base: Vec3, sh: &[Vec3; SH_COEFFS], dir: Vec3, order: u32, sh_only: bool) -> Vec3 {
    let (x, y, z) = (dir.x, dir.y, dir.z);
    let mut res = if sh_only { Vec3::splat(0.5) } else { base };
    if order >= 1 {
        res += SH_C1 * (-sh[0] * y + sh[1] * z - sh[2] * x);
        if order >= 2 {
            let (xx, yy, zz) = (x * x, y * y, z * z);
            let (xy, yz, xz) = (x * y, y * z, x * z);
            res += (SH_C2[0] * xy) * sh[3]
                + (SH_C2[1] * yz) * sh[4]
                + (SH_C2[2] * (2.0 * zz - xx - yy)) * sh[5]
                + (SH_C2[3] * xz) * sh[6]
                + (SH_C2[4] * (xx - yy)) * sh[7];
            if order >= 3 {
                res += (SH_C3[0] * y * (3.0 * xx - yy)) * sh[8]
                    + (SH_C3[1] * xy * z) * sh[9]
                    + (SH_C3[2] * y * (4.0 * zz - xx - yy)) * sh[10]
                    + (SH_C3[3] * z * (2.0 * zz - 3.0 * xx - 3.0 * yy)) * sh[11]
                    + (SH_C3[4] * x * (4.0 * zz - xx - yy)) * sh[12]
                    + (SH_C3[5] * z * (xx - yy)) * sh[13]
                    + (SH_C3[6] * x * (xx - 3.0 * yy)) * sh[14];
            }
        }
    }
    res.max(Vec3::ZERO)
}

/// View matrix with the Z row negated so depth in front of the camera is positive
pub fn flip_view_z(view: Mat4) -> Mat4 {
    let mut m = view;
    m.x_axis.z = -m.x_axis.z;
    m.y_axis.z = -m.y_axis.z;
    m.z_axis.z = -m.z_axis.z;
    m.w_axis.z = -m.w_axis.z;
    m
}

/// Clip-space position to pixel coordinates (origin top-left, +Y down).
/// Returns `None` behind the camera.
pub fn clip_to_pixels(clip: Vec4, viewport: Vec2) -> Option<Vec2> {
    if clip.w <= 0.0 {
        return None;
    }
    let ndc = Vec2::new(clip.x, clip.y) / clip.w;
    Some(Vec2::new(
        (ndc.x * 0.5 + 0.5) * viewport.x,
        (0.5 - ndc.y * 0.5) * viewport.y,
    ))
}

/// Rotation part of an affine matrix with scale removed
pub fn matrix_rotation(m: Mat4) -> Quat {
    let (_, rotation, _) = m.to_scale_rotation_translation();
    rotation.normalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flipped_view_puts_front_at_positive_depth() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let flipped = flip_view_z(view);
        assert!((flipped.transform_point3(Vec3::ZERO).z - 5.0).abs() < 1e-5);
    }

    #[test]
    fn isotropic_splat_projects_to_circle() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0);
        let cov = covariance_3d(Quat::IDENTITY, Vec3::splat(0.1));
        let cov2d = covariance_2d(Vec3::ZERO, cov, view, proj, Vec2::splat(512.0)).unwrap();
        assert!((cov2d.x - cov2d.z).abs() < 1e-3);
        assert!(cov2d.y.abs() < 1e-3);
        let (a1, a2) = decompose_covariance(cov2d);
        assert!((a1.length() - a2.length()).abs() < 1e-2);
    }

    #[test]
    fn sh_only_starts_from_mid_gray() {
        let sh = [Vec3::ZERO; SH_COEFFS];
        let c = shade_sh(Vec3::ONE, &sh, Vec3::Z, 3, true);
        assert_eq!(c, Vec3::splat(0.5));
    }
}
