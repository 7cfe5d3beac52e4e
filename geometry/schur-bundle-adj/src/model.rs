//! Cameras, world points and observations, and how parameter updates are
//! applied to them.
//!
//! The parameter vector is the concatenation of [NUM_CAM_PARAMS] values per
//! camera followed by [NUM_POINT_PARAMS] values per point. Per camera the
//! order is: focal length, the two radial distortion coefficients, the three
//! translation components and the three components of an incremental
//! axis-angle rotation.

use nalgebra as na;
use num_traits::Float;

use crate::{Error, Result};

/// Number of parameters per camera in the parameter vector.
pub const NUM_CAM_PARAMS: usize = 9;

/// Number of parameters per world point in the parameter vector.
pub const NUM_POINT_PARAMS: usize = 3;

/// A pinhole camera with a single focal length and two radial distortion
/// coefficients.
///
/// A world point `X` is mapped into the camera frame as `R * X + t`. The
/// rotation must be orthonormal. Updates keep it orthonormal (to floating
/// point tolerance) because they compose it with another rotation.
#[derive(Clone, Debug, PartialEq)]
pub struct Camera<F: na::RealField> {
    pub focal_length: F,
    /// Radial distortion coefficients `k0` and `k1`.
    pub distortion: [F; 2],
    pub rotation: na::Matrix3<F>,
    pub translation: na::Vector3<F>,
}

impl<F: na::RealField + Float> Camera<F> {
    pub fn new(
        focal_length: F,
        distortion: [F; 2],
        rotation: na::Matrix3<F>,
        translation: na::Vector3<F>,
    ) -> Self {
        Self {
            focal_length,
            distortion,
            rotation,
            translation,
        }
    }

    /// Transform a world point into the camera frame.
    pub fn to_camera_frame(&self, pt: &na::Vector3<F>) -> na::Vector3<F> {
        self.rotation * pt + self.translation
    }

    /// Project a world point to distorted pixel coordinates.
    ///
    /// A point on the camera plane (`z == 0` in the camera frame) yields
    /// non-finite coordinates. This is not checked.
    pub fn project(&self, pt: &na::Vector3<F>) -> na::Vector2<F> {
        let pc = self.to_camera_frame(pt);
        let x = pc.x / pc.z;
        let y = pc.y / pc.z;
        let factor = radial_distortion_factor(x, y, &self.distortion);
        na::Vector2::new(x * factor * self.focal_length, y * factor * self.focal_length)
    }

    /// Return a copy of this camera with the update `delta` applied.
    ///
    /// `delta` holds [NUM_CAM_PARAMS] values. Focal length, distortion and
    /// translation are updated additively. The rotation is updated by left
    /// composition with the rotation whose axis-angle vector is `delta[6..9]`:
    /// `R_new = dR * R_old`.
    pub fn updated(&self, delta: &[F]) -> Self {
        debug_assert_eq!(delta.len(), NUM_CAM_PARAMS);
        let axis_angle = na::Vector3::new(delta[6], delta[7], delta[8]);
        let rot_update = na::Rotation3::new(axis_angle);
        Self {
            focal_length: self.focal_length + delta[0],
            distortion: [self.distortion[0] + delta[1], self.distortion[1] + delta[2]],
            rotation: rot_update.matrix() * self.rotation,
            translation: self.translation + na::Vector3::new(delta[3], delta[4], delta[5]),
        }
    }
}

/// A 3D world point.
#[derive(Clone, Debug, PartialEq)]
pub struct Point3D<F: na::RealField> {
    pub pos: na::Vector3<F>,
}

impl<F: na::RealField + Float> Point3D<F> {
    pub fn new(x: F, y: F, z: F) -> Self {
        Self {
            pos: na::Vector3::new(x, y, z),
        }
    }

    /// Return a copy of this point moved by `delta` ([NUM_POINT_PARAMS] values).
    pub fn updated(&self, delta: &[F]) -> Self {
        debug_assert_eq!(delta.len(), NUM_POINT_PARAMS);
        Self {
            pos: self.pos + na::Vector3::new(delta[0], delta[1], delta[2]),
        }
    }
}

/// The observation of world point `point_id` by camera `camera_id` at pixel
/// position `pos`.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation<F: na::RealField> {
    pub camera_id: usize,
    pub point_id: usize,
    pub pos: na::Vector2<F>,
}

impl<F: na::RealField> Observation<F> {
    pub fn new(camera_id: usize, point_id: usize, pos: na::Vector2<F>) -> Self {
        Self {
            camera_id,
            point_id,
            pos,
        }
    }
}

/// `1 + r2 * (k0 + k1 * r2)` with `r2 = x^2 + y^2`.
pub(crate) fn radial_distortion_factor<F: na::RealField + Float>(x: F, y: F, dist: &[F; 2]) -> F {
    let r2 = x * x + y * y;
    F::one() + r2 * (dist[0] + dist[1] * r2)
}

/// Length of the parameter vector for the given number of cameras and points.
pub fn num_params(num_cams: usize, num_points: usize) -> usize {
    num_cams * NUM_CAM_PARAMS + num_points * NUM_POINT_PARAMS
}

/// The slice of `delta` updating camera `camera_id`.
pub(crate) fn camera_delta<F>(delta: &[F], camera_id: usize) -> &[F] {
    let start = camera_id * NUM_CAM_PARAMS;
    &delta[start..start + NUM_CAM_PARAMS]
}

/// The slice of `delta` updating point `point_id`.
pub(crate) fn point_delta<F>(delta: &[F], num_cams: usize, point_id: usize) -> &[F] {
    let start = num_cams * NUM_CAM_PARAMS + point_id * NUM_POINT_PARAMS;
    &delta[start..start + NUM_POINT_PARAMS]
}

/// Apply the parameter update `delta` to all cameras and points in place.
pub fn update_parameters<F: na::RealField + Float>(
    delta: &na::DVector<F>,
    cameras: &mut [Camera<F>],
    points: &mut [Point3D<F>],
) -> Result<()> {
    if delta.len() != num_params(cameras.len(), points.len()) {
        return Err(Error::InconsistentData(format!(
            "update has {} entries, expected {}",
            delta.len(),
            num_params(cameras.len(), points.len())
        )));
    }
    let (cam_delta, pt_delta) = delta.as_slice().split_at(cameras.len() * NUM_CAM_PARAMS);
    for (cam, d) in cameras.iter_mut().zip(cam_delta.chunks_exact(NUM_CAM_PARAMS)) {
        *cam = cam.updated(d);
    }
    for (pt, d) in points.iter_mut().zip(pt_delta.chunks_exact(NUM_POINT_PARAMS)) {
        *pt = pt.updated(d);
    }
    Ok(())
}
