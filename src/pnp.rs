//! Iterative Perspective-n-Point pose estimation.
//!
//! The pose is initialised linearly and then refined by Levenberg-Marquardt
//! minimisation of the pixel reprojection error:
//!
//! - coplanar object points: a normalized DLT homography from the object
//!   plane to normalized image coordinates, decomposed into a rotation and
//!   translation,
//! - general object points (at least six): a normalized DLT estimate of the
//!   3x4 matrix `[R | t]`, projected onto SO(3).
//!
//! Pixels are expected to be undistorted. The principal point is corrected
//! for the image border, see [`CameraIntrinsics`].

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

use log::debug;
use nalgebra::{
    DMatrix, Matrix2x3, Matrix2x6, Matrix3, Matrix3x4, Matrix4, Matrix6, Point2, Point3,
    Rotation3, Vector2, Vector3, Vector6,
};

use crate::{CameraIntrinsics, Error, Result};

/// Relative eigenvalue threshold below which object points count as coplanar.
pub const PLANARITY_THRESHOLD: f64 = 1e-3;

/// Minimum number of coplanar correspondences for a pose solve.
pub const MIN_POINTS_PLANAR: usize = 4;

/// Minimum number of non-coplanar correspondences for a pose solve.
pub const MIN_POINTS_GENERAL: usize = 6;

/// Options for the iterative refinement.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde-serialize", serde(default))]
pub struct PnpOptions {
    /// Maximum number of Levenberg-Marquardt iterations.
    pub max_iterations: usize,
    /// Stop when the parameter update is smaller than this.
    pub epsilon: f64,
}

impl Default for PnpOptions {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            epsilon: 1e-10,
        }
    }
}

/// Result of a pose solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PnpSolution {
    /// Rodrigues rotation vector mapping object directions to camera
    /// directions.
    pub rotation_vector: Vector3<f64>,
    /// Position of the object origin in camera coordinates.
    pub translation: Vector3<f64>,
    /// Refinement iterations performed.
    pub iterations: usize,
    /// Root mean square pixel reprojection error of the solution.
    pub rms_error: f64,
}

/// Return `true` if the points lie (nearly) in a common plane.
///
/// The smallest eigenvalue of the centred scatter matrix is compared with
/// `threshold` times the middle one.
pub fn is_planar(points: &[Point3<f64>], threshold: f64) -> bool {
    if points.len() < 3 {
        return true;
    }
    let (_, eigenvalues) = principal_axes(points);
    eigenvalues[2] < eigenvalues[1] * threshold
}

/// Minimum number of correspondences needed for these object points.
pub fn min_points(points: &[Point3<f64>]) -> usize {
    if is_planar(points, PLANARITY_THRESHOLD) {
        MIN_POINTS_PLANAR
    } else {
        MIN_POINTS_GENERAL
    }
}

/// Estimate the pose of a camera observing `object` at pixels `image`.
///
/// Returns the transform `camera = R * object + t` as a rotation vector and
/// translation.
pub fn solve_pnp(
    object: &[Point3<f64>],
    image: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    options: &PnpOptions,
) -> Result<PnpSolution> {
    let n = object.len();
    if image.len() != n {
        return Err(Error::CountMismatch {
            points_3d: n,
            points_2d: image.len(),
        });
    }
    if n < min_points(object) {
        return Err(Error::NotEnoughPoints { found: n });
    }

    let normalized: Vec<Point2<f64>> = image
        .iter()
        .map(|p| Point2::from(intrinsics.ray(p).xy()))
        .collect();

    let (rot, t) = if is_planar(object, PLANARITY_THRESHOLD) {
        initial_pose_planar(object, &normalized)?
    } else {
        initial_pose_dlt(object, &normalized)?
    };

    refine(object, image, intrinsics, rot, t, options)
}

/// Centred principal axes (as matrix rows) and eigenvalues, largest first.
fn principal_axes(points: &[Point3<f64>]) -> (Matrix3<f64>, Vector3<f64>) {
    let centroid = centroid(points);
    let mut scatter = Matrix3::zeros();
    for p in points {
        let d = *p - centroid;
        scatter += d * d.transpose();
    }

    let eig = scatter.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

    let e0 = eig.eigenvectors.column(order[0]).into_owned();
    let e1 = eig.eigenvectors.column(order[1]).into_owned();
    let e2 = e0.cross(&e1);
    let axes = Matrix3::from_rows(&[e0.transpose(), e1.transpose(), e2.transpose()]);
    let values = Vector3::new(
        eig.eigenvalues[order[0]],
        eig.eigenvalues[order[1]],
        eig.eigenvalues[order[2]],
    );
    (axes, values)
}

fn centroid(points: &[Point3<f64>]) -> Point3<f64> {
    let sum = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.coords);
    Point3::from(sum / points.len() as f64)
}

fn initial_pose_planar(
    object: &[Point3<f64>],
    normalized: &[Point2<f64>],
) -> Result<(Rotation3<f64>, Vector3<f64>)> {
    // Express the object points in a frame where their plane is z = 0.
    let c = centroid(object);
    let (plane_rot, _) = principal_axes(object);
    let plane: Vec<Point2<f64>> = object
        .iter()
        .map(|p| Point2::from((plane_rot * (*p - c)).xy()))
        .collect();

    let h = homography_dlt(&plane, normalized)?;
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm1 = h1.norm();
    let norm2 = h2.norm();
    if norm1 <= 1e-12 || norm2 <= 1e-12 {
        return Err(Error::DegenerateConfiguration);
    }
    let lambda = 2.0 / (norm1 + norm2);

    let mut r1 = h1 * lambda;
    let mut r2 = h2 * lambda;
    let mut t = h3 * lambda;
    if t.z < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }
    let r3 = r1.cross(&r2);
    if r3.norm() <= 1e-12 {
        return Err(Error::DegenerateConfiguration);
    }

    let approx = Matrix3::from_columns(&[r1, r2, r3]);
    let rot_plane = project_to_so3(&approx)?;

    let rot = rot_plane * plane_rot;
    let t = t - rot * c.coords;
    Ok((Rotation3::from_matrix_unchecked(rot), t))
}

fn initial_pose_dlt(
    object: &[Point3<f64>],
    normalized: &[Point2<f64>],
) -> Result<(Rotation3<f64>, Vector3<f64>)> {
    let n = object.len();
    let c = centroid(object);
    let mean_dist = object.iter().map(|p| (*p - c).norm()).sum::<f64>() / n as f64;
    if mean_dist <= f64::EPSILON {
        return Err(Error::DegenerateConfiguration);
    }
    let scale = 3.0_f64.sqrt() / mean_dist;
    let t_object = Matrix4::new(
        scale,
        0.0,
        0.0,
        -scale * c.x,
        0.0,
        scale,
        0.0,
        -scale * c.y,
        0.0,
        0.0,
        scale,
        -scale * c.z,
        0.0,
        0.0,
        0.0,
        1.0,
    );

    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (pw, pi)) in object.iter().zip(normalized).enumerate() {
        let x = (pw.x - c.x) * scale;
        let y = (pw.y - c.y) * scale;
        let z = (pw.z - c.z) * scale;
        let (u, v) = (pi.x, pi.y);

        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = z;
        a[(r0, 3)] = 1.0;
        a[(r0, 8)] = -u * x;
        a[(r0, 9)] = -u * y;
        a[(r0, 10)] = -u * z;
        a[(r0, 11)] = -u;

        a[(r1, 4)] = x;
        a[(r1, 5)] = y;
        a[(r1, 6)] = z;
        a[(r1, 7)] = 1.0;
        a[(r1, 8)] = -v * x;
        a[(r1, 9)] = -v * y;
        a[(r1, 10)] = -v * z;
        a[(r1, 11)] = -v;
    }

    let p = null_vector(a)?;
    let p_norm = Matrix3x4::from_fn(|r, col| p[4 * r + col]);
    let p_mat = p_norm * t_object;

    let mut m = p_mat.fixed_view::<3, 3>(0, 0).into_owned();
    let mut s = (m.row(0).norm() + m.row(1).norm() + m.row(2).norm()) / 3.0;
    if s <= f64::EPSILON {
        return Err(Error::DegenerateConfiguration);
    }
    if m.determinant() < 0.0 {
        s = -s;
    }
    m /= s;

    let rot = project_to_so3(&m)?;
    let t = p_mat.column(3).into_owned() / s;
    Ok((Rotation3::from_matrix_unchecked(rot), t))
}

/// Estimate `H` with `dst ~ H src` by normalized DLT.
fn homography_dlt(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    let n = src.len();
    let (src_n, t_src) = normalize_points_2d(src).ok_or(Error::DegenerateConfiguration)?;
    let (dst_n, t_dst) = normalize_points_2d(dst).ok_or(Error::DegenerateConfiguration)?;

    // Padded to at least 9 rows so that four points still yield a null vector.
    let mut a = DMatrix::<f64>::zeros((2 * n).max(9), 9);
    for (i, (ps, pd)) in src_n.iter().zip(&dst_n).enumerate() {
        let (x, y) = (ps.x, ps.y);
        let (u, v) = (pd.x, pd.y);
        let r0 = 2 * i;
        let r1 = r0 + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let h = null_vector(a)?;
    let h_norm = Matrix3::from_fn(|r, c| h[3 * r + c]);
    let t_dst_inv = t_dst.try_inverse().ok_or(Error::DegenerateConfiguration)?;
    Ok(t_dst_inv * h_norm * t_src)
}

/// Right singular vector of the smallest singular value.
fn null_vector(a: DMatrix<f64>) -> Result<Vec<f64>> {
    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(Error::SvdFailed)?;
    let row = svd.singular_values.imin();
    Ok(v_t.row(row).iter().copied().collect())
}

/// Hartley normalization: zero mean, average distance sqrt(2).
fn normalize_points_2d(points: &[Point2<f64>]) -> Option<(Vec<Point2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let mean = points
        .iter()
        .fold(Vector2::zeros(), |acc, p| acc + p.coords)
        / n;
    let mean_dist = points.iter().map(|p| (p.coords - mean).norm()).sum::<f64>() / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }

    let scale = 2.0_f64.sqrt() / mean_dist;
    let t = Matrix3::new(
        scale,
        0.0,
        -scale * mean.x,
        0.0,
        scale,
        -scale * mean.y,
        0.0,
        0.0,
        1.0,
    );
    let normalized = points
        .iter()
        .map(|p| Point2::from((p.coords - mean) * scale))
        .collect();
    Some((normalized, t))
}

/// Closest rotation matrix in the Frobenius sense.
fn project_to_so3(m: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let u = svd.u.ok_or(Error::SvdFailed)?;
    let v_t = svd.v_t.ok_or(Error::SvdFailed)?;
    let r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        return Ok(u_flipped * v_t);
    }
    Ok(r)
}

/// Skew-symmetric matrix such that `skew(v) * w == v.cross(&w)`.
fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

fn reprojection_cost(
    object: &[Point3<f64>],
    image: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    rot: &Rotation3<f64>,
    t: &Vector3<f64>,
) -> f64 {
    object
        .iter()
        .zip(image)
        .map(|(p, obs)| {
            let cam = rot * p.coords + t;
            (intrinsics.project(&cam) - *obs).norm_squared()
        })
        .sum()
}

/// Levenberg-Marquardt on the rotation (left-multiplicative update) and
/// translation.
fn refine(
    object: &[Point3<f64>],
    image: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    mut rot: Rotation3<f64>,
    mut t: Vector3<f64>,
    options: &PnpOptions,
) -> Result<PnpSolution> {
    const MAX_DAMPING_STEPS: usize = 10;

    let mut cost = reprojection_cost(object, image, intrinsics, &rot, &t);
    if !cost.is_finite() {
        return Err(Error::DegenerateConfiguration);
    }
    let mut lambda = 1e-3;
    let mut iterations = 0;

    while iterations < options.max_iterations {
        iterations += 1;

        let mut jtj = Matrix6::<f64>::zeros();
        let mut jtr = Vector6::<f64>::zeros();
        for (p, obs) in object.iter().zip(image) {
            let rp = rot * p.coords;
            let x = rp + t;
            if x.z.abs() <= f64::EPSILON {
                continue;
            }
            let inv_z = 1.0 / x.z;
            let d_proj = Matrix2x3::new(
                intrinsics.fx * inv_z,
                0.0,
                -intrinsics.fx * x.x * inv_z * inv_z,
                0.0,
                intrinsics.fy * inv_z,
                -intrinsics.fy * x.y * inv_z * inv_z,
            );
            let d_rot = d_proj * (-skew(&rp));

            let mut j = Matrix2x6::<f64>::zeros();
            j.fixed_view_mut::<2, 3>(0, 0).copy_from(&d_rot);
            j.fixed_view_mut::<2, 3>(0, 3).copy_from(&d_proj);

            let r: Vector2<f64> = intrinsics.project(&x) - *obs;
            jtj += j.transpose() * j;
            jtr += j.transpose() * r;
        }

        let mut accepted = None;
        for _ in 0..MAX_DAMPING_STEPS {
            let mut a = jtj;
            for i in 0..6 {
                a[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
            }
            let Some(delta) = a.cholesky().map(|c| c.solve(&(-jtr))) else {
                lambda *= 10.0;
                continue;
            };

            let rot_new = Rotation3::new(delta.fixed_rows::<3>(0).into_owned()) * rot;
            let t_new = t + delta.fixed_rows::<3>(3);
            let cost_new = reprojection_cost(object, image, intrinsics, &rot_new, &t_new);
            if cost_new.is_finite() && cost_new < cost {
                lambda = (lambda / 10.0).max(1e-12);
                accepted = Some((rot_new, t_new, cost_new, delta.norm()));
                break;
            }
            lambda *= 10.0;
        }

        let Some((rot_new, t_new, cost_new, step)) = accepted else {
            break;
        };
        debug!("PnP iteration {iterations}: cost {cost_new:e}, step {step:e}");
        rot = rot_new;
        t = t_new;
        cost = cost_new;
        if step < options.epsilon {
            break;
        }
    }

    let rms_error = (cost / object.len() as f64).sqrt();
    Ok(PnpSolution {
        rotation_vector: rot.scaled_axis(),
        translation: t,
        iterations,
        rms_error,
    })
}
