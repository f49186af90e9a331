//! Head-pose estimation from face-mesh landmarks.
//!
//! Six mesh anchors are paired as 2D pixel positions and 3D object points,
//! a perspective-n-point problem is solved against a synthetic pinhole camera
//! with Levenberg–Marquardt, and the resulting rotation is decomposed into
//! pitch/yaw/roll and thresholded into a [`HeadDirection`].

use crate::mesh::FaceMesh;
use crate::types::HeadDirection;
use thiserror::Error;

/// Mesh indices: nose tip, left eye outer corner, left mouth corner, chin,
/// right eye outer corner, right mouth corner.
pub const POSE_ANCHORS: [usize; 6] = [1, 33, 61, 199, 263, 291];

/// Degrees are multiplied by this before thresholding; the default
/// [`PoseThresholds`] assume it.
pub const DEFAULT_ANGLE_SCALE: f64 = 360.0;

const LM_MAX_ITERATIONS: usize = 100;
const LM_MAX_DAMPING_STEPS: usize = 12;
const LM_INITIAL_LAMBDA: f64 = 1e-3;
const MIN_CORRESPONDENCES: usize = 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoseError {
    #[error("mesh has {len} points, anchor {index} is out of range")]
    MissingAnchor { len: usize, index: usize },
    #[error("need at least 4 correspondences, got {0}")]
    TooFewPoints(usize),
    #[error("{object} object points but {image} image points")]
    CountMismatch { object: usize, image: usize },
    #[error("degenerate point configuration")]
    Degenerate,
    #[error("pose solve diverged")]
    Diverged,
}

/// Pinhole camera without distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub focal: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    /// Focal length = image width, principal point = image centre.
    pub fn synthetic(width: u32, height: u32) -> Self {
        Self {
            focal: width as f64,
            cx: width as f64 / 2.0,
            cy: height as f64 / 2.0,
        }
    }

    fn project(&self, rotation: &Mat3, translation: &[f64; 3], point: &[f64; 3]) -> [f64; 2] {
        let c = mat_vec(rotation, point);
        let z = (c[2] + translation[2]).max(1e-9);
        [
            self.focal * (c[0] + translation[0]) / z + self.cx,
            self.focal * (c[1] + translation[1]) / z + self.cy,
        ]
    }
}

/// Rotation (axis-angle) and translation mapping object points to camera space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PnpSolution {
    pub rvec: [f64; 3],
    pub tvec: [f64; 3],
    /// RMS reprojection error in pixels.
    pub rms_error: f64,
}

/// Rotation decomposed as `Rz(roll) · Ry(yaw) · Rx(pitch)`, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EulerAngles {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

impl EulerAngles {
    pub fn from_matrix(r: &Mat3) -> Self {
        let pitch = r[2][1].atan2(r[2][2]);
        let yaw = (-r[2][0]).atan2((r[2][1] * r[2][1] + r[2][2] * r[2][2]).sqrt());
        let roll = r[1][0].atan2(r[0][0]);
        Self {
            pitch: pitch.to_degrees(),
            yaw: yaw.to_degrees(),
            roll: roll.to_degrees(),
        }
    }

    fn scaled(self, scale: f64) -> Self {
        Self {
            pitch: self.pitch * scale,
            yaw: self.yaw * scale,
            roll: self.roll * scale,
        }
    }
}

/// Direction thresholds, applied to scaled angles. First matching rule wins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseThresholds {
    /// `yaw < -yaw` → Left, `yaw > yaw` → Right.
    pub yaw: f64,
    /// `pitch > pitch_up` → Up.
    pub pitch_up: f64,
}

impl Default for PoseThresholds {
    fn default() -> Self {
        Self { yaw: 9.0, pitch_up: 15.0 }
    }
}

impl PoseThresholds {
    pub fn classify(&self, pose: &EulerAngles) -> HeadDirection {
        if pose.yaw < -self.yaw {
            HeadDirection::Left
        } else if pose.yaw > self.yaw {
            HeadDirection::Right
        } else if pose.pitch > self.pitch_up {
            HeadDirection::Up
        } else {
            HeadDirection::Front
        }
    }
}

/// Mesh → direction, with the angle scale and thresholds it was tuned for.
#[derive(Debug, Clone, Copy)]
pub struct HeadPoseSolver {
    pub thresholds: PoseThresholds,
    pub angle_scale: f64,
}

impl Default for HeadPoseSolver {
    fn default() -> Self {
        Self {
            thresholds: PoseThresholds::default(),
            angle_scale: DEFAULT_ANGLE_SCALE,
        }
    }
}

impl HeadPoseSolver {
    /// Scaled Euler angles of the head described by `mesh`.
    pub fn estimate(&self, mesh: &FaceMesh, width: u32, height: u32) -> Result<EulerAngles, PoseError> {
        let (object, image) = anchor_points(mesh, width, height)?;
        let camera = CameraIntrinsics::synthetic(width, height);
        let solution = solve_pnp(&object, &image, &camera)?;
        let angles = EulerAngles::from_matrix(&rodrigues(&solution.rvec)).scaled(self.angle_scale);

        tracing::debug!(
            pitch = angles.pitch,
            yaw = angles.yaw,
            roll = angles.roll,
            rms = solution.rms_error,
            "head pose solved"
        );
        Ok(angles)
    }

    pub fn classify(&self, mesh: &FaceMesh, width: u32, height: u32) -> Result<HeadDirection, PoseError> {
        let angles = self.estimate(mesh, width, height)?;
        Ok(self.thresholds.classify(&angles))
    }
}

/// Anchor correspondences: 2D `(x·W, y·H)` and 3D `(x·W, y·H, z)`.
///
/// Pixel coordinates are truncated to whole pixels before solving; the
/// thresholds were tuned on integer positions.
pub fn anchor_points(
    mesh: &FaceMesh,
    width: u32,
    height: u32,
) -> Result<(Vec<[f64; 3]>, Vec<[f64; 2]>), PoseError> {
    let (w, h) = (width as f64, height as f64);
    let mut object = Vec::with_capacity(POSE_ANCHORS.len());
    let mut image = Vec::with_capacity(POSE_ANCHORS.len());

    for &index in &POSE_ANCHORS {
        let p = mesh.points.get(index).ok_or(PoseError::MissingAnchor {
            len: mesh.points.len(),
            index,
        })?;
        let (x, y) = ((p.x as f64 * w).trunc(), (p.y as f64 * h).trunc());
        image.push([x, y]);
        object.push([x, y, p.z as f64]);
    }

    Ok((object, image))
}

pub type Mat3 = [[f64; 3]; 3];

fn mat_vec(m: &Mat3, v: &[f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

/// Axis-angle vector → rotation matrix.
pub fn rodrigues(rvec: &[f64; 3]) -> Mat3 {
    let theta = (rvec[0] * rvec[0] + rvec[1] * rvec[1] + rvec[2] * rvec[2]).sqrt();
    if theta < 1e-12 {
        return [
            [1.0, -rvec[2], rvec[1]],
            [rvec[2], 1.0, -rvec[0]],
            [-rvec[1], rvec[0], 1.0],
        ];
    }

    let (kx, ky, kz) = (rvec[0] / theta, rvec[1] / theta, rvec[2] / theta);
    let (s, c) = theta.sin_cos();
    let v = 1.0 - c;
    [
        [c + kx * kx * v, kx * ky * v - kz * s, kx * kz * v + ky * s],
        [ky * kx * v + kz * s, c + ky * ky * v, ky * kz * v - kx * s],
        [kz * kx * v - ky * s, kz * ky * v + kx * s, c + kz * kz * v],
    ]
}

/// Solve for the pose minimising reprojection error (Levenberg–Marquardt with
/// a central-difference Jacobian), starting from a weak-perspective guess.
pub fn solve_pnp(
    object: &[[f64; 3]],
    image: &[[f64; 2]],
    camera: &CameraIntrinsics,
) -> Result<PnpSolution, PoseError> {
    if object.len() != image.len() {
        return Err(PoseError::CountMismatch { object: object.len(), image: image.len() });
    }
    if object.len() < MIN_CORRESPONDENCES {
        return Err(PoseError::TooFewPoints(object.len()));
    }

    let residuals = |p: &[f64; 6]| -> Vec<f64> {
        let rotation = rodrigues(&[p[0], p[1], p[2]]);
        let translation = [p[3], p[4], p[5]];
        object
            .iter()
            .zip(image)
            .flat_map(|(o, i)| {
                let proj = camera.project(&rotation, &translation, o);
                [proj[0] - i[0], proj[1] - i[1]]
            })
            .collect()
    };
    let mut params = initial_guess(object, image, camera)?;
    let mut current = sum_squares(&residuals(&params));
    let mut lambda = LM_INITIAL_LAMBDA;

    for _ in 0..LM_MAX_ITERATIONS {
        if current < 1e-18 {
            break;
        }

        let r = residuals(&params);
        let jacobian = numeric_jacobian(&residuals, &params);

        let mut jtj = [[0.0f64; 6]; 6];
        let mut jtr = [0.0f64; 6];
        for (row, res) in jacobian.iter().zip(&r) {
            for a in 0..6 {
                jtr[a] += row[a] * res;
                for b in 0..6 {
                    jtj[a][b] += row[a] * row[b];
                }
            }
        }

        let mut improved = false;
        for _ in 0..LM_MAX_DAMPING_STEPS {
            let mut damped = jtj;
            for (d, row) in damped.iter_mut().enumerate() {
                row[d] += lambda * jtj[d][d].max(1e-9);
            }
            let rhs = jtr.map(|g| -g);

            if let Some(step) = solve_linear(damped, rhs) {
                let mut candidate = params;
                for (c, s) in candidate.iter_mut().zip(step) {
                    *c += s;
                }
                let candidate_cost = sum_squares(&residuals(&candidate));
                if candidate_cost.is_finite() && candidate_cost < current {
                    let step_norm = step.iter().map(|s| s * s).sum::<f64>().sqrt();
                    let decrease = current - candidate_cost;
                    params = candidate;
                    current = candidate_cost;
                    lambda = (lambda / 10.0).max(1e-12);
                    improved = step_norm > 1e-12 && decrease > current * 1e-15;
                    break;
                }
            }
            lambda *= 10.0;
        }

        if !improved {
            break;
        }
    }

    if params.iter().any(|p| !p.is_finite()) || !current.is_finite() {
        return Err(PoseError::Diverged);
    }

    Ok(PnpSolution {
        rvec: [params[0], params[1], params[2]],
        tvec: [params[3], params[4], params[5]],
        rms_error: (current / object.len() as f64).sqrt(),
    })
}

/// Zero rotation; depth from the ratio of object to image spread, `x`/`y`
/// from back-projecting the image centroid.
fn initial_guess(
    object: &[[f64; 3]],
    image: &[[f64; 2]],
    camera: &CameraIntrinsics,
) -> Result<[f64; 6], PoseError> {
    let n = object.len() as f64;
    let (mut ox, mut oy) = (0.0, 0.0);
    let (mut ix, mut iy) = (0.0, 0.0);
    for (o, i) in object.iter().zip(image) {
        ox += o[0];
        oy += o[1];
        ix += i[0];
        iy += i[1];
    }
    let (ox, oy, ix, iy) = (ox / n, oy / n, ix / n, iy / n);

    let object_spread = rms_spread(object.iter().map(|o| (o[0], o[1])), (ox, oy));
    let image_spread = rms_spread(image.iter().map(|i| (i[0], i[1])), (ix, iy));
    if object_spread < 1e-9 || image_spread < 1e-9 {
        return Err(PoseError::Degenerate);
    }

    let tz = camera.focal * object_spread / image_spread;
    let tx = (ix - camera.cx) * tz / camera.focal - ox;
    let ty = (iy - camera.cy) * tz / camera.focal - oy;
    Ok([0.0, 0.0, 0.0, tx, ty, tz])
}

fn rms_spread(points: impl Iterator<Item = (f64, f64)>, centre: (f64, f64)) -> f64 {
    let (sum, count) = points.fold((0.0, 0usize), |(s, c), (x, y)| {
        (s + (x - centre.0).powi(2) + (y - centre.1).powi(2), c + 1)
    });
    (sum / count.max(1) as f64).sqrt()
}

fn sum_squares(r: &[f64]) -> f64 {
    r.iter().map(|v| v * v).sum()
}

fn numeric_jacobian(f: &dyn Fn(&[f64; 6]) -> Vec<f64>, params: &[f64; 6]) -> Vec<[f64; 6]> {
    let mut columns: Vec<Vec<f64>> = Vec::with_capacity(6);
    for k in 0..6 {
        let h = 1e-6 * params[k].abs().max(1.0);
        let (mut plus, mut minus) = (*params, *params);
        plus[k] += h;
        minus[k] -= h;
        let (fp, fm) = (f(&plus), f(&minus));
        columns.push(fp.iter().zip(&fm).map(|(a, b)| (a - b) / (2.0 * h)).collect());
    }

    let rows = columns.first().map_or(0, Vec::len);
    (0..rows)
        .map(|i| std::array::from_fn(|k| columns[k][i]))
        .collect()
}

/// Gaussian elimination with partial pivoting. `None` when singular.
fn solve_linear<const N: usize>(mut a: [[f64; N]; N], mut b: [f64; N]) -> Option<[f64; N]> {
    for col in 0..N {
        let mut max_row = col;
        let mut max_val = a[col][col].abs();
        for row in (col + 1)..N {
            if a[row][col].abs() > max_val {
                max_val = a[row][col].abs();
                max_row = row;
            }
        }
        a.swap(col, max_row);
        b.swap(col, max_row);

        let pivot = a[col][col];
        if pivot.abs() < 1e-15 {
            return None;
        }

        for row in (col + 1)..N {
            let factor = a[row][col] / pivot;
            for j in col..N {
                a[row][j] -= factor * a[col][j];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0f64; N];
    for i in (0..N).rev() {
        x[i] = b[i];
        for j in (i + 1)..N {
            x[i] -= a[i][j] * x[j];
        }
        x[i] /= a[i][i];
    }
    Some(x)
}
