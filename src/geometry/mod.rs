//! Planar geometry helpers used to initialize the calibration solver.
//!
//! - Rotation vectors (axis scaled by angle) and their conversion to matrices.
//! - Plane-to-image homographies estimated with a normalized DLT.
//! - Decomposition of a homography into a board pose given intrinsics.

use nalgebra::{DMatrix, Matrix3, Point2, Point3, RealField, Rotation3, Vector3};

#[derive(thiserror::Error, Debug)]
pub enum GeometryError {
    #[error("Need at least 4 point correspondences, got {0}")]
    NotEnoughPoints(usize),
    #[error("Point sets differ in length: {0} vs {1}")]
    LengthMismatch(usize, usize),
    #[error("SVD failed to produce a solution")]
    SvdFailed,
    #[error("Matrix singularity detected")]
    SingularMatrix,
}

/// Rotation and translation that maps pattern coordinates into the camera frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewPose {
    /// Rotation vector: unit axis scaled by the rotation angle in radians.
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl ViewPose {
    pub fn from_rotation_matrix(r: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        ViewPose {
            rotation: Rotation3::from_matrix_unchecked(*r).scaled_axis(),
            translation,
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        Rotation3::new(self.rotation).into_inner()
    }

    /// Maps a pattern point into camera coordinates.
    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        let r = [self.rotation.x, self.rotation.y, self.rotation.z];
        let rotated = rotate_point(&r, &[p.x, p.y, p.z]);
        Point3::new(
            rotated[0] + self.translation.x,
            rotated[1] + self.translation.y,
            rotated[2] + self.translation.z,
        )
    }

    /// Six components: rotation vector followed by translation.
    pub fn to_row(&self) -> [f64; 6] {
        [
            self.rotation.x,
            self.rotation.y,
            self.rotation.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }
}

/// Rotates `p` by the rotation vector `r` using the Rodrigues formula.
///
/// Generic so it can run on dual numbers. Near the identity the first-order
/// expansion `p + r x p` is used to keep derivatives finite.
pub fn rotate_point<T: RealField>(r: &[T; 3], p: &[T; 3]) -> [T; 3] {
    let theta2 =
        r[0].clone() * r[0].clone() + r[1].clone() * r[1].clone() + r[2].clone() * r[2].clone();
    let cross = |a: &[T; 3], b: &[T; 3]| -> [T; 3] {
        [
            a[1].clone() * b[2].clone() - a[2].clone() * b[1].clone(),
            a[2].clone() * b[0].clone() - a[0].clone() * b[2].clone(),
            a[0].clone() * b[1].clone() - a[1].clone() * b[0].clone(),
        ]
    };

    if theta2 > nalgebra::convert::<f64, T>(f64::EPSILON) {
        let theta = theta2.sqrt();
        let k = [
            r[0].clone() / theta.clone(),
            r[1].clone() / theta.clone(),
            r[2].clone() / theta.clone(),
        ];
        let (sin, cos) = (theta.clone().sin(), theta.cos());
        let k_cross_p = cross(&k, p);
        let k_dot_p =
            k[0].clone() * p[0].clone() + k[1].clone() * p[1].clone() + k[2].clone() * p[2].clone();
        let one_minus_cos = T::one() - cos.clone();
        [0, 1, 2].map(|i| {
            p[i].clone() * cos.clone()
                + k_cross_p[i].clone() * sin.clone()
                + k[i].clone() * k_dot_p.clone() * one_minus_cos.clone()
        })
    } else {
        let r_cross_p = cross(r, p);
        [0, 1, 2].map(|i| p[i].clone() + r_cross_p[i].clone())
    }
}

/// Similarity transform that moves the centroid to the origin and scales the
/// mean distance to `sqrt(2)`.
fn normalizing_transform(points: &[Point2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (mx, my) = (sx / n, sy / n);
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mx).powi(2) + (p.y - my).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let scale = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    Matrix3::new(
        scale, 0.0, -scale * mx, //
        0.0, scale, -scale * my, //
        0.0, 0.0, 1.0,
    )
}

fn apply(t: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let v = t * Vector3::new(p.x, p.y, 1.0);
    Point2::new(v.x / v.z, v.y / v.z)
}

/// Estimates `H` such that `image ~ H * [x, y, 1]` for points on the `z = 0` plane.
///
/// Both point sets are normalized before the DLT system is solved; the result
/// is denormalized and scaled so that `H[2,2] = 1` when that entry is non-zero.
pub fn find_homography(
    plane: &[Point2<f64>],
    image: &[Point2<f64>],
) -> Result<Matrix3<f64>, GeometryError> {
    let n = plane.len();
    if n != image.len() {
        return Err(GeometryError::LengthMismatch(n, image.len()));
    }
    if n < 4 {
        return Err(GeometryError::NotEnoughPoints(n));
    }

    let t_plane = normalizing_transform(plane);
    let t_image = normalizing_transform(image);

    // A 2n x 9 system padded to at least 9 rows so the SVD yields a full V.
    let mut a = DMatrix::<f64>::zeros((2 * n).max(9), 9);
    for (i, (pw, pi)) in plane.iter().zip(image.iter()).enumerate() {
        let w = apply(&t_plane, pw);
        let m = apply(&t_image, pi);
        let (x, y, u, v) = (w.x, w.y, m.x, m.y);

        let r0 = 2 * i;
        let r1 = 2 * i + 1;

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

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed)?;
    let (min_idx, _) = svd.singular_values.argmin();
    let h = v_t.row(min_idx);

    let mut h_norm = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            h_norm[(r, c)] = h[3 * r + c];
        }
    }

    let t_image_inv = t_image
        .try_inverse()
        .ok_or(GeometryError::SingularMatrix)?;
    let mut h_mat = t_image_inv * h_norm * t_plane;

    let scale = h_mat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h_mat /= scale;
    }
    Ok(h_mat)
}

/// Decomposes a plane-induced homography into the pose of the `z = 0` plane.
///
/// The scale is the average of the two rotation column norms and its sign is
/// chosen so the plane lies in front of the camera. The rotation is projected
/// onto SO(3) through an SVD.
pub fn pose_from_homography(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Result<ViewPose, GeometryError> {
    let k_inv = k.try_inverse().ok_or(GeometryError::SingularMatrix)?;

    let k_inv_h1 = k_inv * h.column(0);
    let k_inv_h2 = k_inv * h.column(1);
    let k_inv_h3 = k_inv * h.column(2);

    let norm = (k_inv_h1.norm() + k_inv_h2.norm()) * 0.5;
    if norm <= f64::EPSILON {
        return Err(GeometryError::SingularMatrix);
    }
    let mut lambda = 1.0 / norm;
    if k_inv_h3.z < 0.0 {
        lambda = -lambda;
    }

    let r1 = k_inv_h1 * lambda;
    let r2 = k_inv_h2 * lambda;
    let r3 = r1.cross(&r2);
    let r_mat = Matrix3::from_columns(&[r1, r2, r3]);

    let svd = r_mat.svd(true, true);
    let u = svd.u.ok_or(GeometryError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed)?;
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    Ok(ViewPose::from_rotation_matrix(&r_orth, k_inv_h3 * lambda))
}
