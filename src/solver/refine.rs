//! Levenberg-Marquardt pose refinement.
//!
//! Uses the `tiny_solver` crate. The pose is parameterized as a rotation-vector
//! increment `w` applied on the left of the initial rotation and an absolute
//! translation: `x_cam = Exp(w) * R0 * X + t`.

use super::SolverError;
use crate::camera::Intrinsics;
use crate::geometry::CameraPose;
use nalgebra::{DVector, Rotation3, Vector2, Vector3};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

const POSE_KEY: &str = "pose";

/// Reprojection residuals for a fixed set of 3D-2D pairs.
#[derive(Debug, Clone)]
struct ReprojectionCost {
    /// World points already rotated by the initial rotation.
    rotated: Vec<Vector3<f64>>,
    observed: Vec<Vector2<f64>>,
    intrinsics: Intrinsics,
}

fn rotate<T: nalgebra::RealField>(w: &[T; 3], p: &[T; 3]) -> [T; 3] {
    let cross = |a: &[T; 3], b: &[T; 3]| -> [T; 3] {
        [
            a[1].clone() * b[2].clone() - a[2].clone() * b[1].clone(),
            a[2].clone() * b[0].clone() - a[0].clone() * b[2].clone(),
            a[0].clone() * b[1].clone() - a[1].clone() * b[0].clone(),
        ]
    };
    let theta2 = w[0].clone() * w[0].clone() + w[1].clone() * w[1].clone() + w[2].clone() * w[2].clone();
    let (a, b) = if theta2 < nalgebra::convert(1e-12) {
        // first order; sqrt is not differentiable at zero
        (T::one(), nalgebra::convert(0.5))
    } else {
        let theta = theta2.clone().sqrt();
        (
            theta.clone().sin() / theta.clone(),
            (T::one() - theta.cos()) / theta2,
        )
    };
    let wxp = cross(w, p);
    let wxwxp = cross(w, &wxp);
    [
        p[0].clone() + a.clone() * wxp[0].clone() + b.clone() * wxwxp[0].clone(),
        p[1].clone() + a.clone() * wxp[1].clone() + b.clone() * wxwxp[1].clone(),
        p[2].clone() + a * wxp[2].clone() + b * wxwxp[2].clone(),
    ]
}

impl<T: nalgebra::RealField> Factor<T> for ReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let pose = &params[0];
        let w = [pose[0].clone(), pose[1].clone(), pose[2].clone()];
        let t = [pose[3].clone(), pose[4].clone(), pose[5].clone()];
        let fx: T = nalgebra::convert(self.intrinsics.fx);
        let fy: T = nalgebra::convert(self.intrinsics.fy);
        let cx: T = nalgebra::convert(self.intrinsics.cx);
        let cy: T = nalgebra::convert(self.intrinsics.cy);
        let min_depth: T = nalgebra::convert(1e-6);

        let mut residuals = DVector::zeros(self.observed.len() * 2);
        for (i, (p, uv)) in self.rotated.iter().zip(self.observed.iter()).enumerate() {
            let p: [T; 3] = [
                nalgebra::convert(p.x),
                nalgebra::convert(p.y),
                nalgebra::convert(p.z),
            ];
            let r = rotate(&w, &p);
            let x = r[0].clone() + t[0].clone();
            let y = r[1].clone() + t[1].clone();
            let z = r[2].clone() + t[2].clone();
            if z < min_depth {
                residuals[i * 2] = nalgebra::convert(1e6);
                residuals[i * 2 + 1] = nalgebra::convert(1e6);
                continue;
            }
            let u_obs: T = nalgebra::convert(uv.x);
            let v_obs: T = nalgebra::convert(uv.y);
            residuals[i * 2] = fx.clone() * x / z.clone() + cx.clone() - u_obs;
            residuals[i * 2 + 1] = fy.clone() * y / z + cy.clone() - v_obs;
        }
        residuals
    }
}

/// Minimizes the pixel reprojection error of `world`/`image` starting from `initial`.
pub fn refine_pose(
    initial: &CameraPose,
    world: &[Vector3<f64>],
    image: &[Vector2<f64>],
    intrinsics: &Intrinsics,
) -> Result<CameraPose, SolverError> {
    if world.len() != image.len() || world.len() < 3 {
        return Err(SolverError::InsufficientData {
            required: 3,
            found: world.len().min(image.len()),
        });
    }

    let r0 = *initial.rotation();
    let cost = ReprojectionCost {
        rotated: world.iter().map(|p| r0 * p).collect(),
        observed: image.to_vec(),
        intrinsics: *intrinsics,
    };

    let mut problem = tiny_solver::Problem::new();
    problem.add_residual_block(image.len() * 2, &[POSE_KEY], Box::new(cost), None);

    let t0 = initial.translation();
    let mut initial_values = HashMap::new();
    initial_values.insert(
        POSE_KEY.to_string(),
        DVector::from_vec(vec![0.0, 0.0, 0.0, t0.x, t0.y, t0.z]),
    );

    let optimizer = LevenbergMarquardtOptimizer::default();
    let result = optimizer
        .optimize(&problem, &initial_values, None)
        .ok_or_else(|| SolverError::Numerical("Levenberg-Marquardt did not converge".to_string()))?;
    let params = result
        .get(POSE_KEY)
        .ok_or_else(|| SolverError::Numerical("optimizer dropped the pose block".to_string()))?;
    if params.iter().any(|v| !v.is_finite()) {
        return Err(SolverError::Numerical(
            "refined pose is not finite".to_string(),
        ));
    }

    let delta = Rotation3::from_scaled_axis(Vector3::new(params[0], params[1], params[2]));
    Ok(CameraPose::from_world_to_camera(
        delta * r0,
        Vector3::new(params[3], params[4], params[5]),
    ))
}
