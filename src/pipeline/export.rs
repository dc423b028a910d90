//! CSV and JSON export of pipeline results.

use crate::pipeline::{PipelineResult, VelocityEstimate};
use crate::util::UtilError;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// One flat CSV record per velocity estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityRecord {
    pub u: i64,
    pub v: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
    pub du: f64,
    pub dv: f64,
    pub peak: f64,
    pub secondary_peak: f64,
    pub trusted: bool,
    pub control: bool,
}

impl From<&VelocityEstimate> for VelocityRecord {
    fn from(e: &VelocityEstimate) -> Self {
        VelocityRecord {
            u: e.pixel.x,
            v: e.pixel.y,
            x: e.position.x,
            y: e.position.y,
            z: e.position.z,
            vx: e.velocity.x,
            vy: e.velocity.y,
            vz: e.velocity.z,
            du: e.displacement.x,
            dv: e.displacement.y,
            peak: e.peak,
            secondary_peak: e.secondary_peak,
            trusted: e.trusted,
            control: e.is_control,
        }
    }
}

/// Export velocity estimates as a CSV table with a header row.
pub fn export_velocities_csv(path: impl AsRef<Path>, velocities: &[VelocityEstimate]) -> Result<(), UtilError> {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    for estimate in velocities {
        writer.serialize(VelocityRecord::from(estimate))?;
    }
    writer.flush()?;
    info!(
        "Exported {} velocities to {}",
        velocities.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Export the full pipeline result (cameras, fit statistics, shifts and
/// velocities) as pretty-printed JSON.
pub fn export_summary_json(path: impl AsRef<Path>, result: &PipelineResult) -> Result<(), UtilError> {
    let writer = BufWriter::new(File::create(path.as_ref())?);
    serde_json::to_writer_pretty(writer, result)?;
    info!("Exported pipeline summary to {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Camera, Resolution};
    use crate::optimization::{evaluate, CalibrationResult, Correspondence};
    use crate::pipeline::ShiftSample;
    use crate::tracking::MatchResult;
    use crate::util::ensure_output_dir;
    use approx::assert_relative_eq;
    use nalgebra::{Vector2, Vector3};

    fn estimate() -> VelocityEstimate {
        VelocityEstimate {
            pixel: Vector2::new(120, 80),
            position: Vector3::new(10.0, 250.0, 3.5),
            velocity: Vector3::new(0.25, -0.5, 0.0),
            displacement: Vector2::new(1.5, -0.25),
            peak: 0.92,
            secondary_peak: 0.3,
            trusted: true,
            is_control: false,
        }
    }

    fn result() -> PipelineResult {
        let camera = Camera::new(
            Vector3::new(0.0, 0.0, 100.0),
            [0.0, -0.5, 0.0],
            [400.0, 400.0],
            Resolution {
                width: 400,
                height: 300,
            },
        )
        .unwrap();
        let world: Vec<Vector3<f64>> = [-100.0, 0.0, 100.0]
            .iter()
            .flat_map(|x| [300.0, 450.0].map(|y| Vector3::new(*x, y, 0.0)))
            .collect();
        let (pixels, _) = camera.project_points(&world);
        let data: Vec<Correspondence> = world
            .iter()
            .zip(&pixels)
            .map(|(w, p)| Correspondence::new(*w, *p + Vector2::new(0.5, -0.25)))
            .collect();
        let calibration = evaluate(camera, &data, 3, true).unwrap();
        let shift = MatchResult {
            displacement: Vector2::new(-3.5, 0.75),
            peak: 0.8,
            secondary_peak: 0.2,
        };
        PipelineResult {
            camera_a: calibration.clone(),
            camera_b: CalibrationResult {
                converged: false,
                ..calibration
            },
            coarse_shift: shift,
            grid: vec![ShiftSample {
                pixel: Vector2::new(40, 60),
                result: shift,
            }],
            velocities: vec![estimate()],
        }
    }

    #[test]
    fn test_export_velocities_csv() {
        let dir = std::env::temp_dir().join("glacier_flow_export_csv");
        ensure_output_dir(&dir).unwrap();
        let path = dir.join("velocities.csv");
        export_velocities_csv(&path, &[estimate()]).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "u");
        assert_eq!(&headers[13], "control");
        let rows: Vec<VelocityRecord> = reader.deserialize().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows, vec![VelocityRecord::from(&estimate())]);
    }

    #[test]
    fn test_export_summary_json_reads_back() {
        let dir = std::env::temp_dir().join("glacier_flow_export_json");
        ensure_output_dir(&dir).unwrap();
        let path = dir.join("summary.json");
        let expected = result();
        export_summary_json(&path, &expected).unwrap();

        let loaded: PipelineResult = serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert!(loaded.camera_a.converged);
        assert!(!loaded.camera_b.converged);
        assert_eq!(loaded.camera_a.free_parameters, 3);
        assert_relative_eq!(loaded.camera_a.rmse, expected.camera_a.rmse, epsilon = 1e-12);
        assert_relative_eq!(loaded.camera_a.aic, expected.camera_a.aic, epsilon = 1e-9);
        assert_relative_eq!(loaded.camera_b.camera.viewdir, expected.camera_b.camera.viewdir);
        assert_eq!(loaded.coarse_shift, expected.coarse_shift);
        assert_eq!(loaded.grid, expected.grid);
        assert_eq!(loaded.velocities, expected.velocities);
    }

    #[test]
    fn test_export_to_missing_directory_fails() {
        let path = std::env::temp_dir()
            .join("glacier_flow_export_missing")
            .join("nested")
            .join("summary.json");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
        assert!(matches!(
            export_summary_json(&path, &result()),
            Err(UtilError::Io(_))
        ));
    }
}
