use approx::assert_relative_eq;
use glacier_flow::pipeline::{stages, Pipeline};
use glacier_flow::synthetic::{speckle_image, speckle_lattice, GlacierScene, SceneOptions};
use glacier_flow::tracking::{match_template, track_points, MatchParams, TrackPoint};
use nalgebra::Vector2;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    values[values.len() / 2]
}

#[test]
fn test_speckle_shift_is_recovered() {
    init_logger();
    let (width, height) = (4000, 1000);
    let centres = speckle_lattice(width, height, 150.0, Vector2::new(2000.0, 500.0));
    let image_a = speckle_image(width, height, &centres, 0.8, 180.0, 40.0, Vector2::zeros());
    let image_b = speckle_image(width, height, &centres, 0.8, 180.0, 40.0, Vector2::new(2.0, 0.0));

    let params = MatchParams::new(10, 40, 5);
    let result = match_template(&image_a, &image_b, Vector2::new(2000, 500), &params, Vector2::zeros()).unwrap();

    assert_relative_eq!(result.displacement.x, 2.0, epsilon = 0.1);
    assert_relative_eq!(result.displacement.y, 0.0, epsilon = 0.1);
    assert!(result.snr() > 5.0, "snr {}", result.snr());
}

#[test]
fn test_batch_tracking_on_dedicated_pool() {
    init_logger();
    let (width, height) = (1200, 400);
    let anchor = Vector2::new(300.0, 200.0);
    let centres = speckle_lattice(width, height, 150.0, anchor);
    let image_a = speckle_image(width, height, &centres, 0.8, 180.0, 40.0, Vector2::zeros());
    let image_b = speckle_image(width, height, &centres, 0.8, 180.0, 40.0, Vector2::new(-2.0, 1.0));

    let points: Vec<TrackPoint> = (0..5)
        .map(|i| TrackPoint::new(Vector2::new(300 + 150 * i, 200), Some(Vector2::new(-1.0, 1.0))))
        .collect();
    let tracked = track_points(&image_a, &image_b, &points, &MatchParams::new(10, 40, 4), Some(2)).unwrap();

    assert_eq!(tracked.len(), points.len());
    for (tracked, point) in tracked.iter().zip(&points) {
        assert_eq!(tracked.point, *point);
        let result = tracked.result.as_ref().unwrap();
        assert_relative_eq!(result.displacement, Vector2::new(-2.0, 1.0), epsilon = 0.1);
    }
}

#[test]
fn test_pipeline_on_synthetic_glacier() {
    init_logger();
    let options = SceneOptions::default();
    let scene = GlacierScene::build(options).unwrap();
    let result = Pipeline::new(scene.context(scene.pipeline_config())).run().unwrap();

    assert!(result.camera_a.rmse < 0.01, "camera A rmse {}", result.camera_a.rmse);
    assert_relative_eq!(result.camera_a.camera.viewdir, scene.camera_a.viewdir, epsilon = 1e-3);

    let yaw_change = result.camera_b.camera.viewdir.x - result.camera_a.camera.viewdir.x;
    assert_relative_eq!(yaw_change, options.yaw_change, epsilon = 1e-3);
    assert_eq!(result.camera_b.camera.focal_length, result.camera_a.camera.focal_length);

    let glacier: Vec<_> = result
        .velocities
        .iter()
        .filter(|v| v.trusted && !v.is_control)
        .collect();
    assert!(glacier.len() >= 10, "only {} trusted glacier points", glacier.len());

    let vx = median(glacier.iter().map(|v| v.velocity.x).collect());
    let vy = median(glacier.iter().map(|v| v.velocity.y).collect());
    assert_relative_eq!(vx, options.flow_speed, epsilon = 0.03);
    assert_relative_eq!(vy, 0.0, epsilon = 0.03);

    let control = result.velocities.iter().find(|v| v.is_control).unwrap();
    assert!(control.speed() < 0.03, "control speed {}", control.speed());
}

#[test]
fn test_stages_match_pipeline_run() {
    init_logger();
    let scene = GlacierScene::build(SceneOptions {
        flow_speed: 0.0,
        ..Default::default()
    })
    .unwrap();
    let ctx = scene.context(scene.pipeline_config());

    let camera_a = stages::calibrate_camera_a(&ctx).unwrap();
    let coarse = stages::coarse_shift(&ctx).unwrap();
    assert!(coarse.displacement.x < -2.0, "{:?}", coarse.displacement);

    let grid = stages::grid_shift(&ctx, &coarse).unwrap();
    let camera_b = stages::calibrate_camera_b(&ctx, &camera_a.camera, &grid).unwrap();
    let candidates = stages::generate_candidates(&ctx, &camera_a.camera).unwrap();
    let seeds = stages::camera_shake(&camera_a.camera, &camera_b.camera, &candidates);
    assert_eq!(seeds.len(), candidates.len());

    let tracked = stages::track_candidates(&ctx, &seeds).unwrap();
    let velocities = stages::georeference(&ctx, &camera_a.camera, &camera_b.camera, &candidates, &tracked).unwrap();

    let speeds: Vec<f64> = velocities.iter().filter(|v| v.trusted).map(|v| v.speed()).collect();
    assert!(speeds.len() >= 10);
    assert!(median(speeds) < 0.02);
}
