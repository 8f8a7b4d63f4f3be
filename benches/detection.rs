use criterion::{black_box, criterion_group, criterion_main, Criterion};
use opencv::{
    core::{Mat, Rect, Scalar, CV_8UC3},
    imgproc::{rectangle, LINE_8},
    prelude::*,
};
use stampscan::{DetectionPipeline, PipelineConfig, PolygonDetector};

/// Synthetic album page with a 4x3 grid of bordered stamps
fn album_page() -> Mat {
    let mut page =
        Mat::new_rows_cols_with_default(1200, 1600, CV_8UC3, Scalar::all(255.0)).unwrap();
    for row in 0..3 {
        for col in 0..4 {
            let rect = Rect::new(80 + col * 380, 80 + row * 380, 240, 290);
            let fill = Scalar::new(40.0 + 50.0 * col as f64, 90.0, 60.0 + 60.0 * row as f64, 0.0);
            rectangle(&mut page, rect, fill, -1, LINE_8, 0).unwrap();
            rectangle(&mut page, rect, Scalar::all(0.0), 2, LINE_8, 0).unwrap();
        }
    }
    page
}

fn benchmark_detection(c: &mut Criterion) {
    let page = album_page();

    let polygon = PolygonDetector::default();
    c.bench_function("polygon_detect", |b| {
        b.iter(|| polygon.detect(black_box(&page)).unwrap())
    });

    let pipeline = DetectionPipeline::new(PipelineConfig {
        enable_fallback: false,
        ..PipelineConfig::default()
    });
    c.bench_function("detect_stamps", |b| {
        b.iter(|| pipeline.detect_stamps(black_box(&page)).unwrap())
    });
}

criterion_group!(benches, benchmark_detection);
criterion_main!(benches);
