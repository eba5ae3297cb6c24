//! End-to-end beam map runs against the simulated bench.

use async_trait::async_trait;
use beammap::config::{Delimiter, MapKind, Settings};
use beammap::hardware::capabilities::{Axis, MotionAdapter, PhasorSample};
use beammap::hardware::mock::{BenchCommand, SimulatedBench};
use beammap::hardware::{Device, DeviceProvider};
use beammap::map::{MapController, RunPhase, ScanEvent};
use beammap::measurement::SampleParsePolicy;
use beammap::{record_zero_offsets, run_map, BeammapError, RunRequest};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Five-point azimuth cut at two frequencies, one reading per point, no offset.
fn small_scalar_settings() -> Settings {
    let mut settings = Settings::default();
    settings.azimuth.xmin = -10.0;
    settings.azimuth.xmax = 10.0;
    settings.azimuth.xinc = 5.0;
    settings.synth.freq = vec![74.0, 75.0];
    settings.multi.nrdgs = 1;
    settings.offset.enabled = false;
    settings
}

fn request(dir: &TempDir, name: &str) -> RunRequest {
    RunRequest {
        output_path: dir.path().join(name),
        timestamp: "20240101_120000".to_string(),
        config_file: "beammap.toml".to_string(),
    }
}

fn read_file(path: &Path) -> (Vec<String>, Vec<String>) {
    let text = std::fs::read_to_string(path).expect("Failed to read output file");
    text.lines()
        .map(str::to_string)
        .partition(|line| line.starts_with('#'))
}

fn move_velocities(journal: &[BenchCommand]) -> Vec<f64> {
    journal
        .iter()
        .filter_map(|c| match c {
            BenchCommand::Move { velocity_deg_s, .. } => Some(*velocity_deg_s),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_scalar_map_constant_detector() {
    let settings = small_scalar_settings();
    let dir = tempfile::tempdir().unwrap();
    let mut bench = SimulatedBench::new().with_response(|_| 5.0);

    let summary = run_map(&settings, &mut bench, request(&dir, "map.csv"))
        .await
        .expect("Map should complete");

    assert_eq!(summary.rows_written, 5);
    assert_eq!(summary.points_planned, 5);
    let (header, rows) = read_file(&summary.output_path);
    assert_eq!(
        rows,
        vec![
            "-10.000,5,0,5,0",
            "-5.000,5,0,5,0",
            "0.000,5,0,5,0",
            "5.000,5,0,5,0",
            "10.000,5,0,5,0",
        ]
    );
    assert_eq!(header[0], "# Beammap Timestamp: 20240101_120000");
    assert_eq!(header[1], "# Configfile: beammap.toml");
    assert_eq!(
        header.last().unwrap(),
        "# Az,f74.0GHz,f74.0GHz std,f75.0GHz,f75.0GHz std"
    );

    let journal = bench.journal().await;
    // first point at slew speed, the rest at map speed
    assert_eq!(move_velocities(&journal), vec![5.0, 2.0, 2.0, 2.0, 2.0]);
    assert_eq!(journal.last(), Some(&BenchCommand::Home(Axis::Azimuth)));
    assert!(journal.contains(&BenchCommand::Frequency(75.0e9)));
}

#[tokio::test(start_paused = true)]
async fn test_fault_on_third_move_keeps_completed_rows() {
    let settings = small_scalar_settings();
    let dir = tempfile::tempdir().unwrap();
    let req = request(&dir, "faulted.csv");
    let path = req.output_path.clone();
    let mut bench = SimulatedBench::new().with_response(|_| 5.0).fail_move_on(3);

    let err = run_map(&settings, &mut bench, req)
        .await
        .expect_err("Map should fail");

    let site = err.site().expect("Should be a measurement error");
    assert_eq!(site.phase, RunPhase::Scanning);
    assert_eq!(site.point_index, Some(2));
    assert_eq!(site.azimuth, Some(0.0));
    assert!(err.to_string().contains("position index 2"), "{err}");

    let (_, rows) = read_file(&path);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1], "-5.000,5,0,5,0");

    // best-effort return home
    assert_eq!(
        bench.journal().await.last(),
        Some(&BenchCommand::Home(Axis::Azimuth))
    );
}

#[tokio::test(start_paused = true)]
async fn test_sample_fault_names_frequency() {
    let settings = small_scalar_settings();
    let dir = tempfile::tempdir().unwrap();
    // second point, second frequency
    let mut bench = SimulatedBench::new().with_response(|_| 5.0).fail_sample_on(4);

    let err = run_map(&settings, &mut bench, request(&dir, "map.csv"))
        .await
        .expect_err("Map should fail");
    let site = err.site().expect("Should be a measurement error");
    assert_eq!(site.point_index, Some(1));
    assert_eq!(site.frequency_ghz, Some(75.0));

    let (_, rows) = read_file(&dir.path().join("map.csv"));
    assert_eq!(rows, vec!["-10.000,5,0,5,0"]);
}

#[tokio::test(start_paused = true)]
async fn test_zero_offset_removed_in_quadrature() {
    let mut settings = small_scalar_settings();
    settings.offset.enabled = true;
    settings.synth.freq = vec![74.0];
    let dir = tempfile::tempdir().unwrap();
    let mut bench =
        SimulatedBench::new().with_response(|s| if s.output_on { 3.0 } else { 2.0 });

    let summary = run_map(&settings, &mut bench, request(&dir, "offset.csv"))
        .await
        .expect("Map should complete");

    let offset = summary.offset.expect("Offset should be measured");
    assert_eq!(offset.value, 2.0);
    let (header, rows) = read_file(&summary.output_path);
    assert!(header.contains(&"# Voltage offset: 2 +/- 0".to_string()));
    assert!(rows.iter().all(|r| r.ends_with(",2.23607,0")), "{rows:?}");

    let journal = bench.journal().await;
    let off = journal
        .iter()
        .position(|c| *c == BenchCommand::OutputOff)
        .unwrap();
    assert_eq!(journal[off + 1], BenchCommand::OutputOn);
}

#[tokio::test(start_paused = true)]
async fn test_device_open_failure_writes_nothing() {
    let settings = small_scalar_settings();
    let dir = tempfile::tempdir().unwrap();
    let req = request(&dir, "never.csv");
    let path = req.output_path.clone();
    let mut bench = SimulatedBench::new().unavailable(Device::Multimeter);

    let err = run_map(&settings, &mut bench, req).await.unwrap_err();
    match err {
        BeammapError::DeviceUnavailable { device, .. } => {
            assert_eq!(device, Device::Multimeter)
        }
        other => panic!("Unexpected error: {other}"),
    }
    assert!(!path.exists());
}

/// Provider that must never be consulted.
struct UntouchedProvider;

#[async_trait]
impl DeviceProvider for UntouchedProvider {
    async fn open_motion(&mut self, _settings: &Settings) -> anyhow::Result<Box<dyn MotionAdapter>> {
        panic!("provider consulted before validation");
    }
}

#[tokio::test(start_paused = true)]
async fn test_invalid_bounds_fail_before_any_device_io() {
    let mut settings = small_scalar_settings();
    settings.azimuth.xmax = 200.0;
    let dir = tempfile::tempdir().unwrap();

    let err = run_map(&settings, &mut UntouchedProvider, request(&dir, "bad.csv"))
        .await
        .unwrap_err();
    assert!(matches!(err, BeammapError::Configuration(_)), "{err}");
    assert!(err.to_string().contains("xmax"));
}

#[tokio::test(start_paused = true)]
async fn test_backwards_step_is_configuration_error() {
    let mut settings = small_scalar_settings();
    settings.azimuth.xinc = -5.0;
    let dir = tempfile::tempdir().unwrap();

    let err = run_map(&settings, &mut UntouchedProvider, request(&dir, "bad.csv"))
        .await
        .unwrap_err();
    assert!(matches!(err, BeammapError::Configuration(_)), "{err}");
}

#[tokio::test(start_paused = true)]
async fn test_leveled_power_table_recorded_and_applied() {
    let mut settings = small_scalar_settings();
    settings.synth.freq = vec![74.0];
    settings.leveling.enabled = true;
    let dir = tempfile::tempdir().unwrap();
    // 2 V at 0 dBm, reaches the 6-7 V band at +10 dBm
    let mut bench = SimulatedBench::new()
        .with_response(|s| 2.0 * 10f64.powf(s.power_dbm / 20.0));

    let summary = run_map(&settings, &mut bench, request(&dir, "leveled.csv"))
        .await
        .expect("Map should complete");

    let table = summary.power_table.expect("Power table");
    assert_eq!(table.power_at(0), Some(10.0));
    let (header, rows) = read_file(&summary.output_path);
    assert!(header.contains(&"# Adjusted boresight power levels: f:74 GHz P:10 dBm".to_string()));
    assert!(rows[0].starts_with("-10.000,6.32456,"), "{}", rows[0]);

    let journal = bench.journal().await;
    let applied = journal
        .iter()
        .filter(|c| **c == BenchCommand::Power(10.0))
        .count();
    // once while leveling, then once per point
    assert_eq!(applied, 1 + 5);
}

#[tokio::test(start_paused = true)]
async fn test_discard_policy_ignores_bad_samples() {
    let mut settings = small_scalar_settings();
    settings.synth.freq = vec![74.0];
    settings.multi.nrdgs = 2;
    settings.output.parse_policy = SampleParsePolicy::Discard;
    let dir = tempfile::tempdir().unwrap();
    let mut bench = SimulatedBench::new()
        .with_response(|_| 4.0)
        .script_samples(["OVLD", "4.0"]);

    let summary = run_map(&settings, &mut bench, request(&dir, "discard.csv"))
        .await
        .expect("Map should complete");
    let (_, rows) = read_file(&summary.output_path);
    assert_eq!(rows[0], "-10.000,4,0");
}

#[tokio::test(start_paused = true)]
async fn test_substitute_zero_policy_biases_low() {
    let mut settings = small_scalar_settings();
    settings.synth.freq = vec![74.0];
    settings.multi.nrdgs = 2;
    let dir = tempfile::tempdir().unwrap();
    let mut bench = SimulatedBench::new()
        .with_response(|_| 4.0)
        .script_samples(["OVLD", "4.0"]);

    let summary = run_map(&settings, &mut bench, request(&dir, "zero.csv"))
        .await
        .expect("Map should complete");
    let (_, rows) = read_file(&summary.output_path);
    assert_eq!(rows[0], "-10.000,2,2");
    assert_eq!(rows[1], "-5.000,4,0");
}

fn vector_settings(kind: MapKind) -> Settings {
    let mut settings = Settings::default();
    settings.general.kind = kind;
    settings.devices.use_multi = false;
    settings.devices.use_vv = true;
    settings.azimuth.xmin = -1.0;
    settings.azimuth.xmax = 1.0;
    settings.azimuth.xinc = 1.0;
    settings.synth.freq = vec![74.0];
    settings.vector_voltmeter.avg_value = 1;
    settings
}

#[tokio::test(start_paused = true)]
async fn test_vector_map_rows_carry_ratio_and_phase() {
    let settings = vector_settings(MapKind::Vector);
    let dir = tempfile::tempdir().unwrap();
    let mut bench = SimulatedBench::new().with_phasor_response(|_| PhasorSample {
        magnitude: 0.5,
        phase_deg: -30.0,
    });

    let summary = run_map(&settings, &mut bench, request(&dir, "vector.csv"))
        .await
        .expect("Map should complete");
    let (header, rows) = read_file(&summary.output_path);
    assert_eq!(rows, vec!["-1.000,0.5,-30", "0.000,0.5,-30", "1.000,0.5,-30"]);
    assert_eq!(
        header.last().unwrap(),
        "# Az,f74.0GHz ratio,f74.0GHz phase"
    );
    assert!(summary.offset.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_digital_map_walks_every_channel() {
    let mut settings = vector_settings(MapKind::Digital);
    settings.devices.use_labjack = true;
    settings.labjack.channels = 2;
    let dir = tempfile::tempdir().unwrap();
    let mut bench = SimulatedBench::new().with_phasor_response(|s| PhasorSample {
        magnitude: s.channel.map_or(0.0, |c| f64::from(c) + 1.0),
        phase_deg: 10.0,
    });

    let summary = run_map(&settings, &mut bench, request(&dir, "digital.csv"))
        .await
        .expect("Map should complete");
    let (_, rows) = read_file(&summary.output_path);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.ends_with(",1,10,2,10")), "{rows:?}");

    let lows: Vec<u8> = bench
        .journal()
        .await
        .iter()
        .filter_map(|c| match c {
            BenchCommand::Channel(ch, beammap::hardware::DigitalLevel::Low) => Some(*ch),
            _ => None,
        })
        .collect();
    assert_eq!(lows, vec![0, 1, 0, 1, 0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_phase_map_writes_real_and_imaginary() {
    let mut settings = Settings::default();
    settings.general.kind = MapKind::Phase;
    settings.devices.use_synth = false;
    settings.devices.use_multi = false;
    settings.devices.use_vna = true;
    settings.azimuth.xmin = 0.0;
    settings.azimuth.xmax = 2.0;
    settings.azimuth.xinc = 2.0;
    settings.vna.freq = vec![12.0, 12.5];
    let dir = tempfile::tempdir().unwrap();
    let mut bench = SimulatedBench::new().with_phasor_response(|_| PhasorSample {
        magnitude: 2.0,
        phase_deg: 0.0,
    });

    let summary = run_map(&settings, &mut bench, request(&dir, "phase.csv"))
        .await
        .expect("Map should complete");
    let (header, rows) = read_file(&summary.output_path);
    assert_eq!(rows, vec!["0.000,2,0,2,0", "2.000,2,0,2,0"]);
    assert_eq!(
        header.last().unwrap(),
        "# Az,f12.0GHz re,f12.0GHz im,f12.5GHz re,f12.5GHz im"
    );
    assert!(bench
        .journal()
        .await
        .contains(&BenchCommand::ConfigureSweep(vec![12.0e9, 12.5e9])));
}

#[tokio::test(start_paused = true)]
async fn test_raster_grid_with_tab_delimiter() {
    let mut settings = small_scalar_settings();
    settings.synth.freq = vec![74.0];
    settings.azimuth.xmin = -1.0;
    settings.azimuth.xmax = 1.0;
    settings.azimuth.xinc = 1.0;
    settings.elevation.enabled = true;
    settings.elevation.ymin = 0.0;
    settings.elevation.ymax = 1.0;
    settings.elevation.yinc = 1.0;
    settings.output.delimiter = Delimiter::Tab;
    let dir = tempfile::tempdir().unwrap();
    let mut bench = SimulatedBench::new().with_response(|_| 5.0);

    let summary = run_map(&settings, &mut bench, request(&dir, "raster.txt"))
        .await
        .expect("Map should complete");
    let (header, rows) = read_file(&summary.output_path);
    assert_eq!(
        rows,
        vec![
            "-1.000\t0.000\t5\t0",
            "0.000\t0.000\t5\t0",
            "1.000\t0.000\t5\t0",
            "-1.000\t1.000\t5\t0",
            "0.000\t1.000\t5\t0",
            "1.000\t1.000\t5\t0",
        ]
    );
    assert_eq!(header.last().unwrap(), "# Az\tEl\tf74.0GHz\tf74.0GHz std");

    let journal = bench.journal().await;
    assert!(journal.contains(&BenchCommand::Home(Axis::Elevation)));
    let el_moves = journal
        .iter()
        .filter(|c| matches!(c, BenchCommand::Move { axis: Axis::Elevation, .. }))
        .count();
    assert_eq!(el_moves, 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_offset_record_one_row_per_frequency() {
    let mut settings = Settings::default();
    settings.devices.use_vv = true;
    settings.devices.use_multi = false;
    settings.synth.freq = vec![74.0, 75.0];
    let dir = tempfile::tempdir().unwrap();
    let mut bench = SimulatedBench::new().with_phasor_response(|_| PhasorSample {
        magnitude: 0.25,
        phase_deg: 45.0,
    });

    let summary = record_zero_offsets(&settings, &mut bench, request(&dir, "offsets.csv"))
        .await
        .expect("Record should complete");
    let (header, rows) = read_file(&summary.output_path);
    assert_eq!(rows, vec!["74.000,0.25,45", "75.000,0.25,45"]);
    assert_eq!(header.last().unwrap(), "# Freq (GHz),ratio,phase");
    assert_eq!(bench.move_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_zero_offset_record_needs_vector_meter() {
    let settings = Settings::default();
    let dir = tempfile::tempdir().unwrap();
    let err = record_zero_offsets(&settings, &mut UntouchedProvider, request(&dir, "x.csv"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("use_vv"));
}

#[tokio::test(start_paused = true)]
async fn test_event_stream_reports_rows_and_failure() {
    let settings = small_scalar_settings();
    let dir = tempfile::tempdir().unwrap();
    let controller = MapController::new(&settings);
    let mut events = controller.subscribe();
    let mut bench = SimulatedBench::new().with_response(|_| 5.0).fail_move_on(4);

    let result = controller.run(&mut bench, request(&dir, "events.csv")).await;
    assert!(result.is_err());

    let mut rows = Vec::new();
    let mut readings = 0;
    let mut failed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            ScanEvent::RowWritten { index, .. } => rows.push(index),
            ScanEvent::Reading { .. } => readings += 1,
            ScanEvent::Failed { phase, .. } => failed = Some(phase),
            _ => {}
        }
    }
    assert_eq!(rows, vec![0, 1, 2]);
    assert_eq!(readings, 6);
    assert_eq!(failed, Some(RunPhase::Scanning));
}

#[tokio::test(start_paused = true)]
async fn test_default_output_path_is_created() {
    let settings = small_scalar_settings();
    let dir = tempfile::tempdir().unwrap();
    let nested: PathBuf = dir.path().join("data").join("2024").join("map.csv");
    let mut bench = SimulatedBench::new();

    let summary = run_map(
        &settings,
        &mut bench,
        RunRequest {
            output_path: nested.clone(),
            timestamp: "t".into(),
            config_file: "c".into(),
        },
    )
    .await
    .expect("Map should complete");
    assert_eq!(summary.output_path, nested);
    assert!(nested.exists());
}

#[tokio::test(start_paused = true)]
async fn test_multi_line_comment_stays_in_header() {
    let mut settings = small_scalar_settings();
    settings.general.comment = "Horn B\n74 GHz cut".to_string();
    let dir = tempfile::tempdir().unwrap();
    let mut bench = SimulatedBench::new().with_response(|_| 5.0);

    let summary = run_map(&settings, &mut bench, request(&dir, "comment.csv"))
        .await
        .expect("Map should complete");
    let (header, rows) = read_file(&summary.output_path);
    assert_eq!(rows.len(), 5, "{rows:?}");
    assert!(header.contains(&"# Comment: Horn B".to_string()));
    assert!(header.contains(&"# 74 GHz cut".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_step_too_fine_is_configuration_error() {
    let mut settings = small_scalar_settings();
    settings.azimuth.xmin = -180.0;
    settings.azimuth.xmax = 180.0;
    settings.azimuth.xinc = 1e-300;
    let dir = tempfile::tempdir().unwrap();

    let err = run_map(&settings, &mut UntouchedProvider, request(&dir, "fine.csv"))
        .await
        .unwrap_err();
    assert!(matches!(err, BeammapError::Configuration(_)), "{err}");
    assert!(!dir.path().join("fine.csv").exists());
}

#[tokio::test(start_paused = true)]
async fn test_offset_fault_returns_home_without_output() {
    let mut settings = small_scalar_settings();
    settings.offset.enabled = true;
    let dir = tempfile::tempdir().unwrap();
    let req = request(&dir, "offset_fault.csv");
    let path = req.output_path.clone();
    // first sample of the run is the source-off offset reading
    let mut bench = SimulatedBench::new().with_response(|_| 5.0).fail_sample_on(1);

    let err = run_map(&settings, &mut bench, req)
        .await
        .expect_err("Map should fail");
    let site = err.site().expect("Should be a measurement error");
    assert_eq!(site.phase, RunPhase::Offset);
    assert_eq!(site.point_index, None);
    assert!(!path.exists());

    let journal = bench.journal().await;
    assert!(journal.contains(&BenchCommand::OutputOff));
    assert_eq!(journal.last(), Some(&BenchCommand::Home(Axis::Azimuth)));
    assert_eq!(bench.move_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_leveling_fault_returns_home_without_output() {
    let mut settings = small_scalar_settings();
    settings.leveling.enabled = true;
    let dir = tempfile::tempdir().unwrap();
    let req = request(&dir, "leveling_fault.csv");
    let path = req.output_path.clone();
    // boresight reading at the first frequency
    let mut bench = SimulatedBench::new().with_response(|_| 2.0).fail_sample_on(1);

    let err = run_map(&settings, &mut bench, req)
        .await
        .expect_err("Map should fail");
    let site = err.site().expect("Should be a measurement error");
    assert_eq!(site.phase, RunPhase::Leveling);
    assert_eq!(site.frequency_ghz, Some(74.0));
    assert!(!path.exists());
    assert_eq!(
        bench.journal().await.last(),
        Some(&BenchCommand::Home(Axis::Azimuth))
    );
}
