use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use camera_pipeline::config::PipelineConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMERA_PIPELINE_CONFIG",
        "CAMERA_DEVICE",
        "CAMERA_OUTPUT_DIR",
        "CAMERA_FPS",
        "CAMERA_VIDEO_FPS",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_toml_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
        log_file = "capture.log"

        [device]
        device = "/dev/video2"
        target_fps = 15
        width = 1280
        height = 720

        [output]
        dir = "captures"
        image_extension = "png"
        video_fps = 15
        jpeg_quality = 75
        "#,
    );

    std::env::set_var("CAMERA_PIPELINE_CONFIG", file.path());
    std::env::set_var("CAMERA_DEVICE", "1");
    std::env::set_var("CAMERA_VIDEO_FPS", "25");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.device.device, "1");
    assert_eq!(cfg.device.resolved_device(), "/dev/video1");
    assert_eq!(cfg.device.target_fps, 15);
    assert_eq!((cfg.device.width, cfg.device.height), (1280, 720));
    assert_eq!(cfg.sinks.output_dir, PathBuf::from("captures"));
    assert_eq!(cfg.sinks.image_extension, "png");
    assert_eq!(cfg.sinks.video_fps, 25);
    assert_eq!(cfg.sinks.jpeg_quality, 75);
    assert_eq!(cfg.sinks.codec, "MJPG");
    assert_eq!(cfg.log_file, Some(PathBuf::from("capture.log")));

    clear_env();
}

#[test]
fn loads_json_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "device": { "device": "stub://lobby?frames=10", "target_fps": 5 },
            "output": { "dir": "lobby", "container_extension": "AVI" }
        }"#,
    );

    let cfg = PipelineConfig::from_path(file.path()).expect("load config");
    assert_eq!(cfg.device.device, "stub://lobby?frames=10");
    assert!(cfg.device.is_synthetic());
    assert_eq!(cfg.device.target_fps, 5);
    assert_eq!(cfg.sinks.output_dir, PathBuf::from("lobby"));
    assert_eq!(cfg.sinks.container_extension, "avi");

    clear_env();
}

#[test]
fn defaults_apply_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PipelineConfig::load().expect("load config");
    assert_eq!(cfg, PipelineConfig::default());

    clear_env();
}

#[test]
fn rejects_invalid_env_override() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMERA_FPS", "fast");
    let err = PipelineConfig::load().unwrap_err();
    assert!(err.to_string().contains("CAMERA_FPS"));

    std::env::set_var("CAMERA_FPS", "0");
    assert!(PipelineConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_unreadable_or_malformed_files() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let missing = std::env::temp_dir().join("camera-pipeline-missing-config.toml");
    assert!(PipelineConfig::from_path(&missing).is_err());

    let file = config_file(".toml", "[output]\njpeg_quality = \"high\"\n");
    let err = PipelineConfig::from_path(file.path()).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
