use std::fs;

use phasetask::build_scheduler;
use phasetask::runtime::{Phase, PoolBackend};
use phasetask::util::config::{load_config, save_config, ConfigFormat, RuntimeConfig};

use crate::drive;

#[test]
fn test_scheduler_from_ron_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtime.ron");
    fs::write(
        &path,
        "(scheduler: (timer_phase: update, default_resume_phase: late_update), pool: (num_workers: 2))",
    )
    .unwrap();

    let config = load_config(&path).unwrap();
    let scheduler = build_scheduler(&config).unwrap();
    assert_eq!(scheduler.pool().num_workers(), 2);
    assert_eq!(scheduler.config().default_resume_phase, Phase::LateUpdate);

    let work = scheduler.run_on_thread_pool(|| Ok("ok"));
    assert_eq!(drive(&scheduler, &work).into_result().unwrap(), "ok");
}

#[test]
fn test_rayon_backend_from_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtime.json");
    let mut config = RuntimeConfig::default();
    config.pool.backend = PoolBackend::Rayon;
    config.pool.num_workers = 2;
    save_config(&config, &path).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    let parsed = RuntimeConfig::parse(&text, ConfigFormat::Json).unwrap();
    assert_eq!(parsed.pool.backend, PoolBackend::Rayon);

    let scheduler = build_scheduler(&parsed).unwrap();
    let inner = scheduler.clone();
    let task = scheduler.spawn(async move {
        inner.switch_to_thread_pool().await;
        let on_pool = phasetask::runtime::on_thread_pool();
        inner.switch_to_main_thread().await;
        Ok(on_pool)
    });
    assert!(drive(&scheduler, &task).into_result().unwrap());
}
