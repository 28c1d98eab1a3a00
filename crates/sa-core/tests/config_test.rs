use sa_core::config::Config;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.data_dir, ".selfai_data");
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.general.cycle_interval_secs, 180);
    assert_eq!(cfg.orchestrator.max_workers, 3);
    assert_eq!(cfg.orchestrator.max_test_attempts, 3);
    assert_eq!(cfg.orchestrator.stuck_after_secs, 900);
    assert!(cfg.orchestrator.auto_approve_plans);
    assert_eq!(cfg.levels.level2_unlock_threshold, 5);
    assert_eq!(cfg.levels.level3_unlock_threshold, 10);
    assert_eq!(cfg.worktree.min_free_disk_mb, 500);
    assert_eq!(cfg.worktree.main_branch, "main");
    assert_eq!(cfg.test_env.max_environments, 5);
    assert_eq!(cfg.test_env.port_base, 10_000);
    assert!((cfg.healing.min_confidence - 0.6).abs() < f64::EPSILON);
    assert_eq!(cfg.healing.cooldown_secs, 60);
    assert_eq!(cfg.agent.command, "claude");
    assert_eq!(cfg.agent.conflict_tools, vec!["Read", "Edit", "Bash"]);
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains(".selfai_data"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed, cfg);
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[orchestrator]
max_workers = 6
auto_approve_plans = false

[healing]
auto_heal = false
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.orchestrator.max_workers, 6);
    assert!(!cfg.orchestrator.auto_approve_plans);
    assert!(!cfg.healing.auto_heal);
    // defaults should fill in the rest
    assert_eq!(cfg.orchestrator.execute_timeout_secs, 900);
    assert!(cfg.healing.enabled);
    assert_eq!(cfg.test_env.port_range_size, 10);
    cfg.validate().expect("config validates");
}

#[test]
fn zero_workers_fails_validation() {
    let mut cfg = Config::default();
    cfg.orchestrator.max_workers = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("max_workers"));
}

#[test]
fn out_of_range_confidence_fails_validation() {
    let mut cfg = Config::default();
    cfg.healing.min_confidence = 1.5;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("min_confidence"));
}

#[test]
fn tiny_port_range_fails_validation() {
    let mut cfg = Config::default();
    cfg.test_env.port_range_size = 2;
    assert!(cfg.validate().is_err());
}

#[test]
fn load_for_prefers_repo_local_file() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join(".selfai_data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(
        data.join("config.toml"),
        "[general]\ncycle_interval_secs = 30\n",
    )
    .unwrap();

    let cfg = Config::load_for(dir.path()).expect("load");
    assert_eq!(cfg.general.cycle_interval_secs, 30);
    assert_eq!(cfg.layout(dir.path()).root(), data.as_path());
}

#[test]
fn load_from_reports_parse_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[general\n").unwrap();
    let err = Config::load_from(&path).expect_err("malformed toml");
    assert!(err.to_string().starts_with("parse"));
}
