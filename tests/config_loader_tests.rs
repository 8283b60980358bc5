use marketplace_sync::config::ConfigLoader;
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    unsafe {
        env::remove_var("MARKETSYNC_PROFILE");
        env::remove_var("MARKETSYNC_API_BIND_ADDR");
        env::remove_var("MARKETSYNC_LOG_LEVEL");
        env::remove_var("MARKETSYNC_OPERATOR_TOKEN");
        env::remove_var("MARKETSYNC_MAX_CONCURRENT_JOBS_PER_TENANT");
        env::remove_var("MARKETSYNC_MAX_CONCURRENT_JOBS_PER_CONNECTION");
        env::remove_var("MARKETSYNC_RETRY_RETRYABLE_STATUSES");
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.concurrency.max_jobs_per_tenant, 5);
    assert_eq!(cfg.concurrency.max_jobs_per_connection, 2);
    assert_eq!(cfg.retry.retryable_statuses, vec![429, 500, 502, 503, 504]);
    assert_eq!(cfg.circuit_breaker.half_open_max, 3);
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "MARKETSYNC_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.staging",
        "MARKETSYNC_API_BIND_ADDR=192.168.0.10:5000\nMARKETSYNC_SYNC_PAGE_SIZE=100\n",
    );
    write_env_file(
        &temp_dir,
        ".env.staging.local",
        "MARKETSYNC_API_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "MARKETSYNC_PROFILE=staging\nMARKETSYNC_API_BIND_ADDR=127.0.0.1:4000\nMARKETSYNC_OPERATOR_TOKEN=test-token-for-layered-test\n",
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "staging");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.sync.page_size, 100);
    assert_eq!(cfg.operator_tokens, vec!["test-token-for-layered-test"]);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "MARKETSYNC_API_BIND_ADDR=127.0.0.1:3000\nMARKETSYNC_RETRY_RETRYABLE_STATUSES=503\n",
    );

    unsafe {
        env::set_var("MARKETSYNC_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("MARKETSYNC_RETRY_RETRYABLE_STATUSES", "429, 503");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.retry.retryable_statuses, vec![429, 503]);

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("MARKETSYNC_API_BIND_ADDR", "not-an-addr");
    }
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}

#[test]
fn connection_limit_not_below_tenant_limit_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("MARKETSYNC_MAX_CONCURRENT_JOBS_PER_TENANT", "3");
        env::set_var("MARKETSYNC_MAX_CONCURRENT_JOBS_PER_CONNECTION", "3");
    }
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("equal limits should fail");
    assert!(format!("{}", err).contains("per-connection job limit"));

    clear_env();
}
