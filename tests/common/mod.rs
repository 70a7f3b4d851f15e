use std::sync::Arc;

use grove_db::flags::*;
use grove_db::{utils, DbParameters, Environment, Parameters};
use tempfile::TempDir;

/// # Conduct the initialization
///
/// - Setting up log configurations.
pub fn setup() {
    utils::init_log();
}

pub struct TestEnv {
    // the directory must outlive the environment
    pub dir: TempDir,
    pub env: Arc<Environment>,
}

impl TestEnv {
    pub fn path(&self) -> std::path::PathBuf {
        self.dir.path().join("test.db")
    }
}

pub fn create_env(flags: u32) -> TestEnv {
    create_env_with(flags, Parameters::default())
}

pub fn create_env_with(flags: u32, params: Parameters) -> TestEnv {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let env =
        Environment::create(dir.path().join("test.db"), flags, &params)
            .unwrap();
    TestEnv { dir, env }
}

pub fn mem_env() -> Arc<Environment> {
    setup();
    Environment::create("in-memory", ENV_IN_MEMORY, &Parameters::default())
        .unwrap()
}

pub fn db_params() -> DbParameters {
    DbParameters::default()
}

/// ascii keys "00000", "00001", ... like the ones the seed scenarios
/// use
pub fn ascii_key(i: usize) -> Vec<u8> {
    format!("{:05}", i).into_bytes()
}
