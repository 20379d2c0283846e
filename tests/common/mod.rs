#![allow(dead_code)]

use std::sync::Once;

use tempfile::TempDir;
use zero_db::{Database, Options};

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_default_env()
            .format_timestamp_secs()
            .is_test(true)
            .try_init();
    });
}

/// Options pointing every file the engine writes into `dir`, sized for
/// tests: small segments, 1 MiB partitions, archiving on.
pub fn test_options(dir: &TempDir) -> Options {
    let mut opts = Options::new();
    opts.set_string("sm_dbfile", dir.path().join("db").to_str().unwrap())
        .set_string("sm_logdir", dir.path().join("log").to_str().unwrap())
        .set_string("sm_archdir", dir.path().join("archive").to_str().unwrap())
        .set_int("sm_bufpoolsize", 8)
        .set_int("sm_logbufsize", 1 << 16)
        .set_int("sm_log_partition_size", 1)
        .set_bool("sm_archiving", true);
    opts
}

pub fn open_db(dir: &TempDir) -> Database {
    setup();
    Database::new(test_options(dir)).expect("open database")
}

pub fn open_db_with<F>(dir: &TempDir, tweak: F) -> Database
where
    F: FnOnce(&mut Options),
{
    setup();
    let mut opts = test_options(dir);
    tweak(&mut opts);
    Database::new(opts).expect("open database")
}

/// "k%04d" keys as the workloads use them.
pub fn key(i: usize) -> Vec<u8> {
    format!("k{:04}", i).into_bytes()
}
