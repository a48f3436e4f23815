pub mod capture;
pub mod config;
pub mod db;
pub mod encoder;
pub mod error;
pub mod frames;
pub mod paths;
pub mod processing;
pub mod retention;
pub mod segmentation;
pub mod storage;
pub mod utils;

/// Initializes logging (reads RUST_LOG env var).
pub fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}
