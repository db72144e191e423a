use std::path::PathBuf;

const DB_PATH: &str = "PLANT_DB_PATH";

/// Database path override taken from the environment
pub fn get_db_path() -> Option<PathBuf> {
    std::env::var(DB_PATH)
        .ok()
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from)
}

/// Round half away from zero to `decimals` places
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

pub fn round2(value: f64) -> f64 {
    round_to(value, 2)
}
