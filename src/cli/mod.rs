pub mod commands;

/// Load `.env.development`, then `.env`
///
/// Variables already present in the process environment are never
/// overwritten, so earlier sources win.
pub fn load_env_files() {
    dotenv::from_filename(".env.development").ok();
    dotenv::dotenv().ok();
}
