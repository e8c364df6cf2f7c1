use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

use crate::errors::{LoaderError, Result};

/// Env override files read from the config directory, lowest precedence first.
pub const ENV_FILES: &[&str] = &[".env", ".env.local"];

/// Load environment variables from a .env file
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();

    for item in dotenvy::from_path_iter(path).map_err(|e| LoaderError::EnvFileParse {
        path: path.to_path_buf(),
        source: e,
    })? {
        let (key, value) = item.map_err(|e| LoaderError::EnvFileParse {
            path: path.to_path_buf(),
            source: e,
        })?;
        env.insert(key, value);
    }

    Ok(env)
}

/// Build the expression namespace for a config directory.
///
/// Priority (highest to lowest):
/// 1. `initial`, the process environment captured at startup
/// 2. `.env.local`
/// 3. `.env`
///
/// Missing files are skipped; unparsable ones are skipped with a warning.
pub fn merge_env_files(initial: &HashMap<String, String>, dir: &Path) -> HashMap<String, String> {
    let mut parsed = HashMap::new();
    for filename in ENV_FILES {
        let path = dir.join(filename);
        if !path.is_file() {
            continue;
        }
        match load_env_file(&path) {
            Ok(vars) => parsed.extend(vars),
            Err(e) => warn!("{}", e),
        }
    }

    let mut env = initial.clone();
    for (key, value) in parsed {
        env.entry(key).or_insert(value);
    }
    env
}
