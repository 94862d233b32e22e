use std::env;
use std::str::FromStr;

/// Read an environment variable, falling back to `default` when it is unset or unparsable.
pub fn read_env_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
