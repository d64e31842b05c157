//! Builds the environment handed to the spawned `codex mcp-server` child:
//! a filtered slice of this process's own environment plus caller-supplied
//! overrides, rather than the full ambient environment.

use std::collections::HashMap;
use std::ffi::OsString;

#[cfg(unix)]
const DEFAULT_ENV_VARS: &[&str] = &[
    "HOME",
    "LOGNAME",
    "PATH",
    "SHELL",
    "USER",
    "__CF_USER_TEXT_ENCODING",
    "LANG",
    "LC_ALL",
    "TERM",
    "TMPDIR",
    "TZ",
];

#[cfg(windows)]
const DEFAULT_ENV_VARS: &[&str] = &[
    "PATH",
    "PATHEXT",
    "USERNAME",
    "USERDOMAIN",
    "USERPROFILE",
    "TEMP",
    "TMP",
];

pub fn build_child_env(extra: Option<&HashMap<String, String>>) -> Vec<(OsString, OsString)> {
    let mut env: Vec<(OsString, OsString)> = DEFAULT_ENV_VARS
        .iter()
        .filter_map(|key| std::env::var_os(key).map(|value| (OsString::from(key), value)))
        .collect();

    if let Some(extra) = extra {
        for (key, value) in extra {
            env.retain(|(existing_key, _)| existing_key != key.as_str());
            env.push((OsString::from(key), OsString::from(value)));
        }
    }

    env
}
