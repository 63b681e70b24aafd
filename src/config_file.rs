//! Config file loading. JSON5 is the configuration syntax (plain
//! JSON parses as JSON5, so both extensions are accepted); RON is
//! only used for pretty-printing a loaded config back out when
//! verbose logging asks for it.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// The file name extensions that are recognized, in the order they
/// are probed for default config locations.
pub const FILE_EXTENSIONS: &[&str] = &["json5", "json"];

/// The json5 crate reports the error location but its `Display` does
/// not show it; pull it out so config mistakes are findable.
pub fn json5_from_str<'t, T: Deserialize<'t>>(s: &'t str) -> Result<T> {
    json5::from_str(s).map_err(|e| match &e {
        json5::Error::Message { msg, location } => match location {
            Some(json5::Location { line, column }) => {
                anyhow!("{msg} at line:column {line}:{column}")
            }
            None => anyhow!("{msg}"),
        },
    })
}

pub fn load_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let s = std::fs::read_to_string(path)
        .with_context(|| anyhow!("loading config file from {path:?}"))?;
    json5_from_str(&s).with_context(|| anyhow!("decoding JSON5 from config file {path:?}"))
}

pub fn ron_to_string_pretty<T: Serialize>(value: &T) -> Result<String> {
    ron::ser::to_string_pretty(value, ron::ser::PrettyConfig::default())
        .with_context(|| anyhow!("encoding value as RON"))
}

fn add_extension(path: &Path, extension: &str) -> Option<PathBuf> {
    let file_name = path.file_name()?.to_str()?;
    Some(path.with_file_name(format!("{file_name}.{extension}")))
}

pub trait LoadConfigFile: DeserializeOwned {
    /// The recognized extensions will be appended and tried in order
    /// (the chosen suffix has no effect on the parser).
    fn default_config_path_without_suffix() -> Result<Option<PathBuf>>;

    /// If `path` is given, the file must exist or an error is
    /// returned. Otherwise, the default location is checked
    /// (`default_config_path_without_suffix`) and if a file with one
    /// of the fitting file name extensions exists, it is loaded;
    /// otherwise `or_else` is called with a message mentioning what
    /// was tried; it can issue an error or generate a default config
    /// value.
    fn load_config<P: AsRef<Path>>(
        path: Option<P>,
        or_else: impl FnOnce(String) -> Result<Self>,
    ) -> Result<Self> {
        if let Some(path) = path {
            load_config_file(path.as_ref())
        } else if let Some(base) = Self::default_config_path_without_suffix()? {
            let existing: Vec<PathBuf> = FILE_EXTENSIONS
                .iter()
                .map(|extension| {
                    add_extension(&base, extension)
                        .ok_or_else(|| anyhow!("path is missing a file name: {base:?}"))
                })
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .filter(|path| path.exists())
                .collect();
            match existing.as_slice() {
                [] => or_else(format!(
                    "no config file at the default location {base:?} \
                     with any of the extensions {FILE_EXTENSIONS:?}"
                )),
                [path] => load_config_file(path),
                _ => {
                    bail!("multiple config file paths found, leading to ambiguity: {existing:?}")
                }
            }
        } else {
            or_else(
                "no path was given and there is no default \
                 config location for this type"
                    .into(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn t_json5_accepts_json_and_json5() {
        let from_json: Sample = json5_from_str(r#"{"name": "a", "count": 3}"#).unwrap();
        let from_json5: Sample = json5_from_str("{name: 'a', count: 3, /* comment */}").unwrap();
        assert_eq!(from_json, from_json5);
    }

    #[test]
    fn t_json5_error_carries_location() {
        let err = json5_from_str::<Sample>("{name: 'a', count: }")
            .err()
            .unwrap();
        assert!(format!("{err}").contains("line:column"), "got: {err}");
    }

    #[test]
    fn t_add_extension() {
        assert_eq!(
            add_extension(Path::new("/etc/sweep"), "json5"),
            Some(PathBuf::from("/etc/sweep.json5"))
        );
        assert_eq!(add_extension(Path::new("/"), "json5"), None);
    }
}
